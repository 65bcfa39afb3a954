use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::Codec;
use crate::error::{Error, Result};
use crate::listener::Src;
use crate::stream::Stream;

/// Application logic answering inbound requests
#[async_trait::async_trait]
pub trait Handler: Send + Sync + 'static {
    type Request: DeserializeOwned + Send + 'static;
    type Response: Serialize + Send + Sync + 'static;

    async fn handle(&self, request: Self::Request, src: Src) -> Self::Response;
}

impl<C: Codec> Stream<C> {
    /// Listen for requests and answer each one with `handler`
    ///
    /// Every request is handled on its own task, so a slow handler never
    /// holds up the read loop. Requests the codec cannot decode are skipped.
    /// Returns `Ok(())` once the stream is closed.
    pub async fn serve<H: Handler>(self: Arc<Self>, handler: Arc<H>) -> Result<()> {
        loop {
            let incoming = match self.listen::<H::Request>().await {
                Ok(Some(incoming)) => incoming,
                Ok(None) => return Ok(()),
                Err(Error::Codec(e)) => {
                    tracing::warn!(error = %e, "undecodable request skipped");
                    continue;
                }
                Err(e) => return Err(e),
            };

            let stream = Arc::clone(&self);
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                let src = incoming.src;
                let response = handler.handle(incoming.request, src).await;
                if let Err(e) = stream.respond(&response, &src).await {
                    tracing::warn!(peer = %src.addr, remote_id = src.remote_id, error = %e, "response not delivered");
                }
            });
        }
    }
}
