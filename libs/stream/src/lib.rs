//! UDP Stream - reliable request/response over datagrams
//!
//! Register named endpoints, then send fire-and-forget writes, pushes and
//! requests that are retried until the peer acknowledges them, or run full
//! request/response exchanges correlated by small integer ids. Everything
//! shares one socket; a single listener demultiplexes inbound datagrams.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use udp_stream::message::{Request, Response};
//! use udp_stream::{Error, Handler, Src, Stream};
//!
//! struct Pong;
//!
//! #[async_trait::async_trait]
//! impl Handler for Pong {
//!     type Request = Request;
//!     type Response = Response;
//!
//!     async fn handle(&self, _request: Request, _src: Src) -> Response {
//!         Response::new(0)
//!     }
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let server = Arc::new(Stream::bind("127.0.0.1:9000", [("client", "127.0.0.1:9001")]).await?);
//! tokio::spawn(server.clone().serve(Arc::new(Pong)));
//!
//! let client = Arc::new(Stream::bind("127.0.0.1:9001", [("svc", "127.0.0.1:9000")]).await?);
//! let reader = client.clone();
//! tokio::spawn(async move {
//!     // Keep reading so ACKs and responses reach their callers; a request
//!     // that fails to decode must not stop the loop.
//!     loop {
//!         match reader.listen::<Request>().await {
//!             Ok(Some(_)) | Err(Error::Codec(_)) => continue,
//!             Ok(None) | Err(_) => break,
//!         }
//!     }
//! });
//!
//! let response: Response = client.request(&Request::new("svc", "ping"), "svc").await?;
//! assert_eq!(response.result, 0);
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod handler;
pub mod listener;
pub mod message;
pub mod packet;
pub mod registry;
pub mod send;
pub mod stream;
pub mod table;
pub mod transport;

// Re-exports for convenience
pub use config::Config;
pub use error::{Error, Result};
pub use handler::Handler;
pub use listener::{Incoming, Src};
pub use registry::{Endpoint, Registry};
pub use stream::{Stream, StreamBuilder};
pub use table::{CorrelationTable, DispatchOutcome, Entry};
