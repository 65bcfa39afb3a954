use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use udp_stream::{
    codec::{BincodeCodec, Codec, JsonCodec},
    error::Error,
    message::{Push, Request, Response},
    packet::{encode_ack, Header, NEW_REQUEST},
    transport::DatagramTransport,
    Handler, Src, Stream,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// A stream on loopback with short timeouts so failure paths finish quickly
async fn quick_stream(endpoints: &[(&str, SocketAddr)]) -> Arc<Stream> {
    let builder = endpoints.iter().fold(
        Stream::builder()
            .bind("127.0.0.1:0")
            .write_timeout(Duration::from_millis(100))
            .write_retry_limit(3)
            .read_timeout(Duration::from_millis(400)),
        |builder, (name, addr)| builder.endpoint(*name, addr.to_string()),
    );
    Arc::new(builder.build().await.unwrap())
}

/// Keep a stream's listener running so its outbound calls see their ACKs
///
/// Undecodable inbound requests are skipped, the same way `serve` does.
fn spawn_listener<C: Codec>(stream: &Arc<Stream<C>>) {
    let stream = Arc::clone(stream);
    tokio::spawn(async move {
        loop {
            match stream.listen::<Request>().await {
                Ok(Some(_)) | Err(Error::Codec(_)) => continue,
                Ok(None) | Err(_) => break,
            }
        }
    });
}

async fn raw_peer() -> (UdpSocket, SocketAddr) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    (socket, addr)
}

fn sender_id(packet: &[u8]) -> u32 {
    u32::from_le_bytes([packet[4], packet[5], packet[6], packet[7]])
}

struct Echo;

#[async_trait::async_trait]
impl Handler for Echo {
    type Request = Request;
    type Response = Response;

    async fn handle(&self, request: Request, _src: Src) -> Response {
        Response::new(0).with("type", request.kind)
    }
}

#[tokio::test]
async fn request_and_respond_roundtrip() {
    init_tracing();
    let server = quick_stream(&[]).await;
    let client = quick_stream(&[("svc", server.local_addr().unwrap())]).await;
    spawn_listener(&client);
    let client_addr = client.local_addr().unwrap();

    let remote = Arc::clone(&server);
    let handle = tokio::spawn(async move {
        let incoming = remote.listen::<Request>().await.unwrap().unwrap();
        assert_eq!(incoming.request.kind, "ping");
        assert_eq!(incoming.src.addr, client_addr);
        assert_ne!(incoming.src.remote_id, 0);
        assert_eq!(
            JsonCodec.decode::<Request>(&incoming.payload).unwrap(),
            incoming.request
        );
        // Keep reading so the response gets its ACK
        spawn_listener(&remote);
        remote.respond(&Response::new(0), &incoming.src).await.unwrap();
    });

    let response: Response = client
        .request(&Request::new("svc", "ping"), "svc")
        .await
        .unwrap();
    assert_eq!(response, Response::new(0));
    handle.await.unwrap();
    assert_eq!(client.outstanding(), 0);
}

#[tokio::test]
async fn serve_answers_concurrent_requests() {
    init_tracing();
    let server = quick_stream(&[]).await;
    tokio::spawn(Arc::clone(&server).serve(Arc::new(Echo)));

    let client = quick_stream(&[("svc", server.local_addr().unwrap())]).await;
    spawn_listener(&client);

    let mut calls = Vec::new();
    for i in 0..20 {
        let client = Arc::clone(&client);
        calls.push(tokio::spawn(async move {
            let kind = format!("call-{i}");
            let response: Response = client
                .request(&Request::new("svc", kind.clone()), "svc")
                .await
                .unwrap();
            assert_eq!(response.data["type"], kind.as_str());
        }));
    }
    for call in calls {
        call.await.unwrap();
    }
    assert_eq!(client.outstanding(), 0);
}

#[tokio::test]
async fn write_times_out_after_retry_limit() {
    init_tracing();
    let (peer, peer_addr) = raw_peer().await;
    let client = quick_stream(&[("silent", peer_addr)]).await;
    spawn_listener(&client);

    let start = Instant::now();
    let result = client.write(b"hello", "silent").await;
    let elapsed = start.elapsed();

    match result {
        Err(Error::SendTimeout { attempts }) => assert_eq!(attempts, 3),
        other => panic!("expected SendTimeout, got {other:?}"),
    }
    assert!(elapsed >= Duration::from_millis(300));

    let mut seen = Vec::new();
    let mut buf = [0u8; 64];
    while let Ok(Ok((len, _))) =
        tokio::time::timeout(Duration::from_millis(50), peer.recv_from(&mut buf)).await
    {
        seen.push(buf[..len].to_vec());
    }
    assert_eq!(seen.len(), 3);
    // Every attempt is the identical packet
    assert!(seen.iter().all(|packet| packet == &seen[0]));
    assert_eq!(&seen[0][8..], b"hello");
    assert_eq!(client.outstanding(), 0);
}

#[tokio::test]
async fn write_succeeds_when_a_later_attempt_is_acked() {
    init_tracing();
    let (peer, peer_addr) = raw_peer().await;
    let client = quick_stream(&[("flaky", peer_addr)]).await;
    spawn_listener(&client);

    tokio::spawn(async move {
        let mut buf = [0u8; 64];
        let mut received = 0;
        loop {
            let (len, from) = peer.recv_from(&mut buf).await.unwrap();
            received += 1;
            if received == 3 {
                let ack = encode_ack(sender_id(&buf[..len]));
                peer.send_to(&ack, from).await.unwrap();
            }
        }
    });

    client.write(b"data", "flaky").await.unwrap();
}

#[tokio::test]
async fn rejection_fails_without_retrying() {
    init_tracing();
    let (peer, peer_addr) = raw_peer().await;
    let client = quick_stream(&[("strict", peer_addr)]).await;
    spawn_listener(&client);

    let peer = Arc::new(peer);
    let rejecting = Arc::clone(&peer);
    tokio::spawn(async move {
        let mut buf = [0u8; 64];
        let (len, from) = rejecting.recv_from(&mut buf).await.unwrap();
        let reject = Header::new(sender_id(&buf[..len]), 0).frame(&[5]);
        rejecting.send_to(&reject, from).await.unwrap();
    });

    let start = Instant::now();
    match client.write(b"data", "strict").await {
        Err(Error::Rejected { id }) => assert_ne!(id, 0),
        other => panic!("expected Rejected, got {other:?}"),
    }
    assert!(start.elapsed() < Duration::from_millis(100));
}

#[tokio::test]
async fn request_times_out_without_response() {
    init_tracing();
    let (peer, peer_addr) = raw_peer().await;
    let client = quick_stream(&[("mute", peer_addr)]).await;
    spawn_listener(&client);

    tokio::spawn(async move {
        let mut buf = [0u8; 1024];
        loop {
            let (len, from) = peer.recv_from(&mut buf).await.unwrap();
            peer.send_to(&encode_ack(sender_id(&buf[..len])), from)
                .await
                .unwrap();
        }
    });

    let result: Result<Response, Error> = client.request(&Request::new("mute", "ping"), "mute").await;
    match result {
        Err(Error::ResponseTimeout(timeout)) => assert_eq!(timeout, Duration::from_millis(400)),
        other => panic!("expected ResponseTimeout, got {other:?}"),
    }
    assert_eq!(client.outstanding(), 0);
}

#[tokio::test]
async fn response_ahead_of_ack_completes_request() {
    init_tracing();
    let (peer, peer_addr) = raw_peer().await;
    let client = quick_stream(&[("eager", peer_addr)]).await;
    spawn_listener(&client);

    tokio::spawn(async move {
        let mut buf = [0u8; 1024];
        let (len, from) = peer.recv_from(&mut buf).await.unwrap();
        let body = JsonCodec.encode(&Response::new(7)).unwrap();
        let reply = Header::new(sender_id(&buf[..len]), 99).frame(&body);
        peer.send_to(&reply, from).await.unwrap();
    });

    let response: Response = client
        .request(&Request::new("eager", "ping"), "eager")
        .await
        .unwrap();
    assert_eq!(response.result, 7);
}

#[tokio::test]
async fn listener_discards_noise_and_keeps_reading() {
    init_tracing();
    let server = quick_stream(&[]).await;
    let server_addr = server.local_addr().unwrap();
    let (peer, _) = raw_peer().await;

    peer.send_to(&[], server_addr).await.unwrap();
    peer.send_to(&[1, 2, 3], server_addr).await.unwrap();
    peer.send_to(&[0; 6], server_addr).await.unwrap();
    peer.send_to(&encode_ack(4242), server_addr).await.unwrap();
    let body = JsonCodec.encode(&Request::new("svc", "real")).unwrap();
    peer.send_to(&Header::new(NEW_REQUEST, 7).frame(&body), server_addr)
        .await
        .unwrap();

    let incoming = tokio::time::timeout(Duration::from_secs(2), server.listen::<Request>())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(incoming.request.kind, "real");
    assert_eq!(incoming.src.remote_id, 7);
    assert_eq!(incoming.src.addr, peer.local_addr().unwrap());

    // The request was echo-acknowledged with the sender's id
    let mut buf = [0u8; 16];
    let (len, _) = tokio::time::timeout(Duration::from_secs(2), peer.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..len], &7u32.to_le_bytes());
}

#[tokio::test]
async fn undecodable_request_is_reported_then_listening_resumes() {
    init_tracing();
    let server = quick_stream(&[]).await;
    let server_addr = server.local_addr().unwrap();
    let (peer, _) = raw_peer().await;

    peer.send_to(&Header::new(NEW_REQUEST, 1).frame(b"not json"), server_addr)
        .await
        .unwrap();
    match server.listen::<Request>().await {
        Err(Error::Codec(_)) => {}
        other => panic!("expected Codec error, got {other:?}"),
    }

    let body = JsonCodec.encode(&Request::new("svc", "after")).unwrap();
    peer.send_to(&Header::new(NEW_REQUEST, 2).frame(&body), server_addr)
        .await
        .unwrap();
    let incoming = server.listen::<Request>().await.unwrap().unwrap();
    assert_eq!(incoming.request.kind, "after");
}

#[tokio::test]
async fn push_and_send_request_reach_the_listener() {
    init_tracing();
    let server = quick_stream(&[]).await;
    let client = quick_stream(&[("svc", server.local_addr().unwrap())]).await;
    spawn_listener(&client);

    let push = Push {
        serv: "svc".to_string(),
        user: vec!["alice".into(), "bob".into()],
        kind: "notice".to_string(),
        ..Push::default()
    };
    let remote = Arc::clone(&server);
    let reader = tokio::spawn(async move {
        let pushed = remote.listen::<Push>().await.unwrap().unwrap();
        let requested = remote.listen::<Request>().await.unwrap().unwrap();
        (pushed.request, requested.request)
    });

    client.push(&push, "svc").await.unwrap();
    client
        .send_request(&Request::new("svc", "fire"), "svc")
        .await
        .unwrap();

    let (pushed, requested) = reader.await.unwrap();
    assert_eq!(pushed, push);
    assert_eq!(requested.kind, "fire");
}

#[tokio::test]
async fn empty_write_is_acknowledged() {
    init_tracing();
    let server = quick_stream(&[]).await;
    spawn_listener(&server);
    let client = quick_stream(&[("svc", server.local_addr().unwrap())]).await;
    spawn_listener(&client);

    client.write(&[], "svc").await.unwrap();
}

#[tokio::test]
async fn unknown_endpoint_is_an_error() {
    let client = quick_stream(&[]).await;
    match client.write(b"x", "nowhere").await {
        Err(Error::UnknownEndpoint(name)) => assert_eq!(name, "nowhere"),
        other => panic!("expected UnknownEndpoint, got {other:?}"),
    }
}

#[tokio::test]
async fn self_endpoint_is_registered() {
    let stream = quick_stream(&[]).await;
    spawn_listener(&stream);
    let own = stream.registry().lookup("listen").unwrap();
    assert_eq!(own.addr, stream.local_addr().unwrap());

    stream.write(b"to myself", "listen").await.unwrap();
}

#[tokio::test]
async fn close_ends_listen_and_refuses_calls() {
    init_tracing();
    let stream = quick_stream(&[]).await;
    let reader = Arc::clone(&stream);
    let listening = tokio::spawn(async move { reader.listen::<Request>().await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    stream.close();

    let result = tokio::time::timeout(Duration::from_secs(1), listening)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Ok(None)));
    assert!(stream.is_closed());
    assert!(matches!(
        stream.write(b"late", "listen").await,
        Err(Error::ConnectionClosed)
    ));
}

#[tokio::test]
async fn oversized_payload_is_refused() {
    let server = quick_stream(&[]).await;
    let client = Stream::builder()
        .bind("127.0.0.1:0")
        .max_packet_size(64)
        .endpoint("svc", server.local_addr().unwrap().to_string())
        .build()
        .await
        .unwrap();

    match client.write(&[1u8; 57], "svc").await {
        Err(Error::InvalidFrame(msg)) => assert!(msg.contains("too large")),
        other => panic!("expected InvalidFrame, got {other:?}"),
    }
}

#[tokio::test]
async fn repeated_acks_do_not_crowd_out_the_response() {
    init_tracing();
    let (peer, peer_addr) = raw_peer().await;
    let client = quick_stream(&[("chatty", peer_addr)]).await;
    spawn_listener(&client);

    tokio::spawn(async move {
        let mut buf = [0u8; 1024];
        let (len, from) = peer.recv_from(&mut buf).await.unwrap();
        let id = sender_id(&buf[..len]);
        for _ in 0..4 {
            peer.send_to(&encode_ack(id), from).await.unwrap();
        }
        let body = JsonCodec.encode(&Response::new(7)).unwrap();
        peer.send_to(&Header::new(id, 99).frame(&body), from)
            .await
            .unwrap();

        // The response is echo-acknowledged, so it is never sent again
        loop {
            let (len, _) = peer.recv_from(&mut buf).await.unwrap();
            if buf[..len] == 99u32.to_le_bytes() {
                break;
            }
        }
    });

    let response: Response = client
        .request(&Request::new("chatty", "ping"), "chatty")
        .await
        .unwrap();
    assert_eq!(response.result, 7);
}

#[tokio::test]
async fn payload_over_udp_limit_is_refused_before_sending() {
    let (peer, peer_addr) = raw_peer().await;
    let client = quick_stream(&[("svc", peer_addr)]).await;
    spawn_listener(&client);
    assert_eq!(client.config().max_packet_size, 65536);

    let start = Instant::now();
    match client.write(&vec![1u8; 65_520], "svc").await {
        Err(Error::InvalidFrame(msg)) => assert!(msg.contains("too large")),
        other => panic!("expected InvalidFrame, got {other:?}"),
    }
    assert!(start.elapsed() < Duration::from_millis(100));

    let mut buf = [0u8; 16];
    assert!(
        tokio::time::timeout(Duration::from_millis(50), peer.recv_from(&mut buf))
            .await
            .is_err()
    );
}

/// Transport whose writes always fail with the given error
struct Refusing {
    inner: UdpSocket,
    kind: std::io::ErrorKind,
    writes: AtomicUsize,
}

#[async_trait::async_trait]
impl DatagramTransport for Refusing {
    async fn send_to(&self, _bytes: &[u8], _addr: SocketAddr) -> udp_stream::Result<usize> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        Err(std::io::Error::new(self.kind, "write refused").into())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> udp_stream::Result<(usize, SocketAddr)> {
        Ok(self.inner.recv_from(buf).await?)
    }

    fn local_addr(&self) -> udp_stream::Result<SocketAddr> {
        Ok(self.inner.local_addr()?)
    }
}

#[tokio::test]
async fn failed_write_is_returned_without_retrying() {
    init_tracing();
    let (_peer, peer_addr) = raw_peer().await;
    let refusing = Arc::new(Refusing {
        inner: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
        kind: std::io::ErrorKind::InvalidInput,
        writes: AtomicUsize::new(0),
    });
    let client = Stream::builder()
        .transport(SharedTransport(Arc::clone(&refusing)))
        .write_timeout(Duration::from_millis(100))
        .write_retry_limit(3)
        .endpoint("svc", peer_addr.to_string())
        .build()
        .await
        .unwrap();

    let start = Instant::now();
    match client.write(b"data", "svc").await {
        Err(Error::Io(e)) => assert_eq!(e.kind(), std::io::ErrorKind::InvalidInput),
        other => panic!("expected Io error, got {other:?}"),
    }
    assert!(start.elapsed() < Duration::from_millis(100));
    assert_eq!(refusing.writes.load(Ordering::SeqCst), 1);
    assert_eq!(client.outstanding(), 0);
}

/// Lets a test keep a handle on a transport it gave to a stream
struct SharedTransport<T>(Arc<T>);

#[async_trait::async_trait]
impl<T: DatagramTransport + 'static> DatagramTransport for SharedTransport<T> {
    async fn send_to(&self, bytes: &[u8], addr: SocketAddr) -> udp_stream::Result<usize> {
        self.0.send_to(bytes, addr).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> udp_stream::Result<(usize, SocketAddr)> {
        self.0.recv_from(buf).await
    }

    fn local_addr(&self) -> udp_stream::Result<SocketAddr> {
        self.0.local_addr()
    }
}

#[tokio::test]
async fn listener_survives_undecodable_request() {
    init_tracing();
    let server = quick_stream(&[]).await;
    spawn_listener(&server);
    let client = quick_stream(&[("svc", server.local_addr().unwrap())]).await;
    spawn_listener(&client);

    let (peer, _) = raw_peer().await;
    peer.send_to(
        &Header::new(NEW_REQUEST, 3).frame(b"not json"),
        client.local_addr().unwrap(),
    )
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // ACKs for the client's own calls are still being read
    client.write(b"still listening", "svc").await.unwrap();
}

#[tokio::test]
async fn header_only_datagram_gets_pure_ack() {
    init_tracing();
    let server = quick_stream(&[]).await;
    spawn_listener(&server);
    let (peer, _) = raw_peer().await;

    peer.send_to(&Header::new(NEW_REQUEST, 55).encode(), server.local_addr().unwrap())
        .await
        .unwrap();

    let mut buf = [0u8; 16];
    let (len, from) = tokio::time::timeout(Duration::from_secs(2), peer.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(from, server.local_addr().unwrap());
    assert_eq!(&buf[..len], &55u32.to_le_bytes());
}

/// Transport that silently loses its first few outbound datagrams
struct Lossy {
    inner: UdpSocket,
    drop_first: AtomicUsize,
}

#[async_trait::async_trait]
impl DatagramTransport for Lossy {
    async fn send_to(&self, bytes: &[u8], addr: SocketAddr) -> udp_stream::Result<usize> {
        let lost = self
            .drop_first
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if lost {
            return Ok(bytes.len());
        }
        Ok(self.inner.send_to(bytes, addr).await?)
    }

    async fn recv_from(&self, buf: &mut [u8]) -> udp_stream::Result<(usize, SocketAddr)> {
        Ok(self.inner.recv_from(buf).await?)
    }

    fn local_addr(&self) -> udp_stream::Result<SocketAddr> {
        Ok(self.inner.local_addr()?)
    }
}

#[tokio::test]
async fn retries_recover_from_lost_datagrams() {
    init_tracing();
    let server = quick_stream(&[]).await;
    spawn_listener(&server);

    let lossy = Lossy {
        inner: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
        drop_first: AtomicUsize::new(2),
    };
    let client = Arc::new(
        Stream::builder()
            .transport(lossy)
            .write_timeout(Duration::from_millis(100))
            .write_retry_limit(3)
            .endpoint("svc", server.local_addr().unwrap().to_string())
            .build()
            .await
            .unwrap(),
    );
    spawn_listener(&client);

    client.write(b"eventually", "svc").await.unwrap();
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Ping {
    seq: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Pong {
    seq: u32,
    note: String,
}

#[tokio::test]
async fn bincode_codec_roundtrip() {
    init_tracing();
    let server = Arc::new(
        Stream::builder()
            .bind("127.0.0.1:0")
            .codec(BincodeCodec)
            .build()
            .await
            .unwrap(),
    );
    let client = Arc::new(
        Stream::builder()
            .bind("127.0.0.1:0")
            .endpoint("svc", server.local_addr().unwrap().to_string())
            .codec(BincodeCodec)
            .build()
            .await
            .unwrap(),
    );
    spawn_listener(&client);

    let remote = Arc::clone(&server);
    tokio::spawn(async move {
        let incoming = remote.listen::<Ping>().await.unwrap().unwrap();
        spawn_listener(&remote);
        let pong = Pong {
            seq: incoming.request.seq,
            note: "pong".to_string(),
        };
        remote.respond(&pong, &incoming.src).await.unwrap();
    });

    let pong: Pong = client.request(&Ping { seq: 41 }, "svc").await.unwrap();
    assert_eq!(
        pong,
        Pong {
            seq: 41,
            note: "pong".to_string()
        }
    );
}
