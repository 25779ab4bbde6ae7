use std::time::Duration;

use sentinel_client::{PeerSimulator, ProbeConfig, ProbeError};
use sentinel_kem::{KemAlgorithm, KemScheme, MlKem768};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

async fn listener() -> (TcpListener, std::net::SocketAddr) {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    (listener, addr)
}

fn simulator(config: ProbeConfig) -> PeerSimulator {
    PeerSimulator::new(config, KemAlgorithm::MlKem768.scheme())
}

#[tokio::test]
async fn refused_connection_reports_connect_error() {
    let (listener, addr) = listener().await;
    drop(listener);

    let err = simulator(ProbeConfig::new(addr))
        .run()
        .await
        .expect_err("nobody listening");
    assert!(matches!(err, ProbeError::Connect { .. }), "got {err}");
    assert!(!err.hints().is_empty());
}

#[tokio::test]
async fn silent_server_times_out() {
    let (listener, addr) = listener().await;
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        let mut buf = vec![0u8; 4096];
        let _ = stream.read(&mut buf).await;
        tokio::time::sleep(Duration::from_millis(500)).await;
    });

    let err = simulator(ProbeConfig::new(addr).with_read_timeout(Duration::from_millis(100)))
        .run()
        .await
        .expect_err("no reply");
    assert!(matches!(err, ProbeError::ResponseTimeout(_)), "got {err}");
    assert!(err
        .hints()
        .iter()
        .any(|hint| hint.contains("fragmented packets")));
    server.await.expect("server task");
}

#[tokio::test]
async fn short_reply_is_not_decapsulated() {
    let (listener, addr) = listener().await;
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        let mut buf = vec![0u8; 4096];
        let n = stream.read(&mut buf).await.expect("read hello");
        assert_eq!(n, 1184 + 32);
        stream.write_all(&[7u8; 100]).await.expect("write");
    });

    let err = simulator(ProbeConfig::new(addr).with_padding(32))
        .run()
        .await
        .expect_err("short reply");
    assert!(
        matches!(
            err,
            ProbeError::TruncatedReply {
                received: 100,
                expected: 1088
            }
        ),
        "got {err}"
    );
    server.await.expect("server task");
}

#[tokio::test]
async fn full_exchange_against_minimal_responder() {
    let (listener, addr) = listener().await;
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        let mut buf = vec![0u8; 4096];
        let n = stream.read(&mut buf).await.expect("read hello");
        let encapsulation = MlKem768
            .encapsulate(&buf[..MlKem768::PUBLIC_KEY_BYTES])
            .expect("encapsulate");
        stream
            .write_all(&encapsulation.ciphertext)
            .await
            .expect("write");
        (n, sentinel_kem::fingerprint(&encapsulation.shared_secret))
    });

    let outcome = simulator(ProbeConfig::new(addr).with_padding(150))
        .run()
        .await
        .expect("probe");
    let (received, server_fingerprint) = server.await.expect("server task");
    assert_eq!(received, outcome.payload_size);
    assert_eq!(outcome.shared_secret_fingerprint, server_fingerprint);
    assert_eq!(outcome.public_key_size, 1184);
    assert_eq!(outcome.padding, 150);
}
