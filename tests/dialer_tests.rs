//! TLS dialing through a DialerGroup against loopback servers

mod common;

use common::tls_acceptor;
use deimos::network::{DialerGroup, DialerGroupConfig, ScanTarget};
use deimos::scanner::ScanStatus;
use deimos::{ScanContext, ScanError};
use openssl::ssl::Ssl;
use std::pin::Pin;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_openssl::SslStream;

fn tls_group() -> DialerGroup {
    DialerGroup::new(&DialerGroupConfig {
        tls_enabled: true,
        ..DialerGroupConfig::default()
    })
    .unwrap()
}

#[tokio::test]
async fn test_tls_dial_returns_log_with_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let acceptor = tls_acceptor("files01.corp.local");
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ssl = Ssl::new(acceptor.context()).unwrap();
        let mut tls = SslStream::new(ssl, stream).unwrap();
        Pin::new(&mut tls).accept().await.unwrap();
        tls.write_all(b"hello").await.unwrap();
        tls.flush().await.unwrap();
        let mut sink = Vec::new();
        let _ = tls.read_to_end(&mut sink).await;
    });

    let ctx = ScanContext::with_timeout(Duration::from_secs(5));
    let mut conn = tls_group()
        .dial(&ctx, &ScanTarget::from_addr(addr))
        .await
        .unwrap();

    let log = conn.tls_log().unwrap();
    assert!(log.handshake_complete);
    assert!(log.version.is_some());
    assert!(log.error.is_none());
    assert!(log.certificates[0].subject.contains("CN=files01.corp.local"));
    assert_eq!(conn.peer_addr().unwrap(), addr);

    let mut buf = [0u8; 5];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");
    conn.close().await;
}

#[tokio::test]
async fn test_failed_tls_dial_carries_log() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut hello = [0u8; 512];
        let _ = stream.read(&mut hello).await;
        let _ = stream
            .write_all(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n")
            .await;
        tokio::time::sleep(Duration::from_secs(2)).await;
    });

    let ctx = ScanContext::with_timeout(Duration::from_secs(5));
    let err = tls_group()
        .dial(&ctx, &ScanTarget::from_addr(addr))
        .await
        .err()
        .unwrap();

    assert!(matches!(err, ScanError::TlsHandshake { .. }));
    let log = err.tls_log().unwrap();
    assert!(!log.handshake_complete);
    assert!(log.error.is_some());
    assert!(log.certificates.is_empty());
    assert_eq!(ScanStatus::from_error(&err), ScanStatus::ProtocolError);
}
