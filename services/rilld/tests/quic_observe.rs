//! End-to-end matching tests over QUIC.
//!
//! # Purpose
//! Validate the rendezvous semantics through the full stack:
//! - producer-before-observer and observer-before-producer delivery
//! - one-to-one pairing when several observers watch one tag
//!
//! Each test runs an ephemeral server on 127.0.0.1:0 with in-memory state.
use anyhow::Result;
use rill_auth::AuthRegistry;
use rill_client::{Client, ClientConfig};
use rill_transport::TransportConfig;
use rilld::server::{Server, ServerOptions};
use rustls::pki_types::CertificateDer;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

async fn start_server(registry: AuthRegistry) -> Result<(SocketAddr, CertificateDer<'static>)> {
    let (server_config, cert) = test_harness::tls::build_server_config()?;
    let server = Arc::new(Server::bind(
        "127.0.0.1:0".parse()?,
        server_config,
        TransportConfig::default(),
        registry,
        ServerOptions::default(),
    )?);
    let addr = server.local_addr()?;
    tokio::spawn(async move {
        let _ = server.serve().await;
    });
    Ok((addr, cert))
}

fn client_config(cert: CertificateDer<'static>, credential: &str) -> Result<ClientConfig> {
    Ok(ClientConfig::new(
        test_harness::tls::build_client_config(cert)?,
        credential,
    ))
}

async fn connect(addr: SocketAddr, cert: &CertificateDer<'static>) -> Result<Client> {
    Ok(Client::connect(addr, "localhost", client_config(cert.clone(), "")?).await?)
}

#[tokio::test]
async fn producer_before_observer_delivers_payload() -> Result<()> {
    let (addr, cert) = start_server(AuthRegistry::new()).await?;

    let producer = connect(addr, &cert).await?;
    assert!(!producer.id().is_empty());
    let mut stream = producer.open_stream("p1", "T", None).await?;
    stream.write_all(b"hello").await?;
    stream.finish()?;

    // Let the broker queue the finished producer stream first.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let observer = connect(addr, &cert).await?;
    observer.observe("T").await?;
    let mut recv = timeout(Duration::from_secs(2), observer.accept_stream()).await??;
    let payload = recv.read_to_end(1024).await?;
    assert_eq!(payload, b"hello");
    Ok(())
}

#[tokio::test]
async fn observer_before_producer_delivers_payload() -> Result<()> {
    let (addr, cert) = start_server(AuthRegistry::new()).await?;

    let observer = connect(addr, &cert).await?;
    observer.observe("T").await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let producer = connect(addr, &cert).await?;
    let mut stream = producer.open_stream("p1", "T", None).await?;
    stream.write_all(b"world").await?;
    stream.finish()?;

    let mut recv = timeout(Duration::from_secs(2), observer.accept_stream()).await??;
    let payload = recv.read_to_end(1024).await?;
    assert_eq!(payload, b"world");
    Ok(())
}

#[tokio::test]
async fn one_producer_stream_reaches_one_observer() -> Result<()> {
    let (addr, cert) = start_server(AuthRegistry::new()).await?;

    let first = connect(addr, &cert).await?;
    first.observe("T").await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let second = connect(addr, &cert).await?;
    second.observe("T").await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let producer = connect(addr, &cert).await?;
    let mut stream = producer.open_stream("p1", "T", None).await?;
    stream.write_all(b"one").await?;
    stream.finish()?;

    // The earlier observer is matched; the other keeps waiting.
    let mut recv = timeout(Duration::from_secs(2), first.accept_stream()).await??;
    assert_eq!(recv.read_to_end(1024).await?, b"one");
    assert!(
        timeout(Duration::from_millis(300), second.accept_stream())
            .await
            .is_err()
    );

    // The next producer stream goes to the observer still waiting.
    let mut stream = producer.open_stream("p2", "T", None).await?;
    stream.write_all(b"two").await?;
    stream.finish()?;
    let mut recv = timeout(Duration::from_secs(2), second.accept_stream()).await??;
    assert_eq!(recv.read_to_end(1024).await?, b"two");
    Ok(())
}

#[tokio::test]
async fn tags_are_isolated() -> Result<()> {
    let (addr, cert) = start_server(AuthRegistry::new()).await?;

    let observer = connect(addr, &cert).await?;
    observer.observe("A").await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let producer = connect(addr, &cert).await?;
    let mut stream = producer.open_stream("p1", "B", None).await?;
    stream.write_all(b"wrong tag").await?;
    stream.finish()?;

    // Nothing for tag A; the B stream stays queued with no observer.
    assert!(
        timeout(Duration::from_millis(300), observer.accept_stream())
            .await
            .is_err()
    );

    let mut stream = producer.open_stream("p2", "A", None).await?;
    stream.write_all(b"right tag").await?;
    stream.finish()?;
    let mut recv = timeout(Duration::from_secs(2), observer.accept_stream()).await??;
    assert_eq!(recv.read_to_end(1024).await?, b"right tag");
    Ok(())
}

#[tokio::test]
async fn producer_metadata_is_accepted() -> Result<()> {
    let (addr, cert) = start_server(AuthRegistry::new()).await?;

    let observer = connect(addr, &cert).await?;
    observer.observe("T").await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let producer = connect(addr, &cert).await?;
    let mut md = rill_metadata::Md::new();
    md.set("region", "eu").expect("set metadata");
    let mut stream = producer.open_stream("p1", "T", Some(&md)).await?;
    stream.write_all(b"payload").await?;
    stream.finish()?;

    let mut recv = timeout(Duration::from_secs(2), observer.accept_stream()).await??;
    assert_eq!(recv.read_to_end(1024).await?, b"payload");
    Ok(())
}
