// Broker daemon entry point.
use anyhow::{Context, Result};
use quinn::ServerConfig;
use rcgen::generate_simple_self_signed;
use rill_auth::{AuthRegistry, TokenScheme};
use rill_transport::TransportConfig;
use rilld::config::RilldConfig;
use rilld::observability;
use rilld::server::{Server, ServerOptions};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    let metrics_handle = observability::init_observability();
    let config = RilldConfig::from_env_or_yaml()?;

    tokio::spawn(observability::serve_metrics(
        metrics_handle,
        config.metrics_bind,
    ));

    let mut registry = AuthRegistry::new();
    if let Some(token) = &config.auth_token {
        registry.register(Arc::new(TokenScheme::new(token.clone())));
    } else {
        tracing::warn!("no auth token configured; accepting all peers");
    }

    let tls = build_server_config(&config).context("build QUIC server config")?;
    let transport = TransportConfig {
        max_streams: config.max_streams,
        idle_timeout: config.idle_timeout(),
    };
    let options = ServerOptions {
        max_frame_bytes: config.max_frame_bytes,
        ..ServerOptions::default()
    };
    let server = Arc::new(Server::bind(
        config.listen_addr,
        tls,
        transport,
        registry,
        options,
    )?);
    tracing::info!(addr = %server.local_addr()?, "rilld listening");

    let serve_task = {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            if let Err(err) = server.serve().await {
                tracing::warn!(error = %err, "accept loop exited");
            }
        })
    };

    // Block until SIGINT, then shut down in order.
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutting down");
    server.close().await;
    serve_task.abort();
    Ok(())
}

fn build_server_config(config: &RilldConfig) -> Result<ServerConfig> {
    let (cert_chain, key) = match (&config.cert_path, &config.key_path) {
        (Some(cert_path), Some(key_path)) => load_cert_chain(cert_path, key_path)?,
        _ => {
            tracing::warn!("no TLS certificate configured; using a self-signed dev cert");
            self_signed_cert()?
        }
    };
    let mut crypto = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .context("build rustls server config")?;
    if !config.alpn.is_empty() {
        crypto.alpn_protocols = config
            .alpn
            .iter()
            .map(|proto| proto.as_bytes().to_vec())
            .collect();
    }
    let quic = quinn::crypto::rustls::QuicServerConfig::try_from(crypto)
        .context("build QUIC crypto config")?;
    Ok(ServerConfig::with_crypto(Arc::new(quic)))
}

fn load_cert_chain(
    cert_path: &str,
    key_path: &str,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let cert_pem = std::fs::read(cert_path)
        .with_context(|| format!("read TLS certificate: {cert_path}"))?;
    let cert_chain = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<std::io::Result<Vec<_>>>()
        .context("parse TLS certificate")?;
    let key_pem =
        std::fs::read(key_path).with_context(|| format!("read TLS key: {key_path}"))?;
    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .context("parse TLS key")?
        .context("no private key found")?;
    Ok((cert_chain, key))
}

fn self_signed_cert() -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let cert = generate_simple_self_signed(vec!["localhost".into()])?;
    let cert_der = CertificateDer::from(cert.serialize_der()?);
    let key_der = PrivatePkcs8KeyDer::from(cert.get_key_pair().serialize_der());
    Ok((vec![cert_der], key_der.into()))
}
