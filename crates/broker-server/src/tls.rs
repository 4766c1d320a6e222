//! TLS acceptor setup. Grounded on the modern `rustls::ServerConfig`
//! builder pattern (`with_no_client_auth().with_single_cert(...)`) rather
//! than the legacy `rustls::ServerConfig::new(NoClientAuth)` constructor
//! some older examples in this space still use — the workspace pins
//! `rustls` 0.23, which only exposes the builder API.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use anyhow::{Context, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls_pemfile::{certs, pkcs8_private_keys};
use tokio_rustls::TlsAcceptor;

use broker_types::BrokerConfig;

pub fn build_acceptor(config: &BrokerConfig) -> Result<TlsAcceptor> {
    let cert_chain = load_certs(&config.tls_cert_path)
        .with_context(|| format!("loading TLS cert from {}", config.tls_cert_path))?;
    let key = load_key(&config.tls_key_path)
        .with_context(|| format!("loading TLS key from {}", config.tls_key_path))?;

    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .context("building rustls ServerConfig")?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .context("parsing PEM certificate chain")
}

fn load_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut keys = pkcs8_private_keys(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .context("parsing PKCS#8 private key")?;
    let key = keys.pop().context("no private key found in file")?;
    Ok(key.into())
}
