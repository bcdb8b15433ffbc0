//! HTTPS serving from the TLS material the secret bag maintains on disk.

use std::net::SocketAddr;

use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use berth_core::paths::Paths;
use berth_core::{Error, Result};

/// Bind the management API on `listen_address` using the certificate chain
/// and private key at their fixed paths. Only returns on error.
pub async fn serve(router: Router, listen_address: &str, paths: &Paths) -> Result<()> {
    let addr: SocketAddr = listen_address
        .parse()
        .map_err(|e| Error::Config(format!("invalid listen_address {listen_address}: {e}")))?;

    let tls = RustlsConfig::from_pem_file(paths.tls_certificate(), paths.tls_key())
        .await
        .map_err(|e| Error::fs(paths.tls_certificate(), e))?;

    tracing::info!(address = %addr, "Now serving.");
    axum_server::bind_rustls(addr, tls)
        .serve(router.into_make_service())
        .await
        .map_err(|e| Error::Config(format!("server error: {e}")))
}
