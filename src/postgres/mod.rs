// ABOUTME: PostgreSQL connectivity shared by the source reader and the warehouse
// ABOUTME: TLS-aware connect with retry; the connection task runs in the background

pub mod source;
pub mod warehouse;

use anyhow::{Context, Result};
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use std::time::Duration;
use tokio_postgres::Client;

use crate::utils::{mask_password, retry_with_backoff};

pub use source::{PostgresConnector, PostgresSource};
pub use warehouse::PostgresWarehouse;

/// TLS and retry settings for opening connections.
#[derive(Debug, Clone, Copy)]
pub struct ConnectOptions {
    /// Accept self-signed and otherwise invalid certificates.
    pub allow_self_signed_certs: bool,
    pub max_retries: u32,
    pub initial_retry_delay: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            allow_self_signed_certs: false,
            max_retries: 3,
            initial_retry_delay: Duration::from_secs(1),
        }
    }
}

/// Open one connection.
///
/// TLS is negotiated according to the URL's `sslmode` (default `prefer`).
pub async fn connect(url: &str, options: &ConnectOptions) -> Result<Client> {
    let tls = TlsConnector::builder()
        .danger_accept_invalid_certs(options.allow_self_signed_certs)
        .danger_accept_invalid_hostnames(options.allow_self_signed_certs)
        .build()
        .context("Failed to build TLS connector")?;
    let tls = MakeTlsConnector::new(tls);

    let (client, connection) = tokio_postgres::connect(url, tls)
        .await
        .with_context(|| format!("Failed to connect to {}", mask_password(url)))?;

    let display_url = mask_password(url);
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("Connection to {} closed with error: {}", display_url, e);
        }
    });

    Ok(client)
}

/// Open one connection, retrying transient failures with exponential backoff.
pub async fn connect_with_retry(url: &str, options: &ConnectOptions) -> Result<Client> {
    retry_with_backoff(
        || connect(url, options),
        options.max_retries,
        options.initial_retry_delay,
    )
    .await
}
