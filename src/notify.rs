// ABOUTME: Alert delivery for pipeline failures and stale tables
// ABOUTME: Webhook JSON POST, or tracing output when no webhook is configured

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlertBody {
    /// Every error text recorded for the environment in this run.
    Failure { errors: Vec<String> },
    /// Source table name -> date its changed set was last refreshed.
    StaleTables { tables: BTreeMap<String, String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Alert {
    pub subject: String,
    pub environment: String,
    #[serde(flatten)]
    pub body: AlertBody,
}

impl Alert {
    pub fn failure(environment: &str, errors: Vec<String>) -> Self {
        Self {
            subject: format!("Warehouse mirror update alert: env {}", environment),
            environment: environment.to_string(),
            body: AlertBody::Failure { errors },
        }
    }

    pub fn stale_tables(environment: &str, tables: BTreeMap<String, String>) -> Self {
        Self {
            subject: format!("Warehouse mirror stale data alert: env {}", environment),
            environment: environment.to_string(),
            body: AlertBody::StaleTables { tables },
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, alert: &Alert) -> Result<()>;
}

/// Send an alert, logging instead of failing when delivery does not work.
pub async fn deliver(notifier: &dyn Notifier, alert: &Alert) {
    match notifier.send(alert).await {
        Ok(()) => tracing::info!("Sent alert: {}", alert.subject),
        Err(e) => tracing::error!("Failed to send alert '{}': {:#}", alert.subject, e),
    }
}

/// Posts each alert as JSON to a webhook URL.
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client, url })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, alert: &Alert) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(alert)
            .send()
            .await
            .context("Failed to reach alert webhook")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Alert webhook rejected the alert with status {}: {}", status, body);
        }

        Ok(())
    }
}

/// Writes alerts to the log. Used when no webhook is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, alert: &Alert) -> Result<()> {
        match &alert.body {
            AlertBody::Failure { errors } => {
                tracing::error!("{}", alert.subject);
                for error in errors {
                    tracing::error!("  {}", error);
                }
            }
            AlertBody::StaleTables { tables } => {
                tracing::warn!("{}", alert.subject);
                for (table, date) in tables {
                    tracing::warn!("  {} last refreshed {}", table, date);
                }
            }
        }
        Ok(())
    }
}
