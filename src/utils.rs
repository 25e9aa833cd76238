// ABOUTME: Shared helpers for SQL quoting, identifier checks, URL masking and retries
// ABOUTME: Used by the PostgreSQL collaborators, config validation and the CLI

use anyhow::{bail, Context, Result};
use std::time::Duration;
use url::Url;

/// Retry an async operation with exponential backoff.
///
/// `max_retries` counts retries after the first attempt, so `2` means at most
/// three attempts. The delay doubles after every failure.
///
/// # Examples
///
/// ```no_run
/// # use anyhow::Result;
/// # use std::time::Duration;
/// # use warehouse_mirror::utils::retry_with_backoff;
/// # async fn example() -> Result<()> {
/// let value = retry_with_backoff(|| async { Ok(42) }, 3, Duration::from_millis(500)).await?;
/// assert_eq!(value, 42);
/// # Ok(())
/// # }
/// ```
pub async fn retry_with_backoff<F, Fut, T>(
    mut operation: F,
    max_retries: u32,
    initial_delay: Duration,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut delay = initial_delay;
    let mut last_error = None;

    for attempt in 0..=max_retries {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if attempt < max_retries {
                    tracing::warn!(
                        "Operation failed (attempt {}/{}): {:#}. Retrying in {:?}",
                        attempt + 1,
                        max_retries + 1,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| anyhow::anyhow!("Operation failed after retries")))
}

/// Check that a name is safe to embed in a warehouse dataset or table name.
///
/// Letters, digits and underscores only, starting with a letter or underscore,
/// at most 63 characters (the PostgreSQL identifier limit).
pub fn validate_identifier(identifier: &str) -> Result<()> {
    let trimmed = identifier.trim();
    if trimmed.is_empty() {
        bail!("Identifier cannot be empty or whitespace-only");
    }

    if trimmed.len() > 63 {
        bail!(
            "Identifier '{}' exceeds maximum length of 63 characters (got {})",
            sanitize_identifier(trimmed),
            trimmed.len()
        );
    }

    let mut chars = trimmed.chars();
    if let Some(first) = chars.next() {
        if !first.is_ascii_alphabetic() && first != '_' {
            bail!(
                "Identifier '{}' must start with a letter or underscore, not '{}'",
                sanitize_identifier(trimmed),
                first
            );
        }
    }

    if let Some((i, c)) = trimmed
        .chars()
        .enumerate()
        .find(|(_, c)| !c.is_ascii_alphanumeric() && *c != '_')
    {
        bail!(
            "Identifier '{}' contains invalid character {:?} at position {}. \
             Only letters, digits, and underscores are allowed",
            sanitize_identifier(trimmed),
            c,
            i
        );
    }

    Ok(())
}

/// Strip control characters and cap the length of a name before it is logged.
pub fn sanitize_identifier(identifier: &str) -> String {
    identifier
        .chars()
        .filter(|c| !c.is_control())
        .take(100)
        .collect()
}

/// Quote a PostgreSQL identifier, doubling embedded quotes.
pub fn quote_ident(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

/// Quote a SQL string literal, doubling embedded single quotes.
///
/// ```
/// use warehouse_mirror::utils::quote_literal;
/// assert_eq!(quote_literal("2024-01-01"), "'2024-01-01'");
/// assert_eq!(quote_literal("it's"), "'it''s'");
/// ```
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Replace the password of a connection URL with `***` for display.
///
/// Strings that do not parse as URLs are returned unchanged.
pub fn mask_password(url: &str) -> String {
    match Url::parse(url) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("***"));
            }
            parsed.to_string()
        }
        Err(_) => url.to_string(),
    }
}

/// Refuse to mirror a database onto itself.
///
/// Two URLs are the same database when host, port, database name and user all
/// match. The warehouse would otherwise truncate the tables being read.
pub fn validate_source_target_different(source_url: &str, target_url: &str) -> Result<()> {
    let source = Url::parse(source_url)
        .with_context(|| format!("Failed to parse source URL: {}", mask_password(source_url)))?;
    let target = Url::parse(target_url)
        .with_context(|| format!("Failed to parse warehouse URL: {}", mask_password(target_url)))?;

    let key = |u: &Url| {
        (
            u.host_str().map(|h| h.to_lowercase()),
            u.port().unwrap_or(5432),
            u.path().trim_start_matches('/').to_string(),
            u.username().to_string(),
        )
    };

    if key(&source) == key(&target) {
        bail!(
            "Source and warehouse URLs point to the same database ({}).\n\
             Mirroring would truncate the tables being read.",
            mask_password(source_url)
        );
    }

    Ok(())
}
