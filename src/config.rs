// ABOUTME: mirror.toml loading, environment-variable discovery, and validation
// ABOUTME: Produces the pipeline options and the list of source environments

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::filters::TableFilter;
use crate::mirror::watchdog::DEFAULT_STALE_AFTER_DAYS;
use crate::mirror::{SyncOptions, TableSettings};
use crate::utils::{mask_password, validate_identifier, validate_source_target_different};

pub const CONFIG_FILE_NAME: &str = "mirror.toml";
const DEFAULT_PORT: u16 = 5432;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub warehouse: WarehouseConfig,
    pub notify: NotifyConfig,
    pub sync: SyncConfig,
    pub environments: Vec<EnvironmentConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WarehouseConfig {
    pub url: Option<String>,
    /// Connections kept open to the warehouse.
    pub pool_size: usize,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            url: None,
            pool_size: 4,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NotifyConfig {
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    pub source_schema: String,
    pub update_column: String,
    pub key_column: String,
    pub table_concurrency: usize,
    pub environment_concurrency: usize,
    pub stale_after_days: i64,
    pub include_tables: Vec<String>,
    pub exclude_tables: Vec<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let settings = TableSettings::default();
        Self {
            source_schema: settings.source_schema,
            update_column: settings.update_column,
            key_column: settings.key_column,
            table_concurrency: 4,
            environment_concurrency: 1,
            stale_after_days: DEFAULT_STALE_AFTER_DAYS,
            include_tables: Vec::new(),
            exclude_tables: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvironmentConfig {
    /// Namespaces the destination datasets (`final_{name}`, ...).
    pub name: String,
    pub url: String,
}

impl EnvironmentConfig {
    /// Same environment with the URL's password replaced by `***`.
    pub fn masked(&self) -> Self {
        Self {
            name: self.name.clone(),
            url: mask_password(&self.url),
        }
    }
}

impl Config {
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).context("Failed to parse mirror configuration")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration from {:?}", path))?;
        Self::from_toml_str(&contents)
            .with_context(|| format!("Invalid configuration in {:?}", path))
    }

    /// Find the configuration file: an explicit path, then `./mirror.toml`,
    /// then `~/.warehouse-mirror/mirror.toml`.
    ///
    /// An explicit path must exist; the fallbacks are optional.
    pub fn locate(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit {
            if !path.exists() {
                bail!("Configuration file {:?} does not exist", path);
            }
            return Ok(Some(path.to_path_buf()));
        }

        let local = PathBuf::from(CONFIG_FILE_NAME);
        if local.exists() {
            return Ok(Some(local));
        }

        if let Some(home) = dirs::home_dir() {
            let global = home.join(".warehouse-mirror").join(CONFIG_FILE_NAME);
            if global.exists() {
                return Ok(Some(global));
            }
        }

        Ok(None)
    }

    /// Load the located file, or defaults when there is none.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self> {
        match Self::locate(explicit)? {
            Some(path) => {
                tracing::debug!("Loading configuration from {:?}", path);
                Self::load(&path)
            }
            None => {
                tracing::debug!("No configuration file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Append environments discovered through `get` that the file does not
    /// already name.
    pub fn add_discovered_environments<F>(&mut self, get: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        for discovered in discover_environments(get)? {
            if self.environments.iter().any(|e| e.name == discovered.name) {
                tracing::debug!(
                    "Environment {} from variables shadowed by the config file",
                    discovered.name
                );
                continue;
            }
            self.environments.push(discovered);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.environments.is_empty() {
            bail!(
                "No environments configured. Add [[environments]] to {} or set NAME1, HOST1, USER1, PASSWORD1, PORT1",
                CONFIG_FILE_NAME
            );
        }

        let warehouse_url = self
            .warehouse
            .url
            .as_deref()
            .context("No warehouse URL configured. Set [warehouse] url, --warehouse-url or WAREHOUSE_URL")?;

        let mut seen = std::collections::HashSet::new();
        for env in &self.environments {
            validate_identifier(&env.name)
                .with_context(|| format!("Invalid environment name '{}'", env.name))?;
            if !seen.insert(env.name.as_str()) {
                bail!("Environment '{}' is configured more than once", env.name);
            }
            validate_source_target_different(&env.url, warehouse_url)
                .with_context(|| format!("Environment '{}'", env.name))?;
        }

        validate_identifier(&self.sync.source_schema).context("Invalid source_schema")?;
        validate_identifier(&self.sync.update_column).context("Invalid update_column")?;
        validate_identifier(&self.sync.key_column).context("Invalid key_column")?;

        if self.sync.table_concurrency == 0 {
            bail!("table_concurrency must be at least 1");
        }
        if self.sync.environment_concurrency == 0 {
            bail!("environment_concurrency must be at least 1");
        }
        if self.sync.stale_after_days < 0 {
            bail!("stale_after_days cannot be negative");
        }
        if self.warehouse.pool_size == 0 {
            bail!("warehouse pool_size must be at least 1");
        }

        TableFilter::new(
            self.sync.include_tables.clone(),
            self.sync.exclude_tables.clone(),
        )?;
        Ok(())
    }

    pub fn sync_options(&self) -> Result<SyncOptions> {
        Ok(SyncOptions {
            table: TableSettings {
                source_schema: self.sync.source_schema.clone(),
                update_column: self.sync.update_column.clone(),
                key_column: self.sync.key_column.clone(),
            },
            filter: TableFilter::new(
                self.sync.include_tables.clone(),
                self.sync.exclude_tables.clone(),
            )?,
            table_concurrency: self.sync.table_concurrency,
            environment_concurrency: self.sync.environment_concurrency,
            stale_after_days: self.sync.stale_after_days,
        })
    }
}

/// Read environments from numbered variables `NAME1`, `HOST1`, `USER1`,
/// `PASSWORD1`, `PORT1`, then `NAME2`, ... stopping at the first index with
/// any of them missing. All share the database named by `SOURCE_DATABASE`.
pub fn discover_environments<F>(get: F) -> Result<Vec<EnvironmentConfig>>
where
    F: Fn(&str) -> Option<String>,
{
    let mut environments = Vec::new();
    let mut i = 1;
    loop {
        let var = |prefix: &str| get(&format!("{}{}", prefix, i));
        let (Some(name), Some(host), Some(user), Some(password), Some(port)) = (
            var("NAME"),
            var("HOST"),
            var("USER"),
            var("PASSWORD"),
            var("PORT"),
        ) else {
            break;
        };

        let database = get("SOURCE_DATABASE").context(
            "SOURCE_DATABASE must be set when environments come from NAME/HOST variables",
        )?;
        let port: u16 = if port.trim().is_empty() {
            DEFAULT_PORT
        } else {
            port.trim()
                .parse()
                .with_context(|| format!("PORT{} is not a valid port: '{}'", i, port))?
        };

        environments.push(EnvironmentConfig {
            name,
            url: build_postgres_url(&host, port, &user, &password, &database)?,
        });
        i += 1;
    }
    Ok(environments)
}

/// Assemble a `postgresql://` URL, percent-encoding the credentials.
pub fn build_postgres_url(
    host: &str,
    port: u16,
    user: &str,
    password: &str,
    database: &str,
) -> Result<String> {
    let mut url = url::Url::parse(&format!("postgresql://{}", host))
        .with_context(|| format!("Invalid host '{}'", host))?;
    url.set_username(user)
        .map_err(|_| anyhow::anyhow!("Cannot set user on URL for host '{}'", host))?;
    url.set_password(Some(password))
        .map_err(|_| anyhow::anyhow!("Cannot set password on URL for host '{}'", host))?;
    url.set_port(Some(port))
        .map_err(|_| anyhow::anyhow!("Cannot set port on URL for host '{}'", host))?;
    url.set_path(database);
    Ok(url.to_string())
}
