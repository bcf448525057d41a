//! Configuration.
//!
//! Key names follow the fixed migration-config vocabulary
//! (`migrate_batch_size`, `migrate_threads`, `migrate_flush`,
//! `migrate_retries`, `auth_user`, `auth_password`, `connection_timeout`,
//! `metric_gateway`) for ecosystem compatibility, loaded from TOML with
//! defaults for every optional value.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::metrics::MetricGateway;

fn default_batch_size() -> i64 {
    4096
}

fn default_threads() -> usize {
    4
}

fn default_retries() -> u32 {
    1
}

/// Milliseconds; matches the conventional migration-tool default.
fn default_connection_timeout() -> u64 {
    60_000
}

/// When endpoint writers are flushed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlushPolicy {
    /// Flush the socket on every command (`migrate_flush = "yes"`).
    #[default]
    #[serde(rename = "yes")]
    PerCommand,
    /// Flush per 64 KiB of buffered output (`migrate_flush = "no"`).
    #[serde(rename = "no")]
    Buffered,
}

/// Target-side TLS settings (`rediss://` schemes).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsSettings {
    /// Extra PEM root CA bundle for the target keystore.
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
}

/// The migration engine's configuration surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MigrateConfig {
    /// Pipeline budget per endpoint; `-1` disables auto-drain.
    #[serde(default = "default_batch_size")]
    pub migrate_batch_size: i64,
    /// Lane count per target.
    #[serde(default = "default_threads")]
    pub migrate_threads: usize,
    /// `yes` = flush per command, `no` = flush per 64 KiB.
    #[serde(default)]
    pub migrate_flush: FlushPolicy,
    /// Retries on socket failure; only valid with `migrate_flush = yes`.
    #[serde(default = "default_retries")]
    pub migrate_retries: u32,
    /// ACL user for `AUTH`.
    #[serde(default)]
    pub auth_user: Option<String>,
    /// Password for `AUTH`.
    #[serde(default)]
    pub auth_password: Option<String>,
    /// Initial connect deadline, in milliseconds.
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: u64,
    /// Counter exposition gateway.
    #[serde(default)]
    pub metric_gateway: MetricGateway,
    /// Target-side TLS settings.
    #[serde(default)]
    pub tls: TlsSettings,
}

impl Default for MigrateConfig {
    fn default() -> Self {
        Self {
            migrate_batch_size: default_batch_size(),
            migrate_threads: default_threads(),
            migrate_flush: FlushPolicy::default(),
            migrate_retries: default_retries(),
            auth_user: None,
            auth_password: None,
            connection_timeout: default_connection_timeout(),
            metric_gateway: MetricGateway::default(),
            tls: TlsSettings::default(),
        }
    }
}

impl MigrateConfig {
    /// Load and validate a TOML config file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        let config: MigrateConfig = toml::from_str(&data)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-key validity rules.
    pub fn validate(&self) -> Result<()> {
        if self.migrate_threads == 0 {
            return Err(Error::Config("migrate_threads must be at least 1".into()));
        }
        if self.migrate_batch_size == 0 || self.migrate_batch_size < -1 {
            return Err(Error::Config(
                "migrate_batch_size must be positive, or -1 to disable auto-drain".into(),
            ));
        }
        if self.migrate_retries > 0 && self.migrate_flush != FlushPolicy::PerCommand {
            return Err(Error::Config(
                "migrate_retries requires migrate_flush = yes".into(),
            ));
        }
        if self.auth_user.is_some() && self.auth_password.is_none() {
            return Err(Error::Config(
                "auth_user is set but auth_password is missing".into(),
            ));
        }
        Ok(())
    }

    /// The connect deadline as a [`Duration`].
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout)
    }

    /// Per-lane queue capacity: 4× the pipeline budget, floored at 16.
    pub fn lane_queue_capacity(&self) -> usize {
        if self.migrate_batch_size > 0 {
            (self.migrate_batch_size as usize).saturating_mul(4).max(16)
        } else {
            16
        }
    }
}

/// A parsed `redis://` / `rediss://` target URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisUrl {
    /// Target host.
    pub host: String,
    /// Target port.
    pub port: u16,
    /// `true` for `rediss://`.
    pub tls: bool,
}

impl RedisUrl {
    /// Parse `redis://host[:port]` or `rediss://host[:port]`.
    pub fn parse(url: &str) -> Result<Self> {
        let (tls, rest) = if let Some(rest) = url.strip_prefix("rediss://") {
            (true, rest)
        } else if let Some(rest) = url.strip_prefix("redis://") {
            (false, rest)
        } else {
            return Err(Error::Config(format!(
                "unsupported target url '{}': expected redis:// or rediss://",
                url
            )));
        };
        let rest = rest.trim_end_matches('/');
        if rest.is_empty() {
            return Err(Error::Config(format!("target url '{}' has no host", url)));
        }
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| Error::Config(format!("bad port in target url '{}'", url)))?;
                (host, port)
            }
            None => (rest, 6379),
        };
        Ok(Self {
            host: host.to_string(),
            port,
            tls,
        })
    }

    /// `host:port` address form.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Parse a comma/space separated list of database indexes.
pub fn parse_db_set(spec: &str) -> Result<HashSet<i64>> {
    spec.split([',', ' '])
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<i64>()
                .map_err(|_| Error::Config(format!("bad database index '{}'", s)))
        })
        .collect()
}
