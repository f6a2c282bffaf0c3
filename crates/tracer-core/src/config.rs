//! Agent configuration: a raw key/value [`ConfigMap`] and the typed
//! [`TracerConfig`] built from it.
use std::{
    collections::HashMap,
    fmt::Display,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use regex::Regex;
use thiserror::Error;

pub const DEFAULT_BPF_BASE_DIR: &str = "/var/run/autoinstrument";
pub const DEFAULT_PROBES_DIR: &str = "/usr/lib/autoinstrument/probes";

/// Raw configuration values, as read from the configuration file and the
/// command line.
#[derive(Debug, Clone, Default)]
pub struct ConfigMap {
    inner: HashMap<String, String>,
}

#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("field {field} is required")]
    RequiredValue { field: String },
    #[error("{value} is not a valid value for field {field}: {err}")]
    InvalidValue {
        field: String,
        value: String,
        err: String,
    },
}

impl ConfigMap {
    /// Inserts a new configuration value, returning the one it replaces.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.inner.insert(key.into(), value.into())
    }

    /// Returns a typed configuration value, failing if it's missing.
    pub fn required<T>(&self, config_name: &str) -> Result<T, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        match self.inner.get(config_name) {
            None => Err(ConfigError::RequiredValue {
                field: config_name.to_string(),
            }),
            Some(value) => parse(value, config_name),
        }
    }

    /// Returns an optional typed configuration value.
    pub fn optional<T>(&self, config_name: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        self.inner
            .get(config_name)
            .map(|value| parse(value, config_name))
            .transpose()
    }

    /// Returns a typed configuration value, or `default` if it's missing.
    pub fn with_default<T>(&self, config_name: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        Ok(self.optional(config_name)?.unwrap_or(default))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ConfigMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            inner: iter
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }
}

fn parse<T>(value: &str, config_name: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    <T as FromStr>::Err: Display,
{
    T::from_str(value.trim()).map_err(|err| ConfigError::InvalidValue {
        field: config_name.to_string(),
        value: value.to_string(),
        err: err.to_string(),
    })
}

/// How the port discovery loop waits between rejected candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    /// `None` retries until cancelled.
    pub max_attempts: Option<usize>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    pub fn unbounded(interval: Duration) -> Self {
        Self {
            interval,
            max_attempts: None,
        }
    }

    /// True if another candidate may be tried after `attempts` rejections.
    pub fn allows(&self, attempts: usize) -> bool {
        self.max_attempts.is_none_or(|max| attempts < max)
    }
}

#[derive(Debug, Clone)]
pub struct TracerConfig {
    /// Matched against the executable path of running processes.
    pub exec: Option<Regex>,
    /// Listening port of the target. Takes precedence over `exec`.
    pub port: Option<u16>,
    /// Skip Go inspection and use only the generic kernel tracer.
    pub system_wide: bool,
    /// Root of the per-process BPF pin file systems.
    pub bpf_base_dir: PathBuf,
    /// Directory holding the compiled eBPF objects.
    pub probes_dir: PathBuf,
    pub bpf_debug: bool,
    /// Minimum amount of ring buffer data before waking up userspace.
    pub wakeup_len: u32,
    pub batch_length: usize,
    pub batch_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            exec: None,
            port: None,
            system_wide: false,
            bpf_base_dir: PathBuf::from(DEFAULT_BPF_BASE_DIR),
            probes_dir: PathBuf::from(DEFAULT_PROBES_DIR),
            bpf_debug: false,
            wakeup_len: 0,
            batch_length: 100,
            batch_timeout: Duration::from_secs(1),
            retry: RetryPolicy::default(),
        }
    }
}

impl TracerConfig {
    /// Path of the compiled eBPF object `name`, in its debug variant when
    /// `bpf_debug` is set.
    pub fn artifact_path(&self, name: &str) -> PathBuf {
        let suffix = if self.bpf_debug { "_debug" } else { "" };
        self.probes_dir.join(format!("{name}{suffix}.bpf.o"))
    }

    /// Ring buffer bytes to accumulate before waking up userspace, for
    /// events of `record_size` bytes.
    pub fn wakeup_data_bytes(&self, record_size: usize) -> u32 {
        let record_size = u32::try_from(record_size).unwrap_or(u32::MAX);
        self.wakeup_len.saturating_mul(record_size)
    }
}

impl TryFrom<&ConfigMap> for TracerConfig {
    type Error = ConfigError;

    fn try_from(config: &ConfigMap) -> Result<Self, Self::Error> {
        let default = TracerConfig::default();
        let exec: Option<Regex> = config.optional("exec")?;
        // Port 0 can't be listened on and stands for no port.
        let port = config.optional::<u16>("port")?.filter(|port| *port != 0);
        if exec.is_none() && port.is_none() {
            return Err(ConfigError::RequiredValue {
                field: "exec or port".to_string(),
            });
        }
        let batch_length = config.with_default("batch_length", default.batch_length)?;
        if batch_length == 0 {
            return Err(ConfigError::InvalidValue {
                field: "batch_length".to_string(),
                value: "0".to_string(),
                err: "must be greater than zero".to_string(),
            });
        }
        Ok(Self {
            exec,
            port,
            system_wide: config.with_default("system_wide", default.system_wide)?,
            bpf_base_dir: config.with_default("bpf_base_dir", default.bpf_base_dir)?,
            probes_dir: config.with_default("probes_dir", default.probes_dir)?,
            bpf_debug: config.with_default("bpf_debug", default.bpf_debug)?,
            wakeup_len: config.with_default("wakeup_len", default.wakeup_len)?,
            batch_length,
            batch_timeout: Duration::from_millis(config.with_default("batch_timeout_ms", 1000)?),
            retry: RetryPolicy {
                interval: Duration::from_millis(
                    config.with_default("port_retry_interval_ms", 1000)?,
                ),
                max_attempts: config.optional("port_retry_max_attempts")?,
            },
        })
    }
}
