use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracer_core::{ConfigMap, TracerConfig};

use crate::cli::AgentOpts;

const DEFAULT_CONFIG_FILE: &str = "/etc/autoinstrument/autoinstrument.ini";

/// Section of the configuration file holding the tracer settings.
const EBPF_SECTION: &str = "ebpf";

/// Build the tracer configuration from the configuration file, if any, and
/// the command line.
///
/// A missing default file is not an error, while a missing custom one is.
pub fn load_config(options: &AgentOpts) -> Result<TracerConfig> {
    let mut config = match &options.config_file {
        Some(custom_file) => {
            let config_file = PathBuf::from(custom_file);
            if !config_file.exists() {
                bail!("Configuration file {} not found", config_file.display());
            }
            read_config_file(&config_file)?
        }
        None => {
            let config_file = Path::new(DEFAULT_CONFIG_FILE);
            if config_file.exists() {
                read_config_file(config_file)?
            } else {
                ConfigMap::default()
            }
        }
    };

    apply_overrides(&mut config, options);

    TracerConfig::try_from(&config).context("Invalid eBPF configuration")
}

fn read_config_file(config_file: &Path) -> Result<ConfigMap> {
    let conf = ini::Ini::load_from_file(config_file)
        .with_context(|| format!("Error loading configuration from {config_file:?}"))?;

    let mut config = ConfigMap::default();
    if let Some(prop) = conf.section(Some(EBPF_SECTION)) {
        for (key, value) in prop.iter() {
            log::debug!("{EBPF_SECTION}.{key}={value}");
            config.insert(key, value);
        }
    }
    Ok(config)
}

fn apply_overrides(config: &mut ConfigMap, options: &AgentOpts) {
    if let Some(exec) = &options.exec {
        config.insert("exec", exec.as_str());
    }
    if let Some(port) = options.port {
        config.insert("port", port.to_string());
    }
    if options.system_wide {
        config.insert("system_wide", "true");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn write_config(name: &str, content: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "autoinstrument_{name}_{}.ini",
            std::process::id()
        ));
        std::fs::write(&path, content).unwrap();
        path
    }

    fn opts(config_file: &Path) -> AgentOpts {
        AgentOpts {
            config_file: Some(config_file.display().to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn ebpf_section_is_read() {
        let path = write_config(
            "ebpf_section",
            "[ebpf]\nexec = myapp\nbatch_length = 10\nbatch_timeout_ms = 50\n\n[other]\nport = 1\n",
        );
        let config = load_config(&opts(&path)).unwrap();
        assert!(config.exec.unwrap().is_match("/opt/myapp"));
        assert_eq!(config.port, None);
        assert_eq!(config.batch_length, 10);
        assert_eq!(config.batch_timeout, Duration::from_millis(50));
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn flags_override_the_file() {
        let path = write_config("overrides", "[ebpf]\nexec = myapp\nport = 80\n");
        let options = AgentOpts {
            port: Some(8080),
            system_wide: true,
            ..opts(&path)
        };
        let config = load_config(&options).unwrap();
        assert_eq!(config.port, Some(8080));
        assert!(config.system_wide);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn missing_custom_file() {
        let options = opts(Path::new("/nonexistent/autoinstrument.ini"));
        assert!(load_config(&options).is_err());
    }

    #[test]
    fn target_is_required() {
        let path = write_config("no_target", "[ebpf]\nsystem_wide = true\n");
        assert!(load_config(&opts(&path)).is_err());
        std::fs::remove_file(path).unwrap();
    }
}
