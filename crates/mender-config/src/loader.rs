use std::path::Path;

use mender_domain::ClientConfig;
use tracing::debug;

use crate::error::ConfigError;
use crate::raw::RawClientConfig;

/// Load and validate a [`ClientConfig`] from a YAML file.
///
/// Mirrors the original device's `mender.conf` at the level of meaning
/// (device type, server URL, poll intervals) while using this workspace's
/// YAML + `serde` config convention instead of the original's JSON file.
pub fn load_client_config(path: &Path) -> Result<ClientConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    let raw: RawClientConfig = serde_yaml::from_str(&content).map_err(|e| ConfigError::YamlParse {
        path: path.display().to_string(),
        source: e,
    })?;
    debug!(path = %path.display(), "mender-config: loaded client configuration");
    convert(raw)
}

fn convert(raw: RawClientConfig) -> Result<ClientConfig, ConfigError> {
    let config = ClientConfig {
        device_type: raw.device_type,
        host: raw.server_url,
        tenant_token: raw.tenant_token,
        auth_poll_interval: raw.auth_poll_interval_seconds,
        update_poll_interval: raw.update_poll_interval_seconds,
        inventory_poll_interval: raw.inventory_poll_interval_seconds,
        recommissioning: raw.recommissioning,
    };
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_yaml(contents: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    #[test]
    fn loads_minimal_config_with_defaults() {
        let f = write_yaml(
            "device_type: raspberrypi4\nserver_url: https://mender.example.com\n",
        );
        let cfg = load_client_config(f.path()).unwrap();
        assert_eq!(cfg.device_type, "raspberrypi4");
        assert_eq!(cfg.host, "https://mender.example.com");
        assert_eq!(cfg.auth_poll_interval, 600);
        assert_eq!(cfg.update_poll_interval, 1800);
        assert!(!cfg.recommissioning);
    }

    #[test]
    fn loads_full_config() {
        let f = write_yaml(
            "device_type: raspberrypi4\n\
             server_url: https://mender.example.com\n\
             tenant_token: abc123\n\
             auth_poll_interval_seconds: 60\n\
             update_poll_interval_seconds: -1\n\
             inventory_poll_interval_seconds: 3600\n\
             recommissioning: true\n",
        );
        let cfg = load_client_config(f.path()).unwrap();
        assert_eq!(cfg.tenant_token.as_deref(), Some("abc123"));
        assert_eq!(cfg.update_poll_interval, -1);
        assert!(cfg.recommissioning);
    }

    #[test]
    fn rejects_empty_device_type() {
        let f = write_yaml("device_type: \"\"\nserver_url: https://mender.example.com\n");
        let err = load_client_config(f.path());
        assert!(err.is_err());
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = load_client_config(Path::new("/no/such/mender.yaml"));
        assert!(matches!(err, Err(ConfigError::Io { .. })));
    }
}
