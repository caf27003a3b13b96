use serde::{Deserialize, Serialize};

/// Raw YAML representation of `mender.conf`-equivalent client configuration.
#[derive(Debug, Deserialize, Serialize)]
pub struct RawClientConfig {
    pub device_type: String,
    pub server_url: String,
    pub tenant_token: Option<String>,
    #[serde(default = "default_auth_poll_interval")]
    pub auth_poll_interval_seconds: i64,
    #[serde(default = "default_update_poll_interval")]
    pub update_poll_interval_seconds: i64,
    #[serde(default = "default_inventory_poll_interval")]
    pub inventory_poll_interval_seconds: i64,
    #[serde(default)]
    pub recommissioning: bool,
}

fn default_auth_poll_interval() -> i64 {
    600
}

fn default_update_poll_interval() -> i64 {
    1800
}

fn default_inventory_poll_interval() -> i64 {
    28800
}
