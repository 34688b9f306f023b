//! Guest customization settings applied alongside static addressing

use serde::{Deserialize, Serialize};

pub const DEFAULT_DOMAIN: &str = "vsphere.local";
pub const DEFAULT_TIME_ZONE: &str = "Etc/UTC";

fn default_domain() -> String {
    DEFAULT_DOMAIN.to_string()
}

fn default_time_zone() -> String {
    DEFAULT_TIME_ZONE.to_string()
}

fn default_dns_servers() -> Vec<String> {
    vec!["8.8.8.8".to_string(), "8.8.4.4".to_string()]
}

fn default_dns_suffixes() -> Vec<String> {
    vec![DEFAULT_DOMAIN.to_string()]
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomizationSettings {
    #[serde(default = "default_domain")]
    pub domain: String,
    #[serde(default = "default_time_zone")]
    pub time_zone: String,
    #[serde(default = "default_dns_servers")]
    pub dns_servers: Vec<String>,
    #[serde(default = "default_dns_suffixes")]
    pub dns_suffixes: Vec<String>,
    /// Never run in-guest customization, even for static interfaces
    #[serde(default)]
    pub skip: bool,
}

impl Default for CustomizationSettings {
    fn default() -> Self {
        Self {
            domain: default_domain(),
            time_zone: default_time_zone(),
            dns_servers: default_dns_servers(),
            dns_suffixes: default_dns_suffixes(),
            skip: false,
        }
    }
}
