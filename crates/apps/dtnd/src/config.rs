//! TOML daemon configuration: local EID, durable store location, the API
//! adapter's bind address, and the statically configured links/routes
//! (§4.4, §4.7, §9's "static configuration, no discovery protocol" scope).

use std::fs;
use std::path::Path;

use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct DaemonConfig {
    pub local_eid: String,
    #[serde(default = "default_store_dir")]
    pub store_dir: String,
    #[serde(default = "default_store_name")]
    pub store_name: String,
    #[serde(default = "default_api_bind")]
    pub api_bind: String,
    #[serde(default)]
    pub tcp_listen: Option<String>,
    /// Payload size, in bytes, above which a bundle's payload is spilled to
    /// the payload directory instead of kept resident in memory (§4.2).
    #[serde(default = "default_payload_mem_threshold")]
    pub payload_mem_threshold: u64,
    #[serde(default)]
    pub custody: CustodyConfig,
    #[serde(default)]
    pub links: Vec<LinkConfig>,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    #[serde(default)]
    pub registrations: Vec<RegistrationConfig>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CustodyConfig {
    pub retry_factor: Option<u32>,
    pub max_retries: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct LinkConfig {
    pub name: String,
    pub nexthop: String,
    #[serde(default = "default_link_type")]
    pub link_type: String,
    #[serde(default = "default_clayer")]
    pub clayer: String,
}

#[derive(Debug, Deserialize)]
pub struct RouteConfig {
    pub pattern: String,
    pub link: String,
    #[serde(default)]
    pub keep_copy: bool,
}

/// A subscription applied at boot, e.g. a standing `EXEC` hook that should
/// exist before the first bundle can arrive for it (§4.3, §6).
#[derive(Debug, Deserialize)]
pub struct RegistrationConfig {
    pub pattern: String,
    #[serde(default = "default_failure_action")]
    pub failure_action: String,
    #[serde(default)]
    pub exec_script: Option<String>,
    #[serde(default)]
    pub expiration_secs: u64,
    #[serde(default)]
    pub init_passive: bool,
}

fn default_failure_action() -> String {
    "defer".into()
}

fn default_store_dir() -> String {
    "./dtnd-store".into()
}

fn default_store_name() -> String {
    "dtnd.sqlite".into()
}

fn default_api_bind() -> String {
    "127.0.0.1:4556".into()
}

fn default_link_type() -> String {
    "always_on".into()
}

fn default_clayer() -> String {
    "tcp".into()
}

fn default_payload_mem_threshold() -> u64 {
    65536
}

impl DaemonConfig {
    pub fn from_toml(input: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(input)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents).map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_fills_in_defaults() {
        let config = DaemonConfig::from_toml(r#"local_eid = "dtn://node1""#).unwrap();
        assert_eq!(config.local_eid, "dtn://node1");
        assert_eq!(config.api_bind, "127.0.0.1:4556");
        assert!(config.links.is_empty());
    }

    #[test]
    fn links_and_routes_parse() {
        let toml = r#"
            local_eid = "dtn://node1"

            [[links]]
            name = "node2"
            nexthop = "192.0.2.2:4556"
            link_type = "always_on"

            [[routes]]
            pattern = "dtn://node2/*"
            link = "node2"
        "#;
        let config = DaemonConfig::from_toml(toml).unwrap();
        assert_eq!(config.links.len(), 1);
        assert_eq!(config.links[0].nexthop, "192.0.2.2:4556");
        assert_eq!(config.routes[0].pattern, "dtn://node2/*");
    }
}
