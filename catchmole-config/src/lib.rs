//! # CatchMole Configuration
//!
//! TOML configuration with environment overrides and validation.
//!
//! ## Hierarchy
//! 1. Built-in defaults
//! 2. The TOML file (default `catchmole.toml`; optional unless the user named
//!    one explicitly)
//! 3. `CATCHMOLE_*` environment variables

#![warn(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use validator::Validate;

mod error;

pub use error::ConfigError;

/// Default configuration file looked up next to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "catchmole.toml";

/// Top-level daemon configuration.
#[derive(Debug, Serialize, Deserialize, Validate, Clone)]
pub struct CatchmoleConfig {
    /// HTTP bind address. The Go-style `:8080` shorthand is accepted and
    /// normalized by [`CatchmoleConfig::normalized_listen`].
    #[validate(length(min = 1, message = "listen address must not be empty"))]
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Monitored interface; unset means no interface filtering.
    #[serde(default)]
    pub interface: Option<String>,

    /// When true (the default), LAN-to-LAN flows are not accounted.
    #[serde(default = "default_true")]
    pub ignore_lan: bool,

    /// Aggregator tick and conntrack poll interval, in seconds.
    #[validate(range(min = 1, max = 3600))]
    #[serde(default = "default_interval")]
    pub interval: u64,

    /// Idle seconds before a flow tracker is evicted.
    #[validate(range(min = 1, max = 86400))]
    #[serde(default = "default_flow_ttl")]
    pub flow_ttl: u64,

    /// Static MAC → display name table (keys are lower-cased on use).
    #[serde(default)]
    pub devices: HashMap<String, String>,

    /// External IP-lookup tools surfaced to the UI via `/api/meta`.
    #[serde(default)]
    pub ip_tools: BTreeMap<String, String>,
}

fn default_listen() -> String {
    ":8080".to_string()
}
fn default_true() -> bool {
    true
}
fn default_interval() -> u64 {
    1
}
fn default_flow_ttl() -> u64 {
    60
}

impl Default for CatchmoleConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            interface: None,
            ignore_lan: default_true(),
            interval: default_interval(),
            flow_ttl: default_flow_ttl(),
            devices: HashMap::new(),
            ip_tools: BTreeMap::new(),
        }
    }
}

impl CatchmoleConfig {
    /// Loads configuration from `path`, layered over defaults and under
    /// `CATCHMOLE_*` environment variables.
    ///
    /// A missing file is fine when `require_file` is false (the user did not
    /// name one explicitly); otherwise it is an error.
    pub fn load<P: AsRef<Path>>(path: P, require_file: bool) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut figment = Figment::from(Serialized::defaults(CatchmoleConfig::default()));
        if path.exists() {
            figment = figment.merge(Toml::file(path));
        } else if require_file {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }
        extract(figment)
    }

    /// The listen address in a form `TcpListener`/actix accept: a bare
    /// `:port` becomes `0.0.0.0:port`.
    pub fn normalized_listen(&self) -> String {
        if self.listen.starts_with(':') {
            format!("0.0.0.0{}", self.listen)
        } else {
            self.listen.clone()
        }
    }
}

fn extract(figment: Figment) -> Result<CatchmoleConfig, ConfigError> {
    figment
        .merge(Env::prefixed("CATCHMOLE_").split("__"))
        .extract()
        .map_err(ConfigError::from)
        .and_then(|config: CatchmoleConfig| {
            config.validate()?;
            Ok(config)
        })
}
