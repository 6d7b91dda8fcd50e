//! Configuration module
//!
//! Provides configuration types and loading for tetherd.

pub mod loader;
pub mod types;

pub use loader::{create_default_config, load_config, load_config_str, load_config_with_env};
pub use types::{
    Config, DhcpConfig, DownstreamConfig, IpcConfig, LogConfig, TetheringConfig, UpstreamConfig,
};
