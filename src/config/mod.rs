mod logging_config;
pub mod config;

pub use config::{
    Config, ConfigError, DatabaseConfig, FindConfig, MoveConfig, NetConfig, StorageConfig,
};
pub use logging_config::LoggingConfig;
