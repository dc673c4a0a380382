//! 配置管理模块
//!
//! 提供引擎配置、单轮生成配置以及 YAML / TOML 配置文件加载。

mod loader;
mod types;

pub use loader::{
    default_config_path, expand_tilde, load_config, load_or_default, save_config, validate,
    ConfigError,
};
pub use types::{EngineConfig, LlmConfig, LoggingConfig, StreamSettings, TurnConfig};
