//! 配置文件加载
//!
//! 支持 YAML（默认）与 TOML 两种格式，按文件扩展名选择解析器。
//! 路径支持 `~` 展开。

use super::types::EngineConfig;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// 默认配置目录名
const CONFIG_DIR_NAME: &str = ".smart-diagram";

/// 默认配置文件名
const CONFIG_FILE_NAME: &str = "config.yaml";

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("读取配置文件失败: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML 解析失败: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML 解析失败: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML 序列化失败: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("配置无效: {0}")]
    Invalid(String),
}

/// 配置文件格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigFormat {
    Yaml,
    Toml,
}

impl ConfigFormat {
    fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("toml") => ConfigFormat::Toml,
            _ => ConfigFormat::Yaml,
        }
    }
}

/// 默认配置文件路径：`~/.smart-diagram/config.yaml`
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(CONFIG_DIR_NAME)
        .join(CONFIG_FILE_NAME)
}

/// 展开路径开头的 `~`
pub fn expand_tilde<P: AsRef<Path>>(path: P) -> PathBuf {
    let path = path.as_ref();
    let Some(home) = dirs::home_dir() else {
        return path.to_path_buf();
    };

    match path.to_str() {
        Some("~") => home,
        Some(s) => match s.strip_prefix("~/") {
            Some(rest) => home.join(rest),
            None => path.to_path_buf(),
        },
        None => path.to_path_buf(),
    }
}

/// 从字符串解析配置
fn parse_config(content: &str, format: ConfigFormat) -> Result<EngineConfig, ConfigError> {
    let config: EngineConfig = match format {
        ConfigFormat::Yaml if content.trim().is_empty() => EngineConfig::default(),
        ConfigFormat::Yaml => serde_yaml::from_str(content)?,
        ConfigFormat::Toml => toml::from_str(content)?,
    };
    validate(&config)?;
    Ok(config)
}

/// 加载配置文件
///
/// 文件不存在时返回 [`ConfigError::Io`]。
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<EngineConfig, ConfigError> {
    let path = expand_tilde(path);
    let content = std::fs::read_to_string(&path)?;
    let config = parse_config(&content, ConfigFormat::from_path(&path))?;
    info!(path = %path.display(), "已加载配置文件");
    Ok(config)
}

/// 加载配置文件，文件不存在时返回默认配置
pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<EngineConfig, ConfigError> {
    let path = expand_tilde(path);
    if !path.exists() {
        debug!(path = %path.display(), "配置文件不存在，使用默认配置");
        return Ok(EngineConfig::default());
    }
    load_config(path)
}

/// 保存配置文件，按扩展名选择格式
pub fn save_config<P: AsRef<Path>>(config: &EngineConfig, path: P) -> Result<(), ConfigError> {
    validate(config)?;
    let path = expand_tilde(path);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let content = match ConfigFormat::from_path(&path) {
        ConfigFormat::Yaml => serde_yaml::to_string(config)?,
        ConfigFormat::Toml => toml::to_string_pretty(config)?,
    };
    std::fs::write(&path, content)?;
    info!(path = %path.display(), "已保存配置文件");
    Ok(())
}

/// 校验配置
pub fn validate(config: &EngineConfig) -> Result<(), ConfigError> {
    let endpoint = url::Url::parse(&config.endpoint)
        .map_err(|e| ConfigError::Invalid(format!("endpoint 无法解析 ({}): {}", config.endpoint, e)))?;
    if !matches!(endpoint.scheme(), "http" | "https") {
        return Err(ConfigError::Invalid(format!(
            "endpoint 仅支持 http/https: {}",
            config.endpoint
        )));
    }
    if config.continuation_units == 0 {
        return Err(ConfigError::Invalid(
            "continuation_units 必须大于 0".to_string(),
        ));
    }
    if config.stream.max_buffer_size == 0 {
        return Err(ConfigError::Invalid(
            "stream.max_buffer_size 必须大于 0".to_string(),
        ));
    }
    if config.stream.chunk_timeout_ms == 0 || config.stream.request_timeout_ms == 0 {
        return Err(ConfigError::Invalid("stream 超时必须大于 0".to_string()));
    }
    Ok(())
}
