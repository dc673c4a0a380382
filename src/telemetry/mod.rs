//! 日志初始化
//!
//! 安装 `tracing-subscriber` 的 fmt 订阅者。`RUST_LOG` 存在时优先使用，
//! 否则使用配置中的日志级别。

use crate::config::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// 根据配置构建过滤器
pub fn build_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// 初始化全局日志
///
/// 重复调用时保持已安装的订阅者不变，返回 `false`。
pub fn init_logging(config: &LoggingConfig) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(build_filter(config))
        .with_ansi(config.ansi)
        .with_target(true)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_is_idempotent() {
        let config = LoggingConfig {
            level: "debug".to_string(),
            ansi: false,
        };
        let _ = init_logging(&config);
        assert!(!init_logging(&config));
    }

    #[test]
    fn test_build_filter_falls_back_on_bad_level() {
        let config = LoggingConfig {
            level: "smart_diagram_lib=[".to_string(),
            ansi: false,
        };
        // 不应 panic
        let _ = build_filter(&config);
    }
}
