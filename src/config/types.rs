//! 配置类型定义
//!
//! 引擎配置在启动时加载一次；每轮生成使用的 [`TurnConfig`] 在发起请求时
//! 解析完成，之后只读传递给各个组件。

use serde::{Deserialize, Serialize};
use std::time::Duration;

// ============================================================================
// 引擎配置
// ============================================================================

/// 引擎配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// LLM 流式接口地址
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// 访问密码
    ///
    /// 设置后通过 `x-access-password` 请求头发送，且不再向服务端转发 API Key。
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_password: Option<String>,

    /// 组装请求时保留的历史消息条数
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// 续写上下文中保留的完整结构单元数
    #[serde(default = "default_continuation_units")]
    pub continuation_units: usize,

    /// 流式传输配置
    #[serde(default)]
    pub stream: StreamSettings,

    /// 日志配置
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_endpoint() -> String {
    "http://localhost:3000/api/llm/stream".to_string()
}

fn default_history_limit() -> usize {
    3
}

fn default_continuation_units() -> usize {
    3
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            access_password: None,
            history_limit: default_history_limit(),
            continuation_units: default_continuation_units(),
            stream: StreamSettings::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl EngineConfig {
    /// 创建默认配置
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置接口地址
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// 设置访问密码
    pub fn with_access_password(mut self, password: impl Into<String>) -> Self {
        self.access_password = Some(password.into());
        self
    }

    /// 设置历史消息条数
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    /// 设置续写上下文单元数
    pub fn with_continuation_units(mut self, units: usize) -> Self {
        self.continuation_units = units;
        self
    }

    /// 设置流式传输配置
    pub fn with_stream(mut self, stream: StreamSettings) -> Self {
        self.stream = stream;
        self
    }

    /// 是否启用访问密码模式
    pub fn password_mode(&self) -> bool {
        self.access_password
            .as_deref()
            .map(|p| !p.is_empty())
            .unwrap_or(false)
    }
}

// ============================================================================
// 流式传输配置
// ============================================================================

/// 流式传输配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSettings {
    /// 未完成帧的最大缓冲大小（字节）
    #[serde(default = "default_max_buffer_size")]
    pub max_buffer_size: usize,

    /// 两个 chunk 之间的最大等待时间（毫秒）
    #[serde(default = "default_chunk_timeout_ms")]
    pub chunk_timeout_ms: u64,

    /// 建立请求的超时时间（毫秒）
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_max_buffer_size() -> usize {
    1024 * 1024 // 1MB
}

fn default_chunk_timeout_ms() -> u64 {
    30_000 // 30 秒
}

fn default_request_timeout_ms() -> u64 {
    300_000 // 5 分钟
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            max_buffer_size: default_max_buffer_size(),
            chunk_timeout_ms: default_chunk_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl StreamSettings {
    /// chunk 超时
    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_millis(self.chunk_timeout_ms)
    }

    /// 请求超时
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

// ============================================================================
// 日志配置
// ============================================================================

/// 日志配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// 默认日志级别（`RUST_LOG` 优先）
    #[serde(default = "default_log_level")]
    pub level: String,

    /// 是否输出 ANSI 颜色
    #[serde(default = "default_ansi")]
    pub ansi: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_ansi() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            ansi: default_ansi(),
        }
    }
}

// ============================================================================
// LLM 配置
// ============================================================================

/// LLM 配置
///
/// 原样随请求体发送给流式接口，字段使用 camelCase。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmConfig {
    /// Provider 类型（如 `openai`、`anthropic`）
    #[serde(rename = "type")]
    pub provider_type: String,

    /// API 基础地址
    pub base_url: String,

    /// 模型名称
    pub model: String,

    /// API Key
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_key: String,
}

impl LlmConfig {
    /// 创建 LLM 配置
    pub fn new(
        provider_type: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            provider_type: provider_type.into(),
            base_url: base_url.into(),
            model: model.into(),
            api_key: String::new(),
        }
    }

    /// 设置 API Key
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = api_key.into();
        self
    }

    /// 本地配置模式下是否可用（需要 API Key）
    pub fn is_valid(&self) -> bool {
        self.is_valid_for(false)
    }

    /// 检查配置是否可用
    ///
    /// 访问密码模式下 API Key 由服务端注入，可以为空。
    pub fn is_valid_for(&self, password_mode: bool) -> bool {
        let base = !self.provider_type.trim().is_empty()
            && !self.base_url.trim().is_empty()
            && !self.model.trim().is_empty();
        base && (password_mode || !self.api_key.trim().is_empty())
    }

    /// 生成随请求发送的配置
    ///
    /// 访问密码模式下不传播 API Key。
    pub fn for_request(&self, password_mode: bool) -> LlmConfig {
        let mut config = self.clone();
        if password_mode {
            config.api_key.clear();
        }
        config
    }
}

// ============================================================================
// 单轮配置
// ============================================================================

/// 单轮生成配置
///
/// 发起请求时解析一次，之后在整轮生成中只读传递。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnConfig {
    /// LLM 配置
    pub llm: LlmConfig,

    /// 图表类型（如 `auto`、`flowchart`）
    #[serde(default = "default_chart_type")]
    pub chart_type: String,

    /// 覆盖默认系统提示词（来自当前激活的提示词模板）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt_override: Option<String>,
}

fn default_chart_type() -> String {
    "auto".to_string()
}

impl TurnConfig {
    /// 创建单轮配置
    pub fn new(llm: LlmConfig) -> Self {
        Self {
            llm,
            chart_type: default_chart_type(),
            system_prompt_override: None,
        }
    }

    /// 设置图表类型
    pub fn with_chart_type(mut self, chart_type: impl Into<String>) -> Self {
        self.chart_type = chart_type.into();
        self
    }

    /// 设置系统提示词覆盖
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt_override = Some(prompt.into());
        self
    }

    /// 本轮生效的系统提示词
    ///
    /// 模板覆盖非空时优先，否则使用方言默认提示词。
    pub fn system_prompt<'a>(&'a self, default_prompt: &'a str) -> &'a str {
        match self.system_prompt_override.as_deref() {
            Some(prompt) if !prompt.trim().is_empty() => prompt,
            _ => default_prompt,
        }
    }
}
