//! 流式传输错误类型
//!
//! 请求发起与 SSE 解码过程中的错误，按 [`ErrorKind`] 分为两类：
//!
//! - 传输错误：请求被拒绝、连接中断、超时、缓冲区超限
//! - 协议错误：帧 JSON 无法解析，或帧中携带 `error` 字段

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transport,
    Protocol,
}

/// 流式传输错误
///
/// 可序列化，便于随轮次记录一起持久化或发送给界面。
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum StreamError {
    /// 连接失败或连接被重置
    #[error("网络错误: {0}")]
    Network(String),

    /// 等待下一个 chunk 超时
    #[error("流式响应超时")]
    Timeout,

    /// 帧负载不是合法 JSON
    #[error("流式响应解析失败: {0}")]
    ParseError(String),

    /// 上游通过 `error` 帧报告的失败，消息原样展示
    #[error("{0}")]
    Upstream(String),

    /// 流式接口返回非 2xx
    #[error("请求失败 ({status}): {message}")]
    Provider { status: u16, message: String },

    /// 未完成的帧超过缓冲区上限
    #[error("缓冲区溢出")]
    BufferOverflow,

    #[error("内部错误: {0}")]
    Internal(String),
}

impl From<std::io::Error> for StreamError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => StreamError::Timeout,
            _ => StreamError::Network(err.to_string()),
        }
    }
}

impl From<reqwest::Error> for StreamError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return StreamError::Timeout;
        }
        if let Some(status) = err.status() {
            return StreamError::provider(status.as_u16(), err.to_string());
        }
        let detail = if err.is_connect() {
            format!("无法连接到生成服务: {}", err)
        } else if err.is_body() || err.is_decode() {
            format!("读取响应体失败: {}", err)
        } else {
            err.to_string()
        };
        StreamError::Network(detail)
    }
}

impl From<serde_json::Error> for StreamError {
    fn from(err: serde_json::Error) -> Self {
        StreamError::ParseError(err.to_string())
    }
}

impl StreamError {
    pub fn network(msg: impl Into<String>) -> Self {
        StreamError::Network(msg.into())
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        StreamError::ParseError(msg.into())
    }

    pub fn upstream(msg: impl Into<String>) -> Self {
        StreamError::Upstream(msg.into())
    }

    pub fn provider(status: u16, message: impl Into<String>) -> Self {
        StreamError::Provider {
            status,
            message: message.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        StreamError::Internal(msg.into())
    }

    /// 传输 / 协议分类
    pub fn kind(&self) -> ErrorKind {
        if matches!(self, StreamError::ParseError(_) | StreamError::Upstream(_)) {
            ErrorKind::Protocol
        } else {
            ErrorKind::Transport
        }
    }

    /// 是否值得由调用方重新发起
    ///
    /// 协议错误重试也会得到同样的帧；被拒绝的请求只有 429 与 5xx 可重试。
    pub fn is_retryable(&self) -> bool {
        match self {
            StreamError::Network(_) | StreamError::Timeout => true,
            StreamError::Provider { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// HTTP 状态码，仅请求被拒绝时存在
    pub fn status_code(&self) -> Option<u16> {
        match self {
            StreamError::Provider { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// 日志字段使用的稳定错误码
    pub fn code(&self) -> &'static str {
        match self {
            StreamError::Network(_) => "network",
            StreamError::Timeout => "timeout",
            StreamError::ParseError(_) => "parse",
            StreamError::Upstream(_) => "upstream",
            StreamError::Provider { .. } => "provider",
            StreamError::BufferOverflow => "buffer_overflow",
            StreamError::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        assert_eq!(
            StreamError::network("connection reset").to_string(),
            "网络错误: connection reset"
        );
        assert_eq!(
            StreamError::provider(401, "访问密码错误").to_string(),
            "请求失败 (401): 访问密码错误"
        );
        // error 帧的消息直接展示给用户
        assert_eq!(StreamError::upstream("模型过载").to_string(), "模型过载");
        assert_eq!(StreamError::Timeout.to_string(), "流式响应超时");
    }

    #[test]
    fn test_kind_split() {
        for err in [StreamError::parse("{oops"), StreamError::upstream("quota")] {
            assert_eq!(err.kind(), ErrorKind::Protocol, "{}", err.code());
        }
        for err in [
            StreamError::network("x"),
            StreamError::Timeout,
            StreamError::provider(403, "x"),
            StreamError::BufferOverflow,
            StreamError::internal("x"),
        ] {
            assert_eq!(err.kind(), ErrorKind::Transport, "{}", err.code());
        }
    }

    #[test]
    fn test_retry_policy() {
        assert!(StreamError::network("reset").is_retryable());
        assert!(StreamError::Timeout.is_retryable());
        assert!(StreamError::provider(429, "slow down").is_retryable());
        assert!(StreamError::provider(502, "bad gateway").is_retryable());
        assert!(!StreamError::provider(401, "denied").is_retryable());
        assert!(!StreamError::upstream("context too long").is_retryable());
        assert!(!StreamError::BufferOverflow.is_retryable());

        assert_eq!(StreamError::provider(401, "denied").status_code(), Some(401));
        assert_eq!(StreamError::network("reset").status_code(), None);
    }

    #[test]
    fn test_io_error_conversion() {
        let timed_out: StreamError =
            std::io::Error::new(std::io::ErrorKind::TimedOut, "slow").into();
        assert_eq!(timed_out, StreamError::Timeout);

        let reset: StreamError =
            std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset").into();
        assert_eq!(reset.code(), "network");
    }

    #[test]
    fn test_json_error_conversion() {
        let err: StreamError = serde_json::from_str::<serde_json::Value>("{\"content\":")
            .unwrap_err()
            .into();
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert_eq!(err.code(), "parse");
    }

    #[test]
    fn test_wire_format() {
        let value = serde_json::to_value(StreamError::provider(500, "boom")).unwrap();
        assert_eq!(value["kind"], "provider");
        assert_eq!(value["detail"]["status"], 500);

        let back: StreamError = serde_json::from_value(value).unwrap();
        assert_eq!(back, StreamError::provider(500, "boom"));
        assert_eq!(
            serde_json::to_value(StreamError::Timeout).unwrap(),
            serde_json::json!({ "kind": "timeout" })
        );
    }
}
