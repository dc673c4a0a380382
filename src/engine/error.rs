//! 生成引擎错误类型

use crate::streaming::{ErrorKind, StreamError};
use thiserror::Error;

/// 生成引擎错误
#[derive(Debug, Error)]
pub enum EngineError {
    /// 当前引擎已有一轮生成在进行
    #[error("正在生成中，请等待当前生成完成")]
    AlreadyGenerating,

    /// 没有输入文本也没有附件
    #[error("输入内容为空")]
    EmptyInput,

    /// LLM 配置不可用
    #[error("LLM 配置无效: {0}")]
    InvalidConfig(String),

    /// 请求或流式传输失败
    ///
    /// `partial` 为失败前已累积的内容，不会被应用到画布。
    #[error("{source}")]
    Stream {
        #[source]
        source: StreamError,
        partial: String,
    },

    /// 没有被截断的结果可以续写
    #[error("没有需要续写的内容")]
    NothingToContinue,
}

impl EngineError {
    pub(crate) fn stream(source: StreamError, partial: impl Into<String>) -> Self {
        EngineError::Stream {
            source,
            partial: partial.into(),
        }
    }

    /// 失败前已累积的内容
    pub fn partial(&self) -> Option<&str> {
        match self {
            EngineError::Stream { partial, .. } if !partial.is_empty() => Some(partial),
            _ => None,
        }
    }

    /// 底层的流式错误
    pub fn stream_error(&self) -> Option<&StreamError> {
        match self {
            EngineError::Stream { source, .. } => Some(source),
            _ => None,
        }
    }

    /// 传输 / 协议错误分类，调用方错误返回 None
    pub fn kind(&self) -> Option<ErrorKind> {
        self.stream_error().map(StreamError::kind)
    }

    /// 重新发送同一请求是否可能成功，界面据此决定是否提供重试
    pub fn is_retryable(&self) -> bool {
        self.stream_error()
            .map(StreamError::is_retryable)
            .unwrap_or(false)
    }
}
