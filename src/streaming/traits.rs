//! LlmClient Trait 定义
//!
//! 生成引擎通过该 trait 发起流式请求，具体的 HTTP 实现见
//! [`crate::providers::HttpLlmClient`]，测试中可替换为内存实现。

use crate::config::LlmConfig;
use crate::models::ChatMessage;
use crate::streaming::StreamError;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;

/// 流式响应类型别名
///
/// 返回一个异步字节流，每个 Item 是一个 chunk 的字节数据或错误。
/// chunk 边界与 SSE 帧边界无关。
pub type StreamResponse = Pin<Box<dyn Stream<Item = Result<Bytes, StreamError>> + Send>>;

/// 流式 LLM 客户端
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 发起流式生成请求
    ///
    /// 请求被拒绝（非 2xx）时返回 [`StreamError::Provider`]，
    /// 连接失败时返回 [`StreamError::Network`]。
    ///
    /// ```ignore
    /// use futures::StreamExt;
    ///
    /// let mut stream = client.stream_chat(&config, &messages).await?;
    /// while let Some(chunk) = stream.next().await {
    ///     // 交给 SseFrameDecoder
    /// }
    /// ```
    async fn stream_chat(
        &self,
        config: &LlmConfig,
        messages: &[ChatMessage],
    ) -> Result<StreamResponse, StreamError>;

    /// 客户端名称，用于日志
    fn client_name(&self) -> &'static str;
}

// ============================================================================
// 辅助函数
// ============================================================================

/// 将 reqwest 的 bytes_stream 转换为 StreamResponse
pub fn reqwest_stream_to_stream_response(response: reqwest::Response) -> StreamResponse {
    use futures::StreamExt;

    let stream = response.bytes_stream().map(|result| result.map_err(StreamError::from));

    Box::pin(stream)
}

/// 将内存中的 chunk 列表转换为 StreamResponse
pub fn chunks_to_stream_response<I, B>(chunks: I) -> StreamResponse
where
    I: IntoIterator<Item = B>,
    B: Into<Bytes>,
{
    let items: Vec<Result<Bytes, StreamError>> =
        chunks.into_iter().map(|chunk| Ok(chunk.into())).collect();
    Box::pin(futures::stream::iter(items))
}
