//! 流式传输核心模块
//!
//! 将 LLM 流式接口返回的字节流解码为事件，并累积为当前完整内容。
//!
//! # 主要组件
//!
//! - `error`: 流式错误类型定义
//! - `sse_decoder`: SSE 帧解码器
//! - `accumulator`: 累积内容缓冲区
//! - `metrics`: 单轮生成的流式指标
//! - `traits`: LlmClient trait 定义

pub mod accumulator;
pub mod error;
pub mod metrics;
pub mod sse_decoder;
pub mod traits;

// 重新导出核心类型
pub use accumulator::{ContentAccumulator, UpdateListener};
pub use error::{ErrorKind, StreamError};
pub use metrics::StreamMetrics;
pub use sse_decoder::{
    decode_stream, decode_stream_with_metrics, last_content, next_chunk, DecoderState, EventStream, SseFrameDecoder,
    StreamEvent, DONE_SENTINEL,
};
pub use traits::{
    chunks_to_stream_response, reqwest_stream_to_stream_response, LlmClient, StreamResponse,
};
