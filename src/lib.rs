//! Smart Diagram 生成引擎
//!
//! 消费 LLM 的增量 SSE 输出，实时累积内容，并在生成结束后将可能被截断、
//! 转义错误或结构损坏的文本修复为可渲染的 draw.io XML / Excalidraw JSON。
//! 当生成因长度限制被截断时，构建续写上下文并拼接续写结果。
//!
//! # 模块
//!
//! - `streaming`: SSE 帧解码、内容累积、流式指标
//! - `markup`: 代码提取、结构修复、续写上下文
//! - `engine`: 单轮对话的生成编排状态机
//! - `providers`: LLM 流式请求客户端
//! - `config`: 引擎配置
//! - `models`: 对话消息模型
//! - `telemetry`: 日志初始化

pub mod config;
pub mod engine;
pub mod markup;
pub mod models;
pub mod providers;
pub mod streaming;
pub mod telemetry;

pub use config::{EngineConfig, LlmConfig, TurnConfig};
pub use engine::{
    CanvasApplier, DiagramEngine, EngineError, HistoryStore, InMemoryHistory, PromptBuilder,
    TurnOutcome, TurnState,
};
pub use markup::{
    build_context, extract, repair, ContinuationContext, Dialect, ExtractedPayload,
    RepairedPayload,
};
pub use providers::HttpLlmClient;
pub use streaming::{ContentAccumulator, LlmClient, SseFrameDecoder, StreamError, StreamEvent};
pub use telemetry::init_logging;
