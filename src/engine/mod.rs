//! 生成编排模块
//!
//! - `orchestrator`: [`DiagramEngine`]，单轮生成与续写的状态机
//! - `state`: 轮次状态
//! - `turn`: 轮次记录与结果
//! - `collaborators`: 画布、历史记录、提示词等外部协作方
//! - `prompts`: 默认提示词
//! - `error`: 引擎错误类型

pub mod collaborators;
pub mod error;
pub mod orchestrator;
pub mod prompts;
pub mod state;
pub mod turn;

pub use collaborators::{
    CanvasApplier, HistoryEntry, HistoryStore, InMemoryHistory, PromptBuilder, StoredConversation,
};
pub use error::EngineError;
pub use orchestrator::{DiagramEngine, PreviewListener};
pub use prompts::DefaultPrompts;
pub use state::TurnState;
pub use turn::{ConversationTurn, TurnKind, TurnOutcome};
