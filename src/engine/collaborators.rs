//! 引擎依赖的外部协作方
//!
//! - [`CanvasApplier`]：把修复后的标记应用到画布
//! - [`HistoryStore`]：持久化对话消息与当前使用的代码
//! - [`PromptBuilder`]：提供系统 / 用户 / 续写提示词（默认实现见 `prompts`）
//!
//! 画布与历史记录的失败只记录日志，不会中断生成状态机。

use crate::config::LlmConfig;
use crate::markup::{ContinuationContext, Dialect, RepairedPayload};
use crate::models::ChatMessage;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 画布应用
#[async_trait]
pub trait CanvasApplier: Send + Sync {
    /// 应用结构完整的标记文本
    async fn apply(&self, dialect: Dialect, payload: &RepairedPayload) -> Result<(), String>;
}

/// 历史记录条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub conversation_id: String,
    pub message: ChatMessage,
    /// 引擎标签（`drawio` / `excalidraw`）
    pub engine: String,
    /// 请求使用的 LLM 配置（访问密码模式下不含 API Key）
    pub config: LlmConfig,
    pub chart_type: String,
}

/// 对话历史存储
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// 追加一条消息
    async fn add_message(&self, entry: HistoryEntry) -> Result<(), String>;

    /// 更新对话当前使用的代码
    async fn update_used_code(&self, conversation_id: &str, code: &str) -> Result<(), String>;
}

/// 提示词构建
pub trait PromptBuilder: Send + Sync {
    /// 方言默认的系统提示词
    fn system_prompt(&self, dialect: Dialect) -> String;

    /// 把用户输入和图表类型组装为用户提示词
    fn user_prompt(&self, dialect: Dialect, input: &str, chart_type: &str) -> String;

    /// 续写使用的系统提示词
    fn continuation_system_prompt(&self, dialect: Dialect) -> String;

    /// 把续写上下文渲染为续写提示词
    fn continuation_prompt(&self, context: &ContinuationContext) -> String;
}

// ============================================================================
// 内存历史记录
// ============================================================================

/// 内存中的一条对话记录
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredConversation {
    pub entries: Vec<HistoryEntry>,
    pub used_code: String,
    pub updated_at: Option<DateTime<Utc>>,
}

/// 基于内存的历史记录，适用于测试与无持久化场景
#[derive(Debug, Default)]
pub struct InMemoryHistory {
    conversations: RwLock<HashMap<String, StoredConversation>>,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// 对话记录快照
    pub fn conversation(&self, conversation_id: &str) -> Option<StoredConversation> {
        self.conversations.read().get(conversation_id).cloned()
    }

    /// 对话中的消息
    pub fn messages(&self, conversation_id: &str) -> Vec<ChatMessage> {
        self.conversations
            .read()
            .get(conversation_id)
            .map(|c| c.entries.iter().map(|e| e.message.clone()).collect())
            .unwrap_or_default()
    }

    pub fn conversation_count(&self) -> usize {
        self.conversations.read().len()
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistory {
    async fn add_message(&self, entry: HistoryEntry) -> Result<(), String> {
        let mut conversations = self.conversations.write();
        let conversation = conversations.entry(entry.conversation_id.clone()).or_default();
        conversation.entries.push(entry);
        conversation.updated_at = Some(Utc::now());
        Ok(())
    }

    async fn update_used_code(&self, conversation_id: &str, code: &str) -> Result<(), String> {
        let mut conversations = self.conversations.write();
        let conversation = conversations.entry(conversation_id.to_string()).or_default();
        conversation.used_code = code.to_string();
        conversation.updated_at = Some(Utc::now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(conversation_id: &str, text: &str) -> HistoryEntry {
        HistoryEntry {
            conversation_id: conversation_id.to_string(),
            message: ChatMessage::user(text),
            engine: Dialect::Xml.history_tag().to_string(),
            config: LlmConfig::new("openai", "https://api.openai.com/v1", "gpt-4o"),
            chart_type: "auto".to_string(),
        }
    }

    #[tokio::test]
    async fn test_in_memory_history() {
        let history = InMemoryHistory::new();
        history.add_message(entry("a", "one")).await.unwrap();
        history.add_message(entry("a", "two")).await.unwrap();
        history.add_message(entry("b", "three")).await.unwrap();
        history.update_used_code("a", "<mxfile/>").await.unwrap();

        assert_eq!(history.conversation_count(), 2);
        assert_eq!(history.messages("a").len(), 2);
        let stored = history.conversation("a").unwrap();
        assert_eq!(stored.used_code, "<mxfile/>");
        assert!(stored.updated_at.is_some());
        assert!(history.messages("missing").is_empty());
    }

    #[test]
    fn test_history_entry_wire_format() {
        let json = serde_json::to_value(entry("a", "x")).unwrap();
        assert_eq!(json["conversationId"], "a");
        assert_eq!(json["engine"], "drawio");
        assert_eq!(json["chartType"], "auto");
    }
}
