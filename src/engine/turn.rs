//! 对话轮次记录

use crate::markup::{ExtractedPayload, RepairedPayload};
use crate::streaming::StreamMetrics;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::TurnState;

/// 轮次类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnKind {
    /// 用户发起的生成
    Generate,
    /// 对被截断结果的续写
    Continuation,
}

/// 一轮生成的完整记录
///
/// 由引擎在本轮期间独占；本轮结束后只以快照形式对外提供。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub id: String,
    pub conversation_id: String,
    pub kind: TurnKind,
    /// 本轮的用户输入（续写时为续写提示词）
    pub prompt: String,
    pub state: TurnState,
    /// 累积内容；失败时保留失败前的部分
    pub buffer: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extracted: Option<ExtractedPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repaired: Option<RepairedPayload>,
    /// 修复前缺失的闭合符
    #[serde(default)]
    pub missing_closers: Vec<String>,
    /// 是否被截断（缺少闭合符，或流结束时没有 `[DONE]`）
    pub truncated: bool,
    pub saw_sentinel: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub metrics: StreamMetrics,
    pub started_at: DateTime<Utc>,
}

impl ConversationTurn {
    pub(crate) fn new(conversation_id: &str, kind: TurnKind, prompt: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            kind,
            prompt: prompt.into(),
            state: TurnState::Requesting,
            buffer: String::new(),
            extracted: None,
            repaired: None,
            missing_closers: Vec::new(),
            truncated: false,
            saw_sentinel: false,
            error: None,
            metrics: StreamMetrics::new(),
            started_at: Utc::now(),
        }
    }

    /// 生成结果摘要；本轮未完成时返回 None
    pub fn outcome(&self) -> Option<TurnOutcome> {
        if self.state != TurnState::Applied {
            return None;
        }
        Some(TurnOutcome {
            turn_id: self.id.clone(),
            kind: self.kind,
            extracted: self.extracted.clone()?,
            repaired: self.repaired.clone()?,
            missing_closers: self.missing_closers.clone(),
            truncated: self.truncated,
            metrics: self.metrics.clone(),
        })
    }
}

/// 一轮成功生成的结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnOutcome {
    pub turn_id: String,
    pub kind: TurnKind,
    /// 修复前的提取结果（续写拼接的基础）
    pub extracted: ExtractedPayload,
    /// 已应用到画布的结果
    pub repaired: RepairedPayload,
    pub missing_closers: Vec<String>,
    pub truncated: bool,
    pub metrics: StreamMetrics,
}

impl TurnOutcome {
    /// 是否可以续写
    pub fn needs_continuation(&self) -> bool {
        self.truncated
    }
}
