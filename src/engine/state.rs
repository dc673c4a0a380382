//! 单轮生成状态机
//!
//! ```text
//! Idle → Requesting → Streaming → Finalizing → Applied
//!           │             │            │
//!           └─────────────┴────────────┴──→ Failed
//! ```
//!
//! `Applied` / `Failed` 之后可以开始下一轮（含续写），新建或恢复对话回到 `Idle`。

use serde::{Deserialize, Serialize};
use std::fmt;

/// 生成状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    /// 空闲
    #[default]
    Idle,
    /// 请求已发出，等待响应
    Requesting,
    /// 正在接收流式内容
    Streaming,
    /// 流已结束，正在提取与修复
    Finalizing,
    /// 结果已应用到画布
    Applied,
    /// 本轮失败
    Failed,
}

impl TurnState {
    /// 是否处于一轮生成之中
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            TurnState::Requesting | TurnState::Streaming | TurnState::Finalizing
        )
    }

    /// 是否为一轮的终止状态
    pub fn is_terminal(&self) -> bool {
        matches!(self, TurnState::Applied | TurnState::Failed)
    }

    /// 是否允许转换到 `next`
    pub fn can_transition_to(&self, next: TurnState) -> bool {
        use TurnState::*;
        match (self, next) {
            // 新建 / 恢复对话
            (from, Idle) => !from.is_in_flight(),
            (Idle | Applied | Failed, Requesting) => true,
            (Requesting, Streaming) => true,
            (Streaming, Finalizing) => true,
            (Finalizing, Applied) => true,
            (Requesting | Streaming | Finalizing, Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TurnState::Idle => "idle",
            TurnState::Requesting => "requesting",
            TurnState::Streaming => "streaming",
            TurnState::Finalizing => "finalizing",
            TurnState::Applied => "applied",
            TurnState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [TurnState; 6] = [
        TurnState::Idle,
        TurnState::Requesting,
        TurnState::Streaming,
        TurnState::Finalizing,
        TurnState::Applied,
        TurnState::Failed,
    ];

    #[test]
    fn test_happy_path() {
        let path = [
            TurnState::Idle,
            TurnState::Requesting,
            TurnState::Streaming,
            TurnState::Finalizing,
            TurnState::Applied,
            TurnState::Requesting,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_failed_reachable_from_every_in_flight_state() {
        for state in ALL {
            assert_eq!(
                state.can_transition_to(TurnState::Failed),
                state.is_in_flight(),
                "{}",
                state
            );
        }
    }

    #[test]
    fn test_no_skipping_states() {
        assert!(!TurnState::Idle.can_transition_to(TurnState::Streaming));
        assert!(!TurnState::Requesting.can_transition_to(TurnState::Applied));
        assert!(!TurnState::Streaming.can_transition_to(TurnState::Applied));
        assert!(!TurnState::Streaming.can_transition_to(TurnState::Requesting));
        assert!(!TurnState::Streaming.can_transition_to(TurnState::Idle));
    }

    #[test]
    fn test_terminal_states() {
        assert!(TurnState::Applied.is_terminal());
        assert!(TurnState::Failed.is_terminal());
        assert!(!TurnState::Idle.is_terminal());
        assert_eq!(TurnState::default(), TurnState::Idle);
        assert_eq!(serde_json::to_string(&TurnState::Finalizing).unwrap(), "\"finalizing\"");
    }
}
