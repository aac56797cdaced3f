//! 状态定义：任务状态机的阶段
//!
//! INIT → SESSION_RESTORE → NAVIGATE → ANOMALY_CHECK → INTERACT → POLL_COMPLETION → SUCCESS / FAILED，
//! 可重试失败经 RETRY_WAIT 回到 SESSION_RESTORE（重新选代理、重建会话）。

use std::fmt;

use serde::Serialize;

/// 任务阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPhase {
    Init,
    SessionRestore,
    Navigate,
    AnomalyCheck,
    Interact,
    PollCompletion,
    RetryWait,
    Success,
    Failed,
}

impl TaskPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

impl fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Init => "INIT",
            Self::SessionRestore => "SESSION_RESTORE",
            Self::Navigate => "NAVIGATE",
            Self::AnomalyCheck => "ANOMALY_CHECK",
            Self::Interact => "INTERACT",
            Self::PollCompletion => "POLL_COMPLETION",
            Self::RetryWait => "RETRY_WAIT",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}
