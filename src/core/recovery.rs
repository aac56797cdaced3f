//! 错误恢复引擎
//!
//! 把驱动错误与页面分类映射为 TaskError，再把 TaskError 映射为 FailureAction，
//! 编排器按结果决定是换代理重试还是直接进入 FAILED。

use crate::core::anomaly::AnomalyKind;
use crate::core::error::{FailureAction, TaskError};
use crate::driver::DriverError;

/// 语义化错误分类：驱动错误 → 任务错误 → 处置动作
#[derive(Debug, Default, Clone, Copy)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    /// 只有可重试错误会重试；凭据、异常页面、输入错误都直接终止
    pub fn decide(&self, err: &TaskError) -> FailureAction {
        match err {
            TaskError::Retryable { .. } => FailureAction::Retry,
            TaskError::AuthenticationFailure { .. }
            | TaskError::AnomalyDetected { .. }
            | TaskError::InvalidInput { .. }
            | TaskError::RetriesExhausted { .. }
            | TaskError::SessionPersistence { .. } => FailureAction::Abort,
        }
    }

    /// 交互失败：文案命中凭据拒绝模式时为 AuthenticationFailure，否则可重试
    pub fn classify_interaction(&self, err: &DriverError, rejection_patterns: &[String]) -> TaskError {
        let message = err.to_string();
        if matches_rejection(&message, rejection_patterns) {
            return TaskError::authentication(message);
        }
        TaskError::retryable(message)
    }

    /// 页面分类 → 错误；Normal 表示页面看起来正常但没等到预期元素
    pub fn classify_page(&self, kind: AnomalyKind, cause: String, artifact: Option<String>) -> TaskError {
        match kind {
            AnomalyKind::Challenge | AnomalyKind::Blocked => TaskError::AnomalyDetected { kind, artifact },
            AnomalyKind::RateLimited => TaskError::retryable_with(cause, AnomalyKind::RateLimited),
            AnomalyKind::Normal | AnomalyKind::UnknownUiState => {
                TaskError::retryable_with(cause, AnomalyKind::UnknownUiState)
            }
        }
    }

    /// 该错误是否应计入代理失败（凭据与输入问题与代理无关）
    pub fn blames_proxy(&self, err: &TaskError) -> bool {
        !matches!(
            err,
            TaskError::AuthenticationFailure { .. } | TaskError::InvalidInput { .. }
        )
    }
}

/// 大小写不敏感的子串匹配
pub fn matches_rejection(text: &str, patterns: &[String]) -> bool {
    let text = text.to_lowercase();
    patterns
        .iter()
        .filter(|p| !p.is_empty())
        .any(|p| text.contains(&p.to_lowercase()))
}
