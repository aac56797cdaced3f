//! 任务错误类型与处置动作
//!
//! 与 RecoveryEngine 配合：根据 TaskError 决定 Retry / Abort；编排器只看这里的标签，不靠捕获不同异常类型分流。

use serde::Serialize;
use thiserror::Error;

use crate::core::anomaly::AnomalyKind;

/// 一次任务运行中可能出现的错误（网络、元素缺失、超时、凭据、异常页面等）
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskError {
    /// 网络错误、元素未找到、超时、限流：换代理重试可能成功
    #[error("Retryable failure: {cause}")]
    Retryable {
        cause: String,
        classification: Option<AnomalyKind>,
    },

    /// 凭据被拒：同样的凭据重试不会成功
    #[error("Authentication failure: {message}")]
    AuthenticationFailure { message: String },

    /// 人机验证 / 封禁；artifact 为诊断截图路径
    #[error("Anomaly detected ({kind}){}", artifact_suffix(.artifact))]
    AnomalyDetected {
        kind: AnomalyKind,
        artifact: Option<String>,
    },

    /// 重试次数耗尽，包装最后一次可重试原因
    #[error("Retries exhausted after {attempts} attempts. Last error: {last_cause}")]
    RetriesExhausted { attempts: u32, last_cause: String },

    /// 会话持久化失败：只记录日志，不影响任务成败
    #[error("Session persistence failure: {message}")]
    SessionPersistence { message: String },

    /// 输入无效（如视频文件不存在），无需尝试
    #[error("Invalid input: {message}")]
    InvalidInput { message: String },
}

fn artifact_suffix(artifact: &Option<String>) -> String {
    match artifact {
        Some(path) => format!(". Screenshot saved: {path}"),
        None => String::new(),
    }
}

impl TaskError {
    pub fn retryable(cause: impl Into<String>) -> Self {
        Self::Retryable {
            cause: cause.into(),
            classification: None,
        }
    }

    pub fn retryable_with(cause: impl Into<String>, classification: AnomalyKind) -> Self {
        Self::Retryable {
            cause: cause.into(),
            classification: Some(classification),
        }
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::AuthenticationFailure {
            message: message.into(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. })
    }

    /// 该错误附带的页面分类（写入 AttemptRecord）
    pub fn classification(&self) -> Option<AnomalyKind> {
        match self {
            Self::Retryable { classification, .. } => *classification,
            Self::AnomalyDetected { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

/// 恢复引擎根据错误给出的处置动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// 退避后换代理重新进入 SESSION_RESTORE
    Retry,
    /// 进入 FAILED
    Abort,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_anomaly_with_artifact() {
        let err = TaskError::AnomalyDetected {
            kind: AnomalyKind::Challenge,
            artifact: Some("/tmp/a.png".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "Anomaly detected (challenge). Screenshot saved: /tmp/a.png"
        );
    }

    #[test]
    fn test_classification() {
        let err = TaskError::retryable_with("429", AnomalyKind::RateLimited);
        assert_eq!(err.classification(), Some(AnomalyKind::RateLimited));
        assert!(err.is_retryable());
        assert_eq!(TaskError::authentication("x").classification(), None);
    }

    #[test]
    fn test_serialize_tagged() {
        let err = TaskError::RetriesExhausted {
            attempts: 3,
            last_cause: "timeout".into(),
        };
        let v = serde_json::to_value(&err).unwrap();
        assert_eq!(v["type"], "retries_exhausted");
        assert_eq!(v["attempts"], 3);
    }
}
