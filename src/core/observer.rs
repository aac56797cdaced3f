//! 运行观察者：引擎通过注入的接口上报尝试与终态，而不是直接写全局日志
//!
//! 默认实现 TracingObserver 把事件转成结构化 tracing 日志；测试可注入记录型观察者。

use crate::core::error::TaskError;
use crate::core::orchestrator::{AttemptOutcome, AttemptRecord, TaskResult};
use crate::core::state::TaskPhase;

/// 观察者接口
pub trait RunObserver: Send + Sync {
    /// 状态机迁移（默认忽略）
    fn on_phase(&self, _task: &str, _attempt: u32, _phase: TaskPhase) {}

    /// 每次尝试结束（成功或失败）后调用一次
    fn on_attempt(&self, task: &str, record: &AttemptRecord);

    /// 运行进入 SUCCESS / FAILED 时调用一次
    fn on_terminal(&self, task: &str, result: &TaskResult);

    /// 成功后保存会话失败（不影响成败判定）
    fn on_session_not_saved(&self, _task: &str, _error: &TaskError) {}
}

/// 结构化日志观察者
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl RunObserver for TracingObserver {
    fn on_phase(&self, task: &str, attempt: u32, phase: TaskPhase) {
        tracing::debug!(task, attempt, phase = %phase, "phase");
    }

    fn on_attempt(&self, task: &str, record: &AttemptRecord) {
        let proxy = record.proxy.as_deref().unwrap_or("direct");
        let classification = record.classification.map(|c| c.to_string());
        match record.outcome {
            AttemptOutcome::Success => tracing::info!(
                task,
                attempt = record.attempt_number,
                proxy,
                "attempt succeeded"
            ),
            AttemptOutcome::RetryableFailure => tracing::warn!(
                task,
                attempt = record.attempt_number,
                proxy,
                classification = ?classification,
                cause = record.cause.as_deref().unwrap_or(""),
                "attempt failed, will retry if budget allows"
            ),
            AttemptOutcome::FatalFailure => tracing::error!(
                task,
                attempt = record.attempt_number,
                proxy,
                classification = ?classification,
                cause = record.cause.as_deref().unwrap_or(""),
                "attempt failed fatally"
            ),
        }
    }

    fn on_terminal(&self, task: &str, result: &TaskResult) {
        if result.succeeded {
            tracing::info!(task, attempts = result.attempts.len(), "task succeeded");
        } else {
            let error = result
                .terminal_error
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_default();
            tracing::error!(task, attempts = result.attempts.len(), error = %error, "task failed");
        }
    }

    fn on_session_not_saved(&self, task: &str, error: &TaskError) {
        tracing::warn!(task, error = %error, "session state not persisted");
    }
}
