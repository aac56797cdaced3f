//! 核心编排层：错误与恢复、异常检测、代理池、会话存储、退避与轮询、任务状态机

pub mod anomaly;
pub mod backoff;
pub mod builder;
pub mod error;
pub mod observer;
pub mod orchestrator;
pub mod poll;
pub mod proxy_pool;
pub mod recovery;
pub mod session_store;
pub mod state;

pub use anomaly::{AnomalyDetector, AnomalyKind, PageSignals};
pub use backoff::BackoffPolicy;
pub use builder::{create_automation_builder, AutomationBuilder, DefaultDriverProvider};
pub use error::{FailureAction, TaskError};
pub use observer::{RunObserver, TracingObserver};
pub use orchestrator::{AttemptOutcome, AttemptRecord, OrchestratorConfig, TaskOrchestrator, TaskResult};
pub use poll::{poll_with_timeout, PollTimedOut};
pub use proxy_pool::{ProxyEntry, ProxyPool, ProxyPoolConfig};
pub use recovery::RecoveryEngine;
pub use session_store::{FileSessionStore, MemorySessionStore, SessionState, SessionStore};
pub use state::TaskPhase;
