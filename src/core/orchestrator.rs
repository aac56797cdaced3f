//! 任务编排器：带重试的状态机
//!
//! INIT → SESSION_RESTORE → NAVIGATE → ANOMALY_CHECK → INTERACT → POLL_COMPLETION → SUCCESS / FAILED。
//! 每次尝试：恢复会话、选代理、打开驱动会话，按 TaskSpec 执行步骤；
//! 可重试失败经 RETRY_WAIT 退避后换代理重建会话，致命失败立即终止。
//! 所有驱动调用都带超时，超时即可重试失败；结果统一汇总为 TaskResult。

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::anomaly::{AnomalyDetector, AnomalyKind};
use crate::core::backoff::BackoffPolicy;
use crate::core::error::{FailureAction, TaskError};
use crate::core::observer::{RunObserver, TracingObserver};
use crate::core::poll::poll_with_timeout;
use crate::core::proxy_pool::{ProxyEntry, ProxyPool};
use crate::core::recovery::{matches_rejection, RecoveryEngine};
use crate::core::session_store::{SessionState, SessionStore};
use crate::core::state::TaskPhase;
use crate::driver::{DriverError, ElementDescriptor, PageDriver, PageSession, BODY};
use crate::tasks::{CompletionSignal, LoginFlow, OnTimeout, PollStep, Step, TaskSpec};

/// 单次尝试的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    RetryableFailure,
    FatalFailure,
}

/// 一次尝试的记录；FatalFailure 永远是最后一条
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptRecord {
    pub attempt_number: u32,
    /// 使用的代理地址，None 为直连
    pub proxy: Option<String>,
    pub outcome: AttemptOutcome,
    pub classification: Option<AnomalyKind>,
    pub cause: Option<String>,
    /// 失败发生时所处阶段
    pub failed_in: Option<TaskPhase>,
    pub timestamp: DateTime<Utc>,
}

/// 一次 run 的最终结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskResult {
    pub succeeded: bool,
    pub payload: BTreeMap<String, String>,
    pub attempts: Vec<AttemptRecord>,
    pub terminal_error: Option<TaskError>,
}

impl TaskResult {
    pub fn last_attempt(&self) -> Option<&AttemptRecord> {
        self.attempts.last()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.payload.get(key).map(String::as_str)
    }

    /// 成功时取 payload，失败时取终止错误
    pub fn into_result(self) -> Result<BTreeMap<String, String>, TaskError> {
        match (self.succeeded, self.terminal_error) {
            (true, _) => Ok(self.payload),
            (false, Some(err)) => Err(err),
            (false, None) => Err(TaskError::retryable("task failed without error")),
        }
    }
}

/// 编排器配置（TaskSpec 可覆盖次数与退避）
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    /// 页面加载超时
    pub navigation_timeout: Duration,
    /// 元素等待超时（Wait 未指定时）
    pub element_timeout: Duration,
    /// fill / click 等单次动作的超时
    pub action_timeout: Duration,
    /// 完成信号轮询间隔与总预算（PollStep 未指定时）
    pub poll_interval: Duration,
    pub poll_budget: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffPolicy::default(),
            navigation_timeout: Duration::from_secs(45),
            element_timeout: Duration::from_secs(15),
            action_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(5),
            poll_budget: Duration::from_secs(300),
        }
    }
}

/// 驱动侧等待的额外宽限：驱动自身的超时应先于外层超时触发
const TIMEOUT_GRACE: Duration = Duration::from_secs(5);

/// 一次尝试的运行上下文
struct Attempt<'a> {
    task: &'a str,
    number: u32,
    session: &'a dyn PageSession,
    /// 只在执行登录步骤时非空
    rejection_patterns: &'a [String],
    payload: BTreeMap<String, String>,
    phase: TaskPhase,
}

/// 任务编排器；可被多个并发 run 共享（仅 ProxyPool 有共享可变状态）
pub struct TaskOrchestrator {
    driver: Arc<dyn PageDriver>,
    proxies: Arc<ProxyPool>,
    sessions: Arc<dyn SessionStore>,
    detector: AnomalyDetector,
    recovery: RecoveryEngine,
    observer: Arc<dyn RunObserver>,
    config: OrchestratorConfig,
}

impl TaskOrchestrator {
    pub fn new(
        driver: Arc<dyn PageDriver>,
        proxies: Arc<ProxyPool>,
        sessions: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            driver,
            proxies,
            sessions,
            detector: AnomalyDetector::default(),
            recovery: RecoveryEngine::new(),
            observer: Arc::new(TracingObserver),
            config: OrchestratorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_detector(mut self, detector: AnomalyDetector) -> Self {
        self.detector = detector;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// 执行任务直到 SUCCESS 或 FAILED；不会 panic，也不会无限等待
    pub async fn run(&self, spec: &TaskSpec) -> TaskResult {
        let task = spec.name.as_str();
        let max_attempts = spec.max_attempts.unwrap_or(self.config.max_attempts).max(1);
        let backoff = spec.backoff.unwrap_or(self.config.backoff);
        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut last_cause = String::new();

        self.observer.on_phase(task, 0, TaskPhase::Init);

        for number in 1..=max_attempts {
            self.observer.on_phase(task, number, TaskPhase::SessionRestore);
            let restored = match &spec.session_slot {
                Some(slot) => self.sessions.load(slot).await,
                None => None,
            };
            let proxy = self.proxies.choose();
            let proxy_addr = proxy.as_ref().map(|p| p.address.clone());

            let outcome = self.attempt(spec, number, proxy.as_ref(), restored.as_ref()).await;

            match outcome {
                Ok(payload) => {
                    if let Some(addr) = &proxy_addr {
                        self.proxies.report_outcome(addr, true);
                    }
                    let record = AttemptRecord {
                        attempt_number: number,
                        proxy: proxy_addr,
                        outcome: AttemptOutcome::Success,
                        classification: None,
                        cause: None,
                        failed_in: None,
                        timestamp: Utc::now(),
                    };
                    self.observer.on_attempt(task, &record);
                    attempts.push(record);
                    self.observer.on_phase(task, number, TaskPhase::Success);
                    let result = TaskResult {
                        succeeded: true,
                        payload,
                        attempts,
                        terminal_error: None,
                    };
                    self.observer.on_terminal(task, &result);
                    return result;
                }
                Err((phase, err)) => {
                    if self.recovery.blames_proxy(&err) {
                        if let Some(addr) = &proxy_addr {
                            self.proxies.report_outcome(addr, false);
                        }
                    }
                    let action = self.recovery.decide(&err);
                    let record = AttemptRecord {
                        attempt_number: number,
                        proxy: proxy_addr,
                        outcome: match action {
                            FailureAction::Retry => AttemptOutcome::RetryableFailure,
                            FailureAction::Abort => AttemptOutcome::FatalFailure,
                        },
                        classification: err.classification(),
                        cause: Some(err.to_string()),
                        failed_in: Some(phase),
                        timestamp: Utc::now(),
                    };
                    self.observer.on_attempt(task, &record);
                    attempts.push(record);

                    match action {
                        FailureAction::Abort => return self.fail(task, number, attempts, err),
                        FailureAction::Retry => {
                            last_cause = match err {
                                TaskError::Retryable { cause, .. } => cause,
                                other => other.to_string(),
                            };
                            if number < max_attempts {
                                self.observer.on_phase(task, number, TaskPhase::RetryWait);
                                tokio::time::sleep(backoff.delay_for(number)).await;
                            }
                        }
                    }
                }
            }
        }

        let err = TaskError::RetriesExhausted {
            attempts: max_attempts,
            last_cause,
        };
        self.fail(task, max_attempts, attempts, err)
    }

    fn fail(&self, task: &str, number: u32, attempts: Vec<AttemptRecord>, err: TaskError) -> TaskResult {
        self.observer.on_phase(task, number, TaskPhase::Failed);
        let result = TaskResult {
            succeeded: false,
            payload: BTreeMap::new(),
            attempts,
            terminal_error: Some(err),
        };
        self.observer.on_terminal(task, &result);
        result
    }

    /// 一次完整尝试：打开会话、执行、成功时保存会话，最后总是关闭会话
    async fn attempt(
        &self,
        spec: &TaskSpec,
        number: u32,
        proxy: Option<&ProxyEntry>,
        restored: Option<&SessionState>,
    ) -> Result<BTreeMap<String, String>, (TaskPhase, TaskError)> {
        let session = within(self.config.navigation_timeout, "open session", self.driver.open(proxy, restored))
            .await
            .map_err(|e| (TaskPhase::SessionRestore, TaskError::retryable(e.to_string())))?;

        let mut run = Attempt {
            task: &spec.name,
            number,
            session: session.as_ref(),
            rejection_patterns: &[],
            payload: BTreeMap::new(),
            phase: TaskPhase::SessionRestore,
        };

        let result = self.drive(spec, &mut run).await;
        if result.is_ok() && spec.persist_session {
            if let Some(slot) = &spec.session_slot {
                if let Some(location) = self.persist(&run, slot).await {
                    run.payload.insert("session".to_string(), location);
                }
            }
        }

        if tokio::time::timeout(self.config.action_timeout, session.close()).await.is_err() {
            tracing::debug!(task = %spec.name, attempt = number, "session close timed out");
        }
        result.map(|()| run.payload).map_err(|err| (run.phase, err))
    }

    async fn drive<'a>(&self, spec: &'a TaskSpec, run: &mut Attempt<'a>) -> Result<(), TaskError> {
        if let Some(login) = &spec.login {
            self.login(login, run).await?;
        }
        for step in &spec.steps {
            self.step(step, run).await?;
        }
        Ok(())
    }

    fn enter(&self, run: &mut Attempt<'_>, phase: TaskPhase) {
        if run.phase != phase {
            run.phase = phase;
            self.observer.on_phase(run.task, run.number, phase);
        }
    }

    async fn step(&self, step: &Step, run: &mut Attempt<'_>) -> Result<(), TaskError> {
        match step {
            Step::Navigate(template) => {
                let url = template.render(&run.payload)?;
                self.navigate(run, &url).await
            }
            Step::Wait {
                target,
                timeout,
                required,
            } => {
                self.enter(run, TaskPhase::Interact);
                let timeout = timeout.unwrap_or(self.config.element_timeout);
                let waited = within(
                    timeout + TIMEOUT_GRACE,
                    target.name,
                    run.session.wait_for_signal(*target, timeout),
                )
                .await;
                match waited {
                    Ok(_) => Ok(()),
                    Err(_) if !required => Ok(()),
                    Err(e) => Err(self.diagnose(run, e.to_string()).await),
                }
            }
            Step::Fill {
                field,
                value,
                required,
            } => {
                self.enter(run, TaskPhase::Interact);
                let done = within(self.config.action_timeout, field.name, run.session.fill(*field, value)).await;
                match done {
                    Err(_) if !required => Ok(()),
                    other => other.map_err(|e| self.recovery.classify_interaction(&e, run.rejection_patterns)),
                }
            }
            Step::Click(control) => {
                self.enter(run, TaskPhase::Interact);
                let done = within(self.config.action_timeout, control.name, run.session.click(*control)).await;
                done.map_err(|e| self.recovery.classify_interaction(&e, run.rejection_patterns))
            }
            Step::AttachFile { field, path } => {
                self.enter(run, TaskPhase::Interact);
                let done = within(
                    self.config.action_timeout,
                    field.name,
                    run.session.attach_file(*field, path),
                )
                .await;
                done.map_err(|e| self.recovery.classify_interaction(&e, run.rejection_patterns))
            }
            Step::Submit { control, field } => {
                self.enter(run, TaskPhase::Interact);
                self.submit(run, *control, *field).await
            }
            Step::Capture {
                key,
                target,
                attribute,
                required,
            } => {
                let value = within(
                    self.config.action_timeout,
                    target.name,
                    run.session.extract_attribute(*target, attribute),
                )
                .await
                .map_err(|e| self.recovery.classify_interaction(&e, run.rejection_patterns))?;
                match value {
                    Some(v) => {
                        run.payload.insert((*key).to_string(), v);
                        Ok(())
                    }
                    None if !required => Ok(()),
                    None => Err(self.diagnose(run, format!("{target} has no {attribute}")).await),
                }
            }
            Step::Poll(poll) => self.poll(run, poll).await,
        }
    }

    /// 导航后立即做异常检查
    async fn navigate(&self, run: &mut Attempt<'_>, url: &str) -> Result<(), TaskError> {
        self.enter(run, TaskPhase::Navigate);
        let timeout = self.config.navigation_timeout;
        within(timeout + TIMEOUT_GRACE, url, run.session.navigate(url, timeout))
            .await
            .map_err(|e| TaskError::retryable(e.to_string()))?;
        self.anomaly_check(run).await
    }

    async fn anomaly_check(&self, run: &mut Attempt<'_>) -> Result<(), TaskError> {
        self.enter(run, TaskPhase::AnomalyCheck);
        let timeout = self.config.element_timeout;
        let signals = within(timeout + TIMEOUT_GRACE, BODY.name, run.session.wait_for_signal(BODY, timeout))
            .await
            .map_err(|e| TaskError::retryable_with(e.to_string(), AnomalyKind::UnknownUiState))?;
        match self.detector.classify(&signals) {
            AnomalyKind::Normal => Ok(()),
            kind => {
                let artifact = if kind.is_fatal() {
                    self.artifact(run, kind).await
                } else {
                    None
                };
                Err(self.recovery.classify_page(kind, format!("{kind} page detected"), artifact))
            }
        }
    }

    /// 等待超时后的第二道防线：重新采集页面信号并分类
    async fn diagnose(&self, run: &mut Attempt<'_>, cause: String) -> TaskError {
        let signals = within(
            self.config.element_timeout,
            BODY.name,
            run.session.wait_for_signal(BODY, Duration::from_secs(2)),
        )
        .await;
        let kind = signals
            .map(|s| self.detector.classify(&s))
            .unwrap_or(AnomalyKind::UnknownUiState);
        let artifact = if kind.is_fatal() {
            self.artifact(run, kind).await
        } else {
            None
        };
        self.recovery.classify_page(kind, cause, artifact)
    }

    /// 诊断截图：`<task>_<reason>_<unix>`；失败时不带产物
    async fn artifact(&self, run: &Attempt<'_>, kind: AnomalyKind) -> Option<String> {
        let label = format!("{}_{}_{}", run.task, kind, Utc::now().timestamp());
        within(self.config.action_timeout, "screenshot", run.session.screenshot(&label))
            .await
            .ok()
            .map(|p| p.display().to_string())
    }

    async fn submit(
        &self,
        run: &mut Attempt<'_>,
        control: ElementDescriptor,
        field: ElementDescriptor,
    ) -> Result<(), TaskError> {
        let clicked = within(self.config.action_timeout, control.name, run.session.click(control)).await;
        let pressed = match clicked {
            Ok(()) => return Ok(()),
            Err(DriverError::ElementNotFound(_)) => {
                within(self.config.action_timeout, field.name, run.session.press_key(field, "Enter")).await
            }
            Err(e) => Err(e),
        };
        pressed.map_err(|e| self.recovery.classify_interaction(&e, run.rejection_patterns))
    }

    async fn login<'a>(&self, login: &'a LoginFlow, run: &mut Attempt<'a>) -> Result<(), TaskError> {
        self.navigate(run, &login.url).await?;

        self.enter(run, TaskPhase::Interact);
        let present = within(
            login.presence_timeout + TIMEOUT_GRACE,
            login.authenticated.name,
            run.session.wait_for_signal(login.authenticated, login.presence_timeout),
        )
        .await;
        if present.is_ok() {
            return Ok(());
        }

        // 凭据错误的提示只在登录步骤里有意义
        run.rejection_patterns = login.rejection_patterns.as_slice();
        let mut entered: Result<(), TaskError> = Ok(());
        for step in &login.steps {
            entered = self.step(step, run).await;
            if entered.is_err() {
                break;
            }
        }
        run.rejection_patterns = &[];
        entered?;

        let confirmed = within(
            login.confirm_timeout + TIMEOUT_GRACE,
            login.authenticated.name,
            run.session.wait_for_signal(login.authenticated, login.confirm_timeout),
        )
        .await;
        match confirmed {
            Ok(_) => Ok(()),
            Err(e) => {
                let body = within(
                    self.config.element_timeout,
                    BODY.name,
                    run.session.wait_for_signal(BODY, Duration::from_secs(2)),
                )
                .await
                .map(|s| s.body_text)
                .unwrap_or_default();
                if matches_rejection(&body, &login.rejection_patterns) {
                    return Err(TaskError::authentication("Login rejected: credentials incorrect or invalid"));
                }
                Err(self.diagnose(run, format!("login not confirmed: {e}")).await)
            }
        }
    }

    async fn poll(&self, run: &mut Attempt<'_>, poll: &PollStep) -> Result<(), TaskError> {
        self.enter(run, TaskPhase::PollCompletion);
        let interval = poll.interval.unwrap_or(self.config.poll_interval);
        let budget = poll.budget.unwrap_or(self.config.poll_budget);
        let session = run.session;
        let action_timeout = self.config.action_timeout;

        let found = poll_with_timeout(interval, budget, || read_signals(session, &poll.signals, action_timeout)).await;
        let value = match found {
            Ok(value) => Some(value),
            Err(timed_out) => match poll.on_timeout {
                OnTimeout::Fallback(signal) => read_signals(session, &[signal], action_timeout).await,
                OnTimeout::Fail => {
                    return Err(self.diagnose(run, timed_out.to_string()).await);
                }
            },
        };
        match value {
            Some(v) => {
                run.payload.insert(poll.key.to_string(), v);
                Ok(())
            }
            None => Err(self.diagnose(run, format!("no completion signal for {}", poll.key)).await),
        }
    }

    async fn persist(&self, run: &Attempt<'_>, slot: &str) -> Option<String> {
        let exported = within(self.config.action_timeout, "export session", run.session.export_session(slot))
            .await
            .map_err(|e| e.to_string());
        let saved = match exported {
            Ok(state) => self.sessions.save(slot, &state).await.map_err(|e| e.to_string()),
            Err(e) => Err(e),
        };
        match saved {
            Ok(location) => Some(location),
            Err(message) => {
                let err = TaskError::SessionPersistence { message };
                self.observer.on_session_not_saved(run.task, &err);
                None
            }
        }
    }
}

/// 依次读取各信号，第一个满足条件的值即为结果；读取错误视为尚未出现
async fn read_signals(
    session: &dyn PageSession,
    signals: &[CompletionSignal],
    limit: Duration,
) -> Option<String> {
    for signal in signals {
        let read = within(limit, signal.target.name, session.extract_attribute(signal.target, signal.attribute)).await;
        if let Ok(Some(value)) = read {
            if signal.accepts(&value) {
                return Some(value);
            }
        }
    }
    None
}

/// 给驱动调用加外层超时
async fn within<T>(
    limit: Duration,
    what: &str,
    fut: impl Future<Output = Result<T, DriverError>>,
) -> Result<T, DriverError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(DriverError::Timeout(format!("{what} after {limit:?}"))),
    }
}
