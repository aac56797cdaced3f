//! 通用轮询原语：按固定间隔探测，直到拿到结果或用完总预算
//!
//! 完成信号等待（下载链接 / 视频元素 / 发布后跳转）都走这里，不再各写一份 sleep 循环。

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

/// 预算耗尽
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Poll budget of {budget:?} elapsed after {checks} checks")]
pub struct PollTimedOut {
    pub budget: Duration,
    pub checks: u32,
}

/// 每 interval 调一次 check，返回 Some 即结束；下一次探测会超出 budget 时放弃
///
/// 至少探测一次（即使 budget 为零）。
pub async fn poll_with_timeout<T, F, Fut>(
    interval: Duration,
    budget: Duration,
    mut check: F,
) -> Result<T, PollTimedOut>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let start = Instant::now();
    let interval = interval.max(Duration::from_millis(1));
    let mut checks = 0u32;

    loop {
        checks += 1;
        if let Some(value) = check().await {
            return Ok(value);
        }
        if start.elapsed() + interval > budget {
            return Err(PollTimedOut { budget, checks });
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_returns_when_signal_appears() {
        let calls = AtomicU32::new(0);
        let started = Instant::now();
        let result = poll_with_timeout(Duration::from_secs(5), Duration::from_secs(300), || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move { (n == 4).then_some("https://cdn/x.mp4") }
        })
        .await;
        assert_eq!(result, Ok("https://cdn/x.mp4"));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(started.elapsed(), Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_elapses() {
        let started = Instant::now();
        let result: Result<(), _> =
            poll_with_timeout(Duration::from_secs(5), Duration::from_secs(20), || async { None }).await;
        let err = result.unwrap_err();
        assert_eq!(err.checks, 5);
        assert!(started.elapsed() <= Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_budget_checks_once() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = poll_with_timeout(Duration::from_secs(1), Duration::ZERO, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { None }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
