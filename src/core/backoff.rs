//! 指数退避：delay = min(base * 2^(attempt-1), cap)
//!
//! 纯函数，给定输入结果确定；attempt ≥ 1 时保证返回正数时长。

use std::time::Duration;

use serde::Deserialize;

/// base / cap 的最小值，保证 delay_for 永不为零
const MIN_DELAY: Duration = Duration::from_millis(1);

/// 退避策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base: Duration,
    cap: Duration,
}

impl BackoffPolicy {
    /// cap 小于 base 时以 base 为准
    pub fn new(base: Duration, cap: Duration) -> Self {
        let base = base.max(MIN_DELAY);
        Self {
            base,
            cap: cap.max(base),
        }
    }

    pub fn from_secs(base_secs: u64, cap_secs: u64) -> Self {
        Self::new(Duration::from_secs(base_secs), Duration::from_secs(cap_secs))
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn cap(&self) -> Duration {
        self.cap
    }

    /// 第 attempt 次失败后的等待时长；attempt 为 0 时按 1 处理
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.max(1) - 1;
        let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(self.cap)
            .min(self.cap)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_secs(2, 30)
    }
}

/// 配置文件中的退避段：`{ base_secs = 2, cap_secs = 30 }`
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct BackoffSection {
    pub base_secs: u64,
    pub cap_secs: u64,
}

impl From<BackoffSection> for BackoffPolicy {
    fn from(s: BackoffSection) -> Self {
        Self::from_secs(s.base_secs, s.cap_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubles_until_cap() {
        let p = BackoffPolicy::from_secs(2, 20);
        assert_eq!(p.delay_for(1), Duration::from_secs(2));
        assert_eq!(p.delay_for(2), Duration::from_secs(4));
        assert_eq!(p.delay_for(3), Duration::from_secs(8));
        assert_eq!(p.delay_for(4), Duration::from_secs(16));
        assert_eq!(p.delay_for(5), Duration::from_secs(20));
        assert_eq!(p.delay_for(40), Duration::from_secs(20));
    }

    #[test]
    fn test_monotonic_and_bounded() {
        for (base, cap) in [(1, 20), (2, 30), (1, 1), (3, 7)] {
            let p = BackoffPolicy::from_secs(base, cap);
            for n in 1..80 {
                let a = p.delay_for(n);
                let b = p.delay_for(n + 1);
                assert!(a <= b, "delay_for({n}) > delay_for({})", n + 1);
                assert!(b <= p.cap());
                assert!(a > Duration::ZERO);
                assert_eq!(a, p.delay_for(n));
            }
        }
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let p = BackoffPolicy::from_secs(2, 30);
        assert_eq!(p.delay_for(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_zero_base_is_clamped() {
        let p = BackoffPolicy::new(Duration::ZERO, Duration::ZERO);
        assert!(p.delay_for(1) > Duration::ZERO);
        assert!(p.delay_for(0) > Duration::ZERO);
    }

    #[test]
    fn test_cap_below_base() {
        let p = BackoffPolicy::from_secs(10, 5);
        assert_eq!(p.delay_for(1), Duration::from_secs(10));
        assert_eq!(p.delay_for(3), Duration::from_secs(10));
    }
}
