//! 出口代理池：记录每个代理的连续失败次数与封禁截止时间
//!
//! - choose：池为空返回 None（直连）；否则在未封禁代理中均匀随机选一个；全部封禁时退化为封禁最早到期的那个
//! - report_outcome：成功清零并解封；连续失败达到阈值后按退避策略设置冷却期
//!
//! 内部用互斥锁保护，可被多个并发任务共享（Arc<ProxyPool>）。

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;

use crate::core::backoff::BackoffPolicy;

/// 代理条目
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEntry {
    pub address: String,
    pub consecutive_failures: u32,
    pub banned_until: Option<DateTime<Utc>>,
}

impl ProxyEntry {
    fn new(address: String) -> Self {
        Self {
            address,
            consecutive_failures: 0,
            banned_until: None,
        }
    }

    pub fn is_banned_at(&self, now: DateTime<Utc>) -> bool {
        self.banned_until.is_some_and(|until| until > now)
    }
}

/// 代理池配置
#[derive(Debug, Clone, Copy)]
pub struct ProxyPoolConfig {
    /// 连续失败达到该次数即封禁
    pub failure_threshold: u32,
    /// 冷却期退避，按「超过阈值的失败次数」取值
    pub cooldown: BackoffPolicy,
}

impl Default for ProxyPoolConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: BackoffPolicy::from_secs(30, 600),
        }
    }
}

/// 并发安全的代理池
#[derive(Debug)]
pub struct ProxyPool {
    entries: Mutex<Vec<ProxyEntry>>,
    config: ProxyPoolConfig,
}

impl ProxyPool {
    /// 空白与重复地址会被忽略
    pub fn new<I, S>(addresses: I, config: ProxyPoolConfig) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut entries: Vec<ProxyEntry> = Vec::new();
        for addr in addresses {
            let addr = addr.as_ref().trim();
            if addr.is_empty() || entries.iter().any(|e| e.address == addr) {
                continue;
            }
            entries.push(ProxyEntry::new(addr.to_string()));
        }
        Self {
            entries: Mutex::new(entries),
            config: ProxyPoolConfig {
                failure_threshold: config.failure_threshold.max(1),
                ..config
            },
        }
    }

    /// 从逗号分隔的列表构建（HTTP 参数 / 环境变量格式）
    pub fn from_csv(csv: &str, config: ProxyPoolConfig) -> Self {
        Self::new(csv.split(','), config)
    }

    pub fn direct() -> Self {
        Self::new(Vec::<String>::new(), ProxyPoolConfig::default())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// 当前所有条目的快照
    pub fn snapshot(&self) -> Vec<ProxyEntry> {
        self.lock().clone()
    }

    pub fn choose(&self) -> Option<ProxyEntry> {
        self.choose_at(Utc::now())
    }

    pub fn choose_at(&self, now: DateTime<Utc>) -> Option<ProxyEntry> {
        let entries = self.lock();
        if entries.is_empty() {
            return None;
        }

        let live: Vec<&ProxyEntry> = entries.iter().filter(|e| !e.is_banned_at(now)).collect();
        if let Some(picked) = live.choose(&mut rand::thread_rng()) {
            return Some((*picked).clone());
        }

        // 全部封禁：选最早解封的，软降级而非直接失败
        entries
            .iter()
            .min_by_key(|e| e.banned_until)
            .cloned()
    }

    pub fn report_outcome(&self, address: &str, succeeded: bool) {
        self.report_outcome_at(address, succeeded, Utc::now());
    }

    pub fn report_outcome_at(&self, address: &str, succeeded: bool, now: DateTime<Utc>) {
        let mut entries = self.lock();
        let Some(entry) = entries.iter_mut().find(|e| e.address == address) else {
            return;
        };

        if succeeded {
            entry.consecutive_failures = 0;
            entry.banned_until = None;
            return;
        }

        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
        let threshold = self.config.failure_threshold;
        if entry.consecutive_failures >= threshold {
            let cooldown = self.config.cooldown.delay_for(entry.consecutive_failures);
            let cooldown = chrono::Duration::from_std(cooldown)
                .unwrap_or_else(|_| chrono::Duration::seconds(600));
            entry.banned_until = Some(now + cooldown);
            tracing::warn!(
                proxy = %entry.address,
                failures = entry.consecutive_failures,
                cooldown_secs = cooldown.num_seconds(),
                "proxy banned"
            );
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ProxyEntry>> {
        // 锁中毒时数据仍然一致（只有计数与时间戳），直接取回
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn pool(addrs: &[&str]) -> ProxyPool {
        ProxyPool::new(addrs.iter().copied(), ProxyPoolConfig::default())
    }

    #[test]
    fn test_empty_pool_means_direct() {
        assert!(pool(&[]).choose().is_none());
        assert!(ProxyPool::from_csv(" , ,", ProxyPoolConfig::default()).choose().is_none());
    }

    #[test]
    fn test_banned_entry_not_chosen_while_live_exists() {
        let p = pool(&["http://a:1", "http://b:2"]);
        let now = Utc::now();
        for _ in 0..3 {
            p.report_outcome_at("http://a:1", false, now);
        }
        for _ in 0..200 {
            let picked = p.choose_at(now).unwrap();
            assert_eq!(picked.address, "http://b:2");
        }
    }

    #[test]
    fn test_below_threshold_not_banned() {
        let p = pool(&["http://a:1"]);
        let now = Utc::now();
        p.report_outcome_at("http://a:1", false, now);
        p.report_outcome_at("http://a:1", false, now);
        let entry = &p.snapshot()[0];
        assert_eq!(entry.consecutive_failures, 2);
        assert!(entry.banned_until.is_none());
    }

    #[test]
    fn test_success_resets() {
        let p = pool(&["http://a:1"]);
        let now = Utc::now();
        for _ in 0..4 {
            p.report_outcome_at("http://a:1", false, now);
        }
        assert!(p.snapshot()[0].banned_until.is_some());
        p.report_outcome_at("http://a:1", true, now);
        let entry = &p.snapshot()[0];
        assert_eq!(entry.consecutive_failures, 0);
        assert!(entry.banned_until.is_none());
    }

    #[test]
    fn test_ban_lies_in_future_and_grows() {
        let p = pool(&["http://a:1"]);
        let now = Utc::now();
        for _ in 0..3 {
            p.report_outcome_at("http://a:1", false, now);
        }
        // 冷却按连续失败次数取退避：30 * 2^(3-1)
        let first = p.snapshot()[0].banned_until.unwrap();
        assert!(first > now);
        assert_eq!(first - now, chrono::Duration::seconds(120));

        p.report_outcome_at("http://a:1", false, now);
        let second = p.snapshot()[0].banned_until.unwrap();
        assert_eq!(second - now, chrono::Duration::seconds(240));
    }

    #[test]
    fn test_all_banned_returns_earliest() {
        let p = pool(&["http://a:1", "http://b:2"]);
        let t0 = Utc::now();
        // a 先被封禁；b 封禁更久（多一次失败 + 更晚的时间点）
        for _ in 0..3 {
            p.report_outcome_at("http://a:1", false, t0);
        }
        for _ in 0..4 {
            p.report_outcome_at("http://b:2", false, t0 + chrono::Duration::seconds(5));
        }
        let picked = p.choose_at(t0 + chrono::Duration::seconds(6)).unwrap();
        assert_eq!(picked.address, "http://a:1");
    }

    #[test]
    fn test_ban_expires() {
        let p = pool(&["http://a:1", "http://b:2"]);
        let now = Utc::now();
        for _ in 0..3 {
            p.report_outcome_at("http://a:1", false, now);
        }
        let later = now + chrono::Duration::seconds(121);
        let seen: HashSet<String> = (0..200)
            .filter_map(|_| p.choose_at(later))
            .map(|e| e.address)
            .collect();
        assert!(seen.contains("http://a:1"));
    }

    #[test]
    fn test_duplicates_and_unknown_addresses() {
        let p = ProxyPool::from_csv("http://a:1, http://a:1 ,http://b:2", ProxyPoolConfig::default());
        assert_eq!(p.len(), 2);
        p.report_outcome("http://zzz:9", false);
        assert!(p.snapshot().iter().all(|e| e.consecutive_failures == 0));
    }

    #[test]
    fn test_concurrent_reports() {
        let p = std::sync::Arc::new(pool(&["http://a:1", "http://b:2"]));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let p = p.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        if let Some(e) = p.choose() {
                            p.report_outcome(&e.address, false);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let total: u32 = p.snapshot().iter().map(|e| e.consecutive_failures).sum();
        assert_eq!(total, 800);
    }
}
