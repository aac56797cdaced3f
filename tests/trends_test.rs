//! 趋势发现端到端测试（脚本化驱动，虚拟时间）

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use viralgen::core::{MemorySessionStore, PageSignals, ProxyPool, TaskOrchestrator};
    use viralgen::driver::ScriptedDriver;
    use viralgen::tasks::{TrendScout, TrendSettings};

    fn scout(driver: &ScriptedDriver) -> TrendScout {
        let orchestrator = TaskOrchestrator::new(
            Arc::new(driver.clone()),
            Arc::new(ProxyPool::direct()),
            Arc::new(MemorySessionStore::new()),
        );
        TrendScout::new(Arc::new(orchestrator), TrendSettings::default())
    }

    fn seeds() -> Vec<String> {
        vec!["ai".to_string(), "ki revolution".to_string()]
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_network_calls_fail_returns_fallback() {
        let driver = ScriptedDriver::new().failing_opens(u32::MAX);
        let trend = scout(&driver).top_trend(&seeds()).await;
        assert_eq!(trend, "KI Revolution 2026");
        assert_eq!(driver.count("open"), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_everywhere_returns_fallback() {
        let driver = ScriptedDriver::new().page("trends.google.com", PageSignals::default().with_status(429));
        let trend = scout(&driver).top_trend(&seeds()).await;
        assert_eq!(trend, "KI Revolution 2026");
        assert_eq!(driver.count("navigate"), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_seed_does_not_retry() {
        let driver = ScriptedDriver::new().page(
            "trends.google.com",
            PageSignals::from_body("We're sorry... you have been blocked"),
        );
        let trend = scout(&driver).top_trend(&["ai".to_string()]).await;
        assert_eq!(trend, "KI Revolution 2026");
        assert_eq!(driver.count("open"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_seed_list_returns_fallback() {
        let driver = ScriptedDriver::new();
        assert_eq!(scout(&driver).top_trend(&[]).await, "KI Revolution 2026");
        assert_eq!(driver.count("open"), 0);
    }
}
