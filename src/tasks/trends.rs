//! 趋势发现：Google Trends 相关查询
//!
//! 每个种子词一个任务，经 HTTP 驱动发三个请求：
//! 首页（拿 cookie）→ explore（拿 RELATED_QUERIES 组件的 token 与 request）→ relatedsearches（排行列表）。
//! 趋势取 top 列表第一项。多个种子并发执行，按输入顺序取第一个有结果的；全部失败返回兜底文案。

use std::sync::Arc;

use futures_util::future::join_all;

use crate::config::TrendsSection;
use crate::core::backoff::BackoffPolicy;
use crate::core::error::TaskError;
use crate::core::orchestrator::TaskOrchestrator;
use crate::driver::{ElementDescriptor, Locator};
use crate::tasks::{Step, TaskSpec, UrlTemplate};

/// explore 响应中相关查询组件的 token
pub const RELATED_TOKEN: ElementDescriptor = ElementDescriptor::new(
    "related queries token",
    &[Locator::JsonPointer("/widgets/[id=RELATED_QUERIES]/token")],
);

/// explore 响应中相关查询组件的请求体（原样回传）
pub const RELATED_REQUEST: ElementDescriptor = ElementDescriptor::new(
    "related queries request",
    &[Locator::JsonPointer("/widgets/[id=RELATED_QUERIES]/request")],
);

/// relatedsearches 响应：rankedList[0] 为 top，[1] 为 rising
pub const TOP_QUERY: ElementDescriptor = ElementDescriptor::new(
    "top related query",
    &[Locator::JsonPointer("/default/rankedList/0/rankedKeyword/0/query")],
);

/// payload 中的趋势键
pub const TREND_KEY: &str = "trend";

/// 趋势查询参数
#[derive(Debug, Clone)]
pub struct TrendSettings {
    pub base_url: String,
    pub hl: String,
    pub tz: i32,
    pub geo: String,
    pub timeframe: String,
    pub category: u32,
    pub fallback: String,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
}

impl Default for TrendSettings {
    fn default() -> Self {
        Self::from(&TrendsSection::default())
    }
}

impl From<&TrendsSection> for TrendSettings {
    fn from(s: &TrendsSection) -> Self {
        Self {
            base_url: s.base_url.trim_end_matches('/').to_string(),
            hl: s.hl.clone(),
            tz: s.tz,
            geo: s.geo.clone(),
            timeframe: s.timeframe.clone(),
            category: s.category,
            fallback: s.fallback.clone(),
            max_attempts: s.max_attempts,
            backoff: s.backoff.into(),
        }
    }
}

/// 趋势侦察：对若干种子词并发查询
pub struct TrendScout {
    orchestrator: Arc<TaskOrchestrator>,
    settings: TrendSettings,
}

impl TrendScout {
    pub fn new(orchestrator: Arc<TaskOrchestrator>, settings: TrendSettings) -> Self {
        Self {
            orchestrator,
            settings,
        }
    }

    pub fn settings(&self) -> &TrendSettings {
        &self.settings
    }

    /// 单个种子词的任务描述
    pub fn spec_for(&self, seed: &str) -> TaskSpec {
        let s = &self.settings;
        let explore_req = serde_json::json!({
            "comparisonItem": [{ "keyword": seed, "time": s.timeframe, "geo": s.geo }],
            "category": s.category,
            "property": "",
        });
        let tz = s.tz.to_string();

        TaskSpec::new("trends")
            .max_attempts(s.max_attempts)
            .backoff(s.backoff)
            .step(Step::Navigate(
                UrlTemplate::new(format!("{}/", s.base_url)).query("geo", s.geo.as_str()),
            ))
            .step(Step::Navigate(
                UrlTemplate::new(format!("{}/trends/api/explore", s.base_url))
                    .query("hl", s.hl.as_str())
                    .query("tz", tz.as_str())
                    .query("req", explore_req.to_string()),
            ))
            .step(Step::Capture {
                key: "token",
                target: RELATED_TOKEN,
                attribute: "value",
                required: true,
            })
            .step(Step::Capture {
                key: "request",
                target: RELATED_REQUEST,
                attribute: "value",
                required: true,
            })
            .step(Step::Navigate(
                UrlTemplate::new(format!("{}/trends/api/widgetdata/relatedsearches", s.base_url))
                    .query("hl", s.hl.as_str())
                    .query("tz", tz.as_str())
                    .query("req", "{request}")
                    .query("token", "{token}"),
            ))
            .step(Step::Capture {
                key: TREND_KEY,
                target: TOP_QUERY,
                attribute: "value",
                required: false,
            })
    }

    /// 单个种子词：Ok(None) 表示请求成功但 top 列表为空
    pub async fn fetch_top(&self, seed: &str) -> Result<Option<String>, TaskError> {
        let result = self.orchestrator.run(&self.spec_for(seed)).await;
        let payload = result.into_result()?;
        Ok(payload.get(TREND_KEY).filter(|t| !t.trim().is_empty()).cloned())
    }

    /// 多个种子词并发查询，按输入顺序取第一个非空结果；全部失败时返回兜底文案，永不报错
    pub async fn top_trend(&self, seeds: &[String]) -> String {
        let seeds: Vec<&str> = seeds
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .collect();

        let results = join_all(seeds.iter().map(|seed| self.fetch_top(seed))).await;

        for (seed, result) in seeds.iter().zip(results) {
            match result {
                Ok(Some(trend)) => {
                    tracing::info!(seed, trend = %trend, "top trend found");
                    return trend;
                }
                Ok(None) => tracing::info!(seed, "no related queries for seed"),
                Err(e) => tracing::warn!(seed, error = %e, "trend lookup failed"),
            }
        }

        tracing::warn!(fallback = %self.settings.fallback, "all seeds failed, using fallback trend");
        self.settings.fallback.clone()
    }
}

/// 逗号分隔的种子词
pub fn parse_seeds(q: &str) -> Vec<String> {
    q.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::core::proxy_pool::ProxyPool;
    use crate::core::session_store::MemorySessionStore;
    use crate::driver::ScriptedDriver;

    fn scout(driver: ScriptedDriver) -> TrendScout {
        let orchestrator = TaskOrchestrator::new(
            Arc::new(driver),
            Arc::new(ProxyPool::direct()),
            Arc::new(MemorySessionStore::new()),
        );
        TrendScout::new(Arc::new(orchestrator), TrendSettings::default())
    }

    #[test]
    fn test_parse_seeds() {
        assert_eq!(parse_seeds(" ai, ,ki revolution,"), vec!["ai", "ki revolution"]);
        assert!(parse_seeds("").is_empty());
    }

    #[test]
    fn test_spec_urls() {
        let scout = scout(ScriptedDriver::new());
        let spec = scout.spec_for("ai");
        assert_eq!(spec.max_attempts, Some(5));
        assert_eq!(spec.backoff, Some(BackoffPolicy::from_secs(1, 20)));
        let Step::Navigate(explore) = &spec.steps[1] else {
            panic!("expected navigate");
        };
        let url = explore.render(&BTreeMap::new()).unwrap();
        assert!(url.starts_with("https://trends.google.com/trends/api/explore?hl=de-DE&tz=360&req="));
        assert!(url.contains("now+7-d"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_top_trend_from_related_queries() {
        let driver = ScriptedDriver::new()
            .attribute("related queries token", "value", "TOKEN1")
            .attribute("related queries request", "value", r#"{"restriction":{}}"#)
            .attribute("top related query", "value", "ki news");
        let scout = scout(driver.clone());
        let trend = scout.top_trend(&["ai".to_string()]).await;
        assert_eq!(trend, "ki news");
        assert!(driver
            .calls()
            .iter()
            .any(|c| c.starts_with("navigate https://trends.google.com/trends/api/widgetdata/relatedsearches") && c.contains("token=TOKEN1")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_top_list_uses_fallback() {
        let driver = ScriptedDriver::new()
            .attribute("related queries token", "value", "T")
            .attribute("related queries request", "value", "{}");
        let scout = scout(driver);
        assert_eq!(scout.top_trend(&["ai".to_string()]).await, "KI Revolution 2026");
    }
}
