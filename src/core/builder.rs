//! 自动化构建器：统一的初始化逻辑
//!
//! HTTP 服务与 CLI 共用同一套装配：驱动工厂、进程级代理池、会话存储，以及三个任务入口。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::core::orchestrator::TaskOrchestrator;
use crate::core::proxy_pool::ProxyPool;
use crate::core::session_store::{FileSessionStore, SessionStore};
use crate::driver::{DriverError, DriverProvider, HttpPageDriver, PageDriver};
use crate::tasks::{ContentGenerator, SocialUploader, TrendScout};

/// 按配置创建真实驱动
#[derive(Debug, Clone)]
pub struct DefaultDriverProvider {
    artifact_dir: PathBuf,
    http_timeout: Duration,
    #[cfg_attr(not(feature = "browser"), allow(dead_code))]
    idle_timeout: Duration,
}

impl DefaultDriverProvider {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            artifact_dir: config.app.artifact_dir.clone(),
            http_timeout: Duration::from_secs(config.browser.http_timeout_secs),
            idle_timeout: Duration::from_secs(config.browser.idle_timeout_secs),
        }
    }
}

impl DriverProvider for DefaultDriverProvider {
    #[cfg(feature = "browser")]
    fn browser(&self, headless: bool) -> Result<Arc<dyn PageDriver>, DriverError> {
        let driver = crate::driver::ChromeDriver::new(headless, self.artifact_dir.clone())
            .with_idle_timeout(self.idle_timeout);
        Ok(Arc::new(driver))
    }

    #[cfg(not(feature = "browser"))]
    fn browser(&self, _headless: bool) -> Result<Arc<dyn PageDriver>, DriverError> {
        Err(DriverError::Unavailable(
            "browser automation requires the `browser` feature".to_string(),
        ))
    }

    fn http(&self) -> Arc<dyn PageDriver> {
        Arc::new(HttpPageDriver::new(self.http_timeout, self.artifact_dir.clone()))
    }
}

/// 自动化构建器：持有配置、驱动工厂与共享代理池
pub struct AutomationBuilder {
    config: AppConfig,
    drivers: Arc<dyn DriverProvider>,
    proxies: Arc<ProxyPool>,
    sessions: Arc<dyn SessionStore>,
    social_sessions: Arc<dyn SessionStore>,
}

impl AutomationBuilder {
    pub fn new(config: AppConfig) -> Self {
        let drivers = Arc::new(DefaultDriverProvider::from_config(&config));
        let proxies = Arc::new(ProxyPool::new(
            config.proxies.list.iter().cloned(),
            config.proxies.pool_config(),
        ));
        let sessions = Arc::new(FileSessionStore::new(&config.app.session_dir));
        let social_sessions = Arc::new(FileSessionStore::new(&config.social.download_dir));
        Self {
            config,
            drivers,
            proxies,
            sessions,
            social_sessions,
        }
    }

    /// 替换驱动工厂（测试用脚本化驱动）
    pub fn with_drivers(mut self, drivers: Arc<dyn DriverProvider>) -> Self {
        self.drivers = drivers;
        self
    }

    /// 替换会话存储（任务与上传共用）
    pub fn with_sessions(mut self, sessions: Arc<dyn SessionStore>) -> Self {
        self.sessions = Arc::clone(&sessions);
        self.social_sessions = sessions;
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// 进程级共享代理池
    pub fn shared_proxies(&self) -> Arc<ProxyPool> {
        Arc::clone(&self.proxies)
    }

    /// 请求自带代理列表时使用一次性代理池，否则用共享池
    pub fn proxies_for(&self, csv: Option<&str>) -> Arc<ProxyPool> {
        match csv.map(str::trim).filter(|s| !s.is_empty()) {
            Some(csv) => Arc::new(ProxyPool::from_csv(csv, self.config.proxies.pool_config())),
            None => self.shared_proxies(),
        }
    }

    fn orchestrator(
        &self,
        driver: Arc<dyn PageDriver>,
        proxies: Arc<ProxyPool>,
        sessions: Arc<dyn SessionStore>,
    ) -> Arc<TaskOrchestrator> {
        let config = self.config.browser.orchestrator();
        Arc::new(TaskOrchestrator::new(driver, proxies, sessions).with_config(config))
    }

    pub fn trend_scout(&self, proxies: Arc<ProxyPool>) -> TrendScout {
        let orchestrator = self.orchestrator(self.drivers.http(), proxies, Arc::clone(&self.sessions));
        TrendScout::new(orchestrator, (&self.config.trends).into())
    }

    /// headless 为 None 时用配置值
    pub fn content_generator(
        &self,
        proxies: Arc<ProxyPool>,
        headless: Option<bool>,
    ) -> Result<ContentGenerator, DriverError> {
        let driver = self.drivers.browser(headless.unwrap_or(self.config.browser.headless))?;
        let orchestrator = self.orchestrator(driver, proxies, Arc::clone(&self.sessions));
        Ok(ContentGenerator::new(orchestrator, (&self.config.grok).into()))
    }

    pub fn social_uploader(
        &self,
        proxies: Arc<ProxyPool>,
        headless: Option<bool>,
    ) -> Result<SocialUploader, DriverError> {
        let driver = self.drivers.browser(headless.unwrap_or(self.config.browser.headless))?;
        let orchestrator = self.orchestrator(driver, proxies, Arc::clone(&self.social_sessions));
        Ok(SocialUploader::new(orchestrator, (&self.config.social).into()))
    }
}

/// 便捷函数：加载配置并创建构建器；配置出错时退回默认值
pub fn create_automation_builder(config_path: Option<PathBuf>) -> AutomationBuilder {
    let config = crate::config::load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });
    AutomationBuilder::new(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_proxies_override_shared_pool() {
        let mut config = AppConfig::default();
        config.proxies.list = vec!["http://shared:8080".to_string()];
        let builder = AutomationBuilder::new(config);

        let shared = builder.proxies_for(None);
        assert!(Arc::ptr_eq(&shared, &builder.shared_proxies()));
        assert!(Arc::ptr_eq(&builder.proxies_for(Some("  ")), &shared));

        let local = builder.proxies_for(Some("http://a:1, http://b:2"));
        assert!(!Arc::ptr_eq(&local, &shared));
        assert_eq!(local.len(), 2);
    }

    #[cfg(not(feature = "browser"))]
    #[test]
    fn test_browser_unavailable_without_feature() {
        let builder = AutomationBuilder::new(AppConfig::default());
        let err = builder.content_generator(builder.shared_proxies(), None).err().unwrap();
        assert!(matches!(err, DriverError::Unavailable(_)));
    }
}
