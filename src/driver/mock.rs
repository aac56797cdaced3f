//! 脚本化驱动（用于测试，无需浏览器）
//!
//! 按 URL 片段预置页面信号，按元素名预置缺失元素、属性值与交互失败；
//! 记录每次调用、打开会话时使用的代理和恢复的会话，便于断言编排器行为。

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::core::anomaly::PageSignals;
use crate::core::proxy_pool::ProxyEntry;
use crate::core::session_store::SessionState;
use crate::driver::{DriverError, ElementDescriptor, Locator, PageDriver, PageSession};

struct ScriptedAttribute {
    value: String,
    /// 第几次读取起才出现（模拟轮询）
    visible_from: u32,
}

#[derive(Default)]
struct Script {
    /// (URL 片段, 依次返回的信号；只剩一个时保持不变)
    pages: Vec<(String, VecDeque<PageSignals>)>,
    failing_opens: u32,
    failing_navigations: u32,
    hanging_navigation: bool,
    missing: HashSet<String>,
    attributes: HashMap<(String, String), ScriptedAttribute>,
    reads: HashMap<(String, String), u32>,
    failing_clicks: HashMap<String, String>,
    session_blob: serde_json::Value,
    failing_export: Option<String>,
    hanging_close: bool,
    calls: Vec<String>,
    proxies: Vec<Option<String>>,
    restored: Vec<Option<SessionState>>,
}

impl Script {
    fn signals_for(&mut self, url: &str) -> PageSignals {
        for (fragment, queue) in self.pages.iter_mut() {
            if url.contains(fragment.as_str()) {
                if queue.len() > 1 {
                    if let Some(next) = queue.pop_front() {
                        return next;
                    }
                }
                return queue.front().cloned().unwrap_or_default();
            }
        }
        PageSignals::from_body("ok")
    }
}

fn lock(script: &Mutex<Script>) -> MutexGuard<'_, Script> {
    script.lock().unwrap_or_else(|e| e.into_inner())
}

/// 脚本化驱动；Clone 后共享同一份脚本与调用记录
#[derive(Clone, Default)]
pub struct ScriptedDriver {
    script: Arc<Mutex<Script>>,
}

impl ScriptedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// 导航到包含 url_fragment 的地址后返回 signals
    pub fn page(self, url_fragment: &str, signals: PageSignals) -> Self {
        self.page_sequence(url_fragment, vec![signals])
    }

    /// 每次导航依次返回下一个信号，最后一个保持不变
    pub fn page_sequence(self, url_fragment: &str, signals: Vec<PageSignals>) -> Self {
        lock(&self.script)
            .pages
            .push((url_fragment.to_string(), signals.into_iter().collect()));
        self
    }

    /// 前 n 次 open 失败
    pub fn failing_opens(self, n: u32) -> Self {
        lock(&self.script).failing_opens = n;
        self
    }

    /// 前 n 次导航失败
    pub fn failing_navigations(self, n: u32) -> Self {
        lock(&self.script).failing_navigations = n;
        self
    }

    /// 导航永不返回（由调用方超时）
    pub fn hanging_navigation(self) -> Self {
        lock(&self.script).hanging_navigation = true;
        self
    }

    /// 该元素始终找不到
    pub fn missing(self, element: &str) -> Self {
        lock(&self.script).missing.insert(element.to_string());
        self
    }

    pub fn attribute(self, element: &str, attribute: &str, value: &str) -> Self {
        self.attribute_after(element, attribute, value, 1)
    }

    /// 第 reads 次读取起才返回 value
    pub fn attribute_after(self, element: &str, attribute: &str, value: &str, reads: u32) -> Self {
        lock(&self.script).attributes.insert(
            (element.to_string(), attribute.to_string()),
            ScriptedAttribute {
                value: value.to_string(),
                visible_from: reads.max(1),
            },
        );
        self
    }

    /// 点击该元素时抛出交互错误 message
    pub fn failing_click(self, element: &str, message: &str) -> Self {
        lock(&self.script)
            .failing_clicks
            .insert(element.to_string(), message.to_string());
        self
    }

    /// export_session 返回的内容
    pub fn session_blob(self, blob: serde_json::Value) -> Self {
        lock(&self.script).session_blob = blob;
        self
    }

    /// export_session 抛出交互错误 message
    pub fn failing_export(self, message: &str) -> Self {
        lock(&self.script).failing_export = Some(message.to_string());
        self
    }

    /// close 永不返回
    pub fn hanging_close(self) -> Self {
        lock(&self.script).hanging_close = true;
        self
    }

    /// 全部调用记录，形如 "navigate https://..."、"click post button"
    pub fn calls(&self) -> Vec<String> {
        lock(&self.script).calls.clone()
    }

    /// 以 prefix 开头的调用次数
    pub fn count(&self, prefix: &str) -> usize {
        lock(&self.script)
            .calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    /// 每次 open 使用的代理地址
    pub fn proxies_used(&self) -> Vec<Option<String>> {
        lock(&self.script).proxies.clone()
    }

    /// 每次 open 携带的恢复会话
    pub fn restored_sessions(&self) -> Vec<Option<SessionState>> {
        lock(&self.script).restored.clone()
    }
}

#[async_trait]
impl PageDriver for ScriptedDriver {
    async fn open(
        &self,
        proxy: Option<&ProxyEntry>,
        restored: Option<&SessionState>,
    ) -> Result<Box<dyn PageSession>, DriverError> {
        let mut script = lock(&self.script);
        script.calls.push("open".to_string());
        script.proxies.push(proxy.map(|p| p.address.clone()));
        script.restored.push(restored.cloned());
        if script.failing_opens > 0 {
            script.failing_opens -= 1;
            return Err(DriverError::Launch("scripted launch failure".into()));
        }
        Ok(Box::new(ScriptedSession {
            script: Arc::clone(&self.script),
            location: Mutex::new(String::new()),
            signals: Mutex::new(PageSignals::default()),
        }))
    }
}

struct ScriptedSession {
    script: Arc<Mutex<Script>>,
    location: Mutex<String>,
    signals: Mutex<PageSignals>,
}

impl ScriptedSession {
    fn record(&self, call: String) -> MutexGuard<'_, Script> {
        let mut script = lock(&self.script);
        script.calls.push(call);
        script
    }

    fn require(script: &Script, element: &ElementDescriptor) -> Result<(), DriverError> {
        if script.missing.contains(element.name) {
            return Err(DriverError::ElementNotFound(element.name.to_string()));
        }
        Ok(())
    }

    fn location(&self) -> String {
        self.location
            .lock()
            .map(|l| l.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl PageSession for ScriptedSession {
    async fn navigate(&self, url: &str, _timeout: Duration) -> Result<(), DriverError> {
        let hang = {
            let mut script = self.record(format!("navigate {url}"));
            if script.failing_navigations > 0 {
                script.failing_navigations -= 1;
                return Err(DriverError::Navigation(format!("net::ERR_PROXY_CONNECTION_FAILED at {url}")));
            }
            if !script.hanging_navigation {
                let signals = script.signals_for(url);
                if let Ok(mut current) = self.signals.lock() {
                    *current = signals;
                }
                if let Ok(mut location) = self.location.lock() {
                    *location = url.to_string();
                }
            }
            script.hanging_navigation
        };
        if hang {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn wait_for_signal(
        &self,
        target: ElementDescriptor,
        timeout: Duration,
    ) -> Result<PageSignals, DriverError> {
        let script = self.record(format!("wait {}", target.name));
        if script.missing.contains(target.name) {
            return Err(DriverError::Timeout(format!("{} after {:?}", target.name, timeout)));
        }
        drop(script);
        Ok(self.signals.lock().map(|s| s.clone()).unwrap_or_default())
    }

    async fn fill(&self, field: ElementDescriptor, value: &str) -> Result<(), DriverError> {
        let script = self.record(format!("fill {} {value}", field.name));
        Self::require(&script, &field)
    }

    async fn click(&self, control: ElementDescriptor) -> Result<(), DriverError> {
        let script = self.record(format!("click {}", control.name));
        Self::require(&script, &control)?;
        match script.failing_clicks.get(control.name) {
            Some(message) => Err(DriverError::Interaction(message.clone())),
            None => Ok(()),
        }
    }

    async fn attach_file(&self, field: ElementDescriptor, path: &Path) -> Result<(), DriverError> {
        let script = self.record(format!("attach {} {}", field.name, path.display()));
        Self::require(&script, &field)
    }

    async fn press_key(&self, field: ElementDescriptor, key: &str) -> Result<(), DriverError> {
        let script = self.record(format!("press {} {key}", field.name));
        Self::require(&script, &field)
    }

    async fn extract_attribute(
        &self,
        target: ElementDescriptor,
        attribute: &str,
    ) -> Result<Option<String>, DriverError> {
        let location = self.location();
        let mut script = self.record(format!("extract {} {attribute}", target.name));
        let key = (target.name.to_string(), attribute.to_string());
        let reads = {
            let n = script.reads.entry(key.clone()).or_insert(0);
            *n += 1;
            *n
        };
        if let Some(attr) = script.attributes.get(&key) {
            return Ok((reads >= attr.visible_from).then(|| attr.value.clone()));
        }
        if target.locators.iter().any(|l| matches!(l, Locator::Location)) {
            return Ok(Some(location));
        }
        Ok(None)
    }

    async fn screenshot(&self, label: &str) -> Result<PathBuf, DriverError> {
        drop(self.record(format!("screenshot {label}")));
        Ok(PathBuf::from(format!("artifacts/{label}.png")))
    }

    async fn export_session(&self, slot: &str) -> Result<SessionState, DriverError> {
        let script = self.record(format!("export {slot}"));
        if let Some(message) = &script.failing_export {
            return Err(DriverError::Interaction(message.clone()));
        }
        Ok(SessionState::new(slot, script.session_blob.clone()))
    }

    async fn close(&self) {
        let hang = self.record("close".to_string()).hanging_close;
        if hang {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::descriptor::PAGE_LOCATION;

    const LINK: ElementDescriptor = ElementDescriptor::new("link", &[Locator::Css("a")]);

    #[tokio::test]
    async fn test_page_sequence_advances() {
        let driver = ScriptedDriver::new().page_sequence(
            "example.com",
            vec![PageSignals::from_body("first"), PageSignals::from_body("second")],
        );
        let session = driver.open(None, None).await.unwrap();
        session.navigate("https://example.com/a", Duration::from_secs(1)).await.unwrap();
        let first = session.wait_for_signal(LINK, Duration::from_secs(1)).await.unwrap();
        session.navigate("https://example.com/b", Duration::from_secs(1)).await.unwrap();
        let second = session.wait_for_signal(LINK, Duration::from_secs(1)).await.unwrap();
        session.navigate("https://example.com/c", Duration::from_secs(1)).await.unwrap();
        let third = session.wait_for_signal(LINK, Duration::from_secs(1)).await.unwrap();
        assert_eq!(first.body_text, "first");
        assert_eq!(second.body_text, "second");
        assert_eq!(third.body_text, "second");
    }

    #[tokio::test]
    async fn test_attribute_after_reads() {
        let driver = ScriptedDriver::new().attribute_after("link", "href", "https://cdn/v.mp4", 3);
        let session = driver.open(None, None).await.unwrap();
        assert_eq!(session.extract_attribute(LINK, "href").await.unwrap(), None);
        assert_eq!(session.extract_attribute(LINK, "href").await.unwrap(), None);
        assert_eq!(
            session.extract_attribute(LINK, "href").await.unwrap().as_deref(),
            Some("https://cdn/v.mp4")
        );
    }

    #[tokio::test]
    async fn test_location_and_missing() {
        let driver = ScriptedDriver::new().missing("link");
        let session = driver.open(None, None).await.unwrap();
        session.navigate("https://x.test/video/1", Duration::from_secs(1)).await.unwrap();
        assert_eq!(
            session.extract_attribute(PAGE_LOCATION, "href").await.unwrap().as_deref(),
            Some("https://x.test/video/1")
        );
        assert!(matches!(session.click(LINK).await, Err(DriverError::ElementNotFound(_))));
        assert_eq!(driver.count("click"), 1);
    }

    #[tokio::test]
    async fn test_failing_opens() {
        let driver = ScriptedDriver::new().failing_opens(1);
        assert!(driver.open(None, None).await.is_err());
        assert!(driver.open(None, None).await.is_ok());
        assert_eq!(driver.proxies_used(), vec![None, None]);
    }
}
