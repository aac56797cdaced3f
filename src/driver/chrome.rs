//! Headless Chrome 驱动
//!
//! 需启用 feature "browser" 且系统已安装 Chrome/Chromium。
//! headless_chrome 是同步 API，所有调用都放进 spawn_blocking；编排器在外层统一施加超时，
//! 导航与等待同时把超时设为 tab 的默认超时，避免外层超时后阻塞线程继续空等。
//! 每次 open 启动独立的浏览器进程（绑定代理），会话 cookie 通过 CDP 导出与恢复。

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use headless_chrome::protocol::cdp::Network::CookieParam;
use headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption;
use headless_chrome::protocol::cdp::DOM;
use headless_chrome::{Browser, Element, LaunchOptions, Tab};
use serde_json::Value;

use crate::core::anomaly::PageSignals;
use crate::core::proxy_pool::ProxyEntry;
use crate::core::session_store::SessionState;
use crate::driver::{DriverError, ElementDescriptor, Locator, PageDriver, PageSession};

/// 元素轮询间隔
const FIND_INTERVAL: Duration = Duration::from_millis(250);

/// Chrome 驱动配置
#[derive(Debug, Clone)]
pub struct ChromeDriver {
    headless: bool,
    artifact_dir: PathBuf,
    /// 浏览器空闲多久后自动退出
    idle_timeout: Duration,
}

impl ChromeDriver {
    pub fn new(headless: bool, artifact_dir: impl Into<PathBuf>) -> Self {
        Self {
            headless,
            artifact_dir: artifact_dir.into(),
            idle_timeout: Duration::from_secs(600),
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }
}

#[async_trait]
impl PageDriver for ChromeDriver {
    async fn open(
        &self,
        proxy: Option<&ProxyEntry>,
        restored: Option<&SessionState>,
    ) -> Result<Box<dyn PageSession>, DriverError> {
        let headless = self.headless;
        let idle_timeout = self.idle_timeout;
        let proxy = proxy.map(|p| p.address.clone());
        let cookies = restored.and_then(|s| s.blob.get("cookies").cloned());

        tracing::debug!(headless, proxy = ?proxy, restored = cookies.is_some(), "launching chrome");

        let (browser, tab) = tokio::task::spawn_blocking(move || {
            let options = LaunchOptions::default_builder()
                .headless(headless)
                .proxy_server(proxy.as_deref())
                .idle_browser_timeout(idle_timeout)
                .build()
                .map_err(|e| DriverError::Launch(e.to_string()))?;
            let browser = Browser::new(options)
                .map_err(|e| DriverError::Launch(format!("Chrome launch failed: {e}. Install Chrome/Chromium.")))?;
            let tab = browser
                .new_tab()
                .map_err(|e| DriverError::Launch(format!("Browser tab failed: {e}")))?;
            if let Some(cookies) = cookies {
                restore_cookies(&tab, cookies);
            }
            Ok::<_, DriverError>((browser, tab))
        })
        .await
        .map_err(|e| DriverError::Launch(format!("Task join: {e}")))??;

        Ok(Box::new(ChromeSession {
            _browser: browser,
            tab,
            artifact_dir: self.artifact_dir.clone(),
        }))
    }
}

/// 恢复失败只告警：等同于全新会话
fn restore_cookies(tab: &Tab, cookies: Value) {
    let Value::Array(items) = cookies else {
        return;
    };
    let params: Vec<CookieParam> = items
        .into_iter()
        .filter_map(|mut cookie| {
            // 会话 cookie 的 expires 为 -1，带上会被立即判为过期
            if let Some(obj) = cookie.as_object_mut() {
                if obj.get("expires").and_then(Value::as_f64).is_some_and(|e| e <= 0.0) {
                    obj.remove("expires");
                }
            }
            serde_json::from_value(cookie).ok()
        })
        .collect();
    if let Err(e) = tab.set_cookies(params) {
        tracing::warn!(error = %e, "failed to restore browser cookies");
    }
}

struct ChromeSession {
    _browser: Browser,
    tab: Arc<Tab>,
    artifact_dir: PathBuf,
}

impl ChromeSession {
    async fn blocking<T, F>(&self, f: F) -> Result<T, DriverError>
    where
        T: Send + 'static,
        F: FnOnce(&Tab) -> Result<T, DriverError> + Send + 'static,
    {
        let tab = Arc::clone(&self.tab);
        tokio::task::spawn_blocking(move || f(&tab))
            .await
            .map_err(|e| DriverError::Interaction(format!("Task join: {e}")))?
    }
}

/// 按定位方式顺序查找，第一个命中者生效
fn find_first<'a>(tab: &'a Tab, target: &ElementDescriptor) -> Option<Element<'a>> {
    target.locators.iter().find_map(|locator| match locator {
        Locator::Css(selector) => tab.find_element(selector).ok(),
        Locator::XPath(xpath) => tab.find_element_by_xpath(xpath).ok(),
        Locator::Text(text) => tab
            .find_element_by_xpath(&format!("//*[contains(normalize-space(text()), \"{text}\")]"))
            .ok(),
        Locator::JsonPointer(_) | Locator::Location => None,
    })
}

/// 在 timeout 内反复查找
fn wait_for<'a>(
    tab: &'a Tab,
    target: &ElementDescriptor,
    timeout: Duration,
) -> Result<Element<'a>, DriverError> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(element) = find_first(tab, target) {
            return Ok(element);
        }
        if Instant::now() + FIND_INTERVAL > deadline {
            return Err(DriverError::Timeout(format!("{target} after {timeout:?}")));
        }
        std::thread::sleep(FIND_INTERVAL);
    }
}

fn require<'a>(tab: &'a Tab, target: &ElementDescriptor) -> Result<Element<'a>, DriverError> {
    find_first(tab, target).ok_or_else(|| DriverError::ElementNotFound(target.name.to_string()))
}

fn collect_signals(tab: &Tab) -> PageSignals {
    let frame_sources = tab
        .find_elements("iframe")
        .map(|frames| {
            frames
                .iter()
                .filter_map(|f| f.get_attribute_value("src").ok().flatten())
                .collect()
        })
        .unwrap_or_default();
    let body_text = tab
        .find_element("body")
        .and_then(|b| b.get_inner_text())
        .unwrap_or_default();
    PageSignals {
        frame_sources,
        body_text,
        http_status: None,
    }
}

#[async_trait]
impl PageSession for ChromeSession {
    async fn navigate(&self, url: &str, timeout: Duration) -> Result<(), DriverError> {
        tracing::debug!(url = %url, ?timeout, "chrome navigate");
        let url = url.to_string();
        self.blocking(move |tab| {
            tab.set_default_timeout(timeout)
                .navigate_to(&url)
                .and_then(|t| t.wait_until_navigated())
                .map_err(|e| DriverError::Navigation(format!("Navigate failed: {e}")))?;
            Ok(())
        })
        .await
    }

    async fn wait_for_signal(
        &self,
        target: ElementDescriptor,
        timeout: Duration,
    ) -> Result<PageSignals, DriverError> {
        self.blocking(move |tab| {
            tab.set_default_timeout(timeout);
            wait_for(tab, &target, timeout)?;
            Ok(collect_signals(tab))
        })
        .await
    }

    async fn fill(&self, field: ElementDescriptor, value: &str) -> Result<(), DriverError> {
        let value = value.to_string();
        self.blocking(move |tab| {
            let element = require(tab, &field)?;
            element
                .click()
                .and_then(|e| e.type_into(&value))
                .map_err(|e| DriverError::Interaction(format!("Type into {field} failed: {e}")))?;
            Ok(())
        })
        .await
    }

    async fn click(&self, control: ElementDescriptor) -> Result<(), DriverError> {
        self.blocking(move |tab| {
            require(tab, &control)?
                .click()
                .map_err(|e| DriverError::Interaction(format!("Click {control} failed: {e}")))?;
            Ok(())
        })
        .await
    }

    async fn attach_file(&self, field: ElementDescriptor, path: &Path) -> Result<(), DriverError> {
        let file = path.to_string_lossy().into_owned();
        self.blocking(move |tab| {
            let element = require(tab, &field)?;
            tab.call_method(DOM::SetFileInputFiles {
                files: vec![file],
                node_id: None,
                backend_node_id: Some(element.backend_node_id),
                object_id: None,
            })
            .map_err(|e| DriverError::Interaction(format!("Set file on {field} failed: {e}")))?;
            Ok(())
        })
        .await
    }

    async fn press_key(&self, field: ElementDescriptor, key: &str) -> Result<(), DriverError> {
        let key = key.to_string();
        self.blocking(move |tab| {
            require(tab, &field)?
                .focus()
                .map_err(|e| DriverError::Interaction(format!("Focus {field} failed: {e}")))?;
            tab.press_key(&key)
                .map_err(|e| DriverError::Interaction(format!("Press {key} failed: {e}")))?;
            Ok(())
        })
        .await
    }

    async fn extract_attribute(
        &self,
        target: ElementDescriptor,
        attribute: &str,
    ) -> Result<Option<String>, DriverError> {
        let attribute = attribute.to_string();
        self.blocking(move |tab| {
            if target.locators.iter().any(|l| matches!(l, Locator::Location)) {
                return Ok(Some(tab.get_url()));
            }
            let Some(element) = find_first(tab, &target) else {
                return Ok(None);
            };
            let value = element
                .get_attribute_value(&attribute)
                .map_err(|e| DriverError::Interaction(format!("Read {attribute} of {target}: {e}")))?;
            Ok(value.filter(|v| !v.is_empty()))
        })
        .await
    }

    async fn screenshot(&self, label: &str) -> Result<PathBuf, DriverError> {
        let path = self.artifact_dir.join(format!("{label}.png"));
        let dir = self.artifact_dir.clone();
        self.blocking(move |tab| {
            let png = tab
                .capture_screenshot(CaptureScreenshotFormatOption::Png, None, None, true)
                .map_err(|e| DriverError::Interaction(format!("Screenshot failed: {e}")))?;
            std::fs::create_dir_all(&dir)
                .and_then(|_| std::fs::write(&path, png))
                .map_err(|e| DriverError::Interaction(format!("Write screenshot: {e}")))?;
            Ok(path)
        })
        .await
    }

    async fn export_session(&self, slot: &str) -> Result<SessionState, DriverError> {
        let slot = slot.to_string();
        self.blocking(move |tab| {
            let cookies = tab
                .get_cookies()
                .map_err(|e| DriverError::Interaction(format!("Read cookies failed: {e}")))?;
            let cookies = serde_json::to_value(cookies)
                .map_err(|e| DriverError::Interaction(format!("Serialize cookies: {e}")))?;
            let blob = serde_json::json!({ "url": tab.get_url(), "cookies": cookies });
            Ok(SessionState::new(slot, blob))
        })
        .await
    }

    async fn close(&self) {
        let tab = Arc::clone(&self.tab);
        let closed = tokio::task::spawn_blocking(move || tab.close(true)).await;
        if let Ok(Err(e)) = closed {
            tracing::debug!(error = %e, "chrome tab close failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore = "requires a local Chrome/Chromium"]
    async fn test_navigate_honours_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let driver = ChromeDriver::new(true, dir.path());
        let session = driver.open(None, None).await.unwrap();

        // 不可路由地址：连接一直挂起，只能靠超时结束
        let started = Instant::now();
        let result = session.navigate("http://10.255.255.1/", Duration::from_secs(2)).await;
        assert!(matches!(result, Err(DriverError::Navigation(_))));
        assert!(started.elapsed() < Duration::from_secs(10));
        session.close().await;
    }
}
