//! 页面驱动层：编排器消费的浏览器原语能力
//!
//! PageDriver::open 绑定代理（可携带恢复的会话）打开一个 PageSession；
//! 之后所有原语都是 PageSession 上的方法。所有原语失败都返回 DriverError，编排器默认按可重试处理。
//!
//! 实现：
//! - **chrome**：Headless Chrome（feature "browser"）
//! - **http**：面向 JSON / HTML 接口的轻量驱动（reqwest），用于趋势查询
//! - **mock**：脚本化驱动，测试用

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::core::anomaly::PageSignals;
use crate::core::proxy_pool::ProxyEntry;
use crate::core::session_store::SessionState;

pub mod descriptor;
pub mod http;
pub mod mock;

#[cfg(feature = "browser")]
pub mod chrome;

pub use descriptor::{ElementDescriptor, Locator, BODY, PAGE_LOCATION};
pub use http::HttpPageDriver;
pub use mock::ScriptedDriver;

#[cfg(feature = "browser")]
pub use chrome::ChromeDriver;

/// 驱动原语错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("Browser launch failed: {0}")]
    Launch(String),

    #[error("Navigation failed: {0}")]
    Navigation(String),

    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Interaction failed: {0}")]
    Interaction(String),

    #[error("Not supported by this driver: {0}")]
    Unsupported(String),

    /// 驱动不可用（如编译时未启用 browser feature），由调用方直接报错而不是重试
    #[error("Driver unavailable: {0}")]
    Unavailable(String),
}

/// 驱动：负责打开会话
#[async_trait]
pub trait PageDriver: Send + Sync {
    async fn open(
        &self,
        proxy: Option<&ProxyEntry>,
        restored: Option<&SessionState>,
    ) -> Result<Box<dyn PageSession>, DriverError>;
}

/// 一个打开的浏览器会话；同一时刻只属于一次运行
#[async_trait]
pub trait PageSession: Send + Sync {
    async fn navigate(&self, url: &str, timeout: Duration) -> Result<(), DriverError>;

    /// 等待 target 出现，然后采集页面信号（frame、正文、状态码）
    async fn wait_for_signal(
        &self,
        target: ElementDescriptor,
        timeout: Duration,
    ) -> Result<PageSignals, DriverError>;

    async fn fill(&self, field: ElementDescriptor, value: &str) -> Result<(), DriverError>;

    async fn click(&self, control: ElementDescriptor) -> Result<(), DriverError>;

    /// 向文件输入框设置本地文件
    async fn attach_file(&self, field: ElementDescriptor, path: &Path) -> Result<(), DriverError>;

    /// 在元素上按键（如 "Enter"）
    async fn press_key(&self, field: ElementDescriptor, key: &str) -> Result<(), DriverError>;

    /// 元素不存在或属性为空时返回 Ok(None)
    async fn extract_attribute(
        &self,
        target: ElementDescriptor,
        attribute: &str,
    ) -> Result<Option<String>, DriverError>;

    /// 保存诊断产物，返回路径
    async fn screenshot(&self, label: &str) -> Result<PathBuf, DriverError>;

    async fn export_session(&self, slot: &str) -> Result<SessionState, DriverError>;

    async fn close(&self);
}

/// 按需创建驱动（HTTP 层与 CLI 共用，测试可替换为脚本化驱动）
pub trait DriverProvider: Send + Sync {
    /// 浏览器驱动；未编译浏览器支持时返回 Unavailable
    fn browser(&self, headless: bool) -> Result<Arc<dyn PageDriver>, DriverError>;

    /// HTTP 驱动
    fn http(&self) -> Arc<dyn PageDriver>;
}
