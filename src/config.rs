//! 应用配置：从 config/default.toml、可选的配置文件与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `VIRALGEN__*` 覆盖（双下划线表示嵌套，如 `VIRALGEN__GROK__MAX_ATTEMPTS=5`）。
//! 旧的扁平变量（GROK_USERNAME、GROK_PASSWORD、GROK_LOGIN_URL、GROK_IMAGINE_URL、GROK_DOWNLOAD_DIR、
//! SOCIAL_DOWNLOAD_DIR、VIRALGEN_PROXIES）在对应键未设置时作为回退。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::backoff::{BackoffPolicy, BackoffSection};
use crate::core::orchestrator::OrchestratorConfig;
use crate::core::proxy_pool::ProxyPoolConfig;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub browser: BrowserSection,
    pub proxies: ProxiesSection,
    pub trends: TrendsSection,
    pub grok: GrokSection,
    pub social: SocialSection,
}

/// [app] 段：监听地址、诊断产物与会话目录
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub bind_addr: String,
    /// 截图 / 响应原文
    pub artifact_dir: PathBuf,
    /// 未指定槽位路径时的会话文件目录
    pub session_dir: PathBuf,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8000".to_string(),
            artifact_dir: PathBuf::from("artifacts"),
            session_dir: PathBuf::from("sessions"),
        }
    }
}

/// [browser] 段：驱动超时（秒）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrowserSection {
    pub headless: bool,
    pub navigation_timeout_secs: u64,
    pub element_timeout_secs: u64,
    pub action_timeout_secs: u64,
    /// HTTP 驱动单次请求超时
    pub http_timeout_secs: u64,
    /// 浏览器空闲自动退出
    pub idle_timeout_secs: u64,
}

impl Default for BrowserSection {
    fn default() -> Self {
        Self {
            headless: true,
            navigation_timeout_secs: 45,
            element_timeout_secs: 15,
            action_timeout_secs: 30,
            http_timeout_secs: 20,
            idle_timeout_secs: 600,
        }
    }
}

impl BrowserSection {
    /// 编排器默认值；次数、退避与轮询参数由各任务覆盖
    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            navigation_timeout: Duration::from_secs(self.navigation_timeout_secs),
            element_timeout: Duration::from_secs(self.element_timeout_secs),
            action_timeout: Duration::from_secs(self.action_timeout_secs),
            ..OrchestratorConfig::default()
        }
    }
}

/// [proxies] 段：出口代理列表与封禁策略
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxiesSection {
    pub list: Vec<String>,
    pub failure_threshold: u32,
    pub cooldown: BackoffSection,
}

impl Default for ProxiesSection {
    fn default() -> Self {
        Self {
            list: Vec::new(),
            failure_threshold: 3,
            cooldown: BackoffSection {
                base_secs: 30,
                cap_secs: 600,
            },
        }
    }
}

impl ProxiesSection {
    pub fn pool_config(&self) -> ProxyPoolConfig {
        ProxyPoolConfig {
            failure_threshold: self.failure_threshold,
            cooldown: self.cooldown.into(),
        }
    }
}

/// [trends] 段：Google Trends 查询参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrendsSection {
    pub base_url: String,
    pub hl: String,
    /// 时区偏移（分钟）
    pub tz: i32,
    pub geo: String,
    pub timeframe: String,
    pub category: u32,
    /// 全部种子失败时返回
    pub fallback: String,
    pub default_seeds: Vec<String>,
    pub max_attempts: u32,
    pub backoff: BackoffSection,
}

impl Default for TrendsSection {
    fn default() -> Self {
        Self {
            base_url: "https://trends.google.com".to_string(),
            hl: "de-DE".to_string(),
            tz: 360,
            geo: "DE".to_string(),
            timeframe: "now 7-d".to_string(),
            category: 0,
            fallback: "KI Revolution 2026".to_string(),
            default_seeds: vec!["ai".to_string()],
            max_attempts: 5,
            backoff: BackoffSection {
                base_secs: 1,
                cap_secs: 20,
            },
        }
    }
}

/// [grok] 段：登录凭据、页面地址、轮询预算
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GrokSection {
    pub username: Option<String>,
    pub password: Option<String>,
    pub login_url: String,
    pub imagine_url: String,
    pub download_dir: PathBuf,
    pub session_slot: String,
    pub max_attempts: u32,
    pub backoff: BackoffSection,
    pub poll_interval_secs: u64,
    pub poll_budget_secs: u64,
}

impl Default for GrokSection {
    fn default() -> Self {
        Self {
            username: None,
            password: None,
            login_url: "https://grok.com/login".to_string(),
            imagine_url: "https://grok.com/imagine".to_string(),
            download_dir: PathBuf::from("/tmp/grok_downloads"),
            session_slot: "grok".to_string(),
            max_attempts: 3,
            backoff: BackoffSection {
                base_secs: 2,
                cap_secs: 30,
            },
            poll_interval_secs: 5,
            poll_budget_secs: 300,
        }
    }
}

impl GrokSection {
    pub fn backoff(&self) -> BackoffPolicy {
        self.backoff.into()
    }

    /// 用户名与密码都存在时才登录
    pub fn credentials(&self) -> Option<(String, String)> {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) if !u.is_empty() && !p.is_empty() => Some((u.clone(), p.clone())),
            _ => None,
        }
    }
}

/// [social] 段：上传会话目录与发布等待
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SocialSection {
    /// cookies_path 未给出时会话文件所在目录
    pub download_dir: PathBuf,
    /// 重试可能导致重复发布，默认只尝试一次
    pub max_attempts: u32,
    pub backoff: BackoffSection,
    /// 点击发布后等待结果页的时长
    pub post_timeout_secs: u64,
}

impl Default for SocialSection {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("/tmp/social_uploads"),
            max_attempts: 1,
            backoff: BackoffSection {
                base_secs: 2,
                cap_secs: 30,
            },
            post_timeout_secs: 60,
        }
    }
}

/// 按顺序查找默认配置文件，再叠加 config_path 与 VIRALGEN__* 环境变量，最后应用旧变量回退
///
/// 1. config/default.toml、../config/default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 环境变量 VIRALGEN__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default"] {
        let path = format!("{name}.toml");
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        } else {
            tracing::warn!(path = %path.display(), "config file not found, ignoring");
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("VIRALGEN")
            .separator("__")
            .try_parsing(true),
    );

    let mut cfg: AppConfig = builder.build()?.try_deserialize()?;
    apply_legacy_env(&mut cfg, |key| std::env::var(key).ok());
    Ok(cfg)
}

/// 旧变量只填补未设置的键；路径类变量覆盖默认值
fn apply_legacy_env(cfg: &mut AppConfig, var: impl Fn(&str) -> Option<String>) {
    let var = |key: &str| var(key).filter(|v| !v.trim().is_empty());

    if cfg.grok.username.is_none() {
        cfg.grok.username = var("GROK_USERNAME");
    }
    if cfg.grok.password.is_none() {
        cfg.grok.password = var("GROK_PASSWORD");
    }
    let defaults = AppConfig::default();
    if cfg.grok.login_url == defaults.grok.login_url {
        if let Some(url) = var("GROK_LOGIN_URL") {
            cfg.grok.login_url = url;
        }
    }
    if cfg.grok.imagine_url == defaults.grok.imagine_url {
        if let Some(url) = var("GROK_IMAGINE_URL") {
            cfg.grok.imagine_url = url;
        }
    }
    if cfg.grok.download_dir == defaults.grok.download_dir {
        if let Some(dir) = var("GROK_DOWNLOAD_DIR") {
            cfg.grok.download_dir = PathBuf::from(dir);
        }
    }
    if cfg.social.download_dir == defaults.social.download_dir {
        if let Some(dir) = var("SOCIAL_DOWNLOAD_DIR") {
            cfg.social.download_dir = PathBuf::from(dir);
        }
    }
    if cfg.proxies.list.is_empty() {
        if let Some(csv) = var("VIRALGEN_PROXIES") {
            cfg.proxies.list = csv
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
    }
}
