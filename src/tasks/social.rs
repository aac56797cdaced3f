//! 社交平台发布：TikTok 与 Instagram Reels
//!
//! 恢复平台会话 → 上传页面 → 选择视频文件 → 填写说明（可选）→ 点击发布 → 取发布后的页面地址。
//! 成功后导出会话，存储位置作为 `cookies` 返回，供下次上传复用。

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::SocialSection;
use crate::core::backoff::BackoffPolicy;
use crate::core::error::TaskError;
use crate::core::orchestrator::TaskOrchestrator;
use crate::driver::{ElementDescriptor, Locator, PAGE_LOCATION};
use crate::tasks::{CompletionSignal, OnTimeout, PollStep, Step, TaskSpec, UrlTemplate};

pub const TIKTOK_UPLOAD_URL: &str = "https://www.tiktok.com/upload?lang=en";
pub const INSTAGRAM_CREATE_URL: &str = "https://www.instagram.com/create/style/";

pub const FILE_INPUT: ElementDescriptor =
    ElementDescriptor::new("file input", &[Locator::Css("input[type=file]")]);

pub const TIKTOK_CAPTION: ElementDescriptor = ElementDescriptor::new(
    "caption field",
    &[Locator::Css("textarea[placeholder*='caption']"), Locator::Css("textarea")],
);

pub const TIKTOK_POST: ElementDescriptor = ElementDescriptor::new(
    "post button",
    &[
        Locator::XPath("//button[contains(., 'Post')]"),
        Locator::XPath("//button[contains(., 'Upload')]"),
    ],
);

pub const INSTAGRAM_CAPTION: ElementDescriptor =
    ElementDescriptor::new("caption field", &[Locator::Css("textarea")]);

pub const INSTAGRAM_SHARE: ElementDescriptor =
    ElementDescriptor::new("share button", &[Locator::XPath("//button[contains(., 'Share')]")]);

pub const REEL_SHARED: ElementDescriptor =
    ElementDescriptor::new("reel shared notice", &[Locator::Text("Your reel was shared")]);

/// payload 中的发布地址键
pub const POST_URL_KEY: &str = "post_url";

/// 支持的平台
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    TikTok,
    Instagram,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TikTok => "tiktok",
            Self::Instagram => "instagram",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unsupported platform: {0}")]
pub struct UnsupportedPlatform(pub String);

impl FromStr for Platform {
    type Err = UnsupportedPlatform;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "tiktok" => Ok(Self::TikTok),
            "instagram" | "ig" | "reel" | "reels" => Ok(Self::Instagram),
            _ => Err(UnsupportedPlatform(s.to_string())),
        }
    }
}

/// 一次上传请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub video_path: PathBuf,
    pub caption: String,
    pub platform: Platform,
    /// 会话槽位（通常是 cookies 文件路径）；None 时用平台名
    pub cookies_path: Option<String>,
}

impl UploadRequest {
    pub fn new(video_path: impl Into<PathBuf>, caption: impl Into<String>, platform: Platform) -> Self {
        Self {
            video_path: video_path.into(),
            caption: caption.into(),
            platform,
            cookies_path: None,
        }
    }

    pub fn with_cookies(mut self, path: impl Into<String>) -> Self {
        self.cookies_path = Some(path.into());
        self
    }

    fn slot(&self) -> String {
        match &self.cookies_path {
            Some(p) if !p.trim().is_empty() => p.clone(),
            _ => self.platform.to_string(),
        }
    }
}

/// 上传结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadOutput {
    pub post_url: String,
    /// 会话保存位置；保存失败时为 None
    pub cookies: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SocialSettings {
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub post_timeout: Duration,
    pub upload_timeout: Duration,
}

impl Default for SocialSettings {
    fn default() -> Self {
        Self::from(&SocialSection::default())
    }
}

impl From<&SocialSection> for SocialSettings {
    fn from(s: &SocialSection) -> Self {
        Self {
            max_attempts: s.max_attempts,
            backoff: s.backoff.into(),
            post_timeout: Duration::from_secs(s.post_timeout_secs),
            upload_timeout: Duration::from_secs(15),
        }
    }
}

pub struct SocialUploader {
    orchestrator: Arc<TaskOrchestrator>,
    settings: SocialSettings,
}

impl SocialUploader {
    pub fn new(orchestrator: Arc<TaskOrchestrator>, settings: SocialSettings) -> Self {
        Self {
            orchestrator,
            settings,
        }
    }

    pub fn spec_for(&self, request: &UploadRequest) -> TaskSpec {
        let s = &self.settings;
        let spec = TaskSpec::new(format!("{}_upload", request.platform))
            .session(request.slot(), true)
            .max_attempts(s.max_attempts)
            .backoff(s.backoff);
        match request.platform {
            Platform::TikTok => self.tiktok_steps(spec, request),
            Platform::Instagram => self.instagram_steps(spec, request),
        }
    }

    fn attach(&self, spec: TaskSpec, url: &str, video: &Path) -> TaskSpec {
        spec.step(Step::Navigate(UrlTemplate::new(url)))
            .step(Step::Wait {
                target: FILE_INPUT,
                timeout: Some(self.settings.upload_timeout),
                required: true,
            })
            .step(Step::AttachFile {
                field: FILE_INPUT,
                path: video.to_path_buf(),
            })
    }

    fn tiktok_steps(&self, spec: TaskSpec, request: &UploadRequest) -> TaskSpec {
        self.attach(spec, TIKTOK_UPLOAD_URL, &request.video_path)
            .step(Step::Fill {
                field: TIKTOK_CAPTION,
                value: request.caption.clone(),
                required: false,
            })
            .step(Step::Click(TIKTOK_POST))
            .step(Step::Poll(PollStep {
                key: POST_URL_KEY,
                signals: vec![CompletionSignal::new(PAGE_LOCATION, "href").containing("/video/")],
                interval: Some(Duration::from_secs(2)),
                budget: Some(self.settings.post_timeout),
                on_timeout: OnTimeout::Fallback(CompletionSignal::new(PAGE_LOCATION, "href")),
            }))
    }

    fn instagram_steps(&self, spec: TaskSpec, request: &UploadRequest) -> TaskSpec {
        self.attach(spec, INSTAGRAM_CREATE_URL, &request.video_path)
            .step(Step::Fill {
                field: INSTAGRAM_CAPTION,
                value: request.caption.clone(),
                required: false,
            })
            .step(Step::Click(INSTAGRAM_SHARE))
            .step(Step::Wait {
                target: REEL_SHARED,
                timeout: Some(self.settings.post_timeout),
                required: false,
            })
            .step(Step::Capture {
                key: POST_URL_KEY,
                target: PAGE_LOCATION,
                attribute: "href",
                required: true,
            })
    }

    /// 发布视频，返回帖子地址与会话保存位置
    pub async fn upload(&self, request: &UploadRequest) -> Result<UploadOutput, TaskError> {
        if !tokio::fs::try_exists(&request.video_path).await.unwrap_or(false) {
            return Err(TaskError::invalid_input(format!(
                "Video not found: {}",
                request.video_path.display()
            )));
        }

        let mut payload = self.orchestrator.run(&self.spec_for(request)).await.into_result()?;
        let post_url = payload
            .remove(POST_URL_KEY)
            .ok_or_else(|| TaskError::retryable("no post url captured"))?;
        tracing::info!(platform = %request.platform, url = %post_url, "video published");
        Ok(UploadOutput {
            post_url,
            cookies: payload.remove("session"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::proxy_pool::ProxyPool;
    use crate::core::session_store::MemorySessionStore;
    use crate::driver::ScriptedDriver;

    fn uploader(driver: ScriptedDriver) -> SocialUploader {
        let orchestrator = TaskOrchestrator::new(
            Arc::new(driver),
            Arc::new(ProxyPool::direct()),
            Arc::new(MemorySessionStore::new()),
        );
        SocialUploader::new(Arc::new(orchestrator), SocialSettings::default())
    }

    fn video() -> tempfile::NamedTempFile {
        tempfile::Builder::new().suffix(".mp4").tempfile().unwrap()
    }

    #[test]
    fn test_platform_aliases() {
        assert_eq!("TikTok".parse::<Platform>().unwrap(), Platform::TikTok);
        for alias in ["instagram", "IG", "reel", " Reels "] {
            assert_eq!(alias.parse::<Platform>().unwrap(), Platform::Instagram);
        }
        let err = "youtube".parse::<Platform>().unwrap_err();
        assert_eq!(err.to_string(), "Unsupported platform: youtube");
    }

    #[test]
    fn test_slot_defaults_to_platform() {
        let request = UploadRequest::new("/tmp/v.mp4", "hi", Platform::Instagram);
        assert_eq!(request.slot(), "instagram");
        assert_eq!(request.with_cookies("/tmp/ig.json").slot(), "/tmp/ig.json");
    }

    #[tokio::test]
    async fn test_missing_video_is_invalid_input() {
        let driver = ScriptedDriver::new();
        let uploader = uploader(driver.clone());
        let request = UploadRequest::new("/definitely/not/here.mp4", "", Platform::TikTok);
        let err = uploader.upload(&request).await.unwrap_err();
        assert!(matches!(err, TaskError::InvalidInput { .. }));
        assert_eq!(driver.count("open"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tiktok_falls_back_to_current_url() {
        let file = video();
        let driver = ScriptedDriver::new().missing("caption field");
        let uploader = uploader(driver.clone());
        let request = UploadRequest::new(file.path(), "#ki", Platform::TikTok);

        let output = uploader.upload(&request).await.unwrap();
        assert_eq!(output.post_url, TIKTOK_UPLOAD_URL);
        assert_eq!(output.cookies.as_deref(), Some("memory://tiktok"));
        assert_eq!(driver.count("click post button"), 1);
        assert_eq!(driver.count("open"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_instagram_reads_post_url() {
        let file = video();
        let driver = ScriptedDriver::new().attribute("page location", "href", "https://www.instagram.com/reel/abc/");
        let uploader = uploader(driver.clone());
        let request = UploadRequest::new(file.path(), "caption", Platform::Instagram);

        let output = uploader.upload(&request).await.unwrap();
        assert_eq!(output.post_url, "https://www.instagram.com/reel/abc/");
        assert_eq!(driver.count("fill caption field caption"), 1);
        assert_eq!(driver.count("click share button"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_share_button_fails_once() {
        let file = video();
        let driver = ScriptedDriver::new().missing("share button");
        let uploader = uploader(driver.clone());
        let request = UploadRequest::new(file.path(), "", Platform::Instagram);

        let err = uploader.upload(&request).await.unwrap_err();
        assert!(matches!(err, TaskError::RetriesExhausted { attempts: 1, .. }));
        assert_eq!(driver.count("open"), 1);
    }
}
