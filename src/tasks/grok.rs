//! Grok Imagine 视频生成
//!
//! 可选登录 → imagine 页面 → 填写提示词 → 点击生成（找不到按钮时回车）→ 轮询下载链接或视频地址。
//! 成功后尽力把视频下载到本地；下载失败只记警告，不影响结果。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde::Serialize;
use tokio::io::AsyncWriteExt;

use crate::config::GrokSection;
use crate::core::backoff::BackoffPolicy;
use crate::core::error::TaskError;
use crate::core::orchestrator::TaskOrchestrator;
use crate::driver::{ElementDescriptor, Locator};
use crate::tasks::{CompletionSignal, LoginFlow, OnTimeout, PollStep, Step, TaskSpec, UrlTemplate};

pub const EMAIL_FIELD: ElementDescriptor = ElementDescriptor::new(
    "email field",
    &[Locator::Css("input[name=email]"), Locator::Css("input[type=email]")],
);

pub const PASSWORD_FIELD: ElementDescriptor = ElementDescriptor::new(
    "password field",
    &[Locator::Css("input[name=password]"), Locator::Css("input[type=password]")],
);

pub const LOGIN_BUTTON: ElementDescriptor =
    ElementDescriptor::new("login button", &[Locator::Css("button[type=submit]")]);

/// 登录后才出现的导航栏
pub const LOGGED_IN: ElementDescriptor = ElementDescriptor::new("navigation bar", &[Locator::Css("nav")]);

pub const PROMPT_FIELD: ElementDescriptor = ElementDescriptor::new(
    "prompt field",
    &[Locator::Css("textarea[placeholder*='Describe']"), Locator::Css("textarea")],
);

pub const GENERATE_BUTTON: ElementDescriptor = ElementDescriptor::new(
    "generate button",
    &[Locator::XPath(
        "//button[contains(., 'Imagine') or contains(., 'Generate')]",
    )],
);

pub const DOWNLOAD_LINK: ElementDescriptor =
    ElementDescriptor::new("download link", &[Locator::Css("a.download-link")]);

pub const GENERATED_VIDEO: ElementDescriptor =
    ElementDescriptor::new("generated video", &[Locator::Css("video[src^='http']"), Locator::Css("video")]);

/// payload 中的下载地址键
pub const DOWNLOAD_URL_KEY: &str = "download_url";

const REJECTION_PATTERNS: [&str; 2] = ["incorrect", "invalid"];

/// 内容生成参数
#[derive(Debug, Clone)]
pub struct GrokSettings {
    pub credentials: Option<(String, String)>,
    pub login_url: String,
    pub imagine_url: String,
    pub download_dir: PathBuf,
    pub session_slot: String,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub poll_interval: Duration,
    pub poll_budget: Duration,
    /// 提示词输入框的等待时长
    pub prompt_timeout: Duration,
}

impl Default for GrokSettings {
    fn default() -> Self {
        Self::from(&GrokSection::default())
    }
}

impl From<&GrokSection> for GrokSettings {
    fn from(s: &GrokSection) -> Self {
        Self {
            credentials: s.credentials(),
            login_url: s.login_url.clone(),
            imagine_url: s.imagine_url.clone(),
            download_dir: s.download_dir.clone(),
            session_slot: s.session_slot.clone(),
            max_attempts: s.max_attempts,
            backoff: s.backoff(),
            poll_interval: Duration::from_secs(s.poll_interval_secs),
            poll_budget: Duration::from_secs(s.poll_budget_secs),
            prompt_timeout: Duration::from_secs(20),
        }
    }
}

/// 生成结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerationOutput {
    pub download_url: String,
    /// 下载成功时的本地文件
    pub local_path: Option<PathBuf>,
}

pub struct ContentGenerator {
    orchestrator: Arc<TaskOrchestrator>,
    settings: GrokSettings,
    http: reqwest::Client,
}

impl ContentGenerator {
    pub fn new(orchestrator: Arc<TaskOrchestrator>, settings: GrokSettings) -> Self {
        Self {
            orchestrator,
            settings,
            http: reqwest::Client::new(),
        }
    }

    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    pub fn settings(&self) -> &GrokSettings {
        &self.settings
    }

    fn login_flow(&self) -> Option<LoginFlow> {
        let (username, password) = self.settings.credentials.clone()?;
        Some(LoginFlow {
            url: self.settings.login_url.clone(),
            authenticated: LOGGED_IN,
            steps: vec![
                Step::Fill {
                    field: EMAIL_FIELD,
                    value: username,
                    required: true,
                },
                Step::Fill {
                    field: PASSWORD_FIELD,
                    value: password,
                    required: true,
                },
                Step::Click(LOGIN_BUTTON),
            ],
            rejection_patterns: REJECTION_PATTERNS.iter().map(|p| p.to_string()).collect(),
            presence_timeout: Duration::from_secs(5),
            confirm_timeout: Duration::from_secs(30),
        })
    }

    pub fn spec_for(&self, prompt: &str) -> TaskSpec {
        let s = &self.settings;
        let mut spec = TaskSpec::new("grok")
            .session(s.session_slot.as_str(), true)
            .max_attempts(s.max_attempts)
            .backoff(s.backoff);
        if let Some(login) = self.login_flow() {
            spec = spec.login(login);
        }
        spec.step(Step::Navigate(UrlTemplate::new(s.imagine_url.as_str())))
            .step(Step::Wait {
                target: PROMPT_FIELD,
                timeout: Some(s.prompt_timeout),
                required: true,
            })
            .step(Step::Fill {
                field: PROMPT_FIELD,
                value: prompt.to_string(),
                required: true,
            })
            .step(Step::Submit {
                control: GENERATE_BUTTON,
                field: PROMPT_FIELD,
            })
            .step(Step::Poll(PollStep {
                key: DOWNLOAD_URL_KEY,
                signals: vec![
                    CompletionSignal::new(DOWNLOAD_LINK, "href"),
                    CompletionSignal::new(GENERATED_VIDEO, "src").containing("http"),
                ],
                interval: Some(s.poll_interval),
                budget: Some(s.poll_budget),
                on_timeout: OnTimeout::Fail,
            }))
    }

    /// 生成视频并返回下载地址
    pub async fn generate(&self, prompt: &str) -> Result<GenerationOutput, TaskError> {
        if prompt.trim().is_empty() {
            return Err(TaskError::invalid_input("prompt must not be empty"));
        }
        let payload = self.orchestrator.run(&self.spec_for(prompt)).await.into_result()?;
        let download_url = payload
            .get(DOWNLOAD_URL_KEY)
            .cloned()
            .ok_or_else(|| TaskError::retryable("no download url captured"))?;
        tracing::info!(url = %download_url, "grok video ready");

        let local_path = match self.download(&download_url).await {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::warn!(url = %download_url, error = %e, "video download failed");
                None
            }
        };
        Ok(GenerationOutput {
            download_url,
            local_path,
        })
    }

    /// 流式下载到 `<download_dir>/grok_<unix>.mp4`
    async fn download(&self, url: &str) -> anyhow::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.settings.download_dir).await?;
        let path = self
            .settings
            .download_dir
            .join(format!("grok_{}.mp4", chrono::Utc::now().timestamp()));

        let response = self.http.get(url).send().await?.error_for_status()?;
        let mut file = tokio::fs::File::create(&path).await?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        tracing::debug!(path = %path.display(), "video saved");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::proxy_pool::ProxyPool;
    use crate::core::session_store::MemorySessionStore;
    use crate::driver::ScriptedDriver;

    fn generator(driver: ScriptedDriver, settings: GrokSettings) -> ContentGenerator {
        let orchestrator = TaskOrchestrator::new(
            Arc::new(driver),
            Arc::new(ProxyPool::direct()),
            Arc::new(MemorySessionStore::new()),
        );
        ContentGenerator::new(Arc::new(orchestrator), settings)
    }

    fn settings(dir: &std::path::Path) -> GrokSettings {
        GrokSettings {
            download_dir: dir.to_path_buf(),
            ..GrokSettings::default()
        }
    }

    #[test]
    fn test_login_only_with_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let anonymous = generator(ScriptedDriver::new(), settings(dir.path()));
        assert!(anonymous.spec_for("cat").login.is_none());

        let with_login = generator(
            ScriptedDriver::new(),
            GrokSettings {
                credentials: Some(("me@example.com".into(), "pw".into())),
                ..settings(dir.path())
            },
        );
        let login = with_login.spec_for("cat").login.unwrap();
        assert_eq!(login.url, "https://grok.com/login");
        assert_eq!(login.rejection_patterns, vec!["incorrect", "invalid"]);
    }

    #[tokio::test]
    async fn test_empty_prompt_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let driver = ScriptedDriver::new();
        let gen = generator(driver.clone(), settings(dir.path()));
        let err = gen.generate("   ").await.unwrap_err();
        assert!(matches!(err, TaskError::InvalidInput { .. }));
        assert_eq!(driver.count("open"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_generate_polls_until_video_src() {
        let dir = tempfile::tempdir().unwrap();
        let driver = ScriptedDriver::new()
            .missing("generate button")
            .attribute_after("generated video", "src", "http://127.0.0.1:9/v.mp4", 3);
        let gen = generator(driver.clone(), settings(dir.path()));

        let output = gen.generate("a cat surfing").await.unwrap();
        assert_eq!(output.download_url, "http://127.0.0.1:9/v.mp4");
        // 端口 9 无服务，下载失败只影响 local_path
        assert_eq!(output.local_path, None);
        assert_eq!(driver.count("press prompt field Enter"), 1);
        assert_eq!(driver.count("fill prompt field a cat surfing"), 1);
        assert_eq!(driver.count("export grok"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrong_credentials_abort_without_retry() {
        use crate::core::anomaly::PageSignals;

        let dir = tempfile::tempdir().unwrap();
        let driver = ScriptedDriver::new()
            .missing("navigation bar")
            .page("grok.com/login", PageSignals::from_body("The password you entered is incorrect"));
        let gen = generator(
            driver.clone(),
            GrokSettings {
                credentials: Some(("me@example.com".into(), "wrong".into())),
                ..settings(dir.path())
            },
        );

        let err = gen.generate("a cat").await.unwrap_err();
        assert!(matches!(err, TaskError::AuthenticationFailure { .. }));
        assert_eq!(driver.count("open"), 1);
        assert_eq!(driver.count("click login button"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_generate_click_error_with_invalid_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let driver = ScriptedDriver::new().failing_click("generate button", "Method call error -32602: Invalid parameters");
        let gen = generator(
            driver.clone(),
            GrokSettings {
                credentials: Some(("me@example.com".into(), "pw".into())),
                ..settings(dir.path())
            },
        );

        let err = gen.generate("a cat").await.unwrap_err();
        assert!(matches!(err, TaskError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(driver.count("open"), 3);
        assert_eq!(driver.count("click generate button"), 3);
        // 导航栏已在，登录表单从未提交
        assert_eq!(driver.count("click login button"), 0);
    }
}
