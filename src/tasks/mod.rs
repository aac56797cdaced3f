//! 任务规格：以数据描述一次自动化任务
//!
//! 编排器只解释这里的 Step 序列，不认识任何具体站点；站点相关的选择器都在各任务模块的
//! ElementDescriptor 常量里。
//!
//! - **trends**: Google Trends 相关查询（HTTP 驱动）
//! - **grok**: Grok Imagine 视频生成（浏览器驱动）
//! - **social**: TikTok / Instagram 发布（浏览器驱动）

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use reqwest::Url;

use crate::core::backoff::BackoffPolicy;
use crate::core::error::TaskError;
use crate::driver::ElementDescriptor;

pub mod grok;
pub mod social;
pub mod trends;

pub use grok::{ContentGenerator, GenerationOutput, GrokSettings};
pub use social::{Platform, SocialUploader, UploadOutput, UploadRequest};
pub use trends::{TrendScout, TrendSettings};

/// 一次任务的完整描述
#[derive(Debug, Clone)]
pub struct TaskSpec {
    /// 任务名，用于日志与诊断产物文件名
    pub name: String,
    /// 会话槽位；None 表示不恢复也不保存
    pub session_slot: Option<String>,
    /// 成功后是否导出并保存会话
    pub persist_session: bool,
    pub login: Option<LoginFlow>,
    pub steps: Vec<Step>,
    /// 覆盖编排器默认值
    pub max_attempts: Option<u32>,
    pub backoff: Option<BackoffPolicy>,
}

impl TaskSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            session_slot: None,
            persist_session: false,
            login: None,
            steps: Vec::new(),
            max_attempts: None,
            backoff: None,
        }
    }

    pub fn session(mut self, slot: impl Into<String>, persist: bool) -> Self {
        self.session_slot = Some(slot.into());
        self.persist_session = persist;
        self
    }

    pub fn login(mut self, login: LoginFlow) -> Self {
        self.login = Some(login);
        self
    }

    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = Some(n);
        self
    }

    pub fn backoff(mut self, policy: BackoffPolicy) -> Self {
        self.backoff = Some(policy);
        self
    }
}

/// 单个交互步骤
#[derive(Debug, Clone)]
pub enum Step {
    /// 导航；之后总会做一次异常检查
    Navigate(UrlTemplate),
    /// 等待元素出现；required 为 false 时超时只跳过
    Wait {
        target: ElementDescriptor,
        timeout: Option<Duration>,
        required: bool,
    },
    /// required 为 false 时填写失败只跳过（如可选的说明文字）
    Fill {
        field: ElementDescriptor,
        value: String,
        required: bool,
    },
    Click(ElementDescriptor),
    AttachFile {
        field: ElementDescriptor,
        path: PathBuf,
    },
    /// 点击 control；找不到时在 field 里按回车
    Submit {
        control: ElementDescriptor,
        field: ElementDescriptor,
    },
    /// 读取属性写入 payload[key]
    Capture {
        key: &'static str,
        target: ElementDescriptor,
        attribute: &'static str,
        required: bool,
    },
    Poll(PollStep),
}

/// 完成信号轮询
#[derive(Debug, Clone)]
pub struct PollStep {
    /// 命中后写入 payload 的键
    pub key: &'static str,
    /// 任意一个命中即完成
    pub signals: Vec<CompletionSignal>,
    /// None 时用编排器配置
    pub interval: Option<Duration>,
    pub budget: Option<Duration>,
    pub on_timeout: OnTimeout,
}

/// 一个完成信号：元素属性非空，且（可选）包含给定片段
#[derive(Debug, Clone, Copy)]
pub struct CompletionSignal {
    pub target: ElementDescriptor,
    pub attribute: &'static str,
    pub contains: Option<&'static str>,
}

impl CompletionSignal {
    pub const fn new(target: ElementDescriptor, attribute: &'static str) -> Self {
        Self {
            target,
            attribute,
            contains: None,
        }
    }

    pub const fn containing(mut self, fragment: &'static str) -> Self {
        self.contains = Some(fragment);
        self
    }

    pub fn accepts(&self, value: &str) -> bool {
        !value.is_empty() && self.contains.map_or(true, |f| value.contains(f))
    }
}

/// 轮询预算耗尽后的处理
#[derive(Debug, Clone, Copy)]
pub enum OnTimeout {
    /// 可重试失败（先做异常检查）
    Fail,
    /// 改读一次该信号（不过滤），读到即视为完成
    Fallback(CompletionSignal),
}

/// 登录流程
#[derive(Debug, Clone)]
pub struct LoginFlow {
    pub url: String,
    /// 已登录标志；恢复的会话里能看到它就跳过登录
    pub authenticated: ElementDescriptor,
    pub steps: Vec<Step>,
    /// 凭据被拒的页面文案（小写）
    pub rejection_patterns: Vec<String>,
    /// 检查已登录标志的等待时长
    pub presence_timeout: Duration,
    /// 提交后等待已登录标志的时长
    pub confirm_timeout: Duration,
}

/// URL 模板：查询参数的值可用 `{key}` 引用之前 Capture 的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlTemplate {
    base: String,
    query: Vec<(String, String)>,
}

static PLACEHOLDER_RE: OnceLock<Regex> = OnceLock::new();

fn placeholder() -> &'static Regex {
    PLACEHOLDER_RE.get_or_init(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap())
}

impl UrlTemplate {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            query: Vec::new(),
        }
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// 代入 captures 后生成 URL（查询参数按 URL 编码）
    pub fn render(&self, captures: &BTreeMap<String, String>) -> Result<String, TaskError> {
        let mut params = Vec::with_capacity(self.query.len());
        for (key, value) in &self.query {
            let mut missing = None;
            let rendered = placeholder().replace_all(value, |caps: &regex::Captures<'_>| {
                match captures.get(&caps[1]) {
                    Some(v) => v.clone(),
                    None => {
                        missing = Some(caps[1].to_string());
                        String::new()
                    }
                }
            });
            if let Some(name) = missing {
                return Err(TaskError::retryable(format!(
                    "no captured value for {{{name}}} in {}",
                    self.base
                )));
            }
            params.push((key.as_str(), rendered.into_owned()));
        }
        let parsed = if params.is_empty() {
            Url::parse(&self.base)
        } else {
            Url::parse_with_params(&self.base, &params)
        };
        let url = parsed.map_err(|e| TaskError::invalid_input(format!("bad url {}: {e}", self.base)))?;
        Ok(url.to_string())
    }
}

impl From<&str> for UrlTemplate {
    fn from(base: &str) -> Self {
        Self::new(base)
    }
}
