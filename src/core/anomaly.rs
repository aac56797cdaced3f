//! 异常检测：把渲染后的页面信号归类为 正常 / 人机验证 / 限流 / 封禁
//!
//! 规则按固定优先级匹配（先命中者生效），纯函数且对任意输入都返回结果，永不 panic。
//! 页面卡死但没有任何标记的情况不在这里判断：由编排器在超时后记为 UnknownUiState。

use std::fmt;

use serde::{Deserialize, Serialize};

/// 页面异常类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    /// 无异常
    Normal,
    /// 人机验证（captcha / 机器人校验）
    Challenge,
    /// 限流（HTTP 429 或限流文案）
    RateLimited,
    /// 明确的封禁 / 拒绝访问
    Blocked,
    /// 超时后页面仍未出现预期元素，且没有任何异常标记
    UnknownUiState,
}

impl AnomalyKind {
    /// Challenge / Blocked 不可通过重试恢复
    pub fn is_fatal(self) -> bool {
        matches!(self, Self::Challenge | Self::Blocked)
    }
}

impl fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Normal => "normal",
            Self::Challenge => "challenge",
            Self::RateLimited => "rate_limited",
            Self::Blocked => "blocked",
            Self::UnknownUiState => "unknown_ui_state",
        };
        f.write_str(s)
    }
}

/// 页面信号：内嵌 frame 的 src、可读正文、HTTP 状态码（浏览器驱动通常拿不到）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageSignals {
    pub frame_sources: Vec<String>,
    pub body_text: String,
    pub http_status: Option<u16>,
}

impl PageSignals {
    pub fn from_body(body_text: impl Into<String>) -> Self {
        Self {
            body_text: body_text.into(),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    pub fn with_frame(mut self, src: impl Into<String>) -> Self {
        self.frame_sources.push(src.into());
        self
    }
}

/// 各类规则使用的关键词（均为小写）
#[derive(Debug, Clone)]
pub struct AnomalyRules {
    /// frame src 中出现即视为人机验证提供方
    pub challenge_frame_markers: Vec<String>,
    /// 「验证」类词
    pub verification_terms: Vec<String>,
    /// 与验证词同时出现才算人机验证
    pub bot_terms: Vec<String>,
    pub rate_limit_phrases: Vec<String>,
    pub block_phrases: Vec<String>,
}

impl Default for AnomalyRules {
    fn default() -> Self {
        Self {
            challenge_frame_markers: to_owned(&[
                "captcha",
                "recaptcha",
                "hcaptcha",
                "challenges.cloudflare.com",
                "arkoselabs",
            ]),
            verification_terms: to_owned(&["verify", "verification"]),
            bot_terms: to_owned(&["bot", "captcha"]),
            rate_limit_phrases: to_owned(&[
                "too many requests",
                "rate limit",
                "rate-limit",
                "ratelimit",
                "unusual traffic",
            ]),
            block_phrases: to_owned(&[
                "access denied",
                "you have been blocked",
                "has been blocked",
                "account has been suspended",
                "account suspended",
                "you are banned",
                "has been banned",
            ]),
        }
    }
}

fn to_owned(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// 启发式异常检测器
#[derive(Debug, Clone, Default)]
pub struct AnomalyDetector {
    rules: AnomalyRules,
}

impl AnomalyDetector {
    pub fn new(rules: AnomalyRules) -> Self {
        Self { rules }
    }

    /// 按优先级分类：frame 标记 > 验证文案 > 限流 > 封禁 > 正常
    pub fn classify(&self, signals: &PageSignals) -> AnomalyKind {
        let r = &self.rules;

        let frame_hit = signals.frame_sources.iter().any(|src| {
            let src = src.to_lowercase();
            r.challenge_frame_markers.iter().any(|m| src.contains(m.as_str()))
        });
        if frame_hit {
            return AnomalyKind::Challenge;
        }

        let body = signals.body_text.to_lowercase();
        if contains_any(&body, &r.verification_terms) && contains_any(&body, &r.bot_terms) {
            return AnomalyKind::Challenge;
        }

        if signals.http_status == Some(429) || contains_any(&body, &r.rate_limit_phrases) {
            return AnomalyKind::RateLimited;
        }

        if contains_any(&body, &r.block_phrases) {
            return AnomalyKind::Blocked;
        }

        AnomalyKind::Normal
    }
}

fn contains_any(haystack: &str, needles: &[String]) -> bool {
    needles.iter().any(|n| haystack.contains(n.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(signals: PageSignals) -> AnomalyKind {
        AnomalyDetector::default().classify(&signals)
    }

    #[test]
    fn test_verify_and_bot_is_challenge() {
        let s = PageSignals::from_body("Please verify you are not a bot");
        assert_eq!(classify(s), AnomalyKind::Challenge);
    }

    #[test]
    fn test_no_markers_is_normal() {
        let s = PageSignals::from_body("Welcome back! Describe your video.");
        assert_eq!(classify(s), AnomalyKind::Normal);
    }

    #[test]
    fn test_recaptcha_frame_is_challenge() {
        let s = PageSignals::default().with_frame("https://www.google.com/recaptcha/api2/anchor?k=1");
        assert_eq!(classify(s), AnomalyKind::Challenge);
    }

    #[test]
    fn test_verify_without_bot_term_is_not_challenge() {
        let s = PageSignals::from_body("Verify your email address to continue");
        assert_eq!(classify(s), AnomalyKind::Normal);
    }

    #[test]
    fn test_status_429_is_rate_limited() {
        let s = PageSignals::from_body("").with_status(429);
        assert_eq!(classify(s), AnomalyKind::RateLimited);
    }

    #[test]
    fn test_rate_limit_text() {
        let s = PageSignals::from_body("Too Many Requests - slow down");
        assert_eq!(classify(s), AnomalyKind::RateLimited);
    }

    #[test]
    fn test_block_text() {
        let s = PageSignals::from_body("Access Denied. Reference #18.2f");
        assert_eq!(classify(s), AnomalyKind::Blocked);
    }

    #[test]
    fn test_challenge_wins_over_rate_limit() {
        // 同时命中多条规则时取优先级最高者
        let s = PageSignals::from_body("verify you are human, captcha required. too many requests")
            .with_status(429);
        assert_eq!(classify(s), AnomalyKind::Challenge);
    }

    #[test]
    fn test_rate_limit_wins_over_block() {
        let s = PageSignals::from_body("rate limit exceeded, access denied");
        assert_eq!(classify(s), AnomalyKind::RateLimited);
    }

    #[test]
    fn test_total_on_odd_inputs() {
        let odd = [
            PageSignals::default(),
            PageSignals::from_body("\u{0}\u{FEFF}ÄÖÜ 🚀").with_status(0),
            PageSignals::from_body("x".repeat(100_000)).with_status(u16::MAX),
            PageSignals::default().with_frame("").with_frame("::::"),
        ];
        for s in odd {
            let _ = classify(s);
        }
    }

    #[test]
    fn test_fatal_kinds() {
        assert!(AnomalyKind::Challenge.is_fatal());
        assert!(AnomalyKind::Blocked.is_fatal());
        assert!(!AnomalyKind::RateLimited.is_fatal());
        assert!(!AnomalyKind::UnknownUiState.is_fatal());
    }
}
