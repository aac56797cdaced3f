//! HTTP 驱动：用 reqwest 访问 JSON / HTML 接口，以 PageSession 的形式暴露
//!
//! 每次 open 按代理构建独立的 Client；响应去掉 XSSI 前缀 `)]}'` 后尝试按 JSON 解析，
//! HTML 用 html2text 提取可读文本供异常检测。只支持读取类原语，
//! fill / click 等交互返回 Unsupported。诊断产物为响应原文（.html）。

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use html2text::from_read;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, COOKIE, SET_COOKIE};
use reqwest::Client;
use serde_json::Value;

use crate::core::anomaly::PageSignals;
use crate::core::proxy_pool::ProxyEntry;
use crate::core::session_store::SessionState;
use crate::driver::{DriverError, ElementDescriptor, Locator, PageDriver, PageSession};

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

const XSSI_PREFIX: &str = ")]}'";

/// HTTP 页面驱动
#[derive(Debug, Clone)]
pub struct HttpPageDriver {
    timeout: Duration,
    artifact_dir: PathBuf,
    accept_language: String,
}

impl HttpPageDriver {
    pub fn new(timeout: Duration, artifact_dir: impl Into<PathBuf>) -> Self {
        Self {
            timeout,
            artifact_dir: artifact_dir.into(),
            accept_language: "de-DE,de;q=0.9,en;q=0.8".to_string(),
        }
    }

    pub fn with_accept_language(mut self, value: impl Into<String>) -> Self {
        self.accept_language = value.into();
        self
    }

    fn build_client(&self, proxy: Option<&ProxyEntry>) -> Result<Client, DriverError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/json,text/html;q=0.9,*/*;q=0.8"),
        );
        if let Ok(lang) = HeaderValue::from_str(&self.accept_language) {
            headers.insert(ACCEPT_LANGUAGE, lang);
        }
        let mut builder = Client::builder()
            .timeout(self.timeout)
            .user_agent(USER_AGENT)
            .default_headers(headers);
        if let Some(entry) = proxy {
            let proxy = reqwest::Proxy::all(&entry.address)
                .map_err(|e| DriverError::Launch(format!("invalid proxy {}: {e}", entry.address)))?;
            builder = builder.proxy(proxy);
        }
        builder
            .build()
            .map_err(|e| DriverError::Launch(format!("http client: {e}")))
    }
}

#[async_trait]
impl PageDriver for HttpPageDriver {
    async fn open(
        &self,
        proxy: Option<&ProxyEntry>,
        restored: Option<&SessionState>,
    ) -> Result<Box<dyn PageSession>, DriverError> {
        let client = self.build_client(proxy)?;
        let cookies = restored.map(cookies_from_blob).unwrap_or_default();
        Ok(Box::new(HttpSession {
            client,
            artifact_dir: self.artifact_dir.clone(),
            state: Mutex::new(HttpPage {
                cookies,
                ..HttpPage::default()
            }),
        }))
    }
}

/// 最近一次响应
#[derive(Debug, Default)]
struct HttpPage {
    url: String,
    status: Option<u16>,
    raw: String,
    json: Option<Value>,
    text: String,
    /// name=value
    cookies: Vec<String>,
}

struct HttpSession {
    client: Client,
    artifact_dir: PathBuf,
    state: Mutex<HttpPage>,
}

impl HttpSession {
    fn page(&self) -> MutexGuard<'_, HttpPage> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 描述符的某个定位方式在当前响应中命中时返回取到的值
    fn locate(page: &HttpPage, target: &ElementDescriptor, attribute: Option<&str>) -> Option<String> {
        target.locators.iter().find_map(|locator| match locator {
            Locator::JsonPointer(pointer) => page
                .json
                .as_ref()
                .and_then(|json| resolve_pointer(json, pointer))
                .and_then(value_to_string),
            Locator::Location => Some(page.url.clone()),
            Locator::Css("body") if attribute.is_none() => Some(page.text.clone()),
            Locator::Text(needle) if page.text.contains(needle) => Some((*needle).to_string()),
            _ => None,
        })
    }
}

#[async_trait]
impl PageSession for HttpSession {
    async fn navigate(&self, url: &str, timeout: Duration) -> Result<(), DriverError> {
        let cookie_header = {
            let page = self.page();
            (!page.cookies.is_empty()).then(|| page.cookies.join("; "))
        };
        let mut request = self.client.get(url).timeout(timeout);
        if let Some(cookie) = cookie_header {
            request = request.header(COOKIE, cookie);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| DriverError::Navigation(format!("Request failed: {e}")))?;
        let status = resp.status();
        let set_cookies: Vec<String> = resp
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(|v| v.split(';').next())
            .map(|v| v.trim().to_string())
            .collect();
        let body = resp
            .text()
            .await
            .map_err(|e| DriverError::Navigation(format!("Read body: {e}")))?;

        let mut page = self.page();
        for cookie in set_cookies {
            merge_cookie(&mut page.cookies, cookie);
        }
        page.url = url.to_string();
        page.status = Some(status.as_u16());
        page.json = parse_json_body(&body);
        page.text = readable_text(&body);
        page.raw = body;

        // 4xx 交给异常检测（429 / 封禁页），5xx 视为导航失败
        if status.is_server_error() {
            return Err(DriverError::Navigation(format!("HTTP {status} from {url}")));
        }
        Ok(())
    }

    async fn wait_for_signal(
        &self,
        target: ElementDescriptor,
        _timeout: Duration,
    ) -> Result<PageSignals, DriverError> {
        let page = self.page();
        if Self::locate(&page, &target, None).is_none() {
            return Err(DriverError::Timeout(format!("{target} in response from {}", page.url)));
        }
        Ok(PageSignals {
            frame_sources: Vec::new(),
            body_text: page.text.clone(),
            http_status: page.status,
        })
    }

    async fn fill(&self, field: ElementDescriptor, _value: &str) -> Result<(), DriverError> {
        Err(DriverError::Unsupported(format!("fill {field}")))
    }

    async fn click(&self, control: ElementDescriptor) -> Result<(), DriverError> {
        Err(DriverError::Unsupported(format!("click {control}")))
    }

    async fn attach_file(&self, field: ElementDescriptor, _path: &Path) -> Result<(), DriverError> {
        Err(DriverError::Unsupported(format!("attach file to {field}")))
    }

    async fn press_key(&self, field: ElementDescriptor, key: &str) -> Result<(), DriverError> {
        Err(DriverError::Unsupported(format!("press {key} in {field}")))
    }

    async fn extract_attribute(
        &self,
        target: ElementDescriptor,
        attribute: &str,
    ) -> Result<Option<String>, DriverError> {
        let page = self.page();
        Ok(Self::locate(&page, &target, Some(attribute)).filter(|v| !v.is_empty()))
    }

    async fn screenshot(&self, label: &str) -> Result<PathBuf, DriverError> {
        let raw = self.page().raw.clone();
        tokio::fs::create_dir_all(&self.artifact_dir)
            .await
            .map_err(|e| DriverError::Interaction(format!("artifact dir: {e}")))?;
        let path = self.artifact_dir.join(format!("{label}.html"));
        tokio::fs::write(&path, raw)
            .await
            .map_err(|e| DriverError::Interaction(format!("write artifact: {e}")))?;
        Ok(path)
    }

    async fn export_session(&self, slot: &str) -> Result<SessionState, DriverError> {
        let cookies = self.page().cookies.clone();
        Ok(SessionState::new(slot, serde_json::json!({ "cookies": cookies })))
    }

    async fn close(&self) {}
}

fn cookies_from_blob(state: &SessionState) -> Vec<String> {
    state
        .blob
        .get("cookies")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// 同名 cookie 覆盖
fn merge_cookie(jar: &mut Vec<String>, cookie: String) {
    let name = cookie.split('=').next().unwrap_or_default().to_string();
    jar.retain(|c| c.split('=').next() != Some(name.as_str()));
    jar.push(cookie);
}

/// 去掉 `)]}'` 前缀后按 JSON 解析
fn parse_json_body(body: &str) -> Option<Value> {
    let trimmed = body.trim_start_matches('\u{FEFF}').trim_start();
    let trimmed = trimmed
        .strip_prefix(XSSI_PREFIX)
        .map(|rest| rest.trim_start_matches(',').trim_start())
        .unwrap_or(trimmed);
    serde_json::from_str(trimmed).ok()
}

fn looks_like_html(s: &str) -> bool {
    let s = s.trim_start();
    s.starts_with("<!") || s.to_ascii_lowercase().starts_with("<html")
        || (s.contains('<') && (s.contains("</") || s.contains("<head") || s.contains("<title")))
}

fn readable_text(body: &str) -> String {
    let body = body.trim_start_matches('\u{FEFF}');
    if !looks_like_html(body) {
        return body.to_string();
    }
    match from_read(body.as_bytes(), 120) {
        Ok(text) if !text.trim().is_empty() => text,
        _ => body.to_string(),
    }
}

/// JSON 路径：`/a/0/b`；`[field=value]` 段匹配数组中 field 等于 value 的元素
pub fn resolve_pointer<'a>(root: &'a Value, pointer: &str) -> Option<&'a Value> {
    let mut current = root;
    for raw in pointer.split('/').filter(|s| !s.is_empty()) {
        let segment = raw.replace("~1", "/").replace("~0", "~");
        current = match (segment.strip_prefix('[').and_then(|s| s.strip_suffix(']')), current) {
            (Some(filter), Value::Array(items)) => {
                let (field, expected) = filter.split_once('=')?;
                items
                    .iter()
                    .find(|item| item.get(field).and_then(Value::as_str) == Some(expected))?
            }
            (None, Value::Array(items)) => items.get(segment.parse::<usize>().ok()?)?,
            (None, Value::Object(map)) => map.get(&segment)?,
            _ => return None,
        };
    }
    Some(current)
}

/// 字符串原样返回，其它值序列化为 JSON 文本
fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_xssi_prefix_stripped() {
        let body = ")]}',\n{\"widgets\":[]}";
        assert_eq!(parse_json_body(body), Some(json!({"widgets": []})));
        let body = ")]}'\n{\"default\":{}}";
        assert_eq!(parse_json_body(body), Some(json!({"default": {}})));
        assert_eq!(parse_json_body("<html></html>"), None);
    }

    #[test]
    fn test_pointer_with_filter_segment() {
        let v = json!({
            "widgets": [
                {"id": "TIMESERIES", "token": "a"},
                {"id": "RELATED_QUERIES", "token": "b", "request": {"restriction": {"geo": {"country": "DE"}}}}
            ]
        });
        let token = resolve_pointer(&v, "/widgets/[id=RELATED_QUERIES]/token");
        assert_eq!(token, Some(&json!("b")));
        let request = resolve_pointer(&v, "/widgets/[id=RELATED_QUERIES]/request").and_then(value_to_string);
        assert_eq!(
            request.as_deref(),
            Some(r#"{"restriction":{"geo":{"country":"DE"}}}"#)
        );
        assert_eq!(resolve_pointer(&v, "/widgets/[id=MISSING]/token"), None);
    }

    #[test]
    fn test_pointer_index_segments() {
        let v = json!({"default": {"rankedList": [{"rankedKeyword": [{"query": "ki news"}]}]}});
        let q = resolve_pointer(&v, "/default/rankedList/0/rankedKeyword/0/query");
        assert_eq!(q, Some(&json!("ki news")));
        assert_eq!(resolve_pointer(&v, "/default/rankedList/1/rankedKeyword/0/query"), None);
    }

    #[test]
    fn test_html_converted_to_text() {
        let text = readable_text("<html><body><h1>Too Many Requests</h1></body></html>");
        assert!(text.contains("Too Many Requests"));
        assert!(!text.contains("<h1>"));
    }

    #[test]
    fn test_merge_cookie_overwrites_same_name() {
        let mut jar = vec!["NID=1".to_string(), "AEC=x".to_string()];
        merge_cookie(&mut jar, "NID=2".to_string());
        assert_eq!(jar, vec!["AEC=x".to_string(), "NID=2".to_string()]);
    }

    #[tokio::test]
    async fn test_interactions_unsupported() {
        const FIELD: ElementDescriptor = ElementDescriptor::new("field", &[Locator::Css("input")]);
        let dir = tempfile::tempdir().unwrap();
        let driver = HttpPageDriver::new(Duration::from_secs(5), dir.path());
        let session = driver.open(None, None).await.unwrap();
        assert!(matches!(session.fill(FIELD, "x").await, Err(DriverError::Unsupported(_))));
        assert!(matches!(session.click(FIELD).await, Err(DriverError::Unsupported(_))));
    }

    #[tokio::test]
    async fn test_session_cookies_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let driver = HttpPageDriver::new(Duration::from_secs(5), dir.path());
        let restored = SessionState::new("trends", json!({"cookies": ["NID=abc"]}));
        let session = driver.open(None, Some(&restored)).await.unwrap();
        let exported = session.export_session("trends").await.unwrap();
        assert_eq!(exported.blob, json!({"cookies": ["NID=abc"]}));
    }
}
