//! 会话存储抽象层
//!
//! 按槽位（如平台名、账号名）整体覆盖保存浏览器会话（cookies / storage），任务开始时恢复。
//! load 遇到缺失或损坏的槽位一律返回 None，编排器把它当作全新未登录会话处理。
//! 同一槽位并发写入时后写者胜，不做跨进程加锁。

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// 序列化后的会话状态；blob 内容由驱动解释，存储层不关心
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub slot_name: String,
    pub saved_at: DateTime<Utc>,
    pub blob: serde_json::Value,
}

impl SessionState {
    pub fn new(slot_name: impl Into<String>, blob: serde_json::Value) -> Self {
        Self {
            slot_name: slot_name.into(),
            saved_at: Utc::now(),
            blob,
        }
    }
}

/// 会话存储接口
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// 保存并返回存储位置（文件路径或内存标识）
    async fn save(&self, slot: &str, state: &SessionState) -> anyhow::Result<String>;

    /// 读取槽位；缺失或损坏时返回 None
    async fn load(&self, slot: &str) -> Option<SessionState>;
}

/// 文件会话存储：每个槽位一个 JSON 文件
///
/// 槽位名本身是路径（含分隔符或以 .json 结尾）时直接使用该路径，兼容调用方传入的 cookies 文件路径。
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    root: PathBuf,
}

impl FileSessionStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn slot_path(&self, slot: &str) -> PathBuf {
        if slot.contains('/') || slot.contains('\\') || slot.ends_with(".json") {
            return PathBuf::from(slot);
        }
        let safe: String = slot
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.root.join(format!("{safe}.json"))
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn save(&self, slot: &str, state: &SessionState) -> anyhow::Result<String> {
        let path = self.slot_path(slot);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let data = serde_json::to_string_pretty(state)?;
        // 先写临时文件再 rename，避免读到写了一半的文件
        let tmp = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(path.display().to_string())
    }

    async fn load(&self, slot: &str) -> Option<SessionState> {
        let path = self.slot_path(slot);
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "session slot unreadable");
                return None;
            }
        };
        match serde_json::from_str::<SessionState>(&data) {
            Ok(state) => Some(state),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "session slot corrupt, ignoring");
                None
            }
        }
    }
}

/// 内存会话存储（测试与一次性运行）
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    slots: RwLock<HashMap<String, SessionState>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn save(&self, slot: &str, state: &SessionState) -> anyhow::Result<String> {
        self.slots.write().await.insert(slot.to_string(), state.clone());
        Ok(format!("memory://{slot}"))
    }

    async fn load(&self, slot: &str) -> Option<SessionState> {
        self.slots.read().await.get(slot).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn state(slot: &str) -> SessionState {
        SessionState::new(slot, serde_json::json!({"cookies": [{"name": "sid", "value": "abc"}]}))
    }

    #[tokio::test]
    async fn test_file_load_missing_is_none() {
        let dir = TempDir::new().unwrap();
        let store = FileSessionStore::new(dir.path());
        assert!(store.load("tiktok").await.is_none());
    }

    #[tokio::test]
    async fn test_file_save_then_load() {
        let dir = TempDir::new().unwrap();
        let store = FileSessionStore::new(dir.path().join("sessions"));
        let s = state("tiktok");
        let location = store.save("tiktok", &s).await.unwrap();
        assert!(location.ends_with("tiktok.json"));
        assert_eq!(store.load("tiktok").await, Some(s));
    }

    #[tokio::test]
    async fn test_file_overwrite_not_merge() {
        let dir = TempDir::new().unwrap();
        let store = FileSessionStore::new(dir.path());
        store.save("ig", &state("ig")).await.unwrap();
        let second = SessionState::new("ig", serde_json::json!({"cookies": []}));
        store.save("ig", &second).await.unwrap();
        assert_eq!(store.load("ig").await.unwrap().blob, serde_json::json!({"cookies": []}));
    }

    #[tokio::test]
    async fn test_file_corrupt_is_none() {
        let dir = TempDir::new().unwrap();
        let store = FileSessionStore::new(dir.path());
        std::fs::write(store.slot_path("grok"), "{not json").unwrap();
        assert!(store.load("grok").await.is_none());
    }

    #[tokio::test]
    async fn test_slot_as_explicit_path() {
        let dir = TempDir::new().unwrap();
        let store = FileSessionStore::new(dir.path().join("unused"));
        let explicit = dir.path().join("cookies").join("tiktok_storage.json");
        let slot = explicit.display().to_string();
        let location = store.save(&slot, &state("x")).await.unwrap();
        assert_eq!(location, slot);
        assert!(explicit.exists());
        assert!(store.load(&slot).await.is_some());
    }

    #[test]
    fn test_slot_name_sanitized() {
        let store = FileSessionStore::new("/tmp/s");
        assert_eq!(store.slot_path("a b:c"), PathBuf::from("/tmp/s/a_b_c.json"));
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemorySessionStore::new();
        assert!(store.load("a").await.is_none());
        let s = state("a");
        assert_eq!(store.save("a", &s).await.unwrap(), "memory://a");
        assert_eq!(store.load("a").await, Some(s));
    }
}
