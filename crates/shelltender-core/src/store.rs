//! On-disk session persistence
//!
//! One pretty-printed JSON file per session under the data directory,
//! written with atomic replace (temp file + rename) so a crash mid-write
//! never leaves a torn record. Buffer bytes are carried base64-encoded
//! inside the JSON so the round trip is byte-exact for arbitrary PTY
//! output.

use crate::error::{Result, ShelltenderError};
use serde::{Deserialize, Serialize};
use shelltender_types::{PatternConfig, Session};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Durable record for one session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoredSession {
    pub session: Session,
    #[serde(with = "b64_bytes")]
    pub buffer: Vec<u8>,
    /// Highest sequence assigned to the persisted buffer; the restored
    /// session continues from this plus one.
    #[serde(default)]
    pub last_sequence: u64,
    pub cwd: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub patterns: Vec<PatternConfig>,
}

/// Durable map from session id to [`StoredSession`].
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the storage directory. Must succeed before any other call;
    /// failures here are fatal to startup.
    pub async fn init(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o700);
            tokio::fs::set_permissions(&self.dir, perms).await?;
        }
        Ok(())
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Atomic-replace write of the full record.
    pub async fn save(&self, stored: &StoredSession) -> Result<()> {
        let path = self.record_path(&stored.session.id);
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(stored)?;
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    pub async fn load(&self, id: &str) -> Result<Option<StoredSession>> {
        let path = self.record_path(id);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Scan the directory for records. Malformed files are logged and
    /// skipped; startup never aborts because of one bad record. The caller
    /// decides when a bad record is deleted (after its respawn fails).
    pub async fn load_all(&self) -> HashMap<String, StoredSession> {
        let mut result = HashMap::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("failed to scan session store {:?}: {}", self.dir, e);
                return result;
            }
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().map_or(true, |e| e != "json") {
                continue;
            }
            let content = match tokio::fs::read_to_string(&path).await {
                Ok(content) => content,
                Err(e) => {
                    warn!("failed to read session record {:?}: {}", path, e);
                    continue;
                }
            };
            match serde_json::from_str::<StoredSession>(&content) {
                Ok(stored) => {
                    debug!(
                        "loaded session record {} ({} buffered bytes)",
                        stored.session.id,
                        stored.buffer.len()
                    );
                    result.insert(stored.session.id.clone(), stored);
                }
                Err(e) => {
                    warn!("skipping malformed session record {:?}: {}", path, e);
                }
            }
        }
        result
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        match tokio::fs::remove_file(self.record_path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn delete_all(&self) -> Result<()> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().map_or(false, |e| e == "json") {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    warn!("failed to delete session record {:?}: {}", path, e);
                }
            }
        }
        Ok(())
    }

    /// Read-modify-write of the buffer snapshot. Returns `true` when a write
    /// happened; identical bytes are a no-op so steady output does not cause
    /// write amplification.
    pub async fn update_buffer(&self, id: &str, buffer: &[u8], last_sequence: u64) -> Result<bool> {
        let mut stored = self
            .load(id)
            .await?
            .ok_or_else(|| ShelltenderError::SessionNotFound(id.to_string()))?;
        if stored.buffer == buffer && stored.last_sequence == last_sequence {
            return Ok(false);
        }
        stored.buffer = buffer.to_vec();
        stored.last_sequence = last_sequence;
        self.save(&stored).await?;
        Ok(true)
    }

    pub async fn save_patterns(&self, id: &str, patterns: &[PatternConfig]) -> Result<()> {
        let mut stored = self
            .load(id)
            .await?
            .ok_or_else(|| ShelltenderError::SessionNotFound(id.to_string()))?;
        stored.patterns = patterns.to_vec();
        self.save(&stored).await
    }

    pub async fn get_patterns(&self, id: &str) -> Result<Vec<PatternConfig>> {
        Ok(self
            .load(id)
            .await?
            .map(|stored| stored.patterns)
            .unwrap_or_default())
    }
}

mod b64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn sample_session(id: &str) -> Session {
        Session {
            id: id.to_string(),
            created_at: Utc::now(),
            last_accessed_at: Utc::now(),
            cols: 80,
            rows: 24,
            command: "/bin/sh".to_string(),
            args: vec![],
            cwd: "/tmp".to_string(),
            env: HashMap::new(),
            locked: false,
            restrictions: None,
        }
    }

    fn sample_record(id: &str, buffer: &[u8]) -> StoredSession {
        StoredSession {
            session: sample_session(id),
            buffer: buffer.to_vec(),
            last_sequence: 3,
            cwd: "/tmp".to_string(),
            env: HashMap::new(),
            patterns: vec![],
        }
    }

    #[tokio::test]
    async fn save_and_load_round_trip_is_byte_exact() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path());
        store.init().await.unwrap();

        // Includes invalid UTF-8 to prove the buffer survives untouched.
        let buffer = vec![0x48, 0x49, 0xff, 0xfe, 0x1b, b'[', b'm'];
        let record = sample_record("s1", &buffer);
        store.save(&record).await.unwrap();

        let loaded = store.load("s1").await.unwrap().unwrap();
        assert_eq!(loaded.buffer, buffer);
        assert_eq!(loaded.last_sequence, 3);
        assert_eq!(loaded.session.id, "s1");
    }

    #[tokio::test]
    async fn update_buffer_noops_on_identical_bytes() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path());
        store.init().await.unwrap();
        store.save(&sample_record("s1", b"HELLO")).await.unwrap();

        assert!(store.update_buffer("s1", b"HELLO WORLD", 5).await.unwrap());
        assert!(!store.update_buffer("s1", b"HELLO WORLD", 5).await.unwrap());
        assert!(store.update_buffer("s1", b"HELLO WORLD!", 6).await.unwrap());
    }

    #[tokio::test]
    async fn load_all_skips_malformed_records() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path());
        store.init().await.unwrap();
        store.save(&sample_record("good", b"ok")).await.unwrap();
        tokio::fs::write(dir.path().join("bad.json"), "{not json")
            .await
            .unwrap();

        let all = store.load_all().await;
        assert_eq!(all.len(), 1);
        assert!(all.contains_key("good"));
        // The malformed file is left in place for the caller to decide on.
        assert!(dir.path().join("bad.json").exists());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path());
        store.init().await.unwrap();
        store.save(&sample_record("s1", b"x")).await.unwrap();

        store.delete("s1").await.unwrap();
        store.delete("s1").await.unwrap();
        assert!(store.load("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn patterns_round_trip() {
        use shelltender_types::{PatternKind, PatternOptions};
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path());
        store.init().await.unwrap();
        store.save(&sample_record("s1", b"")).await.unwrap();

        let patterns = vec![PatternConfig {
            name: "errors".to_string(),
            kind: PatternKind::Regex,
            pattern: "ERROR".to_string(),
            options: PatternOptions {
                debounce: 500,
                multiline: false,
                context_lines: None,
            },
        }];
        store.save_patterns("s1", &patterns).await.unwrap();
        let loaded = store.get_patterns("s1").await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "errors");
    }
}
