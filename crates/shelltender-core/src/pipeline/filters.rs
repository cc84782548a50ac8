//! Built-in filters

use super::{DataFilter, ProcessedDataEvent};
use shelltender_types::DataSource;
use std::collections::HashSet;

/// Rejects chunks containing control bytes other than `\t`, `\n`, `\r`
/// and ESC.
pub struct NoBinary;

impl NoBinary {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NoBinary {
    fn default() -> Self {
        Self::new()
    }
}

impl DataFilter for NoBinary {
    fn name(&self) -> &str {
        "no-binary"
    }

    fn accept(&self, event: &ProcessedDataEvent) -> anyhow::Result<bool> {
        Ok(!event
            .processed_data
            .iter()
            .any(|&b| (b < 0x20 && !matches!(b, b'\t' | b'\n' | b'\r' | 0x1b)) || b == 0x7f))
    }
}

/// Only passes chunks for the configured sessions.
pub struct SessionAllowlist {
    allowed: HashSet<String>,
}

impl SessionAllowlist {
    pub fn new(allowed: impl IntoIterator<Item = String>) -> Self {
        Self {
            allowed: allowed.into_iter().collect(),
        }
    }
}

impl DataFilter for SessionAllowlist {
    fn name(&self) -> &str {
        "session-allowlist"
    }

    fn accept(&self, event: &ProcessedDataEvent) -> anyhow::Result<bool> {
        Ok(self.allowed.contains(&event.session_id))
    }
}

/// Rejects chunks larger than the limit.
pub struct MaxDataSize {
    limit: usize,
}

impl MaxDataSize {
    pub fn new(limit: usize) -> Self {
        Self { limit }
    }
}

impl DataFilter for MaxDataSize {
    fn name(&self) -> &str {
        "max-data-size"
    }

    fn accept(&self, event: &ProcessedDataEvent) -> anyhow::Result<bool> {
        Ok(event.processed_data.len() <= self.limit)
    }
}

/// Only passes chunks from the configured sources.
pub struct SourceFilter {
    allowed: HashSet<DataSource>,
}

impl SourceFilter {
    pub fn new(allowed: impl IntoIterator<Item = DataSource>) -> Self {
        Self {
            allowed: allowed.into_iter().collect(),
        }
    }
}

impl DataFilter for SourceFilter {
    fn name(&self) -> &str {
        "source-filter"
    }

    fn accept(&self, event: &ProcessedDataEvent) -> anyhow::Result<bool> {
        Ok(self.allowed.contains(&event.metadata.source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ChunkMetadata;
    use bytes::Bytes;
    use chrono::Utc;

    fn event(session_id: &str, data: &[u8], source: DataSource) -> ProcessedDataEvent {
        ProcessedDataEvent {
            session_id: session_id.to_string(),
            timestamp: Utc::now(),
            original_data: Bytes::copy_from_slice(data),
            processed_data: Bytes::copy_from_slice(data),
            transformations: Vec::new(),
            metadata: ChunkMetadata::from_source(source),
        }
    }

    #[test]
    fn no_binary_allows_terminal_control_bytes() {
        let filter = NoBinary::new();
        assert!(filter
            .accept(&event("s1", b"ok\t\r\n\x1b[0m", DataSource::Pty))
            .unwrap());
        assert!(!filter
            .accept(&event("s1", b"bad\x00byte", DataSource::Pty))
            .unwrap());
        assert!(!filter
            .accept(&event("s1", b"del\x7f", DataSource::Pty))
            .unwrap());
    }

    #[test]
    fn session_allowlist_filters_by_id() {
        let filter = SessionAllowlist::new(["s1".to_string()]);
        assert!(filter.accept(&event("s1", b"x", DataSource::Pty)).unwrap());
        assert!(!filter.accept(&event("s2", b"x", DataSource::Pty)).unwrap());
    }

    #[test]
    fn max_data_size_rejects_oversized_chunks() {
        let filter = MaxDataSize::new(3);
        assert!(filter.accept(&event("s1", b"abc", DataSource::Pty)).unwrap());
        assert!(!filter
            .accept(&event("s1", b"abcd", DataSource::Pty))
            .unwrap());
    }

    #[test]
    fn source_filter_passes_allowed_sources_only() {
        let filter = SourceFilter::new([DataSource::Pty, DataSource::User]);
        assert!(filter.accept(&event("s1", b"x", DataSource::Pty)).unwrap());
        assert!(!filter
            .accept(&event("s1", b"x", DataSource::Admin))
            .unwrap());
    }
}
