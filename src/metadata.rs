//! Metadata Cache.
//!
//! Single-writer, multi-reader, process-lifetime store for the first
//! "metadata" line seen from any agent payload: one `Mutex`-guarded piece
//! of shared state handed out as a cheap `Arc` clone, first-writer-wins.

use std::sync::Arc;
use tokio::sync::Mutex;

/// Process-wide cache for the captured metadata line.
#[derive(Clone, Default)]
pub struct MetadataCache {
    inner: Arc<Mutex<Option<Arc<[u8]>>>>,
}

impl MetadataCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempt to capture `line` as the metadata document. No-op if a
    /// document has already been captured (first-writer-wins).
    pub async fn try_capture(&self, line: &[u8]) {
        let mut guard = self.inner.lock().await;
        if guard.is_none() {
            *guard = Some(Arc::from(line));
        }
    }

    /// Returns a cheap clone of the captured bytes, if any.
    pub async fn get(&self) -> Option<Arc<[u8]>> {
        self.inner.lock().await.clone()
    }
}

/// True if `line`'s first JSON key, case-insensitively, is "metadata".
///
/// The check is intentionally loose (substring match on the key position)
/// because the detection only needs to recognize the marker line, not fully
/// parse it — the raw bytes are what gets cached and later re-emitted
/// verbatim.
pub fn looks_like_metadata_line(line: &[u8]) -> bool {
    let text = String::from_utf8_lossy(line);
    let trimmed = text.trim_start();
    if !trimmed.starts_with('{') {
        return false;
    }
    let after_brace = trimmed[1..].trim_start();
    after_brace
        .trim_start_matches('"')
        .to_ascii_lowercase()
        .starts_with("metadata")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_looks_like_metadata_line() {
        assert!(looks_like_metadata_line(br#"{"metadata":{"service":{}}}"#));
        assert!(looks_like_metadata_line(br#"  { "METADATA": {} }"#));
        assert!(!looks_like_metadata_line(br#"{"transaction":{}}"#));
        assert!(!looks_like_metadata_line(b"not json at all"));
    }

    #[tokio::test]
    async fn test_first_writer_wins() {
        let cache = MetadataCache::new();
        cache.try_capture(b"first").await;
        cache.try_capture(b"second").await;

        let got = cache.get().await.unwrap();
        assert_eq!(&*got, b"first");
    }

    #[tokio::test]
    async fn test_concurrent_captures_converge_to_first_success() {
        let cache = MetadataCache::new();
        let mut handles = Vec::new();
        for i in 0..16u8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache.try_capture(&[i]).await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        // Exactly one of the 16 writes won; the cache is not empty and
        // holds a single byte from the set that raced.
        let got = cache.get().await.unwrap();
        assert_eq!(got.len(), 1);
        assert!(*got.first().unwrap() < 16);
    }

    #[tokio::test]
    async fn test_empty_before_any_write() {
        let cache = MetadataCache::new();
        assert!(cache.get().await.is_none());
    }
}
