//! Deterministic content hash for item dedup: SHA-256 truncated to 128 bits
//! over `(feed_id, guid ?? link ?? title+published)` (spec §3, §4.4).

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

pub fn content_hash(
    feed_id: i64,
    guid: Option<&str>,
    link: Option<&str>,
    title: Option<&str>,
    published_at: Option<DateTime<Utc>>,
) -> String {
    let key = guid
        .filter(|s| !s.is_empty())
        .or_else(|| link.filter(|s| !s.is_empty()))
        .map(|s| s.to_string())
        .unwrap_or_else(|| {
            format!(
                "{}|{}",
                title.unwrap_or_default(),
                published_at.map(|d| d.to_rfc3339()).unwrap_or_default()
            )
        });

    let mut hasher = Sha256::new();
    hasher.update(feed_id.to_le_bytes());
    hasher.update(key.as_bytes());
    let digest = hasher.finalize();
    // Truncate to 128 bits (16 bytes) and hex-encode.
    digest[..16].iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_for_same_guid() {
        let a = content_hash(1, Some("guid-1"), None, None, None);
        let b = content_hash(1, Some("guid-1"), None, None, None);
        assert_eq!(a, b);
    }

    #[test]
    fn differs_across_feeds() {
        let a = content_hash(1, Some("guid-1"), None, None, None);
        let b = content_hash(2, Some("guid-1"), None, None, None);
        assert_ne!(a, b);
    }

    #[test]
    fn falls_back_to_title_and_published_when_no_guid_or_link() {
        let now = Utc::now();
        let a = content_hash(1, None, None, Some("Title"), Some(now));
        let b = content_hash(1, None, None, Some("Title"), Some(now));
        assert_eq!(a, b);
    }

    #[test]
    fn independent_of_insertion_time() {
        // R3: the hash is a pure function of its inputs, computed twice here
        // with an artificial delay to assert no wall-clock dependency leaks in.
        let a = content_hash(7, Some("abc"), None, None, None);
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = content_hash(7, Some("abc"), None, None, None);
        assert_eq!(a, b);
    }
}
