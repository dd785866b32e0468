use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::config::AppConfig;
use crate::wire::envelope::RequestParams;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContentPolicy {
    /// A nonce is deleted by the first successful read.
    SingleUse,
    /// A nonce stays readable until it expires.
    Reusable,
}

impl ContentPolicy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "single_use" => Some(Self::SingleUse),
            "reusable" => Some(Self::Reusable),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SingleUse => "single_use",
            Self::Reusable => "reusable",
        }
    }
}

#[derive(Debug)]
pub enum ContentError {
    UnknownPolicy(String),
    ZeroTtl,
}

impl fmt::Display for ContentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownPolicy(raw) => write!(
                f,
                "unknown broker.content_policy '{raw}' (expected single_use or reusable)"
            ),
            Self::ZeroTtl => write!(f, "broker.content_ttl_ms must be greater than zero"),
        }
    }
}

impl std::error::Error for ContentError {}

/// Authorized content read waiting for its second-phase request.
#[derive(Clone, Debug, PartialEq)]
pub struct ContentEntry {
    pub sender_identity: String,
    pub params: RequestParams,
}

struct Slot {
    entry: ContentEntry,
    created_at: Instant,
}

/// Nonce-keyed cache of authorized content queries. Nonces live for the process only.
pub struct ContentCache {
    policy: ContentPolicy,
    ttl: Duration,
    slots: Mutex<HashMap<String, Slot>>,
}

impl ContentCache {
    pub fn new(policy: ContentPolicy, ttl: Duration) -> Self {
        Self {
            policy,
            ttl,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_app_config(config: &AppConfig) -> Result<Self, ContentError> {
        let policy = ContentPolicy::parse(&config.broker.content_policy)
            .ok_or_else(|| ContentError::UnknownPolicy(config.broker.content_policy.clone()))?;
        if config.broker.content_ttl_ms == 0 {
            return Err(ContentError::ZeroTtl);
        }
        Ok(Self::new(
            policy,
            Duration::from_millis(config.broker.content_ttl_ms),
        ))
    }

    pub fn policy(&self) -> ContentPolicy {
        self.policy
    }

    pub fn store(&self, entry: ContentEntry) -> String {
        self.store_at(entry, Instant::now())
    }

    pub fn store_at(&self, entry: ContentEntry, now: Instant) -> String {
        // 128 random bits, hex encoded.
        let nonce = Uuid::new_v4().simple().to_string();
        self.slots.lock().expect("content cache mutex poisoned").insert(
            nonce.clone(),
            Slot {
                entry,
                created_at: now,
            },
        );
        nonce
    }

    pub fn take(&self, nonce: &str) -> Option<ContentEntry> {
        self.take_at(nonce, Instant::now())
    }

    /// Expired entries are treated as missing and dropped.
    pub fn take_at(&self, nonce: &str, now: Instant) -> Option<ContentEntry> {
        let mut slots = self.slots.lock().expect("content cache mutex poisoned");
        let expired = slots
            .get(nonce)
            .map(|slot| now.saturating_duration_since(slot.created_at) >= self.ttl)?;
        if expired {
            slots.remove(nonce);
            return None;
        }

        match self.policy {
            ContentPolicy::SingleUse => slots.remove(nonce).map(|slot| slot.entry),
            ContentPolicy::Reusable => slots.get(nonce).map(|slot| slot.entry.clone()),
        }
    }

    /// Returns how many entries were dropped.
    pub fn purge_expired(&self, now: Instant) -> usize {
        let mut slots = self.slots.lock().expect("content cache mutex poisoned");
        let before = slots.len();
        slots.retain(|_, slot| now.saturating_duration_since(slot.created_at) < self.ttl);
        before - slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().expect("content cache mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::{Duration, Instant};

    use crate::config::AppConfig;
    use crate::wire::envelope::RequestParams;

    use super::{ContentCache, ContentEntry, ContentError, ContentPolicy};

    fn entry(uri: &str) -> ContentEntry {
        ContentEntry {
            sender_identity: "com.example.contacts".to_owned(),
            params: RequestParams::new("Query").with_arg("uri", uri),
        }
    }

    #[test]
    fn single_use_nonce_is_consumed_by_first_take() {
        let cache = ContentCache::new(ContentPolicy::SingleUse, Duration::from_secs(60));
        let nonce = cache.store(entry("content://contacts"));

        assert_eq!(cache.take(&nonce), Some(entry("content://contacts")));
        assert_eq!(cache.take(&nonce), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn reusable_nonce_survives_repeated_takes() {
        let cache = ContentCache::new(ContentPolicy::Reusable, Duration::from_secs(60));
        let nonce = cache.store(entry("content://contacts"));

        for _ in 0..3 {
            assert_eq!(cache.take(&nonce), Some(entry("content://contacts")));
        }
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn expired_entries_are_missing_and_purged() {
        let cache = ContentCache::new(ContentPolicy::Reusable, Duration::from_millis(100));
        let start = Instant::now();
        let old = cache.store_at(entry("content://old"), start);
        let fresh = cache.store_at(entry("content://fresh"), start + Duration::from_millis(80));

        assert_eq!(cache.take_at(&old, start + Duration::from_millis(150)), None);
        assert_eq!(cache.purge_expired(start + Duration::from_millis(150)), 0);
        assert_eq!(cache.purge_expired(start + Duration::from_millis(200)), 1);
        assert_eq!(cache.take_at(&fresh, start + Duration::from_millis(200)), None);
    }

    #[test]
    fn nonces_are_long_and_distinct() {
        let cache = ContentCache::new(ContentPolicy::SingleUse, Duration::from_secs(60));
        let nonces: HashSet<String> = (0..64).map(|_| cache.store(entry("content://x"))).collect();

        assert_eq!(nonces.len(), 64);
        assert!(nonces.iter().all(|nonce| nonce.len() == 32));
    }

    #[test]
    fn config_selects_policy_and_rejects_unknown_values() {
        let mut config = AppConfig::default();
        let cache = ContentCache::from_app_config(&config).expect("defaults should be valid");
        assert_eq!(cache.policy(), ContentPolicy::SingleUse);

        config.broker.content_policy = "forever".to_owned();
        assert!(matches!(
            ContentCache::from_app_config(&config),
            Err(ContentError::UnknownPolicy(_))
        ));
    }
}
