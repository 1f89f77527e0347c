use std::collections::BTreeSet;

use bytes::Bytes;
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::ProfileSection;
use crate::fingerprint::{PROFILE_ID_LEN, profile_digest};
use crate::store::{CacheStore, Durability, StoreError};

const MAX_HOSTNAME_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

/// A content-addressed block-list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    id: String,
    blocked: BTreeSet<String>,
}

/// Canonical serialised form; field order and sorting define the id.
#[derive(Debug, Deserialize)]
struct CanonicalProfile {
    blocked: Vec<String>,
}

impl Profile {
    /// Build a profile from already-validated hostnames. The id is always
    /// derived from the sorted, lowercased set.
    fn from_hosts(hosts: impl IntoIterator<Item = String>) -> Self {
        let blocked: BTreeSet<String> = hosts
            .into_iter()
            .map(|host| host.to_ascii_lowercase())
            .collect();
        let id = profile_digest(&Self::canonical_bytes(&blocked));
        Self { id, blocked }
    }

    fn canonical_bytes(blocked: &BTreeSet<String>) -> Vec<u8> {
        json!({ "blocked": blocked }).to_string().into_bytes()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn blocked(&self) -> impl Iterator<Item = &str> {
        self.blocked.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.blocked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocked.is_empty()
    }

    /// Exact, case-insensitive membership. A trailing root dot is ignored.
    pub fn blocks(&self, name: &str) -> bool {
        let candidate = name.trim_end_matches('.').to_ascii_lowercase();
        self.blocked.contains(&candidate)
    }

    pub fn canonical_json(&self) -> Vec<u8> {
        Self::canonical_bytes(&self.blocked)
    }
}

/// Outcome of validating a submitted profile document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Valid(Profile),
    Invalid(String),
}

/// Check a submitted document and, if it is well formed, return its
/// canonical profile.
pub fn validate(document: &[u8]) -> Validation {
    let value: Value = match serde_json::from_slice(document) {
        Ok(value) => value,
        Err(err) => return Validation::Invalid(format!("invalid JSON: {err}")),
    };

    let Some(object) = value.as_object() else {
        return Validation::Invalid("profile must be a JSON object".into());
    };
    let Some(blocked) = object.get("blocked") else {
        return Validation::Invalid("profile is missing the `blocked` list".into());
    };
    let Some(entries) = blocked.as_array() else {
        return Validation::Invalid("`blocked` must be an array".into());
    };

    let mut hosts = Vec::with_capacity(entries.len());
    for (index, entry) in entries.iter().enumerate() {
        let Some(host) = entry.as_str() else {
            return Validation::Invalid(format!("blocked[{index}] is not a string"));
        };
        if !is_valid_hostname(host) {
            return Validation::Invalid(format!("blocked[{index}] is not a valid hostname: {host:?}"));
        }
        hosts.push(host.to_string());
    }

    Validation::Valid(Profile::from_hosts(hosts))
}

/// Hostname grammar: dot-separated labels of ASCII letters, digits and
/// hyphens, none empty and none starting or ending with a hyphen.
pub fn is_valid_hostname(host: &str) -> bool {
    if host.is_empty() || host.len() > MAX_HOSTNAME_LEN {
        return false;
    }
    host.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= MAX_LABEL_LEN
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
    })
}

/// `true` for exactly 32 hex characters.
pub fn is_profile_id(candidate: &str) -> bool {
    candidate.len() == PROFILE_ID_LEN && candidate.bytes().all(|b| b.is_ascii_hexdigit())
}

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("invalid profile: {0}")]
    Invalid(String),
    #[error("malformed profile id")]
    MalformedId,
    #[error("stored profile {id} is corrupt: {message}")]
    Corrupt { id: String, message: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Persists and retrieves profiles through the two-tier store.
#[derive(Clone)]
pub struct ProfileStore {
    store: CacheStore,
    settings: ProfileSection,
}

impl ProfileStore {
    pub fn new(store: CacheStore, settings: ProfileSection) -> Self {
        Self { store, settings }
    }

    fn storage_key(id: &str) -> String {
        format!("profile-{}", id.to_ascii_lowercase())
    }

    /// Validate, canonicalise and persist a profile, returning its id.
    pub async fn create(&self, document: &[u8]) -> Result<Profile, ProfileError> {
        let profile = match validate(document) {
            Validation::Valid(profile) => profile,
            Validation::Invalid(reason) => return Err(ProfileError::Invalid(reason)),
        };

        self.store
            .put(
                &Self::storage_key(profile.id()),
                Bytes::from(profile.canonical_json()),
                self.settings.edge_ttl(),
                Durability::Durable {
                    ttl: self.settings.store_ttl(),
                },
            )
            .await?;

        info!(id = %profile.id(), entries = profile.len(), "Stored profile");
        Ok(profile)
    }

    /// Fetch a profile by id. Malformed ids are rejected before touching
    /// either tier.
    pub async fn lookup(&self, id: &str) -> Result<Option<Profile>, ProfileError> {
        if !is_profile_id(id) {
            return Err(ProfileError::MalformedId);
        }

        let Some(raw) = self
            .store
            .get(&Self::storage_key(id), Some(self.settings.refill_ttl()))
            .await?
        else {
            debug!(id = %id, "Profile not found");
            return Ok(None);
        };

        let canonical: CanonicalProfile =
            serde_json::from_slice(&raw).map_err(|err| ProfileError::Corrupt {
                id: id.to_string(),
                message: err.to_string(),
            })?;
        Ok(Some(Profile::from_hosts(canonical.blocked)))
    }

    pub async fn delete(&self, id: &str) -> Result<(), ProfileError> {
        if !is_profile_id(id) {
            return Err(ProfileError::MalformedId);
        }
        self.store.delete(&Self::storage_key(id)).await?;
        info!(id = %id, "Deleted profile");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryEdgeCache, SqliteKvStore};
    use anyhow::Result;
    use std::sync::Arc;

    fn store() -> Result<ProfileStore> {
        let cache = CacheStore::new(
            Arc::new(MemoryEdgeCache::new(64)),
            Some(Arc::new(SqliteKvStore::open_in_memory()?)),
        );
        Ok(ProfileStore::new(cache, ProfileSection::default()))
    }

    fn valid(document: &str) -> Profile {
        match validate(document.as_bytes()) {
            Validation::Valid(profile) => profile,
            Validation::Invalid(reason) => panic!("expected valid profile, got {reason}"),
        }
    }

    #[test]
    fn hostname_grammar() {
        for bad in ["a..b", "-a.com", "a-.com", "", ".a.com", "a.com.", "a_b.com", "ex ample.com"] {
            assert!(!is_valid_hostname(bad), "{bad:?} should be rejected");
        }
        for good in ["a.com", "sub.a-b.com", "xn--a.com", "localhost", "A.COM", "1.2.3.4"] {
            assert!(is_valid_hostname(good), "{good:?} should be accepted");
        }
        assert!(!is_valid_hostname(&format!("{}.com", "a".repeat(64))));
        assert!(is_valid_hostname(&format!("{}.com", "a".repeat(63))));
    }

    #[test]
    fn profile_id_shape() {
        assert!(is_profile_id("0123456789abcdef0123456789ABCDEF"));
        assert!(!is_profile_id("0123456789abcdef0123456789abcde"));
        assert!(!is_profile_id("0123456789abcdef0123456789abcdeg"));
        assert!(!is_profile_id("dns"));
    }

    #[test]
    fn submission_order_does_not_change_id() {
        let first = valid(r#"{"blocked":["b.com","a.com"]}"#);
        let second = valid(r#"{"blocked":["a.com","b.com"]}"#);
        assert_eq!(first.id(), second.id());
        assert_eq!(first.canonical_json(), br#"{"blocked":["a.com","b.com"]}"#.to_vec());
    }

    #[test]
    fn case_and_duplicates_collapse() {
        let first = valid(r#"{"blocked":["Ads.Example.com","ads.example.com"]}"#);
        let second = valid(r#"{"blocked":["ads.example.com"]}"#);
        assert_eq!(first.id(), second.id());
        assert_eq!(first.len(), 1);
        assert!(first.blocks("ADS.example.com."));
        assert!(!first.blocks("example.com"));
    }

    #[test]
    fn schema_violations_are_invalid() {
        for document in [
            "not json",
            "[]",
            r#"{"allowed":[]}"#,
            r#"{"blocked":"a.com"}"#,
            r#"{"blocked":[1]}"#,
            r#"{"blocked":["a..b"]}"#,
        ] {
            assert!(
                matches!(validate(document.as_bytes()), Validation::Invalid(_)),
                "{document} should be invalid"
            );
        }
        assert!(matches!(
            validate(br#"{"blocked":[]}"#),
            Validation::Valid(_)
        ));
    }

    #[tokio::test]
    async fn create_then_lookup_round_trips() -> Result<()> {
        let profiles = store()?;
        let created = profiles
            .create(br#"{"blocked":["ads.example.com","tracker.example"]}"#)
            .await?;
        let loaded = profiles.lookup(created.id()).await?.expect("profile stored");
        assert_eq!(loaded, created);
        assert!(loaded.blocks("tracker.example"));
        Ok(())
    }

    #[tokio::test]
    async fn create_rejects_invalid_documents() -> Result<()> {
        let profiles = store()?;
        let result = profiles.create(br#"{"blocked":["-bad.com"]}"#).await;
        assert!(matches!(result, Err(ProfileError::Invalid(_))));
        Ok(())
    }

    #[tokio::test]
    async fn lookup_rejects_malformed_ids() -> Result<()> {
        let profiles = store()?;
        assert!(matches!(
            profiles.lookup("not-an-id").await,
            Err(ProfileError::MalformedId)
        ));
        assert!(profiles.lookup(&"0".repeat(32)).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn delete_removes_profile() -> Result<()> {
        let profiles = store()?;
        let created = profiles.create(br#"{"blocked":["a.com"]}"#).await?;
        profiles.delete(created.id()).await?;
        assert!(profiles.lookup(created.id()).await?.is_none());
        Ok(())
    }
}
