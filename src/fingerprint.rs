use std::fmt;

use sha2::{Digest, Sha256};

/// Length of a profile id in hex characters.
pub const PROFILE_ID_LEN: usize = 32;

/// Hex-encoded SHA-256 digest of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// 32-hex content address used for profile ids (leading 128 bits of SHA-256).
pub fn profile_digest(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    hex::encode(&digest[..PROFILE_ID_LEN / 2])
}

/// Wire format tag prepended to response cache keys so the three request
/// shapes never share an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FormatTag {
    Wire,
    Json,
    WirePost,
}

impl FormatTag {
    pub fn prefix(self) -> &'static str {
        match self {
            FormatTag::Wire => "wire",
            FormatTag::Json => "json",
            FormatTag::WirePost => "wirePost",
        }
    }
}

impl fmt::Display for FormatTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Content address of a forwarded DNS response.
///
/// Renders as `<tag>-<sha256>` for plain requests on the default upstream.
/// Profile-bearing requests and non-default providers get their own
/// namespace in front of that, e.g. `p:<id>/json-<sha256>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    provider: Option<String>,
    profile: Option<String>,
    tag: FormatTag,
    digest: String,
}

impl CacheKey {
    pub fn new(tag: FormatTag, raw_query: &[u8]) -> Self {
        Self {
            provider: None,
            profile: None,
            tag,
            digest: sha256_hex(raw_query),
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_profile(mut self, profile_id: impl Into<String>) -> Self {
        self.profile = Some(profile_id.into());
        self
    }

    pub fn tag(&self) -> FormatTag {
        self.tag
    }

    pub fn storage_key(&self) -> String {
        let mut key = String::new();
        if let Some(provider) = &self.provider {
            key.push_str("u:");
            key.push_str(provider);
            key.push('/');
        }
        if let Some(profile) = &self.profile {
            key.push_str("p:");
            key.push_str(profile);
            key.push('/');
        }
        key.push_str(self.tag.prefix());
        key.push('-');
        key.push_str(&self.digest);
        key
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.storage_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_hex_is_stable() {
        let first = sha256_hex(b"dns=AAABAAABAAAAAAAAA2NvbQAAAQAB");
        let second = sha256_hex(b"dns=AAABAAABAAAAAAAAA2NvbQAAAQAB");
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn profile_digest_is_32_hex() {
        let id = profile_digest(br#"{"blocked":["a.com"]}"#);
        assert_eq!(id.len(), PROFILE_ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(id, profile_digest(br#"{"blocked":["a.com"]}"#));
    }

    #[test]
    fn cache_keys_separate_formats() {
        let raw = b"name=example.com&type=A";
        let wire = CacheKey::new(FormatTag::Wire, raw).storage_key();
        let json = CacheKey::new(FormatTag::Json, raw).storage_key();
        let post = CacheKey::new(FormatTag::WirePost, raw).storage_key();
        assert_eq!(wire, format!("wire-{}", sha256_hex(raw)));
        assert_eq!(json, format!("json-{}", sha256_hex(raw)));
        assert_eq!(post, format!("wirePost-{}", sha256_hex(raw)));
        assert_ne!(wire, json);
        assert_ne!(wire, post);
    }

    #[test]
    fn namespaced_keys_never_collide_with_plain_keys() {
        let raw = b"name=example.com";
        let plain = CacheKey::new(FormatTag::Json, raw);
        let profiled = plain.clone().with_profile("0123456789abcdef0123456789abcdef");
        let family = plain.clone().with_provider("cloudflare-family");
        assert_ne!(plain.storage_key(), profiled.storage_key());
        assert_ne!(plain.storage_key(), family.storage_key());
        assert!(profiled.storage_key().ends_with(&plain.storage_key()));
        assert_eq!(
            family.with_profile("ab").storage_key(),
            format!("u:cloudflare-family/p:ab/json-{}", sha256_hex(raw))
        );
    }
}
