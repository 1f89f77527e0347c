//! Per-request decision engine: parse the inbound query, check the selected
//! profile, then either synthesize a refusal or forward upstream through the
//! response cache.

use std::{str::FromStr, sync::Arc, time::Duration};

use axum::http::StatusCode;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use bytes::Bytes;
use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::RecordType;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::FeatureSection;
use crate::fingerprint::{CacheKey, FormatTag};
use crate::metrics::ProxyMetrics;
use crate::profile::{Profile, ProfileError, ProfileStore, is_profile_id};
use crate::store::{CacheStore, Durability};
use crate::upstream::{
    BodyStream, DnsFormat, ProviderTable, Upstream, UpstreamError, UpstreamProvider,
    UpstreamRequest, fan_out, normalise_host,
};

const DNS_STATUS_REFUSED: u16 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryMethod {
    Get,
    Post,
}

/// Inbound request descriptor. Immutable once parsed.
#[derive(Debug, Clone)]
pub struct Query {
    format: DnsFormat,
    method: QueryMethod,
    raw_query: Bytes,
    target_host: String,
    profile_selector: Option<String>,
}

impl Query {
    /// `raw_query` is the query string without the leading `?`. The format is
    /// JSON only when `Accept` asks for `application/dns-json`.
    pub fn from_get(host: &str, raw_query: &str, accept: Option<&str>) -> Self {
        let format = match accept {
            Some(value) if accepts_json(value) => DnsFormat::Json,
            _ => DnsFormat::Wire,
        };
        let (profile_selector, target_host) = split_profile_host(host);
        Self {
            format,
            method: QueryMethod::Get,
            raw_query: Bytes::copy_from_slice(raw_query.as_bytes()),
            target_host,
            profile_selector,
        }
    }

    pub fn from_post(host: &str, body: Bytes) -> Self {
        let (profile_selector, target_host) = split_profile_host(host);
        Self {
            format: DnsFormat::Wire,
            method: QueryMethod::Post,
            raw_query: body,
            target_host,
            profile_selector,
        }
    }

    pub fn format(&self) -> DnsFormat {
        self.format
    }

    pub fn method(&self) -> QueryMethod {
        self.method
    }

    pub fn raw_query(&self) -> &[u8] {
        &self.raw_query
    }

    pub fn target_host(&self) -> &str {
        &self.target_host
    }

    pub fn profile_selector(&self) -> Option<&str> {
        self.profile_selector.as_deref()
    }

    pub fn format_tag(&self) -> FormatTag {
        match (self.method, self.format) {
            (QueryMethod::Post, _) => FormatTag::WirePost,
            (QueryMethod::Get, DnsFormat::Wire) => FormatTag::Wire,
            (QueryMethod::Get, DnsFormat::Json) => FormatTag::Json,
        }
    }

    fn upstream_request(&self) -> UpstreamRequest {
        match self.method {
            QueryMethod::Get => UpstreamRequest::Get {
                format: self.format,
                query: String::from_utf8_lossy(&self.raw_query).into_owned(),
            },
            QueryMethod::Post => UpstreamRequest::Post {
                body: self.raw_query.clone(),
            },
        }
    }

    fn query_param(&self, wanted: &str) -> Option<String> {
        url::form_urlencoded::parse(&self.raw_query)
            .find(|(key, _)| key == wanted)
            .map(|(_, value)| value.into_owned())
    }

    /// Extract the question. Wire requests are decoded as DNS messages;
    /// JSON requests read the `name` and `type` parameters.
    pub fn question(&self) -> Result<Question, QueryError> {
        match (self.method, self.format) {
            (QueryMethod::Get, DnsFormat::Json) => {
                let name = self
                    .query_param("name")
                    .filter(|name| !name.trim().is_empty())
                    .ok_or_else(|| QueryError::InvalidInput("missing name parameter".into()))?;
                let record_type = record_type_code(self.query_param("type").as_deref());
                Ok(Question {
                    name: normalise_name(&name),
                    record_type,
                    wire: None,
                })
            }
            (QueryMethod::Get, DnsFormat::Wire) => {
                let encoded = self
                    .query_param("dns")
                    .ok_or_else(|| QueryError::InvalidInput("missing dns parameter".into()))?;
                let payload = URL_SAFE_NO_PAD
                    .decode(encoded.trim_end_matches('='))
                    .map_err(|_| QueryError::InvalidInput("invalid base64 payload".into()))?;
                Question::from_wire(&payload)
            }
            (QueryMethod::Post, _) => Question::from_wire(&self.raw_query),
        }
    }
}

fn accepts_json(accept: &str) -> bool {
    accept
        .split(',')
        .filter_map(|item| item.split(';').next())
        .any(|media| media.trim().eq_ignore_ascii_case(crate::upstream::DNS_JSON_CONTENT_TYPE))
}

/// Split `<32-hex>.rest` into a profile selector and the remaining host.
/// Hosts without such a leading label pass through unchanged.
pub fn split_profile_host(host: &str) -> (Option<String>, String) {
    let host = normalise_host(host);
    match host.split_once('.') {
        Some((label, rest)) if is_profile_id(label) && !rest.is_empty() => {
            (Some(label.to_string()), rest.to_string())
        }
        _ => (None, host),
    }
}

fn normalise_name(name: &str) -> String {
    name.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Numeric RR type for a `type` parameter. Mnemonics are case-insensitive,
/// numeric codes pass through, and anything else falls back to A.
pub fn record_type_code(raw: Option<&str>) -> u16 {
    let fallback = u16::from(RecordType::A);
    let Some(raw) = raw.map(str::trim).filter(|value| !value.is_empty()) else {
        return fallback;
    };
    if let Ok(code) = raw.parse::<u16>() {
        return code;
    }
    match RecordType::from_str(&raw.to_ascii_uppercase()) {
        Ok(RecordType::Unknown(_)) | Err(_) => fallback,
        Ok(record_type) => u16::from(record_type),
    }
}

#[derive(Debug, Clone)]
pub struct Question {
    pub name: String,
    pub record_type: u16,
    wire: Option<Message>,
}

impl Question {
    fn from_wire(payload: &[u8]) -> Result<Self, QueryError> {
        let message = Message::from_vec(payload)
            .map_err(|err| QueryError::InvalidInput(format!("failed to parse DNS message: {err}")))?;
        let query = message
            .queries()
            .first()
            .ok_or_else(|| QueryError::InvalidInput("DNS query missing question".into()))?;
        Ok(Self {
            name: normalise_name(&query.name().to_ascii()),
            record_type: u16::from(query.query_type()),
            wire: Some(message),
        })
    }
}

/// DNS-JSON shaped negative answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SyntheticAnswer {
    pub status: u16,
    #[serde(rename = "TC")]
    pub tc: bool,
    #[serde(rename = "RD")]
    pub rd: bool,
    #[serde(rename = "RA")]
    pub ra: bool,
    #[serde(rename = "AD")]
    pub ad: bool,
    #[serde(rename = "CD")]
    pub cd: bool,
    pub question: Vec<SyntheticQuestion>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyntheticQuestion {
    pub name: String,
    #[serde(rename = "type")]
    pub record_type: u16,
}

impl SyntheticAnswer {
    pub fn refused(name: &str, record_type: u16) -> Self {
        Self {
            status: DNS_STATUS_REFUSED,
            tc: false,
            rd: true,
            ra: true,
            ad: false,
            cd: false,
            question: vec![SyntheticQuestion {
                name: name.to_string(),
                record_type,
            }],
        }
    }
}

/// Wire-format REFUSED reply echoing the original question.
fn build_refused_message(request: &Message) -> Result<Vec<u8>, QueryError> {
    let mut response = Message::new();
    response.set_id(request.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(request.op_code());
    response.set_recursion_desired(request.recursion_desired());
    response.set_recursion_available(true);
    response.set_response_code(ResponseCode::Refused);
    response.add_queries(request.queries().to_vec());
    response
        .to_vec()
        .map_err(|err| QueryError::Internal(format!("failed to serialise refusal: {err}")))
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("invalid query: {0}")]
    InvalidInput(String),
    #[error("unknown profile {0}")]
    UnknownProfile(String),
    #[error("profile store unavailable: {0}")]
    StoreUnavailable(String),
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl QueryError {
    pub fn status(&self) -> StatusCode {
        match self {
            QueryError::InvalidInput(_) | QueryError::UnknownProfile(_) => StatusCode::BAD_REQUEST,
            QueryError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            QueryError::Upstream(_) => StatusCode::BAD_GATEWAY,
            QueryError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplySource {
    Blocked,
    Cache,
    Upstream,
}

pub enum ReplyBody {
    Empty,
    Full(Bytes),
    Stream(BodyStream),
}

/// Response envelope handed back to the HTTP layer.
pub struct DohReply {
    pub status: StatusCode,
    pub content_type: Option<&'static str>,
    pub body: ReplyBody,
    pub source: ReplySource,
    /// Attach `Access-Control-Max-Age` to this answer.
    pub advertise_max_age: bool,
}

impl DohReply {
    fn answer(format: DnsFormat, body: ReplyBody, source: ReplySource, max_age: bool) -> Self {
        Self {
            status: StatusCode::OK,
            content_type: Some(format.content_type()),
            body,
            source,
            advertise_max_age: max_age,
        }
    }

    fn status_only(status: StatusCode) -> Self {
        Self {
            status,
            content_type: None,
            body: ReplyBody::Empty,
            source: ReplySource::Upstream,
            advertise_max_age: false,
        }
    }
}

/// Answers one inbound query at a time. Cheap to clone and share across
/// request tasks; all state lives in the injected clients.
#[derive(Clone)]
pub struct QueryEngine {
    features: FeatureSection,
    cache: Option<CacheStore>,
    response_ttl: Duration,
    profiles: Option<ProfileStore>,
    upstream: Arc<dyn Upstream>,
    providers: ProviderTable,
    metrics: Arc<ProxyMetrics>,
}

impl QueryEngine {
    pub fn new(
        features: FeatureSection,
        upstream: Arc<dyn Upstream>,
        providers: ProviderTable,
        metrics: Arc<ProxyMetrics>,
    ) -> Self {
        Self {
            features,
            cache: None,
            response_ttl: Duration::from_secs(60),
            profiles: None,
            upstream,
            providers,
            metrics,
        }
    }

    /// Enable the response cache. Ignored when caching is switched off.
    pub fn with_cache(mut self, cache: CacheStore, response_ttl: Duration) -> Self {
        if self.features.caching {
            self.cache = Some(cache);
            self.response_ttl = response_ttl.max(Duration::from_secs(1));
        }
        self
    }

    /// Enable profile filtering. Ignored when profiles are switched off.
    pub fn with_profiles(mut self, profiles: ProfileStore) -> Self {
        if self.features.profiles {
            self.profiles = Some(profiles);
        }
        self
    }

    pub fn metrics(&self) -> &Arc<ProxyMetrics> {
        &self.metrics
    }

    pub async fn handle(&self, query: &Query) -> Result<DohReply, QueryError> {
        self.metrics.inc_request();
        let provider = self.providers.resolve(query.target_host());

        let profile = match (self.profiles.as_ref(), query.profile_selector()) {
            (Some(store), Some(id)) => Some(self.load_profile(store, id).await?),
            _ => None,
        };

        if let Some(profile) = profile.as_ref() {
            let question = query.question()?;
            if profile.blocks(&question.name) {
                self.metrics.inc_blocked();
                info!(
                    profile = %profile.id(),
                    name = %question.name,
                    record_type = question.record_type,
                    "Refusing blocked name"
                );
                return self.block(query, &question);
            }
        }

        self.forward(query, provider, profile.as_ref()).await
    }

    async fn load_profile(&self, store: &ProfileStore, id: &str) -> Result<Profile, QueryError> {
        match store.lookup(id).await {
            Ok(Some(profile)) => Ok(profile),
            Ok(None) => {
                debug!(profile = %id, "Query selected an unknown profile");
                Err(QueryError::UnknownProfile(id.to_string()))
            }
            Err(ProfileError::MalformedId) | Err(ProfileError::Invalid(_)) => {
                Err(QueryError::InvalidInput(format!("malformed profile selector {id}")))
            }
            Err(err) => {
                self.metrics.inc_store_error();
                warn!(profile = %id, error = %err, "Profile lookup failed");
                Err(QueryError::StoreUnavailable(err.to_string()))
            }
        }
    }

    fn block(&self, query: &Query, question: &Question) -> Result<DohReply, QueryError> {
        let (format, bytes) = match (query.format(), question.wire.as_ref()) {
            (DnsFormat::Wire, Some(message)) => (DnsFormat::Wire, build_refused_message(message)?),
            _ => {
                let answer = SyntheticAnswer::refused(&question.name, question.record_type);
                let bytes = serde_json::to_vec(&answer)
                    .map_err(|err| QueryError::Internal(err.to_string()))?;
                (DnsFormat::Json, bytes)
            }
        };
        Ok(DohReply::answer(
            format,
            ReplyBody::Full(Bytes::from(bytes)),
            ReplySource::Blocked,
            false,
        ))
    }

    fn cache_key(
        &self,
        query: &Query,
        provider: &UpstreamProvider,
        profile: Option<&Profile>,
    ) -> CacheKey {
        let mut key = CacheKey::new(query.format_tag(), query.raw_query());
        if !self.providers.is_default(provider) {
            key = key.with_provider(provider.name);
        }
        if let Some(profile) = profile {
            key = key.with_profile(profile.id());
        }
        key
    }

    async fn forward(
        &self,
        query: &Query,
        provider: &'static UpstreamProvider,
        profile: Option<&Profile>,
    ) -> Result<DohReply, QueryError> {
        let max_age = self.features.cors_max_age && self.cache.is_some();
        let storage_key = self
            .cache
            .as_ref()
            .map(|_| self.cache_key(query, provider, profile).storage_key());

        if let (Some(cache), Some(key)) = (self.cache.as_ref(), storage_key.as_deref()) {
            match cache.get(key, None).await {
                Ok(Some(bytes)) => {
                    self.metrics.inc_cache_hit();
                    debug!(key = %key, "Serving cached answer");
                    return Ok(DohReply::answer(
                        query.format(),
                        ReplyBody::Full(bytes),
                        ReplySource::Cache,
                        max_age,
                    ));
                }
                Ok(None) => self.metrics.inc_cache_miss(),
                Err(err) => {
                    self.metrics.inc_cache_miss();
                    self.metrics.inc_store_error();
                    warn!(key = %key, error = %err, "Cache lookup failed; forwarding");
                }
            }
        }

        let response = match self.upstream.fetch(provider, query.upstream_request()).await {
            Ok(response) => response,
            Err(err) => {
                self.metrics.inc_upstream_failure();
                warn!(provider = provider.name, error = %err, "Upstream request failed");
                return Err(err.into());
            }
        };

        if response.status != StatusCode::OK {
            self.metrics.inc_upstream_failure();
            warn!(provider = provider.name, status = %response.status, "Upstream returned an error status");
            return Ok(DohReply::status_only(response.status));
        }
        self.metrics.inc_upstream_response();

        let body = match (self.cache.clone(), storage_key) {
            (Some(cache), Some(key)) => {
                let ttl = self.response_ttl;
                let metrics = self.metrics.clone();
                ReplyBody::Stream(fan_out(response.body, move |bytes| async move {
                    if bytes.is_empty() {
                        return;
                    }
                    match cache.put(&key, bytes, ttl, Durability::Ephemeral).await {
                        Ok(()) => debug!(key = %key, "Cached upstream answer"),
                        Err(err) => {
                            metrics.inc_store_error();
                            warn!(key = %key, error = %err, "Failed to cache upstream answer");
                        }
                    }
                }))
            }
            _ => ReplyBody::Stream(response.body),
        };

        Ok(DohReply::answer(
            query.format(),
            body,
            ReplySource::Upstream,
            max_age,
        ))
    }
}
