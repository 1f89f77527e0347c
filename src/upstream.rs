use std::{collections::HashMap, future::Future, io, time::Duration};

use async_trait::async_trait;
use axum::http::{StatusCode, header};
use bytes::{Bytes, BytesMut};
use futures_util::{
    StreamExt, TryStreamExt,
    stream::{self, BoxStream},
};
use reqwest::Client;
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot},
    time::timeout,
};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::config::UpstreamSection;

pub const DNS_MESSAGE_CONTENT_TYPE: &str = "application/dns-message";
pub const DNS_JSON_CONTENT_TYPE: &str = "application/dns-json";

pub(crate) const DEFAULT_UPSTREAM_PROVIDER: &str = "cloudflare";

/// Bodies larger than this are streamed through but never cached.
const MAX_CACHEABLE_BYTES: usize = 1024 * 1024;

/// Chunks buffered between the upstream reader and the caller.
const FAN_OUT_BUFFER: usize = 16;

/// A caller that stops draining for this long is detached from the tee.
const CALLER_STALL_TIMEOUT: Duration = Duration::from_secs(30);

pub type BodyStream = BoxStream<'static, Result<Bytes, io::Error>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpstreamProvider {
    pub name: &'static str,
    pub doh_endpoint: &'static str,
    pub description: &'static str,
}

const UPSTREAM_PROVIDERS: &[UpstreamProvider] = &[
    UpstreamProvider {
        name: "cloudflare",
        doh_endpoint: "https://cloudflare-dns.com/dns-query",
        description: "Cloudflare (1.1.1.1)",
    },
    UpstreamProvider {
        name: "cloudflare-family",
        doh_endpoint: "https://family.cloudflare-dns.com/dns-query",
        description: "Cloudflare Family (malware/adult filtering)",
    },
    UpstreamProvider {
        name: "cloudflare-security",
        doh_endpoint: "https://security.cloudflare-dns.com/dns-query",
        description: "Cloudflare Security (malware filtering)",
    },
    UpstreamProvider {
        name: "google",
        doh_endpoint: "https://dns.google/dns-query",
        description: "Google Public DNS",
    },
    UpstreamProvider {
        name: "quad9",
        doh_endpoint: "https://dns.quad9.net/dns-query",
        description: "Quad9 (threat blocking)",
    },
];

pub fn resolve_provider(name: &str) -> Option<&'static UpstreamProvider> {
    let lower = name.trim().to_ascii_lowercase();
    UPSTREAM_PROVIDERS
        .iter()
        .find(|provider| provider.name == lower)
}

pub fn default_provider() -> &'static UpstreamProvider {
    &UPSTREAM_PROVIDERS[0]
}

/// Exact-match map from inbound host to upstream provider.
#[derive(Debug, Clone)]
pub struct ProviderTable {
    hosts: HashMap<String, &'static UpstreamProvider>,
    default: &'static UpstreamProvider,
}

impl ProviderTable {
    pub fn from_section(section: &UpstreamSection) -> Self {
        let default = match resolve_provider(&section.default_provider) {
            Some(provider) => provider,
            None => {
                warn!(
                    provider = %section.default_provider,
                    "Unknown default upstream provider; using {}",
                    DEFAULT_UPSTREAM_PROVIDER
                );
                default_provider()
            }
        };

        let mut hosts = HashMap::new();
        for (host, name) in &section.hosts {
            match resolve_provider(name) {
                Some(provider) => {
                    hosts.insert(normalise_host(host), provider);
                }
                None => warn!(host = %host, provider = %name, "Ignoring host alias for unknown upstream provider"),
            }
        }

        Self { hosts, default }
    }

    pub fn resolve(&self, host: &str) -> &'static UpstreamProvider {
        self.hosts
            .get(&normalise_host(host))
            .copied()
            .unwrap_or(self.default)
    }

    pub fn is_default(&self, provider: &UpstreamProvider) -> bool {
        provider.name == self.default.name
    }
}

/// Lowercase, drop any `:port` and trailing dot.
pub fn normalise_host(host: &str) -> String {
    let without_port = match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    };
    without_port
        .trim()
        .trim_end_matches('.')
        .to_ascii_lowercase()
}

/// DoH encoding: binary wire format or DNS JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsFormat {
    Wire,
    Json,
}

impl DnsFormat {
    pub fn content_type(self) -> &'static str {
        match self {
            DnsFormat::Wire => DNS_MESSAGE_CONTENT_TYPE,
            DnsFormat::Json => DNS_JSON_CONTENT_TYPE,
        }
    }
}

#[derive(Debug, Clone)]
pub enum UpstreamRequest {
    /// Forward the raw query string with the matching `Accept` header.
    Get { format: DnsFormat, query: String },
    /// Forward a wire-format body.
    Post { body: Bytes },
}

pub struct UpstreamResponse {
    pub status: StatusCode,
    pub body: BodyStream,
}

impl UpstreamResponse {
    pub fn failed(status: StatusCode) -> Self {
        Self {
            status,
            body: futures_util::stream::empty().boxed(),
        }
    }
}

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream {provider} unreachable: {message}")]
    Transport {
        provider: &'static str,
        message: String,
    },
}

/// One DoH fetch against an upstream provider.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn fetch(
        &self,
        provider: &'static UpstreamProvider,
        request: UpstreamRequest,
    ) -> Result<UpstreamResponse, UpstreamError>;
}

/// reqwest-backed upstream client. Never retries.
#[derive(Clone)]
pub struct HttpUpstream {
    client: Client,
}

impl HttpUpstream {
    pub fn new(section: &UpstreamSection) -> anyhow::Result<Self> {
        use anyhow::Context as _;

        let client = Client::builder()
            .user_agent(section.user_agent.clone())
            .timeout(Duration::from_secs(section.timeout_seconds.max(1)))
            .build()
            .context("Failed to build upstream HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn fetch(
        &self,
        provider: &'static UpstreamProvider,
        request: UpstreamRequest,
    ) -> Result<UpstreamResponse, UpstreamError> {
        let builder = match request {
            UpstreamRequest::Get { format, query } => {
                let url = if query.is_empty() {
                    provider.doh_endpoint.to_string()
                } else {
                    format!("{}?{}", provider.doh_endpoint, query)
                };
                self.client
                    .get(url)
                    .header(header::ACCEPT, format.content_type())
            }
            UpstreamRequest::Post { body } => self
                .client
                .post(provider.doh_endpoint)
                .header(header::CONTENT_TYPE, DNS_MESSAGE_CONTENT_TYPE)
                .body(body),
        };

        let response = builder
            .send()
            .await
            .map_err(|err| UpstreamError::Transport {
                provider: provider.name,
                message: err.to_string(),
            })?;

        let status = response.status();
        if status != StatusCode::OK {
            debug!(provider = provider.name, status = %status, "Upstream answered with non-200 status");
            return Ok(UpstreamResponse::failed(status));
        }

        let body = response.bytes_stream().map_err(io::Error::other).boxed();
        Ok(UpstreamResponse {
            status,
            body,
        })
    }
}

/// Split one upstream body into a caller stream and a cache branch.
///
/// A spawned task reads the upstream exactly once, forwarding every chunk to
/// a bounded channel behind the returned stream while accumulating a copy.
/// When the body completes cleanly the copy is handed to `on_complete`. If the
/// caller stream is dropped or stops draining, the task keeps reading so the
/// cache branch still finishes. A stalled caller sees its stream end in an
/// error rather than a clean, truncated EOF.
pub fn fan_out<F, Fut>(upstream: BodyStream, on_complete: F) -> BodyStream
where
    F: FnOnce(Bytes) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fan_out_with_stall(upstream, CALLER_STALL_TIMEOUT, on_complete)
}

fn fan_out_with_stall<F, Fut>(
    mut upstream: BodyStream,
    stall: Duration,
    on_complete: F,
) -> BodyStream
where
    F: FnOnce(Bytes) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<Result<Bytes, io::Error>>(FAN_OUT_BUFFER);
    let (abort_tx, abort_rx) = oneshot::channel::<io::Error>();

    tokio::spawn(async move {
        let mut caller = Some(tx);
        let mut abort = Some(abort_tx);
        let mut copy = Some(BytesMut::new());

        while let Some(chunk) = upstream.next().await {
            match chunk {
                Ok(bytes) => {
                    if let Some(buffer) = copy.as_mut() {
                        if buffer.len() + bytes.len() > MAX_CACHEABLE_BYTES {
                            debug!("Upstream body too large to cache; streaming only");
                            copy = None;
                        } else {
                            buffer.extend_from_slice(&bytes);
                        }
                    }
                    if let Some(sender) = caller.as_ref() {
                        match timeout(stall, sender.send(Ok(bytes))).await {
                            Ok(Ok(())) => {}
                            Ok(Err(_)) => {
                                debug!("Caller went away; finishing cache branch alone");
                                caller = None;
                            }
                            Err(_) => {
                                warn!("Caller stalled; finishing cache branch alone");
                                caller = None;
                                if let Some(abort) = abort.take() {
                                    let _ = abort.send(io::Error::new(
                                        io::ErrorKind::TimedOut,
                                        "caller stalled",
                                    ));
                                }
                            }
                        }
                    }
                    if caller.is_none() && copy.is_none() {
                        return;
                    }
                }
                Err(err) => {
                    warn!(error = %err, "Upstream body failed mid-stream; skipping cache write");
                    if let Some(sender) = caller.take() {
                        let _ = timeout(stall, sender.send(Err(err))).await;
                    }
                    return;
                }
            }
        }

        drop(caller);
        if let Some(buffer) = copy {
            on_complete(buffer.freeze()).await;
        }
    });

    let aborted = stream::once(abort_rx)
        .filter_map(|signal| async move { signal.ok().map(Err::<Bytes, io::Error>) });
    stream::select(ReceiverStream::new(rx), aborted).boxed()
}

/// Drain a body stream into memory.
pub async fn collect_body(mut body: BodyStream) -> Result<Bytes, io::Error> {
    let mut buffer = BytesMut::new();
    while let Some(chunk) = body.next().await {
        buffer.extend_from_slice(&chunk?);
    }
    Ok(buffer.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use std::collections::BTreeMap;
    use tokio::sync::oneshot;

    fn chunks(parts: &[&'static [u8]]) -> BodyStream {
        let items: Vec<Result<Bytes, io::Error>> = parts
            .iter()
            .map(|part| Ok(Bytes::from_static(part)))
            .collect();
        stream::iter(items).boxed()
    }

    #[test]
    fn provider_table_maps_aliases() {
        let table = ProviderTable::from_section(&UpstreamSection::default());
        assert_eq!(table.resolve("dns.rabbitdns.org").name, "cloudflare");
        assert_eq!(
            table.resolve("FAMILY.rabbitdns.org:443").name,
            "cloudflare-family"
        );
        assert_eq!(
            table.resolve("security.rabbitdns.org.").name,
            "cloudflare-security"
        );
        assert_eq!(table.resolve("unknown.example").name, "cloudflare");
        assert!(table.is_default(table.resolve("unknown.example")));
        assert!(!table.is_default(table.resolve("family.rabbitdns.org")));
    }

    #[test]
    fn provider_table_skips_unknown_providers() {
        let mut hosts = BTreeMap::new();
        hosts.insert("a.example".to_string(), "quad9".to_string());
        hosts.insert("b.example".to_string(), "nonexistent".to_string());
        let section = UpstreamSection {
            default_provider: "also-missing".into(),
            hosts,
            ..UpstreamSection::default()
        };
        let table = ProviderTable::from_section(&section);
        assert_eq!(table.resolve("a.example").name, "quad9");
        assert_eq!(table.resolve("b.example").name, DEFAULT_UPSTREAM_PROVIDER);
        assert_eq!(default_provider().name, DEFAULT_UPSTREAM_PROVIDER);
    }

    #[test]
    fn normalise_host_strips_port_and_case() {
        assert_eq!(normalise_host("Dns.Example:8443"), "dns.example");
        assert_eq!(normalise_host("dns.example."), "dns.example");
        assert_eq!(normalise_host("dns.example"), "dns.example");
    }

    #[tokio::test]
    async fn fan_out_feeds_caller_and_cache() {
        let (done_tx, done_rx) = oneshot::channel();
        let caller = fan_out(chunks(&[b"ab", b"cd", b"ef"]), move |copy| async move {
            let _ = done_tx.send(copy);
        });

        let delivered = collect_body(caller).await.expect("caller stream");
        assert_eq!(&delivered[..], b"abcdef");
        let cached = done_rx.await.expect("cache branch ran");
        assert_eq!(&cached[..], b"abcdef");
    }

    #[tokio::test]
    async fn fan_out_completes_cache_branch_without_caller() {
        let (done_tx, done_rx) = oneshot::channel();
        let caller = fan_out(chunks(&[b"12", b"34"]), move |copy| async move {
            let _ = done_tx.send(copy);
        });
        drop(caller);

        let cached = done_rx.await.expect("cache branch ran");
        assert_eq!(&cached[..], b"1234");
    }

    #[tokio::test]
    async fn fan_out_skips_cache_on_stream_error() {
        let (done_tx, done_rx) = oneshot::channel::<Bytes>();
        let broken: BodyStream = stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(io::Error::other("reset")),
        ])
        .boxed();
        let caller = fan_out(broken, move |copy| async move {
            let _ = done_tx.send(copy);
        });

        assert!(collect_body(caller).await.is_err());
        assert!(done_rx.await.is_err());
    }

    #[tokio::test]
    async fn stalled_caller_sees_error_and_cache_still_fills() {
        let parts: Vec<Result<Bytes, io::Error>> = (0..FAN_OUT_BUFFER * 3)
            .map(|_| Ok(Bytes::from_static(b"x")))
            .collect();
        let (done_tx, done_rx) = oneshot::channel();
        let mut caller = fan_out_with_stall(
            stream::iter(parts).boxed(),
            Duration::from_millis(50),
            move |copy| async move {
                let _ = done_tx.send(copy);
            },
        );

        assert!(caller.next().await.is_some());
        let cached = done_rx.await.expect("cache branch ran");
        assert_eq!(cached.len(), FAN_OUT_BUFFER * 3);

        let mut saw_error = false;
        while let Some(chunk) = caller.next().await {
            if chunk.is_err() {
                saw_error = true;
            }
        }
        assert!(saw_error);
    }
}
