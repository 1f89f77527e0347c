use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{RawQuery, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::config::normalise_path;
use crate::metrics::{PROMETHEUS_CONTENT_TYPE, ProxyMetrics};
use crate::profile::{ProfileError, ProfileStore};
use crate::query::{DohReply, Query, QueryEngine, QueryError, ReplyBody};
use crate::upstream::DNS_MESSAGE_CONTENT_TYPE;
use crate::RabbitDns;

/// `/createProfile` rejected the document.
pub const PROFILE_INVALID: u16 = 1050;
/// Reserved for a debug listing path. Never emitted.
pub const PROFILE_DEBUG_RESERVED: u16 = 1060;
/// The durable profile store could not be written.
pub const PROFILE_STORE_UNAVAILABLE: u16 = 1070;

const CORS_MAX_AGE_SECONDS: &str = "86400";

#[derive(Clone)]
pub struct DohState {
    engine: QueryEngine,
    profiles: Option<ProfileStore>,
    metrics: Arc<ProxyMetrics>,
}

impl DohState {
    pub fn new(
        engine: QueryEngine,
        profiles: Option<ProfileStore>,
        metrics: Arc<ProxyMetrics>,
    ) -> Self {
        Self {
            engine,
            profiles,
            metrics,
        }
    }
}

/// Body of every `/createProfile` answer. HTTP status is always 200; the
/// outcome lives in `error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileEnvelope {
    pub error: u16,
    pub info: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ProfileCreated>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileCreated {
    pub id: String,
}

impl ProfileEnvelope {
    fn created(id: &str) -> Self {
        Self {
            error: 0,
            info: "Profile created".into(),
            data: Some(ProfileCreated { id: id.to_string() }),
        }
    }

    fn failure(code: u16, info: impl Into<String>) -> Self {
        Self {
            error: code,
            info: info.into(),
            data: None,
        }
    }
}

/// Assemble the public DoH router. The profile route is only mounted when
/// profiles are enabled.
pub fn router(state: Arc<DohState>, doh_path: &str, profile_path: &str) -> Router {
    let mut router = Router::new().route(
        &normalise_path(doh_path),
        get(doh_get).post(doh_post).options(preflight),
    );
    if state.profiles.is_some() {
        router = router.route(
            &normalise_path(profile_path),
            post(create_profile).options(preflight),
        );
    }
    router
        .fallback(fallback)
        .layer(middleware::map_response(allow_any_origin))
        .with_state(state)
}

/// HTTP front end for a bootstrapped [`RabbitDns`] instance.
pub struct DohServer {
    proxy: RabbitDns,
}

impl DohServer {
    pub fn new(proxy: RabbitDns) -> Self {
        Self { proxy }
    }

    pub async fn run(self) -> Result<()> {
        let server = &self.proxy.config().server;
        let addr: SocketAddr = server
            .listen
            .parse()
            .context("Invalid DoH listener address")?;

        let state = Arc::new(DohState::new(
            self.proxy.engine().clone(),
            self.proxy.profiles().cloned(),
            self.proxy.metrics().clone(),
        ));
        let app = router(state, &server.doh_path, &server.profile_path);

        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind DoH listener at {addr}"))?;

        info!(
            listener = %addr,
            path = %normalise_path(&server.doh_path),
            profiles = self.proxy.profiles().is_some(),
            "Starting rabbitdns DoH server"
        );

        let doh_server = axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(shutdown_signal());

        match server.metrics_listen.clone() {
            Some(metrics_addr) => {
                tokio::try_join!(
                    async {
                        doh_server
                            .await
                            .context("rabbitdns DoH server terminated unexpectedly")
                    },
                    async { run_metrics_server(&metrics_addr, self.proxy.metrics().clone()).await },
                )?;
            }
            None => {
                doh_server
                    .await
                    .context("rabbitdns DoH server terminated unexpectedly")?;
            }
        }

        Ok(())
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received; stopping rabbitdns");
}

async fn run_metrics_server(addr: &str, metrics: Arc<ProxyMetrics>) -> Result<()> {
    let socket_addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("Invalid metrics listener address: {addr}"))?;

    let listener = TcpListener::bind(socket_addr)
        .await
        .with_context(|| format!("Failed to bind metrics listener at {socket_addr}"))?;

    info!(listener = %socket_addr, "Starting rabbitdns metrics server");

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("rabbitdns metrics server terminated unexpectedly")
}

async fn metrics_handler(State(metrics): State<Arc<ProxyMetrics>>) -> Response {
    match metrics.render() {
        Ok(buffer) => {
            let mut response = Response::new(Body::from(buffer));
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static(PROMETHEUS_CONTENT_TYPE),
            );
            response
        }
        Err(err) => {
            error!(error = %err, "Failed to render rabbitdns metrics");
            let mut response = Response::new(Body::from(err.to_string()));
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
        }
    }
}

async fn allow_any_origin(mut response: Response) -> Response {
    response.headers_mut().insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    response
}

async fn preflight() -> Response {
    let mut response = StatusCode::NO_CONTENT.into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("POST, GET, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("*"),
    );
    response
}

async fn fallback(method: Method) -> Response {
    if method == Method::OPTIONS {
        return preflight().await;
    }
    StatusCode::NOT_FOUND.into_response()
}

/// Inbound host from `Host`, falling back to the request URI authority.
fn request_host(headers: &HeaderMap, uri: &Uri) -> String {
    headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| uri.authority().map(|authority| authority.to_string()))
        .unwrap_or_default()
}

async fn doh_get(
    State(state): State<Arc<DohState>>,
    uri: Uri,
    headers: HeaderMap,
    RawQuery(raw_query): RawQuery,
) -> Response {
    let accept = headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok());
    let query = Query::from_get(
        &request_host(&headers, &uri),
        raw_query.as_deref().unwrap_or(""),
        accept,
    );
    answer(state, query).await
}

async fn doh_post(
    State(state): State<Arc<DohState>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    if !content_type.eq_ignore_ascii_case(DNS_MESSAGE_CONTENT_TYPE) {
        debug!(content_type, "Rejecting DoH POST without application/dns-message");
        return StatusCode::BAD_REQUEST.into_response();
    }

    let query = Query::from_post(&request_host(&headers, &uri), body);
    answer(state, query).await
}

async fn answer(state: Arc<DohState>, query: Query) -> Response {
    let span = info_span!(
        "doh_request",
        request_id = %Uuid::new_v4(),
        host = %query.target_host(),
        format = %query.format_tag(),
        profile = query.profile_selector().unwrap_or("-"),
    );

    async move {
        match state.engine.handle(&query).await {
            Ok(reply) => {
                debug!(source = ?reply.source, status = %reply.status, "Answered DoH query");
                reply_response(reply)
            }
            Err(err) => {
                let status = err.status();
                match &err {
                    QueryError::InvalidInput(_) | QueryError::UnknownProfile(_) => {
                        debug!(error = %err, "Rejected DoH query");
                    }
                    _ => warn!(error = %err, status = %status, "DoH query failed"),
                }
                status.into_response()
            }
        }
    }
    .instrument(span)
    .await
}

fn reply_response(reply: DohReply) -> Response {
    let body = match reply.body {
        ReplyBody::Empty => Body::empty(),
        ReplyBody::Full(bytes) => Body::from(bytes),
        ReplyBody::Stream(stream) => Body::from_stream(stream),
    };

    let mut response = Response::new(body);
    *response.status_mut() = reply.status;
    let headers = response.headers_mut();
    if let Some(content_type) = reply.content_type {
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    }
    if reply.advertise_max_age {
        headers.insert(
            header::ACCESS_CONTROL_MAX_AGE,
            HeaderValue::from_static(CORS_MAX_AGE_SECONDS),
        );
    }
    response
}

async fn create_profile(State(state): State<Arc<DohState>>, body: Bytes) -> Response {
    let span = info_span!("create_profile", request_id = %Uuid::new_v4());

    async move {
        let Some(profiles) = state.profiles.as_ref() else {
            return StatusCode::NOT_FOUND.into_response();
        };

        let envelope = match profiles.create(&body).await {
            Ok(profile) => {
                state.metrics.inc_profile_created();
                ProfileEnvelope::created(profile.id())
            }
            Err(ProfileError::Invalid(reason)) => {
                debug!(reason = %reason, "Rejected profile document");
                ProfileEnvelope::failure(PROFILE_INVALID, format!("Invalid profile: {reason}"))
            }
            Err(err) => {
                state.metrics.inc_store_error();
                warn!(error = %err, "Failed to persist profile");
                ProfileEnvelope::failure(PROFILE_STORE_UNAVAILABLE, "Profile store unavailable")
            }
        };
        Json(envelope).into_response()
    }
    .instrument(span)
    .await
}
