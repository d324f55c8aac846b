//! HTTP surface: `POST /v1/chat/completions`, `GET /v1/models`, `GET /status`.

use crate::adaptor::AdaptorRegistry;
use crate::channel::{ChannelStore, MemoryChannelStore};
use crate::config::{self, RelayConfig, TokenConfig};
use crate::error::RelayError;
use crate::health::HealthMonitor;
use crate::ledger::QuotaLedger;
use crate::metrics::{LogMetricsSink, MetricsRecorder, MetricsSink};
use crate::models::chat::ChatCompletionRequest;
use crate::notify::{LogSink, NotificationSink, Notifier, WebhookSink};
use crate::relay::{Relay, RelayRequest, RelayResponse};
use crate::tokenizer::TokenCounter;
use crate::util::{env_parse, error_response};
use actix_web::http::header;
use actix_web::{web, HttpRequest, HttpResponse, Responder};
use http::StatusCode;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// What a client bearer token resolves to.
#[derive(Debug, Clone)]
pub struct TokenInfo {
    pub token_id: String,
    pub name: String,
    pub user_id: String,
    pub group: String,
    pub channel_ratios: HashMap<i64, f64>,
}

impl From<&TokenConfig> for TokenInfo {
    fn from(t: &TokenConfig) -> Self {
        Self {
            token_id: t.token_id().to_string(),
            name: t.display_name().to_string(),
            user_id: t.user_id.clone(),
            group: t.group.clone(),
            channel_ratios: t.parsed_channel_ratios(),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<Relay>,
    /// Bearer value → token.
    pub tokens: Arc<HashMap<String, TokenInfo>>,
}

impl AppState {
    pub fn new(relay: Arc<Relay>, tokens: &[TokenConfig]) -> Self {
        let tokens = tokens
            .iter()
            .map(|t| (t.key.clone(), TokenInfo::from(t)))
            .collect();
        Self {
            relay,
            tokens: Arc::new(tokens),
        }
    }

    fn authenticate(&self, req: &HttpRequest) -> Result<&TokenInfo, HttpResponse> {
        let bearer = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_bearer);
        let Some(bearer) = bearer else {
            return Err(error_response(
                StatusCode::UNAUTHORIZED,
                "invalid_request_error",
                "missing bearer token",
            ));
        };
        self.tokens.get(bearer).ok_or_else(|| {
            error_response(
                StatusCode::UNAUTHORIZED,
                "invalid_request_error",
                "invalid token",
            )
        })
    }
}

/// Every long-lived component, wired from a [`RelayConfig`].
pub struct Gateway {
    pub state: AppState,
    pub notifier: Arc<Notifier>,
    pub metrics: Arc<MetricsRecorder>,
}

impl Gateway {
    /// Must run inside a tokio runtime; starts the notifier and metrics tasks.
    pub async fn build(cfg: &RelayConfig, http: reqwest::Client) -> config::Result<Self> {
        Self::build_with_metrics_sink(cfg, http, Arc::new(LogMetricsSink)).await
    }

    pub async fn build_with_metrics_sink(
        cfg: &RelayConfig,
        http: reqwest::Client,
        metrics_sink: Arc<dyn MetricsSink>,
    ) -> config::Result<Self> {
        let store = cfg.ledger_backend()?.open()?;
        cfg.seed_ledger(store.as_ref()).await?;

        let channels: Arc<dyn ChannelStore> =
            Arc::new(MemoryChannelStore::new(cfg.channels.clone()));

        let mut sinks: Vec<Arc<dyn NotificationSink>> = vec![Arc::new(LogSink)];
        for url in &cfg.webhooks {
            sinks.push(Arc::new(WebhookSink::new(http.clone(), url.clone())));
        }
        let notifier = Arc::new(Notifier::start(sinks, cfg.notify_queue_capacity));
        let health = Arc::new(HealthMonitor::new(
            channels.clone(),
            notifier.clone(),
            cfg.health.clone(),
        ));

        let metrics = MetricsRecorder::new(metrics_sink, cfg.metrics_interval());
        metrics.start();

        let tokens = Arc::new(TokenCounter::new()?);
        let ledger = QuotaLedger::new(store).with_trust_multiple(cfg.trust_multiple);
        let relay = Relay::new(
            AdaptorRegistry::new(http),
            channels,
            ledger,
            Arc::new(cfg.ratios.clone()),
            health,
            metrics.clone(),
            tokens,
        );
        tracing::info!(
            channels = cfg.channels.len(),
            tokens = cfg.tokens.len(),
            ledger = %cfg.ledger,
            webhooks = cfg.webhooks.len(),
            "gateway ready"
        );
        Ok(Self {
            state: AppState::new(relay, &cfg.tokens),
            notifier,
            metrics,
        })
    }

    /// Settle outstanding requests, then flush notifications and metrics.
    pub async fn shutdown(&self) {
        self.state.relay.drain().await;
        self.notifier.shutdown().await;
        self.metrics.shutdown().await;
    }
}

fn parse_bearer(raw: &str) -> Option<&str> {
    let s = raw.trim();
    let scheme = s.get(..6)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = s.get(6..)?.trim();
    (!token.is_empty()).then_some(token)
}

/// Copy client headers into the `http` 1.x map the adaptors use.
fn forwardable_headers(req: &HttpRequest) -> http::HeaderMap {
    let mut out = http::HeaderMap::new();
    for (name, value) in req.headers() {
        if *name == header::AUTHORIZATION || *name == header::HOST || *name == header::CONTENT_LENGTH {
            continue;
        }
        if let (Ok(n), Ok(v)) = (
            http::header::HeaderName::from_bytes(name.as_str().as_bytes()),
            http::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            out.append(n, v);
        }
    }
    out
}

/// Upper bound for request bodies; `RELAYIUM_MAX_BODY_BYTES` overrides.
const DEFAULT_MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

pub fn config_routes(cfg: &mut web::ServiceConfig) {
    let limit = env_parse::<usize>("RELAYIUM_MAX_BODY_BYTES").unwrap_or(DEFAULT_MAX_BODY_BYTES);
    cfg.service(
        web::scope("")
            .app_data(web::PayloadConfig::new(limit))
            .route("/status", web::get().to(status))
            .route("/v1/models", web::get().to(list_models))
            .route("/v1/chat/completions", web::post().to(chat_completions)),
    );
}

async fn chat_completions(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Bytes,
) -> Result<HttpResponse, RelayError> {
    let token = match state.authenticate(&req) {
        Ok(t) => t.clone(),
        Err(resp) => return Ok(resp),
    };
    let parsed: ChatCompletionRequest = serde_json::from_slice(&body)
        .map_err(|e| RelayError::invalid_request(format!("invalid request body: {}", e)))?;

    let relay_req = RelayRequest {
        token_id: token.token_id,
        token_name: token.name,
        user_id: token.user_id,
        group: token.group,
        channel_ratios: token.channel_ratios,
        body: parsed,
        headers: forwardable_headers(&req),
    };
    match state.relay.relay(relay_req).await? {
        RelayResponse::Json(resp) => Ok(HttpResponse::Ok().json(resp)),
        RelayResponse::Stream(frames) => Ok(HttpResponse::Ok()
            .insert_header((header::CONTENT_TYPE, "text/event-stream"))
            .insert_header((header::CACHE_CONTROL, "no-cache"))
            .insert_header(("X-Accel-Buffering", "no"))
            .streaming(frames)),
    }
}

/// Adaptor catalogs plus every model a channel declares.
async fn list_models(state: web::Data<AppState>, req: HttpRequest) -> impl Responder {
    if let Err(resp) = state.authenticate(&req) {
        return resp;
    }
    let mut models: BTreeMap<String, String> = state
        .relay
        .adaptors()
        .models()
        .into_iter()
        .map(|(id, owner)| (id, owner.to_string()))
        .collect();
    match state.relay.channels().list().await {
        Ok(channels) => {
            for ch in channels.iter().filter(|c| c.is_enabled()) {
                for m in &ch.models {
                    models
                        .entry(m.clone())
                        .or_insert_with(|| channel_owner(ch.channel_type));
                }
            }
        }
        Err(e) => tracing::warn!(error = %e, "listing channels for /v1/models failed"),
    }
    let data: Vec<serde_json::Value> = models
        .into_iter()
        .map(|(id, owned_by)| {
            serde_json::json!({ "id": id, "object": "model", "created": 0, "owned_by": owned_by })
        })
        .collect();
    HttpResponse::Ok().json(serde_json::json!({ "object": "list", "data": data }))
}

fn channel_owner(t: crate::channel::ChannelType) -> String {
    serde_json::to_value(t)
        .ok()
        .and_then(|v| v.as_str().map(|s| s.to_string()))
        .unwrap_or_else(|| "relayium".to_string())
}

/// Channel and key states with masked keys, plus live counters.
async fn status(state: web::Data<AppState>, req: HttpRequest) -> impl Responder {
    if let Err(resp) = state.authenticate(&req) {
        return resp;
    }
    let channels = match state.relay.channels().list().await {
        Ok(mut list) => {
            list.sort_by_key(|c| c.id);
            list.into_iter()
                .map(|c| {
                    let keys = c.key_views();
                    let multi_key = c.is_multi_key();
                    serde_json::json!({
                        "id": c.id,
                        "name": c.name,
                        "type": c.channel_type,
                        "status": c.status,
                        "disabled": c.disabled,
                        "multi_key": multi_key,
                        "keys": keys,
                        "models": c.models,
                    })
                })
                .collect::<Vec<_>>()
        }
        Err(e) => {
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "relay_error",
                &format!("channel store unavailable: {}", e),
            )
        }
    };
    HttpResponse::Ok().json(serde_json::json!({
        "name": "relayium",
        "version": env!("CARGO_PKG_VERSION"),
        "routes": ["/status", "/v1/models", "/v1/chat/completions"],
        "in_flight": state.relay.metrics().in_flight(),
        "channels": channels,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_parsing() {
        assert_eq!(parse_bearer("Bearer sk-1"), Some("sk-1"));
        assert_eq!(parse_bearer("bearer   sk-2 "), Some("sk-2"));
        assert_eq!(parse_bearer("Basic abc"), None);
        assert_eq!(parse_bearer("Bearer "), None);
    }

    #[test]
    fn token_info_from_config() {
        let t = TokenConfig {
            key: "sk-relay".into(),
            id: Some("t-1".into()),
            name: None,
            user_id: "alice".into(),
            group: "vip".into(),
            quota: None,
            channel_ratios: "{7:0.5}".into(),
        };
        let info = TokenInfo::from(&t);
        assert_eq!(info.token_id, "t-1");
        assert_eq!(info.name, "t-1");
        assert_eq!(info.group, "vip");
        assert_eq!(info.channel_ratios.get(&7), Some(&0.5));
    }
}
