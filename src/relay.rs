//! Relay Orchestrator
//!
//! Drives one chat completion through the gateway:
//!
//! ```text
//! select channel/key → estimate → reserve → init → convert_request → execute
//!   ├─ error status        → parse error → rollback → health(failure)
//!   ├─ single-shot body    → convert_response → reconcile → health(success)
//!   └─ stream              → translate (pump task) → reconcile → health
//! ```
//!
//! Nothing is retried. Settlement (reconcile or rollback), the health update
//! and the metrics sample run on a detached task once the outcome is known;
//! [`Relay::drain`] waits for those tasks.

use crate::adaptor::error::{embedded_error, relay_error_from_body};
use crate::adaptor::{Adaptor, AdaptorRegistry, RelayMeta, UpstreamResponse};
use crate::channel::{Channel, ChannelError, ChannelStore};
use crate::cost::{self, Pricing, RatioTables};
use crate::error::RelayError;
use crate::health::{HealthMonitor, Outcome};
use crate::ledger::{ConsumeLog, QuotaLedger, Reservation};
use crate::metrics::{InFlightGuard, MetricsRecorder, RequestSample};
use crate::models::chat::{ChatCompletionRequest, ChatCompletionResponse, ChatUsage};
use crate::stream::{self, StreamAccumulator, TranslatedStream};
use crate::tokenizer::TokenCounter;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use http::header::HeaderMap;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::task::JoinHandle;

pub const DEFAULT_STREAM_BUFFER: usize = 64;

/// Stream of canonical SSE frames handed to the HTTP layer.
pub type SseBody = futures::channel::mpsc::Receiver<Result<Bytes, std::io::Error>>;

/// Who is asking, and for what.
#[derive(Debug, Clone)]
pub struct RelayRequest {
    pub token_id: String,
    pub token_name: String,
    pub user_id: String,
    pub group: String,
    /// Per-user channel ratio overrides keyed by channel id.
    pub channel_ratios: HashMap<i64, f64>,
    pub body: ChatCompletionRequest,
    pub headers: HeaderMap,
}

impl RelayRequest {
    pub fn new(user_id: &str, token_id: &str, body: ChatCompletionRequest) -> Self {
        Self {
            token_id: token_id.to_string(),
            token_name: token_id.to_string(),
            user_id: user_id.to_string(),
            group: "default".to_string(),
            channel_ratios: HashMap::new(),
            body,
            headers: HeaderMap::new(),
        }
    }
}

pub enum RelayResponse {
    Json(ChatCompletionResponse),
    Stream(SseBody),
}

/// Everything needed to settle a request after the fact.
struct Pending {
    meta: RelayMeta,
    reservation: Reservation,
    pricing: Pricing,
    _in_flight: InFlightGuard,
}

pub struct Relay {
    adaptors: AdaptorRegistry,
    channels: Arc<dyn ChannelStore>,
    ledger: QuotaLedger,
    ratios: Arc<RatioTables>,
    health: Arc<HealthMonitor>,
    metrics: Arc<MetricsRecorder>,
    tokens: Arc<TokenCounter>,
    stream_buffer: usize,
    settlements: Mutex<Vec<JoinHandle<()>>>,
}

impl Relay {
    pub fn new(
        adaptors: AdaptorRegistry,
        channels: Arc<dyn ChannelStore>,
        ledger: QuotaLedger,
        ratios: Arc<RatioTables>,
        health: Arc<HealthMonitor>,
        metrics: Arc<MetricsRecorder>,
        tokens: Arc<TokenCounter>,
    ) -> Arc<Self> {
        Arc::new(Self {
            adaptors,
            channels,
            ledger,
            ratios,
            health,
            metrics,
            tokens,
            stream_buffer: DEFAULT_STREAM_BUFFER,
            settlements: Mutex::new(Vec::new()),
        })
    }

    pub fn adaptors(&self) -> &AdaptorRegistry {
        &self.adaptors
    }

    pub fn channels(&self) -> &Arc<dyn ChannelStore> {
        &self.channels
    }

    pub fn ledger(&self) -> &QuotaLedger {
        &self.ledger
    }

    pub fn metrics(&self) -> &Arc<MetricsRecorder> {
        &self.metrics
    }

    /// Wait for every detached settlement started so far.
    pub async fn drain(&self) {
        loop {
            let handles: Vec<JoinHandle<()>> = match self.settlements.lock() {
                Ok(mut g) => g.drain(..).collect(),
                Err(poisoned) => poisoned.into_inner().drain(..).collect(),
            };
            if handles.is_empty() {
                return;
            }
            for h in handles {
                if let Err(e) = h.await {
                    tracing::error!(error = %e, "settlement task failed");
                }
            }
        }
    }

    /// Pick an enabled channel serving `model` for `group`.
    pub async fn select_channel(&self, model: &str, group: &str) -> Result<Channel, RelayError> {
        let channels = self
            .channels
            .list()
            .await
            .map_err(|e| RelayError::local(e, "channel_store_error", 500))?;
        let candidates: Vec<Channel> = channels
            .into_iter()
            .filter(|c| c.is_enabled())
            .filter(|c| c.group.as_deref().map(|g| g == group).unwrap_or(true))
            .filter(|c| c.models.is_empty() || c.models.iter().any(|m| m == model))
            .filter(|c| self.adaptors.get(c.channel_type).is_some())
            .collect();
        candidates
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or_else(|| {
                RelayError::local(
                    format!("no available channel for model {} in group {}", model, group),
                    "model_not_found",
                    503,
                )
            })
    }

    pub async fn relay(self: &Arc<Self>, req: RelayRequest) -> Result<RelayResponse, RelayError> {
        if req.body.model.trim().is_empty() {
            return Err(RelayError::invalid_request("model is required").with_param("model"));
        }
        if req.body.messages.is_empty() {
            return Err(RelayError::invalid_request("messages must not be empty").with_param("messages"));
        }

        let channel = self.select_channel(&req.body.model, &req.group).await?;
        let (api_key, key_index) = self
            .channels
            .select_key(channel.id, &[])
            .await
            .map_err(|e| match e {
                ChannelError::NoKeys(msg) => RelayError::local(msg, "no_available_key", 503),
                other => RelayError::local(other, "channel_store_error", 500),
            })?;
        if let Err(e) = self.channels.record_key_used(channel.id, key_index).await {
            tracing::warn!(channel_id = channel.id, error = %e, "failed to record key usage");
        }
        let adaptor = self.adaptors.get(channel.channel_type).ok_or_else(|| {
            RelayError::local("no adaptor for channel type", "channel_config_error", 500)
        })?;

        let mut meta = RelayMeta::for_channel(&channel, &api_key, key_index, &req.body.model);
        meta.token_id = req.token_id.clone();
        meta.token_name = req.token_name.clone();
        meta.user_id = req.user_id.clone();
        meta.group = req.group.clone();
        meta.is_stream = req.body.stream;
        meta.include_usage = req.body.include_usage();
        meta.prompt_tokens = self.tokens.prompt_tokens(&req.body);
        if let Some(r) = req.channel_ratios.get(&channel.id) {
            meta.channel_ratio *= r;
        }

        let pricing = self
            .ratios
            .pricing_for(&meta.origin_model, &meta.group, meta.channel_ratio);
        let estimate = self.ratios.pre_consumed_quota(
            meta.prompt_tokens,
            req.body.effective_max_tokens(),
            &pricing,
        );
        let reservation = self
            .ledger
            .reserve(&meta.user_id, &meta.token_id, estimate)
            .await?;
        tracing::info!(
            request_id = %meta.request_id,
            channel_id = meta.channel_id,
            key_index,
            model = %meta.origin_model,
            actual_model = %meta.actual_model,
            stream = meta.is_stream,
            estimate,
            "relaying request"
        );

        let pending = Pending {
            meta,
            reservation,
            pricing,
            _in_flight: self.metrics.begin_request(),
        };
        self.dispatch(adaptor, req, pending).await
    }

    async fn dispatch(
        self: &Arc<Self>,
        adaptor: Arc<dyn Adaptor>,
        req: RelayRequest,
        mut pending: Pending,
    ) -> Result<RelayResponse, RelayError> {
        let prepared = async {
            adaptor.init(&pending.meta)?;
            adaptor.convert_request(&req.body, &pending.meta).await
        }
        .await;
        let body = match prepared {
            Ok(b) => b,
            Err(e) => return Err(self.fail(pending, e.into())),
        };

        let resp = match adaptor.execute(&pending.meta, body, &req.headers).await {
            Ok(r) => r,
            Err(e) => return Err(self.fail(pending, e.into())),
        };
        pending.meta.first_response = Some(Instant::now());

        if !resp.is_success() || (pending.meta.is_stream && resp.is_json()) {
            let err = upstream_failure(adaptor.as_ref(), resp).await;
            return Err(self.fail(pending, err));
        }
        if pending.meta.is_stream {
            Ok(RelayResponse::Stream(self.stream(adaptor, resp, pending)))
        } else {
            self.single_shot(adaptor, resp, pending).await.map(RelayResponse::Json)
        }
    }

    async fn single_shot(
        self: &Arc<Self>,
        adaptor: Arc<dyn Adaptor>,
        resp: UpstreamResponse,
        pending: Pending,
    ) -> Result<ChatCompletionResponse, RelayError> {
        let bytes = match resp.into_bytes().await {
            Ok(b) => b,
            Err(e) => return Err(self.fail(pending, RelayError::transport(e))),
        };
        if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&bytes) {
            if let Some(err) = embedded_error(&value, adaptor.error_parser()) {
                return Err(self.fail(pending, err));
            }
        }
        let (mut response, usage) = match adaptor.convert_response(&pending.meta, &bytes) {
            Ok(r) => r,
            Err(e) => return Err(self.fail(pending, e.into())),
        };
        let usage = metered_usage(usage, &response, pending.meta.prompt_tokens, &self.tokens);
        response.usage = Some(usage.clone());
        response.model = pending.meta.origin_model.clone();
        self.settle(pending, usage, None, None);
        Ok(response)
    }

    fn stream(
        self: &Arc<Self>,
        adaptor: Arc<dyn Adaptor>,
        resp: UpstreamResponse,
        pending: Pending,
    ) -> SseBody {
        let acc = Arc::new(Mutex::new(StreamAccumulator::new(
            &pending.meta.origin_model,
            pending.meta.start,
        )));
        let mut translated = TranslatedStream::new(
            resp.into_records(),
            adaptor.stream_dialect(&pending.meta),
            acc.clone(),
            pending.meta.include_usage,
        );
        let (mut tx, rx) = futures::channel::mpsc::channel(self.stream_buffer);
        let relay = Arc::clone(self);
        let task = tokio::spawn(async move {
            // Keep draining after the client leaves so usage is still metered.
            while let Some(frame) = translated.next().await {
                let gone = stream::lock(&acc).client_gone;
                if gone {
                    continue;
                }
                if tx.send(frame).await.is_err() {
                    tracing::info!(request_id = %pending.meta.request_id, "client went away, draining upstream");
                    stream::lock(&acc).client_gone = true;
                }
            }
            drop(tx);
            let (usage, error, first_token) = {
                let mut a = stream::lock(&acc);
                if a.malformed > 0 {
                    tracing::warn!(request_id = %pending.meta.request_id, malformed = a.malformed, "stream had malformed records");
                }
                (
                    a.metered_usage(pending.meta.prompt_tokens, &relay.tokens),
                    a.upstream_error.take(),
                    a.first_token_latency(),
                )
            };
            relay.settle_now(pending, usage, error, first_token).await;
        });
        self.track(task);
        rx
    }

    /// Roll back, report the failure and hand the error back.
    fn fail(self: &Arc<Self>, pending: Pending, err: RelayError) -> RelayError {
        tracing::warn!(
            request_id = %pending.meta.request_id,
            channel_id = pending.meta.channel_id,
            status = err.status,
            error = %err,
            "relay failed"
        );
        let relay = Arc::clone(self);
        let reported = err.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = relay.ledger.rollback(&pending.reservation).await {
                tracing::error!(reservation = %pending.reservation.id, error = %e, "rollback failed");
            }
            relay.report(&pending, Some(&reported), None).await;
        });
        self.track(task);
        err
    }

    fn settle(
        self: &Arc<Self>,
        pending: Pending,
        usage: ChatUsage,
        error: Option<RelayError>,
        first_token: Option<std::time::Duration>,
    ) {
        let relay = Arc::clone(self);
        let task = tokio::spawn(async move {
            relay.settle_now(pending, usage, error, first_token).await;
        });
        self.track(task);
    }

    /// Charge the metered usage, then report the outcome.
    async fn settle_now(
        &self,
        pending: Pending,
        usage: ChatUsage,
        error: Option<RelayError>,
        first_token: Option<std::time::Duration>,
    ) {
        let meta = &pending.meta;
        let cost = cost::quota_for_usage(&usage, &pending.pricing);
        let log = ConsumeLog {
            request_id: meta.request_id.clone(),
            created_at: crate::models::chat::unix_now(),
            user_id: meta.user_id.clone(),
            token_id: meta.token_id.clone(),
            token_name: meta.token_name.clone(),
            channel_id: meta.channel_id,
            model: meta.origin_model.clone(),
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            quota: cost.quota,
            model_ratio: pending.pricing.model_ratio,
            completion_ratio: pending.pricing.completion_ratio,
            group_ratio: pending.pricing.group_ratio,
            channel_ratio: pending.pricing.channel_ratio,
            duration_ms: meta.start.elapsed().as_millis() as u64,
            is_stream: meta.is_stream,
            first_token_ms: first_token.map(|d| d.as_millis() as u64),
            cache_creation_5m_tokens: usage.cache_creation_5m_tokens + usage.cache_creation_tokens,
            cache_creation_1h_tokens: usage.cache_creation_1h_tokens,
            cache_read_tokens: usage.cache_read_tokens,
            content: format!(
                "model ratio {:.3}, completion ratio {:.2}, group ratio {:.2}",
                pending.pricing.model_ratio,
                pending.pricing.completion_ratio,
                pending.pricing.group_ratio
            ),
        };
        match self
            .ledger
            .reconcile(&pending.reservation, cost.quota, meta.channel_id, log)
            .await
        {
            Ok(s) => tracing::info!(
                request_id = %meta.request_id,
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                quota = cost.quota,
                delta = s.delta,
                "request settled"
            ),
            Err(e) => tracing::error!(request_id = %meta.request_id, error = %e, "reconcile failed"),
        }
        self.report(&pending, error.as_ref(), first_token).await;
    }

    async fn report(
        &self,
        pending: &Pending,
        error: Option<&RelayError>,
        first_token: Option<std::time::Duration>,
    ) {
        let meta = &pending.meta;
        // Gateway-side failures say nothing about the channel.
        let outcome = match error {
            Some(e) if e.local => None,
            Some(e) => Some(Outcome::Failure(e)),
            None => Some(Outcome::Success),
        };
        if let Some(outcome) = outcome {
            if let Err(e) = self
                .health
                .record_outcome(meta.channel_id, meta.key_index, &meta.actual_model, outcome)
                .await
            {
                tracing::warn!(channel_id = meta.channel_id, error = %e, "health update failed");
            }
        }
        self.metrics.record(RequestSample {
            channel_id: meta.channel_id,
            model: meta.origin_model.clone(),
            status: error.map(|e| e.status).unwrap_or(200),
            success: error.is_none(),
            stream: meta.is_stream,
            latency: meta.start.elapsed(),
            first_token,
        });
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = match self.settlements.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }
}

/// Read a failed (or JSON-instead-of-stream) upstream response into the
/// canonical error.
async fn upstream_failure(adaptor: &dyn Adaptor, resp: UpstreamResponse) -> RelayError {
    let status = resp.status;
    let ok_status = resp.is_success();
    let bytes = match resp.into_bytes().await {
        Ok(b) => b,
        Err(e) => return RelayError::transport(e),
    };
    if !ok_status {
        return relay_error_from_body(status, &bytes, adaptor.error_parser());
    }
    serde_json::from_slice::<serde_json::Value>(&bytes)
        .ok()
        .and_then(|v| embedded_error(&v, adaptor.error_parser()))
        .unwrap_or_else(|| {
            RelayError::new(
                502,
                "upstream_error",
                "bad_response",
                "upstream answered a streaming request with a JSON body",
            )
        })
}

/// Upstream usage, or an estimate when the provider reported none.
fn metered_usage(
    usage: ChatUsage,
    response: &ChatCompletionResponse,
    prompt_estimate: u64,
    tokens: &TokenCounter,
) -> ChatUsage {
    if !usage.is_empty() {
        let mut u = usage;
        if u.prompt_tokens == 0 {
            u.prompt_tokens = prompt_estimate;
            u.total_tokens = u.prompt_tokens + u.completion_tokens;
        }
        return u;
    }
    let mut completion = tokens.count(&response.model, &response.first_text());
    for choice in &response.choices {
        if let Some(reasoning) = &choice.message.reasoning_content {
            completion += tokens.count(&response.model, reasoning);
        }
        for tc in choice.message.tool_calls.iter().flatten() {
            completion += tokens.count(&response.model, &tc.function.arguments);
        }
    }
    tracing::debug!(prompt_estimate, completion, "upstream reported no usage, estimating");
    ChatUsage::new(prompt_estimate, completion)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::chat::{ChatChoice, ChatResponseMessage};
    use crate::tokenizer::tests::COUNTER;

    fn response(text: &str) -> ChatCompletionResponse {
        ChatCompletionResponse {
            id: "x".into(),
            object: "chat.completion".into(),
            created: 0,
            model: "m".into(),
            choices: vec![ChatChoice {
                index: 0,
                message: ChatResponseMessage {
                    role: "assistant".into(),
                    content: Some(text.into()),
                    reasoning_content: None,
                    tool_calls: None,
                },
                finish_reason: Some("stop".into()),
                logprobs: None,
            }],
            usage: None,
            system_fingerprint: None,
        }
    }

    #[test]
    fn missing_usage_is_estimated_from_the_answer() {
        let u = metered_usage(ChatUsage::default(), &response("十二个字符的回答"), 10, &COUNTER);
        let expected = COUNTER.count("m", "十二个字符的回答");
        assert!(expected >= 4);
        assert_eq!(u.prompt_tokens, 10);
        assert_eq!(u.completion_tokens, expected);
        assert_eq!(u.total_tokens, 10 + expected);
    }

    #[test]
    fn reported_usage_wins_and_gets_a_prompt_when_missing() {
        let u = metered_usage(ChatUsage::new(0, 7), &response("ignored"), 11, &COUNTER);
        assert_eq!(u.prompt_tokens, 11);
        assert_eq!(u.completion_tokens, 7);
        let u = metered_usage(ChatUsage::new(20, 7), &response("ignored"), 11, &COUNTER);
        assert_eq!(u.prompt_tokens, 20);
    }
}
