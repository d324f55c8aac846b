//! Streaming Translator
//!
//! Turns an upstream push stream into canonical `chat.completion.chunk` SSE
//! frames, one connection at a time.
//!
//! - `SseFrames` splits raw bytes into records (`event:` name + joined `data:` lines).
//! - A provider `StreamDialect` classifies each record into a delta, a
//!   consumed bookkeeping record, or the terminal sentinel.
//! - `StreamAccumulator` keeps the transcript, tool-call argument buffers,
//!   monotonic usage and the first-token instant.
//! - `TranslatedStream` writes at most one frame per consumed record, then a
//!   finish chunk (if the upstream never sent one), an optional usage chunk and
//!   `data: [DONE]` when the upstream ends.
//!
//! A malformed record is logged and skipped. An upstream transport error ends
//! the stream gracefully; whatever usage was accumulated is still metered.

use crate::error::RelayError;
use crate::tokenizer::TokenCounter;
use crate::models::chat::{
    self, ChatCompletionChunk, ChatDelta, ChatStreamChoice, ChatUsage, FunctionCallDelta,
    ToolCall, ToolCallDelta,
};
use bytes::Bytes;
use futures_util::stream::Stream;
use std::collections::{BTreeMap, VecDeque};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;
pub type RecordStream = Pin<Box<dyn Stream<Item = Result<StreamRecord, std::io::Error>> + Send>>;

/// One framed upstream record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRecord {
    pub event: Option<String>,
    pub data: String,
}

impl StreamRecord {
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
        }
    }

    pub fn event(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: Some(event.into()),
            data: data.into(),
        }
    }
}

/// Splits an SSE byte stream into records on blank lines.
pub struct SseFrames<S> {
    inner: S,
    buffer: Vec<u8>,
    done: bool,
}

impl<S> SseFrames<S>
where
    S: Stream<Item = Result<Bytes, std::io::Error>> + Unpin,
{
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
            done: false,
        }
    }

    fn parse_block(block: &[u8]) -> Option<StreamRecord> {
        let mut event = None;
        let mut data_lines: Vec<String> = Vec::new();
        for line in block.split(|&b| b == b'\n') {
            let line = String::from_utf8_lossy(line);
            if let Some(rest) = line.strip_prefix("data:") {
                data_lines.push(rest.trim().to_string());
            } else if let Some(rest) = line.strip_prefix("event:") {
                event = Some(rest.trim().to_string());
            }
            // comments (":"), ids and retry hints are ignored
        }
        if data_lines.is_empty() && event.is_none() {
            return None;
        }
        Some(StreamRecord {
            event,
            data: data_lines.join("\n"),
        })
    }

    fn next_record(&mut self) -> Option<StreamRecord> {
        while let Some(pos) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let block: Vec<u8> = self.buffer.drain(..pos + 2).collect();
            if let Some(rec) = Self::parse_block(&block[..pos]) {
                return Some(rec);
            }
        }
        None
    }
}

impl<S> Stream for SseFrames<S>
where
    S: Stream<Item = Result<Bytes, std::io::Error>> + Unpin,
{
    type Item = Result<StreamRecord, std::io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(rec) = this.next_record() {
                return Poll::Ready(Some(Ok(rec)));
            }
            if this.done {
                // Emit a trailing record that lacks its blank-line terminator.
                let rest = std::mem::take(&mut this.buffer);
                return Poll::Ready(Self::parse_block(&rest).map(Ok));
            }
            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    this.buffer.extend(chunk.iter().filter(|b| **b != b'\r'));
                }
                Poll::Ready(Some(Err(err))) => return Poll::Ready(Some(Err(err))),
                Poll::Ready(None) => this.done = true,
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Arguments of one tool call collected across fragments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolCallBuffer {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// Per-connection translation state.
#[derive(Debug)]
pub struct StreamAccumulator {
    pub id: String,
    pub model: String,
    pub created: u64,
    pub text: String,
    pub reasoning: String,
    pub finish_reason: Option<String>,
    pub records: u64,
    pub malformed: u64,
    pub upstream_error: Option<RelayError>,
    pub client_gone: bool,
    tool_calls: BTreeMap<u32, ToolCallBuffer>,
    usage: ChatUsage,
    usage_seen: bool,
    started: Instant,
    first_token: Option<Instant>,
}

impl StreamAccumulator {
    pub fn new(model: &str, started: Instant) -> Self {
        Self {
            id: chat::new_completion_id(),
            model: model.to_string(),
            created: chat::unix_now(),
            text: String::new(),
            reasoning: String::new(),
            finish_reason: None,
            records: 0,
            malformed: 0,
            upstream_error: None,
            client_gone: false,
            tool_calls: BTreeMap::new(),
            usage: ChatUsage::default(),
            usage_seen: false,
            started,
            first_token: None,
        }
    }

    /// Adopt the upstream's response id / model when it reports them.
    pub fn set_identity(&mut self, id: Option<&str>, model: Option<&str>) {
        if let Some(id) = id.filter(|s| !s.is_empty()) {
            self.id = id.to_string();
        }
        if let Some(model) = model.filter(|s| !s.is_empty()) {
            self.model = model.to_string();
        }
    }

    /// Merge a usage report. Counters only ever grow.
    pub fn observe_usage(&mut self, usage: &ChatUsage) {
        self.usage.merge_max(usage);
        self.usage_seen = true;
    }

    pub fn usage(&self) -> ChatUsage {
        self.usage.clone()
    }

    pub fn has_usage(&self) -> bool {
        self.usage_seen && !self.usage.is_empty()
    }

    pub fn mark_first_token(&mut self) {
        if self.first_token.is_none() {
            self.first_token = Some(Instant::now());
        }
    }

    pub fn first_token_latency(&self) -> Option<Duration> {
        self.first_token.map(|t| t.duration_since(self.started))
    }

    /// Fold a forwarded delta into the transcript and tool buffers.
    pub fn apply_delta(&mut self, delta: &ChatDelta) {
        if let Some(text) = delta.content.as_deref().filter(|t| !t.is_empty()) {
            self.text.push_str(text);
            self.mark_first_token();
        }
        if let Some(text) = delta.reasoning_content.as_deref().filter(|t| !t.is_empty()) {
            self.reasoning.push_str(text);
            self.mark_first_token();
        }
        for tc in delta.tool_calls.iter().flatten() {
            let buf = self.tool_calls.entry(tc.index).or_default();
            if let Some(id) = tc.id.as_deref().filter(|s| !s.is_empty()) {
                buf.id = id.to_string();
            }
            if let Some(f) = &tc.function {
                if let Some(name) = f.name.as_deref().filter(|s| !s.is_empty()) {
                    buf.name = name.to_string();
                }
                if let Some(args) = &f.arguments {
                    buf.arguments.push_str(args);
                }
            }
        }
    }

    /// Normalize zero-argument tool calls to `{}` and return the indices that
    /// were rewritten.
    pub fn finish(&mut self) -> Vec<u32> {
        let mut normalized = Vec::new();
        for (idx, buf) in self.tool_calls.iter_mut() {
            if buf.arguments.trim().is_empty() {
                buf.arguments = "{}".to_string();
                normalized.push(*idx);
            }
        }
        normalized
    }

    pub fn tool_call_buffers(&self) -> &BTreeMap<u32, ToolCallBuffer> {
        &self.tool_calls
    }

    pub fn tool_calls(&self) -> Vec<ToolCall> {
        self.tool_calls
            .values()
            .map(|b| ToolCall {
                id: b.id.clone(),
                call_type: "function".to_string(),
                function: chat::FunctionCall {
                    name: b.name.clone(),
                    arguments: b.arguments.clone(),
                },
            })
            .collect()
    }

    /// Usage to meter. Falls back to the prompt estimate plus a transcript
    /// based completion estimate when the upstream never reported usage.
    pub fn metered_usage(&self, prompt_estimate: u64, tokens: &TokenCounter) -> ChatUsage {
        if self.has_usage() {
            let mut u = self.usage.clone();
            if u.prompt_tokens == 0 {
                u.prompt_tokens = prompt_estimate;
                u.total_tokens = u.prompt_tokens + u.completion_tokens;
            }
            return u;
        }
        let completion = tokens.count_all(
            &self.model,
            [self.text.as_str(), self.reasoning.as_str()]
                .into_iter()
                .chain(self.tool_calls.values().map(|b| b.arguments.as_str())),
        );
        ChatUsage::new(prompt_estimate, completion)
    }
}

/// Lock a shared accumulator, recovering the data if a holder panicked.
pub fn lock(acc: &Mutex<StreamAccumulator>) -> MutexGuard<'_, StreamAccumulator> {
    acc.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// What a dialect made of one record.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    /// Forward one canonical chunk.
    Delta {
        delta: ChatDelta,
        finish_reason: Option<String>,
    },
    /// Bookkeeping only (ids, usage, pings); nothing to forward.
    Consumed,
    /// The provider's terminal signal.
    Done,
}

impl RecordOutcome {
    pub fn text(text: impl Into<String>) -> Self {
        RecordOutcome::Delta {
            delta: ChatDelta {
                content: Some(text.into()),
                ..Default::default()
            },
            finish_reason: None,
        }
    }

    pub fn finish(reason: impl Into<String>) -> Self {
        RecordOutcome::Delta {
            delta: ChatDelta::default(),
            finish_reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DialectError {
    #[error("malformed record: {0}")]
    Malformed(String),
    #[error("upstream error event: {0}")]
    Upstream(RelayError),
}

impl From<serde_json::Error> for DialectError {
    fn from(e: serde_json::Error) -> Self {
        DialectError::Malformed(e.to_string())
    }
}

/// Provider-specific record classifier.
pub trait StreamDialect: Send {
    fn name(&self) -> &'static str;

    fn on_record(
        &mut self,
        record: &StreamRecord,
        acc: &mut StreamAccumulator,
    ) -> Result<RecordOutcome, DialectError>;
}

fn sse_frame<T: serde::Serialize>(value: &T) -> Option<Bytes> {
    match serde_json::to_vec(value) {
        Ok(json) => {
            let mut out = Vec::with_capacity(json.len() + 8);
            out.extend_from_slice(b"data: ");
            out.extend_from_slice(&json);
            out.extend_from_slice(b"\n\n");
            Some(Bytes::from(out))
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to serialize stream chunk");
            None
        }
    }
}

/// Record stream → canonical SSE frames.
pub struct TranslatedStream<S> {
    inner: S,
    dialect: Box<dyn StreamDialect>,
    acc: Arc<Mutex<StreamAccumulator>>,
    include_usage: bool,
    pending: VecDeque<Bytes>,
    role_sent: bool,
    finish_sent: bool,
    done: bool,
}

impl<S> TranslatedStream<S>
where
    S: Stream<Item = Result<StreamRecord, std::io::Error>> + Unpin,
{
    pub fn new(
        inner: S,
        dialect: Box<dyn StreamDialect>,
        acc: Arc<Mutex<StreamAccumulator>>,
        include_usage: bool,
    ) -> Self {
        Self {
            inner,
            dialect,
            acc,
            include_usage,
            pending: VecDeque::new(),
            role_sent: false,
            finish_sent: false,
            done: false,
        }
    }

    fn chunk(
        acc: &StreamAccumulator,
        delta: ChatDelta,
        finish_reason: Option<String>,
    ) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: acc.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: acc.created,
            model: acc.model.clone(),
            choices: vec![ChatStreamChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            usage: None,
        }
    }

    /// Append `{}` argument fragments for tool calls that never got any.
    fn normalized_tool_deltas(acc: &mut StreamAccumulator) -> Option<Vec<ToolCallDelta>> {
        let normalized = acc.finish();
        if normalized.is_empty() {
            return None;
        }
        Some(
            normalized
                .into_iter()
                .map(|index| ToolCallDelta {
                    index,
                    id: None,
                    call_type: None,
                    function: Some(FunctionCallDelta {
                        name: None,
                        arguments: Some("{}".to_string()),
                    }),
                })
                .collect(),
        )
    }

    fn handle_record(&mut self, record: StreamRecord) {
        let acc_arc = Arc::clone(&self.acc);
        let mut acc = lock(&acc_arc);
        acc.records += 1;
        match self.dialect.on_record(&record, &mut acc) {
            Ok(RecordOutcome::Delta {
                mut delta,
                finish_reason,
            }) => {
                acc.apply_delta(&delta);
                if let Some(reason) = &finish_reason {
                    acc.finish_reason = Some(reason.clone());
                    if let Some(extra) = Self::normalized_tool_deltas(&mut acc) {
                        delta.tool_calls.get_or_insert_with(Vec::new).extend(extra);
                    }
                    self.finish_sent = true;
                }
                if !self.role_sent {
                    delta.role = Some("assistant".to_string());
                    self.role_sent = true;
                }
                if let Some(frame) = sse_frame(&Self::chunk(&acc, delta, finish_reason)) {
                    self.pending.push_back(frame);
                }
            }
            Ok(RecordOutcome::Consumed) => {}
            Ok(RecordOutcome::Done) => {
                drop(acc);
                self.terminate();
            }
            Err(DialectError::Malformed(msg)) => {
                acc.malformed += 1;
                tracing::warn!(dialect = self.dialect.name(), error = %msg, "skipping malformed stream record");
            }
            Err(DialectError::Upstream(err)) => {
                tracing::warn!(dialect = self.dialect.name(), error = %err, "upstream reported an error mid-stream");
                acc.upstream_error = Some(err);
                drop(acc);
                self.terminate();
            }
        }
    }

    fn terminate(&mut self) {
        if self.done {
            return;
        }
        let acc_arc = Arc::clone(&self.acc);
        let mut acc = lock(&acc_arc);
        if !self.finish_sent {
            let tool_deltas = Self::normalized_tool_deltas(&mut acc);
            let reason = acc.finish_reason.clone().unwrap_or_else(|| {
                if acc.tool_call_buffers().is_empty() {
                    "stop".to_string()
                } else {
                    "tool_calls".to_string()
                }
            });
            acc.finish_reason = Some(reason.clone());
            let delta = ChatDelta {
                tool_calls: tool_deltas,
                ..Default::default()
            };
            if let Some(frame) = sse_frame(&Self::chunk(&acc, delta, Some(reason))) {
                self.pending.push_back(frame);
            }
            self.finish_sent = true;
        }
        if self.include_usage {
            let usage_chunk = ChatCompletionChunk {
                id: acc.id.clone(),
                object: "chat.completion.chunk".to_string(),
                created: acc.created,
                model: acc.model.clone(),
                choices: Vec::new(),
                usage: Some(acc.usage()),
            };
            if let Some(frame) = sse_frame(&usage_chunk) {
                self.pending.push_back(frame);
            }
        }
        self.pending.push_back(Bytes::from_static(b"data: [DONE]\n\n"));
        self.done = true;
    }
}

impl<S> Stream for TranslatedStream<S>
where
    S: Stream<Item = Result<StreamRecord, std::io::Error>> + Unpin,
{
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(frame) = this.pending.pop_front() {
                return Poll::Ready(Some(Ok(frame)));
            }
            if this.done {
                return Poll::Ready(None);
            }
            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(record))) => this.handle_record(record),
                Poll::Ready(Some(Err(err))) => {
                    tracing::warn!(error = %err, "upstream stream failed, closing");
                    lock(&this.acc).upstream_error = Some(RelayError::transport(&err));
                    this.terminate();
                }
                Poll::Ready(None) => this.terminate(),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adaptor::openai::OpenAiDialect;
    use crate::tokenizer::tests::COUNTER;
    use futures_util::stream::{self, StreamExt};
    use serde_json::{json, Value};

    fn byte_stream(parts: &[&str]) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Unpin {
        let owned: Vec<Result<Bytes, std::io::Error>> = parts
            .iter()
            .map(|p| Ok(Bytes::from(p.to_string())))
            .collect();
        stream::iter(owned)
    }

    async fn collect_frames<S>(s: S) -> Vec<String>
    where
        S: Stream<Item = Result<Bytes, std::io::Error>> + Unpin,
    {
        s.map(|f| String::from_utf8(f.unwrap().to_vec()).unwrap())
            .collect()
            .await
    }

    fn frame_json(frame: &str) -> Value {
        serde_json::from_str(frame.trim().trim_start_matches("data: ")).unwrap()
    }

    #[tokio::test]
    async fn sse_frames_handle_split_chunks_and_crlf() {
        let frames = SseFrames::new(byte_stream(&[
            "event: ping\r\ndata: {\"a\"",
            ":1}\r\n\r\n: comment\n\ndata: x",
        ]));
        let recs: Vec<StreamRecord> = frames.map(|r| r.unwrap()).collect().await;
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0], StreamRecord::event("ping", "{\"a\":1}"));
        // trailing record without terminator is still delivered
        assert_eq!(recs[1], StreamRecord::data("x"));
    }

    fn translated(
        records: Vec<StreamRecord>,
        include_usage: bool,
    ) -> (
        TranslatedStream<impl Stream<Item = Result<StreamRecord, std::io::Error>> + Unpin>,
        Arc<Mutex<StreamAccumulator>>,
    ) {
        let acc = Arc::new(Mutex::new(StreamAccumulator::new("gpt-4o", Instant::now())));
        let inner = stream::iter(records.into_iter().map(Ok).collect::<Vec<_>>());
        (
            TranslatedStream::new(inner, Box::new(OpenAiDialect), acc.clone(), include_usage),
            acc,
        )
    }

    #[tokio::test]
    async fn openai_chunks_pass_through_with_usage_chunk() {
        let recs = vec![
            StreamRecord::data(json!({"id": "c1", "object": "chat.completion.chunk", "created": 1, "model": "gpt-4o",
                "choices": [{"index": 0, "delta": {"content": "Hel"}, "finish_reason": null}]}).to_string()),
            StreamRecord::data("not json"),
            StreamRecord::data(json!({"id": "c1", "object": "chat.completion.chunk", "created": 1, "model": "gpt-4o",
                "choices": [{"index": 0, "delta": {"content": "lo"}, "finish_reason": "stop"}]}).to_string()),
            StreamRecord::data(json!({"id": "c1", "object": "chat.completion.chunk", "created": 1, "model": "gpt-4o",
                "choices": [], "usage": {"prompt_tokens": 5, "completion_tokens": 2, "total_tokens": 7}}).to_string()),
            StreamRecord::data("[DONE]"),
        ];
        let (s, acc) = translated(recs, true);
        let frames = collect_frames(s).await;
        // two deltas, one usage chunk, DONE; the malformed record produced nothing
        assert_eq!(frames.len(), 4);
        assert_eq!(frame_json(&frames[0])["choices"][0]["delta"]["role"], "assistant");
        assert_eq!(frame_json(&frames[1])["choices"][0]["finish_reason"], "stop");
        assert_eq!(frame_json(&frames[2])["usage"]["total_tokens"], 7);
        assert_eq!(frames[3], "data: [DONE]\n\n");

        let acc = lock(&acc);
        assert_eq!(acc.text, "Hello");
        assert_eq!(acc.malformed, 1);
        assert_eq!(acc.usage(), ChatUsage::new(5, 2));
        assert!(acc.first_token_latency().is_some());
    }

    #[tokio::test]
    async fn empty_tool_arguments_become_empty_object() {
        let recs = vec![StreamRecord::data(
            json!({"id": "c", "object": "chat.completion.chunk", "created": 1, "model": "m",
                "choices": [{"index": 0, "delta": {"tool_calls": [{"index": 0, "id": "call_1", "type": "function",
                    "function": {"name": "now", "arguments": ""}}]}, "finish_reason": null}]})
            .to_string(),
        )];
        let (s, acc) = translated(recs, false);
        let frames = collect_frames(s).await;
        // tool delta, synthesized finish, DONE
        assert_eq!(frames.len(), 3);
        let finish = frame_json(&frames[1]);
        assert_eq!(finish["choices"][0]["finish_reason"], "tool_calls");
        assert_eq!(
            finish["choices"][0]["delta"]["tool_calls"][0]["function"]["arguments"],
            "{}"
        );
        let calls = lock(&acc).tool_calls();
        assert_eq!(calls[0].function.arguments, "{}");
        assert_eq!(calls[0].function.name, "now");
    }

    #[tokio::test]
    async fn transport_error_still_terminates_cleanly() {
        let acc = Arc::new(Mutex::new(StreamAccumulator::new("m", Instant::now())));
        let items: Vec<Result<StreamRecord, std::io::Error>> = vec![
            Ok(StreamRecord::data(
                json!({"id": "c", "object": "chat.completion.chunk", "created": 1, "model": "m",
                    "choices": [{"index": 0, "delta": {"content": "partial answer"}, "finish_reason": null}]})
                .to_string(),
            )),
            Err(std::io::Error::other("connection reset")),
        ];
        let s = TranslatedStream::new(stream::iter(items), Box::new(OpenAiDialect), acc.clone(), false);
        let frames = collect_frames(s).await;
        assert_eq!(frames.last().unwrap(), "data: [DONE]\n\n");
        let acc = lock(&acc);
        assert!(acc.upstream_error.is_some());
        // no usage reported: prompt estimate + transcript estimate, never zero
        let metered = acc.metered_usage(12, &COUNTER);
        assert_eq!(metered.prompt_tokens, 12);
        assert_eq!(metered.completion_tokens, COUNTER.count("m", "partial answer"));
    }

    #[test]
    fn accumulator_usage_is_monotonic() {
        let mut acc = StreamAccumulator::new("m", Instant::now());
        acc.observe_usage(&ChatUsage::new(10, 1));
        acc.observe_usage(&ChatUsage::new(0, 5));
        acc.observe_usage(&ChatUsage::new(0, 3));
        assert_eq!(acc.usage(), ChatUsage::new(10, 5));
    }
}
