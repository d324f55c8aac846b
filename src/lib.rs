#![forbid(unsafe_code)]
#![doc = r#"
Relayium

A relay gateway that accepts OpenAI-style Chat Completions requests, forwards
them to OpenAI-compatible, Anthropic, Gemini, Vertex AI or AWS Bedrock channels, and
answers in the OpenAI dialect, streaming or not.

Crate highlights
- Provider adaptors behind one trait, selected by channel type (`adaptor`).
- Streaming translation of every provider's event stream into canonical SSE chunks (`stream`).
- Two-phase quota accounting: reserve an estimate, reconcile against metered usage (`ledger`, `cost`).
- Channel and key health: auto-disable on credential failures, auto-enable on recovery, notifications (`health`, `notify`).

Modules
- `models`: canonical chat completion types.
- `adaptor`: provider adaptors and the upstream error parsers.
- `stream`: SSE framing and per-provider stream dialects.
- `cost` / `ledger*`: pricing and the quota ledger with memory, sled and redis stores.
- `tokenizer`: BPE token counts for estimates and usage fallbacks.
- `channel` / `health` / `notify`: channel state, health monitor, notification fan-out.
- `metrics`: request samples aggregated into periodic data points.
- `relay`: the orchestrator tying the above together.
- `config` / `server` / `util`: configuration, the actix-web surface, shared helpers.
"#]

pub mod adaptor;
pub mod channel;
pub mod config;
pub mod cost;
pub mod error;
pub mod health;
pub mod ledger;
pub mod ledger_memory;
pub mod ledger_redis;
pub mod ledger_sled;
pub mod metrics;
pub mod models;
pub mod notify;
pub mod relay;
pub mod server;
pub mod stream;
pub mod tokenizer;
pub mod util;

pub use crate::adaptor::{Adaptor, AdaptorRegistry};
pub use crate::channel::{Channel, ChannelStatus, ChannelStore, ChannelType, KeyStatus};
pub use crate::config::RelayConfig;
pub use crate::error::RelayError;
pub use crate::health::{HealthMonitor, HealthPolicy};
pub use crate::ledger::{LedgerStore, QuotaLedger};
pub use crate::metrics::MetricsRecorder;
pub use crate::notify::Notifier;
pub use crate::relay::{Relay, RelayRequest, RelayResponse};

// Re-export the canonical schema (`use relayium::chat`).
pub use crate::models::chat;
