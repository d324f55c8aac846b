//! Channel/key state-change notifications.
//!
//! Two bounded queues (key-level and channel-level). Each queue's task renders
//! a notification once and forwards it to one bounded lane per sink, and every
//! lane is delivered by its own task with a send timeout, so a stalled sink
//! only delays itself. Enqueueing never blocks: when a queue or lane is full
//! the notification is dropped and counted.

use crate::models::chat::unix_now;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const DEFAULT_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("sink rejected notification: status {0}")]
    Rejected(u16),
    #[error("sink did not answer within {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    KeyDisabled {
        channel_id: i64,
        channel_name: String,
        key_index: usize,
        masked_key: String,
        reason: String,
        model: String,
        status_code: Option<u16>,
    },
    ChannelDisabled {
        channel_id: i64,
        channel_name: String,
        reason: String,
        model: String,
    },
    ChannelEnabled {
        channel_id: i64,
        channel_name: String,
    },
}

impl Notification {
    pub fn is_key_level(&self) -> bool {
        matches!(self, Notification::KeyDisabled { .. })
    }

    pub fn subject(&self) -> String {
        match self {
            Notification::KeyDisabled {
                channel_id,
                channel_name,
                key_index,
                ..
            } => format!(
                "Key #{} of channel \"{}\" (#{}) has been disabled",
                key_index, channel_name, channel_id
            ),
            Notification::ChannelDisabled {
                channel_id,
                channel_name,
                ..
            } => format!("Channel \"{}\" (#{}) has been disabled", channel_name, channel_id),
            Notification::ChannelEnabled {
                channel_id,
                channel_name,
            } => format!("Channel \"{}\" (#{}) has been enabled", channel_name, channel_id),
        }
    }

    pub fn body(&self) -> String {
        match self {
            Notification::KeyDisabled {
                channel_id,
                channel_name,
                key_index,
                masked_key,
                reason,
                model,
                status_code,
            } => {
                let status = status_code
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "n/a".to_string());
                format!(
                    "Key #{} ({}) of channel \"{}\" (#{}) was automatically disabled.\nModel: {}\nStatus: {}\nReason: {}",
                    key_index, masked_key, channel_name, channel_id, model, status, reason
                )
            }
            Notification::ChannelDisabled {
                channel_id,
                channel_name,
                reason,
                model,
            } => format!(
                "Channel \"{}\" (#{}) was automatically disabled.\nModel: {}\nReason: {}",
                channel_name, channel_id, model, reason
            ),
            Notification::ChannelEnabled {
                channel_id,
                channel_name,
            } => format!(
                "Channel \"{}\" (#{}) passed and was re-enabled.",
                channel_name, channel_id
            ),
        }
    }
}

#[async_trait::async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, subject: &str, body: &str) -> Result<(), NotifyError>;
}

/// Writes notifications to the log.
pub struct LogSink;

#[async_trait::async_trait]
impl NotificationSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, subject: &str, body: &str) -> Result<(), NotifyError> {
        tracing::warn!(subject, body, "channel notification");
        Ok(())
    }
}

/// POSTs `{"title","description","content","time"}` to a URL.
pub struct WebhookSink {
    http: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(http: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }
}

#[async_trait::async_trait]
impl NotificationSink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, subject: &str, body: &str) -> Result<(), NotifyError> {
        let payload = serde_json::json!({
            "title": subject,
            "description": body,
            "content": body,
            "time": unix_now(),
        });
        let resp = self
            .http
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| NotifyError::Http(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(NotifyError::Rejected(resp.status().as_u16()));
        }
        Ok(())
    }
}

struct Queues {
    key: mpsc::Sender<Notification>,
    channel: mpsc::Sender<Notification>,
}

/// Fan-out of notifications to sinks. Must be started inside a tokio runtime.
pub struct Notifier {
    queues: Mutex<Option<Queues>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    dropped: Arc<AtomicU64>,
}

impl Notifier {
    pub fn start(sinks: Vec<Arc<dyn NotificationSink>>, capacity: usize) -> Self {
        Self::start_with_timeout(sinks, capacity, DEFAULT_SEND_TIMEOUT)
    }

    pub fn start_with_timeout(
        sinks: Vec<Arc<dyn NotificationSink>>,
        capacity: usize,
        send_timeout: Duration,
    ) -> Self {
        let capacity = capacity.max(1);
        let (key_tx, key_rx) = mpsc::channel(capacity);
        let (channel_tx, channel_rx) = mpsc::channel(capacity);
        let dropped = Arc::new(AtomicU64::new(0));
        let fanout = |queue: &'static str, rx: mpsc::Receiver<Notification>| Fanout {
            queue,
            sinks: sinks.clone(),
            capacity,
            send_timeout,
            dropped: dropped.clone(),
        }
        .run(rx);
        let workers = vec![
            tokio::spawn(fanout("key", key_rx)),
            tokio::spawn(fanout("channel", channel_rx)),
        ];
        Self {
            queues: Mutex::new(Some(Queues {
                key: key_tx,
                channel: channel_tx,
            })),
            workers: Mutex::new(workers),
            dropped,
        }
    }

    /// Enqueue without waiting. Returns false if the notification was dropped.
    pub fn notify(&self, notification: Notification) -> bool {
        let guard = match self.queues.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Some(queues) = guard.as_ref() else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        let tx = if notification.is_key_level() {
            &queues.key
        } else {
            &queues.channel
        };
        match tx.try_send(notification) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(n)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(subject = %n.subject(), dropped_total = total, "notification queue full, dropping");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Close both queues and wait for queued notifications to be delivered
    /// or to time out.
    pub async fn shutdown(&self) {
        let queues = match self.queues.lock() {
            Ok(mut g) => g.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(queues);
        let workers: Vec<JoinHandle<()>> = match self.workers.lock() {
            Ok(mut g) => g.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for w in workers {
            if let Err(e) = w.await {
                tracing::warn!(error = %e, "notification worker ended abnormally");
            }
        }
    }
}

struct Rendered {
    subject: String,
    body: String,
}

struct Fanout {
    queue: &'static str,
    sinks: Vec<Arc<dyn NotificationSink>>,
    capacity: usize,
    send_timeout: Duration,
    dropped: Arc<AtomicU64>,
}

impl Fanout {
    async fn run(self, mut rx: mpsc::Receiver<Notification>) {
        let mut lanes = Vec::with_capacity(self.sinks.len());
        let mut handles = Vec::with_capacity(self.sinks.len());
        for sink in &self.sinks {
            let (tx, lane_rx) = mpsc::channel::<Arc<Rendered>>(self.capacity);
            handles.push(tokio::spawn(deliver(
                self.queue,
                sink.clone(),
                lane_rx,
                self.send_timeout,
            )));
            lanes.push((sink.name().to_string(), tx));
        }
        while let Some(n) = rx.recv().await {
            let rendered = Arc::new(Rendered {
                subject: n.subject(),
                body: n.body(),
            });
            for (sink, tx) in &lanes {
                if tx.try_send(rendered.clone()).is_err() {
                    let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    tracing::warn!(queue = self.queue, sink = %sink, dropped_total = total, "sink lane full, dropping");
                }
            }
        }
        drop(lanes);
        for h in handles {
            if let Err(e) = h.await {
                tracing::warn!(queue = self.queue, error = %e, "notification sink task ended abnormally");
            }
        }
        tracing::debug!(queue = self.queue, "notification queue closed");
    }
}

async fn deliver(
    queue: &'static str,
    sink: Arc<dyn NotificationSink>,
    mut rx: mpsc::Receiver<Arc<Rendered>>,
    send_timeout: Duration,
) {
    while let Some(n) = rx.recv().await {
        let result = match tokio::time::timeout(send_timeout, sink.send(&n.subject, &n.body)).await {
            Ok(r) => r,
            Err(_) => Err(NotifyError::Timeout(send_timeout)),
        };
        if let Err(e) = result {
            tracing::warn!(queue, sink = sink.name(), error = %e, "notification delivery failed");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Records everything it is sent.
    #[derive(Default)]
    pub(crate) struct CollectingSink {
        pub sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait::async_trait]
    impl NotificationSink for CollectingSink {
        fn name(&self) -> &str {
            "collect"
        }

        async fn send(&self, subject: &str, body: &str) -> Result<(), NotifyError> {
            self.sent
                .lock()
                .unwrap()
                .push((subject.to_string(), body.to_string()));
            Ok(())
        }
    }

    fn key_disabled(i: usize) -> Notification {
        Notification::KeyDisabled {
            channel_id: 4,
            channel_name: "pool".into(),
            key_index: i,
            masked_key: "sk-a***wxyz".into(),
            reason: "status 401: invalid api key".into(),
            model: "gpt-4o".into(),
            status_code: Some(401),
        }
    }

    #[test]
    fn subject_and_body_name_the_key() {
        let n = key_disabled(2);
        assert!(n.subject().contains("Key #2"));
        let body = n.body();
        assert!(body.contains("sk-a***wxyz"));
        assert!(body.contains("401"));
        assert!(body.contains("gpt-4o"));
    }

    #[tokio::test]
    async fn delivers_to_every_sink_before_shutdown_returns() {
        let a = Arc::new(CollectingSink::default());
        let b = Arc::new(CollectingSink::default());
        let notifier = Notifier::start(vec![a.clone(), b.clone()], 8);
        assert!(notifier.notify(key_disabled(0)));
        assert!(notifier.notify(Notification::ChannelEnabled {
            channel_id: 4,
            channel_name: "pool".into()
        }));
        notifier.shutdown().await;
        assert_eq!(a.sent.lock().unwrap().len(), 2);
        assert_eq!(b.sent.lock().unwrap().len(), 2);
        assert!(!notifier.notify(key_disabled(1)));
    }

    #[tokio::test]
    async fn full_queue_drops_newest_without_blocking() {
        let sink = Arc::new(CollectingSink::default());
        let notifier = Notifier::start(vec![sink.clone()], 1);
        // The worker cannot run until this task yields, so the queue holds one.
        let accepted = (0..5).filter(|i| notifier.notify(key_disabled(*i))).count();
        assert_eq!(accepted, 1);
        assert_eq!(notifier.dropped(), 4);
        // The channel queue is independent.
        assert!(notifier.notify(Notification::ChannelDisabled {
            channel_id: 4,
            channel_name: "pool".into(),
            reason: "all keys disabled".into(),
            model: String::new(),
        }));
        notifier.shutdown().await;
        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().any(|(s, _)| s.contains("Key #0")));
    }

    struct StalledSink;

    #[async_trait::async_trait]
    impl NotificationSink for StalledSink {
        fn name(&self) -> &str {
            "stalled"
        }

        async fn send(&self, _subject: &str, _body: &str) -> Result<(), NotifyError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn stalled_sink_does_not_hold_up_the_others() {
        let fast = Arc::new(CollectingSink::default());
        let sinks: Vec<Arc<dyn NotificationSink>> = vec![Arc::new(StalledSink), fast.clone()];
        let notifier = Notifier::start_with_timeout(
            sinks,
            8,
            Duration::from_millis(300),
        );
        for i in 0..3 {
            assert!(notifier.notify(key_disabled(i)));
        }
        let delivered = tokio::time::timeout(Duration::from_millis(200), async {
            while fast.sent.lock().unwrap().len() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(delivered.is_ok(), "fast sink waited on the stalled one");

        // The stalled lane times out each send instead of hanging shutdown.
        tokio::time::timeout(Duration::from_secs(5), notifier.shutdown())
            .await
            .expect("shutdown finishes once sends time out");
        assert_eq!(fast.sent.lock().unwrap().len(), 3);
    }
}
