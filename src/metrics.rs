//! Relay metrics.
//!
//! The orchestrator records one [`RequestSample`] per finished request. A
//! background task started with [`MetricsRecorder::start`] periodically turns
//! the collected samples into [`DataPoint`]s and hands them to a
//! [`MetricsSink`]; [`MetricsRecorder::shutdown`] stops it and flushes once
//! more.

use crate::models::chat::unix_now;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("sink failed: {0}")]
    Sink(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataPoint {
    pub name: String,
    pub value: f64,
    pub tags: BTreeMap<String, String>,
    pub timestamp: u64,
}

impl DataPoint {
    fn new(name: &str, value: f64, timestamp: u64) -> Self {
        Self {
            name: name.to_string(),
            value,
            tags: BTreeMap::new(),
            timestamp,
        }
    }

    fn tag(mut self, key: &str, value: impl ToString) -> Self {
        self.tags.insert(key.to_string(), value.to_string());
        self
    }
}

#[async_trait::async_trait]
pub trait MetricsSink: Send + Sync {
    async fn flush(&self, points: Vec<DataPoint>) -> Result<(), MetricsError>;
}

/// Emits each data point as a structured log line.
pub struct LogMetricsSink;

#[async_trait::async_trait]
impl MetricsSink for LogMetricsSink {
    async fn flush(&self, points: Vec<DataPoint>) -> Result<(), MetricsError> {
        for p in points {
            tracing::info!(target: "relayium::metrics", name = %p.name, value = p.value, tags = ?p.tags);
        }
        Ok(())
    }
}

/// Keeps every flushed batch in memory.
#[derive(Default)]
pub struct MemoryMetricsSink {
    batches: Mutex<Vec<Vec<DataPoint>>>,
}

impl MemoryMetricsSink {
    pub fn points(&self) -> Vec<DataPoint> {
        match self.batches.lock() {
            Ok(b) => b.iter().flatten().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().flatten().cloned().collect(),
        }
    }
}

#[async_trait::async_trait]
impl MetricsSink for MemoryMetricsSink {
    async fn flush(&self, points: Vec<DataPoint>) -> Result<(), MetricsError> {
        self.batches
            .lock()
            .map_err(|e| MetricsError::Sink(e.to_string()))?
            .push(points);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RequestSample {
    pub channel_id: i64,
    pub model: String,
    pub status: u16,
    pub success: bool,
    pub stream: bool,
    pub latency: Duration,
    pub first_token: Option<Duration>,
}

#[derive(Default)]
struct Window {
    latencies_ms: Vec<f64>,
    first_token_ms: Vec<f64>,
    requests: u64,
    errors: u64,
    per_channel: HashMap<i64, (u64, u64)>,
}

/// Nearest-rank percentile of an ascending slice.
pub fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((sorted.len() as f64) * q).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

fn sorted(mut values: Vec<f64>) -> Vec<f64> {
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    values
}

/// Decrements the in-flight gauge on drop.
pub struct InFlightGuard {
    gauge: Arc<AtomicI64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.gauge.fetch_sub(1, Ordering::Relaxed);
    }
}

struct Running {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

pub struct MetricsRecorder {
    sink: Arc<dyn MetricsSink>,
    interval: Duration,
    window: Arc<Mutex<Window>>,
    in_flight: Arc<AtomicI64>,
    running: Mutex<Option<Running>>,
}

impl MetricsRecorder {
    pub fn new(sink: Arc<dyn MetricsSink>, interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            sink,
            interval,
            window: Arc::new(Mutex::new(Window::default())),
            in_flight: Arc::new(AtomicI64::new(0)),
            running: Mutex::new(None),
        })
    }

    /// Spawn the periodic flush task. Calling it twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut running = match self.running.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if running.is_some() {
            return;
        }
        let (stop, mut stopped) = oneshot::channel();
        let this = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => this.flush().await,
                    _ = &mut stopped => break,
                }
            }
        });
        *running = Some(Running { stop, task });
    }

    /// Stop the flush task and flush whatever is left.
    pub async fn shutdown(&self) {
        let running = match self.running.lock() {
            Ok(mut g) => g.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(r) = running {
            let _ = r.stop.send(());
            if let Err(e) = r.task.await {
                tracing::warn!(error = %e, "metrics task ended abnormally");
            }
        }
        self.flush().await;
    }

    pub fn begin_request(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            gauge: self.in_flight.clone(),
        }
    }

    pub fn in_flight(&self) -> i64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn record(&self, sample: RequestSample) {
        let mut w = match self.window.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        w.requests += 1;
        if !sample.success {
            w.errors += 1;
        }
        w.latencies_ms.push(sample.latency.as_secs_f64() * 1000.0);
        if let Some(ft) = sample.first_token {
            w.first_token_ms.push(ft.as_secs_f64() * 1000.0);
        }
        let entry = w.per_channel.entry(sample.channel_id).or_default();
        if sample.success {
            entry.0 += 1;
        } else {
            entry.1 += 1;
        }
    }

    /// Drain the window into data points.
    pub fn snapshot(&self) -> Vec<DataPoint> {
        let w = {
            let mut guard = match self.window.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::take(&mut *guard)
        };
        let now = unix_now();
        let mut points = vec![
            DataPoint::new("relay.requests", w.requests as f64, now),
            DataPoint::new("relay.errors", w.errors as f64, now),
            DataPoint::new("relay.in_flight", self.in_flight() as f64, now),
        ];
        for (name, values) in [
            ("relay.latency_ms", w.latencies_ms),
            ("relay.first_token_ms", w.first_token_ms),
        ] {
            if values.is_empty() {
                continue;
            }
            let values = sorted(values);
            for (label, q) in [("p50", 0.5), ("p90", 0.9), ("p99", 0.99)] {
                points.push(DataPoint::new(name, percentile(&values, q), now).tag("quantile", label));
            }
        }
        let mut channels: Vec<_> = w.per_channel.into_iter().collect();
        channels.sort_by_key(|(id, _)| *id);
        for (id, (ok, failed)) in channels {
            points.push(DataPoint::new("relay.channel.success", ok as f64, now).tag("channel_id", id));
            points.push(DataPoint::new("relay.channel.failure", failed as f64, now).tag("channel_id", id));
        }
        points
    }

    async fn flush(&self) {
        let points = self.snapshot();
        if let Err(e) = self.sink.flush(points).await {
            tracing::warn!(error = %e, "metrics flush failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(channel_id: i64, ms: u64, success: bool) -> RequestSample {
        RequestSample {
            channel_id,
            model: "gpt-4o".into(),
            status: if success { 200 } else { 502 },
            success,
            stream: false,
            latency: Duration::from_millis(ms),
            first_token: None,
        }
    }

    fn find<'a>(points: &'a [DataPoint], name: &str, tag: Option<(&str, &str)>) -> &'a DataPoint {
        points
            .iter()
            .find(|p| {
                p.name == name
                    && tag
                        .map(|(k, v)| p.tags.get(k).map(|x| x == v).unwrap_or(false))
                        .unwrap_or(true)
            })
            .unwrap()
    }

    #[test]
    fn nearest_rank_percentiles() {
        let v: Vec<f64> = (1..=100).map(|x| x as f64).collect();
        assert_eq!(percentile(&v, 0.5), 50.0);
        assert_eq!(percentile(&v, 0.9), 90.0);
        assert_eq!(percentile(&v, 0.99), 99.0);
        assert_eq!(percentile(&[7.0], 0.99), 7.0);
        assert_eq!(percentile(&[], 0.5), 0.0);
    }

    #[test]
    fn snapshot_counts_and_drains() {
        let rec = MetricsRecorder::new(Arc::new(MemoryMetricsSink::default()), Duration::from_secs(60));
        for ms in [10, 20, 30, 40] {
            rec.record(sample(1, ms, true));
        }
        rec.record(sample(2, 500, false));
        let guard = rec.begin_request();

        let points = rec.snapshot();
        assert_eq!(find(&points, "relay.requests", None).value, 5.0);
        assert_eq!(find(&points, "relay.errors", None).value, 1.0);
        assert_eq!(find(&points, "relay.in_flight", None).value, 1.0);
        assert_eq!(find(&points, "relay.latency_ms", Some(("quantile", "p50"))).value, 30.0);
        assert_eq!(find(&points, "relay.latency_ms", Some(("quantile", "p99"))).value, 500.0);
        assert_eq!(find(&points, "relay.channel.success", Some(("channel_id", "1"))).value, 4.0);
        assert_eq!(find(&points, "relay.channel.failure", Some(("channel_id", "2"))).value, 1.0);

        drop(guard);
        assert_eq!(rec.in_flight(), 0);
        let again = rec.snapshot();
        assert_eq!(find(&again, "relay.requests", None).value, 0.0);
    }

    #[tokio::test]
    async fn shutdown_flushes_pending_samples() {
        let sink = Arc::new(MemoryMetricsSink::default());
        let rec = MetricsRecorder::new(sink.clone(), Duration::from_secs(3600));
        rec.start();
        rec.start();
        rec.record(sample(3, 12, true));
        rec.shutdown().await;
        let points = sink.points();
        assert_eq!(find(&points, "relay.requests", None).value, 1.0);
    }
}
