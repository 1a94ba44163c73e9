//! Concurrent sessions against one server, aggregated into a [`LoadReport`].

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use serde_json::Value;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    config::LoadConfig,
    report::{LoadReport, Totals},
    schema::{self, Payload},
    session::Session,
};

/// Counters shared by every session of a run.
///
/// The latency vector sits behind a plain mutex; it is only ever held for
/// a push and never across an await.
#[derive(Debug, Default)]
pub struct LoadStats {
    events: AtomicU64,
    batches: AtomicU64,
    snapshots: AtomicU64,
    schema_violations: AtomicU64,
    connected: AtomicUsize,
    failed: AtomicUsize,
    errored: AtomicUsize,
    latencies: Mutex<Vec<f64>>,
}

impl LoadStats {
    pub fn record_snapshot(&self) { self.snapshots.fetch_add(1, Ordering::Relaxed); }

    /// Counts the well formed events of a batch and records a latency sample
    /// for each one carrying `timestamp_us`. `received_us` is the wall clock
    /// time the batch arrived.
    pub fn record_batch(&self, events: &[Value], received_us: f64) {
        self.batches.fetch_add(1, Ordering::Relaxed);

        let mut samples = Vec::new();
        let mut counted = 0;
        for event in events {
            if let Some(field) = schema::missing_field(event) {
                tracing::warn!(field, %event, "skipping malformed event");
                self.schema_violations.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            counted += 1;
            if let Some(sent) = schema::timestamp_us(event) {
                samples.push(received_us - sent);
            }
        }
        self.events.fetch_add(counted, Ordering::Relaxed);

        if !samples.is_empty() {
            match self.latencies.lock() {
                Ok(mut latencies) => latencies.extend(samples),
                Err(poisoned) => poisoned.into_inner().extend(samples),
            }
        }
    }

    #[must_use]
    pub fn totals(&self) -> Totals {
        Totals {
            events: self.events.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            snapshots: self.snapshots.load(Ordering::Relaxed),
            schema_violations: self.schema_violations.load(Ordering::Relaxed),
            sessions_connected: self.connected.load(Ordering::Relaxed),
            sessions_failed: self.failed.load(Ordering::Relaxed),
            sessions_errored: self.errored.load(Ordering::Relaxed),
        }
    }

    /// Takes the recorded latency samples, leaving none behind.
    #[must_use]
    pub fn take_samples(&self) -> Vec<f64> {
        match self.latencies.lock() {
            Ok(mut latencies) => std::mem::take(&mut *latencies),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }
}

/// Microseconds since the Unix epoch.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn now_us() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0.0, |d| d.as_micros() as f64)
}

/// Runs `config.clients` sessions for `config.duration`, then signals them
/// to stop. Sessions still running `stop_grace` later are aborted and the
/// report is flagged.
pub async fn run(config: &LoadConfig) -> LoadReport {
    tracing::info!(
        clients = config.clients,
        url = %config.target,
        duration = ?config.duration,
        "starting load test"
    );

    let stats = Arc::new(LoadStats::default());
    let stop = CancellationToken::new();
    let start = Instant::now();

    let mut sessions = JoinSet::new();
    for id in 0..config.clients {
        let span = tracing::info_span!("session", id, addr = %config.target);
        sessions.spawn(
            client_session(id, config.clone(), Arc::clone(&stats), stop.clone()).instrument(span),
        );
    }

    let timer = tokio::spawn({
        let stop = stop.clone();
        let duration = config.duration;
        async move {
            tokio::time::sleep(duration).await;
            tracing::info!("Stopping load test...");
            stop.cancel();
        }
    });

    let ceiling = config.duration + config.stop_grace;
    let ceiling_hit = tokio::time::timeout(ceiling, drain(&mut sessions))
        .await
        .is_err();
    if ceiling_hit {
        tracing::error!(
            ?ceiling,
            remaining = sessions.len(),
            "sessions did not stop in time, aborting"
        );
        sessions.abort_all();
        while sessions.join_next().await.is_some() {}
    }
    stop.cancel();
    timer.abort();

    let elapsed = start.elapsed();
    let report = LoadReport::new(stats.totals(), stats.take_samples(), elapsed, ceiling_hit);
    tracing::info!(events = report.totals.events, ?elapsed, "load test finished");
    report
}

async fn drain(sessions: &mut JoinSet<()>) {
    while let Some(res) = sessions.join_next().await {
        if let Err(e) = res {
            tracing::error!(error = %e, "session task failed");
        }
    }
}

async fn client_session(id: usize, config: LoadConfig, stats: Arc<LoadStats>, stop: CancellationToken) {
    let mut session =
        match Session::connect_with_retry(&config.target, config.session.clone(), config.retry).await {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(error = %e, kind = ?e.kind(), "client {id} failed to connect");
                stats.failed.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
    stats.connected.fetch_add(1, Ordering::Relaxed);
    tracing::info!("client {id} connected");

    while !stop.is_cancelled() {
        let received = tokio::time::timeout(config.poll_interval, session.receive_next_payload()).await;
        match received {
            Err(_) => {}
            Ok(Ok(Some(Payload::EventBatch(events)))) => stats.record_batch(&events, now_us()),
            Ok(Ok(Some(Payload::Snapshot(_)))) => {
                tracing::debug!("received snapshot");
                stats.record_snapshot();
            }
            Ok(Ok(Some(Payload::Other(_)))) => tracing::debug!("ignoring unknown payload"),
            Ok(Ok(None)) => {
                tracing::info!("client {id} closed by server");
                break;
            }
            Ok(Err(e)) if !e.is_fatal_to_session() => {
                tracing::warn!(error = %e, "client {id} skipping message");
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, kind = ?e.kind(), "client {id} failed");
                stats.errored.fetch_add(1, Ordering::Relaxed);
                break;
            }
        }
    }

    session.close().await;
}
