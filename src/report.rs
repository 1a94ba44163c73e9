use std::{fmt, time::Duration};

/// Summary of a set of latency samples, in microseconds.
#[derive(Debug, Clone, PartialEq)]
pub struct LatencyStats {
    pub count: usize,
    pub mean: f64,
    pub median: f64,
    pub p95: f64,
    pub min: f64,
    pub max: f64,
}

impl LatencyStats {
    /// Sorts `samples` in place and reduces them. `None` if there are none.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn from_samples(samples: &mut [f64]) -> Option<Self> {
        let n = samples.len();
        if n == 0 {
            return None;
        }
        samples.sort_by(f64::total_cmp);

        let mean = samples.iter().sum::<f64>() / n as f64;
        let median = if n % 2 == 1 {
            samples[n / 2]
        } else {
            (samples[n / 2 - 1] + samples[n / 2]) / 2.0
        };

        Some(Self {
            count: n,
            mean,
            median,
            p95: samples[percentile_index(n, 0.95)],
            min: samples[0],
            max: samples[n - 1],
        })
    }
}

/// `floor(p * n)`, kept inside the slice.
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn percentile_index(n: usize, p: f64) -> usize { ((n as f64 * p).floor() as usize).min(n.saturating_sub(1)) }

/// Raw counters gathered during a load run.
#[derive(Debug, Clone, Default)]
pub struct Totals {
    pub events: u64,
    pub batches: u64,
    pub snapshots: u64,
    pub schema_violations: u64,
    pub sessions_connected: usize,
    pub sessions_failed: usize,
    pub sessions_errored: usize,
}

#[derive(Debug, Clone)]
pub struct LoadReport {
    pub elapsed: Duration,
    pub totals: Totals,
    pub events_per_sec: f64,
    pub latency: Option<LatencyStats>,
    /// Sessions were still running at the safety ceiling and were aborted.
    pub ceiling_hit: bool,
}

impl LoadReport {
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn new(totals: Totals, mut samples: Vec<f64>, elapsed: Duration, ceiling_hit: bool) -> Self {
        let secs = elapsed.as_secs_f64();
        let events_per_sec = if secs > 0.0 {
            totals.events as f64 / secs
        } else {
            0.0
        };
        Self {
            elapsed,
            events_per_sec,
            latency: LatencyStats::from_samples(&mut samples),
            totals,
            ceiling_hit,
        }
    }
}

impl fmt::Display for LoadReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let t = &self.totals;
        writeln!(f, "--- Load Test Report ---")?;
        writeln!(f, "Total Duration: {:.2}s", self.elapsed.as_secs_f64())?;
        writeln!(f, "Total Events:   {}", t.events)?;
        writeln!(f, "Events/Sec:     {:.2}", self.events_per_sec)?;
        writeln!(
            f,
            "Sessions:       {} connected, {} failed to connect, {} errored",
            t.sessions_connected, t.sessions_failed, t.sessions_errored
        )?;
        writeln!(f, "Messages:       {} snapshots, {} batches", t.snapshots, t.batches)?;
        if t.schema_violations > 0 {
            writeln!(f, "Malformed events skipped: {}", t.schema_violations)?;
        }

        match &self.latency {
            Some(l) => {
                writeln!(f, "Latency (us) over {} samples:", l.count)?;
                writeln!(f, "  Mean: {:.2}", l.mean)?;
                writeln!(f, "  P50:  {:.2}", l.median)?;
                writeln!(f, "  P95:  {:.2}", l.p95)?;
                writeln!(f, "  Min:  {:.2}", l.min)?;
                write!(f, "  Max:  {:.2}", l.max)?;
            }
            None => write!(f, "No latency data received.")?,
        }

        if self.ceiling_hit {
            write!(f, "\nWARNING: sessions did not stop in time and were aborted")?;
        }
        Ok(())
    }
}
