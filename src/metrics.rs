//! Monitoring metrics.
//!
//! This module contains all types expressing metrics collected during a
//! validation run. For each such run, there is an associated value of type
//! [`Metrics`] that collects all metrics gathered during the run.
//! Additional types contain the metrics related to specific processed
//! entities.

use std::{io, process};
use std::collections::BTreeMap;
use std::time::{Duration, SystemTimeError};
use chrono::{DateTime, Utc};
use rpki::uri;


//------------ Metrics -------------------------------------------------------

/// The metrics collected during a validation run.
#[derive(Debug)]
pub struct Metrics {
    /// Time when these metrics have been collected.
    pub time: DateTime<Utc>,

    /// Rsync transfer metrics.
    pub rsync: Vec<RsyncEventMetrics>,

    /// Per-trust-anchor metrics.
    pub tals: Vec<TalMetrics>,
}

impl Metrics {
    /// Creates a new metrics value with default metrics.
    pub fn new() -> Self {
        Metrics {
            time: Utc::now(),
            rsync: Vec::new(),
            tals: Vec::new(),
        }
    }

    /// Returns the time the metrics were created as a Unix timestamp.
    pub fn timestamp(&self) -> i64 {
        self.time.timestamp()
    }

    /// Returns whether all rsync transfers have completed successfully.
    pub fn rsync_complete(&self) -> bool {
        self.rsync.iter().all(RsyncEventMetrics::success)
    }

    /// Merges the metrics of another run part into this value.
    pub fn merge(&mut self, mut other: Metrics) {
        self.rsync.append(&mut other.rsync);
        self.tals.append(&mut other.tals);
    }

    /// Writes out all metrics in `name value` lines.
    ///
    /// The rsync transfers are grouped by operation, outcome, and host
    /// with a duration summary and the one, five, and fifteen minute
    /// transfer rates for each group.
    pub fn write(&self, target: &mut impl io::Write) -> Result<(), io::Error> {
        for tal in &self.tals {
            tal.write(target)?;
        }

        let mut groups: BTreeMap<String, EventGroup> = BTreeMap::new();
        for event in &self.rsync {
            let group = format!(
                "{}.{}[{}]",
                event.op.metric_name(),
                if event.success() { "success" } else { "failure" },
                event.uri.canonical_authority(),
            );
            let group = groups.entry(group).or_default();
            group.timestamps.push(event.when.timestamp());
            if let Ok(duration) = event.duration {
                group.durations.push(duration)
            }
        }
        for (group, events) in groups {
            writeln!(
                target, "{}.count {}", group, events.timestamps.len()
            )?;
            if let Some(summary) = DurationSummary::new(&events.durations) {
                summary.write(&group, target)?;
            }
            if let Some(rates) = RateMeter::new(
                &events.timestamps, self.timestamp()
            ) {
                rates.write(&group, target)?;
            }
        }
        Ok(())
    }
}

/// The transfer events of one op/outcome/host group.
#[derive(Default)]
struct EventGroup {
    durations: Vec<Duration>,
    timestamps: Vec<i64>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}


//------------ RsyncOp -------------------------------------------------------

/// The kind of rsync transfer that was run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RsyncOp {
    /// A recursive warm-up transfer.
    Prefetch,

    /// A transfer of a single file.
    FetchFile,
}

impl RsyncOp {
    /// Returns the name the operation goes by in the metrics.
    pub fn metric_name(self) -> &'static str {
        match self {
            RsyncOp::Prefetch => "rsync.prefetch",
            RsyncOp::FetchFile => "rsync.fetch.file",
        }
    }
}


//------------ RsyncEventMetrics ---------------------------------------------

/// Metrics collected while running a single rsync transfer.
#[derive(Debug)]
pub struct RsyncEventMetrics {
    /// The operation the transfer was run for.
    pub op: RsyncOp,

    /// The URI that was transferred.
    pub uri: uri::Rsync,

    /// When the transfer was started.
    pub when: DateTime<Utc>,

    /// The exit status of the transfer.
    pub status: Result<process::ExitStatus, io::Error>,

    /// The duration of the transfer.
    pub duration: Result<Duration, SystemTimeError>,
}

impl RsyncEventMetrics {
    /// Returns whether the transfer succeeded.
    pub fn success(&self) -> bool {
        matches!(self.status, Ok(ref status) if status.success())
    }
}


//------------ TalMetrics ----------------------------------------------------

/// Metrics for the validation run of a single trust anchor.
#[derive(Clone, Debug)]
pub struct TalMetrics {
    /// The URI the trust anchor certificate was fetched from.
    pub uri: uri::Rsync,

    /// How long extracting the trust anchor certificate took.
    pub extraction_elapsed: Option<Duration>,

    /// How long the validation walk took.
    pub validation_elapsed: Option<Duration>,

    /// The terminal state of the run: `"OK"` or `"failed: <msg>"`.
    pub validation_outcome: Option<String>,

    /// The number of publication points visited.
    pub repositories_total: u32,

    /// The number of publication points found inconsistent.
    pub repositories_inconsistent: u32,

    /// The number of objects in the published map.
    pub objects_total: u32,

    /// The number of objects with a positive verdict.
    pub objects_valid: u32,
}

impl TalMetrics {
    /// Creates new metrics for the trust anchor at the given URI.
    pub fn new(uri: uri::Rsync) -> Self {
        TalMetrics {
            uri,
            extraction_elapsed: None,
            validation_elapsed: None,
            validation_outcome: None,
            repositories_total: 0,
            repositories_inconsistent: 0,
            objects_total: 0,
            objects_valid: 0,
        }
    }

    /// Writes out the metrics in `name value` lines.
    pub fn write(
        &self, target: &mut impl io::Write
    ) -> Result<(), io::Error> {
        let prefix = format!("trust.anchor[{}]", self.uri);
        if let Some(elapsed) = self.extraction_elapsed {
            writeln!(
                target, "{}.extracted.elapsed.ms {}",
                prefix, elapsed.as_millis()
            )?;
        }
        if let Some(ref outcome) = self.validation_outcome {
            writeln!(target, "{}.validation {}", prefix, outcome)?;
        }
        if let Some(elapsed) = self.validation_elapsed {
            writeln!(
                target, "{}.validation.elapsed.ms {}",
                prefix, elapsed.as_millis()
            )?;
        }
        writeln!(
            target, "{}.repositories.total.count {}",
            prefix, self.repositories_total
        )?;
        writeln!(
            target, "{}.repositories.inconsistent.count {}",
            prefix, self.repositories_inconsistent
        )?;
        writeln!(
            target, "{}.repository.is.inconsistent {}",
            prefix, self.repositories_inconsistent > 0
        )?;
        Ok(())
    }
}


//------------ DurationSummary -----------------------------------------------

/// Statistics over a set of transfer durations.
#[derive(Clone, Copy, Debug)]
pub struct DurationSummary {
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub std_dev: f64,
    pub median: f64,
    pub p75: f64,
    pub p95: f64,
    pub p98: f64,
    pub p99: f64,
    pub p999: f64,
}

impl DurationSummary {
    /// Computes the summary of the given durations in milliseconds.
    ///
    /// Returns `None` if there are no durations at all.
    pub fn new(durations: &[Duration]) -> Option<Self> {
        if durations.is_empty() {
            return None
        }
        let mut millis: Vec<f64> = durations.iter().map(|duration| {
            duration.as_secs_f64() * 1000.
        }).collect();
        millis.sort_by(|left, right| {
            left.partial_cmp(right).expect("NaN duration")
        });

        let count = millis.len() as f64;
        let mean = millis.iter().sum::<f64>() / count;
        let variance = millis.iter().map(|value| {
            let diff = value - mean;
            diff * diff
        }).sum::<f64>() / count;

        Some(DurationSummary {
            mean,
            min: millis[0],
            max: millis[millis.len() - 1],
            std_dev: variance.sqrt(),
            median: Self::quantile(&millis, 0.5),
            p75: Self::quantile(&millis, 0.75),
            p95: Self::quantile(&millis, 0.95),
            p98: Self::quantile(&millis, 0.98),
            p99: Self::quantile(&millis, 0.99),
            p999: Self::quantile(&millis, 0.999),
        })
    }

    /// Returns the given quantile of the sorted values.
    fn quantile(sorted: &[f64], q: f64) -> f64 {
        let pos = (q * sorted.len() as f64).ceil() as usize;
        sorted[pos.saturating_sub(1).min(sorted.len() - 1)]
    }

    /// Writes the summary as `prefix.stat value` lines.
    pub fn write(
        &self, prefix: &str, target: &mut impl io::Write
    ) -> Result<(), io::Error> {
        writeln!(target, "{}.mean {:.3}", prefix, self.mean)?;
        writeln!(target, "{}.min {:.3}", prefix, self.min)?;
        writeln!(target, "{}.max {:.3}", prefix, self.max)?;
        writeln!(target, "{}.stdDev {:.3}", prefix, self.std_dev)?;
        writeln!(target, "{}.median {:.3}", prefix, self.median)?;
        writeln!(target, "{}.75p {:.3}", prefix, self.p75)?;
        writeln!(target, "{}.95p {:.3}", prefix, self.p95)?;
        writeln!(target, "{}.98p {:.3}", prefix, self.p98)?;
        writeln!(target, "{}.99p {:.3}", prefix, self.p99)?;
        writeln!(target, "{}.999p {:.3}", prefix, self.p999)?;
        Ok(())
    }
}


//------------ RateMeter -----------------------------------------------------

/// Exponentially weighted transfer rates over one, five, and fifteen
/// minutes, in events per second.
///
/// This is the classic load-average style meter: events are counted into
/// five-second ticks and each window keeps an exponentially weighted
/// moving average of the per-second rate. A window's average starts out
/// at the rate of the first tick.
#[derive(Clone, Copy, Debug)]
pub struct RateMeter {
    pub rate_1m: f64,
    pub rate_5m: f64,
    pub rate_15m: f64,
}

impl RateMeter {
    /// The length of a tick in seconds.
    const TICK_SECS: i64 = 5;

    /// Computes the rates from event timestamps.
    ///
    /// The `timestamps` are Unix timestamps in seconds in any order;
    /// `now` is when the metrics are taken and determines how far the
    /// averages have decayed since the events happened. Returns `None`
    /// if there are no events at all.
    pub fn new(timestamps: &[i64], now: i64) -> Option<Self> {
        let mut sorted = timestamps.to_vec();
        sorted.sort_unstable();
        let first = *sorted.first()?;
        let end = now.max(first + Self::TICK_SECS);

        let mut windows = [
            Ewma::new(60.), Ewma::new(300.), Ewma::new(900.),
        ];
        let mut events = sorted.into_iter().peekable();
        let mut tick_start = first;
        while tick_start < end {
            let tick_end = tick_start + Self::TICK_SECS;
            let mut count = 0u64;
            while events.peek().map_or(false, |&when| when < tick_end) {
                events.next();
                count += 1;
            }
            let instant = count as f64 / Self::TICK_SECS as f64;
            for window in &mut windows {
                window.update(instant)
            }
            tick_start = tick_end;
        }

        Some(RateMeter {
            rate_1m: windows[0].rate(),
            rate_5m: windows[1].rate(),
            rate_15m: windows[2].rate(),
        })
    }

    /// Writes the rates as `prefix.rate.window value` lines.
    pub fn write(
        &self, prefix: &str, target: &mut impl io::Write
    ) -> Result<(), io::Error> {
        writeln!(target, "{}.rate.1m {:.3}", prefix, self.rate_1m)?;
        writeln!(target, "{}.rate.5m {:.3}", prefix, self.rate_5m)?;
        writeln!(target, "{}.rate.15m {:.3}", prefix, self.rate_15m)?;
        Ok(())
    }
}


//------------ Ewma ----------------------------------------------------------

/// One exponentially weighted moving average of a per-second rate.
struct Ewma {
    /// The smoothing factor derived from the window length.
    alpha: f64,

    /// The current average, if a first tick has been seen.
    rate: Option<f64>,
}

impl Ewma {
    fn new(window_secs: f64) -> Self {
        Ewma {
            alpha: 1. - (-(RateMeter::TICK_SECS as f64) / window_secs).exp(),
            rate: None,
        }
    }

    fn update(&mut self, instant: f64) {
        match self.rate {
            Some(ref mut rate) => *rate += self.alpha * (instant - *rate),
            None => self.rate = Some(instant),
        }
    }

    fn rate(&self) -> f64 {
        self.rate.unwrap_or(0.)
    }
}


//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn duration_summary() {
        let durations: Vec<Duration> = (1..=100).map(|value| {
            Duration::from_millis(value)
        }).collect();
        let summary = DurationSummary::new(&durations).unwrap();

        assert_eq!(summary.min, 1.);
        assert_eq!(summary.max, 100.);
        assert_eq!(summary.mean, 50.5);
        assert_eq!(summary.median, 50.);
        assert_eq!(summary.p75, 75.);
        assert_eq!(summary.p95, 95.);
        assert_eq!(summary.p999, 100.);

        assert!(DurationSummary::new(&[]).is_none());
    }

    #[test]
    fn single_duration_summary() {
        let summary = DurationSummary::new(
            &[Duration::from_millis(42)]
        ).unwrap();
        assert_eq!(summary.min, 42.);
        assert_eq!(summary.max, 42.);
        assert_eq!(summary.median, 42.);
        assert_eq!(summary.std_dev, 0.);
    }

    #[test]
    fn steady_rate_converges() {
        // One event per second for fifteen minutes: every tick sees a
        // rate of exactly one, so all three windows sit at one.
        let timestamps: Vec<i64> = (0..900).collect();
        let rates = RateMeter::new(&timestamps, 900).unwrap();
        assert!((rates.rate_1m - 1.).abs() < 1e-9);
        assert!((rates.rate_5m - 1.).abs() < 1e-9);
        assert!((rates.rate_15m - 1.).abs() < 1e-9);

        assert!(RateMeter::new(&[], 900).is_none());
    }

    #[test]
    fn old_burst_decays() {
        // A burst of transfers an hour ago has all but vanished from the
        // one-minute rate while the fifteen-minute rate still remembers.
        let timestamps = vec![0i64; 100];
        let rates = RateMeter::new(&timestamps, 3600).unwrap();
        assert!(rates.rate_1m < 1e-6);
        assert!(rates.rate_15m > rates.rate_5m);
        assert!(rates.rate_5m > rates.rate_1m);
        assert!(rates.rate_15m < 1.);
    }

    #[test]
    fn unsorted_timestamps_are_accepted() {
        let rates = RateMeter::new(&[30, 10, 20, 0], 60).unwrap();
        let again = RateMeter::new(&[0, 10, 20, 30], 60).unwrap();
        assert_eq!(rates.rate_1m, again.rate_1m);
        assert_eq!(rates.rate_5m, again.rate_5m);
        assert_eq!(rates.rate_15m, again.rate_15m);
    }
}
