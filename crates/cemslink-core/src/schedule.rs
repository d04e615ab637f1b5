//! Wall-clock aligned dispatch scheduling.
//!
//! Boundaries are computed in the configured timezone's wall clock and
//! converted back to UTC instants. Waiting recomputes the remaining time from
//! `Utc::now()` on every slice, so clock steps and DST changes never
//! accumulate into drift. Backoff and poll intervals use tokio's monotonic
//! timer instead (see [`sleep_or_shutdown`]).

use std::str::FromStr;
use std::time::Duration;

use chrono::offset::LocalResult;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Longest single sleep inside [`wait_until`] before the wall clock is re-read.
pub const MAX_WAIT_SLICE: Duration = Duration::from_secs(30);

/// Dispatch cadence, fixed for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Cadence {
    /// 1-minute windows (bench testing).
    Fast,
    /// 15-minute windows (production).
    #[default]
    Normal,
}

impl Cadence {
    pub fn minutes(self) -> u32 {
        match self {
            Self::Fast => 1,
            Self::Normal => 15,
        }
    }
}

impl std::fmt::Display for Cadence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fast => write!(f, "fast (1 min)"),
            Self::Normal => write!(f, "normal (15 min)"),
        }
    }
}

impl FromStr for Cadence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fast" | "1" => Ok(Self::Fast),
            "normal" | "15" => Ok(Self::Normal),
            other => Err(format!("unknown cadence '{other}' (expected fast or normal)")),
        }
    }
}

// ---------------------------------------------------------------------------
// Boundary arithmetic
// ---------------------------------------------------------------------------

fn local_minutes(naive: NaiveDateTime) -> i64 {
    naive.and_utc().timestamp().div_euclid(60)
}

fn is_aligned_naive(naive: NaiveDateTime, granularity: i64) -> bool {
    let secs = naive.and_utc().timestamp();
    secs.rem_euclid(60) == 0
        && naive.and_utc().timestamp_subsec_nanos() == 0
        && local_minutes(naive).rem_euclid(granularity) == 0
}

fn naive_from_minutes(minutes: i64) -> Option<NaiveDateTime> {
    DateTime::from_timestamp(minutes * 60, 0).map(|dt| dt.naive_utc())
}

/// True if `instant` falls exactly on a `granularity_minutes` boundary of
/// the wall clock in `tz`.
pub fn is_aligned(instant: DateTime<Utc>, granularity_minutes: u32, tz: &Tz) -> bool {
    let g = i64::from(granularity_minutes.max(1));
    is_aligned_naive(instant.with_timezone(tz).naive_local(), g)
}

/// Smallest instant `>= now` that is an exact multiple of
/// `granularity_minutes` on the wall clock of `tz`.
///
/// Local times skipped by a DST gap are not boundaries; the search moves on
/// to the next wall-clock multiple. For repeated local times the earliest
/// instant not before `now` wins.
pub fn next_boundary(now: DateTime<Utc>, granularity_minutes: u32, tz: &Tz) -> DateTime<Utc> {
    let g = i64::from(granularity_minutes.max(1));
    let local = now.with_timezone(tz).naive_local();

    let floor = local_minutes(local) - local_minutes(local).rem_euclid(g);
    let mut candidate = if is_aligned_naive(local, g) {
        floor
    } else {
        floor + g
    };

    // A DST shift is at most a few hours; bound the search generously.
    for _ in 0..(48 * 60 / g + 2) {
        if let Some(naive) = naive_from_minutes(candidate) {
            let resolved = match tz.from_local_datetime(&naive) {
                LocalResult::Single(dt) => vec![dt],
                LocalResult::Ambiguous(a, b) => vec![a, b],
                LocalResult::None => Vec::new(),
            };
            if let Some(dt) = resolved
                .into_iter()
                .map(|dt| dt.with_timezone(&Utc))
                .find(|dt| *dt >= now)
            {
                return dt;
            }
        }
        candidate += g;
    }

    // Unreachable for real zones; fall back to UTC alignment.
    let ms = g * 60_000;
    let ts = now.timestamp_millis();
    let up = ts + (ms - ts.rem_euclid(ms)) % ms;
    DateTime::from_timestamp_millis(up).unwrap_or(now)
}

/// Largest boundary `<= instant`.
pub fn aligned_floor(instant: DateTime<Utc>, granularity_minutes: u32, tz: &Tz) -> DateTime<Utc> {
    let g = i64::from(granularity_minutes.max(1));
    let local = instant.with_timezone(tz).naive_local();
    let mut candidate = local_minutes(local) - local_minutes(local).rem_euclid(g);

    for _ in 0..(48 * 60 / g + 2) {
        if let Some(naive) = naive_from_minutes(candidate) {
            let resolved = match tz.from_local_datetime(&naive) {
                LocalResult::Single(dt) => vec![dt],
                LocalResult::Ambiguous(a, b) => vec![b, a],
                LocalResult::None => Vec::new(),
            };
            if let Some(dt) = resolved
                .into_iter()
                .map(|dt| dt.with_timezone(&Utc))
                .find(|dt| *dt <= instant)
            {
                return dt;
            }
        }
        candidate -= g;
    }
    instant
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Produces the dispatch instants for one process.
///
/// Successive results are strictly increasing even if the wall clock steps
/// backwards between calls.
#[derive(Debug, Clone)]
pub struct AlignmentScheduler {
    cadence: Cadence,
    tz: Tz,
    last: Option<DateTime<Utc>>,
}

impl AlignmentScheduler {
    pub fn new(cadence: Cadence, tz: Tz) -> Self {
        Self {
            cadence,
            tz,
            last: None,
        }
    }

    pub fn cadence(&self) -> Cadence {
        self.cadence
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Next boundary at or after `now` and strictly after the previous one.
    pub fn next_dispatch(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
        let g = self.cadence.minutes();
        let mut next = next_boundary(now, g, &self.tz);
        if let Some(last) = self.last {
            if next <= last {
                next = next_boundary(last + chrono::Duration::milliseconds(1), g, &self.tz);
            }
        }
        self.last = Some(next);
        next
    }
}

// ---------------------------------------------------------------------------
// Waiting
// ---------------------------------------------------------------------------

/// How a wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Reached,
    Cancelled,
}

/// Sleep on the monotonic clock for `duration`, waking early on shutdown.
///
/// Returns `true` if shutdown was signalled. A dropped sender counts as
/// "never shutting down".
pub async fn sleep_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    let sleep = tokio::time::sleep(duration);
    tokio::pin!(sleep);
    let stopped = tokio::select! {
        _ = &mut sleep => return false,
        res = shutdown.wait_for(|stop| *stop) => res.is_ok(),
    };
    if !stopped {
        sleep.await;
    }
    stopped
}

/// Wait until the wall clock reaches `target`.
pub async fn wait_until(target: DateTime<Utc>, shutdown: &mut watch::Receiver<bool>) -> WaitOutcome {
    loop {
        let now = Utc::now();
        if now >= target {
            return WaitOutcome::Reached;
        }
        let remaining = (target - now).to_std().unwrap_or(Duration::ZERO);
        if sleep_or_shutdown(remaining.min(MAX_WAIT_SLICE), shutdown).await {
            return WaitOutcome::Cancelled;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_fast_cadence_waits_for_next_minute() {
        let now = utc("2026-03-02T10:07:32Z");
        assert_eq!(next_boundary(now, 1, &Tz::UTC), utc("2026-03-02T10:08:00Z"));
    }

    #[test]
    fn test_exact_boundary_is_returned_unchanged() {
        let now = utc("2026-03-02T10:15:00Z");
        assert_eq!(next_boundary(now, 15, &Tz::UTC), now);
        let nudged = now + chrono::Duration::milliseconds(1);
        assert_eq!(next_boundary(nudged, 15, &Tz::UTC), utc("2026-03-02T10:30:00Z"));
    }

    #[test]
    fn test_quarter_hours_in_kolkata() {
        // 10:07:32 IST == 04:37:32 UTC
        let now = utc("2026-03-02T04:37:32Z");
        let next = next_boundary(now, 15, &chrono_tz::Asia::Kolkata);
        let local = next.with_timezone(&chrono_tz::Asia::Kolkata);
        assert_eq!((local.hour(), local.minute(), local.second()), (10, 15, 0));
    }

    #[test]
    fn test_boundaries_are_epoch_multiples_and_not_before_now() {
        let start = utc("2026-01-01T00:00:00Z");
        for tz in [Tz::UTC, chrono_tz::Asia::Kolkata] {
            for g in [1u32, 15] {
                for step in 0..500i64 {
                    let now = start + chrono::Duration::milliseconds(step * 7_919_333);
                    let t = next_boundary(now, g, &tz);
                    assert!(t >= now, "{t} < {now}");
                    assert_eq!(t.timestamp_millis() % (i64::from(g) * 60_000), 0);
                    assert!(t - now < chrono::Duration::minutes(i64::from(g)));
                }
            }
        }
    }

    #[test]
    fn test_dst_gap_skips_missing_local_times() {
        // 2026-03-08 02:00 local does not exist in New York.
        let tz = chrono_tz::America::New_York;
        let now = utc("2026-03-08T06:50:00Z"); // 01:50 EST
        let t = next_boundary(now, 15, &tz);
        assert_eq!(t, utc("2026-03-08T07:00:00Z")); // 03:00 EDT
        assert!(is_aligned(t, 15, &tz));
    }

    #[test]
    fn test_aligned_floor() {
        let t = utc("2026-03-02T10:07:32Z");
        assert_eq!(aligned_floor(t, 15, &Tz::UTC), utc("2026-03-02T10:00:00Z"));
        let b = utc("2026-03-02T10:15:00Z");
        assert_eq!(aligned_floor(b, 15, &Tz::UTC), b);
    }

    #[test]
    fn test_scheduler_is_strictly_increasing() {
        let mut sched = AlignmentScheduler::new(Cadence::Fast, Tz::UTC);
        let first = sched.next_dispatch(utc("2026-03-02T10:08:00Z"));
        assert_eq!(first, utc("2026-03-02T10:08:00Z"));
        // Same instant again, then a clock step backwards.
        let second = sched.next_dispatch(utc("2026-03-02T10:08:00Z"));
        assert_eq!(second, utc("2026-03-02T10:09:00Z"));
        let third = sched.next_dispatch(utc("2026-03-02T10:05:10Z"));
        assert_eq!(third, utc("2026-03-02T10:10:00Z"));
    }

    #[test]
    fn test_cadence_parse_and_display() {
        assert_eq!("fast".parse::<Cadence>().unwrap(), Cadence::Fast);
        assert_eq!("Normal".parse::<Cadence>().unwrap(), Cadence::Normal);
        assert!("hourly".parse::<Cadence>().is_err());
        assert_eq!(Cadence::Normal.minutes(), 15);
        assert_eq!(Cadence::Fast.to_string(), "fast (1 min)");
    }

    #[tokio::test]
    async fn test_wait_until_past_target_returns_immediately() {
        let (_tx, mut rx) = watch::channel(false);
        let outcome = wait_until(Utc::now() - chrono::Duration::seconds(1), &mut rx).await;
        assert_eq!(outcome, WaitOutcome::Reached);
    }

    #[tokio::test]
    async fn test_wait_until_is_cancelled_by_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        let target = Utc::now() + chrono::Duration::hours(1);
        let waiter = tokio::spawn(async move { wait_until(target, &mut rx).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, WaitOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_sleep_survives_dropped_sender() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        let started = std::time::Instant::now();
        assert!(!sleep_or_shutdown(Duration::from_millis(30), &mut rx).await);
        assert!(started.elapsed() >= Duration::from_millis(30));
    }
}
