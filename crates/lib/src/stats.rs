//! Cache statistics.
//!
//! A [`CacheStatsTracker`] counts hits, misses, mismatches, evictions,
//! invalidations, backing-store errors and loads for one build session, together with the time
//! spent in each. Only raw event counts and raw durations are stored; totals
//! such as the request count and every average are derived from them on
//! read, so they cannot drift apart.
//!
//! Timing of a single lookup is captured through a [`CacheRequest`]:
//!
//! ```ignore
//! let mut request = tracker.start_request();
//! match lookup() {
//!   Some(_) => request.record_hit(),
//!   None => {
//!     request.record_miss();
//!     match build() {
//!       Ok(_) => request.record_load_success(),
//!       Err(_) => request.record_load_fail(),
//!     }
//!   }
//! }
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::warn;

/// Process-wide counters for one build invocation.
#[derive(Debug, Default)]
pub struct CacheStatsTracker {
  hits: AtomicU64,
  misses: AtomicU64,
  miss_matches: AtomicU64,
  evictions: AtomicU64,
  invalidations: AtomicU64,
  errors: AtomicU64,
  load_successes: AtomicU64,
  load_failures: AtomicU64,
  retrieval_nanos: AtomicU64,
  miss_nanos: AtomicU64,
  load_nanos: AtomicU64,
}

/// Point-in-time view of a [`CacheStatsTracker`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
  pub hit_count: u64,
  pub miss_count: u64,
  pub miss_match_count: u64,
  pub eviction_count: u64,
  pub invalidation_count: u64,
  /// Failed backing-store reads. Each one also ends as a miss or a later hit.
  pub error_count: u64,
  pub load_success_count: u64,
  pub load_failure_count: u64,
  pub request_count: u64,
  #[serde(with = "duration_ms")]
  pub total_retrieval_time: Duration,
  #[serde(with = "duration_ms")]
  pub total_miss_time: Duration,
  #[serde(with = "duration_ms")]
  pub total_load_time: Duration,
  #[serde(with = "duration_ms")]
  pub average_retrieval_time: Duration,
  #[serde(with = "duration_ms")]
  pub average_miss_time: Duration,
  #[serde(with = "duration_ms")]
  pub average_load_time: Duration,
}

impl CacheStats {
  /// Fraction of requests that were hits, in `0.0..=1.0`.
  pub fn hit_rate(&self) -> f64 {
    if self.request_count == 0 {
      0.0
    } else {
      self.hit_count as f64 / self.request_count as f64
    }
  }
}

mod duration_ms {
  use std::time::Duration;

  use serde::Serializer;

  pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
  }
}

fn nanos(d: Duration) -> u64 {
  u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

fn average(total_nanos: u64, count: u64) -> Duration {
  if count == 0 {
    Duration::ZERO
  } else {
    Duration::from_nanos(total_nanos / count)
  }
}

impl CacheStatsTracker {
  pub fn new() -> Self {
    Self::default()
  }

  /// Begin timing one cache lookup.
  pub fn start_request(&self) -> CacheRequest<'_> {
    CacheRequest {
      tracker: self,
      started: Instant::now(),
      missed_at: None,
      state: RequestState::Started,
    }
  }

  pub fn record_eviction(&self) {
    self.record_evictions(1);
  }

  pub fn record_evictions(&self, count: u64) {
    self.evictions.fetch_add(count, Ordering::Relaxed);
  }

  pub fn record_invalidation(&self) {
    self.record_invalidations(1);
  }

  pub fn record_invalidations(&self, count: u64) {
    self.invalidations.fetch_add(count, Ordering::Relaxed);
  }

  /// A cache tier failed to answer a lookup.
  pub fn record_error(&self) {
    self.errors.fetch_add(1, Ordering::Relaxed);
  }

  pub fn total_hit_count(&self) -> u64 {
    self.hits.load(Ordering::Relaxed)
  }

  pub fn total_miss_count(&self) -> u64 {
    self.misses.load(Ordering::Relaxed)
  }

  pub fn total_miss_match_count(&self) -> u64 {
    self.miss_matches.load(Ordering::Relaxed)
  }

  pub fn total_eviction_count(&self) -> u64 {
    self.evictions.load(Ordering::Relaxed)
  }

  pub fn total_invalidation_count(&self) -> u64 {
    self.invalidations.load(Ordering::Relaxed)
  }

  pub fn total_error_count(&self) -> u64 {
    self.errors.load(Ordering::Relaxed)
  }

  pub fn total_load_success_count(&self) -> u64 {
    self.load_successes.load(Ordering::Relaxed)
  }

  pub fn total_load_failure_count(&self) -> u64 {
    self.load_failures.load(Ordering::Relaxed)
  }

  pub fn total_request_count(&self) -> u64 {
    self.total_hit_count() + self.total_miss_count() + self.total_miss_match_count()
  }

  pub fn total_retrieval_time(&self) -> Duration {
    Duration::from_nanos(self.retrieval_nanos.load(Ordering::Relaxed))
  }

  pub fn total_miss_time(&self) -> Duration {
    Duration::from_nanos(self.miss_nanos.load(Ordering::Relaxed))
  }

  pub fn total_load_time(&self) -> Duration {
    Duration::from_nanos(self.load_nanos.load(Ordering::Relaxed))
  }

  pub fn average_retrieval_time(&self) -> Duration {
    average(self.retrieval_nanos.load(Ordering::Relaxed), self.total_hit_count())
  }

  pub fn average_miss_time(&self) -> Duration {
    average(
      self.miss_nanos.load(Ordering::Relaxed),
      self.total_miss_count() + self.total_miss_match_count(),
    )
  }

  pub fn average_load_time(&self) -> Duration {
    average(
      self.load_nanos.load(Ordering::Relaxed),
      self.total_load_success_count() + self.total_load_failure_count(),
    )
  }

  pub fn snapshot(&self) -> CacheStats {
    CacheStats {
      hit_count: self.total_hit_count(),
      miss_count: self.total_miss_count(),
      miss_match_count: self.total_miss_match_count(),
      eviction_count: self.total_eviction_count(),
      invalidation_count: self.total_invalidation_count(),
      error_count: self.total_error_count(),
      load_success_count: self.total_load_success_count(),
      load_failure_count: self.total_load_failure_count(),
      request_count: self.total_request_count(),
      total_retrieval_time: self.total_retrieval_time(),
      total_miss_time: self.total_miss_time(),
      total_load_time: self.total_load_time(),
      average_retrieval_time: self.average_retrieval_time(),
      average_miss_time: self.average_miss_time(),
      average_load_time: self.average_load_time(),
    }
  }

  /// Zero every counter. Called when a new build invocation starts.
  pub fn reset(&self) {
    for counter in [
      &self.hits,
      &self.misses,
      &self.miss_matches,
      &self.evictions,
      &self.invalidations,
      &self.errors,
      &self.load_successes,
      &self.load_failures,
      &self.retrieval_nanos,
      &self.miss_nanos,
      &self.load_nanos,
    ] {
      counter.store(0, Ordering::Relaxed);
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestState {
  Started,
  Missed,
  Finished,
}

/// Records the outcome and timing of a single cache request.
#[derive(Debug)]
pub struct CacheRequest<'a> {
  tracker: &'a CacheStatsTracker,
  started: Instant,
  missed_at: Option<Instant>,
  state: RequestState,
}

impl CacheRequest<'_> {
  /// The lookup found a value. Records the retrieval time.
  pub fn record_hit(&mut self) {
    if !self.transition(RequestState::Started, RequestState::Finished, "hit") {
      return;
    }
    self.tracker.hits.fetch_add(1, Ordering::Relaxed);
    self
      .tracker
      .retrieval_nanos
      .fetch_add(nanos(self.started.elapsed()), Ordering::Relaxed);
  }

  /// The lookup found nothing. Starts the load timer.
  pub fn record_miss(&mut self) {
    if self.begin_miss("miss") {
      self.tracker.misses.fetch_add(1, Ordering::Relaxed);
    }
  }

  /// The lookup found a stale value. Starts the load timer.
  pub fn record_miss_match(&mut self) {
    if self.begin_miss("miss-match") {
      self.tracker.miss_matches.fetch_add(1, Ordering::Relaxed);
    }
  }

  pub fn record_load_success(&mut self) {
    if self.finish_load("load-success") {
      self.tracker.load_successes.fetch_add(1, Ordering::Relaxed);
    }
  }

  pub fn record_load_fail(&mut self) {
    if self.finish_load("load-fail") {
      self.tracker.load_failures.fetch_add(1, Ordering::Relaxed);
    }
  }

  fn begin_miss(&mut self, event: &str) -> bool {
    if !self.transition(RequestState::Started, RequestState::Missed, event) {
      return false;
    }
    let now = Instant::now();
    self.missed_at = Some(now);
    // Counted now so a miss without a subsequent load still has a time
    self
      .tracker
      .miss_nanos
      .fetch_add(nanos(now.duration_since(self.started)), Ordering::Relaxed);
    true
  }

  fn finish_load(&mut self, event: &str) -> bool {
    if !self.transition(RequestState::Missed, RequestState::Finished, event) {
      return false;
    }
    let load_time = self.missed_at.map(|t| t.elapsed()).unwrap_or_default();
    self.tracker.load_nanos.fetch_add(nanos(load_time), Ordering::Relaxed);
    self.tracker.miss_nanos.fetch_add(nanos(load_time), Ordering::Relaxed);
    true
  }

  fn transition(&mut self, from: RequestState, to: RequestState, event: &str) -> bool {
    if self.state != from {
      warn!(event, state = ?self.state, "ignoring out-of-order cache request event");
      return false;
    }
    self.state = to;
    true
  }
}
