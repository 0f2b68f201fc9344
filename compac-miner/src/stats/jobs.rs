//! Job submission timing, in one-minute buckets.

use serde::Serialize;

use super::Timestamp;
use super::ring::{Advance, Bucket, TimeRing};

pub const JOB_DEPTH: usize = 5;
pub const JOB_BUCKET_SECS: i64 = 60;

#[derive(Debug, Default)]
pub struct JobBucket {
    pub first: Timestamp,
    pub last: Timestamp,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
}

impl Bucket for JobBucket {
    type Totals = ();

    fn retire(&self, _totals: &mut ()) {}
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct JobSummary {
    pub jobs: u64,
    pub elapsed_secs: f64,
    pub jobs_per_sec: f64,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
}

#[derive(Debug)]
pub struct JobStats {
    ring: TimeRing<JobBucket>,
    last_job: Option<Timestamp>,
}

impl Default for JobStats {
    fn default() -> Self {
        Self::new()
    }
}

impl JobStats {
    pub fn new() -> Self {
        Self {
            ring: TimeRing::new(JOB_DEPTH, JOB_BUCKET_SECS, JOB_DEPTH - 1),
            last_job: None,
        }
    }

    pub fn advance(&mut self, now: Timestamp) {
        if self.ring.advance(now.secs()) == Advance::Wiped {
            self.last_job = None;
        }
    }

    pub fn wipe(&mut self, now: Timestamp) {
        self.ring.wipe(now.secs());
        self.last_job = None;
    }

    /// Records a task sent at `now`. The interval from the previous task
    /// feeds the bucket's average, minimum and maximum; the first task of a
    /// bucket only stamps its start.
    pub fn record(&mut self, now: Timestamp) {
        self.advance(now);
        let last_job = self.last_job;
        self.ring.record(now.secs(), |bucket, _, count| {
            if count == 0 {
                bucket.first = now;
            } else if let Some(previous) = last_job {
                let ms = now.millis_since(previous);
                let n = count as f64;
                bucket.avg_ms = (bucket.avg_ms * (n - 1.0) + ms) / n;
                if bucket.min_ms == 0.0 {
                    bucket.min_ms = ms;
                    bucket.max_ms = ms;
                } else {
                    bucket.min_ms = bucket.min_ms.min(ms);
                    bucket.max_ms = bucket.max_ms.max(ms);
                }
            }
            bucket.last = now;
        });
        self.last_job = Some(now);
    }

    pub fn jobs(&self) -> u64 {
        self.ring.samples()
    }

    /// Seconds since the last recorded task.
    pub fn data_age_secs(&self, now: Timestamp) -> Option<f64> {
        self.last_job.map(|last| now.secs_since(last))
    }

    /// Per-bucket summaries, newest first.
    pub fn summary(&self) -> Vec<JobSummary> {
        self.ring
            .recent()
            .map(|slot| {
                let elapsed = slot.bucket.last.secs_since(slot.bucket.first);
                JobSummary {
                    jobs: slot.count,
                    elapsed_secs: elapsed,
                    jobs_per_sec: if elapsed > 0.0 {
                        (slot.count.saturating_sub(1)) as f64 / elapsed
                    } else {
                        0.0
                    },
                    avg_ms: slot.bucket.avg_ms,
                    min_ms: slot.bucket.min_ms,
                    max_ms: slot.bucket.max_ms,
                }
            })
            .collect()
    }
}
