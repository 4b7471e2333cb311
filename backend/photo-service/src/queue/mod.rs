//! Durable photo-processing job queue on Redis
//!
//! Layout per queue name (all keys namespaced):
//! - `waiting` list: enqueued job ids, claimed with an atomic `LMOVE`
//!   into `active` (single-claim semantics)
//! - `active` list: jobs currently held by a worker slot
//! - `delayed` zset: jobs scheduled for a backoff retry, scored by
//!   ready-time in epoch millis
//! - `dead` list: jobs that exhausted their retry budget, retained up
//!   to a configured entry count
//! - `job:{id}` hash: payload plus attempt/claim bookkeeping
//!
//! Delivery is at-least-once: a promoter task re-queues due delayed
//! jobs and reclaims active jobs whose claim is older than the stall
//! timeout, so every processing step downstream must be idempotent by
//! key.

mod gate;

pub use gate::{ConcurrencyGate, GatePermit};

use crate::error::{AppError, Result};
use crate::models::PhotoJob;
use async_trait::async_trait;
use chrono::Utc;
use governor::clock::DefaultClock;
use governor::state::direct::NotKeyed;
use governor::state::InMemoryState;
use governor::{Quota, RateLimiter};
use rand::Rng;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Per-job retry policy supplied at enqueue time.
#[derive(Clone, Debug)]
pub struct JobOptions {
    /// Attempt budget including the first attempt.
    pub max_attempts: u32,
    /// Base delay for exponential backoff between attempts.
    pub backoff_base: Duration,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(2),
        }
    }
}

/// Consumer-side knobs.
#[derive(Clone, Debug)]
pub struct ConsumeOptions {
    pub concurrency: usize,
    pub rate_per_second: u32,
    pub stall_timeout: Duration,
    pub dead_letter_retention: usize,
    pub poll_interval: Duration,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self {
            concurrency: 5,
            rate_per_second: 10,
            stall_timeout: Duration::from_secs(120),
            dead_letter_retention: 1000,
            poll_interval: Duration::from_millis(200),
        }
    }
}

/// Queue depth snapshot for operability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueCounts {
    pub waiting: u64,
    pub active: u64,
    pub delayed: u64,
    pub dead: u64,
}

/// Handler invoked once per claimed job attempt.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: &PhotoJob) -> Result<()>;
}

/// What the queue does with a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RetryDecision {
    Retry(Duration),
    DeadLetter,
}

/// Exponential backoff without jitter: `base * 2^(attempts_made - 1)`.
/// The exponent is capped so pathological attempt counts cannot
/// overflow into zero-delay retries.
pub(crate) fn backoff_delay(base: Duration, attempts_made: u32) -> Duration {
    let exp = attempts_made.saturating_sub(1).min(16);
    base.saturating_mul(2u32.saturating_pow(exp))
}

pub(crate) fn next_step(base: Duration, attempts_made: u32, max_attempts: u32) -> RetryDecision {
    if attempts_made < max_attempts {
        RetryDecision::Retry(backoff_delay(base, attempts_made))
    } else {
        RetryDecision::DeadLetter
    }
}

#[derive(Clone)]
pub struct PhotoQueue {
    redis: ConnectionManager,
    namespace: String,
    name: String,
}

impl PhotoQueue {
    pub fn new(redis: ConnectionManager, namespace: &str, name: &str) -> Self {
        Self {
            redis,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}:{}", self.namespace, self.name, suffix)
    }

    fn job_key(&self, job_id: &str) -> String {
        self.key(&format!("job:{job_id}"))
    }

    /// Enqueue one job. Returns the job id.
    pub async fn enqueue(&self, payload: &PhotoJob, opts: &JobOptions) -> Result<String> {
        let job_id = Uuid::new_v4().to_string();
        let payload_json = serde_json::to_string(payload)?;
        let mut conn = self.redis.clone();

        let _: () = conn
            .hset_multiple(
                self.job_key(&job_id),
                &[
                    ("payload", payload_json.as_str()),
                    ("attempts_made", "0"),
                    ("max_attempts", &opts.max_attempts.to_string()),
                    ("backoff_base_ms", &opts.backoff_base.as_millis().to_string()),
                    ("enqueued_at", &Utc::now().timestamp_millis().to_string()),
                ],
            )
            .await?;
        let _: () = conn.lpush(self.key("waiting"), &job_id).await?;

        debug!(job_id = %job_id, photo_id = %payload.photo_id, "Job enqueued");
        Ok(job_id)
    }

    /// Atomically claim the next waiting job, if any.
    async fn claim(&self) -> Result<Option<String>> {
        let mut conn = self.redis.clone();
        let job_id: Option<String> = conn
            .lmove(
                self.key("waiting"),
                self.key("active"),
                redis::Direction::Right,
                redis::Direction::Left,
            )
            .await?;

        if let Some(ref job_id) = job_id {
            let _: () = conn
                .hset(
                    self.job_key(job_id),
                    "claimed_at",
                    Utc::now().timestamp_millis(),
                )
                .await?;
        }

        Ok(job_id)
    }

    async fn load_payload(&self, job_id: &str) -> Result<Option<PhotoJob>> {
        let mut conn = self.redis.clone();
        let payload: Option<String> = conn.hget(self.job_key(job_id), "payload").await?;
        match payload {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn finish_success(&self, job_id: &str) -> Result<()> {
        let mut conn = self.redis.clone();
        let _: i64 = conn.lrem(self.key("active"), 1, job_id).await?;
        let _: () = conn.del(self.job_key(job_id)).await?;
        Ok(())
    }

    /// Record a failed attempt: schedule a backoff retry while budget
    /// remains, otherwise dead-letter the job.
    async fn finish_failure(
        &self,
        job_id: &str,
        error: &AppError,
        retention: usize,
    ) -> Result<RetryDecision> {
        let mut conn = self.redis.clone();
        let job_key = self.job_key(job_id);

        let attempts_made: u32 = conn.hincr(&job_key, "attempts_made", 1i64).await?;
        let max_attempts: u32 = conn
            .hget::<_, _, Option<u32>>(&job_key, "max_attempts")
            .await?
            .unwrap_or(1);
        let backoff_base_ms: u64 = conn
            .hget::<_, _, Option<u64>>(&job_key, "backoff_base_ms")
            .await?
            .unwrap_or(2000);

        let _: i64 = conn.lrem(self.key("active"), 1, job_id).await?;

        let decision = next_step(
            Duration::from_millis(backoff_base_ms),
            attempts_made,
            max_attempts,
        );

        match &decision {
            RetryDecision::Retry(delay) => {
                // Jitter de-synchronizes retry herds after an outage.
                let jitter = rand::thread_rng().gen_range(0.85..1.15);
                let delay_ms = (delay.as_millis() as f64 * jitter) as i64;
                let ready_at = Utc::now().timestamp_millis() + delay_ms;
                let _: () = conn.zadd(self.key("delayed"), job_id, ready_at).await?;

                warn!(
                    job_id = %job_id,
                    attempt = attempts_made,
                    max_attempts,
                    delay_ms,
                    error = %error,
                    "Job attempt failed, retry scheduled"
                );
            }
            RetryDecision::DeadLetter => {
                let payload: Option<String> = conn.hget(&job_key, "payload").await?;
                let entry = serde_json::json!({
                    "job_id": job_id,
                    "payload": payload,
                    "error": error.to_string(),
                    "attempts": attempts_made,
                    "failed_at": Utc::now().to_rfc3339(),
                });
                let _: () = conn.lpush(self.key("dead"), entry.to_string()).await?;
                let _: () = conn
                    .ltrim(self.key("dead"), 0, retention.saturating_sub(1) as isize)
                    .await?;
                let _: () = conn.del(&job_key).await?;

                error!(
                    job_id = %job_id,
                    attempts = attempts_made,
                    error = %error,
                    "Job exhausted retry budget, dead-lettered"
                );
            }
        }

        Ok(decision)
    }

    /// Move due delayed jobs back to the waiting list.
    async fn promote_due(&self) -> Result<usize> {
        let mut conn = self.redis.clone();
        let now = Utc::now().timestamp_millis();
        let due: Vec<String> = conn
            .zrangebyscore_limit(self.key("delayed"), "-inf", now, 0, 100)
            .await?;

        for job_id in &due {
            let removed: i64 = conn.zrem(self.key("delayed"), job_id).await?;
            // Another worker may promote concurrently; only the one
            // that removed the member re-queues it.
            if removed > 0 {
                let _: () = conn.lpush(self.key("waiting"), job_id).await?;
                debug!(job_id = %job_id, "Delayed job promoted");
            }
        }

        Ok(due.len())
    }

    /// Re-queue active jobs whose claim is older than the stall
    /// timeout (crashed or wedged worker).
    async fn reclaim_stalled(&self, stall_timeout: Duration) -> Result<usize> {
        let mut conn = self.redis.clone();
        let active: Vec<String> = conn.lrange(self.key("active"), 0, -1).await?;
        let cutoff = Utc::now().timestamp_millis() - stall_timeout.as_millis() as i64;
        let mut reclaimed = 0;

        for job_id in active {
            let claimed_at: Option<i64> = conn.hget(self.job_key(&job_id), "claimed_at").await?;
            let stalled = match claimed_at {
                Some(ts) => ts < cutoff,
                // Hash gone but id still active: orphaned entry.
                None => true,
            };
            if stalled {
                let removed: i64 = conn.lrem(self.key("active"), 1, &job_id).await?;
                if removed > 0 {
                    if claimed_at.is_some() {
                        let _: () = conn.lpush(self.key("waiting"), &job_id).await?;
                        warn!(job_id = %job_id, "Stalled job reclaimed");
                        reclaimed += 1;
                    } else {
                        debug!(job_id = %job_id, "Dropped orphaned active entry");
                    }
                }
            }
        }

        Ok(reclaimed)
    }

    /// Queue depth snapshot.
    pub async fn counts(&self) -> Result<QueueCounts> {
        let mut conn = self.redis.clone();
        let waiting: u64 = conn.llen(self.key("waiting")).await?;
        let active: u64 = conn.llen(self.key("active")).await?;
        let delayed: u64 = conn.zcard(self.key("delayed")).await?;
        let dead: u64 = conn.llen(self.key("dead")).await?;
        Ok(QueueCounts {
            waiting,
            active,
            delayed,
            dead,
        })
    }
}

/// Consumer loop: claims jobs under a concurrency gate and a job-start
/// rate limit, dispatches them to the handler, and applies the retry
/// policy on failure. Runs until the shutdown signal flips.
pub struct QueueConsumer<H: JobHandler> {
    queue: PhotoQueue,
    handler: Arc<H>,
    options: ConsumeOptions,
    shutdown_rx: watch::Receiver<bool>,
}

impl<H: JobHandler> QueueConsumer<H> {
    pub fn new(
        queue: PhotoQueue,
        handler: Arc<H>,
        options: ConsumeOptions,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            queue,
            handler,
            options,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        info!(
            queue = %self.queue.name,
            concurrency = self.options.concurrency,
            rate_per_second = self.options.rate_per_second,
            "Starting queue consumer"
        );

        let rate = NonZeroU32::new(self.options.rate_per_second.max(1))
            .expect("rate is at least 1");
        let limiter: Arc<DirectLimiter> = Arc::new(RateLimiter::direct(Quota::per_second(rate)));
        let gate = ConcurrencyGate::new(self.options.concurrency);

        // Promoter: delayed-job promotion + stalled-job reclaim.
        let promoter_queue = self.queue.clone();
        let mut promoter_shutdown = self.shutdown_rx.clone();
        let stall_timeout = self.options.stall_timeout;
        let promoter = tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = promoter_shutdown.changed() => {
                        if *promoter_shutdown.borrow() {
                            break;
                        }
                    }
                    _ = tick.tick() => {
                        if let Err(e) = promoter_queue.promote_due().await {
                            warn!(error = %e, "Delayed-job promotion failed");
                        }
                        if let Err(e) = promoter_queue.reclaim_stalled(stall_timeout).await {
                            warn!(error = %e, "Stalled-job reclaim failed");
                        }
                    }
                }
            }
        });

        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }

            let permit = tokio::select! {
                permit = gate.acquire() => permit,
                _ = self.shutdown_rx.changed() => continue,
            };

            limiter.until_ready().await;

            let job_id = match self.queue.claim().await {
                Ok(Some(job_id)) => job_id,
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = tokio::time::sleep(self.options.poll_interval) => {}
                        _ = self.shutdown_rx.changed() => {}
                    }
                    continue;
                }
                Err(e) => {
                    drop(permit);
                    warn!(error = %e, "Failed to claim job, backing off");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            let queue = self.queue.clone();
            let handler = self.handler.clone();
            let retention = self.options.dead_letter_retention;
            tokio::spawn(async move {
                process_one(&queue, handler.as_ref(), &job_id, retention).await;
                drop(permit);
            });
        }

        info!(queue = %self.queue.name, "Queue consumer draining");
        // Held permits mean in-flight jobs; wait for them to finish.
        gate.drain().await;
        let _ = promoter.await;
        info!(queue = %self.queue.name, "Queue consumer stopped");
        Ok(())
    }
}

async fn process_one<H: JobHandler>(
    queue: &PhotoQueue,
    handler: &H,
    job_id: &str,
    retention: usize,
) {
    let job = match queue.load_payload(job_id).await {
        Ok(Some(job)) => job,
        Ok(None) => {
            warn!(job_id = %job_id, "Claimed job has no payload, dropping");
            let _ = queue.finish_success(job_id).await;
            return;
        }
        // A transient error (Redis unreachable) leaves the claim in
        // place for the stall reclaim to retry. A permanent error
        // (corrupt payload) must consume the attempt budget, or the
        // reclaim loop would redeliver the same poison message forever.
        Err(e) if e.is_transient() => {
            error!(job_id = %job_id, error = %e, "Failed to load job payload");
            return;
        }
        Err(e) => {
            error!(job_id = %job_id, error = %e, "Job payload unreadable, recording failure");
            if let Err(ack_err) = queue.finish_failure(job_id, &e, retention).await {
                error!(job_id = %job_id, error = %ack_err, "Failed to record job failure");
            }
            return;
        }
    };

    debug!(job_id = %job_id, photo_id = %job.photo_id, "Job claimed");

    match handler.handle(&job).await {
        Ok(()) => {
            if let Err(e) = queue.finish_success(job_id).await {
                error!(job_id = %job_id, error = %e, "Failed to ack completed job");
            } else {
                info!(job_id = %job_id, photo_id = %job.photo_id, "Job completed");
            }
        }
        Err(e) => {
            if let Err(ack_err) = queue.finish_failure(job_id, &e, retention).await {
                error!(job_id = %job_id, error = %ack_err, "Failed to record job failure");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule_doubles() {
        let base = Duration::from_secs(2);
        assert_eq!(backoff_delay(base, 1), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 2), Duration::from_secs(4));
        assert_eq!(backoff_delay(base, 3), Duration::from_secs(8));
        assert_eq!(backoff_delay(base, 5), Duration::from_secs(32));
    }

    #[test]
    fn test_backoff_exponent_capped() {
        let base = Duration::from_millis(1);
        // Absurd attempt counts must not wrap around to tiny delays
        assert!(backoff_delay(base, 100) >= backoff_delay(base, 17));
    }

    #[test]
    fn test_retry_cap_exact_attempt_budget() {
        let base = Duration::from_secs(1);
        // attempts budget of 3: attempts 1 and 2 retry, attempt 3 dead-letters
        assert!(matches!(next_step(base, 1, 3), RetryDecision::Retry(_)));
        assert!(matches!(next_step(base, 2, 3), RetryDecision::Retry(_)));
        assert_eq!(next_step(base, 3, 3), RetryDecision::DeadLetter);
    }

    #[test]
    fn test_corrupt_payload_error_consumes_retry_budget() {
        // A payload that no longer parses maps to a permanent error, so
        // the load failure path must record the attempt instead of
        // leaving the job in the active list for reclaim.
        let parse_err = serde_json::from_str::<PhotoJob>("{not json").unwrap_err();
        let e = AppError::from(parse_err);
        assert!(!e.is_transient());

        // Redis being unreachable is transient; the claim stays put and
        // the stall reclaim re-queues it once the outage clears.
        let redis_down = AppError::Queue("connection reset".to_string());
        assert!(redis_down.is_transient());
    }

    #[test]
    fn test_single_attempt_budget_never_retries() {
        assert_eq!(
            next_step(Duration::from_secs(1), 1, 1),
            RetryDecision::DeadLetter
        );
    }
}
