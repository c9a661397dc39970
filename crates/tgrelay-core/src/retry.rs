//! Retry wrapper for remote calls.
//!
//! Every call into the platform goes through [`RetryExecutor::execute`]:
//! - flood-control responses are waited out for exactly the signalled duration and retried
//!   without consuming the retry budget
//! - transient failures (network, timeouts, server-side) back off exponentially up to
//!   `max_retries` times
//! - anything else is returned immediately

use std::{future::Future, sync::Arc, sync::OnceLock, time::Duration};

use regex::Regex;
use tokio::{sync::mpsc, time::sleep};
use tokio_util::sync::CancellationToken;

use crate::{errors::Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Flood waits longer than this are returned to the caller instead of slept through.
    pub max_flood_wait: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_flood_wait: None,
        }
    }
}

impl RetryPolicy {
    /// `min(base_delay * 2^attempt, max_delay)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

// ============== Failure classification ==============

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Failure {
    RateLimited(Duration),
    Transient,
    Fatal,
}

fn flood_wait_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"FLOOD_WAIT_(\d+)",
            r"FLOOD_PREMIUM_WAIT_(\d+)",
            r"SLOWMODE_WAIT_(\d+)",
            r"(?i)a wait of (\d+) seconds",
            r"(?i)retry after (\d+)",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

/// Extract a flood-control wait from a free-form platform error string.
pub fn parse_flood_wait(text: &str) -> Option<Duration> {
    flood_wait_patterns().iter().find_map(|re| {
        re.captures(text)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<u64>().ok())
            .map(Duration::from_secs)
    })
}

const TRANSIENT_HINTS: &[&str] = &[
    "timeout",
    "timed out",
    "connection",
    "network",
    "temporarily",
    "unavailable",
    "rpc_call_fail",
    "internal server",
];

fn looks_transient(text: &str) -> bool {
    let lower = text.to_lowercase();
    TRANSIENT_HINTS.iter().any(|h| lower.contains(h))
}

pub fn classify_failure(err: &Error) -> Failure {
    match err {
        Error::RateLimited { wait } => Failure::RateLimited(*wait),
        Error::Network(_) | Error::Timeout(_) => Failure::Transient,
        Error::Rpc { code, message } => {
            if let Some(wait) = parse_flood_wait(message) {
                Failure::RateLimited(wait)
            } else if *code >= 500 || *code == -503 || looks_transient(message) {
                Failure::Transient
            } else {
                Failure::Fatal
            }
        }
        Error::Io(io) => {
            use std::io::ErrorKind::*;
            match io.kind() {
                TimedOut | ConnectionReset | ConnectionAborted | ConnectionRefused
                | BrokenPipe | Interrupted | UnexpectedEof => Failure::Transient,
                _ => Failure::Fatal,
            }
        }
        Error::External(message) => match parse_flood_wait(message) {
            Some(wait) => Failure::RateLimited(wait),
            None if looks_transient(message) => Failure::Transient,
            None => Failure::Fatal,
        },
        Error::Config(_)
        | Error::NotFound(_)
        | Error::ExhaustedRetries { .. }
        | Error::Cancelled
        | Error::Json(_) => Failure::Fatal,
    }
}

// ============== Flood-wait progress ==============

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WaitEvent {
    Started {
        operation: String,
        wait: Duration,
    },
    Progress {
        operation: String,
        elapsed: Duration,
        total: Duration,
    },
    Completed {
        operation: String,
        total: Duration,
    },
}

/// Receives advisory flood-wait notifications. Must not block.
pub trait WaitObserver: Send + Sync {
    fn on_wait(&self, event: &WaitEvent);
}

/// Default observer: logs waits through `tracing`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingWaitObserver;

impl WaitObserver for TracingWaitObserver {
    fn on_wait(&self, event: &WaitEvent) {
        match event {
            WaitEvent::Started { operation, wait } => {
                tracing::info!(%operation, wait_secs = wait.as_secs(), "flood wait started");
            }
            WaitEvent::Progress {
                operation,
                elapsed,
                total,
            } => {
                tracing::debug!(
                    %operation,
                    elapsed_secs = elapsed.as_secs(),
                    total_secs = total.as_secs(),
                    "flood wait in progress"
                );
            }
            WaitEvent::Completed { operation, total } => {
                tracing::info!(%operation, total_secs = total.as_secs(), "flood wait finished");
            }
        }
    }
}

/// Forward events to a channel (UI/event-bus bridges). A dropped receiver is ignored.
impl WaitObserver for mpsc::UnboundedSender<WaitEvent> {
    fn on_wait(&self, event: &WaitEvent) {
        let _ = self.send(event.clone());
    }
}

/// Report every second for short waits, every 10% of the wait for long ones.
pub fn progress_interval(wait: Duration) -> Duration {
    if wait <= Duration::from_secs(10) {
        Duration::from_secs(1)
    } else {
        wait / 10
    }
}

// ============== Executor ==============

pub struct RetryExecutor {
    policy: RetryPolicy,
    observer: Arc<dyn WaitObserver>,
    cancel: CancellationToken,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            observer: Arc::new(TracingWaitObserver),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn WaitObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Share a cancellation token (e.g. the application's shutdown token).
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn execute<T, F, Fut>(&self, operation: &str, call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_with(self.policy, operation, call).await
    }

    pub async fn execute_with<T, F, Fut>(
        &self,
        policy: RetryPolicy,
        operation: &str,
        mut call: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;
        let mut calls: u32 = 0;

        loop {
            calls += 1;
            let err = match call().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            match classify_failure(&err) {
                Failure::RateLimited(wait) => {
                    if policy.max_flood_wait.is_some_and(|max| wait > max) {
                        tracing::warn!(
                            operation,
                            wait_secs = wait.as_secs(),
                            "flood wait exceeds configured maximum, giving up"
                        );
                        return Err(err);
                    }
                    self.wait_out_flood(operation, wait).await?;
                }
                Failure::Transient => {
                    if attempt >= policy.max_retries {
                        tracing::warn!(operation, attempts = calls, error = %err, "retries exhausted");
                        return Err(Error::ExhaustedRetries {
                            attempts: calls,
                            source: Box::new(err),
                        });
                    }
                    let delay = policy.backoff(attempt);
                    tracing::debug!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, backing off"
                    );
                    self.sleep_or_cancel(delay).await?;
                    attempt += 1;
                }
                Failure::Fatal => return Err(err),
            }
        }
    }

    async fn wait_out_flood(&self, operation: &str, wait: Duration) -> Result<()> {
        self.observer.on_wait(&WaitEvent::Started {
            operation: operation.to_string(),
            wait,
        });

        let step = progress_interval(wait);
        let mut elapsed = Duration::ZERO;
        while elapsed < wait {
            let chunk = step.min(wait - elapsed);
            self.sleep_or_cancel(chunk).await?;
            elapsed += chunk;
            if elapsed < wait {
                self.observer.on_wait(&WaitEvent::Progress {
                    operation: operation.to_string(),
                    elapsed,
                    total: wait,
                });
            }
        }

        self.observer.on_wait(&WaitEvent::Completed {
            operation: operation.to_string(),
            total: wait,
        });
        Ok(())
    }

    async fn sleep_or_cancel(&self, duration: Duration) -> Result<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            _ = sleep(duration) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tokio::time::Instant;

    fn policy(max_retries: u32, base_ms: u64, max_ms: u64) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(max_ms),
            max_flood_wait: None,
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = policy(5, 100, 1000);
        assert_eq!(p.backoff(0), Duration::from_millis(100));
        assert_eq!(p.backoff(1), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(800));
        assert_eq!(p.backoff(4), Duration::from_millis(1000));
        assert_eq!(p.backoff(60), Duration::from_millis(1000));
    }

    #[test]
    fn parses_flood_wait_from_platform_strings() {
        let e = Error::rpc(420, "FLOOD_WAIT_30");
        assert_eq!(
            classify_failure(&e),
            Failure::RateLimited(Duration::from_secs(30))
        );

        let e = Error::External("A wait of 7 seconds is required (caused by GetHistory)".into());
        assert_eq!(
            classify_failure(&e),
            Failure::RateLimited(Duration::from_secs(7))
        );
    }

    #[test]
    fn classifies_transient_and_fatal() {
        assert_eq!(
            classify_failure(&Error::Network("reset".into())),
            Failure::Transient
        );
        assert_eq!(
            classify_failure(&Error::rpc(500, "INTERNAL")),
            Failure::Transient
        );
        assert_eq!(
            classify_failure(&Error::rpc(400, "PEER_ID_INVALID")),
            Failure::Fatal
        );
        assert_eq!(
            classify_failure(&Error::NotFound("x".into())),
            Failure::Fatal
        );
    }

    #[test]
    fn progress_interval_scales_with_long_waits() {
        assert_eq!(progress_interval(Duration::from_secs(2)), Duration::from_secs(1));
        assert_eq!(
            progress_interval(Duration::from_secs(300)),
            Duration::from_secs(30)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limits_do_not_consume_retry_budget() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let exec = RetryExecutor::new(policy(0, 100, 1000)).with_observer(Arc::new(tx));
        let calls = AtomicU32::new(0);

        let out = exec
            .execute("get_history", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 5 {
                        Err(Error::RateLimited {
                            wait: Duration::from_secs(2),
                        })
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(out, 5);
        assert_eq!(calls.load(Ordering::SeqCst), 6);

        let mut started = 0;
        let mut progress = 0;
        let mut completed = 0;
        while let Ok(ev) = rx.try_recv() {
            match ev {
                WaitEvent::Started { wait, .. } => {
                    assert_eq!(wait, Duration::from_secs(2));
                    started += 1;
                }
                WaitEvent::Progress { elapsed, .. } => {
                    assert_eq!(elapsed, Duration::from_secs(1));
                    progress += 1;
                }
                WaitEvent::Completed { .. } => completed += 1,
            }
        }
        assert_eq!((started, progress, completed), (5, 5, 5));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_waits_exactly_the_signalled_duration() {
        let exec = RetryExecutor::new(policy(0, 100, 1000));
        let calls = AtomicU32::new(0);
        let start = Instant::now();

        exec.execute("send", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(Error::rpc(420, "FLOOD_WAIT_3"))
                } else {
                    Ok(())
                }
            }
        })
        .await
        .unwrap();

        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(3));
        assert!(waited < Duration::from_millis(3050));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_exhaust_after_max_retries_plus_one() {
        let exec = RetryExecutor::new(policy(3, 100, 250));
        let stamps = Mutex::new(Vec::new());

        let err = exec
            .execute("get_message", || {
                stamps.lock().unwrap().push(Instant::now());
                async { Err::<(), _>(Error::Network("connection reset".into())) }
            })
            .await
            .unwrap_err();

        match err {
            Error::ExhaustedRetries { attempts, source } => {
                assert_eq!(attempts, 4);
                assert!(matches!(*source, Error::Network(_)));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let stamps = stamps.lock().unwrap();
        assert_eq!(stamps.len(), 4);
        let expected = [100u64, 200, 250];
        for (i, pair) in stamps.windows(2).enumerate() {
            let gap = pair[1].duration_since(pair[0]);
            let want = Duration::from_millis(expected[i]);
            assert!(
                gap >= want && gap < want + Duration::from_millis(5),
                "gap {i}: {gap:?} vs {want:?}"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_errors_are_not_retried() {
        let exec = RetryExecutor::new(policy(5, 100, 1000));
        let calls = AtomicU32::new(0);

        let err = exec
            .execute("get_chat", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Error::rpc(400, "CHANNEL_INVALID")) }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Rpc { code: 400, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_flood_wait_is_returned() {
        let mut p = policy(5, 100, 1000);
        p.max_flood_wait = Some(Duration::from_secs(60));
        let exec = RetryExecutor::new(p);

        let err = exec
            .execute("get_chat", || async {
                Err::<(), _>(Error::RateLimited {
                    wait: Duration::from_secs(3600),
                })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RateLimited { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_flood_wait() {
        let cancel = CancellationToken::new();
        let exec = RetryExecutor::new(policy(3, 100, 1000)).with_cancellation(cancel.clone());
        let calls = AtomicU32::new(0);

        tokio::spawn(async move {
            sleep(Duration::from_secs(5)).await;
            cancel.cancel();
        });

        let err = exec
            .execute("get_history", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<(), _>(Error::RateLimited {
                        wait: Duration::from_secs(600),
                    })
                }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
