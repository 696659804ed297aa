//! Readiness gate.
//!
//! Holds back ADD until an externally maintained indicator file exists. The
//! wait is a bounded poll loop over an injected [`Clock`] so tests can drive
//! time by hand.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Time source and sleep primitive.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    async fn sleep(&self, duration: Duration);
}

/// Wall-clock time with tokio's timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Blocks ADD processing until the readiness indicator appears.
pub struct ReadinessGate {
    path: PathBuf,
    timeout: Duration,
    interval: Duration,
    every_add: bool,
    passed: AtomicBool,
    clock: Arc<dyn Clock>,
}

impl ReadinessGate {
    pub fn new(path: impl Into<PathBuf>, timeout: Duration, interval: Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
            interval,
            every_add: false,
            passed: AtomicBool::new(false),
            clock: Arc::new(TokioClock),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Check before every ADD instead of only the first.
    #[must_use]
    pub fn check_every_add(mut self, every_add: bool) -> Self {
        self.every_add = every_add;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Admits one ADD, waiting at most the configured timeout or `bound`, whichever is shorter.
    pub async fn admit(&self, bound: Option<Duration>) -> Result<()> {
        if !self.every_add && self.passed.load(Ordering::Acquire) {
            return Ok(());
        }

        let limit = bound.map_or(self.timeout, |b| b.min(self.timeout));
        self.wait(limit).await?;
        self.passed.store(true, Ordering::Release);
        Ok(())
    }

    /// Polls for the indicator until it exists or `limit` has elapsed.
    pub async fn wait(&self, limit: Duration) -> Result<()> {
        let start = self.clock.now();
        // a limit past the end of time never expires
        let deadline = start.checked_add(limit);

        loop {
            if tokio::fs::metadata(&self.path).await.is_ok() {
                info!("Readiness indicator {} present", self.path.display());
                return Ok(());
            }

            let now = self.clock.now();
            let pause = match deadline {
                Some(deadline) if now >= deadline => {
                    return Err(Error::ReadinessTimeout {
                        path: self.path.clone(),
                        waited: now.saturating_duration_since(start),
                    });
                }
                Some(deadline) => self.interval.min(deadline - now),
                None => self.interval,
            };
            debug!("Readiness indicator {} absent, retrying in {:?}", self.path.display(), pause);
            self.clock.sleep(pause).await;
        }
    }
}
