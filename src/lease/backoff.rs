use std::time::Duration;

use rand::Rng;

use crate::error::{Code, Error, Result};

const DEFAULT_JITTER_FACTOR: f64 = 0.4;

/// Exponential backoff with jitter and a retry cap.
#[derive(Debug, Clone)]
pub struct Backoff {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub max_retries: u32,
    /// Zero selects the default of 0.4.
    pub jitter_factor: f64,
    retries: u32,
}

impl Backoff {
    #[must_use]
    pub fn new(initial_interval: Duration, max_interval: Duration, max_retries: u32) -> Self {
        Self {
            initial_interval,
            max_interval,
            max_retries,
            jitter_factor: DEFAULT_JITTER_FACTOR,
            retries: 0,
        }
    }

    /// The schedule shared by the synchronizer and the index loader.
    #[must_use]
    pub fn search_default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(300), 20)
    }

    #[must_use]
    pub fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor;
        self
    }

    /// Returns the delay before the next retry.
    pub fn next(&mut self) -> Result<Duration> {
        self.retries += 1;

        if self.retries > self.max_retries {
            return Err(
                Error::new("811a0b41-9325-4883-88c1-82563a08a66e", Code::ResourceExhausted, "Max retries exceeded.")
                    .with_meta("max_retries", self.max_retries),
            );
        }

        let factor = 1u32.checked_shl(self.retries).unwrap_or(u32::MAX);
        let delay = self
            .initial_interval
            .checked_mul(factor)
            .unwrap_or(self.max_interval);

        if delay > self.max_interval {
            return Ok(self.max_interval);
        }

        if self.jitter_factor < 0.0 {
            return Err(Error::new(
                "5eceb54d-0bb5-4583-80c1-e8be1f612059",
                Code::InvalidArgument,
                "Jitter factor must be greater than 0.",
            ));
        }

        let jf = if self.jitter_factor == 0.0 {
            DEFAULT_JITTER_FACTOR
        } else {
            self.jitter_factor
        };

        let d = delay.as_secs_f64();
        let jitter = rand::thread_rng().r#gen::<f64>() * jf * d - jf / 2.0 * d;
        let delay = Duration::from_secs_f64((d + jitter).max(0.0));

        Ok(delay.min(self.max_interval))
    }

    #[must_use]
    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn reset(&mut self) {
        self.retries = 0;
    }

    /// Sleeps the current thread for the next delay.
    pub fn sleep_blocking(&mut self) -> Result<()> {
        let delay = self.next()?;
        std::thread::sleep(delay);
        Ok(())
    }

    pub async fn sleep(&mut self) -> Result<()> {
        let delay = self.next()?;
        tokio::time::sleep(delay).await;
        Ok(())
    }
}
