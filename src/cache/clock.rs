//! Round timing.
//!
//! Cached values live until the next round boundary rather than for a fixed
//! duration. The boundary is owned by a `RoundClock`.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;

#[derive(Debug, Error, Clone)]
pub enum ClockError {
    #[error("round authority unavailable: {0}")]
    Unavailable(String),
}

/// Source of the time left until the current round ends.
#[async_trait]
pub trait RoundClock: Send + Sync {
    async fn seconds_until_next_round(&self) -> Result<u64, ClockError>;
}

/// Rounds of a fixed length counted from a genesis instant.
#[derive(Debug, Clone)]
pub struct FixedRoundClock {
    genesis: OffsetDateTime,
    round_duration: Duration,
}

impl FixedRoundClock {
    /// `round_duration` must be non-zero; configuration loading enforces this.
    pub fn new(genesis: OffsetDateTime, round_duration: Duration) -> Self {
        Self {
            genesis,
            round_duration,
        }
    }

    pub fn round_duration(&self) -> Duration {
        self.round_duration
    }

    /// Whole seconds, rounded up, from `now` until the next round starts.
    ///
    /// Before genesis the next round is the first one.
    pub fn seconds_remaining_at(&self, now: OffsetDateTime) -> u64 {
        let round_nanos = self.round_duration.as_nanos();
        if round_nanos == 0 {
            return 0;
        }

        let since_genesis = now - self.genesis;
        let remaining_nanos = if since_genesis.is_negative() {
            since_genesis.unsigned_abs().as_nanos()
        } else {
            let into_round = since_genesis.unsigned_abs().as_nanos() % round_nanos;
            round_nanos - into_round
        };

        let seconds = remaining_nanos.div_ceil(1_000_000_000);
        u64::try_from(seconds).unwrap_or(u64::MAX)
    }
}

#[async_trait]
impl RoundClock for FixedRoundClock {
    async fn seconds_until_next_round(&self) -> Result<u64, ClockError> {
        Ok(self.seconds_remaining_at(OffsetDateTime::now_utc()))
    }
}
