//! Wall-clock source.
//!
//! Fire times are absolute wall-clock timestamps because they must survive a
//! process restart. Everything that compares against them asks a [`Clock`]
//! rather than calling `OffsetDateTime::now_utc()` directly.

use std::fmt;

use time::OffsetDateTime;
use tokio::time::Instant;

pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> OffsetDateTime;
}

/// The operating system's clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Wall time derived from the tokio clock.
///
/// Anchors a wall-clock timestamp to a tokio [`Instant`] and advances with
/// it, so tests running with a paused runtime see wall time move exactly as
/// far as `tokio::time::advance` moves it.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    wall: OffsetDateTime,
    anchor: Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self::starting_at(OffsetDateTime::now_utc())
    }

    pub fn starting_at(wall: OffsetDateTime) -> Self {
        Self {
            wall,
            anchor: Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> OffsetDateTime {
        self.wall + self.anchor.elapsed()
    }
}
