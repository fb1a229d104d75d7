//! The scheduled run loop.
//!
//! A strictly sequential `Idle -> Waiting -> Running -> Waiting ...` cycle.
//! The clock and the sleep primitive are injected so the loop can be driven
//! deterministically in tests.

use crate::core::error::PreconditionError;
use crate::core::schedule::ScheduleState;
use chrono::{Duration, Local, NaiveDateTime, NaiveTime};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

/// Source of wall-clock time and blocking sleep.
pub trait Clock {
    /// Current naive local wall-clock time.
    fn now(&self) -> NaiveDateTime;
    /// Block the calling thread for `duration`.
    fn sleep(&self, duration: StdDuration);
}

/// The process wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }

    fn sleep(&self, duration: StdDuration) {
        std::thread::sleep(duration);
    }
}

/// Run loop state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Waiting,
    Running,
}

/// Upper bound on a single sleep so a shutdown request is noticed promptly.
pub const DEFAULT_SLEEP_SLICE: StdDuration = StdDuration::from_secs(1);

/// Repeatedly waits for the next anchored fire time and runs a job.
pub struct RunLoop<C: Clock> {
    clock: C,
    schedule: ScheduleState,
    state: LoopState,
    shutdown: Arc<AtomicBool>,
    sleep_slice: StdDuration,
    fires: u64,
}

impl<C: Clock> RunLoop<C> {
    /// Create a loop anchored relative to the clock's current time.
    pub fn new(
        clock: C,
        anchor: NaiveTime,
        interval: Duration,
    ) -> Result<Self, PreconditionError> {
        let schedule = ScheduleState::new(clock.now(), anchor, interval)?;
        Ok(Self {
            clock,
            schedule,
            state: LoopState::Idle,
            shutdown: Arc::new(AtomicBool::new(false)),
            sleep_slice: DEFAULT_SLEEP_SLICE,
            fires: 0,
        })
    }

    /// Use an externally owned shutdown flag (e.g. one set by a signal handler).
    pub fn with_shutdown(mut self, shutdown: Arc<AtomicBool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn with_sleep_slice(mut self, slice: StdDuration) -> Self {
        self.sleep_slice = slice;
        self
    }

    /// Handle that stops the loop at its next waiting boundary.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn schedule(&self) -> &ScheduleState {
        &self.schedule
    }

    /// Number of completed fires.
    pub fn fires(&self) -> u64 {
        self.fires
    }

    fn transition(&mut self, next: LoopState) {
        tracing::trace!(from = ?self.state, to = ?next, "run loop transition");
        self.state = next;
    }

    /// Sleep until `next_fire`. Returns `false` if shutdown was requested.
    fn wait_until_due(&self) -> bool {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return false;
            }
            let now = self.clock.now();
            if now >= self.schedule.next_fire {
                return true;
            }
            let remaining = (self.schedule.next_fire - now)
                .to_std()
                .unwrap_or(StdDuration::ZERO);
            self.clock.sleep(remaining.min(self.sleep_slice));
        }
    }

    /// Run until shutdown is requested or the job fails.
    ///
    /// The job receives the scheduled fire time. A job error terminates the
    /// loop and is returned unchanged; there is no retry at this layer.
    pub fn run<F, E>(&mut self, mut job: F) -> Result<(), E>
    where
        F: FnMut(NaiveDateTime) -> Result<(), E>,
        E: From<PreconditionError>,
    {
        loop {
            self.transition(LoopState::Waiting);
            tracing::info!(next_fire = %self.schedule.next_fire, "next run scheduled");

            if !self.wait_until_due() {
                tracing::info!(fires = self.fires, "run loop stopped");
                self.transition(LoopState::Idle);
                return Ok(());
            }

            self.transition(LoopState::Running);
            let fire_time = self.schedule.next_fire;
            let result = job(fire_time);
            self.transition(LoopState::Idle);
            result?;
            self.fires += 1;

            let next = self.schedule.advance()?;
            let now = self.clock.now();
            if next < now {
                tracing::warn!(
                    next_fire = %next,
                    now = %now,
                    "run took longer than the interval; next fire is already due"
                );
            }
        }
    }
}
