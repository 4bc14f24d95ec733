//! Pausable countdown used for step durations.
//!
//! The timer owns no thread and no clock. Every tick is a scheduled callback
//! carrying a [`TickToken`]; the owner schedules the first tick immediately
//! and each following one [`DELAY_TICK`] later for as long as [`DelayTimer::tick`]
//! reports [`DelayTick::Remaining`]. Pausing, resuming, restarting and
//! resetting all retire the outstanding token, so an old tick chain can never
//! run alongside a new one.

use std::time::Duration;

pub const DELAY_TICK: Duration = Duration::from_millis(100);

const TICK_MS: u64 = DELAY_TICK.as_millis() as u64;

/// Identifies one live tick chain of a [`DelayTimer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickToken(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayTick {
    /// Token belongs to a retired chain, or the timer is paused. Drop it.
    Stale,
    /// Countdown advanced; schedule the next tick.
    Remaining(u64),
    /// Countdown reached zero. Emitted once per `start`.
    Completed,
}

#[derive(Debug, Default)]
pub struct DelayTimer {
    remaining_ms: u64,
    paused: bool,
    active: bool,
    chain: u64,
}

impl DelayTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin (or restart) a countdown. The returned token should be ticked now.
    pub fn start(&mut self, duration_ms: u64) -> TickToken {
        self.remaining_ms = duration_ms;
        self.paused = false;
        self.active = true;
        self.next_chain()
    }

    pub fn tick(&mut self, token: TickToken) -> DelayTick {
        if token.0 != self.chain || !self.active || self.paused {
            return DelayTick::Stale;
        }
        if self.remaining_ms > 0 {
            self.remaining_ms = self.remaining_ms.saturating_sub(TICK_MS);
            DelayTick::Remaining(self.remaining_ms)
        } else {
            self.active = false;
            DelayTick::Completed
        }
    }

    /// Freeze the countdown. Returns `false` if there was nothing to pause.
    pub fn pause(&mut self) -> bool {
        if !self.active || self.paused {
            return false;
        }
        self.paused = true;
        self.next_chain();
        true
    }

    /// Continue from the frozen value. The returned token should be ticked now.
    pub fn resume(&mut self) -> Option<TickToken> {
        if !self.active || !self.paused {
            return None;
        }
        self.paused = false;
        Some(self.next_chain())
    }

    /// Abort any countdown: no remaining time, not paused.
    pub fn reset(&mut self) {
        self.remaining_ms = 0;
        self.paused = false;
        self.active = false;
        self.next_chain();
    }

    pub fn remaining_ms(&self) -> u64 {
        self.remaining_ms
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    fn next_chain(&mut self) -> TickToken {
        self.chain = self.chain.wrapping_add(1);
        TickToken(self.chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::scheduler::Scheduler;

    /// Drive the timer on a virtual clock the way the sequencer does.
    struct Harness {
        timer: DelayTimer,
        scheduler: Scheduler<TickToken>,
        remaining: Vec<u64>,
        completed_at: Option<Duration>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                timer: DelayTimer::new(),
                scheduler: Scheduler::new(),
                remaining: Vec::new(),
                completed_at: None,
            }
        }

        fn start(&mut self, ms: u64) {
            let token = self.timer.start(ms);
            self.scheduler.schedule(Duration::ZERO, token);
        }

        fn resume(&mut self) {
            if let Some(token) = self.timer.resume() {
                self.scheduler.schedule(Duration::ZERO, token);
            }
        }

        fn run_until(&mut self, until: Duration) {
            while let Some(token) = self.scheduler.pop_due(until) {
                match self.timer.tick(token) {
                    DelayTick::Stale => {}
                    DelayTick::Remaining(ms) => {
                        self.remaining.push(ms);
                        self.scheduler.schedule(DELAY_TICK, token);
                    }
                    DelayTick::Completed => {
                        assert!(self.completed_at.is_none(), "completed twice");
                        self.completed_at = Some(self.scheduler.now());
                    }
                }
            }
            self.scheduler.advance_clock(until);
        }
    }

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn counts_down_in_100ms_ticks_and_completes_once() {
        let mut harness = Harness::new();
        harness.start(1000);
        harness.run_until(ms(5000));

        assert_eq!(
            harness.remaining,
            vec![900, 800, 700, 600, 500, 400, 300, 200, 100, 0]
        );
        assert_eq!(harness.completed_at, Some(ms(1000)));
        assert!(!harness.timer.is_active());
    }

    #[test]
    fn pause_freezes_and_resume_finishes_the_remainder() {
        let mut harness = Harness::new();
        harness.start(1000);
        harness.run_until(ms(250));
        assert_eq!(harness.timer.remaining_ms(), 700);

        assert!(harness.timer.pause());
        harness.run_until(ms(60_000));
        assert_eq!(harness.timer.remaining_ms(), 700);
        assert_eq!(harness.completed_at, None);

        harness.resume();
        harness.run_until(ms(60_699));
        assert_eq!(harness.completed_at, None);
        harness.run_until(ms(60_700));
        assert_eq!(harness.completed_at, Some(ms(60_700)));
    }

    #[test]
    fn quick_pause_resume_does_not_double_tick() {
        let mut harness = Harness::new();
        harness.start(500);
        harness.run_until(ms(50));
        harness.timer.pause();
        harness.resume();
        harness.run_until(ms(10_000));

        // 500 → 400 at start, 300 on resume, then one tick per 100ms.
        assert_eq!(harness.remaining, vec![400, 300, 200, 100, 0]);
        assert_eq!(harness.completed_at, Some(ms(450)));
    }

    #[test]
    fn restart_discards_previous_chain() {
        let mut harness = Harness::new();
        harness.start(300);
        harness.run_until(ms(100));
        harness.start(200);
        harness.run_until(ms(1000));
        assert_eq!(harness.remaining, vec![200, 100, 100, 0]);
        assert_eq!(harness.completed_at, Some(ms(300)));
    }

    #[test]
    fn reset_clears_state_and_silences_ticks() {
        let mut harness = Harness::new();
        harness.start(1000);
        harness.run_until(ms(100));
        harness.timer.pause();
        harness.timer.reset();
        assert_eq!(harness.timer.remaining_ms(), 0);
        assert!(!harness.timer.is_paused());
        assert_eq!(harness.timer.resume(), None);
        harness.run_until(ms(5000));
        assert_eq!(harness.completed_at, None);
    }
}
