// Typing coordinator: per-conversation Idle -> Typing -> Idle machine.
// The core is synchronous and takes the current Instant explicitly, so the
// debounce and safety timers are testable without waiting on a wall clock.
// An async driver in the facade ticks `poll` and forwards signals over the
// transport channel.

use std::time::{Duration, Instant};

pub const TYPING_DEBOUNCE: Duration = Duration::from_secs(1);
pub const TYPING_HARD_CAP: Duration = Duration::from_secs(3);

/// Signal to emit over the wire as a result of a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingSignal {
    Started,
    Stopped,
}

#[derive(Debug, Clone, Copy)]
enum State {
    Idle,
    Typing {
        /// When this burst began; bounds worst-case remote staleness.
        started: Instant,
        last_keystroke: Instant,
    },
}

#[derive(Debug)]
pub struct TypingCoordinator {
    state: State,
    debounce: Duration,
    hard_cap: Duration,
}

impl TypingCoordinator {
    pub fn new() -> Self {
        Self::with_timers(TYPING_DEBOUNCE, TYPING_HARD_CAP)
    }

    pub fn with_timers(debounce: Duration, hard_cap: Duration) -> Self {
        TypingCoordinator {
            state: State::Idle,
            debounce,
            hard_cap,
        }
    }

    pub fn is_typing(&self) -> bool {
        matches!(self.state, State::Typing { .. })
    }

    /// Record a local keystroke. Returns `Started` on the Idle -> Typing
    /// edge; while already typing it only resets the inactivity timer.
    pub fn keystroke(&mut self, now: Instant) -> Option<TypingSignal> {
        match self.state {
            State::Idle => {
                self.state = State::Typing {
                    started: now,
                    last_keystroke: now,
                };
                Some(TypingSignal::Started)
            }
            State::Typing { started, .. } => {
                self.state = State::Typing {
                    started,
                    last_keystroke: now,
                };
                None
            }
        }
    }

    /// Check the timers. Returns `Stopped` exactly once per burst, when
    /// either the inactivity debounce or the hard safety cap has elapsed.
    pub fn poll(&mut self, now: Instant) -> Option<TypingSignal> {
        match self.state {
            State::Idle => None,
            State::Typing {
                started,
                last_keystroke,
            } => {
                let idle_expired = now.duration_since(last_keystroke) >= self.debounce;
                let cap_expired = now.duration_since(started) >= self.hard_cap;
                if idle_expired || cap_expired {
                    self.state = State::Idle;
                    Some(TypingSignal::Stopped)
                } else {
                    None
                }
            }
        }
    }

    /// The next instant at which `poll` could transition, for the driver's
    /// timer. None while idle.
    pub fn next_deadline(&self) -> Option<Instant> {
        match self.state {
            State::Idle => None,
            State::Typing {
                started,
                last_keystroke,
            } => {
                let debounce_at = last_keystroke + self.debounce;
                let cap_at = started + self.hard_cap;
                Some(debounce_at.min(cap_at))
            }
        }
    }

    /// Teardown: leaving the conversation must not leak a stuck "typing"
    /// state to peers. Returns `Stopped` if a stop signal still needs to go
    /// out before the transport handle is released.
    pub fn flush(&mut self) -> Option<TypingSignal> {
        if self.is_typing() {
            self.state = State::Idle;
            Some(TypingSignal::Stopped)
        } else {
            None
        }
    }
}

impl Default for TypingCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
