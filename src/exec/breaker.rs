//! # Stage: Circuit Breaker
//!
//! ## Responsibility
//! Wraps a [`CommandExecutor`] with one consecutive-failure counter per
//! [`CommandCategory`]. A category that reaches the threshold is frozen and
//! further calls in it are skipped without spawning anything. "Binary not
//! found" in any category disables every category, because they share one tool.
//!
//! ## Guarantees
//! - Atomic: all counters sit behind one mutex, so concurrent ticks for
//!   different devices never lose an update
//! - Single-shot logging: the freeze and the "not found" disable are each
//!   logged once per category
//! - No retries or queueing: a skipped call is simply skipped
//!
//! ## NOT Responsible For
//! - Deciding *what* to run (the tuning controller and disk plugin do that)

use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use super::command::{CommandExecutor, CommandOutcome};

/// Consecutive failures after which a category freezes.
pub const DEFAULT_ERROR_THRESHOLD: u32 = 3;

// ---------------------------------------------------------------------------
// Categories
// ---------------------------------------------------------------------------

/// Independent failure domains guarded by the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandCategory {
    Spindown,
    PowerMode,
}

impl CommandCategory {
    pub fn name(self) -> &'static str {
        match self {
            CommandCategory::Spindown => "spindown",
            CommandCategory::PowerMode => "power-mode",
        }
    }

    pub fn all() -> &'static [CommandCategory] {
        &[CommandCategory::Spindown, CommandCategory::PowerMode]
    }

    fn index(self) -> usize {
        match self {
            CommandCategory::Spindown => 0,
            CommandCategory::PowerMode => 1,
        }
    }
}

impl std::fmt::Display for CommandCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Counter state of one category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterState {
    /// Consecutive failures so far (below the threshold).
    Counting(u32),
    /// Threshold reached; no further attempts.
    Frozen,
    /// Tool missing; no further attempts for the process lifetime.
    Disabled,
}

impl CounterState {
    fn is_frozen(self) -> bool {
        !matches!(self, CounterState::Counting(_))
    }
}

// ---------------------------------------------------------------------------
// CircuitBreaker
// ---------------------------------------------------------------------------

/// Failure-counting guard around a shared executor.
pub struct CircuitBreaker {
    executor: Arc<dyn CommandExecutor>,
    threshold: u32,
    counters: Mutex<[CounterState; 2]>,
}

impl CircuitBreaker {
    /// A zero threshold is treated as 1.
    pub fn new(executor: Arc<dyn CommandExecutor>, threshold: u32) -> Self {
        Self {
            executor,
            threshold: threshold.max(1),
            counters: Mutex::new([CounterState::Counting(0); 2]),
        }
    }

    /// The wrapped executor, for unguarded status queries.
    pub fn executor(&self) -> &Arc<dyn CommandExecutor> {
        &self.executor
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn state(&self, category: CommandCategory) -> CounterState {
        self.counters
            .lock()
            .map(|c| c[category.index()])
            .unwrap_or(CounterState::Disabled)
    }

    /// Whether calls in `category` are currently skipped.
    pub fn is_frozen(&self, category: CommandCategory) -> bool {
        self.state(category).is_frozen()
    }

    /// Consecutive failure count; frozen/disabled categories report the threshold.
    pub fn failures(&self, category: CommandCategory) -> u32 {
        match self.state(category) {
            CounterState::Counting(n) => n,
            CounterState::Frozen | CounterState::Disabled => self.threshold,
        }
    }

    /// Whether the shared tool was reported missing.
    pub fn is_disabled(&self) -> bool {
        self.state(CommandCategory::Spindown) == CounterState::Disabled
    }

    /// Run `argv` in `category`, or return `None` without running it when the
    /// category is frozen.
    pub fn execute(&self, category: CommandCategory, argv: &[String]) -> Option<CommandOutcome> {
        if self.is_frozen(category) {
            return None;
        }
        let outcome = self.executor.execute(argv);
        self.record(category, &outcome);
        Some(outcome)
    }

    /// Fold one outcome into the counters.
    pub fn record(&self, category: CommandCategory, outcome: &CommandOutcome) {
        let Ok(mut counters) = self.counters.lock() else {
            return;
        };
        let idx = category.index();
        let CounterState::Counting(count) = counters[idx] else {
            return;
        };
        match outcome {
            CommandOutcome::Success { .. } => counters[idx] = CounterState::Counting(0),
            CommandOutcome::NotFound => {
                *counters = [CounterState::Disabled; 2];
                warn!("power-management tool not found, ignoring future spindown / power-mode commands");
            }
            CommandOutcome::Failed { code, message } => {
                let count = count + 1;
                if count >= self.threshold {
                    counters[idx] = CounterState::Frozen;
                    info!(
                        category = %category,
                        code,
                        message = %message,
                        "disabling {} command: too many consecutive errors",
                        category
                    );
                } else {
                    counters[idx] = CounterState::Counting(count);
                }
            }
        }
    }

    /// Disable every category, as if the tool had been reported missing.
    pub fn disable_all(&self) {
        if let Ok(mut counters) = self.counters.lock() {
            if counters.iter().all(|c| *c == CounterState::Disabled) {
                return;
            }
            *counters = [CounterState::Disabled; 2];
            warn!("power-management tool not found, ignoring future spindown / power-mode commands");
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("threshold", &self.threshold)
            .field("counters", &self.counters)
            .finish()
    }
}
