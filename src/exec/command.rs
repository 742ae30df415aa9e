//! # Stage: Command Executor
//!
//! ## Responsibility
//! Runs an external (usually privileged) command and classifies the result as
//! success, "binary not found", or any other failure.
//!
//! ## Guarantees
//! - Never panics and never returns `Err`: expected failure classes are values
//! - Blocking: callers run it from the blocking pool, never from the hotplug path
//!
//! ## NOT Responsible For
//! - Counting failures or deciding whether to retry (that is the breaker)

use std::collections::VecDeque;
use std::io::ErrorKind;
use std::process::Command;
use std::sync::Mutex;

use tracing::debug;

// ---------------------------------------------------------------------------
// CommandOutcome
// ---------------------------------------------------------------------------

/// Classified result of one command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Exit status 0.
    Success { stdout: String },
    /// The binary does not exist.
    NotFound,
    /// Non-zero exit, killed by a signal, or a spawn error other than "not found".
    Failed { code: i32, message: String },
}

impl CommandOutcome {
    pub fn success(stdout: impl Into<String>) -> Self {
        CommandOutcome::Success { stdout: stdout.into() }
    }

    pub fn failed(code: i32, message: impl Into<String>) -> Self {
        CommandOutcome::Failed { code, message: message.into() }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, CommandOutcome::Success { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CommandOutcome::NotFound)
    }

    /// Captured stdout, empty unless the command succeeded.
    pub fn stdout(&self) -> &str {
        match self {
            CommandOutcome::Success { stdout } => stdout,
            _ => "",
        }
    }
}

impl std::fmt::Display for CommandOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandOutcome::Success { .. } => write!(f, "success"),
            CommandOutcome::NotFound => write!(f, "command not found"),
            CommandOutcome::Failed { code, message } => write!(f, "exit {code}: {message}"),
        }
    }
}

// ---------------------------------------------------------------------------
// CommandExecutor trait
// ---------------------------------------------------------------------------

/// Something that can run an argv and report a [`CommandOutcome`].
pub trait CommandExecutor: Send + Sync {
    /// Run `argv[0]` with the remaining arguments. An empty argv is a failure.
    fn execute(&self, argv: &[String]) -> CommandOutcome;
}

/// Executor backed by [`std::process::Command`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemExecutor;

impl CommandExecutor for SystemExecutor {
    fn execute(&self, argv: &[String]) -> CommandOutcome {
        let Some((program, args)) = argv.split_first() else {
            return CommandOutcome::failed(-1, "empty command line");
        };
        debug!(command = %argv.join(" "), "executing");
        match Command::new(program).args(args).output() {
            Ok(output) if output.status.success() => {
                CommandOutcome::success(String::from_utf8_lossy(&output.stdout))
            }
            Ok(output) => CommandOutcome::failed(
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ),
            Err(e) if e.kind() == ErrorKind::NotFound => CommandOutcome::NotFound,
            Err(e) => CommandOutcome::failed(-1, e.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// ScriptedExecutor: in-memory executor for tests and dry runs
// ---------------------------------------------------------------------------

type Responder = Box<dyn Fn(&[String]) -> Option<CommandOutcome> + Send + Sync>;

/// In-memory executor that never spawns anything.
///
/// Outcomes come from, in order: the queue of one-shot outcomes pushed with
/// [`push`](Self::push), then the responder installed with
/// [`respond_with`](Self::respond_with), then the default outcome (success
/// with empty output). Every invocation is recorded.
#[derive(Default)]
pub struct ScriptedExecutor {
    queued: Mutex<VecDeque<CommandOutcome>>,
    responder: Mutex<Option<Responder>>,
    calls: Mutex<Vec<Vec<String>>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a one-shot outcome for the next call.
    pub fn push(&self, outcome: CommandOutcome) {
        if let Ok(mut q) = self.queued.lock() {
            q.push_back(outcome);
        }
    }

    /// Install a responder consulted when the queue is empty. Returning `None`
    /// falls through to the default success.
    pub fn respond_with<F>(&self, f: F)
    where
        F: Fn(&[String]) -> Option<CommandOutcome> + Send + Sync + 'static,
    {
        if let Ok(mut r) = self.responder.lock() {
            *r = Some(Box::new(f));
        }
    }

    /// All recorded invocations, oldest first.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Recorded invocations whose argv contains `arg`.
    pub fn calls_with(&self, arg: &str) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter(|argv| argv.iter().any(|a| a == arg))
            .collect()
    }

    pub fn clear_calls(&self) {
        if let Ok(mut c) = self.calls.lock() {
            c.clear();
        }
    }
}

impl CommandExecutor for ScriptedExecutor {
    fn execute(&self, argv: &[String]) -> CommandOutcome {
        if let Ok(mut c) = self.calls.lock() {
            c.push(argv.to_vec());
        }
        if let Some(outcome) = self.queued.lock().ok().and_then(|mut q| q.pop_front()) {
            return outcome;
        }
        if let Ok(r) = self.responder.lock() {
            if let Some(outcome) = r.as_ref().and_then(|f| f(argv)) {
                return outcome;
            }
        }
        CommandOutcome::success("")
    }
}

/// Build an argv from string-ish parts.
pub fn argv<I, S>(parts: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    parts.into_iter().map(Into::into).collect()
}
