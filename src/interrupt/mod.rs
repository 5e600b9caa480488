//! Interrupt handling
//!
//! Tracks escalating interrupt levels. The engine only reads interrupt
//! status; it never raises interrupts itself. [`ProgressSignal`] carries
//! on-demand progress report requests, which never interrupt anything.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::parallel::ParallelClient;

/// Interrupt severity, escalating one step per interrupt
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptLevel {
    #[default]
    Uninterrupted,
    /// Finish the current node, skip remaining specs, still run cleanup and reporting
    CleanupAndReport,
    /// Skip cleanup too, still run reporting
    ReportOnly,
    /// Terminate now, skip cleanup and reporting
    BailOut,
}

impl InterruptLevel {
    fn escalate(self) -> Self {
        match self {
            InterruptLevel::Uninterrupted => InterruptLevel::CleanupAndReport,
            InterruptLevel::CleanupAndReport => InterruptLevel::ReportOnly,
            InterruptLevel::ReportOnly | InterruptLevel::BailOut => InterruptLevel::BailOut,
        }
    }
}

/// What raised the interrupt
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptCause {
    #[default]
    Invalid,
    Signal,
    AbortByOtherProcess,
}

impl fmt::Display for InterruptCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterruptCause::Invalid => write!(f, "INVALID_INTERRUPT_CAUSE"),
            InterruptCause::Signal => write!(f, "Interrupted by User"),
            InterruptCause::AbortByOtherProcess => write!(f, "Interrupted by Other Process"),
        }
    }
}

/// Snapshot of the interrupt state
#[derive(Clone, Debug)]
pub struct InterruptStatus {
    pub level: InterruptLevel,
    pub cause: InterruptCause,
    /// Cancelled when the next interrupt arrives
    pub channel: CancellationToken,
}

impl InterruptStatus {
    pub fn uninterrupted() -> Self {
        Self {
            level: InterruptLevel::Uninterrupted,
            cause: InterruptCause::Invalid,
            channel: CancellationToken::new(),
        }
    }

    pub fn interrupted(&self) -> bool {
        self.level != InterruptLevel::Uninterrupted
    }

    pub fn message(&self) -> String {
        self.cause.to_string()
    }

    pub fn should_include_progress_report(&self) -> bool {
        self.cause != InterruptCause::AbortByOtherProcess
    }

    /// Resolves when the next interrupt arrives
    pub async fn arrived(&self) {
        self.channel.cancelled().await;
    }
}

/// Source of interrupt status consumed by the engine
pub trait InterruptSource: Send + Sync {
    fn status(&self) -> InterruptStatus;
}

#[derive(Debug)]
struct HandlerState {
    level: InterruptLevel,
    cause: InterruptCause,
    channel: CancellationToken,
}

/// Interrupt handler escalating on every interrupt it receives
#[derive(Debug)]
pub struct InterruptHandler {
    state: Mutex<HandlerState>,
}

impl InterruptHandler {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HandlerState {
                level: InterruptLevel::Uninterrupted,
                cause: InterruptCause::Invalid,
                channel: CancellationToken::new(),
            }),
        }
    }

    /// Record an interrupt and wake everyone waiting on the current status
    pub fn interrupt(&self, cause: InterruptCause) {
        let mut state = self.state.lock();
        if state.cause == InterruptCause::Invalid {
            state.cause = cause;
        }
        state.level = state.level.escalate();
        warn!(level = ?state.level, cause = %cause, "interrupt received");
        let previous = std::mem::replace(&mut state.channel, CancellationToken::new());
        previous.cancel();
    }

    /// Another process asked the suite to abort
    pub fn abort_by_other_process(&self) {
        let mut state = self.state.lock();
        if state.level != InterruptLevel::Uninterrupted {
            return;
        }
        state.level = InterruptLevel::CleanupAndReport;
        state.cause = InterruptCause::AbortByOtherProcess;
        let previous = std::mem::replace(&mut state.channel, CancellationToken::new());
        previous.cancel();
    }

    /// Escalate on every ctrl-c until the process exits
    pub fn listen_for_signals(self: &Arc<Self>) -> JoinHandle<()> {
        let handler = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!("Failed to listen for interrupt signal: {}", e);
                    break;
                }
                handler.interrupt(InterruptCause::Signal);
            }
        })
    }

    /// Poll the parallel client and interrupt once another process aborts
    pub fn watch_for_abort(
        self: &Arc<Self>,
        client: Arc<dyn ParallelClient>,
        interval: Duration,
    ) -> JoinHandle<()> {
        let handler = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if client.should_abort().await {
                    debug!("abort requested by another process");
                    handler.abort_by_other_process();
                    break;
                }
            }
        })
    }
}

impl Default for InterruptHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptSource for InterruptHandler {
    fn status(&self) -> InterruptStatus {
        let state = self.state.lock();
        InterruptStatus {
            level: state.level,
            cause: state.cause,
            channel: state.channel.clone(),
        }
    }
}

/// Requests for a progress report of whatever is running right now
///
/// A request made while no node runs is kept and answered by the next node.
#[derive(Debug, Default)]
pub struct ProgressSignal {
    requested: Notify,
}

impl ProgressSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.requested.notify_one();
    }

    /// Resolves on the next request
    pub async fn requested(&self) {
        self.requested.notified().await;
    }

    /// Request a report on every SIGUSR1
    #[cfg(unix)]
    pub fn listen_for_signals(self: &Arc<Self>) -> JoinHandle<()> {
        use tokio::signal::unix::{signal, SignalKind};

        let progress = Arc::clone(self);
        tokio::spawn(async move {
            let mut signals = match signal(SignalKind::user_defined1()) {
                Ok(signals) => signals,
                Err(e) => {
                    warn!("Failed to listen for progress signal: {}", e);
                    return;
                }
            };
            while signals.recv().await.is_some() {
                debug!("progress report requested");
                progress.request();
            }
        })
    }
}
