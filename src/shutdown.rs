//! Termination signal handling
//!
//! Every trigger (SIGINT, SIGTERM, or a listener that failed to start) is
//! routed into one [`ShutdownCoordinator`]. The first trigger moves it from
//! `Running` to `ShuttingDown`, stops the listeners and terminates every
//! supervised child; later triggers are logged and ignored.

use crate::supervisor::{ProcessSupervisor, TerminationReport};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Running,
    ShuttingDown,
    Terminated,
}

impl ShutdownPhase {
    fn as_u8(self) -> u8 {
        match self {
            ShutdownPhase::Running => 0,
            ShutdownPhase::ShuttingDown => 1,
            ShutdownPhase::Terminated => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => ShutdownPhase::Running,
            1 => ShutdownPhase::ShuttingDown,
            _ => ShutdownPhase::Terminated,
        }
    }
}

/// What started the shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownTrigger {
    Interrupt,
    Terminate,
    ListenerFailed,
}

impl fmt::Display for ShutdownTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownTrigger::Interrupt => write!(f, "SIGINT"),
            ShutdownTrigger::Terminate => write!(f, "SIGTERM"),
            ShutdownTrigger::ListenerFailed => write!(f, "listener failure"),
        }
    }
}

/// Process-level termination signals. Both handlers are registered by
/// `install`, so a signal arriving before the first `recv` is not lost.
pub struct Signals {
    #[cfg(unix)]
    sigint: tokio::signal::unix::Signal,
    #[cfg(unix)]
    sigterm: tokio::signal::unix::Signal,
}

impl Signals {
    pub fn install() -> std::io::Result<Self> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            Ok(Self {
                sigint: signal(SignalKind::interrupt())?,
                sigterm: signal(SignalKind::terminate())?,
            })
        }

        #[cfg(not(unix))]
        {
            Ok(Self {})
        }
    }

    /// Wait for the next SIGINT or SIGTERM
    pub async fn recv(&mut self) -> ShutdownTrigger {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = self.sigint.recv() => ShutdownTrigger::Interrupt,
                _ = self.sigterm.recv() => ShutdownTrigger::Terminate,
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "Failed to listen for Ctrl+C");
            }
            ShutdownTrigger::Interrupt
        }
    }
}

/// Single owner of the gateway's shutdown sequence
pub struct ShutdownCoordinator {
    supervisor: Arc<ProcessSupervisor>,
    grace_period: Duration,
    phase: AtomicU8,
    trigger: OnceLock<ShutdownTrigger>,
    listeners: watch::Sender<bool>,
    report: watch::Sender<Option<TerminationReport>>,
}

impl ShutdownCoordinator {
    pub fn new(supervisor: Arc<ProcessSupervisor>, grace_period: Duration) -> Self {
        let (listeners, _) = watch::channel(false);
        let (report, _) = watch::channel(None);
        Self {
            supervisor,
            grace_period,
            phase: AtomicU8::new(ShutdownPhase::Running.as_u8()),
            trigger: OnceLock::new(),
            listeners,
            report,
        }
    }

    /// Receiver that flips to `true` when listeners should stop accepting
    pub fn listener_shutdown(&self) -> watch::Receiver<bool> {
        self.listeners.subscribe()
    }

    pub fn phase(&self) -> ShutdownPhase {
        ShutdownPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Trigger that started the shutdown, once one has
    pub fn trigger(&self) -> Option<ShutdownTrigger> {
        self.trigger.get().copied()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.phase() != ShutdownPhase::Running
    }

    /// Report of the completed shutdown, if it has finished
    pub fn report(&self) -> Option<TerminationReport> {
        *self.report.borrow()
    }

    /// Run the shutdown sequence. Returns `None` without doing anything when
    /// a shutdown is already under way or finished.
    pub async fn shutdown(&self, trigger: ShutdownTrigger) -> Option<TerminationReport> {
        if self
            .phase
            .compare_exchange(
                ShutdownPhase::Running.as_u8(),
                ShutdownPhase::ShuttingDown.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            info!(trigger = %trigger, phase = ?self.phase(), "Already shutting down, ignoring");
            return None;
        }
        let _ = self.trigger.set(trigger);

        info!(
            trigger = %trigger,
            processes = self.supervisor.live_count(),
            grace_period_secs = self.grace_period.as_secs(),
            "Shutting down"
        );

        self.listeners.send_replace(true);

        let report = self.supervisor.terminate_all(self.grace_period).await;
        self.phase
            .store(ShutdownPhase::Terminated.as_u8(), Ordering::Release);
        self.report.send_replace(Some(report));

        info!(
            signaled = report.signaled,
            killed = report.killed,
            "All supervised processes stopped"
        );

        Some(report)
    }

    /// Wait for the first termination signal and shut down. Signals that
    /// arrive while the shutdown is running are logged and ignored.
    pub async fn run(&self, mut signals: Signals) -> TerminationReport {
        let trigger = signals.recv().await;
        info!(signal = %trigger, "Received termination signal");

        let shutdown = self.shutdown(trigger);
        tokio::pin!(shutdown);

        let report = loop {
            tokio::select! {
                report = &mut shutdown => break report,
                repeated = signals.recv() => {
                    info!(signal = %repeated, "Received signal during shutdown, ignoring");
                }
            }
        };

        // Another trigger may have won the race to start the shutdown
        match report {
            Some(report) => report,
            None => self.wait_terminated().await,
        }
    }

    /// Wait until a shutdown, started by any trigger, has finished
    pub async fn wait_terminated(&self) -> TerminationReport {
        let mut rx = self.report.subscribe();
        if let Ok(report) = rx.wait_for(Option::is_some).await {
            if let Some(report) = *report {
                return report;
            }
        }
        // The sender lives in `self`, so the channel cannot close while we wait
        TerminationReport::default()
    }
}
