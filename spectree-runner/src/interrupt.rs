// Copyright (c) The spectree Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interrupt handling for suite runs.
//!
//! An [`InterruptHandler`] watches for process signals, the optional
//! suite-wide timeout, and externally requested aborts, and folds them
//! into an escalating interrupt level. Consumers take a snapshot of the
//! current [`InterruptStatus`] and await its cancellation token; when an
//! interrupt fires, the token is cancelled and replaced with a fresh one,
//! so waiters registered afterwards only wake on the next, more severe
//! interrupt.
//!
//! A suite-timeout interrupt re-fires periodically (a tenth of the
//! timeout, capped at 30 seconds) so that cleanup which itself hangs gets
//! escalated instead of wedging the worker forever.

use crate::errors::InterruptSetupError;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

const REPEAT_TIMEOUT_MAXIMUM_INTERVAL: Duration = Duration::from_secs(30);

/// What triggered an interrupt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InterruptCause {
    /// An interrupt or termination signal arrived.
    Signal,
    /// The configured suite timeout elapsed.
    SuiteTimeout,
    /// Another process (via the coordinator) requested an abort.
    ExternalAbort,
}

/// How much of the run should still happen, from least to most severe.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum InterruptLevel {
    /// No interrupt has fired.
    Uninterrupted,
    /// Stop scheduling specs; run cleanup nodes and report.
    CleanupAndReport,
    /// Skip remaining cleanup; emit the report and exit.
    ReportOnly,
    /// Exit as fast as possible.
    BailOut,
}

/// A point-in-time view of the interrupt state.
///
/// The token is cancelled when the *next* interrupt fires; cause and
/// level describe interrupts that have already fired.
#[derive(Clone, Debug)]
pub struct InterruptStatus {
    /// The most recent trigger, if any.
    pub cause: Option<InterruptCause>,
    /// The current escalation level.
    pub level: InterruptLevel,
    /// Cancelled by the next interrupt.
    pub token: CancellationToken,
}

impl InterruptStatus {
    /// True once any interrupt has fired.
    pub fn interrupted(&self) -> bool {
        self.level > InterruptLevel::Uninterrupted
    }
}

/// The kind of interrupt handling to set up for a suite run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InterruptHandlerKind {
    /// Watch process signals (and the suite timeout, when configured).
    Standard,
    /// Never fires on its own. Useful for tests; external aborts still
    /// work.
    Noop,
}

#[derive(Debug)]
struct State {
    cause: Option<InterruptCause>,
    count: u32,
    token: CancellationToken,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
}

impl Shared {
    fn trigger(&self, cause: InterruptCause) {
        let mut state = self.state.lock().expect("interrupt state lock poisoned");
        state.cause = Some(cause);
        state.count += 1;
        // Close-and-replace: wake everyone waiting on the current token,
        // then install a fresh one for the next escalation.
        let previous = std::mem::replace(&mut state.token, CancellationToken::new());
        previous.cancel();
    }

    fn status(&self) -> InterruptStatus {
        let state = self.state.lock().expect("interrupt state lock poisoned");
        let level = match state.count {
            0 => InterruptLevel::Uninterrupted,
            1 => InterruptLevel::CleanupAndReport,
            2 => InterruptLevel::ReportOnly,
            _ => InterruptLevel::BailOut,
        };
        InterruptStatus {
            cause: state.cause,
            level,
            token: state.token.clone(),
        }
    }
}

/// Watches for interrupts and escalates on repeated triggers.
#[derive(Debug)]
pub struct InterruptHandler {
    shared: Arc<Shared>,
    monitor: Option<JoinHandle<()>>,
}

impl InterruptHandler {
    /// Installs the handler. Must be called within a tokio runtime; the
    /// standard kind spawns a background task watching signals and the
    /// suite timeout.
    pub fn new(
        kind: InterruptHandlerKind,
        suite_timeout: Option<Duration>,
    ) -> Result<Self, InterruptSetupError> {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                cause: None,
                count: 0,
                token: CancellationToken::new(),
            }),
        });
        let monitor = match kind {
            InterruptHandlerKind::Standard => {
                let mut signals = imp::Signals::new()?;
                let shared = Arc::clone(&shared);
                Some(tokio::spawn(async move {
                    let timeout_fired = watch(&shared, &mut signals, suite_timeout).await;
                    if let Some(timeout) = timeout_fired {
                        repeat_timeout_interrupts(&shared, &mut signals, timeout).await;
                    }
                }))
            }
            InterruptHandlerKind::Noop => None,
        };
        Ok(Self { shared, monitor })
    }

    /// The current interrupt status.
    pub fn status(&self) -> InterruptStatus {
        self.shared.status()
    }

    /// Fires an interrupt as if the given cause had been observed.
    pub(crate) fn trigger(&self, cause: InterruptCause) {
        self.shared.trigger(cause);
    }
}

impl Drop for InterruptHandler {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
    }
}

/// Watches signals and the suite timeout until the timeout fires (in
/// which case its duration is returned for the repeat loop) or the signal
/// streams close.
async fn watch(
    shared: &Shared,
    signals: &mut imp::Signals,
    suite_timeout: Option<Duration>,
) -> Option<Duration> {
    let timeout_sleep = async {
        match suite_timeout {
            Some(timeout) => {
                tokio::time::sleep(timeout).await;
                timeout
            }
            None => std::future::pending().await,
        }
    };
    tokio::pin!(timeout_sleep);

    loop {
        tokio::select! {
            received = signals.recv() => {
                match received {
                    Some(()) => shared.trigger(InterruptCause::Signal),
                    None => return None,
                }
            }
            timeout = &mut timeout_sleep => {
                warn!(?timeout, "suite timeout elapsed, interrupting");
                shared.trigger(InterruptCause::SuiteTimeout);
                return Some(timeout);
            }
        }
    }
}

/// After a suite timeout, keeps escalating so stuck cleanup cannot wedge
/// the worker. Signals keep escalating too.
async fn repeat_timeout_interrupts(
    shared: &Shared,
    signals: &mut imp::Signals,
    timeout: Duration,
) {
    let interval = (timeout / 10).min(REPEAT_TIMEOUT_MAXIMUM_INTERVAL);
    loop {
        tokio::select! {
            received = signals.recv() => {
                match received {
                    Some(()) => shared.trigger(InterruptCause::Signal),
                    None => return,
                }
            }
            _ = tokio::time::sleep(interval) => {
                shared.trigger(InterruptCause::SuiteTimeout);
            }
        }
    }
}

#[cfg(unix)]
mod imp {
    use super::InterruptSetupError;
    use tokio::signal::unix::{Signal, SignalKind, signal};

    /// SIGINT, SIGTERM and SIGHUP on Unix.
    #[derive(Debug)]
    pub(super) struct Signals {
        sigint: Signal,
        sigterm: Signal,
        sighup: Signal,
    }

    impl Signals {
        pub(super) fn new() -> Result<Self, InterruptSetupError> {
            Ok(Self {
                sigint: signal(SignalKind::interrupt())?,
                sigterm: signal(SignalKind::terminate())?,
                sighup: signal(SignalKind::hangup())?,
            })
        }

        pub(super) async fn recv(&mut self) -> Option<()> {
            tokio::select! {
                received = self.sigint.recv() => received,
                received = self.sigterm.recv() => received,
                received = self.sighup.recv() => received,
            }
        }
    }
}

#[cfg(windows)]
mod imp {
    use super::InterruptSetupError;
    use tokio::signal::windows::{CtrlC, ctrl_c};

    #[derive(Debug)]
    pub(super) struct Signals {
        ctrl_c: CtrlC,
    }

    impl Signals {
        pub(super) fn new() -> Result<Self, InterruptSetupError> {
            Ok(Self { ctrl_c: ctrl_c()? })
        }

        pub(super) async fn recv(&mut self) -> Option<()> {
            self.ctrl_c.recv().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn levels_escalate_per_trigger() {
        let handler =
            InterruptHandler::new(InterruptHandlerKind::Noop, None).expect("noop installs");
        assert_eq!(handler.status().level, InterruptLevel::Uninterrupted);
        assert!(!handler.status().interrupted());

        handler.trigger(InterruptCause::Signal);
        let status = handler.status();
        assert_eq!(status.level, InterruptLevel::CleanupAndReport);
        assert_eq!(status.cause, Some(InterruptCause::Signal));

        handler.trigger(InterruptCause::Signal);
        assert_eq!(handler.status().level, InterruptLevel::ReportOnly);

        handler.trigger(InterruptCause::Signal);
        assert_eq!(handler.status().level, InterruptLevel::BailOut);
        handler.trigger(InterruptCause::Signal);
        assert_eq!(handler.status().level, InterruptLevel::BailOut);
    }

    #[tokio::test]
    async fn tokens_are_closed_and_replaced() {
        let handler =
            InterruptHandler::new(InterruptHandlerKind::Noop, None).expect("noop installs");
        let before = handler.status().token;
        assert!(!before.is_cancelled());

        handler.trigger(InterruptCause::ExternalAbort);
        assert!(before.is_cancelled());

        // The replacement token only fires on the next escalation.
        let after = handler.status().token;
        assert!(!after.is_cancelled());
        handler.trigger(InterruptCause::ExternalAbort);
        assert!(after.is_cancelled());
    }

    #[tokio::test]
    async fn waiter_wakes_on_trigger() {
        let handler =
            InterruptHandler::new(InterruptHandlerKind::Noop, None).expect("noop installs");
        let token = handler.status().token;
        let waiter = tokio::spawn(async move { token.cancelled().await });
        handler.trigger(InterruptCause::Signal);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter woke")
            .expect("waiter task succeeded");
    }

    #[tokio::test(start_paused = true)]
    async fn suite_timeout_fires_and_repeats() {
        let handler = InterruptHandler::new(
            InterruptHandlerKind::Standard,
            Some(Duration::from_secs(100)),
        )
        .expect("handler installs");

        tokio::time::sleep(Duration::from_secs(101)).await;
        // Yield so the monitor task observes the elapsed timer.
        tokio::task::yield_now().await;
        let status = handler.status();
        assert_eq!(status.cause, Some(InterruptCause::SuiteTimeout));
        assert_eq!(status.level, InterruptLevel::CleanupAndReport);

        // timeout / 10 = 10s repeat interval.
        tokio::time::sleep(Duration::from_secs(11)).await;
        tokio::task::yield_now().await;
        assert_eq!(handler.status().level, InterruptLevel::ReportOnly);
    }
}
