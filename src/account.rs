//! Account state machine
//!
//! [`AccountRuntime`] owns the mutable state of one watched account: its
//! lifecycle [`Phase`], the moved-message counter, the last error and the two
//! session slots. The descriptor stays an immutable `Arc<AccountConfig>`.
//!
//! Phase flow: `Initial -> Connecting -> Connected -> Watching <-> Handling`,
//! and `Shutdown -> Initial` when a run is torn down. Which session slots are
//! filled follows from the phase:
//!
//! | Phase | `command` | `notify` |
//! |---|---|---|
//! | Initial | none | none |
//! | Connecting | transient validation session | opened during setup |
//! | Connected | none | selected for notifications |
//! | Watching | none | held by the watcher task |
//! | Handling | open for the cycle | held by the watcher task |
//! | Shutdown | being closed | being closed |

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AccountConfig;
use crate::errors::{AppError, AppResult};
use crate::metrics::AccountMetrics;
use crate::pipeline;
use crate::session::{Connector, MailSession, SelectMode};
use crate::watcher::{ChangeQueue, NotificationWatcher, WatchSignal};

/// Lifecycle phase of an account run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    Initial = 0,
    Connecting = 1,
    Connected = 2,
    Watching = 3,
    Handling = 4,
    Shutdown = 5,
}

impl Phase {
    /// Numeric code exported as the phase gauge
    pub fn code(self) -> i64 {
        i64::from(self as u8)
    }

    fn from_code(code: u8) -> Self {
        match code {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Watching,
            4 => Self::Handling,
            5 => Self::Shutdown,
            _ => Self::Initial,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Watching => "watching",
            Self::Handling => "handling",
            Self::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared view of an account's phase
///
/// Written only by the account's own task; clones let the supervisor and
/// tests observe it. Every change is mirrored into the phase gauge.
#[derive(Clone)]
pub struct PhaseCell {
    code: Arc<AtomicU8>,
    metrics: AccountMetrics,
}

impl PhaseCell {
    fn new(metrics: AccountMetrics) -> Self {
        metrics.set_phase(Phase::Initial.code());
        Self {
            code: Arc::new(AtomicU8::new(Phase::Initial as u8)),
            metrics,
        }
    }

    pub fn get(&self) -> Phase {
        Phase::from_code(self.code.load(Ordering::Acquire))
    }

    fn set(&self, phase: Phase) {
        self.code.store(phase as u8, Ordering::Release);
        self.metrics.set_phase(phase.code());
        debug!(%phase, "phase changed");
    }

    /// Enter `phase` until the returned guard is dropped
    fn enter(&self, phase: Phase) -> PhaseGuard {
        let previous = self.get();
        self.set(phase);
        PhaseGuard {
            cell: self.clone(),
            previous,
        }
    }
}

/// Restores the phase that was current before [`PhaseCell::enter`]
#[must_use = "the phase is restored when the guard is dropped"]
struct PhaseGuard {
    cell: PhaseCell,
    previous: Phase,
}

impl Drop for PhaseGuard {
    fn drop(&mut self) {
        self.cell.set(self.previous);
    }
}

/// Result of a handle cycle that did not end the run
#[derive(Debug)]
pub enum CycleOutcome {
    Completed { moved: u64 },
    Failed(AppError),
}

fn cancelled() -> AppError {
    AppError::Cancelled("account run cancelled".to_owned())
}

/// Mutable runtime state of one account
pub struct AccountRuntime<C: Connector> {
    account: Arc<AccountConfig>,
    connector: C,
    metrics: AccountMetrics,
    phase: PhaseCell,
    moved: u64,
    last_error: Option<AppError>,
    command: Option<C::Session>,
    notify: Option<C::Session>,
    changes: Option<ChangeQueue>,
}

impl<C: Connector> AccountRuntime<C> {
    pub fn new(account: Arc<AccountConfig>, connector: C, metrics: AccountMetrics) -> Self {
        Self {
            phase: PhaseCell::new(metrics.clone()),
            account,
            connector,
            metrics,
            moved: 0,
            last_error: None,
            command: None,
            notify: None,
            changes: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase.get()
    }

    /// Handle to observe the phase while the runtime is borrowed by a run
    #[cfg(test)]
    pub fn phase_cell(&self) -> PhaseCell {
        self.phase.clone()
    }

    /// Messages moved since the runtime was created
    pub fn moved(&self) -> u64 {
        self.moved
    }

    pub fn last_error(&self) -> Option<&AppError> {
        self.last_error.as_ref()
    }

    /// Run the full lifecycle until the watcher ends, a fatal error occurs,
    /// or `cancel` fires
    ///
    /// Setup failures return with the phase left at `Connecting` and any
    /// opened session released. Otherwise the run is torn down through
    /// [`AccountRuntime::close`] before returning; a cleanup error is only
    /// reported when nothing failed earlier.
    pub async fn run(&mut self, cancel: &CancellationToken) -> AppResult<()> {
        let started = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(cancelled()),
            started = self.init() => started,
        };
        if let Err(err) = started {
            let released = self.release().await;
            return self.finish(Err(err), released);
        }

        let watched = self.watch(cancel).await;
        let closed = self.close().await;
        self.finish(watched, closed)
    }

    fn finish(&mut self, result: AppResult<()>, cleanup: AppResult<()>) -> AppResult<()> {
        let result = keep_first(result, cleanup);
        if let Err(err) = &result {
            if !err.is_cancelled() {
                self.last_error = Some(err.clone());
            }
        }
        result
    }

    /// Prove the credentials with a throwaway command session, then open and
    /// select the notify session
    pub async fn init(&mut self) -> AppResult<()> {
        let phase = self.phase.get();
        if phase != Phase::Initial {
            return Err(AppError::Conflict(format!("cannot start account in phase {phase}")));
        }
        self.phase.set(Phase::Connecting);
        info!(host = %self.account.host, "connecting");

        self.command = Some(self.connector.open().await?);
        close_session(&mut self.command).await?;

        let notify = self.notify.insert(self.connector.open().await?);
        notify
            .select(&self.account.mailbox, SelectMode::Watch)
            .await?;
        self.changes = Some(ChangeQueue::primed());

        self.phase.set(Phase::Connected);
        info!(mailbox = %self.account.mailbox, "connected");
        Ok(())
    }

    /// Hand the notify session to a watcher and run a handle cycle for every
    /// change until the watcher ends or `cancel` fires
    pub async fn watch(&mut self, cancel: &CancellationToken) -> AppResult<()> {
        let phase = self.phase.get();
        if phase != Phase::Connected {
            return Err(AppError::Conflict(format!("cannot watch in phase {phase}")));
        }
        let (Some(session), Some(changes)) = (self.notify.take(), self.changes.take()) else {
            return Err(AppError::Internal("notify session is not open".to_owned()));
        };

        self.phase.set(Phase::Watching);
        let mut watcher =
            NotificationWatcher::spawn(session, changes, self.account.idle_fallback(), cancel);

        let ended = loop {
            let signal = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Err(cancelled()),
                signal = watcher.next() => signal,
            };
            match signal {
                WatchSignal::Changed => match self.handle(cancel).await {
                    Ok(CycleOutcome::Completed { moved }) => debug!(moved, "resuming watch"),
                    Ok(CycleOutcome::Failed(err)) => {
                        debug!(error = %err, "resuming watch after failed cycle")
                    }
                    Err(err) => break Err(err),
                },
                WatchSignal::Exited(exit) => break Ok(exit),
            }
        };

        let (stopped, changes) = watcher.stop().await;
        self.changes = Some(changes);
        match ended {
            Ok(exit) => {
                self.notify = exit.session;
                info!("watcher ended");
                if cancel.is_cancelled() {
                    return Err(cancelled());
                }
                exit.result
            }
            Err(err) => {
                self.notify = stopped.session;
                Err(err)
            }
        }
    }

    /// Run one handle cycle on a fresh command session
    ///
    /// Pipeline errors fail only the cycle and are reported as
    /// [`CycleOutcome::Failed`]. Failing to open the command session and
    /// cancellation are returned as errors and end the run. The phase is back
    /// to `Watching` on every exit path.
    pub async fn handle(&mut self, cancel: &CancellationToken) -> AppResult<CycleOutcome> {
        let phase = self.phase.get();
        if phase != Phase::Watching {
            return Err(AppError::Conflict(format!("cannot handle in phase {phase}")));
        }
        let _handling = self.phase.enter(Phase::Handling);

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled()),
            opened = self.connector.open() => opened,
        };
        let session = self.command.insert(opened?);

        let before = self.moved;
        let cycle = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(cancelled()),
            result = pipeline::run(
                session,
                &self.account.mailbox,
                self.account.action.as_ref(),
                &mut self.moved,
                &self.metrics,
            ) => result,
        };
        let closed = close_session(&mut self.command).await;
        let moved = self.moved - before;

        match keep_first(cycle, closed) {
            Ok(()) => {
                self.metrics.cycle_finished(true);
                info!(moved, total = self.moved, "handle cycle finished");
                Ok(CycleOutcome::Completed { moved })
            }
            Err(err) if err.is_cancelled() => Err(err),
            Err(err) => {
                self.metrics.cycle_finished(false);
                warn!(error = %err, moved, "handle cycle failed");
                self.last_error = Some(err.clone());
                Ok(CycleOutcome::Failed(err))
            }
        }
    }

    /// Close the notify session, then the command session, and reset the
    /// phase so the runtime can be started again
    pub async fn close(&mut self) -> AppResult<()> {
        self.phase.set(Phase::Shutdown);
        let result = self.release().await;
        self.phase.set(Phase::Initial);
        info!("closed");
        result
    }

    async fn release(&mut self) -> AppResult<()> {
        self.changes = None;
        let notify = close_session(&mut self.notify).await;
        let command = close_session(&mut self.command).await;
        keep_first(notify, command)
    }
}

/// Log out the session in `slot`, if any; the slot is cleared first
async fn close_session<S: MailSession>(slot: &mut Option<S>) -> AppResult<()> {
    match slot.take() {
        Some(session) => session.logout().await,
        None => Ok(()),
    }
}

/// Combine a result with a later cleanup result, keeping the earlier error
fn keep_first(result: AppResult<()>, cleanup: AppResult<()>) -> AppResult<()> {
    match (result, cleanup) {
        (Err(err), Err(cleanup)) => {
            warn!(error = %cleanup, "cleanup failed after an earlier error");
            Err(err)
        }
        (result, cleanup) => result.and(cleanup),
    }
}

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;

    use super::{AccountRuntime, Phase, PhaseCell, keep_first};
    use crate::config::MoveAction;
    use crate::errors::AppError;
    use crate::metrics::Metrics;
    use crate::session::IdleEvent;
    use crate::session::fake::{FakeConnector, account, message, server_with_inbox};

    fn runtime(
        connector: &FakeConnector,
        action: Option<MoveAction>,
    ) -> (AccountRuntime<FakeConnector>, Metrics) {
        let metrics = Metrics::new().expect("registry");
        let runtime = AccountRuntime::new(
            account("home", action),
            connector.clone(),
            metrics.account("home"),
        );
        (runtime, metrics)
    }

    fn move_to(template: &str) -> Option<MoveAction> {
        Some(MoveAction {
            template: template.to_owned(),
            timestamp: false,
        })
    }

    async fn until(mut condition: impl FnMut() -> bool) {
        for _ in 0..10_000 {
            if condition() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn phase_guard_restores_previous_phase() {
        let metrics = Metrics::new().expect("registry");
        let cell = PhaseCell::new(metrics.account("a"));
        cell.set(Phase::Watching);
        {
            let _guard = cell.enter(Phase::Handling);
            assert_eq!(cell.get(), Phase::Handling);
        }
        assert_eq!(cell.get(), Phase::Watching);
        let text = metrics.render().expect("render");
        assert!(text.contains("smartmail_account_phase{account=\"a\"} 3"));
    }

    #[tokio::test]
    async fn init_validates_then_selects_notify_session() {
        let connector = FakeConnector::new(server_with_inbox(Vec::new()));
        let (mut runtime, _metrics) = runtime(&connector, None);

        runtime.init().await.expect("init");
        assert_eq!(runtime.phase(), Phase::Connected);
        connector.with(|s| {
            assert_eq!(s.opened, 2);
            assert_eq!(s.open_now, 1);
        });

        let err = runtime.init().await.expect_err("must fail");
        assert!(matches!(err, AppError::Conflict(_)));

        runtime.close().await.expect("close");
        assert_eq!(runtime.phase(), Phase::Initial);
        connector.with(|s| assert_eq!(s.open_now, 0));
        runtime.close().await.expect("second close is a no-op");
    }

    #[tokio::test]
    async fn setup_failure_leaves_phase_connecting() {
        let connector = FakeConnector::new(server_with_inbox(Vec::new()));
        connector.with(|s| s.opens_allowed = Some(1));
        let (mut runtime, _metrics) = runtime(&connector, None);

        let err = runtime
            .run(&CancellationToken::new())
            .await
            .expect_err("must fail");
        assert!(err.to_string().contains("connection refused"));
        assert_eq!(runtime.phase(), Phase::Connecting);
        assert!(runtime.last_error().is_some());
        connector.with(|s| assert_eq!(s.open_now, 0));
    }

    #[tokio::test]
    async fn missing_mailbox_releases_notify_session() {
        let connector = FakeConnector::new(Default::default());
        let (mut runtime, _metrics) = runtime(&connector, None);

        let err = runtime
            .run(&CancellationToken::new())
            .await
            .expect_err("must fail");
        assert!(matches!(err, AppError::NotFound(_)));
        assert_eq!(runtime.phase(), Phase::Connecting);
        connector.with(|s| assert_eq!(s.open_now, 0));
    }

    #[tokio::test]
    async fn cancel_while_watching_closes_both_sessions() {
        let connector = FakeConnector::new(server_with_inbox(vec![message(1, &[])]));
        connector.with(|s| {
            s.mailboxes.insert("Done".to_owned(), Vec::new());
        });
        let (mut runtime, metrics) = runtime(&connector, move_to("Done"));
        let phase = runtime.phase_cell();
        let cancel = CancellationToken::new();

        let (result, ()) = tokio::join!(runtime.run(&cancel), async {
            until(|| connector.with(|s| s.fetches == 1) && phase.get() == Phase::Watching).await;
            cancel.cancel();
        });

        let err = result.expect_err("must be cancelled");
        assert!(err.is_cancelled());
        assert_eq!(runtime.phase(), Phase::Initial);
        assert_eq!(runtime.moved(), 1);
        assert!(runtime.last_error().is_none());
        connector.with(|s| {
            assert_eq!(s.fetches, 1);
            assert_eq!(s.open_now, 0);
            assert_eq!(s.max_open, 2);
        });
        let text = metrics.render().expect("render");
        assert!(text.contains("smartmail_messages_moved_total{account=\"home\"} 1"));
        assert!(text.contains("smartmail_account_phase{account=\"home\"} 0"));
    }

    #[tokio::test]
    async fn failed_cycle_returns_to_watching() {
        let connector = FakeConnector::new(server_with_inbox(vec![message(1, &[])]));
        connector.with(|s| s.fail_move = true);
        let (mut runtime, metrics) = runtime(&connector, move_to("Done"));
        let phase = runtime.phase_cell();
        let cancel = CancellationToken::new();

        let (result, ()) = tokio::join!(runtime.run(&cancel), async {
            until(|| connector.with(|s| s.fetches == 1) && phase.get() == Phase::Watching).await;
            let text = metrics.render().expect("render");
            assert!(text.contains(
                "smartmail_handle_cycles_total{account=\"home\",outcome=\"error\"} 1"
            ));
            cancel.cancel();
        });

        assert!(result.expect_err("must be cancelled").is_cancelled());
        assert_eq!(runtime.moved(), 0);
        let last = runtime.last_error().expect("cycle error recorded");
        assert!(last.to_string().contains("UID MOVE failed"));
        connector.with(|s| assert_eq!(s.open_now, 0));
    }

    #[tokio::test]
    async fn changes_trigger_further_cycles() {
        let connector = FakeConnector::new(server_with_inbox(Vec::new()));
        let (mut runtime, _metrics) = runtime(&connector, None);
        let phase = runtime.phase_cell();
        let cancel = CancellationToken::new();

        let (result, ()) = tokio::join!(runtime.run(&cancel), async {
            until(|| connector.with(|s| s.opened == 3) && phase.get() == Phase::Watching).await;
            connector.with(|s| s.mailboxes.insert("INBOX".to_owned(), vec![message(9, &[])]));
            connector.push_idle(Ok(IdleEvent::Renewed));
            connector.push_idle(Ok(IdleEvent::Changed));
            until(|| connector.with(|s| s.fetches == 1) && phase.get() == Phase::Watching).await;
            cancel.cancel();
        });

        assert!(result.expect_err("must be cancelled").is_cancelled());
        connector.with(|s| {
            assert_eq!(s.opened, 4);
            assert_eq!(s.max_open, 2);
        });
    }

    #[tokio::test]
    async fn watcher_failure_ends_the_run() {
        let connector = FakeConnector::new(server_with_inbox(Vec::new()));
        let (mut runtime, _metrics) = runtime(&connector, None);
        connector.push_idle(Err(AppError::Internal("connection reset".to_owned())));

        let err = runtime
            .run(&CancellationToken::new())
            .await
            .expect_err("must fail");
        assert!(err.to_string().contains("connection reset"));
        assert_eq!(runtime.phase(), Phase::Initial);
        assert!(runtime.last_error().is_some());
        connector.with(|s| assert_eq!(s.open_now, 0));
    }

    #[tokio::test]
    async fn failing_to_open_command_session_is_fatal() {
        let connector = FakeConnector::new(server_with_inbox(Vec::new()));
        connector.with(|s| s.opens_allowed = Some(2));
        let (mut runtime, _metrics) = runtime(&connector, None);

        let err = runtime
            .run(&CancellationToken::new())
            .await
            .expect_err("must fail");
        assert!(err.to_string().contains("connection refused"));
        assert_eq!(runtime.phase(), Phase::Initial);
        connector.with(|s| assert_eq!(s.open_now, 0));
    }

    #[tokio::test]
    async fn validation_logout_failure_is_a_setup_error() {
        let connector = FakeConnector::new(server_with_inbox(Vec::new()));
        connector.with(|s| s.fail_logout = true);
        let (mut runtime, _metrics) = runtime(&connector, None);

        let err = runtime
            .run(&CancellationToken::new())
            .await
            .expect_err("must fail");
        assert!(err.to_string().contains("LOGOUT failed"));
        assert_eq!(runtime.phase(), Phase::Connecting);
        connector.with(|s| assert_eq!(s.opened, 1));
    }

    #[test]
    fn cleanup_error_never_replaces_earlier_error() {
        let first = AppError::Internal("fetch".to_owned());
        let cleanup = AppError::Internal("logout".to_owned());

        let kept = keep_first(Err(first), Err(cleanup.clone())).expect_err("must fail");
        assert!(kept.to_string().contains("fetch"));
        let reported = keep_first(Ok(()), Err(cleanup)).expect_err("must fail");
        assert!(reported.to_string().contains("logout"));
        keep_first(Ok(()), Ok(())).expect("both succeeded");
    }
}
