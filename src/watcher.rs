//! Push-notification watcher
//!
//! The notify session is moved into a background task that repeatedly waits
//! for IDLE updates and forwards each change into a single-slot queue. A
//! change arriving while the slot is still full is coalesced: the account only
//! learns that a recheck is due, never how many changes happened.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::{AppError, AppResult};
use crate::session::{IdleEvent, MailSession};

/// The watched mailbox changed and should be rechecked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxChanged;

/// Single-slot queue of pending rechecks
#[derive(Debug)]
pub struct ChangeQueue {
    tx: mpsc::Sender<MailboxChanged>,
    rx: mpsc::Receiver<MailboxChanged>,
}

impl ChangeQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self { tx, rx }
    }

    /// A queue already holding one recheck, so the first watch cycle always
    /// looks at the mailbox
    pub fn primed() -> Self {
        let queue = Self::new();
        queue.notify();
        queue
    }

    /// Record a change; returns `false` when it was coalesced into a pending one
    pub fn notify(&self) -> bool {
        offer(&self.tx)
    }

    #[cfg(test)]
    fn try_take(&mut self) -> Option<MailboxChanged> {
        self.rx.try_recv().ok()
    }
}

impl Default for ChangeQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn offer(tx: &mpsc::Sender<MailboxChanged>) -> bool {
    match tx.try_send(MailboxChanged) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            debug!("recheck already pending, coalescing change");
            false
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

/// How the background wait ended
pub struct WatchExit<S> {
    /// The notify session, when it survived the wait
    pub session: Option<S>,
    /// `Ok` for a local stop, the transport/protocol error otherwise
    pub result: AppResult<()>,
}

/// Next thing the account has to react to
pub enum WatchSignal<S> {
    Changed,
    Exited(WatchExit<S>),
}

/// Running watcher owning the notify session
pub struct NotificationWatcher<S> {
    changes: ChangeQueue,
    task: Option<JoinHandle<WatchExit<S>>>,
    stop: CancellationToken,
}

impl<S: MailSession> NotificationWatcher<S> {
    /// Move `session` into a background wait loop feeding `changes`
    ///
    /// The wait stops when `cancel` (or [`NotificationWatcher::stop`]) fires.
    pub fn spawn(
        session: S,
        changes: ChangeQueue,
        fallback: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Self {
        let stop = cancel.child_token();
        let task = tokio::spawn(wait_loop(
            session,
            changes.tx.clone(),
            fallback,
            stop.clone(),
        ));
        Self {
            changes,
            task: Some(task),
            stop,
        }
    }

    /// Wait for the next change or for the background task to end
    ///
    /// Termination wins over a pending change: once the wait failed the
    /// account stops handling. After [`WatchSignal::Exited`] every further
    /// call returns an `Internal` exit immediately.
    pub async fn next(&mut self) -> WatchSignal<S> {
        let Some(task) = self.task.as_mut() else {
            return WatchSignal::Exited(WatchExit {
                session: None,
                result: Err(AppError::Internal("watcher already exited".to_owned())),
            });
        };

        tokio::select! {
            biased;
            joined = task => {
                self.task = None;
                WatchSignal::Exited(exit_from_join(joined))
            }
            Some(MailboxChanged) = self.changes.rx.recv() => WatchSignal::Changed,
        }
    }

    /// Stop waiting and take back the notify session and the queue
    pub async fn stop(mut self) -> (WatchExit<S>, ChangeQueue) {
        self.stop.cancel();
        let exit = match self.task.take() {
            Some(task) => exit_from_join(task.await),
            None => WatchExit {
                session: None,
                result: Ok(()),
            },
        };
        (exit, self.changes)
    }
}

fn exit_from_join<S>(joined: Result<WatchExit<S>, tokio::task::JoinError>) -> WatchExit<S> {
    joined.unwrap_or_else(|e| WatchExit {
        session: None,
        result: Err(AppError::Internal(format!("watcher task failed: {e}"))),
    })
}

async fn wait_loop<S: MailSession>(
    mut session: S,
    changes: mpsc::Sender<MailboxChanged>,
    fallback: Option<Duration>,
    stop: CancellationToken,
) -> WatchExit<S> {
    info!("begin idling");
    loop {
        if stop.is_cancelled() {
            return WatchExit {
                session: Some(session),
                result: Ok(()),
            };
        }

        match session.wait_for_change(fallback, stop.clone()).await {
            Ok((next, IdleEvent::Changed)) => {
                session = next;
                debug!("mailbox update received");
                offer(&changes);
            }
            Ok((next, IdleEvent::Renewed)) => {
                session = next;
                debug!("fallback interval elapsed, renewing idle");
            }
            Ok((next, IdleEvent::Interrupted)) => {
                info!("idle interrupted");
                return WatchExit {
                    session: Some(next),
                    result: Ok(()),
                };
            }
            Err(err) => {
                warn!(error = %err, "not idling anymore");
                return WatchExit {
                    session: None,
                    result: Err(err),
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;

    use super::{ChangeQueue, MailboxChanged, NotificationWatcher, WatchSignal};
    use crate::errors::AppError;
    use crate::session::fake::{FakeConnector, server_with_inbox};
    use crate::session::{Connector, IdleEvent};

    #[test]
    fn primed_queue_holds_one_recheck() {
        let mut queue = ChangeQueue::primed();
        assert_eq!(queue.try_take(), Some(MailboxChanged));
        assert_eq!(queue.try_take(), None);
    }

    #[test]
    fn changes_are_coalesced_while_one_is_pending() {
        let mut queue = ChangeQueue::new();
        assert!(queue.notify());
        assert!(!queue.notify());
        assert!(!queue.notify());
        assert_eq!(queue.try_take(), Some(MailboxChanged));
        assert_eq!(queue.try_take(), None);
        assert!(queue.notify());
    }

    #[tokio::test]
    async fn forwards_changes_and_reports_termination() {
        let connector = FakeConnector::new(server_with_inbox(Vec::new()));
        let session = connector.open().await.expect("open");
        let cancel = CancellationToken::new();
        let mut watcher = NotificationWatcher::spawn(session, ChangeQueue::new(), None, &cancel);

        connector.push_idle(Ok(IdleEvent::Renewed));
        connector.push_idle(Ok(IdleEvent::Changed));
        assert!(matches!(watcher.next().await, WatchSignal::Changed));

        connector.push_idle(Err(AppError::Internal("connection reset".to_owned())));
        match watcher.next().await {
            WatchSignal::Exited(exit) => {
                assert!(exit.session.is_none());
                let err = exit.result.expect_err("must fail");
                assert!(err.to_string().contains("connection reset"));
            }
            WatchSignal::Changed => panic!("expected termination"),
        }
        assert!(matches!(watcher.next().await, WatchSignal::Exited(_)));
    }

    #[tokio::test]
    async fn stop_returns_the_session() {
        let connector = FakeConnector::new(server_with_inbox(Vec::new()));
        let session = connector.open().await.expect("open");
        let cancel = CancellationToken::new();
        let watcher = NotificationWatcher::spawn(session, ChangeQueue::new(), None, &cancel);

        let (exit, _queue) = watcher.stop().await;
        assert!(exit.result.is_ok());
        assert!(exit.session.is_some());
        assert!(!cancel.is_cancelled());
    }

    #[tokio::test]
    async fn parent_cancellation_ends_the_wait() {
        let connector = FakeConnector::new(server_with_inbox(Vec::new()));
        let session = connector.open().await.expect("open");
        let cancel = CancellationToken::new();
        let mut watcher = NotificationWatcher::spawn(session, ChangeQueue::new(), None, &cancel);

        cancel.cancel();
        match watcher.next().await {
            WatchSignal::Exited(exit) => {
                assert!(exit.result.is_ok());
                assert!(exit.session.is_some());
            }
            WatchSignal::Changed => panic!("expected termination"),
        }
    }
}
