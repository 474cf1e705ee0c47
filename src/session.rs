//! Mail session capability interface
//!
//! The watch/handle engine never talks to `async-imap` directly. It drives a
//! [`MailSession`] opened through a [`Connector`]; [`crate::imap`] provides
//! the real implementation over TLS and the tests use [`fake`].

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, FixedOffset};
use tokio_util::sync::CancellationToken;

use crate::errors::AppResult;

/// IMAP system flag marking a message as deleted
pub const DELETED_FLAG: &str = "\\Deleted";

/// How a mailbox is selected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectMode {
    /// Read-only selection on the notify session, used to receive IDLE updates
    Watch,
    /// Read-write selection on the command session, required for moves
    Modify,
}

/// Mailbox state reported by a selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxStatus {
    /// Number of messages in the mailbox
    pub exists: u32,
}

/// One message examined during a handle cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    /// Server-assigned UID
    pub uid: u32,
    /// Flags in wire form (`\Seen`, `\Deleted`, keywords)
    pub flags: Vec<String>,
    /// INTERNALDATE of the message
    pub received: DateTime<FixedOffset>,
}

impl MessageRecord {
    /// Whether the message carries the `\Deleted` flag
    pub fn is_deleted(&self) -> bool {
        self.flags
            .iter()
            .any(|flag| flag.eq_ignore_ascii_case(DELETED_FLAG))
    }
}

/// Result of one push-notification wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleEvent {
    /// The server reported a change to the selected mailbox
    Changed,
    /// The fallback interval elapsed without a change; the wait should be renewed
    Renewed,
    /// The wait was interrupted locally (cancellation)
    Interrupted,
}

/// Authenticated mail session
///
/// Command sessions use the fetch/status/create/move operations; notify
/// sessions use [`MailSession::wait_for_change`]. Both are closed with
/// [`MailSession::logout`], which consumes the session so it cannot be reused.
pub trait MailSession: Send + Sized + 'static {
    /// Select `mailbox` and report its message count
    fn select(
        &mut self,
        mailbox: &str,
        mode: SelectMode,
    ) -> impl Future<Output = AppResult<MailboxStatus>> + Send;

    /// UIDs of the messages in sequence range `1:count`, ascending
    fn snapshot_uids(&mut self, count: u32) -> impl Future<Output = AppResult<Vec<u32>>> + Send;

    /// Fetch UID, flags and INTERNALDATE for `uids`, in server order
    fn fetch_records(
        &mut self,
        uids: &[u32],
    ) -> impl Future<Output = AppResult<Vec<MessageRecord>>> + Send;

    /// Check that `mailbox` exists
    fn mailbox_status(&mut self, mailbox: &str) -> impl Future<Output = AppResult<()>> + Send;

    /// Create `mailbox`
    fn create_mailbox(&mut self, mailbox: &str) -> impl Future<Output = AppResult<()>> + Send;

    /// Move the message with `uid` from the selected mailbox to `mailbox`
    fn move_message(
        &mut self,
        uid: u32,
        mailbox: &str,
    ) -> impl Future<Output = AppResult<()>> + Send;

    /// Wait for a change notification on the selected mailbox
    ///
    /// Returns the session together with the event. `fallback` bounds the wait
    /// (`None` relies on the server's own IDLE renewal). Cancelling `cancel`
    /// ends the wait with [`IdleEvent::Interrupted`]. On error the session is
    /// lost.
    fn wait_for_change(
        self,
        fallback: Option<Duration>,
        cancel: CancellationToken,
    ) -> impl Future<Output = AppResult<(Self, IdleEvent)>> + Send;

    /// Log out and drop the connection
    fn logout(self) -> impl Future<Output = AppResult<()>> + Send;
}

/// Opens authenticated sessions for one account
pub trait Connector: Send + Sync + 'static {
    /// Session type produced by this connector
    type Session: MailSession;

    /// Resolve credentials, connect and authenticate
    fn open(&self) -> impl Future<Output = AppResult<Self::Session>> + Send;
}


#[cfg(test)]
mod tests {
    use super::fake::message;

    #[test]
    fn deleted_flag_is_detected_case_insensitively() {
        assert!(message(1, &["\\Seen", "\\Deleted"]).is_deleted());
        assert!(message(2, &["\\deleted"]).is_deleted());
        assert!(!message(3, &["\\Seen", "Deleted"]).is_deleted());
        assert!(!message(4, &[]).is_deleted());
    }
}
