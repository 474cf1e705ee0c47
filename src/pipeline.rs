//! Message pipeline for one handle cycle
//!
//! A producer selects the watched mailbox on the command session, snapshots
//! the UIDs of its current range and fetches records chunk by chunk into a
//! bounded queue. A consumer classifies each record and applies the move
//! action. Both share the command session through an async mutex; the
//! producer never holds it while waiting for queue space.

use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info};

use crate::config::MoveAction;
use crate::errors::AppResult;
use crate::metrics::AccountMetrics;
use crate::session::{MailSession, MessageRecord, SelectMode};
use crate::template;

/// Records buffered between fetch and move; also the UID FETCH chunk size
pub const QUEUE_CAPACITY: usize = 100;

/// Run one fetch/classify/move pass over `mailbox`
///
/// `moved` is incremented once per completed move, so it stays accurate when
/// the cycle fails part way. The first error from either side ends the cycle
/// and abandons whatever is still queued.
pub async fn run<S: MailSession>(
    session: &mut S,
    mailbox: &str,
    action: Option<&MoveAction>,
    moved: &mut u64,
    metrics: &AccountMetrics,
) -> AppResult<()> {
    let session = Mutex::new(session);
    let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);

    tokio::try_join!(
        produce(&session, mailbox, tx),
        consume(&session, rx, action, moved, metrics),
    )?;
    Ok(())
}

async fn produce<S: MailSession>(
    session: &Mutex<&mut S>,
    mailbox: &str,
    tx: mpsc::Sender<MessageRecord>,
) -> AppResult<()> {
    let uids = {
        let mut guard = session.lock().await;
        let session = &mut **guard;
        let status = session.select(mailbox, SelectMode::Modify).await?;
        if status.exists == 0 {
            debug!(mailbox, "mailbox is empty");
            return Ok(());
        }
        session.snapshot_uids(status.exists).await?
    };
    debug!(mailbox, count = uids.len(), "fetching messages");

    for chunk in uids.chunks(QUEUE_CAPACITY) {
        let records = {
            let mut guard = session.lock().await;
            (&mut **guard).fetch_records(chunk).await?
        };
        for record in records {
            if tx.send(record).await.is_err() {
                return Ok(());
            }
        }
    }
    Ok(())
}

async fn consume<S: MailSession>(
    session: &Mutex<&mut S>,
    mut rx: mpsc::Receiver<MessageRecord>,
    action: Option<&MoveAction>,
    moved: &mut u64,
    metrics: &AccountMetrics,
) -> AppResult<()> {
    while let Some(record) = rx.recv().await {
        if record.is_deleted() {
            debug!(uid = record.uid, "skipping deleted message");
            continue;
        }
        let Some(action) = action else {
            continue;
        };

        let destination = template::resolve(action, &record.received);
        let mut guard = session.lock().await;
        let session = &mut **guard;
        ensure_mailbox(session, &destination).await?;
        session.move_message(record.uid, &destination).await?;
        drop(guard);

        *moved += 1;
        metrics.message_moved();
        info!(uid = record.uid, mailbox = %destination, "message moved");
    }
    Ok(())
}

/// Check `mailbox` with STATUS and create it when that fails
async fn ensure_mailbox<S: MailSession>(session: &mut S, mailbox: &str) -> AppResult<()> {
    if let Err(err) = session.mailbox_status(mailbox).await {
        debug!(mailbox, error = %err, "destination missing, creating it");
        session.create_mailbox(mailbox).await?;
        info!(mailbox, "created destination mailbox");
    }
    Ok(())
}
