//! IMAP transport and session operations
//!
//! Provides timeout-bounded wrappers around `async-imap` operations and the
//! [`MailSession`]/[`Connector`] implementations used in production. All
//! network calls are enforced to use TLS. The IDLE wait is the only
//! operation not bounded by the socket timeout; it is bounded by the
//! account's fallback interval, and never held longer than
//! [`IDLE_RENEWAL`].

use std::collections::HashSet;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_imap::extensions::idle::IdleResponse;
use async_imap::types::{Fetch, Flag};
use async_imap::{Client, Session};
use chrono::{DateTime, FixedOffset};
use futures::TryStreamExt;
use rustls::ClientConfig;
use rustls::RootCertStore;
use rustls_pki_types::ServerName;
use secrecy::{ExposeSecret, SecretString};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use utf7_imap::encode_utf7_imap;

use crate::config::{AccountConfig, Timeouts};
use crate::credentials::{CredentialSource, xoauth2_response};
use crate::errors::{AppError, AppResult};
use crate::session::{Connector, IdleEvent, MailSession, MailboxStatus, MessageRecord, SelectMode};

/// Authenticated IMAP session over TLS
type TlsSession = Session<TlsStream<TcpStream>>;

/// Fetch items requested for every message of a handle cycle
const RECORD_QUERY: &str = "(UID FLAGS INTERNALDATE)";

/// Longest single IDLE before it is re-issued; RFC 2177 servers may drop
/// a client idle for 30 minutes
const IDLE_RENEWAL: Duration = Duration::from_secs(25 * 60);

/// Opens authenticated TLS sessions for one account
#[derive(Debug)]
pub struct ImapConnector {
    account: Arc<AccountConfig>,
    timeouts: Timeouts,
    credentials: CredentialSource,
}

impl ImapConnector {
    pub fn new(account: Arc<AccountConfig>, timeouts: Timeouts) -> Self {
        let credentials = CredentialSource::from_config(&account.credentials);
        Self {
            account,
            timeouts,
            credentials,
        }
    }
}

impl Connector for ImapConnector {
    type Session = ImapSession;

    async fn open(&self) -> AppResult<ImapSession> {
        let timeouts = &self.timeouts;
        let account = &self.account;
        let inner = match &self.credentials {
            CredentialSource::Password(pass) => {
                let client = connect_tls(timeouts, account).await?;
                login(timeouts, client, &account.user, pass).await?
            }
            CredentialSource::Bearer(source) => {
                debug!(provider = source.provider(), "authenticating with XOAUTH2");
                source
                    .authorize(|token| async move {
                        let client = connect_tls(timeouts, account).await?;
                        authenticate_xoauth2(timeouts, client, &account.user, &token).await
                    })
                    .await?
            }
        };

        Ok(ImapSession {
            inner,
            timeouts: self.timeouts,
            supports_move: None,
        })
    }
}

/// Connect to the IMAP server and read its greeting
///
/// Performs the connection sequence with timeouts:
/// 1. TCP connect
/// 2. TLS handshake with the bundled root certificates
/// 3. Read IMAP greeting
///
/// # Errors
///
/// - `InvalidInput` if `secure` is false or hostname is invalid for TLS SNI
/// - `Timeout` if any connection phase times out
/// - `Internal` for TCP, TLS, or greeting failures
async fn connect_tls(
    timeouts: &Timeouts,
    account: &AccountConfig,
) -> AppResult<Client<TlsStream<TcpStream>>> {
    if !account.secure {
        return Err(AppError::InvalidInput(
            "insecure IMAP is not supported; set MAIL_SMART_<ACCOUNT>_SECURE=true".to_owned(),
        ));
    }

    let tcp = timeout(
        timeouts.connect,
        TcpStream::connect((account.host.as_str(), account.port)),
    )
    .await
    .map_err(|_| AppError::Timeout("tcp connect timeout".to_owned()))
    .and_then(|r| r.map_err(|e| AppError::Internal(format!("tcp connect failed: {e}"))))?;

    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(tls_config));

    let server_name = ServerName::try_from(account.host.clone())
        .map_err(|_| AppError::InvalidInput("invalid IMAP host for TLS SNI".to_owned()))?;
    let tls_stream = timeout(timeouts.greeting, connector.connect(server_name, tcp))
        .await
        .map_err(|_| AppError::Timeout("TLS handshake timeout".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Internal(format!("TLS handshake failed: {e}"))))?;

    let mut client = Client::new(tls_stream);
    let greeting = timeout(timeouts.greeting, client.read_response())
        .await
        .map_err(|_| AppError::Timeout("IMAP greeting timeout".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Internal(format!("IMAP greeting failed: {e}"))))?;

    if greeting.is_none() {
        return Err(AppError::Internal(
            "IMAP server closed connection before greeting".to_owned(),
        ));
    }
    Ok(client)
}

/// Authenticate with LOGIN
async fn login(
    timeouts: &Timeouts,
    client: Client<TlsStream<TcpStream>>,
    user: &str,
    pass: &SecretString,
) -> AppResult<TlsSession> {
    timeout(timeouts.greeting, client.login(user, pass.expose_secret()))
        .await
        .map_err(|_| AppError::Timeout("IMAP login timeout".to_owned()))
        .and_then(|r| r.map_err(|(e, _)| auth_error("LOGIN", e)))
}

/// XOAUTH2 SASL mechanism: a single client response carrying the bearer token
struct XOAuth2 {
    response: String,
}

impl async_imap::Authenticator for XOAuth2 {
    type Response = String;

    fn process(&mut self, _challenge: &[u8]) -> Self::Response {
        self.response.clone()
    }
}

/// Authenticate with AUTHENTICATE XOAUTH2
async fn authenticate_xoauth2(
    timeouts: &Timeouts,
    client: Client<TlsStream<TcpStream>>,
    user: &str,
    token: &SecretString,
) -> AppResult<TlsSession> {
    let auth = XOAuth2 {
        response: xoauth2_response(user, token),
    };
    timeout(timeouts.greeting, client.authenticate("XOAUTH2", auth))
        .await
        .map_err(|_| AppError::Timeout("IMAP authenticate timeout".to_owned()))
        .and_then(|r| r.map_err(|(e, _)| auth_error("AUTHENTICATE", e)))
}

fn auth_error(command: &str, e: async_imap::error::Error) -> AppError {
    match e {
        async_imap::error::Error::No(msg) | async_imap::error::Error::Bad(msg) => {
            AppError::AuthFailed(format!("{command} rejected: {msg}"))
        }
        other => AppError::Internal(format!("{command} failed: {other}")),
    }
}

/// Run one IMAP command bounded by the socket timeout
async fn bounded<T, E: Display>(
    limit: Duration,
    command: &str,
    fut: impl Future<Output = Result<T, E>>,
) -> AppResult<T> {
    timeout(limit, fut)
        .await
        .map_err(|_| AppError::Timeout(format!("{command} timed out")))
        .and_then(|r| r.map_err(|e| AppError::Internal(format!("{command} failed: {e}"))))
}

/// Encode a mailbox name to IMAP modified UTF-7
fn wire_mailbox(mailbox: &str) -> String {
    encode_utf7_imap(mailbox.to_owned())
}

/// Build a comma-separated UID set
fn uid_set(uids: &[u32]) -> String {
    uids.iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Convert a flag to its IMAP wire form
fn flag_name(flag: &Flag<'_>) -> String {
    match flag {
        Flag::Seen => "\\Seen".to_owned(),
        Flag::Answered => "\\Answered".to_owned(),
        Flag::Flagged => "\\Flagged".to_owned(),
        Flag::Deleted => "\\Deleted".to_owned(),
        Flag::Draft => "\\Draft".to_owned(),
        Flag::Recent => "\\Recent".to_owned(),
        Flag::MayCreate => "\\*".to_owned(),
        Flag::Custom(name) => name.to_string(),
    }
}

/// Bound for one IDLE wait: the fallback interval, capped at [`IDLE_RENEWAL`]
fn idle_bound(fallback: Option<Duration>) -> Duration {
    fallback.map_or(IDLE_RENEWAL, |interval| interval.min(IDLE_RENEWAL))
}

/// The parts of a FETCH response a handle cycle looks at
struct FetchedItem {
    uid: Option<u32>,
    flags: Vec<String>,
    received: Option<DateTime<FixedOffset>>,
}

impl From<&Fetch> for FetchedItem {
    fn from(fetch: &Fetch) -> Self {
        Self {
            uid: fetch.uid,
            flags: fetch.flags().map(|flag| flag_name(&flag)).collect(),
            received: fetch.internal_date(),
        }
    }
}

/// Keep the responses answering the UID FETCH for `requested`
///
/// Servers may interleave unsolicited FETCH responses (flag updates from
/// other clients) that carry no UID or a UID outside the request; those are
/// skipped.
fn requested_records(items: Vec<FetchedItem>, requested: &[u32]) -> Vec<MessageRecord> {
    let wanted: HashSet<u32> = requested.iter().copied().collect();
    let mut records = Vec::with_capacity(items.len());
    for item in items {
        let Some(uid) = item.uid.filter(|uid| wanted.contains(uid)) else {
            debug!(uid = ?item.uid, "skipping unsolicited FETCH response");
            continue;
        };
        let Some(received) = item.received else {
            warn!(uid, "skipping message without INTERNALDATE");
            continue;
        };
        records.push(MessageRecord {
            uid,
            flags: item.flags,
            received,
        });
    }
    records
}

/// Production [`MailSession`] backed by `async-imap`
pub struct ImapSession {
    inner: TlsSession,
    timeouts: Timeouts,
    /// Whether the server advertises MOVE; queried on first move
    supports_move: Option<bool>,
}

impl ImapSession {
    async fn supports_move(&mut self) -> AppResult<bool> {
        if let Some(supported) = self.supports_move {
            return Ok(supported);
        }
        let caps = bounded(
            self.timeouts.socket,
            "CAPABILITY",
            self.inner.capabilities(),
        )
        .await?;
        let supported = caps.has_str("MOVE");
        self.supports_move = Some(supported);
        Ok(supported)
    }

    /// Copy, flag `\Deleted` and expunge, for servers without MOVE
    async fn copy_and_expunge(&mut self, uid: u32, mailbox: &str) -> AppResult<()> {
        let limit = self.timeouts.socket;
        let uid = uid.to_string();

        bounded(limit, "UID COPY", self.inner.uid_copy(&uid, mailbox)).await?;

        let stream = bounded(
            limit,
            "UID STORE",
            self.inner.uid_store(&uid, "+FLAGS.SILENT (\\Deleted)"),
        )
        .await?;
        let _: Vec<Fetch> = bounded(limit, "UID STORE stream", stream.try_collect()).await?;

        let stream = bounded(limit, "UID EXPUNGE", self.inner.uid_expunge(&uid)).await?;
        let _: Vec<u32> = bounded(limit, "UID EXPUNGE stream", stream.try_collect()).await?;
        Ok(())
    }
}

impl MailSession for ImapSession {
    async fn select(&mut self, mailbox: &str, mode: SelectMode) -> AppResult<MailboxStatus> {
        let encoded = wire_mailbox(mailbox);
        let (command, selected) = match mode {
            SelectMode::Watch => (
                "EXAMINE",
                timeout(self.timeouts.socket, self.inner.examine(&encoded)).await,
            ),
            SelectMode::Modify => (
                "SELECT",
                timeout(self.timeouts.socket, self.inner.select(&encoded)).await,
            ),
        };
        let selected = selected
            .map_err(|_| AppError::Timeout(format!("{command} timed out for mailbox '{mailbox}'")))
            .and_then(|r| {
                r.map_err(|e| AppError::NotFound(format!("cannot select mailbox '{mailbox}': {e}")))
            })?;
        Ok(MailboxStatus {
            exists: selected.exists,
        })
    }

    async fn snapshot_uids(&mut self, count: u32) -> AppResult<Vec<u32>> {
        let set = bounded(
            self.timeouts.socket,
            "UID SEARCH",
            self.inner.uid_search(format!("1:{count}")),
        )
        .await?;
        let mut uids: Vec<u32> = set.into_iter().collect();
        uids.sort_unstable();
        Ok(uids)
    }

    async fn fetch_records(&mut self, uids: &[u32]) -> AppResult<Vec<MessageRecord>> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        let limit = self.timeouts.socket;
        let stream = bounded(
            limit,
            "UID FETCH",
            self.inner.uid_fetch(uid_set(uids), RECORD_QUERY),
        )
        .await?;
        let fetches: Vec<Fetch> = bounded(limit, "UID FETCH stream", stream.try_collect()).await?;
        let items = fetches.iter().map(FetchedItem::from).collect();
        Ok(requested_records(items, uids))
    }

    async fn mailbox_status(&mut self, mailbox: &str) -> AppResult<()> {
        let encoded = wire_mailbox(mailbox);
        timeout(
            self.timeouts.socket,
            self.inner.status(&encoded, "(MESSAGES)"),
        )
        .await
        .map_err(|_| AppError::Timeout(format!("STATUS timed out for mailbox '{mailbox}'")))
        .and_then(|r| {
            r.map_err(|e| AppError::NotFound(format!("no status for mailbox '{mailbox}': {e}")))
        })?;
        Ok(())
    }

    async fn create_mailbox(&mut self, mailbox: &str) -> AppResult<()> {
        let encoded = wire_mailbox(mailbox);
        bounded(self.timeouts.socket, "CREATE", self.inner.create(&encoded)).await
    }

    async fn move_message(&mut self, uid: u32, mailbox: &str) -> AppResult<()> {
        let encoded = wire_mailbox(mailbox);
        if self.supports_move().await? {
            bounded(
                self.timeouts.socket,
                "UID MOVE",
                self.inner.uid_mv(uid.to_string(), &encoded),
            )
            .await
        } else {
            self.copy_and_expunge(uid, &encoded).await
        }
    }

    async fn wait_for_change(
        self,
        fallback: Option<Duration>,
        cancel: CancellationToken,
    ) -> AppResult<(Self, IdleEvent)> {
        let Self {
            inner,
            timeouts,
            supports_move,
        } = self;

        let mut idle = inner.idle();
        bounded(timeouts.socket, "IDLE", idle.init()).await?;

        let event = {
            let (wait, _stop) = idle.wait_with_timeout(idle_bound(fallback));
            tokio::select! {
                biased;
                _ = cancel.cancelled() => IdleEvent::Interrupted,
                response = wait => match response {
                    Ok(IdleResponse::NewData(_)) => IdleEvent::Changed,
                    Ok(IdleResponse::Timeout) => IdleEvent::Renewed,
                    Ok(IdleResponse::ManualInterrupt) => IdleEvent::Interrupted,
                    Err(e) => return Err(AppError::Internal(format!("IDLE wait failed: {e}"))),
                },
            }
        };

        let inner = bounded(timeouts.socket, "IDLE DONE", idle.done()).await?;
        Ok((
            Self {
                inner,
                timeouts,
                supports_move,
            },
            event,
        ))
    }

    async fn logout(mut self) -> AppResult<()> {
        bounded(self.timeouts.socket, "LOGOUT", self.inner.logout()).await
    }
}
