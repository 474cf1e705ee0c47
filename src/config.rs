//! Configuration module for watched accounts and process settings
//!
//! All configuration is loaded from environment variables following the pattern
//! `MAIL_SMART_<SEGMENT>_<KEY>`. Account segments are discovered by scanning for
//! `MAIL_SMART_*_HOST` variables.

use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use secrecy::SecretString;

use crate::errors::{AppError, AppResult};

/// Mailbox watched when `MAIL_SMART_<SEGMENT>_MAILBOX` is unset
pub const DEFAULT_MAILBOX: &str = "INBOX";

/// How an account proves its identity to the IMAP server
#[derive(Debug, Clone)]
pub enum Credentials {
    /// Plain LOGIN with a static password
    Password(SecretString),
    /// XOAUTH2 with a bearer token printed by `command`
    Bearer {
        /// Provider label, used for logging only
        provider: String,
        /// Shell command that prints a current access token on stdout
        command: String,
    },
}

/// Move action applied to every non-deleted message of the watched mailbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveAction {
    /// Destination mailbox, or a `%pattern%` template when `timestamp` is set
    pub template: String,
    /// Whether `%...%` segments are rendered from the received timestamp
    pub timestamp: bool,
}

/// Watched account descriptor
///
/// Immutable after load. Shared read-only with the account's runtime via `Arc`.
#[derive(Debug, Clone)]
pub struct AccountConfig {
    /// Account identifier (lowercase segment name)
    pub account_id: String,
    /// IMAP server hostname
    pub host: String,
    /// IMAP server port (typically 993 for TLS)
    pub port: u16,
    /// Whether to use TLS (currently enforced to `true`)
    pub secure: bool,
    /// Username for authentication
    pub user: String,
    /// Password or token source
    pub credentials: Credentials,
    /// Mailbox watched for new messages
    pub mailbox: String,
    /// Action applied to new messages; `None` only observes
    pub action: Option<MoveAction>,
    /// Maximum time an IDLE is held before it is renewed; zero disables renewal
    pub idle_fallback: Duration,
}

impl AccountConfig {
    /// Fallback interval as the watcher expects it (`None` when disabled)
    pub fn idle_fallback(&self) -> Option<Duration> {
        (!self.idle_fallback.is_zero()).then_some(self.idle_fallback)
    }
}

/// Network timeouts applied to every non-IDLE IMAP operation
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// TCP connection timeout
    pub connect: Duration,
    /// TLS handshake, greeting and authentication timeout
    pub greeting: Duration,
    /// Per-command socket timeout
    pub socket: Duration,
}

/// Process-wide configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// All configured accounts, keyed by `account_id`
    pub accounts: BTreeMap<String, Arc<AccountConfig>>,
    /// Network timeouts shared by all accounts
    pub timeouts: Timeouts,
    /// Address of the `/metrics` endpoint, if enabled
    pub metrics_listen: Option<SocketAddr>,
    /// Default log filter used when `RUST_LOG` is unset
    pub log_filter: String,
}

/// Snapshot of the process environment
///
/// Keys whose values are not valid unicode are remembered so that reading them
/// reports an error instead of silently falling back to a default.
#[derive(Debug, Default)]
pub struct EnvSnapshot {
    values: BTreeMap<String, String>,
    non_unicode: BTreeSet<String>,
}

impl EnvSnapshot {
    /// Capture the current process environment
    pub fn capture() -> Self {
        let mut snapshot = Self::default();
        for (key, value) in env::vars_os() {
            let Ok(key) = key.into_string() else {
                continue;
            };
            match value.into_string() {
                Ok(value) => {
                    snapshot.values.insert(key, value);
                }
                Err(_) => {
                    snapshot.non_unicode.insert(key);
                }
            }
        }
        snapshot
    }

    fn get(&self, key: &str) -> AppResult<Option<&str>> {
        if self.non_unicode.contains(key) {
            return Err(AppError::InvalidInput(format!(
                "environment variable {key} contains non-unicode data"
            )));
        }
        Ok(self.values.get(key).map(String::as_str))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for EnvSnapshot {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            non_unicode: BTreeSet::new(),
        }
    }
}

impl ServerConfig {
    /// Load all configuration from environment variables
    ///
    /// Discovers accounts by scanning for `MAIL_SMART_*_HOST` patterns.
    /// If no accounts are explicitly defined, a `default` account is required
    /// via `MAIL_SMART_DEFAULT_HOST`, `MAIL_SMART_DEFAULT_USER`, and
    /// `MAIL_SMART_DEFAULT_PASS`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if required environment variables are missing
    /// or malformed.
    ///
    /// # Example Environment
    ///
    /// ```text
    /// MAIL_SMART_DEFAULT_HOST=imap.example.com
    /// MAIL_SMART_DEFAULT_USER=user@example.com
    /// MAIL_SMART_DEFAULT_PASS=app-password
    /// MAIL_SMART_DEFAULT_MOVE=Archive/%yyyy%/%MM%
    /// MAIL_SMART_DEFAULT_MOVE_TIMESTAMP=true
    /// MAIL_SMART_WORK_HOST=outlook.office365.com
    /// MAIL_SMART_WORK_USER=user@company.com
    /// MAIL_SMART_WORK_PROVIDER=microsoft
    /// MAIL_SMART_WORK_TOKEN_CMD=oauth-helper token work
    /// MAIL_SMART_METRICS_LISTEN=127.0.0.1:9425
    /// ```
    pub fn load_from_env() -> AppResult<Self> {
        Self::load_from(&EnvSnapshot::capture())
    }

    /// Load configuration from an environment snapshot
    pub fn load_from(vars: &EnvSnapshot) -> AppResult<Self> {
        let account_pattern = Regex::new(r"^MAIL_SMART_([A-Z0-9_]+)_HOST$")
            .map_err(|e| AppError::Internal(format!("invalid account regex: {e}")))?;

        let mut account_segments: Vec<String> = vars
            .values
            .keys()
            .filter_map(|k| {
                account_pattern
                    .captures(k)
                    .and_then(|c| c.get(1).map(|m| m.as_str().to_owned()))
            })
            .collect();

        if account_segments.is_empty() {
            account_segments.push("DEFAULT".to_owned());
        }

        account_segments.sort();
        account_segments.dedup();

        let default_fallback = parse_u64(vars, "MAIL_SMART_IDLE_FALLBACK_SECS", 0)?;

        let mut accounts = BTreeMap::new();
        for seg in account_segments {
            let account = load_account(vars, &seg, default_fallback)?;
            accounts.insert(account.account_id.clone(), Arc::new(account));
        }

        let metrics_listen = match vars.get("MAIL_SMART_METRICS_LISTEN")? {
            Some(v) if !v.trim().is_empty() => {
                let addr: SocketAddr = v.trim().parse().map_err(|_| {
                    AppError::InvalidInput(format!(
                        "invalid socket address in MAIL_SMART_METRICS_LISTEN: '{v}'"
                    ))
                })?;
                Some(addr)
            }
            _ => None,
        };

        Ok(Self {
            accounts,
            timeouts: Timeouts {
                connect: Duration::from_millis(parse_u64(
                    vars,
                    "MAIL_SMART_CONNECT_TIMEOUT_MS",
                    30_000,
                )?),
                greeting: Duration::from_millis(parse_u64(
                    vars,
                    "MAIL_SMART_GREETING_TIMEOUT_MS",
                    15_000,
                )?),
                socket: Duration::from_millis(parse_u64(
                    vars,
                    "MAIL_SMART_SOCKET_TIMEOUT_MS",
                    300_000,
                )?),
            },
            metrics_listen,
            log_filter: vars
                .get("MAIL_SMART_LOG")?
                .filter(|v| !v.trim().is_empty())
                .unwrap_or("info")
                .to_owned(),
        })
    }
}

/// Load a single account configuration
///
/// Reads `MAIL_SMART_<SEGMENT>_HOST`, `_USER`, `_PASS` or `_PROVIDER` with
/// `_TOKEN_CMD`, `_PORT`, `_SECURE`, `_MAILBOX`, `_MOVE`, `_MOVE_TIMESTAMP`
/// and `_IDLE_FALLBACK_SECS`. Normalizes the segment name to lowercase for
/// `account_id`.
fn load_account(
    vars: &EnvSnapshot,
    segment: &str,
    default_fallback: u64,
) -> AppResult<AccountConfig> {
    let prefix = format!("MAIL_SMART_{}_", sanitize_segment(segment));
    let host = required(vars, &format!("{prefix}HOST"))?;
    let user = required(vars, &format!("{prefix}USER"))?;

    let credentials = match optional(vars, &format!("{prefix}PROVIDER"))? {
        Some(provider) => Credentials::Bearer {
            provider,
            command: required(vars, &format!("{prefix}TOKEN_CMD"))?,
        },
        None => Credentials::Password(SecretString::new(
            required(vars, &format!("{prefix}PASS"))?.into(),
        )),
    };

    let secure = parse_bool(vars, &format!("{prefix}SECURE"), true)?;
    if !secure {
        return Err(AppError::InvalidInput(format!(
            "insecure IMAP is not supported; set {prefix}SECURE=true"
        )));
    }

    let action = optional(vars, &format!("{prefix}MOVE"))?
        .map(|template| -> AppResult<MoveAction> {
            Ok(MoveAction {
                template,
                timestamp: parse_bool(vars, &format!("{prefix}MOVE_TIMESTAMP"), false)?,
            })
        })
        .transpose()?;

    Ok(AccountConfig {
        account_id: segment.to_ascii_lowercase(),
        host,
        port: parse_u16(vars, &format!("{prefix}PORT"), 993)?,
        secure,
        user,
        credentials,
        mailbox: optional(vars, &format!("{prefix}MAILBOX"))?
            .unwrap_or_else(|| DEFAULT_MAILBOX.to_owned()),
        action,
        idle_fallback: Duration::from_secs(parse_u64(
            vars,
            &format!("{prefix}IDLE_FALLBACK_SECS"),
            default_fallback,
        )?),
    })
}

/// Read a required variable, returning error if missing or empty
fn required(vars: &EnvSnapshot, key: &str) -> AppResult<String> {
    optional(vars, key)?.ok_or_else(|| {
        AppError::invalid(format!("missing required environment variable {key}"))
    })
}

/// Read an optional variable; empty values count as unset
fn optional(vars: &EnvSnapshot, key: &str) -> AppResult<Option<String>> {
    Ok(vars
        .get(key)?
        .filter(|v| !v.trim().is_empty())
        .map(str::to_owned))
}

/// Sanitize an account segment to uppercase alphanumeric/underscore
///
/// Non-alphanumeric characters are replaced with underscores, and leading/
/// trailing underscores are trimmed.
fn sanitize_segment(seg: &str) -> String {
    let mut out = String::with_capacity(seg.len());
    for ch in seg.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_uppercase());
        } else {
            out.push('_');
        }
    }
    out.trim_matches('_').to_owned()
}

/// Parse a boolean variable with flexible values
///
/// Accepts: `1`, `true`, `yes`, `y`, `on` (truthy) or `0`, `false`, `no`,
/// `n`, `off` (falsy). Case-insensitive. Returns `default` if unset.
fn parse_bool(vars: &EnvSnapshot, key: &str, default: bool) -> AppResult<bool> {
    match vars.get(key)? {
        Some(v) => parse_bool_value(v).ok_or_else(|| {
            AppError::InvalidInput(format!("invalid boolean environment variable {key}: '{v}'"))
        }),
        None => Ok(default),
    }
}

fn parse_bool_value(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a `u16` variable with default fallback
fn parse_u16(vars: &EnvSnapshot, key: &str, default: u16) -> AppResult<u16> {
    match vars.get(key)? {
        Some(v) => v.trim().parse::<u16>().map_err(|_| {
            AppError::InvalidInput(format!("invalid u16 environment variable {key}: '{v}'"))
        }),
        None => Ok(default),
    }
}

/// Parse a `u64` variable with default fallback
fn parse_u64(vars: &EnvSnapshot, key: &str, default: u64) -> AppResult<u64> {
    match vars.get(key)? {
        Some(v) => v.trim().parse::<u64>().map_err(|_| {
            AppError::InvalidInput(format!("invalid u64 environment variable {key}: '{v}'"))
        }),
        None => Ok(default),
    }
}
