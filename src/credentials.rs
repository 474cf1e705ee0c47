//! Credential resolution for IMAP authentication
//!
//! Password accounts present their static secret. Provider accounts obtain a
//! bearer token by running a shell command (which is expected to perform any
//! device pairing or refresh itself); the token is cached until the server
//! rejects it, and a rejected cached token is replaced by a fresh one once.

use std::future::Future;
use std::process::Stdio;

use secrecy::{ExposeSecret, SecretString};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::Credentials;
use crate::errors::{AppError, AppResult};

/// Credential presented when opening a session
#[derive(Debug)]
pub enum CredentialSource {
    /// LOGIN with a static password
    Password(SecretString),
    /// AUTHENTICATE XOAUTH2 with a cached bearer token
    Bearer(TokenSource),
}

impl CredentialSource {
    /// Build the runtime source for a configured credential
    pub fn from_config(credentials: &Credentials) -> Self {
        match credentials {
            Credentials::Password(pass) => Self::Password(pass.clone()),
            Credentials::Bearer { provider, command } => {
                Self::Bearer(TokenSource::new(provider.clone(), command.clone()))
            }
        }
    }
}

/// Command-backed access token cache
#[derive(Debug)]
pub struct TokenSource {
    provider: String,
    command: String,
    cached: Mutex<Option<SecretString>>,
}

impl TokenSource {
    pub fn new(provider: String, command: String) -> Self {
        Self {
            provider,
            command,
            cached: Mutex::new(None),
        }
    }

    /// Provider label from configuration
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Return the cached token, running the token command when none is cached
    ///
    /// # Errors
    ///
    /// `Credential` if the command cannot be spawned, exits non-zero, or
    /// prints an empty token.
    pub async fn current(&self) -> AppResult<SecretString> {
        self.current_with_origin().await.map(|(token, _)| token)
    }

    /// Like [`TokenSource::current`], also reporting whether the token came
    /// from the cache
    async fn current_with_origin(&self) -> AppResult<(SecretString, bool)> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            return Ok((token.clone(), true));
        }

        info!(provider = %self.provider, "requesting access token");
        let token = run_token_command(&self.command).await?;
        *cached = Some(token.clone());
        Ok((token, false))
    }

    /// Run `attempt` with the current token
    ///
    /// When the server rejects a cached token (`AuthFailed`), the cache is
    /// dropped and `attempt` runs once more with a freshly fetched token. A
    /// rejected fresh token is returned as is, after being dropped from the
    /// cache.
    pub async fn authorize<T, F, Fut>(&self, mut attempt: F) -> AppResult<T>
    where
        F: FnMut(SecretString) -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        let (token, cached) = self.current_with_origin().await?;
        match attempt(token).await {
            Err(AppError::AuthFailed(msg)) => {
                self.invalidate().await;
                if !cached {
                    return Err(AppError::AuthFailed(msg));
                }
                info!(provider = %self.provider, "cached access token rejected, refreshing");
                let token = self.current().await?;
                let result = attempt(token).await;
                if matches!(result, Err(AppError::AuthFailed(_))) {
                    self.invalidate().await;
                }
                result
            }
            other => other,
        }
    }

    /// Drop the cached token so the next [`TokenSource::current`] refreshes it
    pub async fn invalidate(&self) {
        debug!(provider = %self.provider, "invalidating cached access token");
        self.cached.lock().await.take();
    }
}

async fn run_token_command(command: &str) -> AppResult<SecretString> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| AppError::Credential(format!("cannot run token command: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(AppError::Credential(format!(
            "token command exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    let stdout = String::from_utf8(output.stdout)
        .map_err(|_| AppError::Credential("token command printed non-utf8 data".to_owned()))?;
    let token = stdout.trim();
    if token.is_empty() {
        return Err(AppError::Credential(
            "token command printed an empty token".to_owned(),
        ));
    }
    Ok(SecretString::new(token.into()))
}

/// Build the XOAUTH2 initial client response
///
/// Format: `user=<user>\x01auth=Bearer <token>\x01\x01`
pub fn xoauth2_response(user: &str, token: &SecretString) -> String {
    format!(
        "user={}\x01auth=Bearer {}\x01\x01",
        user,
        token.expose_secret()
    )
}
