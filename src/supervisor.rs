//! Per-account supervision
//!
//! Every account runs as its own task with a child of the root cancellation
//! token. A failing account is reported and left stopped; its siblings keep
//! running until they end on their own or the root token is cancelled.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span};

use crate::account::{AccountRuntime, Phase};
use crate::config::AccountConfig;
use crate::errors::{AppError, AppResult};
use crate::metrics::Metrics;
use crate::session::Connector;

/// Terminal report of one account run
#[derive(Debug)]
pub struct AccountOutcome {
    pub account: String,
    /// Phase the account was left in
    pub phase: Phase,
    /// Messages moved during the run
    pub moved: u64,
    /// Most recent failure, including handle cycles the account recovered from
    pub last_error: Option<AppError>,
    pub result: AppResult<()>,
}

impl AccountOutcome {
    /// Whether the run ended with an error other than cancellation
    pub fn failed(&self) -> bool {
        matches!(&self.result, Err(err) if !err.is_cancelled())
    }
}

/// Run every account until all of them have ended
///
/// Outcomes are returned in account order. A task that panics is reported as
/// an `Internal` failure for its account.
pub async fn supervise<C, F>(
    accounts: &BTreeMap<String, Arc<AccountConfig>>,
    make_connector: F,
    metrics: &Metrics,
    cancel: &CancellationToken,
) -> Vec<AccountOutcome>
where
    C: Connector,
    F: Fn(&Arc<AccountConfig>) -> C,
{
    let mut tasks = JoinSet::new();
    let mut names = HashMap::new();

    for (name, account) in accounts {
        let mut runtime = AccountRuntime::new(
            account.clone(),
            make_connector(account),
            metrics.account(name),
        );
        let token = cancel.child_token();
        let span = info_span!("account", account = %name);
        let task_name = name.clone();

        let handle = tasks.spawn(
            async move {
                info!("account started");
                let result = runtime.run(&token).await;
                let last_error = runtime.last_error().cloned();
                let recovered = last_error.as_ref().map(ToString::to_string);
                match &result {
                    Ok(()) => info!(
                        moved = runtime.moved(),
                        last_error = recovered.as_deref(),
                        "account stopped"
                    ),
                    Err(err) if err.is_cancelled() => info!(
                        moved = runtime.moved(),
                        last_error = recovered.as_deref(),
                        "account cancelled"
                    ),
                    Err(err) => error!(
                        phase = %runtime.phase(),
                        moved = runtime.moved(),
                        error = %err,
                        "account failed"
                    ),
                }
                AccountOutcome {
                    account: task_name,
                    phase: runtime.phase(),
                    moved: runtime.moved(),
                    last_error,
                    result,
                }
            }
            .instrument(span),
        );
        names.insert(handle.id(), name.clone());
    }

    let mut outcomes = Vec::with_capacity(names.len());
    while let Some(joined) = tasks.join_next_with_id().await {
        match joined {
            Ok((_, outcome)) => outcomes.push(outcome),
            Err(e) => {
                let account = names.get(&e.id()).cloned().unwrap_or_default();
                error!(account = %account, error = %e, "account task aborted");
                let err = AppError::Internal(format!("account task aborted: {e}"));
                outcomes.push(AccountOutcome {
                    account,
                    phase: Phase::Initial,
                    moved: 0,
                    last_error: Some(err.clone()),
                    result: Err(err),
                });
            }
        }
    }
    outcomes.sort_by(|a, b| a.account.cmp(&b.account));
    outcomes
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use tokio_util::sync::CancellationToken;

    use super::supervise;
    use crate::account::Phase;
    use crate::config::{AccountConfig, MoveAction};
    use crate::metrics::Metrics;
    use crate::session::fake::{FakeConnector, account, message, server_with_inbox};

    #[tokio::test]
    async fn failing_account_does_not_stop_its_sibling() {
        let healthy = FakeConnector::new(server_with_inbox(vec![message(1, &[])]));
        let broken = FakeConnector::new(server_with_inbox(Vec::new()));
        broken.with(|s| s.opens_allowed = Some(0));

        let action = Some(MoveAction {
            template: "Done".to_owned(),
            timestamp: false,
        });
        let mut accounts: BTreeMap<String, Arc<AccountConfig>> = BTreeMap::new();
        accounts.insert("broken".to_owned(), account("broken", None));
        accounts.insert("healthy".to_owned(), account("healthy", action));

        let metrics = Metrics::new().expect("registry");
        let cancel = CancellationToken::new();
        let connectors = (healthy.clone(), broken.clone());
        let make = move |account: &Arc<AccountConfig>| {
            if account.account_id == "broken" {
                connectors.1.clone()
            } else {
                connectors.0.clone()
            }
        };

        let supervised = supervise(&accounts, make, &metrics, &cancel);
        let (outcomes, ()) = tokio::join!(supervised, async {
            for _ in 0..10_000 {
                if healthy.with(|s| s.moves.len() == 1 && s.open_now == 1) {
                    break;
                }
                tokio::task::yield_now().await;
            }
            cancel.cancel();
        });

        assert_eq!(outcomes.len(), 2);
        let broken_outcome = &outcomes[0];
        assert_eq!(broken_outcome.account, "broken");
        assert!(broken_outcome.failed());
        assert_eq!(broken_outcome.phase, Phase::Connecting);
        assert!(broken_outcome.last_error.is_some());

        let healthy_outcome = &outcomes[1];
        assert_eq!(healthy_outcome.account, "healthy");
        assert!(!healthy_outcome.failed());
        assert!(healthy_outcome.result.as_ref().is_err_and(|e| e.is_cancelled()));
        assert_eq!(healthy_outcome.moved, 1);
        assert!(healthy_outcome.last_error.is_none());
        healthy.with(|s| assert_eq!(s.open_now, 0));
    }

    #[tokio::test]
    async fn recovered_cycle_error_is_reported_in_the_outcome() {
        let connector = FakeConnector::new(server_with_inbox(vec![message(1, &[])]));
        connector.with(|s| s.fail_move = true);
        let action = Some(MoveAction {
            template: "Done".to_owned(),
            timestamp: false,
        });
        let mut accounts: BTreeMap<String, Arc<AccountConfig>> = BTreeMap::new();
        accounts.insert("home".to_owned(), account("home", action));

        let metrics = Metrics::new().expect("registry");
        let cancel = CancellationToken::new();
        let make = |_: &Arc<AccountConfig>| connector.clone();
        let failed_cycle = "smartmail_handle_cycles_total{account=\"home\",outcome=\"error\"} 1";

        let supervised = supervise(&accounts, make, &metrics, &cancel);
        let (outcomes, ()) = tokio::join!(supervised, async {
            for _ in 0..10_000 {
                let text = metrics.render().expect("render");
                if text.contains(failed_cycle) {
                    break;
                }
                tokio::task::yield_now().await;
            }
            cancel.cancel();
        });

        let outcome = &outcomes[0];
        assert!(!outcome.failed());
        assert_eq!(outcome.moved, 0);
        let last = outcome.last_error.as_ref().expect("cycle error recorded");
        assert!(last.to_string().contains("UID MOVE failed"));
    }
}
