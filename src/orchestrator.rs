//! Orchestrator (C8): the per-account sequence from `spec.md` §4.8 —
//! authenticate, discover, list calendars, merge the remote list with
//! the stored one, run the clean-sync check, drive one notebook agent
//! per enabled calendar, and aggregate the result. Notebooks within an
//! account are synced one at a time: each owns the `&mut` borrow of the
//! `CalendarStore` while it runs, so true cross-notebook concurrency
//! would need an interior-mutability store the trait doesn't require —
//! a simplification over `spec.md` §5's "agents run concurrently",
//! recorded in `DESIGN.md`. The concurrency that *is* load-bearing (PUT
//! fan-out within one notebook's Upsync step) still happens inside
//! `notebook_agent::run`.

use std::path::Path;

use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::calendar_store::CalendarStore;
use crate::clean_sync::{self, CleanSyncStatus};
use crate::credential_store::CredentialStore;
use crate::dav::{CalendarInfo, DavClient};
use crate::error::{DavError, ItemFailure, SyncOutcome};
use crate::model::{Notebook, WatermarkStore};
use crate::{notebook_agent, settings, sync_window};

/// Per-account knobs that aren't part of the account's own stored
/// configuration: how many notebooks' PUTs may run concurrently, which
/// component this deployment syncs, and the clean-sync marker directory.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub base_dir: std::path::PathBuf,
    pub component: &'static str,
    pub max_upload_concurrency: usize,
    pub prev_months: Option<u32>,
    pub next_months: Option<u32>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            base_dir: std::path::PathBuf::from("."),
            component: "VEVENT",
            max_upload_concurrency: 4,
            prev_months: None,
            next_months: None,
        }
    }
}

fn notebook_id_for(account_id: &str, remote_path: &str) -> String {
    format!("{account_id}:{remote_path}")
}

/// Runs one full sync cycle for `account_id`: `spec.md` §4.8 steps 1-8.
#[instrument(skip(credentials, store, watermarks, config))]
pub async fn sync_account<S: CalendarStore, C: CredentialStore>(
    credentials: &mut C,
    store: &mut S,
    watermarks: &mut WatermarkStore,
    account_id: &str,
    config: &OrchestratorConfig,
) -> SyncOutcome {
    // Step 1: authenticate through the credential store.
    let Some(creds) = credentials.credentials(account_id) else {
        return SyncOutcome::InternalError(format!("no stored credentials for account {account_id}"));
    };

    let auth = settings::auth_method_for(
        &creds.server_address,
        creds.bearer_token.clone(),
        creds.username.clone(),
        creds.password.clone(),
    );
    let client = match DavClient::new(&creds.server_address, auth, creds.ignore_ssl_errors) {
        Ok(client) => client,
        Err(err) => return SyncOutcome::InternalError(err.to_string()),
    };

    // Step 2: discover principal + home + mailto.
    let discovery = match client.discover_user_principal(&creds.webdav_path).await {
        Ok(discovery) => discovery,
        Err(err) => return handle_account_error(credentials, account_id, &err),
    };

    // Step 3: list calendars, falling back to the stored list on failure.
    let home_href = discovery.home_href.clone().unwrap_or_else(|| creds.webdav_path.clone());
    let remote_calendars = match client.list_calendars(&home_href).await {
        Ok(calendars) => calendars,
        Err(err) => {
            warn!(account_id, error = %err, "list_calendars failed, falling back to stored calendar list");
            creds
                .enabled_calendar_paths
                .iter()
                .map(|path| fallback_calendar_info(path))
                .collect()
        }
    };

    // Step 4: merge the remote list with the stored one.
    let enabled: Vec<CalendarInfo> = remote_calendars
        .into_iter()
        .filter(|info| creds.enabled_calendar_paths.iter().any(|p| p == &info.remote_path))
        .collect();

    for info in &enabled {
        let notebook_id = notebook_id_for(account_id, &info.remote_path);
        let notebook = Notebook {
            id: notebook_id,
            account_id: account_id.to_string(),
            remote_path: info.remote_path.clone(),
            name: info.display_name.clone(),
            color: info.color.clone(),
            read_only: !info.privileges.write,
            sync_date: None,
        };
        if let Err(err) = store.upsert_notebook(notebook) {
            warn!(account_id, %err, "failed to upsert notebook");
            return SyncOutcome::DatabaseFailure;
        }
    }

    // Step 6: clean-sync-required check, once per account.
    let base_dir: &Path = &config.base_dir;
    match clean_sync::ensure_clean(base_dir, account_id, &[]) {
        Ok(CleanSyncStatus::PerformedBy(accounts)) => {
            for cleaned_account in &accounts {
                for notebook in store.notebooks_for_account(cleaned_account) {
                    let _ = store.remove_notebook(&notebook.id);
                }
            }
        }
        Ok(CleanSyncStatus::AlreadyClean) => {}
        Err(err) => {
            warn!(account_id, %err, "clean-sync marker check failed, proceeding without it");
        }
    }

    // Step 5: the sync window every quick-sync notebook agent is bounded to.
    let (window_start, window_end) = sync_window::compute(Utc::now(), config.prev_months, config.next_months);

    // Steps 7-8: drive one agent per enabled calendar, aggregate results.
    let mut outcomes = Vec::new();
    for info in &enabled {
        let notebook_id = notebook_id_for(account_id, &info.remote_path);
        let Some(notebook) = store.notebook(&notebook_id) else { continue };
        let window = if notebook.needs_slow_sync() { None } else { Some((window_start, window_end)) };

        let outcome = notebook_agent::run(
            &client,
            store,
            watermarks,
            &notebook_id,
            &info.remote_path,
            config.component,
            window,
            config.max_upload_concurrency,
        )
        .await;
        info!(account_id, notebook_id = %notebook_id, ?outcome, "notebook sync finished");
        if matches!(outcome, SyncOutcome::NotebookVanished) {
            if let Err(err) = store.remove_notebook(&notebook_id) {
                warn!(account_id, notebook_id = %notebook_id, %err, "failed to remove vanished notebook");
            }
            continue;
        }
        outcomes.push(outcome);
    }

    aggregate(credentials, account_id, outcomes)
}

fn fallback_calendar_info(remote_path: &str) -> CalendarInfo {
    CalendarInfo {
        remote_path: remote_path.to_string(),
        display_name: "Calendar".to_string(),
        description: None,
        color: None,
        user_principal: None,
        privileges: crate::dav::types::Privileges::read_write(),
        allowed_components: crate::dav::types::ComponentSet::default(),
    }
}

fn handle_account_error<C: CredentialStore>(credentials: &mut C, account_id: &str, err: &DavError) -> SyncOutcome {
    match err {
        DavError::AuthenticationRequired | DavError::AccessDenied => {
            credentials.mark_stale(account_id);
            SyncOutcome::AuthenticationFailure
        }
        DavError::Network(_) | DavError::Timeout | DavError::Tls(_) => SyncOutcome::ConnectionError,
        other => SyncOutcome::InternalError(other.to_string()),
    }
}

fn aggregate<C: CredentialStore>(
    credentials: &mut C,
    account_id: &str,
    outcomes: Vec<SyncOutcome>,
) -> SyncOutcome {
    let mut any_auth_failure = false;
    let mut any_connection_error = false;
    let mut any_database_failure = false;
    let mut item_failures: Vec<ItemFailure> = Vec::new();

    for outcome in outcomes {
        match outcome {
            SyncOutcome::Success | SyncOutcome::Cancelled => {}
            SyncOutcome::AuthenticationFailure => any_auth_failure = true,
            SyncOutcome::ConnectionError => any_connection_error = true,
            SyncOutcome::DatabaseFailure => any_database_failure = true,
            SyncOutcome::ItemFailures(mut failures) => item_failures.append(&mut failures),
            SyncOutcome::InternalError(_) => any_database_failure = true,
            // Filtered out by the caller before reaching `aggregate`; kept
            // here only so the match stays exhaustive.
            SyncOutcome::NotebookVanished => {}
        }
    }

    if any_auth_failure {
        credentials.mark_stale(account_id);
        return SyncOutcome::AuthenticationFailure;
    }
    if any_connection_error {
        return SyncOutcome::ConnectionError;
    }
    if any_database_failure {
        return SyncOutcome::DatabaseFailure;
    }
    if !item_failures.is_empty() {
        return SyncOutcome::ItemFailures(item_failures);
    }
    SyncOutcome::Success
}
