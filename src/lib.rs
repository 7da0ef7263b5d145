//! CalDAV bidirectional sync engine.
//!
//! Reconciles a local calendar store with one or more remote CalDAV
//! collections (RFC 4791): discovers a server's principal, calendar home
//! and calendar list, computes a six-way delta between local and remote
//! state per notebook, and drives the upload/download/delete cycle that
//! brings both sides into agreement. Built on the same `hyper`/`rustls`/
//! `tokio` stack as a plain CalDAV client, plus the sync-specific layers
//! a client alone doesn't need: a typed error taxonomy, a watermark
//! side-table replacing comment-encoded sync state, and an orchestrator
//! that drives one agent per notebook.
//!
//! # Layout
//!
//! - [`dav`] — the wire layer: request bodies, the multistatus XML
//!   reader, and the [`dav::DavClient`] facade (C2-C5).
//! - [`model`] — the local data model: [`model::Incidence`],
//!   [`model::Notebook`], [`model::WatermarkStore`], and the incidence
//!   handler's property reconciliation/export logic (C6).
//! - [`delta`] — the pure six-set delta calculation (C7's core).
//! - [`notebook_agent`] — drives one notebook's sync cycle end to end.
//! - [`clean_sync`] and [`sync_window`] — the cross-process clean-sync
//!   marker and the quick-sync time-range computation.
//! - [`orchestrator`] — the per-account sequence (C8).
//! - [`settings`] — the read-only account configuration contract and the
//!   `AuthMethod`/`DavClient` it resolves to.
//! - [`calendar_store`] and [`credential_store`] — the two external
//!   boundaries a host application implements.
//! - [`error`] — [`error::DavError`] and the per-account [`error::SyncOutcome`].
//!
//! # Example
//!
//! ```no_run
//! use caldav_sync_rs::calendar_store::MemoryCalendarStore;
//! use caldav_sync_rs::credential_store::{AccountCredentials, CredentialStore};
//! use caldav_sync_rs::model::WatermarkStore;
//! use caldav_sync_rs::orchestrator::{self, OrchestratorConfig};
//!
//! struct StaticCredentials(AccountCredentials);
//! impl CredentialStore for StaticCredentials {
//!     fn credentials(&self, _account_id: &str) -> Option<AccountCredentials> {
//!         Some(self.0.clone())
//!     }
//!     fn mark_stale(&mut self, _account_id: &str) {}
//! }
//!
//! # async fn run() {
//! let mut credentials = StaticCredentials(AccountCredentials {
//!     account_id: "acct-1".into(),
//!     server_address: "https://caldav.example.com".into(),
//!     webdav_path: "/".into(),
//!     bearer_token: None,
//!     username: Some("user".into()),
//!     password: Some("pass".into()),
//!     ignore_ssl_errors: false,
//!     enabled_calendar_paths: vec!["/calendars/personal/".into()],
//! });
//! let mut store = MemoryCalendarStore::new();
//! let mut watermarks = WatermarkStore::new();
//! let config = OrchestratorConfig::default();
//!
//! let outcome = orchestrator::sync_account(
//!     &mut credentials,
//!     &mut store,
//!     &mut watermarks,
//!     "acct-1",
//!     &config,
//! )
//! .await;
//! # let _ = outcome;
//! # }
//! ```

pub mod calendar_store;
pub mod clean_sync;
pub mod common;
pub mod credential_store;
pub mod dav;
pub mod delta;
pub mod error;
pub mod model;
pub mod notebook_agent;
pub mod orchestrator;
pub mod settings;
pub mod sync_window;
