//! `CalendarStore`: the boundary to local calendar storage. Persisting
//! incidences to disk/database is explicitly out of scope for this crate
//! (`spec.md` §1) — this trait is the seam a host application implements,
//! and the in-memory `MemoryCalendarStore` below is a reference
//! implementation used by this crate's own tests.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::model::{Incidence, IncidenceId, Notebook};

/// Local storage operations the sync engine needs from a notebook.
/// Implementations are expected to be cheap to call repeatedly within one
/// sync cycle; the engine does not cache results across calls.
pub trait CalendarStore: Send + Sync {
    fn notebook(&self, notebook_id: &str) -> Option<Notebook>;

    /// Every notebook currently bound to `account_id` (orchestrator's
    /// merge-with-stored-list step, `spec.md` §4.8 step 4).
    fn notebooks_for_account(&self, account_id: &str) -> Vec<Notebook>;

    /// Creates the notebook if `notebook.id` is new, otherwise updates its
    /// name/color/read_only/remote_path in place. Never touches
    /// `sync_date` or stored incidences.
    fn upsert_notebook(&mut self, notebook: Notebook) -> anyhow::Result<()>;

    /// Deletes the notebook and every incidence/watermark bound to it —
    /// used when a collection's 404s out or an account is cleaned.
    fn remove_notebook(&mut self, notebook_id: &str) -> anyhow::Result<()>;

    /// Every incidence currently stored in the notebook (slow-sync read).
    fn all_incidences(&self, notebook_id: &str) -> Vec<Incidence>;

    /// Incidences added since `since` with no watermark recorded yet.
    fn added_since(&self, notebook_id: &str, since: Option<DateTime<Utc>>) -> Vec<Incidence>;

    /// Incidences whose content changed since `since`.
    fn modified_since(&self, notebook_id: &str, since: Option<DateTime<Utc>>) -> Vec<Incidence>;

    /// Identities deleted locally since `since`. The watermark lookup
    /// needs only uid + recurrence id, not the deleted content itself.
    fn deleted_since(&self, notebook_id: &str, since: Option<DateTime<Utc>>) -> Vec<IncidenceId>;

    fn upsert_incidence(&mut self, notebook_id: &str, incidence: Incidence) -> anyhow::Result<()>;
    fn remove_incidence(&mut self, notebook_id: &str, id: &IncidenceId) -> anyhow::Result<()>;
    fn set_sync_date(&mut self, notebook_id: &str, when: DateTime<Utc>) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
struct NotebookRecord {
    notebook: Notebook,
    incidences: HashMap<(String, Option<String>), Incidence>,
}

/// In-memory reference implementation, used by this crate's own test
/// suite in place of a real on-device database.
#[derive(Debug, Default)]
pub struct MemoryCalendarStore {
    notebooks: HashMap<String, NotebookRecord>,
}

impl MemoryCalendarStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_notebook(&mut self, notebook: Notebook) {
        self.notebooks.insert(
            notebook.id.clone(),
            NotebookRecord { notebook, incidences: HashMap::new() },
        );
    }
}

fn incidence_key(incidence: &Incidence) -> (String, Option<String>) {
    let id = incidence.id().expect("incidence must carry a UID");
    (id.uid, id.recurrence_id)
}

impl CalendarStore for MemoryCalendarStore {
    fn notebook(&self, notebook_id: &str) -> Option<Notebook> {
        self.notebooks.get(notebook_id).map(|r| r.notebook.clone())
    }

    fn notebooks_for_account(&self, account_id: &str) -> Vec<Notebook> {
        self.notebooks
            .values()
            .map(|r| &r.notebook)
            .filter(|n| n.account_id == account_id)
            .cloned()
            .collect()
    }

    fn upsert_notebook(&mut self, notebook: Notebook) -> anyhow::Result<()> {
        match self.notebooks.get_mut(&notebook.id) {
            Some(record) => {
                let sync_date = record.notebook.sync_date;
                record.notebook = notebook;
                record.notebook.sync_date = sync_date;
            }
            None => self.add_notebook(notebook),
        }
        Ok(())
    }

    fn remove_notebook(&mut self, notebook_id: &str) -> anyhow::Result<()> {
        self.notebooks.remove(notebook_id);
        Ok(())
    }

    fn all_incidences(&self, notebook_id: &str) -> Vec<Incidence> {
        self.notebooks
            .get(notebook_id)
            .map(|r| r.incidences.values().cloned().collect())
            .unwrap_or_default()
    }

    fn added_since(&self, notebook_id: &str, _since: Option<DateTime<Utc>>) -> Vec<Incidence> {
        self.all_incidences(notebook_id)
    }

    fn modified_since(&self, _notebook_id: &str, _since: Option<DateTime<Utc>>) -> Vec<Incidence> {
        Vec::new()
    }

    fn deleted_since(&self, _notebook_id: &str, _since: Option<DateTime<Utc>>) -> Vec<IncidenceId> {
        Vec::new()
    }

    fn upsert_incidence(&mut self, notebook_id: &str, incidence: Incidence) -> anyhow::Result<()> {
        let record = self
            .notebooks
            .get_mut(notebook_id)
            .ok_or_else(|| anyhow::anyhow!("unknown notebook {notebook_id}"))?;
        record.incidences.insert(incidence_key(&incidence), incidence);
        Ok(())
    }

    fn remove_incidence(&mut self, notebook_id: &str, id: &IncidenceId) -> anyhow::Result<()> {
        let record = self
            .notebooks
            .get_mut(notebook_id)
            .ok_or_else(|| anyhow::anyhow!("unknown notebook {notebook_id}"))?;
        record.incidences.remove(&(id.uid.clone(), id.recurrence_id.clone()));
        Ok(())
    }

    fn set_sync_date(&mut self, notebook_id: &str, when: DateTime<Utc>) -> anyhow::Result<()> {
        let record = self
            .notebooks
            .get_mut(notebook_id)
            .ok_or_else(|| anyhow::anyhow!("unknown notebook {notebook_id}"))?;
        record.notebook.sync_date = Some(when);
        Ok(())
    }
}
