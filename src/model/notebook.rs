//! Notebook: the local calendar collection a remote CalDAV calendar is
//! mirrored into (`spec.md` §3).

/// A local notebook mirroring one remote calendar collection.
#[derive(Debug, Clone)]
pub struct Notebook {
    pub id: String,
    pub account_id: String,
    pub remote_path: String,
    pub name: String,
    pub color: Option<String>,
    pub read_only: bool,
    /// `None` until the first successful sync completes; drives the
    /// slow-sync vs. quick-sync choice in the notebook agent (`spec.md`
    /// §4.6).
    pub sync_date: Option<chrono::DateTime<chrono::Utc>>,
}

impl Notebook {
    pub fn needs_slow_sync(&self) -> bool {
        self.sync_date.is_none()
    }
}
