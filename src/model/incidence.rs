//! In-memory incidence representation and the watermark side-table that
//! replaces the original comment-encoded `buteo:caldav:uri:`/`etag:`
//! markers (`spec.md` §3, §9 "Watermarks-in-comments").

use std::collections::HashMap;

use icalendar::{Component, Event};

/// The component kind an incidence carries. `spec.md`'s delta algorithm is
/// component-agnostic; only VEVENT is exercised end-to-end by this crate's
/// tests, but the type is kept open per `spec.md` §4.2's three-component
/// `ComponentSet`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Event,
    Todo,
    Journal,
}

/// Identity of one incidence: a series parent has `recurrence_id: None`;
/// a persistent exception occurrence shares the parent's `uid` and carries
/// its own `recurrence_id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IncidenceId {
    pub uid: String,
    pub recurrence_id: Option<String>,
}

/// A locally-stored incidence. Wraps the `icalendar` crate's typed `Event`
/// for the common RFC 5545 fields; properties this engine doesn't need to
/// reason about structurally (alarms, attachments, timezone components)
/// ride along unexamined inside `event` and survive a clone untouched.
#[derive(Debug, Clone)]
pub struct Incidence {
    pub kind: Kind,
    pub event: Event,
}

impl Incidence {
    pub fn uid(&self) -> Option<&str> {
        self.event.get_uid()
    }

    pub fn recurrence_id(&self) -> Option<&str> {
        self.event.property_value("RECURRENCE-ID")
    }

    pub fn id(&self) -> Option<IncidenceId> {
        self.uid().map(|uid| IncidenceId {
            uid: uid.to_string(),
            recurrence_id: self.recurrence_id().map(str::to_string),
        })
    }

    pub fn is_recurring(&self) -> bool {
        self.event.property_value("RRULE").is_some() || self.event.property_value("RDATE").is_some()
    }
}

/// First-class replacement for the original's three comment markers
/// (`buteo:caldav:uri:`, `buteo:caldav:etag:`, `buteo:caldav:detached-and-synced`).
/// One entry per synced incidence identity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Watermark {
    pub uri: Option<String>,
    pub etag: Option<String>,
    /// True once this occurrence has been round-tripped through the server
    /// at least once since it was detached from its series by the sync
    /// engine itself (as opposed to detached by the user locally, which
    /// leaves this `false`).
    pub detached_and_synced: bool,
}

impl Watermark {
    pub fn is_empty(&self) -> bool {
        self.uri.is_none() && self.etag.is_none() && !self.detached_and_synced
    }
}

/// Keyed by `(notebook_id, uid, recurrence_id)`, per `SPEC_FULL.md` §3.
#[derive(Debug, Clone, Default)]
pub struct WatermarkStore {
    entries: HashMap<(String, String, Option<String>), Watermark>,
}

impl WatermarkStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(notebook_id: &str, id: &IncidenceId) -> (String, String, Option<String>) {
        (notebook_id.to_string(), id.uid.clone(), id.recurrence_id.clone())
    }

    pub fn get(&self, notebook_id: &str, id: &IncidenceId) -> Watermark {
        self.entries.get(&Self::key(notebook_id, id)).cloned().unwrap_or_default()
    }

    pub fn set(&mut self, notebook_id: &str, id: &IncidenceId, watermark: Watermark) {
        if watermark.is_empty() {
            self.entries.remove(&Self::key(notebook_id, id));
        } else {
            self.entries.insert(Self::key(notebook_id, id), watermark);
        }
    }

    pub fn set_uri_and_etag(&mut self, notebook_id: &str, id: &IncidenceId, uri: String, etag: String) {
        let mut watermark = self.get(notebook_id, id);
        watermark.uri = Some(uri);
        watermark.etag = Some(etag);
        if id.recurrence_id.is_some() {
            watermark.detached_and_synced = true;
        }
        self.set(notebook_id, id, watermark);
    }

    pub fn remove(&mut self, notebook_id: &str, id: &IncidenceId) {
        self.entries.remove(&Self::key(notebook_id, id));
    }

    /// True iff `id` has a `recurrence_id` but no `detached_and_synced`
    /// watermark yet — a user-detached occurrence the engine hasn't
    /// round-tripped through the server, per the original's
    /// `isCopiedDetachedIncidence` check.
    pub fn is_copied_detached(&self, notebook_id: &str, id: &IncidenceId) -> bool {
        id.recurrence_id.is_some() && !self.get(notebook_id, id).detached_and_synced
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watermark_store_round_trips() {
        let mut store = WatermarkStore::new();
        let id = IncidenceId { uid: "abc".into(), recurrence_id: None };
        assert!(store.get("nb1", &id).is_empty());
        store.set_uri_and_etag("nb1", &id, "abc.ics".into(), "\"1\"".into());
        let wm = store.get("nb1", &id);
        assert_eq!(wm.uri.as_deref(), Some("abc.ics"));
        assert_eq!(wm.etag.as_deref(), Some("\"1\""));
        assert!(!wm.detached_and_synced);
    }

    #[test]
    fn detached_occurrence_marks_detached_and_synced_on_first_sync() {
        let mut store = WatermarkStore::new();
        let id = IncidenceId { uid: "abc".into(), recurrence_id: Some("20260101T000000Z".into()) };
        assert!(store.is_copied_detached("nb1", &id));
        store.set_uri_and_etag("nb1", &id, "abc.ics".into(), "\"1\"".into());
        assert!(!store.is_copied_detached("nb1", &id));
    }
}
