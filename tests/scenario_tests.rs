//! Wiremock-backed notebook sync agent scenarios (`spec.md` §8, S1-S6).
//! Each test drives `notebook_agent::run` directly against a mock CalDAV
//! server and a purpose-built `CalendarStore` double that lets a scenario
//! control exactly what `modified_since`/`deleted_since` report, since the
//! crate's own `MemoryCalendarStore` always reports an empty delta for
//! both (it has no concept of "since").

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use icalendar::{Calendar, Component, Event};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use caldav_sync_rs::calendar_store::CalendarStore;
use caldav_sync_rs::dav::{AuthMethod, DavClient};
use caldav_sync_rs::error::SyncOutcome;
use caldav_sync_rs::model::{Incidence, IncidenceId, Kind, Notebook, WatermarkStore};
use caldav_sync_rs::notebook_agent;

const CALENDAR_HREF: &str = "/cal/";

struct ScenarioStore {
    notebook: Notebook,
    incidences: HashMap<(String, Option<String>), Incidence>,
    modified: Vec<Incidence>,
    deleted: Vec<IncidenceId>,
    sync_date_set: Option<DateTime<Utc>>,
}

impl ScenarioStore {
    fn new(notebook: Notebook) -> Self {
        Self { notebook, incidences: HashMap::new(), modified: Vec::new(), deleted: Vec::new(), sync_date_set: None }
    }

    fn with_incidence(mut self, incidence: Incidence) -> Self {
        let id = incidence.id().expect("test incidence must carry a UID");
        self.incidences.insert((id.uid, id.recurrence_id), incidence);
        self
    }

    fn with_modified(mut self, incidence: Incidence) -> Self {
        self.modified.push(incidence);
        self
    }

    fn with_deleted(mut self, id: IncidenceId) -> Self {
        self.deleted.push(id);
        self
    }
}

impl CalendarStore for ScenarioStore {
    fn notebook(&self, _notebook_id: &str) -> Option<Notebook> {
        Some(self.notebook.clone())
    }

    fn notebooks_for_account(&self, _account_id: &str) -> Vec<Notebook> {
        vec![self.notebook.clone()]
    }

    fn upsert_notebook(&mut self, notebook: Notebook) -> anyhow::Result<()> {
        self.notebook = notebook;
        Ok(())
    }

    fn remove_notebook(&mut self, _notebook_id: &str) -> anyhow::Result<()> {
        Ok(())
    }

    fn all_incidences(&self, _notebook_id: &str) -> Vec<Incidence> {
        self.incidences.values().cloned().collect()
    }

    fn added_since(&self, _notebook_id: &str, _since: Option<DateTime<Utc>>) -> Vec<Incidence> {
        Vec::new()
    }

    fn modified_since(&self, _notebook_id: &str, _since: Option<DateTime<Utc>>) -> Vec<Incidence> {
        self.modified.clone()
    }

    fn deleted_since(&self, _notebook_id: &str, _since: Option<DateTime<Utc>>) -> Vec<IncidenceId> {
        self.deleted.clone()
    }

    fn upsert_incidence(&mut self, _notebook_id: &str, incidence: Incidence) -> anyhow::Result<()> {
        let id = incidence.id().expect("upserted incidence must carry a UID");
        self.incidences.insert((id.uid, id.recurrence_id), incidence);
        Ok(())
    }

    fn remove_incidence(&mut self, _notebook_id: &str, id: &IncidenceId) -> anyhow::Result<()> {
        self.incidences.remove(&(id.uid.clone(), id.recurrence_id.clone()));
        Ok(())
    }

    fn set_sync_date(&mut self, _notebook_id: &str, when: DateTime<Utc>) -> anyhow::Result<()> {
        self.sync_date_set = Some(when);
        Ok(())
    }
}

fn synced_notebook() -> Notebook {
    Notebook {
        id: "nb-1".to_string(),
        account_id: "acct-1".to_string(),
        remote_path: CALENDAR_HREF.to_string(),
        name: "Personal".to_string(),
        color: None,
        read_only: false,
        sync_date: Some(Utc::now() - chrono::Duration::days(1)),
    }
}

fn event(uid: &str, summary: &str) -> Event {
    let mut e = Event::new();
    e.uid(uid);
    e.summary(summary);
    e.add_property("DTSTART", "20260801T090000Z");
    e
}

fn incidence(uid: &str, summary: &str) -> Incidence {
    Incidence { kind: Kind::Event, event: event(uid, summary) }
}

fn exception(uid: &str, recurrence_id: &str, summary: &str) -> Incidence {
    let mut e = event(uid, summary);
    e.add_property("RECURRENCE-ID", recurrence_id);
    Incidence { kind: Kind::Event, event: e }
}

fn empty_multistatus() -> String {
    r#"<?xml version="1.0"?><D:multistatus xmlns:D="DAV:"></D:multistatus>"#.to_string()
}

fn etag_multistatus(entries: &[(&str, &str)]) -> String {
    let responses: String = entries
        .iter()
        .map(|(href, etag)| {
            format!(
                r#"<D:response>
  <D:href>{href}</D:href>
  <D:propstat>
    <D:prop><D:getetag>{etag}</D:getetag></D:prop>
    <D:status>HTTP/1.1 200 OK</D:status>
  </D:propstat>
</D:response>"#
            )
        })
        .collect();
    format!(r#"<?xml version="1.0"?><D:multistatus xmlns:D="DAV:">{responses}</D:multistatus>"#)
}

fn calendar_data_multistatus(href: &str, etag: &str, ical: &str) -> String {
    format!(
        r#"<?xml version="1.0"?>
<D:multistatus xmlns:D="DAV:" xmlns:C="urn:ietf:params:xml:ns:caldav">
<D:response>
  <D:href>{href}</D:href>
  <D:propstat>
    <D:prop>
      <D:getetag>{etag}</D:getetag>
      <C:calendar-data>{ical}</C:calendar-data>
    </D:prop>
    <D:status>HTTP/1.1 200 OK</D:status>
  </D:propstat>
</D:response>
</D:multistatus>"#
    )
}

async fn run_agent(mock_server: &MockServer, store: &mut ScenarioStore, watermarks: &mut WatermarkStore) -> SyncOutcome {
    let client = DavClient::new(&mock_server.uri(), AuthMethod::None, false).unwrap();
    notebook_agent::run(&client, store, watermarks, "nb-1", CALENDAR_HREF, "VEVENT", None, 4).await
}

#[tokio::test]
async fn s1_quick_sync_with_no_changes_is_a_no_op() {
    let mock_server = MockServer::start().await;
    Mock::given(method("PROPFIND"))
        .and(path(CALENDAR_HREF))
        .and(header("Depth", "1"))
        .respond_with(ResponseTemplate::new(207).set_body_raw(
            etag_multistatus(&[("/cal/1.ics", "\"a1\"")]),
            "application/xml",
        ))
        .expect(1)
        .mount(&mock_server)
        .await;

    let mut store = ScenarioStore::new(synced_notebook()).with_incidence(incidence("1", "Unchanged"));
    let mut watermarks = WatermarkStore::new();
    let id = IncidenceId { uid: "1".to_string(), recurrence_id: None };
    watermarks.set_uri_and_etag("nb-1", &id, "/cal/1.ics".to_string(), "\"a1\"".to_string());

    let outcome = run_agent(&mock_server, &mut store, &mut watermarks).await;
    assert!(matches!(outcome, SyncOutcome::Success));
    assert_eq!(store.incidences.len(), 1);
}

#[tokio::test]
async fn s2_local_addition_is_uploaded_with_if_none_match() {
    let mock_server = MockServer::start().await;
    Mock::given(method("PROPFIND"))
        .and(path(CALENDAR_HREF))
        .respond_with(ResponseTemplate::new(207).set_body_raw(empty_multistatus(), "application/xml"))
        .mount(&mock_server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/cal/e1.ics"))
        .and(header("If-None-Match", "*"))
        .respond_with(ResponseTemplate::new(201).insert_header("ETag", "\"b1\""))
        .expect(1)
        .mount(&mock_server)
        .await;

    let mut store = ScenarioStore::new(synced_notebook()).with_incidence(incidence("e1", "New event"));
    let mut watermarks = WatermarkStore::new();

    let outcome = run_agent(&mock_server, &mut store, &mut watermarks).await;
    assert!(matches!(outcome, SyncOutcome::Success));

    let id = IncidenceId { uid: "e1".to_string(), recurrence_id: None };
    let watermark = watermarks.get("nb-1", &id);
    assert_eq!(watermark.uri.as_deref(), Some("/cal/e1.ics"));
    assert_eq!(watermark.etag.as_deref(), Some("\"b1\""));
}

#[tokio::test]
async fn s3_remote_deletion_conflict_wins_over_local_modification() {
    let mock_server = MockServer::start().await;
    Mock::given(method("PROPFIND"))
        .and(path(CALENDAR_HREF))
        .respond_with(ResponseTemplate::new(207).set_body_raw(empty_multistatus(), "application/xml"))
        .mount(&mock_server)
        .await;

    let notebook = synced_notebook();
    let modified = incidence("x", "Locally edited");
    let mut store = ScenarioStore::new(notebook).with_incidence(modified.clone()).with_modified(modified);
    let mut watermarks = WatermarkStore::new();
    let id = IncidenceId { uid: "x".to_string(), recurrence_id: None };
    watermarks.set_uri_and_etag("nb-1", &id, "/cal/x.ics".to_string(), "\"old\"".to_string());

    let outcome = run_agent(&mock_server, &mut store, &mut watermarks).await;
    assert!(matches!(outcome, SyncOutcome::Success));
    assert!(store.incidences.is_empty());
    assert!(watermarks.get("nb-1", &id).is_empty());
}

#[tokio::test]
async fn s4_spurious_local_modification_is_demoted_after_semantic_compare() {
    let mock_server = MockServer::start().await;
    let mut wire_calendar = Calendar::new();
    wire_calendar.push(event("y", "Same content"));
    let calendar = wire_calendar.to_string();

    Mock::given(method("PROPFIND"))
        .and(path(CALENDAR_HREF))
        .respond_with(ResponseTemplate::new(207).set_body_raw(
            etag_multistatus(&[("/cal/y.ics", "\"same\"")]),
            "application/xml",
        ))
        .mount(&mock_server)
        .await;
    Mock::given(method("REPORT"))
        .and(path(CALENDAR_HREF))
        .respond_with(ResponseTemplate::new(207).set_body_raw(
            calendar_data_multistatus("/cal/y.ics", "\"same\"", &calendar),
            "application/xml",
        ))
        .expect(1)
        .mount(&mock_server)
        .await;

    let local = incidence("y", "Same content");
    let notebook = synced_notebook();
    let mut store = ScenarioStore::new(notebook).with_incidence(local.clone()).with_modified(local);
    let mut watermarks = WatermarkStore::new();
    let id = IncidenceId { uid: "y".to_string(), recurrence_id: None };
    watermarks.set_uri_and_etag("nb-1", &id, "/cal/y.ics".to_string(), "\"same\"".to_string());

    let outcome = run_agent(&mock_server, &mut store, &mut watermarks).await;
    assert!(matches!(outcome, SyncOutcome::Success));
    // Semantic equality demoted the spurious modification: no PUT mock was
    // registered above, so a PUT attempt would have failed the request.
}

#[tokio::test]
async fn s5_exception_only_deletion_becomes_a_series_modification() {
    let mock_server = MockServer::start().await;
    Mock::given(method("PROPFIND"))
        .and(path(CALENDAR_HREF))
        .respond_with(ResponseTemplate::new(207).set_body_raw(
            etag_multistatus(&[("/cal/s.ics", "\"s1\"")]),
            "application/xml",
        ))
        .mount(&mock_server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/cal/s.ics"))
        .respond_with(ResponseTemplate::new(204).insert_header("ETag", "\"s2\""))
        .expect(1)
        .mount(&mock_server)
        .await;
    // An exception shares its parent's href; deleting one must never issue
    // a DELETE against that shared resource.
    Mock::given(method("DELETE")).and(path("/cal/s.ics")).expect(0).mount(&mock_server).await;

    let parent = incidence("s", "Standup");
    let kept_exception = exception("s", "20260802T090000Z", "Standup (moved)");
    let deleted_exception = exception("s", "20260801T090000Z", "Standup (cancelled once)");
    let deleted_id = deleted_exception.id().unwrap();

    let notebook = synced_notebook();
    let mut store = ScenarioStore::new(notebook)
        .with_incidence(parent.clone())
        .with_incidence(kept_exception.clone())
        .with_deleted(deleted_id.clone());
    let mut watermarks = WatermarkStore::new();
    for inc in [&parent, &kept_exception, &deleted_exception] {
        let id = inc.id().unwrap();
        watermarks.set_uri_and_etag("nb-1", &id, "/cal/s.ics".to_string(), "\"s1\"".to_string());
    }

    let outcome = run_agent(&mock_server, &mut store, &mut watermarks).await;
    assert!(matches!(outcome, SyncOutcome::Success), "{outcome:?}");

    assert!(watermarks.get("nb-1", &deleted_id).is_empty());
    let kept_id = kept_exception.id().unwrap();
    assert_eq!(watermarks.get("nb-1", &kept_id).etag.as_deref(), Some("\"s2\""));
    assert_eq!(store.incidences.len(), 2);
}

#[tokio::test]
async fn s6_vanished_remote_calendar_flags_the_notebook_for_removal() {
    let mock_server = MockServer::start().await;
    Mock::given(method("PROPFIND"))
        .and(path(CALENDAR_HREF))
        .respond_with(ResponseTemplate::new(404))
        .mount(&mock_server)
        .await;

    let mut store = ScenarioStore::new(synced_notebook());
    let mut watermarks = WatermarkStore::new();

    let outcome = run_agent(&mock_server, &mut store, &mut watermarks).await;
    assert!(matches!(outcome, SyncOutcome::NotebookVanished));
}

#[tokio::test]
async fn s7_put_response_without_etag_is_resolved_via_followup_multiget() {
    let mock_server = MockServer::start().await;
    Mock::given(method("PROPFIND"))
        .and(path(CALENDAR_HREF))
        .respond_with(ResponseTemplate::new(207).set_body_raw(empty_multistatus(), "application/xml"))
        .mount(&mock_server)
        .await;
    // No `ETag` header on the PUT response: the agent must not watermark
    // this resource with an empty etag, and must instead refetch it.
    Mock::given(method("PUT"))
        .and(path("/cal/e2.ics"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("REPORT"))
        .and(path(CALENDAR_HREF))
        .respond_with(ResponseTemplate::new(207).set_body_raw(
            etag_multistatus(&[("/cal/e2.ics", "\"real-etag\"")]),
            "application/xml",
        ))
        .expect(1)
        .mount(&mock_server)
        .await;

    let mut store = ScenarioStore::new(synced_notebook()).with_incidence(incidence("e2", "New event"));
    let mut watermarks = WatermarkStore::new();

    let outcome = run_agent(&mock_server, &mut store, &mut watermarks).await;
    assert!(matches!(outcome, SyncOutcome::Success), "{outcome:?}");

    let id = IncidenceId { uid: "e2".to_string(), recurrence_id: None };
    let watermark = watermarks.get("nb-1", &id);
    assert_eq!(watermark.uri.as_deref(), Some("/cal/e2.ics"));
    assert_eq!(watermark.etag.as_deref(), Some("\"real-etag\""));
}
