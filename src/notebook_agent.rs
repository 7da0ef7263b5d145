//! Notebook agent (C7): drives one notebook's sync cycle end to end —
//! fetch remote state, compute the delta, push local changes up, pull
//! remote changes down, and record the new watermarks. Grounded in
//! `NotebookSyncAgent::startSync` or the original plugin, with the
//! bounded-concurrency upload/download fan-out following the teacher's
//! `propfind_many`/`report_many` pattern (`caldav/client.rs`).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use icalendar::{Calendar as IcalCalendar, CalendarComponent};
use tokio::sync::Semaphore;
use tracing::{instrument, warn};

use crate::calendar_store::CalendarStore;
use crate::dav::client::DavClient;
use crate::delta::{self, DeltaInput, LocalEntry, RemoteEntry};
use crate::error::{DeleteOutcome, ItemFailure, PutOutcome, SyncOutcome};
use crate::model::incidence_handler;
use crate::model::{Incidence, IncidenceId, Kind, WatermarkStore};

/// The phases a notebook agent passes through, used only to label
/// tracing spans — control flow itself is plain sequential `async`, not
/// an explicit state machine type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Fetching,
    Delta,
    Upsync,
    Applying,
    Postsync,
}

impl Phase {
    fn as_str(self) -> &'static str {
        match self {
            Phase::Fetching => "fetching",
            Phase::Delta => "delta",
            Phase::Upsync => "upsync",
            Phase::Applying => "applying",
            Phase::Postsync => "postsync",
        }
    }
}

/// Runs one full sync cycle for `notebook_id` against `calendar_href`.
/// `component` selects which `ICalendar` component REPORT queries filter
/// on (`"VEVENT"`, `"VTODO"`, `"VJOURNAL"`). `window` bounds a quick sync
/// to a time range (`spec.md` §4.8 step 5); `None` forces a full,
/// unbounded calendar-query (used for the first, slow sync of a
/// notebook).
#[instrument(skip(client, store, watermarks, window))]
pub async fn run<S: CalendarStore>(
    client: &DavClient,
    store: &mut S,
    watermarks: &mut WatermarkStore,
    notebook_id: &str,
    calendar_href: &str,
    component: &str,
    window: Option<(chrono::DateTime<Utc>, chrono::DateTime<Utc>)>,
    max_concurrency: usize,
) -> SyncOutcome {
    let Some(notebook) = store.notebook(notebook_id) else {
        return SyncOutcome::InternalError(format!("unknown notebook {notebook_id}"));
    };
    let slow_sync = notebook.needs_slow_sync();

    let _phase = tracing::info_span!("phase", name = Phase::Fetching.as_str()).entered();

    let remote_resources = if slow_sync {
        client.get_calendar_resources_all(calendar_href, component).await
    } else if let Some((start, end)) = window {
        client.get_calendar_resources_window(calendar_href, component, start, end).await
    } else {
        client.get_calendar_etags(calendar_href).await
    };
    let remote_resources = match remote_resources {
        Ok(r) => r,
        Err(crate::error::DavError::NotFound) => {
            warn!(notebook_id, "remote calendar collection vanished, flagging notebook for removal");
            return SyncOutcome::NotebookVanished;
        }
        Err(err) => return outcome_from_dav_error(&err),
    };
    drop(_phase);

    let mut prefetched_bodies: HashMap<String, (String, String)> = HashMap::new();
    for r in &remote_resources {
        if let (Some(data), Some(etag)) = (&r.data, &r.etag) {
            prefetched_bodies.insert(r.href.clone(), (data.clone(), etag.clone()));
        }
    }

    let _phase = tracing::info_span!("phase", name = Phase::Delta.as_str()).entered();
    let all_local = store.all_incidences(notebook_id);
    let locally_deleted = store.deleted_since(notebook_id, notebook.sync_date);
    let locally_modified = store.modified_since(notebook_id, notebook.sync_date);

    let all_local_entries: Vec<LocalEntry> = all_local
        .iter()
        .filter_map(|inc| inc.id())
        .map(|id| {
            let watermark = watermarks.get(notebook_id, &id);
            LocalEntry { id, watermark }
        })
        .collect();
    let locally_deleted_entries: Vec<LocalEntry> = locally_deleted
        .iter()
        .map(|id| {
            let watermark = watermarks.get(notebook_id, id);
            LocalEntry { id: id.clone(), watermark }
        })
        .collect();
    let locally_modified_entries: Vec<LocalEntry> = locally_modified
        .iter()
        .filter_map(|inc| inc.id())
        .map(|id| {
            let watermark = watermarks.get(notebook_id, &id);
            LocalEntry { id, watermark }
        })
        .collect();
    let remote_entries: Vec<RemoteEntry> = remote_resources
        .iter()
        .map(|r| RemoteEntry { href: r.href.clone(), etag: r.etag.clone().unwrap_or_default() })
        .collect();

    let mut result = delta::compute(DeltaInput {
        all_local: &all_local_entries,
        locally_deleted: &locally_deleted_entries,
        locally_modified: &locally_modified_entries,
        remote: &remote_entries,
        remote_calendar_path: calendar_href,
    });
    drop(_phase);

    let mut failures = Vec::new();

    // Upsync: push local additions/modifications (grouped by series) and
    // local deletions to the server. Skipped entirely for a read-only
    // collection — there is nothing this side is allowed to write.
    if !notebook.read_only {
        let _phase = tracing::info_span!("phase", name = Phase::Upsync.as_str()).entered();
        let by_uid = index_by_uid(&all_local);

        // A deleted recurrence exception isn't a standalone resource: it
        // shares its parent's href, so deleting it must re-upload the
        // series minus that instance rather than DELETE the shared
        // resource. `by_uid` (built from the current local store) already
        // excludes the deleted instance, so routing its uid through the
        // normal upload path produces the right body; it's stripped out of
        // `result.local_deletions` below so the DELETE pass doesn't also
        // fire for it.
        let mut touched_uids: Vec<String> = result
            .local_additions
            .iter()
            .chain(result.local_modifications.iter())
            .chain(result.local_deletions.iter().filter(|id| id.recurrence_id.is_some()))
            .map(|id| id.uid.clone())
            .collect();
        touched_uids.sort();
        touched_uids.dedup();

        let sem = Arc::new(Semaphore::new(max_concurrency.max(1)));
        let mut tasks = FuturesUnordered::new();
        for uid in touched_uids {
            let Some(incidences) = by_uid.get(&uid) else { continue };
            let Some(parent) = incidences.iter().find(|i| i.recurrence_id().is_none()) else {
                warn!(uid, "touched series has no parent incidence locally, skipping upsync");
                continue;
            };
            let instances: Vec<Incidence> =
                incidences.iter().filter(|i| i.recurrence_id().is_some()).cloned().collect();
            let parent_id = IncidenceId { uid: uid.clone(), recurrence_id: None };
            let watermark = watermarks.get(notebook_id, &parent_id);
            let href = watermark
                .uri
                .clone()
                .unwrap_or_else(|| format!("{calendar_href}{uid}.ics"));
            let expected_etag = watermark.etag.clone();
            let ics = incidence_handler::to_ics(parent, &instances);

            let sem = sem.clone();
            tasks.push(async move {
                let _permit = sem.acquire_owned().await.expect("semaphore closed");
                let outcome = client.send_calendar_resource(&href, &ics, expected_etag.as_deref()).await;
                (uid, href, outcome)
            });
        }

        // Servers that omit the `ETag` header on a PUT response leave the
        // freshly-uploaded resource's real etag unknown; those hrefs are
        // refetched in one follow-up multiget below (`spec.md` §4.2/§4.6)
        // rather than watermarked with an empty etag, which would make the
        // resource look spuriously remote-modified on every later sync.
        let mut missing_etag: Vec<(String, String)> = Vec::new();

        while let Some((uid, href, outcome)) = tasks.next().await {
            match outcome {
                Ok(PutOutcome::Created { etag } | PutOutcome::Updated { etag }) => match etag {
                    Some(etag) => {
                        apply_series_watermarks(
                            watermarks,
                            &by_uid,
                            &result.local_deletions,
                            notebook_id,
                            &uid,
                            &href,
                            &etag,
                        );
                    }
                    None => {
                        missing_etag.push((uid, href));
                    }
                },
                Ok(PutOutcome::SoftFailed { status }) => {
                    failures.push(ItemFailure {
                        uid: uid.clone(),
                        recurrence_id: None,
                        reason: format!("server rejected upload with status {status}"),
                    });
                }
                Err(err) => {
                    failures.push(ItemFailure {
                        uid: uid.clone(),
                        recurrence_id: None,
                        reason: err.to_string(),
                    });
                }
            }
        }

        if !missing_etag.is_empty() {
            let hrefs: Vec<String> = missing_etag.iter().map(|(_, href)| href.clone()).collect();
            match client.get_calendar_resources_multiget(calendar_href, &hrefs).await {
                Ok(resources) => {
                    let etag_by_href: HashMap<String, String> = resources
                        .into_iter()
                        .filter_map(|r| {
                            let href = r.href.clone();
                            r.etag.map(|etag| (href, etag))
                        })
                        .collect();
                    for (uid, href) in &missing_etag {
                        match etag_by_href.get(href) {
                            Some(etag) => {
                                apply_series_watermarks(
                                    watermarks,
                                    &by_uid,
                                    &result.local_deletions,
                                    notebook_id,
                                    uid,
                                    href,
                                    etag,
                                );
                            }
                            None => {
                                warn!(
                                    uid = %uid,
                                    href = %href,
                                    "server omitted etag on PUT and the follow-up multiget did not return one either"
                                );
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!(%err, "follow-up multiget for missing PUT etags failed");
                }
            }
        }

        let mut delete_tasks = FuturesUnordered::new();
        for id in result.local_deletions.iter().filter(|id| id.recurrence_id.is_none()) {
            let watermark = watermarks.get(notebook_id, id);
            let Some(href) = watermark.uri.clone() else { continue };
            let etag = watermark.etag.clone();
            let sem = sem.clone();
            let id = id.clone();
            delete_tasks.push(async move {
                let _permit = sem.acquire_owned().await.expect("semaphore closed");
                let outcome = client.delete_resource(&href, etag.as_deref()).await;
                (id, outcome)
            });
        }
        while let Some((id, outcome)) = delete_tasks.next().await {
            match outcome {
                Ok(DeleteOutcome::Deleted | DeleteOutcome::AlreadyGone) => {
                    watermarks.remove(notebook_id, &id);
                }
                Ok(DeleteOutcome::SoftFailed { status }) => {
                    failures.push(ItemFailure {
                        uid: id.uid.clone(),
                        recurrence_id: id.recurrence_id.clone(),
                        reason: format!("server rejected delete with status {status}"),
                    });
                }
                Err(err) => {
                    failures.push(ItemFailure {
                        uid: id.uid.clone(),
                        recurrence_id: id.recurrence_id.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }
    }

    // Applying: pull remote additions/modifications down, and mirror
    // remote deletions locally.
    {
        let _phase = tracing::info_span!("phase", name = Phase::Applying.as_str()).entered();
        let mut wanted: Vec<String> = result.remote_additions.iter().cloned().collect();
        wanted.extend(result.remote_modifications.iter().cloned());
        wanted.extend(result.possible_local_modifications.keys().cloned());
        wanted.sort();
        wanted.dedup();

        let mut bodies: Vec<(String, String, String)> = Vec::new();
        let mut missing = Vec::new();
        for href in wanted {
            if let Some((data, etag)) = prefetched_bodies.get(&href) {
                bodies.push((href, data.clone(), etag.clone()));
            } else {
                missing.push(href);
            }
        }
        if !missing.is_empty() {
            match client.get_calendar_resources_multiget(calendar_href, &missing).await {
                Ok(resources) => {
                    for resource in resources {
                        if let (Some(data), Some(etag)) = (resource.data, resource.etag) {
                            bodies.push((resource.href, data, etag));
                        }
                    }
                }
                Err(err) => return outcome_from_dav_error(&err),
            }
        }

        for (href, ical, etag) in bodies {
            let repaired = crate::dav::ical_repair::repair(&ical);
            let parsed: Result<IcalCalendar, _> = repaired.parse();
            let Ok(parsed) = parsed else {
                warn!(href = %href, "failed to parse fetched calendar data, skipping");
                continue;
            };

            let mut events: Vec<icalendar::Event> = Vec::new();
            for comp in parsed.components {
                if let CalendarComponent::Event(mut event) = comp {
                    incidence_handler::prepare_imported_incidence(&mut event);
                    events.push(event);
                }
            }

            let possible_ids = result.possible_local_modifications.remove(&href).unwrap_or_default();

            for event in events {
                let incidence = Incidence { kind: Kind::Event, event };
                let Some(id) = incidence.id() else { continue };

                if possible_ids.contains(&id) {
                    if let Some(local) = all_local.iter().find(|i| i.id().as_ref() == Some(&id)) {
                        if incidence_handler::semantically_equal(&local.event, &incidence.event) {
                            result.local_modifications.retain(|m| m != &id);
                            watermarks.set_uri_and_etag(notebook_id, &id, href.clone(), etag.clone());
                            continue;
                        }
                    }
                }

                if let Err(err) = store.upsert_incidence(notebook_id, incidence) {
                    failures.push(ItemFailure {
                        uid: id.uid.clone(),
                        recurrence_id: id.recurrence_id.clone(),
                        reason: err.to_string(),
                    });
                    continue;
                }
                watermarks.set_uri_and_etag(notebook_id, &id, href.clone(), etag.clone());
            }
        }

        for id in &result.remote_deletions {
            if let Err(err) = store.remove_incidence(notebook_id, id) {
                failures.push(ItemFailure {
                    uid: id.uid.clone(),
                    recurrence_id: id.recurrence_id.clone(),
                    reason: err.to_string(),
                });
                continue;
            }
            watermarks.remove(notebook_id, id);
        }
    }

    {
        let _phase = tracing::info_span!("phase", name = Phase::Postsync.as_str()).entered();
        if store.set_sync_date(notebook_id, Utc::now()).is_err() {
            return SyncOutcome::DatabaseFailure;
        }
    }

    if failures.is_empty() {
        SyncOutcome::Success
    } else {
        SyncOutcome::ItemFailures(failures)
    }
}

/// Records the watermark for a just-uploaded series: the parent, every
/// instance sharing its href, and the removal of any recurrence-exception
/// `local_deletions` entry for that uid (S5, see the comment at the Upsync
/// call site).
fn apply_series_watermarks(
    watermarks: &mut WatermarkStore,
    by_uid: &HashMap<String, Vec<Incidence>>,
    local_deletions: &[IncidenceId],
    notebook_id: &str,
    uid: &str,
    href: &str,
    etag: &str,
) {
    let parent_id = IncidenceId { uid: uid.to_string(), recurrence_id: None };
    watermarks.set_uri_and_etag(notebook_id, &parent_id, href.to_string(), etag.to_string());
    for instance in by_uid.get(uid).into_iter().flatten().filter(|i| i.recurrence_id().is_some()) {
        if let Some(id) = instance.id() {
            watermarks.set_uri_and_etag(notebook_id, &id, href.to_string(), etag.to_string());
        }
    }
    for deleted_id in local_deletions.iter().filter(|id| id.recurrence_id.is_some() && id.uid == uid) {
        watermarks.remove(notebook_id, deleted_id);
    }
}

fn index_by_uid(incidences: &[Incidence]) -> HashMap<String, Vec<Incidence>> {
    let mut map: HashMap<String, Vec<Incidence>> = HashMap::new();
    for incidence in incidences {
        if let Some(uid) = incidence.uid() {
            map.entry(uid.to_string()).or_default().push(incidence.clone());
        }
    }
    map
}

fn outcome_from_dav_error(err: &crate::error::DavError) -> SyncOutcome {
    use crate::error::DavError;
    match err {
        DavError::AuthenticationRequired | DavError::AccessDenied => SyncOutcome::AuthenticationFailure,
        DavError::Network(_) | DavError::Timeout | DavError::Tls(_) => SyncOutcome::ConnectionError,
        other => SyncOutcome::InternalError(other.to_string()),
    }
}
