//! Delta calculation (C7 core): the pure, side-effect-free heart of the
//! sync engine. Grounded directly on `NotebookSyncAgent::calculateDelta`
//! in `notebooksyncagent.cpp` — six disjoint change sets plus a
//! "possible local modification" holding pen that needs a semantic
//! comparison against the fetched remote body before it can be trusted
//! (`spec.md` §4.7, §8 invariants 1-7).

use std::collections::HashMap;
use std::collections::HashSet;

use crate::model::incidence::IncidenceId;
use crate::model::incidence::Watermark;

/// A remote resource's identity as seen by the latest `PROPFIND`/REPORT:
/// href plus its current etag.
#[derive(Debug, Clone)]
pub struct RemoteEntry {
    pub href: String,
    pub etag: String,
}

/// One local incidence as the delta calculation needs to see it: its
/// identity and the watermark last recorded for it (empty if never
/// synced).
#[derive(Debug, Clone)]
pub struct LocalEntry {
    pub id: IncidenceId,
    pub watermark: Watermark,
}

/// Inputs to `compute`. All three local sets may overlap in identity
/// (e.g. an incidence can appear in `all_local` without appearing in
/// `locally_modified`) — the caller is the `CalendarStore`'s three report
/// methods (`all_incidences`, `modified_since`, `deleted_since`), not
/// this function; `compute` only reasons about identities and
/// watermarks, never incidence content.
pub struct DeltaInput<'a> {
    pub all_local: &'a [LocalEntry],
    pub locally_deleted: &'a [LocalEntry],
    pub locally_modified: &'a [LocalEntry],
    pub remote: &'a [RemoteEntry],
    pub remote_calendar_path: &'a str,
}

#[derive(Debug, Clone, Default)]
pub struct DeltaResult {
    pub local_additions: Vec<IncidenceId>,
    pub local_modifications: Vec<IncidenceId>,
    pub local_deletions: Vec<IncidenceId>,
    pub remote_additions: Vec<String>,
    pub remote_modifications: Vec<String>,
    pub remote_deletions: Vec<IncidenceId>,
    /// Local modifications whose etag still matches the last sync —
    /// "possibly" unchanged, pending a semantic-equality check against
    /// the freshly fetched remote body (C6 `semantically_equal`) before
    /// being trusted as real. Keyed by remote href.
    pub possible_local_modifications: HashMap<String, Vec<IncidenceId>>,
}

fn computed_uri(remote_calendar_path: &str, id: &IncidenceId) -> String {
    format!("{remote_calendar_path}{}.ics", id.uid)
}

/// A sentinel previously-synced etag that can never equal a real etag,
/// forcing the remote-addition/modification pass in step 4 to treat the
/// resource as modified and refetch it. Mirrors the original's
/// `"missing ETag"` placeholder.
const SENTINEL_MISSING_ETAG: &str = "\0missing-etag\0";

/// Computes the six-set delta for one notebook. `spec.md` §8 invariant 1:
/// the six sets are pairwise disjoint on incidence identity /remote href
/// as appropriate. Invariant 7 (idempotence): calling `compute` again
/// with `remote` unchanged and `all_local`/`locally_deleted`/
/// `locally_modified` reflecting the previous result's already-applied
/// state yields all-empty sets.
pub fn compute(input: DeltaInput<'_>) -> DeltaResult {
    let mut result = DeltaResult::default();

    let remote_by_href: HashMap<&str, &str> =
        input.remote.iter().map(|r| (r.href.as_str(), r.etag.as_str())).collect();

    let mut seen_hrefs: HashMap<String, String> = HashMap::new();
    let mut previously_synced_etags: HashMap<String, String> = HashMap::new();
    // Ids already classified as a local addition in step 1 (a copied
    // detached exception whose etag happens to match the parent's remote
    // etag) — step 3 must not also classify the same id as a local
    // modification, or the six sets stop being pairwise disjoint
    // (`spec.md` §8 invariant 1).
    let mut local_addition_ids: HashSet<IncidenceId> = HashSet::new();

    // Step 1: every local incidence.
    for entry in input.all_local {
        if let Some(uri) = &entry.watermark.uri {
            match remote_by_href.get(uri.as_str()) {
                None => {
                    result.remote_deletions.push(entry.id.clone());
                }
                Some(remote_etag) => {
                    let local_etag = entry.watermark.etag.as_deref();
                    let is_copied_detached =
                        entry.id.recurrence_id.is_some() && !entry.watermark.detached_and_synced;
                    if is_copied_detached && local_etag == Some(*remote_etag) {
                        local_addition_ids.insert(entry.id.clone());
                        result.local_additions.push(entry.id.clone());
                    } else {
                        seen_hrefs.insert(uri.clone(), remote_etag.to_string());
                        previously_synced_etags
                            .insert(uri.clone(), local_etag.unwrap_or_default().to_string());
                    }
                }
            }
        } else {
            let uri = computed_uri(input.remote_calendar_path, &entry.id);
            match remote_by_href.get(uri.as_str()) {
                Some(remote_etag) => {
                    seen_hrefs.insert(uri.clone(), remote_etag.to_string());
                    previously_synced_etags.insert(uri, SENTINEL_MISSING_ETAG.to_string());
                }
                None => {
                    result.local_additions.push(entry.id.clone());
                }
            }
        }
    }

    // Step 2: locally deleted since the last watermark.
    for entry in input.locally_deleted {
        let uri = entry
            .watermark
            .uri
            .clone()
            .unwrap_or_else(|| computed_uri(input.remote_calendar_path, &entry.id));

        if let Some(remote_etag) = remote_by_href.get(uri.as_str()) {
            let watermark_was_empty = entry.watermark.uri.is_none();
            let local_etag = entry.watermark.etag.as_deref();
            if watermark_was_empty || local_etag == Some(*remote_etag) {
                result.local_deletions.push(entry.id.clone());
            }
            // else: remote also changed since the last sync — conflict
            // resolves to remote, so this deletion is silently dropped.
        }
        // else: already gone remotely (or never upsynced) — nothing to do.
    }

    // Step 3: locally modified since the last watermark.
    for entry in input.locally_modified {
        if local_addition_ids.contains(&entry.id) {
            // Already accounted for in step 1 above.
            continue;
        }
        if entry.watermark.uri.is_none() {
            let uri = computed_uri(input.remote_calendar_path, &entry.id);
            if remote_by_href.contains_key(uri.as_str()) {
                result.local_modifications.push(entry.id.clone());
            }
            // else: either already counted as a local addition in step 1,
            // or the resource was removed remotely before it ever made it
            // up — nothing more to do here either way.
            continue;
        }

        let uri = entry.watermark.uri.as_ref().unwrap();
        let Some(remote_etag) = remote_by_href.get(uri.as_str()) else {
            // Must correspond to a remoteDeletion recorded in step 1.
            continue;
        };
        let local_etag = entry.watermark.etag.as_deref();
        if local_etag != Some(*remote_etag) {
            // Remote also changed — conflict resolves to remote; this
            // surfaces via the remote-modifications pass below instead.
            continue;
        }

        result.local_modifications.push(entry.id.clone());
        result
            .possible_local_modifications
            .entry(uri.clone())
            .or_default()
            .push(entry.id.clone());
    }

    // Step 4: every remote resource not yet accounted for above.
    for remote_entry in input.remote {
        if seen_hrefs.contains_key(&remote_entry.href) {
            continue;
        }
        match previously_synced_etags.get(&remote_entry.href) {
            None => result.remote_additions.push(remote_entry.href.clone()),
            Some(prev) if prev != &remote_entry.etag => {
                result.remote_modifications.push(remote_entry.href.clone())
            }
            Some(_) => {}
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(uid: &str) -> IncidenceId {
        IncidenceId { uid: uid.to_string(), recurrence_id: None }
    }

    fn synced_watermark(href: &str, etag: &str) -> Watermark {
        Watermark { uri: Some(href.to_string()), etag: Some(etag.to_string()), detached_and_synced: false }
    }

    #[test]
    fn new_local_incidence_with_no_remote_counterpart_is_an_addition() {
        let all_local = vec![LocalEntry { id: id("a"), watermark: Watermark::default() }];
        let result = compute(DeltaInput {
            all_local: &all_local,
            locally_deleted: &[],
            locally_modified: &[],
            remote: &[],
            remote_calendar_path: "/cal/",
        });
        assert_eq!(result.local_additions, vec![id("a")]);
        assert!(result.remote_additions.is_empty());
    }

    #[test]
    fn brand_new_remote_resource_is_a_remote_addition() {
        let remote = vec![RemoteEntry { href: "/cal/b.ics".into(), etag: "\"1\"".into() }];
        let result = compute(DeltaInput {
            all_local: &[],
            locally_deleted: &[],
            locally_modified: &[],
            remote: &remote,
            remote_calendar_path: "/cal/",
        });
        assert_eq!(result.remote_additions, vec!["/cal/b.ics".to_string()]);
    }

    #[test]
    fn remote_resource_vanishing_is_a_remote_deletion() {
        let all_local = vec![LocalEntry { id: id("a"), watermark: synced_watermark("/cal/a.ics", "\"1\"") }];
        let result = compute(DeltaInput {
            all_local: &all_local,
            locally_deleted: &[],
            locally_modified: &[],
            remote: &[],
            remote_calendar_path: "/cal/",
        });
        assert_eq!(result.remote_deletions, vec![id("a")]);
    }

    #[test]
    fn unchanged_etag_produces_no_action() {
        let all_local = vec![LocalEntry { id: id("a"), watermark: synced_watermark("/cal/a.ics", "\"1\"") }];
        let remote = vec![RemoteEntry { href: "/cal/a.ics".into(), etag: "\"1\"".into() }];
        let result = compute(DeltaInput {
            all_local: &all_local,
            locally_deleted: &[],
            locally_modified: &[],
            remote: &remote,
            remote_calendar_path: "/cal/",
        });
        assert!(result.local_additions.is_empty());
        assert!(result.local_modifications.is_empty());
        assert!(result.remote_additions.is_empty());
        assert!(result.remote_modifications.is_empty());
        assert!(result.remote_deletions.is_empty());
    }

    #[test]
    fn remote_etag_change_is_a_remote_modification() {
        let all_local = vec![LocalEntry { id: id("a"), watermark: synced_watermark("/cal/a.ics", "\"1\"") }];
        let remote = vec![RemoteEntry { href: "/cal/a.ics".into(), etag: "\"2\"".into() }];
        let result = compute(DeltaInput {
            all_local: &all_local,
            locally_deleted: &[],
            locally_modified: &[],
            remote: &remote,
            remote_calendar_path: "/cal/",
        });
        assert_eq!(result.remote_modifications, vec!["/cal/a.ics".to_string()]);
    }

    #[test]
    fn local_deletion_conflicting_with_remote_change_resolves_to_remote() {
        let locally_deleted = vec![LocalEntry { id: id("a"), watermark: synced_watermark("/cal/a.ics", "\"1\"") }];
        let remote = vec![RemoteEntry { href: "/cal/a.ics".into(), etag: "\"2\"".into() }];
        let result = compute(DeltaInput {
            all_local: &[],
            locally_deleted: &locally_deleted,
            locally_modified: &[],
            remote: &remote,
            remote_calendar_path: "/cal/",
        });
        assert!(result.local_deletions.is_empty());
        assert_eq!(result.remote_modifications, vec!["/cal/a.ics".to_string()]);
    }

    #[test]
    fn possible_local_modification_is_recorded_for_semantic_recheck() {
        let all_local = vec![LocalEntry { id: id("a"), watermark: synced_watermark("/cal/a.ics", "\"1\"") }];
        let locally_modified = all_local.clone();
        let remote = vec![RemoteEntry { href: "/cal/a.ics".into(), etag: "\"1\"".into() }];
        let result = compute(DeltaInput {
            all_local: &all_local,
            locally_deleted: &[],
            locally_modified: &locally_modified,
            remote: &remote,
            remote_calendar_path: "/cal/",
        });
        assert_eq!(result.local_modifications, vec![id("a")]);
        assert_eq!(result.possible_local_modifications.get("/cal/a.ics").unwrap(), &vec![id("a")]);
    }

    #[test]
    fn sets_are_disjoint() {
        let all_local = vec![
            LocalEntry { id: id("unsynced"), watermark: Watermark::default() },
            LocalEntry { id: id("synced-unchanged"), watermark: synced_watermark("/cal/u.ics", "\"1\"") },
            LocalEntry { id: id("gone-remotely"), watermark: synced_watermark("/cal/g.ics", "\"1\"") },
        ];
        let remote = vec![
            RemoteEntry { href: "/cal/u.ics".into(), etag: "\"1\"".into() },
            RemoteEntry { href: "/cal/new.ics".into(), etag: "\"1\"".into() },
        ];
        let result = compute(DeltaInput {
            all_local: &all_local,
            locally_deleted: &[],
            locally_modified: &[],
            remote: &remote,
            remote_calendar_path: "/cal/",
        });

        assert_eq!(result.local_additions, vec![id("unsynced")]);
        assert_eq!(result.remote_deletions, vec![id("gone-remotely")]);
        assert_eq!(result.remote_additions, vec!["/cal/new.ics".to_string()]);
        assert!(result.remote_modifications.is_empty());
    }

    #[test]
    fn copied_detached_exception_is_not_also_a_local_modification() {
        let exception_id = IncidenceId { uid: "s".to_string(), recurrence_id: Some("20260801T090000Z".to_string()) };
        let watermark = Watermark {
            uri: Some("/cal/s.ics".to_string()),
            etag: Some("\"1\"".to_string()),
            detached_and_synced: false,
        };
        let all_local = vec![LocalEntry { id: exception_id.clone(), watermark: watermark.clone() }];
        let locally_modified = vec![LocalEntry { id: exception_id.clone(), watermark }];
        let remote = vec![RemoteEntry { href: "/cal/s.ics".into(), etag: "\"1\"".into() }];

        let result = compute(DeltaInput {
            all_local: &all_local,
            locally_deleted: &[],
            locally_modified: &locally_modified,
            remote: &remote,
            remote_calendar_path: "/cal/",
        });

        assert_eq!(result.local_additions, vec![exception_id.clone()]);
        assert!(
            !result.local_modifications.contains(&exception_id),
            "an id already classified as a local addition must not also appear as a local modification"
        );
    }
}
