//! Incidence handler (C6): the property-level reconciliation and export
//! logic grounded in `incidencehandler.cpp` of the original plugin —
//! copying fields from one incidence onto another, preparing an imported
//! incidence for local storage, and building the exportable form (with
//! persistent exceptions materialized as separate `VEVENT` blocks) sent
//! back to the server.

use icalendar::{Calendar, Component, Event, Property};

use crate::model::incidence::Incidence;

const NBUID_PREFIX: &str = "NBUID:";

/// Lowercases and trims an email address for equality comparisons, per
/// the original's `normalizePersonEmail`.
fn normalize_person_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

/// The `CN=` parameter on an `ORGANIZER`/`ATTENDEE` property, trimmed.
fn person_full_name(prop: &Property) -> Option<String> {
    prop.params().get("CN").and_then(|p| p.value()).map(|v| v.trim().to_string())
}

/// Copies RFC 5545 fields from `from` onto `to`, field by field, only
/// when they differ — mirrors `copyIncidenceProperties`'s
/// `COPY_IF_NOT_EQUAL` macro pattern. `created` and the true
/// `LAST-MODIFIED` timestamp on `to` are preserved, not overwritten: the
/// local store owns those, the wire payload does not get to rewrite
/// history.
pub fn copy_incidence_properties(to: &mut Event, from: &Event) {
    copy_if_present(to, from, "RRULE");
    copy_if_present(to, from, "EXDATE");
    copy_if_present(to, from, "RDATE");
    copy_if_present(to, from, "DURATION");
    copy_if_present(to, from, "DTEND");
    copy_if_present(to, from, "TRANSP");
    copy_if_present(to, from, "DTSTART");
    copy_if_present(to, from, "ORGANIZER");
    copy_if_present(to, from, "CLASS");
    copy_if_present(to, from, "CATEGORIES");
    copy_if_present(to, from, "DESCRIPTION");
    copy_if_present(to, from, "GEO");
    copy_if_present(to, from, "LOCATION");
    copy_if_present(to, from, "RESOURCES");
    copy_if_present(to, from, "STATUS");
    copy_if_present(to, from, "SUMMARY");
    copy_if_present(to, from, "SEQUENCE");

    for attendee in from.multi_properties().get("ATTENDEE").into_iter().flatten() {
        to.append_multi_property(attendee.clone());
    }
    for comment in from.multi_properties().get("COMMENT").into_iter().flatten() {
        to.append_multi_property(comment.clone());
    }
    for contact in from.multi_properties().get("CONTACT").into_iter().flatten() {
        to.append_multi_property(contact.clone());
    }
    for attach in from.multi_properties().get("ATTACH").into_iter().flatten() {
        to.append_multi_property(attach.clone());
    }

    for (name, prop) in from.properties() {
        if !is_known_property(name) {
            to.append_property(prop.clone());
        }
    }
}

fn copy_if_present(to: &mut Event, from: &Event, key: &str) {
    match from.property_value(key) {
        Some(value) if from.property_value(key) != to.property_value(key) => {
            to.add_property(key, value);
        }
        None => {
            to.remove_property(key);
        }
        _ => {}
    }
}

fn is_known_property(name: &str) -> bool {
    matches!(
        name,
        "RRULE" | "EXDATE" | "RDATE" | "DURATION" | "DTEND" | "TRANSP" | "DTSTART" | "ORGANIZER"
            | "CLASS" | "CATEGORIES" | "DESCRIPTION" | "GEO" | "LOCATION" | "RESOURCES" | "STATUS"
            | "SUMMARY" | "SEQUENCE" | "UID" | "RECURRENCE-ID" | "DTSTAMP" | "LAST-MODIFIED" | "CREATED"
    )
}

/// For an all-day incidence missing `DTEND`, synthesizes one equal to
/// `DTSTART` and marks it with a custom property so `incidence_to_export`
/// can recognize and strip the synthetic value later. Mirrors
/// `prepareImportedIncidence`.
pub fn prepare_imported_incidence(event: &mut Event) {
    let is_all_day = event.property_value("DTSTART").map(|v| !v.contains('T')).unwrap_or(false);
    if is_all_day && event.property_value("DTEND").is_none() {
        if let Some(dtstart) = event.property_value("DTSTART").map(str::to_string) {
            event.add_property("X-SYNC-DTEND-ADDED-AS-DTSTART", "true");
            event.add_property("DTEND", &dtstart);
        }
    }
}

/// Strips the `NBUID:<notebook>:` prefix the original stored inside the
/// wire `UID`, if present. The redesigned engine never writes this
/// prefix itself, but a resource imported from a server that still
/// carries state from the original plugin may have it.
fn strip_nbuid_prefix(uid: &str) -> &str {
    if let Some(rest) = uid.strip_prefix(NBUID_PREFIX) {
        if let Some(colon) = rest.find(':') {
            return &rest[colon + 1..];
        }
    }
    uid
}

/// Produces the exportable form of one incidence: strips any legacy
/// `NBUID:` prefix from `UID`, removes attendees matching the organizer,
/// removes `EXDATE` entries that correspond to materialized persistent
/// exceptions (`instances`), and undoes the `prepare_imported_incidence`
/// DTEND synthesis for all-day events. Mirrors `incidenceToExport`.
pub fn incidence_to_export(source: &Event, instances: &[Event]) -> Event {
    let mut out = source.clone();

    if let Some(uid) = out.property_value("UID").map(str::to_string) {
        let stripped = strip_nbuid_prefix(&uid).to_string();
        if stripped != uid {
            out.add_property("UID", &stripped);
        }
    }

    // The default storage implementation applies the organizer as an
    // attendee by default; undo that, but only drop an attendee that
    // matches the organizer on *both* email and full name — matching
    // email alone would also discard a genuinely distinct attendee who
    // happens to share the organizer's address (e.g. a shared mailbox).
    if let Some(organizer_prop) = out.properties().get("ORGANIZER").cloned() {
        let organizer_email = normalize_person_email(organizer_prop.value());
        let organizer_name = person_full_name(&organizer_prop);
        let attendees = out.multi_properties().get("ATTENDEE").cloned().unwrap_or_default();
        out.remove_property("ATTENDEE");
        for attendee in attendees {
            let is_organizer = normalize_person_email(attendee.value()) == organizer_email
                && person_full_name(&attendee) == organizer_name;
            if !is_organizer {
                out.append_multi_property(attendee);
            }
        }
    }

    if out.property_value("RRULE").is_some() {
        if let Some(exdate) = out.property_value("EXDATE").map(str::to_string) {
            let remaining: Vec<&str> = exdate
                .split(',')
                .filter(|candidate| {
                    !instances
                        .iter()
                        .any(|inst| inst.property_value("RECURRENCE-ID") == Some(*candidate))
                })
                .collect();
            if remaining.is_empty() {
                out.remove_property("EXDATE");
            } else {
                out.add_property("EXDATE", &remaining.join(","));
            }
        }
    }

    let synthesized_all_day_dtend = out.property_value("X-SYNC-DTEND-ADDED-AS-DTSTART") == Some("true");
    out.remove_property("X-SYNC-DTEND-ADDED-AS-DTSTART");
    if synthesized_all_day_dtend && out.property_value("DTSTART") == out.property_value("DTEND") {
        out.remove_property("DTEND");
    }

    out
}

/// Builds the wire `VCALENDAR` text for a series parent plus its
/// persistent exception occurrences, each materialized as its own
/// `VEVENT` sharing the parent's `UID`. Mirrors `toIcs`: since neither
/// `icalendar` nor the original's calendar library has a native "detach
/// occurrence" primitive, a detached exception is built by cloning the
/// exported parent, clearing its recurrence properties, and re-copying
/// the instance's own field values on top.
pub fn to_ics(parent: &Incidence, instances: &[Incidence]) -> String {
    let instance_events: Vec<Event> = instances.iter().map(|i| i.event.clone()).collect();
    let exported_parent = incidence_to_export(&parent.event, &instance_events);

    let mut calendar = Calendar::new();
    calendar.push(exported_parent.clone());

    for instance in instances {
        let mut detached = exported_parent.clone();
        detached.remove_property("RRULE");
        detached.remove_property("RDATE");
        detached.remove_property("EXDATE");
        if let Some(recurrence_id) = instance.event.property_value("RECURRENCE-ID") {
            detached.add_property("RECURRENCE-ID", recurrence_id);
            detached.add_property("DTSTART", recurrence_id);
        }
        let exported_instance = incidence_to_export(&instance.event, &[]);
        copy_incidence_properties(&mut detached, &exported_instance);
        calendar.push(detached);
    }

    normalize_alarm_trigger_offsets(&calendar.to_string())
}

/// `icalformat`/`kcalcore` converts a second-type `TRIGGER` duration into
/// day-type whenever it's an exact multiple of a day, to keep comparisons
/// consistent across round-trips. `icalendar` has no typed `VALARM`
/// sub-component to rewrite directly, so this walks the serialized text,
/// line by line, the same way `dav::ical_repair` handles transforms the
/// typed codec doesn't expose.
fn normalize_alarm_trigger_offsets(ics: &str) -> String {
    let mut out = String::with_capacity(ics.len());
    let mut in_valarm = false;
    let mut lines = ics.split("\r\n").peekable();
    while let Some(line) = lines.next() {
        let upper = line.to_ascii_uppercase();
        if upper.starts_with("BEGIN:VALARM") {
            in_valarm = true;
        } else if upper.starts_with("END:VALARM") {
            in_valarm = false;
        }
        let transformed = if in_valarm && upper.starts_with("TRIGGER") && !upper.contains("VALUE=DATE-TIME") {
            normalize_trigger_line(line)
        } else {
            line.to_string()
        };
        out.push_str(&transformed);
        if lines.peek().is_some() {
            out.push_str("\r\n");
        }
    }
    out
}

fn normalize_trigger_line(line: &str) -> String {
    let Some(colon) = line.rfind(':') else { return line.to_string() };
    let (prefix, value) = line.split_at(colon + 1);
    match normalize_duration_to_days(value) {
        Some(normalized) => format!("{prefix}{normalized}"),
        None => line.to_string(),
    }
}

/// Rewrites a `PnDTnHnMnS`-style duration to `PnD` when it carries a time
/// component (`T...`) whose total is an exact, nonzero multiple of a day.
/// A duration already expressed purely in days or weeks (no `T`) is left
/// alone, matching `!offset.isDaily()` in the original.
fn normalize_duration_to_days(value: &str) -> Option<String> {
    let value = value.trim();
    if !value.to_ascii_uppercase().contains('T') {
        return None;
    }
    let (negative, seconds) = parse_ical_duration_seconds(value)?;
    if seconds == 0 || seconds % 86400 != 0 {
        return None;
    }
    Some(format!("{}P{}D", if negative { "-" } else { "" }, seconds / 86400))
}

/// Parses an RFC 5545 `DURATION` value (`[+-]P(nW | nD(T(nH)(nM)(nS))?)`)
/// into a signed total-seconds count.
fn parse_ical_duration_seconds(value: &str) -> Option<(bool, i64)> {
    let mut rest = value;
    let negative = if let Some(stripped) = rest.strip_prefix('-') {
        rest = stripped;
        true
    } else {
        rest = rest.strip_prefix('+').unwrap_or(rest);
        false
    };
    let rest = rest.strip_prefix('P')?;
    let (date_part, time_part) = match rest.split_once('T') {
        Some((d, t)) => (d, Some(t)),
        None => (rest, None),
    };

    let mut seconds: i64 = 0;
    let mut num = String::new();
    for c in date_part.chars() {
        match c {
            '0'..='9' => num.push(c),
            'W' => {
                seconds += num.parse::<i64>().ok()? * 7 * 86400;
                num.clear();
            }
            'D' => {
                seconds += num.parse::<i64>().ok()? * 86400;
                num.clear();
            }
            _ => return None,
        }
    }
    if let Some(time_part) = time_part {
        let mut num = String::new();
        for c in time_part.chars() {
            match c {
                '0'..='9' => num.push(c),
                'H' => {
                    seconds += num.parse::<i64>().ok()? * 3600;
                    num.clear();
                }
                'M' => {
                    seconds += num.parse::<i64>().ok()? * 60;
                    num.clear();
                }
                'S' => {
                    seconds += num.parse::<i64>().ok()?;
                    num.clear();
                }
                _ => return None,
            }
        }
    }
    Some((negative, seconds))
}

/// Compares two incidences field-by-field after both have gone through
/// `incidence_to_export`, ignoring the always-volatile `DTSTAMP` and
/// `SEQUENCE` properties. Used to demote a "possible" local modification
/// (etag-equal to the last sync) back to "unchanged" once its semantic
/// content is confirmed identical to the fetched remote body (`spec.md`
/// §4.7, §9 Open Question 2).
pub fn semantically_equal(a: &Event, b: &Event) -> bool {
    let exported_a = incidence_to_export(a, &[]);
    let exported_b = incidence_to_export(b, &[]);

    const COMPARE_KEYS: &[&str] = &[
        "UID", "RECURRENCE-ID", "SUMMARY", "DESCRIPTION", "LOCATION", "DTSTART", "DTEND", "DURATION",
        "STATUS", "TRANSP", "CLASS", "CATEGORIES", "GEO", "RESOURCES", "ORGANIZER", "RRULE", "EXDATE",
        "RDATE",
    ];

    COMPARE_KEYS
        .iter()
        .all(|key| exported_a.property_value(key) == exported_b.property_value(key))
        && multi_property_values(&exported_a, "ATTENDEE") == multi_property_values(&exported_b, "ATTENDEE")
}

fn multi_property_values(event: &Event, key: &str) -> Vec<String> {
    let mut values: Vec<String> = event
        .multi_properties()
        .get(key)
        .into_iter()
        .flatten()
        .map(|p| p.value().to_string())
        .collect();
    values.sort();
    values
}
