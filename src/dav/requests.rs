//! Method requests (C4): builds the XML request bodies for the PROPFIND and
//! REPORT calls C5 issues, plus the small header-construction helpers PUT
//! and DELETE need. Body shape mirrors RFC 4791/RFC 4918 exactly; there is
//! no query-builder abstraction here, just the handful of fixed templates
//! the sync engine actually sends.

use chrono::{DateTime, Utc};

/// Escapes the five XML predefined entities. CalDAV paths and hrefs we
/// interpolate into request bodies can contain `&` (query strings) or, in
/// principle, the other four, so every interpolation goes through this.
pub fn escape_xml(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    out
}

/// `PROPFIND` body discovering `current-user-principal` (depth 0, against
/// the server's well-known CalDAV root).
pub fn current_user_principal_body() -> &'static str {
    r#"<?xml version="1.0" encoding="utf-8"?>
<D:propfind xmlns:D="DAV:">
  <D:prop>
    <D:current-user-principal/>
  </D:prop>
</D:propfind>"#
}

/// `PROPFIND` body against the principal resource, requesting the
/// calendar home set and the user's preferred mailto address.
pub fn calendar_home_set_body() -> &'static str {
    r#"<?xml version="1.0" encoding="utf-8"?>
<D:propfind xmlns:D="DAV:" xmlns:C="urn:ietf:params:xml:ns:caldav">
  <D:prop>
    <C:calendar-home-set/>
    <D:calendar-user-address-set xmlns:D="urn:ietf:params:xml:ns:carddav"/>
    <C:calendar-user-address-set/>
  </D:prop>
</D:propfind>"#
}

/// `PROPFIND` body listing calendar collections under the home set
/// (depth 1): resourcetype, displayname, description, color, supported
/// components and current-user-privilege-set.
pub fn list_calendars_body() -> &'static str {
    r#"<?xml version="1.0" encoding="utf-8"?>
<D:propfind xmlns:D="DAV:" xmlns:C="urn:ietf:params:xml:ns:caldav" xmlns:A="http://apple.com/ns/ical/">
  <D:prop>
    <D:resourcetype/>
    <D:displayname/>
    <D:current-user-principal/>
    <D:current-user-privilege-set/>
    <C:calendar-description/>
    <A:calendar-color/>
    <C:supported-calendar-component-set/>
  </D:prop>
</D:propfind>"#
}

/// `PROPFIND` body fetching only `getetag` for every resource under a
/// calendar collection (depth 1) — the quick-sync etag probe.
pub fn etags_body() -> &'static str {
    r#"<?xml version="1.0" encoding="utf-8"?>
<D:propfind xmlns:D="DAV:">
  <D:prop>
    <D:getetag/>
  </D:prop>
</D:propfind>"#
}

fn format_ical_datetime(dt: DateTime<Utc>) -> String {
    dt.format("%Y%m%dT%H%M%SZ").to_string()
}

/// REPORT `calendar-query` body restricted to VEVENT components whose
/// time-range overlaps `[start, end]` (both required by RFC 4791 §9.9).
/// Always requests `calendar-data` for the matched resources — this
/// engine never does a query without fetching the body, unlike the quick
/// etag probe above.
pub fn calendar_query_body(component: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> String {
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<C:calendar-query xmlns:D="DAV:" xmlns:C="urn:ietf:params:xml:ns:caldav">
  <D:prop>
    <D:getetag/>
    <C:calendar-data/>
  </D:prop>
  <C:filter>
    <C:comp-filter name="VCALENDAR">
      <C:comp-filter name="{component}">
        <C:time-range start="{start}" end="{end}"/>
      </C:comp-filter>
    </C:comp-filter>
  </C:filter>
</C:calendar-query>"#,
        component = escape_xml(component),
        start = format_ical_datetime(start),
        end = format_ical_datetime(end),
    )
}

/// REPORT `calendar-query` body with no time-range filter (full slow-sync
/// fetch of every resource of `component`).
pub fn calendar_query_all_body(component: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<C:calendar-query xmlns:D="DAV:" xmlns:C="urn:ietf:params:xml:ns:caldav">
  <D:prop>
    <D:getetag/>
    <C:calendar-data/>
  </D:prop>
  <C:filter>
    <C:comp-filter name="VCALENDAR">
      <C:comp-filter name="{component}"/>
    </C:comp-filter>
  </C:filter>
</C:calendar-query>"#,
        component = escape_xml(component),
    )
}

/// REPORT `calendar-multiget` body fetching `calendar-data` for a fixed
/// set of hrefs (targeted re-fetch after a quick-sync etag diff). Returns
/// `None` for an empty href list — there is nothing worth sending.
pub fn calendar_multiget_body<'a>(hrefs: impl Iterator<Item = &'a str>) -> Option<String> {
    let mut hrefs_xml = String::new();
    let mut any = false;
    for href in hrefs {
        any = true;
        hrefs_xml.push_str("    <D:href>");
        hrefs_xml.push_str(&escape_xml(href));
        hrefs_xml.push_str("</D:href>\n");
    }
    if !any {
        return None;
    }
    Some(format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<C:calendar-multiget xmlns:D="DAV:" xmlns:C="urn:ietf:params:xml:ns:caldav">
  <D:prop>
    <D:getetag/>
    <C:calendar-data/>
  </D:prop>
{hrefs_xml}</C:calendar-multiget>"#,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn escapes_predefined_entities() {
        assert_eq!(escape_xml("a&b<c>\"d\"'e'"), "a&amp;b&lt;c&gt;&quot;d&quot;&apos;e&apos;");
    }

    #[test]
    fn time_range_is_formatted_as_utc_basic() {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap();
        let body = calendar_query_body("VEVENT", start, end);
        assert!(body.contains("start=\"20260101T000000Z\""));
        assert!(body.contains("end=\"20260601T000000Z\""));
    }

    #[test]
    fn multiget_returns_none_for_empty_hrefs() {
        assert!(calendar_multiget_body(std::iter::empty()).is_none());
    }

    #[test]
    fn multiget_includes_every_href() {
        let hrefs = vec!["/cal/a.ics", "/cal/b.ics"];
        let body = calendar_multiget_body(hrefs.iter().copied()).unwrap();
        assert!(body.contains("/cal/a.ics"));
        assert!(body.contains("/cal/b.ics"));
    }
}
