//! Repairs malformed iCalendar payloads before they reach the `icalendar`
//! codec boundary (C3). Servers occasionally return `calendar-data` that is
//! well-formed XML but carries iCalendar text mangled by an intermediate
//! XML-unaware tool: entities left half-decoded, bare CRs, or a `VEVENT`
//! missing its own `UID` while one sits on the enclosing line. None of this
//! is a parse failure at the XML layer — it has to be cleaned up as text
//! before the iCalendar parser ever sees it.

/// Normalizes line endings to CRLF (RFC 5545 §3.1) and ensures the payload
/// ends with exactly one trailing blank line.
pub fn normalize_line_endings(ical: &str) -> String {
    let mut out = String::with_capacity(ical.len() + 2);
    let mut chars = ical.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                out.push_str("\r\n");
            }
            '\n' => out.push_str("\r\n"),
            other => out.push(other),
        }
    }
    while out.ends_with("\r\n\r\n") {
        out.truncate(out.len() - 2);
    }
    if !out.ends_with("\r\n") {
        out.push_str("\r\n");
    }
    out
}

/// Decodes the five basic XML entities in sequence (`&amp;` first, so a
/// double-escaped `&amp;quot;` fully unwinds to `"` rather than stopping at
/// `&quot;`), mirroring the order a server's own XML-unaware preprocessor
/// would have escaped them in reverse.
fn decode_basic_entities(line: &str) -> String {
    line.replace("&amp;", "&")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
}

/// True if the text right after an `&` starts a valid numeric character
/// reference (`#123;` or `#x1F;`) that should be left alone rather than
/// re-escaped to `&amp;`.
fn is_numeric_char_ref(after: &str) -> bool {
    if let Some(rest) = after.strip_prefix('#').and_then(|r| r.strip_prefix(['x', 'X'])) {
        let len = rest.chars().take_while(|c| c.is_ascii_hexdigit()).count();
        len > 0 && rest.as_bytes().get(len) == Some(&b';')
    } else if let Some(rest) = after.strip_prefix('#') {
        let len = rest.chars().take_while(|c| c.is_ascii_digit()).count();
        len > 0 && rest.as_bytes().get(len) == Some(&b';')
    } else {
        false
    }
}

/// Re-escapes every bare `&` that isn't the start of a numeric character
/// reference.
fn escape_ampersand(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut rest = line;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        if is_numeric_char_ref(after) {
            out.push('&');
        } else {
            out.push_str("&amp;");
        }
        rest = after;
    }
    out.push_str(rest);
    out
}

fn escape_special_chars(line: &str) -> String {
    line.replace('"', "&quot;").replace('\'', "&apos;").replace('<', "&lt;").replace('>', "&gt;")
}

/// Re-escapes entities that a non-XML-aware step decoded (or left raw)
/// before embedding iCalendar text inside `<calendar-data>`. Only runs on
/// the body between `BEGIN:VCALENDAR` and `END:VCALENDAR`, and skips any
/// `<![CDATA[` span within it; text outside that span is left untouched.
///
/// Per line: decode the five basic entities (undoing any already-escaped
/// text), re-escape a bare `&` unless it starts a numeric character
/// reference (`&#123;`/`&#x1F;`), then re-escape `" ' < >`. Decoding first
/// makes this idempotent regardless of whether the server's payload arrived
/// double-escaped, half-escaped, or entirely raw.
pub fn repair_quoting(ical: &str) -> String {
    let mut out = String::with_capacity(ical.len());
    let mut depth = 0i32;
    let mut in_cdata = false;
    let mut lines = ical.split('\n').peekable();
    while let Some(line) = lines.next() {
        let transformed = if line.contains("BEGIN:VCALENDAR") {
            depth += 1;
            in_cdata = line.contains("<![CDATA[");
            line.to_string()
        } else if line.contains("END:VCALENDAR") {
            depth -= 1;
            in_cdata = false;
            line.to_string()
        } else if depth > 0 && !in_cdata {
            escape_special_chars(&escape_ampersand(&decode_basic_entities(line)))
        } else {
            line.to_string()
        };
        out.push_str(&transformed);
        if lines.peek().is_some() {
            out.push('\n');
        }
    }
    out
}

/// If `ical` contains exactly one `VEVENT`/`VTODO`/`VJOURNAL` and that
/// component has no `UID` line of its own, but a `UID:` line appears
/// before the matching `BEGIN:` line (some servers hoist it to calendar
/// scope by mistake), copies it down into the component. Returns the input
/// unchanged if there's no single component, or the component already has
/// a `UID`.
pub fn hoist_uid_into_single_component(ical: &str) -> String {
    let lines: Vec<&str> = ical.split("\r\n").collect();

    let component_begins: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, l)| {
            let l = l.trim_start();
            l.starts_with("BEGIN:VEVENT") || l.starts_with("BEGIN:VTODO") || l.starts_with("BEGIN:VJOURNAL")
        })
        .map(|(i, _)| i)
        .collect();

    if component_begins.len() != 1 {
        return ical.to_string();
    }
    let begin_idx = component_begins[0];
    let end_idx = lines[begin_idx..]
        .iter()
        .position(|l| {
            let l = l.trim_start();
            l.starts_with("END:VEVENT") || l.starts_with("END:VTODO") || l.starts_with("END:VJOURNAL")
        })
        .map(|rel| begin_idx + rel);
    let Some(end_idx) = end_idx else {
        return ical.to_string();
    };

    let has_own_uid = lines[begin_idx..=end_idx]
        .iter()
        .any(|l| l.trim_start().to_ascii_uppercase().starts_with("UID:") || l.trim_start().to_ascii_uppercase().starts_with("UID;"));
    if has_own_uid {
        return ical.to_string();
    }

    let stray_uid = lines[..begin_idx]
        .iter()
        .rev()
        .find(|l| {
            let l = l.trim_start().to_ascii_uppercase();
            l.starts_with("UID:") || l.starts_with("UID;")
        });

    let Some(uid_line) = stray_uid else {
        return ical.to_string();
    };

    let mut out = Vec::with_capacity(lines.len() + 1);
    out.extend_from_slice(&lines[..=begin_idx]);
    out.push(uid_line);
    out.extend_from_slice(&lines[begin_idx + 1..]);
    out.join("\r\n")
}

/// Runs the full repair pipeline in the order a server's text would need
/// it applied: quoting repair first (operates on the raw decoded text),
/// then line-ending normalization, then UID hoisting (line-oriented, needs
/// CRLF already normalized).
pub fn repair(ical: &str) -> String {
    let repaired = repair_quoting(ical);
    let normalized = normalize_line_endings(&repaired);
    hoist_uid_into_single_component(&normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_bare_lf_and_cr() {
        let input = "BEGIN:VCALENDAR\nEND:VCALENDAR\r";
        let out = normalize_line_endings(input);
        assert_eq!(out, "BEGIN:VCALENDAR\r\nEND:VCALENDAR\r\n");
    }

    #[test]
    fn hoists_stray_uid_into_lone_vevent() {
        let input = "BEGIN:VCALENDAR\r\nUID:abc-123\r\nBEGIN:VEVENT\r\nSUMMARY:Test\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";
        let out = hoist_uid_into_single_component(input);
        assert!(out.contains("BEGIN:VEVENT\r\nUID:abc-123\r\n"));
    }

    #[test]
    fn leaves_component_with_own_uid_untouched() {
        let input = "BEGIN:VCALENDAR\r\nUID:outer\r\nBEGIN:VEVENT\r\nUID:inner\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";
        let out = hoist_uid_into_single_component(input);
        assert_eq!(out, input);
    }

    #[test]
    fn skips_hoist_when_multiple_components_present() {
        let input = "BEGIN:VCALENDAR\r\nUID:outer\r\nBEGIN:VEVENT\r\nEND:VEVENT\r\nBEGIN:VEVENT\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";
        let out = hoist_uid_into_single_component(input);
        assert_eq!(out, input);
    }

    #[test]
    fn repairs_double_escaped_entities() {
        let input = "BEGIN:VCALENDAR\nSUMMARY:Smith &amp;amp; Jones\nEND:VCALENDAR\n";
        let out = repair_quoting(input);
        assert_eq!(out, "BEGIN:VCALENDAR\nSUMMARY:Smith &amp; Jones\nEND:VCALENDAR\n");
    }

    #[test]
    fn escapes_raw_ampersand_left_over_from_malformed_source() {
        let input = "BEGIN:VCALENDAR\nSUMMARY:Smith & Jones\nEND:VCALENDAR\n";
        let out = repair_quoting(input);
        assert_eq!(out, "BEGIN:VCALENDAR\nSUMMARY:Smith &amp; Jones\nEND:VCALENDAR\n");
    }

    #[test]
    fn leaves_numeric_character_references_alone() {
        let input = "BEGIN:VCALENDAR\nSUMMARY:Caf&#233; &amp; Bar&#x65;\nEND:VCALENDAR\n";
        let out = repair_quoting(input);
        assert_eq!(out, "BEGIN:VCALENDAR\nSUMMARY:Caf&#233; &amp; Bar&#x65;\nEND:VCALENDAR\n");
    }

    #[test]
    fn re_escapes_raw_angle_brackets_and_quotes() {
        let input = "BEGIN:VCALENDAR\nSUMMARY:<b>\"quoted\" 'text'</b>\nEND:VCALENDAR\n";
        let out = repair_quoting(input);
        assert_eq!(
            out,
            "BEGIN:VCALENDAR\nSUMMARY:&lt;b&gt;&quot;quoted&quot; &apos;text&apos;&lt;/b&gt;\nEND:VCALENDAR\n"
        );
    }

    #[test]
    fn leaves_text_outside_vcalendar_untouched() {
        let input = "preamble & junk\nBEGIN:VCALENDAR\nSUMMARY:A & B\nEND:VCALENDAR\ntrailer & junk\n";
        let out = repair_quoting(input);
        assert_eq!(
            out,
            "preamble & junk\nBEGIN:VCALENDAR\nSUMMARY:A &amp; B\nEND:VCALENDAR\ntrailer & junk\n"
        );
    }

    #[test]
    fn skips_cdata_wrapped_vcalendar() {
        let input = "BEGIN:VCALENDAR<![CDATA[\nSUMMARY:A & B\nEND:VCALENDAR\n";
        let out = repair_quoting(input);
        assert_eq!(out, input);
    }
}
