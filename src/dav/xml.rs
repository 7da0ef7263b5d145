//! XML Reader (C3): parses WebDAV `207 Multi-Status` replies into typed
//! records. Namespace-aware only by local name (matches the teacher's
//! `element_from_bytes` approach) since every server this crate talks to
//! uses the canonical `DAV:`/`urn:ietf:params:xml:ns:caldav` prefixes or
//! equivalents differing only in the namespace alias, never the URI.

use anyhow::{Result, anyhow};
use quick_xml::Reader;
use quick_xml::escape::unescape;
use quick_xml::events::{BytesStart, Event};
use std::io::{BufRead, Cursor};

use crate::dav::types::{ComponentSet, Privileges};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum El {
    Multistatus,
    Response,
    Propstat,
    Prop,
    Href,
    Status,
    Displayname,
    Getetag,
    Resourcetype,
    Collection,
    Calendar,
    SupportedCalendarComponentSet,
    Comp,
    CalendarData,
    CalendarDescription,
    CalendarColor,
    CalendarHomeSet,
    CalendarUserAddressSet,
    CurrentUserPrincipal,
    CurrentUserPrivilegeSet,
    Privilege,
    All,
    Read,
    Write,
    WriteProperties,
    Unlock,
    ReadAcl,
    ReadCurrentUserPrivilegeSet,
    WriteAcl,
    Bind,
    Unbind,
    Owner,
    Other,
}

fn el_from_bytes(raw: &[u8]) -> El {
    let local = match raw.iter().position(|b| *b == b':') {
        Some(idx) => &raw[idx + 1..],
        None => raw,
    };
    let eq = |s: &str| local.eq_ignore_ascii_case(s.as_bytes());
    if eq("multistatus") {
        El::Multistatus
    } else if eq("response") {
        El::Response
    } else if eq("propstat") {
        El::Propstat
    } else if eq("prop") {
        El::Prop
    } else if eq("href") {
        El::Href
    } else if eq("status") {
        El::Status
    } else if eq("displayname") {
        El::Displayname
    } else if eq("getetag") {
        El::Getetag
    } else if eq("resourcetype") {
        El::Resourcetype
    } else if eq("collection") {
        El::Collection
    } else if eq("calendar") {
        El::Calendar
    } else if eq("supported-calendar-component-set") {
        El::SupportedCalendarComponentSet
    } else if eq("comp") {
        El::Comp
    } else if eq("calendar-data") {
        El::CalendarData
    } else if eq("calendar-description") {
        El::CalendarDescription
    } else if eq("calendar-color") {
        El::CalendarColor
    } else if eq("calendar-home-set") {
        El::CalendarHomeSet
    } else if eq("calendar-user-address-set") {
        El::CalendarUserAddressSet
    } else if eq("current-user-principal") {
        El::CurrentUserPrincipal
    } else if eq("current-user-privilege-set") {
        El::CurrentUserPrivilegeSet
    } else if eq("privilege") {
        El::Privilege
    } else if eq("all") {
        El::All
    } else if eq("read") {
        El::Read
    } else if eq("write") {
        El::Write
    } else if eq("write-properties") {
        El::WriteProperties
    } else if eq("unlock") {
        El::Unlock
    } else if eq("read-acl") {
        El::ReadAcl
    } else if eq("read-current-user-privilege-set") {
        El::ReadCurrentUserPrivilegeSet
    } else if eq("write-acl") {
        El::WriteAcl
    } else if eq("bind") {
        El::Bind
    } else if eq("unbind") {
        El::Unbind
    } else if eq("owner") {
        El::Owner
    } else {
        El::Other
    }
}

/// One `<href preferred="1">` entry from a `calendar-user-address-set`.
#[derive(Debug, Clone)]
pub struct AddressHref {
    pub href: String,
    pub preferred: bool,
}

/// Raw per-`<response>` record, before any higher-level interpretation
/// (color normalization, default-filling) is applied.
#[derive(Debug, Clone, Default)]
pub struct RawResponse {
    pub href: String,
    pub status: Option<String>,
    pub displayname: Option<String>,
    pub etag: Option<String>,
    pub is_collection: bool,
    pub is_calendar: bool,
    pub supported_components: ComponentSet,
    pub has_component_set_prop: bool,
    pub calendar_data: Option<String>,
    pub calendar_description: Option<String>,
    pub calendar_color: Option<String>,
    pub calendar_home_set: Vec<String>,
    pub calendar_user_address_set: Vec<AddressHref>,
    pub current_user_principal: Vec<String>,
    pub current_user_privilege_set: Option<Privileges>,
    pub owner: Option<String>,
}

struct Parser {
    stack: Vec<El>,
    responses: Vec<RawResponse>,
    current: RawResponse,
    // buffered until we know the enclosing propstat's status
    staged: RawResponse,
    propstat_status_ok: bool,
    // scratch for the in-progress privilege set / address-set-href
    privileges_acc: Privileges,
    saw_privilege_prop: bool,
    addr_href_acc: String,
    addr_href_preferred: bool,
}

impl Parser {
    fn new() -> Self {
        Self {
            stack: Vec::with_capacity(16),
            responses: Vec::new(),
            current: RawResponse::default(),
            staged: RawResponse::default(),
            propstat_status_ok: true,
            privileges_acc: Privileges::none(),
            saw_privilege_prop: false,
            addr_href_acc: String::new(),
            addr_href_preferred: false,
        }
    }

    fn path_ends_with(&self, needle: &[El]) -> bool {
        self.stack.len() >= needle.len() && self.stack[self.stack.len() - needle.len()..] == needle[..]
    }

    fn on_start(&mut self, e: &BytesStart<'_>) -> Result<()> {
        let el = el_from_bytes(e.name().as_ref());
        self.stack.push(el);
        match el {
            El::Response => {
                self.current = RawResponse::default();
            }
            El::Propstat => {
                self.staged = RawResponse::default();
                self.propstat_status_ok = true;
                self.privileges_acc = Privileges::none();
                self.saw_privilege_prop = false;
            }
            El::Collection
                if self.path_ends_with(&[
                    El::Response,
                    El::Propstat,
                    El::Prop,
                    El::Resourcetype,
                    El::Collection,
                ]) =>
            {
                self.staged.is_collection = true;
            }
            El::Calendar
                if self.path_ends_with(&[
                    El::Response,
                    El::Propstat,
                    El::Prop,
                    El::Resourcetype,
                    El::Calendar,
                ]) =>
            {
                self.staged.is_calendar = true;
            }
            El::Comp
                if self.path_ends_with(&[
                    El::Response,
                    El::Propstat,
                    El::Prop,
                    El::SupportedCalendarComponentSet,
                    El::Comp,
                ]) =>
            {
                self.staged.has_component_set_prop = true;
                for attr in e.attributes().with_checks(false) {
                    let attr = attr?;
                    let key = String::from_utf8_lossy(attr.key.as_ref()).to_ascii_lowercase();
                    if key == "name" {
                        let value = attr
                            .unescape_value()
                            .map_err(|err| anyhow!("invalid XML attribute: {err}"))?;
                        self.staged.supported_components.insert_name(&value);
                    }
                }
            }
            El::Href
                if self.path_ends_with(&[
                    El::Response,
                    El::Propstat,
                    El::Prop,
                    El::CalendarUserAddressSet,
                    El::Href,
                ]) =>
            {
                self.addr_href_acc.clear();
                self.addr_href_preferred = false;
                for attr in e.attributes().with_checks(false) {
                    let attr = attr?;
                    let key = String::from_utf8_lossy(attr.key.as_ref()).to_ascii_lowercase();
                    if key == "preferred" {
                        let value = attr
                            .unescape_value()
                            .map_err(|err| anyhow!("invalid XML attribute: {err}"))?;
                        self.addr_href_preferred = value.as_ref() == "1" || value.eq_ignore_ascii_case("true");
                    }
                }
            }
            _ if self.path_ends_with(&[
                El::Response,
                El::Propstat,
                El::Prop,
                El::CurrentUserPrivilegeSet,
                El::Privilege,
            ]) =>
            {
                self.saw_privilege_prop = true;
                match el {
                    El::All => self.privileges_acc = Privileges::all(),
                    El::Read => self.privileges_acc.read = true,
                    El::Write => self.privileges_acc.write = true,
                    El::WriteProperties => self.privileges_acc.write_properties = true,
                    El::Unlock => self.privileges_acc.unlock = true,
                    El::ReadAcl => self.privileges_acc.read_acl = true,
                    El::ReadCurrentUserPrivilegeSet => {
                        self.privileges_acc.read_current_user_privilege_set = true
                    }
                    El::WriteAcl => self.privileges_acc.write_acl = true,
                    El::Bind => self.privileges_acc.bind = true,
                    El::Unbind => self.privileges_acc.unbind = true,
                    _ => {}
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn on_end(&mut self, name: &[u8]) -> Result<()> {
        let el = el_from_bytes(name);
        if let Some(popped) = self.stack.pop() {
            match popped {
                El::Propstat => {
                    if self.saw_privilege_prop {
                        self.staged.current_user_privilege_set = Some(self.privileges_acc);
                    }
                    if self.propstat_status_ok {
                        merge_staged(&mut self.current, std::mem::take(&mut self.staged));
                    }
                    // a non-200 propstat's properties are silently discarded.
                }
                El::Response => {
                    let finished = std::mem::take(&mut self.current);
                    self.responses.push(finished);
                }
                El::Href
                    if el == El::Href
                        && self.stack.last() == Some(&El::CalendarUserAddressSet) =>
                {
                    self.staged.calendar_user_address_set.push(AddressHref {
                        href: std::mem::take(&mut self.addr_href_acc),
                        preferred: self.addr_href_preferred,
                    });
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn handle_text(&mut self, text: String) {
        if text.is_empty() {
            return;
        }

        if self.path_ends_with(&[El::Response, El::Propstat, El::Prop, El::CalendarData]) {
            let dst = self.staged.calendar_data.get_or_insert_with(String::new);
            dst.push_str(&text);
            return;
        }

        if self.path_ends_with(&[
            El::Response,
            El::Propstat,
            El::Prop,
            El::CalendarUserAddressSet,
            El::Href,
        ]) {
            self.addr_href_acc.push_str(text.trim());
            return;
        }

        let trimmed = text.trim();
        if trimmed.is_empty() {
            return;
        }

        if self.path_ends_with(&[El::Response, El::Href]) {
            self.current.href = trimmed.to_string();
        } else if self.path_ends_with(&[El::Response, El::Status])
            || self.path_ends_with(&[El::Response, El::Propstat, El::Status])
        {
            let is_propstat = self.path_ends_with(&[El::Response, El::Propstat, El::Status]);
            if is_propstat {
                self.propstat_status_ok = status_line_is_ok(trimmed);
            } else {
                self.current.status = Some(trimmed.to_string());
            }
        } else if self.path_ends_with(&[El::Response, El::Propstat, El::Prop, El::Displayname]) {
            self.staged.displayname = Some(trimmed.to_string());
        } else if self.path_ends_with(&[El::Response, El::Propstat, El::Prop, El::Getetag]) {
            self.staged.etag = Some(trimmed.to_string());
        } else if self.path_ends_with(&[
            El::Response,
            El::Propstat,
            El::Prop,
            El::CalendarDescription,
        ]) {
            self.staged.calendar_description = Some(trimmed.to_string());
        } else if self.path_ends_with(&[El::Response, El::Propstat, El::Prop, El::CalendarColor]) {
            self.staged.calendar_color = Some(trimmed.to_string());
        } else if self.path_ends_with(&[
            El::Response,
            El::Propstat,
            El::Prop,
            El::CalendarHomeSet,
            El::Href,
        ]) {
            self.staged.calendar_home_set.push(trimmed.to_string());
        } else if self.path_ends_with(&[
            El::Response,
            El::Propstat,
            El::Prop,
            El::CurrentUserPrincipal,
            El::Href,
        ]) {
            self.staged.current_user_principal.push(trimmed.to_string());
        } else if self.path_ends_with(&[El::Response, El::Propstat, El::Prop, El::Owner, El::Href]) {
            self.staged.owner = Some(trimmed.to_string());
        }
    }
}

fn status_line_is_ok(status: &str) -> bool {
    // "HTTP/1.1 200 OK" -> extract the numeric code.
    status
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .map(|code| (200..300).contains(&code))
        .unwrap_or(true)
}

fn merge_staged(into: &mut RawResponse, staged: RawResponse) {
    if staged.is_collection {
        into.is_collection = true;
    }
    if staged.is_calendar {
        into.is_calendar = true;
    }
    if staged.has_component_set_prop {
        into.has_component_set_prop = true;
        into.supported_components = staged.supported_components;
    }
    if staged.displayname.is_some() {
        into.displayname = staged.displayname;
    }
    if staged.etag.is_some() {
        into.etag = staged.etag;
    }
    if staged.calendar_data.is_some() {
        into.calendar_data = staged.calendar_data;
    }
    if staged.calendar_description.is_some() {
        into.calendar_description = staged.calendar_description;
    }
    if staged.calendar_color.is_some() {
        into.calendar_color = staged.calendar_color;
    }
    if !staged.calendar_home_set.is_empty() {
        into.calendar_home_set = staged.calendar_home_set;
    }
    if !staged.calendar_user_address_set.is_empty() {
        into.calendar_user_address_set = staged.calendar_user_address_set;
    }
    if !staged.current_user_principal.is_empty() {
        into.current_user_principal = staged.current_user_principal;
    }
    if staged.current_user_privilege_set.is_some() {
        into.current_user_privilege_set = staged.current_user_privilege_set;
    }
    if staged.owner.is_some() {
        into.owner = staged.owner;
    }
}

fn decode_text(raw: &[u8]) -> Result<String> {
    match std::str::from_utf8(raw) {
        Ok(s) => Ok(unescape(s)
            .map_err(|err| anyhow!("XML decode error: {err}"))?
            .into_owned()),
        Err(_) => Ok(String::from_utf8_lossy(raw).into_owned()),
    }
}

fn parse_with<R: BufRead>(reader: R) -> Result<Vec<RawResponse>> {
    let mut xml = Reader::from_reader(reader);
    xml.config_mut().trim_text(false);

    let mut buf = Vec::with_capacity(8 * 1024);
    let mut parser = Parser::new();

    loop {
        match xml.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => parser.on_start(&e)?,
            Ok(Event::Empty(e)) => {
                parser.on_start(&e)?;
                parser.on_end(e.name().as_ref())?;
            }
            Ok(Event::Text(e)) => parser.handle_text(decode_text(e.as_ref())?),
            Ok(Event::CData(e)) => {
                parser.handle_text(String::from_utf8_lossy(e.as_ref()).into_owned())
            }
            Ok(Event::End(e)) => parser.on_end(e.name().as_ref())?,
            Ok(Event::Eof) => break,
            Err(e) => return Err(anyhow!("XML parsing error: {e}")),
            _ => {}
        }
        buf.clear();
    }

    Ok(parser.responses)
}

/// Parse a WebDAV `207 Multi-Status` XML body.
pub fn parse_multistatus(body: &[u8]) -> Result<Vec<RawResponse>> {
    parse_with(Cursor::new(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_calendar_list_response() {
        let body = br#"<?xml version="1.0"?>
<D:multistatus xmlns:D="DAV:" xmlns:C="urn:ietf:params:xml:ns:caldav" xmlns:A="http://apple.com/ns/ical/">
  <D:response>
    <D:href>/calendars/user/home/</D:href>
    <D:propstat>
      <D:prop>
        <D:resourcetype><D:collection/></D:resourcetype>
      </D:prop>
      <D:status>HTTP/1.1 200 OK</D:status>
    </D:propstat>
  </D:response>
  <D:response>
    <D:href>/calendars/user/personal/</D:href>
    <D:propstat>
      <D:prop>
        <D:resourcetype><D:collection/><C:calendar/></D:resourcetype>
        <D:displayname>Personal</D:displayname>
        <A:calendar-color>#FF0000FF</A:calendar-color>
        <D:current-user-principal><D:href>/principals/user/</D:href></D:current-user-principal>
        <D:current-user-privilege-set>
          <D:privilege><D:read/></D:privilege>
          <D:privilege><D:write/></D:privilege>
        </D:current-user-privilege-set>
        <C:supported-calendar-component-set>
          <C:comp name="VEVENT"/>
        </C:supported-calendar-component-set>
      </D:prop>
      <D:status>HTTP/1.1 200 OK</D:status>
    </D:propstat>
    <D:propstat>
      <D:prop>
        <D:quota-used-bytes/>
      </D:prop>
      <D:status>HTTP/1.1 404 Not Found</D:status>
    </D:propstat>
  </D:response>
</D:multistatus>"#;

        let responses = parse_multistatus(body).unwrap();
        assert_eq!(responses.len(), 2);
        assert!(responses[0].is_collection && !responses[0].is_calendar);
        let cal = &responses[1];
        assert!(cal.is_calendar);
        assert_eq!(cal.displayname.as_deref(), Some("Personal"));
        assert_eq!(cal.calendar_color.as_deref(), Some("#FF0000FF"));
        assert!(cal.has_component_set_prop);
        assert!(cal.supported_components.events);
        assert!(!cal.supported_components.todos);
        let privs = cal.current_user_privilege_set.unwrap();
        assert!(privs.read && privs.write && !privs.bind);
    }

    #[test]
    fn non_200_propstat_is_ignored_not_a_parse_failure() {
        let body = br#"<D:multistatus xmlns:D="DAV:">
  <D:response>
    <D:href>/x.ics</D:href>
    <D:propstat>
      <D:prop><D:getetag>"should-not-appear"</D:getetag></D:prop>
      <D:status>HTTP/1.1 404 Not Found</D:status>
    </D:propstat>
  </D:response>
</D:multistatus>"#;
        let responses = parse_multistatus(body).unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].etag, None);
    }
}
