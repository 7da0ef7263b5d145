//! Wire-level types shared by the XML reader (C3), method requests (C4) and
//! the DAV client facade (C5).

use std::fmt;

/// WebDAV `Depth` header value. CalDAV never needs `infinity` for the
/// operations this crate performs (principal/home discovery is depth 0,
/// calendar enumeration and reports are depth 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Depth {
    Zero,
    One,
}

impl Depth {
    pub fn as_str(self) -> &'static str {
        match self {
            Depth::Zero => "0",
            Depth::One => "1",
        }
    }
}

/// The three component kinds a calendar collection may advertise support
/// for (`supported-calendar-component-set`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentKind {
    Event,
    Todo,
    Journal,
}

impl ComponentKind {
    fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "VEVENT" => Some(Self::Event),
            "VTODO" => Some(Self::Todo),
            "VJOURNAL" => Some(Self::Journal),
            _ => None,
        }
    }
}

/// Allowed component kinds for a calendar collection. Default (missing
/// `supported-calendar-component-set`) is all three, per `spec.md` §4.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComponentSet {
    pub events: bool,
    pub todos: bool,
    pub journals: bool,
}

impl Default for ComponentSet {
    fn default() -> Self {
        Self {
            events: true,
            todos: true,
            journals: true,
        }
    }
}

impl ComponentSet {
    pub fn empty() -> Self {
        Self {
            events: false,
            todos: false,
            journals: false,
        }
    }

    pub fn insert_name(&mut self, name: &str) {
        match ComponentKind::from_name(name) {
            Some(ComponentKind::Event) => self.events = true,
            Some(ComponentKind::Todo) => self.todos = true,
            Some(ComponentKind::Journal) => self.journals = true,
            None => {}
        }
    }
}

/// DAV privilege flags from `current-user-privilege-set`. `spec.md` §3:
/// default is read+write; a `<D:all/>` privilege expands to every flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Privileges {
    pub read: bool,
    pub write: bool,
    pub write_properties: bool,
    pub unlock: bool,
    pub read_acl: bool,
    pub read_current_user_privilege_set: bool,
    pub write_acl: bool,
    pub bind: bool,
    pub unbind: bool,
}

impl Privileges {
    pub fn none() -> Self {
        Self {
            read: false,
            write: false,
            write_properties: false,
            unlock: false,
            read_acl: false,
            read_current_user_privilege_set: false,
            write_acl: false,
            bind: false,
            unbind: false,
        }
    }

    pub fn all() -> Self {
        Self {
            read: true,
            write: true,
            write_properties: true,
            unlock: true,
            read_acl: true,
            read_current_user_privilege_set: true,
            write_acl: true,
            bind: true,
            unbind: true,
        }
    }

    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
            ..Self::none()
        }
    }

    pub fn insert_name(&mut self, name: &str) {
        match name {
            "all" => *self = Self::all(),
            "read" => self.read = true,
            "write" => self.write = true,
            "write-properties" => self.write_properties = true,
            "unlock" => self.unlock = true,
            "read-acl" => self.read_acl = true,
            "read-current-user-privilege-set" => self.read_current_user_privilege_set = true,
            "write-acl" => self.write_acl = true,
            "bind" => self.bind = true,
            "unbind" => self.unbind = true,
            _ => {}
        }
    }
}

impl Default for Privileges {
    fn default() -> Self {
        Self::read_write()
    }
}

/// Describes one remote calendar collection (`spec.md` §3 `CalendarInfo`).
#[derive(Debug, Clone)]
pub struct CalendarInfo {
    pub remote_path: String,
    pub display_name: String,
    pub description: Option<String>,
    /// Normalized `#RRGGBB`, alpha stripped. `None` if the server omitted it.
    pub color: Option<String>,
    pub user_principal: Option<String>,
    pub privileges: Privileges,
    pub allowed_components: ComponentSet,
}

/// One remote calendar object (`spec.md` §3 `Resource`).
#[derive(Debug, Clone)]
pub struct Resource {
    /// Percent-decoded.
    pub href: String,
    pub etag: Option<String>,
    pub status: Option<String>,
    pub data: Option<String>,
}

/// Result of principal + home + mailto discovery (`spec.md` §4.4
/// `discoverUserPrincipal`).
#[derive(Debug, Clone, Default)]
pub struct DiscoveredPrincipal {
    pub principal_href: Option<String>,
    pub home_href: Option<String>,
    pub mailto: Option<String>,
}

impl fmt::Display for Depth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
