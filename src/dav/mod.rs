//! WebDAV/CalDAV wire layer: C2 (request base), C3 (XML reader), C4
//! (method requests) and C5 (client facade).

pub mod client;
pub mod ical_repair;
pub mod requests;
pub mod types;
pub mod xml;

pub use client::{AuthMethod, DavClient, host_requires_forced_basic};
pub use types::{CalendarInfo, ComponentSet, Depth, DiscoveredPrincipal, Privileges, Resource};
