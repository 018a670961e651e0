//! Port groups and their allocation.
//!
//! A browser instance talks to its worker over three fixed ports:
//!
//! | Port | Listener | Connected by |
//! |------|----------|--------------|
//! | `child` | worker | controller primary and alternate channels |
//! | `parent` | controller | worker primary channel |
//! | `parent_alt` | controller | worker alternate channel |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::net::{Ipv4Addr, TcpListener};
use std::str::FromStr;

use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

// ============================================================================
// PortGroup
// ============================================================================

/// The three ports of one browser instance.
///
/// A zero port means "let the OS choose"; the worker reports the ports it
/// actually bound in its ready line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PortGroup {
    child: u16,
    parent: u16,
    parent_alt: u16,
}

impl PortGroup {
    /// Creates a port group.
    #[inline]
    #[must_use]
    pub const fn new(child: u16, parent: u16, parent_alt: u16) -> Self {
        Self {
            child,
            parent,
            parent_alt,
        }
    }

    /// A group whose ports are all chosen by the OS.
    #[inline]
    #[must_use]
    pub const fn ephemeral() -> Self {
        Self::new(0, 0, 0)
    }

    /// Port the worker listens on.
    #[inline]
    #[must_use]
    pub const fn child(&self) -> u16 {
        self.child
    }

    /// Port the controller listens on for primary callbacks.
    #[inline]
    #[must_use]
    pub const fn parent(&self) -> u16 {
        self.parent
    }

    /// Port the controller listens on for reentrant callbacks.
    #[inline]
    #[must_use]
    pub const fn parent_alt(&self) -> u16 {
        self.parent_alt
    }

    /// Returns the ports as an array.
    #[inline]
    #[must_use]
    pub const fn ports(&self) -> [u16; 3] {
        [self.child, self.parent, self.parent_alt]
    }

    /// Returns `true` if every port is left to the OS.
    #[inline]
    #[must_use]
    pub const fn is_ephemeral(&self) -> bool {
        self.child == 0 && self.parent == 0 && self.parent_alt == 0
    }

    /// Returns `true` if the two groups share a fixed port.
    #[must_use]
    pub fn conflicts(&self, other: &PortGroup) -> bool {
        self.ports()
            .iter()
            .any(|port| *port != 0 && other.ports().contains(port))
    }

    /// Returns `true` if a fixed port appears twice inside this group.
    #[must_use]
    pub fn has_duplicates(&self) -> bool {
        let ports = self.ports();
        ports
            .iter()
            .enumerate()
            .any(|(i, port)| *port != 0 && ports[i + 1..].contains(port))
    }
}

impl fmt::Display for PortGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.child, self.parent, self.parent_alt)
    }
}

impl FromStr for PortGroup {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.trim().split('/').collect();
        let [child, parent, parent_alt] = parts.as_slice() else {
            return Err(Error::invalid_argument(format!(
                "Port group must be child/parent/parentAlt, got {s:?}"
            )));
        };

        let parse = |part: &str| {
            part.trim()
                .parse::<u16>()
                .map_err(|e| Error::invalid_argument(format!("Invalid port {part:?}: {e}")))
        };

        Ok(Self::new(parse(child)?, parse(parent)?, parse(parent_alt)?))
    }
}

// ============================================================================
// PortRange
// ============================================================================

/// Inclusive range that fixed port groups are drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    /// First port of the range.
    pub start: u16,
    /// Last port of the range.
    pub end: u16,
}

impl PortRange {
    /// Creates an inclusive port range.
    #[inline]
    #[must_use]
    pub const fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    /// Number of ports in the range.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        if self.end < self.start {
            0
        } else {
            usize::from(self.end - self.start) + 1
        }
    }

    /// Returns `true` if the range holds no port.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Checks that the range can hold at least one port group.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the range starts at port 0 or holds
    /// fewer than three ports.
    pub fn validate(&self) -> Result<()> {
        if self.start == 0 {
            return Err(Error::config("port_range must not include port 0"));
        }
        if self.len() < 3 {
            return Err(Error::config(format!(
                "port_range {}-{} must hold at least 3 ports",
                self.start, self.end
            )));
        }
        Ok(())
    }
}

// ============================================================================
// PortAllocator
// ============================================================================

/// Hands out non-overlapping port groups.
///
/// Without a range every group is ephemeral. With a range, ports already
/// handed out or currently bound by another process are skipped.
#[derive(Debug, Default)]
pub struct PortAllocator {
    range: Option<PortRange>,
    in_use: Mutex<FxHashSet<u16>>,
}

impl PortAllocator {
    /// Creates an allocator drawing from `range`, if any.
    #[must_use]
    pub fn new(range: Option<PortRange>) -> Self {
        Self {
            range,
            in_use: Mutex::new(FxHashSet::default()),
        }
    }

    /// Returns the configured range.
    #[inline]
    #[must_use]
    pub fn range(&self) -> Option<PortRange> {
        self.range
    }

    /// Reserves a port group.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PortsUnavailable`] if the range has fewer than three
    /// free ports left.
    pub fn allocate(&self) -> Result<PortGroup> {
        let Some(range) = self.range else {
            return Ok(PortGroup::ephemeral());
        };

        let mut in_use = self.in_use.lock();
        let mut picked = Vec::with_capacity(3);

        for port in range.start..=range.end {
            if in_use.contains(&port) || !is_bindable(port) {
                continue;
            }
            picked.push(port);
            if picked.len() == 3 {
                break;
            }
        }

        let [child, parent, parent_alt] = picked.as_slice() else {
            return Err(Error::ports_unavailable(PortGroup::new(
                range.start,
                range.start.saturating_add(1),
                range.start.saturating_add(2),
            )));
        };

        let group = PortGroup::new(*child, *parent, *parent_alt);
        in_use.extend(group.ports());
        debug!(ports = %group, "Port group allocated");
        Ok(group)
    }

    /// Returns a group's ports to the pool.
    pub fn release(&self, group: PortGroup) {
        let mut in_use = self.in_use.lock();
        for port in group.ports() {
            in_use.remove(&port);
        }
        debug!(ports = %group, "Port group released");
    }

    /// Number of ports currently reserved.
    #[inline]
    #[must_use]
    pub fn reserved(&self) -> usize {
        self.in_use.lock().len()
    }
}

/// Checks whether a loopback port can be bound right now.
fn is_bindable(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}

// ============================================================================
// Tests
// ============================================================================
