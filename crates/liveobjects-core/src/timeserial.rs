//! Timeserials and per-site causal bookkeeping.
//!
//! A timeserial is an opaque, lexicographically ordered logical clock value
//! issued per site. Each object keeps the highest serial it has accepted from
//! every site (its "site timeserials"); an operation is applied only if it
//! advances that entry.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A per-site monotonically increasing logical clock value.
///
/// Ordering is plain string ordering; serial generators zero-pad so that
/// lexicographic order matches issue order.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timeserial(String);

impl Timeserial {
    pub fn new(serial: impl Into<String>) -> Self {
        Self(serial.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// An empty serial sorts before every other serial and is treated as absent.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Timeserial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timeserial({})", self.0)
    }
}

impl fmt::Display for Timeserial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Timeserial {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Timeserial {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Per-key LWW comparison between an incoming operation serial and the serial
/// stored on a map entry.
///
/// Missing or empty serials count as the earliest possible serial, so two
/// missing serials compare equal and the operation loses.
pub fn is_newer(op_serial: Option<&Timeserial>, entry_serial: Option<&Timeserial>) -> bool {
    let op_serial = op_serial.filter(|s| !s.is_empty());
    let entry_serial = entry_serial.filter(|s| !s.is_empty());

    match (op_serial, entry_serial) {
        (None, _) => false,
        (Some(_), None) => true,
        (Some(op), Some(entry)) => op > entry,
    }
}

/// Highest accepted serial per site code for a single object.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SiteTimeserials {
    entries: BTreeMap<String, Timeserial>,
}

impl SiteTimeserials {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    pub fn from_entries<S, T>(entries: impl IntoIterator<Item = (S, T)>) -> Self
    where
        S: Into<String>,
        T: Into<Timeserial>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|(site, serial)| (site.into(), serial.into()))
                .collect(),
        }
    }

    /// Get the highest serial recorded for a site.
    pub fn get(&self, site_code: &str) -> Option<&Timeserial> {
        self.entries.get(site_code)
    }

    /// The site gate: true iff `serial` is strictly greater than anything
    /// already accepted from `site_code`.
    pub fn can_apply(&self, site_code: &str, serial: &Timeserial) -> bool {
        match self.entries.get(site_code) {
            Some(seen) => serial > seen,
            None => true,
        }
    }

    /// Record an accepted serial for a site.
    pub fn record(&mut self, site_code: impl Into<String>, serial: Timeserial) {
        self.entries.insert(site_code.into(), serial);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Timeserial)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
