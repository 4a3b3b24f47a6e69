//! Kubernetes version strings
//!
//! Versions show up as "1.30", "v1.30.3" and "v1.30.3+1.el8" across kubelet
//! status, kubeadm config and image tags. Only major.minor.patch matter here.

use std::cmp::Ordering;
use std::fmt;

use crate::{Error, Result};

/// A parsed `major.minor[.patch]` version
///
/// Ordering is (major, minor, patch) with an absent patch sorting first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KubeVersion {
    /// Major
    pub major: u32,
    /// Minor
    pub minor: u32,
    /// Patch, when given
    pub patch: Option<u32>,
}

impl KubeVersion {
    /// Parse a version, tolerating a leading `v` and build metadata
    pub fn parse(s: &str) -> Result<Self> {
        let trimmed = s.trim().trim_start_matches('v');
        let core = trimmed
            .split(['+', '-'])
            .next()
            .unwrap_or_default();
        let mut parts = core.split('.');
        let mut next = |what: &str| -> Result<Option<u32>> {
            match parts.next() {
                None => Ok(None),
                Some(p) => p.parse::<u32>().map(Some).map_err(|_| {
                    Error::validation(format!("invalid {what} in kubernetes version {s:?}"))
                }),
            }
        };
        let major = next("major")?
            .ok_or_else(|| Error::validation(format!("empty kubernetes version {s:?}")))?;
        let minor = next("minor")?.ok_or_else(|| {
            Error::validation(format!("kubernetes version {s:?} must be major.minor"))
        })?;
        let patch = next("patch")?;
        if parts.next().is_some() {
            return Err(Error::validation(format!(
                "kubernetes version {s:?} has too many components"
            )));
        }
        Ok(Self {
            major,
            minor,
            patch,
        })
    }

    /// `major.minor`
    pub fn minor_string(&self) -> String {
        format!("{}.{}", self.major, self.minor)
    }

    /// True if both versions share major.minor
    pub fn same_minor(&self, other: &KubeVersion) -> bool {
        self.major == other.major && self.minor == other.minor
    }

    /// Compare on major.minor only
    pub fn cmp_minor(&self, other: &KubeVersion) -> Ordering {
        (self.major, self.minor).cmp(&(other.major, other.minor))
    }
}

impl fmt::Display for KubeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.patch {
            Some(p) => write!(f, "{}.{}.{}", self.major, self.minor, p),
            None => write!(f, "{}.{}", self.major, self.minor),
        }
    }
}

impl std::str::FromStr for KubeVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
