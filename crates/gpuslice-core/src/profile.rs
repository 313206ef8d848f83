//! Slice profiles and their decoding from resource-limit keys

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use crate::{SliceError, SliceResult};

/// Largest compute slice count a single GPU exposes
pub const MAX_COMPUTE_SLICES: u8 = 8;

static PROFILE_REGEX: OnceLock<Regex> = OnceLock::new();

fn profile_regex() -> &'static Regex {
    PROFILE_REGEX.get_or_init(|| {
        Regex::new(r"(\d+)g\.(\d+)gb(\+me)?").expect("Failed to compile profile regex")
    })
}

/// A validated hardware-partition shape such as `1g.5gb` or `1g.5gb+me`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Profile {
    compute_slices: u8,
    memory_gb: u16,
    media_extensions: bool,
}

impl Profile {
    /// Create a profile, rejecting shapes no GPU can expose
    pub fn new(compute_slices: u8, memory_gb: u16, media_extensions: bool) -> SliceResult<Self> {
        if compute_slices == 0 || compute_slices > MAX_COMPUTE_SLICES {
            return Err(SliceError::MalformedWorkload(format!(
                "compute slice count {} out of range 1..={}",
                compute_slices, MAX_COMPUTE_SLICES
            )));
        }
        if memory_gb == 0 {
            return Err(SliceError::MalformedWorkload(
                "profile memory must be non-zero".to_string(),
            ));
        }
        Ok(Self {
            compute_slices,
            memory_gb,
            media_extensions,
        })
    }

    /// Number of compute slices
    pub fn compute_slices(&self) -> u8 {
        self.compute_slices
    }

    /// Memory in GB
    pub fn memory_gb(&self) -> u16 {
        self.memory_gb
    }

    /// Whether the profile carries media extensions
    pub fn media_extensions(&self) -> bool {
        self.media_extensions
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}g.{}gb", self.compute_slices, self.memory_gb)?;
        if self.media_extensions {
            write!(f, "+me")?;
        }
        Ok(())
    }
}

impl FromStr for Profile {
    type Err = SliceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = profile_regex()
            .captures(s)
            .filter(|c| c.get(0).map(|m| m.as_str()) == Some(s))
            .ok_or_else(|| SliceError::MalformedWorkload(format!("invalid profile: {}", s)))?;

        let compute = caps[1]
            .parse::<u8>()
            .map_err(|_| SliceError::MalformedWorkload(format!("invalid profile: {}", s)))?;
        let memory = caps[2]
            .parse::<u16>()
            .map_err(|_| SliceError::MalformedWorkload(format!("invalid profile: {}", s)))?;

        Profile::new(compute, memory, caps.get(3).is_some())
    }
}

impl TryFrom<String> for Profile {
    type Error = SliceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Profile> for String {
    fn from(profile: Profile) -> Self {
        profile.to_string()
    }
}

/// Decode the requested profile from a container's resource limits.
///
/// Only keys containing `marker` (e.g. `gpuslice.io/mig-1g.5gb` with marker `mig-`)
/// are considered. Exactly one distinct profile must be present.
pub fn decode_profile(limits: &BTreeMap<String, String>, marker: &str) -> SliceResult<Profile> {
    let mut found: Option<Profile> = None;

    for key in limits.keys().filter(|k| k.contains(marker)) {
        let Some(m) = profile_regex().find(key) else {
            continue;
        };
        let profile: Profile = m.as_str().parse()?;
        match found {
            Some(existing) if existing != profile => {
                return Err(SliceError::MalformedWorkload(format!(
                    "multiple slice profiles requested: {} and {}",
                    existing, profile
                )));
            }
            _ => found = Some(profile),
        }
    }

    found.ok_or_else(|| SliceError::MalformedWorkload("no slice profile in limits".to_string()))
}

/// Whether any limit key requests a slice
pub fn requests_slice(limits: &BTreeMap<String, String>, marker: &str) -> bool {
    limits
        .keys()
        .any(|k| k.contains(marker) && profile_regex().is_match(k))
}
