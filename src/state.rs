use std::io::Write;
use std::path::{Path, PathBuf};

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use log::{debug, warn};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::{CIFetchError, Result};
use crate::models::CiKind;
use crate::template::Template;

pub const DEFAULT_STATE_FILE: &str = ".cifetch.state.json";

/// Identifies one provider together with the path templates it writes to.
/// Changing a template, or the value of a variable one of them uses, yields
/// a new fingerprint, so earlier coverage no longer applies.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(ci: CiKind, templates: &[&str], vars: &IndexMap<String, String>) -> Self {
        let mut sorted = templates.to_vec();
        sorted.sort_unstable();
        sorted.dedup();

        let mut hasher = Sha256::new();
        for template in &sorted {
            hasher.update(template.as_bytes());
            hasher.update([0]);
        }
        for (name, value) in referenced_vars(&sorted, vars) {
            hasher.update(name.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
            hasher.update([0]);
        }
        let digest = hex::encode(hasher.finalize());
        Self(format!("{ci}:{}", &digest[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Variables the templates use, directly or through other variables, in
/// config order
fn referenced_vars<'a>(
    templates: &[&str],
    vars: &'a IndexMap<String, String>,
) -> Vec<(&'a str, &'a str)> {
    let placeholder_names = |source: &str| -> Vec<String> {
        Template::parse(source)
            .map(|t| t.placeholders().map(|p| p.name.clone()).collect())
            .unwrap_or_default()
    };

    let mut used: HashSet<String> = templates
        .iter()
        .flat_map(|t| placeholder_names(t))
        .collect();
    // a variable only refers to ones defined before it
    for (name, value) in vars.iter().rev() {
        if used.contains(name) {
            used.extend(placeholder_names(value));
        }
    }

    vars.iter()
        .filter(|(name, _)| used.contains(name.as_str()))
        .map(|(name, value)| (name.as_str(), value.as_str()))
        .collect()
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Persistent per-fingerprint checkpoints.
///
/// Stored as a flat JSON object of fingerprint to RFC 3339 timestamp. Keys
/// this version doesn't understand are carried through rewrites untouched.
#[derive(Debug)]
pub struct StateFile {
    path: PathBuf,
    entries: Map<String, Value>,
    modified: bool,
}

impl StateFile {
    /// Read the state file; a missing or blank file is an empty state
    pub fn load(path: &Path) -> Result<Self> {
        let entries = match std::fs::read_to_string(path) {
            Ok(text) if text.trim().is_empty() => Map::new(),
            Ok(text) => match serde_json::from_str::<Value>(&text)? {
                Value::Object(map) => map,
                other => {
                    return Err(CIFetchError::Config(format!(
                        "State file {} must hold a JSON object, found {other}",
                        path.display()
                    )))
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No state file at {}; starting fresh", path.display());
                Map::new()
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path: path.to_path_buf(),
            entries,
            modified: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub fn get(&self, fingerprint: &Fingerprint) -> Option<DateTime<Utc>> {
        let value = self.entries.get(fingerprint.as_str())?;
        let parsed = value
            .as_str()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));
        if parsed.is_none() {
            warn!("Ignoring unparseable checkpoint for {fingerprint}: {value}");
        }
        parsed
    }

    /// Record coverage up to `at`. Older or equal timestamps are ignored;
    /// returns whether the stored value moved.
    pub fn checkpoint(&mut self, fingerprint: &Fingerprint, at: DateTime<Utc>) -> bool {
        if self.get(fingerprint).is_some_and(|current| at <= current) {
            return false;
        }
        self.entries.insert(
            fingerprint.as_str().to_string(),
            Value::String(at.to_rfc3339()),
        );
        self.modified = true;
        debug!("{fingerprint} timestamp floor updated to {at}");
        true
    }

    pub fn effective_since(
        &self,
        fingerprint: &Fingerprint,
        configured: Option<DateTime<Utc>>,
        floor: DateTime<Utc>,
    ) -> DateTime<Utc> {
        effective_since(self.get(fingerprint), configured, floor)
    }

    /// Atomically replace the file on disk with the current state
    pub fn persist(&self) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, &self.entries)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;

        debug!("State written to {}", self.path.display());
        Ok(())
    }
}

/// Lower bound of the next fetch window.
///
/// A configured `since` newer than the checkpoint was advanced by hand and
/// wins outright. Otherwise the checkpoint stands, raised to `floor`. With
/// neither value the window starts at `floor`.
pub fn effective_since(
    stored: Option<DateTime<Utc>>,
    configured: Option<DateTime<Utc>>,
    floor: DateTime<Utc>,
) -> DateTime<Utc> {
    match (stored, configured) {
        (None, Some(configured)) => configured,
        (None, None) => floor,
        (Some(stored), Some(configured)) if configured > stored => {
            if configured < floor {
                warn!("`since` option appears to have been manually updated; ignoring `max-days-back`");
            }
            configured
        }
        (Some(stored), _) => stored.max(floor),
    }
}

/// Tracks which in-window builds were seen, and whether each was complete
#[derive(Debug, Default)]
pub struct Coverage {
    seen: Vec<(DateTime<Utc>, bool)>,
}

impl Coverage {
    pub fn register(&mut self, at: DateTime<Utc>, complete: bool) {
        self.seen.push((at, complete));
    }

    /// The newest timestamp such that every build at or before it was
    /// complete, or `since` if the oldest build is still running.
    pub fn new_since(mut self, since: DateTime<Utc>) -> DateTime<Utc> {
        // Incomplete sorts first among equal timestamps
        self.seen.sort_unstable();
        let mut covered = since;
        for (at, complete) in self.seen {
            if !complete {
                break;
            }
            covered = at;
        }
        covered
    }
}
