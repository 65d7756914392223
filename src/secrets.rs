use std::borrow::Cow;
use std::io::Write;
use std::path::Path;

use log::{info, warn};
use regex::bytes::{Captures, Regex};

use crate::config::Config;
use crate::error::{CIFetchError, Result};

/// Masks secrets in downloaded logs.
///
/// Every match of a configured pattern is replaced with as many `*` as it
/// has characters, unless it also matches the allow pattern.
#[derive(Debug, Clone)]
pub struct Sanitizer {
    patterns: Vec<(String, Regex)>,
    allow: Option<Regex>,
}

impl Sanitizer {
    pub fn new<'a>(
        secrets: impl IntoIterator<Item = (&'a str, &'a str)>,
        allow: Option<&str>,
    ) -> Result<Self> {
        let patterns = secrets
            .into_iter()
            .map(|(name, pattern)| {
                Regex::new(pattern)
                    .map(|regex| (name.to_string(), regex))
                    .map_err(|e| CIFetchError::Config(format!("Invalid secret pattern {name:?}: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        let allow = allow
            .map(|pattern| {
                Regex::new(pattern)
                    .map_err(|e| CIFetchError::Config(format!("Invalid allow-secrets-regex: {e}")))
            })
            .transpose()?;

        Ok(Self { patterns, allow })
    }

    /// `None` when the configuration names no secrets
    pub fn from_config(config: &Config) -> Result<Option<Self>> {
        if config.secrets.is_empty() {
            return Ok(None);
        }
        let secrets = config
            .secrets
            .iter()
            .map(|(name, pattern)| (name.as_str(), pattern.as_str()));
        Self::new(secrets, config.allow_secrets_regex.as_deref()).map(Some)
    }

    fn mask<'t>(&self, line: &'t [u8]) -> (Cow<'t, [u8]>, Vec<&str>) {
        let mut current: Cow<'t, [u8]> = Cow::Borrowed(line);
        let mut found = Vec::new();

        for (name, regex) in &self.patterns {
            let replaced = match regex.replace_all(&current, |caps: &Captures<'_>| {
                let matched = &caps[0];
                if self.allow.as_ref().is_some_and(|allow| allow.is_match(matched)) {
                    matched.to_vec()
                } else {
                    let width = String::from_utf8_lossy(matched).chars().count();
                    vec![b'*'; width]
                }
            }) {
                Cow::Borrowed(_) => continue,
                Cow::Owned(replaced) => replaced,
            };
            if replaced != *current {
                found.push(name.as_str());
            }
            current = Cow::Owned(replaced);
        }

        (current, found)
    }

    /// Sanitize a file in place, replacing it atomically. Returns the number
    /// of lines changed; an untouched file is not rewritten.
    pub fn sanitize_file(&self, path: &Path) -> Result<usize> {
        info!("Sanitizing {}", path.display());
        let content = std::fs::read(path)?;

        let mut output = Vec::with_capacity(content.len());
        let mut changed = 0;
        for (lineno, line) in content.split_inclusive(|b| *b == b'\n').enumerate() {
            let (masked, found) = self.mask(line);
            for name in &found {
                warn!("Found {name} secret on line {}", lineno + 1);
            }
            if !found.is_empty() {
                changed += 1;
            }
            output.extend_from_slice(&masked);
        }

        if changed > 0 {
            let dir = match path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent,
                _ => Path::new("."),
            };
            let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
            tmp.write_all(&output)?;
            tmp.as_file().sync_all()?;
            tmp.persist(path).map_err(|e| e.error)?;
        }

        Ok(changed)
    }
}
