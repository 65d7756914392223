use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use indexmap::IndexMap;
use regex::Regex;
use serde::Deserialize;

use crate::client::RetryPolicy;
use crate::error::{CIFetchError, Result};
use crate::models::{CiKind, EventType};

pub const DEFAULT_CONFIG_FILE: &str = "cifetch.yaml";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub repo: String,
    #[serde(default)]
    pub vars: IndexMap<String, String>,
    pub ci: CiConfigs,
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    #[serde(default = "default_max_days_back", rename = "max-days-back")]
    pub max_days_back: i64,
    #[serde(default)]
    pub until: Option<DateTime<Utc>>,
    #[serde(default = "EventType::all")]
    pub types: Vec<EventType>,
    #[serde(default)]
    pub secrets: IndexMap<String, String>,
    #[serde(default, rename = "allow-secrets-regex")]
    pub allow_secrets_regex: Option<String>,
    #[serde(default)]
    pub retry: RetrySettings,
}

fn default_max_days_back() -> i64 {
    30
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CiConfigs {
    #[serde(default)]
    pub github: Option<GitHubConfig>,
    #[serde(default)]
    pub travis: Option<TravisConfig>,
    #[serde(default)]
    pub appveyor: Option<AppveyorConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GitHubConfig {
    #[serde(default)]
    pub paths: GitHubPaths,
    #[serde(default)]
    pub workflows: WorkflowSpec,
    #[serde(default = "default_github_api")]
    pub api_url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GitHubPaths {
    pub logs: Option<String>,
    pub artifacts: Option<String>,
    pub releases: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TravisConfig {
    #[serde(default)]
    pub paths: LogPaths,
    #[serde(default = "default_travis_api")]
    pub api_url: String,
    #[serde(default = "default_github_api")]
    pub github_api_url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppveyorConfig {
    #[serde(default)]
    pub paths: LogPaths,
    #[serde(rename = "accountName")]
    pub account_name: String,
    #[serde(default, rename = "projectSlug")]
    pub project_slug: Option<String>,
    #[serde(default = "default_appveyor_api")]
    pub api_url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogPaths {
    pub logs: Option<String>,
}

fn default_github_api() -> String {
    "https://api.github.com".to_string()
}

fn default_travis_api() -> String {
    "https://api.travis-ci.com".to_string()
}

fn default_appveyor_api() -> String {
    "https://ci.appveyor.com".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetrySettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_zip_retries")]
    pub zip_retries: u32,
}

fn default_max_retries() -> u32 {
    12
}

fn default_zip_retries() -> u32 {
    5
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            zip_retries: default_zip_retries(),
        }
    }
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            zip_retries: self.zip_retries,
            ..RetryPolicy::default()
        }
    }
}

/// Which workflows to fetch, matched against the workflow file's basename.
/// A name matching both an include and an exclude pattern is excluded.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "WorkflowSpecRepr")]
pub struct WorkflowSpec {
    /// `None` admits every workflow
    include: Option<Vec<Regex>>,
    exclude: Vec<Regex>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WorkflowSpecRepr {
    Names(Vec<String>),
    Patterns {
        #[serde(default)]
        regex: bool,
        #[serde(default)]
        include: Option<Vec<String>>,
        #[serde(default)]
        exclude: Vec<String>,
    },
}

impl Default for WorkflowSpec {
    fn default() -> Self {
        Self {
            include: None,
            exclude: Vec::new(),
        }
    }
}

impl TryFrom<WorkflowSpecRepr> for WorkflowSpec {
    type Error = String;

    fn try_from(repr: WorkflowSpecRepr) -> std::result::Result<Self, Self::Error> {
        let (regex, include, exclude) = match repr {
            WorkflowSpecRepr::Names(names) => (false, Some(names), Vec::new()),
            WorkflowSpecRepr::Patterns {
                regex,
                include,
                exclude,
            } => (regex, include, exclude),
        };

        let compile = |pattern: &String| {
            let source = if regex {
                pattern.clone()
            } else {
                format!("^{}$", regex::escape(pattern))
            };
            Regex::new(&source).map_err(|e| format!("invalid workflow pattern {pattern:?}: {e}"))
        };

        let include = include
            .map(|patterns| patterns.iter().map(compile).collect::<std::result::Result<_, _>>())
            .transpose()?;
        let exclude = exclude
            .iter()
            .map(compile)
            .collect::<std::result::Result<_, _>>()?;

        Ok(Self { include, exclude })
    }
}

impl WorkflowSpec {
    /// Match a workflow by its file path (only the basename is compared)
    pub fn matches(&self, workflow_path: &str) -> bool {
        let name = workflow_path.rsplit('/').next().unwrap_or(workflow_path);
        let included = self
            .include
            .as_ref()
            .map_or(true, |include| include.iter().any(|r| r.is_match(name)));
        included && !self.exclude.iter().any(|r| r.is_match(name))
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            CIFetchError::Config(format!("Cannot read configuration file {}: {e}", path.display()))
        })?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let valid_repo = self
            .repo
            .split_once('/')
            .is_some_and(|(owner, name)| !owner.is_empty() && !name.is_empty() && !name.contains('/'));
        if !valid_repo {
            return Err(CIFetchError::Config(format!(
                "Repo must be in the form 'OWNER/NAME', got {:?}",
                self.repo
            )));
        }

        if self.max_days_back < 0 {
            return Err(CIFetchError::Config("max-days-back must not be negative".to_string()));
        }

        if let (Some(since), Some(until)) = (self.since, self.until) {
            if until < since {
                return Err(CIFetchError::Config(format!(
                    "until ({until}) is earlier than since ({since})"
                )));
            }
        }

        if let Some(appveyor) = &self.ci.appveyor {
            if appveyor.account_name.trim().is_empty() {
                return Err(CIFetchError::Config("appveyor accountName is empty".to_string()));
            }
        }

        Ok(())
    }

    /// Templates configured for one provider, in a fixed order
    pub fn templates(&self, ci: CiKind) -> Vec<&str> {
        let paths: Vec<&Option<String>> = match ci {
            CiKind::GitHub => match &self.ci.github {
                Some(github) => vec![
                    &github.paths.logs,
                    &github.paths.artifacts,
                    &github.paths.releases,
                ],
                None => Vec::new(),
            },
            CiKind::Travis => self.ci.travis.iter().map(|t| &t.paths.logs).collect(),
            CiKind::Appveyor => self.ci.appveyor.iter().map(|a| &a.paths.logs).collect(),
        };
        paths.into_iter().filter_map(|p| p.as_deref()).collect()
    }

    /// Oldest point the window may reach without a newer explicit `since`
    pub fn days_back_floor(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::days(self.max_days_back)
    }
}
