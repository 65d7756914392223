pub mod appveyor;
pub mod github;
pub mod travis;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::auth::Tokens;
use crate::client::{ApiClient, RetryPolicy};
use crate::config::Config;
use crate::error::{CIFetchError, Result};
use crate::models::{CiKind, EventType, Listed};

use self::appveyor::Appveyor;
use self::github::GitHubActions;
use self::travis::Travis;

/// Time range of one fetch: strictly after `since`, up to and including `until`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub since: DateTime<Utc>,
    pub until: Option<DateTime<Utc>>,
}

impl Window {
    pub fn new(since: DateTime<Utc>, until: Option<DateTime<Utc>>) -> Self {
        Self { since, until }
    }

    /// Listings come newest first; anything at or before `since` ends them
    pub fn is_exhausted_by(&self, at: DateTime<Utc>) -> bool {
        at <= self.since
    }

    pub fn is_too_new(&self, at: DateTime<Utc>) -> bool {
        self.until.is_some_and(|until| at > until)
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        !self.is_exhausted_by(at) && !self.is_too_new(at)
    }
}

/// Which builds to list
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    Window(Window),
    /// Every run of one commit, regardless of time; full SHA expected
    Commit(String),
}

#[derive(Debug, Clone)]
pub struct BuildQuery {
    pub scope: Scope,
    pub types: Vec<EventType>,
    pub logs: bool,
    pub artifacts: bool,
}

impl BuildQuery {
    pub fn wants(&self, event_type: EventType) -> bool {
        self.types.contains(&event_type)
    }
}

/// A single pass over one provider listing. Each call to `next` may issue
/// further requests; a cursor cannot be rewound.
#[async_trait]
pub trait AssetCursor: Send {
    async fn next(&mut self) -> Result<Option<Listed>>;
}

/// Yields nothing; used when a provider has nothing of a kind to offer
pub struct EmptyCursor;

#[async_trait]
impl AssetCursor for EmptyCursor {
    async fn next(&mut self) -> Result<Option<Listed>> {
        Ok(None)
    }
}

/// Lookups worth remembering for the duration of one run
#[derive(Debug, Default)]
pub struct RunCache {
    pull_requests: HashMap<String, String>,
}

impl RunCache {
    pub fn pull_request(&self, commit: &str) -> Option<&str> {
        self.pull_requests.get(commit).map(String::as_str)
    }

    pub fn remember_pull_request(&mut self, commit: &str, id: &str) {
        self.pull_requests.insert(commit.to_string(), id.to_string());
    }
}

/// One configured CI provider
#[derive(Debug)]
pub enum CiSystem {
    GitHub(GitHubActions),
    Travis(Travis),
    Appveyor(Appveyor),
}

impl CiSystem {
    pub fn new(kind: CiKind, config: &Config, tokens: &Tokens, retry: &RetryPolicy) -> Result<Self> {
        let missing = || CIFetchError::Config(format!("{kind} is not configured"));
        Ok(match kind {
            CiKind::GitHub => {
                let github = config.ci.github.as_ref().ok_or_else(missing)?;
                Self::GitHub(GitHubActions::new(
                    &config.repo,
                    github,
                    tokens.require(CiKind::GitHub)?,
                    retry.clone(),
                )?)
            }
            CiKind::Travis => {
                let travis = config.ci.travis.as_ref().ok_or_else(missing)?;
                Self::Travis(Travis::new(
                    &config.repo,
                    travis,
                    tokens.require(CiKind::Travis)?,
                    tokens.require(CiKind::GitHub)?,
                    retry.clone(),
                )?)
            }
            CiKind::Appveyor => {
                let appveyor = config.ci.appveyor.as_ref().ok_or_else(missing)?;
                Self::Appveyor(Appveyor::new(
                    &config.repo,
                    appveyor,
                    tokens.require(CiKind::Appveyor)?,
                    retry.clone(),
                )?)
            }
        })
    }

    pub fn kind(&self) -> CiKind {
        match self {
            Self::GitHub(_) => CiKind::GitHub,
            Self::Travis(_) => CiKind::Travis,
            Self::Appveyor(_) => CiKind::Appveyor,
        }
    }

    /// Client that downloads this provider's assets
    pub fn client(&self) -> &ApiClient {
        match self {
            Self::GitHub(github) => github.client(),
            Self::Travis(travis) => travis.client(),
            Self::Appveyor(appveyor) => appveyor.client(),
        }
    }

    /// Resolve a short SHA or ref name to a full commit SHA
    pub async fn expand_committish(&self, committish: &str) -> Result<String> {
        match self {
            Self::GitHub(github) => github.expand_committish(committish).await,
            Self::Travis(_) | Self::Appveyor(_) => Err(CIFetchError::Config(format!(
                "Fetching by commit is not supported for {}",
                self.kind()
            ))),
        }
    }

    /// Build logs and artifacts for `query`, oldest build first
    pub async fn build_assets<'a>(
        &'a self,
        query: BuildQuery,
        cache: &'a mut RunCache,
    ) -> Result<Box<dyn AssetCursor + 'a>> {
        if !query.logs && !query.artifacts {
            return Ok(Box::new(EmptyCursor));
        }
        match (self, &query.scope) {
            (Self::GitHub(github), _) => github.build_assets(query, cache).await,
            (Self::Travis(travis), Scope::Window(window)) => {
                let window = *window;
                travis.build_assets(window, query).await
            }
            (Self::Appveyor(appveyor), Scope::Window(window)) => {
                let window = *window;
                appveyor.build_assets(window, query).await
            }
            (_, Scope::Commit(_)) => Err(CIFetchError::Config(format!(
                "Fetching by commit is not supported for {}",
                self.kind()
            ))),
        }
    }

    /// Release assets published inside `window`, oldest first
    pub async fn release_assets(&self, window: Window) -> Result<Box<dyn AssetCursor + '_>> {
        match self {
            Self::GitHub(github) => github.release_assets(window).await,
            Self::Travis(_) | Self::Appveyor(_) => Ok(Box::new(EmptyCursor)),
        }
    }
}
