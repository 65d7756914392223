use std::collections::{HashSet, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::info;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use serde::Deserialize;
use serde_json::Value;

use crate::auth::Token;
use crate::client::{secret_header, ApiClient, RetryPolicy};
use crate::config::TravisConfig;
use crate::error::{CIFetchError, Result};
use crate::models::{Asset, BuildEvent, BuildExtra, CiKind, EventType, Listed, LogSource};
use crate::normalize;
use crate::providers::github::GitHubClient;
use crate::providers::{AssetCursor, BuildQuery, Window};

#[derive(Debug, Clone, Deserialize)]
struct Build {
    id: u64,
    number: String,
    event_type: String,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    commit: CommitRef,
    branch: Option<BranchRef>,
    pull_request_number: Option<u64>,
    #[serde(default)]
    jobs: Vec<Job>,
}

#[derive(Debug, Clone, Deserialize)]
struct CommitRef {
    sha: String,
}

#[derive(Debug, Clone, Deserialize)]
struct BranchRef {
    name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct Job {
    id: u64,
    number: String,
    state: String,
}

/// Travis CI (API v3), with GitHub on the side to resolve pull-request heads
#[derive(Debug)]
pub struct Travis {
    client: ApiClient,
    github: GitHubClient,
    repo: String,
}

impl Travis {
    pub fn new(
        repo: &str,
        config: &TravisConfig,
        token: &Token,
        github_token: &Token,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("travis-api-version"),
            HeaderValue::from_static("3"),
        );
        headers.insert(
            AUTHORIZATION,
            secret_header(&format!("token {}", token.as_str()))?,
        );

        Ok(Self {
            client: ApiClient::new(&config.api_url, headers, false, retry.clone())?,
            github: GitHubClient::new(&config.github_api_url, repo, github_token, retry)?,
            repo: repo.to_string(),
        })
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    /// Builds started inside the window, newest first as Travis lists them
    async fn builds(&self, window: Window) -> Result<Vec<Build>> {
        let mut builds = Vec::new();
        let mut path = format!("/repo/{}/builds", urlencoding::encode(&self.repo));
        let mut query = vec![("include", "build.jobs")];

        loop {
            let page: Value = self.client.get_json(&path, &query).await?;
            let key = page["@type"].as_str().unwrap_or("builds").to_string();
            let items = page.get(&key).cloned().unwrap_or(Value::Array(Vec::new()));
            let items: Vec<Build> = serde_json::from_value(items)
                .map_err(|e| CIFetchError::Payload(format!("{path}: {e}")))?;

            for build in items {
                match build.started_at {
                    None => info!("Build {} not started; skipping", build.number),
                    Some(at) if window.is_exhausted_by(at) => return Ok(builds),
                    Some(_) => builds.push(build),
                }
            }

            match page["@pagination"]["next"]["@href"].as_str() {
                Some(next) => path = next.to_string(),
                None => return Ok(builds),
            }
            query.clear();
        }
    }

    pub async fn build_assets(
        &self,
        window: Window,
        query: BuildQuery,
    ) -> Result<Box<dyn AssetCursor + '_>> {
        info!("Fetching builds newer than {}", window.since);
        if let Some(until) = window.until {
            info!("Skipping builds newer than {until}");
        }

        let mut seen = HashSet::new();
        let mut builds: Vec<Build> = self
            .builds(window)
            .await?
            .into_iter()
            .filter(|build| seen.insert(build.id))
            .collect();
        builds.sort_by_key(|build| (build.started_at, build.id));

        Ok(Box::new(BuildCursor {
            travis: self,
            window,
            query,
            builds: builds.into(),
            pending: VecDeque::new(),
        }))
    }

    /// The commit that triggered a build; for pull requests this is the PR
    /// head rather than the merge commit Travis built.
    async fn trigger_commit(&self, build: &Build, event_type: EventType) -> Result<Option<String>> {
        if event_type != EventType::PullRequest {
            return Ok(Some(build.commit.sha.clone()));
        }
        let head = self.github.merge_head(&build.commit.sha).await?;
        if head.is_none() {
            info!("Could not determine PR head commit for build; setting to 'UNK'");
        }
        Ok(head)
    }
}

struct BuildCursor<'a> {
    travis: &'a Travis,
    window: Window,
    query: BuildQuery,
    builds: VecDeque<Build>,
    pending: VecDeque<Listed>,
}

impl BuildCursor<'_> {
    async fn expand(&mut self, build: Build) -> Result<()> {
        let event_type = normalize::travis_event(&build.event_type).ok_or_else(|| {
            CIFetchError::Payload(format!(
                "Build has unknown event type {:?}",
                build.event_type
            ))
        })?;
        let Some(started_at) = build.started_at else {
            return Ok(());
        };
        if self.window.is_too_new(started_at) {
            info!("Build {} is too new; skipping", build.number);
            return Ok(());
        }
        if build.finished_at.is_none() {
            info!("Build {} not completed; skipping", build.number);
            self.pending.push_back(Listed::Seen {
                at: started_at,
                complete: false,
            });
            return Ok(());
        }

        info!("Found build {}", build.number);
        self.pending.push_back(Listed::Seen {
            at: started_at,
            complete: true,
        });

        if !self.query.wants(event_type) {
            info!("Event type is {:?}; skipping", build.event_type);
            return Ok(());
        }

        let type_id = match event_type {
            EventType::Cron | EventType::Manual => started_at.format("%Y%m%dT%H%M%S").to_string(),
            EventType::Push => build
                .branch
                .as_ref()
                .map(|branch| branch.name.clone())
                .ok_or_else(|| {
                    CIFetchError::Payload(format!("Push build {} has no branch", build.number))
                })?,
            EventType::PullRequest => build
                .pull_request_number
                .map(|n| n.to_string())
                .ok_or_else(|| {
                    CIFetchError::Payload(format!(
                        "Pull request build {} has no PR number",
                        build.number
                    ))
                })?,
            EventType::Release => {
                return Err(CIFetchError::Payload(format!(
                    "Build {} cannot be a release event",
                    build.number
                )))
            }
        };
        let number: u64 = build.number.parse().map_err(|_| {
            CIFetchError::Payload(format!("Invalid build number {:?}", build.number))
        })?;
        let commit = self.travis.trigger_commit(&build, event_type).await?;

        let prefix = format!("{}.", build.number);
        for (index, job) in build.jobs.iter().enumerate() {
            let event = BuildEvent {
                ci: CiKind::Travis,
                event_type,
                type_id: type_id.clone(),
                commit: commit.clone(),
                build_commit: build.commit.sha.clone(),
                started_at,
                number,
                status: job.state.clone(),
                extra: BuildExtra::Travis {
                    job: job.number.strip_prefix(&prefix).unwrap_or(&job.number).to_string(),
                    job_index: index + 1,
                },
            };
            self.pending.push_back(Listed::Asset(Asset::Log {
                event,
                source: LogSource::Text(format!("/job/{}/log.txt", job.id)),
            }));
        }

        Ok(())
    }
}

#[async_trait]
impl AssetCursor for BuildCursor<'_> {
    async fn next(&mut self) -> Result<Option<Listed>> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                return Ok(Some(item));
            }
            match self.builds.pop_front() {
                Some(build) => self.expand(build).await?,
                None => return Ok(None),
            }
        }
    }
}
