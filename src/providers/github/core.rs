use std::collections::{HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use log::{debug, info};

use super::client::{GitHubClient, Release, Workflow, WorkflowRun};
use crate::auth::Token;
use crate::client::{ApiClient, RetryPolicy};
use crate::config::{GitHubConfig, WorkflowSpec};
use crate::error::{CIFetchError, Result};
use crate::models::{
    Asset, BuildEvent, BuildExtra, CiKind, EventType, Listed, LogSource, ReleaseEvent, UNKNOWN,
};
use crate::normalize;
use crate::providers::{AssetCursor, BuildQuery, RunCache, Scope, Window};

#[derive(Debug)]
pub struct GitHubActions {
    client: GitHubClient,
    workflows: WorkflowSpec,
}

impl GitHubActions {
    pub fn new(repo: &str, config: &GitHubConfig, token: &Token, retry: RetryPolicy) -> Result<Self> {
        Ok(Self {
            client: GitHubClient::new(&config.api_url, repo, token, retry)?,
            workflows: config.workflows.clone(),
        })
    }

    pub fn client(&self) -> &ApiClient {
        self.client.api()
    }

    pub async fn expand_committish(&self, committish: &str) -> Result<String> {
        if committish.len() == 40 && committish.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Ok(committish.to_string());
        }
        let sha = self.client.expand_committish(committish).await?;
        info!("Expanded committish {committish:?} to full sha {sha}");
        Ok(sha)
    }

    /// Workflows picked by the include/exclude config, keyed by id
    async fn selected_workflows(&self) -> Result<HashMap<u64, Workflow>> {
        let mut selected = HashMap::new();
        for workflow in self.client.workflows().await? {
            if self.workflows.matches(&workflow.path) {
                debug!("Selected workflow {} ({})", workflow.path, workflow.name);
                selected.insert(workflow.id, workflow);
            } else {
                debug!("Workflow {} not selected; skipping", workflow.path);
            }
        }
        Ok(selected)
    }

    pub async fn build_assets<'a>(
        &'a self,
        query: BuildQuery,
        cache: &'a mut RunCache,
    ) -> Result<Box<dyn AssetCursor + 'a>> {
        let workflows = self.selected_workflows().await?;

        let runs = match &query.scope {
            Scope::Window(window) => {
                info!("Fetching runs newer than {}", window.since);
                if let Some(until) = window.until {
                    info!("Skipping runs newer than {until}");
                }
                self.client.runs_since(window.since).await?
            }
            Scope::Commit(sha) => {
                info!("Fetching runs for commit {sha}");
                self.client.runs_for_head(sha).await?
            }
        };

        let mut seen = HashSet::new();
        let mut runs: Vec<WorkflowRun> = runs
            .into_iter()
            .filter(|run| workflows.contains_key(&run.workflow_id))
            .filter(|run| seen.insert(run.id))
            .collect();
        runs.sort_by_key(|run| (run.created_at, run.id));

        Ok(Box::new(RunCursor {
            client: &self.client,
            workflows,
            runs: runs.into(),
            query,
            cache,
            pending: VecDeque::new(),
        }))
    }

    pub async fn release_assets(&self, window: Window) -> Result<Box<dyn AssetCursor + '_>> {
        info!("Fetching releases newer than {}", window.since);

        let mut releases: Vec<Release> = Vec::new();
        for release in self.client.releases().await? {
            if release.draft {
                info!("Release {} is draft; skipping", release.tag_name);
                continue;
            }
            if release.prerelease {
                info!("Release {} is prerelease; skipping", release.tag_name);
                continue;
            }
            match release.published_at {
                Some(at) if window.contains(at) => releases.push(release),
                Some(_) => {}
                None => {
                    return Err(CIFetchError::Payload(format!(
                        "Release {} has no publication time",
                        release.tag_name
                    )))
                }
            }
        }
        releases.sort_by(|a, b| a.published_at.cmp(&b.published_at));

        Ok(Box::new(ReleaseCursor {
            client: &self.client,
            releases: releases.into(),
            pending: VecDeque::new(),
        }))
    }
}

struct RunCursor<'a> {
    client: &'a GitHubClient,
    workflows: HashMap<u64, Workflow>,
    runs: VecDeque<WorkflowRun>,
    query: BuildQuery,
    cache: &'a mut RunCache,
    pending: VecDeque<Listed>,
}

impl RunCursor<'_> {
    async fn expand(&mut self, run: WorkflowRun) -> Result<()> {
        let window = match &self.query.scope {
            Scope::Window(window) => Some(*window),
            Scope::Commit(_) => None,
        };

        if window.is_some_and(|w| w.is_too_new(run.created_at)) {
            info!("Run {} is too new; skipping", run.run_number);
            return Ok(());
        }
        if !run.is_completed() {
            info!("Run {} not completed; skipping", run.run_number);
            if window.is_some() {
                self.pending.push_back(Listed::Seen {
                    at: run.created_at,
                    complete: false,
                });
            }
            return Ok(());
        }

        info!("Found run {}", run.run_number);
        if window.is_some() {
            self.pending.push_back(Listed::Seen {
                at: run.created_at,
                complete: true,
            });
        }

        let event_type = match normalize::github_event(&run.event) {
            Some(event_type) if self.query.wants(event_type) => event_type,
            _ => {
                info!("Event type is {:?}; skipping", run.event);
                return Ok(());
            }
        };

        let type_id = self.type_id(&run, event_type).await?;
        let workflow = self.workflows.get(&run.workflow_id).ok_or_else(|| {
            CIFetchError::Payload(format!("Run {} has unknown workflow", run.id))
        })?;
        let event = BuildEvent {
            ci: CiKind::GitHub,
            event_type,
            type_id,
            commit: Some(run.head_sha.clone()),
            build_commit: run.head_sha.clone(),
            started_at: run.created_at,
            number: run.run_number,
            status: run.conclusion.clone().unwrap_or_else(|| UNKNOWN.to_string()),
            extra: BuildExtra::GitHub {
                workflow_name: workflow.name.clone(),
                workflow_file: workflow.file_name().to_string(),
                run_id: run.id,
            },
        };

        if self.query.logs {
            self.pending.push_back(Listed::Asset(Asset::Log {
                event: event.clone(),
                source: LogSource::Archive(run.logs_url.clone()),
            }));
        }
        if self.query.artifacts {
            for artifact in self.client.artifacts(&run).await? {
                self.pending.push_back(Listed::Asset(Asset::Artifact {
                    event: event.clone(),
                    name: artifact.name,
                    download_url: artifact.archive_download_url,
                }));
            }
        }

        Ok(())
    }

    async fn type_id(&mut self, run: &WorkflowRun, event_type: EventType) -> Result<String> {
        match event_type {
            EventType::Cron | EventType::Manual => {
                Ok(run.created_at.format("%Y%m%dT%H%M%S").to_string())
            }
            EventType::Push => run.head_branch.clone().ok_or_else(|| {
                CIFetchError::Payload(format!("Push run {} has no head branch", run.id))
            }),
            EventType::PullRequest => match run.pull_requests.first() {
                Some(pr) => Ok(pr.number.to_string()),
                None => self.client.pull_request_for(&run.head_sha, self.cache).await,
            },
            EventType::Release => Err(CIFetchError::Payload(format!(
                "Run {} cannot be a release event",
                run.id
            ))),
        }
    }
}

#[async_trait]
impl AssetCursor for RunCursor<'_> {
    async fn next(&mut self) -> Result<Option<Listed>> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                return Ok(Some(item));
            }
            match self.runs.pop_front() {
                Some(run) => self.expand(run).await?,
                None => return Ok(None),
            }
        }
    }
}

struct ReleaseCursor<'a> {
    client: &'a GitHubClient,
    releases: VecDeque<Release>,
    pending: VecDeque<Listed>,
}

#[async_trait]
impl AssetCursor for ReleaseCursor<'_> {
    async fn next(&mut self) -> Result<Option<Listed>> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                return Ok(Some(item));
            }
            let Some(release) = self.releases.pop_front() else {
                return Ok(None);
            };
            let Some(published_at) = release.published_at else {
                continue;
            };

            info!("Found release {}", release.tag_name);
            self.pending.push_back(Listed::Seen {
                at: published_at,
                complete: true,
            });

            let commit = self.client.tag_commit(&release.tag_name).await?;
            let event = ReleaseEvent {
                release_tag: release.tag_name,
                commit,
                published_at,
            };
            for asset in release.assets {
                self.pending.push_back(Listed::Asset(Asset::Release {
                    event: event.clone(),
                    name: asset.name,
                    download_url: asset.browser_download_url,
                }));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeZone, Utc};
    use mockito::{Matcher, Server, ServerGuard};

    use super::*;

    fn since() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 6, 1, 0, 0, 0).unwrap()
    }

    fn github(server: &ServerGuard, workflows: &str) -> GitHubActions {
        let yaml = format!("api_url: {}\nworkflows: {workflows}\n", server.url());
        let config: GitHubConfig = serde_yaml::from_str(&yaml).unwrap();
        GitHubActions::new(
            "con/tinuous",
            &config,
            &Token::from("ghp_test"),
            RetryPolicy::without_delays(0),
        )
        .unwrap()
    }

    fn run_json(server: &ServerGuard, id: u64, workflow_id: u64, created: &str, event: &str, status: &str) -> String {
        format!(
            r#"{{"id": {id}, "head_branch": "main", "head_sha": "sha{id}", "run_number": {id},
                "event": "{event}", "status": "{status}", "conclusion": "success",
                "workflow_id": {workflow_id}, "pull_requests": [], "created_at": "{created}",
                "logs_url": "{url}/runs/{id}/logs", "artifacts_url": "{url}/runs/{id}/artifacts"}}"#,
            url = server.url()
        )
    }

    async fn mock_workflows(server: &mut ServerGuard) {
        let _mock = server
            .mock("GET", "/repos/con/tinuous/actions/workflows")
            .match_query(Matcher::Any)
            .with_body(
                r#"{"total_count": 2, "workflows": [
                    {"id": 1, "name": "Test", "path": ".github/workflows/test.yml"},
                    {"id": 2, "name": "Docs", "path": ".github/workflows/docs.yml"}]}"#,
            )
            .create_async()
            .await;
    }

    async fn drain(cursor: &mut Box<dyn AssetCursor + '_>) -> Vec<Listed> {
        let mut items = Vec::new();
        while let Some(item) = cursor.next().await.unwrap() {
            items.push(item);
        }
        items
    }

    fn window_query(until: Option<DateTime<Utc>>) -> BuildQuery {
        BuildQuery {
            scope: Scope::Window(Window::new(since(), until)),
            types: EventType::all(),
            logs: true,
            artifacts: true,
        }
    }

    #[tokio::test]
    async fn test_runs_in_window_oldest_first() {
        let mut server = Server::new_async().await;
        mock_workflows(&mut server).await;

        let runs = [
            run_json(&server, 13, 1, "2021-06-04T00:00:00Z", "push", "in_progress"),
            run_json(&server, 12, 1, "2021-06-03T00:00:00Z", "schedule", "completed"),
            run_json(&server, 11, 2, "2021-06-02T12:00:00Z", "push", "completed"),
            run_json(&server, 10, 1, "2021-06-02T00:00:00Z", "push", "completed"),
            run_json(&server, 9, 1, "2021-05-31T00:00:00Z", "push", "completed"),
        ];
        let _mock = server
            .mock("GET", "/repos/con/tinuous/actions/runs")
            .match_query(Matcher::Any)
            .with_body(format!(r#"{{"total_count": 5, "workflow_runs": [{}]}}"#, runs.join(",")))
            .create_async()
            .await;
        let mut _mocks = Vec::new();
        for id in [10, 12] {
            _mocks.push(
                server
                    .mock("GET", format!("/runs/{id}/artifacts").as_str())
                    .match_query(Matcher::Any)
                    .with_body(format!(
                        r#"{{"total_count": 2, "artifacts": [
                            {{"name": "wheel", "archive_download_url": "{0}/a/{id}", "expired": false}},
                            {{"name": "old", "archive_download_url": "{0}/b/{id}", "expired": true}}]}}"#,
                        server.url()
                    ))
                    .create_async()
                    .await,
            );
        }

        let github = github(&server, "[test.yml]");
        let mut cache = RunCache::default();
        let mut cursor = github.build_assets(window_query(None), &mut cache).await.unwrap();
        let items = drain(&mut cursor).await;

        let kinds: Vec<String> = items
            .iter()
            .map(|item| match item {
                Listed::Seen { complete, .. } => format!("seen:{complete}"),
                Listed::Asset(Asset::Log { event, .. }) => format!("log:{}", event.number),
                Listed::Asset(Asset::Artifact { event, name, .. }) => {
                    format!("artifact:{}:{name}", event.number)
                }
                Listed::Asset(Asset::Release { .. }) => "release".to_string(),
            })
            .collect();
        assert_eq!(
            kinds,
            [
                "seen:true",
                "log:10",
                "artifact:10:wheel",
                "seen:true",
                "log:12",
                "artifact:12:wheel",
                "seen:false",
            ]
        );

        let Listed::Asset(Asset::Log { event, source }) = &items[4] else {
            panic!("expected log");
        };
        assert_eq!(event.event_type, EventType::Cron);
        assert_eq!(event.type_id, "20210603T000000");
        assert_eq!(
            *source,
            LogSource::Archive(format!("{}/runs/12/logs", server.url()))
        );
        assert_eq!(
            event.extra,
            BuildExtra::GitHub {
                workflow_name: "Test".to_string(),
                workflow_file: "test.yml".to_string(),
                run_id: 12,
            }
        );
    }

    #[tokio::test]
    async fn test_type_filter_and_until() {
        let mut server = Server::new_async().await;
        mock_workflows(&mut server).await;

        let runs = [
            run_json(&server, 3, 1, "2021-06-09T00:00:00Z", "push", "completed"),
            run_json(&server, 2, 1, "2021-06-03T00:00:00Z", "workflow_run", "completed"),
            run_json(&server, 1, 1, "2021-06-02T00:00:00Z", "schedule", "completed"),
        ];
        let _mock = server
            .mock("GET", "/repos/con/tinuous/actions/runs")
            .match_query(Matcher::Any)
            .with_body(format!(r#"[{}]"#, runs.join(",")))
            .create_async()
            .await;

        let github = github(&server, "[test.yml]");
        let mut query = window_query(Some(Utc.with_ymd_and_hms(2021, 6, 5, 0, 0, 0).unwrap()));
        query.types = vec![EventType::Push];
        query.artifacts = false;

        let mut cache = RunCache::default();
        let mut cursor = github.build_assets(query, &mut cache).await.unwrap();
        let items = drain(&mut cursor).await;

        // both in-window runs count towards coverage; neither is wanted
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|i| matches!(i, Listed::Seen { complete: true, .. })));
    }

    #[tokio::test]
    async fn test_pull_request_run_uses_lookup() {
        let mut server = Server::new_async().await;
        mock_workflows(&mut server).await;

        let runs = [
            run_json(&server, 5, 1, "2021-06-02T00:00:00Z", "pull_request", "completed"),
            run_json(&server, 6, 1, "2021-06-02T01:00:00Z", "pull_request", "completed")
                .replace("sha6", "sha5"),
        ];
        let _mock = server
            .mock("GET", "/repos/con/tinuous/actions/runs")
            .match_query(Matcher::Any)
            .with_body(format!(r#"[{}]"#, runs.join(",")))
            .create_async()
            .await;
        let pulls = server
            .mock("GET", "/repos/con/tinuous/commits/sha5/pulls")
            .with_body(r#"[{"number": 99}]"#)
            .expect(1)
            .create_async()
            .await;

        let github = github(&server, "[test.yml]");
        let mut query = window_query(None);
        query.artifacts = false;
        let mut cache = RunCache::default();
        let mut cursor = github.build_assets(query, &mut cache).await.unwrap();
        let items = drain(&mut cursor).await;

        let type_ids: Vec<&str> = items
            .iter()
            .filter_map(|item| match item {
                Listed::Asset(Asset::Log { event, .. }) => Some(event.type_id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(type_ids, ["99", "99"]);
        pulls.assert_async().await;
    }

    #[tokio::test]
    async fn test_commit_scope_skips_incomplete_without_coverage() {
        let mut server = Server::new_async().await;
        mock_workflows(&mut server).await;

        let runs = [
            run_json(&server, 7, 1, "2020-01-01T00:00:00Z", "push", "completed"),
            run_json(&server, 8, 1, "2020-01-02T00:00:00Z", "push", "queued"),
        ];
        let _mock = server
            .mock("GET", "/repos/con/tinuous/actions/runs")
            .match_query(Matcher::UrlEncoded("head_sha".into(), "sha7".into()))
            .with_body(format!(r#"[{}]"#, runs.join(",")))
            .create_async()
            .await;

        let github = github(&server, "[test.yml]");
        let query = BuildQuery {
            scope: Scope::Commit("sha7".to_string()),
            types: EventType::all(),
            logs: true,
            artifacts: false,
        };
        let mut cache = RunCache::default();
        let mut cursor = github.build_assets(query, &mut cache).await.unwrap();
        let items = drain(&mut cursor).await;

        assert_eq!(items.len(), 1);
        assert!(matches!(&items[0], Listed::Asset(Asset::Log { event, .. }) if event.number == 7));
    }

    #[tokio::test]
    async fn test_releases() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/repos/con/tinuous/releases")
            .match_query(Matcher::Any)
            .with_body(
                r#"[
                {"tag_name": "v2", "draft": false, "prerelease": false, "published_at": "2021-06-05T00:00:00Z",
                 "assets": [{"name": "v2.tar.gz", "browser_download_url": "https://example.com/v2.tar.gz"}]},
                {"tag_name": "v2rc1", "draft": false, "prerelease": true, "published_at": "2021-06-04T00:00:00Z", "assets": []},
                {"tag_name": "wip", "draft": true, "prerelease": false, "published_at": null, "assets": []},
                {"tag_name": "v1", "draft": false, "prerelease": false, "published_at": "2021-05-01T00:00:00Z", "assets": []}
            ]"#,
            )
            .create_async()
            .await;
        let _mock = server
            .mock("GET", "/repos/con/tinuous/git/refs/tags/v2")
            .with_body(r#"{"object": {"type": "commit", "sha": "abc", "url": "x"}}"#)
            .create_async()
            .await;

        let github = github(&server, "[test.yml]");
        let mut cursor = github
            .release_assets(Window::new(since(), None))
            .await
            .unwrap();
        let items = drain(&mut cursor).await;

        assert_eq!(items.len(), 2);
        let Listed::Asset(Asset::Release { event, name, .. }) = &items[1] else {
            panic!("expected release asset");
        };
        assert_eq!(name, "v2.tar.gz");
        assert_eq!(event.release_tag, "v2");
        assert_eq!(event.commit, "abc");
    }

    #[tokio::test]
    async fn test_full_sha_is_not_expanded() {
        let server = Server::new_async().await;
        let github = github(&server, "[test.yml]");
        let sha = "0123456789abcdef0123456789abcdef01234567";

        assert_eq!(github.expand_committish(sha).await.unwrap(), sha);
    }
}
