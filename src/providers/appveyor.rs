use std::collections::{HashSet, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::info;
use reqwest::header::{HeaderMap, AUTHORIZATION};
use serde::Deserialize;
use serde_json::Value;

use crate::auth::Token;
use crate::client::{secret_header, ApiClient, RetryPolicy};
use crate::config::AppveyorConfig;
use crate::error::{CIFetchError, Result};
use crate::models::{Asset, BuildEvent, BuildExtra, CiKind, Listed, LogSource};
use crate::normalize;
use crate::providers::{AssetCursor, BuildQuery, Window};

const RECORDS_PER_PAGE: &str = "20";
const ENVIRONMENT_PREFIX: &str = "Environment: ";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Build {
    build_id: u64,
    build_number: u64,
    version: String,
    #[serde(default)]
    branch: String,
    commit_id: String,
    #[serde(default)]
    pull_request_id: Option<Value>,
    #[serde(default)]
    pull_request_head_commit_id: Option<String>,
    created: DateTime<Utc>,
    #[serde(default)]
    finished: Option<DateTime<Utc>>,
}

impl Build {
    /// Appveyor has sent the id both as a string and as a number
    fn pull_request(&self) -> Option<String> {
        match self.pull_request_id.as_ref()? {
            Value::String(id) if !id.is_empty() => Some(id.clone()),
            Value::Number(id) => Some(id.to_string()),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct History {
    #[serde(default)]
    builds: Vec<Build>,
}

#[derive(Debug, Deserialize)]
struct BuildDetails {
    build: BuildJobs,
}

#[derive(Debug, Deserialize)]
struct BuildJobs {
    #[serde(default)]
    jobs: Vec<Job>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Job {
    job_id: String,
    #[serde(default)]
    name: String,
    status: String,
}

impl Job {
    /// Matrix jobs are named after the environment variables that define them
    fn environment(&self) -> Option<String> {
        self.name
            .strip_prefix(ENVIRONMENT_PREFIX)
            .map(|env| env.trim().to_string())
            .filter(|env| !env.is_empty())
    }
}

#[derive(Debug)]
pub struct Appveyor {
    client: ApiClient,
    project_path: String,
}

impl Appveyor {
    pub fn new(repo: &str, config: &AppveyorConfig, token: &Token, retry: RetryPolicy) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            secret_header(&format!("Bearer {}", token.as_str()))?,
        );

        let slug = match &config.project_slug {
            Some(slug) => slug.as_str(),
            None => repo.split_once('/').map_or(repo, |(_, name)| name),
        };

        Ok(Self {
            client: ApiClient::new(&config.api_url, headers, false, retry)?,
            project_path: format!(
                "/api/projects/{}/{}",
                urlencoding::encode(&config.account_name),
                urlencoding::encode(slug)
            ),
        })
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    /// Builds created inside the window, walking history newest first
    async fn builds(&self, window: Window) -> Result<Vec<Build>> {
        let path = format!("{}/history", self.project_path);
        let mut builds = Vec::new();
        let mut start: Option<String> = None;

        loop {
            let mut query = vec![("recordsNumber", RECORDS_PER_PAGE)];
            if let Some(start) = &start {
                query.push(("startBuildId", start.as_str()));
            }
            let history: History = self.client.get_json(&path, &query).await?;

            let Some(last) = history.builds.last() else {
                return Ok(builds);
            };
            let next_start = last.build_id.to_string();

            for build in history.builds {
                if window.is_exhausted_by(build.created) {
                    return Ok(builds);
                }
                builds.push(build);
            }
            start = Some(next_start);
        }
    }

    async fn jobs(&self, build: &Build) -> Result<Vec<Job>> {
        let details: BuildDetails = self
            .client
            .get_json(
                &format!(
                    "{}/build/{}",
                    self.project_path,
                    urlencoding::encode(&build.version)
                ),
                &[],
            )
            .await?;
        Ok(details.build.jobs)
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
            .filter(|build| seen.insert(build.build_id))
            .collect();
        builds.sort_by_key(|build| (build.created, build.build_id));

        Ok(Box::new(BuildCursor {
            appveyor: self,
            window,
            query,
            builds: builds.into(),
            pending: VecDeque::new(),
        }))
    }
}

struct BuildCursor<'a> {
    appveyor: &'a Appveyor,
    window: Window,
    query: BuildQuery,
    builds: VecDeque<Build>,
    pending: VecDeque<Listed>,
}

impl BuildCursor<'_> {
    async fn expand(&mut self, build: Build) -> Result<()> {
        if self.window.is_too_new(build.created) {
            info!("Build {} is too new; skipping", build.build_number);
            return Ok(());
        }
        if build.finished.is_none() {
            info!("Build {} not completed; skipping", build.build_number);
            self.pending.push_back(Listed::Seen {
                at: build.created,
                complete: false,
            });
            return Ok(());
        }

        info!("Found build {}", build.build_number);
        self.pending.push_back(Listed::Seen {
            at: build.created,
            complete: true,
        });

        let pull_request = build.pull_request();
        let event_type = normalize::appveyor_event(pull_request.as_deref());
        if !self.query.wants(event_type) {
            info!("Event type is {:?}; skipping", event_type.as_str());
            return Ok(());
        }

        let (type_id, commit) = match pull_request {
            Some(id) => {
                let head = build.pull_request_head_commit_id.clone().ok_or_else(|| {
                    CIFetchError::Payload(format!(
                        "Pull request build {} has no head commit",
                        build.build_number
                    ))
                })?;
                (id, head)
            }
            None => (build.branch.clone(), build.commit_id.clone()),
        };

        for (index, job) in self.appveyor.jobs(&build).await?.into_iter().enumerate() {
            let event = BuildEvent {
                ci: CiKind::Appveyor,
                event_type,
                type_id: type_id.clone(),
                commit: Some(commit.clone()),
                build_commit: build.commit_id.clone(),
                started_at: build.created,
                number: build.build_number,
                status: job.status.clone(),
                extra: BuildExtra::Appveyor {
                    job_env: job.environment(),
                    job: job.job_id.clone(),
                    job_index: index + 1,
                },
            };
            self.pending.push_back(Listed::Asset(Asset::Log {
                event,
                source: LogSource::Text(format!(
                    "/api/buildjobs/{}/log",
                    urlencoding::encode(&job.job_id)
                )),
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

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use mockito::{Matcher, Server, ServerGuard};

    use super::*;
    use crate::models::EventType;
    use crate::providers::Scope;

    fn appveyor(server: &ServerGuard, slug: Option<&str>) -> Appveyor {
        let mut yaml = format!("api_url: {}\naccountName: con\n", server.url());
        if let Some(slug) = slug {
            yaml.push_str(&format!("projectSlug: {slug}\n"));
        }
        let config: AppveyorConfig = serde_yaml::from_str(&yaml).unwrap();
        Appveyor::new(
            "con/tinuous",
            &config,
            &Token::from("av_test"),
            RetryPolicy::without_delays(0),
        )
        .unwrap()
    }

    fn window() -> Window {
        Window::new(Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap(), None)
    }

    fn query() -> BuildQuery {
        BuildQuery {
            scope: Scope::Window(window()),
            types: EventType::all(),
            logs: true,
            artifacts: false,
        }
    }

    fn build_json(id: u64, created: &str, finished: bool, pr: &str) -> String {
        let finished = if finished {
            format!("\"{created}\"")
        } else {
            "null".to_string()
        };
        format!(
            r#"{{"buildId": {id}, "buildNumber": {id}, "version": "1.0.{id}", "branch": "feature/x y",
                "commitId": "c{id}", "pullRequestId": {pr}, "pullRequestHeadCommitId": "h{id}",
                "created": "{created}", "finished": {finished}, "status": "success"}}"#
        )
    }

    async fn drain(cursor: &mut Box<dyn AssetCursor + '_>) -> Vec<Listed> {
        let mut items = Vec::new();
        while let Some(item) = cursor.next().await.unwrap() {
            items.push(item);
        }
        items
    }

    #[tokio::test]
    async fn test_history_paging_and_jobs() {
        let mut server = Server::new_async().await;
        let first = server
            .mock("GET", "/api/projects/con/tinuous/history")
            .match_query(Matcher::Exact("recordsNumber=20".into()))
            .match_header("authorization", "Bearer av_test")
            .with_body(format!(
                r#"{{"builds": [{}, {}]}}"#,
                build_json(31, "2021-01-05T10:00:00.1234567+00:00", false, "null"),
                build_json(30, "2021-01-04T10:00:00+00:00", true, "\"17\""),
            ))
            .create_async()
            .await;
        let second = server
            .mock("GET", "/api/projects/con/tinuous/history")
            .match_query(Matcher::UrlEncoded("startBuildId".into(), "30".into()))
            .with_body(format!(
                r#"{{"builds": [{}, {}]}}"#,
                build_json(29, "2021-01-03T10:00:00+00:00", true, "null"),
                build_json(28, "2020-12-30T10:00:00+00:00", true, "null"),
            ))
            .create_async()
            .await;
        let mut _mocks = Vec::new();
        for id in [29, 30] {
            _mocks.push(
                server
                    .mock("GET", format!("/api/projects/con/tinuous/build/1.0.{id}").as_str())
                    .with_body(format!(
                        r#"{{"build": {{"jobs": [
                            {{"jobId": "job{id}a", "name": "Environment: PY=3.9, TOX=py39", "status": "success"}},
                            {{"jobId": "job{id}b", "name": "", "status": "failed"}}]}}}}"#
                    ))
                    .create_async()
                    .await,
            );
        }

        let appveyor = appveyor(&server, None);
        let mut cursor = appveyor.build_assets(window(), query()).await.unwrap();
        let items = drain(&mut cursor).await;

        first.assert_async().await;
        second.assert_async().await;

        // 29: seen + 2 jobs, 30: seen + 2 jobs, 31: incomplete
        assert_eq!(items.len(), 7);

        let Listed::Asset(Asset::Log { event, source }) = &items[1] else {
            panic!("expected log");
        };
        assert_eq!(event.event_type, EventType::Push);
        assert_eq!(event.type_id, "feature/x y");
        assert_eq!(event.commit.as_deref(), Some("c29"));
        assert_eq!(
            event.extra,
            BuildExtra::Appveyor {
                job: "job29a".to_string(),
                job_index: 1,
                job_env: Some("PY=3.9, TOX=py39".to_string()),
            }
        );
        assert_eq!(*source, LogSource::Text("/api/buildjobs/job29a/log".to_string()));

        let Listed::Asset(Asset::Log { event, .. }) = &items[5] else {
            panic!("expected log");
        };
        assert_eq!(event.event_type, EventType::PullRequest);
        assert_eq!(event.type_id, "17");
        assert_eq!(event.commit.as_deref(), Some("h30"));
        assert_eq!(event.build_commit, "c30");
        assert_eq!(event.status, "failed");

        assert!(matches!(items[6], Listed::Seen { complete: false, .. }));
    }

    #[tokio::test]
    async fn test_project_slug_override() {
        let mut server = Server::new_async().await;
        let history = server
            .mock("GET", "/api/projects/con/other-name/history")
            .match_query(Matcher::Any)
            .with_body(r#"{"builds": []}"#)
            .create_async()
            .await;

        let appveyor = appveyor(&server, Some("other-name"));
        let mut cursor = appveyor.build_assets(window(), query()).await.unwrap();

        history.assert_async().await;
        assert!(cursor.next().await.unwrap().is_none());
    }

    #[test]
    fn test_job_environment() {
        let job = |name: &str| Job {
            job_id: "j".to_string(),
            name: name.to_string(),
            status: "success".to_string(),
        };

        assert_eq!(job("Environment: A=1").environment().as_deref(), Some("A=1"));
        assert_eq!(job("Image: Ubuntu").environment(), None);
        assert_eq!(job("Environment: ").environment(), None);
    }
}
