use chrono::{DateTime, Utc};
use log::{debug, info};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, LINK};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::auth::Token;
use crate::client::{secret_header, ApiClient, RetryPolicy};
use crate::error::{CIFetchError, Result};
use crate::models::UNKNOWN;
use crate::providers::RunCache;

const PER_PAGE: &str = "100";

#[derive(Debug, Clone, Deserialize)]
pub struct Workflow {
    pub id: u64,
    pub name: String,
    pub path: String,
}

impl Workflow {
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullRequestRef {
    pub number: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowRun {
    pub id: u64,
    pub head_branch: Option<String>,
    pub head_sha: String,
    pub run_number: u64,
    pub event: String,
    pub status: Option<String>,
    pub conclusion: Option<String>,
    pub workflow_id: u64,
    #[serde(default)]
    pub pull_requests: Vec<PullRequestRef>,
    pub created_at: DateTime<Utc>,
    pub logs_url: String,
    pub artifacts_url: String,
}

impl WorkflowRun {
    pub fn is_completed(&self) -> bool {
        self.status.as_deref() == Some("completed")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArtifactItem {
    pub name: String,
    pub archive_download_url: String,
    #[serde(default)]
    pub expired: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseAssetItem {
    pub name: String,
    pub browser_download_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Release {
    pub tag_name: String,
    pub draft: bool,
    pub prerelease: bool,
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub assets: Vec<ReleaseAssetItem>,
}

#[derive(Debug, Deserialize)]
struct GitRef {
    object: GitObject,
}

#[derive(Debug, Deserialize)]
struct GitObject {
    #[serde(rename = "type")]
    kind: String,
    sha: String,
    url: String,
}

#[derive(Debug, Deserialize)]
struct SearchResults {
    items: Vec<PullRequestRef>,
}

#[derive(Debug, Deserialize)]
struct CommitParents {
    parents: Vec<CommitRef>,
}

#[derive(Debug, Deserialize)]
struct CommitRef {
    sha: String,
}

/// GitHub REST API access scoped to one repository
#[derive(Debug, Clone)]
pub struct GitHubClient {
    api: ApiClient,
    repo: String,
}

impl GitHubClient {
    pub fn new(api_url: &str, repo: &str, token: &Token, retry: RetryPolicy) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
        headers.insert(
            AUTHORIZATION,
            secret_header(&format!("Bearer {}", token.as_str()))?,
        );
        headers.insert(
            HeaderName::from_static("x-github-api-version"),
            HeaderValue::from_static("2022-11-28"),
        );

        Ok(Self {
            api: ApiClient::new(api_url, headers, true, retry)?,
            repo: repo.to_string(),
        })
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    /// Fetch one page of a listing and the URL of the page after it.
    ///
    /// List endpoints return either a bare array or an object whose only
    /// key besides `total_count` holds the array.
    pub async fn page<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<(Vec<T>, Option<String>)> {
        let response = self.api.get_with(path, query, None).await?;
        let next = next_link(response.headers());
        let url = response.url().to_string();
        let body = response.text().await?;

        let data: Value = serde_json::from_str(&body)
            .map_err(|e| CIFetchError::Payload(format!("{url}: {e}")))?;
        let items = match data {
            Value::Array(items) => items,
            Value::Object(mut map) => {
                map.remove("total_count");
                let mut values = map.into_iter().map(|(_, v)| v);
                match (values.next(), values.next()) {
                    (Some(Value::Array(items)), None) => items,
                    _ => {
                        return Err(CIFetchError::Payload(format!(
                            "Unique non-count key not found in {url} response"
                        )))
                    }
                }
            }
            other => {
                return Err(CIFetchError::Payload(format!(
                    "Unexpected listing from {url}: {other}"
                )))
            }
        };

        let items = items
            .into_iter()
            .map(serde_json::from_value)
            .collect::<std::result::Result<Vec<T>, _>>()
            .map_err(|e| CIFetchError::Payload(format!("{url}: {e}")))?;
        Ok((items, next))
    }

    /// Collect every page of a listing
    pub async fn paginate<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Vec<T>> {
        let mut all = Vec::new();
        let mut query = with_per_page(query);
        let mut next = Some(path.to_string());

        while let Some(url) = next {
            let (items, following) = self.page(&url, &query).await?;
            all.extend(items);
            next = following;
            // Link URLs already carry the query string
            query.clear();
        }

        Ok(all)
    }

    pub async fn workflows(&self) -> Result<Vec<Workflow>> {
        self.paginate(&format!("/repos/{}/actions/workflows", self.repo), &[])
            .await
    }

    /// Runs created after `since`, newest first. Stops paging as soon as a
    /// page reaches back to `since`.
    pub async fn runs_since(&self, since: DateTime<Utc>) -> Result<Vec<WorkflowRun>> {
        let mut runs = Vec::new();
        let mut query = with_per_page(&[]);
        let mut next = Some(format!("/repos/{}/actions/runs", self.repo));

        while let Some(url) = next {
            let (page, following) = self.page::<WorkflowRun>(&url, &query).await?;
            let exhausted = page.iter().any(|run| run.created_at <= since);
            runs.extend(page.into_iter().filter(|run| run.created_at > since));
            next = if exhausted { None } else { following };
            query.clear();
        }

        debug!("Listed {} runs newer than {since}", runs.len());
        Ok(runs)
    }

    pub async fn runs_for_head(&self, head_sha: &str) -> Result<Vec<WorkflowRun>> {
        self.paginate(
            &format!("/repos/{}/actions/runs", self.repo),
            &[("head_sha", head_sha)],
        )
        .await
    }

    /// Non-expired artifacts of a run
    pub async fn artifacts(&self, run: &WorkflowRun) -> Result<Vec<ArtifactItem>> {
        let artifacts: Vec<ArtifactItem> = self.paginate(&run.artifacts_url, &[]).await?;
        Ok(artifacts.into_iter().filter(|a| !a.expired).collect())
    }

    pub async fn releases(&self) -> Result<Vec<Release>> {
        self.paginate(&format!("/repos/{}/releases", self.repo), &[])
            .await
    }

    /// Pull request number for a commit, or `UNK` if none can be found
    pub async fn pull_request_for(&self, sha: &str, cache: &mut RunCache) -> Result<String> {
        if let Some(pr) = cache.pull_request(sha) {
            return Ok(pr.to_string());
        }

        let pulls: Vec<PullRequestRef> = self
            .api
            .get_json(&format!("/repos/{}/commits/{sha}/pulls", self.repo), &[])
            .await?;

        let pr = match pulls.first() {
            Some(pr) => pr.number.to_string(),
            // The commit endpoint ignores PRs from forks
            None => {
                let q = format!("repo:{} is:pr {sha}", self.repo);
                let hits: SearchResults = self
                    .api
                    .get_json(
                        "/search/issues",
                        &[("q", q.as_str()), ("sort", "created"), ("order", "asc")],
                    )
                    .await?;
                match hits.items.first() {
                    Some(pr) => pr.number.to_string(),
                    None => {
                        info!("Could not find pull request for commit {sha}; setting to {UNKNOWN:?}");
                        UNKNOWN.to_string()
                    }
                }
            }
        };

        cache.remember_pull_request(sha, &pr);
        Ok(pr)
    }

    /// Commit a tag points at, following annotated tag objects
    pub async fn tag_commit(&self, tag: &str) -> Result<String> {
        let git_ref: GitRef = self
            .api
            .get_json(
                &format!(
                    "/repos/{}/git/refs/tags/{}",
                    self.repo,
                    urlencoding::encode(tag)
                ),
                &[],
            )
            .await?;

        match git_ref.object.kind.as_str() {
            "commit" => Ok(git_ref.object.sha),
            "tag" => {
                let tag_object: GitRef = self.api.get_json(&git_ref.object.url, &[]).await?;
                Ok(tag_object.object.sha)
            }
            other => Err(CIFetchError::Payload(format!(
                "Unexpected type for tag {tag}: {other:?}"
            ))),
        }
    }

    /// Full SHA for a short SHA, branch or tag name
    pub async fn expand_committish(&self, committish: &str) -> Result<String> {
        let path = format!(
            "/repos/{}/commits/{}",
            self.repo,
            urlencoding::encode(committish)
        );
        let response = match self
            .api
            .get_with(&path, &[], Some("application/vnd.github.sha"))
            .await
        {
            Ok(response) => response,
            Err(CIFetchError::Api { .. }) => {
                return Err(CIFetchError::Config(format!(
                    "Failed to expand committish {committish}"
                )))
            }
            Err(e) => return Err(e),
        };
        Ok(response.text().await?.trim().to_string())
    }

    /// Second parent of a merge commit, taken to be the pull request head
    pub async fn merge_head(&self, sha: &str) -> Result<Option<String>> {
        let path = format!("/repos/{}/commits/{sha}", self.repo);
        let commit: CommitParents = match self.api.get_json(&path, &[]).await {
            Ok(commit) => commit,
            Err(e) if matches!(e.status(), Some(404 | 422)) => return Ok(None),
            Err(e) => return Err(e),
        };

        match commit.parents.as_slice() {
            [_, head] => Ok(Some(head.sha.clone())),
            _ => Ok(None),
        }
    }
}

fn with_per_page<'a>(query: &[(&'a str, &'a str)]) -> Vec<(&'a str, &'a str)> {
    let mut query = query.to_vec();
    query.push(("per_page", PER_PAGE));
    query
}

/// Extract the `rel="next"` target from a `Link` header
pub fn next_link(headers: &HeaderMap) -> Option<String> {
    let link = headers.get(LINK)?.to_str().ok()?;
    link.split(',').find_map(|part| {
        let mut pieces = part.split(';');
        let target = pieces.next()?.trim();
        let is_next = pieces.any(|p| {
            let p = p.trim();
            p == "rel=\"next\"" || p == "rel=next"
        });
        if is_next {
            target
                .strip_prefix('<')
                .and_then(|t| t.strip_suffix('>'))
                .map(str::to_string)
        } else {
            None
        }
    })
}
