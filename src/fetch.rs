use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};

use crate::auth::Tokens;
use crate::client::{ApiClient, RetryPolicy};
use crate::config::Config;
use crate::error::{CIFetchError, Result};
use crate::models::{all_fields, build_fields, Asset, CiKind, EventType, Listed, LogSource, RELEASE_FIELDS};
use crate::providers::{AssetCursor, BuildQuery, CiSystem, RunCache, Scope, Window};
use crate::secrets::Sanitizer;
use crate::state::{Coverage, Fingerprint, StateFile};
use crate::template::{sanitize_pathname, PathRenderer, Template};

#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Replaces both the checkpoint and the configured `since`
    pub since_override: Option<DateTime<Utc>>,
    pub sanitize_secrets: bool,
    /// Rendered paths are relative to this directory
    pub output_root: PathBuf,
    pub retry: RetryPolicy,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            since_override: None,
            sanitize_secrets: false,
            output_root: PathBuf::from("."),
            retry: RetryPolicy::default(),
        }
    }
}

/// What a run added to disk
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FetchReport {
    pub logs: usize,
    pub artifacts: usize,
    pub release_assets: usize,
    pub new_paths: Vec<PathBuf>,
}

impl FetchReport {
    pub fn log_summary(&self) {
        info!("{} logs downloaded", self.logs);
        info!("{} artifacts downloaded", self.artifacts);
        info!("{} release assets downloaded", self.release_assets);
        for path in &self.new_paths {
            debug!("New file: {}", path.display());
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Listing,
    Downloading,
    Checkpointing,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Listing => "listing",
            Phase::Downloading => "downloading",
            Phase::Checkpointing => "checkpointing",
        };
        f.write_str(name)
    }
}

struct PhaseTracker {
    ci: CiKind,
    phase: Phase,
}

impl PhaseTracker {
    fn new(ci: CiKind) -> Self {
        Self {
            ci,
            phase: Phase::Idle,
        }
    }

    fn enter(&mut self, next: Phase) {
        if self.phase != next {
            debug!("{}: {} -> {next}", self.ci, self.phase);
            self.phase = next;
        }
    }
}

/// Parsed and validated templates of one provider
#[derive(Debug, Default)]
struct ProviderTemplates {
    logs: Option<Template>,
    artifacts: Option<Template>,
    releases: Option<Template>,
}

impl ProviderTemplates {
    fn wants_builds(&self) -> bool {
        self.logs.is_some() || self.artifacts.is_some()
    }

    fn is_empty(&self) -> bool {
        !self.wants_builds() && self.releases.is_none()
    }

    fn for_asset(&self, asset: &Asset) -> Option<&Template> {
        match asset {
            Asset::Log { .. } => self.logs.as_ref(),
            Asset::Artifact { .. } => self.artifacts.as_ref(),
            Asset::Release { .. } => self.releases.as_ref(),
        }
    }
}

/// Drives every enabled provider: list, download, checkpoint
pub struct Fetcher<'a> {
    config: &'a Config,
    tokens: &'a Tokens,
    options: FetchOptions,
    renderer: PathRenderer,
    templates: HashMap<CiKind, ProviderTemplates>,
    sanitizer: Option<Sanitizer>,
}

impl<'a> Fetcher<'a> {
    /// Validate every configured template up front so a bad one fails the
    /// run before any request is made.
    pub fn new(config: &'a Config, tokens: &'a Tokens, options: FetchOptions) -> Result<Self> {
        let renderer = PathRenderer::new(&config.vars, &all_fields())?;

        let parse = |source: &Option<String>, available: &[&str]| -> Result<Option<Template>> {
            source
                .as_deref()
                .map(|source| -> Result<Template> {
                    let template = Template::parse(source)?;
                    renderer.validate(&template, available)?;
                    Ok(template)
                })
                .transpose()
        };

        let mut templates = HashMap::new();
        if let Some(github) = &config.ci.github {
            let fields = build_fields(CiKind::GitHub);
            templates.insert(
                CiKind::GitHub,
                ProviderTemplates {
                    logs: parse(&github.paths.logs, &fields)?,
                    artifacts: parse(&github.paths.artifacts, &fields)?,
                    releases: parse(&github.paths.releases, &RELEASE_FIELDS)?,
                },
            );
        }
        if let Some(travis) = &config.ci.travis {
            templates.insert(
                CiKind::Travis,
                ProviderTemplates {
                    logs: parse(&travis.paths.logs, &build_fields(CiKind::Travis))?,
                    ..Default::default()
                },
            );
        }
        if let Some(appveyor) = &config.ci.appveyor {
            templates.insert(
                CiKind::Appveyor,
                ProviderTemplates {
                    logs: parse(&appveyor.paths.logs, &build_fields(CiKind::Appveyor))?,
                    ..Default::default()
                },
            );
        }

        let sanitizer = if options.sanitize_secrets {
            let sanitizer = Sanitizer::from_config(config)?;
            if sanitizer.is_none() {
                warn!("Secret sanitization requested but no secrets are configured");
            }
            sanitizer
        } else {
            None
        };

        Ok(Self {
            config,
            tokens,
            options,
            renderer,
            templates,
            sanitizer,
        })
    }

    /// Fetch everything new since each provider's checkpoint.
    ///
    /// A provider that fails is logged and the run moves on to the next;
    /// configuration and credential errors stop the run at once.
    pub async fn fetch(&self, state: &mut StateFile) -> Result<FetchReport> {
        let mut report = FetchReport::default();
        let mut cache = RunCache::default();
        let mut failed = Vec::new();
        let now = Utc::now();

        for kind in CiKind::ORDER {
            let Some(templates) = self.templates.get(&kind) else {
                continue;
            };
            if templates.is_empty() {
                info!("No paths configured for {kind}; skipping");
                continue;
            }

            info!("Fetching resources from {kind}");
            let system = CiSystem::new(kind, self.config, self.tokens, &self.options.retry)?;
            match self
                .fetch_provider(&system, templates, state, &mut cache, &mut report, now)
                .await
            {
                Ok(()) => {}
                Err(e) if e.aborts_run() => return Err(e),
                Err(e) => {
                    error!("Fetching from {kind} failed: {e}");
                    failed.push(kind.to_string());
                }
            }
        }

        report.log_summary();
        if failed.is_empty() {
            Ok(report)
        } else {
            Err(CIFetchError::ProvidersFailed(failed))
        }
    }

    async fn fetch_provider(
        &self,
        system: &CiSystem,
        templates: &ProviderTemplates,
        state: &mut StateFile,
        cache: &mut RunCache,
        report: &mut FetchReport,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let kind = system.kind();
        let fingerprint = Fingerprint::new(kind, &self.config.templates(kind), &self.config.vars);
        let since = match self.options.since_override {
            Some(since) => since,
            None => state.effective_since(
                &fingerprint,
                self.config.since,
                self.config.days_back_floor(now),
            ),
        };
        let window = Window::new(since, self.config.until);

        let mut phase = PhaseTracker::new(kind);
        let mut coverage = Coverage::default();

        if templates.wants_builds() {
            phase.enter(Phase::Listing);
            let query = BuildQuery {
                scope: Scope::Window(window),
                types: self.config.types.clone(),
                logs: templates.logs.is_some(),
                artifacts: templates.artifacts.is_some(),
            };
            let mut cursor = system.build_assets(query, cache).await?;
            self.drain(system, cursor.as_mut(), templates, &mut coverage, &mut phase, report)
                .await?;
        }

        if templates.releases.is_some() && self.config.types.contains(&EventType::Release) {
            phase.enter(Phase::Listing);
            let mut cursor = system.release_assets(window).await?;
            self.drain(system, cursor.as_mut(), templates, &mut coverage, &mut phase, report)
                .await?;
        }

        phase.enter(Phase::Checkpointing);
        let covered = coverage.new_since(since);
        if state.checkpoint(&fingerprint, covered) {
            state.persist()?;
        }
        phase.enter(Phase::Idle);
        Ok(())
    }

    /// Fetch the builds of one commit on GitHub Actions. The state file is
    /// neither read nor written.
    pub async fn fetch_commit(&self, committish: &str) -> Result<FetchReport> {
        let templates = self
            .templates
            .get(&CiKind::GitHub)
            .filter(|templates| templates.wants_builds())
            .ok_or_else(|| {
                CIFetchError::Config(
                    "Fetching by commit needs GitHub logs or artifacts paths".to_string(),
                )
            })?;

        let system = CiSystem::new(CiKind::GitHub, self.config, self.tokens, &self.options.retry)?;
        let sha = system.expand_committish(committish).await?;

        let mut cache = RunCache::default();
        let mut coverage = Coverage::default();
        let mut phase = PhaseTracker::new(CiKind::GitHub);
        let mut report = FetchReport::default();

        phase.enter(Phase::Listing);
        let query = BuildQuery {
            scope: Scope::Commit(sha),
            types: self.config.types.clone(),
            logs: templates.logs.is_some(),
            artifacts: templates.artifacts.is_some(),
        };
        let mut cursor = system.build_assets(query, &mut cache).await?;
        self.drain(&system, cursor.as_mut(), templates, &mut coverage, &mut phase, &mut report)
            .await?;
        phase.enter(Phase::Idle);

        report.log_summary();
        Ok(report)
    }

    async fn drain(
        &self,
        system: &CiSystem,
        cursor: &mut (dyn AssetCursor + '_),
        templates: &ProviderTemplates,
        coverage: &mut Coverage,
        phase: &mut PhaseTracker,
        report: &mut FetchReport,
    ) -> Result<()> {
        while let Some(item) = cursor.next().await? {
            match item {
                Listed::Seen { at, complete } => coverage.register(at, complete),
                Listed::Asset(asset) => {
                    phase.enter(Phase::Downloading);
                    self.store(system.client(), &asset, templates, report).await?;
                    phase.enter(Phase::Listing);
                }
            }
        }
        Ok(())
    }

    async fn store(
        &self,
        client: &ApiClient,
        asset: &Asset,
        templates: &ProviderTemplates,
        report: &mut FetchReport,
    ) -> Result<()> {
        let template = templates.for_asset(asset).ok_or_else(|| {
            CIFetchError::Config("Provider listed an asset with no configured path".to_string())
        })?;
        let path = self
            .options
            .output_root
            .join(self.renderer.render(template, &asset.path_fields())?);

        match asset {
            Asset::Log {
                event,
                source: LogSource::Archive(url),
            } => {
                if has_entries(&path) {
                    info!("Logs for {} already downloaded to {}; skipping", event.describe(), path.display());
                    return Ok(());
                }
                info!("Downloading logs for {} to {}", event.describe(), path.display());
                match client.download_zipfile(url, &path).await {
                    Ok(()) => {}
                    Err(e) if matches!(e.status(), Some(404 | 410)) => {
                        error!("Request for logs of {} returned {e}; skipping", event.describe());
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                }
                let files = list_files(&path)?;
                self.sanitize(&files)?;
                report.logs += files.len();
                report.new_paths.extend(files);
            }
            Asset::Log {
                event,
                source: LogSource::Text(url),
            } => {
                if path.exists() {
                    info!("Logs for {} already downloaded to {}; skipping", event.describe(), path.display());
                    return Ok(());
                }
                info!("Downloading logs for {} to {}", event.describe(), path.display());
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                if !skip_gone(client.download(url, &path, None).await, &event.describe())? {
                    return Ok(());
                }
                self.sanitize(std::slice::from_ref(&path))?;
                report.logs += 1;
                report.new_paths.push(path);
            }
            Asset::Artifact {
                event,
                name,
                download_url,
            } => {
                let target = path.join(sanitize_pathname(name));
                if has_entries(&target) {
                    info!("Artifact {name:?} for {} already downloaded; skipping", event.describe());
                    return Ok(());
                }
                info!("Downloading artifact {name:?} for {} to {}", event.describe(), target.display());
                if !skip_gone(client.download_zipfile(download_url, &target).await, name)? {
                    return Ok(());
                }
                let files = list_files(&target)?;
                report.artifacts += files.len();
                report.new_paths.extend(files);
            }
            Asset::Release {
                event,
                name,
                download_url,
            } => {
                let target = path.join(sanitize_pathname(name));
                if target.exists() {
                    info!("Asset {name:?} for release {} already downloaded; skipping", event.release_tag);
                    return Ok(());
                }
                info!("Downloading asset {name:?} for release {} to {}", event.release_tag, target.display());
                std::fs::create_dir_all(&path)?;
                if !skip_gone(client.download(download_url, &target, Some("*/*")).await, name)? {
                    return Ok(());
                }
                report.release_assets += 1;
                report.new_paths.push(target);
            }
        }

        Ok(())
    }

    fn sanitize(&self, files: &[PathBuf]) -> Result<()> {
        if let Some(sanitizer) = &self.sanitizer {
            for file in files {
                sanitizer.sanitize_file(file)?;
            }
        }
        Ok(())
    }
}

/// `Ok(false)` when the asset is gone from the server
fn skip_gone(result: Result<()>, what: &str) -> Result<bool> {
    match result {
        Ok(()) => Ok(true),
        Err(e) if e.is_gone() => {
            warn!("{what} is no longer available; skipping");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

fn has_entries(dir: &Path) -> bool {
    std::fs::read_dir(dir).is_ok_and(|mut entries| entries.next().is_some())
}

/// Every regular file below `dir`, sorted
fn list_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in std::fs::read_dir(&current)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                stack.push(path);
            } else {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use mockito::{Matcher, Mock, Server, ServerGuard};

    use super::*;
    use crate::auth::Token;
    use crate::client::tests::zip_bytes;

    fn tokens() -> Tokens {
        Tokens {
            github: Some(Token::from("gh_test")),
            travis: None,
            appveyor: Some(Token::from("av_test")),
        }
    }

    fn options(root: &Path) -> FetchOptions {
        FetchOptions {
            output_root: root.to_path_buf(),
            retry: RetryPolicy::without_delays(0),
            ..Default::default()
        }
    }

    fn appveyor_yaml(url: &str) -> String {
        format!(
            r#"
  appveyor:
    api_url: {url}
    accountName: con
    paths:
      logs: '{{year}}/{{month}}/{{ci}}/{{number}}/{{job}}.txt'
"#
        )
    }

    fn config(body: &str) -> Config {
        Config::from_yaml(&format!(
            "repo: con/tinuous\nsince: 2021-01-01T00:00:00Z\nmax-days-back: 100000\nsecrets:\n  github: 'ghp_[A-Za-z0-9]{{8}}'\nci:\n{body}"
        ))
        .unwrap()
    }

    /// Listing mocks and per-job log mocks; each log may be fetched once
    async fn mock_appveyor(server: &mut ServerGuard) -> (Vec<Mock>, Vec<Mock>) {
        let build = |id: u64, created: &str| {
            format!(
                r#"{{"buildId": {id}, "buildNumber": {id}, "version": "1.0.{id}", "branch": "main",
                    "commitId": "c{id}", "created": "{created}", "finished": "{created}"}}"#
            )
        };
        let mut listing = vec![
            server
                .mock("GET", "/api/projects/con/tinuous/history")
                .match_query(Matcher::Exact("recordsNumber=20".into()))
                .with_body(format!(
                    r#"{{"builds": [{}, {}]}}"#,
                    build(2, "2021-01-03T00:00:00Z"),
                    build(1, "2021-01-02T00:00:00Z"),
                ))
                .create_async()
                .await,
            server
                .mock("GET", "/api/projects/con/tinuous/history")
                .match_query(Matcher::UrlEncoded("startBuildId".into(), "1".into()))
                .with_body(r#"{"builds": []}"#)
                .create_async()
                .await,
        ];
        let mut logs = Vec::new();
        for id in [1, 2] {
            listing.push(
                server
                    .mock("GET", format!("/api/projects/con/tinuous/build/1.0.{id}").as_str())
                    .with_body(format!(
                        r#"{{"build": {{"jobs": [{{"jobId": "job{id}", "name": "", "status": "success"}}]}}}}"#
                    ))
                    .create_async()
                    .await,
            );
            logs.push(
                server
                    .mock("GET", format!("/api/buildjobs/job{id}/log").as_str())
                    .with_body(format!("build {id} used ghp_abcd1234\n"))
                    .expect(1)
                    .create_async()
                    .await,
            );
        }
        (listing, logs)
    }

    fn appveyor_fingerprint(config: &Config) -> Fingerprint {
        Fingerprint::new(CiKind::Appveyor, &config.templates(CiKind::Appveyor), &config.vars)
    }

    #[tokio::test]
    async fn test_fetch_is_idempotent() {
        let mut server = Server::new_async().await;
        let (_listing, logs) = mock_appveyor(&mut server).await;
        let out = tempfile::tempdir().unwrap();
        let state_path = out.path().join("state.json");
        let config = config(&appveyor_yaml(&server.url()));
        let tokens = tokens();

        let fetcher = Fetcher::new(&config, &tokens, options(out.path())).unwrap();
        let mut state = StateFile::load(&state_path).unwrap();
        let first = fetcher.fetch(&mut state).await.unwrap();

        assert_eq!(first.logs, 2);
        assert_eq!(
            first.new_paths,
            vec![
                out.path().join("2021/01/appveyor/1/job1.txt"),
                out.path().join("2021/01/appveyor/2/job2.txt"),
            ]
        );
        assert_eq!(
            state.get(&appveyor_fingerprint(&config)),
            Some(Utc.with_ymd_and_hms(2021, 1, 3, 0, 0, 0).unwrap())
        );
        let saved = std::fs::read_to_string(&state_path).unwrap();

        let mut state = StateFile::load(&state_path).unwrap();
        let second = fetcher.fetch(&mut state).await.unwrap();

        assert_eq!(second, FetchReport::default());
        assert!(!state.is_modified());
        assert_eq!(std::fs::read_to_string(&state_path).unwrap(), saved);
        // logs are requested once across both runs
        for mock in logs {
            mock.assert_async().await;
        }
    }

    #[tokio::test]
    async fn test_existing_files_are_not_downloaded_again() {
        let mut server = Server::new_async().await;
        let _mocks = mock_appveyor(&mut server).await;
        let out = tempfile::tempdir().unwrap();
        let existing = out.path().join("2021/01/appveyor/1/job1.txt");
        std::fs::create_dir_all(existing.parent().unwrap()).unwrap();
        std::fs::write(&existing, "kept").unwrap();

        let config = config(&appveyor_yaml(&server.url()));
        let tokens = tokens();
        let fetcher = Fetcher::new(&config, &tokens, options(out.path())).unwrap();
        let mut state = StateFile::load(&out.path().join("state.json")).unwrap();
        let report = fetcher.fetch(&mut state).await.unwrap();

        assert_eq!(report.logs, 1);
        assert_eq!(std::fs::read_to_string(&existing).unwrap(), "kept");
    }

    #[tokio::test]
    async fn test_sanitize_secrets_in_logs() {
        let mut server = Server::new_async().await;
        let _mocks = mock_appveyor(&mut server).await;
        let out = tempfile::tempdir().unwrap();
        let config = config(&appveyor_yaml(&server.url()));
        let tokens = tokens();

        let fetcher = Fetcher::new(
            &config,
            &tokens,
            FetchOptions {
                sanitize_secrets: true,
                ..options(out.path())
            },
        )
        .unwrap();
        let mut state = StateFile::load(&out.path().join("state.json")).unwrap();
        fetcher.fetch(&mut state).await.unwrap();

        assert_eq!(
            std::fs::read_to_string(out.path().join("2021/01/appveyor/1/job1.txt")).unwrap(),
            format!("build 1 used {}\n", "*".repeat(12))
        );
    }

    #[tokio::test]
    async fn test_failed_provider_does_not_stop_others() {
        let mut server = Server::new_async().await;
        let _appveyor = mock_appveyor(&mut server).await;
        let workflows = server
            .mock("GET", "/repos/con/tinuous/actions/workflows")
            .match_query(Matcher::Any)
            .with_status(503)
            .expect(3)
            .create_async()
            .await;
        let out = tempfile::tempdir().unwrap();
        let state_path = out.path().join("state.json");
        let config = config(&format!(
            "  github:\n    api_url: {}\n    paths:\n      logs: '{{year}}/{{wf_name}}/{{number}}/'\n{}",
            server.url(),
            appveyor_yaml(&server.url())
        ));
        let tokens = tokens();

        let fetcher = Fetcher::new(
            &config,
            &tokens,
            FetchOptions {
                retry: RetryPolicy::without_delays(2),
                ..options(out.path())
            },
        )
        .unwrap();
        let mut state = StateFile::load(&state_path).unwrap();
        let err = fetcher.fetch(&mut state).await.unwrap_err();

        workflows.assert_async().await;
        assert!(matches!(err, CIFetchError::ProvidersFailed(ref failed) if failed == &["github"]));
        assert!(out.path().join("2021/01/appveyor/2/job2.txt").exists());

        let github =
            Fingerprint::new(CiKind::GitHub, &config.templates(CiKind::GitHub), &config.vars);
        let state = StateFile::load(&state_path).unwrap();
        assert_eq!(state.get(&github), None);
        assert!(state.get(&appveyor_fingerprint(&config)).is_some());
    }

    #[tokio::test]
    async fn test_github_logs_artifacts_and_releases() {
        let mut server = Server::new_async().await;
        let url = server.url();
        let run = |id: u64, number: u64, created: &str| {
            format!(
                r#"{{"id": {id}, "head_branch": "main", "head_sha": "abc{id}", "run_number": {number},
                    "event": "push", "status": "completed", "conclusion": "success", "workflow_id": 1,
                    "pull_requests": [], "created_at": "{created}",
                    "logs_url": "{url}/logs/{id}", "artifacts_url": "{url}/artifacts/{id}"}}"#
            )
        };
        let _mock = server
            .mock("GET", "/repos/con/tinuous/actions/workflows")
            .match_query(Matcher::Any)
            .with_body(r#"{"total_count": 1, "workflows": [{"id": 1, "name": "Test", "path": ".github/workflows/test.yml"}]}"#)
            .create_async()
            .await;
        let _mock = server
            .mock("GET", "/repos/con/tinuous/actions/runs")
            .match_query(Matcher::Any)
            .with_body(format!(
                r#"{{"total_count": 2, "workflow_runs": [{}, {}]}}"#,
                run(101, 8, "2021-06-03T00:00:00Z"),
                run(100, 7, "2021-06-02T00:00:00Z"),
            ))
            .create_async()
            .await;
        let _mock = server
            .mock("GET", "/artifacts/100")
            .match_query(Matcher::Any)
            .with_body(format!(
                r#"{{"total_count": 1, "artifacts": [{{"name": "dist", "archive_download_url": "{url}/zips/dist", "expired": false}}]}}"#
            ))
            .create_async()
            .await;
        let _mock = server
            .mock("GET", "/artifacts/101")
            .match_query(Matcher::Any)
            .with_body(r#"{"total_count": 0, "artifacts": []}"#)
            .create_async()
            .await;
        let _mock = server
            .mock("GET", "/logs/100")
            .with_body(zip_bytes(&[("build/1_step.txt", "hello\n")]))
            .create_async()
            .await;
        let _mock = server
            .mock("GET", "/logs/101")
            .with_status(410)
            .create_async()
            .await;
        let _mock = server
            .mock("GET", "/zips/dist")
            .with_body(zip_bytes(&[("pkg.whl", "wheel")]))
            .create_async()
            .await;
        let _mock = server
            .mock("GET", "/repos/con/tinuous/releases")
            .match_query(Matcher::Any)
            .with_body(format!(
                r#"[{{"tag_name": "v1", "draft": false, "prerelease": false,
                      "published_at": "2021-06-04T00:00:00Z",
                      "assets": [{{"name": "v1.tar.gz", "browser_download_url": "{url}/dl/v1.tar.gz"}}]}},
                    {{"tag_name": "v2rc1", "draft": false, "prerelease": true,
                      "published_at": "2021-06-05T00:00:00Z", "assets": []}}]"#
            ))
            .create_async()
            .await;
        let _mock = server
            .mock("GET", "/repos/con/tinuous/git/refs/tags/v1")
            .with_body(format!(
                r#"{{"object": {{"type": "commit", "sha": "abc100", "url": "{url}/commits/abc100"}}}}"#
            ))
            .create_async()
            .await;
        let _mock = server
            .mock("GET", "/dl/v1.tar.gz")
            .with_body("tarball")
            .create_async()
            .await;

        let out = tempfile::tempdir().unwrap();
        let config = config(&format!(
            r#"  github:
    api_url: {url}
    paths:
      logs: '{{year}}/{{month}}/{{wf_file}}/{{number}}/logs/'
      artifacts: '{{year}}/{{month}}/{{wf_file}}/{{number}}/artifacts/'
      releases: 'releases/{{release_tag}}/'
"#
        ));
        let tokens = tokens();
        let fetcher = Fetcher::new(&config, &tokens, options(out.path())).unwrap();
        let mut state = StateFile::load(&out.path().join("state.json")).unwrap();
        let report = fetcher.fetch(&mut state).await.unwrap();

        assert_eq!((report.logs, report.artifacts, report.release_assets), (1, 1, 1));
        assert_eq!(
            std::fs::read_to_string(out.path().join("2021/06/test.yml/7/logs/build/1_step.txt"))
                .unwrap(),
            "hello\n"
        );
        assert_eq!(
            std::fs::read_to_string(out.path().join("2021/06/test.yml/7/artifacts/dist/pkg.whl"))
                .unwrap(),
            "wheel"
        );
        assert_eq!(
            std::fs::read_to_string(out.path().join("releases/v1/v1.tar.gz")).unwrap(),
            "tarball"
        );
        assert!(!out.path().join("2021/06/test.yml/8/logs").exists());

        let fingerprint =
            Fingerprint::new(CiKind::GitHub, &config.templates(CiKind::GitHub), &config.vars);
        assert_eq!(
            state.get(&fingerprint),
            Some(Utc.with_ymd_and_hms(2021, 6, 4, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_bad_template_fails_before_any_request() {
        let config = config(&appveyor_yaml("http://127.0.0.1:9").replace("{job}", "{wf_name}"));
        let tokens = tokens();

        let err = Fetcher::new(&config, &tokens, FetchOptions::default()).err().unwrap();
        assert!(matches!(err, CIFetchError::Template { .. }));
        assert!(err.aborts_run());
    }

    #[tokio::test]
    async fn test_fetch_commit_requires_github() {
        let config = config(&appveyor_yaml("http://127.0.0.1:9"));
        let tokens = tokens();
        let fetcher = Fetcher::new(&config, &tokens, FetchOptions::default()).unwrap();

        let err = fetcher.fetch_commit("main").await.unwrap_err();
        assert!(matches!(err, CIFetchError::Config(_)));
    }

    #[tokio::test]
    async fn test_fetch_commit_writes_logs_and_artifacts() {
        let mut server = Server::new_async().await;
        let url = server.url();
        let full_sha = "abc1234def5678abc1234def5678abc1234def56";
        let expand = server
            .mock("GET", "/repos/con/tinuous/commits/abc1234")
            .match_header("accept", "application/vnd.github.sha")
            .with_body(format!("{full_sha}\n"))
            .expect(1)
            .create_async()
            .await;
        let _workflows = server
            .mock("GET", "/repos/con/tinuous/actions/workflows")
            .match_query(Matcher::Any)
            .with_body(r#"{"total_count": 1, "workflows": [{"id": 1, "name": "Test", "path": ".github/workflows/test.yml"}]}"#)
            .create_async()
            .await;
        let runs = server
            .mock("GET", "/repos/con/tinuous/actions/runs")
            .match_query(Matcher::UrlEncoded("head_sha".into(), full_sha.into()))
            .with_body(format!(
                r#"{{"total_count": 1, "workflow_runs": [{{"id": 300, "head_branch": "main", "head_sha": "{full_sha}",
                    "run_number": 12, "event": "push", "status": "completed", "conclusion": "failure",
                    "workflow_id": 1, "pull_requests": [], "created_at": "2021-07-01T00:00:00Z",
                    "logs_url": "{url}/logs/300", "artifacts_url": "{url}/artifacts/300"}}]}}"#
            ))
            .expect(1)
            .create_async()
            .await;
        let _artifacts = server
            .mock("GET", "/artifacts/300")
            .match_query(Matcher::Any)
            .with_body(format!(
                r#"{{"total_count": 1, "artifacts": [{{"name": "dist", "archive_download_url": "{url}/zips/dist", "expired": false}}]}}"#
            ))
            .create_async()
            .await;
        let _logs = server
            .mock("GET", "/logs/300")
            .with_body(zip_bytes(&[("build/2_test.txt", "failed\n")]))
            .create_async()
            .await;
        let _zip = server
            .mock("GET", "/zips/dist")
            .with_body(zip_bytes(&[("pkg.whl", "wheel")]))
            .create_async()
            .await;

        let out = tempfile::tempdir().unwrap();
        let config = config(&format!(
            r#"  github:
    api_url: {url}
    paths:
      logs: '{{commit}}/{{wf_file}}/{{number}}/logs/'
      artifacts: '{{commit}}/{{wf_file}}/{{number}}/artifacts/'
"#
        ));
        let tokens = tokens();
        let fetcher = Fetcher::new(&config, &tokens, options(out.path())).unwrap();
        let report = fetcher.fetch_commit("abc1234").await.unwrap();

        expand.assert_async().await;
        runs.assert_async().await;
        assert_eq!((report.logs, report.artifacts), (1, 1));
        let run_dir = out.path().join(full_sha).join("test.yml/12");
        assert_eq!(
            std::fs::read_to_string(run_dir.join("logs/build/2_test.txt")).unwrap(),
            "failed\n"
        );
        assert_eq!(
            std::fs::read_to_string(run_dir.join("artifacts/dist/pkg.whl")).unwrap(),
            "wheel"
        );

        let top: Vec<_> = std::fs::read_dir(out.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        // nothing but the rendered tree; no state file is written
        assert_eq!(top, [std::ffi::OsString::from(full_sha)]);
    }
}
