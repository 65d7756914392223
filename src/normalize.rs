//! Mapping of provider-native vocabularies onto the common event model.
//!
//! Status mappings are total: anything a provider reports that is not listed
//! here is treated as [`CommonStatus::Incomplete`].

use crate::models::{CiKind, CommonStatus, EventType};

pub fn common_status(ci: CiKind, status: &str) -> CommonStatus {
    match ci {
        CiKind::GitHub => github_status(status),
        CiKind::Travis => travis_status(status),
        CiKind::Appveyor => appveyor_status(status),
    }
}

/// GitHub Actions run conclusions
pub fn github_status(conclusion: &str) -> CommonStatus {
    match conclusion {
        "success" => CommonStatus::Success,
        "failure" => CommonStatus::Failed,
        "timed_out" | "startup_failure" => CommonStatus::Errored,
        // neutral, action_required, cancelled, skipped, stale
        _ => CommonStatus::Incomplete,
    }
}

/// Travis job states
pub fn travis_status(state: &str) -> CommonStatus {
    match state {
        "passed" => CommonStatus::Success,
        "failed" => CommonStatus::Failed,
        "errored" => CommonStatus::Errored,
        // created, queued, received, started, canceled
        _ => CommonStatus::Incomplete,
    }
}

/// Appveyor job statuses
pub fn appveyor_status(status: &str) -> CommonStatus {
    match status {
        "success" => CommonStatus::Success,
        "failed" => CommonStatus::Failed,
        // queued, starting, running, cancelling, cancelled
        _ => CommonStatus::Incomplete,
    }
}

/// Map a GitHub run's `event` to an event type; unrelated triggers yield `None`
pub fn github_event(event: &str) -> Option<EventType> {
    match event {
        "schedule" => Some(EventType::Cron),
        "push" => Some(EventType::Push),
        "pull_request" | "pull_request_target" => Some(EventType::PullRequest),
        "workflow_dispatch" | "repository_dispatch" => Some(EventType::Manual),
        _ => None,
    }
}

pub fn travis_event(event: &str) -> Option<EventType> {
    match event {
        "cron" => Some(EventType::Cron),
        "push" => Some(EventType::Push),
        "pull_request" => Some(EventType::PullRequest),
        "api" => Some(EventType::Manual),
        _ => None,
    }
}

/// Appveyor only distinguishes pull-request builds from everything else
pub fn appveyor_event(pull_request_id: Option<&str>) -> EventType {
    match pull_request_id {
        Some(id) if !id.is_empty() => EventType::PullRequest,
        _ => EventType::Push,
    }
}
