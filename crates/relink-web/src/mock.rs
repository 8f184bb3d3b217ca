//! Canned responses for endpoints that do not exist on a static host.

use crate::fetch::FetchResponse;
use relink_core::gateway::path_of;
use relink_core::host_of;
use serde_json::{Value, json};
use std::fmt;
use std::sync::Arc;

const GITHUB_API_PATH: &str = "/api/github";
const GITHUB_API_HOST: &str = "api.github.com";

pub trait GithubDataProvider: Send + Sync {
    fn github_payload(&self) -> Value;
}

/// Deterministic profile data for offline rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticGithubData {
    pub login: String,
    pub name: String,
    pub weeks: usize,
}

impl StaticGithubData {
    pub fn new(login: impl Into<String>) -> Self {
        let login = login.into();
        Self {
            name: login.clone(),
            login,
            weeks: 52,
        }
    }
}

impl Default for StaticGithubData {
    fn default() -> Self {
        Self::new("portfolio")
    }
}

impl GithubDataProvider for StaticGithubData {
    fn github_payload(&self) -> Value {
        let contributions: Vec<Value> = (0..self.weeks.max(1))
            .map(|week| json!({ "week": week, "count": (week * 7 + 3) % 17 }))
            .collect();
        let total: usize = (0..self.weeks.max(1)).map(|week| (week * 7 + 3) % 17).sum();
        json!({
            "profile": {
                "login": self.login,
                "name": self.name,
                "avatarUrl": "./images/avatar.png",
                "htmlUrl": format!("https://github.com/{}", self.login),
                "publicRepos": 0,
                "followers": 0,
            },
            "contributions": contributions,
            "totalContributions": total,
            "repositories": [],
        })
    }
}

#[derive(Clone)]
pub struct MockEndpoints {
    github: Arc<dyn GithubDataProvider>,
}

impl MockEndpoints {
    pub fn new(github: Arc<dyn GithubDataProvider>) -> Self {
        Self { github }
    }

    /// True for `/api/github` under any prefix and for `api.github.com`.
    pub fn matches(&self, url: &str) -> bool {
        if host_of(url).is_some_and(|host| host == GITHUB_API_HOST) {
            return true;
        }
        let path = path_of(url).unwrap_or(url);
        let bare = path
            .split(|c: char| c == '?' || c == '#')
            .next()
            .unwrap_or_default()
            .trim_end_matches('/');
        bare.ends_with(GITHUB_API_PATH) || bare.contains("/api/github/")
    }

    pub fn respond(&self, url: &str) -> Option<FetchResponse> {
        if !self.matches(url) {
            return None;
        }
        tracing::debug!(url, "serving mocked github payload");
        Some(FetchResponse::json(&self.github.github_payload()).with_header("x-relink-mock", "github"))
    }
}

impl Default for MockEndpoints {
    fn default() -> Self {
        Self::new(Arc::new(StaticGithubData::default()))
    }
}

impl fmt::Debug for MockEndpoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockEndpoints").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_github_endpoints_only() {
        let mocks = MockEndpoints::default();
        assert!(mocks.matches("/api/github"));
        assert!(mocks.matches("./api/github?user=me"));
        assert!(mocks.matches("https://ipfs.io/ipfs/bafy/api/github"));
        assert!(mocks.matches("https://api.github.com/users/me"));
        assert!(mocks.matches("/api/github/contributions"));
        assert!(!mocks.matches("/api/githubber"));
        assert!(!mocks.matches("/api/other"));
        assert!(!mocks.matches("https://example.com/github"));
    }

    #[test]
    fn payload_has_profile_and_contributions() {
        let res = MockEndpoints::default().respond("/api/github").expect("mocked");
        assert_eq!(res.status, 200);
        let body = res.json_body().expect("json");
        assert!(body.get("profile").is_some());
        assert_eq!(body["contributions"].as_array().map(Vec::len), Some(52));
    }

    #[test]
    fn custom_provider_is_used() {
        struct Fixed;
        impl GithubDataProvider for Fixed {
            fn github_payload(&self) -> Value {
                json!({"profile": {"login": "fixed"}, "contributions": [1]})
            }
        }
        let res = MockEndpoints::new(Arc::new(Fixed))
            .respond("/api/github")
            .expect("mocked");
        assert_eq!(res.json_body().expect("json")["profile"]["login"], "fixed");
    }
}
