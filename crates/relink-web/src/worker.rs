//! Network boundary layer.
//!
//! A worker sits under a registration scope (`https://ipfs.io/ipfs/<cid>/`)
//! and sees every request the page makes, after the page-side layers had
//! their chance. It owns its own copy of the rule table; a page running a
//! different table version is tolerated.
//!
//! A [`FetchEvent`] is consumed by [`FetchEvent::respond_with`] or
//! [`FetchEvent::pass_through`], so each event is answered at most once.

use crate::fetch::{Fetch, FetchRequest, FetchResponse, RequestMode, content_type_for_path};
use crate::mock::MockEndpoints;
use relink_core::{RuleTable, collapse_api_prefix, is_font_file};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};
use url::Url;

pub const RULES_VERSION_HEADER: &str = "x-relink-rules";
pub const DEFAULT_MAX_FALLBACK_ATTEMPTS: usize = 3;

const NEXT_MEDIA_DIR: &str = "_next/static/media/";
const FONTS_DIR: &str = "fonts/";
const IMAGES_DIR: &str = "images/";
const MUSIC_DIR: &str = "music/";
const NEXT_DIR: &str = "_next/";
const AUDIO_EXTENSIONS: [&str; 4] = [".mp3", ".ogg", ".wav", ".m4a"];
const PLACEHOLDER_SVG: &str = r##"<svg xmlns="http://www.w3.org/2000/svg" width="64" height="64" viewBox="0 0 64 64"><rect width="64" height="64" fill="#e5e7eb"/></svg>"##;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum WorkerRoute {
    Font,
    ApiDoublePrefix,
    GithubApi,
    Music,
    Image,
    FrameworkChunk,
    GatewayNavigation,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerConfig {
    #[serde(default = "default_max_fallback_attempts")]
    pub max_fallback_attempts: usize,
    #[serde(default = "default_index_document")]
    pub index_document: String,
}

fn default_max_fallback_attempts() -> usize {
    DEFAULT_MAX_FALLBACK_ATTEMPTS
}

fn default_index_document() -> String {
    "index.html".to_string()
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_fallback_attempts: default_max_fallback_attempts(),
            index_document: default_index_document(),
        }
    }
}

#[derive(Debug)]
#[must_use = "a fetch event must be answered or passed through"]
pub struct FetchEvent {
    request: FetchRequest,
}

impl FetchEvent {
    pub fn new(request: FetchRequest) -> Self {
        Self { request }
    }

    pub fn request(&self) -> &FetchRequest {
        &self.request
    }

    pub fn respond_with(self, response: FetchResponse) -> Handled {
        Handled::Responded(response)
    }

    pub fn pass_through(self) -> Handled {
        Handled::PassThrough(self.request)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handled {
    Responded(FetchResponse),
    /// Left to the browser's default network handling.
    PassThrough(FetchRequest),
}

impl Handled {
    pub fn response(&self) -> Option<&FetchResponse> {
        match self {
            Handled::Responded(response) => Some(response),
            Handled::PassThrough(_) => None,
        }
    }

    pub fn is_pass_through(&self) -> bool {
        matches!(self, Handled::PassThrough(_))
    }

    /// The response the page ends up with. Pass-through goes to `network`
    /// unchanged.
    pub fn complete(
        self,
        network: &dyn Fetch,
    ) -> Result<FetchResponse, crate::fetch::FetchError> {
        match self {
            Handled::Responded(response) => Ok(response),
            Handled::PassThrough(request) => network.fetch(&request),
        }
    }
}

/// Request path relative to the worker scope.
#[derive(Debug, Clone, PartialEq, Eq)]
struct LocalPath {
    /// False when the request escaped the scope prefix and landed on the
    /// origin root (`/_next/...` instead of `/ipfs/<cid>/_next/...`).
    under_scope: bool,
    rest: String,
    query: Option<String>,
}

enum Outcome {
    Hit(FetchResponse),
    /// Last non-2xx response, if any candidate answered at all.
    Miss(Option<FetchResponse>),
}

#[derive(Debug, Clone)]
pub struct ServiceWorker {
    table: RuleTable,
    scope: Url,
    config: WorkerConfig,
    mocks: MockEndpoints,
}

impl ServiceWorker {
    /// `scope` is normalized to end in `/`.
    pub fn new(scope: &str, table: RuleTable) -> Result<Self, url::ParseError> {
        let mut scope = Url::parse(scope)?;
        if !scope.path().ends_with('/') {
            let path = format!("{}/", scope.path());
            scope.set_path(&path);
        }
        scope.set_query(None);
        scope.set_fragment(None);
        Ok(Self {
            table,
            scope,
            config: WorkerConfig::default(),
            mocks: MockEndpoints::default(),
        })
    }

    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_mocks(mut self, mocks: MockEndpoints) -> Self {
        self.mocks = mocks;
        self
    }

    pub fn scope(&self) -> &Url {
        &self.scope
    }

    pub fn rules_version(&self) -> u32 {
        self.table.version()
    }

    pub fn classify(&self, request: &FetchRequest) -> WorkerRoute {
        if self.mocks.matches(&request.url) {
            return WorkerRoute::GithubApi;
        }
        let Some(local) = self.local_path(&request.url) else {
            return WorkerRoute::Other;
        };
        let rest = local.rest.as_str();

        if is_font_file(rest) {
            WorkerRoute::Font
        } else if collapse_api_prefix(&format!("/{rest}")).is_some() {
            WorkerRoute::ApiDoublePrefix
        } else if rest.starts_with(MUSIC_DIR) || is_audio_file(rest) {
            WorkerRoute::Music
        } else if rest.starts_with(IMAGES_DIR) {
            WorkerRoute::Image
        } else if rest.starts_with(NEXT_DIR) {
            WorkerRoute::FrameworkChunk
        } else if request.mode == RequestMode::Navigate && !last_segment_has_extension(rest) {
            WorkerRoute::GatewayNavigation
        } else {
            WorkerRoute::Other
        }
    }

    pub fn handle(&self, event: FetchEvent, network: &dyn Fetch) -> Handled {
        self.note_version_skew(event.request());
        let route = self.classify(event.request());
        debug!(url = %event.request().url, ?route, "worker fetch");

        let local = self.local_path(&event.request().url);
        match (route, local) {
            (WorkerRoute::GithubApi, _) => match self.mocks.respond(&event.request().url) {
                Some(response) => event.respond_with(response),
                None => event.pass_through(),
            },
            (WorkerRoute::Other, _) | (_, None) => event.pass_through(),
            (WorkerRoute::Font, Some(local)) => self.handle_font(event, &local, network),
            (WorkerRoute::ApiDoublePrefix, Some(local)) => self.handle_api(event, &local, network),
            (WorkerRoute::GatewayNavigation, Some(local)) => {
                self.handle_navigation(event, &local, network)
            }
            (route, Some(local)) => self.handle_asset(event, route, &local, network),
        }
    }

    fn handle_font(&self, event: FetchEvent, local: &LocalPath, network: &dyn Fetch) -> Handled {
        let bare = local.rest.as_str();
        let file = bare.rsplit('/').next().unwrap_or(bare);
        let media = self.scoped_url(&format!("{NEXT_MEDIA_DIR}{file}"), local.query.as_deref());
        let fonts = self.scoped_url(&format!("{FONTS_DIR}{file}"), local.query.as_deref());
        let preferred = match self.table.font_route() {
            relink_core::FontRoute::NextMedia => [media, fonts],
            relink_core::FontRoute::Fonts => [fonts, media],
        };

        let mut candidates: Vec<String> = preferred.into_iter().flatten().collect();
        candidates.push(event.request().url.clone());

        match self.first_success(event.request(), &candidates, network) {
            Outcome::Hit(response) => event.respond_with(response),
            Outcome::Miss(_) => {
                warn!(url = %event.request().url, "font unavailable at every candidate; serving empty font");
                event.respond_with(FetchResponse::empty(content_type_for_path(file)))
            }
        }
    }

    fn handle_api(&self, event: FetchEvent, local: &LocalPath, network: &dyn Fetch) -> Handled {
        let rooted = format!("/{}", local.rest);
        let collapsed = collapse_api_prefix(&rooted).unwrap_or(rooted);
        let relative = collapsed.trim_start_matches('/');
        let target = if local.under_scope {
            self.scoped_url(relative, local.query.as_deref())
        } else {
            self.origin_url(relative, local.query.as_deref())
        };
        let Some(target) = target else {
            return event.pass_through();
        };

        match network.fetch(&event.request().with_url(target.as_str())) {
            Ok(response) => event.respond_with(response),
            Err(err) => {
                warn!(url = %target, error = %err, "api re-fetch failed");
                let body = json!({ "error": "upstream request failed", "url": target });
                event.respond_with(FetchResponse::json(&body).with_status(502))
            }
        }
    }

    fn handle_asset(
        &self,
        event: FetchEvent,
        route: WorkerRoute,
        local: &LocalPath,
        network: &dyn Fetch,
    ) -> Handled {
        let normalized = self.normalized_rest(&local.rest);
        let mut candidates: Vec<String> = self
            .scoped_url(&normalized, local.query.as_deref())
            .into_iter()
            .collect();
        candidates.push(event.request().url.clone());

        match self.first_success(event.request(), &candidates, network) {
            Outcome::Hit(response) => event.respond_with(response),
            Outcome::Miss(_) if route == WorkerRoute::Image => {
                debug!(url = %event.request().url, "image unavailable; serving placeholder");
                event.respond_with(FetchResponse::ok(PLACEHOLDER_SVG, "image/svg+xml"))
            }
            Outcome::Miss(Some(response)) => event.respond_with(response),
            Outcome::Miss(None) => event.pass_through(),
        }
    }

    fn handle_navigation(
        &self,
        event: FetchEvent,
        local: &LocalPath,
        network: &dyn Fetch,
    ) -> Handled {
        let mut candidates = vec![event.request().url.clone()];
        if !local.under_scope {
            candidates.extend(self.scoped_url(&local.rest, local.query.as_deref()));
        }
        candidates.extend(self.scoped_url(&self.config.index_document, None));

        match self.first_success(event.request(), &candidates, network) {
            Outcome::Hit(response) => event.respond_with(response),
            Outcome::Miss(Some(response)) => event.respond_with(response),
            Outcome::Miss(None) => event.pass_through(),
        }
    }

    /// Fetches candidates in order until one answers 2xx, within the
    /// fallback budget. Duplicate candidates are fetched once.
    fn first_success(
        &self,
        request: &FetchRequest,
        candidates: &[String],
        network: &dyn Fetch,
    ) -> Outcome {
        let mut unique: Vec<&String> = Vec::new();
        for candidate in candidates {
            if !unique.contains(&candidate) {
                unique.push(candidate);
            }
        }

        let mut last = None;
        for candidate in unique.into_iter().take(self.config.max_fallback_attempts.max(1)) {
            match network.fetch(&request.with_url(candidate.as_str())) {
                Ok(response) if response.is_success() => return Outcome::Hit(response),
                Ok(response) => {
                    debug!(url = %candidate, status = response.status, "fallback candidate missed");
                    last = Some(response);
                }
                Err(err) => debug!(url = %candidate, error = %err, "fallback candidate failed"),
            }
        }
        Outcome::Miss(last)
    }

    fn local_path(&self, raw: &str) -> Option<LocalPath> {
        let url = Url::parse(raw).ok()?;
        if url.origin() != self.scope.origin() {
            return None;
        }

        let path = url.path();
        let scope_path = self.scope.path();
        let (under_scope, rest) = match path.strip_prefix(scope_path) {
            Some(rest) => (true, rest),
            None if format!("{path}/") == scope_path => (true, ""),
            None => (false, path.trim_start_matches('/')),
        };
        Some(LocalPath {
            under_scope,
            rest: rest.to_string(),
            query: url.query().map(str::to_string),
        })
    }

    /// Scope-relative form of `rest` after the rule table, without a leading
    /// `./` or `/`.
    fn normalized_rest(&self, rest: &str) -> String {
        let resolved = self.table.resolve_guarded(&format!("/{rest}"));
        resolved
            .trim_start_matches("./")
            .trim_start_matches('/')
            .to_string()
    }

    fn scoped_url(&self, relative: &str, query: Option<&str>) -> Option<String> {
        let mut url = self.scope.join(&format!("./{relative}")).ok()?;
        url.set_query(query);
        Some(url.into())
    }

    fn origin_url(&self, relative: &str, query: Option<&str>) -> Option<String> {
        let mut url = self.scope.join(&format!("/{relative}")).ok()?;
        url.set_query(query);
        Some(url.into())
    }

    fn note_version_skew(&self, request: &FetchRequest) {
        let Some(raw) = request.header(RULES_VERSION_HEADER) else {
            return;
        };
        match raw.trim().parse::<u32>() {
            Ok(page_version) if page_version != self.table.version() => info!(
                page_version,
                worker_version = self.table.version(),
                "rule table version skew; handling with worker rules"
            ),
            Ok(_) => {}
            Err(_) => debug!(header = raw, "unparseable rules version header"),
        }
    }
}

fn is_audio_file(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    AUDIO_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

fn last_segment_has_extension(path: &str) -> bool {
    path.rsplit('/')
        .next()
        .is_some_and(|segment| segment.contains('.'))
}
