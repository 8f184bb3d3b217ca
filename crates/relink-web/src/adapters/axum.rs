use crate::fetch::{
    Fetch, FetchError, FetchRequest, FetchResponse, RequestMode, content_type_for_path,
};
use crate::worker::{FetchEvent, RULES_VERSION_HEADER, ServiceWorker};
use axum::Router;
use axum::body::Body;
use axum::extract::State as AxumState;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Uri, header};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::get;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use url::Url;

/// Serves an export directory the way a gateway does: under its scope
/// (`/ipfs/<cid>/`) and nowhere else. Requests outside the scope are the
/// broken references the worker exists to catch.
#[derive(Debug, Clone)]
pub struct DirectoryFetch {
    root: PathBuf,
    scope: Url,
}

impl DirectoryFetch {
    pub fn new(root: impl Into<PathBuf>, scope: Url) -> Self {
        Self {
            root: root.into(),
            scope,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn file_for(&self, url: &Url) -> Option<PathBuf> {
        let rest = url.path().strip_prefix(self.scope.path())?;
        let rel = sanitize_rel_path(rest)?;
        let mut full = self.root.join(rel);
        if full.is_dir() || rest.is_empty() || rest.ends_with('/') {
            full = full.join("index.html");
        }
        full.is_file().then_some(full)
    }
}

impl Fetch for DirectoryFetch {
    fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError> {
        let url =
            Url::parse(&request.url).map_err(|_| FetchError::InvalidUrl(request.url.clone()))?;
        if url.origin() != self.scope.origin() {
            return Err(FetchError::network(
                &request.url,
                "preview server has no upstream network",
            ));
        }

        let Some(file) = self.file_for(&url) else {
            return Ok(FetchResponse::not_found());
        };
        let bytes = fs::read(&file).map_err(|e| {
            FetchError::network(&request.url, format!("failed to read {}: {e}", file.display()))
        })?;
        Ok(FetchResponse::ok(
            bytes,
            content_type_for_path(&file.to_string_lossy()),
        ))
    }
}

#[derive(Debug, Clone)]
pub struct GatewayAdapter {
    worker: Arc<ServiceWorker>,
    network: Arc<DirectoryFetch>,
}

impl GatewayAdapter {
    /// `origin` is what clients use to reach the server
    /// (`http://localhost:8080`); the export is mounted at `/ipfs/<cid>/`.
    pub fn new(
        root: impl Into<PathBuf>,
        origin: &str,
        cid: &str,
        table: relink_core::RuleTable,
    ) -> Result<Self, url::ParseError> {
        let scope = Url::parse(origin)?.join(&format!("/ipfs/{cid}/"))?;
        let worker = ServiceWorker::new(scope.as_str(), table)?;
        Ok(Self::from_worker(root, worker))
    }

    pub fn from_worker(root: impl Into<PathBuf>, worker: ServiceWorker) -> Self {
        let network = DirectoryFetch::new(root, worker.scope().clone());
        Self {
            worker: Arc::new(worker),
            network: Arc::new(network),
        }
    }

    pub fn worker(&self) -> &ServiceWorker {
        &self.worker
    }

    pub fn scope_path(&self) -> &str {
        self.worker.scope().path()
    }

    pub fn router(self) -> Router {
        Router::new()
            .route("/", get(route_root))
            .route("/{*path}", get(route_any))
            .with_state(Arc::new(self))
    }

    /// Answers one request through the worker, completing pass-through on
    /// the directory.
    pub async fn respond(&self, uri: &Uri, headers: &HeaderMap) -> Response {
        let path_and_query = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
        let Ok(url) = self.worker.scope().join(path_and_query) else {
            return (StatusCode::BAD_REQUEST, "invalid path").into_response();
        };

        let mut request = if is_navigation(headers) {
            FetchRequest::navigate(url.as_str())
        } else {
            FetchRequest::get(url.as_str())
        };
        if let Some(version) = headers
            .get(RULES_VERSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            request = request.with_header(RULES_VERSION_HEADER, version);
        }

        let worker = Arc::clone(&self.worker);
        let network = Arc::clone(&self.network);
        let outcome = tokio::task::spawn_blocking(move || {
            let handled = worker.handle(FetchEvent::new(request), network.as_ref());
            handled.complete(network.as_ref())
        })
        .await;

        match outcome {
            Ok(Ok(response)) => fetch_response_to_axum(response),
            Ok(Err(err)) => (StatusCode::BAD_GATEWAY, err.to_string()).into_response(),
            Err(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("worker task failed: {err}"),
            )
                .into_response(),
        }
    }
}

async fn route_root(AxumState(adapter): AxumState<Arc<GatewayAdapter>>) -> Response {
    Redirect::temporary(adapter.scope_path()).into_response()
}

async fn route_any(
    uri: Uri,
    headers: HeaderMap,
    AxumState(adapter): AxumState<Arc<GatewayAdapter>>,
) -> Response {
    adapter.respond(&uri, &headers).await
}

fn is_navigation(headers: &HeaderMap) -> bool {
    let value_of = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
    };
    value_of("sec-fetch-mode").eq_ignore_ascii_case("navigate")
        || value_of(header::ACCEPT.as_str()).contains("text/html")
}

pub fn fetch_response_to_axum(res: FetchResponse) -> Response {
    let mut response = Body::from(res.body).into_response();
    *response.status_mut() = StatusCode::from_u16(res.status).unwrap_or(StatusCode::OK);
    for (name, value) in &res.headers {
        if let (Ok(header_name), Ok(header_value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::from_str(value),
        ) {
            response.headers_mut().insert(header_name, header_value);
        }
    }
    response
}

fn sanitize_rel_path(path: &str) -> Option<PathBuf> {
    let trimmed = path.trim_start_matches('/');
    let rel = PathBuf::from(trimmed);
    for comp in rel.components() {
        if matches!(
            comp,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        ) {
            return None;
        }
    }
    Some(rel)
}
