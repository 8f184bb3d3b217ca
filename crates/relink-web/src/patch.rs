//! Runtime patch layer.
//!
//! `install` wraps each page capability in a decorator that routes URL
//! arguments through the rule table before delegating to the capability it
//! replaced. Every target is wrapped at most once per page; the registry
//! records which ones already are.
//!
//! Wrappers never make a request fail that would have succeeded unpatched:
//! rule evaluation is panic-guarded, and a failing rewritten call is retried
//! with the caller's original value.

use crate::dom::{AttributeGuard, Document, DomError, Element, NodeId};
use crate::fetch::{Fetch, FetchError, FetchRequest, FetchResponse};
use crate::mock::MockEndpoints;
use crate::page::{CreateElement, Page, SetAttribute, XhrOpen, XhrRequest};
use relink_core::RuleTable;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Legacy hotfix scripts superseded by this layer. Loading one next to it
/// would rewrite paths a second time with different rules.
pub const DEFAULT_QUARANTINED_SCRIPTS: &[&str] = &[
    "ipfs-fix.js",
    "fix-ipfs-paths.js",
    "emergency-fix.js",
    "path-hotfix.js",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PatchTarget {
    Fetch,
    XhrOpen,
    SetAttribute,
    CreateElement,
}

impl PatchTarget {
    pub const ALL: [PatchTarget; 4] = [
        PatchTarget::Fetch,
        PatchTarget::XhrOpen,
        PatchTarget::SetAttribute,
        PatchTarget::CreateElement,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PatchTarget::Fetch => "fetch",
            PatchTarget::XhrOpen => "xhr.open",
            PatchTarget::SetAttribute => "setAttribute",
            PatchTarget::CreateElement => "createElement",
        }
    }
}

/// Set-once flags, one per target. Never cleared for the page's lifetime.
#[derive(Debug, Clone, Default)]
pub struct PatchRegistry {
    installed: BTreeSet<PatchTarget>,
}

impl PatchRegistry {
    pub fn is_installed(&self, target: PatchTarget) -> bool {
        self.installed.contains(&target)
    }

    pub fn installed(&self) -> impl Iterator<Item = PatchTarget> + '_ {
        self.installed.iter().copied()
    }

    /// Marks `target` installed; false if it already was.
    fn claim(&mut self, target: PatchTarget) -> bool {
        self.installed.insert(target)
    }
}

#[derive(Debug, Clone)]
pub struct PatchOptions {
    pub table: Arc<RuleTable>,
    pub mocks: MockEndpoints,
    pub quarantined_scripts: Vec<String>,
}

impl PatchOptions {
    pub fn new(table: Arc<RuleTable>) -> Self {
        Self {
            table,
            mocks: MockEndpoints::default(),
            quarantined_scripts: DEFAULT_QUARANTINED_SCRIPTS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    pub fn with_mocks(mut self, mocks: MockEndpoints) -> Self {
        self.mocks = mocks;
        self
    }

    pub fn with_quarantine<I, S>(mut self, scripts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.quarantined_scripts = scripts.into_iter().map(Into::into).collect();
        self
    }
}

impl Default for PatchOptions {
    fn default() -> Self {
        Self::new(Arc::new(RuleTable::standard()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallReport {
    /// False when the page is not on a recognized gateway host.
    pub active: bool,
    pub installed: Vec<PatchTarget>,
    pub skipped: Vec<PatchTarget>,
}

pub fn install(page: &mut Page, options: &PatchOptions) -> InstallReport {
    let hostname = page.location().hostname().to_string();
    if !options.table.hosts().recognizes(&hostname) {
        debug!(hostname = %hostname, "not a gateway host; runtime patches not installed");
        return InstallReport::default();
    }

    let mut report = InstallReport {
        active: true,
        ..InstallReport::default()
    };

    for target in PatchTarget::ALL {
        if !page.patches_mut().claim(target) {
            debug!(target = target.as_str(), "already patched; skipping");
            report.skipped.push(target);
            continue;
        }

        let table = Arc::clone(&options.table);
        match target {
            PatchTarget::Fetch => {
                let mocks = options.mocks.clone();
                page.wrap_fetch(|inner| {
                    Arc::new(RewritingFetch {
                        inner,
                        table,
                        mocks,
                    })
                });
            }
            PatchTarget::XhrOpen => {
                page.wrap_xhr(|inner| Arc::new(RewritingXhr { inner, table }));
            }
            PatchTarget::SetAttribute => {
                page.wrap_set_attribute(|inner| Arc::new(RewritingSetAttribute { inner, table }));
            }
            PatchTarget::CreateElement => {
                let quarantine = Arc::new(ScriptQuarantine::new(&options.quarantined_scripts));
                page.wrap_create_element(|inner| {
                    Arc::new(QuarantiningCreateElement { inner, quarantine })
                });
            }
        }
        report.installed.push(target);
    }

    if !report.installed.is_empty() {
        info!(
            hostname = %hostname,
            rules_version = options.table.version(),
            installed = report.installed.len(),
            "runtime patches installed"
        );
    }
    report
}

struct RewritingFetch {
    inner: Arc<dyn Fetch>,
    table: Arc<RuleTable>,
    mocks: MockEndpoints,
}

impl Fetch for RewritingFetch {
    fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError> {
        let url = self.table.resolve_guarded(&request.url);
        if let Some(response) = self.mocks.respond(&url) {
            return Ok(response);
        }
        if url == request.url {
            return self.inner.fetch(request);
        }

        match self.inner.fetch(&request.with_url(url.as_str())) {
            Ok(response) => Ok(response),
            Err(err) => {
                warn!(original = %request.url, rewritten = %url, error = %err, "rewritten fetch failed; retrying original");
                self.inner.fetch(request)
            }
        }
    }
}

struct RewritingXhr {
    inner: Arc<dyn XhrOpen>,
    table: Arc<RuleTable>,
}

impl XhrOpen for RewritingXhr {
    fn open(&self, method: &str, url: &str) -> Result<XhrRequest, FetchError> {
        let rewritten = self.table.resolve_guarded(url);
        if rewritten == url {
            return self.inner.open(method, url);
        }
        self.inner.open(method, &rewritten).or_else(|err| {
            warn!(original = url, rewritten = %rewritten, error = %err, "rewritten xhr.open failed; retrying original");
            self.inner.open(method, url)
        })
    }
}

struct RewritingSetAttribute {
    inner: Arc<dyn SetAttribute>,
    table: Arc<RuleTable>,
}

impl SetAttribute for RewritingSetAttribute {
    fn set_attribute(
        &self,
        document: &mut Document,
        node: NodeId,
        name: &str,
        value: &str,
    ) -> Result<(), DomError> {
        let is_url = name.eq_ignore_ascii_case("src") || name.eq_ignore_ascii_case("href");
        let rewritten = if is_url {
            self.table.resolve_guarded(value)
        } else {
            value.to_string()
        };
        if rewritten == value {
            return self.inner.set_attribute(document, node, name, value);
        }

        match self.inner.set_attribute(document, node, name, &rewritten) {
            Err(err @ DomError::Refused { .. }) => Err(err),
            Err(err) => {
                warn!(node, name, original = value, error = %err, "rewritten setAttribute failed; retrying original");
                self.inner.set_attribute(document, node, name, value)
            }
            ok => ok,
        }
    }
}

/// Refuses `src` values naming a quarantined script.
#[derive(Debug, Clone)]
pub struct ScriptQuarantine {
    identities: Vec<String>,
}

impl ScriptQuarantine {
    pub fn new(identities: &[String]) -> Self {
        Self {
            identities: identities
                .iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }
}

impl AttributeGuard for ScriptQuarantine {
    fn allows(&self, name: &str, value: &str) -> bool {
        if !name.eq_ignore_ascii_case("src") {
            return true;
        }
        match self.identities.iter().find(|id| value.contains(id.as_str())) {
            Some(id) => {
                warn!(src = value, identity = %id, "blocked quarantined script");
                false
            }
            None => true,
        }
    }
}

struct QuarantiningCreateElement {
    inner: Arc<dyn CreateElement>,
    quarantine: Arc<ScriptQuarantine>,
}

impl CreateElement for QuarantiningCreateElement {
    fn create_element(&self, tag: &str) -> Result<Element, DomError> {
        let mut element = self.inner.create_element(tag)?;
        if element.tag() == "script" {
            element.set_guard(Arc::clone(&self.quarantine) as Arc<dyn AttributeGuard>);
        }
        Ok(element)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::Location;
    use std::sync::Mutex;

    fn gateway_page(net: Arc<dyn Fetch>) -> Page {
        let loc = Location::parse("https://ipfs.io/ipfs/bafy/").expect("url");
        Page::new(loc, net)
    }

    fn recording() -> (Arc<Mutex<Vec<String>>>, Arc<dyn Fetch>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        let net = move |req: &FetchRequest| -> Result<FetchResponse, FetchError> {
            log.lock().expect("lock").push(req.url.clone());
            Ok(FetchResponse::ok(Vec::new(), "text/plain"))
        };
        (seen, Arc::new(net))
    }

    #[test]
    fn inactive_outside_gateway_hosts() {
        let (seen, net) = recording();
        let loc = Location::parse("https://example.com/").expect("url");
        let mut page = Page::new(loc, net);
        let report = install(&mut page, &PatchOptions::default());
        assert!(!report.active);
        assert!(report.installed.is_empty());

        page.fetch(&FetchRequest::get("/_next/a.js")).expect("fetch");
        assert_eq!(*seen.lock().expect("lock"), vec!["/_next/a.js".to_string()]);
    }

    #[test]
    fn fetch_is_rewritten() {
        let (seen, net) = recording();
        let mut page = gateway_page(net);
        let report = install(&mut page, &PatchOptions::default());
        assert_eq!(report.installed, PatchTarget::ALL.to_vec());

        page.fetch(&FetchRequest::get("/_next/static/chunk.js")).expect("fetch");
        page.fetch(&FetchRequest::get("/about")).expect("fetch");
        assert_eq!(
            *seen.lock().expect("lock"),
            vec!["./_next/static/chunk.js".to_string(), "/about".to_string()]
        );
    }

    #[test]
    fn failed_rewritten_fetch_retries_original() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        let net = move |req: &FetchRequest| -> Result<FetchResponse, FetchError> {
            log.lock().expect("lock").push(req.url.clone());
            if req.url.starts_with("./") {
                Err(FetchError::network(&req.url, "offline"))
            } else {
                Ok(FetchResponse::ok(b"orig".to_vec(), "text/plain"))
            }
        };
        let mut page = gateway_page(Arc::new(net));
        install(&mut page, &PatchOptions::default());

        let res = page.fetch(&FetchRequest::get("/images/a.png")).expect("fallback");
        assert_eq!(res.text(), "orig");
        assert_eq!(
            *seen.lock().expect("lock"),
            vec!["./images/a.png".to_string(), "/images/a.png".to_string()]
        );
    }

    #[test]
    fn xhr_open_is_rewritten() {
        let (_, net) = recording();
        let mut page = gateway_page(net);
        install(&mut page, &PatchOptions::default());
        let req = page.xhr_open("GET", "/api/api/data").expect("open");
        assert_eq!(req.url, "/api/data");
    }

    #[test]
    fn set_attribute_rewrites_urls_only() {
        let (_, net) = recording();
        let mut page = gateway_page(net);
        install(&mut page, &PatchOptions::default());

        let body = page.document().body();
        let img = page.create_element("img").expect("create");
        let id = page.append(body, img).expect("append");
        page.set_attribute(id, "src", "/images/me.png").expect("set");
        page.set_attribute(id, "alt", "/images/me.png").expect("set");
        let el = page.document().get(id).expect("node");
        assert_eq!(el.attribute("src"), Some("./images/me.png"));
        assert_eq!(el.attribute("alt"), Some("/images/me.png"));
    }

    #[test]
    fn quarantined_scripts_are_refused() {
        let (_, net) = recording();
        let mut page = gateway_page(net);
        install(
            &mut page,
            &PatchOptions::default().with_quarantine(["legacy-fix.js"]),
        );

        let head = page.document().head();
        let script = page.create_element("script").expect("create");
        assert!(script.is_guarded());
        let id = page.append(head, script).expect("append");
        let err = page
            .set_attribute(id, "src", "/scripts/legacy-fix.js")
            .expect_err("quarantined");
        assert!(matches!(err, DomError::Refused { .. }));
        page.set_attribute(id, "src", "/_next/static/app.js").expect("allowed");

        let div = page.create_element("div").expect("create");
        assert!(!div.is_guarded());
    }

    #[test]
    fn mocked_endpoint_short_circuits() {
        let (seen, net) = recording();
        let mut page = gateway_page(net);
        install(&mut page, &PatchOptions::default());
        let res = page.fetch(&FetchRequest::get("/api/api/github")).expect("mock");
        assert_eq!(res.header("x-relink-mock"), Some("github"));
        assert!(seen.lock().expect("lock").is_empty());
    }

    #[test]
    fn panicking_rule_falls_back_to_original_value() {
        fn always(_: &str, _: &RuleTable) -> bool {
            true
        }
        fn explode(_: &str, _: &RuleTable) -> String {
            panic!("broken")
        }
        let mut table = RuleTable::standard();
        table.push(relink_core::Rule::new("broken", always, explode));

        let (seen, net) = recording();
        let mut page = gateway_page(net);
        install(&mut page, &PatchOptions::new(Arc::new(table)));
        page.fetch(&FetchRequest::get("/about")).expect("fetch");
        assert_eq!(*seen.lock().expect("lock"), vec!["/about".to_string()]);
    }
}
