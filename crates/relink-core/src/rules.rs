use crate::gateway::{GatewayHosts, embedded_suffix, is_absolute_url};
use serde::{Deserialize, Serialize};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::OnceLock;

/// Bumped whenever a rule's output changes for some input. Pages and workers
/// built from different versions may disagree on a path, never on safety.
pub const RULES_VERSION: u32 = 3;

const NEXT_DIR: &str = "_next/";
const NEXT_MEDIA_DIR: &str = "_next/static/media/";
const FONTS_DIR: &str = "fonts/";
const IMAGES_DIR: &str = "images/";
const API_ROOT: &str = "/api";
const FONT_EXTENSIONS: [&str; 5] = [".woff2", ".woff", ".ttf", ".otf", ".eot"];
const GATEWAY_MARKERS: [&str; 3] = ["/_next/", "/fonts/", "/images/"];

static STANDARD_TABLE: OnceLock<RuleTable> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResourceKind {
    FrameworkChunk,
    FontAsset,
    StaticAsset,
    ApiCall,
    GatewayAbsolute,
    Other,
}

/// Where root-absolute font references end up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum FontRoute {
    /// `/_next/static/media/x.woff2` → `./_next/static/media/x.woff2`
    #[default]
    NextMedia,
    /// `/_next/static/media/x.woff2` → `./fonts/x.woff2`
    Fonts,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RuleSettings {
    #[serde(default)]
    pub font_route: FontRoute,
    #[serde(default)]
    pub gateway_hosts: Vec<String>,
}

pub type Matcher = fn(candidate: &str, table: &RuleTable) -> bool;
pub type Rewrite = fn(candidate: &str, table: &RuleTable) -> String;

#[derive(Debug, Clone, Copy)]
pub struct Rule {
    pub name: &'static str,
    pub matcher: Matcher,
    pub rewrite: Rewrite,
}

impl Rule {
    pub const fn new(name: &'static str, matcher: Matcher, rewrite: Rewrite) -> Self {
        Self {
            name,
            matcher,
            rewrite,
        }
    }
}

/// Ordered rewrite rules plus the settings they read. First match wins.
#[derive(Debug, Clone)]
pub struct RuleTable {
    version: u32,
    font_route: FontRoute,
    hosts: GatewayHosts,
    rules: Vec<Rule>,
}

impl RuleTable {
    pub fn standard() -> Self {
        Self {
            version: RULES_VERSION,
            font_route: FontRoute::default(),
            hosts: GatewayHosts::standard(),
            rules: standard_rules(),
        }
    }

    pub fn from_settings(settings: &RuleSettings) -> Self {
        Self {
            version: RULES_VERSION,
            font_route: settings.font_route,
            hosts: GatewayHosts::with_extra(&settings.gateway_hosts),
            rules: standard_rules(),
        }
    }

    pub fn with_font_route(mut self, route: FontRoute) -> Self {
        self.font_route = route;
        self
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn font_route(&self) -> FontRoute {
        self.font_route
    }

    pub fn hosts(&self) -> &GatewayHosts {
        &self.hosts
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Appends a rule after the standard ones. A custom rule must keep the
    /// table idempotent: its output may not be matched again by any rule.
    pub fn push(&mut self, rule: Rule) {
        self.rules.push(rule);
    }

    pub fn classify(&self, candidate: &str) -> ResourceKind {
        classify_with(candidate, &self.hosts)
    }

    pub fn resolve(&self, candidate: &str) -> String {
        for rule in &self.rules {
            if (rule.matcher)(candidate, self) {
                return (rule.rewrite)(candidate, self);
            }
        }
        candidate.to_string()
    }

    /// `Some(rewritten)` only when the table changes `candidate`.
    pub fn rewrite(&self, candidate: &str) -> Option<String> {
        let out = self.resolve(candidate);
        (out != candidate).then_some(out)
    }

    /// Like [`RuleTable::resolve`], but a panicking rule yields the input
    /// unchanged instead of unwinding into the caller.
    pub fn resolve_guarded(&self, candidate: &str) -> String {
        match catch_unwind(AssertUnwindSafe(|| self.resolve(candidate))) {
            Ok(out) => out,
            Err(_) => {
                tracing::warn!(candidate, "rewrite rule panicked; keeping original value");
                candidate.to_string()
            }
        }
    }
}

impl Default for RuleTable {
    fn default() -> Self {
        Self::standard()
    }
}

/// Resolves against the process-wide standard table.
pub fn resolve(candidate: &str) -> String {
    STANDARD_TABLE.get_or_init(RuleTable::standard).resolve(candidate)
}

pub fn classify(candidate: &str) -> ResourceKind {
    STANDARD_TABLE
        .get_or_init(RuleTable::standard)
        .classify(candidate)
}

fn standard_rules() -> Vec<Rule> {
    vec![
        Rule::new("already-relative", is_already_relative, keep),
        Rule::new("gateway-absolute", is_gateway_embedded, rewrite_gateway_embedded),
        Rule::new("doubled-segment", is_doubled_segment, rewrite_doubled_segment),
        Rule::new("api-double-prefix", is_api_double_prefix, rewrite_api_double_prefix),
        Rule::new("rooted-asset", is_rooted_asset, rewrite_rooted_asset),
    ]
}

fn classify_with(candidate: &str, hosts: &GatewayHosts) -> ResourceKind {
    if is_absolute_url(candidate) {
        return if hosts.owns_url(candidate) {
            ResourceKind::GatewayAbsolute
        } else {
            ResourceKind::Other
        };
    }

    let (bare, _) = split_suffix(candidate);
    if is_font_file(bare) {
        return ResourceKind::FontAsset;
    }
    if let Some(rooted) = bare.strip_prefix('/') {
        if rooted == "api" || rooted.starts_with("api/") {
            return ResourceKind::ApiCall;
        }
    }

    let local = strip_relative_prefix(bare);
    if local.starts_with(NEXT_DIR) {
        ResourceKind::FrameworkChunk
    } else if local.starts_with(IMAGES_DIR) {
        ResourceKind::StaticAsset
    } else {
        ResourceKind::Other
    }
}

fn keep(candidate: &str, _table: &RuleTable) -> String {
    candidate.to_string()
}

fn is_already_relative(candidate: &str, _table: &RuleTable) -> bool {
    candidate.starts_with("./")
}

fn is_gateway_embedded(candidate: &str, table: &RuleTable) -> bool {
    table.hosts.owns_url(candidate) && embedded_suffix(candidate, &GATEWAY_MARKERS).is_some()
}

fn rewrite_gateway_embedded(candidate: &str, table: &RuleTable) -> String {
    match embedded_suffix(candidate, &GATEWAY_MARKERS) {
        Some(suffix) => normalize_local(suffix, table),
        None => candidate.to_string(),
    }
}

fn is_doubled_segment(candidate: &str, _table: &RuleTable) -> bool {
    !is_absolute_url(candidate) && collapse_doubled(candidate).is_some()
}

fn rewrite_doubled_segment(candidate: &str, table: &RuleTable) -> String {
    normalize_local(candidate, table)
}

fn is_api_double_prefix(candidate: &str, _table: &RuleTable) -> bool {
    collapse_api_prefix(candidate).is_some()
}

fn rewrite_api_double_prefix(candidate: &str, _table: &RuleTable) -> String {
    collapse_api_prefix(candidate).unwrap_or_else(|| candidate.to_string())
}

fn is_rooted_asset(candidate: &str, table: &RuleTable) -> bool {
    rooted_asset_target(candidate, table.font_route).is_some()
}

fn rewrite_rooted_asset(candidate: &str, table: &RuleTable) -> String {
    rooted_asset_target(candidate, table.font_route).unwrap_or_else(|| candidate.to_string())
}

/// Runs a local (non-absolute) path through every normalization step so the
/// result is a fixed point of the table.
fn normalize_local(path: &str, table: &RuleTable) -> String {
    let collapsed = collapse_doubled(path).unwrap_or_else(|| path.to_string());
    if let Some(api) = collapse_api_prefix(&collapsed) {
        return api;
    }
    rooted_asset_target(&collapsed, table.font_route).unwrap_or(collapsed)
}

/// Removes a duplicated build directory.
///
/// `_next/` may only appear once in a real path, so everything between its
/// first and last segment-aligned occurrence is dropped. `fonts/` and
/// `images/` are collapsed only when repeated back to back, since nested
/// folders of those names are legitimate.
pub fn collapse_doubled(path: &str) -> Option<String> {
    let (bare, tail) = split_suffix(path);
    let mut out = bare.to_string();
    let mut changed = false;

    let next_positions = segment_positions(&out, NEXT_DIR);
    if let (Some(first), Some(last)) = (next_positions.first(), next_positions.last()) {
        if first != last {
            out = format!("{}{}", &out[..*first], &out[*last..]);
            changed = true;
        }
    }

    for dir in [FONTS_DIR, IMAGES_DIR] {
        let doubled = format!("{dir}{dir}");
        while let Some(pos) = segment_positions(&out, &doubled).first().copied() {
            out.replace_range(pos..pos + dir.len(), "");
            changed = true;
        }
    }

    changed.then(|| format!("{out}{tail}"))
}

/// `/api/api/...` (any number of repeats) → `/api/...`.
pub fn collapse_api_prefix(path: &str) -> Option<String> {
    let mut current = path;
    while let Some(rest) = current.strip_prefix(API_ROOT) {
        let repeated = rest.strip_prefix(API_ROOT).is_some_and(|after| {
            after.is_empty() || after.starts_with('/') || after.starts_with('?')
        });
        if !repeated {
            break;
        }
        current = rest;
    }
    (current.len() != path.len()).then(|| current.to_string())
}

fn rooted_asset_target(path: &str, route: FontRoute) -> Option<String> {
    if path.starts_with("//") {
        return None;
    }
    let rest = path.strip_prefix('/')?;
    let (bare, tail) = split_suffix(rest);
    // API routes stay root-absolute whatever their file name looks like.
    if bare == "api" || bare.starts_with("api/") {
        return None;
    }

    if is_font_file(bare) {
        if route == FontRoute::Fonts && bare.starts_with(NEXT_MEDIA_DIR) {
            let file = bare.rsplit('/').next().unwrap_or(bare);
            return Some(format!("./{FONTS_DIR}{file}{tail}"));
        }
        return Some(format!("./{rest}"));
    }

    if bare.starts_with(NEXT_DIR) || bare.starts_with(FONTS_DIR) || bare.starts_with(IMAGES_DIR) {
        return Some(format!("./{rest}"));
    }
    None
}

/// Byte offsets where `needle` starts on a segment boundary.
fn segment_positions(haystack: &str, needle: &str) -> Vec<usize> {
    haystack
        .match_indices(needle)
        .map(|(idx, _)| idx)
        .filter(|idx| *idx == 0 || haystack.as_bytes()[idx - 1] == b'/')
        .collect()
}

/// Splits `path?query#fragment` into the path and the rest.
fn split_suffix(path: &str) -> (&str, &str) {
    match path.find(|c: char| c == '?' || c == '#') {
        Some(idx) => path.split_at(idx),
        None => (path, ""),
    }
}

fn strip_relative_prefix(path: &str) -> &str {
    let mut current = path.trim_start_matches('/');
    loop {
        if let Some(rest) = current.strip_prefix("./") {
            current = rest;
        } else if let Some(rest) = current.strip_prefix("../") {
            current = rest;
        } else {
            return current;
        }
    }
}

pub fn is_font_file(path: &str) -> bool {
    let (bare, _) = split_suffix(path);
    let lower = bare.to_ascii_lowercase();
    FONT_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const CORPUS: &[&str] = &[
        "",
        "/",
        "/about",
        "#projects",
        "mailto:me@example.com",
        "data:font/woff2;base64,d09GMgABAAAA",
        "./_next/static/chunk.js",
        "./fonts/inter.woff2",
        "../_next/static/css/_next/static/media/inter.woff2",
        "_next/static/css/_next/static/media/inter.woff2",
        "/_next/static/chunk.js",
        "/_next/static/chunk.js?v=2#top",
        "/_next/static/css/app.css",
        "/_next/static/css/_next/static/media/inter.woff2",
        "/_next/static/media/abc.woff2",
        "/_next/static/media/nested/abc.woff2?x=1",
        "/fonts/inter.ttf",
        "/fonts/fonts/inter.ttf",
        "/images/avatar.png",
        "/images/images/images/avatar.png",
        "/images/gallery/images/photo.png",
        "/assets/icons.woff",
        "/api/github",
        "/api/api/github",
        "/api/api/api/github?user=me",
        "/api/api",
        "/api/api/x.woff2",
        "/api/api/_next/a/_next/b.woff2",
        "/api/_next/static/chunk.js",
        "/apiary/api/x",
        "//cdn.example.com/_next/static/a.js",
        "https://ipfs.io/ipfs/bafy/_next/static/chunk.js",
        "https://bafy.ipfs.dweb.link/_next/static/css/_next/static/media/inter.woff2",
        "https://ipfs.io/ipfs/bafy/fonts/inter.woff2",
        "https://ipfs.io/ipfs/bafy/images/images/a.png",
        "https://ipfs.io/ipfs/bafy/api/api/github",
        "https://ipfs.io/ipfs/bafy/about",
        "https://example.com/_next/static/chunk.js",
    ];

    #[test]
    fn resolve_is_idempotent_over_corpus() {
        for table in [
            RuleTable::standard(),
            RuleTable::standard().with_font_route(FontRoute::Fonts),
        ] {
            for input in CORPUS {
                let once = table.resolve(input);
                let twice = table.resolve(&once);
                assert_eq!(once, twice, "not idempotent for {input:?}");
            }
        }
    }

    #[test]
    fn already_relative_input_is_untouched() {
        let table = RuleTable::standard().with_font_route(FontRoute::Fonts);
        for input in CORPUS.iter().filter(|s| s.starts_with("./")) {
            assert_eq!(table.resolve(input), *input);
        }
        assert_eq!(
            resolve("./_next/static/css/_next/static/media/x.woff2"),
            "./_next/static/css/_next/static/media/x.woff2"
        );
    }

    #[test]
    fn api_double_prefix_collapses() {
        assert_eq!(resolve("/api/api/github"), "/api/github");
        assert_eq!(resolve("/api/api/api/github?user=me"), "/api/github?user=me");
        assert_eq!(resolve("/api/api"), "/api");
        assert_eq!(resolve("/api/github"), "/api/github");
        assert_eq!(resolve("/apiary/api/x"), "/apiary/api/x");
    }

    #[test]
    fn api_paths_are_never_made_relative() {
        assert_eq!(resolve("/api/api/x.woff2"), "/api/x.woff2");
        assert_eq!(resolve("/api/x.woff2"), "/api/x.woff2");
        assert_eq!(resolve("/api/api/_next/a/_next/b.woff2"), "/api/_next/b.woff2");
        assert_eq!(resolve("/api/_next/static/chunk.js"), "/api/_next/static/chunk.js");
    }

    #[test]
    fn root_absolute_chunks_become_relative() {
        assert_eq!(resolve("/_next/static/chunk.js"), "./_next/static/chunk.js");
        assert_eq!(
            resolve("/_next/static/chunk.js?v=2#top"),
            "./_next/static/chunk.js?v=2#top"
        );
        assert_eq!(resolve("/images/avatar.png"), "./images/avatar.png");
        assert_eq!(resolve("/assets/icons.woff"), "./assets/icons.woff");
    }

    #[test]
    fn unknown_shapes_pass_through() {
        for input in [
            "",
            "/",
            "/about",
            "#projects",
            "mailto:me@example.com",
            "//cdn.example.com/_next/static/a.js",
            "https://example.com/_next/static/chunk.js",
            "https://ipfs.io/ipfs/bafy/about",
        ] {
            assert_eq!(resolve(input), input);
        }
    }

    #[test]
    fn doubled_font_path_collapses_to_single_media_suffix() {
        let out = resolve("/_next/static/css/_next/static/media/font.woff2");
        assert_eq!(out, "./_next/static/media/font.woff2");
        assert_eq!(out.matches("_next/").count(), 1);

        assert_eq!(
            resolve("../_next/static/css/_next/static/media/font.woff2"),
            "../_next/static/media/font.woff2"
        );
        assert_eq!(resolve("/fonts/fonts/inter.ttf"), "./fonts/inter.ttf");
        assert_eq!(
            resolve("/images/images/images/avatar.png"),
            "./images/avatar.png"
        );
        assert_eq!(
            resolve("/images/gallery/images/photo.png"),
            "./images/gallery/images/photo.png"
        );
    }

    #[test]
    fn font_route_selects_destination() {
        let fonts = RuleTable::standard().with_font_route(FontRoute::Fonts);
        assert_eq!(fonts.resolve("/_next/static/media/abc.woff2"), "./fonts/abc.woff2");
        assert_eq!(
            fonts.resolve("/_next/static/media/nested/abc.woff2?x=1"),
            "./fonts/abc.woff2?x=1"
        );
        assert_eq!(
            fonts.resolve("/_next/static/css/_next/static/media/font.woff2"),
            "./fonts/font.woff2"
        );
        assert_eq!(
            resolve("/_next/static/media/abc.woff2"),
            "./_next/static/media/abc.woff2"
        );
    }

    #[test]
    fn gateway_absolute_urls_extract_embedded_path() {
        assert_eq!(
            resolve("https://ipfs.io/ipfs/bafy/_next/static/chunk.js"),
            "./_next/static/chunk.js"
        );
        assert_eq!(
            resolve("https://bafy.ipfs.dweb.link/_next/static/css/_next/static/media/inter.woff2"),
            "./_next/static/media/inter.woff2"
        );
        assert_eq!(
            resolve("https://ipfs.io/ipfs/bafy/images/images/a.png"),
            "./images/a.png"
        );
    }

    #[test]
    fn classification() {
        assert_eq!(classify("/_next/static/chunk.js"), ResourceKind::FrameworkChunk);
        assert_eq!(classify("/_next/static/media/a.woff2"), ResourceKind::FontAsset);
        assert_eq!(classify("./fonts/a.TTF"), ResourceKind::FontAsset);
        assert_eq!(classify("/images/a.png"), ResourceKind::StaticAsset);
        assert_eq!(classify("/api/github"), ResourceKind::ApiCall);
        assert_eq!(classify("/api"), ResourceKind::ApiCall);
        assert_eq!(
            classify("https://ipfs.io/ipfs/bafy/x.js"),
            ResourceKind::GatewayAbsolute
        );
        assert_eq!(classify("https://example.com/x.js"), ResourceKind::Other);
        assert_eq!(classify("/about"), ResourceKind::Other);
    }

    #[test]
    fn custom_rule_runs_after_standard_rules() {
        fn is_legacy(candidate: &str, _: &RuleTable) -> bool {
            candidate.starts_with("/static/")
        }
        fn to_relative(candidate: &str, _: &RuleTable) -> String {
            format!(".{candidate}")
        }

        let mut table = RuleTable::standard();
        table.push(Rule::new("legacy-static", is_legacy, to_relative));
        assert_eq!(table.resolve("/static/a.css"), "./static/a.css");
        assert_eq!(table.resolve("./static/a.css"), "./static/a.css");
        assert_eq!(table.rules().last().map(|r| r.name), Some("legacy-static"));
    }

    #[test]
    fn guarded_resolve_survives_panicking_rule() {
        fn always(_: &str, _: &RuleTable) -> bool {
            true
        }
        fn explode(_: &str, _: &RuleTable) -> String {
            panic!("broken rule")
        }

        let mut table = RuleTable::standard();
        table.rules.insert(0, Rule::new("broken", always, explode));
        assert_eq!(table.resolve_guarded("/_next/a.js"), "/_next/a.js");
    }

    #[test]
    fn rewrite_reports_only_changes() {
        let table = RuleTable::standard();
        assert_eq!(table.rewrite("/about"), None);
        assert_eq!(
            table.rewrite("/_next/a.js").as_deref(),
            Some("./_next/a.js")
        );
    }

    #[test]
    fn settings_deserialize_with_defaults() {
        let settings: RuleSettings =
            serde_json::from_str(r#"{"fontRoute":"fonts","gatewayHosts":["gw.example.org"]}"#)
                .expect("settings should parse");
        let table = RuleTable::from_settings(&settings);
        assert_eq!(table.font_route(), FontRoute::Fonts);
        assert!(table.hosts().recognizes("gw.example.org"));
        assert_eq!(table.version(), RULES_VERSION);

        let empty: RuleSettings = serde_json::from_str("{}").expect("empty settings parse");
        assert_eq!(empty.font_route, FontRoute::NextMedia);
    }
}
