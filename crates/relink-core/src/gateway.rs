//! Gateway host recognition and URL splitting.
//!
//! Everything here works on plain substring operations plus `url::Url` for
//! host extraction. Nothing is matched with patterns.

use url::Url;

/// Hosts that serve content-addressed exports under an unknown prefix.
///
/// A host also matches every subdomain of itself, so `dweb.link` covers
/// `<cid>.ipfs.dweb.link`. `localhost` is listed so local preview servers
/// activate the same behavior as a real gateway.
pub const DEFAULT_GATEWAY_HOSTS: &[&str] = &[
    "ipfs.io",
    "dweb.link",
    "cloudflare-ipfs.com",
    "gateway.pinata.cloud",
    "w3s.link",
    "nftstorage.link",
    "fleek.co",
    "on-fleek.app",
    "fleek.xyz",
    "localhost",
    "127.0.0.1",
];

const CONTENT_NAMESPACES: [&str; 2] = ["/ipfs/", "/ipns/"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayHosts {
    hosts: Vec<String>,
}

impl GatewayHosts {
    pub fn standard() -> Self {
        Self {
            hosts: DEFAULT_GATEWAY_HOSTS.iter().map(|h| h.to_string()).collect(),
        }
    }

    pub fn with_extra<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut out = Self::standard();
        for host in extra {
            let normalized = normalize_host(host.as_ref());
            if !normalized.is_empty() && !out.hosts.contains(&normalized) {
                out.hosts.push(normalized);
            }
        }
        out
    }

    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    pub fn recognizes(&self, hostname: &str) -> bool {
        let host = normalize_host(hostname);
        if host.is_empty() {
            return false;
        }
        self.hosts.iter().any(|known| {
            host == *known
                || host
                    .strip_suffix(known.as_str())
                    .is_some_and(|sub| sub.ends_with('.'))
        })
    }

    /// True when `candidate` is an absolute URL on one of the known hosts.
    pub fn owns_url(&self, candidate: &str) -> bool {
        host_of(candidate).is_some_and(|host| self.recognizes(&host))
    }
}

impl Default for GatewayHosts {
    fn default() -> Self {
        Self::standard()
    }
}

fn normalize_host(raw: &str) -> String {
    raw.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// `scheme://...` or protocol-relative `//host/...`.
pub fn is_absolute_url(candidate: &str) -> bool {
    if candidate.starts_with("//") {
        return true;
    }
    let Some((scheme, _)) = candidate.split_once("://") else {
        return false;
    };
    let mut chars = scheme.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}

pub fn host_of(candidate: &str) -> Option<String> {
    if !is_absolute_url(candidate) {
        return None;
    }
    let parsed = if candidate.starts_with("//") {
        Url::parse(&format!("https:{candidate}"))
    } else {
        Url::parse(candidate)
    };
    parsed.ok()?.host_str().map(normalize_host)
}

/// The path (with query and fragment) of an absolute URL, starting at the
/// first `/` after the authority. `None` for relative input or a bare host.
pub fn path_of(candidate: &str) -> Option<&str> {
    if !is_absolute_url(candidate) {
        return None;
    }
    let after_scheme = match candidate.split_once("//") {
        Some((_, rest)) => rest,
        None => return None,
    };
    let slash = after_scheme.find('/')?;
    Some(&after_scheme[slash..])
}

/// Suffix of an absolute URL starting at the first embedded build marker.
///
/// Markers are tried in priority order, so a chunk path wins over a font or
/// image folder that happens to appear later in the same URL.
pub fn embedded_suffix<'a>(candidate: &'a str, markers: &[&str]) -> Option<&'a str> {
    let path = path_of(candidate)?;
    markers
        .iter()
        .find_map(|marker| path.find(marker).map(|idx| &path[idx..]))
}

/// Content-addressed prefix of a path: `/ipfs/<cid>/` or `/ipns/<name>/`.
///
/// Returns the prefix including its trailing slash. A path that names only
/// the root (`/ipfs/<cid>`) still yields `/ipfs/<cid>/`.
pub fn gateway_prefix(path: &str) -> Option<String> {
    for namespace in CONTENT_NAMESPACES {
        let Some(rest) = path.strip_prefix(namespace) else {
            continue;
        };
        let id = rest
            .split(|c: char| c == '/' || c == '?' || c == '#')
            .next()
            .unwrap_or_default();
        if id.is_empty() {
            return None;
        }
        return Some(format!("{namespace}{id}/"));
    }
    None
}
