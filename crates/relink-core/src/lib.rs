//! relink core crate.
//!
//! Pure path resolution for statically exported sites served from a root
//! that is unknown at build time (`/`, `/ipfs/<cid>/`, a gateway subdomain).
//!
//! - `rules`: the ordered, versioned rewrite table and `resolve`.
//! - `gateway`: gateway host recognition and absolute URL splitting.
//! - `css`: `url(...)` token scanning for inline style text.
//!
//! The one design rule every layer above depends on: `resolve` is total and
//! idempotent. Any input may be fed through it any number of times, from any
//! interception point, and the result after the first pass never changes.
//! Matching is done with substring operations only.

pub mod css;
pub mod gateway;
pub mod rules;

pub use css::{css_urls, has_font_face, rewrite_css_urls};
pub use gateway::{DEFAULT_GATEWAY_HOSTS, GatewayHosts, gateway_prefix, host_of, is_absolute_url};
pub use rules::{
    FontRoute, Matcher, RULES_VERSION, ResourceKind, Rewrite, Rule, RuleSettings, RuleTable,
    classify, collapse_api_prefix, collapse_doubled, is_font_file, resolve,
};
