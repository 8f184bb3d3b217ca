//! relink web layers.
//!
//! Everything that turns the pure rule engine in `relink-core` into request
//! and markup repair:
//!
//! - `page` / `patch`: a page's capabilities and the decorators `install`
//!   wraps around them.
//! - `dom` / `reconcile`: a small document model and the reconciler that
//!   rewrites references already in it.
//! - `worker` / `registration`: the network boundary and its persisted
//!   registrations.
//! - `batch`: deploy-time correction of exported HTML.
//! - `adapters::axum` (feature `axum`): a gateway-style preview server.

#[cfg(feature = "axum")]
pub mod adapters;
pub mod batch;
pub mod config;
pub mod dom;
pub mod fetch;
pub mod mock;
pub mod page;
pub mod patch;
pub mod reconcile;
pub mod registration;
pub mod worker;

#[cfg(feature = "axum")]
pub use adapters::axum::{DirectoryFetch, GatewayAdapter, fetch_response_to_axum};
pub use batch::{
    BatchError, BatchOptions, BatchReport, correct_html, correct_tree, html_files, is_html_file,
    is_skipped_dir,
};
pub use config::{CONFIG_FILE_NAME, ConfigError, RelinkConfig};
pub use dom::{AttributeGuard, Document, DomError, Element, Mutation, NodeId};
pub use fetch::{Fetch, FetchError, FetchRequest, FetchResponse, RequestMode};
pub use mock::{GithubDataProvider, MockEndpoints, StaticGithubData};
pub use page::{CreateElement, Location, Page, SetAttribute, XhrOpen, XhrRequest};
pub use patch::{InstallReport, PatchOptions, PatchRegistry, PatchTarget, ScriptQuarantine, install};
pub use reconcile::{LifecycleEvent, ReconcileReport, Reconciler};
pub use registration::{
    FileRegistrations, MemoryRegistrations, Registration, RegistrationError, RegistrationOutcome,
    RegistrationStore, lookup, register,
};
pub use worker::{FetchEvent, Handled, RULES_VERSION_HEADER, ServiceWorker, WorkerConfig, WorkerRoute};
