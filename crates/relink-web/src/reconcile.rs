//! DOM reconciliation.
//!
//! Catches references the patch layer never sees: markup present before it
//! installed, elements inserted through paths that bypass `setAttribute`, and
//! `@font-face` rules inside `<style>` text. Writes go straight to the
//! document and only happen when the resolved value differs, so any number of
//! scans converge after the first.
//!
//! Like the patch layer, the reconciler stays inactive unless the page is
//! served from a recognized gateway host.

use crate::dom::{Document, Mutation, NodeId};
use crate::page::Location;
use relink_core::{RuleTable, has_font_face, rewrite_css_urls};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub const DEFAULT_HYDRATION_SETTLE: Duration = Duration::from_millis(1000);

const URL_ATTRIBUTES: [&str; 2] = ["src", "href"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Subtrees were inserted since the last drain.
    Mutations,
    Load,
    /// Fired once the framework has had time to hydrate after `Load`.
    HydrationSettled,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub scanned: usize,
    pub attributes: usize,
    pub styles: usize,
}

impl ReconcileReport {
    pub fn changed(&self) -> usize {
        self.attributes + self.styles
    }

    fn merge(&mut self, other: ReconcileReport) {
        self.scanned += other.scanned;
        self.attributes += other.attributes;
        self.styles += other.styles;
    }
}

#[derive(Debug, Clone)]
pub struct Reconciler {
    table: Arc<RuleTable>,
    settle: Duration,
    attached: bool,
}

impl Reconciler {
    pub fn new(table: Arc<RuleTable>) -> Self {
        Self {
            table,
            settle: DEFAULT_HYDRATION_SETTLE,
            attached: false,
        }
    }

    pub fn with_settle_delay(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Full scan, then subscribe to insertions. Attaching twice only rescans.
    /// Off a gateway host nothing is scanned and later events are ignored.
    pub fn attach(&mut self, location: &Location, document: &mut Document) -> ReconcileReport {
        if !self.table.hosts().recognizes(location.hostname()) {
            debug!(hostname = location.hostname(), "not a gateway host; reconciler inactive");
            return ReconcileReport::default();
        }
        if !self.attached {
            document.observe();
            self.attached = true;
        }
        let report = self.scan_all(document);
        if report.changed() > 0 {
            info!(
                attributes = report.attributes,
                styles = report.styles,
                "initial reconciliation rewrote references"
            );
        }
        report
    }

    /// Events after attach, with their delay from attach, for a driver loop.
    pub fn schedule(&self) -> Vec<(Duration, LifecycleEvent)> {
        vec![
            (Duration::ZERO, LifecycleEvent::Load),
            (self.settle, LifecycleEvent::HydrationSettled),
        ]
    }

    pub fn handle(&mut self, document: &mut Document, event: LifecycleEvent) -> ReconcileReport {
        if !self.attached {
            return ReconcileReport::default();
        }
        match event {
            LifecycleEvent::Mutations => {
                let roots: BTreeSet<NodeId> = document
                    .take_mutations()
                    .into_iter()
                    .map(|Mutation::Inserted { node, .. }| node)
                    .collect();
                let mut report = ReconcileReport::default();
                for root in roots {
                    if document.is_connected(root) {
                        report.merge(self.scan_subtree(document, root));
                    }
                }
                report
            }
            LifecycleEvent::Load | LifecycleEvent::HydrationSettled => {
                let report = self.scan_all(document);
                debug!(?event, changed = report.changed(), "lifecycle rescan");
                report
            }
        }
    }

    pub fn scan_all(&self, document: &mut Document) -> ReconcileReport {
        self.scan_subtree(document, document.root())
    }

    pub fn scan_subtree(&self, document: &mut Document, root: NodeId) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        for id in document.descendants(root) {
            report.scanned += 1;
            self.reconcile_node(document, id, &mut report);
        }
        report
    }

    fn reconcile_node(&self, document: &mut Document, id: NodeId, report: &mut ReconcileReport) {
        let Some(element) = document.get(id) else {
            return;
        };

        let mut writes = Vec::new();
        for name in URL_ATTRIBUTES {
            if let Some(value) = element.attribute(name) {
                if let Some(rewritten) = self.rewrite(value) {
                    writes.push((name, rewritten));
                }
            }
        }
        let style = (element.tag() == "style" && has_font_face(element.text()))
            .then(|| rewrite_css_urls(element.text(), |v| self.table.resolve_guarded(v)))
            .flatten();

        for (name, value) in writes {
            match document.set_attribute(id, name, &value) {
                Ok(()) => report.attributes += 1,
                Err(err) => debug!(node = id, name, error = %err, "reconciliation write skipped"),
            }
        }
        if let Some(css) = style {
            if document.set_text(id, &css).is_ok() {
                report.styles += 1;
            }
        }
    }

    fn rewrite(&self, value: &str) -> Option<String> {
        let out = self.table.resolve_guarded(value);
        (out != value).then_some(out)
    }
}
