//! Minimal document model: an arena of elements with attributes, text and a
//! queue of inserted subtrees.
//!
//! Only what the reconciler and the patch layer touch is modelled. Nodes are
//! addressed by [`NodeId`]; detached nodes live in the arena until attached.

use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub type NodeId = usize;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DomError {
    #[error("node {0} does not exist")]
    MissingNode(NodeId),

    #[error("invalid tag name '{0}'")]
    InvalidTag(String),

    #[error("node {0} already has a parent")]
    AlreadyAttached(NodeId),

    #[error("node {0} cannot be appended to itself or a descendant")]
    Cycle(NodeId),

    #[error("setting {name}=\"{value}\" on <{tag}> was refused")]
    Refused {
        tag: String,
        name: String,
        value: String,
    },
}

/// Per-element veto over attribute writes.
pub trait AttributeGuard: Send + Sync + fmt::Debug {
    fn allows(&self, name: &str, value: &str) -> bool;
}

#[derive(Debug, Clone)]
pub struct Element {
    tag: String,
    attributes: Vec<(String, String)>,
    text: String,
    children: Vec<NodeId>,
    parent: Option<NodeId>,
    guard: Option<Arc<dyn AttributeGuard>>,
}

impl Element {
    pub fn new(tag: &str) -> Result<Self, DomError> {
        let valid = tag
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic())
            && tag.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
        if !valid {
            return Err(DomError::InvalidTag(tag.to_string()));
        }
        Ok(Self::bare(tag))
    }

    fn bare(tag: &str) -> Self {
        Self {
            tag: tag.to_ascii_lowercase(),
            attributes: Vec::new(),
            text: String::new(),
            children: Vec::new(),
            parent: None,
            guard: None,
        }
    }

    /// Builder-style attribute for detached elements. Bypasses the guard.
    pub fn with_attribute(mut self, name: &str, value: &str) -> Self {
        self.put_attribute(name, value);
        self
    }

    pub fn with_text(mut self, text: &str) -> Self {
        self.text = text.to_string();
        self
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn attributes(&self) -> &[(String, String)] {
        &self.attributes
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn set_guard(&mut self, guard: Arc<dyn AttributeGuard>) {
        self.guard = Some(guard);
    }

    pub fn is_guarded(&self) -> bool {
        self.guard.is_some()
    }

    /// Attribute write honoring the element's guard.
    pub fn set_attribute(&mut self, name: &str, value: &str) -> Result<(), DomError> {
        if let Some(guard) = &self.guard {
            if !guard.allows(name, value) {
                return Err(DomError::Refused {
                    tag: self.tag.clone(),
                    name: name.to_string(),
                    value: value.to_string(),
                });
            }
        }
        self.put_attribute(name, value);
        Ok(())
    }

    fn put_attribute(&mut self, name: &str, value: &str) {
        let name = name.to_ascii_lowercase();
        match self.attributes.iter_mut().find(|(k, _)| *k == name) {
            Some((_, v)) => *v = value.to_string(),
            None => self.attributes.push((name, value.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Inserted { parent: NodeId, node: NodeId },
}

#[derive(Debug, Clone)]
pub struct Document {
    nodes: Vec<Element>,
    root: NodeId,
    head: NodeId,
    body: NodeId,
    observed: bool,
    mutations: Vec<Mutation>,
}

impl Document {
    /// `<html>` with an empty `<head>` and `<body>`.
    pub fn new() -> Self {
        let mut html = Element::bare("html");
        html.children = vec![1, 2];
        let mut head = Element::bare("head");
        head.parent = Some(0);
        let mut body = Element::bare("body");
        body.parent = Some(0);
        Self {
            nodes: vec![html, head, body],
            root: 0,
            head: 1,
            body: 2,
            observed: false,
            mutations: Vec::new(),
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn head(&self) -> NodeId {
        self.head
    }

    pub fn body(&self) -> NodeId {
        self.body
    }

    pub fn get(&self, id: NodeId) -> Option<&Element> {
        self.nodes.get(id)
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Element, DomError> {
        self.nodes.get_mut(id).ok_or(DomError::MissingNode(id))
    }

    /// Moves a detached element into the arena without attaching it.
    pub fn adopt(&mut self, mut element: Element) -> NodeId {
        element.parent = None;
        element.children.clear();
        self.nodes.push(element);
        self.nodes.len() - 1
    }

    pub fn append_child(&mut self, parent: NodeId, child: NodeId) -> Result<(), DomError> {
        if self.get(parent).is_none() {
            return Err(DomError::MissingNode(parent));
        }
        let node = self.get(child).ok_or(DomError::MissingNode(child))?;
        if node.parent.is_some() || child == self.root {
            return Err(DomError::AlreadyAttached(child));
        }
        if self.descendants(child).contains(&parent) {
            return Err(DomError::Cycle(child));
        }

        self.node_mut(child)?.parent = Some(parent);
        self.node_mut(parent)?.children.push(child);
        if self.observed && self.is_connected(parent) {
            self.mutations.push(Mutation::Inserted {
                parent,
                node: child,
            });
        }
        Ok(())
    }

    /// Adopts `element` and appends it under `parent`.
    pub fn insert(&mut self, parent: NodeId, element: Element) -> Result<NodeId, DomError> {
        if self.get(parent).is_none() {
            return Err(DomError::MissingNode(parent));
        }
        let id = self.adopt(element);
        self.append_child(parent, id)?;
        Ok(id)
    }

    pub fn set_attribute(&mut self, node: NodeId, name: &str, value: &str) -> Result<(), DomError> {
        self.node_mut(node)?.set_attribute(name, value)
    }

    pub fn set_text(&mut self, node: NodeId, text: &str) -> Result<(), DomError> {
        self.node_mut(node)?.text = text.to_string();
        Ok(())
    }

    pub fn is_connected(&self, node: NodeId) -> bool {
        let mut current = Some(node);
        while let Some(id) = current {
            if id == self.root {
                return true;
            }
            current = self.get(id).and_then(|el| el.parent);
        }
        false
    }

    /// `node` and everything below it, in document order.
    pub fn descendants(&self, node: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![node];
        while let Some(id) = stack.pop() {
            let Some(el) = self.get(id) else {
                continue;
            };
            out.push(id);
            stack.extend(el.children.iter().rev().copied());
        }
        out
    }

    /// Every connected element.
    pub fn elements(&self) -> Vec<NodeId> {
        self.descendants(self.root)
    }

    pub fn elements_by_tag(&self, tag: &str) -> Vec<NodeId> {
        self.elements()
            .into_iter()
            .filter(|id| self.get(*id).is_some_and(|el| el.tag.eq_ignore_ascii_case(tag)))
            .collect()
    }

    /// Starts recording insertions under the connected tree. Idempotent.
    pub fn observe(&mut self) {
        self.observed = true;
    }

    pub fn is_observed(&self) -> bool {
        self.observed
    }

    pub fn take_mutations(&mut self) -> Vec<Mutation> {
        std::mem::take(&mut self.mutations)
    }

    pub fn to_html(&self) -> String {
        let mut out = String::new();
        self.write_html(self.root, &mut out);
        out
    }

    fn write_html(&self, id: NodeId, out: &mut String) {
        let Some(el) = self.get(id) else {
            return;
        };
        out.push('<');
        out.push_str(&el.tag);
        for (k, v) in &el.attributes {
            out.push_str(&format!(" {k}=\"{}\"", escape_attr(v)));
        }
        out.push('>');
        if !el.text.is_empty() {
            if matches!(el.tag.as_str(), "style" | "script") {
                out.push_str(&el.text);
            } else {
                out.push_str(&escape_text(&el.text));
            }
        }
        for child in &el.children {
            self.write_html(*child, out);
        }
        if !is_void(&el.tag) {
            out.push_str(&format!("</{}>", el.tag));
        }
    }
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

fn is_void(tag: &str) -> bool {
    matches!(tag, "link" | "meta" | "img" | "br" | "hr" | "input" | "source")
}

fn escape_text(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn escape_attr(input: &str) -> String {
    escape_text(input).replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct DenyAll;

    impl AttributeGuard for DenyAll {
        fn allows(&self, _name: &str, _value: &str) -> bool {
            false
        }
    }

    #[test]
    fn insert_records_mutations_only_when_observed() {
        let mut doc = Document::new();
        let head = doc.head();
        doc.insert(head, Element::new("link").expect("tag")).expect("insert");
        assert!(doc.take_mutations().is_empty());

        doc.observe();
        let id = doc.insert(head, Element::new("link").expect("tag")).expect("insert");
        assert_eq!(
            doc.take_mutations(),
            vec![Mutation::Inserted { parent: head, node: id }]
        );
        assert!(doc.take_mutations().is_empty());
    }

    #[test]
    fn detached_subtree_reports_on_connect_only() {
        let mut doc = Document::new();
        doc.observe();
        let wrapper = doc.adopt(Element::new("div").expect("tag"));
        let img = doc.insert(wrapper, Element::new("img").expect("tag")).expect("insert");
        assert!(doc.take_mutations().is_empty());
        assert!(!doc.is_connected(img));

        let body = doc.body();
        doc.append_child(body, wrapper).expect("append");
        assert_eq!(doc.take_mutations().len(), 1);
        assert!(doc.is_connected(img));
        assert_eq!(doc.descendants(wrapper), vec![wrapper, img]);
    }

    #[test]
    fn append_rejects_reparenting_and_cycles() {
        let mut doc = Document::new();
        let body = doc.body();
        let div = doc.insert(body, Element::new("div").expect("tag")).expect("insert");
        assert_eq!(doc.append_child(doc.head(), div), Err(DomError::AlreadyAttached(div)));

        let outer = doc.adopt(Element::new("div").expect("tag"));
        let inner = doc.insert(outer, Element::new("span").expect("tag")).expect("insert");
        let err = doc.append_child(inner, outer).expect_err("cycle");
        assert!(matches!(err, DomError::AlreadyAttached(_) | DomError::Cycle(_)));
        assert_eq!(doc.append_child(99, outer), Err(DomError::MissingNode(99)));
    }

    #[test]
    fn guard_refuses_attribute_writes() {
        let mut el = Element::new("script").expect("tag");
        el.set_guard(Arc::new(DenyAll));
        let err = el.set_attribute("src", "/x.js").expect_err("refused");
        assert!(matches!(err, DomError::Refused { .. }));
        assert_eq!(el.attribute("src"), None);
    }

    #[test]
    fn invalid_tags_are_rejected() {
        assert!(Element::new("").is_err());
        assert!(Element::new("1div").is_err());
        assert!(Element::new("my-widget").is_ok());
    }

    #[test]
    fn serializes_tree() {
        let mut doc = Document::new();
        let head = doc.head();
        doc.insert(
            head,
            Element::new("link")
                .expect("tag")
                .with_attribute("rel", "preload")
                .with_attribute("HREF", "/a&b.woff2"),
        )
        .expect("insert");
        assert_eq!(
            doc.to_html(),
            r#"<html><head><link rel="preload" href="/a&amp;b.woff2"></head><body></body></html>"#
        );
        assert_eq!(doc.elements_by_tag("LINK").len(), 1);
    }
}
