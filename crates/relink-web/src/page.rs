//! A page's global context expressed as explicit capabilities.
//!
//! Each capability sits behind an `Arc<dyn _>` so the patch layer can wrap
//! the current one in a decorator and swap the wrapper in.

use crate::dom::{Document, DomError, Element, NodeId};
use crate::fetch::{Fetch, FetchError, FetchRequest, FetchResponse};
use crate::patch::PatchRegistry;
use std::sync::Arc;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    url: Url,
}

impl Location {
    pub fn parse(href: &str) -> Result<Self, url::ParseError> {
        Ok(Self {
            url: Url::parse(href)?,
        })
    }

    pub fn href(&self) -> &str {
        self.url.as_str()
    }

    pub fn hostname(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    pub fn path(&self) -> &str {
        self.url.path()
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XhrRequest {
    pub method: String,
    pub url: String,
}

pub trait XhrOpen: Send + Sync {
    fn open(&self, method: &str, url: &str) -> Result<XhrRequest, FetchError>;
}

pub trait SetAttribute: Send + Sync {
    fn set_attribute(
        &self,
        document: &mut Document,
        node: NodeId,
        name: &str,
        value: &str,
    ) -> Result<(), DomError>;
}

pub trait CreateElement: Send + Sync {
    fn create_element(&self, tag: &str) -> Result<Element, DomError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NativeXhr;

impl XhrOpen for NativeXhr {
    fn open(&self, method: &str, url: &str) -> Result<XhrRequest, FetchError> {
        if url.is_empty() {
            return Err(FetchError::InvalidUrl(url.to_string()));
        }
        Ok(XhrRequest {
            method: method.to_ascii_uppercase(),
            url: url.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NativeSetAttribute;

impl SetAttribute for NativeSetAttribute {
    fn set_attribute(
        &self,
        document: &mut Document,
        node: NodeId,
        name: &str,
        value: &str,
    ) -> Result<(), DomError> {
        document.set_attribute(node, name, value)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NativeCreateElement;

impl CreateElement for NativeCreateElement {
    fn create_element(&self, tag: &str) -> Result<Element, DomError> {
        Element::new(tag)
    }
}

pub struct Page {
    location: Location,
    document: Document,
    fetch: Arc<dyn Fetch>,
    xhr: Arc<dyn XhrOpen>,
    set_attribute: Arc<dyn SetAttribute>,
    create_element: Arc<dyn CreateElement>,
    patches: PatchRegistry,
}

impl Page {
    /// A page at `location` whose native network capability is `network`.
    pub fn new(location: Location, network: Arc<dyn Fetch>) -> Self {
        Self {
            location,
            document: Document::new(),
            fetch: network,
            xhr: Arc::new(NativeXhr),
            set_attribute: Arc::new(NativeSetAttribute),
            create_element: Arc::new(NativeCreateElement),
            patches: PatchRegistry::default(),
        }
    }

    pub fn with_document(mut self, document: Document) -> Self {
        self.document = document;
        self
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn document_mut(&mut self) -> &mut Document {
        &mut self.document
    }

    pub fn patches(&self) -> &PatchRegistry {
        &self.patches
    }

    pub(crate) fn patches_mut(&mut self) -> &mut PatchRegistry {
        &mut self.patches
    }

    pub fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError> {
        self.fetch.fetch(request)
    }

    pub fn xhr_open(&self, method: &str, url: &str) -> Result<XhrRequest, FetchError> {
        self.xhr.open(method, url)
    }

    pub fn set_attribute(&mut self, node: NodeId, name: &str, value: &str) -> Result<(), DomError> {
        let capability = Arc::clone(&self.set_attribute);
        capability.set_attribute(&mut self.document, node, name, value)
    }

    pub fn create_element(&self, tag: &str) -> Result<Element, DomError> {
        self.create_element.create_element(tag)
    }

    /// Connects a created element under `parent`, as `appendChild` would.
    pub fn append(&mut self, parent: NodeId, element: Element) -> Result<NodeId, DomError> {
        self.document.insert(parent, element)
    }

    pub(crate) fn wrap_fetch<F>(&mut self, wrap: F)
    where
        F: FnOnce(Arc<dyn Fetch>) -> Arc<dyn Fetch>,
    {
        self.fetch = wrap(Arc::clone(&self.fetch));
    }

    pub(crate) fn wrap_xhr<F>(&mut self, wrap: F)
    where
        F: FnOnce(Arc<dyn XhrOpen>) -> Arc<dyn XhrOpen>,
    {
        self.xhr = wrap(Arc::clone(&self.xhr));
    }

    pub(crate) fn wrap_set_attribute<F>(&mut self, wrap: F)
    where
        F: FnOnce(Arc<dyn SetAttribute>) -> Arc<dyn SetAttribute>,
    {
        self.set_attribute = wrap(Arc::clone(&self.set_attribute));
    }

    pub(crate) fn wrap_create_element<F>(&mut self, wrap: F)
    where
        F: FnOnce(Arc<dyn CreateElement>) -> Arc<dyn CreateElement>,
    {
        self.create_element = wrap(Arc::clone(&self.create_element));
    }
}
