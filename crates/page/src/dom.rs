use std::collections::BTreeMap;
use std::fmt;

/// Identifies an element within one `Page`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// Where an attached element lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subtree {
    Head,
    Body,
}

/// Scope of a structural observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObserveTarget {
    /// Insertions under `<head>` only
    Head,
    /// Insertions anywhere in the document
    Document,
}

impl ObserveTarget {
    pub fn covers(&self, subtree: Subtree) -> bool {
        match self {
            ObserveTarget::Head => subtree == Subtree::Head,
            ObserveTarget::Document => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Loading,
    Complete,
}

/// Events an element fires when its resource settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementEvent {
    Load,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub tag: String,
    attrs: BTreeMap<String, String>,
}

impl Element {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_ascii_lowercase(),
            attrs: BTreeMap::new(),
        }
    }

    pub fn with_attr(mut self, name: &str, value: impl Into<String>) -> Self {
        self.set_attr(name, value);
        self
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .get(&name.to_ascii_lowercase())
            .map(|v| v.as_str())
    }

    pub(crate) fn set_attr(&mut self, name: &str, value: impl Into<String>) {
        self.attrs.insert(name.to_ascii_lowercase(), value.into());
    }

    pub fn attrs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attrs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// One element reported to a structural observer.
#[derive(Debug, Clone)]
pub struct AddedNode {
    pub id: NodeId,
    pub element: Element,
    pub subtree: Subtree,
}
