//! Mutable document model
//!
//! The capture pipeline and the synchronizer both mutate a live presentation
//! tree that somebody else produced. `Document` is the handle they share: a
//! cheaply clonable, thread-safe arena of nodes addressed by [`NodeId`].
//!
//! Every accessor tolerates ids whose node has since been detached or never
//! existed, returning `None` or doing nothing. Restoration code relies on that.

use crate::platform::media::MediaElement;
use crate::{Error, Result};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use url::Url;

#[cfg(feature = "html")]
pub mod html;

/// Identity of a node inside one [`Document`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Predicate deciding whether a node takes part in an operation (`true` keeps it).
pub type NodeFilter = fn(&Document, NodeId) -> bool;

/// Element payload: tag, attributes, inline style and an optional media handle.
#[derive(Clone)]
pub struct ElementData {
    pub tag: String,
    pub attrs: BTreeMap<String, String>,
    pub style: BTreeMap<String, String>,
    pub media: Option<Arc<dyn MediaElement>>,
}

impl fmt::Debug for ElementData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElementData")
            .field("tag", &self.tag)
            .field("attrs", &self.attrs)
            .field("style", &self.style)
            .field("media", &self.media.is_some())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum NodeData {
    Element(ElementData),
    Text(String),
}

#[derive(Debug, Clone)]
struct Node {
    data: NodeData,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

#[derive(Debug)]
struct Tree {
    nodes: Vec<Node>,
    root: NodeId,
    head: NodeId,
    body: NodeId,
    stylesheets: Vec<String>,
    scroll: (f64, f64),
    scroll_locked: bool,
}

impl Tree {
    fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0)
    }

    fn element(&self, id: NodeId) -> Option<&ElementData> {
        match self.nodes.get(id.0).map(|n| &n.data) {
            Some(NodeData::Element(e)) => Some(e),
            _ => None,
        }
    }

    fn element_mut(&mut self, id: NodeId) -> Option<&mut ElementData> {
        match self.nodes.get_mut(id.0).map(|n| &mut n.data) {
            Some(NodeData::Element(e)) => Some(e),
            _ => None,
        }
    }

    fn push(&mut self, data: NodeData) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            data,
            parent: None,
            children: Vec::new(),
        });
        id
    }

    fn detach(&mut self, id: NodeId) {
        if let Some(parent) = self.nodes.get(id.0).and_then(|n| n.parent) {
            if let Some(p) = self.nodes.get_mut(parent.0) {
                p.children.retain(|c| *c != id);
            }
        }
        if let Some(n) = self.nodes.get_mut(id.0) {
            n.parent = None;
        }
    }

    fn is_ancestor(&self, ancestor: NodeId, mut node: NodeId) -> bool {
        while let Some(parent) = self.node(node).and_then(|n| n.parent) {
            if parent == ancestor {
                return true;
            }
            node = parent;
        }
        false
    }

    fn preorder(&self, root: NodeId, out: &mut Vec<NodeId>) {
        // Explicit stack, children pushed in reverse to keep document order.
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            out.push(id);
            if let Some(node) = self.node(id) {
                for child in node.children.iter().rev() {
                    stack.push(*child);
                }
            }
        }
    }

    fn new_element(tag: &str) -> NodeData {
        NodeData::Element(ElementData {
            tag: tag.to_ascii_lowercase(),
            attrs: BTreeMap::new(),
            style: BTreeMap::new(),
            media: None,
        })
    }
}

/// Shared handle to a document tree.
#[derive(Clone)]
pub struct Document {
    tree: Arc<Mutex<Tree>>,
    origin: Arc<Url>,
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("origin", &self.origin.as_str())
            .field("nodes", &self.tree().nodes.len())
            .finish()
    }
}

impl Document {
    /// Create an empty `<html><head/><body/></html>` document served from `origin`.
    pub fn new(origin: &str) -> Result<Self> {
        let origin = Url::parse(origin)
            .map_err(|e| Error::ConfigError(format!("invalid document origin {:?}: {}", origin, e)))?;
        Ok(Self::with_origin(origin))
    }

    fn with_origin(origin: Url) -> Self {
        let mut tree = Tree {
            nodes: Vec::new(),
            root: NodeId(0),
            head: NodeId(0),
            body: NodeId(0),
            stylesheets: Vec::new(),
            scroll: (0.0, 0.0),
            scroll_locked: false,
        };
        let root = tree.push(Tree::new_element("html"));
        let head = tree.push(Tree::new_element("head"));
        let body = tree.push(Tree::new_element("body"));
        for child in [head, body] {
            tree.nodes[child.0].parent = Some(root);
            tree.nodes[root.0].children.push(child);
        }
        tree.root = root;
        tree.head = head;
        tree.body = body;
        Self {
            tree: Arc::new(Mutex::new(tree)),
            origin: Arc::new(origin),
        }
    }

    fn tree(&self) -> MutexGuard<'_, Tree> {
        self.tree.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn origin(&self) -> &Url {
        &self.origin
    }

    pub fn root(&self) -> NodeId {
        self.tree().root
    }

    pub fn head(&self) -> NodeId {
        self.tree().head
    }

    pub fn body(&self) -> NodeId {
        self.tree().body
    }

    pub fn node_count(&self) -> usize {
        self.tree().nodes.len()
    }

    // --- construction ---

    /// Create a detached element.
    pub fn create_element(&self, tag: &str) -> NodeId {
        self.tree().push(Tree::new_element(tag))
    }

    /// Create a detached text node.
    pub fn create_text(&self, text: &str) -> NodeId {
        self.tree().push(NodeData::Text(text.to_string()))
    }

    pub fn append_child(&self, parent: NodeId, child: NodeId) -> Result<()> {
        let mut tree = self.tree();
        if tree.element(parent).is_none() {
            return Err(Error::DomError(format!("{} is not an element", parent)));
        }
        if tree.node(child).is_none() || child == parent || tree.is_ancestor(child, parent) {
            return Err(Error::DomError(format!("cannot append {} to {}", child, parent)));
        }
        tree.detach(child);
        tree.nodes[child.0].parent = Some(parent);
        tree.nodes[parent.0].children.push(child);
        Ok(())
    }

    /// Insert `child` into `parent` right before `reference`.
    pub fn insert_before(&self, parent: NodeId, child: NodeId, reference: NodeId) -> Result<()> {
        let mut tree = self.tree();
        if tree.node(child).is_none() || child == parent || tree.is_ancestor(child, parent) {
            return Err(Error::DomError(format!("cannot insert {} into {}", child, parent)));
        }
        if !tree
            .node(parent)
            .map(|p| p.children.contains(&reference))
            .unwrap_or(false)
        {
            return Err(Error::DomError(format!("{} is not a child of {}", reference, parent)));
        }
        tree.detach(child);
        let pos = tree.nodes[parent.0]
            .children
            .iter()
            .position(|c| *c == reference)
            .unwrap_or(0);
        tree.nodes[parent.0].children.insert(pos, child);
        tree.nodes[child.0].parent = Some(parent);
        Ok(())
    }

    pub fn remove_child(&self, parent: NodeId, child: NodeId) -> Result<()> {
        let mut tree = self.tree();
        let is_child = tree
            .node(parent)
            .map(|p| p.children.contains(&child))
            .unwrap_or(false);
        if !is_child {
            return Err(Error::DomError(format!("{} is not a child of {}", child, parent)));
        }
        tree.detach(child);
        Ok(())
    }

    // --- navigation ---

    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.tree().node(node).and_then(|n| n.parent)
    }

    pub fn children(&self, node: NodeId) -> Vec<NodeId> {
        self.tree()
            .node(node)
            .map(|n| n.children.clone())
            .unwrap_or_default()
    }

    /// Whether `node` is a direct child of `parent`.
    pub fn has_child(&self, parent: NodeId, node: NodeId) -> bool {
        self.tree()
            .node(parent)
            .map(|p| p.children.contains(&node))
            .unwrap_or(false)
    }

    /// Whether `node` is `ancestor` or lives below it.
    pub fn contains(&self, ancestor: NodeId, node: NodeId) -> bool {
        ancestor == node || self.tree().is_ancestor(ancestor, node)
    }

    /// Whether the node is reachable from the document root.
    pub fn is_attached(&self, node: NodeId) -> bool {
        let tree = self.tree();
        node == tree.root || tree.is_ancestor(tree.root, node)
    }

    /// All nodes below `root` in document order, `root` excluded.
    pub fn descendants(&self, root: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        self.tree().preorder(root, &mut out);
        if !out.is_empty() {
            out.remove(0);
        }
        out
    }

    /// Elements named `tag` in the subtree rooted at `root`, `root` included.
    pub fn elements_by_tag(&self, root: NodeId, tag: &str) -> Vec<NodeId> {
        let tree = self.tree();
        let mut ids = Vec::new();
        tree.preorder(root, &mut ids);
        ids.into_iter()
            .filter(|id| {
                tree.element(*id)
                    .map(|e| e.tag.eq_ignore_ascii_case(tag))
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Find the first element matching `#id`, `.class`, `[attr]` or a tag name.
    pub fn query_selector(&self, selector: &str) -> Option<NodeId> {
        let selector = selector.trim();
        let tree = self.tree();
        let mut ids = Vec::new();
        tree.preorder(tree.root, &mut ids);
        ids.into_iter().find(|id| {
            let Some(el) = tree.element(*id) else {
                return false;
            };
            if let Some(want) = selector.strip_prefix('#') {
                el.attrs.get("id").map(|v| v == want).unwrap_or(false)
            } else if let Some(want) = selector.strip_prefix('.') {
                el.attrs
                    .get("class")
                    .map(|v| v.split_whitespace().any(|c| c == want))
                    .unwrap_or(false)
            } else if let Some(attr) = selector.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
                el.attrs.contains_key(attr)
            } else {
                el.tag.eq_ignore_ascii_case(selector)
            }
        })
    }

    // --- node data ---

    pub fn is_element(&self, node: NodeId) -> bool {
        self.tree().element(node).is_some()
    }

    pub fn tag(&self, node: NodeId) -> Option<String> {
        self.tree().element(node).map(|e| e.tag.clone())
    }

    pub fn is_tag(&self, node: NodeId, tag: &str) -> bool {
        self.tree()
            .element(node)
            .map(|e| e.tag.eq_ignore_ascii_case(tag))
            .unwrap_or(false)
    }

    /// Text payload of a text node.
    pub fn text(&self, node: NodeId) -> Option<String> {
        match self.tree().node(node).map(|n| &n.data) {
            Some(NodeData::Text(t)) => Some(t.clone()),
            _ => None,
        }
    }

    /// Concatenated text of every text node in the subtree.
    pub fn text_content(&self, node: NodeId) -> String {
        let tree = self.tree();
        let mut ids = Vec::new();
        tree.preorder(node, &mut ids);
        ids.into_iter()
            .filter_map(|id| match tree.node(id).map(|n| &n.data) {
                Some(NodeData::Text(t)) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn attr(&self, node: NodeId, name: &str) -> Option<String> {
        self.tree().element(node).and_then(|e| e.attrs.get(name).cloned())
    }

    pub fn set_attr(&self, node: NodeId, name: &str, value: &str) {
        if let Some(el) = self.tree().element_mut(node) {
            el.attrs.insert(name.to_string(), value.to_string());
        }
    }

    pub fn remove_attr(&self, node: NodeId, name: &str) {
        if let Some(el) = self.tree().element_mut(node) {
            el.attrs.remove(name);
        }
    }

    /// Set or remove an attribute depending on `value`.
    pub fn restore_attr(&self, node: NodeId, name: &str, value: Option<&str>) {
        match value {
            Some(v) => self.set_attr(node, name, v),
            None => self.remove_attr(node, name),
        }
    }

    pub fn class_name(&self, node: NodeId) -> Option<String> {
        self.attr(node, "class")
    }

    pub fn style(&self, node: NodeId, property: &str) -> Option<String> {
        self.tree().element(node).and_then(|e| e.style.get(property).cloned())
    }

    pub fn set_style(&self, node: NodeId, property: &str, value: &str) {
        if let Some(el) = self.tree().element_mut(node) {
            el.style.insert(property.to_string(), value.to_string());
        }
    }

    pub fn remove_style(&self, node: NodeId, property: &str) {
        if let Some(el) = self.tree().element_mut(node) {
            el.style.remove(property);
        }
    }

    pub fn restore_style(&self, node: NodeId, property: &str, value: Option<&str>) {
        match value {
            Some(v) => self.set_style(node, property, v),
            None => self.remove_style(node, property),
        }
    }

    /// Inline style of the node, or of the nearest ancestor that sets it.
    pub fn inherited_style(&self, node: NodeId, property: &str) -> Option<String> {
        let tree = self.tree();
        let mut cur = Some(node);
        while let Some(id) = cur {
            if let Some(v) = tree.element(id).and_then(|e| e.style.get(property)) {
                return Some(v.clone());
            }
            cur = tree.node(id).and_then(|n| n.parent);
        }
        None
    }

    pub fn is_hidden(&self, node: NodeId) -> bool {
        self.style(node, "display").as_deref() == Some("none")
    }

    // --- media ---

    pub fn attach_media(&self, node: NodeId, media: Arc<dyn MediaElement>) {
        if let Some(el) = self.tree().element_mut(node) {
            el.media = Some(media);
        }
    }

    pub fn media(&self, node: NodeId) -> Option<Arc<dyn MediaElement>> {
        self.tree().element(node).and_then(|e| e.media.clone())
    }

    // --- stylesheets and fonts ---

    pub fn add_stylesheet(&self, css: &str) {
        self.tree().stylesheets.push(css.to_string());
    }

    pub fn stylesheets(&self) -> Vec<String> {
        self.tree().stylesheets.clone()
    }

    /// Font families applied to the subtree: those inherited by `root` plus
    /// every family set inside it. Generic families are left out.
    pub fn applied_font_families(&self, root: NodeId) -> BTreeSet<String> {
        let mut families = BTreeSet::new();
        if let Some(inherited) = self.inherited_style(root, "font-family") {
            families.extend(split_font_families(&inherited));
        }
        let tree = self.tree();
        let mut ids = Vec::new();
        tree.preorder(root, &mut ids);
        for id in ids {
            if let Some(v) = tree.element(id).and_then(|e| e.style.get("font-family")) {
                families.extend(split_font_families(v));
            }
        }
        families
    }

    // --- scrolling ---

    pub fn scroll_position(&self) -> (f64, f64) {
        self.tree().scroll
    }

    pub fn scroll_to(&self, x: f64, y: f64) {
        self.tree().scroll = (x.max(0.0), y.max(0.0));
    }

    pub fn set_scroll_locked(&self, locked: bool) {
        self.tree().scroll_locked = locked;
    }

    pub fn is_scroll_locked(&self) -> bool {
        self.tree().scroll_locked
    }

    // --- cloning ---

    /// Copy the subtree rooted at `root` into a fresh document with the same
    /// origin and stylesheets. Nodes rejected by `filter` are left out along
    /// with everything below them. Returns the new document and the id of
    /// the copied root, which is appended to the new body.
    pub fn clone_subtree(&self, root: NodeId, filter: NodeFilter) -> Result<(Document, NodeId)> {
        if !self.is_element(root) {
            return Err(Error::DomError(format!("{} is not an element", root)));
        }
        // Evaluate the filter before taking the lock; it may call back into us.
        let excluded: HashSet<NodeId> = self
            .descendants(root)
            .into_iter()
            .filter(|id| !filter(self, *id))
            .collect();
        let color = self.inherited_style(root, "color");
        let font = self.inherited_style(root, "font-family");

        let clone = Document::with_origin((*self.origin).clone());
        let src = self.tree();
        let mut dst = clone.tree();
        dst.stylesheets = src.stylesheets.clone();

        let mut stack: Vec<(NodeId, NodeId)> = Vec::new();
        let new_root = dst.push(src.nodes[root.0].data.clone());
        let body = dst.body;
        dst.nodes[new_root.0].parent = Some(body);
        dst.nodes[body.0].children.push(new_root);
        stack.push((root, new_root));
        while let Some((from, to)) = stack.pop() {
            let children = src.node(from).map(|n| n.children.clone()).unwrap_or_default();
            for child in children {
                if excluded.contains(&child) {
                    continue;
                }
                let copied = dst.push(src.nodes[child.0].data.clone());
                dst.nodes[copied.0].parent = Some(to);
                dst.nodes[to.0].children.push(copied);
                stack.push((child, copied));
            }
        }
        if let Some(el) = dst.element_mut(new_root) {
            for (prop, value) in [("color", color), ("font-family", font)] {
                if let Some(v) = value {
                    el.style.entry(prop.to_string()).or_insert(v);
                }
            }
        }
        drop(dst);
        drop(src);
        Ok((clone, new_root))
    }
}

const GENERIC_FAMILIES: &[&str] = &[
    "serif",
    "sans-serif",
    "monospace",
    "cursive",
    "fantasy",
    "system-ui",
    "ui-sans-serif",
    "ui-serif",
    "ui-monospace",
    "emoji",
    "math",
    "inherit",
    "initial",
    "unset",
];

/// Split a `font-family` value into normalized (unquoted, lowercase) names.
pub fn split_font_families(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|f| f.trim().trim_matches(|c| c == '"' || c == '\'').trim().to_ascii_lowercase())
        .filter(|f| !f.is_empty() && !GENERIC_FAMILIES.contains(&f.as_str()))
        .collect()
}

/// Parse a `style` attribute (`a: b; c: d`) into property/value pairs.
pub fn parse_inline_style(style: &str) -> Vec<(String, String)> {
    style
        .split(';')
        .filter_map(|decl| {
            let (prop, value) = decl.split_once(':')?;
            let prop = prop.trim().to_ascii_lowercase();
            let value = value.trim();
            if prop.is_empty() || value.is_empty() {
                None
            } else {
                Some((prop, value.to_string()))
            }
        })
        .collect()
}
