//! Node arena
//!
//! Nodes live in one arena per window and are addressed by [`NodeId`];
//! parent and child links are plain ids, never owning pointers. Every
//! structural or attribute change returns the mutation records it produced
//! so the caller can queue them.
//!
//! The event dispatcher only sees the tree through [`TreeAccess`].

use super::mutation::MutationRecord;
use crate::error::{Error, Result};
use std::fmt;

/// Stable node identity within one arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShadowRootMode {
    Open,
    Closed,
}

/// Element payload
#[derive(Debug, Clone, Default)]
pub struct ElementData {
    /// Lowercased tag name
    pub tag: String,
    pub attributes: Vec<(String, String)>,
    pub shadow_root: Option<NodeId>,
    /// Checkedness of checkbox and radio inputs
    pub checked: bool,
}

impl ElementData {
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Kind-specific node payload
#[derive(Debug, Clone)]
pub enum NodeData {
    Document,
    DocumentFragment,
    ShadowRoot { host: NodeId, mode: ShadowRootMode },
    Element(ElementData),
    Text(String),
    Comment(String),
}

#[derive(Debug, Clone)]
struct Node {
    data: NodeData,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    document: NodeId,
}

/// Parent resolution the event dispatcher needs from the tree
pub trait TreeAccess {
    fn parent_of(&self, node: NodeId) -> Option<NodeId>;

    /// Mode of `node` if it is a shadow root
    fn shadow_root_mode(&self, node: NodeId) -> Option<ShadowRootMode>;

    fn shadow_host(&self, shadow_root: NodeId) -> Option<NodeId>;

    fn is_document(&self, node: NodeId) -> bool;

    /// Whether `node` is the document displayed by the window
    fn is_main_document(&self, node: NodeId) -> bool;

    /// Whether a click on `node` triggers activation behavior
    fn has_activation_behavior(&self, _node: NodeId) -> bool {
        false
    }

    fn is_shadow_root(&self, node: NodeId) -> bool {
        self.shadow_root_mode(node).is_some()
    }

    fn root_of(&self, node: NodeId) -> NodeId {
        let mut current = node;
        while let Some(parent) = self.parent_of(current) {
            current = parent;
        }
        current
    }

    /// `ancestor` is `node` or one of its ancestors, crossing shadow roots
    /// to their hosts
    fn is_shadow_including_inclusive_ancestor(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut current = Some(node);
        while let Some(n) = current {
            if n == ancestor {
                return true;
            }
            current = match self.parent_of(n) {
                Some(parent) => Some(parent),
                None => self.shadow_host(n),
            };
        }
        false
    }
}

/// Result of a tree operation
#[derive(Debug, Default)]
pub struct TreeChange {
    pub records: Vec<MutationRecord>,
    /// Nodes that moved to another document
    pub adopted: Vec<NodeId>,
}

fn hierarchy_error(message: impl Into<String>) -> Error {
    Error::invalid_state(format!("HierarchyRequestError: {}", message.into()))
}

/// Arena holding every node of a window, including secondary documents
#[derive(Debug, Clone)]
pub struct NodeArena {
    nodes: Vec<Node>,
    main_document: NodeId,
}

impl Default for NodeArena {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeArena {
    /// Arena containing an empty main document
    pub fn new() -> Self {
        let mut arena = NodeArena {
            nodes: Vec::new(),
            main_document: NodeId(0),
        };
        arena.main_document = arena.create_document();
        arena
    }

    pub fn main_document(&self) -> NodeId {
        self.main_document
    }

    fn push(&mut self, data: NodeData, document: Option<NodeId>) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node {
            data,
            parent: None,
            children: Vec::new(),
            document: document.unwrap_or(id),
        });
        id
    }

    fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes
            .get(id.index())
            .ok_or_else(|| Error::type_error(format!("unknown node {}", id)))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.nodes
            .get_mut(id.index())
            .ok_or_else(|| Error::type_error(format!("unknown node {}", id)))
    }

    /// A new, separate document
    pub fn create_document(&mut self) -> NodeId {
        self.push(NodeData::Document, None)
    }

    pub fn create_element(&mut self, document: NodeId, tag: &str) -> NodeId {
        self.push(
            NodeData::Element(ElementData {
                tag: tag.to_ascii_lowercase(),
                ..Default::default()
            }),
            Some(document),
        )
    }

    pub fn create_text(&mut self, document: NodeId, text: &str) -> NodeId {
        self.push(NodeData::Text(text.to_string()), Some(document))
    }

    pub fn create_comment(&mut self, document: NodeId, text: &str) -> NodeId {
        self.push(NodeData::Comment(text.to_string()), Some(document))
    }

    pub fn create_fragment(&mut self, document: NodeId) -> NodeId {
        self.push(NodeData::DocumentFragment, Some(document))
    }

    pub fn contains_node(&self, id: NodeId) -> bool {
        id.index() < self.nodes.len()
    }

    pub fn data(&self, id: NodeId) -> Option<&NodeData> {
        self.nodes.get(id.index()).map(|n| &n.data)
    }

    pub fn element(&self, id: NodeId) -> Option<&ElementData> {
        match self.data(id) {
            Some(NodeData::Element(el)) => Some(el),
            _ => None,
        }
    }

    fn element_mut(&mut self, id: NodeId) -> Result<&mut ElementData> {
        match &mut self.node_mut(id)?.data {
            NodeData::Element(el) => Ok(el),
            _ => Err(Error::type_error(format!("node {} is not an element", id))),
        }
    }

    /// `nodeName`
    pub fn node_name(&self, id: NodeId) -> String {
        match self.data(id) {
            Some(NodeData::Document) => "#document".to_string(),
            Some(NodeData::DocumentFragment) | Some(NodeData::ShadowRoot { .. }) => {
                "#document-fragment".to_string()
            }
            Some(NodeData::Element(el)) => el.tag.to_ascii_uppercase(),
            Some(NodeData::Text(_)) => "#text".to_string(),
            Some(NodeData::Comment(_)) => "#comment".to_string(),
            None => String::new(),
        }
    }

    pub fn owner_document(&self, id: NodeId) -> Option<NodeId> {
        self.nodes.get(id.index()).map(|n| n.document)
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.nodes
            .get(id.index())
            .map(|n| n.children.as_slice())
            .unwrap_or(&[])
    }

    fn sibling(&self, id: NodeId, offset: isize) -> Option<NodeId> {
        let parent = self.parent_of(id)?;
        let siblings = self.children(parent);
        let pos = siblings.iter().position(|&c| c == id)? as isize + offset;
        usize::try_from(pos).ok().and_then(|p| siblings.get(p).copied())
    }

    pub fn previous_sibling(&self, id: NodeId) -> Option<NodeId> {
        self.sibling(id, -1)
    }

    pub fn next_sibling(&self, id: NodeId) -> Option<NodeId> {
        self.sibling(id, 1)
    }

    /// `node` and all its descendants in tree order (shadow trees excluded)
    pub fn inclusive_descendants(&self, node: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![node];
        while let Some(current) = stack.pop() {
            out.push(current);
            stack.extend(self.children(current).iter().rev());
        }
        out
    }

    /// `textContent` getter
    pub fn text_content(&self, id: NodeId) -> Option<String> {
        match self.data(id)? {
            NodeData::Text(t) | NodeData::Comment(t) => Some(t.clone()),
            NodeData::Document => None,
            _ => Some(
                self.inclusive_descendants(id)
                    .into_iter()
                    .filter_map(|n| match self.data(n) {
                        Some(NodeData::Text(t)) => Some(t.as_str()),
                        _ => None,
                    })
                    .collect(),
            ),
        }
    }

    pub fn attribute(&self, id: NodeId, name: &str) -> Option<&str> {
        self.element(id)?.attribute(name)
    }

    fn is_inclusive_ancestor(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut current = Some(node);
        while let Some(n) = current {
            if n == ancestor {
                return true;
            }
            current = self.parent_of(n);
        }
        false
    }

    // ── mutation ─────────────────────────────────────────────────────────

    /// `parent.insertBefore(child, reference)`; `None` appends
    pub fn insert_before(&mut self, parent: NodeId, child: NodeId, reference: Option<NodeId>) -> Result<TreeChange> {
        match &self.node(parent)?.data {
            NodeData::Document | NodeData::DocumentFragment | NodeData::ShadowRoot { .. } | NodeData::Element(_) => {}
            _ => return Err(hierarchy_error("parent cannot have children")),
        }
        match &self.node(child)?.data {
            NodeData::Document | NodeData::ShadowRoot { .. } => {
                return Err(hierarchy_error("node cannot be inserted"))
            }
            NodeData::Text(_) if matches!(self.node(parent)?.data, NodeData::Document) => {
                return Err(hierarchy_error("documents cannot contain text"))
            }
            _ => {}
        }
        if self.is_inclusive_ancestor(child, parent) {
            return Err(hierarchy_error("the new child contains the parent"));
        }
        if let Some(reference) = reference {
            if self.parent_of(reference) != Some(parent) {
                return Err(Error::invalid_state(
                    "NotFoundError: the reference node is not a child of this node",
                ));
            }
        }

        let mut change = TreeChange::default();
        let document = self.node(parent)?.document;

        // Fragments insert their children, not themselves.
        let nodes: Vec<NodeId> = if matches!(self.node(child)?.data, NodeData::DocumentFragment) {
            let kids = self.children(child).to_vec();
            if !kids.is_empty() {
                let mut record = MutationRecord::child_list(child);
                record.removed_nodes = kids.clone();
                change.records.push(record);
                self.node_mut(child)?.children.clear();
                for &kid in &kids {
                    self.node_mut(kid)?.parent = None;
                }
            }
            kids
        } else {
            if let Some(old_parent) = self.parent_of(child) {
                let removed = self.detach(old_parent, child)?;
                change.records.push(removed);
            }
            vec![child]
        };
        if nodes.is_empty() {
            return Ok(change);
        }

        for &node in &nodes {
            if self.node(node)?.document != document {
                change.adopted.extend(self.set_document(node, document));
            }
        }

        let index = match reference {
            Some(reference) => self
                .children(parent)
                .iter()
                .position(|&c| c == reference)
                .unwrap_or(self.children(parent).len()),
            None => self.children(parent).len(),
        };
        let previous = index.checked_sub(1).and_then(|i| self.children(parent).get(i).copied());
        let next = self.children(parent).get(index).copied();
        {
            let children = &mut self.node_mut(parent)?.children;
            for (offset, &node) in nodes.iter().enumerate() {
                children.insert(index + offset, node);
            }
        }
        for &node in &nodes {
            self.node_mut(node)?.parent = Some(parent);
        }

        let mut record = MutationRecord::child_list(parent);
        record.added_nodes = nodes;
        record.previous_sibling = previous;
        record.next_sibling = next;
        change.records.push(record);
        Ok(change)
    }

    /// `parent.appendChild(child)`
    pub fn append_child(&mut self, parent: NodeId, child: NodeId) -> Result<TreeChange> {
        self.insert_before(parent, child, None)
    }

    /// `parent.removeChild(child)`
    pub fn remove_child(&mut self, parent: NodeId, child: NodeId) -> Result<TreeChange> {
        if self.parent_of(child) != Some(parent) {
            return Err(Error::invalid_state(
                "NotFoundError: the node to be removed is not a child of this node",
            ));
        }
        let record = self.detach(parent, child)?;
        Ok(TreeChange {
            records: vec![record],
            adopted: Vec::new(),
        })
    }

    fn detach(&mut self, parent: NodeId, child: NodeId) -> Result<MutationRecord> {
        let previous = self.previous_sibling(child);
        let next = self.next_sibling(child);
        self.node_mut(parent)?.children.retain(|&c| c != child);
        self.node_mut(child)?.parent = None;
        let mut record = MutationRecord::child_list(parent);
        record.removed_nodes = vec![child];
        record.previous_sibling = previous;
        record.next_sibling = next;
        Ok(record)
    }

    /// Move `node`'s subtree (with shadow trees) into `document`
    fn set_document(&mut self, node: NodeId, document: NodeId) -> Vec<NodeId> {
        let mut moved = Vec::new();
        let mut stack = vec![node];
        while let Some(current) = stack.pop() {
            let Some(entry) = self.nodes.get_mut(current.index()) else {
                continue;
            };
            entry.document = document;
            moved.push(current);
            stack.extend(entry.children.iter().copied());
            if let NodeData::Element(ElementData {
                shadow_root: Some(root),
                ..
            }) = entry.data
            {
                stack.push(root);
            }
        }
        moved
    }

    /// `document.adoptNode(node)`
    pub fn adopt(&mut self, node: NodeId, document: NodeId) -> Result<TreeChange> {
        if !matches!(self.node(document)?.data, NodeData::Document) {
            return Err(Error::type_error("adoption target is not a document"));
        }
        match self.node(node)?.data {
            NodeData::Document => return Err(Error::invalid_state("NotSupportedError: cannot adopt a document")),
            NodeData::ShadowRoot { .. } => {
                return Err(hierarchy_error("cannot adopt a shadow root"))
            }
            _ => {}
        }
        let mut change = TreeChange::default();
        if let Some(parent) = self.parent_of(node) {
            change.records.push(self.detach(parent, node)?);
        }
        if self.node(node)?.document != document {
            change.adopted = self.set_document(node, document);
        }
        Ok(change)
    }

    pub fn set_attribute(&mut self, element: NodeId, name: &str, value: &str) -> Result<TreeChange> {
        if name.is_empty() || name.contains(|c: char| c.is_whitespace() || c == '/' || c == '>' || c == '=') {
            return Err(Error::invalid_state(format!(
                "InvalidCharacterError: '{}' is not a valid attribute name",
                name
            )));
        }
        let name = name.to_ascii_lowercase();
        let el = self.element_mut(element)?;
        let old = match el.attributes.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => Some(std::mem::replace(&mut slot.1, value.to_string())),
            None => {
                el.attributes.push((name.clone(), value.to_string()));
                None
            }
        };
        Ok(TreeChange {
            records: vec![MutationRecord::attribute(element, &name, old)],
            adopted: Vec::new(),
        })
    }

    pub fn remove_attribute(&mut self, element: NodeId, name: &str) -> Result<TreeChange> {
        let name = name.to_ascii_lowercase();
        let el = self.element_mut(element)?;
        let Some(pos) = el.attributes.iter().position(|(n, _)| *n == name) else {
            return Ok(TreeChange::default());
        };
        let (_, old) = el.attributes.remove(pos);
        Ok(TreeChange {
            records: vec![MutationRecord::attribute(element, &name, Some(old))],
            adopted: Vec::new(),
        })
    }

    /// Replace the data of a text or comment node
    pub fn set_data(&mut self, node: NodeId, data: &str) -> Result<TreeChange> {
        let old = match &mut self.node_mut(node)?.data {
            NodeData::Text(t) | NodeData::Comment(t) => std::mem::replace(t, data.to_string()),
            _ => return Err(Error::type_error(format!("node {} is not character data", node))),
        };
        Ok(TreeChange {
            records: vec![MutationRecord::character_data(node, old)],
            adopted: Vec::new(),
        })
    }

    /// `textContent` setter: character data changes in place, other nodes
    /// replace all children with one text node
    pub fn set_text_content(&mut self, node: NodeId, text: &str) -> Result<TreeChange> {
        match self.node(node)?.data {
            NodeData::Text(_) | NodeData::Comment(_) => return self.set_data(node, text),
            NodeData::Document => return Ok(TreeChange::default()),
            _ => {}
        }
        let removed = std::mem::take(&mut self.node_mut(node)?.children);
        for &child in &removed {
            self.node_mut(child)?.parent = None;
        }
        let mut record = MutationRecord::child_list(node);
        record.removed_nodes = removed;
        if !text.is_empty() {
            let document = self.node(node)?.document;
            let text_node = self.create_text(document, text);
            self.node_mut(text_node)?.parent = Some(node);
            self.node_mut(node)?.children.push(text_node);
            record.added_nodes.push(text_node);
        }
        if record.added_nodes.is_empty() && record.removed_nodes.is_empty() {
            return Ok(TreeChange::default());
        }
        Ok(TreeChange {
            records: vec![record],
            adopted: Vec::new(),
        })
    }

    /// `element.attachShadow({ mode })`
    pub fn attach_shadow(&mut self, host: NodeId, mode: ShadowRootMode) -> Result<NodeId> {
        let document = self.node(host)?.document;
        let el = self.element_mut(host)?;
        if el.shadow_root.is_some() {
            return Err(Error::invalid_state(
                "NotSupportedError: element already hosts a shadow root",
            ));
        }
        let root = self.push(NodeData::ShadowRoot { host, mode }, Some(document));
        self.element_mut(host)?.shadow_root = Some(root);
        Ok(root)
    }

    pub fn shadow_root(&self, host: NodeId) -> Option<NodeId> {
        self.element(host)?.shadow_root
    }

    // ── checkable controls ───────────────────────────────────────────────

    /// Lowercased `type` of an `<input>`
    pub fn input_type(&self, node: NodeId) -> Option<String> {
        let el = self.element(node)?;
        (el.tag == "input").then(|| el.attribute("type").unwrap_or("text").to_ascii_lowercase())
    }

    pub fn checked(&self, node: NodeId) -> bool {
        self.element(node).is_some_and(|el| el.checked)
    }

    pub fn set_checked(&mut self, node: NodeId, checked: bool) -> Result<()> {
        self.element_mut(node)?.checked = checked;
        Ok(())
    }

    /// Other radio buttons in `node`'s group: same tree root, same
    /// non-empty `name`
    pub fn radio_group(&self, node: NodeId) -> Vec<NodeId> {
        let Some(name) = self.attribute(node, "name").filter(|n| !n.is_empty()) else {
            return Vec::new();
        };
        let root = self.root_of(node);
        self.inclusive_descendants(root)
            .into_iter()
            .filter(|&n| n != node)
            .filter(|&n| self.input_type(n).as_deref() == Some("radio"))
            .filter(|&n| self.attribute(n, "name") == Some(name))
            .collect()
    }
}

impl TreeAccess for NodeArena {
    fn parent_of(&self, node: NodeId) -> Option<NodeId> {
        self.nodes.get(node.index()).and_then(|n| n.parent)
    }

    fn shadow_root_mode(&self, node: NodeId) -> Option<ShadowRootMode> {
        match self.data(node)? {
            NodeData::ShadowRoot { mode, .. } => Some(*mode),
            _ => None,
        }
    }

    fn shadow_host(&self, shadow_root: NodeId) -> Option<NodeId> {
        match self.data(shadow_root)? {
            NodeData::ShadowRoot { host, .. } => Some(*host),
            _ => None,
        }
    }

    fn is_document(&self, node: NodeId) -> bool {
        matches!(self.data(node), Some(NodeData::Document))
    }

    fn is_main_document(&self, node: NodeId) -> bool {
        node == self.main_document
    }

    fn has_activation_behavior(&self, node: NodeId) -> bool {
        matches!(self.input_type(node).as_deref(), Some("checkbox") | Some("radio"))
    }
}
