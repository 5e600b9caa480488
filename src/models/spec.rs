//! Spec model
//!
//! A spec is the ordered chain of nodes making up one runnable leaf.

use super::node::{Node, NodeType, NodesExt};

/// One runnable leaf together with its ancestors' containers and setup nodes
#[derive(Clone, Debug)]
pub struct Spec {
    pub nodes: Vec<Node>,
    /// Set by the focus policy; skipped specs never run their bodies
    pub skip: bool,
}

impl Spec {
    pub fn new(nodes: Vec<Node>) -> Self {
        Self { nodes, skip: false }
    }

    /// The `It` node of this spec
    pub fn leaf(&self) -> Option<&Node> {
        self.nodes.iter().find(|n| n.node_type == NodeType::It)
    }

    pub fn containers(&self) -> Vec<&Node> {
        self.nodes
            .iter()
            .filter(|n| n.node_type == NodeType::Container)
            .collect()
    }

    pub fn container_texts(&self) -> Vec<String> {
        self.containers().iter().map(|n| n.text.clone()).collect()
    }

    pub fn text(&self) -> String {
        let mut texts = self.container_texts();
        if let Some(leaf) = self.leaf() {
            texts.push(leaf.text.clone());
        }
        texts.join(" ")
    }

    pub fn nodes_with_type(&self, node_type: NodeType) -> Vec<Node> {
        self.nodes.with_type(|t| t == node_type)
    }

    /// Pending if the leaf or any container is marked pending
    pub fn is_pending(&self) -> bool {
        self.nodes
            .iter()
            .any(|n| n.marked_pending && matches!(n.node_type, NodeType::It | NodeType::Container))
    }

    pub fn is_serial(&self) -> bool {
        self.nodes
            .iter()
            .any(|n| n.marked_serial && matches!(n.node_type, NodeType::It | NodeType::Container))
    }

    /// Outermost ordered container, which groups all specs beneath it
    pub fn first_ordered_container(&self) -> Option<&Node> {
        self.nodes
            .iter()
            .find(|n| n.node_type == NodeType::Container && n.marked_ordered)
    }

    pub fn is_in_ordered_container(&self) -> bool {
        self.first_ordered_container().is_some()
    }

    /// Text to show for `node`: its own text, otherwise the nearest container's
    pub fn best_text_for(&self, node: &Node) -> String {
        if !node.text.is_empty() {
            return node.text.clone();
        }
        let mut best = String::new();
        for n in &self.nodes {
            if n.node_type == NodeType::Container && n.nesting_level < node.nesting_level {
                best = n.text.clone();
            }
        }
        if best.is_empty() {
            self.leaf().map(|l| l.text.clone()).unwrap_or_default()
        } else {
            best
        }
    }
}
