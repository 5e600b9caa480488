//! Node tree, spec generation and grouping

use std::collections::HashMap;

use crate::config::SuiteConfig;
use crate::models::{Node, NodeType, Spec};

/// Spec indices grouped into units that run together
pub type GroupedSpecIndices = Vec<Vec<usize>>;

#[derive(Clone, Default)]
pub(crate) struct TreeNode {
    pub node: Option<Node>,
    pub children: Vec<TreeNode>,
}

impl TreeNode {
    pub fn new(node: Node) -> Self {
        Self {
            node: Some(node),
            children: Vec::new(),
        }
    }

    /// Every node in the tree, depth first
    pub fn flatten(&self) -> Vec<Node> {
        let mut nodes = Vec::new();
        self.collect_into(&mut nodes);
        nodes
    }

    fn collect_into(&self, nodes: &mut Vec<Node>) {
        if let Some(node) = &self.node {
            nodes.push(node.clone());
        }
        for child in &self.children {
            child.collect_into(nodes);
        }
    }
}

/// One spec per leaf: ancestor containers, their setup nodes and the leaf
pub(crate) fn generate_specs(root: &TreeNode) -> Vec<Spec> {
    let mut specs = Vec::new();
    walk(&[], &root.children, &mut specs);
    specs
}

fn walk(prefix: &[Node], children: &[TreeNode], specs: &mut Vec<Spec>) {
    let setup: Vec<Node> = children
        .iter()
        .filter_map(|child| child.node.as_ref())
        .filter(|n| !matches!(n.node_type, NodeType::Container | NodeType::It))
        .cloned()
        .collect();

    for child in children {
        let Some(node) = &child.node else { continue };
        match node.node_type {
            NodeType::It => {
                let mut nodes = prefix.to_vec();
                nodes.extend(setup.iter().cloned());
                nodes.push(node.clone());
                specs.push(Spec::new(nodes));
            }
            NodeType::Container => {
                let mut nodes = prefix.to_vec();
                nodes.push(node.clone());
                nodes.extend(setup.iter().cloned());
                walk(&nodes, &child.children, specs);
            }
            _ => {}
        }
    }
}

/// Group specs for dispatch
///
/// Specs under the same outermost ordered container share a group; every
/// other spec is its own group. When running in parallel, groups holding a
/// serial spec are returned separately so the primary process can drain
/// them once every other process has finished.
pub(crate) fn order_specs(
    specs: &[Spec],
    config: &SuiteConfig,
) -> (GroupedSpecIndices, GroupedSpecIndices) {
    let mut groups: GroupedSpecIndices = Vec::new();
    let mut by_container: HashMap<u64, usize> = HashMap::new();

    for (idx, spec) in specs.iter().enumerate() {
        match spec.first_ordered_container() {
            Some(container) => match by_container.get(&container.id) {
                Some(&group) => groups[group].push(idx),
                None => {
                    by_container.insert(container.id, groups.len());
                    groups.push(vec![idx]);
                }
            },
            None => groups.push(vec![idx]),
        }
    }

    if !config.is_running_in_parallel() {
        return (groups, Vec::new());
    }

    groups
        .into_iter()
        .partition(|group| !group.iter().any(|&idx| specs[idx].is_serial()))
}
