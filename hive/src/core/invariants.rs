//! Semantic invariants of the supervisor tree.

use std::collections::{HashMap, HashSet};

use crate::core::types::{AgentId, AgentKind};

/// Minimal view of one live agent for invariant checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeView {
    pub id: AgentId,
    pub name: String,
    pub kind: AgentKind,
    pub parent: Option<AgentId>,
    pub children: Vec<AgentId>,
}

/// Check tree invariants over the set of live agents:
/// - No duplicate ids or names
/// - At most one root, and it has no parent
/// - Every mortal agent has a live parent that lists it as a child
/// - Every listed child points back at its parent
/// - Parent chains terminate (no cycles)
pub fn validate_tree(nodes: &[NodeView]) -> Vec<String> {
    let mut errors = Vec::new();
    let mut by_id: HashMap<AgentId, &NodeView> = HashMap::new();
    let mut names = HashSet::new();

    for node in nodes {
        if by_id.insert(node.id, node).is_some() {
            errors.push(format!("duplicate id '{}'", node.id));
        }
        if !names.insert(node.name.as_str()) {
            errors.push(format!("duplicate name '{}'", node.name));
        }
    }

    let roots = nodes
        .iter()
        .filter(|node| node.kind == AgentKind::Root)
        .count();
    if roots > 1 {
        errors.push(format!("expected at most one root, found {roots}"));
    }

    for node in nodes {
        match (node.kind, node.parent) {
            (AgentKind::Root, Some(parent)) => {
                errors.push(format!("root '{}' has parent {}", node.name, parent));
            }
            (AgentKind::Mortal, None) => {
                errors.push(format!("agent '{}' has no parent", node.name));
            }
            (AgentKind::Mortal, Some(parent)) => match by_id.get(&parent) {
                Some(parent_node) if parent_node.children.contains(&node.id) => {}
                Some(parent_node) => errors.push(format!(
                    "agent '{}' missing from children of '{}'",
                    node.name, parent_node.name
                )),
                None => errors.push(format!(
                    "agent '{}' points at unknown parent {}",
                    node.name, parent
                )),
            },
            (AgentKind::Root, None) => {}
        }

        for child in &node.children {
            if let Some(child_node) = by_id.get(child)
                && child_node.parent != Some(node.id)
            {
                errors.push(format!(
                    "child '{}' of '{}' points elsewhere",
                    child_node.name, node.name
                ));
            }
        }

        if has_cycle(node, &by_id) {
            errors.push(format!("parent chain of '{}' cycles", node.name));
        }
    }

    errors
}

fn has_cycle(start: &NodeView, by_id: &HashMap<AgentId, &NodeView>) -> bool {
    let mut seen = HashSet::from([start.id]);
    let mut cursor = start.parent;
    while let Some(id) = cursor {
        if !seen.insert(id) {
            return true;
        }
        cursor = by_id.get(&id).and_then(|node| node.parent);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(name: &str, kind: AgentKind, parent: Option<AgentId>) -> NodeView {
        NodeView {
            id: AgentId::new(),
            name: name.to_string(),
            kind,
            parent,
            children: Vec::new(),
        }
    }

    #[test]
    fn consistent_tree_has_no_errors() {
        let mut root = view("root", AgentKind::Root, None);
        let child = view("a", AgentKind::Mortal, Some(root.id));
        root.children.push(child.id);
        assert!(validate_tree(&[root, child]).is_empty());
    }

    #[test]
    fn reports_duplicate_names_and_orphans() {
        let root = view("root", AgentKind::Root, None);
        let orphan = view("root", AgentKind::Mortal, Some(root.id));
        let errors = validate_tree(&[root, orphan]);
        assert!(errors.iter().any(|err| err.contains("duplicate name")));
        assert!(errors.iter().any(|err| err.contains("missing from children")));
    }

    #[test]
    fn reports_cycles() {
        let mut a = view("a", AgentKind::Mortal, None);
        let mut b = view("b", AgentKind::Mortal, Some(a.id));
        a.parent = Some(b.id);
        a.children.push(b.id);
        b.children.push(a.id);
        let errors = validate_tree(&[a, b]);
        assert!(errors.iter().any(|err| err.contains("cycles")));
    }
}
