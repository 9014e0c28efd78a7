//! Template Validation
//!
//! Structural checks run before a template is instantiated:
//! - Node field validation (IDs, gateway routing tables)
//! - Exactly one start node
//! - Reference integrity of links and routing targets
//! - Reachability from the start node (reported, not rejected)

use std::collections::{HashSet, VecDeque};

use log::{debug, info, warn};

use super::model::{Node, NodeType, WorkflowTemplate};

/// Validation error types for user-friendly error messages.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    EmptyTemplate,
    EmptyNodeId,
    DuplicateNodeId(String),
    MissingStartNode,
    MultipleStartNodes(Vec<String>),
    InvalidLink { source: String, target: String },
    GatewayWithoutRoutes(String),
    InvalidRouteTarget { node: String, target: String },
}

impl ValidationError {
    /// Returns true for errors about the start node count.
    pub fn is_start_node_error(&self) -> bool {
        matches!(self, Self::MissingStartNode | Self::MultipleStartNodes(_))
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyTemplate => write!(f, "Template has no nodes"),
            Self::EmptyNodeId => write!(f, "Node has empty or whitespace-only ID"),
            Self::DuplicateNodeId(id) => write!(f, "Duplicate node ID: '{}'", id),
            Self::MissingStartNode => write!(f, "Template has no start node"),
            Self::MultipleStartNodes(ids) => {
                write!(f, "Template has {} start nodes: {}", ids.len(), ids.join(", "))
            }
            Self::InvalidLink { source, target } => {
                write!(f, "Link '{}' -> '{}' references an unknown node", source, target)
            }
            Self::GatewayWithoutRoutes(id) => {
                write!(f, "Gateway '{}' has no routing entries", id)
            }
            Self::InvalidRouteTarget { node, target } => {
                write!(f, "Gateway '{}' routes to unknown node '{}'", node, target)
            }
        }
    }
}

/// Validates a single node's fields.
fn validate_node(node: &Node, node_ids: &HashSet<&str>) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if node.id.trim().is_empty() {
        errors.push(ValidationError::EmptyNodeId);
        return errors; // Can't validate further without ID
    }

    match node.node_type {
        NodeType::Gateway => {
            if node.routing_tables.is_empty() {
                errors.push(ValidationError::GatewayWithoutRoutes(node.id.clone()));
            }
            for entry in &node.routing_tables {
                if !node_ids.contains(entry.target.as_str()) {
                    errors.push(ValidationError::InvalidRouteTarget {
                        node: node.id.clone(),
                        target: entry.target.clone(),
                    });
                }
            }
        }
        _ if !node.routing_tables.is_empty() => {
            debug!(
                "Node '{}' is a {} - routing table ignored",
                node.id, node.node_type
            );
        }
        _ => {}
    }

    if node.node_type.is_structural() && node.handler.is_some() {
        warn!("Node '{}': handlers on {} nodes never run", node.id, node.node_type);
    }

    errors
}

/// Validates the entire template structure.
///
/// Performs the following checks:
/// 1. Template is not empty
/// 2. No duplicate or empty node IDs
/// 3. Exactly one start node
/// 4. All links and routing targets point to existing nodes
/// 5. Gateways carry at least one routing entry
///
/// Returns every problem found; an empty list means the template is usable.
pub fn validate_template(template: &WorkflowTemplate) -> Vec<ValidationError> {
    debug!(
        "Validating template '{}' with {} nodes",
        template.name,
        template.nodes.len()
    );

    if template.nodes.is_empty() {
        return vec![ValidationError::EmptyTemplate];
    }

    let mut errors = Vec::new();

    let mut node_ids: HashSet<&str> = HashSet::new();
    for node in &template.nodes {
        if !node_ids.insert(node.id.as_str()) {
            errors.push(ValidationError::DuplicateNodeId(node.id.clone()));
        }
    }

    let starts: Vec<String> = template
        .start_nodes()
        .iter()
        .map(|n| n.id.clone())
        .collect();
    match starts.len() {
        0 => errors.push(ValidationError::MissingStartNode),
        1 => {}
        _ => errors.push(ValidationError::MultipleStartNodes(starts)),
    }

    for node in &template.nodes {
        errors.extend(validate_node(node, &node_ids));
    }

    for link in &template.links {
        if !node_ids.contains(link.source.as_str()) || !node_ids.contains(link.target.as_str()) {
            errors.push(ValidationError::InvalidLink {
                source: link.source.clone(),
                target: link.target.clone(),
            });
        }
    }

    if errors.is_empty() {
        report_unreachable(template);
        info!(
            "Template '{}' v{} validated: {} nodes, {} links",
            template.name,
            template.version,
            template.nodes.len(),
            template.links.len()
        );
    }

    errors
}

/// Returns the IDs of nodes that cannot be reached from the start node.
///
/// Both links and gateway routing targets count as edges. Cycles are allowed.
pub fn unreachable_nodes(template: &WorkflowTemplate) -> Vec<String> {
    let Some(start) = template.start_node() else {
        return Vec::new();
    };

    let mut visited: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::from([start.id.as_str()]);

    while let Some(current) = queue.pop_front() {
        if !visited.insert(current) {
            continue;
        }
        let Some(node) = template.node(current) else {
            continue;
        };

        let routed = node
            .routing_tables
            .iter()
            .filter(|_| node.node_type == NodeType::Gateway)
            .map(|e| e.target.as_str());
        let linked = template
            .links
            .iter()
            .filter(|l| l.source == current)
            .map(|l| l.target.as_str());

        queue.extend(routed.chain(linked));
    }

    template
        .nodes
        .iter()
        .filter(|n| !visited.contains(n.id.as_str()))
        .map(|n| n.id.clone())
        .collect()
}

fn report_unreachable(template: &WorkflowTemplate) {
    for id in unreachable_nodes(template) {
        warn!(
            "Template '{}': node '{}' is not reachable from the start node",
            template.name, id
        );
    }
}

/// Quick validation that returns a list of error messages.
///
/// Useful for CLI feedback.
pub fn quick_validate(template: &WorkflowTemplate) -> Vec<String> {
    validate_template(template)
        .iter()
        .map(|e| e.to_string())
        .collect()
}
