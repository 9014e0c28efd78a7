//! Workflow Template Model
//!
//! Immutable definitions that the engine instantiates: nodes, the links
//! between them and the routing tables of gateway nodes.
//!
//! # Example YAML Format
//!
//! ```yaml
//! name: purchase_order
//! uuid: 5b7f0d2e-4b5c-4d7e-9f77-1c3a6b0f9a10
//! version: 3
//! is_default: true
//! nodes:
//!   - id: start
//!     type: start
//!   - id: review
//!     type: task
//!     page: po_review
//!     roles: [purchasing]
//!   - id: decide
//!     type: gateway
//!     routing_tables:
//!       - data: status
//!         value: approved
//!         target: finish
//!       - default: true
//!         target: archive
//!   - id: archive
//!     type: task
//!     handler: archive_po
//!   - id: finish
//!     type: end
//! links:
//!   - source: start
//!     target: review
//!   - source: review
//!     target: decide
//!   - source: archive
//!     target: finish
//! ```

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use log::warn;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Key/value working data carried from task to task.
pub type ProcessData = Map<String, Value>;

/// Kind of a template node.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    /// Structural entry marker, never exploded as a task
    Start,
    /// Unit of work, human (with a page) or server-driven (without)
    Task,
    /// Conditional branch point driven by its routing table
    Gateway,
    /// Structural exit marker that triggers the completion check
    End,
}

impl NodeType {
    /// Returns the lowercase name used in templates and task rows.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Task => "task",
            Self::Gateway => "gateway",
            Self::End => "end",
        }
    }

    /// Returns true for start and end markers.
    pub fn is_structural(&self) -> bool {
        matches!(self, Self::Start | Self::End)
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Self::Start),
            "task" => Ok(Self::Task),
            "gateway" => Ok(Self::Gateway),
            "end" => Ok(Self::End),
            other => Err(format!("Unknown node type: '{}'", other)),
        }
    }
}

/// One row of a gateway's routing table.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct RoutingEntry {
    /// Matches unconditionally when set
    #[serde(default)]
    pub default: bool,

    /// Declared order; carried but not used for evaluation
    #[serde(default)]
    pub sequence: i32,

    /// Process data key to compare
    #[serde(default)]
    pub data: String,

    /// Expected value of `data`
    #[serde(default)]
    pub value: String,

    /// Node to branch to when this entry matches
    pub target: String,
}

impl RoutingEntry {
    /// Creates an entry that fires when `data[key] == value`.
    pub fn when(key: impl Into<String>, value: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            data: key.into(),
            value: value.into(),
            target: target.into(),
            ..Self::default()
        }
    }

    /// Creates an entry that always fires.
    pub fn otherwise(target: impl Into<String>) -> Self {
        Self {
            default: true,
            target: target.into(),
            ..Self::default()
        }
    }

    /// Sets the sequence number.
    pub fn with_sequence(mut self, sequence: i32) -> Self {
        self.sequence = sequence;
        self
    }
}

/// Directed edge between two nodes.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Link {
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub label: String,
}

impl Link {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            label: String::new(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

/// A single node of a workflow template.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Node {
    /// Unique identifier within the template
    pub id: String,

    #[serde(rename = "type")]
    pub node_type: NodeType,

    /// UI page shown to the assignee; nodes with a page wait for a human
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<String>,

    /// Name of the business logic run when the node executes server-side
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,

    /// Role names the task is assigned to
    #[serde(default, deserialize_with = "single_or_vec")]
    pub roles: Vec<String>,

    /// User names the task is assigned to
    #[serde(default, deserialize_with = "single_or_vec")]
    pub users: Vec<String>,

    /// Seed values merged under the incoming process data
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub process_data: ProcessData,

    /// Only meaningful for gateways
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routing_tables: Vec<RoutingEntry>,
}

/// Deserializes either a single string or array of strings into Vec<String>
fn single_or_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    match val {
        Value::Null => Ok(Vec::new()),
        Value::String(s) if s.is_empty() => Ok(Vec::new()),
        Value::String(s) => Ok(vec![s]),
        Value::Array(arr) => arr
            .into_iter()
            .map(|v| match v {
                Value::String(s) => Ok(s),
                _ => Err(de::Error::custom("Expected string in array")),
            })
            .collect(),
        _ => Err(de::Error::custom("Expected string or array of strings")),
    }
}

impl Node {
    /// Creates a node of the given type.
    ///
    /// # Example
    ///
    /// ```
    /// use flowcore::template::{Node, NodeType};
    ///
    /// let node = Node::new("review", NodeType::Task)
    ///     .with_page("po_review")
    ///     .with_role("purchasing");
    /// assert!(node.waits_for_human());
    /// ```
    pub fn new(id: impl Into<String>, node_type: NodeType) -> Self {
        Self {
            id: id.into().trim().to_string(),
            node_type,
            page: None,
            handler: None,
            roles: Vec::new(),
            users: Vec::new(),
            process_data: ProcessData::new(),
            routing_tables: Vec::new(),
        }
    }

    pub fn start(id: impl Into<String>) -> Self {
        Self::new(id, NodeType::Start)
    }

    pub fn task(id: impl Into<String>) -> Self {
        Self::new(id, NodeType::Task)
    }

    pub fn gateway(id: impl Into<String>) -> Self {
        Self::new(id, NodeType::Gateway)
    }

    pub fn end(id: impl Into<String>) -> Self {
        Self::new(id, NodeType::End)
    }

    pub fn with_page(mut self, page: impl Into<String>) -> Self {
        self.page = Some(page.into());
        self
    }

    pub fn with_handler(mut self, handler: impl Into<String>) -> Self {
        self.handler = Some(handler.into());
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.users.push(user.into());
        self
    }

    /// Adds a seed value to the node's process data.
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.process_data.insert(key.into(), value.into());
        self
    }

    pub fn with_route(mut self, entry: RoutingEntry) -> Self {
        self.routing_tables.push(entry);
        self
    }

    /// Returns true if the node stops at `Started` until an external actor completes it.
    ///
    /// Structural nodes never wait, even when a page is configured.
    pub fn waits_for_human(&self) -> bool {
        !self.node_type.is_structural() && self.page.is_some()
    }

    /// Returns true if a notification is emitted when the node is exploded.
    pub fn notifies(&self) -> bool {
        matches!(self.node_type, NodeType::Task | NodeType::Gateway) && self.page.is_some()
    }
}

/// A complete workflow template.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkflowTemplate {
    pub name: String,

    #[serde(default)]
    pub uuid: String,

    #[serde(default = "default_version")]
    pub version: u32,

    /// Whether this version is served for lookups by name
    #[serde(default)]
    pub is_default: bool,

    #[serde(default)]
    pub nodes: Vec<Node>,

    #[serde(default)]
    pub links: Vec<Link>,
}

fn default_version() -> u32 {
    1
}

impl WorkflowTemplate {
    /// Creates an empty default template with a fresh UUID.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uuid: uuid::Uuid::new_v4().to_string(),
            version: 1,
            is_default: true,
            nodes: Vec::new(),
            links: Vec::new(),
        }
    }

    /// Adds a node, rejecting duplicate IDs.
    pub fn add_node(&mut self, node: Node) -> Result<(), String> {
        if self.nodes.iter().any(|n| n.id == node.id) {
            return Err(format!("Node '{}' already exists", node.id));
        }
        self.nodes.push(node);
        Ok(())
    }

    /// Adds a link between two existing nodes.
    pub fn add_link(&mut self, link: Link) -> Result<(), String> {
        for id in [&link.source, &link.target] {
            if self.node(id).is_none() {
                return Err(format!("Link references unknown node '{}'", id));
            }
        }
        self.links.push(link);
        Ok(())
    }

    /// Builder form of [`add_node`](Self::add_node) for fixtures.
    ///
    /// A duplicate node ID is logged and dropped; debug builds panic on it.
    pub fn with_node(mut self, node: Node) -> Self {
        let added = self.add_node(node);
        if let Err(e) = &added {
            warn!("Template '{}': {}", self.name, e);
        }
        debug_assert!(added.is_ok(), "{:?}", added);
        self
    }

    /// Builder form of link insertion; does not check node existence.
    pub fn with_link(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.links.push(Link::new(source, target));
        self
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Returns every start node; a valid template has exactly one.
    pub fn start_nodes(&self) -> Vec<&Node> {
        self.nodes
            .iter()
            .filter(|n| n.node_type == NodeType::Start)
            .collect()
    }

    /// Returns the single start node, or `None` when there are zero or several.
    pub fn start_node(&self) -> Option<&Node> {
        match self.start_nodes().as_slice() {
            [only] => Some(*only),
            _ => None,
        }
    }

    /// Returns the link targets of a node in declaration order.
    ///
    /// A target reached by several links is returned once.
    pub fn successors(&self, id: &str) -> Vec<&Node> {
        let mut seen = HashSet::new();
        self.links
            .iter()
            .filter(|l| l.source == id)
            .filter(|l| seen.insert(l.target.as_str()))
            .filter_map(|l| self.node(&l.target))
            .collect()
    }

    /// Returns the number of nodes in the template.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the template has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
