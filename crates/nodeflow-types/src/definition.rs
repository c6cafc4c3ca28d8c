//! Workflow definition types.
//!
//! `WorkflowDefinition` is the immutable, in-memory description of a graph
//! of nodes and the connections between them. File formats and CLI tooling
//! convert to and from this struct; the engine only ever sees this shape.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::message::MessageKind;

/// Identifier of a node, unique within one definition.
pub type NodeId = String;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// The static description of a workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Stable workflow identifier (shared by all instances).
    pub id: String,
    /// Human-readable workflow name.
    pub name: String,
    /// Ordered node definitions. Order is preserved in snapshots and listings.
    pub nodes: Vec<NodeDefinition>,
    /// Directed connections between nodes.
    #[serde(default)]
    pub connections: Vec<NodeConnection>,
    /// Explicit entry point. When absent, nodes without inbound connections
    /// are seeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<NodeId>,
    /// Maximum concurrent node executions for one instance (0 = unbounded).
    #[serde(default)]
    pub max_concurrency: u32,
    /// Overall instance timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Restrict compensation to ancestors of the failed node.
    #[serde(default)]
    pub partial_compensation: bool,
    /// Extensible metadata, never interpreted by the engine.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl WorkflowDefinition {
    /// Create an empty definition with the given id and name.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            nodes: Vec::new(),
            connections: Vec::new(),
            entry_point: None,
            max_concurrency: 0,
            timeout_ms: None,
            partial_compensation: false,
            metadata: HashMap::new(),
        }
    }

    /// Append a node definition.
    pub fn with_node(mut self, node: NodeDefinition) -> Self {
        self.nodes.push(node);
        self
    }

    /// Append a connection triggered by `Complete` messages.
    pub fn connect(self, source: impl Into<NodeId>, target: impl Into<NodeId>) -> Self {
        self.with_connection(NodeConnection::new(source, target))
    }

    /// Append an arbitrary connection.
    pub fn with_connection(mut self, connection: NodeConnection) -> Self {
        self.connections.push(connection);
        self
    }

    /// Look up a node definition by id.
    pub fn node(&self, node_id: &str) -> Option<&NodeDefinition> {
        self.nodes.iter().find(|n| n.id == node_id)
    }

    /// Outbound connections of `node_id`, in definition order.
    pub fn outbound(&self, node_id: &str) -> impl Iterator<Item = &NodeConnection> {
        self.connections
            .iter()
            .filter(move |c| c.source_node_id == node_id)
    }

    /// Inbound connections of `node_id`, in definition order.
    pub fn inbound(&self, node_id: &str) -> impl Iterator<Item = &NodeConnection> {
        self.connections
            .iter()
            .filter(move |c| c.target_node_id == node_id)
    }
}

// ---------------------------------------------------------------------------
// Node Definition
// ---------------------------------------------------------------------------

/// Static description of a single node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDefinition {
    /// Unique node id within the workflow.
    pub id: NodeId,
    /// Human-readable name.
    #[serde(default)]
    pub name: String,
    /// Registry key selecting the node implementation.
    pub node_type: String,
    #[serde(default)]
    pub join_type: JoinType,
    #[serde(default)]
    pub priority: NodePriority,
    /// Concurrent executions of this node (0 = unbounded).
    #[serde(default)]
    pub max_concurrent_executions: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreakerPolicy>,
    /// Node executed to undo this node's work when the instance fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation_node_id: Option<NodeId>,
    /// Node whose output substitutes this node's while its circuit is open.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_node_id: Option<NodeId>,
    /// Per-attempt timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Implementation-specific configuration handed to `initialize`.
    #[serde(default)]
    pub config: serde_json::Value,
}

impl NodeDefinition {
    /// Create a node with default policies.
    pub fn new(id: impl Into<NodeId>, node_type: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            node_type: node_type.into(),
            join_type: JoinType::default(),
            priority: NodePriority::default(),
            max_concurrent_executions: 0,
            retry: None,
            circuit_breaker: None,
            compensation_node_id: None,
            fallback_node_id: None,
            timeout_ms: None,
            config: serde_json::Value::Null,
        }
    }

    pub fn with_join(mut self, join_type: JoinType) -> Self {
        self.join_type = join_type;
        self
    }

    pub fn with_priority(mut self, priority: NodePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_concurrent(mut self, max: u32) -> Self {
        self.max_concurrent_executions = max;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_circuit_breaker(mut self, policy: CircuitBreakerPolicy) -> Self {
        self.circuit_breaker = Some(policy);
        self
    }

    pub fn with_compensation(mut self, node_id: impl Into<NodeId>) -> Self {
        self.compensation_node_id = Some(node_id.into());
        self
    }

    pub fn with_fallback(mut self, node_id: impl Into<NodeId>) -> Self {
        self.fallback_node_id = Some(node_id.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }
}

/// How a node with several inbound connections becomes ready.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinType {
    /// The first inbound message of an epoch triggers the node.
    #[default]
    Any,
    /// Every inbound source must report for the epoch before the node runs.
    All,
}

/// Dispatch priority among ready nodes when slots are scarce.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum NodePriority {
    Low,
    #[default]
    Normal,
    High,
}

impl fmt::Display for NodePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodePriority::Low => write!(f, "low"),
            NodePriority::Normal => write!(f, "normal"),
            NodePriority::High => write!(f, "high"),
        }
    }
}

impl FromStr for NodePriority {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(NodePriority::Low),
            "normal" => Ok(NodePriority::Normal),
            "high" => Ok(NodePriority::High),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Returned when parsing an enum from an unrecognised string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown variant: '{0}'")]
pub struct UnknownVariant(pub String);

// ---------------------------------------------------------------------------
// Connections
// ---------------------------------------------------------------------------

/// A directed edge: messages of `trigger` kind produced by the source are
/// delivered to the target's queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConnection {
    pub source_node_id: NodeId,
    pub target_node_id: NodeId,
    #[serde(default = "default_trigger")]
    pub trigger: MessageKind,
    /// Only messages leaving through this output port match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_port: Option<String>,
}

fn default_trigger() -> MessageKind {
    MessageKind::Complete
}

impl NodeConnection {
    /// A `Complete`-triggered connection.
    pub fn new(source: impl Into<NodeId>, target: impl Into<NodeId>) -> Self {
        Self {
            source_node_id: source.into(),
            target_node_id: target.into(),
            trigger: MessageKind::Complete,
            source_port: None,
        }
    }

    pub fn on(mut self, trigger: MessageKind) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn from_port(mut self, port: impl Into<String>) -> Self {
        self.source_port = Some(port.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Retry Policy
// ---------------------------------------------------------------------------

/// Retry configuration for a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default)]
    pub strategy: RetryStrategy,
    /// Total tries including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Growth factor for exponential backoff.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Upper bound applied to every computed delay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
    /// Failure categories eligible for retry. Empty means every retryable failure.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retry_on: Vec<String>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    100
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            strategy: RetryStrategy::default(),
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: None,
            retry_on: Vec::new(),
        }
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay_ms: u64) -> Self {
        Self {
            strategy: RetryStrategy::Fixed,
            max_attempts,
            initial_delay_ms: delay_ms,
            ..Self::default()
        }
    }

    pub fn exponential(max_attempts: u32, initial_delay_ms: u64, multiplier: f64) -> Self {
        Self {
            strategy: RetryStrategy::Exponential,
            max_attempts,
            initial_delay_ms,
            multiplier,
            ..Self::default()
        }
    }

    pub fn linear(max_attempts: u32, initial_delay_ms: u64) -> Self {
        Self {
            strategy: RetryStrategy::Linear,
            max_attempts,
            initial_delay_ms,
            ..Self::default()
        }
    }
}

/// Backoff strategy between attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Never retry.
    None,
    /// Constant `initial_delay_ms`.
    Fixed,
    /// `initial_delay_ms * multiplier^retry`.
    #[default]
    Exponential,
    /// `initial_delay_ms * (1 + retry)`.
    Linear,
}

// ---------------------------------------------------------------------------
// Circuit Breaker Policy
// ---------------------------------------------------------------------------

/// Circuit breaker configuration for a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerPolicy {
    /// Failure rate (percent) at or above which the circuit opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold_percent: u8,
    /// Samples required in the window before the rate is evaluated.
    #[serde(default = "default_minimum_throughput")]
    pub minimum_throughput: u32,
    /// How long the circuit stays open before probing.
    #[serde(default = "default_open_duration_ms")]
    pub open_duration_ms: u64,
    /// Consecutive half-open successes required to close.
    #[serde(default = "default_half_open_successes")]
    pub half_open_successes: u32,
    /// Number of most recent outcomes considered while closed.
    #[serde(default = "default_window_size")]
    pub window_size: u32,
}

fn default_failure_threshold() -> u8 {
    50
}

fn default_minimum_throughput() -> u32 {
    5
}

fn default_open_duration_ms() -> u64 {
    30_000
}

fn default_half_open_successes() -> u32 {
    1
}

fn default_window_size() -> u32 {
    20
}

impl Default for CircuitBreakerPolicy {
    fn default() -> Self {
        Self {
            failure_threshold_percent: default_failure_threshold(),
            minimum_throughput: default_minimum_throughput(),
            open_duration_ms: default_open_duration_ms(),
            half_open_successes: default_half_open_successes(),
            window_size: default_window_size(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_definition_defaults_from_minimal_json() {
        let node: NodeDefinition =
            serde_json::from_str(r#"{"id": "fetch", "node_type": "http"}"#).unwrap();
        assert_eq!(node.join_type, JoinType::Any);
        assert_eq!(node.priority, NodePriority::Normal);
        assert_eq!(node.max_concurrent_executions, 0);
        assert!(node.retry.is_none());
        assert!(node.config.is_null());
    }

    #[test]
    fn connection_trigger_defaults_to_complete() {
        let conn: NodeConnection =
            serde_json::from_str(r#"{"source_node_id": "a", "target_node_id": "b"}"#).unwrap();
        assert_eq!(conn.trigger, MessageKind::Complete);
        assert!(conn.source_port.is_none());
    }

    #[test]
    fn retry_policy_partial_toml_fills_defaults() {
        let policy: RetryPolicy = toml::from_str("strategy = \"linear\"\nmax_attempts = 5").unwrap();
        assert_eq!(policy.strategy, RetryStrategy::Linear);
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial_delay_ms, 100);
        assert!((policy.multiplier - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn priority_ordering_and_parsing() {
        assert!(NodePriority::High > NodePriority::Normal);
        assert!(NodePriority::Normal > NodePriority::Low);
        assert_eq!("high".parse::<NodePriority>().unwrap(), NodePriority::High);
        assert!("urgent".parse::<NodePriority>().is_err());
        assert_eq!(NodePriority::Low.to_string(), "low");
    }

    #[test]
    fn definition_builder_and_lookup() {
        let def = WorkflowDefinition::new("wf", "Example")
            .with_node(NodeDefinition::new("a", "passthrough"))
            .with_node(NodeDefinition::new("b", "passthrough"))
            .connect("a", "b")
            .with_connection(NodeConnection::new("a", "b").on(MessageKind::Fail));

        assert!(def.node("a").is_some());
        assert!(def.node("zzz").is_none());
        assert_eq!(def.outbound("a").count(), 2);
        assert_eq!(def.inbound("b").count(), 2);
        assert_eq!(def.inbound("a").count(), 0);
    }

    #[test]
    fn definition_json_roundtrip_preserves_policies() {
        let def = WorkflowDefinition::new("wf", "Example").with_node(
            NodeDefinition::new("a", "http")
                .with_retry(RetryPolicy::exponential(4, 100, 2.0))
                .with_circuit_breaker(CircuitBreakerPolicy::default())
                .with_compensation("undo_a"),
        );
        let json = serde_json::to_string(&def).unwrap();
        let parsed: WorkflowDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, def);
    }
}
