//! Node registry for runtime node construction.
//!
//! Maps a `node_type` string to a factory. Embedders populate the registry
//! at startup; the engine instantiates one node per definition when an
//! instance starts or resumes.

use std::collections::HashMap;
use std::sync::Arc;

use nodeflow_types::definition::{NodeDefinition, NodeId};

use super::box_node::BoxNode;
use super::builtin::{DelayNode, ForEachNode, PassthroughNode};
use super::{Node, NodeError};

/// Constructs a node for a definition.
pub type NodeFactory = Arc<dyn Fn(&NodeDefinition) -> Result<BoxNode, NodeError> + Send + Sync>;

/// Errors raised while turning definitions into nodes.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown node type '{node_type}' for node '{node_id}'")]
    UnknownType { node_type: String, node_id: NodeId },

    #[error("failed to initialize node '{node_id}': {source}")]
    Initialization {
        node_id: NodeId,
        #[source]
        source: NodeError,
    },
}

/// Registry of node factories, indexed by type name.
pub struct NodeRegistry {
    factories: HashMap<String, NodeFactory>,
}

impl NodeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Create a registry pre-populated with the builtin node types.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_default::<PassthroughNode>(PassthroughNode::TYPE);
        registry.register_default::<ForEachNode>(ForEachNode::TYPE);
        registry.register_default::<DelayNode>(DelayNode::TYPE);
        registry
    }

    /// Register a factory under the given type name.
    ///
    /// If a factory with this name already exists, it is replaced.
    pub fn register<F>(&mut self, node_type: impl Into<String>, factory: F)
    where
        F: Fn(&NodeDefinition) -> Result<BoxNode, NodeError> + Send + Sync + 'static,
    {
        self.factories.insert(node_type.into(), Arc::new(factory));
    }

    /// Register a node type constructed through `Default`.
    pub fn register_default<T: Node + Default + 'static>(&mut self, node_type: impl Into<String>) {
        self.register(node_type, |_| Ok(BoxNode::new(T::default())));
    }

    /// Build and initialize the node for `definition`.
    pub fn create(&self, definition: &NodeDefinition) -> Result<BoxNode, RegistryError> {
        let factory =
            self.factories
                .get(&definition.node_type)
                .ok_or_else(|| RegistryError::UnknownType {
                    node_type: definition.node_type.clone(),
                    node_id: definition.id.clone(),
                })?;

        let mut node = factory(definition).map_err(|source| RegistryError::Initialization {
            node_id: definition.id.clone(),
            source,
        })?;
        node.initialize(definition)
            .map_err(|source| RegistryError::Initialization {
                node_id: definition.id.clone(),
                source,
            })?;
        Ok(node)
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.factories.contains_key(node_type)
    }

    /// List all registered type names, sorted.
    pub fn list_types(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRegistry")
            .field("types", &self.list_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builtins_are_registered() {
        let registry = NodeRegistry::with_builtins();
        assert_eq!(registry.list_types(), vec!["delay", "for_each", "passthrough"]);
        assert!(registry.contains("passthrough"));
        assert!(!registry.contains("http"));
    }

    #[test]
    fn unknown_type_is_an_error() {
        let registry = NodeRegistry::new();
        let err = registry
            .create(&NodeDefinition::new("fetch", "http"))
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnknownType { .. }));
        assert!(err.to_string().contains("http"));
        assert!(err.to_string().contains("fetch"));
    }

    #[test]
    fn initialization_failure_is_reported_with_node_id() {
        let registry = NodeRegistry::with_builtins();
        let def = NodeDefinition::new("wait", "delay").with_config(json!({"delay_ms": "soon"}));
        let err = registry.create(&def).unwrap_err();
        match err {
            RegistryError::Initialization { node_id, .. } => assert_eq!(node_id, "wait"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn custom_factory_sees_definition() {
        let mut registry = NodeRegistry::new();
        registry.register("custom", |def: &NodeDefinition| {
            if def.config.get("reject").is_some() {
                Err(NodeError::Initialization("rejected by factory".into()))
            } else {
                Ok(BoxNode::new(PassthroughNode))
            }
        });

        assert!(registry.create(&NodeDefinition::new("ok", "custom")).is_ok());
        let rejected = NodeDefinition::new("no", "custom").with_config(json!({"reject": true}));
        assert!(registry.create(&rejected).is_err());
    }

    #[test]
    fn register_replaces_existing_factory() {
        let mut registry = NodeRegistry::with_builtins();
        registry.register("passthrough", |_| {
            Err(NodeError::Initialization("disabled".into()))
        });
        assert!(registry
            .create(&NodeDefinition::new("p", "passthrough"))
            .is_err());
    }
}
