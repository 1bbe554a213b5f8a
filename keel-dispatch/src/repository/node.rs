//! Node Repository
//!
//! Catalog of registered nodes.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use keel_core::domain::node::Node;

use super::RepositoryError;

#[async_trait]
pub trait NodeCatalog: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Node>, RepositoryError>;

    /// Inserts a new node; `Conflict` if the ID is taken
    async fn create(&self, node: Node) -> Result<Node, RepositoryError>;

    /// Replaces an existing node; `NotFound` if the ID is unknown
    async fn update(&self, node: Node) -> Result<Node, RepositoryError>;

    async fn list(&self) -> Result<Vec<Node>, RepositoryError>;
}

#[derive(Debug, Default)]
pub struct InMemoryNodeCatalog {
    nodes: RwLock<HashMap<String, Node>>,
}

impl InMemoryNodeCatalog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NodeCatalog for InMemoryNodeCatalog {
    async fn get(&self, id: &str) -> Result<Option<Node>, RepositoryError> {
        Ok(self
            .nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned())
    }

    async fn create(&self, node: Node) -> Result<Node, RepositoryError> {
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        if nodes.contains_key(&node.id) {
            return Err(RepositoryError::Conflict(node.id));
        }
        nodes.insert(node.id.clone(), node.clone());
        Ok(node)
    }

    async fn update(&self, node: Node) -> Result<Node, RepositoryError> {
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        match nodes.get_mut(&node.id) {
            Some(existing) => {
                *existing = node.clone();
                Ok(node)
            }
            None => Err(RepositoryError::NotFound(node.id)),
        }
    }

    async fn list(&self) -> Result<Vec<Node>, RepositoryError> {
        let mut nodes: Vec<Node> = self
            .nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(nodes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_get_update() {
        let catalog = InMemoryNodeCatalog::new();
        catalog.create(Node::new("node-1", "physical")).await.unwrap();

        assert!(matches!(
            catalog.create(Node::new("node-1", "virtual")).await,
            Err(RepositoryError::Conflict(_))
        ));

        let mut node = catalog.get("node-1").await.unwrap().unwrap();
        node.alias = Some("rack-a".into());
        catalog.update(node).await.unwrap();
        assert_eq!(
            catalog.get("node-1").await.unwrap().unwrap().alias.as_deref(),
            Some("rack-a")
        );

        assert!(matches!(
            catalog.update(Node::new("ghost", "physical")).await,
            Err(RepositoryError::NotFound(_))
        ));
    }
}
