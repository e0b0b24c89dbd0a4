//! Node-to-node RPC transport.
//!
//! The replication layer talks to peers through the `Transport` trait only,
//! so the wire can be swapped without touching scheduling code. The
//! in-process `Fabric` implementation wires several logical nodes together
//! inside one process and backs the multi-node tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::debug;

use crate::task::NodeId;

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors that can occur on the wire.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("No route to node {0}")]
    UnknownNode(NodeId),

    #[error("Node {node} has no RPC named {name}")]
    UnknownRpc { node: NodeId, name: String },

    #[error("RPC {0} failed on the remote side: {1}")]
    Remote(String, String),
}

/// An async RPC handler: payload bytes in, response bytes out.
pub type RpcHandler =
    Arc<dyn Fn(NodeId, Vec<u8>) -> BoxFuture<'static, Result<Vec<u8>>> + Send + Sync>;

/// Point-to-point messaging between runtime nodes.
#[async_trait]
pub trait Transport: Send + Sync {
    /// This node's id.
    fn node_id(&self) -> NodeId;

    /// Every node currently reachable, including this one.
    fn nodes(&self) -> Vec<NodeId>;

    /// Expose a named RPC on this node. Re-registering replaces the handler.
    fn register_rpc(&self, name: &str, handler: RpcHandler);

    /// Invoke a named RPC on a peer and wait for its response.
    async fn call(&self, node: NodeId, name: &str, payload: Vec<u8>) -> Result<Vec<u8>>;
}

// ============================================================================
// In-process fabric
// ============================================================================

#[derive(Default)]
struct Endpoint {
    handlers: parking_lot::RwLock<HashMap<String, RpcHandler>>,
}

/// A set of in-process nodes joined by direct handler invocation.
#[derive(Default)]
pub struct Fabric {
    endpoints: parking_lot::RwLock<HashMap<NodeId, Arc<Endpoint>>>,
}

impl Fabric {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add a node to the fabric and return its transport handle.
    pub fn join(self: &Arc<Self>, node: NodeId) -> Arc<ChannelTransport> {
        let endpoint = Arc::new(Endpoint::default());
        self.endpoints.write().insert(node, Arc::clone(&endpoint));
        debug!(node, "Node joined fabric");
        Arc::new(ChannelTransport {
            node,
            fabric: Arc::clone(self),
        })
    }

    fn endpoint(&self, node: NodeId) -> Result<Arc<Endpoint>> {
        self.endpoints
            .read()
            .get(&node)
            .cloned()
            .ok_or(TransportError::UnknownNode(node))
    }
}

/// One node's handle onto an in-process `Fabric`.
pub struct ChannelTransport {
    node: NodeId,
    fabric: Arc<Fabric>,
}

#[async_trait]
impl Transport for ChannelTransport {
    fn node_id(&self) -> NodeId {
        self.node
    }

    fn nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.fabric.endpoints.read().keys().copied().collect();
        nodes.sort_unstable();
        nodes
    }

    fn register_rpc(&self, name: &str, handler: RpcHandler) {
        let endpoint = self
            .fabric
            .endpoint(self.node)
            .expect("own endpoint always registered");
        endpoint.handlers.write().insert(name.to_string(), handler);
    }

    async fn call(&self, node: NodeId, name: &str, payload: Vec<u8>) -> Result<Vec<u8>> {
        let endpoint = self.fabric.endpoint(node)?;
        let handler = {
            let handlers = endpoint.handlers.read();
            handlers
                .get(name)
                .cloned()
                .ok_or_else(|| TransportError::UnknownRpc {
                    node,
                    name: name.to_string(),
                })?
        };
        handler(self.node, payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_handler() -> RpcHandler {
        Arc::new(|origin, payload| {
            Box::pin(async move {
                let mut out = origin.to_le_bytes().to_vec();
                out.extend_from_slice(&payload);
                Ok(out)
            })
        })
    }

    #[tokio::test]
    async fn test_cross_node_call() {
        let fabric = Fabric::new();
        let a = fabric.join(1);
        let b = fabric.join(2);
        b.register_rpc("echo", echo_handler());

        let reply = a.call(2, "echo", vec![7, 8]).await.unwrap();
        assert_eq!(reply, vec![1, 0, 0, 0, 7, 8]);
    }

    #[tokio::test]
    async fn test_unknown_node_is_an_error() {
        let fabric = Fabric::new();
        let a = fabric.join(1);
        let err = a.call(9, "echo", Vec::new()).await.unwrap_err();
        assert!(matches!(err, TransportError::UnknownNode(9)));
    }

    #[tokio::test]
    async fn test_unknown_rpc_is_an_error() {
        let fabric = Fabric::new();
        let a = fabric.join(1);
        fabric.join(2);
        let err = a.call(2, "echo", Vec::new()).await.unwrap_err();
        assert!(matches!(err, TransportError::UnknownRpc { node: 2, .. }));
    }

    #[tokio::test]
    async fn test_nodes_lists_whole_fabric() {
        let fabric = Fabric::new();
        let a = fabric.join(1);
        fabric.join(3);
        fabric.join(2);
        assert_eq!(a.nodes(), vec![1, 2, 3]);
    }
}
