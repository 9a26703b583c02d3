use std::{borrow::Cow, fmt, sync::Arc, time::Instant};

use async_trait::async_trait;
use schemars::{JsonSchema, Schema, SchemaGenerator, json_schema};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

use crate::{
    deepstack::{DetectionClient, DetectionError},
    detection::{CustomModelNode, ObjectDetectionNode},
    message::Message,
    outline::{AnnotateError, Annotator},
    server::ServerRegistry,
    status::{NodeStatus, SUCCESS_REVERT, StatusBoard},
};

#[async_trait]
#[typetag::serde]
pub trait NodeType: Send + Sync + fmt::Debug {
    fn type_name(&self) -> String;
    async fn process(&self, msg: Message, ctx: &NodeContext) -> Result<NodeOut, NodeError>;
    fn clone_box(&self) -> Box<dyn NodeType>;
    /// Return this concrete type’s schema.
    fn schema(&self) -> Schema;
}

#[derive(Serialize, Deserialize)]
pub struct Node(pub Box<dyn NodeType>);

impl std::ops::Deref for Node {
    type Target = dyn NodeType;

    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

impl Clone for Node {
    fn clone(&self) -> Self {
        Node(self.0.clone_box())
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Node").field(&self.0).finish()
    }
}

impl JsonSchema for Node {
    fn schema_name() -> Cow<'static, str> {
        "Node".into()
    }

    // typetag tags each node externally: `{ "<type name>": { ..fields } }`
    fn json_schema(generator: &mut SchemaGenerator) -> Schema {
        let detection = generator.subschema_for::<ObjectDetectionNode>();
        let custom = generator.subschema_for::<CustomModelNode>();
        json_schema!({
            "oneOf": [
                {
                    "type": "object",
                    "properties": { (ObjectDetectionNode::TYPE_NAME): detection },
                    "required": [ObjectDetectionNode::TYPE_NAME],
                    "additionalProperties": false
                },
                {
                    "type": "object",
                    "properties": { (CustomModelNode::TYPE_NAME): custom },
                    "required": [CustomModelNode::TYPE_NAME],
                    "additionalProperties": false
                }
            ]
        })
    }
}

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("missing image payload")]
    MissingImage,
    #[error("server `{0}` is not configured")]
    ServerNotFound(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("detection failed: {0}")]
    Detection(#[from] DetectionError),
    #[error("annotation failed: {0}")]
    Annotation(#[from] AnnotateError),
}

/// Ordered outputs of one processed message. A `None` slot emits nothing
/// on that output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeOut(Vec<Option<Message>>);

impl NodeOut {
    pub fn new(outputs: Vec<Option<Message>>) -> Self {
        Self(outputs)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, slot: usize) -> Option<&Message> {
        self.0.get(slot).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut Message> {
        self.0.get_mut(slot).and_then(Option::as_mut)
    }

    pub fn iter(&self) -> impl Iterator<Item = Option<&Message>> {
        self.0.iter().map(Option::as_ref)
    }
}

/// Collaborators a node needs while processing a message.
#[derive(Clone)]
pub struct NodeContext {
    servers: Arc<ServerRegistry>,
    client: Arc<dyn DetectionClient>,
    annotator: Arc<dyn Annotator>,
}

impl NodeContext {
    pub fn new(
        servers: Arc<ServerRegistry>,
        client: Arc<dyn DetectionClient>,
        annotator: Arc<dyn Annotator>,
    ) -> Self {
        Self {
            servers,
            client,
            annotator,
        }
    }

    pub fn servers(&self) -> &ServerRegistry {
        &self.servers
    }

    pub fn client(&self) -> &dyn DetectionClient {
        self.client.as_ref()
    }

    pub fn annotator(&self) -> &dyn Annotator {
        self.annotator.as_ref()
    }
}

impl fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeContext")
            .field("servers", &self.servers.names())
            .finish()
    }
}

/// A deployed node: drives the status light around `NodeType::process`
/// and reports failures to the host.
#[derive(Debug, Clone)]
pub struct NodeInstance {
    id: String,
    node: Node,
    context: NodeContext,
    status: StatusBoard,
}

impl NodeInstance {
    pub fn new(id: &str, node: Node, context: NodeContext, status: StatusBoard) -> Self {
        status.set(id, NodeStatus::idling());
        Self {
            id: id.to_string(),
            node,
            context,
            status,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    /// Handle one inbound message. Returns the outputs to send, or `None`
    /// when processing failed and nothing may be emitted.
    #[tracing::instrument(name = "node_input", skip(self, msg), fields(node = %self.id, msg = %msg.id()))]
    pub async fn on_input(&self, msg: Message) -> Option<NodeOut> {
        self.status.set(&self.id, NodeStatus::processing());
        let start = Instant::now();

        let result = self.node.process(msg, &self.context).await;
        let latency_ms = start.elapsed().as_secs_f64() * 1_000.0;

        match result {
            Ok(outputs) => {
                self.status.set_then(
                    &self.id,
                    NodeStatus::success(),
                    NodeStatus::idling(),
                    SUCCESS_REVERT,
                );
                tracing::event!(
                    target: "request",
                    tracing::Level::INFO,
                    node = %self.id,
                    kind = %self.node.type_name(),
                    latency_ms,
                    outputs = outputs.iter().filter(Option::is_some).count(),
                    status = "ok",
                );
                Some(outputs)
            }
            Err(err) => {
                self.status.set(&self.id, NodeStatus::error());
                self.status.host().error(&self.id, &err);
                error!(error = %err, "processing failed in {} ms", latency_ms);
                tracing::event!(
                    target: "request",
                    tracing::Level::INFO,
                    node = %self.id,
                    kind = %self.node.type_name(),
                    latency_ms,
                    status = "error",
                );
                None
            }
        }
    }
}
