use std::{fmt, sync::Arc, time::Duration};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::node::NodeError;

/// How long a success status stays up before the node goes back to idling.
pub const SUCCESS_REVERT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Fill {
    Grey,
    Green,
    Yellow,
    Red,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Shape {
    Dot,
    Ring,
}

/// Status light shown next to a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub fill: Fill,
    pub shape: Shape,
    pub text: String,
}

impl NodeStatus {
    pub fn new(fill: Fill, shape: Shape, text: &str) -> Self {
        Self {
            fill,
            shape,
            text: text.to_string(),
        }
    }

    pub fn idling() -> Self {
        Self::new(Fill::Grey, Shape::Dot, "idling")
    }

    pub fn processing() -> Self {
        Self::new(Fill::Yellow, Shape::Ring, "Processing...")
    }

    pub fn success() -> Self {
        Self::new(Fill::Green, Shape::Dot, "success")
    }

    pub fn error() -> Self {
        Self::new(Fill::Red, Shape::Ring, "error detecting objects")
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {:?} {}", self.fill, self.shape, self.text)
    }
}

/// What the surrounding runtime offers a node: a status light and an
/// error channel.
pub trait NodeHost: Send + Sync {
    fn status(&self, node_id: &str, status: NodeStatus);
    fn error(&self, node_id: &str, err: &NodeError);
}

/// Host that only writes to the tracing log.
#[derive(Debug, Clone, Default)]
pub struct TracingHost;

impl NodeHost for TracingHost {
    fn status(&self, node_id: &str, status: NodeStatus) {
        info!(node = %node_id, "status: {}", status);
    }

    fn error(&self, node_id: &str, err: &NodeError) {
        error!(node = %node_id, error = %err, "node failed");
    }
}

/// Status slot of one node. `generation` moves on with every status set,
/// so a delayed revert only lands if nothing was set after it.
#[derive(Debug, Default)]
struct Slot {
    generation: u64,
    revert: Option<JoinHandle<()>>,
}

impl Slot {
    fn advance(&mut self) -> u64 {
        self.generation += 1;
        if let Some(handle) = self.revert.take() {
            handle.abort();
        }
        self.generation
    }
}

/// Publishes statuses to the host and owns the delayed reversions.
///
/// At most one reversion is pending per node id. Setting a new status
/// for that node supersedes it, so a stale revert can never overwrite a
/// newer status.
#[derive(Clone)]
pub struct StatusBoard {
    host: Arc<dyn NodeHost>,
    slots: Arc<DashMap<String, Slot>>,
}

impl StatusBoard {
    pub fn new(host: Arc<dyn NodeHost>) -> Self {
        Self {
            host,
            slots: Arc::new(DashMap::new()),
        }
    }

    pub fn host(&self) -> &Arc<dyn NodeHost> {
        &self.host
    }

    pub fn set(&self, node_id: &str, status: NodeStatus) {
        let mut slot = self.slots.entry(node_id.to_string()).or_default();
        slot.advance();
        self.host.status(node_id, status);
    }

    /// Show `status` now and `then` once `after` has elapsed.
    pub fn set_then(&self, node_id: &str, status: NodeStatus, then: NodeStatus, after: Duration) {
        let mut slot = self.slots.entry(node_id.to_string()).or_default();
        let generation = slot.advance();
        self.host.status(node_id, status);

        let host = self.host.clone();
        let slots = self.slots.clone();
        let id = node_id.to_string();
        slot.revert = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            // publish under the slot lock so a concurrent `set` orders after us
            if let Some(mut slot) = slots.get_mut(&id) {
                if slot.generation == generation {
                    slot.revert = None;
                    host.status(&id, then);
                }
            }
        }));
    }

    pub fn cancel(&self, node_id: &str) {
        if let Some(mut slot) = self.slots.get_mut(node_id) {
            slot.advance();
        }
    }

    pub fn has_pending(&self, node_id: &str) -> bool {
        self.slots
            .get(node_id)
            .is_some_and(|slot| slot.revert.is_some())
    }
}

impl fmt::Debug for StatusBoard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pending = self.slots.iter().filter(|s| s.revert.is_some()).count();
        f.debug_struct("StatusBoard")
            .field("pending", &pending)
            .finish()
    }
}
