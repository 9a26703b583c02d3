use std::{collections::HashMap, fs, path::Path, sync::Arc};

use anyhow::{Context, bail};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    config::ConfigManager,
    node::{Node, NodeContext, NodeInstance},
    server::{ServerConfig, ServerRegistry},
    status::StatusBoard,
};

/// A node as it appears in a flow file.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FlowNode {
    pub id: String,
    pub node: Node,
}

/// A flow file: the servers nodes may talk to and the nodes themselves.
///
/// ```yaml
/// servers:
///   local:
///     hostname: localhost
///     port: 5000
/// nodes:
///   - id: garden
///     node:
///       deepstack-object-detection:
///         server: local
///         confidence: 60
///         draw_predictions: true
///         outline_color: "#00ff00"
///         filters: [person, cat]
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct Flow {
    #[serde(default)]
    pub servers: HashMap<String, ServerConfig>,
    #[serde(default)]
    pub nodes: Vec<FlowNode>,
}

impl Flow {
    /// Load a flow from `.json`, `.yaml` or `.yml`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("could not read flow file {}", path.display()))?;
        let flow: Flow = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&text)?,
            Some("yaml") | Some("yml") => serde_yaml_bw::from_str(&text)?,
            other => bail!("unsupported flow file extension {:?}", other),
        };
        flow.validate()?;
        info!(
            "loaded flow {} ({} servers, {} nodes)",
            path.display(),
            flow.servers.len(),
            flow.nodes.len()
        );
        Ok(flow)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let mut seen = std::collections::HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.id.as_str()) {
                bail!("duplicate node id `{}`", node.id);
            }
        }
        Ok(())
    }

    pub fn node(&self, id: &str) -> Option<&FlowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Server registry for this flow, with api keys filled in from `config`.
    pub async fn registry(&self, config: &ConfigManager) -> ServerRegistry {
        let registry = ServerRegistry::from_map(self.servers.clone());
        registry.apply_config(config).await;
        registry
    }

    /// Deploy every node of the flow against the shared collaborators.
    pub fn deploy(&self, context: &NodeContext, status: &StatusBoard) -> Vec<Arc<NodeInstance>> {
        self.nodes
            .iter()
            .map(|n| {
                Arc::new(NodeInstance::new(
                    &n.id,
                    n.node.clone(),
                    context.clone(),
                    status.clone(),
                ))
            })
            .collect()
    }
}
