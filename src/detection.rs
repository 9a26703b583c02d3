//! Object detection nodes.
//!
//! Both node types send the inbound image to a DeepStack server and fan
//! the predictions out: output 0 always carries every prediction, and
//! output `i` carries only the predictions labelled `filters[i - 1]`, or
//! nothing when no prediction carries that label.
use async_trait::async_trait;
use futures::future::try_join_all;
use schemars::{JsonSchema, Schema, schema_for};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    deepstack::{DetectionClient, Prediction, get_outlines},
    message::{Message, Payload},
    node::{NodeContext, NodeError, NodeOut, NodeType},
    outline::{Annotator, OutlineColor},
    server::ServerConfig,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DetectionConfig {
    /// Name of the server in the flow's server registry.
    pub server: String,
    /// Minimum confidence in percent, 0 to 100.
    #[serde(default = "DetectionConfig::default_confidence")]
    pub confidence: u8,
    #[serde(default)]
    pub draw_predictions: bool,
    #[serde(default)]
    pub outline_color: OutlineColor,
    /// One extra output per label, in this order.
    #[serde(default)]
    pub filters: Vec<String>,
}

impl DetectionConfig {
    fn default_confidence() -> u8 {
        45
    }

    pub fn new(server: &str) -> Self {
        Self {
            server: server.to_string(),
            confidence: Self::default_confidence(),
            draw_predictions: false,
            outline_color: OutlineColor::default(),
            filters: vec![],
        }
    }

    pub fn with_confidence(mut self, confidence: u8) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_filters(mut self, filters: &[&str]) -> Self {
        self.filters = filters.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn with_drawing(mut self, color: OutlineColor) -> Self {
        self.draw_predictions = true;
        self.outline_color = color;
        self
    }

    /// Confidence as the 0..=1 fraction the server expects.
    pub fn min_confidence(&self) -> f32 {
        f32::from(self.confidence.min(100)) / 100.0
    }
}

/// Run detection on the image in `msg` and build one output per filter.
///
/// `msg` is enriched with the predictions, the success flag, the duration
/// and the original image. Every filter output is an independent copy of
/// the enriched message.
pub async fn object_detection(
    mut msg: Message,
    config: &DetectionConfig,
    server: &ServerConfig,
    custom_model: Option<&str>,
    client: &dyn DetectionClient,
    annotator: &dyn Annotator,
) -> Result<NodeOut, NodeError> {
    let original = msg.payload().image_bytes().ok_or(NodeError::MissingImage)?;

    let result = client
        .detect(&original, server, config.min_confidence(), custom_model)
        .await?;
    debug!(
        predictions = result.predictions.len(),
        success = result.success,
        "detection result"
    );

    msg.set_payload(Payload::Predictions(result.predictions.clone()));
    msg.set_success(result.success);
    msg.set_duration(result.duration.unwrap_or(0.0));
    msg.set_original_image(original.clone());

    if config.draw_predictions {
        let outlined = annotator
            .outline(&original, &get_outlines(&result.predictions), config.outline_color)
            .await?;
        msg.set_outlined_image(outlined);
    }

    let mut branches: Vec<Option<Message>> = config
        .filters
        .iter()
        .map(|label| {
            let selected = matching(&result.predictions, label);
            if selected.is_empty() {
                return None;
            }
            let mut branch = msg.clone();
            branch.set_payload(Payload::Predictions(selected));
            Some(branch)
        })
        .collect();

    if config.draw_predictions {
        let image = &original;
        let color = config.outline_color;
        let outlined = try_join_all(branches.iter().map(|branch| async move {
            match branch.as_ref().and_then(|b| b.payload().predictions()) {
                Some(predictions) => annotator
                    .outline(image, &get_outlines(predictions), color)
                    .await
                    .map(Some),
                None => Ok(None),
            }
        }))
        .await?;

        for (branch, image) in branches.iter_mut().zip(outlined) {
            if let (Some(branch), Some(image)) = (branch.as_mut(), image) {
                branch.set_outlined_image(image);
            }
        }
    }

    let mut outputs = Vec::with_capacity(1 + branches.len());
    outputs.push(Some(msg));
    outputs.append(&mut branches);
    Ok(NodeOut::new(outputs))
}

fn matching(predictions: &[Prediction], label: &str) -> Vec<Prediction> {
    predictions
        .iter()
        .filter(|p| p.label == label)
        .cloned()
        .collect()
}

/// Detection with the server's built-in object model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename = "deepstack-object-detection")]
pub struct ObjectDetectionNode {
    #[serde(flatten)]
    pub config: DetectionConfig,
}

impl ObjectDetectionNode {
    pub const TYPE_NAME: &'static str = "deepstack-object-detection";

    pub fn new(config: DetectionConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
#[typetag::serde(name = "deepstack-object-detection")]
impl NodeType for ObjectDetectionNode {
    fn type_name(&self) -> String {
        Self::TYPE_NAME.to_string()
    }

    fn schema(&self) -> Schema {
        schema_for!(ObjectDetectionNode)
    }

    #[tracing::instrument(name = "object_detection_node_process", skip(self, msg, ctx))]
    async fn process(&self, msg: Message, ctx: &NodeContext) -> Result<NodeOut, NodeError> {
        let server = ctx.servers().resolve(&self.config.server)?;
        object_detection(msg, &self.config, &server, None, ctx.client(), ctx.annotator()).await
    }

    fn clone_box(&self) -> Box<dyn NodeType> {
        Box::new(self.clone())
    }
}

/// Detection with a custom model trained and loaded on the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename = "deepstack-custom-model")]
pub struct CustomModelNode {
    /// Model name as registered on the server.
    pub model: String,
    #[serde(flatten)]
    pub config: DetectionConfig,
}

impl CustomModelNode {
    pub const TYPE_NAME: &'static str = "deepstack-custom-model";

    pub fn new(model: &str, config: DetectionConfig) -> Self {
        Self {
            model: model.to_string(),
            config,
        }
    }
}

#[async_trait]
#[typetag::serde(name = "deepstack-custom-model")]
impl NodeType for CustomModelNode {
    fn type_name(&self) -> String {
        Self::TYPE_NAME.to_string()
    }

    fn schema(&self) -> Schema {
        schema_for!(CustomModelNode)
    }

    #[tracing::instrument(name = "custom_model_node_process", skip(self, msg, ctx), fields(model = %self.model))]
    async fn process(&self, msg: Message, ctx: &NodeContext) -> Result<NodeOut, NodeError> {
        if self.model.trim().is_empty() {
            return Err(NodeError::InvalidConfig("custom model name is empty".into()));
        }
        let server = ctx.servers().resolve(&self.config.server)?;
        object_detection(
            msg,
            &self.config,
            &server,
            Some(&self.model),
            ctx.client(),
            ctx.annotator(),
        )
        .await
    }

    fn clone_box(&self) -> Box<dyn NodeType> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deepstack::{DetectionError, DetectionResult};
    use crate::message::BufferDescriptor;
    use crate::outline::AnnotateError;
    use crate::server::Protocol;
    use crate::test_util::{MockAnnotator, MockDetectionClient, prediction};

    fn server() -> ServerConfig {
        ServerConfig::new(Protocol::Http, "localhost", 80)
    }

    #[test]
    fn confidence_is_normalized_and_clamped() {
        assert_eq!(DetectionConfig::new("s").with_confidence(45).min_confidence(), 0.45);
        assert_eq!(DetectionConfig::new("s").with_confidence(0).min_confidence(), 0.0);
        assert_eq!(DetectionConfig::new("s").with_confidence(250).min_confidence(), 1.0);
    }

    #[test]
    fn config_defaults_from_yaml() {
        let config: DetectionConfig = serde_yaml_bw::from_str("server: local\n").unwrap();
        assert_eq!(config.confidence, 45);
        assert!(!config.draw_predictions);
        assert_eq!(config.outline_color, OutlineColor::rgb(255, 0, 0));
        assert!(config.filters.is_empty());
    }

    #[tokio::test]
    async fn zero_filters_yield_only_the_enriched_message() {
        let client = MockDetectionClient::returning(
            DetectionResult::new(vec![prediction("person")]).with_duration(7.0),
        );
        let out = object_detection(
            Message::new("m", Payload::Image(vec![1, 2, 3])),
            &DetectionConfig::new("s"),
            &server(),
            None,
            &client,
            &MockAnnotator::default(),
        )
        .await
        .unwrap();

        assert_eq!(out.len(), 1);
        let msg = out.get(0).unwrap();
        assert_eq!(msg.payload(), &Payload::Predictions(vec![prediction("person")]));
        assert_eq!(msg.success(), Some(true));
        assert_eq!(msg.duration(), Some(7.0));
        assert_eq!(msg.original_image(), Some(&[1u8, 2, 3][..]));
        assert!(msg.outlined_image().is_none());
        assert_eq!(msg.id(), "m");
    }

    #[tokio::test]
    async fn missing_duration_defaults_to_zero() {
        let client = MockDetectionClient::returning(DetectionResult::new(vec![]));
        let out = object_detection(
            Message::from_image(vec![1]),
            &DetectionConfig::new("s"),
            &server(),
            None,
            &client,
            &MockAnnotator::default(),
        )
        .await
        .unwrap();
        assert_eq!(out.get(0).unwrap().duration(), Some(0.0));
    }

    #[tokio::test]
    async fn confidence_and_custom_model_reach_the_client() {
        let client = MockDetectionClient::returning(DetectionResult::new(vec![]));
        object_detection(
            Message::from_image(vec![1]),
            &DetectionConfig::new("s").with_confidence(60),
            &server(),
            Some("fire"),
            &client,
            &MockAnnotator::default(),
        )
        .await
        .unwrap();

        let call = client.last_call().unwrap();
        assert_eq!(call.min_confidence, 0.6);
        assert_eq!(call.custom_model.as_deref(), Some("fire"));
    }

    #[tokio::test]
    async fn buffer_descriptor_is_materialized() {
        let client = MockDetectionClient::returning(DetectionResult::new(vec![]));
        object_detection(
            Message::new("m", Payload::Buffer(BufferDescriptor::new(vec![255, 216, 255, 224]))),
            &DetectionConfig::new("s"),
            &server(),
            None,
            &client,
            &MockAnnotator::default(),
        )
        .await
        .unwrap();

        assert_eq!(client.last_call().unwrap().image, vec![255, 216, 255, 224]);
    }

    #[tokio::test]
    async fn missing_image_fails_before_detection() {
        let client = MockDetectionClient::returning(DetectionResult::new(vec![]));
        let err = object_detection(
            Message::new("m", Payload::Empty),
            &DetectionConfig::new("s"),
            &server(),
            None,
            &client,
            &MockAnnotator::default(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, NodeError::MissingImage));
        assert_eq!(client.calls(), 0);
    }

    #[tokio::test]
    async fn detection_failure_propagates_unchanged() {
        let client = MockDetectionClient::failing("service unavailable");
        let err = object_detection(
            Message::from_image(vec![1]),
            &DetectionConfig::new("s").with_filters(&["cat"]),
            &server(),
            None,
            &client,
            &MockAnnotator::default(),
        )
        .await
        .unwrap_err();

        match err {
            NodeError::Detection(DetectionError::Service(reason)) => {
                assert_eq!(reason, "service unavailable")
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn branches_are_outlined_with_their_own_predictions() {
        let client = MockDetectionClient::returning(DetectionResult::new(vec![
            prediction("cat"),
            prediction("dog"),
            prediction("cat"),
        ]));
        let annotator = MockAnnotator::default();
        let out = object_detection(
            Message::from_image(vec![1]),
            &DetectionConfig::new("s")
                .with_filters(&["cat", "bird", "dog"])
                .with_drawing(OutlineColor::rgb(0, 0, 255)),
            &server(),
            None,
            &client,
            &annotator,
        )
        .await
        .unwrap();

        assert_eq!(out.len(), 4);
        // the mock encodes the outline count as the image
        assert_eq!(out.get(0).unwrap().outlined_image(), Some(&[3u8][..]));
        assert_eq!(out.get(1).unwrap().outlined_image(), Some(&[2u8][..]));
        assert!(out.get(2).is_none());
        assert_eq!(out.get(3).unwrap().outlined_image(), Some(&[1u8][..]));
        assert_eq!(annotator.calls(), 3);
        assert_eq!(annotator.last_color(), Some(OutlineColor::rgb(0, 0, 255)));
    }

    #[tokio::test]
    async fn annotation_failure_aborts_everything() {
        let client = MockDetectionClient::returning(DetectionResult::new(vec![prediction("cat")]));
        let err = object_detection(
            Message::from_image(vec![1]),
            &DetectionConfig::new("s")
                .with_filters(&["cat"])
                .with_drawing(OutlineColor::default()),
            &server(),
            None,
            &client,
            &MockAnnotator::failing(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, NodeError::Annotation(_)));
    }

    #[tokio::test]
    async fn branch_annotation_failure_aborts_everything() {
        let client = MockDetectionClient::returning(DetectionResult::new(vec![
            prediction("cat"),
            prediction("dog"),
        ]));
        // call 1 outlines the full result, calls 2 and 3 the branches
        let annotator = MockAnnotator::failing_on(3);
        let err = object_detection(
            Message::from_image(vec![1]),
            &DetectionConfig::new("s")
                .with_filters(&["cat", "dog"])
                .with_drawing(OutlineColor::default()),
            &server(),
            None,
            &client,
            &annotator,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, NodeError::Annotation(AnnotateError::Task(_))));
        assert_eq!(annotator.calls(), 3);
    }

    #[tokio::test]
    async fn filters_match_labels_exactly() {
        let client = MockDetectionClient::returning(DetectionResult::new(vec![prediction("Cat")]));
        let out = object_detection(
            Message::from_image(vec![1]),
            &DetectionConfig::new("s").with_filters(&["cat", "Ca", "Cat"]),
            &server(),
            None,
            &client,
            &MockAnnotator::default(),
        )
        .await
        .unwrap();
        assert_eq!(out.len(), 4);
        assert!(out.get(1).is_none());
        assert!(out.get(2).is_none());
        assert!(out.get(3).is_some());
    }

    #[test]
    fn node_serde_uses_type_tags() {
        let node = crate::node::Node(Box::new(CustomModelNode::new(
            "fire",
            DetectionConfig::new("local").with_filters(&["fire"]),
        )));
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["deepstack-custom-model"]["model"], "fire");
        assert_eq!(json["deepstack-custom-model"]["server"], "local");

        let back: crate::node::Node = serde_json::from_value(json).unwrap();
        assert_eq!(back.type_name(), CustomModelNode::TYPE_NAME);
    }

    #[tokio::test]
    async fn custom_node_rejects_blank_model() {
        let ctx = NodeContext::new(
            std::sync::Arc::new(crate::server::ServerRegistry::new()),
            std::sync::Arc::new(MockDetectionClient::default()),
            std::sync::Arc::new(MockAnnotator::default()),
        );
        let node = CustomModelNode::new(" ", DetectionConfig::new("local"));
        let err = node.process(Message::from_image(vec![1]), &ctx).await.unwrap_err();
        assert!(matches!(err, NodeError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn unknown_server_is_reported() {
        let ctx = NodeContext::new(
            std::sync::Arc::new(crate::server::ServerRegistry::new()),
            std::sync::Arc::new(MockDetectionClient::default()),
            std::sync::Arc::new(MockAnnotator::default()),
        );
        let node = ObjectDetectionNode::new(DetectionConfig::new("nowhere"));
        let err = node.process(Message::from_image(vec![1]), &ctx).await.unwrap_err();
        assert!(matches!(err, NodeError::ServerNotFound(name) if name == "nowhere"));
    }
}
