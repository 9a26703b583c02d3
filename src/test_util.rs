//! Test doubles for the node collaborators.
use std::sync::{
    Mutex,
    atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::{
    deepstack::{DetectionClient, DetectionError, DetectionResult, Outline, Prediction},
    node::NodeError,
    outline::{AnnotateError, Annotator, OutlineColor},
    server::ServerConfig,
    status::{NodeHost, NodeStatus},
};

/// A prediction with the given label and a fixed box.
pub fn prediction(label: &str) -> Prediction {
    Prediction {
        label: label.to_string(),
        confidence: 0.9,
        x_min: 1,
        y_min: 1,
        x_max: 4,
        y_max: 4,
    }
}

/// Records every status and error per node id.
#[derive(Debug, Default)]
pub struct RecordingHost {
    statuses: DashMap<String, Vec<NodeStatus>>,
    errors: DashMap<String, Vec<String>>,
}

impl RecordingHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn statuses(&self, node_id: &str) -> Vec<NodeStatus> {
        self.statuses
            .get(node_id)
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub fn errors(&self, node_id: &str) -> Vec<String> {
        self.errors.get(node_id).map(|e| e.clone()).unwrap_or_default()
    }
}

impl NodeHost for RecordingHost {
    fn status(&self, node_id: &str, status: NodeStatus) {
        self.statuses
            .entry(node_id.to_string())
            .or_default()
            .push(status);
    }

    fn error(&self, node_id: &str, err: &NodeError) {
        self.errors
            .entry(node_id.to_string())
            .or_default()
            .push(err.to_string());
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectCall {
    pub image: Vec<u8>,
    pub min_confidence: f32,
    pub custom_model: Option<String>,
}

/// Detection client that replies with a canned result or error.
#[derive(Debug)]
pub struct MockDetectionClient {
    reply: Result<DetectionResult, String>,
    calls: Mutex<Vec<DetectCall>>,
}

impl Default for MockDetectionClient {
    fn default() -> Self {
        Self::returning(DetectionResult::new(vec![]))
    }
}

impl MockDetectionClient {
    pub fn returning(result: DetectionResult) -> Self {
        Self {
            reply: Ok(result),
            calls: Mutex::new(vec![]),
        }
    }

    pub fn failing(reason: &str) -> Self {
        Self {
            reply: Err(reason.to_string()),
            calls: Mutex::new(vec![]),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or_default()
    }

    pub fn last_call(&self) -> Option<DetectCall> {
        self.calls.lock().ok().and_then(|c| c.last().cloned())
    }
}

#[async_trait]
impl DetectionClient for MockDetectionClient {
    async fn detect(
        &self,
        image: &[u8],
        _server: &ServerConfig,
        min_confidence: f32,
        custom_model: Option<&str>,
    ) -> Result<DetectionResult, DetectionError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(DetectCall {
                image: image.to_vec(),
                min_confidence,
                custom_model: custom_model.map(str::to_string),
            });
        }
        self.reply.clone().map_err(DetectionError::Service)
    }
}

/// Annotator that returns a one-byte image holding the number of outlines.
#[derive(Debug, Default)]
pub struct MockAnnotator {
    fail_on: Option<usize>,
    calls: AtomicUsize,
    last_color: Mutex<Option<OutlineColor>>,
}

impl MockAnnotator {
    pub fn failing() -> Self {
        Self::failing_on(1)
    }

    /// Fail only the `call`-th annotation, counting from 1.
    pub fn failing_on(call: usize) -> Self {
        Self {
            fail_on: Some(call),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_color(&self) -> Option<OutlineColor> {
        self.last_color.lock().ok().and_then(|c| *c)
    }
}

#[async_trait]
impl Annotator for MockAnnotator {
    async fn outline(
        &self,
        _image: &[u8],
        outlines: &[Outline],
        color: OutlineColor,
    ) -> Result<Vec<u8>, AnnotateError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Ok(mut last) = self.last_color.lock() {
            *last = Some(color);
        }
        if self.fail_on == Some(call) {
            return Err(AnnotateError::Task("annotator unavailable".into()));
        }
        Ok(vec![outlines.len() as u8])
    }
}
