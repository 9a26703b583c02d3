use std::collections::HashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::deepstack::Prediction;

/// Marker for the `"type": "Buffer"` tag of a serialized byte buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, JsonSchema, Serialize, Deserialize)]
pub enum BufferTag {
    Buffer,
}

/// A byte buffer in its tagged JSON form, `{"type": "Buffer", "data": [..]}`.
#[derive(Debug, Clone, PartialEq, Eq, JsonSchema, Serialize, Deserialize)]
pub struct BufferDescriptor {
    #[serde(rename = "type")]
    pub kind: BufferTag,
    pub data: Vec<u8>,
}

impl BufferDescriptor {
    pub fn new(data: Vec<u8>) -> Self {
        Self { kind: BufferTag::Buffer, data }
    }
}

/// What a message carries in its payload.
///
/// Inbound messages hold an image, either as raw bytes or as a tagged
/// buffer descriptor. Once processed, the payload holds the predictions.
#[derive(Debug, Clone, Default, PartialEq, JsonSchema, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    #[default]
    Empty,
    Buffer(BufferDescriptor),
    Predictions(Vec<Prediction>),
    Image(Vec<u8>),
}

impl Payload {
    /// Materialize the image bytes, if the payload holds a non-empty image.
    pub fn image_bytes(&self) -> Option<Vec<u8>> {
        match self {
            Payload::Image(bytes) if !bytes.is_empty() => Some(bytes.clone()),
            Payload::Buffer(descriptor) if !descriptor.data.is_empty() => {
                Some(descriptor.data.clone())
            }
            _ => None,
        }
    }

    pub fn predictions(&self) -> Option<&[Prediction]> {
        match self {
            Payload::Predictions(predictions) => Some(predictions),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Payload::Empty)
    }
}

#[derive(Debug, Clone, PartialEq, JsonSchema, Serialize, Deserialize)]
pub struct Message {
    id: String,
    #[serde(default)]
    payload: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    original_image: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    outlined_image: Option<Vec<u8>>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

impl Message {
    pub fn new(id: &str, payload: Payload) -> Self {
        Self {
            id: id.to_string(),
            payload,
            success: None,
            duration: None,
            original_image: None,
            outlined_image: None,
            metadata: HashMap::new(),
        }
    }

    /// A message with a fresh id carrying raw image bytes.
    pub fn from_image(image: Vec<u8>) -> Self {
        Self::new(&uuid::Uuid::new_v4().to_string(), Payload::Image(image))
    }

    pub fn id(&self) -> String {
        self.id.clone()
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut Payload {
        &mut self.payload
    }

    pub fn set_payload(&mut self, payload: Payload) {
        self.payload = payload;
    }

    pub fn success(&self) -> Option<bool> {
        self.success
    }

    pub fn set_success(&mut self, success: bool) {
        self.success = Some(success);
    }

    pub fn duration(&self) -> Option<f64> {
        self.duration
    }

    pub fn set_duration(&mut self, duration: f64) {
        self.duration = Some(duration);
    }

    pub fn original_image(&self) -> Option<&[u8]> {
        self.original_image.as_deref()
    }

    pub fn set_original_image(&mut self, image: Vec<u8>) {
        self.original_image = Some(image);
    }

    pub fn outlined_image(&self) -> Option<&[u8]> {
        self.outlined_image.as_deref()
    }

    pub fn set_outlined_image(&mut self, image: Vec<u8>) {
        self.outlined_image = Some(image);
    }

    /// Copy of this message with both image fields dropped, for reporting.
    pub fn without_images(&self) -> Self {
        Self {
            original_image: None,
            outlined_image: None,
            ..self.clone()
        }
    }

    pub fn get(&self, name: &str) -> Option<&String> {
        self.metadata.get(name)
    }

    pub fn add(&mut self, name: String, value: String) {
        self.metadata.insert(name, value);
    }

    pub fn remove(&mut self, name: &str) {
        self.metadata.remove(name);
    }
}
