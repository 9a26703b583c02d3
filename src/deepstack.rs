//! Client side of the DeepStack object detection api.
//!
//! `DeepStackClient` posts the image as a multipart form to
//! `/v1/vision/detection`, or to `/v1/vision/custom/<model>` for custom
//! models, and decodes the `{success, predictions, duration}` reply.
use async_trait::async_trait;
use reqwest::{
    Client,
    multipart::{Form, Part},
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error};

use crate::server::ServerConfig;

/// One detected object, in DeepStack wire form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Prediction {
    pub label: String,
    pub confidence: f32,
    pub x_min: i32,
    pub y_min: i32,
    pub x_max: i32,
    pub y_max: i32,
}

/// Rectangle drawn around a prediction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outline {
    pub x_min: i32,
    pub y_min: i32,
    pub x_max: i32,
    pub y_max: i32,
}

impl Outline {
    pub fn width(&self) -> u32 {
        self.x_max.abs_diff(self.x_min)
    }

    pub fn height(&self) -> u32 {
        self.y_max.abs_diff(self.y_min)
    }
}

impl From<&Prediction> for Outline {
    fn from(p: &Prediction) -> Self {
        Outline {
            x_min: p.x_min.min(p.x_max),
            y_min: p.y_min.min(p.y_max),
            x_max: p.x_max.max(p.x_min),
            y_max: p.y_max.max(p.y_min),
        }
    }
}

pub fn get_outlines(predictions: &[Prediction]) -> Vec<Outline> {
    predictions.iter().map(Outline::from).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    #[serde(default)]
    pub predictions: Vec<Prediction>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DetectionResult {
    pub fn new(predictions: Vec<Prediction>) -> Self {
        Self {
            predictions,
            success: true,
            duration: None,
            error: None,
        }
    }

    pub fn with_duration(mut self, duration: f64) -> Self {
        self.duration = Some(duration);
        self
    }
}

#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid response: {0}")]
    Decode(String),
    #[error("{0}")]
    Service(String),
}

/// Anything that can run object detection on an encoded image.
#[async_trait]
pub trait DetectionClient: Send + Sync {
    async fn detect(
        &self,
        image: &[u8],
        server: &ServerConfig,
        min_confidence: f32,
        custom_model: Option<&str>,
    ) -> Result<DetectionResult, DetectionError>;
}

#[derive(Debug, Clone, Default)]
pub struct DeepStackClient {
    client: Client,
}

impl DeepStackClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    pub fn endpoint(server: &ServerConfig, custom_model: Option<&str>) -> String {
        match custom_model {
            Some(model) => format!("{}/v1/vision/custom/{}", server.base_url(), model),
            None => format!("{}/v1/vision/detection", server.base_url()),
        }
    }

    fn form(image: &[u8], server: &ServerConfig, min_confidence: f32) -> Form {
        let part = Part::bytes(image.to_vec()).file_name("image.jpg");
        let form = Form::new()
            .part("image", part)
            .text("min_confidence", min_confidence.to_string());
        match &server.api_key {
            Some(key) => form.text("api_key", key.clone()),
            None => form,
        }
    }
}

#[async_trait]
impl DetectionClient for DeepStackClient {
    #[tracing::instrument(name = "deepstack_detect", skip(self, image, server), fields(bytes = image.len()))]
    async fn detect(
        &self,
        image: &[u8],
        server: &ServerConfig,
        min_confidence: f32,
        custom_model: Option<&str>,
    ) -> Result<DetectionResult, DetectionError> {
        let url = Self::endpoint(server, custom_model);
        let mut request = self
            .client
            .post(&url)
            .multipart(Self::form(image, server, min_confidence));
        if let Some(timeout) = server.timeout() {
            request = request.timeout(timeout);
        }

        let resp = request.send().await.map_err(|source| DetectionError::Http {
            url: url.clone(),
            source,
        })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_else(|_| "<no body>".into());
            error!("DeepStack error {}: {}", status, body);
            return Err(DetectionError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = resp.text().await.map_err(|source| DetectionError::Http {
            url: url.clone(),
            source,
        })?;
        let result: DetectionResult =
            serde_json::from_str(&body).map_err(|e| DetectionError::Decode(e.to_string()))?;

        if !result.success {
            if let Some(err) = result.error {
                return Err(DetectionError::Service(err));
            }
        }
        debug!(predictions = result.predictions.len(), "detection finished");
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::Protocol;
    use mockito::{Matcher, Server};
    use url::Url;

    fn server_for(mock: &Server) -> ServerConfig {
        ServerConfig::from_url(&Url::parse(&mock.url()).unwrap()).unwrap()
    }

    fn cat() -> Prediction {
        Prediction {
            label: "cat".into(),
            confidence: 0.91,
            x_min: 10,
            y_min: 20,
            x_max: 50,
            y_max: 60,
        }
    }

    #[test]
    fn endpoint_for_builtin_and_custom_models() {
        let server = ServerConfig::new(Protocol::Http, "localhost", 5000);
        assert_eq!(
            DeepStackClient::endpoint(&server, None),
            "http://localhost:5000/v1/vision/detection"
        );
        assert_eq!(
            DeepStackClient::endpoint(&server, Some("mask")),
            "http://localhost:5000/v1/vision/custom/mask"
        );
    }

    #[test]
    fn outlines_are_normalized() {
        let mut p = cat();
        p.x_min = 50;
        p.x_max = 10;
        let outlines = get_outlines(&[p]);
        assert_eq!(
            outlines,
            vec![Outline {
                x_min: 10,
                y_min: 20,
                x_max: 50,
                y_max: 60
            }]
        );
        assert_eq!(outlines[0].width(), 40);
        assert_eq!(outlines[0].height(), 40);

        let huge = Outline {
            x_min: i32::MIN,
            y_min: -1,
            x_max: i32::MAX,
            y_max: 1,
        };
        assert_eq!(huge.width(), u32::MAX);
        assert_eq!(huge.height(), 2);
    }

    #[test]
    fn result_without_duration_or_predictions_decodes() {
        let r: DetectionResult = serde_json::from_str(r#"{"success": true}"#).unwrap();
        assert!(r.predictions.is_empty());
        assert!(r.duration.is_none());
    }

    #[tokio::test]
    async fn detect_posts_form_and_decodes_predictions() {
        let mut mock = Server::new_async().await;
        let _m = mock
            .mock("POST", "/v1/vision/detection")
            .match_body(Matcher::AllOf(vec![
                Matcher::Regex("name=\"min_confidence\"".into()),
                Matcher::Regex("0.45".into()),
                Matcher::Regex("name=\"api_key\"".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"success":true,"duration":12.5,"predictions":[
                    {"label":"cat","confidence":0.91,"x_min":10,"y_min":20,"x_max":50,"y_max":60}
                ]}"#,
            )
            .create_async()
            .await;

        let server = server_for(&mock).with_api_key("key");
        let result = DeepStackClient::new()
            .detect(&[1, 2, 3], &server, 0.45, None)
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.duration, Some(12.5));
        assert_eq!(result.predictions, vec![cat()]);
    }

    #[tokio::test]
    async fn detect_uses_custom_endpoint() {
        let mut mock = Server::new_async().await;
        let m = mock
            .mock("POST", "/v1/vision/custom/fire")
            .with_status(200)
            .with_body(r#"{"success":true,"predictions":[]}"#)
            .create_async()
            .await;

        let result = DeepStackClient::new()
            .detect(&[1], &server_for(&mock), 0.5, Some("fire"))
            .await
            .unwrap();
        assert!(result.predictions.is_empty());
        m.assert_async().await;
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let mut mock = Server::new_async().await;
        let _m = mock
            .mock("POST", "/v1/vision/detection")
            .with_status(503)
            .with_body("service unavailable")
            .create_async()
            .await;

        let err = DeepStackClient::new()
            .detect(&[1], &server_for(&mock), 0.5, None)
            .await
            .unwrap_err();
        match err {
            DetectionError::Status { status, body } => {
                assert_eq!(status, 503);
                assert_eq!(body, "service unavailable");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn service_error_and_bad_json_are_errors() {
        let mut mock = Server::new_async().await;
        let _m = mock
            .mock("POST", "/v1/vision/detection")
            .with_status(200)
            .with_body(r#"{"success":false,"error":"Incorrect api key"}"#)
            .create_async()
            .await;
        let err = DeepStackClient::new()
            .detect(&[1], &server_for(&mock), 0.5, None)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Incorrect api key");

        let _bad = mock
            .mock("POST", "/v1/vision/custom/broken")
            .with_status(200)
            .with_body("<html>")
            .create_async()
            .await;
        let err = DeepStackClient::new()
            .detect(&[1], &server_for(&mock), 0.5, Some("broken"))
            .await
            .unwrap_err();
        assert!(matches!(err, DetectionError::Decode(_)));
    }
}
