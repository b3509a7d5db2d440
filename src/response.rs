use crate::detector::Detection;
use serde::{Deserialize, Serialize};

pub const DETECTED_MESSAGE: &str = "Image processed successfully";
pub const NONE_DETECTED_MESSAGE: &str = "No food items detected in the image";

/// Body of a successful `POST /detect`. `detected_items` and
/// `confidence_scores` are parallel lists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResponse {
    pub message: String,
    pub detected_items: Vec<String>,
    pub confidence_scores: Vec<f32>,
}

impl From<Vec<Detection>> for DetectionResponse {
    fn from(detections: Vec<Detection>) -> Self {
        let message = if detections.is_empty() {
            NONE_DETECTED_MESSAGE
        } else {
            DETECTED_MESSAGE
        };

        let (detected_items, confidence_scores) = detections
            .into_iter()
            .map(|detection| (detection.label, detection.confidence))
            .unzip();

        Self {
            message: message.to_string(),
            detected_items,
            confidence_scores,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// Display strings of the error and each of its sources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<Vec<String>>,
    /// Handler location that turned the detector failure into a response,
    /// not the point inside the detector where it was raised.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_line: Option<String>,
}
