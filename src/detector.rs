use image::DynamicImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("Failed to download {url}: {source}")]
    Download {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("Model file I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),
    #[error("ONNX Runtime error: {0}")]
    Ort(#[from] ort::Error),
    #[error("Invalid tensor shape: {0}")]
    Shape(#[from] ndarray::ShapeError),
    #[error("Unexpected model output: {0}")]
    Output(String),
    #[error("Inference failed: {0}")]
    Inference(String),
}

impl DetectorError {
    /// Category name reported to clients alongside the message.
    pub fn kind(&self) -> &'static str {
        match self {
            DetectorError::Download { .. } => "DownloadError",
            DetectorError::Io(_) => "IoError",
            DetectorError::Tokenizer(_) => "TokenizerError",
            DetectorError::Ort(_) => "OrtError",
            DetectorError::Shape(_) => "ShapeError",
            DetectorError::Output(_) => "OutputError",
            DetectorError::Inference(_) => "InferenceError",
        }
    }
}

/// Box corners in pixels of the uploaded image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub label: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

pub trait Detector: Send + Sync + 'static {
    fn detect(&self, image: &DynamicImage) -> Result<Vec<Detection>, DetectorError>;
}
