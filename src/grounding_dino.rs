use crate::{
    caption::{CaptionEncoder, EncodedCaption},
    config::{DetectionConfig, ExecutionProvider, ModelConfig},
    detector::{BoundingBox, Detection, Detector, DetectorError},
    preprocessing::{transform_image, ImageTensor},
};
use image::DynamicImage;
use ndarray::{Array2, Array3, ArrayView2, Axis, Ix3};
use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProviderDispatch},
    session::{builder::GraphOptimizationLevel, Session},
    value::{DynValue, Tensor},
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

fn sigmoid(x: f32) -> f32 {
    1. / (1. + (-x).exp())
}

/// One retained query before its phrase is decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDetection {
    pub token_ids: Vec<u32>,
    pub score: f32,
    /// Normalized center x, center y, width, height.
    pub cxcywh: [f32; 4],
}

/// Keeps the queries whose best prompt token clears `box_threshold`, in
/// model output order.
pub fn select_queries(
    logits: ArrayView2<f32>,
    boxes: ArrayView2<f32>,
    caption: &EncodedCaption,
    encoder: &CaptionEncoder,
    box_threshold: f32,
    text_threshold: f32,
) -> Vec<RawDetection> {
    let text_len = caption.len().min(logits.ncols());

    logits
        .axis_iter(Axis(0))
        .zip(boxes.axis_iter(Axis(0)))
        .filter_map(|(query_logits, query_box)| {
            let probs: Vec<f32> = query_logits
                .iter()
                .take(text_len)
                .map(|&logit| sigmoid(logit))
                .collect();
            let score = probs.iter().copied().fold(0., f32::max);
            if score <= box_threshold {
                return None;
            }

            Some(RawDetection {
                token_ids: encoder.phrase_token_ids(&probs, caption, text_threshold),
                score,
                cxcywh: [query_box[0], query_box[1], query_box[2], query_box[3]],
            })
        })
        .collect()
}

fn to_pixel_box(cxcywh: [f32; 4], width: u32, height: u32) -> BoundingBox {
    let [cx, cy, w, h] = cxcywh;
    let (width, height) = (width as f32, height as f32);
    BoundingBox {
        x1: ((cx - w / 2.) * width).clamp(0., width),
        y1: ((cy - h / 2.) * height).clamp(0., height),
        x2: ((cx + w / 2.) * width).clamp(0., width),
        y2: ((cy + h / 2.) * height).clamp(0., height),
    }
}

/// Decodes the retained queries into labelled pixel-space detections,
/// dropping those whose phrase comes out empty.
fn to_detections(
    logits: ArrayView2<f32>,
    boxes: ArrayView2<f32>,
    caption: &EncodedCaption,
    encoder: &CaptionEncoder,
    config: &DetectionConfig,
    width: u32,
    height: u32,
) -> Result<Vec<Detection>, DetectorError> {
    let raw = select_queries(
        logits,
        boxes,
        caption,
        encoder,
        config.box_threshold,
        config.text_threshold,
    );

    let mut detections = Vec::with_capacity(raw.len());
    for query in raw {
        let label = encoder.decode_phrase(&query.token_ids)?;
        if label.is_empty() {
            continue;
        }
        detections.push(Detection {
            label,
            confidence: query.score,
            bbox: to_pixel_box(query.cxcywh, width, height),
        });
    }
    Ok(detections)
}

fn execution_providers(provider: ExecutionProvider) -> Vec<ExecutionProviderDispatch> {
    match provider {
        ExecutionProvider::Cpu => Vec::new(),
        ExecutionProvider::Cuda => vec![CUDAExecutionProvider::default().build()],
    }
}

pub struct GroundingDinoDetector {
    sessions: Vec<Mutex<Session>>,
    counter: AtomicUsize,
    encoder: CaptionEncoder,
    caption: EncodedCaption,
    detection_config: DetectionConfig,
}

impl GroundingDinoDetector {
    pub fn new(
        model_config: &ModelConfig,
        detection_config: &DetectionConfig,
    ) -> Result<Self, DetectorError> {
        ort::init()
            .with_name("healthy_eye")
            .with_execution_providers(execution_providers(model_config.execution_provider))
            .commit()?;
        tracing::info!(
            "Requested {:?} execution provider",
            model_config.execution_provider
        );

        let num_instances = model_config.num_instances;
        let sessions = (0..num_instances)
            .map(|_| {
                let session = Session::builder()?
                    .with_optimization_level(GraphOptimizationLevel::Level3)?
                    .with_intra_threads(model_config.intra_threads)?
                    .commit_from_file(model_config.get_model_path())?;
                Ok(Mutex::new(session))
            })
            .collect::<Result<Vec<_>, ort::Error>>()?;

        tracing::info!(
            "Created {} ONNX sessions from {}",
            num_instances,
            model_config.get_model_path().display()
        );

        let encoder = CaptionEncoder::from_file(&model_config.get_tokenizer_path())?;
        let caption = encoder.encode(&detection_config.prompt)?;
        tracing::info!(
            prompt = %detection_config.prompt,
            tokens = caption.len(),
            "Encoded detection prompt"
        );

        Ok(Self {
            sessions,
            counter: AtomicUsize::new(0),
            encoder,
            caption,
            detection_config: detection_config.clone(),
        })
    }

    /// Returns `(logits, boxes)` for the single image in the batch.
    fn run_inference(
        &self,
        input: ImageTensor,
    ) -> Result<(Array2<f32>, Array2<f32>), DetectorError> {
        let text_len = self.caption.len();
        let text_tensor =
            |values: &[i64]| Tensor::from_array(([1usize, text_len], values.to_vec()));

        let inputs = ort::inputs![
            "pixel_values" => Tensor::from_array(input.pixel_values)?,
            "input_ids" => text_tensor(&self.caption.input_ids)?,
            "token_type_ids" => text_tensor(&self.caption.token_type_ids)?,
            "attention_mask" => text_tensor(&self.caption.attention_mask)?,
            "pixel_mask" => Tensor::from_array(input.pixel_mask)?
        ];

        let index = self.counter.fetch_add(1, Ordering::Relaxed) % self.sessions.len();
        let mut session = self.sessions[index].lock();
        tracing::debug!("Handling request with session {}", index);

        let outputs = session.run(inputs)?;
        let logits = extract_first(outputs.get("logits"), "logits")?;
        let boxes = extract_first(outputs.get("pred_boxes"), "pred_boxes")?;

        if logits.nrows() != boxes.nrows() || boxes.ncols() != 4 {
            return Err(DetectorError::Output(format!(
                "logits {:?} and boxes {:?} disagree",
                logits.shape(),
                boxes.shape()
            )));
        }

        Ok((logits, boxes))
    }
}

fn extract_first(value: Option<&DynValue>, name: &str) -> Result<Array2<f32>, DetectorError> {
    let value = value.ok_or_else(|| DetectorError::Output(format!("missing output `{}`", name)))?;
    let array: Array3<f32> = value
        .try_extract_array::<f32>()?
        .to_owned()
        .into_dimensionality::<Ix3>()?;
    Ok(array.index_axis_move(Axis(0), 0))
}

impl Detector for GroundingDinoDetector {
    fn detect(&self, image: &DynamicImage) -> Result<Vec<Detection>, DetectorError> {
        let input = transform_image(
            image,
            self.detection_config.resize_shorter,
            self.detection_config.max_size,
        );
        let (orig_width, orig_height) = (input.orig_width, input.orig_height);

        let (logits, boxes) = self.run_inference(input)?;

        let detections = to_detections(
            logits.view(),
            boxes.view(),
            &self.caption,
            &self.encoder,
            &self.detection_config,
            orig_width,
            orig_height,
        )?;

        tracing::debug!("Returning {} detections", detections.len());
        for (i, detection) in detections.iter().enumerate() {
            tracing::debug!(
                "Detection {}: label={}, confidence={:.3}, bbox=({:.1}, {:.1}, {:.1}, {:.1})",
                i,
                detection.label,
                detection.confidence,
                detection.bbox.x1,
                detection.bbox.y1,
                detection.bbox.x2,
                detection.bbox.y2
            );
        }

        Ok(detections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caption::tests::test_encoder;
    use ndarray::array;

    #[test]
    fn test_sigmoid() {
        assert_eq!(sigmoid(0.), 0.5);
        assert!(sigmoid(10.) > 0.99);
        assert!(sigmoid(-10.) < 0.01);
    }

    #[test]
    fn test_select_queries() {
        let encoder = test_encoder();
        // [CLS] fruit . vegetable . [SEP]
        let caption = encoder.encode("fruit . vegetable").unwrap();

        let logits = array![
            // "fruit" and its separator
            [-9., 2.0, 3.0, -9., -9., -9., 8., 8.],
            // only the columns past the prompt are confident
            [-9., -2.0, -9., -2.0, -9., -9., 8., 8.],
            // confident on "vegetable", weak on "fruit"
            [-9., -0.5, -9., 1.0, -9., -9., -9., -9.],
        ];
        let boxes = array![
            [0.5, 0.5, 0.2, 0.4],
            [0.1, 0.1, 0.1, 0.1],
            [0.25, 0.75, 0.5, 0.5],
        ];

        let raw = select_queries(logits.view(), boxes.view(), &caption, &encoder, 0.35, 0.5);

        assert_eq!(raw.len(), 2);
        assert_eq!(raw[0].token_ids, vec![5]);
        assert!((raw[0].score - sigmoid(3.0)).abs() < 1e-6);
        assert_eq!(raw[0].cxcywh, [0.5, 0.5, 0.2, 0.4]);
        assert_eq!(raw[1].token_ids, vec![6]);
        assert!((raw[1].score - sigmoid(1.0)).abs() < 1e-6);
        assert!(raw.iter().all(|d| (0.0..=1.0).contains(&d.score)));
    }

    #[test]
    fn test_select_queries_ignores_padding_tokens() {
        let encoder = test_encoder();
        let caption = encoder.encode("fruit").unwrap();
        assert_eq!(caption.len(), 4);

        // Only columns past the prompt are confident.
        let logits = array![[-9., -9., -9., -9., 9., 9.]];
        let boxes = array![[0.5, 0.5, 1.0, 1.0]];

        let raw = select_queries(logits.view(), boxes.view(), &caption, &encoder, 0.35, 0.25);

        assert!(raw.is_empty());
    }

    #[test]
    fn test_to_detections_drops_empty_phrases() {
        let encoder = test_encoder();
        // [CLS] fruit . vegetable . [SEP]
        let caption = encoder.encode("fruit . vegetable").unwrap();
        let config = DetectionConfig {
            prompt: "fruit . vegetable".to_string(),
            box_threshold: 0.35,
            text_threshold: 0.25,
            resize_shorter: 800,
            max_size: 1333,
        };

        let logits = array![
            [-9., 3.0, -9., -9., -9., -9.],
            // clears the box threshold on a separator only
            [-9., -9., 2.0, -9., -9., -9.],
            [-9., -9., -9., 1.0, -9., -9.],
        ];
        let boxes = array![
            [0.5, 0.5, 0.25, 0.5],
            [0.5, 0.5, 1.0, 1.0],
            [0.25, 0.25, 0.5, 0.5],
        ];

        let detections = to_detections(
            logits.view(),
            boxes.view(),
            &caption,
            &encoder,
            &config,
            200,
            100,
        )
        .unwrap();

        let labels: Vec<&str> = detections.iter().map(|d| d.label.as_str()).collect();
        assert_eq!(labels, vec!["fruit", "vegetable"]);
        assert!((detections[0].confidence - sigmoid(3.0)).abs() < 1e-6);
        assert!((detections[1].confidence - sigmoid(1.0)).abs() < 1e-6);
        assert_eq!(
            detections[0].bbox,
            BoundingBox {
                x1: 75.,
                y1: 25.,
                x2: 125.,
                y2: 75.
            }
        );
        assert_eq!(
            detections[1].bbox,
            BoundingBox {
                x1: 0.,
                y1: 0.,
                x2: 100.,
                y2: 50.
            }
        );
    }

    #[test]
    fn test_execution_providers() {
        assert!(execution_providers(ExecutionProvider::Cpu).is_empty());
        assert_eq!(execution_providers(ExecutionProvider::Cuda).len(), 1);
    }

    #[test]
    fn test_to_pixel_box_clamps_to_image() {
        let bbox = to_pixel_box([0.5, 0.5, 0.5, 0.25], 200, 100);
        assert_eq!(
            bbox,
            BoundingBox {
                x1: 50.,
                y1: 37.5,
                x2: 150.,
                y2: 62.5
            }
        );

        let bbox = to_pixel_box([0.0, 1.0, 0.5, 0.5], 100, 100);
        assert_eq!(bbox.x1, 0.);
        assert_eq!(bbox.y2, 100.);
    }
}
