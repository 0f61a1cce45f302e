//! Landmark inference run inside the worker process.
//!
//! [`LandmarkModel`] is the seam between the wire protocol loop and the
//! actual model. [`MoveNetModel`] is the built-in implementation: a MoveNet
//! single-pose ONNX model run through ONNX Runtime.

use std::path::Path;

use image::imageops::FilterType;
use image::DynamicImage;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;
use thiserror::Error;

/// MoveNet input resolution (square).
const MOVENET_INPUT_SIZE: u32 = 192;
/// MoveNet single-pose emits 17 COCO keypoints.
pub const KEYPOINT_COUNT: usize = 17;

const MOVENET_INPUT_NAME: &str = "serving_default_input_0";
const MOVENET_OUTPUT_NAME: &str = "StatefulPartitionedCall_0";

#[derive(Debug, Error)]
pub enum InferError {
    /// Frame bytes are not a decodable image.
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("model error: {0}")]
    Model(String),
}

/// Landmarks detected in one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Inference {
    /// Normalized `[x, y, z]` per landmark. 2D models put the keypoint
    /// confidence in `z`.
    pub points: Vec<[f32; 3]>,
    pub width: u32,
    pub height: u32,
}

pub trait LandmarkModel {
    fn infer(&mut self, frame: &[u8], gray: bool) -> Result<Inference, InferError>;
}

pub struct MoveNetModel {
    session: Session,
}

impl MoveNetModel {
    /// Load the ONNX model. One intra-op thread: the pool provides parallelism.
    pub fn load(model_path: &Path) -> Result<Self, InferError> {
        let session = Session::builder()
            .map_err(model_error)?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(model_error)?
            .with_intra_threads(1)
            .map_err(model_error)?
            .commit_from_file(model_path)
            .map_err(|e| InferError::Model(format!("Failed to load {}: {e}", model_path.display())))?;

        Ok(Self { session })
    }
}

impl LandmarkModel for MoveNetModel {
    fn infer(&mut self, frame: &[u8], gray: bool) -> Result<Inference, InferError> {
        let image = decode_frame(frame, gray)?;
        let (width, height) = (image.width(), image.height());

        let input = preprocess_for_movenet(&image);
        let size = MOVENET_INPUT_SIZE as usize;
        let input_tensor = Tensor::from_array(([1usize, size, size, 3], input)).map_err(model_error)?;
        let outputs = self
            .session
            .run(ort::inputs![MOVENET_INPUT_NAME => input_tensor])
            .map_err(model_error)?;

        // [1, 1, 17, 3] as (y, x, confidence)
        let (_, output) = outputs[MOVENET_OUTPUT_NAME]
            .try_extract_tensor::<f32>()
            .map_err(model_error)?;
        if output.len() < KEYPOINT_COUNT * 3 {
            return Err(InferError::Model(format!(
                "unexpected output length {}",
                output.len()
            )));
        }

        let points = output
            .chunks_exact(3)
            .take(KEYPOINT_COUNT)
            .map(|kp| [kp[1], kp[0], kp[2]])
            .collect();

        Ok(Inference {
            points,
            width,
            height,
        })
    }
}

/// Decode compressed frame bytes, optionally flattening to grayscale
/// (kept as three channels for the model).
pub fn decode_frame(frame: &[u8], gray: bool) -> Result<DynamicImage, InferError> {
    let image = image::load_from_memory(frame).map_err(|e| InferError::Decode(e.to_string()))?;
    if gray {
        Ok(DynamicImage::ImageRgb8(
            DynamicImage::ImageLuma8(image.to_luma8()).to_rgb8(),
        ))
    } else {
        Ok(image)
    }
}

/// Resize to 192x192 RGB and lay out as NHWC f32 in 0..=255.
fn preprocess_for_movenet(image: &DynamicImage) -> Vec<f32> {
    let resized = image::imageops::resize(
        &image.to_rgb8(),
        MOVENET_INPUT_SIZE,
        MOVENET_INPUT_SIZE,
        FilterType::Triangle,
    );
    resized.into_raw().into_iter().map(f32::from).collect()
}

fn model_error(e: impl std::fmt::Display) -> InferError {
    InferError::Model(e.to_string())
}
