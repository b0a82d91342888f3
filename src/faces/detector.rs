use image::{DynamicImage, GenericImageView};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use tracing::{debug, info};

use super::provider::{EmbeddingProvider, FaceObservation};
use crate::config::DetectorConfig;
use crate::db::BoundingBox;
use crate::error::{FaceError, Result};

/// UltraFace 320x240, lightweight detector
const DETECTION_MODEL: (&str, &str) = (
    "ultraface-320.onnx",
    "https://github.com/onnx/models/raw/main/validated/vision/body_analysis/ultraface/models/version-RFB-320.onnx",
);
/// ArcFace ResNet100, 512-dim embeddings
const EMBEDDING_MODEL: (&str, &str) = (
    "arcface-resnet100.onnx",
    "https://github.com/onnx/models/raw/main/validated/vision/body_analysis/arcface/model/arcfaceresnet100-11-int8.onnx",
);

const NMS_THRESHOLD: f32 = 0.3;
const CROP_PADDING: f32 = 0.2;

fn model_error(err: impl std::fmt::Display) -> FaceError {
    FaceError::Model(err.to_string())
}

/// Face detection and embedding backed by ONNX Runtime.
///
/// Models are downloaded into the models directory on first use and the
/// sessions are built lazily, so constructing a provider is free.
pub struct OnnxFaceProvider {
    models_dir: PathBuf,
    intra_threads: usize,
    confidence_threshold: f32,
    detection: OnceLock<Mutex<Session>>,
    embedding: OnceLock<Mutex<Session>>,
}

impl OnnxFaceProvider {
    pub fn new(config: &DetectorConfig) -> Self {
        Self {
            models_dir: config.models_dir(),
            intra_threads: config.intra_threads.max(1),
            confidence_threshold: config.confidence_threshold,
            detection: OnceLock::new(),
            embedding: OnceLock::new(),
        }
    }

    /// Download (if needed) and load both models.
    pub fn warm_up(&self) -> Result<()> {
        self.session(&self.detection, DETECTION_MODEL)?;
        self.session(&self.embedding, EMBEDDING_MODEL)?;
        Ok(())
    }

    pub fn models_loaded(&self) -> bool {
        self.detection.get().is_some() && self.embedding.get().is_some()
    }

    fn session<'a>(
        &self,
        cell: &'a OnceLock<Mutex<Session>>,
        (filename, url): (&str, &str),
    ) -> Result<&'a Mutex<Session>> {
        if cell.get().is_none() {
            let path = self.ensure_model(filename, url)?;
            let session = Session::builder()
                .map_err(model_error)?
                .with_optimization_level(GraphOptimizationLevel::Level3)
                .map_err(model_error)?
                .with_intra_threads(self.intra_threads)
                .map_err(model_error)?
                .commit_from_file(&path)
                .map_err(model_error)?;
            // another thread may have won the race; its session is just as good
            let _ = cell.set(Mutex::new(session));
            info!(model = %filename, "Face model loaded");
        }

        cell.get()
            .ok_or_else(|| FaceError::Model(format!("{filename} not initialized")))
    }

    fn ensure_model(&self, filename: &str, url: &str) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.models_dir)
            .map_err(|e| FaceError::io(&self.models_dir, e))?;
        let model_path = self.models_dir.join(filename);

        if !model_path.exists() {
            info!(model = %filename, "Downloading model...");
            let response = ureq::get(url)
                .call()
                .map_err(|e| FaceError::Model(format!("failed to download {filename}: {e}")))?;

            let partial = model_path.with_extension("onnx.part");
            let mut file =
                std::fs::File::create(&partial).map_err(|e| FaceError::io(&partial, e))?;
            std::io::copy(&mut response.into_reader(), &mut file)
                .map_err(|e| FaceError::io(&partial, e))?;
            std::fs::rename(&partial, &model_path).map_err(|e| FaceError::io(&model_path, e))?;
            info!(model = %filename, path = ?model_path, "Model downloaded");
        }

        Ok(model_path)
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }
}

impl EmbeddingProvider for OnnxFaceProvider {
    fn detect(&self, image: &[u8]) -> Result<Vec<FaceObservation>> {
        if image.is_empty() {
            return Err(FaceError::unreadable("empty payload"));
        }
        // decode before touching the models so bad input never triggers a download
        let img = image::load_from_memory(image).map_err(|e| FaceError::unreadable(e.to_string()))?;

        let boxes = {
            let mut detection = self
                .session(&self.detection, DETECTION_MODEL)?
                .lock()
                .map_err(|e| FaceError::Model(format!("detection model poisoned: {e}")))?;
            run_ultraface(&mut detection, &img, self.confidence_threshold)?
        };

        if boxes.is_empty() {
            return Ok(Vec::new());
        }

        let mut embedding = self
            .session(&self.embedding, EMBEDDING_MODEL)?
            .lock()
            .map_err(|e| FaceError::Model(format!("embedding model poisoned: {e}")))?;

        let mut faces = Vec::with_capacity(boxes.len());
        for (bounding_box, confidence) in boxes {
            let crop = crop_face(&img, &bounding_box);
            let vector = run_arcface(&mut embedding, &crop)?;
            debug!(?bounding_box, confidence, "Face detected");
            faces.push(FaceObservation {
                bounding_box,
                embedding: vector,
            });
        }

        Ok(faces)
    }
}

fn run_ultraface(
    session: &mut Session,
    img: &DynamicImage,
    confidence_threshold: f32,
) -> Result<Vec<(BoundingBox, f32)>> {
    const INPUT_WIDTH: usize = 320;
    const INPUT_HEIGHT: usize = 240;
    const PLANE: usize = INPUT_WIDTH * INPUT_HEIGHT;

    let (orig_width, orig_height) = img.dimensions();

    let resized = img.resize_exact(
        INPUT_WIDTH as u32,
        INPUT_HEIGHT as u32,
        image::imageops::FilterType::Triangle,
    );
    let rgb = resized.to_rgb8();

    // NCHW, (pixel - 127) / 128
    let mut input = vec![0.0f32; 3 * PLANE];
    for (x, y, pixel) in rgb.enumerate_pixels() {
        let idx = y as usize * INPUT_WIDTH + x as usize;
        for channel in 0..3 {
            input[channel * PLANE + idx] = (pixel[channel] as f32 - 127.0) / 128.0;
        }
    }

    let tensor = Tensor::from_array(([1usize, 3, INPUT_HEIGHT, INPUT_WIDTH], input.into_boxed_slice()))
        .map_err(model_error)?;
    let outputs = session
        .run(ort::inputs!["input" => tensor])
        .map_err(model_error)?;

    let scores = outputs
        .get("scores")
        .ok_or_else(|| FaceError::Model("detector produced no scores".into()))?;
    let boxes = outputs
        .get("boxes")
        .ok_or_else(|| FaceError::Model("detector produced no boxes".into()))?;

    let (scores_shape, scores) = scores.try_extract_tensor::<f32>().map_err(model_error)?;
    let (_, boxes) = boxes.try_extract_tensor::<f32>().map_err(model_error)?;

    // scores: [1, anchors, 2] (background, face); boxes: [1, anchors, 4] normalized x1 y1 x2 y2
    let anchors = scores_shape.get(1).copied().unwrap_or(0).max(0) as usize;
    if scores.len() < anchors * 2 || boxes.len() < anchors * 4 {
        return Err(FaceError::Model("detector output shape mismatch".into()));
    }

    let width = orig_width as f32;
    let height = orig_height as f32;
    let mut candidates = Vec::new();
    for i in 0..anchors {
        let confidence = scores[i * 2 + 1];
        if confidence <= confidence_threshold {
            continue;
        }

        let corners = &boxes[i * 4..i * 4 + 4];
        let left = (corners[0] * width).clamp(0.0, width) as i32;
        let top = (corners[1] * height).clamp(0.0, height) as i32;
        let right = (corners[2] * width).clamp(0.0, width) as i32;
        let bottom = (corners[3] * height).clamp(0.0, height) as i32;

        if let Some(bounding_box) = BoundingBox::new(top, right, bottom, left) {
            candidates.push((bounding_box, confidence));
        }
    }

    Ok(nms(candidates, NMS_THRESHOLD))
}

/// Non-maximum suppression: keep the most confident box of each overlapping group.
fn nms(mut boxes: Vec<(BoundingBox, f32)>, threshold: f32) -> Vec<(BoundingBox, f32)> {
    boxes.sort_by(|a, b| b.1.total_cmp(&a.1));

    let mut keep: Vec<(BoundingBox, f32)> = Vec::new();
    for candidate in boxes {
        if keep.iter().all(|(kept, _)| kept.iou(&candidate.0) <= threshold) {
            keep.push(candidate);
        }
    }
    keep
}

/// Crop the face with padding on every side, clipped to the image.
fn crop_face(img: &DynamicImage, bounding_box: &BoundingBox) -> DynamicImage {
    let (x, y, w, h) = padded_region(bounding_box, img.dimensions());
    img.crop_imm(x, y, w, h)
}

fn padded_region(bounding_box: &BoundingBox, (img_width, img_height): (u32, u32)) -> (u32, u32, u32, u32) {
    let pad_x = (bounding_box.width() as f32 * CROP_PADDING) as i64;
    let pad_y = (bounding_box.height() as f32 * CROP_PADDING) as i64;

    let left = (bounding_box.left as i64 - pad_x).clamp(0, img_width as i64);
    let top = (bounding_box.top as i64 - pad_y).clamp(0, img_height as i64);
    let right = (bounding_box.right as i64 + pad_x).clamp(0, img_width as i64);
    let bottom = (bounding_box.bottom as i64 + pad_y).clamp(0, img_height as i64);

    (
        left as u32,
        top as u32,
        ((right - left) as u32).max(1),
        ((bottom - top) as u32).max(1),
    )
}

fn run_arcface(session: &mut Session, face: &DynamicImage) -> Result<Vec<f32>> {
    const INPUT_SIZE: usize = 112;
    const PLANE: usize = INPUT_SIZE * INPUT_SIZE;

    let resized = face.resize_exact(
        INPUT_SIZE as u32,
        INPUT_SIZE as u32,
        image::imageops::FilterType::Triangle,
    );
    let rgb = resized.to_rgb8();

    let mut input = vec![0.0f32; 3 * PLANE];
    for (x, y, pixel) in rgb.enumerate_pixels() {
        let idx = y as usize * INPUT_SIZE + x as usize;
        for channel in 0..3 {
            input[channel * PLANE + idx] = (pixel[channel] as f32 - 127.5) / 127.5;
        }
    }

    let tensor = Tensor::from_array(([1usize, 3, INPUT_SIZE, INPUT_SIZE], input.into_boxed_slice()))
        .map_err(model_error)?;
    let outputs = session
        .run(ort::inputs!["data" => tensor])
        .map_err(model_error)?;

    let (_, output) = outputs
        .iter()
        .next()
        .ok_or_else(|| FaceError::Model("embedding model produced no output".into()))?;
    let (_, values) = output.try_extract_tensor::<f32>().map_err(model_error)?;

    Ok(l2_normalize(values.to_vec()))
}

fn l2_normalize(mut vector: Vec<f32>) -> Vec<f32> {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        vector.iter_mut().for_each(|x| *x /= norm);
    }
    vector
}
