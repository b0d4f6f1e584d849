use std::fs;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use image::{imageops::FilterType, RgbImage};
use ndarray::{s, Array4, ArrayView3, ArrayViewD, Ix3, IxDyn};
use ort::execution_providers::CUDAExecutionProvider;
use ort::session::{Session, SessionInputValue};
use ort::value::Tensor;
use tracing::{debug, info, warn};

use crate::application::ports::DetectionModelPort;
use crate::domain::config::Device;
use crate::domain::detection::Detection;
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::model::{DetrParams, LabelMap, ModelFiles};

const PIXEL_MASK: &str = "pixel_mask";

/// DETR exported to ONNX (`pixel_values` in, `logits` + `pred_boxes` out).
pub struct DetrOnnxEngine {
    // `Session::run` takes `&mut self`, so calls are serialised here.
    session: Mutex<Session>,
    labels: LabelMap,
    params: DetrParams,
}

impl DetrOnnxEngine {
    pub fn load(files: &ModelFiles, device: Device) -> Result<Self> {
        let mut builder = Session::builder()?.with_intra_threads(4)?;

        if device == Device::Accelerator {
            let cuda = CUDAExecutionProvider::default().build();
            match builder.clone().with_execution_providers([cuda]) {
                Ok(with_cuda) => builder = with_cuda,
                Err(e) => warn!("CUDA provider unavailable, running on CPU: {e}"),
            }
        }

        let model_bytes = fs::read(&files.onnx_path)
            .with_context(|| format!("reading {}", files.onnx_path.display()))?;
        let session = builder.commit_from_memory(&model_bytes)?;

        let labels: LabelMap = serde_json::from_slice(
            &fs::read(&files.config_path)
                .with_context(|| format!("reading {}", files.config_path.display()))?,
        )?;
        let params = match &files.preprocessor_path {
            Some(path) => serde_json::from_slice(&fs::read(path)?)?,
            None => DetrParams::default(),
        };

        info!(
            "Model {} loaded ({} labels, device {:?})",
            files.name,
            labels.id2label.len(),
            device
        );

        Ok(Self {
            session: Mutex::new(session),
            labels,
            params,
        })
    }

    pub fn infer(&self, rgb: &RgbImage, threshold: f32) -> Result<Vec<Detection>> {
        let started = Instant::now();
        let input = preprocess(rgb, &self.params)?;
        let (_, _, h, w) = input.dim();
        let input_shape: Vec<i64> = input.shape().iter().map(|&d| d as i64).collect();
        let (data, _) = input.into_raw_vec_and_offset();

        let mut session = lock_session(&self.session);
        let input_names: Vec<String> = session.inputs.iter().map(|i| i.name.clone()).collect();
        let output_names: Vec<String> = session.outputs.iter().map(|o| o.name.clone()).collect();
        let logits_at = output_index(&output_names, "logits", 0)?;
        let boxes_at = output_index(&output_names, "pred_boxes", 1)?;

        let mut pixels = Some(Tensor::from_array((input_shape, data))?);
        let mut inputs: Vec<(String, SessionInputValue<'static>)> = Vec::with_capacity(input_names.len());
        for name in input_names {
            if name == PIXEL_MASK {
                let (mask_shape, mask) = pixel_mask(h, w);
                inputs.push((name, Tensor::from_array((mask_shape, mask))?.into()));
            } else if let Some(tensor) = pixels.take() {
                inputs.push((name, tensor.into()));
            } else {
                bail!("model declares an unexpected input {name}");
            }
        }

        let outputs = session.run(inputs)?;
        let (logits_shape, logits_data) = outputs[logits_at].try_extract_tensor::<f32>()?;
        let (boxes_shape, boxes_data) = outputs[boxes_at].try_extract_tensor::<f32>()?;
        let logits_dims: Vec<usize> = logits_shape.iter().map(|&x| x as usize).collect();
        let boxes_dims: Vec<usize> = boxes_shape.iter().map(|&x| x as usize).collect();
        let logits = ArrayViewD::from_shape(IxDyn(&logits_dims), logits_data)?.into_dimensionality::<Ix3>()?;
        let boxes = ArrayViewD::from_shape(IxDyn(&boxes_dims), boxes_data)?.into_dimensionality::<Ix3>()?;

        let detections = postprocess(logits, boxes, rgb.width(), rgb.height(), threshold, &self.labels)?;
        debug!(
            "DETR inference on {}x{}: {} detections in {:.1} ms",
            rgb.width(),
            rgb.height(),
            detections.len(),
            started.elapsed().as_secs_f32() * 1000.0
        );
        Ok(detections)
    }
}

impl DetectionModelPort for DetrOnnxEngine {
    fn detect(&self, image: &RgbImage, threshold: f32) -> DomainResult<Vec<Detection>> {
        self.infer(image, threshold)
            .map_err(|e| DomainError::Detection(e.to_string()))
    }
}

/// Locks the session, recovering it if an earlier call panicked mid-run.
fn lock_session<T>(session: &Mutex<T>) -> MutexGuard<'_, T> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Position of output `name`, or `fallback` for exports that use other names.
fn output_index(names: &[String], name: &str, fallback: usize) -> Result<usize> {
    if let Some(i) = names.iter().position(|n| n == name) {
        return Ok(i);
    }
    if names.len() < 2 {
        bail!("expected logits and pred_boxes outputs, got {:?}", names);
    }
    Ok(fallback)
}

/// All-ones `[1, H, W]` mask: every pixel of the single image is real.
fn pixel_mask(height: usize, width: usize) -> (Vec<i64>, Vec<i64>) {
    (vec![1, height as i64, width as i64], vec![1; height * width])
}

/// Output size of the DETR resize: shortest edge to `shortest`, longest edge capped at `longest`.
pub fn resize_dims(width: u32, height: u32, shortest: u32, longest: u32) -> (u32, u32) {
    let min_side = width.min(height) as f32;
    let max_side = width.max(height) as f32;
    let mut size = shortest as f32;
    if max_side / min_side * size > longest as f32 {
        size = (longest as f32 * min_side / max_side).round();
    }
    let size_px = size as u32;

    if (height <= width && height == size_px) || (width <= height && width == size_px) {
        (width, height)
    } else if width < height {
        (size_px, (size * height as f32 / width as f32) as u32)
    } else {
        ((size * width as f32 / height as f32) as u32, size_px)
    }
}

/// Resize, rescale to [0, 1] and normalise into a `[1, 3, H, W]` tensor.
pub fn preprocess(rgb: &RgbImage, params: &DetrParams) -> Result<Array4<f32>> {
    if rgb.width() == 0 || rgb.height() == 0 {
        bail!("empty image");
    }
    let (w, h) = resize_dims(
        rgb.width(),
        rgb.height(),
        params.size.shortest_edge,
        params.size.longest_edge,
    );
    let resized = image::imageops::resize(rgb, w, h, FilterType::Triangle);

    let mut input = Array4::<f32>::zeros((1, 3, h as usize, w as usize));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            input[[0, c, y as usize, x as usize]] =
                (pixel[c] as f32 / 255.0 - params.image_mean[c]) / params.image_std[c];
        }
    }
    Ok(input)
}

/// Turns raw DETR outputs into pixel-space detections.
///
/// `logits` is `[1, queries, classes + 1]` (the last class is "no object") and
/// `boxes` is `[1, queries, 4]` with normalised `cx, cy, w, h`.
pub fn postprocess(
    logits: ArrayView3<f32>,
    boxes: ArrayView3<f32>,
    width: u32,
    height: u32,
    threshold: f32,
    labels: &LabelMap,
) -> Result<Vec<Detection>> {
    let (batch, num_queries, num_logits) = logits.dim();
    if batch == 0 || boxes.dim().0 == 0 {
        bail!("empty batch in model outputs");
    }
    if num_logits < 2 {
        bail!("logits need at least one class plus no-object, got {num_logits}");
    }
    if boxes.dim().1 != num_queries || boxes.dim().2 != 4 {
        bail!(
            "pred_boxes shape {:?} does not match logits shape {:?}",
            boxes.shape(),
            logits.shape()
        );
    }

    let (w, h) = (width as f32, height as f32);
    let mut detections = Vec::new();

    for q in 0..num_queries {
        let row = logits.slice(s![0, q, ..]);
        let max_logit = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        let exps = row.mapv(|v| (v - max_logit).exp());
        let total = exps.sum();

        let Some((class_id, &best)) = exps
            .slice(s![..num_logits - 1])
            .indexed_iter()
            .max_by(|(_, a), (_, b)| a.total_cmp(b))
        else {
            continue;
        };
        let score = best / total;
        if score < threshold {
            continue;
        }

        let cx = boxes[[0, q, 0]];
        let cy = boxes[[0, q, 1]];
        let bw = boxes[[0, q, 2]];
        let bh = boxes[[0, q, 3]];

        detections.push(Detection {
            x1: (cx - bw / 2.0) * w,
            y1: (cy - bh / 2.0) * h,
            x2: (cx + bw / 2.0) * w,
            y2: (cy + bh / 2.0) * h,
            score,
            class_id,
            label: labels.label(class_id),
        });
    }

    Ok(detections)
}
