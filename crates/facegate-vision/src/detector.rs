//! SCRFD face detector via ONNX Runtime.
//!
//! Anchor-free decoding over three strides, followed by NMS. Each surviving
//! box is cropped out of the source image with a context margin so the
//! extractor can align it on its own.

use std::path::Path;

use facegate_core::{BoundingBox, FaceRegion};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;

use crate::error::VisionError;
use crate::session::{self, Device};

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;
/// Fraction of the box size added on every side of a crop.
const CROP_MARGIN: f32 = 0.25;

/// (score, bbox, kps) output positions for one stride.
type StrideOutputIndices = (usize, usize, usize);

/// Maps letterboxed model coordinates back to the source image.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: u32, height: u32, target: u32) -> Self {
        let scale = (target as f32 / width as f32).min(target as f32 / height as f32);
        let new_w = (width as f32 * scale).round();
        let new_h = (height as f32 * scale).round();
        Self {
            scale,
            pad_x: ((target as f32 - new_w) / 2.0).floor(),
            pad_y: ((target as f32 - new_h) / 2.0).floor(),
        }
    }

    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Raw tensors of one stride level.
struct StrideOutputs<'a> {
    stride: usize,
    scores: &'a [f32],
    bboxes: &'a [f32],
    kps: &'a [f32],
}

pub struct ScrfdDetector {
    session: Session,
    stride_indices: [StrideOutputIndices; 3],
}

impl ScrfdDetector {
    pub fn load(model_path: &Path, device: Device) -> Result<Self, VisionError> {
        let session = session::open(model_path, device)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if output_names.len() < 9 {
            return Err(VisionError::InferenceFailed(format!(
                "SCRFD model requires 9 outputs (3 strides × score/bbox/kps), got {}",
                output_names.len()
            )));
        }
        let stride_indices = discover_output_indices(&output_names);
        tracing::debug!(?stride_indices, "SCRFD output tensor mapping");

        Ok(Self {
            session,
            stride_indices,
        })
    }

    /// Faces in `image`, most confident first, each with its crop.
    pub fn detect(&mut self, image: &RgbImage) -> Result<Vec<FaceRegion>, VisionError> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }
        let (input, letterbox) = letterbox_tensor(image, SCRFD_INPUT_SIZE);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (slot, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = self.stride_indices[slot];
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| VisionError::InferenceFailed(format!("{what} stride {stride}: {e}")))
            };
            let level = StrideOutputs {
                stride,
                scores: extract(score_idx, "scores")?,
                bboxes: extract(bbox_idx, "bboxes")?,
                kps: extract(kps_idx, "kps")?,
            };
            candidates.extend(decode_stride(
                &level,
                SCRFD_INPUT_SIZE as usize,
                &letterbox,
                SCRFD_CONFIDENCE_THRESHOLD,
            ));
        }

        let boxes = nms(candidates, SCRFD_NMS_THRESHOLD);
        tracing::debug!(faces = boxes.len(), "SCRFD detection complete");
        Ok(crop_regions(image, boxes))
    }
}

/// Letterbox-resize into a normalised NCHW tensor. Padding normalises to 0.
fn letterbox_tensor(image: &RgbImage, target: u32) -> (Array4<f32>, Letterbox) {
    let letterbox = Letterbox::fit(image.width(), image.height(), target);
    let new_w = ((image.width() as f32 * letterbox.scale).round() as u32).clamp(1, target);
    let new_h = ((image.height() as f32 * letterbox.scale).round() as u32).clamp(1, target);
    let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);

    let side = target as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
    let (off_x, off_y) = (letterbox.pad_x as usize, letterbox.pad_y as usize);
    for (x, y, pixel) in resized.enumerate_pixels() {
        let (tx, ty) = (off_x + x as usize, off_y + y as usize);
        if tx >= side || ty >= side {
            continue;
        }
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = (pixel.0[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }
    (tensor, letterbox)
}

/// Map output tensors to stride slots by name ("score_8", "bbox_16", ...),
/// falling back to the standard positional layout
/// `[scores 8/16/32, bboxes 8/16/32, kps 8/16/32]`.
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == target)
    };

    let mut named = [(0, 0, 0); 3];
    for (slot, &stride) in SCRFD_STRIDES.iter().enumerate() {
        match (find("score", stride), find("bbox", stride), find("kps", stride)) {
            (Some(s), Some(b), Some(k)) => named[slot] = (s, b, k),
            _ => {
                tracing::info!(?names, "SCRFD: output names not recognized, using positional mapping");
                return [(0, 3, 6), (1, 4, 7), (2, 5, 8)];
            }
        }
    }
    named
}

fn decode_stride(
    level: &StrideOutputs<'_>,
    input_size: usize,
    letterbox: &Letterbox,
    threshold: f32,
) -> Vec<BoundingBox> {
    let grid = input_size / level.stride;
    let step = level.stride as f32;
    let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;

    let mut detections = Vec::new();
    for idx in 0..anchors {
        let score = level.scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }
        let Some(offsets) = level.bboxes.get(idx * 4..idx * 4 + 4) else {
            continue;
        };

        let cell = idx / SCRFD_ANCHORS_PER_CELL;
        let anchor_x = (cell % grid) as f32 * step;
        let anchor_y = (cell / grid) as f32 * step;

        let (x1, y1) = letterbox.unmap(anchor_x - offsets[0] * step, anchor_y - offsets[1] * step);
        let (x2, y2) = letterbox.unmap(anchor_x + offsets[2] * step, anchor_y + offsets[3] * step);

        let landmarks = level.kps.get(idx * 10..idx * 10 + 10).map(|kps| {
            std::array::from_fn(|i| {
                letterbox.unmap(anchor_x + kps[i * 2] * step, anchor_y + kps[i * 2 + 1] * step)
            })
        });

        detections.push(BoundingBox {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            confidence: score,
            landmarks,
        });
    }
    detections
}

/// Greedy NMS. The result is ordered by descending confidence.
fn nms(mut detections: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<BoundingBox> = Vec::new();
    for candidate in detections {
        if keep.iter().all(|kept| iou(kept, &candidate) <= iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let inter_w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let inter_h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter = inter_w * inter_h;
    let union = a.width * a.height + b.width * b.height - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

/// Cut each box out of `image` with [`CROP_MARGIN`], clamped to the image.
/// Boxes that fall entirely outside the image are dropped.
fn crop_regions(image: &RgbImage, boxes: Vec<BoundingBox>) -> Vec<FaceRegion> {
    let (width, height) = (image.width() as f32, image.height() as f32);
    boxes
        .into_iter()
        .filter_map(|bbox| {
            let mx = bbox.width * CROP_MARGIN;
            let my = bbox.height * CROP_MARGIN;
            let x0 = (bbox.x - mx).clamp(0.0, width).floor();
            let y0 = (bbox.y - my).clamp(0.0, height).floor();
            let x1 = (bbox.x + bbox.width + mx).clamp(0.0, width).ceil();
            let y1 = (bbox.y + bbox.height + my).clamp(0.0, height).ceil();
            if x1 - x0 < 1.0 || y1 - y0 < 1.0 {
                return None;
            }
            let origin = (x0 as u32, y0 as u32);
            let crop = imageops::crop_imm(image, origin.0, origin.1, (x1 - x0) as u32, (y1 - y0) as u32)
                .to_image();
            Some(FaceRegion { bbox, crop, origin })
        })
        .collect()
}
