//! Similarity-transform alignment of a face crop onto the ArcFace template.
//!
//! The five detected landmarks are fitted by least squares to the InsightFace
//! reference positions; the crop is then warped with bilinear sampling.

use image::{Rgb, RgbImage};

/// InsightFace reference landmarks for a 112×112 output.
const TEMPLATE_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

/// Below this mean squared distance from the centroid (px²) the fit is meaningless.
const MIN_LANDMARK_SPREAD: f32 = 1.0;

fn spread(points: &[(f32, f32); 5]) -> f32 {
    let n = points.len() as f32;
    let (cx, cy) = points.iter().fold((0.0, 0.0), |(x, y), p| (x + p.0 / n, y + p.1 / n));
    points
        .iter()
        .map(|(x, y)| (x - cx).powi(2) + (y - cy).powi(2))
        .sum::<f32>()
        / n
}

/// Scale, rotation and translation: `dst = [[a, -b], [b, a]] * src + t`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Similarity {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

impl Similarity {
    /// Least-squares fit of `src` onto `dst`. `None` when the points are degenerate.
    fn fit(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Option<Self> {
        if spread(src) < MIN_LANDMARK_SPREAD {
            return None;
        }
        // Each pair contributes two rows of A * [a, b, tx, ty]^T = B.
        let mut normal = [[0.0f32; 5]; 4];
        for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst) {
            for (row, rhs) in [([sx, -sy, 1.0, 0.0], dx), ([sy, sx, 0.0, 1.0], dy)] {
                for j in 0..4 {
                    for k in 0..4 {
                        normal[j][k] += row[j] * row[k];
                    }
                    normal[j][4] += row[j] * rhs;
                }
            }
        }
        let [a, b, tx, ty] = solve_augmented(normal)?;
        Some(Self { a, b, tx, ty })
    }

    /// Map an output pixel back into the source image.
    fn invert_point(&self, x: f32, y: f32) -> (f32, f32) {
        let det = self.a * self.a + self.b * self.b;
        let (dx, dy) = (x - self.tx, y - self.ty);
        (
            (self.a * dx + self.b * dy) / det,
            (-self.b * dx + self.a * dy) / det,
        )
    }

    fn scale(&self) -> f32 {
        (self.a * self.a + self.b * self.b).sqrt()
    }
}

/// Gaussian elimination with partial pivoting on a 4×5 augmented matrix.
#[allow(clippy::needless_range_loop)]
fn solve_augmented(mut m: [[f32; 5]; 4]) -> Option<[f32; 4]> {
    for col in 0..4 {
        let pivot_row = (col..4).max_by(|&i, &j| m[i][col].abs().total_cmp(&m[j][col].abs()))?;
        m.swap(col, pivot_row);

        let pivot = m[col][col];
        if pivot.abs() < 1e-12 {
            return None;
        }
        for row in (col + 1)..4 {
            let factor = m[row][col] / pivot;
            for j in col..5 {
                m[row][j] -= factor * m[col][j];
            }
        }
    }

    let mut x = [0.0f32; 4];
    for i in (0..4).rev() {
        let tail: f32 = ((i + 1)..4).map(|j| m[i][j] * x[j]).sum();
        x[i] = (m[i][4] - tail) / m[i][i];
    }
    Some(x)
}

fn sample_bilinear(image: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let (x0, y0) = (x.floor() as i64, y.floor() as i64);
    let (fx, fy) = (x - x0 as f32, y - y0 as f32);
    let fetch = |px: i64, py: i64| -> [f32; 3] {
        if px < 0 || py < 0 || px >= i64::from(image.width()) || py >= i64::from(image.height()) {
            return [0.0; 3];
        }
        image.get_pixel(px as u32, py as u32).0.map(f32::from)
    };

    let (tl, tr, bl, br) = (fetch(x0, y0), fetch(x0 + 1, y0), fetch(x0, y0 + 1), fetch(x0 + 1, y0 + 1));
    let mut out = [0u8; 3];
    for c in 0..3 {
        let v = tl[c] * (1.0 - fx) * (1.0 - fy)
            + tr[c] * fx * (1.0 - fy)
            + bl[c] * (1.0 - fx) * fy
            + br[c] * fx * fy;
        out[c] = v.round().clamp(0.0, 255.0) as u8;
    }
    Rgb(out)
}

/// Warp `image` so that `landmarks` land on the template of a `size`×`size` crop.
///
/// `None` when no usable transform exists (collinear or coincident landmarks).
pub fn align_face(image: &RgbImage, landmarks: &[(f32, f32); 5], size: u32) -> Option<RgbImage> {
    let ratio = size as f32 / 112.0;
    let template = TEMPLATE_112.map(|(x, y)| (x * ratio, y * ratio));
    let transform = Similarity::fit(landmarks, &template)?;
    if !transform.scale().is_finite() || transform.scale() < 1e-6 {
        return None;
    }

    Some(RgbImage::from_fn(size, size, |ox, oy| {
        let (sx, sy) = transform.invert_point(ox as f32, oy as f32);
        sample_bilinear(image, sx, sy)
    }))
}
