//! Coefficient computation for cage deformation
//!
//! For every sample of a pixel region the solver computes mean value
//! coordinates with respect to the original cage. Those weights reproduce
//! the sample position from the cage vertices, and they do not depend on
//! where the vertices are dragged afterwards. The field is therefore
//! computed once when the cage closes, and every later drag only has to
//! form a weighted sum of vertex displacements.

use nalgebra::Vector2;
use rayon::prelude::*;

use crate::cage::point_inside;
use crate::config::{Point, Rect};
use crate::error::CageError;
use crate::job::CancelToken;
use crate::progress::ProgressReporter;

/// Relative tolerance for collinearity and zero-length tests
const EPSILON: f64 = 1e-9;

/// Classification of a sample relative to the original cage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleKind {
    /// Outside the cage; weights are valid but extrapolated
    Outside,
    /// Inside the cage or on its boundary
    Inside,
    /// Weights could not be computed; the sample carries neutral weights
    Singular,
}

/// Dense per-sample weights over a pixel region.
///
/// Each sample holds `2 * N` floats: for every vertex the weight of its x
/// displacement followed by the weight of its y displacement.
#[derive(Debug, Clone)]
pub struct CoefficientField {
    region: Rect,
    cage: Vec<Point>,
    weights: Vec<f32>,
    kinds: Vec<SampleKind>,
}

impl CoefficientField {
    /// Region covered, in drawable-local pixels
    pub fn region(&self) -> Rect {
        self.region
    }

    pub fn n_vertices(&self) -> usize {
        self.cage.len()
    }

    /// Original cage the weights were computed against
    pub fn cage(&self) -> &[Point] {
        &self.cage
    }

    /// Floats per sample
    pub fn stride(&self) -> usize {
        2 * self.cage.len()
    }

    fn index(&self, x: i32, y: i32) -> Option<usize> {
        if !self.region.contains(x, y) {
            return None;
        }
        let col = (x - self.region.x) as usize;
        let row = (y - self.region.y) as usize;
        Some(row * self.region.width as usize + col)
    }

    /// Weights of the sample at a drawable-local pixel
    pub fn weights_at(&self, x: i32, y: i32) -> Option<&[f32]> {
        let stride = self.stride();
        self.index(x, y)
            .map(|i| &self.weights[i * stride..(i + 1) * stride])
    }

    pub fn kind_at(&self, x: i32, y: i32) -> SampleKind {
        self.index(x, y)
            .map(|i| self.kinds[i])
            .unwrap_or(SampleKind::Outside)
    }

    /// Displacement of each vertex from its original position
    pub fn displacements(&self, displaced: &[Point]) -> Vec<Vector2<f64>> {
        self.cage
            .iter()
            .zip(displaced)
            .map(|(o, d)| Vector2::new(d.x - o.x, d.y - o.y))
            .collect()
    }

    /// Where the sample at (x, y) lands for the given vertex displacements
    pub fn deformed_position(&self, x: i32, y: i32, deltas: &[Vector2<f64>]) -> Option<Vector2<f64>> {
        let weights = self.weights_at(x, y)?;
        let mut p = Vector2::new(x as f64, y as f64);
        for (pair, delta) in weights.chunks_exact(2).zip(deltas) {
            p.x += pair[0] as f64 * delta.x;
            p.y += pair[1] as f64 * delta.y;
        }
        Some(p)
    }
}

/// Computes a [`CoefficientField`] in row chunks
#[derive(Debug, Clone)]
pub struct CoefficientSolver {
    rows_per_chunk: usize,
}

impl Default for CoefficientSolver {
    fn default() -> Self {
        Self::new(16)
    }
}

impl CoefficientSolver {
    pub fn new(rows_per_chunk: u32) -> Self {
        Self {
            rows_per_chunk: rows_per_chunk.max(1) as usize,
        }
    }

    /// Compute weights for every pixel of `region` against the closed `cage`.
    ///
    /// Rows are processed in chunks; between chunks the cancellation token
    /// is checked and progress is reported. A cancelled run returns
    /// [`CageError::Cancelled`] and drops the partial field.
    pub fn compute(
        &self,
        cage: &[Point],
        region: Rect,
        cancel: &CancelToken,
        progress: &dyn ProgressReporter,
    ) -> Result<CoefficientField, CageError> {
        let n = cage.len();
        if n < 3 {
            return Err(CageError::DegenerateCage(n));
        }

        let stride = 2 * n;
        let width = region.width as usize;
        let height = region.height as usize;
        let mut weights = vec![0f32; region.area() * stride];
        let mut kinds = vec![SampleKind::Outside; region.area()];

        let vertices: Vec<Vector2<f64>> = cage.iter().map(|p| Vector2::new(p.x, p.y)).collect();

        if region.is_empty() {
            progress.set_value(1.0);
        } else {
            let rows = self.rows_per_chunk;
            let chunks = weights
                .chunks_mut(width * stride * rows)
                .zip(kinds.chunks_mut(width * rows));

            for (chunk_index, (weight_chunk, kind_chunk)) in chunks.enumerate() {
                cancel.check()?;

                let first_row = chunk_index * rows;
                weight_chunk
                    .par_chunks_mut(width * stride)
                    .zip(kind_chunk.par_chunks_mut(width))
                    .enumerate()
                    .for_each(|(r, (weight_row, kind_row))| {
                        let y = region.y + (first_row + r) as i32;
                        let mut scratch = MeanValueScratch::new(n);
                        for (col, kind) in kind_row.iter_mut().enumerate() {
                            let x = region.x + col as i32;
                            let out = &mut weight_row[col * stride..(col + 1) * stride];
                            *kind = solve_sample(&mut scratch, &vertices, cage, x, y, out);
                        }
                    });

                let done = (first_row + rows).min(height);
                progress.set_value(done as f64 / height as f64);
            }
        }

        Ok(CoefficientField {
            region,
            cage: cage.to_vec(),
            weights,
            kinds,
        })
    }
}

/// Region the solver should cover for a cage: its pixel bounds clipped to
/// the drawable
pub fn cage_region(cage: &[Point], drawable: Rect) -> Rect {
    crate::cage::bounding_rect(cage).intersect(&drawable)
}

fn solve_sample(
    scratch: &mut MeanValueScratch,
    vertices: &[Vector2<f64>],
    cage: &[Point],
    x: i32,
    y: i32,
    out: &mut [f32],
) -> SampleKind {
    let p = Vector2::new(x as f64, y as f64);
    let kind = match mean_value_weights(p, vertices, scratch) {
        Weights::Boundary => SampleKind::Inside,
        Weights::Regular if point_inside(cage, p.x, p.y) => SampleKind::Inside,
        Weights::Regular => SampleKind::Outside,
        Weights::Singular => SampleKind::Singular,
    };

    for (pair, w) in out.chunks_exact_mut(2).zip(&scratch.weights) {
        let w = *w as f32;
        pair[0] = w;
        pair[1] = w;
    }

    kind
}

/// Per-thread buffers for the weight computation
struct MeanValueScratch {
    radii: Vec<f64>,
    half_tangents: Vec<f64>,
    weights: Vec<f64>,
}

impl MeanValueScratch {
    fn new(n: usize) -> Self {
        Self {
            radii: vec![0.0; n],
            half_tangents: vec![0.0; n],
            weights: vec![0.0; n],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Weights {
    Regular,
    Boundary,
    Singular,
}

/// Mean value coordinates of `p` for an arbitrary closed polygon.
///
/// Uses signed angles so the weights stay valid for concave cages and for
/// points outside the cage. A point on a vertex or an edge gets the linear
/// interpolation weights of that vertex or edge. When the weights cannot be
/// normalized the result is all zeros and `Singular` is returned.
fn mean_value_weights(p: Vector2<f64>, vertices: &[Vector2<f64>], scratch: &mut MeanValueScratch) -> Weights {
    let n = vertices.len();
    let MeanValueScratch {
        radii,
        half_tangents,
        weights,
    } = scratch;
    weights.iter_mut().for_each(|w| *w = 0.0);

    let mut scale = 0.0f64;
    for (i, v) in vertices.iter().enumerate() {
        radii[i] = (v - p).norm();
        scale = scale.max(radii[i]);
    }
    let eps = EPSILON * scale.max(1.0);

    if let Some(i) = radii.iter().position(|r| *r <= eps) {
        weights[i] = 1.0;
        return Weights::Boundary;
    }

    for i in 0..n {
        let j = (i + 1) % n;
        let si = vertices[i] - p;
        let sj = vertices[j] - p;
        let det = si.perp(&sj);
        let dot = si.dot(&sj);
        let rr = radii[i] * radii[j];

        if det.abs() <= EPSILON * rr {
            if dot < 0.0 {
                // On the edge between i and j
                let sum = radii[i] + radii[j];
                weights[i] = radii[j] / sum;
                weights[j] = radii[i] / sum;
                return Weights::Boundary;
            }
            // Collinear but outside the segment, or a zero-length edge
            half_tangents[i] = 0.0;
        } else {
            half_tangents[i] = (rr - dot) / det;
        }
    }

    let mut sum = 0.0;
    for i in 0..n {
        let prev = (i + n - 1) % n;
        weights[i] = (half_tangents[prev] + half_tangents[i]) / radii[i];
        sum += weights[i];
    }

    if !sum.is_finite() || sum.abs() <= EPSILON {
        weights.iter_mut().for_each(|w| *w = 0.0);
        return Weights::Singular;
    }

    for w in weights.iter_mut() {
        *w /= sum;
    }
    if weights.iter().any(|w| !w.is_finite()) {
        weights.iter_mut().for_each(|w| *w = 0.0);
        return Weights::Singular;
    }

    Weights::Regular
}
