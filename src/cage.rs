//! Cage geometry: the ordered control polygon and its editing operations
//!
//! Every vertex keeps two positions. The original position is where the
//! vertex was placed while editing the cage; the displaced position is where
//! it has been dragged to while deforming. Deformation is always computed
//! relative to the original shape, so both are kept side by side.

use serde::{Deserialize, Serialize};

use crate::config::{Point, Rect};
use crate::error::CageError;
use crate::session::SessionState;

/// Which representation of the cage is being edited
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CageMode {
    /// Placing vertices; only original positions change
    EditingCage,
    /// Dragging vertices; only displaced positions change
    Deforming,
}

/// A single cage vertex in drawable-local coordinates
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CageVertex {
    pub original: Point,
    pub displaced: Point,
}

impl CageVertex {
    pub fn new(x: f64, y: f64) -> Self {
        let p = Point::new(x, y);
        Self {
            original: p,
            displaced: p,
        }
    }
}

/// A handle as reported to a front end, in image coordinates
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CageHandle {
    pub id: usize,
    pub x: f64,
    pub y: f64,
}

/// The cage polygon with its drawable offset and editing mode
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CageConfig {
    vertices: Vec<CageVertex>,

    /// Translation from image coordinates to drawable-local coordinates
    pub offset_x: f64,
    pub offset_y: f64,

    mode: CageMode,
}

impl Default for CageConfig {
    fn default() -> Self {
        Self::new(0.0, 0.0)
    }
}

impl CageConfig {
    pub fn new(offset_x: f64, offset_y: f64) -> Self {
        Self {
            vertices: Vec::new(),
            offset_x,
            offset_y,
            mode: CageMode::EditingCage,
        }
    }

    pub fn mode(&self) -> CageMode {
        self.mode
    }

    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    pub fn vertices(&self) -> &[CageVertex] {
        &self.vertices
    }

    /// Original positions in drawable-local coordinates
    pub fn original_positions(&self) -> Vec<Point> {
        self.vertices.iter().map(|v| v.original).collect()
    }

    /// Displaced positions in drawable-local coordinates
    pub fn displaced_positions(&self) -> Vec<Point> {
        self.vertices.iter().map(|v| v.displaced).collect()
    }

    /// Positions of the representation matching the current mode
    fn active_position(&self, vertex: &CageVertex) -> Point {
        match self.mode {
            CageMode::EditingCage => vertex.original,
            CageMode::Deforming => vertex.displaced,
        }
    }

    fn to_local(&self, x: f64, y: f64) -> Point {
        Point::new(x - self.offset_x, y - self.offset_y)
    }

    /// Append a vertex given in image coordinates, returning its index
    pub fn add_vertex(&mut self, x: f64, y: f64) -> Result<usize, CageError> {
        if self.mode != CageMode::EditingCage {
            return Err(CageError::invalid_state("add a vertex", SessionState::Deforming));
        }

        let p = self.to_local(x, y);
        self.vertices.push(CageVertex::new(p.x, p.y));
        Ok(self.vertices.len() - 1)
    }

    /// Pop the last appended vertex. An empty cage is left as is.
    pub fn remove_last_vertex(&mut self) -> Result<Option<CageVertex>, CageError> {
        if self.mode != CageMode::EditingCage {
            return Err(CageError::invalid_state("remove a vertex", SessionState::Deforming));
        }

        Ok(self.vertices.pop())
    }

    /// Move a vertex to a position given in image coordinates.
    ///
    /// Editing moves the original position, deforming moves the displaced
    /// one. Returns false when `index` is out of range.
    pub fn move_vertex(&mut self, index: usize, x: f64, y: f64) -> bool {
        let p = self.to_local(x, y);
        let mode = self.mode;

        match self.vertices.get_mut(index) {
            Some(vertex) => {
                match mode {
                    CageMode::EditingCage => vertex.original = p,
                    CageMode::Deforming => vertex.displaced = p,
                }
                true
            }
            None => false,
        }
    }

    /// Close the cage and switch to deforming.
    ///
    /// The winding order is normalized here, once, so the solver and the
    /// evaluator can rely on a single orientation.
    pub fn close(&mut self) -> Result<(), CageError> {
        if self.mode != CageMode::EditingCage {
            return Err(CageError::invalid_state("close the cage", SessionState::Deforming));
        }
        if self.vertices.len() < 3 {
            return Err(CageError::DegenerateCage(self.vertices.len()));
        }

        self.reverse_if_needed();
        for vertex in &mut self.vertices {
            vertex.displaced = vertex.original;
        }
        self.mode = CageMode::Deforming;

        Ok(())
    }

    /// Reverse the vertex order when the original polygon has a negative
    /// signed area. Returns true if the order was flipped.
    pub fn reverse_if_needed(&mut self) -> bool {
        if signed_area(&self.original_positions()) < 0.0 {
            self.vertices.reverse();
            true
        } else {
            false
        }
    }

    /// Index of the first vertex within `radius` of an image-space point.
    ///
    /// Vertices are scanned in index order and the first one inside the
    /// radius wins, even if a later vertex is closer.
    pub fn hit_test(&self, x: f64, y: f64, radius: f64) -> Option<usize> {
        let cursor = Point::new(x, y);
        let radius_sq = radius * radius;

        self.vertices.iter().position(|vertex| {
            let p = self.active_position(vertex).offset(self.offset_x, self.offset_y);
            p.distance_squared(&cursor) <= radius_sq
        })
    }

    /// Handles of the active representation, in image coordinates
    pub fn handles(&self) -> Vec<CageHandle> {
        self.vertices
            .iter()
            .enumerate()
            .map(|(id, vertex)| {
                let p = self.active_position(vertex).offset(self.offset_x, self.offset_y);
                CageHandle { id, x: p.x, y: p.y }
            })
            .collect()
    }

    /// Pixel bounds of the original cage in drawable-local coordinates
    pub fn original_bounds(&self) -> Rect {
        bounding_rect(&self.original_positions())
    }
}

/// Shoelace signed area of a closed polygon
pub fn signed_area(points: &[Point]) -> f64 {
    let n = points.len();
    if n < 3 {
        return 0.0;
    }

    let twice: f64 = (0..n)
        .map(|i| {
            let a = points[i];
            let b = points[(i + 1) % n];
            a.x * b.y - b.x * a.y
        })
        .sum();

    twice / 2.0
}

/// Even-odd point in polygon test
pub fn point_inside(points: &[Point], x: f64, y: f64) -> bool {
    let n = points.len();
    if n < 3 {
        return false;
    }

    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let a = points[i];
        let b = points[j];
        if (a.y > y) != (b.y > y) && x < (b.x - a.x) * (y - a.y) / (b.y - a.y) + a.x {
            inside = !inside;
        }
        j = i;
    }

    inside
}

/// Pixel rectangle covering all points, empty for no points
pub fn bounding_rect(points: &[Point]) -> Rect {
    if points.is_empty() {
        return Rect::default();
    }

    let (mut min_x, mut min_y) = (f64::MAX, f64::MAX);
    let (mut max_x, mut max_y) = (f64::MIN, f64::MIN);
    for p in points {
        min_x = min_x.min(p.x);
        min_y = min_y.min(p.y);
        max_x = max_x.max(p.x);
        max_y = max_y.max(p.y);
    }

    Rect::from_bounds(min_x, min_y, max_x, max_y)
}
