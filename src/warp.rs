//! Warp evaluation for cage deformation
//!
//! The coefficient field tells where each sample of the original image
//! lands once the cage vertices are dragged. Resampling needs the opposite
//! direction: for every output pixel, where its color comes from. The
//! evaluator gets there by moving the sample grid forward, splitting every
//! grid cell into two triangles and rasterizing them at their deformed
//! position, interpolating the original sample positions across each
//! triangle.
//!
//! Renders never hold the mapping of a whole region: [`TileWarp`] bins the
//! deformed cells by output tile and builds the mapping of one tile at a
//! time.

use image::Rgba;
use nalgebra::Vector2;
use rayon::prelude::*;

use crate::cage::point_inside;
use crate::coefficients::{CoefficientField, SampleKind};
use crate::config::{Point, Rect};
use crate::drawable::PixelStore;
use crate::error::CageError;
use crate::job::CancelToken;

/// Tolerance on barycentric coordinates when testing triangle coverage
const COVERAGE_EPSILON: f64 = 1e-9;

/// Resolution of an evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fidelity {
    /// Every `stride`-th sample in each direction, nearest neighbour resampling
    Preview { stride: u32 },
    /// Every sample, bilinear resampling
    Full,
}

impl Fidelity {
    pub fn stride(&self) -> u32 {
        match self {
            Fidelity::Preview { stride } => (*stride).max(1),
            Fidelity::Full => 1,
        }
    }

    pub fn sampling(&self) -> Sampling {
        match self {
            Fidelity::Preview { .. } => Sampling::Nearest,
            Fidelity::Full => Sampling::Bilinear,
        }
    }
}

/// Resampling filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sampling {
    Nearest,
    Bilinear,
}

/// Where the color of an output pixel comes from
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PixelSource {
    /// Not touched by the deformation
    Unchanged,
    /// Inside the original cage but not covered by the deformed one
    Vacated,
    /// Resample the source drawable at this drawable-local position
    Mapped(f32, f32),
}

/// Inverse mapping for every pixel of a rectangle
#[derive(Debug, Clone)]
pub struct PixelMapping {
    rect: Rect,
    sources: Vec<PixelSource>,
}

impl PixelMapping {
    /// Mapping with no deformed coverage: pixels inside the original cage
    /// are vacated, everything else is unchanged
    fn uncovered(rect: Rect, cage: &[Point]) -> Self {
        let mut sources = Vec::with_capacity(rect.area());
        for y in rect.y..rect.bottom() {
            for x in rect.x..rect.right() {
                sources.push(if point_inside(cage, x as f64, y as f64) {
                    PixelSource::Vacated
                } else {
                    PixelSource::Unchanged
                });
            }
        }
        Self { rect, sources }
    }

    pub fn rect(&self) -> Rect {
        self.rect
    }

    /// Source of a drawable-local pixel; pixels outside the rectangle are
    /// unchanged
    pub fn source_at(&self, x: i32, y: i32) -> PixelSource {
        if !self.rect.contains(x, y) {
            return PixelSource::Unchanged;
        }
        self.sources[self.index(x, y)]
    }

    /// Number of pixels that resample the source
    pub fn mapped_count(&self) -> usize {
        self.sources
            .iter()
            .filter(|s| matches!(s, PixelSource::Mapped(..)))
            .count()
    }

    fn index(&self, x: i32, y: i32) -> usize {
        (y - self.rect.y) as usize * self.rect.width as usize + (x - self.rect.x) as usize
    }

    fn set(&mut self, x: i32, y: i32, source: PixelSource) {
        let i = self.index(x, y);
        self.sources[i] = source;
    }
}

/// Forward-deformed sample grid
#[derive(Debug, Clone)]
pub struct DeformedGrid {
    xs: Vec<i32>,
    ys: Vec<i32>,
    positions: Vec<Vector2<f64>>,
    kinds: Vec<SampleKind>,
}

impl DeformedGrid {
    pub fn cols(&self) -> usize {
        self.xs.len()
    }

    pub fn rows(&self) -> usize {
        self.ys.len()
    }

    /// Deformed position of a grid sample, `None` for singular samples
    pub fn position(&self, col: usize, row: usize) -> Option<Vector2<f64>> {
        let i = row * self.cols() + col;
        match self.kinds.get(i)? {
            SampleKind::Singular => None,
            _ => Some(self.positions[i]),
        }
    }

    fn original(&self, col: usize, row: usize) -> Vector2<f64> {
        Vector2::new(self.xs[col] as f64, self.ys[row] as f64)
    }

    /// The two triangles of the cell whose top-left sample is (col, row).
    ///
    /// A cell takes part when none of its corners is singular and at least
    /// one lies inside the cage.
    fn cell(&self, col: usize, row: usize) -> Option<[Triangle; 2]> {
        let corners = [(col, row), (col + 1, row), (col + 1, row + 1), (col, row + 1)];

        let mut inside = false;
        let mut deformed = [Vector2::zeros(); 4];
        let mut original = [Vector2::zeros(); 4];
        for (k, &(c, r)) in corners.iter().enumerate() {
            deformed[k] = self.position(c, r)?;
            original[k] = self.original(c, r);
            inside |= self.kinds[r * self.cols() + c] == SampleKind::Inside;
        }
        if !inside {
            return None;
        }

        Some([
            Triangle {
                deformed: [deformed[0], deformed[1], deformed[2]],
                original: [original[0], original[1], original[2]],
            },
            Triangle {
                deformed: [deformed[0], deformed[2], deformed[3]],
                original: [original[0], original[2], original[3]],
            },
        ])
    }

    /// Cells of one grid row, with their index in row-major cell order
    fn row_cells(&self, row: usize) -> impl Iterator<Item = (usize, [Triangle; 2])> + '_ {
        let cols = self.cols();
        (0..cols.saturating_sub(1)).filter_map(move |col| self.cell(col, row).map(|cell| (row * cols + col, cell)))
    }

    fn cell_rows(&self) -> std::ops::Range<usize> {
        0..self.rows().saturating_sub(1)
    }

    fn cells(&self) -> impl Iterator<Item = [Triangle; 2]> + '_ {
        self.cell_rows()
            .flat_map(move |row| self.row_cells(row).map(|(_, cell)| cell))
    }

    /// Pixel bounds of everything the deformed cells cover
    pub fn coverage(&self) -> Rect {
        self.cells()
            .flat_map(|cell| cell.into_iter())
            .fold(Rect::default(), |acc, tri| acc.union(&tri.bounds()))
    }
}

#[derive(Debug, Clone, Copy)]
struct Triangle {
    deformed: [Vector2<f64>; 3],
    original: [Vector2<f64>; 3],
}

impl Triangle {
    fn bounds(&self) -> Rect {
        let [a, b, c] = self.deformed;
        Rect::from_bounds(
            a.x.min(b.x).min(c.x),
            a.y.min(b.y).min(c.y),
            a.x.max(b.x).max(c.x),
            a.y.max(b.y).max(c.y),
        )
    }

    /// Write the interpolated original position into every covered pixel
    fn rasterize(&self, mapping: &mut PixelMapping) {
        let [a, b, c] = self.deformed;
        let area = (b - a).perp(&(c - a));
        if area.abs() <= COVERAGE_EPSILON {
            return;
        }

        let rect = mapping.rect();
        let x0 = (a.x.min(b.x).min(c.x).ceil() as i32).max(rect.x);
        let y0 = (a.y.min(b.y).min(c.y).ceil() as i32).max(rect.y);
        let x1 = (a.x.max(b.x).max(c.x).floor() as i32).min(rect.right() - 1);
        let y1 = (a.y.max(b.y).max(c.y).floor() as i32).min(rect.bottom() - 1);

        for y in y0..=y1 {
            for x in x0..=x1 {
                let p = Vector2::new(x as f64, y as f64);
                let la = (b - p).perp(&(c - p)) / area;
                let lb = (c - p).perp(&(a - p)) / area;
                let lc = 1.0 - la - lb;
                if la < -COVERAGE_EPSILON || lb < -COVERAGE_EPSILON || lc < -COVERAGE_EPSILON {
                    continue;
                }

                let src = self.original[0] * la + self.original[1] * lb + self.original[2] * lc;
                mapping.set(x, y, PixelSource::Mapped(src.x as f32, src.y as f32));
            }
        }
    }
}

/// Sample coordinates along one axis of a region: every `stride`-th pixel
/// plus the last one
fn axis(start: i32, len: u32, stride: u32) -> Vec<i32> {
    let mut axis: Vec<i32> = (0..len)
        .step_by(stride.max(1) as usize)
        .map(|o| start + o as i32)
        .collect();

    if len > 0 {
        let last = start + len as i32 - 1;
        if axis.last() != Some(&last) {
            axis.push(last);
        }
    }

    axis
}

/// Evaluates a coefficient field for dragged vertex positions.
///
/// Holds no state: the result only depends on the field and the displaced
/// vertices, so it can be called again on every drag tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct WarpEvaluator;

impl WarpEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Move every grid sample of the field to its deformed position.
    ///
    /// `cancel` is checked once per grid row.
    pub fn deform(
        &self,
        field: &CoefficientField,
        displaced: &[Point],
        fidelity: Fidelity,
        cancel: &CancelToken,
    ) -> Result<DeformedGrid, CageError> {
        let region = field.region();
        let stride = fidelity.stride();
        let xs = axis(region.x, region.width, stride);
        let ys = axis(region.y, region.height, stride);
        let deltas = field.displacements(displaced);

        let rows: Vec<Vec<(Vector2<f64>, SampleKind)>> = ys
            .par_iter()
            .map(|&y| {
                cancel.check()?;
                Ok(xs
                    .iter()
                    .map(|&x| {
                        let kind = field.kind_at(x, y);
                        let position = field
                            .deformed_position(x, y, &deltas)
                            .unwrap_or_else(|| Vector2::new(x as f64, y as f64));
                        (position, kind)
                    })
                    .collect())
            })
            .collect::<Result<_, CageError>>()?;

        let (positions, kinds) = rows.into_iter().flatten().unzip();

        Ok(DeformedGrid {
            xs,
            ys,
            positions,
            kinds,
        })
    }

    /// Inverse pixel mapping over `bounds` for the given vertex positions
    pub fn evaluate(
        &self,
        field: &CoefficientField,
        displaced: &[Point],
        fidelity: Fidelity,
        bounds: Rect,
        cancel: &CancelToken,
    ) -> Result<PixelMapping, CageError> {
        let grid = self.deform(field, displaced, fidelity, cancel)?;
        self.map(&grid, field.cage(), bounds, cancel)
    }

    /// Rasterize a deformed grid into an inverse mapping over `bounds`
    pub fn map(
        &self,
        grid: &DeformedGrid,
        cage: &[Point],
        bounds: Rect,
        cancel: &CancelToken,
    ) -> Result<PixelMapping, CageError> {
        let mut mapping = PixelMapping::uncovered(bounds, cage);
        if bounds.is_empty() {
            return Ok(mapping);
        }

        for row in grid.cell_rows() {
            cancel.check()?;
            for (_, cell) in grid.row_cells(row) {
                for triangle in cell.iter() {
                    if !triangle.bounds().intersect(&bounds).is_empty() {
                        triangle.rasterize(&mut mapping);
                    }
                }
            }
        }

        Ok(mapping)
    }

    /// Drawable pixels a commit has to rewrite: the original cage and
    /// whatever the deformed cells now cover, clipped to the drawable
    pub fn affected_region(&self, grid: &DeformedGrid, cage: &[Point], drawable: Rect) -> Rect {
        crate::cage::bounding_rect(cage)
            .union(&grid.coverage())
            .intersect(&drawable)
    }
}

/// A deformed grid split up by the output tiles of an area.
///
/// Each tile keeps the cells whose deformed bounds touch it, in grid order,
/// so [`TileWarp::map_tile`] yields the same sources as [`WarpEvaluator::map`]
/// over the whole area.
#[derive(Debug)]
pub struct TileWarp {
    grid: DeformedGrid,
    cage: Vec<Point>,
    area: Rect,
    tiles: Vec<Rect>,
    bins: Vec<Vec<usize>>,
}

impl TileWarp {
    /// Bin the cells of `grid` by the `tile_size` tiles of `area`.
    ///
    /// `cancel` is checked once per grid row.
    pub fn new(
        grid: DeformedGrid,
        cage: &[Point],
        area: Rect,
        tile_size: u32,
        cancel: &CancelToken,
    ) -> Result<Self, CageError> {
        let size = tile_size.max(1) as i32;
        let tiles = area.tiles(size as u32);
        let mut bins = vec![Vec::new(); tiles.len()];

        if !tiles.is_empty() {
            let first_x = area.x.div_euclid(size);
            let first_y = area.y.div_euclid(size);
            let tiles_x = (area.right() - 1).div_euclid(size) - first_x + 1;

            for row in grid.cell_rows() {
                cancel.check()?;
                for (index, [a, b]) in grid.row_cells(row) {
                    let touched = a.bounds().union(&b.bounds()).intersect(&area);
                    if touched.is_empty() {
                        continue;
                    }
                    for ty in touched.y.div_euclid(size)..=(touched.bottom() - 1).div_euclid(size) {
                        for tx in touched.x.div_euclid(size)..=(touched.right() - 1).div_euclid(size) {
                            let bin = ((ty - first_y) * tiles_x + (tx - first_x)) as usize;
                            bins[bin].push(index);
                        }
                    }
                }
            }
        }

        Ok(Self {
            grid,
            cage: cage.to_vec(),
            area,
            tiles,
            bins,
        })
    }

    pub fn area(&self) -> Rect {
        self.area
    }

    /// Output tiles in row-major order
    pub fn tiles(&self) -> &[Rect] {
        &self.tiles
    }

    /// Inverse mapping of the tile at `index` of [`TileWarp::tiles`]
    pub fn map_tile(&self, index: usize) -> PixelMapping {
        let Some(&rect) = self.tiles.get(index) else {
            return PixelMapping::uncovered(Rect::default(), &self.cage);
        };

        let mut mapping = PixelMapping::uncovered(rect, &self.cage);
        let cols = self.grid.cols();
        for &cell in &self.bins[index] {
            if let Some(triangles) = self.grid.cell(cell % cols, cell / cols) {
                for triangle in triangles.iter() {
                    triangle.rasterize(&mut mapping);
                }
            }
        }

        mapping
    }
}

/// How mapped pixels are turned into colors
#[derive(Debug, Clone, Copy)]
pub struct RenderStyle {
    pub sampling: Sampling,
    /// Color of vacated pixels; `None` keeps the original pixel
    pub fill: Option<Rgba<u8>>,
}

/// Render `rect` of the deformed drawable as packed RGBA
pub fn render_rect(mapping: &PixelMapping, rect: Rect, source: &dyn PixelStore, style: RenderStyle) -> Vec<u8> {
    let extent = source.extent();
    let mut out = Vec::with_capacity(rect.area() * 4);

    for y in rect.y..rect.bottom() {
        for x in rect.x..rect.right() {
            let px = match mapping.source_at(x, y) {
                PixelSource::Unchanged => source.pixel(x, y),
                PixelSource::Vacated => style.fill.unwrap_or_else(|| source.pixel(x, y)),
                PixelSource::Mapped(sx, sy) => match style.sampling {
                    Sampling::Nearest => nearest_sample(source, extent.width, extent.height, sx as f64, sy as f64),
                    Sampling::Bilinear => bilinear_sample(source, extent.width, extent.height, sx as f64, sy as f64),
                },
            };
            out.extend_from_slice(&px.0);
        }
    }

    out
}

/// Bilinear interpolation sampling, clamped to the drawable
#[inline]
pub fn bilinear_sample(src: &dyn PixelStore, width: u32, height: u32, x: f64, y: f64) -> Rgba<u8> {
    if width == 0 || height == 0 {
        return Rgba([0, 0, 0, 0]);
    }

    let x = x.max(0.0).min((width - 1) as f64);
    let y = y.max(0.0).min((height - 1) as f64);

    let x0 = x.floor() as i32;
    let y0 = y.floor() as i32;
    let x1 = (x0 + 1).min(width as i32 - 1);
    let y1 = (y0 + 1).min(height as i32 - 1);

    let fx = x - x0 as f64;
    let fy = y - y0 as f64;

    let p00 = src.pixel(x0, y0).0;
    let p10 = src.pixel(x1, y0).0;
    let p01 = src.pixel(x0, y1).0;
    let p11 = src.pixel(x1, y1).0;

    let mut result = [0u8; 4];
    for c in 0..4 {
        let value = p00[c] as f64 * (1.0 - fx) * (1.0 - fy)
            + p10[c] as f64 * fx * (1.0 - fy)
            + p01[c] as f64 * (1.0 - fx) * fy
            + p11[c] as f64 * fx * fy;

        result[c] = value.round().clamp(0.0, 255.0) as u8;
    }

    Rgba(result)
}

/// Nearest-neighbor sampling for the preview path
#[inline]
pub fn nearest_sample(src: &dyn PixelStore, width: u32, height: u32, x: f64, y: f64) -> Rgba<u8> {
    if width == 0 || height == 0 {
        return Rgba([0, 0, 0, 0]);
    }

    let x = (x.round().max(0.0) as i32).min(width as i32 - 1);
    let y = (y.round().max(0.0) as i32).min(height as i32 - 1);
    src.pixel(x, y)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coefficients::{cage_region, CoefficientSolver};
    use crate::drawable::TiledDrawable;
    use crate::job::CancelToken;
    use crate::progress::LogProgress;
    use image::RgbaImage;

    fn square() -> Vec<Point> {
        vec![
            Point::new(0.0, 0.0),
            Point::new(10.0, 0.0),
            Point::new(10.0, 10.0),
            Point::new(0.0, 10.0),
        ]
    }

    fn field_for(cage: &[Point], drawable: Rect) -> CoefficientField {
        CoefficientSolver::default()
            .compute(cage, cage_region(cage, drawable), &CancelToken::new(), &LogProgress::default())
            .unwrap()
    }

    fn assert_maps_to(mapping: &PixelMapping, x: i32, y: i32, sx: f32, sy: f32) {
        match mapping.source_at(x, y) {
            PixelSource::Mapped(mx, my) => {
                assert!((mx - sx).abs() < 1e-4 && (my - sy).abs() < 1e-4, "({}, {}) -> ({}, {})", x, y, mx, my);
            }
            other => panic!("({}, {}) is {:?}", x, y, other),
        }
    }

    #[test]
    fn test_axis_keeps_last_sample() {
        assert_eq!(axis(0, 11, 4), vec![0, 4, 8, 10]);
        assert_eq!(axis(3, 9, 4), vec![3, 7, 11]);
        assert_eq!(axis(0, 5, 1), vec![0, 1, 2, 3, 4]);
        assert!(axis(0, 0, 4).is_empty());
    }

    fn evaluate(field: &CoefficientField, displaced: &[Point], fidelity: Fidelity, bounds: Rect) -> PixelMapping {
        WarpEvaluator::new()
            .evaluate(field, displaced, fidelity, bounds, &CancelToken::new())
            .unwrap()
    }

    #[test]
    fn test_zero_displacement_is_identity() {
        let cage = square();
        let field = field_for(&cage, Rect::new(0, 0, 20, 20));
        let mapping = evaluate(&field, &cage, Fidelity::Full, field.region());

        assert_maps_to(&mapping, 5, 5, 5.0, 5.0);
        // Edges and corners of the cage included
        for y in 0..=10 {
            for x in 0..=10 {
                assert_maps_to(&mapping, x, y, x as f32, y as f32);
            }
        }
    }

    #[test]
    fn test_zero_displacement_is_identity_for_concave_cage() {
        let cage = vec![
            Point::new(0.0, 0.0),
            Point::new(20.0, 0.0),
            Point::new(20.0, 10.0),
            Point::new(10.0, 10.0),
            Point::new(10.0, 20.0),
            Point::new(0.0, 20.0),
        ];
        let field = field_for(&cage, Rect::new(0, 0, 30, 30));
        let mapping = evaluate(&field, &cage, Fidelity::Full, field.region());

        for y in 0..=20 {
            for x in 0..=20 {
                let on_cage = x <= 10 || y <= 10;
                match mapping.source_at(x, y) {
                    PixelSource::Mapped(..) => assert_maps_to(&mapping, x, y, x as f32, y as f32),
                    other => assert!(!on_cage, "({}, {}) is {:?}", x, y, other),
                }
            }
        }

        // The notch stays untouched
        assert_eq!(mapping.source_at(15, 15), PixelSource::Unchanged);
    }

    #[test]
    fn test_cancelled_evaluation_stops() {
        let cage = square();
        let field = field_for(&cage, Rect::new(0, 0, 20, 20));
        let cancel = CancelToken::new();
        cancel.cancel();

        let evaluator = WarpEvaluator::new();
        assert!(matches!(
            evaluator.deform(&field, &cage, Fidelity::Full, &cancel),
            Err(CageError::Cancelled)
        ));

        let grid = evaluator.deform(&field, &cage, Fidelity::Full, &CancelToken::new()).unwrap();
        assert!(matches!(
            evaluator.map(&grid, &cage, field.region(), &cancel),
            Err(CageError::Cancelled)
        ));
        assert!(matches!(
            TileWarp::new(grid, &cage, field.region(), 4, &cancel),
            Err(CageError::Cancelled)
        ));
    }

    #[test]
    fn test_tiles_match_whole_mapping() {
        let cage = square();
        let field = field_for(&cage, Rect::new(0, 0, 32, 32));
        let mut displaced = cage.clone();
        displaced[0] = Point::new(-3.0, 2.0);
        displaced[2] = Point::new(17.0, 14.0);

        let evaluator = WarpEvaluator::new();
        let cancel = CancelToken::new();
        let grid = evaluator.deform(&field, &displaced, Fidelity::Full, &cancel).unwrap();
        let area = evaluator.affected_region(&grid, &cage, Rect::new(0, 0, 32, 32));
        let whole = evaluator.map(&grid, &cage, area, &cancel).unwrap();

        let warp = TileWarp::new(grid, &cage, area, 5, &cancel).unwrap();
        assert_eq!(warp.area(), area);
        assert!(warp.tiles().len() > 1);

        for (i, tile) in warp.tiles().iter().enumerate() {
            let mapping = warp.map_tile(i);
            assert_eq!(mapping.rect(), *tile);
            for y in tile.y..tile.bottom() {
                for x in tile.x..tile.right() {
                    assert_eq!(mapping.source_at(x, y), whole.source_at(x, y), "({}, {})", x, y);
                }
            }
        }
    }

    #[test]
    fn test_preview_identity_on_coarse_grid() {
        let cage = square();
        let field = field_for(&cage, Rect::new(0, 0, 20, 20));
        let evaluator = WarpEvaluator::new();
        let cancel = CancelToken::new();
        let grid = evaluator.deform(&field, &cage, Fidelity::Preview { stride: 4 }, &cancel).unwrap();
        assert_eq!((grid.cols(), grid.rows()), (4, 4));

        let mapping = evaluator.map(&grid, &cage, field.region(), &cancel).unwrap();
        assert_maps_to(&mapping, 5, 5, 5.0, 5.0);
        assert_maps_to(&mapping, 9, 2, 9.0, 2.0);
    }

    #[test]
    fn test_dragged_vertex_shifts_source() {
        let cage = square();
        let field = field_for(&cage, Rect::new(0, 0, 20, 20));
        let mut displaced = cage.clone();
        displaced[0] = Point::new(2.0, 2.0);

        let evaluator = WarpEvaluator::new();
        let cancel = CancelToken::new();
        let grid = evaluator.deform(&field, &displaced, Fidelity::Full, &cancel).unwrap();
        let center = grid.position(5, 5).unwrap();
        assert!((center.x - 5.5).abs() < 1e-5);
        assert!((center.y - 5.5).abs() < 1e-5);

        // The content moved towards +x/+y, so pixel (5, 5) now shows
        // something from closer to the dragged corner
        let mapping = evaluator.map(&grid, &cage, field.region(), &cancel).unwrap();
        match mapping.source_at(5, 5) {
            PixelSource::Mapped(sx, sy) => {
                assert!(sx > 4.0 && sx < 5.0, "sx {}", sx);
                assert!(sy > 4.0 && sy < 5.0, "sy {}", sy);
            }
            other => panic!("center is {:?}", other),
        }
    }

    #[test]
    fn test_shrunk_cage_vacates_pixels() {
        let cage = square();
        let drawable = TiledDrawable::from_rgba_image(&RgbaImage::from_pixel(20, 20, Rgba([10, 20, 30, 255])));
        let field = field_for(&cage, drawable.extent().bounds());
        let mut displaced = cage.clone();
        displaced[2] = Point::new(5.0, 5.0);

        let bounds = Rect::new(0, 0, 20, 20);
        let mapping = evaluate(&field, &displaced, Fidelity::Full, bounds);
        assert_eq!(mapping.source_at(9, 9), PixelSource::Vacated);
        assert_eq!(mapping.source_at(15, 15), PixelSource::Unchanged);
        assert!(mapping.mapped_count() > 0);

        let red = Rgba([255, 0, 0, 255]);
        let rect = Rect::new(9, 9, 1, 1);
        let filled = render_rect(
            &mapping,
            rect,
            &drawable,
            RenderStyle { sampling: Sampling::Bilinear, fill: Some(red) },
        );
        assert_eq!(filled, red.0.to_vec());

        let kept = render_rect(
            &mapping,
            rect,
            &drawable,
            RenderStyle { sampling: Sampling::Bilinear, fill: None },
        );
        assert_eq!(kept, vec![10, 20, 30, 255]);
    }

    #[test]
    fn test_affected_region_includes_coverage() {
        let cage = square();
        let field = field_for(&cage, Rect::new(0, 0, 40, 40));
        let mut displaced = cage.clone();
        displaced[2] = Point::new(20.0, 20.0);

        let evaluator = WarpEvaluator::new();
        let grid = evaluator
            .deform(&field, &displaced, Fidelity::Full, &CancelToken::new())
            .unwrap();
        let affected = evaluator.affected_region(&grid, &cage, Rect::new(0, 0, 40, 40));
        assert_eq!(affected, Rect::new(0, 0, 21, 21));

        let clipped = evaluator.affected_region(&grid, &cage, Rect::new(0, 0, 15, 15));
        assert_eq!(clipped, Rect::new(0, 0, 15, 15));
    }

    #[test]
    fn test_bilinear_and_nearest_sampling() {
        let mut img = RgbaImage::new(2, 1);
        img.put_pixel(0, 0, Rgba([0, 0, 0, 255]));
        img.put_pixel(1, 0, Rgba([100, 200, 50, 255]));
        let store = TiledDrawable::from_rgba_image(&img);

        assert_eq!(bilinear_sample(&store, 2, 1, 0.5, 0.0), Rgba([50, 100, 25, 255]));
        assert_eq!(bilinear_sample(&store, 2, 1, 7.0, -3.0), Rgba([100, 200, 50, 255]));
        assert_eq!(nearest_sample(&store, 2, 1, 0.4, 0.0), Rgba([0, 0, 0, 255]));
        assert_eq!(nearest_sample(&store, 2, 1, 0.6, 0.0), Rgba([100, 200, 50, 255]));
    }
}
