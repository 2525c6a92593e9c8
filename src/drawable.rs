//! Drawable pixel storage with shadow-buffer commits
//!
//! The deformation core only talks to pixels through [`PixelStore`]: random
//! reads for resampling, and an atomic merge of a [`ShadowBuffer`] that a
//! commit rendered off to the side. [`TiledDrawable`] is the in-memory store
//! used by the binary, keeping RGBA pixels in fixed-size tiles.

use std::sync::Arc;

use image::{GrayImage, Luma, Rgba, RgbaImage};
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;

use crate::config::Rect;

/// Edge length of a storage tile
pub const TILE_SIZE: u32 = 64;

/// Failures of a pixel store write
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("tile {rect:?} lies outside the {width}x{height} drawable")]
    OutOfBounds { rect: Rect, width: u32, height: u32 },

    #[error("tile {rect:?} carries {actual} bytes, expected {expected}")]
    SizeMismatch {
        rect: Rect,
        expected: usize,
        actual: usize,
    },

    #[error("pixel store rejected the write: {0}")]
    Rejected(String),
}

/// Size of a drawable and its position inside the image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Extent {
    pub width: u32,
    pub height: u32,
    pub offset_x: i32,
    pub offset_y: i32,
}

impl Extent {
    /// The drawable's own pixels in local coordinates
    pub fn bounds(&self) -> Rect {
        Rect::new(0, 0, self.width, self.height)
    }
}

/// One rendered rectangle of RGBA pixels
#[derive(Debug, Clone)]
pub struct ShadowTile {
    pub rect: Rect,
    pub pixels: Vec<u8>,
}

/// Pixels rendered off to the side, waiting to be merged
#[derive(Debug, Clone, Default)]
pub struct ShadowBuffer {
    tiles: Vec<ShadowTile>,
}

impl ShadowBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, rect: Rect, pixels: Vec<u8>) {
        self.tiles.push(ShadowTile { rect, pixels });
    }

    pub fn tiles(&self) -> &[ShadowTile] {
        &self.tiles
    }

    pub fn rects(&self) -> Vec<Rect> {
        self.tiles.iter().map(|t| t.rect).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    /// Union of all tile rectangles
    pub fn bounds(&self) -> Rect {
        self.tiles
            .iter()
            .fold(Rect::default(), |acc, t| acc.union(&t.rect))
    }
}

/// Pixel storage of a drawable.
///
/// Coordinates are drawable-local. `merge_shadow` must be all or nothing:
/// when it fails, no pixel of the store has changed.
pub trait PixelStore: Send + Sync {
    fn extent(&self) -> Extent;

    /// Read one pixel; coordinates outside the drawable read as transparent
    fn pixel(&self, x: i32, y: i32) -> Rgba<u8>;

    /// Merge rendered pixels into the live buffer
    fn merge_shadow(&mut self, shadow: &ShadowBuffer) -> Result<(), StoreError>;

    /// Copy a rectangle out as packed RGBA
    fn read_rect(&self, rect: Rect) -> Vec<u8> {
        let mut out = Vec::with_capacity(rect.area() * 4);
        for y in rect.y..rect.bottom() {
            for x in rect.x..rect.right() {
                out.extend_from_slice(&self.pixel(x, y).0);
            }
        }
        out
    }

    /// Snapshot the current pixels under `rects`, for rolling a merge back
    fn capture(&self, rects: &[Rect]) -> ShadowBuffer {
        let mut shadow = ShadowBuffer::new();
        for rect in rects {
            shadow.push(*rect, self.read_rect(*rect));
        }
        shadow
    }
}

/// A pixel store shared between the session and its background jobs
pub type SharedStore = Arc<RwLock<dyn PixelStore>>;

/// RGBA drawable kept in `TILE_SIZE` square tiles
#[derive(Debug, Clone)]
pub struct TiledDrawable {
    width: u32,
    height: u32,
    offset_x: i32,
    offset_y: i32,
    tiles_x: u32,
    tiles: Vec<Vec<u8>>,
}

impl TiledDrawable {
    /// A transparent drawable
    pub fn new(width: u32, height: u32) -> Self {
        let tiles_x = width.div_ceil(TILE_SIZE);
        let tiles_y = height.div_ceil(TILE_SIZE);
        let tile_bytes = (TILE_SIZE * TILE_SIZE * 4) as usize;

        Self {
            width,
            height,
            offset_x: 0,
            offset_y: 0,
            tiles_x,
            tiles: vec![vec![0u8; tile_bytes]; (tiles_x * tiles_y) as usize],
        }
    }

    pub fn from_rgba_image(img: &RgbaImage) -> Self {
        let mut drawable = Self::new(img.width(), img.height());
        for (x, y, px) in img.enumerate_pixels() {
            drawable.set_pixel(x, y, *px);
        }
        drawable
    }

    /// Store a grayscale image, e.g. a layer mask, with gray in every channel
    pub fn from_luma_image(img: &GrayImage) -> Self {
        let mut drawable = Self::new(img.width(), img.height());
        for (x, y, px) in img.enumerate_pixels() {
            let v = px.0[0];
            drawable.set_pixel(x, y, Rgba([v, v, v, 255]));
        }
        drawable
    }

    /// Place the drawable inside a larger image
    pub fn with_offset(mut self, offset_x: i32, offset_y: i32) -> Self {
        self.offset_x = offset_x;
        self.offset_y = offset_y;
        self
    }

    pub fn to_rgba_image(&self) -> RgbaImage {
        RgbaImage::from_fn(self.width, self.height, |x, y| self.pixel(x as i32, y as i32))
    }

    pub fn to_luma_image(&self) -> GrayImage {
        GrayImage::from_fn(self.width, self.height, |x, y| Luma([self.pixel(x as i32, y as i32).0[0]]))
    }

    fn locate(&self, x: u32, y: u32) -> (usize, usize) {
        let tile = (y / TILE_SIZE) * self.tiles_x + x / TILE_SIZE;
        let offset = ((y % TILE_SIZE) * TILE_SIZE + x % TILE_SIZE) * 4;
        (tile as usize, offset as usize)
    }

    pub fn set_pixel(&mut self, x: u32, y: u32, px: Rgba<u8>) {
        if x >= self.width || y >= self.height {
            return;
        }
        let (tile, offset) = self.locate(x, y);
        self.tiles[tile][offset..offset + 4].copy_from_slice(&px.0);
    }

    fn validate(&self, shadow: &ShadowBuffer) -> Result<(), StoreError> {
        let bounds = self.extent().bounds();
        for tile in shadow.tiles() {
            if tile.rect.intersect(&bounds) != tile.rect {
                return Err(StoreError::OutOfBounds {
                    rect: tile.rect,
                    width: self.width,
                    height: self.height,
                });
            }
            let expected = tile.rect.area() * 4;
            if tile.pixels.len() != expected {
                return Err(StoreError::SizeMismatch {
                    rect: tile.rect,
                    expected,
                    actual: tile.pixels.len(),
                });
            }
        }
        Ok(())
    }
}

impl PixelStore for TiledDrawable {
    fn extent(&self) -> Extent {
        Extent {
            width: self.width,
            height: self.height,
            offset_x: self.offset_x,
            offset_y: self.offset_y,
        }
    }

    fn pixel(&self, x: i32, y: i32) -> Rgba<u8> {
        if x < 0 || y < 0 || x as u32 >= self.width || y as u32 >= self.height {
            return Rgba([0, 0, 0, 0]);
        }
        let (tile, offset) = self.locate(x as u32, y as u32);
        let p = &self.tiles[tile][offset..offset + 4];
        Rgba([p[0], p[1], p[2], p[3]])
    }

    fn merge_shadow(&mut self, shadow: &ShadowBuffer) -> Result<(), StoreError> {
        // Check everything first so a bad tile leaves the store untouched
        self.validate(shadow)?;

        for tile in shadow.tiles() {
            let rect = tile.rect;
            for (i, px) in tile.pixels.chunks_exact(4).enumerate() {
                let x = rect.x as u32 + (i as u32 % rect.width);
                let y = rect.y as u32 + (i as u32 / rect.width);
                self.set_pixel(x, y, Rgba([px[0], px[1], px[2], px[3]]));
            }
        }

        Ok(())
    }
}
