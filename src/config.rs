//! Configuration management for cagewarp

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A 2D point in pixel coordinates
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Translate by an offset
    pub fn offset(&self, dx: f64, dy: f64) -> Self {
        Self {
            x: self.x + dx,
            y: self.y + dy,
        }
    }

    /// Squared euclidean distance to another point
    pub fn distance_squared(&self, other: &Point) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx * dx + dy * dy
    }
}

/// An integer pixel rectangle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Smallest rectangle holding every pixel touched by the given bounds.
    /// The max edge is inclusive: a point at `max_x` lands in the rectangle.
    pub fn from_bounds(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        let x0 = min_x.floor() as i32;
        let y0 = min_y.floor() as i32;
        let x1 = max_x.floor() as i32 + 1;
        let y1 = max_y.floor() as i32 + 1;
        Self::from_edges(x0, y0, x1, y1)
    }

    /// Build from exclusive right/bottom edges, empty if inverted
    pub fn from_edges(x0: i32, y0: i32, x1: i32, y1: i32) -> Self {
        Self {
            x: x0,
            y: y0,
            width: (x1 - x0).max(0) as u32,
            height: (y1 - y0).max(0) as u32,
        }
    }

    /// Exclusive right edge
    pub fn right(&self) -> i32 {
        self.x + self.width as i32
    }

    /// Exclusive bottom edge
    pub fn bottom(&self) -> i32 {
        self.y + self.height as i32
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn area(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.x && y >= self.y && x < self.right() && y < self.bottom()
    }

    pub fn intersect(&self, other: &Rect) -> Rect {
        Rect::from_edges(
            self.x.max(other.x),
            self.y.max(other.y),
            self.right().min(other.right()),
            self.bottom().min(other.bottom()),
        )
    }

    pub fn union(&self, other: &Rect) -> Rect {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        Rect::from_edges(
            self.x.min(other.x),
            self.y.min(other.y),
            self.right().max(other.right()),
            self.bottom().max(other.bottom()),
        )
    }

    /// Translate by an integer offset
    pub fn translate(&self, dx: i32, dy: i32) -> Rect {
        Rect::new(self.x + dx, self.y + dy, self.width, self.height)
    }

    /// Split into tiles aligned to a `tile_size` grid, clipped to this rectangle
    pub fn tiles(&self, tile_size: u32) -> Vec<Rect> {
        let size = tile_size.max(1) as i32;
        let mut tiles = Vec::new();
        if self.is_empty() {
            return tiles;
        }

        let start_x = self.x.div_euclid(size) * size;
        let start_y = self.y.div_euclid(size) * size;

        let mut ty = start_y;
        while ty < self.bottom() {
            let mut tx = start_x;
            while tx < self.right() {
                let tile = Rect::new(tx, ty, size as u32, size as u32).intersect(self);
                if !tile.is_empty() {
                    tiles.push(tile);
                }
                tx += size;
            }
            ty += size;
        }

        tiles
    }
}

/// Settings of the cage tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CageToolSettings {
    /// Hit-test radius around a handle, in image pixels
    pub handle_size: f64,

    /// Fill the area the cage moved away from with `fill_color`
    #[serde(default)]
    pub fill_plain_color: bool,

    /// RGBA color used when `fill_plain_color` is set
    #[serde(default = "default_fill_color")]
    pub fill_color: [u8; 4],

    /// Sample spacing of the reduced-fidelity preview pass
    pub preview_stride: u32,

    /// Tile edge length for the full-resolution commit pass
    pub tile_size: u32,

    /// Solver rows between cancellation checks and progress updates
    pub coefficient_rows_per_chunk: u32,

    /// Interval of the job completion tick
    pub poll_interval_ms: u64,

    /// JPEG quality of encoded previews
    pub jpeg_quality: u8,
}

fn default_fill_color() -> [u8; 4] {
    [0, 0, 0, 255]
}

impl Default for CageToolSettings {
    fn default() -> Self {
        Self {
            handle_size: 25.0,
            fill_plain_color: false,
            fill_color: default_fill_color(),
            preview_stride: 4,
            tile_size: 64,
            coefficient_rows_per_chunk: 16,
            poll_interval_ms: 50,
            jpeg_quality: 80,
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8092,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub cage: CageToolSettings,
}

impl Config {
    /// Load configuration from a file, or create default if it doesn't exist
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {:?}", path))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config from {:?}", path))?;
            tracing::info!("Loaded configuration from {:?}", path);
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            tracing::info!("Created default configuration at {:?}", path);
            Ok(config)
        }
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .context("Failed to serialize configuration")?;

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create config directory {:?}", parent))?;
            }
        }

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved configuration to {:?}", path);
        Ok(())
    }
}

/// A scripted cage for headless runs.
///
/// `vertices` are placed in order while editing, then the cage is closed
/// and every vertex is dragged to the matching `displaced` position.
/// Both lists are in image coordinates.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CageScript {
    pub vertices: Vec<Point>,

    #[serde(default)]
    pub displaced: Vec<Point>,

    /// Visible area to restrict previews to
    #[serde(default)]
    pub viewport: Option<Rect>,
}

impl CageScript {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read cage script from {:?}", path))?;
        let script: CageScript = toml::from_str(&content)
            .with_context(|| format!("Failed to parse cage script from {:?}", path))?;

        if !script.displaced.is_empty() && script.displaced.len() != script.vertices.len() {
            anyhow::bail!(
                "Cage script has {} vertices but {} displaced positions",
                script.vertices.len(),
                script.displaced.len()
            );
        }

        Ok(script)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_distance() {
        let a = Point::new(1.0, 2.0);
        let b = Point::new(4.0, 6.0);
        assert_eq!(a.distance_squared(&b), 25.0);
        assert_eq!(a.offset(1.0, -2.0), Point::new(2.0, 0.0));
    }

    #[test]
    fn test_rect_from_bounds_is_inclusive() {
        let r = Rect::from_bounds(0.0, 0.0, 10.0, 10.0);
        assert_eq!(r, Rect::new(0, 0, 11, 11));

        let r = Rect::from_bounds(-0.5, 2.2, 3.7, 2.2);
        assert_eq!(r, Rect::new(-1, 2, 5, 1));
    }

    #[test]
    fn test_rect_intersect_and_union() {
        let a = Rect::new(0, 0, 10, 10);
        let b = Rect::new(5, 5, 10, 10);
        assert_eq!(a.intersect(&b), Rect::new(5, 5, 5, 5));
        assert_eq!(a.union(&b), Rect::new(0, 0, 15, 15));

        let far = Rect::new(20, 20, 2, 2);
        assert!(a.intersect(&far).is_empty());
        assert_eq!(Rect::default().union(&far), far);
    }

    #[test]
    fn test_rect_tiles_cover_once() {
        let r = Rect::new(10, 5, 100, 70);
        let tiles = r.tiles(64);
        let covered: usize = tiles.iter().map(|t| t.area()).sum();
        assert_eq!(covered, r.area());
        for t in &tiles {
            assert!(t.width <= 64 && t.height <= 64);
            assert_eq!(t.intersect(&r), *t);
        }
        // Tiles snap to the 64px grid
        assert_eq!(tiles[0], Rect::new(10, 5, 54, 59));
    }

    #[test]
    fn test_default_config_roundtrip() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.cage.handle_size, 25.0);
        assert_eq!(parsed.cage.tile_size, 64);
        assert_eq!(parsed.server.port, 8092);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let parsed: Config = toml::from_str("[server]\nhost = \"127.0.0.1\"\nport = 9000\n").unwrap();
        assert_eq!(parsed.server.port, 9000);
        assert_eq!(parsed.cage.preview_stride, 4);
        assert!(!parsed.cage.fill_plain_color);
    }
}
