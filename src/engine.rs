//! Tiled processing of the cage transform
//!
//! A render is described as a small graph: a tile reader on the source
//! drawable, the warp transform, and a sink collecting rendered tiles. The
//! [`Processor`] drives the graph one batch of tiles at a time so callers
//! can report progress and check for cancellation between batches. The
//! inverse mapping of a tile only exists while that tile renders.

use std::sync::Arc;
use std::time::Instant;

use image::RgbaImage;
use rayon::prelude::*;
use tracing::debug;

use crate::config::Rect;
use crate::drawable::{PixelStore, ShadowBuffer, SharedStore};
use crate::error::CageError;
use crate::job::CancelToken;
use crate::progress::ProgressReporter;
use crate::warp::{render_rect, RenderStyle, TileWarp};

/// Source -> warp -> sink over the tiles of a [`TileWarp`]
pub struct RenderGraph {
    source: SharedStore,
    warp: Arc<TileWarp>,
    style: RenderStyle,
}

impl RenderGraph {
    pub fn new(source: SharedStore, warp: Arc<TileWarp>, style: RenderStyle) -> Self {
        Self { source, warp, style }
    }

    pub fn area(&self) -> Rect {
        self.warp.area()
    }

    /// Start processing the graph
    pub fn processor(self) -> Processor {
        let total = self.warp.tiles().len();
        let batch = rayon::current_num_threads().max(1) * 2;

        Processor {
            graph: self,
            next: 0,
            total,
            batch,
            shadow: ShadowBuffer::new(),
            started: Instant::now(),
        }
    }
}

/// Incremental executor of a [`RenderGraph`]
pub struct Processor {
    graph: RenderGraph,
    next: usize,
    total: usize,
    batch: usize,
    shadow: ShadowBuffer,
    started: Instant,
}

impl Processor {
    /// Render the next batch of tiles. Returns false once every tile is done.
    pub fn work(&mut self) -> bool {
        if self.next >= self.total {
            return false;
        }

        let end = (self.next + self.batch).min(self.total);
        let warp = &self.graph.warp;
        let style = self.graph.style;

        let rendered: Vec<(Rect, Vec<u8>)> = {
            let guard = self.graph.source.read();
            let store: &dyn PixelStore = &*guard;
            let bounds = store.extent().bounds();
            (self.next..end)
                .into_par_iter()
                .filter_map(|i| {
                    // A mask may be smaller than the layer the warp was built for
                    let rect = warp.tiles()[i].intersect(&bounds);
                    if rect.is_empty() {
                        return None;
                    }
                    let mapping = warp.map_tile(i);
                    Some((rect, render_rect(&mapping, rect, store, style)))
                })
                .collect()
        };

        for (rect, pixels) in rendered {
            self.shadow.push(rect, pixels);
        }
        self.next = end;

        self.next < self.total
    }

    /// Fraction of tiles rendered
    pub fn progress(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.next as f64 / self.total as f64
        }
    }

    pub fn is_done(&self) -> bool {
        self.next >= self.total
    }

    /// Rendered tiles, ready to be merged
    pub fn finish(self) -> ShadowBuffer {
        debug!(
            "Rendered {} tiles of {:?} in {:?}",
            self.total,
            self.graph.area(),
            self.started.elapsed()
        );
        self.shadow
    }

    /// Rendered tiles assembled into one image of the graph's area
    pub fn finish_image(self) -> RgbaImage {
        let area = self.graph.area();
        let shadow = self.finish();
        let mut img = RgbaImage::new(area.width, area.height);

        for tile in shadow.tiles() {
            let rect = tile.rect;
            for (i, px) in tile.pixels.chunks_exact(4).enumerate() {
                let x = (rect.x - area.x) as u32 + i as u32 % rect.width;
                let y = (rect.y - area.y) as u32 + i as u32 / rect.width;
                img.put_pixel(x, y, image::Rgba([px[0], px[1], px[2], px[3]]));
            }
        }

        img
    }

    /// Drive the processor to the end, checking `cancel` before every batch
    pub fn run(mut self, cancel: &CancelToken, progress: &dyn ProgressReporter) -> Result<Self, CageError> {
        loop {
            cancel.check()?;
            let more = self.work();
            progress.set_value(self.progress());
            if !more {
                return Ok(self);
            }
        }
    }
}
