//! cagewarp - interactive cage deformation of raster images
//!
//! A cage is a polygon placed over part of a drawable. Once it is closed,
//! mean value coordinates are computed for every pixel it covers, and
//! dragging its vertices warps the enclosed pixels. Previews render in the
//! background while dragging; a commit renders at full resolution and
//! merges the result into the drawable in one step.

pub mod cage;
pub mod coefficients;
pub mod config;
pub mod drawable;
pub mod engine;
pub mod error;
pub mod job;
pub mod progress;
pub mod server;
pub mod session;
pub mod warp;

pub use cage::{CageConfig, CageHandle, CageMode, CageVertex};
pub use coefficients::{CoefficientField, CoefficientSolver, SampleKind};
pub use config::{CageScript, CageToolSettings, Config, Point, Rect};
pub use drawable::{PixelStore, SharedStore, StoreError, TiledDrawable};
pub use error::CageError;
pub use progress::{LogProgress, ProgressReporter};
pub use session::{CageKey, DeformationSession, DisplaySink, NullDisplay, SessionEvent, SessionState};
pub use warp::{Fidelity, PixelMapping, PixelSource, TileWarp, WarpEvaluator};
