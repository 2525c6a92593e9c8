//! The interactive cage deformation session
//!
//! A session coordinates cage edits, the one-time coefficient computation,
//! preview renders while vertices are dragged, and the final commit. All
//! long work runs as background jobs; the control side never waits for
//! them and instead calls [`DeformationSession::tick`] at a low frequency
//! to pick up finished results.
//!
//! Previews live next to the drawable, never in it. Only a commit writes
//! pixels, and it does so through a shadow buffer merged in one step.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use image::imageops;
use image::{Rgba, RgbaImage};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use crate::cage::{CageConfig, CageHandle, CageVertex};
use crate::coefficients::{cage_region, CoefficientField, CoefficientSolver};
use crate::config::{CageToolSettings, Rect};
use crate::drawable::{PixelStore, ShadowBuffer, SharedStore};
use crate::engine::RenderGraph;
use crate::error::CageError;
use crate::job::{CancelToken, JobHandle, JobLatch, JobPoll};
use crate::progress::{ProgressReporter, Stage};
use crate::warp::{Fidelity, RenderStyle, Sampling, TileWarp, WarpEvaluator};

const COEFFICIENTS_LABEL: &str = "Coefficient computation";
const PREVIEW_LABEL: &str = "Cage transform preview";
const COMMIT_LABEL: &str = "Rendering cage transform";
const MASK_LABEL: &str = "Rendering mask cage transform";

/// Lifecycle of a deformation session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    NotStarted,
    EditingCage,
    ComputingCoefficients,
    Deforming,
    Previewing,
    Committing,
    Halted,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::NotStarted => "not started",
            SessionState::EditingCage => "editing cage",
            SessionState::ComputingCoefficients => "computing coefficients",
            SessionState::Deforming => "deforming",
            SessionState::Previewing => "previewing",
            SessionState::Committing => "committing",
            SessionState::Halted => "halted",
        };
        f.write_str(name)
    }
}

/// Receives requests to redraw the visible canvas
pub trait DisplaySink: Send + Sync {
    /// Redraw `area` in image coordinates, or everything for `None`
    fn request_redraw(&self, area: Option<Rect>);
}

/// Display that ignores redraw requests, for headless runs
#[derive(Debug, Default)]
pub struct NullDisplay;

impl DisplaySink for NullDisplay {
    fn request_redraw(&self, _area: Option<Rect>) {}
}

/// A rendered preview of the deformed drawable
#[derive(Debug, Clone)]
pub struct PreviewFrame {
    /// Drag generation the frame was rendered for
    pub generation: u64,
    /// Covered rectangle, drawable-local
    pub rect: Rect,
    pub pixels: RgbaImage,
}

/// Something that happened while checking background work
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    CoefficientsReady { region: Rect },
    PreviewReady { generation: u64 },
    Committed { area: Rect },
}

/// Keys the cage tool reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CageKey {
    Backspace,
    Enter,
    Escape,
}

struct CommitOutput {
    area: Rect,
    layer: ShadowBuffer,
    mask: Option<ShadowBuffer>,
}

/// The single background job a session may have in flight
enum ActiveJob {
    Coefficients(JobHandle<CoefficientField>),
    Preview(JobHandle<PreviewFrame>),
    Commit(JobHandle<CommitOutput>),
}

impl ActiveJob {
    fn progress(&self) -> f64 {
        match self {
            ActiveJob::Coefficients(job) => job.progress(),
            ActiveJob::Preview(job) => job.progress(),
            ActiveJob::Commit(job) => job.progress(),
        }
    }
}

enum Finished {
    Coefficients(Result<CoefficientField, CageError>),
    Preview(Result<PreviewFrame, CageError>),
    Commit(Result<CommitOutput, CageError>),
}

/// An interactive cage deformation of one drawable
pub struct DeformationSession {
    runtime: Handle,
    settings: CageToolSettings,
    display: Arc<dyn DisplaySink>,
    reporter: Arc<dyn ProgressReporter>,
    solver: CoefficientSolver,
    evaluator: WarpEvaluator,

    state: SessionState,
    cage: Option<CageConfig>,
    layer: Option<SharedStore>,
    mask: Option<SharedStore>,
    field: Option<Arc<CoefficientField>>,
    job: Option<ActiveJob>,
    /// Released when the most recently spawned job has returned
    tail: Option<JobLatch>,
    generation: u64,
    preview: Arc<ArcSwapOption<PreviewFrame>>,
    /// Visible area in image coordinates
    viewport: Option<Rect>,
    dragged: Option<usize>,
}

impl DeformationSession {
    pub fn new(
        runtime: Handle,
        settings: CageToolSettings,
        display: Arc<dyn DisplaySink>,
        reporter: Arc<dyn ProgressReporter>,
    ) -> Self {
        let solver = CoefficientSolver::new(settings.coefficient_rows_per_chunk);

        Self {
            runtime,
            settings,
            display,
            reporter,
            solver,
            evaluator: WarpEvaluator::new(),
            state: SessionState::NotStarted,
            cage: None,
            layer: None,
            mask: None,
            field: None,
            job: None,
            tail: None,
            generation: 0,
            preview: Arc::new(ArcSwapOption::empty()),
            viewport: None,
            dragged: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn settings(&self) -> &CageToolSettings {
        &self.settings
    }

    pub fn cage(&self) -> Option<&CageConfig> {
        self.cage.as_ref()
    }

    /// Handles of the cage in image coordinates
    pub fn handles(&self) -> Vec<CageHandle> {
        self.cage.as_ref().map(|c| c.handles()).unwrap_or_default()
    }

    /// Progress of the job in flight, if any
    pub fn progress(&self) -> Option<f64> {
        self.job.as_ref().map(|job| job.progress())
    }

    pub fn is_busy(&self) -> bool {
        self.job.is_some()
    }

    /// Generation of the most recently scheduled job
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn coefficients(&self) -> Option<Arc<CoefficientField>> {
        self.field.clone()
    }

    /// The visible preview, if one has been rendered
    pub fn preview(&self) -> Option<Arc<PreviewFrame>> {
        self.preview.load_full()
    }

    pub fn layer(&self) -> Option<SharedStore> {
        self.layer.clone()
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!("Cage session: {} -> {}", self.state, state);
            self.state = state;
        }
    }

    fn require(&self, operation: &'static str, allowed: &[SessionState]) -> Result<(), CageError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(CageError::invalid_state(operation, self.state))
        }
    }

    fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    /// Spawn a job that starts once every earlier job of this session has
    /// returned, cancelled ones included
    fn spawn<T, F>(&mut self, label: &'static str, generation: u64, work: F) -> JobHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(&CancelToken, &crate::progress::JobProgress) -> Result<T, CageError> + Send + 'static,
    {
        let job = JobHandle::spawn_after(
            &self.runtime,
            label,
            generation,
            self.reporter.clone(),
            self.tail.take(),
            work,
        );
        self.tail = Some(job.latch());
        job
    }

    /// Image-space rectangle of a drawable-local one
    fn to_image(&self, rect: Rect) -> Rect {
        match &self.cage {
            Some(cage) => rect.translate(cage.offset_x as i32, cage.offset_y as i32),
            None => rect,
        }
    }

    fn fill(&self) -> Option<Rgba<u8>> {
        self.settings
            .fill_plain_color
            .then(|| Rgba(self.settings.fill_color))
    }

    /// Start editing a new cage on `layer`, optionally carrying its mask along
    pub fn start(&mut self, layer: SharedStore, mask: Option<SharedStore>) -> Result<(), CageError> {
        self.require("start a cage", &[SessionState::NotStarted, SessionState::Halted])?;

        let extent = layer.read().extent();
        info!(
            "Starting cage on {}x{} drawable at offset ({}, {}){}",
            extent.width,
            extent.height,
            extent.offset_x,
            extent.offset_y,
            if mask.is_some() { " with mask" } else { "" }
        );

        self.release();
        self.cage = Some(CageConfig::new(extent.offset_x as f64, extent.offset_y as f64));
        self.layer = Some(layer);
        self.mask = mask;
        self.set_state(SessionState::EditingCage);
        self.display.request_redraw(None);

        Ok(())
    }

    /// Append a vertex at an image-space position
    pub fn add_vertex(&mut self, x: f64, y: f64) -> Result<usize, CageError> {
        self.require("add a vertex", &[SessionState::EditingCage])?;
        let cage = self.cage.as_mut().ok_or(CageError::invalid_state("add a vertex", self.state))?;
        let index = cage.add_vertex(x, y)?;
        self.display.request_redraw(None);
        Ok(index)
    }

    /// Remove the last placed vertex; nothing happens on an empty cage
    pub fn remove_last_vertex(&mut self) -> Result<Option<CageVertex>, CageError> {
        self.require("remove a vertex", &[SessionState::EditingCage])?;
        let cage = self
            .cage
            .as_mut()
            .ok_or(CageError::invalid_state("remove a vertex", self.state))?;
        let removed = cage.remove_last_vertex()?;
        if removed.is_some() {
            self.display.request_redraw(None);
        }
        Ok(removed)
    }

    /// Move a vertex to an image-space position.
    ///
    /// While deforming this is a drag tick: it supersedes any outstanding
    /// preview and schedules a new one. Returns false for an unknown index.
    pub fn move_vertex(&mut self, index: usize, x: f64, y: f64) -> Result<bool, CageError> {
        self.require(
            "move a vertex",
            &[SessionState::EditingCage, SessionState::Deforming, SessionState::Previewing],
        )?;
        let cage = self
            .cage
            .as_mut()
            .ok_or(CageError::invalid_state("move a vertex", self.state))?;

        if !cage.move_vertex(index, x, y) {
            return Ok(false);
        }

        if self.state == SessionState::EditingCage {
            self.display.request_redraw(None);
        } else {
            self.schedule_preview();
        }
        Ok(true)
    }

    /// Close the cage and start computing coefficients in the background
    pub fn close_cage(&mut self) -> Result<(), CageError> {
        self.require("close the cage", &[SessionState::EditingCage])?;
        let (Some(cage), Some(layer)) = (self.cage.as_mut(), self.layer.clone()) else {
            return Err(CageError::invalid_state("close the cage", self.state));
        };

        cage.close()?;
        let original = cage.original_positions();
        let region = cage_region(&original, layer.read().extent().bounds());
        info!("Cage closed with {} vertices, solving region {:?}", original.len(), region);

        self.field = None;
        let generation = self.next_generation();
        let solver = self.solver.clone();
        let job = self.spawn(COEFFICIENTS_LABEL, generation, move |cancel, progress| {
            solver.compute(&original, region, cancel, progress)
        });

        self.job = Some(ActiveJob::Coefficients(job));
        self.set_state(SessionState::ComputingCoefficients);
        Ok(())
    }

    /// Restrict previews to a visible area in image coordinates
    pub fn set_viewport(&mut self, viewport: Option<Rect>) {
        self.viewport = viewport;
        if matches!(self.state, SessionState::Deforming | SessionState::Previewing) {
            self.schedule_preview();
        }
    }

    /// Drawable-local area a preview should cover
    fn preview_bounds(&self, layer: &SharedStore) -> Rect {
        let bounds = layer.read().extent().bounds();
        match (self.viewport, &self.cage) {
            (Some(viewport), Some(cage)) => viewport
                .translate(-(cage.offset_x as i32), -(cage.offset_y as i32))
                .intersect(&bounds),
            _ => bounds,
        }
    }

    /// Replace any outstanding preview by one for the current vertex positions
    fn schedule_preview(&mut self) {
        let (Some(field), Some(cage), Some(layer)) = (self.field.clone(), self.cage.as_ref(), self.layer.clone()) else {
            return;
        };

        let displaced = cage.displaced_positions();
        let bounds = self.preview_bounds(&layer);
        if bounds.is_empty() {
            self.job = None;
            self.set_state(SessionState::Deforming);
            return;
        }

        let generation = self.next_generation();
        let fidelity = Fidelity::Preview {
            stride: self.settings.preview_stride,
        };
        let style = RenderStyle {
            sampling: fidelity.sampling(),
            fill: self.fill(),
        };
        let tile_size = self.settings.tile_size;
        let evaluator = self.evaluator;

        // Dropping the previous handle cancels it; its result is never read
        // and the new job waits for it to return
        self.job = None;
        let job = self.spawn(PREVIEW_LABEL, generation, move |cancel, progress| {
            let grid = evaluator.deform(&field, &displaced, fidelity, cancel)?;
            let warp = TileWarp::new(grid, field.cage(), bounds, tile_size, cancel)?;
            let pixels = RenderGraph::new(layer, Arc::new(warp), style)
                .processor()
                .run(cancel, progress)?
                .finish_image();

            Ok(PreviewFrame {
                generation,
                rect: bounds,
                pixels,
            })
        });
        self.job = Some(ActiveJob::Preview(job));
        self.set_state(SessionState::Previewing);
    }

    /// Render the deformation at full resolution and merge it into the drawable
    pub fn commit(&mut self) -> Result<(), CageError> {
        self.require("commit", &[SessionState::Deforming, SessionState::Previewing])?;
        let (Some(field), Some(cage), Some(layer)) = (self.field.clone(), self.cage.as_ref(), self.layer.clone()) else {
            return Err(CageError::invalid_state("commit", self.state));
        };

        // An outstanding preview is of no use any more; the commit starts
        // once it has returned
        self.job = None;

        let displaced = cage.displaced_positions();
        let mask = self.mask.clone();
        let fill = self.fill();
        let tile_size = self.settings.tile_size;
        let evaluator = self.evaluator;
        let generation = self.next_generation();

        let job = self.spawn(COMMIT_LABEL, generation, move |cancel, progress| {
            let bounds = layer.read().extent().bounds();
            let grid = evaluator.deform(&field, &displaced, Fidelity::Full, cancel)?;
            let area = evaluator.affected_region(&grid, field.cage(), bounds);
            let warp = Arc::new(TileWarp::new(grid, field.cage(), area, tile_size, cancel)?);

            let layer_span = if mask.is_some() { 0.5 } else { 1.0 };
            let style = RenderStyle {
                sampling: Sampling::Bilinear,
                fill,
            };
            let layer_shadow = RenderGraph::new(layer, warp.clone(), style)
                .processor()
                .run(cancel, &Stage::new(progress, 0.0, layer_span))?
                .finish();

            // Vacated mask pixels keep their value
            let mask_shadow = match mask {
                Some(mask) => {
                    progress.end();
                    progress.start(MASK_LABEL);
                    let style = RenderStyle {
                        sampling: Sampling::Bilinear,
                        fill: None,
                    };
                    let shadow = RenderGraph::new(mask, warp, style)
                        .processor()
                        .run(cancel, &Stage::new(progress, 0.5, 0.5))?
                        .finish();
                    Some(shadow)
                }
                None => None,
            };

            Ok(CommitOutput {
                area,
                layer: layer_shadow,
                mask: mask_shadow,
            })
        });

        self.job = Some(ActiveJob::Commit(job));
        self.set_state(SessionState::Committing);
        Ok(())
    }

    /// Stop whatever is going on and drop the coefficients and preview.
    ///
    /// The drawable is left as it was before any preview; the session can
    /// be started again afterwards.
    pub fn halt(&mut self) {
        if self.job.is_some() {
            info!("Halting cage session while {}", self.state);
        }
        self.release();
        self.cage = None;
        self.layer = None;
        self.mask = None;
        self.set_state(SessionState::Halted);
        self.display.request_redraw(None);
    }

    fn release(&mut self) {
        self.job = None;
        self.field = None;
        self.dragged = None;
        self.preview.store(None);
    }

    /// Check background work without blocking.
    ///
    /// Picks up a finished job, if any, and applies its result. Cancelled
    /// jobs are dropped silently. A failed commit is returned as an error
    /// after the drawable has been rolled back; the session is back in
    /// deforming so the commit can be retried.
    pub fn tick(&mut self) -> Result<Option<SessionEvent>, CageError> {
        let Some(job) = self.job.as_mut() else {
            return Ok(None);
        };

        let finished = match job {
            ActiveJob::Coefficients(handle) => match handle.poll() {
                JobPoll::Pending => return Ok(None),
                JobPoll::Ready(result) => Finished::Coefficients(result),
            },
            ActiveJob::Preview(handle) => match handle.poll() {
                JobPoll::Pending => return Ok(None),
                JobPoll::Ready(result) => Finished::Preview(result),
            },
            ActiveJob::Commit(handle) => match handle.poll() {
                JobPoll::Pending => return Ok(None),
                JobPoll::Ready(result) => Finished::Commit(result),
            },
        };
        self.job = None;

        match finished {
            Finished::Coefficients(Ok(field)) => {
                let region = field.region();
                self.field = Some(Arc::new(field));
                self.set_state(SessionState::Deforming);
                Ok(Some(SessionEvent::CoefficientsReady { region }))
            }
            Finished::Coefficients(Err(e)) if e.is_cancelled() => {
                info!("Coefficient computation cancelled");
                self.halt();
                Ok(None)
            }
            Finished::Coefficients(Err(e)) => {
                error!("Coefficient computation failed: {}", e);
                self.halt();
                Err(e)
            }

            Finished::Preview(Ok(frame)) => {
                let generation = frame.generation;
                let area = self.to_image(frame.rect);
                self.preview.store(Some(Arc::new(frame)));
                self.set_state(SessionState::Deforming);
                self.display.request_redraw(Some(area));
                Ok(Some(SessionEvent::PreviewReady { generation }))
            }
            Finished::Preview(Err(e)) if e.is_cancelled() => {
                self.set_state(SessionState::Deforming);
                Ok(None)
            }
            Finished::Preview(Err(e)) => {
                warn!("Preview failed: {}", e);
                self.set_state(SessionState::Deforming);
                Err(e)
            }

            Finished::Commit(Ok(output)) => match self.merge(&output) {
                Ok(()) => {
                    info!("Cage transform committed over {:?}", output.area);
                    let area = self.to_image(output.area);
                    self.halt();
                    Ok(Some(SessionEvent::Committed { area }))
                }
                Err(e) => {
                    warn!("{}", e);
                    self.set_state(SessionState::Deforming);
                    Err(e)
                }
            },
            Finished::Commit(Err(e)) if e.is_cancelled() => {
                info!("Commit cancelled, drawable untouched");
                self.set_state(SessionState::Deforming);
                Ok(None)
            }
            Finished::Commit(Err(e)) => {
                warn!("Commit render failed: {}", e);
                self.set_state(SessionState::Deforming);
                Err(e)
            }
        }
    }

    /// Merge rendered shadows into the layer and its mask, all or nothing
    fn merge(&self, output: &CommitOutput) -> Result<(), CageError> {
        let Some(layer) = self.layer.as_ref() else {
            return Err(CageError::invalid_state("commit", self.state));
        };

        let backup = match (&self.mask, &output.mask) {
            (Some(_), Some(_)) => Some(layer.read().capture(&output.layer.rects())),
            _ => None,
        };

        layer
            .write()
            .merge_shadow(&output.layer)
            .map_err(CageError::CommitFailure)?;

        if let (Some(mask), Some(mask_shadow)) = (&self.mask, &output.mask) {
            if let Err(e) = mask.write().merge_shadow(mask_shadow) {
                if let Some(backup) = backup {
                    if let Err(restore) = layer.write().merge_shadow(&backup) {
                        error!("Failed to restore layer after mask commit failure: {}", restore);
                    }
                }
                return Err(CageError::CommitFailure(e));
            }
        }

        Ok(())
    }

    /// Tick until no job is in flight, returning the last event
    pub async fn wait_idle(&mut self) -> Result<Option<SessionEvent>, CageError> {
        let interval = Duration::from_millis(self.settings.poll_interval_ms.max(1));
        let mut last = None;

        loop {
            if let Some(event) = self.tick()? {
                last = Some(event);
            }
            if self.job.is_none() {
                return Ok(last);
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Handle under an image-space cursor position
    pub fn cursor_handle(&self, x: f64, y: f64) -> Option<usize> {
        self.cage
            .as_ref()
            .and_then(|cage| cage.hit_test(x, y, self.settings.handle_size))
    }

    /// Button press at an image-space position.
    ///
    /// While editing, a press away from every handle adds a vertex and a
    /// press on the first vertex of a cage with at least 3 vertices closes
    /// it. A press on any other handle starts dragging it.
    pub fn pointer_press(&mut self, x: f64, y: f64) -> Result<(), CageError> {
        let hit = self.cursor_handle(x, y);

        match self.state {
            SessionState::EditingCage => match hit {
                Some(0) if self.cage.as_ref().map_or(0, |c| c.len()) > 2 => self.close_cage(),
                Some(index) => {
                    self.dragged = Some(index);
                    Ok(())
                }
                None => {
                    let index = self.add_vertex(x, y)?;
                    self.dragged = Some(index);
                    Ok(())
                }
            },
            SessionState::Deforming | SessionState::Previewing => {
                if let Some(index) = hit {
                    if self.state == SessionState::Previewing {
                        self.job = None;
                        self.set_state(SessionState::Deforming);
                    }
                    self.dragged = Some(index);
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Pointer motion at an image-space position; drags the pressed handle
    pub fn pointer_motion(&mut self, x: f64, y: f64) -> Result<(), CageError> {
        match self.dragged {
            Some(index) => self.move_vertex(index, x, y).map(|_| ()),
            None => Ok(()),
        }
    }

    pub fn pointer_release(&mut self) {
        self.dragged = None;
    }

    pub fn key(&mut self, key: CageKey) -> Result<(), CageError> {
        match (key, self.state) {
            (CageKey::Backspace, SessionState::EditingCage) => self.remove_last_vertex().map(|_| ()),
            (CageKey::Enter, SessionState::Deforming | SessionState::Previewing) => self.commit(),
            (CageKey::Escape, _) => {
                self.halt();
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// The layer with the visible preview composited on top, drawable-local
    pub fn composite(&self) -> Option<RgbaImage> {
        let layer = self.layer.as_ref()?;
        let (bounds, raw) = {
            let store = layer.read();
            let bounds = store.extent().bounds();
            (bounds, store.read_rect(bounds))
        };
        let mut img = RgbaImage::from_raw(bounds.width, bounds.height, raw)?;

        if let Some(frame) = self.preview.load_full() {
            imageops::replace(&mut img, &frame.pixels, frame.rect.x as i64, frame.rect.y as i64);
        }

        Some(img)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drawable::{Extent, PixelStore, StoreError, TiledDrawable};
    use crate::progress::LogProgress;
    use parking_lot::{Mutex, RwLock};

    fn gradient(width: u32, height: u32) -> RgbaImage {
        RgbaImage::from_fn(width, height, |x, y| Rgba([(x * 4) as u8, (y * 4) as u8, 128, 255]))
    }

    fn store(width: u32, height: u32) -> SharedStore {
        Arc::new(RwLock::new(TiledDrawable::from_rgba_image(&gradient(width, height))))
    }

    fn snapshot(store: &SharedStore) -> Vec<u8> {
        let store = store.read();
        store.read_rect(store.extent().bounds())
    }

    fn session() -> DeformationSession {
        session_with(Arc::new(NullDisplay))
    }

    fn session_with(display: Arc<dyn DisplaySink>) -> DeformationSession {
        let settings = CageToolSettings {
            poll_interval_ms: 1,
            ..CageToolSettings::default()
        };
        DeformationSession::new(Handle::current(), settings, display, Arc::new(LogProgress::default()))
    }

    fn place_square(session: &mut DeformationSession) {
        for (x, y) in [(10.0, 10.0), (50.0, 10.0), (50.0, 50.0), (10.0, 50.0)] {
            session.add_vertex(x, y).unwrap();
        }
    }

    async fn deforming_session(layer: SharedStore, mask: Option<SharedStore>) -> DeformationSession {
        let mut session = session();
        session.start(layer, mask).unwrap();
        place_square(&mut session);
        session.close_cage().unwrap();
        session.wait_idle().await.unwrap();
        assert_eq!(session.state(), SessionState::Deforming);
        session
    }

    /// Store whose merges always fail
    struct RejectingStore(TiledDrawable);

    impl PixelStore for RejectingStore {
        fn extent(&self) -> Extent {
            self.0.extent()
        }

        fn pixel(&self, x: i32, y: i32) -> Rgba<u8> {
            self.0.pixel(x, y)
        }

        fn merge_shadow(&mut self, _shadow: &ShadowBuffer) -> Result<(), StoreError> {
            Err(StoreError::Rejected("read-only".to_string()))
        }
    }

    #[derive(Default)]
    struct RedrawRecorder {
        areas: Mutex<Vec<Option<Rect>>>,
    }

    impl DisplaySink for RedrawRecorder {
        fn request_redraw(&self, area: Option<Rect>) {
            self.areas.lock().push(area);
        }
    }

    #[test]
    fn test_state_names() {
        assert_eq!(SessionState::EditingCage.to_string(), "editing cage");
        assert_eq!(SessionState::ComputingCoefficients.to_string(), "computing coefficients");
        assert_eq!(SessionState::Halted.to_string(), "halted");
    }

    #[tokio::test]
    async fn test_square_cage_reaches_deforming() {
        let layer = store(64, 64);
        let mut session = session();
        assert_eq!(session.state(), SessionState::NotStarted);
        assert!(session.add_vertex(1.0, 1.0).is_err());

        session.start(layer, None).unwrap();
        place_square(&mut session);
        assert_eq!(session.cursor_handle(51.0, 49.0), Some(2));

        session.close_cage().unwrap();
        assert_eq!(session.state(), SessionState::ComputingCoefficients);
        assert!(matches!(
            session.move_vertex(0, 1.0, 1.0),
            Err(CageError::InvalidCageState { .. })
        ));

        let event = session.wait_idle().await.unwrap();
        assert_eq!(
            event,
            Some(SessionEvent::CoefficientsReady {
                region: Rect::new(10, 10, 41, 41)
            })
        );
        assert_eq!(session.state(), SessionState::Deforming);
        assert!(session.coefficients().is_some());

        assert!(matches!(
            session.add_vertex(5.0, 5.0),
            Err(CageError::InvalidCageState { .. })
        ));
    }

    #[tokio::test]
    async fn test_degenerate_cage_stays_editing() {
        let mut session = session();
        session.start(store(32, 32), None).unwrap();
        session.add_vertex(1.0, 1.0).unwrap();
        session.add_vertex(20.0, 1.0).unwrap();

        assert!(matches!(session.close_cage(), Err(CageError::DegenerateCage(2))));
        assert_eq!(session.state(), SessionState::EditingCage);
        assert!(!session.is_busy());

        assert!(session.remove_last_vertex().unwrap().is_some());
        assert!(session.remove_last_vertex().unwrap().is_some());
        assert!(session.remove_last_vertex().unwrap().is_none());
        assert!(session.handles().is_empty());
    }

    #[tokio::test]
    async fn test_halt_mid_compute_is_restartable() {
        let layer = store(64, 64);
        let mut session = session();
        session.start(layer.clone(), None).unwrap();
        place_square(&mut session);
        session.close_cage().unwrap();

        session.halt();
        assert_eq!(session.state(), SessionState::Halted);
        assert!(!session.is_busy());
        assert!(session.coefficients().is_none());
        assert!(matches!(
            session.close_cage(),
            Err(CageError::InvalidCageState {
                state: SessionState::Halted,
                ..
            })
        ));
        assert_eq!(session.tick().unwrap(), None);

        session.start(layer, None).unwrap();
        assert_eq!(session.state(), SessionState::EditingCage);
        assert!(session.handles().is_empty());
    }

    #[tokio::test]
    async fn test_newer_drag_supersedes_preview() {
        let layer = store(64, 64);
        let before = snapshot(&layer);
        let display = Arc::new(RedrawRecorder::default());
        let mut session = session_with(display.clone());
        session.start(layer.clone(), None).unwrap();
        place_square(&mut session);
        session.close_cage().unwrap();
        session.wait_idle().await.unwrap();

        assert!(session.move_vertex(2, 55.0, 55.0).unwrap());
        let first = session.generation();
        assert_eq!(session.state(), SessionState::Previewing);
        assert!(session.move_vertex(2, 60.0, 60.0).unwrap());
        let second = session.generation();
        assert!(second > first);

        let event = session.wait_idle().await.unwrap();
        assert_eq!(event, Some(SessionEvent::PreviewReady { generation: second }));
        assert_eq!(session.state(), SessionState::Deforming);

        let frame = session.preview().unwrap();
        assert_eq!(frame.generation, second);
        assert_eq!(frame.rect, Rect::new(0, 0, 64, 64));
        assert_eq!(display.areas.lock().last(), Some(&Some(Rect::new(0, 0, 64, 64))));

        // Previews never reach the drawable
        assert_eq!(snapshot(&layer), before);
        assert!(session.move_vertex(9, 1.0, 1.0).map(|moved| !moved).unwrap());

        session.halt();
        assert!(session.preview().is_none());
        assert_eq!(snapshot(&layer), before);
    }

    #[tokio::test]
    async fn test_viewport_limits_preview() {
        let layer = store(64, 64);
        let mut session = deforming_session(layer, None).await;
        session.set_viewport(Some(Rect::new(20, 20, 100, 100)));
        session.move_vertex(0, 5.0, 5.0).unwrap();
        session.wait_idle().await.unwrap();

        let frame = session.preview().unwrap();
        assert_eq!(frame.rect, Rect::new(20, 20, 44, 44));
        assert_eq!(frame.pixels.dimensions(), (44, 44));

        let composite = session.composite().unwrap();
        assert_eq!(composite.dimensions(), (64, 64));
        assert_eq!(composite.get_pixel(1, 1), &Rgba([4, 4, 128, 255]));
    }

    #[tokio::test]
    async fn test_commit_writes_layer_and_halts() {
        let layer = store(64, 64);
        let before = snapshot(&layer);
        let mut session = deforming_session(layer.clone(), None).await;

        session.move_vertex(2, 60.0, 60.0).unwrap();
        session.commit().unwrap();
        assert_eq!(session.state(), SessionState::Committing);
        assert!(matches!(session.commit(), Err(CageError::InvalidCageState { .. })));

        let event = session.wait_idle().await.unwrap();
        assert!(matches!(event, Some(SessionEvent::Committed { .. })));
        assert_eq!(session.state(), SessionState::Halted);
        assert!(session.preview().is_none());
        assert_ne!(snapshot(&layer), before);

        // Pixels far from the cage are untouched
        assert_eq!(layer.read().pixel(2, 62), Rgba([8, 248, 128, 255]));
    }

    #[tokio::test]
    async fn test_commit_with_mask() {
        let layer = store(64, 64);
        let mask: SharedStore = Arc::new(RwLock::new(TiledDrawable::from_luma_image(
            &image::GrayImage::from_fn(64, 64, |x, _| image::Luma([(x * 4) as u8])),
        )));
        let mask_before = snapshot(&mask);
        let mut session = deforming_session(layer, Some(mask.clone())).await;

        session.move_vertex(2, 60.0, 60.0).unwrap();
        session.commit().unwrap();
        assert!(matches!(
            session.wait_idle().await.unwrap(),
            Some(SessionEvent::Committed { .. })
        ));
        assert_ne!(snapshot(&mask), mask_before);
    }

    #[tokio::test]
    async fn test_failed_mask_merge_rolls_back_layer() {
        let layer = store(64, 64);
        let before = snapshot(&layer);
        let mask: SharedStore = Arc::new(RwLock::new(RejectingStore(TiledDrawable::new(64, 64))));
        let mut session = deforming_session(layer.clone(), Some(mask)).await;

        session.move_vertex(2, 60.0, 60.0).unwrap();
        session.commit().unwrap();
        let result = session.wait_idle().await;

        assert!(matches!(result, Err(CageError::CommitFailure(StoreError::Rejected(_)))));
        assert_eq!(session.state(), SessionState::Deforming);
        assert_eq!(snapshot(&layer), before);

        // The user can still retry or keep dragging
        assert!(session.move_vertex(2, 58.0, 58.0).unwrap());
    }

    #[tokio::test]
    async fn test_failed_layer_merge_surfaces() {
        let layer: SharedStore = Arc::new(RwLock::new(RejectingStore(TiledDrawable::from_rgba_image(
            &gradient(64, 64),
        ))));
        let mut session = deforming_session(layer, None).await;
        session.move_vertex(1, 55.0, 5.0).unwrap();
        session.commit().unwrap();

        assert!(matches!(session.wait_idle().await, Err(CageError::CommitFailure(_))));
        assert_eq!(session.state(), SessionState::Deforming);
        assert!(session.coefficients().is_some());
    }

    #[tokio::test]
    async fn test_pointer_flow() {
        let layer = store(128, 128);
        let mut session = session();
        session.start(layer, None).unwrap();

        session.pointer_press(10.0, 10.0).unwrap();
        session.pointer_release();
        session.pointer_press(100.0, 10.0).unwrap();
        session.pointer_motion(110.0, 12.0).unwrap();
        session.pointer_release();
        session.pointer_press(100.0, 100.0).unwrap();
        session.pointer_release();
        assert_eq!(session.handles()[1], CageHandle { id: 1, x: 110.0, y: 12.0 });

        session.key(CageKey::Backspace).unwrap();
        assert_eq!(session.handles().len(), 2);
        session.pointer_press(100.0, 100.0).unwrap();
        session.pointer_release();

        // Pressing the first handle closes the cage
        session.pointer_press(12.0, 12.0).unwrap();
        assert_eq!(session.state(), SessionState::ComputingCoefficients);
        session.wait_idle().await.unwrap();

        session.pointer_press(101.0, 101.0).unwrap();
        session.pointer_motion(90.0, 90.0).unwrap();
        assert_eq!(session.state(), SessionState::Previewing);
        session.pointer_release();

        session.key(CageKey::Enter).unwrap();
        assert_eq!(session.state(), SessionState::Committing);
        session.key(CageKey::Escape).unwrap();
        assert_eq!(session.state(), SessionState::Halted);
    }

    #[tokio::test]
    async fn test_drawable_offset() {
        let layer: SharedStore = Arc::new(RwLock::new(
            TiledDrawable::from_rgba_image(&gradient(64, 64)).with_offset(100, 50),
        ));
        let mut session = session();
        session.start(layer, None).unwrap();
        session.add_vertex(110.0, 60.0).unwrap();

        let cage = session.cage().unwrap();
        assert_eq!(cage.vertices()[0].original, crate::config::Point::new(10.0, 10.0));
        assert_eq!(session.handles()[0], CageHandle { id: 0, x: 110.0, y: 60.0 });
        assert_eq!(session.cursor_handle(112.0, 62.0), Some(0));
    }

    /// Counts jobs between `start` and `end` and remembers the peak
    #[derive(Default)]
    struct OverlapCounter {
        live: Mutex<(usize, usize)>,
    }

    impl ProgressReporter for OverlapCounter {
        fn start(&self, _label: &str) {
            let mut live = self.live.lock();
            live.0 += 1;
            live.1 = live.1.max(live.0);
        }

        fn set_value(&self, _value: f64) {}

        fn end(&self) {
            self.live.lock().0 -= 1;
        }
    }

    #[tokio::test]
    async fn test_drag_ticks_run_one_job_at_a_time() {
        let counter = Arc::new(OverlapCounter::default());
        let settings = CageToolSettings {
            poll_interval_ms: 1,
            preview_stride: 1,
            ..CageToolSettings::default()
        };
        let mut session = DeformationSession::new(Handle::current(), settings, Arc::new(NullDisplay), counter.clone());
        session.start(store(256, 256), None).unwrap();
        for (x, y) in [(10.0, 10.0), (240.0, 10.0), (240.0, 240.0), (10.0, 240.0)] {
            session.add_vertex(x, y).unwrap();
        }
        session.close_cage().unwrap();
        session.wait_idle().await.unwrap();

        for i in 0..12 {
            session.move_vertex(2, 240.0 - i as f64, 240.0 + i as f64).unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        let last = session.generation();

        let event = session.wait_idle().await.unwrap();
        assert_eq!(event, Some(SessionEvent::PreviewReady { generation: last }));
        assert_eq!(*counter.live.lock(), (0, 1));
    }

    #[tokio::test]
    async fn test_commit_fills_vacated_layer_pixels_only() {
        let layer = store(64, 64);
        let mask: SharedStore = Arc::new(RwLock::new(TiledDrawable::from_luma_image(
            &image::GrayImage::from_fn(64, 64, |x, _| image::Luma([(x * 4) as u8])),
        )));
        let settings = CageToolSettings {
            poll_interval_ms: 1,
            fill_plain_color: true,
            fill_color: [255, 0, 0, 255],
            ..CageToolSettings::default()
        };
        let mut session = DeformationSession::new(
            Handle::current(),
            settings,
            Arc::new(NullDisplay),
            Arc::new(LogProgress::default()),
        );
        session.start(layer.clone(), Some(mask.clone())).unwrap();
        place_square(&mut session);
        session.close_cage().unwrap();
        session.wait_idle().await.unwrap();

        // Folds the cage into the triangle below x + y = 60
        session.move_vertex(2, 30.0, 30.0).unwrap();
        session.commit().unwrap();
        assert!(matches!(
            session.wait_idle().await.unwrap(),
            Some(SessionEvent::Committed { .. })
        ));

        assert_eq!(layer.read().pixel(45, 45), Rgba([255, 0, 0, 255]));
        assert_eq!(mask.read().pixel(45, 45), Rgba([180, 180, 180, 255]));
        assert_eq!(layer.read().pixel(2, 62), Rgba([8, 248, 128, 255]));
        assert_ne!(layer.read().pixel(20, 20), Rgba([255, 0, 0, 255]));
    }

    #[tokio::test]
    async fn test_cancelled_commit_returns_to_deforming() {
        let layer = store(64, 64);
        let before = snapshot(&layer);
        let mut session = deforming_session(layer.clone(), None).await;
        session.move_vertex(2, 60.0, 60.0).unwrap();
        session.wait_idle().await.unwrap();

        // Hold the commit back until it has been cancelled
        let gate = JobLatch::new();
        session.tail = Some(gate.clone());
        session.commit().unwrap();
        match &session.job {
            Some(ActiveJob::Commit(job)) => job.cancel(),
            _ => panic!("no commit in flight"),
        }
        gate.release();

        assert_eq!(session.wait_idle().await.unwrap(), None);
        assert_eq!(session.state(), SessionState::Deforming);
        assert_eq!(snapshot(&layer), before);

        session.commit().unwrap();
        assert!(matches!(
            session.wait_idle().await.unwrap(),
            Some(SessionEvent::Committed { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancelled_compute_halts() {
        let layer = store(64, 64);
        let mut session = session();
        session.start(layer.clone(), None).unwrap();
        place_square(&mut session);

        let gate = JobLatch::new();
        session.tail = Some(gate.clone());
        session.close_cage().unwrap();
        match &session.job {
            Some(ActiveJob::Coefficients(job)) => job.cancel(),
            _ => panic!("no computation in flight"),
        }
        gate.release();

        assert_eq!(session.wait_idle().await.unwrap(), None);
        assert_eq!(session.state(), SessionState::Halted);
        assert!(session.coefficients().is_none());

        session.start(layer, None).unwrap();
        assert_eq!(session.state(), SessionState::EditingCage);
    }
}
