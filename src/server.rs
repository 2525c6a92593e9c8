//! Web server exposing a cage session as a JSON API

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use image::RgbaImage;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::cage::CageHandle;
use crate::config::{Config, Rect};
use crate::drawable::{PixelStore, SharedStore};
use crate::error::CageError;
use crate::progress::LogProgress;
use crate::session::{DeformationSession, DisplaySink, SessionEvent, SessionState};

/// Display sink that counts redraw requests so encoders know when the
/// picture changed
#[derive(Debug, Default)]
pub struct RedrawCounter {
    version: AtomicU64,
}

impl RedrawCounter {
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }
}

impl DisplaySink for RedrawCounter {
    fn request_redraw(&self, _area: Option<Rect>) {
        self.version.fetch_add(1, Ordering::AcqRel);
    }
}

/// Shared application state
pub struct AppState {
    /// Configuration (with cage tool settings)
    pub config: Arc<RwLock<Config>>,
    /// The interactive session; never held across an await
    pub session: Mutex<DeformationSession>,
    /// Drawable being deformed
    layer: SharedStore,
    /// Optional layer mask deformed along with it
    mask: Option<SharedStore>,
    /// Where `/api/image/save` writes the drawable
    output_path: PathBuf,
    display: Arc<RedrawCounter>,
    /// Last encoded preview and the redraw version it was encoded at
    preview_cache: Mutex<Option<(u64, Vec<u8>)>>,
    /// Last error reported by a background job
    last_error: Mutex<Option<String>>,
}

impl AppState {
    pub fn new(
        config: Arc<RwLock<Config>>,
        runtime: Handle,
        layer: SharedStore,
        mask: Option<SharedStore>,
        output_path: PathBuf,
    ) -> Self {
        let display = Arc::new(RedrawCounter::default());
        let settings = config.read().cage.clone();
        let session = DeformationSession::new(runtime, settings, display.clone(), Arc::new(LogProgress::default()));

        Self {
            config,
            session: Mutex::new(session),
            layer,
            mask,
            output_path,
            display,
            preview_cache: Mutex::new(None),
            last_error: Mutex::new(None),
        }
    }

    /// Check the session's background work once
    pub fn tick(&self) -> Option<SessionEvent> {
        let result = self.session.lock().tick();
        match result {
            Ok(event) => {
                if event.is_some() {
                    *self.last_error.lock() = None;
                }
                event
            }
            Err(e) => {
                warn!("Cage job failed: {}", e);
                *self.last_error.lock() = Some(e.to_string());
                None
            }
        }
    }

    /// The drawable with the current preview on top
    pub fn composite(&self) -> RgbaImage {
        if let Some(img) = self.session.lock().composite() {
            return img;
        }

        let layer = self.layer.read();
        let bounds = layer.extent().bounds();
        RgbaImage::from_raw(bounds.width, bounds.height, layer.read_rect(bounds))
            .unwrap_or_else(|| RgbaImage::new(bounds.width, bounds.height))
    }

    /// JPEG of the composite, re-encoded only after a redraw request
    pub fn preview_jpeg(&self) -> Result<Vec<u8>> {
        let version = self.display.version();
        if let Some((cached, jpeg)) = self.preview_cache.lock().as_ref() {
            if *cached == version {
                return Ok(jpeg.clone());
            }
        }

        let quality = self.config.read().cage.jpeg_quality;
        let jpeg = encode_jpeg(&self.composite(), quality)?;
        *self.preview_cache.lock() = Some((version, jpeg.clone()));
        Ok(jpeg)
    }

    /// Write the drawable to the output path
    pub fn save_image(&self) -> Result<PathBuf> {
        let img = {
            let layer = self.layer.read();
            let bounds = layer.extent().bounds();
            RgbaImage::from_raw(bounds.width, bounds.height, layer.read_rect(bounds))
                .context("Drawable size does not match its pixel data")?
        };

        img.save(&self.output_path)
            .with_context(|| format!("Failed to save image to {:?}", self.output_path))?;
        info!("Saved image to {:?}", self.output_path);

        Ok(self.output_path.clone())
    }
}

/// Encode RGBA pixels to JPEG, dropping alpha
fn encode_jpeg(img: &RgbaImage, quality: u8) -> Result<Vec<u8>> {
    use image::{DynamicImage, ImageOutputFormat};
    use std::io::Cursor;

    let rgb = DynamicImage::ImageRgba8(img.clone()).to_rgb8();

    let mut jpeg_data = Vec::new();
    let mut cursor = Cursor::new(&mut jpeg_data);
    rgb.write_to(&mut cursor, ImageOutputFormat::Jpeg(quality))?;

    Ok(jpeg_data)
}

/// Periodically pick up finished background jobs
pub fn spawn_ticker(state: Arc<AppState>) -> JoinHandle<()> {
    let period = Duration::from_millis(state.config.read().cage.poll_interval_ms.max(1));

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            if let Some(event) = state.tick() {
                info!("Cage session: {:?}", event);
            }
        }
    })
}

/// Build the API router
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/cage", get(get_cage))
        .route("/api/cage/start", post(start_cage))
        .route("/api/cage/vertex", post(add_vertex))
        .route("/api/cage/vertex/last", delete(remove_last_vertex))
        .route("/api/cage/vertex/:id", post(move_vertex))
        .route("/api/cage/close", post(close_cage))
        .route("/api/cage/commit", post(commit_cage))
        .route("/api/cage/halt", post(halt_cage))
        .route("/api/cage/viewport", post(set_viewport))
        .route("/api/image/save", post(save_image))
        // Preview streams
        .route("/api/preview", get(get_preview))
        .route("/api/preview/stream", get(preview_stream))
        // System info
        .route("/api/info", get(get_info))
        .layer(cors)
        .with_state(state)
}

/// Run the web server
pub async fn run_server(addr: &str, state: Arc<AppState>) -> Result<()> {
    let app = router(state.clone());
    let _ticker = spawn_ticker(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Web server listening on http://{}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Map session errors to HTTP responses
fn error_response(err: CageError) -> Response {
    let status = match &err {
        CageError::InvalidCageState { .. } => StatusCode::CONFLICT,
        CageError::DegenerateCage(_) => StatusCode::UNPROCESSABLE_ENTITY,
        CageError::Cancelled => StatusCode::GONE,
        CageError::CommitFailure(_) | CageError::JobFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string()).into_response()
}

/// API response for the cage state
#[derive(Serialize, Deserialize)]
struct CageResponse {
    state: SessionState,
    handles: Vec<CageHandle>,
    progress: Option<f64>,
    generation: u64,
    has_preview: bool,
    last_error: Option<String>,
}

/// Get the current session state
async fn get_cage(State(state): State<Arc<AppState>>) -> Json<CageResponse> {
    let last_error = state.last_error.lock().clone();
    let session = state.session.lock();

    Json(CageResponse {
        state: session.state(),
        handles: session.handles(),
        progress: session.progress(),
        generation: session.generation(),
        has_preview: session.preview().is_some(),
        last_error,
    })
}

/// Start a new cage on the drawable
async fn start_cage(State(state): State<Arc<AppState>>) -> Response {
    let result = state
        .session
        .lock()
        .start(state.layer.clone(), state.mask.clone());

    match result {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct VertexRequest {
    x: f64,
    y: f64,
}

#[derive(Serialize, Deserialize)]
struct AddVertexResponse {
    id: usize,
}

/// Append a vertex to the cage being edited
async fn add_vertex(State(state): State<Arc<AppState>>, Json(req): Json<VertexRequest>) -> Response {
    let result = state.session.lock().add_vertex(req.x, req.y);
    match result {
        Ok(id) => Json(AddVertexResponse { id }).into_response(),
        Err(e) => error_response(e),
    }
}

/// Remove the last placed vertex
async fn remove_last_vertex(State(state): State<Arc<AppState>>) -> Response {
    let result = state.session.lock().remove_last_vertex();
    match result {
        Ok(Some(_)) => StatusCode::OK.into_response(),
        Ok(None) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

/// Move a vertex; a drag tick while deforming
async fn move_vertex(
    State(state): State<Arc<AppState>>,
    Path(id): Path<usize>,
    Json(req): Json<VertexRequest>,
) -> Response {
    let result = state.session.lock().move_vertex(id, req.x, req.y);
    match result {
        Ok(true) => StatusCode::OK.into_response(),
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => error_response(e),
    }
}

/// Close the cage and start computing coefficients
async fn close_cage(State(state): State<Arc<AppState>>) -> Response {
    let result = state.session.lock().close_cage();
    match result {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => error_response(e),
    }
}

/// Render the deformation at full resolution and merge it
async fn commit_cage(State(state): State<Arc<AppState>>) -> Response {
    let result = state.session.lock().commit();
    match result {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => error_response(e),
    }
}

/// Stop the session and drop its preview
async fn halt_cage(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.session.lock().halt();
    StatusCode::OK
}

#[derive(Deserialize)]
struct ViewportRequest {
    viewport: Option<Rect>,
}

/// Restrict previews to the visible area
async fn set_viewport(State(state): State<Arc<AppState>>, Json(req): Json<ViewportRequest>) -> impl IntoResponse {
    state.session.lock().set_viewport(req.viewport);
    StatusCode::OK
}

/// Save the drawable to the output file
async fn save_image(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.save_image() {
        Ok(path) => (StatusCode::OK, format!("Saved to {}", path.display())).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// Get the current preview frame (JPEG)
async fn get_preview(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.preview_jpeg() {
        Ok(frame) => ([(axum::http::header::CONTENT_TYPE, "image/jpeg")], frame).into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

/// MJPEG stream endpoint for continuous preview
async fn preview_stream(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    use axum::body::Body;
    use tokio_stream::StreamExt;

    let stream = tokio_stream::wrappers::IntervalStream::new(tokio::time::interval(
        Duration::from_millis(100), // ~10 fps for preview
    ))
    .map(move |_| {
        let frame = state.preview_jpeg().unwrap_or_default();
        if frame.is_empty() {
            return Ok::<_, std::convert::Infallible>(
                "--frame\r\nContent-Type: image/jpeg\r\n\r\n".to_string().into_bytes(),
            );
        }

        let mut response = Vec::new();
        response.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\nContent-Length: ");
        response.extend_from_slice(frame.len().to_string().as_bytes());
        response.extend_from_slice(b"\r\n\r\n");
        response.extend_from_slice(&frame);
        response.extend_from_slice(b"\r\n");

        Ok(response)
    });

    let body = Body::from_stream(stream);

    (
        [(
            axum::http::header::CONTENT_TYPE,
            "multipart/x-mixed-replace; boundary=frame",
        )],
        body,
    )
}

/// System information response
#[derive(Serialize, Deserialize)]
struct InfoResponse {
    version: String,
    width: u32,
    height: u32,
    offset_x: i32,
    offset_y: i32,
    has_mask: bool,
    handle_size: f64,
}

/// Get system information
async fn get_info(State(state): State<Arc<AppState>>) -> Json<InfoResponse> {
    let extent = state.layer.read().extent();
    let handle_size = state.config.read().cage.handle_size;

    Json(InfoResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        width: extent.width,
        height: extent.height,
        offset_x: extent.offset_x,
        offset_y: extent.offset_y,
        has_mask: state.mask.is_some(),
        handle_size,
    })
}
