//! cagewarp - cage deformation of raster images
//!
//! `apply` runs a scripted cage session headlessly: the script places the
//! cage, drags its vertices and the result is committed and written out.
//! `serve` keeps an interactive session open behind a small HTTP API.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use parking_lot::RwLock;
use tokio::runtime::Handle;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use cagewarp::cage::signed_area;
use cagewarp::server::{self, AppState};
use cagewarp::{
    CageScript, Config, DeformationSession, LogProgress, NullDisplay, SessionEvent, SharedStore,
    TiledDrawable,
};

/// cagewarp - warp part of an image by dragging the vertices of a cage
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply a scripted cage deformation to an image
    Apply {
        /// Image to deform
        #[arg(short, long)]
        input: PathBuf,

        /// Where to write the deformed image
        #[arg(short, long)]
        output: PathBuf,

        /// Cage script (TOML) with vertices and their displaced positions
        #[arg(short, long)]
        script: PathBuf,

        /// Grayscale layer mask deformed along with the image
        #[arg(short, long)]
        mask: Option<PathBuf>,

        /// Where to write the deformed mask
        #[arg(long, requires = "mask")]
        mask_output: Option<PathBuf>,
    },

    /// Serve an interactive cage session over HTTP
    Serve {
        /// Image to deform
        #[arg(short, long)]
        input: PathBuf,

        /// Where /api/image/save writes the deformed image
        #[arg(short, long)]
        output: PathBuf,

        /// Grayscale layer mask deformed along with the image
        #[arg(short, long)]
        mask: Option<PathBuf>,

        /// Web server host (overrides the config file)
        #[arg(long)]
        host: Option<String>,

        /// Web server port (overrides the config file)
        #[arg(short, long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let _subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    info!("cagewarp v{}", env!("CARGO_PKG_VERSION"));

    // Load or create configuration
    let config = Config::load_or_create(&args.config)?;

    match args.command {
        Command::Apply {
            input,
            output,
            script,
            mask,
            mask_output,
        } => run_apply(config, &input, &output, &script, mask.as_deref(), mask_output.as_deref()).await,
        Command::Serve {
            input,
            output,
            mask,
            host,
            port,
        } => run_serve(config, &input, output, mask.as_deref(), host, port).await,
    }
}

fn load_layer(path: &Path) -> Result<Arc<RwLock<TiledDrawable>>> {
    let img = image::open(path)
        .with_context(|| format!("Failed to open image {:?}", path))?
        .to_rgba8();
    info!("Loaded {:?} ({}x{})", path, img.width(), img.height());
    Ok(Arc::new(RwLock::new(TiledDrawable::from_rgba_image(&img))))
}

fn load_mask(path: &Path) -> Result<Arc<RwLock<TiledDrawable>>> {
    let img = image::open(path)
        .with_context(|| format!("Failed to open mask {:?}", path))?
        .to_luma8();
    info!("Loaded mask {:?} ({}x{})", path, img.width(), img.height());
    Ok(Arc::new(RwLock::new(TiledDrawable::from_luma_image(&img))))
}

async fn run_apply(
    config: Config,
    input: &Path,
    output: &Path,
    script_path: &Path,
    mask_path: Option<&Path>,
    mask_output: Option<&Path>,
) -> Result<()> {
    let script = CageScript::load(script_path)?;
    let layer = load_layer(input)?;
    let mask = mask_path.map(load_mask).transpose()?;

    let mut session = DeformationSession::new(
        Handle::current(),
        config.cage.clone(),
        Arc::new(NullDisplay),
        Arc::new(LogProgress::default()),
    );

    let layer_store: SharedStore = layer.clone();
    let mask_store: Option<SharedStore> = mask.clone().map(|m| m as SharedStore);
    session.start(layer_store, mask_store)?;

    for p in &script.vertices {
        session.add_vertex(p.x, p.y)?;
    }
    session.close_cage()?;
    session.wait_idle().await?;

    if script.displaced.is_empty() {
        warn!("Cage script has no displaced positions, the image is written unchanged");
    } else {
        session.set_viewport(script.viewport);

        // Closing reverses a clockwise cage; follow it
        let mut displaced = script.displaced.clone();
        if signed_area(&script.vertices) < 0.0 {
            displaced.reverse();
        }
        for (i, p) in displaced.iter().enumerate() {
            session.move_vertex(i, p.x, p.y)?;
        }
        session.wait_idle().await?;

        session.commit()?;
        if let Some(SessionEvent::Committed { area }) = session.wait_idle().await? {
            info!("Committed cage transform over {:?}", area);
        }
    }

    let img = layer.read().to_rgba_image();
    img.save(output)
        .with_context(|| format!("Failed to save image to {:?}", output))?;
    info!("Wrote {:?}", output);

    if let (Some(mask), Some(path)) = (mask, mask_output) {
        let img = mask.read().to_luma_image();
        img.save(path)
            .with_context(|| format!("Failed to save mask to {:?}", path))?;
        info!("Wrote mask {:?}", path);
    }

    Ok(())
}

async fn run_serve(
    config: Config,
    input: &Path,
    output: PathBuf,
    mask_path: Option<&Path>,
    host: Option<String>,
    port: Option<u16>,
) -> Result<()> {
    let layer: SharedStore = load_layer(input)?;
    let mask: Option<SharedStore> = match mask_path {
        Some(path) => Some(load_mask(path)? as SharedStore),
        None => None,
    };

    // Use config file values, with CLI args as overrides
    let host = host.unwrap_or_else(|| config.server.host.clone());
    let port = port.unwrap_or(config.server.port);
    let config = Arc::new(RwLock::new(config));

    let state = Arc::new(AppState::new(config, Handle::current(), layer, mask, output));

    let addr = format!("{}:{}", host, port);
    info!("Starting web server at http://{}", addr);

    server::run_server(&addr, state).await
}
