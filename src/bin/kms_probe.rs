//! Probe a KMS device and flip a few frames through the commit queue
//!
//! Prints the discovered topology, then shows `--frames` solid frames from a
//! pool of dumb buffers on the primary plane of the first connected output.
//! With `--virtual` it runs against the in-memory device, with a thread
//! standing in for vblank.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use kms_atomic::device::{Card, KmsDevice, VirtualConfig, VirtualDevice};
use kms_atomic::fourcc::{fourcc_string, DRM_FORMAT_XRGB8888};
use kms_atomic::objects::format_list;
use kms_atomic::{EnvConfig, Environment, PlaneTypes, PollQueue, Pool, Rect};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "kms_probe")]
#[command(about = "Probe a KMS device and flip test frames", long_about = None)]
struct Args {
    /// DRM card node; the first usable card if omitted
    #[arg(long)]
    device: Option<PathBuf>,

    /// Use the in-memory virtual device
    #[arg(long = "virtual", conflicts_with = "device")]
    use_virtual: bool,

    /// Environment config (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Frame width; the CRTC's mode width if omitted
    #[arg(long)]
    width: Option<u32>,

    /// Frame height; the CRTC's mode height if omitted
    #[arg(long)]
    height: Option<u32>,

    /// Frames to show
    #[arg(short, long, default_value_t = 60)]
    frames: u32,

    /// Enable verbose debug output
    #[arg(short, long)]
    debug: bool,
}

fn print_topology(env: &Environment) {
    println!("=== Topology ===");
    for conn in env.connectors() {
        let mode = conn
            .preferred_mode()
            .map(|m| format!("{}@{}", m.name(), m.vrefresh))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  connector {} {}: {} ({} modes, preferred {})",
            conn.id(),
            conn.name(),
            if conn.is_connected() { "connected" } else { "disconnected" },
            conn.modes().len(),
            mode
        );
    }
    for crtc in env.crtcs() {
        println!("  crtc {}: {}x{}", crtc.id(), crtc.width(), crtc.height());
    }
    for plane in env.planes() {
        println!(
            "  plane {} {:?}: {}",
            plane.id(),
            plane.plane_type(),
            format_list(plane)
        );
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.debug {
        "debug,kms_atomic=debug"
    } else {
        "warn,kms_atomic=info,kms_probe=info"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = match &args.config {
        Some(path) => EnvConfig::load(path).with_context(|| format!("loading {:?}", path))?,
        None => EnvConfig::default(),
    };

    let mut vdev = None;
    let device: Arc<dyn KmsDevice> = if args.use_virtual {
        let dev = Arc::new(VirtualDevice::new(VirtualConfig::default())?);
        vdev = Some(Arc::clone(&dev));
        dev
    } else {
        match &args.device {
            Some(path) => Arc::new(Card::open(path).with_context(|| format!("opening {:?}", path))?),
            None => Arc::new(Card::open_first().context("no usable DRM card")?),
        }
    };

    let scheduler = Arc::new(PollQueue::new().context("starting poll loop")?);
    let env = Environment::new(device, scheduler, config)?;
    env.set_lost_handler(|e| warn!(error = %e, "Display device went away"));
    print_topology(&env);

    let (conn, crtc) = env
        .first_output()
        .ok_or_else(|| anyhow!("no connected output"))?;
    let plane = env.claim_plane(&crtc, PlaneTypes::PRIMARY)?;
    let width = args.width.unwrap_or(crtc.width());
    let height = args.height.unwrap_or(crtc.height());
    info!(
        connector = %conn.name(),
        crtc_id = crtc.id(),
        plane_id = plane.id(),
        "Flipping {} frames of {}x{} {}",
        args.frames,
        width,
        height,
        fourcc_string(DRM_FORMAT_XRGB8888)
    );

    // Virtual vblank
    let running = Arc::new(AtomicBool::new(true));
    let vblank = vdev.map(|dev| {
        let running = Arc::clone(&running);
        thread::spawn(move || {
            while running.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_millis(16));
                dev.complete_flips();
            }
        })
    });

    let pool = Pool::new(&env, 3);
    let dest = Rect::wh(crtc.width(), crtc.height());
    let start = Instant::now();
    for frame in 0..args.frames {
        let fb = pool.acquire(width, height, DRM_FORMAT_XRGB8888)?;
        if let Some(mut w) = fb.write() {
            w.fill((frame * 4 % 256) as u8);
        }
        let mut a = env.atomic();
        a.plane_fb_set(&plane, Some(&fb), dest)?;
        drop(fb);
        env.queue(a)?;
        env.queue_wait()?;
    }
    let elapsed = start.elapsed();

    running.store(false, Ordering::Relaxed);
    if let Some(handle) = vblank {
        let _ = handle.join();
    }

    println!(
        "=== {} frames in {:.2?} ({} FBs allocated, {} free) ===",
        args.frames,
        elapsed,
        pool.live_count(),
        pool.free_count()
    );
    Ok(())
}
