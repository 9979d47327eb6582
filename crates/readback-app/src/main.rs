//! Readback - GPU crop/scale/readback driver
//!
//! Uploads a colour-bar test pattern, reads it back scaled as BGRA and as
//! YUV 4:2:0, and logs what came back.

use anyhow::{bail, Context, Result};
use crossbeam_channel::{unbounded, Receiver};
use parking_lot::Mutex;
use readback_core::{FrameBuffer, PixelFormat, ReadbackCallback, ReadbackConfig, Size};
use readback_gpu::{ReadbackHelper, SharedContext, SoftwareContext, WgpuContext};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

const SOURCE_SIZE: Size = Size::new(1280, 720);
const TARGET_SIZE: Size = Size::new(320, 180);

fn main() -> Result<()> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Readback starting...");

    let config = match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => ReadbackConfig::load(&path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => ReadbackConfig::default(),
    };

    let gl = create_context(&config);
    let helper = ReadbackHelper::with_config(gl.clone(), config);

    let frame = FrameBuffer::test_pattern(SOURCE_SIZE.width, SOURCE_SIZE.height);
    let texture = helper.create_texture();
    gl.tex_image_2d(texture, SOURCE_SIZE, Some(&frame.to_packed()))?;

    let (sender, receiver) = unbounded();

    // Crop/scale/readback.
    let pixels = Arc::new(Mutex::new(vec![0u8; TARGET_SIZE.area() * 4]));
    let done = sender.clone();
    helper.crop_scale_readback_and_clean_texture(
        texture,
        SOURCE_SIZE,
        SOURCE_SIZE.to_rect(),
        TARGET_SIZE,
        pixels.clone(),
        PixelFormat::Bgra8,
        move |ok: bool| {
            let _ = done.send(("bgra", ok));
        },
    );

    // YUV readback through a mailbox.
    let (mailbox, sync_point) = helper.produce_mailbox_from_texture(texture);
    let pipeline = helper.create_readback_pipeline_yuv(
        helper.config().default_quality,
        SOURCE_SIZE,
        SOURCE_SIZE.to_rect(),
        TARGET_SIZE,
        TARGET_SIZE.to_rect(),
        true,
        helper.config().use_mrt,
    )?;
    let yuv = Arc::new(Mutex::new(FrameBuffer::new(
        TARGET_SIZE.width,
        TARGET_SIZE.height,
        PixelFormat::Yuv420P,
    )));
    let done = sender.clone();
    pipeline.readback_yuv(
        &mailbox,
        sync_point,
        &yuv,
        ReadbackCallback::new(move |ok| {
            let _ = done.send(("yuv", ok));
        }),
    );
    drop(sender);

    gl.poll(true);
    let results = drain(&receiver);
    if results.len() != 2 {
        bail!("expected 2 readbacks, {} completed", results.len());
    }
    for (name, ok) in results {
        if !ok {
            bail!("{} readback failed", name);
        }
        info!(readback = name, "Readback complete");
    }

    let pixels = pixels.lock();
    let first = &pixels[..4];
    let last = &pixels[pixels.len() - 4..];
    info!(?first, ?last, size = %TARGET_SIZE, "BGRA corners");

    let yuv = yuv.lock();
    for (name, plane) in ["y", "u", "v"].iter().zip(yuv.planes.iter()) {
        let sum: u64 = (0..plane.height)
            .flat_map(|y| plane.row(y).iter())
            .map(|&b| b as u64)
            .sum();
        let mean = sum / (plane.width as u64 * plane.height as u64).max(1);
        info!(plane = name, width = plane.width, height = plane.height, mean, "YUV plane");
    }

    helper.delete_texture(texture);
    info!("Readback finished");
    Ok(())
}

fn create_context(config: &ReadbackConfig) -> SharedContext {
    match WgpuContext::new_blocking() {
        Ok(ctx) => {
            info!(adapter = %ctx.adapter_info().name, "Using wgpu context");
            Arc::new(ctx)
        }
        Err(e) => {
            warn!(error = %e, "No GPU available, using software context");
            Arc::new(SoftwareContext::with_config(config.software.clone()))
        }
    }
}

fn drain(receiver: &Receiver<(&'static str, bool)>) -> Vec<(&'static str, bool)> {
    receiver.try_iter().collect()
}
