// screen2artnet - Ambient lighting from screen areas, sent to RGB fixtures over Art-Net
// Supports continuous run mode and a one-shot PNG preview of the area layout
use anyhow::{Context, Result};
use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

mod artnet;
mod capture;
mod config;
mod dmx;
mod error;
mod layout;
mod logging;
mod pool;
mod preview;
mod render;
mod sampler;
mod types;

use artnet::{ArtNetController, Transmit};
use capture::{FrameSource, StillImage};
use config::{Args, Mode, Settings};
use layout::Layout;
use render::{LoopOptions, RenderLoop};
use sampler::AreaSampler;

// Pick the frame source: a still image when given, the display otherwise
fn open_source(settings: &Settings) -> Result<Box<dyn FrameSource>> {
    if let Some(ref image) = settings.image {
        let source = StillImage::open(image)
            .with_context(|| format!("Failed to open image {}", image.display()))?;
        tracing::info!("Sampling still image {} ({})", image.display(), source.bounds());
        return Ok(Box::new(source));
    }
    open_screen(settings.screen)
}

#[cfg(feature = "screen")]
fn open_screen(index: usize) -> Result<Box<dyn FrameSource>> {
    let source = capture::ScreenSource::new(index)
        .with_context(|| format!("Failed to open display {}", index))?;
    Ok(Box::new(source))
}

#[cfg(not(feature = "screen"))]
fn open_screen(index: usize) -> Result<Box<dyn FrameSource>> {
    anyhow::bail!(
        "display {} requested but screen capture is not compiled in; \
         rebuild with --features screen or pass --image",
        index
    )
}

fn warn_outside_areas(layout: &Layout, source: &dyn FrameSource) {
    let bounds = source.bounds();
    for area in &layout.areas {
        if bounds.intersect(&area.rect()).is_empty() {
            tracing::warn!(
                "Area {} ({}) lies outside the capture ({})",
                area.name(),
                area.rect(),
                bounds
            );
        }
    }
}

fn run_mode(
    settings: &Settings,
    layout: Layout,
    source: Box<dyn FrameSource>,
    sampler: AreaSampler,
) -> Result<()> {
    let controller = ArtNetController::new(&settings.src, &settings.dst)
        .context("Failed to set up the Art-Net controller")?;
    let transport: Arc<dyn Transmit> = Arc::new(controller);

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    })
    .context("Failed to install the Ctrl-C handler")?;

    let options = LoopOptions {
        fps: settings.fps,
        workers: settings.workers,
        sampler,
        max_send_failures: settings.max_send_failures,
    };
    let render = RenderLoop::new(Arc::new(layout), source, transport, options);
    render.run(&shutdown).context("Render loop failed")?;
    Ok(())
}

fn preview_mode(
    settings: &Settings,
    layout: &Layout,
    mut source: Box<dyn FrameSource>,
) -> Result<()> {
    let report = preview::write_preview(source.as_mut(), layout, &settings.preview_dir)
        .with_context(|| format!("Failed to write preview to {}", settings.preview_dir.display()))?;
    println!(
        "Wrote {} images to {} ({} areas outside the capture)",
        report.written.len(),
        settings.preview_dir.display(),
        report.skipped.len()
    );
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(args.verbose, args.quiet);

    let mut settings =
        Settings::load_with_path(args.settings.as_deref()).context("Failed to load settings")?;
    let args_provided = settings.merge_with_args(&args);
    if args.save_settings {
        settings.save().context("Failed to save settings")?;
    } else if args_provided {
        tracing::debug!("Command-line overrides applied (not saved, use --save-settings)");
    }

    let mode = args.mode();
    settings.validate(mode).context("Invalid settings")?;
    let sampler = AreaSampler::new(settings.spacing, settings.threshold)
        .context("Invalid sampling settings")?;

    let layout = Layout::load(&settings.config)
        .with_context(|| format!("Failed to load layout {}", settings.config.display()))?;
    let source = open_source(&settings)?;
    warn_outside_areas(&layout, source.as_ref());

    tracing::info!("Starting in {} mode", mode);
    match mode {
        Mode::Run => run_mode(&settings, layout, source, sampler),
        Mode::Preview => preview_mode(&settings, &layout, source),
    }
}
