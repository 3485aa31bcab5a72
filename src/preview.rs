// Preview Module - Writes one capture and each configured area to PNG files
use std::path::{Path, PathBuf};

use crate::capture::{crop, FrameSource};
use crate::error::Result;
use crate::layout::Layout;

pub const MONITOR_FILE: &str = "monitor.png";

/// Files written by one preview run
#[derive(Debug, Default)]
pub struct PreviewReport {
    pub written: Vec<PathBuf>,
    /// Areas that lie entirely outside the capture
    pub skipped: Vec<String>,
}

pub fn area_file_name(area: &str) -> String {
    format!("area_{}.png", area)
}

/// Capture once and dump the frame plus every area crop into `dir`
pub fn write_preview(
    source: &mut dyn FrameSource,
    layout: &Layout,
    dir: &Path,
) -> Result<PreviewReport> {
    std::fs::create_dir_all(dir)?;
    let frame = source.capture()?;
    let mut report = PreviewReport::default();

    let monitor = dir.join(MONITOR_FILE);
    frame.pixels().save(&monitor)?;
    tracing::info!("Wrote {} ({})", monitor.display(), frame.bounds());
    report.written.push(monitor);

    for area in &layout.areas {
        let view = crop(&frame, &area.rect());
        if view.is_empty() {
            tracing::warn!(
                "Area {} ({}) is outside the capture ({}), skipping",
                area.name(),
                area.rect(),
                frame.bounds()
            );
            report.skipped.push(area.name().to_string());
            continue;
        }

        let path = dir.join(area_file_name(area.name()));
        view.to_image().save(&path)?;
        tracing::debug!("Wrote {} ({}x{})", path.display(), view.width(), view.height());
        report.written.push(path);
    }

    Ok(report)
}
