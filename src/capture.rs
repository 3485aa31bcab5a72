// Capture Module - Frame sources and read-only pixel views over captured frames
use image::{imageops, RgbaImage};
use std::path::Path;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::types::{Rect, Rgb};

/// One captured snapshot of a display region.
///
/// `bounds` is in display coordinates; pixel (0,0) of `pixels` sits at `bounds.min`.
#[derive(Debug)]
pub struct Frame {
    bounds: Rect,
    pixels: RgbaImage,
}

impl Frame {
    pub fn new(origin_x: i32, origin_y: i32, pixels: RgbaImage) -> Self {
        let bounds = Rect::new(
            origin_x,
            origin_y,
            origin_x + pixels.width() as i32,
            origin_y + pixels.height() as i32,
        );
        Frame { bounds, pixels }
    }

    pub fn bounds(&self) -> Rect {
        self.bounds
    }

    pub fn pixels(&self) -> &RgbaImage {
        &self.pixels
    }
}

/// Read-only window into a frame, already clipped to the frame's bounds
#[derive(Clone, Copy)]
pub struct PixelView<'a> {
    pixels: &'a RgbaImage,
    // image-local coordinates
    local: Rect,
}

impl<'a> PixelView<'a> {
    #[cfg(test)]
    pub fn from_image(pixels: &'a RgbaImage) -> Self {
        PixelView {
            pixels,
            local: Rect::new(0, 0, pixels.width() as i32, pixels.height() as i32),
        }
    }

    pub fn width(&self) -> u32 {
        self.local.width() as u32
    }

    pub fn height(&self) -> u32 {
        self.local.height() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.local.is_empty()
    }

    /// Pixel at view-relative coordinates; caller keeps `x < width`, `y < height`
    pub fn pixel(&self, x: u32, y: u32) -> Rgb {
        let p = self
            .pixels
            .get_pixel(self.local.min.x as u32 + x, self.local.min.y as u32 + y);
        Rgb::new(p[0], p[1], p[2])
    }

    pub fn to_image(&self) -> RgbaImage {
        imageops::crop_imm(
            self.pixels,
            self.local.min.x as u32,
            self.local.min.y as u32,
            self.width(),
            self.height(),
        )
        .to_image()
    }
}

/// Sub-region of `frame` covered by `area` (display coordinates). Parts of the
/// area outside the frame are dropped; a fully outside area gives an empty view.
pub fn crop<'a>(frame: &'a Frame, area: &Rect) -> PixelView<'a> {
    let clipped = frame.bounds.intersect(area);
    let local = if clipped.is_empty() {
        Rect::default()
    } else {
        Rect::new(
            clipped.min.x - frame.bounds.min.x,
            clipped.min.y - frame.bounds.min.y,
            clipped.max.x - frame.bounds.min.x,
            clipped.max.y - frame.bounds.min.y,
        )
    };
    PixelView {
        pixels: &frame.pixels,
        local,
    }
}

/// Something that can hand out display snapshots
pub trait FrameSource: Send {
    /// Display region this source captures
    fn bounds(&self) -> Rect;

    fn capture(&mut self) -> Result<Arc<Frame>>;
}

/// Image file served as the display on every capture
pub struct StillImage {
    frame: Arc<Frame>,
}

impl StillImage {
    pub fn open(path: &Path) -> Result<Self> {
        let pixels = image::open(path)
            .map_err(|e| Error::Capture(format!("cannot open {}: {}", path.display(), e)))?
            .to_rgba8();
        Ok(Self::from_image(pixels))
    }

    pub fn from_image(pixels: RgbaImage) -> Self {
        StillImage {
            frame: Arc::new(Frame::new(0, 0, pixels)),
        }
    }
}

impl FrameSource for StillImage {
    fn bounds(&self) -> Rect {
        self.frame.bounds()
    }

    fn capture(&mut self) -> Result<Arc<Frame>> {
        Ok(Arc::clone(&self.frame))
    }
}

/// Live capture of one monitor
#[cfg(feature = "screen")]
pub struct ScreenSource {
    monitor: xcap::Monitor,
    bounds: Rect,
}

#[cfg(feature = "screen")]
impl ScreenSource {
    pub fn new(index: usize) -> Result<Self> {
        let monitors = xcap::Monitor::all().map_err(|e| Error::Capture(e.to_string()))?;
        let count = monitors.len();
        let monitor = monitors.into_iter().nth(index).ok_or_else(|| {
            Error::Capture(format!("display {} not found ({} available)", index, count))
        })?;
        let bounds = Rect::new(
            monitor.x(),
            monitor.y(),
            monitor.x() + monitor.width() as i32,
            monitor.y() + monitor.height() as i32,
        );
        tracing::info!("Capturing display {} at {}", index, bounds);
        Ok(ScreenSource { monitor, bounds })
    }
}

#[cfg(feature = "screen")]
impl FrameSource for ScreenSource {
    fn bounds(&self) -> Rect {
        self.bounds
    }

    fn capture(&mut self) -> Result<Arc<Frame>> {
        let shot = self
            .monitor
            .capture_image()
            .map_err(|e| Error::Capture(e.to_string()))?;
        // xcap links its own image version; move the raw buffer across
        let (width, height) = (shot.width(), shot.height());
        let pixels = RgbaImage::from_raw(width, height, shot.into_raw())
            .ok_or_else(|| Error::Capture("display buffer size mismatch".to_string()))?;
        Ok(Arc::new(Frame::new(self.bounds.min.x, self.bounds.min.y, pixels)))
    }
}
