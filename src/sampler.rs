// Sampler Module - Reduces a screen area to one representative color
use crate::capture::PixelView;
use crate::error::{Error, Result};
use crate::types::Rgb;

/// Validated averaging parameters.
///
/// Built once from configuration; sampling itself never fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AreaSampler {
    spacing: u32,
    threshold: u8,
}

impl AreaSampler {
    /// `spacing` is the stride on both axes (≥ 1), `threshold` the minimum
    /// pixel brightness that counts toward the average (0-255).
    pub fn new(spacing: i64, threshold: i64) -> Result<Self> {
        if spacing < 1 || spacing > u32::MAX as i64 {
            return Err(Error::InvalidParameter(format!(
                "invalid spacing for averaging ({})",
                spacing
            )));
        }
        if !(0..=255).contains(&threshold) {
            return Err(Error::InvalidParameter(format!(
                "invalid threshold for averaging ({})",
                threshold
            )));
        }
        Ok(AreaSampler {
            spacing: spacing as u32,
            threshold: threshold as u8,
        })
    }

    pub fn spacing(&self) -> u32 {
        self.spacing
    }

    pub fn threshold(&self) -> u8 {
        self.threshold
    }

    /// Average color of the pixels on the sampling grid whose brightness
    /// reaches the threshold. Nothing counted gives black.
    pub fn average(&self, view: &PixelView<'_>) -> Rgb {
        let step = self.spacing as usize;
        let (mut r, mut g, mut b) = (0u64, 0u64, 0u64);
        let mut count = 0u64;

        for x in (0..view.width()).step_by(step) {
            for y in (0..view.height()).step_by(step) {
                let pixel = view.pixel(x, y);
                if pixel.brightness() < self.threshold {
                    continue;
                }
                r += pixel.r as u64;
                g += pixel.g as u64;
                b += pixel.b as u64;
                count += 1;
            }
        }

        if count == 0 {
            return Rgb::BLACK;
        }
        Rgb::new((r / count) as u8, (g / count) as u8, (b / count) as u8)
    }
}

impl Default for AreaSampler {
    fn default() -> Self {
        AreaSampler {
            spacing: 1,
            threshold: 0,
        }
    }
}
