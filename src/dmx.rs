// DMX Module - Devices, universes and the 512 channel frames they produce
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::types::{ColorCell, Rgb};

pub const DMX_CHANNELS: usize = 512;
pub const MAX_NET: u8 = 127;
pub const MAX_SUBNET: u8 = 15;

/// One DMX512 frame, channel values indexed from 0
pub type DmxFrame = [u8; DMX_CHANNELS];

/// RGB fixture occupying three channels of a universe, plus fixed-value channels
#[derive(Debug, Default, Deserialize)]
pub struct Device {
    #[serde(skip)]
    name: String,

    #[serde(alias = "R")]
    pub red: u16,
    #[serde(alias = "G")]
    pub green: u16,
    #[serde(alias = "B")]
    pub blue: u16,

    /// Channels with a frame-independent value (e.g. a dimmer held at full)
    #[serde(default, alias = "Statics")]
    pub statics: BTreeMap<u16, u8>,

    #[serde(skip)]
    color: ColorCell,
}

impl Device {
    #[cfg(test)]
    pub fn new(red: u16, green: u16, blue: u16) -> Self {
        Device {
            red,
            green,
            blue,
            ..Default::default()
        }
    }

    #[cfg(test)]
    pub fn with_static(mut self, channel: u16, value: u8) -> Self {
        self.statics.insert(channel, value);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn color(&self) -> Rgb {
        self.color.get()
    }

    pub fn set_color(&self, color: Rgb) {
        self.color.set(color);
    }

    /// Check that the device fits in a frame and its channels don't clash
    pub fn verify(&self) -> Result<()> {
        for (label, channel) in [("red", self.red), ("green", self.green), ("blue", self.blue)] {
            if channel as usize >= DMX_CHANNELS {
                return Err(Error::InvalidConfiguration(format!(
                    "{} channel outside of DMX range (channel={})",
                    label, channel
                )));
            }
        }

        if self.red == self.green || self.green == self.blue || self.red == self.blue {
            return Err(Error::InvalidConfiguration(format!(
                "color channels should be different (r={}, g={}, b={})",
                self.red, self.green, self.blue
            )));
        }

        for &channel in self.statics.keys() {
            if channel as usize >= DMX_CHANNELS {
                return Err(Error::InvalidConfiguration(format!(
                    "invalid static channel outside of DMX range (channel={})",
                    channel
                )));
            }
            if self.color_channels().contains(&channel) {
                return Err(Error::InvalidConfiguration(format!(
                    "static channel collides with a color channel (channel={})",
                    channel
                )));
            }
        }

        Ok(())
    }

    pub fn color_channels(&self) -> [u16; 3] {
        [self.red, self.green, self.blue]
    }

    /// Every channel this device writes, colors first
    pub fn channels(&self) -> impl Iterator<Item = u16> + '_ {
        self.color_channels()
            .into_iter()
            .chain(self.statics.keys().copied())
    }

    /// Write the current color, then the static channels. Assumes `verify` passed.
    pub fn write_into(&self, frame: &mut DmxFrame) {
        let color = self.color();
        frame[self.red as usize] = color.r;
        frame[self.green as usize] = color.g;
        frame[self.blue as usize] = color.b;

        for (&channel, &value) in &self.statics {
            frame[channel as usize] = value;
        }
    }
}

/// Art-Net net / sub-net pair a universe is sent to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
pub struct UniverseAddress {
    /// Group of 16 consecutive sub-nets
    #[serde(default, alias = "Net")]
    pub net: u8,
    /// Group of 16 consecutive universes
    #[serde(default, alias = "SubNet")]
    pub subnet: u8,
}

impl UniverseAddress {
    #[cfg(test)]
    pub const fn new(net: u8, subnet: u8) -> Self {
        UniverseAddress { net, subnet }
    }

    pub fn verify(&self) -> Result<()> {
        if self.net > MAX_NET {
            return Err(Error::InvalidConfiguration(format!(
                "invalid Art-Net net (net={})",
                self.net
            )));
        }
        if self.subnet > MAX_SUBNET {
            return Err(Error::InvalidConfiguration(format!(
                "invalid Art-Net subnet (subnet={})",
                self.subnet
            )));
        }
        Ok(())
    }
}

impl fmt::Display for UniverseAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.net, self.subnet)
    }
}

/// Devices that share one frame and one transmission
#[derive(Debug)]
pub struct Universe {
    name: String,
    address: UniverseAddress,
    devices: Vec<Arc<Device>>,
}

impl Universe {
    pub fn new(
        name: impl Into<String>,
        address: UniverseAddress,
        devices: Vec<Arc<Device>>,
    ) -> Self {
        Universe {
            name: name.into(),
            address,
            devices,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> UniverseAddress {
        self.address
    }

    pub fn devices(&self) -> &[Arc<Device>] {
        &self.devices
    }

    pub fn verify(&self) -> Result<()> {
        self.address.verify()?;
        for device in &self.devices {
            device.verify()?;
        }
        Ok(())
    }

    /// Fresh frame with every device written in configured order; on shared
    /// channels the later device wins.
    pub fn build_frame(&self) -> DmxFrame {
        let mut frame = [0u8; DMX_CHANNELS];
        for device in &self.devices {
            device.write_into(&mut frame);
        }
        frame
    }

    /// Channels written by more than one device of this universe
    pub fn overlapping_channels(&self) -> Vec<u16> {
        let mut writers = [0u8; DMX_CHANNELS];
        for device in &self.devices {
            for channel in device.channels() {
                if let Some(count) = writers.get_mut(channel as usize) {
                    *count = count.saturating_add(1);
                }
            }
        }
        writers
            .iter()
            .enumerate()
            .filter(|(_, &count)| count > 1)
            .map(|(channel, _)| channel as u16)
            .collect()
    }
}
