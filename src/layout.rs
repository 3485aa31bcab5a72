// Layout Module - Screen areas, devices, universes and the area to device mapping
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use crate::dmx::{Device, Universe, UniverseAddress};
use crate::error::{Error, Result};
use crate::types::{AreaId, ColorCell, Rect, Rgb};

/// Named screen region sampled every frame
#[derive(Debug)]
pub struct Area {
    id: AreaId,
    name: String,
    rect: Rect,
    last_color: ColorCell,
}

impl Area {
    pub fn new(id: AreaId, name: impl Into<String>, rect: Rect) -> Self {
        Area {
            id,
            name: name.into(),
            rect,
            last_color: ColorCell::default(),
        }
    }

    pub fn id(&self) -> AreaId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rect(&self) -> Rect {
        self.rect
    }

    /// Color computed for this area in the most recent frame
    pub fn last_color(&self) -> Rgb {
        self.last_color.get()
    }

    pub fn set_last_color(&self, color: Rgb) {
        self.last_color.set(color);
    }

    pub fn verify(&self) -> Result<()> {
        let r = &self.rect;
        if r.min.x < 0 || r.min.y < 0 {
            return Err(Error::InvalidConfiguration(format!(
                "area {} has negative coordinates {}",
                self.name, r
            )));
        }
        if r.min.x >= r.max.x || r.min.y >= r.max.y {
            return Err(Error::InvalidConfiguration(format!(
                "area {} is empty or inverted {}",
                self.name, r
            )));
        }
        Ok(())
    }
}

/// Which devices show which area's color
#[derive(Debug, Default)]
pub struct Mapping {
    targets: HashMap<AreaId, Vec<Arc<Device>>>,
}

impl Mapping {
    pub fn insert(&mut self, area: AreaId, devices: Vec<Arc<Device>>) {
        self.targets.insert(area, devices);
    }

    /// Devices mapped to `area`; `None` when there are none
    pub fn devices_for(&self, area: AreaId) -> Option<&[Arc<Device>]> {
        self.targets
            .get(&area)
            .map(Vec::as_slice)
            .filter(|devices| !devices.is_empty())
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// Everything loaded from the layout document, immutable for the run
#[derive(Debug, Default)]
pub struct Layout {
    pub areas: Vec<Area>,
    pub universes: Vec<Universe>,
    pub mapping: Mapping,
}

// On-disk document. Keys are names; Go-style capitalized keys are accepted.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawLayout {
    #[serde(alias = "Areas")]
    areas: BTreeMap<String, Rect>,
    #[serde(alias = "Universes")]
    universes: BTreeMap<String, UniverseAddress>,
    #[serde(alias = "Devices")]
    devices: BTreeMap<String, Device>,
    #[serde(alias = "UniversesToDevices")]
    universes_to_devices: BTreeMap<String, Vec<String>>,
    #[serde(alias = "AreasToDevices")]
    areas_to_devices: BTreeMap<String, Vec<String>>,
}

impl Layout {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let layout = Self::from_json(&contents)?;
        tracing::info!(
            "Loaded layout {}: {} areas, {} universes, {} devices, {} mapped areas",
            path.display(),
            layout.areas.len(),
            layout.universes.len(),
            layout.devices().count(),
            layout.mapping.len()
        );
        if layout.mapping.is_empty() {
            tracing::warn!("No area is mapped to a device, nothing will change color");
        }
        Ok(layout)
    }

    pub fn from_json(contents: &str) -> Result<Self> {
        let raw: RawLayout = serde_json::from_str(contents)?;
        raw.build()
    }

    #[cfg(test)]
    pub fn area_named(&self, name: &str) -> Option<&Area> {
        self.areas.iter().find(|a| a.name == name)
    }

    /// Every device reachable from a universe, in universe order
    pub fn devices(&self) -> impl Iterator<Item = &Arc<Device>> {
        self.universes.iter().flat_map(|u| u.devices().iter())
    }
}

impl RawLayout {
    fn build(self) -> Result<Layout> {
        let mut devices = BTreeMap::new();
        for (name, device) in self.devices {
            device.verify().map_err(|e| within("device", &name, e))?;
            devices.insert(name.clone(), Arc::new(device.with_name(name)));
        }

        let areas: Vec<Area> = self
            .areas
            .iter()
            .enumerate()
            .map(|(index, (name, rect))| Area::new(AreaId(index), name.clone(), *rect))
            .collect();
        for area in &areas {
            area.verify()?;
        }

        let mapping = build_mapping(&areas, &devices, &self.areas_to_devices)?;

        let mut universes = Vec::new();
        for (name, device_names) in &self.universes_to_devices {
            let address = self.universes.get(name).ok_or_else(|| Error::UnknownReference {
                kind: "universe",
                name: name.clone(),
            })?;
            let members = lookup_devices(&devices, device_names)?;
            let universe = Universe::new(name.clone(), *address, members);
            universe.verify().map_err(|e| within("universe", name, e))?;

            let overlaps = universe.overlapping_channels();
            if !overlaps.is_empty() {
                tracing::warn!(
                    "Universe {} has channels written by several devices (last one wins): {:?}",
                    name,
                    overlaps
                );
            }
            tracing::debug!(
                "Universe {} at {}: {:?}",
                name,
                address,
                universe.devices().iter().map(|d| d.name()).collect::<Vec<_>>()
            );
            universes.push(universe);
        }

        for name in self.universes.keys() {
            if !self.universes_to_devices.contains_key(name) {
                tracing::warn!("Universe {} has no devices and will not be sent", name);
            }
        }

        Ok(Layout {
            areas,
            universes,
            mapping,
        })
    }
}

fn build_mapping(
    areas: &[Area],
    devices: &BTreeMap<String, Arc<Device>>,
    areas_to_devices: &BTreeMap<String, Vec<String>>,
) -> Result<Mapping> {
    let mut mapping = Mapping::default();
    // one sampling job per area owns its devices, so a device may follow only one area
    let mut owner: HashMap<&str, &str> = HashMap::new();

    for (area_name, device_names) in areas_to_devices {
        let area = areas
            .iter()
            .find(|a| a.name() == area_name.as_str())
            .ok_or_else(|| Error::UnknownReference {
                kind: "area",
                name: area_name.clone(),
            })?;

        let targets = lookup_devices(devices, device_names)?;
        for device_name in device_names {
            if let Some(previous) = owner.insert(device_name.as_str(), area_name.as_str()) {
                if previous != area_name.as_str() {
                    return Err(Error::InvalidConfiguration(format!(
                        "device {} is mapped to more than one area ({}, {})",
                        device_name, previous, area_name
                    )));
                }
            }
        }
        mapping.insert(area.id(), targets);
    }

    Ok(mapping)
}

// prefix a definition error with what it belongs to
fn within(kind: &str, name: &str, error: Error) -> Error {
    match error {
        Error::InvalidConfiguration(msg) => {
            Error::InvalidConfiguration(format!("{} {}: {}", kind, name, msg))
        }
        other => other,
    }
}

fn lookup_devices(
    devices: &BTreeMap<String, Arc<Device>>,
    names: &[String],
) -> Result<Vec<Arc<Device>>> {
    names
        .iter()
        .map(|name| {
            devices.get(name).cloned().ok_or_else(|| Error::UnknownReference {
                kind: "device",
                name: name.clone(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const LAYOUT: &str = r#"{
        "areas": {
            "left":  {"min": {"x": 0, "y": 0},   "max": {"x": 100, "y": 600}},
            "right": {"min": {"x": 700, "y": 0}, "max": {"x": 800, "y": 600}},
            "top":   {"min": {"x": 0, "y": 0},   "max": {"x": 800, "y": 50}}
        },
        "universes": {"main": {"net": 0, "subnet": 1}},
        "devices": {
            "par1": {"red": 1, "green": 2, "blue": 3},
            "par2": {"red": 4, "green": 5, "blue": 6, "statics": {"7": 255}}
        },
        "universes_to_devices": {"main": ["par1", "par2"]},
        "areas_to_devices": {"left": ["par1"], "right": ["par2"]}
    }"#;

    fn error_of(json: &str) -> Error {
        Layout::from_json(json).expect_err("layout should be rejected")
    }

    #[test]
    fn test_loads_layout() {
        let layout = Layout::from_json(LAYOUT).unwrap();
        assert_eq!(layout.areas.len(), 3);
        assert_eq!(layout.universes.len(), 1);

        let universe = &layout.universes[0];
        assert_eq!(universe.address(), UniverseAddress::new(0, 1));
        let names: Vec<&str> = universe.devices().iter().map(|d| d.name()).collect();
        assert_eq!(names, vec!["par1", "par2"]);

        let left = layout.area_named("left").unwrap();
        let mapped = layout.mapping.devices_for(left.id()).unwrap();
        assert_eq!(mapped.len(), 1);
        assert!(Arc::ptr_eq(&mapped[0], &universe.devices()[0]));

        let top = layout.area_named("top").unwrap();
        assert!(layout.mapping.devices_for(top.id()).is_none());
    }

    #[test]
    fn test_identical_rects_stay_distinct() {
        let json = r#"{
            "areas": {
                "a": {"min": {"x": 0, "y": 0}, "max": {"x": 10, "y": 10}},
                "b": {"min": {"x": 0, "y": 0}, "max": {"x": 10, "y": 10}}
            },
            "universes": {"u": {}},
            "devices": {
                "d1": {"red": 0, "green": 1, "blue": 2},
                "d2": {"red": 3, "green": 4, "blue": 5}
            },
            "universes_to_devices": {"u": ["d1", "d2"]},
            "areas_to_devices": {"a": ["d1"], "b": ["d2"]}
        }"#;
        let layout = Layout::from_json(json).unwrap();
        let a = layout.area_named("a").unwrap().id();
        let b = layout.area_named("b").unwrap().id();
        assert_ne!(a, b);
        assert_eq!(layout.mapping.devices_for(a).unwrap()[0].name(), "d1");
        assert_eq!(layout.mapping.devices_for(b).unwrap()[0].name(), "d2");
    }

    #[test]
    fn test_go_style_document() {
        let json = r#"{
            "Areas": {"area": {"Min": {"X": 0, "Y": 0}, "Max": {"X": 800, "Y": 600}}},
            "Universes": {"universe": {"Net": 0, "SubNet": 0}},
            "Devices": {"device1": {"R": 1, "G": 2, "B": 3}},
            "UniversesToDevices": {"universe": ["device1"]},
            "AreasToDevices": {"area": ["device1"]}
        }"#;
        let layout = Layout::from_json(json).unwrap();
        assert_eq!(layout.universes[0].devices()[0].color_channels(), [1, 2, 3]);
        assert_eq!(layout.mapping.len(), 1);
    }

    #[test]
    fn test_unknown_references() {
        let unknown_universe = r#"{
            "universes": {"universe1": {}},
            "universes_to_devices": {"universe2": []}
        }"#;
        assert_eq!(error_of(unknown_universe).to_string(), "unknown universe: universe2");

        let unknown_device = r#"{
            "universes": {"universe": {}},
            "devices": {"device1": {"red": 1, "green": 2, "blue": 3}},
            "universes_to_devices": {"universe": ["device2"]}
        }"#;
        assert_eq!(error_of(unknown_device).to_string(), "unknown device: device2");

        let unknown_area = r#"{
            "areas": {"area1": {"min": {"x": 0, "y": 0}, "max": {"x": 800, "y": 600}}},
            "areas_to_devices": {"area2": []}
        }"#;
        assert_eq!(error_of(unknown_area).to_string(), "unknown area: area2");

        let unmapped_device = r#"{
            "areas": {"area": {"min": {"x": 0, "y": 0}, "max": {"x": 800, "y": 600}}},
            "devices": {"device1": {"red": 1, "green": 2, "blue": 3}},
            "areas_to_devices": {"area": ["device2"]}
        }"#;
        assert_eq!(error_of(unmapped_device).to_string(), "unknown device: device2");
    }

    #[test]
    fn test_invalid_definitions() {
        let bad_device = r#"{"devices": {"bad": {"red": 1, "green": 1, "blue": 3}}}"#;
        assert!(matches!(
            error_of(bad_device),
            Error::InvalidConfiguration(msg) if msg.starts_with("device bad:")
        ));

        let bad_universe =
            r#"{"universes": {"u": {"net": 200}}, "universes_to_devices": {"u": []}}"#;
        assert!(matches!(error_of(bad_universe), Error::InvalidConfiguration(_)));

        let inverted = r#"{"areas": {"a": {"min": {"x": 10, "y": 0}, "max": {"x": 5, "y": 5}}}}"#;
        assert!(matches!(error_of(inverted), Error::InvalidConfiguration(_)));

        let negative = r#"{"areas": {"a": {"min": {"x": -1, "y": 0}, "max": {"x": 5, "y": 5}}}}"#;
        assert!(matches!(error_of(negative), Error::InvalidConfiguration(_)));
    }

    #[test]
    fn test_device_owned_by_one_area() {
        let json = r#"{
            "areas": {
                "a": {"min": {"x": 0, "y": 0}, "max": {"x": 10, "y": 10}},
                "b": {"min": {"x": 10, "y": 0}, "max": {"x": 20, "y": 10}}
            },
            "devices": {"d": {"red": 0, "green": 1, "blue": 2}},
            "areas_to_devices": {"a": ["d"], "b": ["d"]}
        }"#;
        assert!(matches!(
            error_of(json),
            Error::InvalidConfiguration(msg) if msg.contains("more than one area")
        ));
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(error_of("{ not json"), Error::Json(_)));
    }
}
