//! Picks the device profile and working resolution of an engine.
//!
//! Every kernel runs on the host, the selected device only decides which
//! working resolution an engine uses, since a machine with an accelerator is
//! expected to afford larger images.

use crate::{errors::InvalidRange, Error};
use serde::{Deserialize, Serialize};
use std::{fmt, path::Path};

/// Environment variable that overrides accelerator detection, `0`, `false`
/// and `off` disable it, any other value enables it
pub const ACCELERATOR_ENV: &str = "RESTYLE_ACCELERATOR";

/// The device an engine should prefer, as written in its configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DevicePreference {
    Auto,
    Gpu,
    Cpu,
    /// Kept verbatim so it can be reported, it's treated as `Cpu`
    Unrecognized(String),
}

impl Default for DevicePreference {
    fn default() -> Self {
        Self::Auto
    }
}

impl From<&str> for DevicePreference {
    fn from(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Self::Auto,
            "gpu" | "cuda" => Self::Gpu,
            "cpu" => Self::Cpu,
            _ => Self::Unrecognized(s.to_owned()),
        }
    }
}

impl From<String> for DevicePreference {
    fn from(s: String) -> Self {
        Self::from(s.as_str())
    }
}

impl From<DevicePreference> for String {
    fn from(pref: DevicePreference) -> Self {
        pref.to_string()
    }
}

impl fmt::Display for DevicePreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => f.write_str("auto"),
            Self::Gpu => f.write_str("gpu"),
            Self::Cpu => f.write_str("cpu"),
            Self::Unrecognized(s) => f.write_str(s),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Device {
    Gpu,
    Cpu,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gpu => f.write_str("gpu"),
            Self::Cpu => f.write_str("cpu"),
        }
    }
}

/// Reports whether a compatible accelerator is present
pub trait DeviceProbe {
    fn has_accelerator(&self) -> bool;
}

impl<F> DeviceProbe for F
where
    F: Fn() -> bool,
{
    fn has_accelerator(&self) -> bool {
        self()
    }
}

/// Looks for an NVIDIA device node, unless `RESTYLE_ACCELERATOR` is set
#[derive(Copy, Clone, Debug, Default)]
pub struct SystemProbe;

impl DeviceProbe for SystemProbe {
    fn has_accelerator(&self) -> bool {
        if let Ok(value) = std::env::var(ACCELERATOR_ENV) {
            return !matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "" | "0" | "false" | "off" | "no"
            );
        }

        ["/dev/nvidia0", "/dev/nvidiactl"]
            .iter()
            .any(|node| Path::new(node).exists())
    }
}

/// Working resolutions, the device specific ones fall back to `image_size`
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Resolution {
    pub image_size: u32,
    pub image_size_gpu: Option<u32>,
    pub image_size_cpu: Option<u32>,
}

impl Default for Resolution {
    fn default() -> Self {
        Self {
            image_size: 256,
            image_size_gpu: None,
            image_size_cpu: None,
        }
    }
}

impl Resolution {
    pub fn validate(&self) -> Result<(), Error> {
        let sizes = [
            ("image-size", Some(self.image_size)),
            ("image-size-gpu", self.image_size_gpu),
            ("image-size-cpu", self.image_size_cpu),
        ];

        for &(name, size) in sizes.iter() {
            if let Some(0) = size {
                return Err(Error::InvalidRange(InvalidRange {
                    min: 1.0,
                    max: u32::MAX as f32,
                    value: 0.0,
                    name,
                }));
            }
        }

        Ok(())
    }

    pub fn for_device(&self, device: Device) -> u32 {
        match device {
            Device::Gpu => self.image_size_gpu.unwrap_or(self.image_size),
            Device::Cpu => self.image_size_cpu.unwrap_or(self.image_size),
        }
    }
}

/// The outcome of the device policy, fixed for the lifetime of an engine
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Selection {
    pub device: Device,
    pub image_size: u32,
}

/// Resolves a preference against the capabilities reported by `probe`.
///
/// Never fails because of a missing accelerator, requesting one that isn't
/// there just falls back to the CPU.
pub fn select(
    preference: &DevicePreference,
    resolution: &Resolution,
    probe: &dyn DeviceProbe,
) -> Result<Selection, Error> {
    resolution.validate()?;

    let device = match preference {
        DevicePreference::Auto if probe.has_accelerator() => Device::Gpu,
        DevicePreference::Auto | DevicePreference::Cpu => Device::Cpu,
        DevicePreference::Gpu => {
            if probe.has_accelerator() {
                Device::Gpu
            } else {
                tracing::warn!("gpu requested but no accelerator is available, falling back to cpu");
                Device::Cpu
            }
        }
        DevicePreference::Unrecognized(pref) => {
            tracing::warn!(preference = %pref, "unknown device preference, falling back to cpu");
            return Ok(Selection {
                device: Device::Cpu,
                image_size: resolution.image_size,
            });
        }
    };

    Ok(Selection {
        device,
        image_size: resolution.for_device(device),
    })
}
