//! CPAL device discovery

use alloc::string::String;
use alloc::vec::Vec;

use cpal::traits::{DeviceTrait, HostTrait};
use cpal::SupportedBufferSize;
use tracing::{debug, info};

use crate::config::{DEFAULT_SINK_BUFFER_SIZE, MIN_BUFFER_SIZE_FACTOR};
use crate::error::DeviceError;
use crate::sink::{AudioDevice, CpalSink, SinkConfig};

/// Smallest buffer we ask the host for, in frames
const MIN_FIXED_BUFFER: u32 = 256;

/// A discovered audio output device
///
/// The device returned by [`default_output`](Self::default_output) follows
/// the system default: every [`open`](AudioDevice::open) re-resolves it, so
/// a restart after a routing change lands on the new output.
pub struct CpalDevice {
    device: cpal::Device,
    config: cpal::SupportedStreamConfig,
    name: String,
    follow_default: bool,
}

impl CpalDevice {
    /// Get the default output device
    pub fn default_output() -> Option<Self> {
        let device = cpal::default_host().default_output_device()?;
        Self::from_device(device, true)
    }

    /// List all available output devices
    pub fn list_outputs() -> Vec<Self> {
        cpal::default_host()
            .output_devices()
            .map(|devices| devices.filter_map(|device| Self::from_device(device, false)).collect())
            .unwrap_or_default()
    }

    fn from_device(device: cpal::Device, follow_default: bool) -> Option<Self> {
        let config = device.default_output_config().ok()?;
        let name = device.name().unwrap_or_else(|_| "Unknown".into());
        Some(Self {
            device,
            config,
            name,
            follow_default,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate().0
    }

    pub fn channels(&self) -> u16 {
        self.config.channels()
    }

    /// Sink buffer size for this device's config, and whether the host reported a range.
    fn buffer_size(config: &cpal::SupportedStreamConfig) -> (usize, bool) {
        match config.buffer_size() {
            &SupportedBufferSize::Range { min, max } => {
                let wanted = min.saturating_mul(MIN_BUFFER_SIZE_FACTOR as u32);
                (wanted.clamp(MIN_FIXED_BUFFER.min(max), max) as usize, true)
            }
            SupportedBufferSize::Unknown => (DEFAULT_SINK_BUFFER_SIZE, false),
        }
    }

    fn refresh_default(&mut self) -> Result<(), DeviceError> {
        let device = cpal::default_host().default_output_device().ok_or(DeviceError::NoDevice)?;
        let config = device
            .default_output_config()
            .map_err(|e| DeviceError::Config(e.to_string()))?;
        let name = device.name().unwrap_or_else(|_| "Unknown".into());
        if name != self.name {
            info!(from = %self.name, to = %name, "default output changed");
        }
        self.device = device;
        self.config = config;
        self.name = name;
        Ok(())
    }
}

impl AudioDevice for CpalDevice {
    type Sink = CpalSink;

    fn open(&mut self) -> Result<CpalSink, DeviceError> {
        if self.follow_default {
            self.refresh_default()?;
        }
        let (buffer_size, fixed) = Self::buffer_size(&self.config);
        debug!(device = %self.name, buffer_size, fixed, "opening cpal sink");
        CpalSink::open(&self.device, &self.config, buffer_size, fixed)
    }

    fn native_config(&mut self) -> Option<SinkConfig> {
        let config = if self.follow_default {
            cpal::default_host().default_output_device()?.default_output_config().ok()?
        } else {
            self.device.default_output_config().ok()?
        };
        let (buffer_size, _) = Self::buffer_size(&config);
        Some(SinkConfig::new(config.sample_rate().0, buffer_size))
    }
}
