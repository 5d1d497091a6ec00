//! Local audio I/O.
//!
//! - `capture`: microphone frames, handed to the sender task.
//! - `playback`: agent speech, pulled from a [`PlaybackQueue`] by a writer thread.
//! - `queue`: the interruptible playback queue shared with the receiver task.
//! - `rate`: sample-rate conversion for devices that cannot run at the wire rate.
//!
//! The session engine only talks to [`AudioBackend`], so tests can run the
//! whole protocol without any sound hardware.

pub mod capture;
pub mod playback;
pub mod queue;
mod rate;

pub use capture::Microphone;
pub use playback::Speaker;
pub use queue::{PlaybackQueue, QueuedFrame};

use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("No {0} device found")]
    DeviceNotFound(&'static str),
    #[error("Device '{device}' does not support {requirement}")]
    UnsupportedConfig { device: String, requirement: String },
    #[error("Failed to enumerate audio devices: {0}")]
    Devices(#[from] cpal::DevicesError),
    #[error("Failed to query supported stream configurations: {0}")]
    SupportedConfigs(#[from] cpal::SupportedStreamConfigsError),
    #[error("Failed to query the default stream configuration: {0}")]
    DefaultConfig(#[from] cpal::DefaultStreamConfigError),
    #[error("Failed to build audio stream: {0}")]
    BuildStream(#[from] cpal::BuildStreamError),
    #[error("Failed to start audio stream: {0}")]
    PlayStream(#[from] cpal::PlayStreamError),
    #[error("Failed to create resampler: {0}")]
    Resampler(String),
    #[error("Failed to spawn audio thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("Audio thread exited before the stream was ready")]
    ThreadExited,
}

/// The audio resources a session acquires while it is active.
///
/// `shutdown` must release whatever was started and be safe to call more
/// than once.
pub trait AudioBackend: Send {
    /// Starts the microphone; frames are handed to `frames` without blocking.
    fn start_capture(&mut self, frames: mpsc::Sender<Bytes>) -> Result<(), AudioError>;

    /// Starts playing whatever is pushed into `queue`.
    fn start_playback(&mut self, queue: PlaybackQueue) -> Result<(), AudioError>;

    fn shutdown(&mut self);
}

/// Microphone and speaker on the default cpal host.
#[derive(Default)]
pub struct CpalAudio {
    input_device_id: Option<String>,
    output_device_id: Option<String>,
    microphone: Option<Microphone>,
    speaker: Option<Speaker>,
}

impl CpalAudio {
    pub fn new(input_device_id: Option<String>, output_device_id: Option<String>) -> Self {
        Self {
            input_device_id,
            output_device_id,
            microphone: None,
            speaker: None,
        }
    }
}

impl AudioBackend for CpalAudio {
    fn start_capture(&mut self, frames: mpsc::Sender<Bytes>) -> Result<(), AudioError> {
        self.microphone = Some(Microphone::start(self.input_device_id.clone(), frames)?);
        Ok(())
    }

    fn start_playback(&mut self, queue: PlaybackQueue) -> Result<(), AudioError> {
        self.speaker = Some(Speaker::start(self.output_device_id.clone(), queue)?);
        Ok(())
    }

    fn shutdown(&mut self) {
        if let Some(microphone) = self.microphone.take() {
            microphone.stop();
        }
        if let Some(speaker) = self.speaker.take() {
            speaker.stop();
        }
    }
}

impl Drop for CpalAudio {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Names of the devices on the default host, for `--list-devices`.
#[derive(Debug, Default)]
pub struct DeviceList {
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

pub fn list_devices() -> Result<DeviceList, AudioError> {
    let host = cpal::default_host();
    Ok(DeviceList {
        inputs: host.input_devices()?.map(|d| device_name(&d)).collect(),
        outputs: host.output_devices()?.map(|d| device_name(&d)).collect(),
    })
}

pub(crate) fn device_name(device: &cpal::Device) -> String {
    device.name().unwrap_or_else(|_| "<unnamed>".to_string())
}

/// Picks a device from an enumeration.
///
/// `requested` matches either a device name or its position in the
/// enumeration. Without a request, or when the request matches nothing, the
/// first device is used.
pub(crate) fn pick_device(
    devices: impl Iterator<Item = cpal::Device>,
    requested: Option<&str>,
    kind: &'static str,
) -> Result<cpal::Device, AudioError> {
    let mut devices: Vec<cpal::Device> = devices.collect();
    let names: Vec<String> = devices.iter().map(device_name).collect();
    for (index, name) in names.iter().enumerate() {
        info!(index, %name, "{} device", kind);
    }
    let index = select_device_index(&names, requested, kind)?;
    Ok(devices.swap_remove(index))
}

pub(crate) fn select_device_index(
    names: &[String],
    requested: Option<&str>,
    kind: &'static str,
) -> Result<usize, AudioError> {
    if names.is_empty() {
        return Err(AudioError::DeviceNotFound(kind));
    }
    let Some(requested) = requested else {
        return Ok(0);
    };
    let found = names
        .iter()
        .enumerate()
        .position(|(index, name)| name == requested || index.to_string() == requested);
    match found {
        Some(index) => Ok(index),
        None => {
            warn!(requested, "Requested {} device not found, using {}", kind, names[0]);
            Ok(0)
        }
    }
}

/// Lower is better: prefer native 16-bit, then float.
pub(crate) fn sample_format_rank(format: cpal::SampleFormat) -> u8 {
    match format {
        cpal::SampleFormat::I16 => 0,
        cpal::SampleFormat::F32 => 1,
        cpal::SampleFormat::U16 => 2,
        _ => u8::MAX,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_select_device_without_devices() {
        let err = select_device_index(&[], None, "input").unwrap_err();
        assert!(matches!(err, AudioError::DeviceNotFound("input")));
        assert_eq!(err.to_string(), "No input device found");
    }

    #[test]
    fn test_select_first_device_by_default() {
        let devices = names(&["Built-in Microphone", "USB Headset"]);
        assert_eq!(select_device_index(&devices, None, "input").unwrap(), 0);
    }

    #[test]
    fn test_select_device_by_name_or_index() {
        let devices = names(&["Built-in Microphone", "USB Headset", "Loopback"]);
        assert_eq!(
            select_device_index(&devices, Some("USB Headset"), "input").unwrap(),
            1
        );
        assert_eq!(select_device_index(&devices, Some("2"), "input").unwrap(), 2);
    }

    #[test]
    fn test_select_unknown_device_falls_back_to_first() {
        let devices = names(&["Built-in Output", "HDMI"]);
        assert_eq!(
            select_device_index(&devices, Some("Bluetooth"), "output").unwrap(),
            0
        );
    }

    #[test]
    fn test_sample_format_rank_prefers_i16() {
        assert!(
            sample_format_rank(cpal::SampleFormat::I16)
                < sample_format_rank(cpal::SampleFormat::F32)
        );
        assert_eq!(sample_format_rank(cpal::SampleFormat::U8), u8::MAX);
    }
}
