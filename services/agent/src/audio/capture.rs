//! Microphone capture.
//!
//! The cpal stream lives on its own thread because `cpal::Stream` is not
//! `Send` on every platform. The hardware callback converts whatever the
//! device delivers into 48 kHz mono PCM16 (resampling when the device cannot
//! run at 48 kHz), cuts it into 50 ms frames and
//! hands each frame to the sender task with `try_send`: the callback never
//! waits on the async side.

use super::rate::RateConverter;
use super::{AudioError, device_name, pick_device, sample_format_rank};
use crate::audio_utils::{
    CAPTURE_SAMPLE_RATE, CAPTURE_SAMPLES_PER_FRAME, FrameAssembler, convert_f32_to_i16,
};
use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample};
use std::thread::JoinHandle;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, warn};

/// A running microphone. Dropping it stops the stream.
pub struct Microphone {
    stop_tx: Option<crossbeam_channel::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Microphone {
    /// Opens the requested input device (or the first one available) and
    /// starts delivering frames.
    pub fn start(device_id: Option<String>, frames: mpsc::Sender<Bytes>) -> Result<Self, AudioError> {
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), AudioError>>();
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);

        let thread = std::thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || {
                let stream = match open_input_stream(device_id.as_deref(), frames) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                // Returns once `stop_tx` is dropped.
                let _ = stop_rx.recv();
                drop(stream);
                debug!("Microphone stream closed");
            })
            .map_err(AudioError::Spawn)?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                stop_tx: Some(stop_tx),
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(AudioError::ThreadExited)
            }
        }
    }

    pub fn stop(mut self) {
        self.release();
    }

    fn release(&mut self) {
        self.stop_tx.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Microphone thread panicked");
            }
        }
    }
}

impl Drop for Microphone {
    fn drop(&mut self) {
        self.release();
    }
}

fn open_input_stream(
    device_id: Option<&str>,
    frames: mpsc::Sender<Bytes>,
) -> Result<cpal::Stream, AudioError> {
    let host = cpal::default_host();
    let device = pick_device(host.input_devices()?, device_id, "input")?;
    let name = device_name(&device);

    let supported = pick_input_config(&device)?;
    let channels = supported.channels() as usize;
    let device_rate = supported.sample_rate().0;
    let mut config: cpal::StreamConfig = supported.config();
    if device_rate == CAPTURE_SAMPLE_RATE {
        if let cpal::SupportedBufferSize::Range { min, max } = supported.buffer_size() {
            let wanted = CAPTURE_SAMPLES_PER_FRAME as u32;
            if (*min..=*max).contains(&wanted) {
                config.buffer_size = cpal::BufferSize::Fixed(wanted);
            }
        }
    }
    // 20 ms of device audio per resampler call.
    let converter =
        RateConverter::new(device_rate, CAPTURE_SAMPLE_RATE, (device_rate / 50) as usize)?;

    info!(
        device = %name,
        channels,
        sample_rate = device_rate,
        format = ?supported.sample_format(),
        "Opening microphone"
    );
    let stream = match supported.sample_format() {
        cpal::SampleFormat::I16 => {
            build_input::<i16>(&device, &config, channels, converter, frames)?
        }
        cpal::SampleFormat::F32 => {
            build_input::<f32>(&device, &config, channels, converter, frames)?
        }
        cpal::SampleFormat::U16 => {
            build_input::<u16>(&device, &config, channels, converter, frames)?
        }
        other => {
            return Err(AudioError::UnsupportedConfig {
                device: name,
                requirement: format!("sample format {other:?}"),
            });
        }
    };
    stream.play()?;
    info!("Microphone started successfully");
    Ok(stream)
}

/// A 48 kHz configuration, preferring mono and native 16-bit samples. Falls
/// back to the device default, which is then resampled to 48 kHz.
fn pick_input_config(device: &cpal::Device) -> Result<cpal::SupportedStreamConfig, AudioError> {
    let target = cpal::SampleRate(CAPTURE_SAMPLE_RATE);
    let mut candidates: Vec<_> = device
        .supported_input_configs()?
        .filter(|range| range.min_sample_rate() <= target && target <= range.max_sample_rate())
        .filter(|range| sample_format_rank(range.sample_format()) < u8::MAX)
        .collect();
    candidates.sort_by_key(|range| (range.channels() != 1, sample_format_rank(range.sample_format())));
    match candidates.into_iter().next() {
        Some(range) => Ok(range.with_sample_rate(target)),
        None => Ok(device.default_input_config()?),
    }
}

fn build_input<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    channels: usize,
    mut converter: RateConverter,
    frames: mpsc::Sender<Bytes>,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let mut assembler = FrameAssembler::new(CAPTURE_SAMPLES_PER_FRAME);
    let mut mono: Vec<f32> = Vec::with_capacity(CAPTURE_SAMPLES_PER_FRAME);
    let mut dropped: u64 = 0;

    let stream = device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            mono.clear();
            mono.extend(data.chunks(channels.max(1)).map(|frame| {
                frame.iter().map(|&s| f32::from_sample(s)).sum::<f32>() / frame.len() as f32
            }));
            let samples = match converter.process(&mono) {
                Ok(samples) => samples,
                Err(e) => {
                    error!(error = %e, "Failed to resample microphone audio");
                    return;
                }
            };
            assembler.push(convert_f32_to_i16(&samples), |frame| {
                hand_off(&frames, frame, &mut dropped)
            });
        },
        |err| error!("Microphone stream error: {}", err),
        None,
    )?;
    Ok(stream)
}

/// Passes a frame to the sender task without waiting. A full queue means the
/// network side is behind: the frame is dropped rather than stalling the
/// hardware thread.
pub(crate) fn hand_off(frames: &mpsc::Sender<Bytes>, frame: Bytes, dropped: &mut u64) {
    match frames.try_send(frame) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            *dropped += 1;
            warn!(dropped = *dropped, "Capture queue full, dropping microphone frame");
        }
        Err(TrySendError::Closed(_)) => {
            debug!("Capture queue closed, dropping microphone frame");
        }
    }
}
