//! Speaker output.
//!
//! A writer thread owns the cpal output stream. It pops agent audio from the
//! [`PlaybackQueue`], converts it from 16 kHz PCM16 to the device's rate and
//! feeds a ring buffer that the hardware callback drains. When the queue's
//! generation changes (barge-in) the ring buffer is flushed as well, so speech
//! that was already handed to the device stops within one callback period.

use super::rate::RateConverter;
use super::{AudioError, PlaybackQueue, device_name, pick_device, sample_format_rank};
use crate::audio_utils::{PLAYBACK_SAMPLE_RATE, convert_i16_to_f32, pcm16_from_bytes};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info};

/// How long the writer waits on an empty queue before re-checking for stop
/// and barge-in.
pub const POP_TIMEOUT: Duration = Duration::from_millis(50);

/// 20 ms of 16 kHz input per resampler call.
const RESAMPLER_CHUNK: usize = 320;

const RING_FULL_BACKOFF: Duration = Duration::from_millis(5);

/// Empty polls in a row before the resampler's partial chunk is played out.
/// A shorter gap keeps it, so the next frame continues without padding.
const IDLE_POLLS_BEFORE_DRAIN: u32 = 5;

/// A running speaker. Dropping it stops the writer thread and the stream.
pub struct Speaker {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Speaker {
    pub fn start(device_id: Option<String>, queue: PlaybackQueue) -> Result<Self, AudioError> {
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), AudioError>>();
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();

        let thread = std::thread::Builder::new()
            .name("audio-playback".to_string())
            .spawn(move || {
                let output = match open_output_stream(device_id.as_deref()) {
                    Ok(output) => {
                        let _ = ready_tx.send(Ok(()));
                        output
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = run_writer(output, &queue, &thread_stop) {
                    error!("Playback writer stopped: {}", e);
                }
                debug!("Speaker stream closed");
            })
            .map_err(AudioError::Spawn)?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                stop,
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
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Playback thread panicked");
            }
        }
    }
}

impl Drop for Speaker {
    fn drop(&mut self) {
        self.release();
    }
}

struct OutputStream {
    _stream: cpal::Stream,
    producer: HeapProd<f32>,
    flush: Arc<AtomicBool>,
    sample_rate: u32,
}

fn open_output_stream(device_id: Option<&str>) -> Result<OutputStream, AudioError> {
    let host = cpal::default_host();
    let device = pick_device(host.output_devices()?, device_id, "output")?;
    let name = device_name(&device);

    let supported = pick_output_config(&device)?;
    let channels = supported.channels() as usize;
    let sample_rate = supported.sample_rate().0;
    let config: cpal::StreamConfig = supported.config();

    // 200 ms of device audio between the writer and the callback.
    let (producer, consumer) = HeapRb::<f32>::new((sample_rate / 5) as usize).split();
    let flush = Arc::new(AtomicBool::new(false));

    info!(device = %name, channels, sample_rate, format = ?supported.sample_format(), "Opening speaker");
    let stream = match supported.sample_format() {
        cpal::SampleFormat::I16 => {
            build_output::<i16>(&device, &config, channels, consumer, flush.clone())?
        }
        cpal::SampleFormat::F32 => {
            build_output::<f32>(&device, &config, channels, consumer, flush.clone())?
        }
        cpal::SampleFormat::U16 => {
            build_output::<u16>(&device, &config, channels, consumer, flush.clone())?
        }
        other => {
            return Err(AudioError::UnsupportedConfig {
                device: name,
                requirement: format!("sample format {other:?}"),
            });
        }
    };
    stream.play()?;
    info!("Speaker started successfully");

    Ok(OutputStream {
        _stream: stream,
        producer,
        flush,
        sample_rate,
    })
}

/// Native 16 kHz if the device offers it, otherwise its default configuration.
fn pick_output_config(device: &cpal::Device) -> Result<cpal::SupportedStreamConfig, AudioError> {
    let target = cpal::SampleRate(PLAYBACK_SAMPLE_RATE);
    let mut candidates: Vec<_> = device
        .supported_output_configs()?
        .filter(|range| range.min_sample_rate() <= target && target <= range.max_sample_rate())
        .filter(|range| sample_format_rank(range.sample_format()) < u8::MAX)
        .collect();
    candidates.sort_by_key(|range| (range.channels() != 1, sample_format_rank(range.sample_format())));
    match candidates.into_iter().next() {
        Some(range) => Ok(range.with_sample_rate(target)),
        None => Ok(device.default_output_config()?),
    }
}

fn build_output<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    channels: usize,
    mut consumer: HeapCons<f32>,
    flush: Arc<AtomicBool>,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample + FromSample<f32>,
{
    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            if flush.swap(false, Ordering::AcqRel) {
                consumer.clear();
            }
            for frame in data.chunks_mut(channels.max(1)) {
                let value = T::from_sample(consumer.try_pop().unwrap_or(0.0));
                for sample in frame.iter_mut() {
                    *sample = value;
                }
            }
        },
        |err| error!("Speaker stream error: {}", err),
        None,
    )?;
    Ok(stream)
}

fn run_writer(
    mut output: OutputStream,
    queue: &PlaybackQueue,
    stop: &AtomicBool,
) -> Result<(), AudioError> {
    let mut converter =
        RateConverter::new(PLAYBACK_SAMPLE_RATE, output.sample_rate, RESAMPLER_CHUNK)?;
    let mut generation = queue.generation();
    let mut idle_polls: u32 = 0;

    while !stop.load(Ordering::Acquire) {
        let frame = queue.pop_timeout(POP_TIMEOUT);

        let current = queue.generation();
        if current != generation {
            debug!(generation = current, "Playback interrupted, flushing device buffer");
            generation = current;
            output.flush.store(true, Ordering::Release);
            converter.reset();
        }

        let samples = match frame {
            Some(frame) if frame.generation == generation => {
                idle_polls = 0;
                converter.process(&convert_i16_to_f32(&pcm16_from_bytes(&frame.data)))?
            }
            Some(_) => continue,
            None => {
                idle_polls = idle_polls.saturating_add(1);
                drain_when_idle(&mut converter, idle_polls)?
            }
        };
        if samples.is_empty() {
            continue;
        }
        write_samples(&mut output.producer, &samples, || {
            stop.load(Ordering::Acquire) || queue.generation() != generation
        });
    }
    Ok(())
}

/// Plays out the resampler's held partial chunk once the queue has stayed
/// empty for [`IDLE_POLLS_BEFORE_DRAIN`] polls, the end of an utterance.
fn drain_when_idle(converter: &mut RateConverter, idle_polls: u32) -> Result<Vec<f32>, AudioError> {
    if idle_polls == IDLE_POLLS_BEFORE_DRAIN {
        converter.drain()
    } else {
        Ok(Vec::new())
    }
}

/// Pushes `samples` into the ring buffer, backing off while it is full.
/// Gives up as soon as `abort` returns true and reports how many samples were
/// written.
fn write_samples(
    producer: &mut HeapProd<f32>,
    samples: &[f32],
    mut abort: impl FnMut() -> bool,
) -> usize {
    let mut written = 0;
    while written < samples.len() {
        written += producer.push_slice(&samples[written..]);
        if written == samples.len() || abort() {
            break;
        }
        if producer.vacant_len() == 0 {
            std::thread::sleep(RING_FULL_BACKOFF);
        }
    }
    written
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_gap_keeps_partial_chunk() {
        let mut converter = RateConverter::new(16_000, 48_000, RESAMPLER_CHUNK).unwrap();
        assert!(converter.process(&vec![0.1; 100]).unwrap().is_empty());
        for polls in 1..IDLE_POLLS_BEFORE_DRAIN {
            assert!(drain_when_idle(&mut converter, polls).unwrap().is_empty());
        }

        // The late frame completes the chunk with real audio, not padding.
        let out = converter.process(&vec![0.1; RESAMPLER_CHUNK - 100]).unwrap();
        let mut unbroken = RateConverter::new(16_000, 48_000, RESAMPLER_CHUNK).unwrap();
        let expected = unbroken.process(&vec![0.1; RESAMPLER_CHUNK]).unwrap();
        assert_eq!(out.len(), expected.len());
        assert!(converter.drain().unwrap().is_empty());
    }

    #[test]
    fn test_long_gap_plays_out_partial_chunk() {
        let mut converter = RateConverter::new(16_000, 48_000, RESAMPLER_CHUNK).unwrap();
        converter.process(&vec![0.1; 100]).unwrap();
        assert!(!drain_when_idle(&mut converter, IDLE_POLLS_BEFORE_DRAIN).unwrap().is_empty());
        assert!(drain_when_idle(&mut converter, IDLE_POLLS_BEFORE_DRAIN + 1).unwrap().is_empty());
    }

    #[test]
    fn test_write_samples_fills_ring() {
        let (mut producer, mut consumer) = HeapRb::<f32>::new(8).split();
        let written = write_samples(&mut producer, &[1.0, 2.0, 3.0], || false);
        assert_eq!(written, 3);
        assert_eq!(consumer.try_pop(), Some(1.0));
    }

    #[test]
    fn test_write_samples_gives_up_on_abort() {
        let (mut producer, _consumer) = HeapRb::<f32>::new(4).split();
        let written = write_samples(&mut producer, &[0.5; 10], || true);
        assert_eq!(written, 4);
    }
}
