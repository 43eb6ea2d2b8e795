//! CPAL audio output sink

use alloc::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{BufferSize, FromSample, Sample, SampleFormat, SizedSample, SupportedStreamConfig};
use rtrb::{Consumer, Producer, RingBuffer};
use tracing::{debug, error, warn};

use crate::error::DeviceError;
use crate::sink::{AudioSink, SinkConfig};

/// Counters shared between the sink and the stream callback
#[derive(Default)]
struct StreamState {
    /// Samples actually taken from the ring (silence on underrun is not counted)
    samples_consumed: AtomicU64,
    had_underrun: AtomicBool,
    /// Set by the error callback when the device goes away
    device_lost: AtomicBool,
    shutdown: AtomicBool,
}

/// A sink that outputs audio to a CPAL device
///
/// The CPAL stream runs on its own thread; writes go into a ring buffer
/// that the stream consumes. The mono input is copied to every device
/// channel.
pub struct CpalSink {
    producer: Producer<f32>,
    channels: usize,
    config: SinkConfig,
    state: Arc<StreamState>,
    stream_thread: Option<JoinHandle<()>>,
}

impl CpalSink {
    /// Open a stream on `device`.
    ///
    /// With `fixed_buffer` the stream requests `buffer_size` frames per
    /// callback, otherwise the host default is used. Blocks until the stream
    /// is playing or failed to start.
    pub fn open(
        device: &cpal::Device,
        config: &SupportedStreamConfig,
        buffer_size: usize,
        fixed_buffer: bool,
    ) -> Result<Self, DeviceError> {
        let channels = config.channels().max(1) as usize;
        let sample_format = config.sample_format();
        let mut stream_config = config.config();
        if fixed_buffer {
            stream_config.buffer_size = BufferSize::Fixed(buffer_size as u32);
        }
        let sample_rate = stream_config.sample_rate.0;

        // one sink buffer of interleaved audio
        let (producer, consumer) = RingBuffer::<f32>::new((buffer_size * channels).max(channels));
        let state = Arc::new(StreamState::default());

        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let device = device.clone();
        let stream_state = state.clone();
        let stream_thread = std::thread::Builder::new()
            .name("metrum-cpal-stream".into())
            .spawn(move || {
                let callback_state = stream_state.clone();
                let built =
                    build_stream(&device, sample_format, &stream_config, consumer, callback_state);
                let stream = match built.and_then(|stream| {
                    stream.play().map_err(|e| DeviceError::Stream(e.to_string()))?;
                    Ok(stream)
                }) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                // Keep thread alive - stream lives as long as this thread
                while !stream_state.shutdown.load(Ordering::Acquire) {
                    std::thread::park();
                }
                drop(stream);
            })
            .map_err(|e| DeviceError::ThreadSpawn(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = stream_thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = stream_thread.join();
                return Err(DeviceError::Stream("stream thread exited before starting".into()));
            }
        }

        debug!(sample_rate, channels, buffer_size, ?sample_format, "cpal stream started");

        Ok(Self {
            producer,
            channels,
            config: SinkConfig::new(sample_rate, buffer_size),
            state,
            stream_thread: Some(stream_thread),
        })
    }

    /// Number of device channels
    #[inline]
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Check and clear the underrun flag
    pub fn check_underrun(&self) -> bool {
        self.state.had_underrun.swap(false, Ordering::Relaxed)
    }

    /// Wait for room for `samples` interleaved samples.
    ///
    /// Returns `false` if the device went away meanwhile.
    fn wait_for_slots(&self, samples: usize) -> bool {
        let frame_time = Duration::from_secs_f64(1.0 / f64::from(self.config.sample_rate.max(1)));
        let frames = (samples / self.channels) as u32;
        let poll = (frame_time * frames / 4).max(Duration::from_millis(1));
        while self.producer.slots() < samples {
            if self.state.device_lost.load(Ordering::Relaxed) {
                return false;
            }
            std::thread::sleep(poll);
        }
        true
    }
}

fn build_stream(
    device: &cpal::Device,
    sample_format: SampleFormat,
    stream_config: &cpal::StreamConfig,
    consumer: Consumer<f32>,
    state: Arc<StreamState>,
) -> Result<cpal::Stream, DeviceError> {
    match sample_format {
        SampleFormat::F32 => build_typed_stream::<f32>(device, stream_config, consumer, state),
        SampleFormat::I16 => build_typed_stream::<i16>(device, stream_config, consumer, state),
        SampleFormat::U16 => build_typed_stream::<u16>(device, stream_config, consumer, state),
        other => Err(DeviceError::Config(format!("unsupported sample format: {other:?}"))),
    }
}

fn build_typed_stream<T>(
    device: &cpal::Device,
    stream_config: &cpal::StreamConfig,
    mut consumer: Consumer<f32>,
    state: Arc<StreamState>,
) -> Result<cpal::Stream, DeviceError>
where
    T: SizedSample + FromSample<f32>,
{
    let error_state = state.clone();
    device
        .build_output_stream(
            stream_config,
            move |data: &mut [T], _| {
                let mut popped = 0u64;
                for sample in data.iter_mut() {
                    let s = match consumer.pop() {
                        Ok(s) => {
                            popped += 1;
                            s
                        }
                        Err(_) => 0.0,
                    };
                    *sample = T::from_sample(s.clamp(-1.0, 1.0));
                }
                if popped < data.len() as u64 {
                    state.had_underrun.store(true, Ordering::Relaxed);
                }
                state.samples_consumed.fetch_add(popped, Ordering::Release);
            },
            move |err| {
                error!("cpal stream error: {err}");
                if matches!(err, cpal::StreamError::DeviceNotAvailable) {
                    error_state.device_lost.store(true, Ordering::Release);
                }
            },
            None,
        )
        .map_err(|e| DeviceError::Stream(e.to_string()))
}

impl AudioSink for CpalSink {
    fn config(&self) -> SinkConfig {
        self.config
    }

    fn write(&mut self, buffer: &[f32]) -> Result<(), DeviceError> {
        if self.stream_thread.is_none() {
            return Err(DeviceError::Closed);
        }
        if self.check_underrun() {
            debug!("cpal stream underrun");
        }

        let frames_per_chunk = (self.producer.buffer().capacity() / self.channels).max(1);
        for chunk in buffer.chunks(frames_per_chunk) {
            if !self.wait_for_slots(chunk.len() * self.channels) {
                warn!("output device lost while writing");
                return Ok(());
            }
            for &sample in chunk {
                for _ in 0..self.channels {
                    // Safety: we waited for enough slots above
                    let _ = self.producer.push(sample);
                }
            }
        }
        Ok(())
    }

    fn playback_position(&self) -> i64 {
        (self.state.samples_consumed.load(Ordering::Acquire) / self.channels as u64) as i64
    }

    fn routing_changed(&self) -> bool {
        self.state.device_lost.load(Ordering::Acquire)
    }

    fn close(&mut self) {
        let Some(thread) = self.stream_thread.take() else {
            return;
        };
        // let the stream drain what is already queued
        let queued = self.producer.buffer().capacity() - self.producer.slots();
        if queued > 0 && !self.state.device_lost.load(Ordering::Relaxed) {
            let secs = (queued / self.channels) as f64 / f64::from(self.config.sample_rate.max(1));
            std::thread::sleep(Duration::from_secs_f64(secs));
        }
        self.state.shutdown.store(true, Ordering::Release);
        thread.thread().unpark();
        if thread.join().is_err() {
            warn!("cpal stream thread panicked");
        }
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.close();
    }
}
