//! Audio output on the default cpal device.
//!
//! `cpal::Stream` is not `Send` on every host, so a dedicated thread builds
//! and owns it and takes play/pause/release commands over a channel. The
//! device callback pulls PCM through the installed `AudioDataCallback`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam::channel::{self, Sender};
use parking_lot::Mutex;

use crate::audio::resample::AudioFormat;
use crate::media::output::{AudioDataCallback, AudioOutput, Filled, OutputError};

enum Command {
    Play(Sender<Result<(), OutputError>>),
    Pause(Sender<Result<(), OutputError>>),
    Release,
}

/// Position of the last chunk handed to the device
#[derive(Debug, Clone, Copy)]
struct DevicePosition {
    position: f64,
    duration: f64,
    at: Instant,
}

struct Shared {
    format: AudioFormat,
    callback: Mutex<Option<AudioDataCallback>>,
    playing: AtomicBool,
    position: Mutex<Option<DevicePosition>>,
}

impl Shared {
    /// Device callback body: zero, pull, record the position
    fn pull(&self, data: &mut [i16]) {
        data.fill(0);
        if !self.playing.load(Ordering::Acquire) {
            return;
        }
        let filled = match self.callback.lock().as_mut() {
            Some(callback) => callback(data),
            None => Filled::empty(),
        };
        if let Some(position) = filled.position {
            let frames = filled.samples / self.format.channels.max(1) as usize;
            *self.position.lock() = Some(DevicePosition {
                position,
                duration: frames as f64 / self.format.sample_rate.max(1) as f64,
                at: Instant::now(),
            });
        }
    }
}

/// Output on the system's default audio device
pub struct CpalAudioOutput {
    shared: Arc<Shared>,
    commands: Sender<Command>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl CpalAudioOutput {
    /// Opens the default device with `format`; the stream starts paused
    pub fn new(format: AudioFormat) -> Result<Self, OutputError> {
        let shared = Arc::new(Shared {
            format,
            callback: Mutex::new(None),
            playing: AtomicBool::new(false),
            position: Mutex::new(None),
        });
        let (command_tx, command_rx) = channel::unbounded::<Command>();
        let (ready_tx, ready_rx) = channel::bounded::<Result<(), OutputError>>(1);

        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new().name("audio-output".into()).spawn(move || {
            let stream = match build_stream(&worker) {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            for command in command_rx {
                match command {
                    Command::Play(reply) => {
                        let result = stream.play().map_err(|e| OutputError::Device(e.to_string()));
                        let _ = reply.send(result);
                    }
                    Command::Pause(reply) => {
                        let result = stream.pause().map_err(|e| OutputError::Device(e.to_string()));
                        let _ = reply.send(result);
                    }
                    Command::Release => break,
                }
            }
            tracing::debug!("cpal stream thread exiting");
        })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(e);
            }
            Err(_) => return Err(OutputError::Device("stream thread exited".into())),
        }
        tracing::info!(sample_rate = format.sample_rate, channels = format.channels, "cpal output opened");
        Ok(Self {
            shared,
            commands: command_tx,
            thread: Mutex::new(Some(handle)),
        })
    }

    fn request(&self, make: impl FnOnce(Sender<Result<(), OutputError>>) -> Command) -> Result<(), OutputError> {
        let (reply_tx, reply_rx) = channel::bounded(1);
        self.commands.send(make(reply_tx)).map_err(|_| OutputError::Released)?;
        reply_rx.recv().map_err(|_| OutputError::Released)?
    }
}

fn build_stream(shared: &Arc<Shared>) -> Result<cpal::Stream, OutputError> {
    let host = cpal::default_host();
    let device = host.default_output_device().ok_or(OutputError::NoDevice)?;
    let sample_format = device
        .default_output_config()
        .map_err(|e| OutputError::Device(e.to_string()))?
        .sample_format();
    let config = cpal::StreamConfig {
        channels: shared.format.channels,
        sample_rate: cpal::SampleRate(shared.format.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };
    let on_error = |err: cpal::StreamError| tracing::warn!(error = %err, "audio stream error");

    let stream = match sample_format {
        cpal::SampleFormat::I16 => {
            let source = Arc::clone(shared);
            device.build_output_stream(
                &config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| source.pull(data),
                on_error,
                None,
            )
        }
        cpal::SampleFormat::F32 => {
            let source = Arc::clone(shared);
            let mut scratch = Vec::new();
            device.build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    scratch.resize(data.len(), 0i16);
                    source.pull(&mut scratch);
                    for (dst, src) in data.iter_mut().zip(&scratch) {
                        *dst = f32::from(*src) / 32_768.0;
                    }
                },
                on_error,
                None,
            )
        }
        other => return Err(OutputError::Device(format!("unsupported sample format {other:?}"))),
    }
    .map_err(|e| OutputError::Device(e.to_string()))?;
    stream.pause().map_err(|e| OutputError::Device(e.to_string()))?;
    Ok(stream)
}

impl AudioOutput for CpalAudioOutput {
    fn set_data_callback(&self, callback: AudioDataCallback) {
        *self.shared.callback.lock() = Some(callback);
    }

    fn play(&self) -> Result<(), OutputError> {
        if self.shared.playing.load(Ordering::Acquire) {
            return Ok(());
        }
        self.request(Command::Play)?;
        self.shared.playing.store(true, Ordering::Release);
        // Resume the clock from where it was frozen
        if let Some(position) = self.shared.position.lock().as_mut() {
            position.at = Instant::now();
        }
        Ok(())
    }

    fn pause(&self) -> Result<(), OutputError> {
        if !self.shared.playing.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(position) = self.shared.position.lock().as_mut() {
            let elapsed = position.at.elapsed().as_secs_f64().min(position.duration);
            position.position += elapsed;
            position.duration -= elapsed;
        }
        self.request(Command::Pause)
    }

    fn flush(&self) {
        *self.shared.position.lock() = None;
    }

    fn is_playing(&self) -> bool {
        self.shared.playing.load(Ordering::Acquire)
    }

    fn current_time_sec(&self) -> Option<f64> {
        let position = (*self.shared.position.lock())?;
        if !self.is_playing() {
            return Some(position.position);
        }
        Some(position.position + position.at.elapsed().as_secs_f64().min(position.duration))
    }

    fn release(&self) {
        self.shared.playing.store(false, Ordering::Release);
        let _ = self.commands.send(Command::Release);
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                tracing::error!("cpal stream thread panicked");
            }
        }
        *self.shared.callback.lock() = None;
    }
}

impl Drop for CpalAudioOutput {
    fn drop(&mut self) {
        self.release();
    }
}
