//! Audio output devices.
//!
//! Outputs pull PCM through an `AudioDataCallback` and report the render
//! position of the audible sample, which becomes the player's master clock
//! while playing.
//!
//! `SoftwareAudioOutput` is a device-less output: a play thread pulls chunks
//! and paces them in real time, optionally handing the PCM to a sink.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::audio::resample::AudioFormat;

/// Back-off when the callback has no data
const UNDERRUN_SLEEP: Duration = Duration::from_millis(10);

/// Result of one pull: samples written (all channels) and the render
/// position of the first one
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Filled {
    pub samples: usize,
    pub position: Option<f64>,
}

impl Filled {
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Pull callback: fill the interleaved buffer, report what was written
pub type AudioDataCallback = Box<dyn FnMut(&mut [i16]) -> Filled + Send>;

/// Receives every chunk the software output plays, with its position
pub type PcmSink = Box<dyn FnMut(&[i16], Option<f64>) + Send>;

/// Error type for audio outputs
#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    #[error("No audio output device available")]
    NoDevice,
    #[error("Audio device error: {0}")]
    Device(String),
    #[error("Failed to spawn output thread: {0}")]
    Thread(#[from] std::io::Error),
    #[error("Audio output released")]
    Released,
}

/// A platform audio sink driven by a pull callback
pub trait AudioOutput: Send + Sync {
    /// Installs the callback; replaces any previous one
    fn set_data_callback(&self, callback: AudioDataCallback);

    fn play(&self) -> Result<(), OutputError>;

    fn pause(&self) -> Result<(), OutputError>;

    /// Drops queued PCM and forgets the playback position
    fn flush(&self);

    fn is_playing(&self) -> bool;

    /// Render position of the sample currently heard; `None` until a chunk
    /// with a position has played since the last flush
    fn current_time_sec(&self) -> Option<f64>;

    /// Stops the device for good
    fn release(&self);
}

/// Playback clock of the chunk currently being played
#[derive(Debug, Clone, Copy)]
struct ChunkClock {
    position: f64,
    duration: f64,
    played: f64,               // Seconds played before the last pause
    resumed: Option<Instant>,  // Set while playing
}

impl ChunkClock {
    fn elapsed(&self, now: Instant) -> f64 {
        let running = self.resumed.map_or(0.0, |t| now.saturating_duration_since(t).as_secs_f64());
        (self.played + running).min(self.duration)
    }

    fn position_at(&self, now: Instant) -> f64 {
        self.position + self.elapsed(now)
    }

    fn remaining(&self, now: Instant) -> Duration {
        Duration::from_secs_f64((self.duration - self.elapsed(now)).max(0.0))
    }

    fn pause(&mut self, now: Instant) {
        self.played = self.elapsed(now);
        self.resumed = None;
    }

    fn resume(&mut self, now: Instant) {
        if self.resumed.is_none() {
            self.resumed = Some(now);
        }
    }
}

struct PlaybackState {
    playing: bool,
    released: bool,
    generation: u64,  // Bumped by flush; chunks pulled before it are discarded
    chunk: Option<ChunkClock>,
}

struct Shared {
    format: AudioFormat,
    state: Mutex<PlaybackState>,
    wake: Condvar,
    callback: Mutex<Option<AudioDataCallback>>,
    sink: Mutex<Option<PcmSink>>,
}

/// Real-time paced output without a device
pub struct SoftwareAudioOutput {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SoftwareAudioOutput {
    /// Starts the play thread; it idles until `play`
    pub fn new(format: AudioFormat, chunk_samples: usize) -> Result<Self, OutputError> {
        let shared = Arc::new(Shared {
            format,
            state: Mutex::new(PlaybackState {
                playing: false,
                released: false,
                generation: 0,
                chunk: None,
            }),
            wake: Condvar::new(),
            callback: Mutex::new(None),
            sink: Mutex::new(None),
        });
        let channels = format.channels.max(1) as usize;
        let chunk_samples = (chunk_samples / channels).max(1) * channels;

        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("audio-output".into())
            .spawn(move || play_loop(&worker, chunk_samples))?;
        tracing::debug!(sample_rate = format.sample_rate, channels = format.channels, chunk_samples, "software audio output created");
        Ok(Self {
            shared,
            thread: Mutex::new(Some(handle)),
        })
    }

    /// Hands every played chunk to `sink`
    pub fn set_sink(&self, sink: PcmSink) {
        *self.shared.sink.lock() = Some(sink);
    }
}

impl AudioOutput for SoftwareAudioOutput {
    fn set_data_callback(&self, callback: AudioDataCallback) {
        *self.shared.callback.lock() = Some(callback);
    }

    fn play(&self) -> Result<(), OutputError> {
        let mut state = self.shared.state.lock();
        if state.released {
            return Err(OutputError::Released);
        }
        if !state.playing {
            state.playing = true;
            let now = Instant::now();
            if let Some(chunk) = state.chunk.as_mut() {
                chunk.resume(now);
            }
            self.shared.wake.notify_all();
            tracing::debug!("software audio output playing");
        }
        Ok(())
    }

    fn pause(&self) -> Result<(), OutputError> {
        let mut state = self.shared.state.lock();
        if state.released {
            return Err(OutputError::Released);
        }
        if state.playing {
            state.playing = false;
            let now = Instant::now();
            if let Some(chunk) = state.chunk.as_mut() {
                chunk.pause(now);
            }
            self.shared.wake.notify_all();
            tracing::debug!("software audio output paused");
        }
        Ok(())
    }

    fn flush(&self) {
        let mut state = self.shared.state.lock();
        state.generation += 1;
        state.chunk = None;
        self.shared.wake.notify_all();
    }

    fn is_playing(&self) -> bool {
        self.shared.state.lock().playing
    }

    fn current_time_sec(&self) -> Option<f64> {
        let state = self.shared.state.lock();
        state.chunk.map(|c| c.position_at(Instant::now()))
    }

    fn release(&self) {
        {
            let mut state = self.shared.state.lock();
            state.released = true;
            state.playing = false;
            self.shared.wake.notify_all();
        }
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                tracing::error!("audio output thread panicked");
            }
        }
    }
}

impl Drop for SoftwareAudioOutput {
    fn drop(&mut self) {
        self.release();
    }
}

fn play_loop(shared: &Shared, chunk_samples: usize) {
    let channels = shared.format.channels.max(1) as usize;
    let rate = shared.format.sample_rate.max(1) as f64;
    let mut buffer = vec![0i16; chunk_samples];

    loop {
        let generation = {
            let mut state = shared.state.lock();
            while !state.released && !state.playing {
                shared.wake.wait(&mut state);
            }
            if state.released {
                break;
            }
            // Let the current chunk finish before pulling the next
            let remaining = state.chunk.map_or(Duration::ZERO, |c| c.remaining(Instant::now()));
            if !remaining.is_zero() {
                shared.wake.wait_for(&mut state, remaining);
                continue;
            }
            state.generation
        };

        buffer.fill(0);
        let filled = match shared.callback.lock().as_mut() {
            Some(callback) => callback(&mut buffer),
            None => Filled::empty(),
        };
        let samples = filled.samples.min(buffer.len()) / channels * channels;

        let mut state = shared.state.lock();
        if state.generation != generation {
            tracing::trace!("chunk pulled across flush dropped");
            continue;
        }
        if samples == 0 {
            shared.wake.wait_for(&mut state, UNDERRUN_SLEEP);
            continue;
        }

        let now = Instant::now();
        let position = filled
            .position
            .or_else(|| state.chunk.map(|c| c.position + c.duration));
        if let Some(sink) = shared.sink.lock().as_mut() {
            sink(&buffer[..samples], position);
        }
        state.chunk = position.map(|position| ChunkClock {
            position,
            duration: (samples / channels) as f64 / rate,
            played: 0.0,
            resumed: state.playing.then_some(now),
        });
    }
    tracing::debug!("audio output thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let end = Instant::now() + deadline;
        while Instant::now() < end {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    fn counting_callback(start: f64, format: AudioFormat) -> (AudioDataCallback, Arc<AtomicUsize>) {
        let pulls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&pulls);
        let mut next = start;
        let callback: AudioDataCallback = Box::new(move |buf: &mut [i16]| {
            counter.fetch_add(1, Ordering::SeqCst);
            buf.fill(100);
            let position = next;
            next += (buf.len() / format.channels as usize) as f64 / format.sample_rate as f64;
            Filled { samples: buf.len(), position: Some(position) }
        });
        (callback, pulls)
    }

    #[test]
    fn test_idle_until_play() {
        let format = AudioFormat::default();
        let output = SoftwareAudioOutput::new(format, 2048).unwrap();
        let (callback, pulls) = counting_callback(0.0, format);
        output.set_data_callback(callback);

        thread::sleep(Duration::from_millis(30));
        assert_eq!(pulls.load(Ordering::SeqCst), 0);
        assert!(!output.is_playing());
        assert_eq!(output.current_time_sec(), None);
    }

    #[test]
    fn test_plays_in_real_time() {
        let format = AudioFormat::default();
        let output = SoftwareAudioOutput::new(format, 2048).unwrap();
        let (callback, pulls) = counting_callback(2.0, format);
        output.set_data_callback(callback);
        output.play().unwrap();

        assert!(wait_until(Duration::from_secs(2), || output.current_time_sec().is_some()));
        thread::sleep(Duration::from_millis(100));
        let pos = output.current_time_sec().unwrap();
        // 1024 frames per chunk at 44.1 kHz is ~23 ms; pacing keeps the pull count near elapsed time
        assert!(pos >= 2.0 && pos < 2.5, "position {pos}");
        assert!(pulls.load(Ordering::SeqCst) < 20);
    }

    #[test]
    fn test_pause_freezes_position() {
        let format = AudioFormat::default();
        let output = SoftwareAudioOutput::new(format, 2048).unwrap();
        let (callback, _) = counting_callback(0.0, format);
        output.set_data_callback(callback);
        output.play().unwrap();
        assert!(wait_until(Duration::from_secs(2), || output.current_time_sec().is_some()));

        output.pause().unwrap();
        // A pull in flight at pause lands paused
        thread::sleep(Duration::from_millis(20));
        let frozen = output.current_time_sec();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(output.current_time_sec(), frozen);
    }

    #[test]
    fn test_flush_forgets_position() {
        let format = AudioFormat::default();
        let output = SoftwareAudioOutput::new(format, 2048).unwrap();
        let (callback, _) = counting_callback(0.0, format);
        output.set_data_callback(callback);
        output.play().unwrap();
        assert!(wait_until(Duration::from_secs(2), || output.current_time_sec().is_some()));

        output.pause().unwrap();
        output.flush();
        assert_eq!(output.current_time_sec(), None);
    }

    #[test]
    fn test_underrun_keeps_polling() {
        let format = AudioFormat::default();
        let output = SoftwareAudioOutput::new(format, 2048).unwrap();
        let pulls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&pulls);
        output.set_data_callback(Box::new(move |_buf: &mut [i16]| {
            counter.fetch_add(1, Ordering::SeqCst);
            Filled::empty()
        }));
        output.play().unwrap();

        assert!(wait_until(Duration::from_secs(2), || pulls.load(Ordering::SeqCst) >= 3));
        assert_eq!(output.current_time_sec(), None);
    }

    #[test]
    fn test_sink_receives_pcm() {
        let format = AudioFormat::default();
        let output = SoftwareAudioOutput::new(format, 512).unwrap();
        let received = Arc::new(AtomicUsize::new(0));
        let total = Arc::clone(&received);
        output.set_sink(Box::new(move |pcm: &[i16], _pos: Option<f64>| {
            assert!(pcm.iter().all(|s| *s == 100));
            total.fetch_add(pcm.len(), Ordering::SeqCst);
        }));
        let (callback, _) = counting_callback(0.0, format);
        output.set_data_callback(callback);
        output.play().unwrap();

        assert!(wait_until(Duration::from_secs(2), || received.load(Ordering::SeqCst) >= 1024));
        output.release();
        assert!(output.play().is_err());
    }
}
