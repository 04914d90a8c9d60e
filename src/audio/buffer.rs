//! Audio sample types and the ring buffer between the audio decode thread and
//! the output callback.
//!
//! Output PCM is interleaved signed 16-bit. Every buffered sample carries the
//! render position it belongs to, so the consumer can report where playback
//! is without asking the producer.

use parking_lot::{Condvar, Mutex};

/// Source sample encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    U8,
    S16,  // Output format
    S32,
    F32,
    F64,
}

impl SampleFormat {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::U8 => 1,
            SampleFormat::S16 => 2,
            SampleFormat::S32 | SampleFormat::F32 => 4,
            SampleFormat::F64 => 8,
        }
    }
}

/// Decoded audio as produced by a backend, before conversion to output PCM
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub format: SampleFormat,
    pub planar: bool,
    pub channels: u16,
    pub sample_rate: u32,
    pub nb_samples: usize,   // Per channel
    pub planes: Vec<Vec<u8>>, // One plane per channel when planar, else one
    pub pts: Option<i64>,
    pub best_effort_timestamp: Option<i64>,
}

impl DecodedAudio {
    /// Interleaved i16 samples, for sources already in output layout
    pub fn from_interleaved_s16(samples: &[i16], channels: u16, sample_rate: u32) -> Self {
        let bytes = samples.iter().flat_map(|s| s.to_ne_bytes()).collect();
        Self {
            format: SampleFormat::S16,
            planar: false,
            channels,
            sample_rate,
            nb_samples: samples.len() / channels.max(1) as usize,
            planes: vec![bytes],
            pts: None,
            best_effort_timestamp: None,
        }
    }
}

struct RingState {
    samples: Vec<i16>,
    positions: Vec<f64>,
    head: usize,
    len: usize,
    released: bool,
    generation: u64,  // Bumped whenever the contents are dropped
}

/// Fixed-capacity ring of output samples with per-sample render positions.
pub struct AudioRingBuffer {
    state: Mutex<RingState>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
    channels: usize,
    sample_rate: u32,
}

impl AudioRingBuffer {
    /// `capacity` counts i16 samples across all channels.
    pub fn new(capacity: usize, channels: u16, sample_rate: u32) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be non-zero");
        Self {
            state: Mutex::new(RingState {
                samples: vec![0; capacity],
                positions: vec![0.0; capacity],
                head: 0,
                len: 0,
                released: false,
                generation: 0,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
            channels: channels.max(1) as usize,
            sample_rate,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.state.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends `data`, whose first frame plays at `position`. Blocks until
    /// there is room; returns false if the buffer was released meanwhile.
    pub fn put(&self, data: &[i16], position: f64) -> bool {
        self.put_inner(data, position, None)
    }

    /// Like `put`, but drops `data` unless the buffer is still in
    /// `generation`, also when the buffer is cleared while waiting for room.
    pub fn put_in_generation(&self, data: &[i16], position: f64, generation: u64) -> bool {
        self.put_inner(data, position, Some(generation))
    }

    /// Current generation; see `clear`
    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    fn put_inner(&self, data: &[i16], position: f64, generation: Option<u64>) -> bool {
        debug_assert_eq!(data.len() % self.channels, 0);
        if data.len() > self.capacity {
            tracing::warn!(len = data.len(), capacity = self.capacity, "audio chunk larger than ring buffer dropped");
            return false;
        }
        let mut state = self.state.lock();
        let current = |state: &RingState| generation.map_or(true, |g| g == state.generation);
        while !state.released && current(&*state) && state.len + data.len() > self.capacity {
            self.not_full.wait(&mut state);
        }
        if state.released || !current(&*state) {
            return false;
        }
        let mut tail = (state.head + state.len) % self.capacity;
        for (i, sample) in data.iter().enumerate() {
            state.samples[tail] = *sample;
            state.positions[tail] = position + (i / self.channels) as f64 / self.sample_rate as f64;
            tail = (tail + 1) % self.capacity;
        }
        state.len += data.len();
        self.not_empty.notify_all();
        true
    }

    /// Copies up to `out.len()` samples out and returns how many were copied
    /// together with the render position of the first one.
    ///
    /// With `blocking` set, waits until `out` can be filled completely.
    pub fn get(&self, out: &mut [i16], blocking: bool) -> (usize, Option<f64>) {
        debug_assert_eq!(out.len() % self.channels, 0);
        let mut state = self.state.lock();
        if blocking {
            let wanted = out.len().min(self.capacity);
            while !state.released && state.len < wanted {
                self.not_empty.wait(&mut state);
            }
        }
        if state.released || state.len == 0 {
            return (0, None);
        }
        let position = state.positions[state.head];
        let count = out.len().min(state.len);
        for slot in out.iter_mut().take(count) {
            *slot = state.samples[state.head];
            state.head = (state.head + 1) % self.capacity;
        }
        state.len -= count;
        self.not_full.notify_all();
        (count, Some(position))
    }

    /// Empties the buffer and returns the new generation. Generation-checked
    /// puts from before the clear are dropped.
    pub fn clear(&self) -> u64 {
        let mut state = self.state.lock();
        state.head = 0;
        state.len = 0;
        state.generation += 1;
        self.not_full.notify_all();
        state.generation
    }

    /// Empties the buffer and makes every current and future call return
    /// immediately until `reopen`.
    pub fn release(&self) {
        let mut state = self.state.lock();
        state.head = 0;
        state.len = 0;
        state.released = true;
        state.generation += 1;
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    pub fn reopen(&self) {
        let mut state = self.state.lock();
        state.head = 0;
        state.len = 0;
        state.released = false;
        state.generation += 1;
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_put_get_positions() {
        let ring = AudioRingBuffer::new(16, 2, 4);
        assert!(ring.put(&[1, 2, 3, 4, 5, 6], 1.0));

        let mut out = [0i16; 4];
        let (count, pos) = ring.get(&mut out, false);
        assert_eq!(count, 4);
        assert_eq!(out, [1, 2, 3, 4]);
        assert_eq!(pos, Some(1.0));

        // Third frame is two frames (0.5 s at 4 Hz) after the chunk start
        let (count, pos) = ring.get(&mut out, false);
        assert_eq!(count, 2);
        assert_eq!(pos, Some(1.5));
        assert!(ring.is_empty());
    }

    #[test]
    fn test_wraps_around() {
        let ring = AudioRingBuffer::new(6, 2, 44_100);
        let mut out = [0i16; 4];
        ring.put(&[1, 1, 2, 2], 0.0);
        ring.get(&mut out, false);
        ring.put(&[3, 3, 4, 4], 0.0);
        let (count, _) = ring.get(&mut out, false);
        assert_eq!(count, 4);
        assert_eq!(out, [3, 3, 4, 4]);
    }

    #[test]
    fn test_empty_get_is_non_blocking() {
        let ring = AudioRingBuffer::new(8, 2, 44_100);
        let mut out = [7i16; 4];
        assert_eq!(ring.get(&mut out, false), (0, None));
        assert_eq!(out, [7; 4]);
    }

    #[test]
    fn test_release_unblocks_producer() {
        let ring = Arc::new(AudioRingBuffer::new(4, 2, 44_100));
        ring.put(&[0; 4], 0.0);
        let producer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || ring.put(&[1; 2], 0.0))
        };
        thread::sleep(Duration::from_millis(20));
        ring.release();
        assert!(!producer.join().unwrap());

        ring.reopen();
        assert!(ring.put(&[1; 2], 0.0));
    }

    #[test]
    fn test_clear_makes_room() {
        let ring = AudioRingBuffer::new(4, 2, 44_100);
        ring.put(&[0; 4], 0.0);
        ring.clear();
        assert_eq!(ring.len(), 0);
        assert!(ring.put(&[0; 4], 0.0));
    }

    #[test]
    fn test_clear_drops_stale_generation() {
        let ring = Arc::new(AudioRingBuffer::new(4, 2, 44_100));
        let generation = ring.generation();
        assert!(ring.put_in_generation(&[0; 4], 0.0, generation));
        let producer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || ring.put_in_generation(&[1; 2], 0.0, generation))
        };
        thread::sleep(Duration::from_millis(20));
        let next = ring.clear();
        assert!(!producer.join().unwrap());
        assert!(ring.is_empty());

        assert!(!ring.put_in_generation(&[1; 2], 0.0, generation));
        assert!(ring.put_in_generation(&[1; 2], 0.0, next));
    }

    #[test]
    fn test_interleaved_s16_conversion() {
        let audio = DecodedAudio::from_interleaved_s16(&[1, -1, 2, -2], 2, 44_100);
        assert_eq!(audio.nb_samples, 2);
        assert_eq!(audio.planes[0].len(), 8);
        assert_eq!(SampleFormat::S16.bytes_per_sample(), 2);
    }
}
