//! Conversion of decoded audio into output PCM.
//!
//! Sources already in the output layout are copied through. Anything else
//! goes through a `Resampler`, after mono sources have been widened to
//! stereo by duplicating samples.

use serde::{Deserialize, Serialize};

use crate::audio::buffer::{DecodedAudio, SampleFormat};

/// Output PCM layout; the sample format is always interleaved i16
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFormat {
    /// Output samples (all channels) per second
    pub fn samples_per_second(&self) -> usize {
        self.sample_rate as usize * self.channels as usize
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            channels: 2,
        }
    }
}

/// Converts decoded frames to interleaved i16 in a fixed output layout.
/// Implementations may keep state between calls (filter history).
pub trait Resampler: Send {
    fn convert(&mut self, input: &DecodedAudio) -> Vec<i16>;

    /// Drops carried state, e.g. after a seek.
    fn reset(&mut self);
}

/// True if `input` cannot be copied straight into output PCM
pub fn needs_conversion(input: &DecodedAudio, target: AudioFormat) -> bool {
    input.format != SampleFormat::S16
        || input.sample_rate != target.sample_rate
        || input.channels != target.channels
        || (input.planar && input.channels > 1)
}

/// Duplicates a mono frame into two identical channels
pub fn upmix_mono_to_stereo(input: &DecodedAudio) -> DecodedAudio {
    let mut out = input.clone();
    out.channels = 2;
    let plane = input.planes.first().cloned().unwrap_or_default();
    if input.planar {
        out.planes = vec![plane.clone(), plane];
    } else {
        let bps = input.format.bytes_per_sample();
        let mut doubled = Vec::with_capacity(plane.len() * 2);
        for sample in plane.chunks_exact(bps) {
            doubled.extend_from_slice(sample);
            doubled.extend_from_slice(sample);
        }
        out.planes = vec![doubled];
    }
    out
}

/// Reads packed S16 samples
pub fn packed_s16(input: &DecodedAudio) -> Vec<i16> {
    input
        .planes
        .first()
        .map(|plane| plane.chunks_exact(2).map(|b| i16::from_ne_bytes([b[0], b[1]])).collect())
        .unwrap_or_default()
}

fn read_sample(input: &DecodedAudio, channel: usize, index: usize) -> f32 {
    let bps = input.format.bytes_per_sample();
    let (plane, offset) = if input.planar {
        (input.planes.get(channel), index * bps)
    } else {
        (input.planes.first(), (index * input.channels as usize + channel) * bps)
    };
    let Some(bytes) = plane.and_then(|p| p.get(offset..offset + bps)) else {
        return 0.0;
    };
    match input.format {
        SampleFormat::U8 => (bytes[0] as f32 - 128.0) / 128.0,
        SampleFormat::S16 => i16::from_ne_bytes([bytes[0], bytes[1]]) as f32 / 32_768.0,
        SampleFormat::S32 => {
            i32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f32 / 2_147_483_648.0
        }
        SampleFormat::F32 => f32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        SampleFormat::F64 => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(bytes);
            f64::from_ne_bytes(raw) as f32
        }
    }
}

fn to_i16(sample: f32) -> i16 {
    (sample * 32_767.0).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Linear-interpolation resampler with channel mapping and format conversion.
pub struct LinearResampler {
    target: AudioFormat,
    phase: f64,          // Next output position; 0 is the last input frame of the previous call
    history: Vec<f32>,   // Last input frame per output channel
}

impl LinearResampler {
    pub fn new(target: AudioFormat) -> Self {
        Self {
            target,
            phase: 1.0,
            history: vec![0.0; target.channels as usize],
        }
    }

    /// Decodes `input` into one f32 vector per output channel
    fn map_channels(&self, input: &DecodedAudio) -> Vec<Vec<f32>> {
        let src_channels = input.channels.max(1) as usize;
        let dst_channels = self.target.channels as usize;
        let frames = input.nb_samples;

        (0..dst_channels)
            .map(|ch| {
                (0..frames)
                    .map(|i| {
                        if dst_channels == 1 && src_channels > 1 {
                            (0..src_channels).map(|c| read_sample(input, c, i)).sum::<f32>() / src_channels as f32
                        } else {
                            read_sample(input, ch.min(src_channels - 1), i)
                        }
                    })
                    .collect()
            })
            .collect()
    }
}

impl Resampler for LinearResampler {
    fn convert(&mut self, input: &DecodedAudio) -> Vec<i16> {
        let channels = self.map_channels(input);
        let dst_channels = channels.len();
        let frames = input.nb_samples;
        if frames == 0 || dst_channels == 0 {
            return Vec::new();
        }

        if input.sample_rate == self.target.sample_rate || input.sample_rate == 0 {
            let mut out = Vec::with_capacity(frames * dst_channels);
            for i in 0..frames {
                for channel in &channels {
                    out.push(to_i16(channel[i]));
                }
            }
            return out;
        }

        let step = input.sample_rate as f64 / self.target.sample_rate as f64;
        let estimate = (frames as f64 / step).ceil() as usize + 1;
        let mut out = Vec::with_capacity(estimate * dst_channels);
        let mut phase = self.phase;
        while phase < frames as f64 {
            let index = phase.floor() as usize;
            let frac = (phase - index as f64) as f32;
            for (ch, channel) in channels.iter().enumerate() {
                let a = if index == 0 { self.history[ch] } else { channel[index - 1] };
                let b = channel[index];
                out.push(to_i16(a + (b - a) * frac));
            }
            phase += step;
        }
        self.phase = phase - frames as f64;
        for (ch, channel) in channels.iter().enumerate() {
            self.history[ch] = channel[frames - 1];
        }
        out
    }

    fn reset(&mut self) {
        self.phase = 1.0;
        self.history.iter_mut().for_each(|h| *h = 0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packed_f32(samples: &[f32], channels: u16, rate: u32) -> DecodedAudio {
        DecodedAudio {
            format: SampleFormat::F32,
            planar: false,
            channels,
            sample_rate: rate,
            nb_samples: samples.len() / channels as usize,
            planes: vec![samples.iter().flat_map(|s| s.to_ne_bytes()).collect()],
            pts: None,
            best_effort_timestamp: None,
        }
    }

    #[test]
    fn test_needs_conversion() {
        let target = AudioFormat::default();
        let native = DecodedAudio::from_interleaved_s16(&[0; 4], 2, 44_100);
        assert!(!needs_conversion(&native, target));
        let mono = DecodedAudio::from_interleaved_s16(&[0; 4], 1, 44_100);
        assert!(needs_conversion(&mono, target));
        assert!(needs_conversion(&packed_f32(&[0.0; 4], 2, 44_100), target));
    }

    #[test]
    fn test_upmix_duplicates_samples() {
        let mono = DecodedAudio::from_interleaved_s16(&[1, 2, 3], 1, 44_100);
        let stereo = upmix_mono_to_stereo(&mono);
        assert_eq!(stereo.channels, 2);
        assert_eq!(packed_s16(&stereo), vec![1, 1, 2, 2, 3, 3]);
        assert!(!needs_conversion(&stereo, AudioFormat::default()));
    }

    #[test]
    fn test_format_conversion_same_rate() {
        let mut resampler = LinearResampler::new(AudioFormat::default());
        let out = resampler.convert(&packed_f32(&[1.0, -1.0, 0.5, 0.0], 2, 44_100));
        assert_eq!(out, vec![32_767, -32_767, 16_384, 0]);
    }

    #[test]
    fn test_planar_input() {
        let mut input = packed_f32(&[], 2, 44_100);
        input.planar = true;
        input.nb_samples = 2;
        input.planes = vec![
            [0.5f32, 0.5].iter().flat_map(|s| s.to_ne_bytes()).collect(),
            [-0.5f32, -0.5].iter().flat_map(|s| s.to_ne_bytes()).collect(),
        ];
        let mut resampler = LinearResampler::new(AudioFormat::default());
        assert_eq!(resampler.convert(&input), vec![16_384, -16_384, 16_384, -16_384]);
    }

    #[test]
    fn test_downsample_halves_frame_count() {
        let target = AudioFormat { sample_rate: 22_050, channels: 1 };
        let mut resampler = LinearResampler::new(target);
        let input = packed_f32(&[0.25; 1000], 1, 44_100);
        let first = resampler.convert(&input);
        let second = resampler.convert(&input);
        // Continuous across calls: 2000 input frames give ~1000 outputs
        let total = first.len() + second.len();
        assert!((999..=1001).contains(&total), "got {total}");
        assert!(second.iter().all(|s| *s == 8_192));
    }

    #[test]
    fn test_reset_restarts_phase() {
        let target = AudioFormat { sample_rate: 48_000, channels: 2 };
        let mut resampler = LinearResampler::new(target);
        let input = packed_f32(&[0.1; 882], 2, 44_100);
        let a = resampler.convert(&input);
        resampler.reset();
        let b = resampler.convert(&input);
        assert_eq!(a, b);
    }
}
