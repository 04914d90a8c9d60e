//! Per-file audio decoding: demuxer, decoder and resampler for one asset,
//! producing output PCM at an absolute sample position.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::audio::buffer::DecodedAudio;
use crate::audio::resample::{needs_conversion, packed_s16, upmix_mono_to_stereo, AudioFormat, Resampler};
use crate::config::AudioDecodeConfig;
use crate::core::time::{seconds_to_ticks, ticks_to_seconds, TIME_EPS};
use crate::decode::stream_info::AudioStreamInfo;
use crate::media::{AudioDemuxer, DecodeError, MediaBackend};

/// Containers that keep stream parameters in the header; a small probe that
/// finds no audio stream is conclusive for them
const HEADER_DESCRIBED_FORMAT: &str = "mov,mp4,m4a,3gp,3g2,mj2";

/// Decoding state for one audio source.
///
/// The read cursor (`current_buffer_sec`) tracks the asset-local position of
/// the next sample `get_audio` will hand out.
pub struct AudioDecodeContext {
    backend: Arc<dyn MediaBackend>,
    config: AudioDecodeConfig,
    demuxer: Option<Box<dyn AudioDemuxer>>,
    stream: Option<AudioStreamInfo>,
    path: Option<PathBuf>,
    resampler: Box<dyn Resampler>,
    duration: f64,
    start_sample: i64,          // Stream start in output samples
    buffer: Vec<i16>,
    buffer_index: usize,
    current_pkt_sec: f64,
    current_buffer_sec: f64,
    last_decode_ok: bool,
    clipped_start: f64,
}

impl AudioDecodeContext {
    pub fn new(backend: Arc<dyn MediaBackend>, config: AudioDecodeConfig) -> Self {
        let resampler = backend.resampler(config.format);
        Self {
            backend,
            config,
            demuxer: None,
            stream: None,
            path: None,
            resampler,
            duration: 0.0,
            start_sample: 0,
            buffer: Vec::new(),
            buffer_index: 0,
            current_pkt_sec: 0.0,
            current_buffer_sec: 0.0,
            last_decode_ok: false,
            clipped_start: 0.0,
        }
    }

    /// Opens `path`, probing with the small size first and retrying with the
    /// large one unless the container is known to describe its streams in the
    /// header.
    pub fn open(&mut self, path: &Path) -> Result<(), DecodeError> {
        self.release();

        let mut demuxer = self.backend.open_audio(path, self.config.min_probe_size)?;
        if demuxer.stream().is_none() {
            if demuxer.format_name() == HEADER_DESCRIBED_FORMAT {
                tracing::debug!(path = %path.display(), "no audio stream in mp4 header");
                return Err(DecodeError::StreamNotFound("audio"));
            }
            tracing::debug!(
                path = %path.display(),
                min = self.config.min_probe_size,
                max = self.config.max_probe_size,
                "no audio stream found, probing again with larger size"
            );
            demuxer = self.backend.open_audio(path, self.config.max_probe_size)?;
        }
        let stream = demuxer.stream().cloned().ok_or(DecodeError::StreamNotFound("audio"))?;

        let duration = match stream.duration {
            Some(ticks) => ticks_to_seconds(ticks, stream.time_base),
            None => demuxer.video_duration().unwrap_or(0.0),
        };

        // Some files refuse the backward flag but still play in order
        if let Err(e) = demuxer.seek(0, true) {
            tracing::debug!(error = %e, "backward seek to start failed, retrying unflagged");
            demuxer.seek(0, false)?;
        }
        demuxer.flush();

        let rate = self.config.format.sample_rate as f64;
        self.start_sample = match stream.start_time {
            Some(ticks) if duration > 0.0 => (ticks_to_seconds(ticks, stream.time_base) * rate).round() as i64,
            _ => 0,
        };
        self.duration = duration;

        tracing::info!(
            path = %path.display(),
            duration,
            sample_rate = stream.sample_rate,
            channels = stream.channels,
            format = ?stream.sample_format,
            "audio file opened"
        );
        self.stream = Some(stream);
        self.demuxer = Some(demuxer);
        self.path = Some(path.to_path_buf());
        self.resampler.reset();
        Ok(())
    }

    pub fn release(&mut self) {
        if let Some(path) = self.path.take() {
            tracing::debug!(path = %path.display(), "audio file released");
        }
        self.demuxer = None;
        self.stream = None;
        self.duration = 0.0;
        self.start_sample = 0;
        self.buffer.clear();
        self.buffer_index = 0;
        self.current_pkt_sec = 0.0;
        self.current_buffer_sec = 0.0;
        self.last_decode_ok = false;
    }

    pub fn has_audio(&self) -> bool {
        self.demuxer.is_some() && self.stream.is_some()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    pub fn output_format(&self) -> AudioFormat {
        self.config.format
    }

    /// Asset-local position of the next sample handed out
    pub fn current_buffer_sec(&self) -> f64 {
        self.current_buffer_sec
    }

    pub fn set_clipped_start(&mut self, clipped_start: f64) {
        self.clipped_start = clipped_start;
    }

    /// Moves the read cursor to `pos` (asset seconds), clamped into the file
    pub fn seek(&mut self, pos: f64) -> Result<(), DecodeError> {
        let demuxer = self.demuxer.as_mut().ok_or(DecodeError::NotOpened)?;
        let stream = self.stream.as_ref().ok_or(DecodeError::NotOpened)?;
        let mut pos = pos.max(0.0);
        if pos > self.duration - TIME_EPS {
            tracing::debug!(pos, duration = self.duration, "audio seek clamped to end");
            pos = (self.duration - TIME_EPS).max(0.0);
        }

        // Stream start time is not added: demuxers seek in presentation time
        let timestamp = seconds_to_ticks(pos, stream.time_base);
        demuxer.seek(timestamp, true)?;
        demuxer.flush();

        self.buffer_index = self.buffer.len();
        self.current_pkt_sec = pos;
        self.current_buffer_sec = pos;
        self.last_decode_ok = false;
        self.resampler.reset();
        tracing::trace!(pos, timestamp, "audio seek");
        Ok(())
    }

    /// Fills `out` with interleaved output PCM starting at `target_sample`
    /// (output-rate samples from the file start).
    ///
    /// Returns false when the file has no audio, the position lies before the
    /// stream start or past the end, or the last decode attempt failed; `out`
    /// must then be treated as silence.
    pub fn get_audio(&mut self, target_sample: i64, out: &mut [i16]) -> bool {
        if !self.has_audio() {
            return false;
        }
        let rate = self.config.format.sample_rate as f64;
        let channels = self.config.format.channels.max(1) as usize;
        if target_sample < 0 || target_sample >= (self.duration * rate).round() as i64 {
            return false;
        }
        if target_sample < self.start_sample {
            tracing::debug!(target_sample, start_sample = self.start_sample, "audio requested before stream start");
            return false;
        }

        let mut written = 0;
        while written < out.len() {
            if self.buffer_index >= self.buffer.len() {
                self.refill();
            }

            // Drop decoded samples the request has already passed, near the clip start only
            if self.last_decode_ok
                && self.current_pkt_sec < self.clipped_start + self.config.correction_window
                && target_sample as f64 / rate - self.current_buffer_sec > TIME_EPS
            {
                let behind = target_sample as f64 - self.current_buffer_sec * rate;
                let drop = behind.ceil().max(1.0) as usize * channels;
                if self.buffer.len() - self.buffer_index <= drop {
                    self.buffer_index = self.buffer.len();
                    continue;
                }
                self.buffer_index += drop;
            }

            let count = (out.len() - written).min(self.buffer.len() - self.buffer_index);
            out[written..written + count]
                .copy_from_slice(&self.buffer[self.buffer_index..self.buffer_index + count]);
            written += count;
            self.buffer_index += count;
            if self.last_decode_ok {
                self.current_buffer_sec = self.current_pkt_sec + (self.buffer_index / channels) as f64 / rate;
            }
        }
        self.last_decode_ok
    }

    /// Replaces the exhausted buffer with the next decoded frame, or with a
    /// block of silence when decoding fails or the file ended
    fn refill(&mut self) {
        match self.decode_one_frame() {
            Ok(Some(samples)) => {
                self.buffer = samples;
                self.last_decode_ok = true;
            }
            Ok(None) => {
                self.buffer = vec![0; self.silence_len()];
                self.last_decode_ok = false;
            }
            Err(e) => {
                tracing::warn!(error = %e, path = ?self.path, "audio decode failed, substituting silence");
                self.buffer = vec![0; self.silence_len()];
                self.last_decode_ok = false;
            }
        }
        self.buffer_index = 0;
    }

    fn silence_len(&self) -> usize {
        let channels = self.config.format.channels.max(1) as usize;
        (self.config.silence_samples / channels).max(1) * channels
    }

    /// Decodes the next audio packet into output PCM. `Ok(None)` at end of file.
    fn decode_one_frame(&mut self) -> Result<Option<Vec<i16>>, DecodeError> {
        let target = self.config.format;
        let demuxer = self.demuxer.as_mut().ok_or(DecodeError::NotOpened)?;
        let stream = self.stream.as_ref().ok_or(DecodeError::NotOpened)?;
        let time_base = stream.time_base;
        let start_sec = stream.start_time.map_or(0.0, |t| ticks_to_seconds(t, time_base));

        loop {
            let Some(packet) = demuxer.read_packet()? else {
                return Ok(None);
            };
            if packet.discard || packet.stream_index != stream.index {
                continue;
            }
            let decoded = demuxer.decode(&packet)?;

            match packet.dts {
                Some(dts) => {
                    let pkt_sec = ticks_to_seconds(dts, time_base);
                    if pkt_sec < start_sec - TIME_EPS {
                        tracing::trace!(pkt_sec, start_sec, "audio packet before stream start skipped");
                        continue;
                    }
                    if self.current_pkt_sec > pkt_sec + TIME_EPS {
                        tracing::trace!(pkt_sec, current = self.current_pkt_sec, "audio packet behind read cursor skipped");
                        continue;
                    }
                    self.current_pkt_sec = pkt_sec;
                }
                None => {
                    if let Some(ts) = decoded.as_ref().and_then(|d| d.best_effort_timestamp) {
                        self.current_pkt_sec = ticks_to_seconds(ts, time_base);
                    }
                }
            }

            let samples = match decoded {
                Some(frame) => to_output_pcm(&frame, target, self.resampler.as_mut()),
                None => {
                    // A packet that decoded to nothing still occupies its duration
                    let frames = (ticks_to_seconds(packet.duration, time_base) * target.sample_rate as f64).round();
                    vec![0; frames.max(0.0) as usize * target.channels as usize]
                }
            };
            if samples.is_empty() {
                continue;
            }
            return Ok(Some(samples));
        }
    }
}

impl Drop for AudioDecodeContext {
    fn drop(&mut self) {
        self.release();
    }
}

/// Converts one decoded frame into interleaved i16 in the output layout.
/// Mono is widened by duplication before any resampling.
fn to_output_pcm(frame: &DecodedAudio, target: AudioFormat, resampler: &mut dyn Resampler) -> Vec<i16> {
    let widened;
    let frame = if target.channels == 2 && frame.channels == 1 {
        widened = upmix_mono_to_stereo(frame);
        &widened
    } else {
        frame
    };
    if needs_conversion(frame, target) {
        resampler.convert(frame)
    } else {
        packed_s16(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::buffer::SampleFormat;
    use crate::media::synthetic::{SyntheticAudio, SyntheticBackend, SyntheticVideo, Waveform};

    fn context_for(path: &str, audio: Option<SyntheticAudio>) -> (AudioDecodeContext, Arc<SyntheticBackend>) {
        let backend = Arc::new(SyntheticBackend::new());
        match audio {
            Some(audio) => backend.add_audio(path, audio),
            None => backend.add_video(path, SyntheticVideo::new(2.0, 30)),
        }
        (AudioDecodeContext::new(backend.clone(), AudioDecodeConfig::default()), backend)
    }

    fn ramp_mono(duration: f64) -> SyntheticAudio {
        SyntheticAudio::new(duration).with_channels(1).with_waveform(Waveform::Ramp)
    }

    #[test]
    fn test_mp4_without_audio_is_not_reprobed() {
        let (mut ctx, backend) = context_for("silent.mp4", None);
        let err = ctx.open(Path::new("silent.mp4")).unwrap_err();
        assert!(matches!(err, DecodeError::StreamNotFound("audio")));
        assert_eq!(backend.stats().audio_opens(), 1);
        assert!(!ctx.has_audio());
    }

    #[test]
    fn test_small_probe_retries_with_large() {
        let (mut ctx, backend) = context_for("late.mp3", Some(SyntheticAudio::new(1.0).with_min_probe_size(64 * 1024)));
        ctx.open(Path::new("late.mp3")).unwrap();
        assert_eq!(backend.stats().audio_opens(), 2);
        assert!(ctx.has_audio());
        assert!((ctx.duration() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_mono_is_duplicated_into_stereo() {
        let (mut ctx, _) = context_for("ramp.wav", Some(ramp_mono(1.0)));
        ctx.open(Path::new("ramp.wav")).unwrap();

        let mut out = [0i16; 8];
        assert!(ctx.get_audio(0, &mut out));
        assert_eq!(out, [0, 0, 1, 1, 2, 2, 3, 3]);
        assert!((ctx.current_buffer_sec() - 4.0 / 44_100.0).abs() < 1e-9);
    }

    #[test]
    fn test_before_stream_start_is_silence() {
        let (mut ctx, _) = context_for("late_start.m4a", Some(SyntheticAudio::new(2.0).with_start_time(0.5)));
        ctx.open(Path::new("late_start.m4a")).unwrap();

        let mut out = [7i16; 64];
        if !ctx.get_audio(0, &mut out) {
            out.fill(0);
        }
        assert!(out.iter().all(|s| *s == 0));
        assert!(ctx.get_audio(44_100, &mut out));
    }

    #[test]
    fn test_past_duration_returns_false() {
        let (mut ctx, _) = context_for("short.wav", Some(SyntheticAudio::new(0.5)));
        ctx.open(Path::new("short.wav")).unwrap();
        let mut out = [0i16; 16];
        assert!(!ctx.get_audio(22_050, &mut out));
        assert!(!ctx.get_audio(-1, &mut out));
    }

    #[test]
    fn test_correction_drops_stale_samples_at_clip_start() {
        let (mut ctx, _) = context_for("ramp.wav", Some(ramp_mono(1.0)));
        ctx.open(Path::new("ramp.wav")).unwrap();
        ctx.seek(0.0).unwrap();

        // 10 ms into the clip while the decoder restarts at 0
        let mut out = [0i16; 4];
        assert!(ctx.get_audio(441, &mut out));
        assert_eq!(out, [441, 441, 442, 442]);
    }

    #[test]
    fn test_seek_skips_packets_before_target() {
        let (mut ctx, _) = context_for("ramp.wav", Some(ramp_mono(2.0)));
        ctx.open(Path::new("ramp.wav")).unwrap();
        ctx.seek(0.5).unwrap();

        let mut out = [0i16; 2];
        assert!(ctx.get_audio(22_050, &mut out));
        // First packet at or after 0.5 s; the ramp wraps at 16384
        let first = out[0] as i64;
        assert!((22_050 % 16_384..=22_050 % 16_384 + 1024).contains(&first), "got {first}");
        assert!(ctx.current_buffer_sec() >= 0.5 - TIME_EPS);
    }

    #[test]
    fn test_end_of_file_substitutes_silence() {
        let (mut ctx, _) = context_for("tail.wav", Some(SyntheticAudio::new(0.1).with_waveform(Waveform::Constant(500))));
        ctx.open(Path::new("tail.wav")).unwrap();

        let mut head = vec![0i16; 4_000 * 2];
        assert!(ctx.get_audio(0, &mut head));
        assert!(head.iter().all(|s| *s == 500));

        // 410 frames remain; ask for 1000
        let mut tail = vec![0i16; 1_000 * 2];
        assert!(!ctx.get_audio(4_000, &mut tail));
        assert!(tail[..410 * 2].iter().all(|s| *s == 500));
        assert!(tail[410 * 2..].iter().all(|s| *s == 0));
    }

    #[test]
    fn test_resamples_foreign_format() {
        let audio = SyntheticAudio::new(1.0)
            .with_sample_rate(48_000)
            .with_format(SampleFormat::F32, true)
            .with_waveform(Waveform::Constant(8_192));
        let (mut ctx, _) = context_for("hq.m4a", Some(audio));
        ctx.open(Path::new("hq.m4a")).unwrap();

        let mut out = vec![0i16; 2_048];
        assert!(ctx.get_audio(0, &mut out));
        // Interpolating a constant signal keeps it constant
        assert!(out.iter().all(|s| (*s - 8_192).abs() <= 1));
    }

    #[test]
    fn test_resampler_comes_from_backend() {
        let (mut ctx, backend) = context_for("hq.m4a", Some(SyntheticAudio::new(1.0).with_sample_rate(48_000)));
        assert_eq!(backend.stats().resamplers(), 1);
        ctx.open(Path::new("hq.m4a")).unwrap();
        ctx.seek(0.5).unwrap();
        // Opening and seeking reuse the same converter
        assert_eq!(backend.stats().resamplers(), 1);
    }

    #[test]
    fn test_seek_clamps_into_file() {
        let (mut ctx, backend) = context_for("clip.wav", Some(SyntheticAudio::new(1.0)));
        ctx.open(Path::new("clip.wav")).unwrap();
        ctx.seek(5.0).unwrap();
        assert!((ctx.current_buffer_sec() - (1.0 - TIME_EPS)).abs() < 1e-9);
        // One seek during open, one explicit
        assert_eq!(backend.stats().audio_seeks(), 2);
    }
}
