//! Deterministic in-memory media backend.
//!
//! Files are registered by path with a video and/or audio description and
//! decode to generated content: video frames carry their index in the luma
//! plane, audio follows a `Waveform`. Used by the headless player and by
//! every test that needs decoding without real files.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::audio::buffer::{DecodedAudio, SampleFormat};
use crate::audio::resample::{AudioFormat, LinearResampler, Resampler};
use crate::core::project::{CodecType, MediaFileInfo, ProbedStream};
use crate::core::time::Rational;
use crate::decode::frame::{DecodedPicture, PixelFormat, Plane};
use crate::decode::stream_info::{AudioStreamInfo, IndexEntry, VideoStreamInfo};
use crate::media::{
    AudioDemuxer, DecodeError, MediaBackend, MediaProbe, Packet, ProbeError, VideoDemuxer,
};

const VIDEO_TIME_BASE: Rational = Rational::new(1, 90_000);
const MP4_FORMAT_NAME: &str = "mov,mp4,m4a,3gp,3g2,mj2";

/// Generated video stream
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticVideo {
    pub duration: f64,
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    pub rotation: i32,
    pub gop_size: usize,
    pub decoder_delay: usize,
    pub corrupt_frames: Vec<usize>,
    pub failing_seeks: bool,
}

impl SyntheticVideo {
    pub fn new(duration: f64, fps: u32) -> Self {
        Self {
            duration,
            fps: fps.max(1),
            width: 320,
            height: 180,
            rotation: 0,
            gop_size: 30,
            decoder_delay: 0,
            corrupt_frames: Vec::new(),
            failing_seeks: false,
        }
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_rotation(mut self, rotation: i32) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_gop_size(mut self, gop_size: usize) -> Self {
        self.gop_size = gop_size.max(1);
        self
    }

    /// Pictures held back inside the decoder before the first one comes out
    pub fn with_decoder_delay(mut self, frames: usize) -> Self {
        self.decoder_delay = frames;
        self
    }

    pub fn with_corrupt_frames(mut self, frames: &[usize]) -> Self {
        self.corrupt_frames = frames.to_vec();
        self
    }

    pub fn with_failing_seeks(mut self) -> Self {
        self.failing_seeks = true;
        self
    }

    pub fn frame_count(&self) -> usize {
        (self.duration * self.fps as f64).round().max(0.0) as usize
    }

    fn ticks_per_frame(&self) -> i64 {
        90_000 / self.fps as i64
    }

    fn pts_of(&self, frame: usize) -> i64 {
        frame as i64 * 90_000 / self.fps as i64
    }

    fn frame_at(&self, ticks: i64) -> usize {
        (ticks.max(0) * self.fps as i64 / 90_000) as usize
    }
}

/// Sample values of generated audio
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Waveform {
    /// Every sample has the same value
    Constant(i16),
    /// Sample frame `n` has value `n % 16384`, on every channel
    Ramp,
    Silence,
}

impl Waveform {
    fn sample(self, frame: i64) -> i16 {
        match self {
            Waveform::Constant(value) => value,
            Waveform::Ramp => frame.rem_euclid(16_384) as i16,
            Waveform::Silence => 0,
        }
    }
}

/// Generated audio stream
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticAudio {
    pub duration: f64,
    pub sample_rate: u32,
    pub channels: u16,
    pub format: SampleFormat,
    pub planar: bool,
    pub frame_samples: usize,
    pub start_time: f64,
    pub waveform: Waveform,
    pub format_name: Option<String>,
    /// Streams are only found when at least this many bytes are analysed
    pub min_probe_size: usize,
}

impl SyntheticAudio {
    pub fn new(duration: f64) -> Self {
        Self {
            duration,
            sample_rate: 44_100,
            channels: 2,
            format: SampleFormat::S16,
            planar: false,
            frame_samples: 1024,
            start_time: 0.0,
            waveform: Waveform::Constant(1_000),
            format_name: None,
            min_probe_size: 0,
        }
    }

    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate.max(1);
        self
    }

    pub fn with_channels(mut self, channels: u16) -> Self {
        self.channels = channels.max(1);
        self
    }

    pub fn with_format(mut self, format: SampleFormat, planar: bool) -> Self {
        self.format = format;
        self.planar = planar;
        self
    }

    pub fn with_frame_samples(mut self, frame_samples: usize) -> Self {
        self.frame_samples = frame_samples.max(1);
        self
    }

    pub fn with_start_time(mut self, start_time: f64) -> Self {
        self.start_time = start_time;
        self
    }

    pub fn with_waveform(mut self, waveform: Waveform) -> Self {
        self.waveform = waveform;
        self
    }

    pub fn with_format_name(mut self, name: &str) -> Self {
        self.format_name = Some(name.to_string());
        self
    }

    pub fn with_min_probe_size(mut self, bytes: usize) -> Self {
        self.min_probe_size = bytes;
        self
    }

    fn total_frames(&self) -> i64 {
        (self.duration * self.sample_rate as f64).round().max(0.0) as i64
    }

    fn start_ticks(&self) -> i64 {
        (self.start_time * self.sample_rate as f64).round() as i64
    }

    fn packet_count(&self) -> usize {
        (self.total_frames() as usize).div_ceil(self.frame_samples)
    }

    fn encode(&self, first_frame: i64, frames: usize) -> Vec<Vec<u8>> {
        let channels = self.channels as usize;
        let bps = self.format.bytes_per_sample();
        let plane_count = if self.planar { channels } else { 1 };
        let per_plane = if self.planar { frames } else { frames * channels };
        let mut planes = vec![Vec::with_capacity(per_plane * bps); plane_count];
        for i in 0..frames {
            let value = self.waveform.sample(first_frame + i as i64);
            for ch in 0..channels {
                let plane = if self.planar { &mut planes[ch] } else { &mut planes[0] };
                match self.format {
                    SampleFormat::U8 => plane.push(((value >> 8) + 128) as u8),
                    SampleFormat::S16 => plane.extend_from_slice(&value.to_ne_bytes()),
                    SampleFormat::S32 => plane.extend_from_slice(&((value as i32) << 16).to_ne_bytes()),
                    SampleFormat::F32 => plane.extend_from_slice(&(value as f32 / 32_768.0).to_ne_bytes()),
                    SampleFormat::F64 => plane.extend_from_slice(&(value as f64 / 32_768.0).to_ne_bytes()),
                }
            }
        }
        planes
    }
}

#[derive(Debug, Clone, Default)]
struct SyntheticFile {
    video: Option<SyntheticVideo>,
    audio: Option<SyntheticAudio>,
}

impl SyntheticFile {
    fn format_name(&self) -> String {
        match (&self.audio, &self.video) {
            (Some(SyntheticAudio { format_name: Some(name), .. }), _) => name.clone(),
            (Some(_), None) => "mp3".to_string(),
            _ => MP4_FORMAT_NAME.to_string(),
        }
    }

    fn audio_stream_index(&self) -> usize {
        usize::from(self.video.is_some())
    }
}

/// Counters of what the backend was asked to do
#[derive(Debug, Default)]
pub struct SyntheticStats {
    video_opens: AtomicUsize,
    video_seeks: AtomicUsize,
    audio_opens: AtomicUsize,
    audio_seeks: AtomicUsize,
    resamplers: AtomicUsize,
    opened_video_paths: Mutex<Vec<PathBuf>>,
}

impl SyntheticStats {
    pub fn video_opens(&self) -> usize {
        self.video_opens.load(Ordering::SeqCst)
    }

    pub fn video_seeks(&self) -> usize {
        self.video_seeks.load(Ordering::SeqCst)
    }

    pub fn audio_opens(&self) -> usize {
        self.audio_opens.load(Ordering::SeqCst)
    }

    pub fn audio_seeks(&self) -> usize {
        self.audio_seeks.load(Ordering::SeqCst)
    }

    pub fn resamplers(&self) -> usize {
        self.resamplers.load(Ordering::SeqCst)
    }

    /// Every path opened for video, in order
    pub fn opened_video_paths(&self) -> Vec<PathBuf> {
        self.opened_video_paths.lock().clone()
    }
}

/// In-memory `MediaBackend`
#[derive(Default)]
pub struct SyntheticBackend {
    files: RwLock<HashMap<PathBuf, SyntheticFile>>,
    stats: Arc<SyntheticStats>,
}

impl SyntheticBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the video stream of `path`
    pub fn add_video(&self, path: impl Into<PathBuf>, video: SyntheticVideo) {
        self.files.write().entry(path.into()).or_default().video = Some(video);
    }

    /// Registers (or replaces) the audio stream of `path`
    pub fn add_audio(&self, path: impl Into<PathBuf>, audio: SyntheticAudio) {
        self.files.write().entry(path.into()).or_default().audio = Some(audio);
    }

    pub fn stats(&self) -> &SyntheticStats {
        &self.stats
    }

    fn file(&self, path: &Path) -> Result<SyntheticFile, DecodeError> {
        self.files.read().get(path).cloned().ok_or_else(|| DecodeError::Open {
            path: path.to_path_buf(),
            reason: "no such synthetic file".into(),
        })
    }
}

impl MediaProbe for SyntheticBackend {
    fn probe(&self, path: &Path) -> Result<MediaFileInfo, ProbeError> {
        let file = self.file(path).map_err(|e| ProbeError::Failed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let mut info = MediaFileInfo {
            path: path.to_path_buf(),
            format_name: file.format_name(),
            ..MediaFileInfo::default()
        };
        if let Some(video) = &file.video {
            info.video_stream_index = Some(info.streams.len());
            info.streams.push(ProbedStream {
                codec_type: CodecType::Video,
                width: video.width,
                height: video.height,
                rotation: video.rotation,
                frame_rate: Rational::new(video.fps as i32, 1),
                sample_aspect_ratio: Rational::new(0, 1),
            });
            info.duration = video.duration;
        }
        if let Some(audio) = &file.audio {
            info.audio_stream_index = Some(info.streams.len());
            info.streams.push(ProbedStream {
                codec_type: CodecType::Audio,
                ..ProbedStream::default()
            });
            if file.video.is_none() {
                info.duration = audio.duration;
            }
        }
        Ok(info)
    }
}

impl MediaBackend for SyntheticBackend {
    fn open_video(&self, path: &Path) -> Result<Box<dyn VideoDemuxer>, DecodeError> {
        let file = self.file(path)?;
        let video = file.video.ok_or(DecodeError::StreamNotFound("video"))?;
        self.stats.video_opens.fetch_add(1, Ordering::SeqCst);
        self.stats.opened_video_paths.lock().push(path.to_path_buf());

        let stream = VideoStreamInfo {
            index: 0,
            time_base: VIDEO_TIME_BASE,
            avg_frame_rate: Rational::new(video.fps as i32, 1),
            first_dts: Some(0),
            duration: video.frame_count() as i64 * video.ticks_per_frame(),
            width: video.width,
            height: video.height,
        };
        Ok(Box::new(SyntheticVideoDemuxer {
            video,
            stream,
            cursor: 0,
            delayed: VecDeque::new(),
            stats: Arc::clone(&self.stats),
        }))
    }

    fn open_audio(&self, path: &Path, probe_size: usize) -> Result<Box<dyn AudioDemuxer>, DecodeError> {
        let file = self.file(path)?;
        self.stats.audio_opens.fetch_add(1, Ordering::SeqCst);

        let format_name = file.format_name();
        let video_duration = file.video.as_ref().map(|v| v.duration);
        let index = file.audio_stream_index();
        let audio = file.audio.filter(|a| probe_size >= a.min_probe_size);
        let stream = audio.as_ref().map(|a| AudioStreamInfo {
            index,
            time_base: Rational::new(1, a.sample_rate as i32),
            duration: Some(a.total_frames()),
            start_time: Some(a.start_ticks()),
            sample_rate: a.sample_rate,
            channels: a.channels,
            sample_format: a.format,
            planar: a.planar,
        });
        Ok(Box::new(SyntheticAudioDemuxer {
            audio,
            stream,
            format_name,
            video_duration,
            cursor: 0,
            stats: Arc::clone(&self.stats),
        }))
    }

    fn resampler(&self, target: AudioFormat) -> Box<dyn Resampler> {
        self.stats.resamplers.fetch_add(1, Ordering::SeqCst);
        Box::new(LinearResampler::new(target))
    }
}

struct SyntheticVideoDemuxer {
    video: SyntheticVideo,
    stream: VideoStreamInfo,
    cursor: usize,
    delayed: VecDeque<DecodedPicture>,
    stats: Arc<SyntheticStats>,
}

impl SyntheticVideoDemuxer {
    fn picture(&self, frame: usize) -> DecodedPicture {
        let (width, height) = (self.video.width, self.video.height);
        let pts = self.video.pts_of(frame);
        DecodedPicture {
            width,
            height,
            format: PixelFormat::Gray8,
            planes: vec![Plane {
                data: vec![(frame % 256) as u8; width as usize * height as usize],
                stride: width as usize,
            }],
            pts: Some(pts),
            best_effort_timestamp: Some(pts),
        }
    }
}

impl VideoDemuxer for SyntheticVideoDemuxer {
    fn stream(&self) -> &VideoStreamInfo {
        &self.stream
    }

    fn index_entries(&self) -> Vec<IndexEntry> {
        (0..self.video.frame_count())
            .map(|i| IndexEntry {
                timestamp: self.video.pts_of(i),
                keyframe: i % self.video.gop_size == 0,
                discard: false,
            })
            .collect()
    }

    fn read_packet(&mut self) -> Result<Option<Packet>, DecodeError> {
        if self.cursor >= self.video.frame_count() {
            return Ok(None);
        }
        let frame = self.cursor;
        self.cursor += 1;
        let pts = self.video.pts_of(frame);
        Ok(Some(Packet {
            stream_index: self.stream.index,
            pts: Some(pts),
            dts: Some(pts),
            duration: self.video.ticks_per_frame(),
            keyframe: frame % self.video.gop_size == 0,
            discard: false,
            data: (frame as u64).to_le_bytes().to_vec(),
        }))
    }

    fn decode(&mut self, packet: Option<&Packet>) -> Result<Option<DecodedPicture>, DecodeError> {
        let Some(packet) = packet else {
            return Ok(self.delayed.pop_front());
        };
        let bytes: [u8; 8] = packet
            .data
            .as_slice()
            .try_into()
            .map_err(|_| DecodeError::Corrupt("malformed synthetic packet".into()))?;
        let frame = u64::from_le_bytes(bytes) as usize;
        if self.video.corrupt_frames.contains(&frame) {
            return Err(DecodeError::Corrupt(format!("synthetic frame {frame}")));
        }
        self.delayed.push_back(self.picture(frame));
        if self.delayed.len() > self.video.decoder_delay {
            Ok(self.delayed.pop_front())
        } else {
            Ok(None)
        }
    }

    fn seek(&mut self, timestamp: i64, backward: bool) -> Result<(), DecodeError> {
        if self.video.failing_seeks {
            return Err(DecodeError::Seek {
                timestamp,
                reason: "synthetic seek failure".into(),
            });
        }
        let count = self.video.frame_count();
        let gop = self.video.gop_size;
        let frame = self.video.frame_at(timestamp).min(count.saturating_sub(1));
        let mut keyframe = if backward {
            frame / gop * gop
        } else {
            frame.div_ceil(gop) * gop
        };
        if keyframe >= count {
            keyframe = count.saturating_sub(1) / gop * gop;
        }
        self.cursor = keyframe;
        self.stats.video_seeks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn flush(&mut self) {
        self.delayed.clear();
    }
}

struct SyntheticAudioDemuxer {
    audio: Option<SyntheticAudio>,
    stream: Option<AudioStreamInfo>,
    format_name: String,
    video_duration: Option<f64>,
    cursor: usize,
    stats: Arc<SyntheticStats>,
}

impl AudioDemuxer for SyntheticAudioDemuxer {
    fn format_name(&self) -> &str {
        &self.format_name
    }

    fn stream(&self) -> Option<&AudioStreamInfo> {
        self.stream.as_ref()
    }

    fn video_duration(&self) -> Option<f64> {
        self.video_duration
    }

    fn read_packet(&mut self) -> Result<Option<Packet>, DecodeError> {
        let (Some(audio), Some(stream)) = (&self.audio, &self.stream) else {
            return Ok(None);
        };
        if self.cursor >= audio.packet_count() {
            return Ok(None);
        }
        let first = (self.cursor * audio.frame_samples) as i64;
        let frames = (audio.total_frames() - first).min(audio.frame_samples as i64);
        let ts = audio.start_ticks() + first;
        self.cursor += 1;
        Ok(Some(Packet {
            stream_index: stream.index,
            pts: Some(ts),
            dts: Some(ts),
            duration: frames,
            keyframe: true,
            discard: false,
            data: Vec::new(),
        }))
    }

    fn decode(&mut self, packet: &Packet) -> Result<Option<DecodedAudio>, DecodeError> {
        let audio = self.audio.as_ref().ok_or(DecodeError::NotOpened)?;
        let Some(ts) = packet.pts else {
            return Err(DecodeError::Corrupt("synthetic audio packet without pts".into()));
        };
        let frames = packet.duration.max(0) as usize;
        if frames == 0 {
            return Ok(None);
        }
        let first_frame = ts - audio.start_ticks();
        Ok(Some(DecodedAudio {
            format: audio.format,
            planar: audio.planar,
            channels: audio.channels,
            sample_rate: audio.sample_rate,
            nb_samples: frames,
            planes: audio.encode(first_frame, frames),
            pts: Some(ts),
            best_effort_timestamp: Some(ts),
        }))
    }

    fn seek(&mut self, timestamp: i64, backward: bool) -> Result<(), DecodeError> {
        let audio = self.audio.as_ref().ok_or(DecodeError::NotOpened)?;
        let offset = (timestamp - audio.start_ticks()).max(0) as usize;
        let packet = if backward {
            offset / audio.frame_samples
        } else {
            offset.div_ceil(audio.frame_samples)
        };
        self.cursor = packet.min(audio.packet_count());
        self.stats.audio_seeks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn flush(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_reports_streams() {
        let backend = SyntheticBackend::new();
        backend.add_video("a.mp4", SyntheticVideo::new(5.0, 25).with_size(1920, 1080).with_rotation(90));
        backend.add_audio("a.mp4", SyntheticAudio::new(5.0));
        backend.add_audio("bgm.mp3", SyntheticAudio::new(12.0));

        let info = backend.probe(Path::new("a.mp4")).unwrap();
        assert_eq!(info.format_name, MP4_FORMAT_NAME);
        assert_eq!(info.video_stream_index, Some(0));
        assert_eq!(info.audio_stream_index, Some(1));
        assert_eq!(info.video_stream().unwrap().rotation, 90);
        assert_eq!(info.duration, 5.0);

        let bgm = backend.probe(Path::new("bgm.mp3")).unwrap();
        assert_eq!(bgm.format_name, "mp3");
        assert_eq!(bgm.duration, 12.0);
        assert!(backend.probe(Path::new("missing.mp4")).is_err());
    }

    #[test]
    fn test_video_packets_and_delay() {
        let backend = SyntheticBackend::new();
        backend.add_video("a.mp4", SyntheticVideo::new(0.3, 10).with_decoder_delay(1));
        let mut demuxer = backend.open_video(Path::new("a.mp4")).unwrap();

        let first = demuxer.read_packet().unwrap().unwrap();
        assert!(first.keyframe);
        assert!(demuxer.decode(Some(&first)).unwrap().is_none());
        let second = demuxer.read_packet().unwrap().unwrap();
        let picture = demuxer.decode(Some(&second)).unwrap().unwrap();
        assert_eq!(picture.pts, Some(0));
        assert_eq!(demuxer.decode(None).unwrap().unwrap().pts, Some(9_000));
        assert!(demuxer.decode(None).unwrap().is_none());
    }

    #[test]
    fn test_audio_probe_size_hides_stream() {
        let backend = SyntheticBackend::new();
        backend.add_audio("late.m4a", SyntheticAudio::new(1.0).with_min_probe_size(4096));
        assert!(backend.open_audio(Path::new("late.m4a"), 1024).unwrap().stream().is_none());
        assert!(backend.open_audio(Path::new("late.m4a"), 8192).unwrap().stream().is_some());
        assert_eq!(backend.stats().audio_opens(), 2);
    }

    #[test]
    fn test_audio_ramp_and_seek() {
        let backend = SyntheticBackend::new();
        backend.add_audio(
            "ramp.wav",
            SyntheticAudio::new(1.0).with_channels(1).with_waveform(Waveform::Ramp).with_frame_samples(100),
        );
        let mut demuxer = backend.open_audio(Path::new("ramp.wav"), 1024).unwrap();
        demuxer.seek(250, true).unwrap();
        let packet = demuxer.read_packet().unwrap().unwrap();
        assert_eq!(packet.pts, Some(200));
        let decoded = demuxer.decode(&packet).unwrap().unwrap();
        assert_eq!(decoded.nb_samples, 100);
        assert_eq!(crate::audio::resample::packed_s16(&decoded)[..3], [200, 201, 202]);
    }
}
