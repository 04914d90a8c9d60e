//! FFmpeg-backed `MediaBackend` for real files.
//!
//! Demuxing, decoding and resampling go through the `ffmpeg-next` wrappers;
//! the stream index is read through `ffmpeg::ffi` in one isolated unsafe
//! block. Packets cross the trait boundary as owned `Packet`s and are rebuilt
//! on the decode side, so the decode contexts never see FFmpeg types.

use std::collections::VecDeque;
use std::path::Path;

use ffmpeg_next as ffmpeg;

use crate::audio::buffer::{DecodedAudio, SampleFormat};
use crate::audio::resample::{AudioFormat, Resampler};
use crate::core::project::{CodecType, MediaFileInfo, ProbedStream};
use crate::core::time::Rational;
use crate::decode::frame::{DecodedPicture, PixelFormat, Plane};
use crate::decode::stream_info::{AudioStreamInfo, IndexEntry, VideoStreamInfo};
use crate::media::{
    AudioDemuxer, DecodeError, MediaBackend, MediaProbe, Offer, Packet, PacketBacklog, ProbeError, VideoDemuxer,
};

/// Opens files through FFmpeg
#[derive(Debug)]
pub struct FfmpegBackend;

impl FfmpegBackend {
    pub fn new() -> Result<Self, DecodeError> {
        ffmpeg::init().map_err(|e| DecodeError::Backend(format!("FFmpeg init failed: {e}")))?;
        Ok(Self)
    }
}

impl MediaProbe for FfmpegBackend {
    fn probe(&self, path: &Path) -> Result<MediaFileInfo, ProbeError> {
        let input = ffmpeg::format::input(&path).map_err(|e| ProbeError::Failed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let mut info = MediaFileInfo {
            path: path.to_path_buf(),
            format_name: input.format().name().to_string(),
            ..MediaFileInfo::default()
        };
        let mut shortest = f64::INFINITY;
        let mut video_duration = None;
        for stream in input.streams() {
            let codec_type = codec_type(stream.parameters().medium());
            let mut probed = ProbedStream {
                codec_type,
                frame_rate: guessed_frame_rate(&stream),
                ..ProbedStream::default()
            };
            if codec_type == CodecType::Video {
                if let Ok(video) = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
                    .and_then(|ctx| ctx.decoder().video())
                {
                    probed.width = video.width();
                    probed.height = video.height();
                    probed.sample_aspect_ratio = to_rational(video.aspect_ratio());
                }
                probed.rotation = stream
                    .metadata()
                    .get("rotate")
                    .and_then(|r| r.parse().ok())
                    .unwrap_or(0);
            }

            let duration = stream_seconds(stream.duration(), stream.time_base());
            if let Some(d) = duration {
                shortest = shortest.min(d);
            }
            match codec_type {
                CodecType::Video if info.video_stream_index.is_none() => {
                    info.video_stream_index = Some(stream.index());
                    video_duration = duration;
                }
                CodecType::Audio if info.audio_stream_index.is_none() => {
                    info.audio_stream_index = Some(stream.index());
                }
                _ => {}
            }
            info.streams.push(probed);
        }

        info.duration = video_duration
            .or_else(|| shortest.is_finite().then_some(shortest))
            .unwrap_or_else(|| (input.duration().max(0) as f64) / f64::from(ffmpeg::ffi::AV_TIME_BASE));
        tracing::debug!(path = %path.display(), format = %info.format_name, duration = info.duration, "probed");
        Ok(info)
    }
}

impl MediaBackend for FfmpegBackend {
    fn open_video(&self, path: &Path) -> Result<Box<dyn VideoDemuxer>, DecodeError> {
        let input = ffmpeg::format::input(&path).map_err(|e| open_error(path, e))?;
        let stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or(DecodeError::StreamNotFound("video"))?;
        let decoder = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .and_then(|ctx| ctx.decoder().video())
            .map_err(|e| DecodeError::CodecNotFound(e.to_string()))?;

        let info = VideoStreamInfo {
            index: stream.index(),
            time_base: to_rational(stream.time_base()),
            avg_frame_rate: guessed_frame_rate(&stream),
            first_dts: ticks(stream.start_time()),
            duration: stream.duration(),
            width: decoder.width(),
            height: decoder.height(),
        };
        tracing::debug!(path = %path.display(), stream = info.index, "video opened");
        Ok(Box::new(FfmpegVideoDemuxer {
            input,
            decoder,
            info,
            backlog: PacketBacklog::new(),
            eof_sent: false,
        }))
    }

    fn open_audio(&self, path: &Path, probe_size: usize) -> Result<Box<dyn AudioDemuxer>, DecodeError> {
        let mut options = ffmpeg::Dictionary::new();
        options.set("probesize", &probe_size.max(32).to_string());
        let input = ffmpeg::format::input_with_dictionary(&path, options).map_err(|e| open_error(path, e))?;

        let format_name = input.format().name().to_string();
        let video_duration = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .and_then(|s| stream_seconds(s.duration(), s.time_base()));

        let mut decoder = None;
        let mut info = None;
        if let Some(stream) = input.streams().best(ffmpeg::media::Type::Audio) {
            let audio = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
                .and_then(|ctx| ctx.decoder().audio())
                .map_err(|e| DecodeError::CodecNotFound(e.to_string()))?;
            let (sample_format, planar) = sample_format(audio.format());
            info = Some(AudioStreamInfo {
                index: stream.index(),
                time_base: to_rational(stream.time_base()),
                duration: ticks(stream.duration()),
                start_time: ticks(stream.start_time()),
                sample_rate: audio.rate(),
                channels: audio.channels(),
                sample_format,
                planar,
            });
            decoder = Some(audio);
        }
        tracing::debug!(path = %path.display(), probe_size, has_audio = info.is_some(), "audio opened");
        Ok(Box::new(FfmpegAudioDemuxer {
            input,
            decoder,
            info,
            format_name,
            video_duration,
        }))
    }

    fn resampler(&self, target: AudioFormat) -> Box<dyn Resampler> {
        Box::new(SwrResampler::new(target))
    }
}

struct FfmpegVideoDemuxer {
    input: ffmpeg::format::context::Input,
    decoder: ffmpeg::decoder::Video,
    info: VideoStreamInfo,
    backlog: PacketBacklog<ffmpeg::Packet>,
    eof_sent: bool,
}

impl VideoDemuxer for FfmpegVideoDemuxer {
    fn stream(&self) -> &VideoStreamInfo {
        &self.info
    }

    fn index_entries(&self) -> Vec<IndexEntry> {
        let Some(stream) = self.input.stream(self.info.index) else {
            return Vec::new();
        };
        // SAFETY: the stream belongs to `self.input`, which outlives this call;
        // entries are copied out before returning.
        unsafe {
            let st = stream.as_ptr() as *mut ffmpeg::ffi::AVStream;
            let count = ffmpeg::ffi::avformat_index_get_entries_count(st);
            (0..count)
                .filter_map(|i| ffmpeg::ffi::avformat_index_get_entry(st, i).as_ref())
                .map(|entry| index_entry(entry.timestamp, entry.flags()))
                .collect()
        }
    }

    fn read_packet(&mut self) -> Result<Option<Packet>, DecodeError> {
        read_packet(&mut self.input)
    }

    fn decode(&mut self, packet: Option<&Packet>) -> Result<Option<DecodedPicture>, DecodeError> {
        if let Some(packet) = packet {
            self.backlog.push(to_ffmpeg_packet(packet));
        }
        let decoder = &mut self.decoder;
        self.backlog.feed(|packet| match decoder.send_packet(packet) {
            Ok(()) => Ok(Offer::Accepted),
            Err(e) if is_again(&e) => Ok(Offer::Full),
            Err(e) => Err(DecodeError::Corrupt(e.to_string())),
        })?;
        if !self.backlog.is_empty() {
            tracing::trace!(waiting = self.backlog.len(), "video decoder full, packets held back");
        }

        // Drain mode starts once every held-back packet went in
        if packet.is_none() && self.backlog.is_empty() && !self.eof_sent {
            self.eof_sent = true;
            if let Err(e) = self.decoder.send_eof() {
                tracing::debug!(error = %e, "send_eof failed");
            }
        }

        let mut frame = ffmpeg::frame::Video::empty();
        match self.decoder.receive_frame(&mut frame) {
            Ok(()) => Ok(Some(to_picture(&frame))),
            Err(e) if is_again(&e) || e == ffmpeg::Error::Eof => Ok(None),
            Err(e) => Err(DecodeError::Corrupt(e.to_string())),
        }
    }

    fn seek(&mut self, timestamp: i64, backward: bool) -> Result<(), DecodeError> {
        seek_input(&mut self.input, timestamp, self.info.time_base, backward)?;
        self.backlog.clear();
        self.eof_sent = false;
        Ok(())
    }

    fn flush(&mut self) {
        self.decoder.flush();
        self.backlog.clear();
        self.eof_sent = false;
    }
}

struct FfmpegAudioDemuxer {
    input: ffmpeg::format::context::Input,
    decoder: Option<ffmpeg::decoder::Audio>,
    info: Option<AudioStreamInfo>,
    format_name: String,
    video_duration: Option<f64>,
}

impl AudioDemuxer for FfmpegAudioDemuxer {
    fn format_name(&self) -> &str {
        &self.format_name
    }

    fn stream(&self) -> Option<&AudioStreamInfo> {
        self.info.as_ref()
    }

    fn video_duration(&self) -> Option<f64> {
        self.video_duration
    }

    fn read_packet(&mut self) -> Result<Option<Packet>, DecodeError> {
        read_packet(&mut self.input)
    }

    fn decode(&mut self, packet: &Packet) -> Result<Option<DecodedAudio>, DecodeError> {
        let decoder = self.decoder.as_mut().ok_or(DecodeError::NotOpened)?;
        decoder
            .send_packet(&to_ffmpeg_packet(packet))
            .map_err(|e| DecodeError::Corrupt(e.to_string()))?;

        let mut frames = VecDeque::new();
        loop {
            let mut frame = ffmpeg::frame::Audio::empty();
            match decoder.receive_frame(&mut frame) {
                Ok(()) => frames.push_back(to_audio(&frame)),
                Err(e) if is_again(&e) || e == ffmpeg::Error::Eof => break,
                Err(e) => return Err(DecodeError::Corrupt(e.to_string())),
            }
        }
        Ok(concat_audio(frames))
    }

    fn seek(&mut self, timestamp: i64, backward: bool) -> Result<(), DecodeError> {
        let time_base = self.info.as_ref().map_or(Rational::new(1, 1_000_000), |s| s.time_base);
        seek_input(&mut self.input, timestamp, time_base, backward)
    }

    fn flush(&mut self) {
        if let Some(decoder) = self.decoder.as_mut() {
            decoder.flush();
        }
    }
}

/// swresample conversion to interleaved i16 in the output layout. The
/// context is rebuilt whenever the source layout changes and on `reset`.
pub struct SwrResampler {
    target: AudioFormat,
    context: Option<ffmpeg::software::resampling::Context>,
    source: Option<(SampleFormat, bool, u16, u32)>,
}

// SAFETY: the context is only touched through `&mut self`.
unsafe impl Send for SwrResampler {}

impl SwrResampler {
    pub fn new(target: AudioFormat) -> Self {
        Self {
            target,
            context: None,
            source: None,
        }
    }

    fn ensure_context(&mut self, input: &DecodedAudio) -> Result<(), ffmpeg::Error> {
        let source = (input.format, input.planar, input.channels, input.sample_rate);
        if self.context.is_some() && self.source == Some(source) {
            return Ok(());
        }
        let context = ffmpeg::software::resampling::Context::get(
            to_ffmpeg_sample(input.format, input.planar),
            channel_layout(input.channels),
            input.sample_rate,
            ffmpeg::format::Sample::I16(ffmpeg::format::sample::Type::Packed),
            channel_layout(self.target.channels),
            self.target.sample_rate,
        )?;
        tracing::debug!(
            from_rate = input.sample_rate,
            from_channels = input.channels,
            to_rate = self.target.sample_rate,
            to_channels = self.target.channels,
            "audio resampler created"
        );
        self.context = Some(context);
        self.source = Some(source);
        Ok(())
    }

    fn run(&mut self, input: &DecodedAudio) -> Result<Vec<i16>, ffmpeg::Error> {
        self.ensure_context(input)?;
        let Some(context) = self.context.as_mut() else {
            return Ok(Vec::new());
        };

        let layout = channel_layout(input.channels);
        let mut source = ffmpeg::frame::Audio::new(to_ffmpeg_sample(input.format, input.planar), input.nb_samples, layout);
        source.set_rate(input.sample_rate);
        for (i, plane) in input.planes.iter().enumerate().take(source.planes()) {
            let data = source.data_mut(i);
            let len = plane.len().min(data.len());
            data[..len].copy_from_slice(&plane[..len]);
        }

        // Room for the rate change plus whatever the filter still holds
        let capacity = (input.nb_samples as u64 * u64::from(self.target.sample_rate)
            / u64::from(input.sample_rate.max(1))) as usize
            + 64;
        let mut output = ffmpeg::frame::Audio::new(
            ffmpeg::format::Sample::I16(ffmpeg::format::sample::Type::Packed),
            capacity,
            channel_layout(self.target.channels),
        );
        context.run(&source, &mut output)?;

        let samples = output.samples() * self.target.channels as usize;
        let bytes = output.data(0);
        Ok(bytes
            .chunks_exact(2)
            .take(samples)
            .map(|b| i16::from_ne_bytes([b[0], b[1]]))
            .collect())
    }
}

impl Resampler for SwrResampler {
    fn convert(&mut self, input: &DecodedAudio) -> Vec<i16> {
        if input.nb_samples == 0 {
            return Vec::new();
        }
        match self.run(input) {
            Ok(pcm) => pcm,
            Err(e) => {
                tracing::warn!(error = %e, "audio resampling failed");
                self.context = None;
                Vec::new()
            }
        }
    }

    fn reset(&mut self) {
        self.context = None;
        self.source = None;
    }
}

/// Conventional layout for a channel count
fn channel_layout(channels: u16) -> ffmpeg::ChannelLayout {
    match channels {
        1 => ffmpeg::ChannelLayout::MONO,
        3 => ffmpeg::ChannelLayout::SURROUND,
        4 => ffmpeg::ChannelLayout::QUAD,
        5 => ffmpeg::ChannelLayout::_5POINT0,
        6 => ffmpeg::ChannelLayout::_5POINT1,
        7 => ffmpeg::ChannelLayout::_6POINT1,
        8 => ffmpeg::ChannelLayout::_7POINT1,
        _ => ffmpeg::ChannelLayout::STEREO,
    }
}

fn to_ffmpeg_sample(format: SampleFormat, planar: bool) -> ffmpeg::format::Sample {
    use ffmpeg::format::sample::Type;
    use ffmpeg::format::Sample;
    let kind = if planar { Type::Planar } else { Type::Packed };
    match format {
        SampleFormat::U8 => Sample::U8(kind),
        SampleFormat::S16 => Sample::I16(kind),
        SampleFormat::S32 => Sample::I32(kind),
        SampleFormat::F32 => Sample::F32(kind),
        SampleFormat::F64 => Sample::F64(kind),
    }
}

fn index_entry(timestamp: i64, flags: i32) -> IndexEntry {
    IndexEntry {
        timestamp,
        keyframe: flags & ffmpeg::ffi::AVINDEX_KEYFRAME as i32 != 0,
        discard: flags & ffmpeg::ffi::AVINDEX_DISCARD_FRAME as i32 != 0,
    }
}

fn open_error(path: &Path, e: ffmpeg::Error) -> DecodeError {
    DecodeError::Open {
        path: path.to_path_buf(),
        reason: e.to_string(),
    }
}

fn is_again(e: &ffmpeg::Error) -> bool {
    matches!(e, ffmpeg::Error::Other { errno } if *errno == ffmpeg::error::EAGAIN)
}

fn ticks(value: i64) -> Option<i64> {
    (value != ffmpeg::ffi::AV_NOPTS_VALUE).then_some(value)
}

fn to_rational(r: ffmpeg::Rational) -> Rational {
    Rational::new(r.numerator(), r.denominator())
}

fn stream_seconds(duration: i64, time_base: ffmpeg::Rational) -> Option<f64> {
    let duration = ticks(duration).filter(|d| *d > 0)?;
    let tb = to_rational(time_base).to_f64();
    (tb > 0.0).then(|| duration as f64 * tb)
}

fn guessed_frame_rate(stream: &ffmpeg::format::stream::Stream<'_>) -> Rational {
    let avg = stream.avg_frame_rate();
    if avg.numerator() > 0 && avg.denominator() > 0 {
        to_rational(avg)
    } else {
        to_rational(stream.rate())
    }
}

fn codec_type(medium: ffmpeg::media::Type) -> CodecType {
    match medium {
        ffmpeg::media::Type::Video => CodecType::Video,
        ffmpeg::media::Type::Audio => CodecType::Audio,
        ffmpeg::media::Type::Data => CodecType::Data,
        ffmpeg::media::Type::Subtitle => CodecType::Subtitle,
        ffmpeg::media::Type::Attachment => CodecType::Attachment,
        _ => CodecType::Unknown,
    }
}

fn sample_format(format: ffmpeg::format::Sample) -> (SampleFormat, bool) {
    use ffmpeg::format::sample::Type;
    use ffmpeg::format::Sample;
    let (format, kind) = match format {
        Sample::U8(t) => (SampleFormat::U8, t),
        Sample::I16(t) => (SampleFormat::S16, t),
        Sample::I32(t) => (SampleFormat::S32, t),
        Sample::F32(t) => (SampleFormat::F32, t),
        Sample::F64(t) => (SampleFormat::F64, t),
        _ => (SampleFormat::S16, Type::Packed),
    };
    (format, kind == Type::Planar)
}

fn pixel_format(format: ffmpeg::format::Pixel) -> PixelFormat {
    match format {
        ffmpeg::format::Pixel::YUV420P => PixelFormat::Yuv420p,
        ffmpeg::format::Pixel::NV12 => PixelFormat::Nv12,
        ffmpeg::format::Pixel::RGBA => PixelFormat::Rgba,
        ffmpeg::format::Pixel::BGRA => PixelFormat::Bgra,
        ffmpeg::format::Pixel::GRAY8 => PixelFormat::Gray8,
        _ => PixelFormat::Other,
    }
}

fn read_packet(input: &mut ffmpeg::format::context::Input) -> Result<Option<Packet>, DecodeError> {
    let mut packet = ffmpeg::Packet::empty();
    match packet.read(input) {
        Ok(()) => Ok(Some(Packet {
            stream_index: packet.stream(),
            pts: packet.pts(),
            dts: packet.dts(),
            duration: packet.duration(),
            keyframe: packet.is_key(),
            discard: false,
            data: packet.data().map(<[u8]>::to_vec).unwrap_or_default(),
        })),
        Err(ffmpeg::Error::Eof) => Ok(None),
        Err(e) => Err(DecodeError::Backend(e.to_string())),
    }
}

fn to_ffmpeg_packet(packet: &Packet) -> ffmpeg::Packet {
    let mut out = ffmpeg::Packet::copy(&packet.data);
    out.set_stream(packet.stream_index);
    out.set_pts(packet.pts);
    out.set_dts(packet.dts);
    out.set_duration(packet.duration);
    if packet.keyframe {
        out.set_flags(ffmpeg::packet::Flags::KEY);
    }
    out
}

/// Seeks in `AV_TIME_BASE` units; `backward` lands on the preceding keyframe
fn seek_input(
    input: &mut ffmpeg::format::context::Input,
    timestamp: i64,
    time_base: Rational,
    backward: bool,
) -> Result<(), DecodeError> {
    let micros = (timestamp as f64 * time_base.to_f64() * f64::from(ffmpeg::ffi::AV_TIME_BASE)).round() as i64;
    let result = if backward {
        input.seek(micros, ..micros)
    } else {
        input.seek(micros, micros..)
    };
    result.map_err(|e| DecodeError::Seek {
        timestamp,
        reason: e.to_string(),
    })
}

fn to_picture(frame: &ffmpeg::frame::Video) -> DecodedPicture {
    let planes = (0..frame.planes())
        .map(|i| Plane {
            data: frame.data(i).to_vec(),
            stride: frame.stride(i),
        })
        .collect();
    DecodedPicture {
        width: frame.width(),
        height: frame.height(),
        format: pixel_format(frame.format()),
        planes,
        pts: frame.pts(),
        best_effort_timestamp: frame.timestamp(),
    }
}

fn to_audio(frame: &ffmpeg::frame::Audio) -> DecodedAudio {
    let (format, planar) = sample_format(frame.format());
    let channels = frame.channels();
    let per_plane = if planar {
        frame.samples() * format.bytes_per_sample()
    } else {
        frame.samples() * format.bytes_per_sample() * channels as usize
    };
    let plane_count = if planar { channels as usize } else { 1 };
    // Plane buffers are padded past the last sample
    let planes = (0..plane_count)
        .map(|i| {
            let data = frame.data(i);
            data[..per_plane.min(data.len())].to_vec()
        })
        .collect();
    DecodedAudio {
        format,
        planar,
        channels,
        sample_rate: frame.rate(),
        nb_samples: frame.samples(),
        planes,
        pts: frame.pts(),
        best_effort_timestamp: frame.timestamp(),
    }
}

/// Joins the frames one packet decoded to; keeps the first timestamp
fn concat_audio(mut frames: VecDeque<DecodedAudio>) -> Option<DecodedAudio> {
    let mut first = frames.pop_front()?;
    for frame in frames {
        if frame.format != first.format || frame.channels != first.channels || frame.planar != first.planar {
            tracing::warn!("audio format changed inside a packet, tail dropped");
            break;
        }
        for (dst, src) in first.planes.iter_mut().zip(frame.planes) {
            dst.extend_from_slice(&src);
        }
        first.nb_samples += frame.nb_samples;
    }
    Some(first)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn planar_f32_stereo(value: f32, frames: usize, rate: u32) -> DecodedAudio {
        let plane = value.to_ne_bytes().repeat(frames);
        DecodedAudio {
            format: SampleFormat::F32,
            planar: true,
            channels: 2,
            sample_rate: rate,
            nb_samples: frames,
            planes: vec![plane.clone(), plane],
            pts: None,
            best_effort_timestamp: None,
        }
    }

    #[test]
    fn test_index_entry_flags() {
        let key = index_entry(3_000, ffmpeg::ffi::AVINDEX_KEYFRAME as i32);
        assert!(key.keyframe && !key.discard);
        assert_eq!(key.timestamp, 3_000);

        let dropped = index_entry(0, (ffmpeg::ffi::AVINDEX_KEYFRAME | ffmpeg::ffi::AVINDEX_DISCARD_FRAME) as i32);
        assert!(dropped.keyframe && dropped.discard);

        let inter = index_entry(3_512, 0);
        assert!(!inter.keyframe && !inter.discard);
    }

    #[test]
    fn test_sample_format_mapping() {
        for format in [SampleFormat::U8, SampleFormat::S16, SampleFormat::S32, SampleFormat::F32, SampleFormat::F64] {
            for planar in [false, true] {
                assert_eq!(sample_format(to_ffmpeg_sample(format, planar)), (format, planar));
            }
        }
    }

    #[test]
    fn test_swr_converts_to_output_layout() {
        let target = AudioFormat::default();
        let mut resampler = SwrResampler::new(target);

        let mut pcm = Vec::new();
        for _ in 0..10 {
            pcm.extend(resampler.convert(&planar_f32_stereo(0.5, 4_800, 48_000)));
        }
        // One second in, close to one second out once the filter has primed
        assert_eq!(pcm.len() % 2, 0);
        let frames = pcm.len() / 2;
        assert!(frames > 43_000 && frames <= 44_100, "got {frames} frames");
        let middle = &pcm[pcm.len() / 2..pcm.len() / 2 + 2];
        assert!(middle.iter().all(|s| (*s - 16_384).abs() < 200), "got {middle:?}");

        resampler.reset();
        assert!(!resampler.convert(&planar_f32_stereo(0.5, 4_800, 48_000)).is_empty());
    }
}
