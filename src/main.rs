//! Headless preview player.
//!
//! Loads a project (or builds a synthetic demo one), attaches a recording
//! surface and runs the render loop at 30 Hz, logging shown frames and
//! player events.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;

use reelplay::core::project::{AudioAsset, MediaAsset, Project, TimeRange};
use reelplay::media::surface::RecordingSurface;
use reelplay::media::synthetic::{SyntheticAudio, SyntheticBackend, SyntheticVideo, Waveform};
use reelplay::media::{AudioOutput, MediaBackend, SoftwareAudioOutput};
use reelplay::{logging, PlaybackController, PlayerConfig, PlayerEvent};

const RENDER_INTERVAL: Duration = Duration::from_millis(33);

#[derive(Debug, Parser)]
#[command(name = "reelplay", about = "Headless timeline preview player")]
struct Args {
    /// Project JSON file
    #[arg(long)]
    project: Option<PathBuf>,

    /// Player config JSON file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Seconds of wall time to play
    #[arg(long, default_value_t = 5.0)]
    seconds: f64,

    /// Play a generated demo project instead of real files
    #[arg(long)]
    synthetic: bool,

    /// Seek here before playing
    #[arg(long)]
    seek: Option<f64>,

    /// Play through the default audio device
    #[cfg(feature = "cpal")]
    #[arg(long)]
    device: bool,
}

fn main() -> Result<()> {
    logging::init(logging::DEFAULT_FILTER);
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => PlayerConfig::from_json_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => PlayerConfig::default(),
    };

    let (backend, project) = if args.synthetic {
        synthetic_demo()
    } else {
        let Some(path) = &args.project else {
            bail!("either --project or --synthetic is required");
        };
        let project = Project::from_json_file(path).with_context(|| format!("loading project {}", path.display()))?;
        (file_backend()?, project)
    };

    let output = audio_output(&args, &config)?;
    let surface = RecordingSurface::new();
    let controller = PlaybackController::new(backend, output, Box::new(surface.clone()), config)
        .context("creating playback controller")?;
    let events = controller.events();

    controller.set_project(project)?;
    tracing::info!(duration = controller.duration(), "project loaded");
    controller.attach(1280, 720);
    if let Some(position) = args.seek {
        controller.seek(position);
    }
    controller.play()?;

    let deadline = Instant::now() + Duration::from_secs_f64(args.seconds.max(0.0));
    while Instant::now() < deadline {
        if let Some(frame) = controller.render_tick()? {
            tracing::debug!(timestamp = frame.timestamp, asset = frame.asset_index, "frame");
        }
        for event in events.try_iter() {
            tracing::info!(?event, position = controller.current_time(), "player event");
            if event == PlayerEvent::Ended {
                tracing::info!("reached the end of the project");
            }
        }
        if controller.is_ended() {
            break;
        }
        thread::sleep(RENDER_INTERVAL);
    }

    controller.pause()?;
    tracing::info!(
        position = controller.current_time(),
        frames = surface.uploads().len(),
        "preview finished"
    );
    Ok(())
}

/// Two clips and a looping background track
fn synthetic_demo() -> (Arc<dyn MediaBackend>, Project) {
    let backend = SyntheticBackend::new();
    backend.add_video("intro.mp4", SyntheticVideo::new(3.0, 30).with_gop_size(15));
    backend.add_audio("intro.mp4", SyntheticAudio::new(3.0));
    backend.add_video("main.mp4", SyntheticVideo::new(6.0, 30).with_rotation(90));
    backend.add_audio("main.mp4", SyntheticAudio::new(6.0).with_sample_rate(48_000));
    backend.add_audio("music.mp3", SyntheticAudio::new(2.0).with_waveform(Waveform::Ramp));

    let mut project = Project::with_media_assets(vec![
        MediaAsset::new(1, "intro.mp4"),
        MediaAsset::new(2, "main.mp4").with_clip_range(TimeRange::new(1.0, 4.0)),
    ]);
    let mut music = AudioAsset::new(3, "music.mp3", TimeRange::new(0.0, 7.0));
    music.volume = 0.5;
    music.repeat = true;
    project.audio_assets.push(music);
    (Arc::new(backend), project)
}

#[cfg(feature = "ffmpeg")]
fn file_backend() -> Result<Arc<dyn MediaBackend>> {
    Ok(Arc::new(reelplay::media::ffmpeg::FfmpegBackend::new()?))
}

#[cfg(not(feature = "ffmpeg"))]
fn file_backend() -> Result<Arc<dyn MediaBackend>> {
    bail!("built without the `ffmpeg` feature; use --synthetic")
}

#[cfg(feature = "cpal")]
fn audio_output(args: &Args, config: &PlayerConfig) -> Result<Arc<dyn AudioOutput>> {
    if args.device {
        let output = reelplay::media::cpal_output::CpalAudioOutput::new(config.audio.format)?;
        return Ok(Arc::new(output));
    }
    Ok(Arc::new(SoftwareAudioOutput::new(config.audio.format, config.audio.chunk_samples)?))
}

#[cfg(not(feature = "cpal"))]
fn audio_output(_args: &Args, config: &PlayerConfig) -> Result<Arc<dyn AudioOutput>> {
    Ok(Arc::new(SoftwareAudioOutput::new(config.audio.format, config.audio.chunk_samples)?))
}
