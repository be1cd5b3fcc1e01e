use std::fs::File;
use std::io::{self, BufRead, BufWriter};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use clap::Parser;

use callout_core::announcement::domain::announcement_policy::AnnouncementPolicy;
use callout_core::announcement::domain::announcement_sink::AnnouncementSink;
use callout_core::announcement::domain::cooldown_engine::CooldownEngine;
use callout_core::detection::domain::object_detector::ObjectDetector;
use callout_core::detection::infrastructure::model_resolver;
use callout_core::detection::infrastructure::onnx_yolo_detector::{
    OnnxYoloDetector, DEFAULT_CONFIDENCE,
};
use callout_core::pipeline::detection_cadence_controller::{
    CadenceSettings, DetectionCadenceController,
};
use callout_core::pipeline::live_pipeline::{LivePipeline, LiveSettings};
use callout_core::pipeline::pipeline_control::PipelineControl;
use callout_core::pipeline::pipeline_logger::StdoutPipelineLogger;
use callout_core::pipeline::video_source_controller::{SourceSelector, VideoSourceController};
use callout_core::shared::config::AlertConfig;
use callout_core::speech::infrastructure::command_speech_engine::CommandSpeechEngineFactory;
use callout_core::speech::infrastructure::speech_worker::{SpeechWorker, SpeechWorkerConfig};
use callout_core::video::domain::capture_backend::{CaptureBackend, SourceDescriptor};
use callout_core::video::domain::frame_sink::FrameSink;
use callout_core::video::infrastructure::ffmpeg_capture::FfmpegCaptureBackend;
use callout_core::video::infrastructure::jpeg_frame_sink::{MjpegStreamSink, SnapshotFileSink};

/// Bundled model directory for development checkouts.
const BUNDLED_MODEL_DIR: &str = "models";

/// Watch a camera or video file and announce detected objects out loud.
///
/// While running, commands are read from stdin: `device N`, `file PATH`,
/// `camera`, `detect on|off`, `config`, `devices`, `quit`.
#[derive(Parser)]
#[command(name = "callout")]
struct Cli {
    /// JSON configuration file (defaults to the platform config location).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Camera index to open.
    #[arg(long, conflicts_with = "file")]
    device: Option<u32>,

    /// Video file to loop instead of a camera.
    #[arg(long)]
    file: Option<PathBuf>,

    /// Explicit ONNX model path (skips model resolution).
    #[arg(long)]
    model: Option<PathBuf>,

    /// Minimum detection confidence (0.0-1.0).
    #[arg(long)]
    confidence: Option<f64>,

    /// Seconds between inference cycles.
    #[arg(long)]
    interval: Option<f64>,

    /// Seconds before the same class is announced again.
    #[arg(long)]
    cooldown: Option<f64>,

    /// Only announce these classes (comma-separated).
    #[arg(long, value_delimiter = ',', conflicts_with = "announce_all")]
    announce: Option<Vec<String>>,

    /// Announce every detected class.
    #[arg(long)]
    announce_all: bool,

    /// Times each announcement is spoken.
    #[arg(long)]
    repeat: Option<u32>,

    /// Seconds of silence between repeats.
    #[arg(long)]
    gap: Option<f64>,

    /// Queued announcements at which new ones are dropped.
    #[arg(long)]
    backlog: Option<usize>,

    /// Write an MJPEG stream to this file ("-" for stdout).
    #[arg(long)]
    mjpeg_out: Option<PathBuf>,

    /// Keep this JPEG file updated with the latest annotated frame.
    #[arg(long, conflicts_with = "mjpeg_out")]
    snapshot: Option<PathBuf>,

    /// Stop after emitting this many frames.
    #[arg(long)]
    max_frames: Option<usize>,

    /// List available cameras and exit.
    #[arg(long)]
    list_devices: bool,

    /// Print the effective configuration as JSON and exit.
    #[arg(long)]
    print_config: bool,
}

fn main() {
    env_logger::init();

    if let Err(e) = run() {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = build_config(&cli)?;

    if cli.print_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let backend: Arc<dyn CaptureBackend> = Arc::new(FfmpegCaptureBackend::new());
    if cli.list_devices {
        let devices = backend.probe_devices(config.camera_probe_max);
        if devices.is_empty() {
            println!("No cameras found");
        }
        for index in devices {
            println!("camera {index}");
        }
        return Ok(());
    }

    let frame_sink = build_frame_sink(&cli)?;
    let initial = match &cli.file {
        Some(path) => {
            if !path.is_file() {
                return Err(format!("Video file not found: {}", path.display()).into());
            }
            SourceDescriptor::File(path.clone())
        }
        None => SourceDescriptor::Device(config.camera_index),
    };

    let detector = build_detector(&config)?;

    let factory = CommandSpeechEngineFactory::new(
        config.speech_program.clone(),
        config.speech_args.clone(),
        config.speech_rate,
        config.speech_volume,
    );
    let worker = Arc::new(SpeechWorker::new(
        Arc::new(factory),
        SpeechWorkerConfig::from(&config),
    ));
    worker.start();

    let selector = SourceSelector::new(initial);
    let source = VideoSourceController::new(
        Arc::clone(&backend),
        selector.clone(),
        config.warmup_delay(),
    );
    let cadence = DetectionCadenceController::new(
        detector,
        Arc::new(CooldownEngine::new(config.cooldown())),
        Arc::clone(&worker) as Arc<dyn AnnouncementSink>,
        CadenceSettings::from(&config),
    );
    let control = PipelineControl::new(
        selector,
        cadence.detection_flag(),
        Arc::clone(&backend),
        config.clone(),
    );

    let cancelled = Arc::new(AtomicBool::new(false));
    let ctrlc_flag = Arc::clone(&cancelled);
    ctrlc::set_handler(move || ctrlc_flag.store(true, Ordering::SeqCst))?;
    spawn_control_loop(control, Arc::clone(&cancelled));

    let mut settings = LiveSettings::from(&config);
    settings.max_frames = cli.max_frames;
    log::info!(
        "Announcing {} (cooldown {:.1}s, inference every {:.1}s)",
        config.announcement_policy,
        config.cooldown_secs,
        config.inference_interval_secs
    );

    let mut live = LivePipeline::new(
        source,
        cadence,
        frame_sink,
        Box::new(StdoutPipelineLogger::default()),
        settings,
        Some(cancelled),
    );
    let summary = live.run();

    worker.stop();
    let stats = worker.stats();
    log::info!(
        "Emitted {} frames; speech: {} spoken, {} failed, {} dropped (backlog), {} dropped (worker unavailable)",
        summary.frames,
        stats.completed,
        stats.failed,
        stats.dropped_backlog,
        stats.dropped_unavailable
    );
    if worker.is_degraded() {
        log::warn!("Speech engine was failing when the run ended; check the speech_program setting");
    }
    Ok(())
}

/// File or platform config, then command-line overrides, then validation.
fn build_config(cli: &Cli) -> Result<AlertConfig, Box<dyn std::error::Error>> {
    let mut config = AlertConfig::load_or_default(cli.config.as_deref())?;

    if let Some(device) = cli.device {
        config.camera_index = device;
    }
    if let Some(model) = &cli.model {
        config.model_path = Some(model.clone());
    }
    if let Some(confidence) = cli.confidence {
        config.confidence_threshold = confidence;
    }
    if let Some(interval) = cli.interval {
        config.inference_interval_secs = interval;
    }
    if let Some(cooldown) = cli.cooldown {
        config.cooldown_secs = cooldown;
    }
    if cli.announce_all {
        config.announcement_policy = AnnouncementPolicy::AllClasses;
    } else if let Some(classes) = &cli.announce {
        config.announcement_policy = AnnouncementPolicy::allow_list(
            classes
                .iter()
                .map(|c| c.trim().to_lowercase())
                .filter(|c| !c.is_empty()),
        );
    }
    if let Some(repeat) = cli.repeat {
        config.repeat_count = repeat;
    }
    if let Some(gap) = cli.gap {
        config.repeat_gap_secs = gap;
    }
    if let Some(backlog) = cli.backlog {
        config.backlog_threshold = backlog;
    }

    config.validate()?;
    Ok(config)
}

fn build_frame_sink(cli: &Cli) -> Result<Box<dyn FrameSink>, Box<dyn std::error::Error>> {
    if let Some(path) = &cli.snapshot {
        log::info!("Writing latest frame to {}", path.display());
        return Ok(Box::new(SnapshotFileSink::new(path)));
    }
    match &cli.mjpeg_out {
        Some(path) if path == Path::new("-") => Ok(Box::new(MjpegStreamSink::new(io::stdout()))),
        Some(path) => {
            log::info!(
                "Writing {} stream to {}",
                MjpegStreamSink::<File>::content_type(),
                path.display()
            );
            let file = File::create(path)
                .map_err(|e| format!("Cannot create {}: {e}", path.display()))?;
            Ok(Box::new(MjpegStreamSink::new(BufWriter::new(file))))
        }
        None => Err("An output is required: --mjpeg-out PATH or --snapshot PATH".into()),
    }
}

fn build_detector(config: &AlertConfig) -> Result<Box<dyn ObjectDetector>, Box<dyn std::error::Error>> {
    let model_path = match &config.model_path {
        Some(path) => {
            if !path.is_file() {
                return Err(format!("Model file not found: {}", path.display()).into());
            }
            path.clone()
        }
        None => {
            log::info!("Resolving model: {}", config.model_name);
            let path = model_resolver::resolve(
                &config.model_name,
                config.model_url.as_deref(),
                Some(Path::new(BUNDLED_MODEL_DIR)),
                Some(Box::new(download_progress)),
            )?;
            eprintln!();
            path
        }
    };
    log::info!("Loading model {}", model_path.display());

    // The detector pre-filters loosely; the cadence controller applies the
    // configured threshold.
    let detector_floor = DEFAULT_CONFIDENCE.min(config.confidence_threshold);
    Ok(Box::new(OnnxYoloDetector::new(&model_path, detector_floor)?))
}

#[derive(Debug, PartialEq)]
enum ControlCommand {
    Device(u32),
    File(PathBuf),
    Camera,
    Detect(bool),
    Config,
    Devices,
    Quit,
}

fn parse_command(line: &str) -> Result<ControlCommand, String> {
    let line = line.trim();
    let (verb, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();
    match (verb, rest) {
        ("device", index) => index
            .parse()
            .map(ControlCommand::Device)
            .map_err(|_| format!("expected a camera index, got '{index}'")),
        ("file", "") => Err("usage: file PATH".into()),
        ("file", path) => Ok(ControlCommand::File(PathBuf::from(path))),
        ("camera", "") => Ok(ControlCommand::Camera),
        ("detect", "on") => Ok(ControlCommand::Detect(true)),
        ("detect", "off") => Ok(ControlCommand::Detect(false)),
        ("detect", _) => Err("usage: detect on|off".into()),
        ("config", "") => Ok(ControlCommand::Config),
        ("devices", "") => Ok(ControlCommand::Devices),
        ("quit" | "exit", "") => Ok(ControlCommand::Quit),
        _ => Err(format!("unknown command '{line}'")),
    }
}

/// Reads control commands from stdin until EOF or `quit`.
fn spawn_control_loop(control: PipelineControl, cancelled: Arc<AtomicBool>) {
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }
            match parse_command(&line) {
                Ok(ControlCommand::Quit) => {
                    cancelled.store(true, Ordering::SeqCst);
                    break;
                }
                Ok(command) => execute(&control, command),
                Err(e) => eprintln!("{e}"),
            }
        }
    });
}

fn execute(control: &PipelineControl, command: ControlCommand) {
    let result = match command {
        ControlCommand::Device(index) => control.switch_to_device(index),
        ControlCommand::File(path) => control.switch_to_file(&path),
        ControlCommand::Camera => control.switch_to_camera(),
        ControlCommand::Detect(enabled) => {
            control.set_detection_enabled(enabled);
            Ok(())
        }
        ControlCommand::Config => {
            match serde_json::to_string_pretty(&control.config_snapshot()) {
                Ok(json) => eprintln!("{json}"),
                Err(e) => eprintln!("Cannot serialize configuration: {e}"),
            }
            Ok(())
        }
        ControlCommand::Devices => {
            eprintln!("Available cameras: {:?}", control.available_devices());
            Ok(())
        }
        ControlCommand::Quit => Ok(()),
    };
    match result {
        Ok(()) => eprintln!("Source: {}", control.current_source()),
        Err(e) => eprintln!("{e}"),
    }
}

fn download_progress(downloaded: u64, total: u64) {
    if total > 0 {
        let pct = (downloaded as f64 / total as f64 * 100.0) as u32;
        eprint!("\rDownloading detection model... {pct}%");
    } else {
        eprint!("\rDownloading detection model... {downloaded} bytes");
    }
}
