//! The capture side library.
//!
//! A [`Capture`] owns the process-wide state of an injected capture
//! session: the parsed environment configuration, the buses, the stage
//! workers and the file writer, plus the GL frame capture and the audio
//! hook the interposed entry points call into. It is created at the first
//! intercepted call and torn down at exit; everything flows
//!
//! ```text
//! gl hook ─► [unscaled] ─► scale/ycbcr ─► [uncompressed] ─► pack ─► [compressed] ─► file
//! audio hook ──────────────────────────────┘
//! ```
//!
//! with the optional buses dropped from the chain when no scaling or
//! compression is configured.

mod audio;
mod config;
mod gl;

pub use self::{
    audio::{AudioHook, MmapArea, PcmAccess, PcmId, PcmParams},
    config::{Colorspace, Config, Crop, Hotkey},
    gl::{DrawableId, GlCapture, GlCaptureOptions, GlContext, PboHandle},
};

use std::sync::Arc;

use kinescope_bus::{Buffer, BusError};
use kinescope_common::{init_logger, Session, StreamInfo};
use kinescope_pipeline::{
    spawn, write_end_of_stream, FileWriter, Pack, PipelineError, Process, Scale, ScaleTarget,
    ToYcbcr,
};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("invalid value for {0}: \"{1}\"")]
    InvalidOption(&'static str, String),
    #[error("capture pipeline is not running")]
    NotStarted,
    #[error("stream has not negotiated its format")]
    NotReady,
    #[error("resource busy")]
    Busy,
    #[error("pixel buffer objects unavailable")]
    PboUnavailable,
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

struct Pipeline {
    processes: Vec<Process>,
}

pub struct Capture {
    session: Arc<Session>,
    config: Config,
    /// Raw frames land here; the colorspace or scale stage drains it.
    unscaled: Buffer,
    uncompressed: Buffer,
    compressed: Option<Buffer>,
    gl: GlCapture,
    audio: AudioHook,
    pipeline: Mutex<Option<Pipeline>>,
}

impl Capture {
    pub fn from_env() -> Result<Self, CaptureError> {
        Self::new(Config::from_env()?)
    }

    pub fn new(config: Config) -> Result<Self, CaptureError> {
        // The host may have installed its own logger; that is fine, ours
        // is best effort.
        let _ = init_logger(config.log_level, config.log_file.as_deref());

        let session = Arc::new(Session::new());

        // Readback is BGRA, so the video always passes a processing stage:
        // either the colorspace conversion or the scaler, which also packs
        // factor 1.0 frames down to BGR.
        let uncompressed = Buffer::new(config.uncompressed_size);
        let unscaled = Buffer::new(config.unscaled_size);
        let compressed = config.compress.map(|_| Buffer::new(config.compressed_size));

        let gl = GlCapture::new(
            session.clone(),
            unscaled.clone(),
            GlCaptureOptions {
                fps: config.fps,
                format: kinescope_common::VideoPixelFormat::Bgra,
                pack_alignment: if config.dword_aligned { 8 } else { 1 },
                front: config.capture_front,
                crop: config.crop,
                lock_fps: config.lock_fps,
                ignore_time: false,
                try_pbo: config.try_pbo,
                indicator: config.indicator,
            },
        );
        let audio = AudioHook::new(session.clone(), config.audio_skip);

        Ok(Self {
            session,
            config,
            unscaled,
            uncompressed,
            compressed,
            gl,
            audio,
            pipeline: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn gl(&self) -> &GlCapture {
        &self.gl
    }

    pub fn audio(&self) -> &AudioHook {
        &self.audio
    }

    /// Present hook convenience.
    pub fn frame(&self, ctx: &dyn GlContext, drawable: DrawableId) -> Result<(), CaptureError> {
        self.gl.frame(ctx, drawable)
    }

    fn start_pipeline(&self) -> Result<(), CaptureError> {
        let mut pipeline = self.pipeline.lock();
        if pipeline.is_some() {
            return Ok(());
        }

        log::info!("starting capture to {:?}", self.config.file);

        let info = StreamInfo::new(self.config.fps);
        let sink = self.compressed.as_ref().unwrap_or(&self.uncompressed);
        let file = FileWriter::create(&self.config.file, &info)?;

        let mut processes = vec![spawn(file, sink, None, 1)?];

        if let Some(codec) = self.config.compress {
            processes.push(spawn(
                Pack::new(codec),
                &self.uncompressed,
                self.compressed.as_ref(),
                0,
            )?);
        }

        let process = match self.config.colorspace {
            Colorspace::Ycbcr420Jpeg => spawn(
                ToYcbcr::new(self.config.scale),
                &self.unscaled,
                Some(&self.uncompressed),
                0,
            )?,
            Colorspace::Bgr => spawn(
                Scale::new(ScaleTarget::Factor(self.config.scale)),
                &self.unscaled,
                Some(&self.uncompressed),
                0,
            )?,
        };
        processes.push(process);

        if self.config.audio {
            self.audio.start(&self.uncompressed)?;
        }

        *pipeline = Some(Pipeline { processes });
        Ok(())
    }

    /// Begin capturing. The pipeline is brought up on the first call.
    pub fn start(&self) -> Result<(), CaptureError> {
        self.start_pipeline()?;
        self.gl.start();
        Ok(())
    }

    pub fn stop(&self) {
        self.gl.stop();
    }

    /// What the interposer's SIGINT/SIGHUP/SIGTERM trap invokes: stop
    /// feeding the pipeline and poison the session so blocked workers
    /// unwind. The at-exit shutdown still runs and closes the file.
    pub fn interrupt(&self) {
        self.gl.stop();
        self.session.cancel();
    }

    /// Hotkey toggle, wired up by whoever watches the input.
    pub fn toggle(&self) -> Result<(), CaptureError> {
        if self.gl.is_capturing() {
            self.stop();
            Ok(())
        } else {
            self.start()
        }
    }

    /// Stop everything, write the end of stream envelope and wait for the
    /// compressor and file writer to drain, leaving a valid file on disk.
    pub fn shutdown(&self) -> Result<(), CaptureError> {
        self.gl.stop();
        self.audio.shutdown();

        let Some(pipeline) = self.pipeline.lock().take() else {
            return Ok(());
        };

        match write_end_of_stream(&self.unscaled) {
            Ok(()) | Err(BusError::Interrupted) => (),
            Err(err) => return Err(err.into()),
        }

        let mut first_err = None;
        for process in pipeline.processes {
            if let Err(err) = process.join() {
                log::error!("capture pipeline: {}", err);
                first_err.get_or_insert(err);
            }
        }

        log::info!("capture finished");
        match first_err {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }
}

static CONTEXT: OnceCell<Capture> = OnceCell::new();

/// Process-wide capture context for a real interposer: created from the
/// environment at the first intercepted call, started immediately when so
/// configured.
pub fn init() -> Result<&'static Capture, CaptureError> {
    CONTEXT.get_or_try_init(|| {
        let capture = Capture::from_env()?;
        if capture.config().start {
            capture.start()?;
        }
        Ok(capture)
    })
}

pub fn context() -> Option<&'static Capture> {
    CONTEXT.get()
}
