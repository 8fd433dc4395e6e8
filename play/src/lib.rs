//! Replay: demultiplexing a merged stream into per-id sub buses and the
//! window / PCM sinks that consume them.

mod audio;
mod demux;
mod video;

pub use self::{
    audio::spawn_audio_play,
    demux::{run_demux, DemuxOptions, SinkFactory, SinkHandle},
    video::spawn_video_play,
};

use std::sync::Arc;

use kinescope_bus::{Buffer, BusError};
use kinescope_common::{FormatError, Session, StreamId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlayError {
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error("unsupported stream content: {0}")]
    Unsupported(&'static str),
    #[error(transparent)]
    Window(#[from] minifb::Error),
    #[error(transparent)]
    Pcm(#[from] alsa::Error),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

/// The real playback sinks: one window per video id, one PCM per audio id.
pub struct PlaybackSinks {
    /// Nominal stream rate; frames later than one interval are dropped.
    pub fps: f64,
    /// ALSA playback device name.
    pub device: String,
    /// Audio scheduling slack in microseconds.
    pub silence_threshold: u64,
}

impl Default for PlaybackSinks {
    fn default() -> Self {
        Self {
            fps: 0.0,
            device: "default".to_owned(),
            silence_threshold: 200_000,
        }
    }
}

impl SinkFactory for PlaybackSinks {
    fn video(
        &self,
        session: &Arc<Session>,
        id: StreamId,
        from: Buffer,
    ) -> Result<SinkHandle, PlayError> {
        spawn_video_play(session.clone(), id, from, self.fps)
    }

    fn audio(
        &self,
        session: &Arc<Session>,
        id: StreamId,
        from: Buffer,
    ) -> Result<SinkHandle, PlayError> {
        spawn_audio_play(
            session.clone(),
            id,
            from,
            self.device.clone(),
            self.silence_threshold,
        )
    }
}
