mod color;
mod file;
mod pack;
mod rgb;
mod scale;
mod worker;
mod ycbcr;

pub use self::{
    color::ColorCorrect,
    file::{write_end_of_stream, FileWriter, StreamSource},
    pack::{Codec, Pack, Unpack, COMPRESS_MIN},
    rgb::ToBgr,
    scale::{Scale, ScaleTarget},
    worker::{spawn, OpenAction, Process, Stage, StageCtl},
    ycbcr::ToYcbcr,
};

use kinescope_bus::BusError;
use kinescope_common::FormatError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("codec failure: {0}")]
    Codec(String),
    #[error("unsupported stream content: {0}")]
    Unsupported(&'static str),
}

impl PipelineError {
    /// Cancellation is clean shutdown for a worker, not a fault.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Bus(BusError::Interrupted))
    }
}
