//! Sinks that turn a decoded stream into standard formats: per frame
//! images, WAV audio, YUV4MPEG video and a plain text stream summary.

mod img;
mod info;
mod wav;
mod yuv4mpeg;

pub use self::{
    img::{export_images, ImageKind, ImgOptions},
    info::{export_info, InfoOptions},
    wav::{export_wav, WavOptions},
    yuv4mpeg::{export_yuv4mpeg, Y4mOptions},
};

use kinescope_bus::BusError;
use kinescope_common::FormatError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExportError {
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error("unsupported stream content: {0}")]
    Unsupported(&'static str),
    #[error(transparent)]
    Image(#[from] image::ImageError),
    #[error(transparent)]
    Wav(#[from] hound::Error),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

/// Substitute the frame or file counter into a `%d` filename pattern.
pub(crate) fn pattern_path(pattern: &str, n: usize) -> std::path::PathBuf {
    if pattern.contains("%d") {
        std::path::PathBuf::from(pattern.replace("%d", &format!("{:08}", n)))
    } else {
        std::path::PathBuf::from(pattern)
    }
}
