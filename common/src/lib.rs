mod logger;
mod messages;
mod session;
mod stream;

pub use self::{
    logger::{init_logger, LoggerInitError},
    messages::{
        AudioDataHeader, AudioFormat, AudioSampleFormat, CodecHeader, ColorCorrection,
        ContainerHeader, Tag, VideoDataHeader, VideoFormat, VideoPixelFormat,
        AUDIO_DATA_HEADER_SIZE, AUDIO_FORMAT_SIZE, AUDIO_INTERLEAVED, CODEC_HEADER_SIZE,
        COLOR_CORRECTION_SIZE, CONTAINER_HEADER_SIZE, MESSAGE_HEADER_SIZE, VIDEO_DATA_HEADER_SIZE,
        VIDEO_DWORD_ALIGNED, VIDEO_FORMAT_SIZE,
    },
    session::{Clock, Session},
    stream::{StreamInfo, SIGNATURE, VERSION},
};

use thiserror::Error;

/// Stream identifier carried in every video and audio payload.
pub type StreamId = u32;

#[derive(Error, Debug)]
pub enum FormatError {
    #[error("unknown message tag 0x{0:02x}")]
    UnknownTag(u8),
    #[error("unknown pixel format {0}")]
    UnknownPixelFormat(u8),
    #[error("unknown sample format {0}")]
    UnknownSampleFormat(u8),
    #[error("message payload is truncated")]
    Truncated,
    #[error("stream signature 0x{0:08x} does not match")]
    BadSignature(u32),
    #[error("unsupported stream version {0}")]
    BadVersion(u32),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}
