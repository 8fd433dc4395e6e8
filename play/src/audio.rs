//! PCM playback for one audio stream.
//!
//! Each audio format envelope (re)opens the device with the recorded
//! parameters; sample blocks are paced against their capture timestamps
//! and written interleaved, with planar blocks interleaved on the way out.
//! Xruns are recovered with the usual prepare/resume dance.

use std::{sync::Arc, thread, time::Duration};

use alsa::{
    pcm::{Access, Format, HwParams, PCM},
    Direction, ValueOr,
};
use kinescope_bus::{Buffer, BusError};
use kinescope_common::{
    AudioDataHeader, AudioFormat, AudioSampleFormat, Session, StreamId, Tag,
    AUDIO_DATA_HEADER_SIZE,
};

use crate::{PlayError, SinkHandle};

pub fn spawn_audio_play(
    session: Arc<Session>,
    id: StreamId,
    from: Buffer,
    device: String,
    silence_threshold: u64,
) -> Result<SinkHandle, PlayError> {
    SinkHandle::spawn(format!("audio-play-{}", id), from.clone(), move || {
        audio_play_loop(&session, id, &from, &device, silence_threshold)
    })
}

fn pcm_format(format: AudioSampleFormat) -> Format {
    match format {
        AudioSampleFormat::S16Le => Format::S16LE,
        AudioSampleFormat::S24Le => Format::S24LE,
        AudioSampleFormat::S32Le => Format::S32LE,
    }
}

fn open_device(device: &str, fmt: &AudioFormat) -> Result<PCM, PlayError> {
    let pcm = PCM::new(device, Direction::Playback, false)?;
    {
        let hwp = HwParams::any(&pcm)?;
        hwp.set_access(Access::RWInterleaved)?;
        hwp.set_format(pcm_format(fmt.format))?;
        hwp.set_channels(fmt.channels)?;
        hwp.set_rate(fmt.rate, ValueOr::Nearest)?;
        pcm.hw_params(&hwp)?;
    }

    log::info!(
        "opened pcm {} for playback ({} Hz, {} channels)",
        device,
        fmt.rate,
        fmt.channels
    );
    Ok(pcm)
}

/// Recover from an xrun; anything else is fatal.
fn recover(pcm: &PCM, err: alsa::Error) -> Result<(), PlayError> {
    log::debug!("xrun: {}", err);
    match err.errno().abs() {
        libc::EPIPE => {
            pcm.prepare()?;
            Ok(())
        }
        libc::ESTRPIPE => {
            loop {
                match pcm.resume() {
                    Ok(()) => return Ok(()),
                    Err(err) if err.errno().abs() == libc::EAGAIN => thread::yield_now(),
                    Err(_) => break,
                }
            }
            pcm.prepare()?;
            Ok(())
        }
        _ => Err(err.into()),
    }
}

fn write_frames(pcm: &PCM, fmt: &AudioFormat, data: &[u8]) -> Result<(), PlayError> {
    match fmt.format {
        AudioSampleFormat::S16Le => {
            let samples: Vec<i16> = data
                .chunks_exact(2)
                .map(|b| i16::from_le_bytes([b[0], b[1]]))
                .collect();
            write_loop(pcm, &samples, |pcm, rest| pcm.io_i16().map(|io| io.writei(rest)))
        }
        AudioSampleFormat::S24Le | AudioSampleFormat::S32Le => {
            let samples: Vec<i32> = data
                .chunks_exact(4)
                .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();
            write_loop(pcm, &samples, |pcm, rest| pcm.io_i32().map(|io| io.writei(rest)))
        }
    }
}

fn write_loop<S>(
    pcm: &PCM,
    samples: &[S],
    write: impl Fn(&PCM, &[S]) -> Result<alsa::Result<usize>, alsa::Error>,
) -> Result<(), PlayError> {
    let channels = pcm.hw_params_current()?.get_channels()? as usize;
    let mut written = 0;

    while written < samples.len() {
        match write(pcm, &samples[written..]) {
            Ok(Ok(frames)) => {
                if frames == 0 {
                    break;
                }
                written += frames * channels;
            }
            Ok(Err(err)) | Err(err) => recover(pcm, err)?,
        }
    }
    Ok(())
}

/// Planar channel blocks into one interleaved block.
fn interleave(fmt: &AudioFormat, data: &[u8], out: &mut Vec<u8>) {
    let ssize = fmt.format.bytes_per_sample();
    let channels = fmt.channels as usize;
    let channel_bytes = data.len() / channels.max(1);
    let frames = channel_bytes / ssize.max(1);

    out.clear();
    out.reserve(data.len());
    for f in 0..frames {
        for c in 0..channels {
            let at = c * channel_bytes + f * ssize;
            out.extend_from_slice(&data[at..at + ssize]);
        }
    }
}

fn audio_play_loop(
    session: &Arc<Session>,
    id: StreamId,
    from: &Buffer,
    device: &str,
    silence_threshold: u64,
) -> Result<(), PlayError> {
    let mut reader = from.reader();
    let mut pcm: Option<PCM> = None;
    let mut format: Option<AudioFormat> = None;
    let mut scratch = Vec::new();

    loop {
        let mut packet = match reader.open() {
            Ok(packet) => packet,
            Err(BusError::Interrupted) => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        let mut tag = [0u8];
        packet.read(&mut tag)?;

        match Tag::try_from(tag[0])? {
            Tag::Close => return Ok(()),
            Tag::AudioFormat => {
                let fmt = AudioFormat::decode(&mut packet.rest())?;
                if fmt.id != id {
                    continue;
                }
                // Re-open on every renegotiation so a mid-stream format
                // switch plays on seamlessly.
                pcm = Some(open_device(device, &fmt)?);
                format = Some(fmt);
            }
            Tag::AudioData => {
                let data = packet.rest();
                let header = AudioDataHeader::decode(&mut &data[..])?;
                if header.id != id {
                    continue;
                }
                let (Some(pcm), Some(fmt)) = (pcm.as_ref(), format.as_ref()) else {
                    log::error!("audio {}: samples before stream format", id);
                    return Err(PlayError::Unsupported("samples before stream format"));
                };

                let samples = &data[AUDIO_DATA_HEADER_SIZE..];
                let frames = samples.len() / fmt.bytes_per_frame().max(1);
                let duration = 1_000_000 * frames as u64 / fmt.rate.max(1) as u64;

                let now = session.clock.now();
                if now + silence_threshold + duration < header.time {
                    thread::sleep(Duration::from_micros(header.time - now - duration));
                } else if now > header.time {
                    log::debug!("audio {}: dropped packet", id);
                    continue;
                }

                if fmt.interleaved() {
                    write_frames(pcm, fmt, samples)?;
                } else {
                    interleave(fmt, samples, &mut scratch);
                    write_frames(pcm, fmt, &scratch)?;
                }
            }
            _ => (),
        }
    }
}
