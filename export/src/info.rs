//! Plain text dump of a stream's contents.
//!
//! Level 1 prints the file header and a closing inventory; level 2 adds
//! every format and color envelope as it appears; level 3 and up prints
//! each data envelope with its timestamp and size.

use std::{collections::BTreeMap, io::Write};

use kinescope_bus::{Buffer, BusError};
use kinescope_common::{
    AudioDataHeader, AudioFormat, ColorCorrection, StreamId, StreamInfo, Tag, VideoDataHeader,
    VideoFormat, AUDIO_DATA_HEADER_SIZE, VIDEO_DATA_HEADER_SIZE,
};

use crate::ExportError;

#[derive(Debug, Clone, Copy)]
pub struct InfoOptions {
    pub level: u32,
}

#[derive(Default)]
struct Tally {
    packets: u64,
    bytes: u64,
}

/// Drain `from` and print what the stream contains.
pub fn export_info(
    from: &Buffer,
    info: &StreamInfo,
    options: InfoOptions,
    out: &mut impl Write,
) -> Result<(), ExportError> {
    writeln!(out, "stream information")?;
    writeln!(out, "  fps      = {}", info.fps)?;
    writeln!(out, "  flags    = {}", info.flags)?;
    writeln!(out, "  pid      = {}", info.pid)?;
    writeln!(out, "  name     = {}", info.name)?;
    writeln!(out, "  date     = {}", info.date)?;

    let mut reader = from.reader();
    let mut video: BTreeMap<StreamId, Tally> = BTreeMap::new();
    let mut audio: BTreeMap<StreamId, Tally> = BTreeMap::new();
    let mut messages = 0u64;

    loop {
        let mut packet = match reader.open() {
            Ok(packet) => packet,
            Err(BusError::Interrupted) => break,
            Err(err) => return Err(err.into()),
        };

        let mut tag = [0u8];
        packet.read(&mut tag)?;
        let tag = Tag::try_from(tag[0])?;
        let data = packet.rest();
        messages += 1;

        match tag {
            Tag::Close => {
                if options.level >= 2 {
                    writeln!(out, "end of stream")?;
                }
                break;
            }
            Tag::VideoFormat => {
                let fmt = VideoFormat::decode(&mut &data[..])?;
                video.entry(fmt.id).or_default();
                if options.level >= 2 {
                    writeln!(
                        out,
                        "video format message\n  stream   = {}\n  format   = {:?}\n  width    = {}\n  height   = {}\n  flags    = 0x{:02x}",
                        fmt.id, fmt.format, fmt.width, fmt.height, fmt.flags
                    )?;
                }
            }
            Tag::AudioFormat => {
                let fmt = AudioFormat::decode(&mut &data[..])?;
                audio.entry(fmt.id).or_default();
                if options.level >= 2 {
                    writeln!(
                        out,
                        "audio format message\n  stream   = {}\n  format   = {:?}\n  rate     = {}\n  channels = {}\n  flags    = 0x{:02x}",
                        fmt.id, fmt.format, fmt.rate, fmt.channels, fmt.flags
                    )?;
                }
            }
            Tag::Color => {
                let msg = ColorCorrection::decode(&mut &data[..])?;
                if options.level >= 2 {
                    writeln!(
                        out,
                        "color message\n  stream   = {}\n  brightness = {}\n  contrast = {}\n  gamma    = {}, {}, {}",
                        msg.id, msg.brightness, msg.contrast, msg.red, msg.green, msg.blue
                    )?;
                }
            }
            Tag::VideoData => {
                let header = VideoDataHeader::decode(&mut &data[..])?;
                let tally = video.entry(header.id).or_default();
                tally.packets += 1;
                tally.bytes += (data.len() - VIDEO_DATA_HEADER_SIZE) as u64;
                if options.level >= 3 {
                    writeln!(
                        out,
                        "video data: stream {}, time {} us, {} bytes",
                        header.id,
                        header.time,
                        data.len() - VIDEO_DATA_HEADER_SIZE
                    )?;
                }
            }
            Tag::AudioData => {
                let header = AudioDataHeader::decode(&mut &data[..])?;
                let tally = audio.entry(header.id).or_default();
                tally.packets += 1;
                tally.bytes += (data.len() - AUDIO_DATA_HEADER_SIZE) as u64;
                if options.level >= 3 {
                    writeln!(
                        out,
                        "audio data: stream {}, time {} us, {} bytes",
                        header.id,
                        header.time,
                        data.len() - AUDIO_DATA_HEADER_SIZE
                    )?;
                }
            }
            Tag::Lzo | Tag::QuickLz | Tag::Container => {
                if options.level >= 3 {
                    writeln!(out, "compressed envelope: {} bytes", data.len())?;
                }
            }
        }
    }

    writeln!(out, "{} messages", messages)?;
    for (id, tally) in &video {
        writeln!(
            out,
            "video stream {}: {} frames, {} bytes",
            id, tally.packets, tally.bytes
        )?;
    }
    for (id, tally) in &audio {
        writeln!(
            out,
            "audio stream {}: {} packets, {} bytes",
            id, tally.packets, tally.bytes
        )?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inventory_counts_frames_per_stream() {
        let bus = Buffer::new(1 << 20);
        let mut writer = bus.writer();

        let mut push = |tag: Tag, payload: &[u8]| {
            let mut packet = writer.open().unwrap();
            packet.write(&[tag as u8]).unwrap();
            packet.write(payload).unwrap();
            packet.close().unwrap();
        };

        let mut fmt = Vec::new();
        VideoFormat {
            id: 1,
            flags: 0,
            width: 2,
            height: 2,
            format: kinescope_common::VideoPixelFormat::Bgr,
        }
        .encode(&mut fmt);
        push(Tag::VideoFormat, &fmt);

        for n in 0..3u64 {
            let mut frame = Vec::new();
            VideoDataHeader { id: 1, time: n }.encode(&mut frame);
            frame.extend([0u8; 12]);
            push(Tag::VideoData, &frame);
        }
        push(Tag::Close, &[]);

        let mut out = Vec::new();
        export_info(
            &bus,
            &StreamInfo::new(30.0),
            InfoOptions { level: 1 },
            &mut out,
        )
        .unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("video stream 1: 3 frames, 36 bytes"));
        assert!(text.contains("5 messages"));
    }
}
