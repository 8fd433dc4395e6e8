//! Raw YUV4MPEG2 export.
//!
//! The stream must already be planar 4:2:0; the player inserts the
//! colorspace stage ahead of this sink. Output is paced to the nominal
//! frame rate, duplicating the previous picture across capture gaps so
//! the file plays back in real time.

use std::{
    fs::File,
    io::{BufWriter, Write},
};

use kinescope_bus::{Buffer, BusError};
use kinescope_common::{
    Tag, VideoDataHeader, VideoFormat, VideoPixelFormat, VIDEO_DATA_HEADER_SIZE,
};

use crate::{pattern_path, ExportError};

#[derive(Debug, Clone)]
pub struct Y4mOptions {
    /// Filename pattern with a `%d` file counter; a new file starts on
    /// every stream format change.
    pub pattern: String,
    pub fps: f64,
}

/// Render the frame rate as the `p:q` rational the header wants.
fn fps_rational(fps: f64) -> (u32, u32) {
    let mut q = 1u32;
    loop {
        let p = (q as f64 * fps).round();
        if (p / q as f64 - fps).abs() < f64::EPSILON || q >= 1000 {
            return (p as u32, q);
        }
        q *= 10;
    }
}

struct Output {
    to: BufWriter<File>,
    size: usize,
    prev: Vec<u8>,
    time: u64,
}

/// Drain `from` into YUV4MPEG files. Returns the number of frames written.
pub fn export_yuv4mpeg(from: &Buffer, options: &Y4mOptions) -> Result<usize, ExportError> {
    let mut reader = from.reader();
    let mut output: Option<Output> = None;
    let mut stream_id = None;
    let mut file_count = 0usize;
    let mut frames = 0usize;
    let interval = (1_000_000.0 / options.fps.max(1.0)) as u64;

    loop {
        let mut packet = match reader.open() {
            Ok(packet) => packet,
            Err(BusError::Interrupted) => break,
            Err(err) => return Err(err.into()),
        };

        let mut tag = [0u8];
        packet.read(&mut tag)?;
        match Tag::try_from(tag[0])? {
            Tag::Close => break,
            Tag::VideoFormat => {
                let fmt = VideoFormat::decode(&mut packet.rest())?;
                if *stream_id.get_or_insert(fmt.id) != fmt.id {
                    continue;
                }
                if fmt.format != VideoPixelFormat::Ycbcr420Jpeg {
                    return Err(ExportError::Unsupported(
                        "yuv4mpeg export needs 4:2:0 planar frames",
                    ));
                }

                let path = pattern_path(&options.pattern, file_count);
                log::info!("opening {:?} for writing", path);
                file_count += 1;

                let (w, h) = (fmt.width as usize, fmt.height as usize);
                let size = w * h + (w * h) / 2;
                let mut to = BufWriter::new(File::create(path)?);

                let (p, q) = fps_rational(options.fps);
                writeln!(to, "YUV4MPEG2 W{} H{} F{}:{} Ip", w, h, p, q)?;

                // The filler picture: black luma, neutral chroma.
                let mut prev = vec![0u8; size];
                prev[w * h..].fill(128);

                output = Some(Output {
                    to,
                    size,
                    prev,
                    time: 0,
                });
            }
            Tag::VideoData => {
                let data = packet.rest();
                let header = VideoDataHeader::decode(&mut &data[..])?;
                let Some(out) = output.as_mut() else { continue };
                if Some(header.id) != stream_id {
                    continue;
                }

                let picture = &data[VIDEO_DATA_HEADER_SIZE..];
                if picture.len() != out.size {
                    return Err(ExportError::Unsupported("frame size does not match format"));
                }

                if out.time < header.time {
                    while out.time + interval < header.time {
                        write_picture(&mut out.to, &out.prev)?;
                        frames += 1;
                        out.time += interval;
                    }
                    write_picture(&mut out.to, picture)?;
                    frames += 1;
                    out.time += interval;
                }
                out.prev.copy_from_slice(picture);
            }
            _ => (),
        }
    }

    if let Some(mut out) = output.take() {
        out.to.flush()?;
    }
    log::info!("{} yuv4mpeg frames written", frames);
    Ok(frames)
}

fn write_picture(to: &mut BufWriter<File>, picture: &[u8]) -> Result<(), ExportError> {
    to.write_all(b"FRAME\n")?;
    to.write_all(picture)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fps_rationals() {
        assert_eq!(fps_rational(30.0), (30, 1));
        assert_eq!(fps_rational(29.97), (2997, 100));
        assert_eq!(fps_rational(23.976), (23976, 1000));
    }

    fn push(bus: &Buffer, tag: Tag, payload: &[u8]) {
        let mut writer = bus.writer();
        let mut packet = writer.open().unwrap();
        packet.write(&[tag as u8]).unwrap();
        packet.write(payload).unwrap();
        packet.close().unwrap();
    }

    #[test]
    fn header_and_frames_are_written() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = dir.path().join("out-%d.y4m");
        let bus = Buffer::new(1 << 20);

        let fmt = VideoFormat {
            id: 1,
            flags: 0,
            width: 4,
            height: 4,
            format: VideoPixelFormat::Ycbcr420Jpeg,
        };
        let mut buf = Vec::new();
        fmt.encode(&mut buf);
        push(&bus, Tag::VideoFormat, &buf);

        let mut frame = Vec::new();
        VideoDataHeader {
            id: 1,
            time: 30_000,
        }
        .encode(&mut frame);
        frame.extend(vec![7u8; 16]);
        frame.extend(vec![128u8; 8]);
        push(&bus, Tag::VideoData, &frame);
        push(&bus, Tag::Close, &[]);

        let frames = export_yuv4mpeg(
            &bus,
            &Y4mOptions {
                pattern: pattern.to_str().unwrap().to_owned(),
                fps: 30.0,
            },
        )
        .unwrap();
        assert_eq!(frames, 1);

        let written = std::fs::read(dir.path().join("out-00000000.y4m")).unwrap();
        let text = String::from_utf8_lossy(&written);
        assert!(text.starts_with("YUV4MPEG2 W4 H4 F30:1 Ip\n"));
        assert!(text.contains("FRAME\n"));
        // Header line + one frame of 24 payload bytes.
        assert_eq!(
            written.len(),
            "YUV4MPEG2 W4 H4 F30:1 Ip\n".len() + "FRAME\n".len() + 24
        );
    }
}
