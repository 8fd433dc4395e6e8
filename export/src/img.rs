//! Per frame BMP/PNG export.
//!
//! Frames are exported at the nominal rate: when the stream has a gap the
//! previous frame is written again so the numbering stays a timeline.

use kinescope_bus::{Buffer, BusError};
use kinescope_common::{
    Tag, VideoDataHeader, VideoFormat, VideoPixelFormat, VIDEO_DATA_HEADER_SIZE,
};

use crate::{pattern_path, ExportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Bmp,
    Png,
}

#[derive(Debug, Clone)]
pub struct ImgOptions {
    pub kind: ImageKind,
    /// Filename pattern with a `%d` frame counter.
    pub pattern: String,
    pub fps: f64,
}

/// Drain `from`, writing one image per frame interval. Returns the number
/// of images written.
pub fn export_images(from: &Buffer, options: &ImgOptions) -> Result<usize, ExportError> {
    let mut reader = from.reader();
    let mut stream: Option<VideoFormat> = None;
    let mut prev: Option<Vec<u8>> = None;
    let mut time = 0u64;
    let mut count = 0usize;
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
                // Export follows the first video stream in the file.
                if stream.map(|s| s.id != fmt.id).unwrap_or(false) {
                    continue;
                }
                if fmt.format != VideoPixelFormat::Bgr {
                    return Err(ExportError::Unsupported("image export needs BGR frames"));
                }
                stream = Some(fmt);
            }
            Tag::VideoData => {
                let data = packet.rest();
                let header = VideoDataHeader::decode(&mut &data[..])?;
                let Some(fmt) = stream else { continue };
                if header.id != fmt.id {
                    continue;
                }

                let rgb = bgr_to_rgb_rows(&fmt, &data[VIDEO_DATA_HEADER_SIZE..]);

                if time < header.time {
                    while time + interval < header.time {
                        if let Some(prev) = &prev {
                            write_image(options, count, &fmt, prev)?;
                            count += 1;
                        }
                        time += interval;
                    }
                    write_image(options, count, &fmt, &rgb)?;
                    count += 1;
                    time += interval;
                }
                prev = Some(rgb);
            }
            _ => (),
        }
    }

    log::info!("{} images written", count);
    Ok(count)
}

/// Bottom first BGR with stride into tight top first RGB.
fn bgr_to_rgb_rows(fmt: &VideoFormat, data: &[u8]) -> Vec<u8> {
    let (w, h) = (fmt.width as usize, fmt.height as usize);
    let row = fmt.row_stride();
    let mut rgb = Vec::with_capacity(w * h * 3);

    for y in 0..h {
        let src = (h - 1 - y) * row;
        for x in 0..w {
            let at = src + x * 3;
            rgb.push(data[at + 2]);
            rgb.push(data[at + 1]);
            rgb.push(data[at]);
        }
    }
    rgb
}

fn write_image(
    options: &ImgOptions,
    n: usize,
    fmt: &VideoFormat,
    rgb: &[u8],
) -> Result<(), ExportError> {
    let path = pattern_path(&options.pattern, n);
    let format = match options.kind {
        ImageKind::Bmp => image::ImageFormat::Bmp,
        ImageKind::Png => image::ImageFormat::Png,
    };

    image::save_buffer_with_format(
        &path,
        rgb,
        fmt.width,
        fmt.height,
        image::ExtendedColorType::Rgb8,
        format,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push(bus: &Buffer, tag: Tag, payload: &[u8]) {
        let mut writer = bus.writer();
        let mut packet = writer.open().unwrap();
        packet.write(&[tag as u8]).unwrap();
        packet.write(payload).unwrap();
        packet.close().unwrap();
    }

    #[test]
    fn frames_become_numbered_images() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = dir.path().join("frame-%d.png");
        let bus = Buffer::new(1 << 20);

        let fmt = VideoFormat {
            id: 1,
            flags: 0,
            width: 4,
            height: 2,
            format: VideoPixelFormat::Bgr,
        };
        let mut buf = Vec::new();
        fmt.encode(&mut buf);
        push(&bus, Tag::VideoFormat, &buf);

        for (n, time) in [(10u8, 33_000u64), (20, 66_000)] {
            let mut buf = Vec::new();
            VideoDataHeader { id: 1, time }.encode(&mut buf);
            buf.extend(vec![n; 4 * 2 * 3]);
            push(&bus, Tag::VideoData, &buf);
        }
        push(&bus, Tag::Close, &[]);

        let count = export_images(
            &bus,
            &ImgOptions {
                kind: ImageKind::Png,
                pattern: pattern.to_str().unwrap().to_owned(),
                fps: 30.0,
            },
        )
        .unwrap();

        assert_eq!(count, 2);
        let first = image::open(dir.path().join("frame-00000000.png")).unwrap();
        assert_eq!(first.width(), 4);
        assert_eq!(first.to_rgb8().get_pixel(0, 0).0, [10, 10, 10]);
    }

    #[test]
    fn gaps_duplicate_the_previous_frame() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = dir.path().join("f%d.bmp");
        let bus = Buffer::new(1 << 20);

        let fmt = VideoFormat {
            id: 1,
            flags: 0,
            width: 2,
            height: 2,
            format: VideoPixelFormat::Bgr,
        };
        let mut buf = Vec::new();
        fmt.encode(&mut buf);
        push(&bus, Tag::VideoFormat, &buf);

        // Two frames 4 intervals apart at 30 fps.
        for (n, time) in [(1u8, 33_000u64), (2, 166_000)] {
            let mut buf = Vec::new();
            VideoDataHeader { id: 1, time }.encode(&mut buf);
            buf.extend(vec![n; 2 * 2 * 3]);
            push(&bus, Tag::VideoData, &buf);
        }
        push(&bus, Tag::Close, &[]);

        let count = export_images(
            &bus,
            &ImgOptions {
                kind: ImageKind::Bmp,
                pattern: pattern.to_str().unwrap().to_owned(),
                fps: 30.0,
            },
        )
        .unwrap();

        assert!(count > 2, "duplicates expected, got {}", count);
    }
}
