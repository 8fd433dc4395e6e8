//! Window playback for one video stream.
//!
//! Frames arrive as packed BGR with bottom first rows; each one is turned
//! into the window's pixel format and presented against its capture
//! timestamp: early frames sleep until due, late frames are dropped with a
//! log line. The arrow key feeds the fast-forward accumulator, escape and
//! closing the window cancel the whole session.

use std::{sync::Arc, thread, time::Duration};

use kinescope_bus::{Buffer, BusError};
use kinescope_common::{
    Session, StreamId, Tag, VideoDataHeader, VideoFormat, VideoPixelFormat,
    VIDEO_DATA_HEADER_SIZE,
};
use minifb::{Key, KeyRepeat, Window, WindowOptions};

use crate::{PlayError, SinkHandle};

/// How far a key press jumps the stream forward, in microseconds.
const FAST_FORWARD: i64 = 100_000;

pub fn spawn_video_play(
    session: Arc<Session>,
    id: StreamId,
    from: Buffer,
    fps: f64,
) -> Result<SinkHandle, PlayError> {
    SinkHandle::spawn(format!("video-play-{}", id), from.clone(), move || {
        video_play_loop(&session, id, &from, fps)
    })
}

struct Screen {
    window: Window,
    format: VideoFormat,
    pixels: Vec<u32>,
}

impl Screen {
    fn open(id: StreamId, format: VideoFormat) -> Result<Self, PlayError> {
        let (w, h) = (format.width as usize, format.height as usize);
        log::info!("video {}: opening {}x{} window", id, w, h);

        let window = Window::new(
            &format!("kinescope-play (video {})", id),
            w,
            h,
            WindowOptions::default(),
        )?;

        Ok(Self {
            window,
            format,
            pixels: vec![0u32; w * h],
        })
    }

    /// Bottom first BGR rows into the window's top first 0RGB buffer.
    fn unpack(&mut self, data: &[u8]) {
        let (w, h) = (self.format.width as usize, self.format.height as usize);
        let row = self.format.row_stride();

        for y in 0..h {
            let src = (h - 1 - y) * row;
            for x in 0..w {
                let at = src + x * 3;
                let (b, g, r) = (data[at] as u32, data[at + 1] as u32, data[at + 2] as u32);
                self.pixels[y * w + x] = (r << 16) | (g << 8) | b;
            }
        }
    }
}

fn video_play_loop(
    session: &Arc<Session>,
    id: StreamId,
    from: &Buffer,
    fps: f64,
) -> Result<(), PlayError> {
    let mut reader = from.reader();
    let mut screen: Option<Screen> = None;
    let interval = if fps > 0.0 {
        (1_000_000.0 / fps) as u64
    } else {
        0
    };

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
            Tag::VideoFormat => {
                let format = VideoFormat::decode(&mut packet.rest())?;
                if format.id != id {
                    continue;
                }
                if format.format != VideoPixelFormat::Bgr {
                    log::error!("video {}: unsupported playback format", id);
                    return Err(PlayError::Unsupported("window playback needs BGR frames"));
                }

                let reuse = matches!(&screen, Some(s) if s.format == format);
                if !reuse {
                    screen = Some(Screen::open(id, format)?);
                }
            }
            Tag::VideoData => {
                let data = packet.rest();
                let header = VideoDataHeader::decode(&mut &data[..])?;
                if header.id != id {
                    continue;
                }
                let Some(screen) = screen.as_mut() else {
                    log::error!("video {}: frame before stream format", id);
                    return Err(PlayError::Unsupported("frame before stream format"));
                };

                screen.unpack(&data[VIDEO_DATA_HEADER_SIZE..]);

                // Draw first, measure and sleep after.
                let now = session.clock.now();
                if header.time > now {
                    thread::sleep(Duration::from_micros(header.time - now));
                }

                if now > header.time + interval && interval > 0 {
                    log::debug!("video {}: dropped frame", id);
                    // Keep the event pump alive even when not presenting.
                    screen.window.update();
                } else {
                    let (w, h) = (
                        screen.format.width as usize,
                        screen.format.height as usize,
                    );
                    screen.window.update_with_buffer(&screen.pixels, w, h)?;
                }

                if screen.window.is_key_pressed(Key::Right, KeyRepeat::Yes) {
                    session.clock.add_diff(-FAST_FORWARD);
                }
                if screen.window.is_key_down(Key::Escape) || !screen.window.is_open() {
                    session.cancel();
                    return Ok(());
                }
            }
            _ => (),
        }
    }
}
