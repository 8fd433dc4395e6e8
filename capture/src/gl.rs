//! Frame capture from a GL presentation surface.
//!
//! The host calls [`GlCapture::frame`] on its render thread every time it
//! presents. At most one video data envelope is emitted per configured
//! frame interval, and the render thread is never blocked for more than a
//! pixel readback: with a full bus the frame is dropped, and with the
//! async readback path active the GPU transfers pixels into a buffer
//! object while the host keeps rendering.
//!
//! The driver surface is the [`GlContext`] trait; how the real GL entry
//! points are resolved is the interposer's business.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use kinescope_bus::{Buffer, BusError, WriteHandle};
use kinescope_common::{
    ColorCorrection, Session, Tag, VideoDataHeader, VideoFormat, VideoPixelFormat,
    VIDEO_DWORD_ALIGNED,
};
use parking_lot::{Mutex, RwLock};

use crate::{config::Crop, CaptureError};

/// Host-side identifier of a drawable (window, pbuffer).
pub type DrawableId = u64;

/// GPU-resident pixel buffer used for async framebuffer readback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PboHandle(pub u32);

/// The slice of the graphics driver the capture consumes. Implementations
/// wrap a real GL context; tests wrap a framebuffer in memory.
pub trait GlContext {
    /// Current drawable size in pixels.
    fn geometry(&self, drawable: DrawableId) -> (u32, u32);

    /// Synchronous `ReadPixels` of the capture area into `into`, honoring
    /// the row alignment.
    fn read_pixels(
        &self,
        area: (u32, u32, u32, u32),
        format: VideoPixelFormat,
        alignment: u32,
        front: bool,
        into: &mut [u8],
    ) -> Result<(), CaptureError>;

    /// Whether the pixel buffer object extension is usable.
    fn pbo_supported(&self) -> bool {
        false
    }

    fn pbo_create(&self, _size: usize) -> Result<PboHandle, CaptureError> {
        Err(CaptureError::PboUnavailable)
    }

    fn pbo_destroy(&self, _pbo: PboHandle) {}

    /// Schedule an async readback into the buffer object.
    fn pbo_begin_read(
        &self,
        _pbo: PboHandle,
        _area: (u32, u32, u32, u32),
        _format: VideoPixelFormat,
        _alignment: u32,
        _front: bool,
    ) -> Result<(), CaptureError> {
        Err(CaptureError::PboUnavailable)
    }

    /// Map the finished readback and copy it out.
    fn pbo_read(&self, _pbo: PboHandle, _into: &mut [u8]) -> Result<(), CaptureError> {
        Err(CaptureError::PboUnavailable)
    }

    /// Paint the "capturing" indicator square.
    fn draw_indicator(&self, _width: u32, _height: u32) {}

    /// Display gamma for color correction envelopes.
    fn display_gamma(&self, _drawable: DrawableId) -> (f32, f32, f32) {
        (1.0, 1.0, 1.0)
    }
}

pub struct GlCaptureOptions {
    pub fps: f64,
    pub format: VideoPixelFormat,
    pub pack_alignment: u32,
    pub front: bool,
    pub crop: Option<Crop>,
    pub lock_fps: bool,
    pub ignore_time: bool,
    pub try_pbo: bool,
    pub indicator: bool,
}

impl Default for GlCaptureOptions {
    fn default() -> Self {
        Self {
            fps: 30.0,
            format: VideoPixelFormat::Bgra,
            pack_alignment: 8,
            front: true,
            crop: None,
            lock_fps: false,
            ignore_time: false,
            try_pbo: true,
            indicator: false,
        }
    }
}

struct VideoStream {
    id: u32,
    writer: WriteHandle,
    format: Option<VideoFormat>,
    /// Full drawable size.
    w: u32,
    h: u32,
    /// Capture area and row stride after cropping and alignment.
    area: (u32, u32, u32, u32),
    row: usize,
    last: u64,
    gamma: (f32, f32, f32),
    pbo: Option<PboHandle>,
    pbo_active: bool,
    pbo_time: u64,
}

pub struct GlCapture {
    session: Arc<Session>,
    to: Buffer,
    options: GlCaptureOptions,
    interval: u64,
    capturing: AtomicBool,
    refresh_colors: AtomicBool,
    /// Sticky downgrade once the extension probe or a readback fails.
    use_pbo: AtomicBool,
    pbo_probed: AtomicBool,
    dropped: AtomicU64,
    streams: RwLock<HashMap<DrawableId, Mutex<VideoStream>>>,
}

impl GlCapture {
    pub fn new(session: Arc<Session>, to: Buffer, options: GlCaptureOptions) -> Self {
        let interval = (1_000_000.0 / options.fps) as u64;
        log::info!(
            "capturing at {} fps from the {} buffer as {:?}",
            options.fps,
            if options.front { "front" } else { "back" },
            options.format
        );

        Self {
            session,
            to,
            interval,
            options,
            capturing: AtomicBool::new(false),
            refresh_colors: AtomicBool::new(false),
            use_pbo: AtomicBool::new(false),
            pbo_probed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            streams: RwLock::new(HashMap::new()),
        }
    }

    pub fn start(&self) {
        if self.capturing.swap(true, Ordering::SeqCst) {
            log::warn!("capturing is already active");
        } else {
            log::info!("starting capturing");
            self.refresh_colors.store(true, Ordering::SeqCst);
        }
    }

    pub fn stop(&self) {
        if self.capturing.swap(false, Ordering::SeqCst) {
            log::info!("stopping capturing");
        } else {
            log::warn!("capturing is already stopped");
        }
    }

    pub fn is_capturing(&self) -> bool {
        self.capturing.load(Ordering::SeqCst)
    }

    /// Host present hook. Called once per presented frame.
    pub fn frame(&self, ctx: &dyn GlContext, drawable: DrawableId) -> Result<(), CaptureError> {
        if !self.capturing.load(Ordering::SeqCst) {
            return Ok(());
        }

        self.with_stream(drawable, |stream| {
            // A full bus is a dropped frame, never a stall or a fault.
            let result = match self.capture_frame(ctx, drawable, stream) {
                Err(CaptureError::Bus(BusError::Busy)) => {
                    let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    log::info!("dropped frame, buffer not ready ({} so far)", dropped);
                    Ok(())
                }
                other => other,
            };
            if self.options.indicator {
                ctx.draw_indicator(stream.w, stream.h);
            }
            result
        })
    }

    fn with_stream<R>(
        &self,
        drawable: DrawableId,
        body: impl FnOnce(&mut VideoStream) -> R,
    ) -> R {
        {
            let streams = self.streams.read();
            if let Some(stream) = streams.get(&drawable) {
                return body(&mut stream.lock());
            }
        }

        let mut streams = self.streams.write();
        let stream = streams.entry(drawable).or_insert_with(|| {
            Mutex::new(VideoStream {
                id: self.session.next_video_id(),
                writer: self.to.writer(),
                format: None,
                w: 0,
                h: 0,
                area: (0, 0, 0, 0),
                row: 0,
                last: 0,
                gamma: (1.0, 1.0, 1.0),
                pbo: None,
                pbo_active: false,
                pbo_time: 0,
            })
        });
        let mut guard = stream.lock();
        body(&mut guard)
    }

    fn capture_frame(
        &self,
        ctx: &dyn GlContext,
        drawable: DrawableId,
        stream: &mut VideoStream,
    ) -> Result<(), CaptureError> {
        let now = if self.options.ignore_time {
            stream.last + self.interval
        } else {
            self.session.clock.now()
        };

        // Under the configured rate and neither pacing mode active: drop.
        if now.saturating_sub(stream.last) < self.interval
            && !self.options.lock_fps
            && !self.options.ignore_time
        {
            return Ok(());
        }

        self.update_stream(ctx, drawable, stream)?;

        let use_pbo = self.use_pbo.load(Ordering::SeqCst);

        // With the async path we are writing out the previous frame, so
        // the envelope carries the time its readback was scheduled.
        let time = if use_pbo { stream.pbo_time } else { now };

        if use_pbo && !stream.pbo_active {
            match self.start_pbo(ctx, stream) {
                Ok(()) => {
                    stream.pbo_time = now;
                    return Ok(());
                }
                Err(err) => {
                    self.downgrade_pbo(ctx, stream, err);
                    return Ok(());
                }
            }
        }

        let frame_size = stream.row * stream.area.3 as usize;
        let mut packet = if self.options.lock_fps {
            stream.writer.open()?
        } else {
            stream.writer.try_open()?
        };

        packet.write(&[Tag::VideoData as u8])?;
        let mut header = Vec::with_capacity(12);
        VideoDataHeader {
            id: stream.id,
            time,
        }
        .encode(&mut header);
        packet.write(&header)?;

        let dma = packet.dma(frame_size)?;
        let mut schedule_next_pbo = false;
        if use_pbo {
            let pbo = stream.pbo.ok_or(CaptureError::PboUnavailable);
            match pbo.and_then(|pbo| ctx.pbo_read(pbo, dma)) {
                Ok(()) => {
                    stream.pbo_active = false;
                    schedule_next_pbo = true;
                }
                Err(err) => {
                    drop(packet);
                    self.downgrade_pbo(ctx, stream, err);
                    return Ok(());
                }
            }
        } else {
            ctx.read_pixels(
                stream.area,
                self.options.format,
                self.options.pack_alignment,
                self.options.front,
                dma,
            )?;
        }

        if self.options.lock_fps && !self.options.ignore_time {
            let now = self.session.clock.now();
            if now.saturating_sub(stream.last) < self.interval {
                std::thread::sleep(Duration::from_micros(
                    self.interval + stream.last - now,
                ));
            }
        }

        // Advance by exactly one interval, with bounded catch-up so a slow
        // producer snaps back to half an interval behind wall time.
        stream.last += self.interval;
        if !self.options.ignore_time {
            let now = self.session.clock.now();
            if now.saturating_sub(stream.last) > self.interval {
                stream.last = now - self.interval / 2;
            }
        }

        packet.close()?;

        if schedule_next_pbo {
            match self.start_pbo(ctx, stream) {
                Ok(()) => stream.pbo_time = now,
                Err(err) => self.downgrade_pbo(ctx, stream, err),
            }
        }
        Ok(())
    }

    /// First frame and resize handling: recompute the capture geometry and
    /// announce it downstream.
    fn update_stream(
        &self,
        ctx: &dyn GlContext,
        drawable: DrawableId,
        stream: &mut VideoStream,
    ) -> Result<(), CaptureError> {
        if self.options.try_pbo && !self.pbo_probed.swap(true, Ordering::SeqCst) {
            if ctx.pbo_supported() {
                log::info!("using async pixel buffer object readback");
                self.use_pbo.store(true, Ordering::SeqCst);
            } else {
                log::debug!("pixel buffer objects not available");
            }
        }

        let (w, h) = ctx.geometry(drawable);
        let resized = (w, h) != (stream.w, stream.h) || stream.format.is_none();

        if resized {
            stream.w = w;
            stream.h = h;
            stream.area = self.capture_area(w, h);
            stream.row = {
                let mut row =
                    stream.area.2 as usize * self.options.format.bytes_per_pixel();
                let alignment = self.options.pack_alignment as usize;
                if row % alignment != 0 {
                    row += alignment - row % alignment;
                }
                row
            };

            let mut flags = 0;
            if self.options.pack_alignment == 8 {
                flags |= VIDEO_DWORD_ALIGNED;
            }
            let format = VideoFormat {
                id: stream.id,
                flags,
                width: stream.area.2,
                height: stream.area.3,
                format: self.options.format,
            };
            stream.format = Some(format);

            log::info!(
                "video {}: {}x{} ({}x{}), flags 0x{:02x}",
                stream.id,
                stream.area.2,
                stream.area.3,
                w,
                h,
                format.flags
            );

            let mut packet = stream.writer.open()?;
            packet.write(&[Tag::VideoFormat as u8])?;
            let mut buf = Vec::with_capacity(17);
            format.encode(&mut buf);
            packet.write(&buf)?;
            packet.close()?;

            if self.use_pbo.load(Ordering::SeqCst) {
                if let Some(pbo) = stream.pbo.take() {
                    ctx.pbo_destroy(pbo);
                }
                stream.pbo_active = false;
                match ctx.pbo_create(stream.row * stream.area.3 as usize) {
                    Ok(pbo) => stream.pbo = Some(pbo),
                    Err(err) => self.downgrade_pbo(ctx, stream, err),
                }
            }
        }

        if resized || self.refresh_colors.swap(false, Ordering::SeqCst) {
            self.update_color(ctx, drawable, stream)?;
        }

        Ok(())
    }

    fn update_color(
        &self,
        ctx: &dyn GlContext,
        drawable: DrawableId,
        stream: &mut VideoStream,
    ) -> Result<(), CaptureError> {
        let gamma = ctx.display_gamma(drawable);
        if gamma == stream.gamma {
            return Ok(());
        }
        stream.gamma = gamma;

        let msg = ColorCorrection {
            id: stream.id,
            brightness: 0.0,
            contrast: 0.0,
            red: gamma.0,
            green: gamma.1,
            blue: gamma.2,
        };
        log::info!(
            "video {}: color correction red={} green={} blue={}",
            stream.id,
            msg.red,
            msg.green,
            msg.blue
        );

        let mut packet = stream.writer.open()?;
        packet.write(&[Tag::Color as u8])?;
        let mut buf = Vec::with_capacity(24);
        msg.encode(&mut buf);
        packet.write(&buf)?;
        packet.close()?;
        Ok(())
    }

    fn capture_area(&self, w: u32, h: u32) -> (u32, u32, u32, u32) {
        match self.options.crop {
            Some(crop) => {
                let cx = crop.x.min(w);
                let cy = crop.y.min(h);
                let cw = crop.width.min(w - cx);
                let ch = crop.height.min(h - cy);
                // GL counts rows from the bottom.
                (cx, h - ch - cy, cw, ch)
            }
            None => (0, 0, w, h),
        }
    }

    fn start_pbo(&self, ctx: &dyn GlContext, stream: &mut VideoStream) -> Result<(), CaptureError> {
        let pbo = stream.pbo.ok_or(CaptureError::PboUnavailable)?;
        ctx.pbo_begin_read(
            pbo,
            stream.area,
            self.options.format,
            self.options.pack_alignment,
            self.options.front,
        )?;
        stream.pbo_active = true;
        Ok(())
    }

    /// A failing readback path drops us to synchronous `ReadPixels` for the
    /// rest of the session.
    fn downgrade_pbo(&self, ctx: &dyn GlContext, stream: &mut VideoStream, err: CaptureError) {
        if self.use_pbo.swap(false, Ordering::SeqCst) {
            log::warn!("async readback failed ({}), falling back to ReadPixels", err);
        }
        if let Some(pbo) = stream.pbo.take() {
            ctx.pbo_destroy(pbo);
        }
        stream.pbo_active = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kinescope_common::VIDEO_DATA_HEADER_SIZE;
    use std::sync::atomic::AtomicU32;

    /// A 64x32 BGRA framebuffer that fills every readback with a counter.
    struct FakeGl {
        pbo: bool,
        reads: AtomicU32,
        pending: Mutex<Option<u8>>,
    }

    impl FakeGl {
        fn new(pbo: bool) -> Self {
            Self {
                pbo,
                reads: AtomicU32::new(0),
                pending: Mutex::new(None),
            }
        }
    }

    impl GlContext for FakeGl {
        fn geometry(&self, _drawable: DrawableId) -> (u32, u32) {
            (64, 32)
        }

        fn read_pixels(
            &self,
            _area: (u32, u32, u32, u32),
            _format: VideoPixelFormat,
            _alignment: u32,
            _front: bool,
            into: &mut [u8],
        ) -> Result<(), CaptureError> {
            let n = self.reads.fetch_add(1, Ordering::SeqCst);
            into.fill(n as u8);
            Ok(())
        }

        fn pbo_supported(&self) -> bool {
            self.pbo
        }

        fn pbo_create(&self, _size: usize) -> Result<PboHandle, CaptureError> {
            Ok(PboHandle(1))
        }

        fn pbo_begin_read(
            &self,
            _pbo: PboHandle,
            _area: (u32, u32, u32, u32),
            _format: VideoPixelFormat,
            _alignment: u32,
            _front: bool,
        ) -> Result<(), CaptureError> {
            let n = self.reads.fetch_add(1, Ordering::SeqCst);
            *self.pending.lock() = Some(n as u8);
            Ok(())
        }

        fn pbo_read(&self, _pbo: PboHandle, into: &mut [u8]) -> Result<(), CaptureError> {
            let n = self.pending.lock().take().ok_or(CaptureError::PboUnavailable)?;
            into.fill(n);
            Ok(())
        }
    }

    fn capture(options: GlCaptureOptions) -> (Arc<Session>, Buffer, GlCapture) {
        let session = Arc::new(Session::new());
        let bus = Buffer::new(16 << 20);
        let capture = GlCapture::new(session.clone(), bus.clone(), options);
        capture.start();
        (session, bus, capture)
    }

    fn next_message(bus: &Buffer) -> (Tag, Vec<u8>) {
        let mut reader = bus.reader();
        let mut packet = reader.open().unwrap();
        let mut tag = [0u8];
        packet.read(&mut tag).unwrap();
        (Tag::try_from(tag[0]).unwrap(), packet.rest().to_vec())
    }

    #[test]
    fn first_frame_announces_the_stream_format() {
        let (_session, bus, capture) = capture(GlCaptureOptions {
            try_pbo: false,
            ignore_time: true,
            ..Default::default()
        });
        let gl = FakeGl::new(false);

        capture.frame(&gl, 1).unwrap();

        let (tag, data) = next_message(&bus);
        assert_eq!(tag, Tag::VideoFormat);
        let fmt = VideoFormat::decode(&mut &data[..]).unwrap();
        assert_eq!((fmt.width, fmt.height), (64, 32));
        assert_eq!(fmt.format, VideoPixelFormat::Bgra);
        assert_eq!(fmt.flags & VIDEO_DWORD_ALIGNED, VIDEO_DWORD_ALIGNED);

        let (tag, data) = next_message(&bus);
        assert_eq!(tag, Tag::VideoData);
        assert_eq!(data.len(), VIDEO_DATA_HEADER_SIZE + 64 * 4 * 32);
    }

    #[test]
    fn frames_are_paced_to_the_configured_interval() {
        let (session, bus, capture) = capture(GlCaptureOptions {
            try_pbo: false,
            fps: 30.0,
            ..Default::default()
        });
        let gl = FakeGl::new(false);

        // Presents inside the very first interval are dropped.
        capture.frame(&gl, 1).unwrap();
        capture.frame(&gl, 1).unwrap();

        // Move the clock one interval forward; the next present captures.
        session.clock.add_diff(-40_000);
        capture.frame(&gl, 1).unwrap();
        // And immediately after it, drops again.
        capture.frame(&gl, 1).unwrap();

        let mut frames = 0;
        let mut reader = bus.reader();
        while let Some(mut packet) = reader.try_open().unwrap() {
            let mut tag = [0u8];
            packet.read(&mut tag).unwrap();
            if tag[0] == Tag::VideoData as u8 {
                frames += 1;
            }
        }
        assert_eq!(frames, 1);
    }

    #[test]
    fn pbo_frames_carry_the_schedule_timestamp() {
        let (session, bus, capture) = capture(GlCaptureOptions {
            try_pbo: true,
            fps: 30.0,
            ..Default::default()
        });
        let gl = FakeGl::new(true);

        // First eligible present only schedules a readback at T0.
        session.clock.add_diff(-50_000);
        capture.frame(&gl, 1).unwrap();
        let t0 = session.clock.now();

        // Advance well past one interval; the second present emits the
        // frame read back at T0.
        session.clock.add_diff(-50_000);
        capture.frame(&gl, 1).unwrap();

        let (tag, _) = next_message(&bus);
        assert_eq!(tag, Tag::VideoFormat);
        let (tag, data) = next_message(&bus);
        assert_eq!(tag, Tag::VideoData);

        let header = VideoDataHeader::decode(&mut &data[..]).unwrap();
        assert!(
            header.time >= 50_000 && header.time <= t0,
            "timestamp {} outside schedule window ending at {}",
            header.time,
            t0
        );
        // The payload is the first readback, not the second.
        assert_eq!(data[VIDEO_DATA_HEADER_SIZE], 0);
    }

    #[test]
    fn frames_stop_when_capture_is_stopped() {
        let (_session, bus, capture) = capture(GlCaptureOptions {
            try_pbo: false,
            ignore_time: true,
            ..Default::default()
        });
        let gl = FakeGl::new(false);

        capture.frame(&gl, 1).unwrap();
        capture.stop();
        capture.frame(&gl, 1).unwrap();
        capture.frame(&gl, 1).unwrap();

        let mut reader = bus.reader();
        let mut messages = 0;
        while reader.try_open().unwrap().is_some() {
            messages += 1;
        }
        // Format plus exactly one frame.
        assert_eq!(messages, 2);
    }
}
