//! Software scaler for packed BGR/BGRA and planar Y'CbCr frames.
//!
//! Video format messages (re)plan the work for a stream; video data
//! messages execute it. Three speeds: a byte packing copy for factor 1.0
//! BGRA, a 2x2 box filter for exactly half size, and precomputed bilinear
//! lookup tables for everything else. An absolute target size letterboxes
//! the scaled picture, clearing luma to 0 and chroma to 128.

use std::{collections::HashMap, sync::Arc};

use kinescope_common::{
    StreamId, Tag, VideoDataHeader, VideoFormat, VideoPixelFormat, VIDEO_DATA_HEADER_SIZE,
    VIDEO_DWORD_ALIGNED, VIDEO_FORMAT_SIZE,
};
use parking_lot::RwLock;

use crate::{PipelineError, Stage, StageCtl};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScaleTarget {
    /// Multiply both dimensions.
    Factor(f64),
    /// Fit into an absolute size, preserving aspect with a letterbox.
    Size(u32, u32),
}

struct Geometry {
    w: usize,
    h: usize,
    sw: usize,
    sh: usize,
    rw: usize,
    rh: usize,
    rx: usize,
    ry: usize,
    bpp: usize,
    row: usize,
    size: usize,
    letterbox: bool,
}

pub(crate) struct ScaleMap {
    pub pos: Vec<u32>,
    pub factor: Vec<f32>,
}

enum Proc {
    Copy,
    RgbConvert,
    RgbHalf,
    RgbMap(ScaleMap),
    YcbcrHalf,
    YcbcrMap(ScaleMap),
}

struct StreamScale {
    geo: Geometry,
    proc_: Proc,
    outgoing: VideoFormat,
}

pub struct Scale {
    target: ScaleTarget,
    streams: RwLock<HashMap<StreamId, Arc<StreamScale>>>,
}

#[derive(Default)]
pub struct ScaleWorker {
    current: Option<Arc<StreamScale>>,
    pending_format: Option<VideoFormat>,
}

/// Shrink the sample distance until every bilinear lookup stays in bounds.
/// Floating point error accumulates over a row, so the last column would
/// otherwise read one pixel past the source.
pub(crate) fn sample_distance(in_w: usize, in_h: usize, out_w: usize, out_h: usize, r0: u32) -> (f32, u32) {
    let mut r = r0;
    loop {
        let d = (in_w as f32 - r as f32) / out_w as f32;
        r += 1;
        if !(d * (out_h as f32 - 1.0) + 1.0 > in_h as f32
            || d * (out_w as f32 - 1.0) + 1.0 > in_w as f32)
        {
            return (d, r);
        }
    }
}

/// Four source offsets and four weights per output pixel. `stride_x` and
/// `stride_y` turn a source pixel coordinate into a table offset, so the
/// same generator serves byte addressed RGB and plane indexed Y'CbCr.
/// Right and bottom neighbours are clamped to the last column and row; the
/// clamped neighbour always carries a zero weight when it was clamped from
/// an exact edge hit.
#[allow(clippy::too_many_arguments)]
fn generate_map(
    out_w: usize,
    out_h: usize,
    in_w: usize,
    in_h: usize,
    d: f32,
    stride_x: usize,
    stride_y: usize,
    pos: &mut Vec<u32>,
    factor: &mut Vec<f32>,
) {
    let mut ofy = 0f32;
    for y in 0..out_h {
        let mut ofx = 0f32;
        for x in 0..out_w {
            let ix = (ofx as usize).min(in_w - 1);
            let iy = (ofy as usize).min(in_h - 1);
            let ix1 = (ix + 1).min(in_w - 1);
            let iy1 = (iy + 1).min(in_h - 1);

            pos.push((ix * stride_x + iy * stride_y) as u32);
            pos.push((ix1 * stride_x + iy * stride_y) as u32);
            pos.push((ix * stride_x + iy1 * stride_y) as u32);
            pos.push((ix1 * stride_x + iy1 * stride_y) as u32);

            let fx1 = x as f32 * d - ix as f32;
            let fx0 = 1.0 - fx1;
            let fy1 = y as f32 * d - iy as f32;
            let fy0 = 1.0 - fy1;

            factor.push(fx0 * fy0);
            factor.push(fx1 * fy0);
            factor.push(fx0 * fy1);
            factor.push(fx1 * fy1);

            ofx += d;
        }
        ofy += d;
    }
}

fn weigh(src: &[u8], pos: &[u32], factor: &[f32], at: usize, channel: usize) -> u8 {
    (src[pos[at] as usize + channel] as f32 * factor[at]
        + src[pos[at + 1] as usize + channel] as f32 * factor[at + 1]
        + src[pos[at + 2] as usize + channel] as f32 * factor[at + 2]
        + src[pos[at + 3] as usize + channel] as f32 * factor[at + 3]
        + 0.5) as u8
}

impl Scale {
    pub fn new(target: ScaleTarget) -> Self {
        Self {
            target,
            streams: RwLock::new(HashMap::new()),
        }
    }

    fn plan(&self, fmt: VideoFormat, previous: Option<&StreamScale>) -> (StreamScale, bool) {
        let (w, h) = (fmt.width as usize, fmt.height as usize);

        let (scale, rw, rh) = match self.target {
            ScaleTarget::Size(tw, th) => {
                let scale = (tw as f64 / w as f64).min(th as f64 / h as f64);
                (scale, tw as usize, th as usize)
            }
            ScaleTarget::Factor(f) => (
                f,
                (f * w as f64) as usize,
                (f * h as f64) as usize,
            ),
        };
        let size_mode = matches!(self.target, ScaleTarget::Size(..));

        let mut geo = Geometry {
            w,
            h,
            sw: (scale * w as f64) as usize,
            sh: (scale * h as f64) as usize,
            rw,
            rh,
            rx: 0,
            ry: 0,
            bpp: fmt.format.bytes_per_pixel(),
            row: fmt.row_stride(),
            size: 0,
            letterbox: size_mode,
        };
        if size_mode {
            geo.rx = (geo.rw - geo.sw.min(geo.rw)) / 2;
            geo.ry = (geo.rh - geo.sh.min(geo.rh)) / 2;
            log::debug!(
                "stream {}: real size is {}x{}, scaled picture starts at {}x{}",
                fmt.id,
                geo.rw,
                geo.rh,
                geo.rx,
                geo.ry
            );
        }

        let mut outgoing = fmt;
        let proc_ = match fmt.format {
            VideoPixelFormat::Bgr | VideoPixelFormat::Bgra => {
                let proc_ = if size_mode {
                    if geo.rw == geo.w && geo.rh == geo.h && fmt.format == VideoPixelFormat::Bgr {
                        Proc::Copy
                    } else {
                        Proc::RgbMap(rgb_map(&geo))
                    }
                } else if scale == 0.5 {
                    log::debug!(
                        "stream {}: scaling RGB data to half-size ({}x{} to {}x{})",
                        fmt.id,
                        geo.w,
                        geo.h,
                        geo.sw,
                        geo.sh
                    );
                    Proc::RgbHalf
                } else if scale == 1.0 && fmt.format == VideoPixelFormat::Bgra {
                    log::debug!("stream {}: converting BGRA to BGR", fmt.id);
                    Proc::RgbConvert
                } else if scale != 1.0 {
                    log::debug!(
                        "stream {}: scaling RGB data with factor {} ({}x{} to {}x{})",
                        fmt.id,
                        scale,
                        geo.w,
                        geo.h,
                        geo.sw,
                        geo.sh
                    );
                    Proc::RgbMap(rgb_map(&geo))
                } else {
                    Proc::Copy
                };

                // After scaling the data is packed BGR and the source row
                // alignment is gone.
                outgoing.format = VideoPixelFormat::Bgr;
                if !matches!(proc_, Proc::Copy) {
                    outgoing.flags &= !VIDEO_DWORD_ALIGNED;
                }
                outgoing.width = geo.rw as u32;
                outgoing.height = geo.rh as u32;
                geo.size = geo.rw * geo.rh * 3;
                proc_
            }
            VideoPixelFormat::Ycbcr420Jpeg => {
                geo.sw -= geo.sw % 2;
                geo.sh -= geo.sh % 2;
                geo.rw -= geo.rw % 2;
                geo.rh -= geo.rh % 2;
                geo.rx -= geo.rx % 2;
                geo.ry -= geo.ry % 2;
                outgoing.width = geo.rw as u32;
                outgoing.height = geo.rh as u32;
                geo.size = geo.rw * geo.rh + 2 * ((geo.rw / 2) * (geo.rh / 2));

                if size_mode {
                    if geo.rw == geo.w && geo.rh == geo.h {
                        Proc::Copy
                    } else {
                        Proc::YcbcrMap(ycbcr_map(&geo))
                    }
                } else if scale == 0.5 {
                    Proc::YcbcrHalf
                } else if scale != 1.0 {
                    Proc::YcbcrMap(ycbcr_map(&geo))
                } else {
                    Proc::Copy
                }
            }
        };

        // In fixed size mode the output geometry never changes, so a format
        // update that leaves the outgoing descriptor identical does not
        // need to reach downstream at all.
        let skip = size_mode
            && previous.map(|p| p.outgoing == outgoing).unwrap_or(false);

        (
            StreamScale {
                geo,
                proc_,
                outgoing,
            },
            skip,
        )
    }
}

fn rgb_map(geo: &Geometry) -> ScaleMap {
    let (d, _) = sample_distance(geo.w, geo.h, geo.sw, geo.sh, 0);
    let mut pos = Vec::with_capacity(geo.sw * geo.sh * 4);
    let mut factor = Vec::with_capacity(geo.sw * geo.sh * 4);
    generate_map(
        geo.sw, geo.sh, geo.w, geo.h, d, geo.bpp, geo.row, &mut pos, &mut factor,
    );
    ScaleMap { pos, factor }
}

fn ycbcr_map(geo: &Geometry) -> ScaleMap {
    let mut pos = Vec::with_capacity(geo.sw * geo.sh * 4 + (geo.sw / 2) * (geo.sh / 2) * 4);
    let mut factor = Vec::with_capacity(pos.capacity());

    let (d, r) = sample_distance(geo.w, geo.h, geo.sw, geo.sh, 0);
    generate_map(geo.sw, geo.sh, geo.w, geo.h, d, 1, geo.w, &mut pos, &mut factor);

    // The chroma plane has its own smaller table, seeded from the luma
    // search point.
    let (cd, _) = sample_distance(geo.w / 2, geo.h / 2, geo.sw / 2, geo.sh / 2, r.saturating_sub(2));
    generate_map(
        geo.sw / 2,
        geo.sh / 2,
        geo.w / 2,
        geo.h / 2,
        cd,
        1,
        geo.w / 2,
        &mut pos,
        &mut factor,
    );

    ScaleMap { pos, factor }
}

impl StreamScale {
    fn execute(&self, src: &[u8], dst: &mut [u8]) {
        let geo = &self.geo;
        match &self.proc_ {
            Proc::Copy => dst.copy_from_slice(src),
            Proc::RgbConvert => {
                for y in 0..geo.sh {
                    for x in 0..geo.sw {
                        let op = x * geo.bpp + y * geo.row;
                        let tp = (x + y * geo.sw) * 3;
                        dst[tp..tp + 3].copy_from_slice(&src[op..op + 3]);
                    }
                }
            }
            Proc::RgbHalf => {
                let mut tp = 0;
                for oy in (0..geo.h).step_by(2) {
                    for ox in (0..geo.w).step_by(2) {
                        let op1 = ox * geo.bpp + oy * geo.row;
                        let op2 = op1 + geo.bpp;
                        let op3 = op1 + geo.row;
                        let op4 = op2 + geo.row;

                        for c in 0..3 {
                            dst[tp] = ((src[op1 + c] as u32
                                + src[op2 + c] as u32
                                + src[op3 + c] as u32
                                + src[op4 + c] as u32)
                                >> 2) as u8;
                            tp += 1;
                        }
                    }
                }
            }
            Proc::RgbMap(map) => {
                if geo.letterbox {
                    dst.fill(0);
                }
                for y in 0..geo.sh {
                    for x in 0..geo.sw {
                        let sp = (x + y * geo.sw) * 4;
                        let tp = ((x + geo.rx) + (y + geo.ry) * geo.rw) * 3;
                        for c in 0..3 {
                            dst[tp + c] = weigh(src, &map.pos, &map.factor, sp, c);
                        }
                    }
                }
            }
            Proc::YcbcrHalf => ycbcr_half(geo, src, dst),
            Proc::YcbcrMap(map) => ycbcr_scale(geo, map, src, dst),
        }
    }
}

fn ycbcr_half(geo: &Geometry, src: &[u8], dst: &mut [u8]) {
    let (w, h) = (geo.w, geo.h);
    let (sw, sh) = (geo.sw, geo.sh);
    let (cw_from, _ch_from) = (w / 2, h / 2);
    let (cw_to, ch_to) = (sw / 2, sh / 2);

    let (y_from, c_from) = src.split_at(w * h);
    let (cb_from, cr_from) = c_from.split_at(cw_from * (h / 2));

    let (y_to, c_to) = dst.split_at_mut(sw * sh);
    let (cb_to, cr_to) = c_to.split_at_mut(cw_to * ch_to);

    let box_filter = |plane: &[u8], op1: usize, step: usize| -> u8 {
        ((plane[op1] as u32
            + plane[op1 + 1] as u32
            + plane[op1 + step] as u32
            + plane[op1 + step + 1] as u32)
            >> 2) as u8
    };

    let mut tp = 0;
    for y in 0..ch_to {
        for x in 0..cw_to {
            let op = (y * 2) * cw_from + x * 2;
            cb_to[tp] = box_filter(cb_from, op, cw_from);
            cr_to[tp] = box_filter(cr_from, op, cw_from);
            tp += 1;
        }
    }

    let mut tp = 0;
    for y in 0..sh {
        for x in 0..sw {
            let op = (y * 2) * w + x * 2;
            y_to[tp] = box_filter(y_from, op, w);
            tp += 1;
        }
    }
}

fn ycbcr_scale(geo: &Geometry, map: &ScaleMap, src: &[u8], dst: &mut [u8]) {
    let (w, h) = (geo.w, geo.h);
    let (sw, sh) = (geo.sw, geo.sh);
    let (rw, rh) = (geo.rw, geo.rh);
    let (cw, ch) = (sw / 2, sh / 2);

    let (y_from, c_from) = src.split_at(w * h);
    let (cb_from, cr_from) = c_from.split_at((w / 2) * (h / 2));

    let (y_to, c_to) = dst.split_at_mut(rw * rh);
    let (cb_to, cr_to) = c_to.split_at_mut((rw / 2) * (rh / 2));

    if geo.letterbox {
        y_to.fill(0);
        cb_to.fill(128);
        cr_to.fill(128);
    }

    let weigh_plane = |plane: &[u8], at: usize| -> u8 {
        (plane[map.pos[at] as usize] as f32 * map.factor[at]
            + plane[map.pos[at + 1] as usize] as f32 * map.factor[at + 1]
            + plane[map.pos[at + 2] as usize] as f32 * map.factor[at + 2]
            + plane[map.pos[at + 3] as usize] as f32 * map.factor[at + 3]
            + 0.5) as u8
    };

    for y in 0..sh {
        for x in 0..sw {
            let sp = (x + y * sw) * 4;
            y_to[(x + geo.rx) + (y + geo.ry) * rw] = weigh_plane(y_from, sp);
        }
    }

    let cmap = sw * sh * 4;
    for y in 0..ch {
        for x in 0..cw {
            let sp = cmap + (x + y * cw) * 4;
            let tp = (x + geo.rx / 2) + (y + geo.ry / 2) * (rw / 2);
            cb_to[tp] = weigh_plane(cb_from, sp);
            cr_to[tp] = weigh_plane(cr_from, sp);
        }
    }
}

impl Stage for Scale {
    type Worker = ScaleWorker;

    fn name(&self) -> &'static str {
        "scale"
    }

    fn start_worker(&self) -> Result<ScaleWorker, PipelineError> {
        Ok(ScaleWorker::default())
    }

    fn on_read(
        &self,
        ctl: &mut StageCtl,
        data: &[u8],
        worker: &mut ScaleWorker,
    ) -> Result<(), PipelineError> {
        worker.current = None;
        worker.pending_format = None;

        match ctl.tag {
            Tag::VideoFormat => {
                let fmt = VideoFormat::decode(&mut &data[..])?;
                let mut streams = self.streams.write();
                let (stream, skip) = self.plan(fmt, streams.get(&fmt.id).map(Arc::as_ref));
                worker.pending_format = Some(stream.outgoing);
                streams.insert(fmt.id, Arc::new(stream));
                drop(streams);

                if skip {
                    ctl.skip_write();
                } else {
                    ctl.write_size = VIDEO_FORMAT_SIZE;
                }
            }
            Tag::VideoData => {
                let header = VideoDataHeader::decode(&mut &data[..])?;
                let stream = self.streams.read().get(&header.id).cloned();
                match stream {
                    Some(stream) if !matches!(stream.proc_, Proc::Copy) => {
                        ctl.write_size = VIDEO_DATA_HEADER_SIZE + stream.geo.size;
                        worker.current = Some(stream);
                    }
                    _ => ctl.copy(),
                }
            }
            _ => ctl.copy(),
        }
        Ok(())
    }

    fn on_write(
        &self,
        _ctl: &mut StageCtl,
        read: &[u8],
        write: &mut [u8],
        worker: &mut ScaleWorker,
    ) -> Result<(), PipelineError> {
        if let Some(fmt) = worker.pending_format.take() {
            fmt.encode(&mut &mut write[..]);
            return Ok(());
        }

        let stream = worker
            .current
            .take()
            .ok_or(PipelineError::Unsupported("frame for an unknown stream"))?;

        write[..VIDEO_DATA_HEADER_SIZE].copy_from_slice(&read[..VIDEO_DATA_HEADER_SIZE]);
        stream.execute(
            &read[VIDEO_DATA_HEADER_SIZE..],
            &mut write[VIDEO_DATA_HEADER_SIZE..],
        );
        Ok(())
    }

    fn finish(&self, err: Option<&PipelineError>) {
        if let Some(err) = err {
            log::error!("scale: {}", err);
        }
        self.streams.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spawn;
    use kinescope_bus::Buffer;

    fn send_format(bus: &Buffer, fmt: &VideoFormat) {
        let mut writer = bus.writer();
        let mut packet = writer.open().unwrap();
        packet.write(&[Tag::VideoFormat as u8]).unwrap();
        let mut buf = Vec::new();
        fmt.encode(&mut buf);
        packet.write(&buf).unwrap();
        packet.close().unwrap();
    }

    fn send_frame(bus: &Buffer, id: StreamId, time: u64, pixels: &[u8]) {
        let mut writer = bus.writer();
        let mut packet = writer.open().unwrap();
        packet.write(&[Tag::VideoData as u8]).unwrap();
        let mut buf = Vec::new();
        VideoDataHeader { id, time }.encode(&mut buf);
        packet.write(&buf).unwrap();
        packet.write(pixels).unwrap();
        packet.close().unwrap();
    }

    fn send_close(bus: &Buffer) {
        let mut writer = bus.writer();
        let mut packet = writer.open().unwrap();
        packet.write(&[Tag::Close as u8]).unwrap();
        packet.close().unwrap();
    }

    fn recv(bus: &Buffer) -> (Tag, Vec<u8>) {
        let mut reader = bus.reader();
        let mut packet = reader.open().unwrap();
        let mut tag = [0u8];
        packet.read(&mut tag).unwrap();
        (Tag::try_from(tag[0]).unwrap(), packet.rest().to_vec())
    }

    fn run_one_frame(
        target: ScaleTarget,
        fmt: VideoFormat,
        pixels: &[u8],
    ) -> (VideoFormat, Vec<u8>) {
        let from = Buffer::new(8 << 20);
        let to = Buffer::new(8 << 20);
        let process = spawn(Scale::new(target), &from, Some(&to), 2).unwrap();

        send_format(&from, &fmt);
        send_frame(&from, fmt.id, 0, pixels);
        send_close(&from);

        let (tag, data) = recv(&to);
        assert_eq!(tag, Tag::VideoFormat);
        let out_fmt = VideoFormat::decode(&mut &data[..]).unwrap();

        let (tag, data) = recv(&to);
        assert_eq!(tag, Tag::VideoData);

        process.join().unwrap();
        (out_fmt, data[VIDEO_DATA_HEADER_SIZE..].to_vec())
    }

    #[test]
    fn half_scale_of_uniform_block_is_identity() {
        let fmt = VideoFormat {
            id: 1,
            flags: 0,
            width: 320,
            height: 240,
            format: VideoPixelFormat::Bgr,
        };
        let pixels: Vec<u8> = std::iter::repeat([10u8, 20, 30])
            .take(320 * 240)
            .flatten()
            .collect();

        let (out_fmt, out) = run_one_frame(ScaleTarget::Factor(0.5), fmt, &pixels);
        assert_eq!((out_fmt.width, out_fmt.height), (160, 120));
        assert_eq!(out.len(), 160 * 120 * 3);
        for px in out.chunks_exact(3) {
            assert_eq!(px, &[10, 20, 30]);
        }
    }

    #[test]
    fn bgra_packs_to_bgr_at_factor_one() {
        let fmt = VideoFormat {
            id: 1,
            flags: 0,
            width: 4,
            height: 2,
            format: VideoPixelFormat::Bgra,
        };
        let mut pixels = Vec::new();
        for n in 0..8u8 {
            pixels.extend_from_slice(&[n, n + 100, n + 200, 0xaa]);
        }

        let (out_fmt, out) = run_one_frame(ScaleTarget::Factor(1.0), fmt, &pixels);
        assert_eq!(out_fmt.format, VideoPixelFormat::Bgr);
        assert_eq!(out.len(), 4 * 2 * 3);
        for (n, px) in out.chunks_exact(3).enumerate() {
            let n = n as u8;
            assert_eq!(px, &[n, n + 100, n + 200]);
        }
    }

    #[test]
    fn arbitrary_factor_preserves_flat_content() {
        let fmt = VideoFormat {
            id: 1,
            flags: 0,
            width: 100,
            height: 80,
            format: VideoPixelFormat::Bgr,
        };
        let pixels: Vec<u8> = std::iter::repeat([50u8, 60, 70])
            .take(100 * 80)
            .flatten()
            .collect();

        let (out_fmt, out) = run_one_frame(ScaleTarget::Factor(0.75), fmt, &pixels);
        assert_eq!((out_fmt.width, out_fmt.height), (75, 60));
        for px in out.chunks_exact(3) {
            assert_eq!(px, &[50, 60, 70]);
        }
    }

    #[test]
    fn letterbox_clears_luma_and_chroma() {
        let fmt = VideoFormat {
            id: 1,
            flags: 0,
            width: 64,
            height: 64,
            format: VideoPixelFormat::Ycbcr420Jpeg,
        };
        // A uniform gray frame: Y=90, Cb=Cr=110.
        let mut pixels = vec![90u8; 64 * 64];
        pixels.extend(vec![110u8; 2 * 32 * 32]);

        // 128 wide target: a 64 wide picture centered with 32 px bars.
        let (out_fmt, out) = run_one_frame(ScaleTarget::Size(128, 64), fmt, &pixels);
        assert_eq!((out_fmt.width, out_fmt.height), (128, 64));

        let y = &out[..128 * 64];
        // Left bar is cleared luma, the centre keeps the picture.
        assert_eq!(y[0], 0);
        assert_eq!(y[64 * 128 / 2 + 64], 90);

        let cb = &out[128 * 64..128 * 64 + 64 * 32];
        assert_eq!(cb[0], 128);
        assert_eq!(cb[32 * 64 / 2 + 32], 110);
    }

    #[test]
    fn half_scale_of_ycbcr_averages_both_planes() {
        let fmt = VideoFormat {
            id: 1,
            flags: 0,
            width: 8,
            height: 8,
            format: VideoPixelFormat::Ycbcr420Jpeg,
        };
        let mut pixels = vec![100u8; 8 * 8];
        pixels.extend(vec![60u8; 4 * 4]);
        pixels.extend(vec![200u8; 4 * 4]);

        let (out_fmt, out) = run_one_frame(ScaleTarget::Factor(0.5), fmt, &pixels);
        assert_eq!((out_fmt.width, out_fmt.height), (4, 4));
        assert!(out[..16].iter().all(|&y| y == 100));
        assert!(out[16..20].iter().all(|&cb| cb == 60));
        assert!(out[20..24].iter().all(|&cr| cr == 200));
    }

    #[test]
    fn dword_aligned_rows_are_honored_and_dropped() {
        // 3 px wide BGR rows are 9 bytes, padded to 16 with the flag set.
        let fmt = VideoFormat {
            id: 1,
            flags: VIDEO_DWORD_ALIGNED,
            width: 3,
            height: 2,
            format: VideoPixelFormat::Bgra,
        };
        let row = fmt.row_stride();
        assert_eq!(row, 16);

        let mut pixels = vec![0u8; row * 2];
        for y in 0..2 {
            for x in 0..3 {
                let at = y * row + x * 4;
                pixels[at..at + 4].copy_from_slice(&[1, 2, 3, 4]);
            }
        }

        let (out_fmt, out) = run_one_frame(ScaleTarget::Factor(1.0), fmt, &pixels);
        assert_eq!(out_fmt.flags & VIDEO_DWORD_ALIGNED, 0);
        assert_eq!(out.len(), 3 * 2 * 3);
        for px in out.chunks_exact(3) {
            assert_eq!(px, &[1, 2, 3]);
        }
    }

    #[test]
    fn sample_distance_keeps_lookups_in_bounds() {
        for (w, h, sw, sh) in [(320, 240, 213, 160), (100, 80, 75, 60), (8, 8, 3, 3)] {
            let (d, _) = sample_distance(w, h, sw, sh, 0);
            assert!(d * (sw as f32 - 1.0) + 1.0 <= w as f32);
            assert!(d * (sh as f32 - 1.0) + 1.0 <= h as f32);
        }
    }
}
