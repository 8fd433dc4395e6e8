//! Packed BGR/BGRA to planar Y'CbCr 4:2:0 (JPEG range) conversion, with
//! optional scaling folded into the same pass.
//!
//! The JPEG variant coefficients run in 10 bit fixed point; the absolute
//! error against the floating point definition is at most one step in 255.
//! Chroma is derived from the average RGB of each 2x2 luma block, not from
//! the converted luma values. Packed sources store rows bottom first, so
//! conversion also flips the picture into top first plane order.

use std::{collections::HashMap, sync::Arc};

use kinescope_common::{
    StreamId, Tag, VideoDataHeader, VideoFormat, VideoPixelFormat, VIDEO_DATA_HEADER_SIZE,
    VIDEO_DWORD_ALIGNED, VIDEO_FORMAT_SIZE,
};
use parking_lot::RwLock;

use crate::{
    scale::{sample_distance, ScaleMap},
    PipelineError, Stage, StageCtl,
};

#[inline]
fn jpeg_y(r: u32, g: u32, b: u32) -> u8 {
    ((306 * r + 601 * g + 117 * b) >> 10) as u8
}

#[inline]
fn jpeg_cb(r: i32, g: i32, b: i32) -> u8 {
    (128 - ((173 * r + 339 * g - 512 * b) >> 10)).clamp(0, 255) as u8
}

#[inline]
fn jpeg_cr(r: i32, g: i32, b: i32) -> u8 {
    (128 + ((512 * r - 429 * g - 83 * b) >> 10)).clamp(0, 255) as u8
}

enum Convert {
    OneToOne,
    Half,
    Map(ScaleMap),
}

struct StreamConvert {
    h: usize,
    bpp: usize,
    row: usize,
    yw: usize,
    yh: usize,
    cw: usize,
    ch: usize,
    size: usize,
    convert: Convert,
    outgoing: VideoFormat,
}

/// The colorspace stage. `scale` folds a resize into the conversion the
/// way the capture pipeline uses it; 1.0 converts at full size.
pub struct ToYcbcr {
    scale: f64,
    streams: RwLock<HashMap<StreamId, Arc<StreamConvert>>>,
}

#[derive(Default)]
pub struct YcbcrWorker {
    current: Option<Arc<StreamConvert>>,
    pending_format: Option<VideoFormat>,
}

impl ToYcbcr {
    pub fn new(scale: f64) -> Self {
        Self {
            scale,
            streams: RwLock::new(HashMap::new()),
        }
    }

    fn plan(&self, fmt: VideoFormat) -> StreamConvert {
        let bpp = fmt.format.bytes_per_pixel();
        let (w, h) = (fmt.width as usize, fmt.height as usize);
        let row = fmt.row_stride();

        // Even output dimensions are both safer and faster, even if the
        // last odd pixel gets dropped.
        let mut yw = (self.scale * w as f64) as usize;
        let mut yh = (self.scale * h as f64) as usize;
        yw -= yw % 2;
        yh -= yh % 2;
        let (cw, ch) = (yw / 2, yh / 2);

        let mut outgoing = fmt;
        outgoing.flags &= !VIDEO_DWORD_ALIGNED;
        outgoing.format = VideoPixelFormat::Ycbcr420Jpeg;
        outgoing.width = yw as u32;
        outgoing.height = yh as u32;

        let convert = if self.scale == 1.0 {
            Convert::OneToOne
        } else if self.scale == 0.5 {
            log::debug!(
                "stream {}: converting to half-size ({}x{} to {}x{})",
                fmt.id,
                w,
                h,
                yw,
                yh
            );
            Convert::Half
        } else {
            log::debug!(
                "stream {}: converting with factor {} ({}x{} to {}x{})",
                fmt.id,
                self.scale,
                w,
                h,
                yw,
                yh
            );
            Convert::Map(flipped_map(w, h, bpp, row, yw, yh))
        };

        StreamConvert {
            h,
            bpp,
            row,
            yw,
            yh,
            cw,
            ch,
            size: yw * yh + 2 * (cw * ch),
            convert,
            outgoing,
        }
    }
}

/// Bilinear tables addressing the bottom first packed source directly, so
/// the scaled conversion needs no separate flip pass.
fn flipped_map(w: usize, h: usize, bpp: usize, row: usize, yw: usize, yh: usize) -> ScaleMap {
    let mut pos = Vec::with_capacity(yw * yh * 4 + (yw / 2) * (yh / 2) * 4);
    let mut factor = Vec::with_capacity(pos.capacity());

    let (d, r) = sample_distance(w, h, yw, yh, 0);
    push_flipped(w, h, bpp, row, yw, yh, d, &mut pos, &mut factor);

    let (cd, _) = sample_distance(w, h, yw / 2, yh / 2, r.saturating_sub(2));
    push_flipped(w, h, bpp, row, yw / 2, yh / 2, cd, &mut pos, &mut factor);

    ScaleMap { pos, factor }
}

#[allow(clippy::too_many_arguments)]
fn push_flipped(
    w: usize,
    h: usize,
    bpp: usize,
    row: usize,
    out_w: usize,
    out_h: usize,
    d: f32,
    pos: &mut Vec<u32>,
    factor: &mut Vec<f32>,
) {
    let mut ofy = 0f32;
    for y in 0..out_h {
        let mut ofx = 0f32;
        for x in 0..out_w {
            let ix = (ofx as usize).min(w - 1);
            let iy = (ofy as usize).min(h - 1);
            let ix1 = (ix + 1).min(w - 1);
            // Vertical flip happens here: output row y samples source rows
            // counted from the bottom.
            let fy_a = h - 1 - iy;
            let fy_b = h - 1 - (iy + 1).min(h - 1);

            pos.push((ix * bpp + fy_a * row) as u32);
            pos.push((ix1 * bpp + fy_a * row) as u32);
            pos.push((ix * bpp + fy_b * row) as u32);
            pos.push((ix1 * bpp + fy_b * row) as u32);

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

impl StreamConvert {
    fn execute(&self, src: &[u8], dst: &mut [u8]) {
        match &self.convert {
            Convert::OneToOne => self.one_to_one(src, dst),
            Convert::Half => self.half(src, dst),
            Convert::Map(map) => self.scaled(map, src, dst),
        }
    }

    fn one_to_one(&self, src: &[u8], dst: &mut [u8]) {
        let (y_plane, c_planes) = dst.split_at_mut(self.yw * self.yh);
        let (cb_plane, cr_plane) = c_planes.split_at_mut(self.cw * self.ch);

        let mut cpix = 0;
        for yy in (0..self.yh).step_by(2) {
            // Source rows are bottom first; output row 0 comes from the top
            // of the picture.
            let oy = (self.h - 2 - yy) * self.row;
            for yx in (0..self.yw).step_by(2) {
                let op1 = yx * self.bpp + oy;
                let op2 = op1 + self.bpp;
                let op3 = op1 + self.row;
                let op4 = op2 + self.row;

                let r = (src[op1 + 2] as u32
                    + src[op2 + 2] as u32
                    + src[op3 + 2] as u32
                    + src[op4 + 2] as u32)
                    >> 2;
                let g = (src[op1 + 1] as u32
                    + src[op2 + 1] as u32
                    + src[op3 + 1] as u32
                    + src[op4 + 1] as u32)
                    >> 2;
                let b = (src[op1] as u32 + src[op2] as u32 + src[op3] as u32 + src[op4] as u32) >> 2;

                cb_plane[cpix] = jpeg_cb(r as i32, g as i32, b as i32);
                cr_plane[cpix] = jpeg_cr(r as i32, g as i32, b as i32);
                cpix += 1;

                let ypix = yx + yy * self.yw;
                y_plane[ypix] = jpeg_y(src[op3 + 2] as u32, src[op3 + 1] as u32, src[op3] as u32);
                y_plane[ypix + 1] =
                    jpeg_y(src[op4 + 2] as u32, src[op4 + 1] as u32, src[op4] as u32);
                y_plane[ypix + self.yw] =
                    jpeg_y(src[op1 + 2] as u32, src[op1 + 1] as u32, src[op1] as u32);
                y_plane[ypix + 1 + self.yw] =
                    jpeg_y(src[op2 + 2] as u32, src[op2 + 1] as u32, src[op2] as u32);
            }
        }
    }

    fn half(&self, src: &[u8], dst: &mut [u8]) {
        let (y_plane, c_planes) = dst.split_at_mut(self.yw * self.yh);
        let (cb_plane, cr_plane) = c_planes.split_at_mut(self.cw * self.ch);

        // Averages a 2x2 source block at byte offset (ox + x0, row oy + y0).
        let bilinear = |ox: usize, oy: usize, x0: usize, y0: usize| -> (u32, u32, u32) {
            let op1 = ox + x0 + (oy + y0) * self.row;
            let op2 = op1 + self.bpp;
            let op3 = op1 + self.row;
            let op4 = op2 + self.row;
            let r = (src[op1 + 2] as u32
                + src[op2 + 2] as u32
                + src[op3 + 2] as u32
                + src[op4 + 2] as u32)
                >> 2;
            let g = (src[op1 + 1] as u32
                + src[op2 + 1] as u32
                + src[op3 + 1] as u32
                + src[op4 + 1] as u32)
                >> 2;
            let b = (src[op1] as u32 + src[op2] as u32 + src[op3] as u32 + src[op4] as u32) >> 2;
            (r, g, b)
        };

        let mut cpix = 0;
        for yy in (0..self.yh).step_by(2) {
            let oy = self.h - 4 - 2 * yy;
            let mut ox = 0;
            for yx in (0..self.yw).step_by(2) {
                let (r, g, b) = bilinear(ox, oy, self.bpp, 1);
                cb_plane[cpix] = jpeg_cb(r as i32, g as i32, b as i32);
                cr_plane[cpix] = jpeg_cr(r as i32, g as i32, b as i32);
                cpix += 1;

                let ypix = yx + yy * self.yw;
                let (r, g, b) = bilinear(ox, oy, 0, 2);
                y_plane[ypix] = jpeg_y(r, g, b);
                let (r, g, b) = bilinear(ox, oy, self.bpp * 2, 2);
                y_plane[ypix + 1] = jpeg_y(r, g, b);
                let (r, g, b) = bilinear(ox, oy, 0, 0);
                y_plane[ypix + self.yw] = jpeg_y(r, g, b);
                let (r, g, b) = bilinear(ox, oy, self.bpp * 2, 0);
                y_plane[ypix + 1 + self.yw] = jpeg_y(r, g, b);

                ox += self.bpp * 4;
            }
        }
    }

    fn scaled(&self, map: &ScaleMap, src: &[u8], dst: &mut [u8]) {
        let (y_plane, c_planes) = dst.split_at_mut(self.yw * self.yh);
        let (cb_plane, cr_plane) = c_planes.split_at_mut(self.cw * self.ch);

        let sample = |at: usize, channel: usize| -> f32 {
            src[map.pos[at] as usize + channel] as f32 * map.factor[at]
                + src[map.pos[at + 1] as usize + channel] as f32 * map.factor[at + 1]
                + src[map.pos[at + 2] as usize + channel] as f32 * map.factor[at + 2]
                + src[map.pos[at + 3] as usize + channel] as f32 * map.factor[at + 3]
        };
        let rgb = |at: usize| -> (u32, u32, u32) {
            (
                (sample(at, 2) + 0.5) as u32,
                (sample(at, 1) + 0.5) as u32,
                (sample(at, 0) + 0.5) as u32,
            )
        };

        let cmap = self.yw * self.yh * 4;
        let mut cpix = 0;
        for yy in (0..self.yh).step_by(2) {
            for yx in (0..self.yw).step_by(2) {
                let (r, g, b) = rgb(cmap + cpix * 4);
                cb_plane[cpix] = jpeg_cb(r as i32, g as i32, b as i32);
                cr_plane[cpix] = jpeg_cr(r as i32, g as i32, b as i32);
                cpix += 1;

                for (dx, dy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
                    let ypix = (yx + dx) + (yy + dy) * self.yw;
                    let (r, g, b) = rgb(ypix * 4);
                    y_plane[ypix] = jpeg_y(r, g, b);
                }
            }
        }
    }
}

impl Stage for ToYcbcr {
    type Worker = YcbcrWorker;

    fn name(&self) -> &'static str {
        "ycbcr"
    }

    fn start_worker(&self) -> Result<YcbcrWorker, PipelineError> {
        Ok(YcbcrWorker::default())
    }

    fn on_read(
        &self,
        ctl: &mut StageCtl,
        data: &[u8],
        worker: &mut YcbcrWorker,
    ) -> Result<(), PipelineError> {
        worker.current = None;
        worker.pending_format = None;

        match ctl.tag {
            Tag::VideoFormat => {
                let fmt = VideoFormat::decode(&mut &data[..])?;
                if fmt.format == VideoPixelFormat::Ycbcr420Jpeg {
                    self.streams.write().remove(&fmt.id);
                    ctl.copy();
                    return Ok(());
                }

                let stream = Arc::new(self.plan(fmt));
                worker.pending_format = Some(stream.outgoing);
                self.streams.write().insert(fmt.id, stream);
                ctl.write_size = VIDEO_FORMAT_SIZE;
            }
            Tag::VideoData => {
                let header = VideoDataHeader::decode(&mut &data[..])?;
                let stream = self.streams.read().get(&header.id).cloned();
                match stream {
                    Some(stream) => {
                        ctl.write_size = VIDEO_DATA_HEADER_SIZE + stream.size;
                        worker.current = Some(stream);
                    }
                    None => ctl.copy(),
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
        worker: &mut YcbcrWorker,
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
            log::error!("ycbcr: {}", err);
        }
        self.streams.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{spawn, ToBgr};
    use kinescope_bus::Buffer;

    fn run_stage<S: Stage>(stage: S, messages: Vec<(Tag, Vec<u8>)>) -> Vec<(Tag, Vec<u8>)> {
        let from = Buffer::new(8 << 20);
        let to = Buffer::new(8 << 20);
        let process = spawn(stage, &from, Some(&to), 2).unwrap();

        let mut writer = from.writer();
        for (tag, payload) in &messages {
            let mut packet = writer.open().unwrap();
            packet.write(&[*tag as u8]).unwrap();
            packet.write(payload).unwrap();
            packet.close().unwrap();
        }
        let mut packet = writer.open().unwrap();
        packet.write(&[Tag::Close as u8]).unwrap();
        packet.close().unwrap();

        let mut out = Vec::new();
        let mut reader = to.reader();
        loop {
            let mut packet = reader.open().unwrap();
            let mut tag = [0u8];
            packet.read(&mut tag).unwrap();
            let tag = Tag::try_from(tag[0]).unwrap();
            out.push((tag, packet.rest().to_vec()));
            if tag == Tag::Close {
                break;
            }
        }

        process.join().unwrap();
        out
    }

    fn frame_message(id: StreamId, pixels: &[u8]) -> (Tag, Vec<u8>) {
        let mut buf = Vec::new();
        VideoDataHeader { id, time: 0 }.encode(&mut buf);
        buf.extend_from_slice(pixels);
        (Tag::VideoData, buf)
    }

    fn format_message(fmt: &VideoFormat) -> (Tag, Vec<u8>) {
        let mut buf = Vec::new();
        fmt.encode(&mut buf);
        (Tag::VideoFormat, buf)
    }

    #[test]
    fn flat_gray_converts_to_expected_planes() {
        let fmt = VideoFormat {
            id: 1,
            flags: 0,
            width: 16,
            height: 16,
            format: VideoPixelFormat::Bgr,
        };
        let pixels: Vec<u8> = std::iter::repeat([128u8, 128, 128]).take(256).flatten().collect();

        let out = run_stage(
            ToYcbcr::new(1.0),
            vec![format_message(&fmt), frame_message(1, &pixels)],
        );

        let out_fmt = VideoFormat::decode(&mut &out[0].1[..]).unwrap();
        assert_eq!(out_fmt.format, VideoPixelFormat::Ycbcr420Jpeg);

        let data = &out[1].1[VIDEO_DATA_HEADER_SIZE..];
        // Gray: Y == source value (coefficients sum to 1024), chroma at 128.
        assert!(data[..256].iter().all(|&y| y == 128));
        assert!(data[256..].iter().all(|&c| c == 128));
    }

    #[test]
    fn conversion_error_is_within_one_step_on_flat_regions() {
        let fmt = VideoFormat {
            id: 1,
            flags: 0,
            width: 8,
            height: 8,
            format: VideoPixelFormat::Bgr,
        };
        // B=30, G=20, R=10.
        let pixels: Vec<u8> = std::iter::repeat([30u8, 20, 10]).take(64).flatten().collect();

        let out = run_stage(
            ToYcbcr::new(1.0),
            vec![format_message(&fmt), frame_message(1, &pixels)],
        );

        let data = &out[1].1[VIDEO_DATA_HEADER_SIZE..];
        let y_exact = 0.299 * 10.0 + 0.587 * 20.0 + 0.114 * 30.0;
        let cb_exact = 128.0 - 0.168736 * 10.0 - 0.331264 * 20.0 + 0.5 * 30.0;
        let cr_exact = 128.0 + 0.5 * 10.0 - 0.418688 * 20.0 - 0.081312 * 30.0;

        for &y in &data[..64] {
            assert!((y as f64 - y_exact).abs() <= 1.0);
        }
        for &cb in &data[64..80] {
            assert!((cb as f64 - cb_exact).abs() <= 1.0);
        }
        for &cr in &data[80..96] {
            assert!((cr as f64 - cr_exact).abs() <= 1.0);
        }
    }

    #[test]
    fn roundtrip_through_bgr_stays_close_on_flat_regions() {
        let fmt = VideoFormat {
            id: 1,
            flags: 0,
            width: 16,
            height: 16,
            format: VideoPixelFormat::Bgr,
        };
        let pixels: Vec<u8> = std::iter::repeat([40u8, 90, 200]).take(256).flatten().collect();

        let planar = run_stage(
            ToYcbcr::new(1.0),
            vec![format_message(&fmt), frame_message(1, &pixels)],
        );
        let packed = run_stage(ToBgr::new(), planar[..2].to_vec());

        let out = &packed[1].1[VIDEO_DATA_HEADER_SIZE..];
        assert_eq!(out.len(), pixels.len());
        for (got, want) in out.iter().zip(pixels.iter()) {
            assert!(
                (*got as i32 - *want as i32).abs() <= 2,
                "{} vs {}",
                got,
                want
            );
        }
    }

    #[test]
    fn planar_input_passes_through() {
        let fmt = VideoFormat {
            id: 1,
            flags: 0,
            width: 4,
            height: 4,
            format: VideoPixelFormat::Ycbcr420Jpeg,
        };
        let mut payload = vec![9u8; 16];
        payload.extend(vec![128u8; 8]);

        let out = run_stage(
            ToYcbcr::new(1.0),
            vec![format_message(&fmt), frame_message(1, &payload)],
        );
        assert_eq!(
            VideoFormat::decode(&mut &out[0].1[..]).unwrap().format,
            VideoPixelFormat::Ycbcr420Jpeg
        );
        assert_eq!(&out[1].1[VIDEO_DATA_HEADER_SIZE..], &payload[..]);
    }
}
