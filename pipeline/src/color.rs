//! Per stream brightness/contrast/gamma correction.
//!
//! Corrections arrive as color envelopes and are consumed here; the pixel
//! data they apply to flows through corrected in place. Packed BGR uses
//! three 256 byte channel tables. Planar Y'CbCr uses a quantised
//! `(Y, Cb, Cr)` cube that folds the conversion to RGB, the per channel
//! correction and the conversion back into one lookup. An identity
//! correction drops the table so frames pass through untouched.

use std::{collections::HashMap, sync::Arc};

use kinescope_common::{
    ColorCorrection, StreamId, Tag, VideoDataHeader, VideoFormat, VideoPixelFormat,
    VIDEO_DATA_HEADER_SIZE,
};
use parking_lot::RwLock;

use crate::{PipelineError, Stage, StageCtl};

const LOOKUP_BITS: u32 = 8;

fn clamp(v: f64) -> u8 {
    v.clamp(0.0, 255.0) as u8
}

fn correct_channel(value: u8, brightness: f32, contrast: f32, gamma: f32) -> u8 {
    let v = value as f64 / 255.0;
    clamp(
        (((v.powf(1.0 / gamma as f64) - 0.5) * (1.0 + contrast as f64) + 0.5)
            + brightness as f64)
            * 255.0,
    )
}

fn ycbcr_to_rgb(y: u8, cb: u8, cr: u8) -> (u8, u8, u8) {
    let y = y as f64;
    let cb = cb as f64 - 128.0;
    let cr = cr as f64 - 128.0;
    (
        clamp(y + 1.402 * cr),
        clamp(y - 0.344136 * cb - 0.714136 * cr),
        clamp(y + 1.772 * cb),
    )
}

fn rgb_to_ycbcr(r: u8, g: u8, b: u8) -> (u8, u8, u8) {
    let (r, g, b) = (r as f64, g as f64, b as f64);
    (
        clamp(0.299 * r + 0.587 * g + 0.114 * b),
        clamp(128.0 - 0.168736 * r - 0.331264 * g + 0.5 * b),
        clamp(128.0 + 0.5 * r - 0.418688 * g - 0.081312 * b),
    )
}

enum Table {
    /// Red, green and blue channel maps, 256 entries each.
    Bgr(Box<[u8]>),
    /// `(Y, Cb, Cr)` cube at `LOOKUP_BITS` resolution, three bytes per cell.
    Ycbcr { bits: u32, cube: Vec<u8> },
}

struct StreamColor {
    fmt: Option<VideoFormat>,
    correction: ColorCorrection,
    table: Option<Table>,
}

pub struct ColorCorrect {
    /// Player side override; recorded color envelopes are ignored when set.
    override_: Option<ColorCorrection>,
    lookup_bits: u32,
    streams: RwLock<HashMap<StreamId, Arc<StreamColor>>>,
}

#[derive(Default)]
pub struct ColorWorker {
    current: Option<Arc<StreamColor>>,
}

impl ColorCorrect {
    pub fn new() -> Self {
        Self {
            override_: None,
            lookup_bits: LOOKUP_BITS,
            streams: RwLock::new(HashMap::new()),
        }
    }

    /// Apply one global correction to every stream instead of the recorded
    /// per stream envelopes.
    pub fn with_override(correction: ColorCorrection) -> Self {
        let mut this = Self::new();
        this.override_ = Some(correction);
        this
    }

    #[cfg(test)]
    fn with_lookup_bits(bits: u32) -> Self {
        let mut this = Self::new();
        this.lookup_bits = bits;
        this
    }

    fn rebuild(&self, stream: &mut StreamColor) {
        let c = &stream.correction;
        if c.is_identity() {
            log::info!("stream {}: skipping color correction", c.id);
            stream.table = None;
            return;
        }

        let Some(fmt) = stream.fmt else {
            // Table is built once the stream geometry is known.
            stream.table = None;
            return;
        };

        log::info!(
            "stream {}: brightness={}, contrast={}, red={}, green={}, blue={}",
            c.id,
            c.brightness,
            c.contrast,
            c.red,
            c.green,
            c.blue
        );

        let channel = |gamma: f32| -> Vec<u8> {
            (0..256)
                .map(|v| correct_channel(v as u8, c.brightness, c.contrast, gamma))
                .collect()
        };
        let red = channel(c.red);
        let green = channel(c.green);
        let blue = channel(c.blue);

        stream.table = Some(match fmt.format {
            VideoPixelFormat::Bgr | VideoPixelFormat::Bgra => {
                let mut table = Vec::with_capacity(768);
                table.extend_from_slice(&red);
                table.extend_from_slice(&green);
                table.extend_from_slice(&blue);
                Table::Bgr(table.into_boxed_slice())
            }
            VideoPixelFormat::Ycbcr420Jpeg => {
                let bits = self.lookup_bits;
                let steps = 1usize << bits;
                let step = (256 >> bits) as usize;
                let mut cube = Vec::with_capacity(steps * steps * steps * 3);

                for y in (0..256).step_by(step) {
                    for cb in (0..256).step_by(step) {
                        for cr in (0..256).step_by(step) {
                            let (r, g, b) = ycbcr_to_rgb(y as u8, cb as u8, cr as u8);
                            let (y2, cb2, cr2) = rgb_to_ycbcr(
                                red[r as usize],
                                green[g as usize],
                                blue[b as usize],
                            );
                            cube.push(y2);
                            cube.push(cb2);
                            cube.push(cr2);
                        }
                    }
                }
                Table::Ycbcr { bits, cube }
            }
        });
    }

    fn update<F: FnOnce(&mut StreamColor)>(&self, id: StreamId, apply: F) {
        let mut streams = self.streams.write();
        let mut stream = match streams.get(&id) {
            Some(stream) => StreamColor {
                fmt: stream.fmt,
                correction: stream.correction,
                table: None,
            },
            None => StreamColor {
                fmt: None,
                correction: self
                    .override_
                    .map(|mut c| {
                        c.id = id;
                        c
                    })
                    .unwrap_or_else(|| ColorCorrection::identity(id)),
                table: None,
            },
        };

        apply(&mut stream);
        self.rebuild(&mut stream);
        streams.insert(id, Arc::new(stream));
    }
}

impl Default for ColorCorrect {
    fn default() -> Self {
        Self::new()
    }
}

fn correct_bgr(fmt: &VideoFormat, table: &[u8], data: &mut [u8]) {
    let bpp = fmt.format.bytes_per_pixel();
    let row = fmt.row_stride();
    let (w, h) = (fmt.width as usize, fmt.height as usize);

    for y in 0..h {
        for x in 0..w {
            let p = y * row + x * bpp;
            data[p] = table[512 + data[p] as usize];
            data[p + 1] = table[256 + data[p + 1] as usize];
            data[p + 2] = table[data[p + 2] as usize];
        }
    }
}

fn correct_ycbcr(fmt: &VideoFormat, bits: u32, cube: &[u8], src: &[u8], dst: &mut [u8]) {
    let (w, h) = (fmt.width as usize, fmt.height as usize);
    let shift = 8 - bits;
    let pos = |y: u8, cb: u8, cr: u8| -> usize {
        ((((y >> shift) as usize) << (bits * 2))
            + (((cb >> shift) as usize) << bits)
            + ((cr >> shift) as usize))
            * 3
    };

    let (y_src, c_src) = src.split_at(w * h);
    let (cb_src, cr_src) = c_src.split_at((w / 2) * (h / 2));
    let (y_dst, c_dst) = dst.split_at_mut(w * h);
    let (cb_dst, cr_dst) = c_dst.split_at_mut((w / 2) * (h / 2));

    let mut cpix = 0;
    for y in (0..h).step_by(2) {
        for x in (0..w).step_by(2) {
            let cb = cb_src[cpix];
            let cr = cr_src[cpix];

            let mut sum: u32 = 0;
            for (dx, dy) in [(0, 0), (0, 1), (1, 0), (1, 1)] {
                let at = (x + dx) + (y + dy) * w;
                let corrected = cube[pos(y_src[at], cb, cr)];
                y_dst[at] = corrected;
                sum += corrected as u32;
            }

            // Chroma is corrected against the block's average corrected luma.
            let p = pos((sum >> 2) as u8, cb, cr);
            cb_dst[cpix] = cube[p + 1];
            cr_dst[cpix] = cube[p + 2];
            cpix += 1;
        }
    }
}

impl Stage for ColorCorrect {
    type Worker = ColorWorker;

    fn name(&self) -> &'static str {
        "color"
    }

    fn start_worker(&self) -> Result<ColorWorker, PipelineError> {
        Ok(ColorWorker::default())
    }

    fn on_read(
        &self,
        ctl: &mut StageCtl,
        data: &[u8],
        worker: &mut ColorWorker,
    ) -> Result<(), PipelineError> {
        worker.current = None;

        match ctl.tag {
            Tag::Color => {
                let msg = ColorCorrection::decode(&mut &data[..])?;
                if self.override_.is_none() {
                    self.update(msg.id, |stream| stream.correction = msg);
                }
                // Correction is applied here; the envelope goes no further.
                ctl.skip_write();
            }
            Tag::VideoFormat => {
                let fmt = VideoFormat::decode(&mut &data[..])?;
                self.update(fmt.id, |stream| stream.fmt = Some(fmt));
                ctl.copy();
            }
            Tag::VideoData => {
                let header = VideoDataHeader::decode(&mut &data[..])?;
                let stream = self.streams.read().get(&header.id).cloned();
                match stream {
                    Some(stream) if stream.table.is_some() => worker.current = Some(stream),
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
        worker: &mut ColorWorker,
    ) -> Result<(), PipelineError> {
        let stream = worker
            .current
            .take()
            .ok_or(PipelineError::Unsupported("frame for an unknown stream"))?;
        let fmt = stream
            .fmt
            .as_ref()
            .ok_or(PipelineError::Unsupported("frame before stream format"))?;

        write.copy_from_slice(read);
        match stream.table.as_ref() {
            Some(Table::Bgr(table)) => {
                correct_bgr(fmt, table, &mut write[VIDEO_DATA_HEADER_SIZE..])
            }
            Some(Table::Ycbcr { bits, cube }) => correct_ycbcr(
                fmt,
                *bits,
                cube,
                &read[VIDEO_DATA_HEADER_SIZE..],
                &mut write[VIDEO_DATA_HEADER_SIZE..],
            ),
            None => (),
        }
        Ok(())
    }

    fn finish(&self, err: Option<&PipelineError>) {
        if let Some(err) = err {
            log::error!("color: {}", err);
        }
        self.streams.write().clear();
    }
}
