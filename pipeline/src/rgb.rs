//! Planar Y'CbCr 4:2:0 back to packed BGR for playback and image export.
//!
//! Output rows are bottom first like every other packed frame on the bus.
//! Streams that are already packed pass through untouched.

use std::{collections::HashMap, sync::Arc};

use kinescope_common::{
    StreamId, Tag, VideoDataHeader, VideoFormat, VideoPixelFormat, VIDEO_DATA_HEADER_SIZE,
    VIDEO_FORMAT_SIZE,
};
use parking_lot::RwLock;

use crate::{PipelineError, Stage, StageCtl};

#[inline]
fn clamp(v: f32) -> u8 {
    v.clamp(0.0, 255.0) as u8
}

#[inline]
fn to_bgr(y: u8, cb: u8, cr: u8) -> [u8; 3] {
    let y = y as f32;
    let cb = cb as f32 - 128.0;
    let cr = cr as f32 - 128.0;

    [
        clamp(y + 1.772 * cb + 0.5),
        clamp(y - 0.344136 * cb - 0.714136 * cr + 0.5),
        clamp(y + 1.402 * cr + 0.5),
    ]
}

struct StreamGeo {
    w: usize,
    h: usize,
    size: usize,
}

#[derive(Default)]
pub struct ToBgr {
    streams: RwLock<HashMap<StreamId, Arc<StreamGeo>>>,
}

#[derive(Default)]
pub struct ToBgrWorker {
    current: Option<Arc<StreamGeo>>,
    pending_format: Option<VideoFormat>,
}

impl ToBgr {
    pub fn new() -> Self {
        Self::default()
    }
}

fn convert(geo: &StreamGeo, src: &[u8], dst: &mut [u8]) {
    let (w, h) = (geo.w, geo.h);
    let y_plane = &src[..w * h];
    let cb_plane = &src[w * h..w * h + (w / 2) * (h / 2)];
    let cr_plane = &src[w * h + (w / 2) * (h / 2)..];

    // Frame dimensions are always divisible by two.
    let mut cpix = 0;
    for y in (0..h).step_by(2) {
        for x in (0..w).step_by(2) {
            let cb = cb_plane[cpix];
            let cr = cr_plane[cpix];
            cpix += 1;

            for (dx, dy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
                let luma = y_plane[(x + dx) + (y + dy) * w];
                // Plane rows are top first, packed rows bottom first.
                let tp = ((x + dx) + (h - 1 - (y + dy)) * w) * 3;
                dst[tp..tp + 3].copy_from_slice(&to_bgr(luma, cb, cr));
            }
        }
    }
}

impl Stage for ToBgr {
    type Worker = ToBgrWorker;

    fn name(&self) -> &'static str {
        "rgb"
    }

    fn start_worker(&self) -> Result<ToBgrWorker, PipelineError> {
        Ok(ToBgrWorker::default())
    }

    fn on_read(
        &self,
        ctl: &mut StageCtl,
        data: &[u8],
        worker: &mut ToBgrWorker,
    ) -> Result<(), PipelineError> {
        worker.current = None;
        worker.pending_format = None;

        match ctl.tag {
            Tag::VideoFormat => {
                let fmt = VideoFormat::decode(&mut &data[..])?;
                if fmt.format != VideoPixelFormat::Ycbcr420Jpeg {
                    self.streams.write().remove(&fmt.id);
                    ctl.copy();
                    return Ok(());
                }

                let (w, h) = (fmt.width as usize, fmt.height as usize);
                self.streams.write().insert(
                    fmt.id,
                    Arc::new(StreamGeo {
                        w,
                        h,
                        size: w * h * 3,
                    }),
                );

                let mut outgoing = fmt;
                outgoing.format = VideoPixelFormat::Bgr;
                worker.pending_format = Some(outgoing);
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
        worker: &mut ToBgrWorker,
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
        convert(
            &stream,
            &read[VIDEO_DATA_HEADER_SIZE..],
            &mut write[VIDEO_DATA_HEADER_SIZE..],
        );
        Ok(())
    }

    fn finish(&self, err: Option<&PipelineError>) {
        if let Some(err) = err {
            log::error!("rgb: {}", err);
        }
        self.streams.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neutral_chroma_maps_luma_to_gray() {
        assert_eq!(to_bgr(128, 128, 128), [128, 128, 128]);
        assert_eq!(to_bgr(0, 128, 128), [0, 0, 0]);
        assert_eq!(to_bgr(255, 128, 128), [255, 255, 255]);
    }

    #[test]
    fn saturated_chroma_clamps() {
        let [b, _, r] = to_bgr(255, 255, 255);
        assert_eq!((b, r), (255, 255));
        let [b, _, r] = to_bgr(0, 0, 0);
        assert_eq!((b, r), (0, 0));
    }

    #[test]
    fn converted_frame_is_flipped_to_bottom_first_rows() {
        let geo = StreamGeo {
            w: 2,
            h: 2,
            size: 12,
        };
        // Top row bright, bottom row dark, neutral chroma.
        let src = [200u8, 200, 10, 10, 128, 128];
        let mut dst = [0u8; 12];
        convert(&geo, &src, &mut dst);

        // Packed output row 0 is the bottom of the picture.
        assert_eq!(&dst[..6], &[10, 10, 10, 10, 10, 10]);
        assert_eq!(&dst[6..], &[200, 200, 200, 200, 200, 200]);
    }
}
