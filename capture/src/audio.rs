//! PCM write interception.
//!
//! The host's sample writes are shadowed onto the bus. In async mode the
//! wrapped calls may arrive from a signal handler, so the host-facing path
//! takes no locks at all once a stream is configured: each stream owns a
//! preallocated single-slot hand-off with an atomic state word, and a
//! dedicated drainer thread moves the slot contents onto the bus. The bus
//! itself is only ever touched from normal threads.
//!
//! With skipping enabled (the default) a busy hand-off drops the block
//! instead of stalling the host's audio thread; recorded data must never
//! perturb host timing more than a memcpy.

use std::{
    cell::UnsafeCell,
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use kinescope_bus::{Buffer, BusError};
use kinescope_common::{
    AudioDataHeader, AudioFormat, AudioSampleFormat, Session, Tag, AUDIO_INTERLEAVED,
};
use parking_lot::{Mutex, RwLock};

use crate::CaptureError;

/// Host PCM handle identity; the interposer passes the handle address.
pub type PcmId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcmAccess {
    RwInterleaved,
    RwNoninterleaved,
    MmapInterleaved,
    MmapNoninterleaved,
    MmapComplex,
}

/// Negotiated hardware parameters as the hook needs them.
#[derive(Debug, Clone, Copy)]
pub struct PcmParams {
    pub format: AudioSampleFormat,
    pub channels: u32,
    pub rate: u32,
    pub access: PcmAccess,
}

/// One mapped channel area, as handed to `mmap_begin`. Offsets are in bits
/// to match the PCM abstraction.
#[derive(Debug, Clone, Copy)]
pub struct MmapArea {
    pub addr: *const u8,
    pub first: u32,
    pub step: u32,
}

unsafe impl Send for MmapArea {}

impl MmapArea {
    /// Address of `offset` frames into the area.
    unsafe fn at(&self, offset: u64) -> *const u8 {
        self.addr
            .add(self.first as usize / 8)
            .add(offset as usize * self.step as usize / 8)
    }
}

const SLOT_EMPTY: u8 = 0;
const SLOT_FULL: u8 = 1;
const SLOT_CLOSED: u8 = 2;

struct Block {
    time: u64,
    data: Vec<u8>,
}

/// Lock-free single producer, single consumer hand-off slot. The producer
/// is the hook (possibly in signal context), the consumer the drainer.
struct HandOff {
    state: AtomicU8,
    slot: UnsafeCell<Block>,
}

unsafe impl Sync for HandOff {}

impl HandOff {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(SLOT_EMPTY),
            slot: UnsafeCell::new(Block {
                time: 0,
                data: Vec::new(),
            }),
        }
    }

    fn is_empty(&self) -> bool {
        self.state.load(Ordering::Acquire) == SLOT_EMPTY
    }

    fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) == SLOT_CLOSED
    }

    /// Producer side. Only call while the slot reads empty. A close racing
    /// in loses the block, which is the right casualty on teardown.
    fn fill(&self, time: u64, write: impl FnOnce(&mut Vec<u8>)) {
        let block = unsafe { &mut *self.slot.get() };
        block.time = time;
        block.data.clear();
        write(&mut block.data);
        let _ = self.state.compare_exchange(
            SLOT_EMPTY,
            SLOT_FULL,
            Ordering::Release,
            Ordering::Relaxed,
        );
    }

    /// Consumer side. Runs `read` on the block if the slot is full and
    /// frees it afterwards. A concurrent close wins over the free, so a
    /// closed slot never flips back to empty.
    fn drain(&self, read: impl FnOnce(&Block) -> bool) -> bool {
        if self.state.load(Ordering::Acquire) != SLOT_FULL {
            return true;
        }
        let keep_going = read(unsafe { &*self.slot.get() });
        let _ = self.state.compare_exchange(
            SLOT_FULL,
            SLOT_EMPTY,
            Ordering::Release,
            Ordering::Relaxed,
        );
        keep_going
    }

    fn close(&self) {
        self.state.store(SLOT_CLOSED, Ordering::Release);
    }

    fn reset(&self) {
        self.state.store(SLOT_EMPTY, Ordering::Release);
    }
}

#[derive(Clone, Copy)]
struct StreamCfg {
    format: AudioSampleFormat,
    channels: u32,
    rate: u32,
    interleaved: bool,
    complex: bool,
}

impl StreamCfg {
    fn bytes_per_sample(&self) -> usize {
        self.format.bytes_per_sample()
    }

    fn bytes_per_frame(&self) -> usize {
        self.bytes_per_sample() * self.channels as usize
    }
}

struct Mmap {
    areas: Vec<MmapArea>,
    offset: u64,
    frames: u64,
}

struct PcmStream {
    id: u32,
    async_mode: AtomicBool,
    /// `None` until hw-params, or when the negotiated setup is one we
    /// cannot represent; such streams drop all data.
    cfg: RwLock<Option<StreamCfg>>,
    handoff: Arc<HandOff>,
    drainer: Mutex<Option<JoinHandle<()>>>,
    mmap: Mutex<Option<Mmap>>,
}

pub struct AudioHook {
    session: Arc<Session>,
    to: Mutex<Option<Buffer>>,
    allow_skip: bool,
    started: AtomicBool,
    dropped: AtomicU64,
    streams: RwLock<HashMap<PcmId, Arc<PcmStream>>>,
}

impl AudioHook {
    pub fn new(session: Arc<Session>, allow_skip: bool) -> Self {
        Self {
            session,
            to: Mutex::new(None),
            allow_skip,
            started: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            streams: RwLock::new(HashMap::new()),
        }
    }

    /// Attach the hook to the bus and bring up every stream that already
    /// negotiated its format.
    pub fn start(&self, to: &Buffer) -> Result<(), CaptureError> {
        *self.to.lock() = Some(to.clone());
        self.started.store(true, Ordering::SeqCst);

        let streams: Vec<Arc<PcmStream>> = self.streams.read().values().cloned().collect();
        for stream in streams {
            if stream.cfg.read().is_some() {
                self.init_stream(&stream)?;
            }
        }
        Ok(())
    }

    /// Tear down every drainer and forget the streams.
    pub fn shutdown(&self) {
        self.started.store(false, Ordering::SeqCst);
        let streams: Vec<Arc<PcmStream>> = {
            let mut map = self.streams.write();
            map.drain().map(|(_, stream)| stream).collect()
        };
        for stream in streams {
            stream.handoff.close();
            if let Some(handle) = stream.drainer.lock().take() {
                let _ = handle.join();
            }
        }
    }

    fn stream(&self, pcm: PcmId) -> Arc<PcmStream> {
        if let Some(stream) = self.streams.read().get(&pcm) {
            return stream.clone();
        }

        let mut streams = self.streams.write();
        streams
            .entry(pcm)
            .or_insert_with(|| {
                Arc::new(PcmStream {
                    id: self.session.next_audio_id(),
                    async_mode: AtomicBool::new(false),
                    cfg: RwLock::new(None),
                    handoff: Arc::new(HandOff::new()),
                    drainer: Mutex::new(None),
                    mmap: Mutex::new(None),
                })
            })
            .clone()
    }

    /// `snd_pcm_open` shadow.
    pub fn open(&self, pcm: PcmId, name: &str, async_mode: bool, nonblock: bool) {
        let stream = self.stream(pcm);
        stream.async_mode.store(async_mode, Ordering::SeqCst);

        log::info!("stream {}: opened device \"{}\"", stream.id, name);
        log::debug!(
            "stream {}: async={}, nonblock={}",
            stream.id,
            async_mode,
            nonblock
        );
    }

    /// `snd_pcm_hw_params` shadow: fix the stream layout, announce it and
    /// (re)start the drainer so the format envelope precedes any samples.
    pub fn hw_params(&self, pcm: PcmId, params: PcmParams) -> Result<(), CaptureError> {
        let stream = self.stream(pcm);
        log::info!("stream {}: creating/updating configuration", stream.id);

        let (interleaved, complex) = match params.access {
            PcmAccess::RwInterleaved | PcmAccess::MmapInterleaved => (true, false),
            PcmAccess::RwNoninterleaved | PcmAccess::MmapNoninterleaved => (false, false),
            // Complex access is converted to interleaved during the copy.
            PcmAccess::MmapComplex => (true, true),
        };

        let cfg = StreamCfg {
            format: params.format,
            channels: params.channels,
            rate: params.rate,
            interleaved,
            complex,
        };
        *stream.cfg.write() = Some(cfg);

        log::debug!(
            "stream {}: {} channels, rate {}, format {:?}, interleaved={}",
            stream.id,
            cfg.channels,
            cfg.rate,
            cfg.format,
            cfg.interleaved
        );

        if self.started.load(Ordering::SeqCst) {
            self.init_stream(&stream)?;
        }
        Ok(())
    }

    fn init_stream(&self, stream: &Arc<PcmStream>) -> Result<(), CaptureError> {
        let to = self
            .to
            .lock()
            .clone()
            .ok_or(CaptureError::NotStarted)?;
        let cfg = (*stream.cfg.read()).ok_or(CaptureError::NotStarted)?;

        log::info!("stream {}: initializing", stream.id);

        // Kill a previous drainer first so the new format envelope is
        // written before any sample block that follows it.
        stream.handoff.close();
        if let Some(handle) = stream.drainer.lock().take() {
            let _ = handle.join();
        }
        stream.handoff.reset();

        let mut flags = 0;
        if cfg.interleaved {
            flags |= AUDIO_INTERLEAVED;
        }
        let format = AudioFormat {
            id: stream.id,
            flags,
            rate: cfg.rate,
            channels: cfg.channels,
            format: cfg.format,
        };

        let mut writer = to.writer();
        let mut packet = writer.open()?;
        packet.write(&[Tag::AudioFormat as u8])?;
        let mut buf = Vec::with_capacity(17);
        format.encode(&mut buf);
        packet.write(&buf)?;
        packet.close()?;

        let id = stream.id;
        let handoff = stream.handoff.clone();
        let handle = thread::Builder::new()
            .name(format!("audio-drain-{}", id))
            .spawn(move || drainer_loop(id, handoff, to))?;
        *stream.drainer.lock() = Some(handle);

        Ok(())
    }

    /// Wait until the slot is free, or report a drop when skipping is on.
    /// In async mode the caller may be a signal handler, so waiting means
    /// spinning; a normal thread gets to sleep instead.
    fn wait_for_slot(&self, stream: &PcmStream) -> Result<(), CaptureError> {
        while !stream.handoff.is_empty() {
            if stream.handoff.is_closed() {
                return Err(CaptureError::NotStarted);
            }
            if self.allow_skip {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                log::warn!(
                    "stream {}: dropped audio data, drainer not ready ({} so far)",
                    stream.id,
                    dropped
                );
                return Err(CaptureError::Busy);
            }
            if stream.async_mode.load(Ordering::Relaxed) {
                std::hint::spin_loop();
                thread::yield_now();
            } else {
                thread::sleep(Duration::from_micros(50));
            }
        }
        Ok(())
    }

    /// `snd_pcm_writei` shadow: interleaved frames in one buffer.
    pub fn writei(&self, pcm: PcmId, data: &[u8], frames: usize) -> Result<(), CaptureError> {
        let stream = self.stream(pcm);
        let Some(cfg) = *stream.cfg.read() else {
            return Err(CaptureError::NotReady);
        };

        let size = frames * cfg.bytes_per_frame();
        let size = size.min(data.len());

        match self.wait_for_slot(&stream) {
            Ok(()) => (),
            Err(CaptureError::Busy) => return Ok(()),
            Err(err) => return Err(err),
        }

        let time = self.session.clock.now();
        stream
            .handoff
            .fill(time, |buf| buf.extend_from_slice(&data[..size]));
        Ok(())
    }

    /// `snd_pcm_writen` shadow: one buffer per channel, concatenated into
    /// planar layout.
    pub fn writen(&self, pcm: PcmId, channels: &[&[u8]], frames: usize) -> Result<(), CaptureError> {
        let stream = self.stream(pcm);
        let Some(cfg) = *stream.cfg.read() else {
            return Err(CaptureError::NotReady);
        };

        if cfg.interleaved {
            log::error!(
                "stream {}: interleaved stream is incompatible with per-channel writes",
                stream.id
            );
            return Err(CaptureError::Unsupported("writen on interleaved stream"));
        }

        let channel_bytes = frames * cfg.bytes_per_sample();

        match self.wait_for_slot(&stream) {
            Ok(()) => (),
            Err(CaptureError::Busy) => return Ok(()),
            Err(err) => return Err(err),
        }

        let time = self.session.clock.now();
        stream.handoff.fill(time, |buf| {
            for chan in channels {
                let take = channel_bytes.min(chan.len());
                buf.extend_from_slice(&chan[..take]);
            }
        });
        Ok(())
    }

    /// `snd_pcm_mmap_begin` shadow: stash the channel areas for the commit.
    pub fn mmap_begin(&self, pcm: PcmId, areas: &[MmapArea], offset: u64, frames: u64) {
        let stream = self.stream(pcm);
        *stream.mmap.lock() = Some(Mmap {
            areas: areas.to_vec(),
            offset,
            frames,
        });
    }

    /// `snd_pcm_mmap_commit` shadow: copy the committed frames out of the
    /// mapped areas, converting complex access to interleaved.
    pub fn mmap_commit(&self, pcm: PcmId, offset: u64, frames: u64) -> Result<(), CaptureError> {
        let stream = self.stream(pcm);
        let Some(cfg) = *stream.cfg.read() else {
            return Err(CaptureError::NotReady);
        };
        if cfg.channels == 0 {
            return Ok(());
        }

        let Some(mmap) = stream.mmap.lock().take() else {
            // This might actually happen.
            log::warn!("stream {}: mmap commit before mmap begin", stream.id);
            return Err(CaptureError::NotReady);
        };

        if offset != mmap.offset {
            log::warn!(
                "stream {}: commit offset {} != begin offset {}",
                stream.id,
                offset,
                mmap.offset
            );
        }
        let frames = frames.min(mmap.frames);

        match self.wait_for_slot(&stream) {
            Ok(()) => (),
            Err(CaptureError::Busy) => return Ok(()),
            Err(err) => return Err(err),
        }

        let time = self.session.clock.now();
        stream.handoff.fill(time, |buf| unsafe {
            if cfg.complex {
                // Per-sample gather: expensive, but complex access means
                // the channel layout follows no other rule.
                let ssize = cfg.bytes_per_sample();
                let fsize = cfg.bytes_per_frame();
                buf.resize(frames as usize * fsize, 0);
                for (c, area) in mmap.areas.iter().enumerate().take(cfg.channels as usize) {
                    for f in 0..frames {
                        let src = area.at(offset + f);
                        let at = f as usize * fsize + c * ssize;
                        std::ptr::copy_nonoverlapping(src, buf[at..].as_mut_ptr(), ssize);
                    }
                }
            } else if cfg.interleaved {
                let bytes = frames as usize * cfg.bytes_per_frame();
                let src = mmap.areas[0].at(offset);
                buf.extend_from_slice(std::slice::from_raw_parts(src, bytes));
            } else {
                let bytes = frames as usize * cfg.bytes_per_sample();
                for area in mmap.areas.iter().take(cfg.channels as usize) {
                    let src = area.at(offset);
                    buf.extend_from_slice(std::slice::from_raw_parts(src, bytes));
                }
            }
        });
        Ok(())
    }

    /// `snd_pcm_close` shadow.
    pub fn close(&self, pcm: PcmId) {
        let stream = self.streams.write().remove(&pcm);
        if let Some(stream) = stream {
            log::info!("stream {}: closing", stream.id);
            stream.handoff.close();
            if let Some(handle) = stream.drainer.lock().take() {
                let _ = handle.join();
            }
        }
    }
}

fn drainer_loop(id: u32, handoff: Arc<HandOff>, to: Buffer) {
    let mut writer = to.writer();

    loop {
        if handoff.is_closed() {
            break;
        }

        let keep_going = handoff.drain(|block| {
            let header = AudioDataHeader {
                id,
                time: block.time,
                size: block.data.len() as u64,
            };

            let write = (|| -> Result<(), BusError> {
                let mut packet = writer.open()?;
                packet.write(&[Tag::AudioData as u8])?;
                let mut buf = Vec::with_capacity(24);
                header.encode(&mut buf);
                packet.write(&buf)?;
                packet.write(&block.data)?;
                packet.close()
            })();

            match write {
                Ok(()) => true,
                Err(BusError::Interrupted) => false,
                Err(err) => {
                    log::error!("stream {}: {}", id, err);
                    false
                }
            }
        });

        if !keep_going {
            break;
        }
        if handoff.is_empty() {
            thread::sleep(Duration::from_micros(200));
        }
    }
}
