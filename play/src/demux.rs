//! Single threaded stream demultiplexer.
//!
//! The replay bus interleaves video and audio envelopes for any number of
//! stream ids. The demuxer forwards each message onto a private per-id sub
//! bus paired with a sink, creating both on first sighting of the id. The
//! close envelope is broadcast to every sink. A dead sink takes only its
//! own stream down; the rest keep playing.

use std::{
    collections::HashMap,
    sync::Arc,
    thread::{self, JoinHandle},
};

use kinescope_bus::{Buffer, BusError, WriteHandle};
use kinescope_common::{
    AudioDataHeader, AudioFormat, Session, StreamId, Tag, VideoDataHeader, VideoFormat,
};

use crate::PlayError;

/// A running sink thread. The sub bus is cancelled when the sink returns,
/// which is how the demuxer notices it is gone.
pub struct SinkHandle {
    handle: JoinHandle<Result<(), PlayError>>,
}

impl SinkHandle {
    /// Run `body` on its own thread; the sub bus is poisoned on the way
    /// out no matter how the sink ends.
    pub fn spawn(
        name: String,
        bus: Buffer,
        body: impl FnOnce() -> Result<(), PlayError> + Send + 'static,
    ) -> Result<Self, PlayError> {
        let handle = thread::Builder::new().name(name).spawn(move || {
            let result = body();
            bus.cancel();
            result
        })?;

        Ok(Self { handle })
    }

    pub fn join(self) -> Result<(), PlayError> {
        match self.handle.join() {
            Ok(result) => result,
            Err(_) => Err(PlayError::Unsupported("sink thread panicked")),
        }
    }
}

/// Builds the sink for each newly sighted stream id.
pub trait SinkFactory {
    fn video(
        &self,
        session: &Arc<Session>,
        id: StreamId,
        from: Buffer,
    ) -> Result<SinkHandle, PlayError>;

    fn audio(
        &self,
        session: &Arc<Session>,
        id: StreamId,
        from: Buffer,
    ) -> Result<SinkHandle, PlayError>;
}

#[derive(Debug, Clone, Copy)]
pub struct DemuxOptions {
    pub video_buffer: usize,
    pub audio_buffer: usize,
}

impl Default for DemuxOptions {
    fn default() -> Self {
        Self {
            video_buffer: 10 * 1024 * 1024,
            audio_buffer: 1024 * 1024,
        }
    }
}

struct Sub {
    bus: Buffer,
    writer: WriteHandle,
    sink: Option<SinkHandle>,
}

impl Sub {
    fn send(&mut self, tag: Tag, payload: &[u8]) -> Result<(), BusError> {
        let mut packet = self.writer.open()?;
        packet.write(&[tag as u8])?;
        packet.write(payload)?;
        packet.close()
    }

    fn finish(mut self, id: StreamId, kind: &str) {
        self.bus.cancel();
        if let Some(sink) = self.sink.take() {
            match sink.join() {
                Ok(()) => log::debug!("{} stream {} has quit", kind, id),
                Err(err) => log::error!("{} stream {}: {}", kind, id, err),
            }
        }
    }
}

/// Run the dispatcher on the calling thread until the close envelope, bus
/// cancellation or session cancel.
pub fn run_demux(
    session: &Arc<Session>,
    from: &Buffer,
    factory: &dyn SinkFactory,
    options: DemuxOptions,
) -> Result<(), PlayError> {
    let mut reader = from.reader();
    let mut videos: HashMap<StreamId, Sub> = HashMap::new();
    let mut audios: HashMap<StreamId, Sub> = HashMap::new();

    let result = loop {
        if session.is_cancelled() {
            break Ok(());
        }

        let mut packet = match reader.open() {
            Ok(packet) => packet,
            Err(BusError::Interrupted) => break Ok(()),
            Err(err) => break Err(err.into()),
        };

        let mut tag = [0u8];
        if let Err(err) = packet.read(&mut tag) {
            break Err(err.into());
        }
        let tag = match Tag::try_from(tag[0]) {
            Ok(tag) => tag,
            Err(err) => break Err(err.into()),
        };
        let payload = packet.rest().to_vec();
        packet.close();

        match tag {
            Tag::Close => {
                for (id, sub) in videos.iter_mut() {
                    if let Err(err) = sub.send(tag, &payload) {
                        log::debug!("video stream {}: close not delivered: {}", id, err);
                    }
                }
                for (id, sub) in audios.iter_mut() {
                    if let Err(err) = sub.send(tag, &payload) {
                        log::debug!("audio stream {}: close not delivered: {}", id, err);
                    }
                }
                break Ok(());
            }
            Tag::VideoFormat | Tag::VideoData => {
                let id = match tag {
                    Tag::VideoFormat => VideoFormat::decode(&mut &payload[..])?.id,
                    _ => VideoDataHeader::decode(&mut &payload[..])?.id,
                };

                let sub = match videos.entry(id) {
                    std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
                    std::collections::hash_map::Entry::Vacant(entry) => {
                        let bus = Buffer::new(options.video_buffer);
                        let sink = factory.video(session, id, bus.clone())?;
                        entry.insert(Sub {
                            writer: bus.writer(),
                            bus,
                            sink: Some(sink),
                        })
                    }
                };

                if sub.send(tag, &payload).is_err() {
                    // The sink is gone; drop this stream, keep the rest.
                    if let Some(sub) = videos.remove(&id) {
                        sub.finish(id, "video");
                    }
                }
            }
            Tag::AudioFormat | Tag::AudioData => {
                let id = match tag {
                    Tag::AudioFormat => AudioFormat::decode(&mut &payload[..])?.id,
                    _ => AudioDataHeader::decode(&mut &payload[..])?.id,
                };

                let sub = match audios.entry(id) {
                    std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
                    std::collections::hash_map::Entry::Vacant(entry) => {
                        let bus = Buffer::new(options.audio_buffer);
                        let sink = factory.audio(session, id, bus.clone())?;
                        entry.insert(Sub {
                            writer: bus.writer(),
                            bus,
                            sink: Some(sink),
                        })
                    }
                };

                if sub.send(tag, &payload).is_err() {
                    if let Some(sub) = audios.remove(&id) {
                        sub.finish(id, "audio");
                    }
                }
            }
            // Compression and color envelopes never reach the demuxer in a
            // well-formed pipeline.
            _ => log::debug!("ignoring {:?} envelope", tag),
        }
    };

    // When playback was cancelled rather than played out, the producers
    // upstream are still pushing; poison the source so they unwind.
    if session.is_cancelled() {
        from.cancel();
    }

    for (id, sub) in videos {
        sub.finish(id, "video");
    }
    for (id, sub) in audios {
        sub.finish(id, "audio");
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    type Log = Arc<Mutex<Vec<(StreamId, Tag, Vec<u8>)>>>;

    /// Records every delivered message; dies on demand.
    struct Recorder {
        log: Log,
        fail_video_id: Option<StreamId>,
    }

    fn recording_sink(
        log: Log,
        id: StreamId,
        from: Buffer,
        fail: bool,
    ) -> Result<SinkHandle, PlayError> {
        SinkHandle::spawn(format!("recorder-{}", id), from.clone(), move || {
            let mut reader = from.reader();
            loop {
                let mut packet = match reader.open() {
                    Ok(packet) => packet,
                    Err(BusError::Interrupted) => return Ok(()),
                    Err(err) => return Err(err.into()),
                };
                let mut tag = [0u8];
                packet.read(&mut tag).unwrap();
                let tag = Tag::try_from(tag[0]).unwrap();
                log.lock().push((id, tag, packet.rest().to_vec()));

                if fail {
                    return Err(PlayError::Unsupported("sink told to fail"));
                }
                if tag == Tag::Close {
                    return Ok(());
                }
            }
        })
    }

    impl SinkFactory for Recorder {
        fn video(
            &self,
            _session: &Arc<Session>,
            id: StreamId,
            from: Buffer,
        ) -> Result<SinkHandle, PlayError> {
            recording_sink(
                self.log.clone(),
                id,
                from,
                self.fail_video_id == Some(id),
            )
        }

        fn audio(
            &self,
            _session: &Arc<Session>,
            id: StreamId,
            from: Buffer,
        ) -> Result<SinkHandle, PlayError> {
            recording_sink(self.log.clone(), id + 1000, from, false)
        }
    }

    fn push(bus: &Buffer, tag: Tag, payload: &[u8]) {
        let mut writer = bus.writer();
        let mut packet = writer.open().unwrap();
        packet.write(&[tag as u8]).unwrap();
        packet.write(payload).unwrap();
        packet.close().unwrap();
    }

    fn video_format(id: StreamId) -> Vec<u8> {
        let mut buf = Vec::new();
        VideoFormat {
            id,
            flags: 0,
            width: 4,
            height: 4,
            format: kinescope_common::VideoPixelFormat::Bgr,
        }
        .encode(&mut buf);
        buf
    }

    fn video_frame(id: StreamId, marker: u8) -> Vec<u8> {
        let mut buf = Vec::new();
        VideoDataHeader { id, time: 0 }.encode(&mut buf);
        buf.push(marker);
        buf
    }

    fn audio_format(id: StreamId) -> Vec<u8> {
        let mut buf = Vec::new();
        AudioFormat {
            id,
            flags: 1,
            rate: 44_100,
            channels: 2,
            format: kinescope_common::AudioSampleFormat::S16Le,
        }
        .encode(&mut buf);
        buf
    }

    #[test]
    fn messages_are_routed_by_id_and_close_is_broadcast() {
        let session = Arc::new(Session::new());
        let bus = Buffer::new(1 << 20);
        let log: Log = Arc::new(Mutex::new(Vec::new()));

        push(&bus, Tag::VideoFormat, &video_format(1));
        push(&bus, Tag::VideoFormat, &video_format(2));
        push(&bus, Tag::AudioFormat, &audio_format(1));
        push(&bus, Tag::VideoData, &video_frame(1, 0xaa));
        push(&bus, Tag::VideoData, &video_frame(2, 0xbb));
        push(&bus, Tag::Close, &[]);

        run_demux(
            &session,
            &bus,
            &Recorder {
                log: log.clone(),
                fail_video_id: None,
            },
            DemuxOptions::default(),
        )
        .unwrap();

        let log = log.lock();

        // Per sink: its own messages plus the broadcast close.
        let for_video_1: Vec<&Tag> = log.iter().filter(|(id, ..)| *id == 1).map(|(_, t, _)| t).collect();
        assert_eq!(
            for_video_1,
            [&Tag::VideoFormat, &Tag::VideoData, &Tag::Close]
        );

        let closes = log.iter().filter(|(_, tag, _)| *tag == Tag::Close).count();
        assert_eq!(closes, 3);

        // Frames kept their stream affinity.
        assert!(log
            .iter()
            .any(|(id, tag, data)| *id == 2 && *tag == Tag::VideoData && data.ends_with(&[0xbb])));
        assert!(log.iter().any(|(id, tag, _)| *id == 1001 && *tag == Tag::AudioFormat));
    }

    #[test]
    fn dead_sink_only_takes_its_own_stream_down() {
        let session = Arc::new(Session::new());
        let bus = Buffer::new(1 << 20);
        let log: Log = Arc::new(Mutex::new(Vec::new()));

        push(&bus, Tag::VideoFormat, &video_format(1));
        push(&bus, Tag::VideoFormat, &video_format(2));
        // Stream 1's sink fails after its first message; these frames hit
        // a dead sub bus and the demuxer cleans it up.
        for _ in 0..20 {
            push(&bus, Tag::VideoData, &video_frame(1, 0x01));
        }
        push(&bus, Tag::VideoData, &video_frame(2, 0x02));
        push(&bus, Tag::Close, &[]);

        run_demux(
            &session,
            &bus,
            &Recorder {
                log: log.clone(),
                fail_video_id: Some(1),
            },
            DemuxOptions {
                video_buffer: 4096,
                audio_buffer: 4096,
            },
        )
        .unwrap();

        let log = log.lock();
        // Stream 2 survived to see its frame and the close.
        assert!(log
            .iter()
            .any(|(id, tag, data)| *id == 2 && *tag == Tag::VideoData && data.ends_with(&[0x02])));
        assert!(log.iter().any(|(id, tag, _)| *id == 2 && *tag == Tag::Close));
    }
}
