//! Stream file writer and reader.
//!
//! On disk every envelope is a 1 byte tag, an 8 byte payload size and the
//! payload. The writer flattens container envelopes so the file carries
//! the codec payload directly under its codec tag; the reader feeds
//! envelopes back onto a bus and synthesises the terminating close
//! envelope when a file was cut short.

use std::{
    fs::File,
    io::{BufReader, BufWriter, Read, Write},
    path::Path,
};

use bytes::BufMut;
use kinescope_bus::{Buffer, BusError};
use kinescope_common::{ContainerHeader, StreamInfo, Tag, CONTAINER_HEADER_SIZE};
use parking_lot::Mutex;

use crate::{PipelineError, Stage, StageCtl};

/// Write the terminating close envelope onto a bus.
pub fn write_end_of_stream(to: &Buffer) -> Result<(), BusError> {
    let mut writer = to.writer();
    let mut packet = writer.open()?;
    packet.write(&[Tag::Close as u8])?;
    packet.close()
}

/// Sink stage persisting a bus to a stream file. Run with a single worker;
/// envelope order on disk is bus order.
pub struct FileWriter {
    to: Mutex<BufWriter<File>>,
}

impl FileWriter {
    pub fn create(path: &Path, info: &StreamInfo) -> Result<Self, PipelineError> {
        log::info!("opening {:?} for stream", path);

        let mut to = BufWriter::new(File::create(path)?);
        info.write_to(&mut to)?;

        Ok(Self { to: Mutex::new(to) })
    }
}

impl Stage for FileWriter {
    type Worker = ();

    fn name(&self) -> &'static str {
        "file"
    }

    fn start_worker(&self) -> Result<(), PipelineError> {
        Ok(())
    }

    fn on_read(
        &self,
        ctl: &mut StageCtl,
        data: &[u8],
        _worker: &mut (),
    ) -> Result<(), PipelineError> {
        let mut to = self.to.lock();
        let mut head = Vec::with_capacity(16);

        if ctl.tag == Tag::Container {
            let container = ContainerHeader::decode(&mut &data[..])?;
            head.put_u8(container.tag as u8);
            head.put_u64_le(container.size);
            to.write_all(&head)?;
            to.write_all(&data[CONTAINER_HEADER_SIZE..])?;
        } else {
            head.put_u8(ctl.tag as u8);
            head.put_u64_le(data.len() as u64);
            to.write_all(&head)?;
            to.write_all(data)?;
        }

        if ctl.tag == Tag::Close {
            to.flush()?;
        }
        Ok(())
    }

    fn finish(&self, err: Option<&PipelineError>) {
        if let Some(err) = err {
            log::error!("file: {}", err);
        }
        if let Err(err) = self.to.lock().flush() {
            log::error!("file: can't flush stream: {}", err);
        }
    }
}

/// A stream file opened for replay. The header is validated eagerly so the
/// caller can inspect fps and friends before pumping the envelopes.
pub struct StreamSource {
    from: BufReader<File>,
    info: StreamInfo,
}

impl StreamSource {
    pub fn open(path: &Path) -> Result<Self, PipelineError> {
        let mut from = BufReader::new(File::open(path)?);
        let info = StreamInfo::read_from(&mut from)?;
        Ok(Self { from, info })
    }

    pub fn info(&self) -> &StreamInfo {
        &self.info
    }

    /// Feed every envelope onto `to` until the close envelope, the end of
    /// the file or bus cancellation. A truncated file gets its close
    /// envelope synthesised so downstream still terminates cleanly.
    pub fn pump(mut self, to: &Buffer) -> Result<(), PipelineError> {
        let mut writer = to.writer();

        let result = loop {
            let mut head = [0u8; 9];
            match self.from.read_exact(&mut head) {
                Ok(()) => (),
                Err(_) => break Err(()),
            }
            let tag = head[0];
            let size = u64::from_le_bytes(head[1..9].try_into().unwrap_or_default()) as usize;

            let mut packet = match writer.open() {
                Ok(packet) => packet,
                Err(BusError::Interrupted) => return Ok(()),
                Err(err) => return Err(err.into()),
            };
            packet.write(&[tag])?;
            let dma = packet.dma(size)?;
            if self.from.read_exact(dma).is_err() {
                break Err(());
            }
            packet.close()?;

            if tag == Tag::Close as u8 {
                break Ok(());
            }
        };

        if result.is_err() {
            log::error!("unexpected end of stream, synthesising close");
            match write_end_of_stream(to) {
                Ok(()) | Err(BusError::Interrupted) => (),
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spawn;
    use kinescope_common::FormatError;

    fn push(bus: &Buffer, tag: Tag, payload: &[u8]) {
        let mut writer = bus.writer();
        let mut packet = writer.open().unwrap();
        packet.write(&[tag as u8]).unwrap();
        packet.write(payload).unwrap();
        packet.close().unwrap();
    }

    fn pull(bus: &Buffer) -> (Tag, Vec<u8>) {
        let mut reader = bus.reader();
        let mut packet = reader.open().unwrap();
        let mut tag = [0u8];
        packet.read(&mut tag).unwrap();
        (Tag::try_from(tag[0]).unwrap(), packet.rest().to_vec())
    }

    #[test]
    fn envelopes_roundtrip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.glc");
        let info = StreamInfo::new(30.0);

        let bus = Buffer::new(1 << 20);
        let writer = spawn(FileWriter::create(&path, &info).unwrap(), &bus, None, 1).unwrap();

        push(&bus, Tag::VideoFormat, &[1u8; 17]);
        push(&bus, Tag::VideoData, &[2u8; 64]);
        push(&bus, Tag::Close, &[]);
        writer.join().unwrap();

        let source = StreamSource::open(&path).unwrap();
        assert_eq!(source.info().fps, 30.0);

        let replay = Buffer::new(1 << 20);
        source.pump(&replay).unwrap();

        assert_eq!(pull(&replay), (Tag::VideoFormat, vec![1u8; 17]));
        assert_eq!(pull(&replay), (Tag::VideoData, vec![2u8; 64]));
        assert_eq!(pull(&replay).0, Tag::Close);
    }

    #[test]
    fn container_envelopes_are_flattened_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.glc");

        let bus = Buffer::new(1 << 20);
        let writer = spawn(
            FileWriter::create(&path, &StreamInfo::new(30.0)).unwrap(),
            &bus,
            None,
            1,
        )
        .unwrap();

        let inner = [9u8, 9, 9, 9];
        let mut payload = Vec::new();
        ContainerHeader {
            size: inner.len() as u64,
            tag: Tag::Lzo,
        }
        .encode(&mut payload);
        payload.extend_from_slice(&inner);

        push(&bus, Tag::Container, &payload);
        push(&bus, Tag::Close, &[]);
        writer.join().unwrap();

        let replay = Buffer::new(1 << 20);
        StreamSource::open(&path).unwrap().pump(&replay).unwrap();
        assert_eq!(pull(&replay), (Tag::Lzo, inner.to_vec()));
    }

    #[test]
    fn capture_with_no_frames_leaves_a_valid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.glc");

        let bus = Buffer::new(4096);
        let writer = spawn(
            FileWriter::create(&path, &StreamInfo::new(30.0)).unwrap(),
            &bus,
            None,
            1,
        )
        .unwrap();
        write_end_of_stream(&bus).unwrap();
        writer.join().unwrap();

        let replay = Buffer::new(4096);
        StreamSource::open(&path).unwrap().pump(&replay).unwrap();
        assert_eq!(pull(&replay).0, Tag::Close);
    }

    #[test]
    fn bad_signature_refuses_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bogus.glc");
        std::fs::write(&path, b"not a stream file at all........").unwrap();

        match StreamSource::open(&path) {
            Err(PipelineError::Format(FormatError::BadSignature(_))) => (),
            other => panic!("expected signature refusal, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn truncated_file_synthesises_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cut.glc");

        let bus = Buffer::new(1 << 20);
        let writer = spawn(
            FileWriter::create(&path, &StreamInfo::new(30.0)).unwrap(),
            &bus,
            None,
            1,
        )
        .unwrap();
        push(&bus, Tag::VideoData, &[5u8; 32]);
        push(&bus, Tag::Close, &[]);
        writer.join().unwrap();

        // Chop off the close envelope and part of the frame.
        let len = std::fs::metadata(&path).unwrap().len();
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 20).unwrap();

        let replay = Buffer::new(1 << 20);
        StreamSource::open(&path).unwrap().pump(&replay).unwrap();
        assert_eq!(pull(&replay).0, Tag::Close);
    }
}
