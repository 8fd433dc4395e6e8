//! WAV export for one audio stream.
//!
//! Every format envelope starts a fresh output file, so a stream that
//! renegotiates mid-capture exports as a numbered series. Capture time
//! gaps beyond the silence threshold are filled with silence; data behind
//! the writer's clock is dropped.

use std::{fs::File, io::BufWriter};

use hound::{SampleFormat, WavSpec, WavWriter};
use kinescope_bus::{Buffer, BusError};
use kinescope_common::{
    AudioDataHeader, AudioFormat, AudioSampleFormat, Tag, AUDIO_DATA_HEADER_SIZE,
};

use crate::{pattern_path, ExportError};

#[derive(Debug, Clone)]
pub struct WavOptions {
    /// Filename pattern with a `%d` file counter.
    pub pattern: String,
    /// Capture time gap that becomes inserted silence, in microseconds.
    pub silence_threshold: u64,
}

struct Output {
    writer: WavWriter<BufWriter<File>>,
    format: AudioFormat,
    /// Stream position in capture time.
    time: u64,
}

/// Drain `from` into WAV files. Returns the number of files written.
pub fn export_wav(from: &Buffer, options: &WavOptions) -> Result<usize, ExportError> {
    let mut reader = from.reader();
    let mut output: Option<Output> = None;
    let mut stream_id = None;
    let mut file_count = 0usize;

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
            Tag::AudioFormat => {
                let fmt = AudioFormat::decode(&mut packet.rest())?;
                // Follow the first audio stream in the file.
                if *stream_id.get_or_insert(fmt.id) != fmt.id {
                    continue;
                }

                if let Some(output) = output.take() {
                    output.writer.finalize()?;
                }

                let path = pattern_path(&options.pattern, file_count);
                log::info!("opening {:?} for writing", path);
                file_count += 1;

                let spec = WavSpec {
                    channels: fmt.channels as u16,
                    sample_rate: fmt.rate,
                    bits_per_sample: fmt.format.bits(),
                    sample_format: SampleFormat::Int,
                };
                output = Some(Output {
                    writer: WavWriter::create(path, spec)?,
                    format: fmt,
                    time: 0,
                });
            }
            Tag::AudioData => {
                let data = packet.rest();
                let header = AudioDataHeader::decode(&mut &data[..])?;
                let Some(out) = output.as_mut() else { continue };
                if Some(header.id) != stream_id {
                    continue;
                }

                let samples = &data[AUDIO_DATA_HEADER_SIZE..];
                let frames = samples.len() / out.format.bytes_per_frame().max(1);
                let duration = 1_000_000 * frames as u64 / out.format.rate.max(1) as u64;

                if out.time + options.silence_threshold < header.time {
                    let silent =
                        (header.time - out.time) * out.format.rate as u64 / 1_000_000;
                    for _ in 0..silent * out.format.channels as u64 {
                        write_sample(out, &[0u8; 4])?;
                    }
                    out.time = header.time;
                } else if out.time > header.time + options.silence_threshold {
                    log::debug!("dropped audio data, writer is ahead");
                    continue;
                }

                write_block(out, samples)?;
                out.time += duration;
            }
            _ => (),
        }
    }

    if let Some(output) = output.take() {
        output.writer.finalize()?;
    }
    log::info!("{} wav files written", file_count);
    Ok(file_count)
}

fn write_block(out: &mut Output, samples: &[u8]) -> Result<(), ExportError> {
    let ssize = out.format.format.bytes_per_sample();

    if out.format.interleaved() {
        for sample in samples.chunks_exact(ssize) {
            write_sample(out, sample)?;
        }
    } else {
        // Planar: interleave on the way out.
        let channels = out.format.channels as usize;
        let channel_bytes = samples.len() / channels.max(1);
        let frames = channel_bytes / ssize;
        for f in 0..frames {
            for c in 0..channels {
                let at = c * channel_bytes + f * ssize;
                write_sample(out, &samples[at..at + ssize])?;
            }
        }
    }
    Ok(())
}

fn write_sample(out: &mut Output, bytes: &[u8]) -> Result<(), ExportError> {
    match out.format.format {
        AudioSampleFormat::S16Le => {
            let v = i16::from_le_bytes([bytes[0], bytes[1]]);
            out.writer.write_sample(v)?;
        }
        AudioSampleFormat::S24Le => {
            // 24 bit value in a 4 byte container; sign extend.
            let v = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            out.writer.write_sample((v << 8) >> 8)?;
        }
        AudioSampleFormat::S32Le => {
            let v = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            out.writer.write_sample(v)?;
        }
    }
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

    fn format_payload(fmt: &AudioFormat) -> Vec<u8> {
        let mut buf = Vec::new();
        fmt.encode(&mut buf);
        buf
    }

    fn data_payload(id: u32, time: u64, samples: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        AudioDataHeader {
            id,
            time,
            size: samples.len() as u64,
        }
        .encode(&mut buf);
        buf.extend_from_slice(samples);
        buf
    }

    #[test]
    fn stereo_s16_blocks_roundtrip_through_wav() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = dir.path().join("audio-%d.wav");
        let bus = Buffer::new(1 << 20);

        let fmt = AudioFormat {
            id: 1,
            flags: 1,
            rate: 44_100,
            channels: 2,
            format: AudioSampleFormat::S16Le,
        };
        push(&bus, Tag::AudioFormat, &format_payload(&fmt));

        let samples: Vec<u8> = (0..256u16)
            .flat_map(|n| (n as i16).to_le_bytes())
            .collect();
        push(&bus, Tag::AudioData, &data_payload(1, 0, &samples));
        push(&bus, Tag::Close, &[]);

        let files = export_wav(
            &bus,
            &WavOptions {
                pattern: pattern.to_str().unwrap().to_owned(),
                silence_threshold: 200_000,
            },
        )
        .unwrap();
        assert_eq!(files, 1);

        let mut reader =
            hound::WavReader::open(dir.path().join("audio-00000000.wav")).unwrap();
        assert_eq!(reader.spec().channels, 2);
        assert_eq!(reader.spec().sample_rate, 44_100);
        let read: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(read.len(), 256);
        assert_eq!(read[5], 5);
    }

    #[test]
    fn format_switch_starts_a_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = dir.path().join("a%d.wav");
        let bus = Buffer::new(1 << 20);

        let mut fmt = AudioFormat {
            id: 1,
            flags: 1,
            rate: 44_100,
            channels: 2,
            format: AudioSampleFormat::S16Le,
        };
        push(&bus, Tag::AudioFormat, &format_payload(&fmt));
        push(&bus, Tag::AudioData, &data_payload(1, 0, &[0u8; 64]));

        fmt.rate = 48_000;
        fmt.channels = 1;
        push(&bus, Tag::AudioFormat, &format_payload(&fmt));
        push(&bus, Tag::AudioData, &data_payload(1, 0, &[0u8; 64]));
        push(&bus, Tag::Close, &[]);

        let files = export_wav(
            &bus,
            &WavOptions {
                pattern: pattern.to_str().unwrap().to_owned(),
                silence_threshold: 200_000,
            },
        )
        .unwrap();
        assert_eq!(files, 2);

        let second = hound::WavReader::open(dir.path().join("a00000001.wav")).unwrap();
        assert_eq!(second.spec().sample_rate, 48_000);
        assert_eq!(second.spec().channels, 1);
    }

    #[test]
    fn capture_gaps_become_silence() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = dir.path().join("s%d.wav");
        let bus = Buffer::new(1 << 20);

        let fmt = AudioFormat {
            id: 1,
            flags: 1,
            rate: 8_000,
            channels: 1,
            format: AudioSampleFormat::S16Le,
        };
        push(&bus, Tag::AudioFormat, &format_payload(&fmt));
        // 8 frames at t=0, then 8 more after a full second of nothing.
        push(&bus, Tag::AudioData, &data_payload(1, 0, &[1u8; 16]));
        push(&bus, Tag::AudioData, &data_payload(1, 1_001_000, &[1u8; 16]));
        push(&bus, Tag::Close, &[]);

        export_wav(
            &bus,
            &WavOptions {
                pattern: pattern.to_str().unwrap().to_owned(),
                silence_threshold: 200_000,
            },
        )
        .unwrap();

        let reader = hound::WavReader::open(dir.path().join("s00000000.wav")).unwrap();
        // 16 real frames plus roughly one second of silence at 8 kHz.
        let total = reader.len();
        assert!(total > 8_000, "only {} samples written", total);
    }
}
