//! Stream player and converter.
//!
//! One binary, mutually exclusive action flags: dump stream info, export
//! to images/WAV/YUV4MPEG, print a single header field, or (the default)
//! replay the stream to a window and a PCM device.

use std::{path::PathBuf, process::exit, sync::Arc, thread};

use anyhow::{anyhow, bail, Result};
use clap::Parser;
use kinescope_bus::Buffer;
use kinescope_common::{init_logger, ColorCorrection, Session, SIGNATURE, VERSION};
use kinescope_export::{
    export_images, export_info, export_wav, export_yuv4mpeg, ImageKind, ImgOptions, InfoOptions,
    WavOptions, Y4mOptions,
};
use kinescope_pipeline::{
    spawn, ColorCorrect, Process, Scale, ScaleTarget, Stage, StreamSource, ToBgr, ToYcbcr, Unpack,
};
use kinescope_play::{run_demux, DemuxOptions, PlaybackSinks};
use log::LevelFilter;

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Options {
    /// Stream file to play or convert.
    file: PathBuf,

    /// Print stream information at the given detail level.
    #[arg(long, short = 'i')]
    info: Option<u32>,
    /// Export audio to WAV files matching the pattern (`%d` counter).
    #[arg(long, short = 'a')]
    wav: Option<String>,
    /// Export frames to BMP images matching the pattern (`%d` counter).
    #[arg(long, short = 'b')]
    bmp: Option<String>,
    /// Export frames to PNG images matching the pattern (`%d` counter).
    #[arg(long, short = 'p')]
    png: Option<String>,
    /// Export video to YUV4MPEG files matching the pattern (`%d` counter).
    #[arg(long, short = 'y')]
    yuv4mpeg: Option<String>,
    /// Print a single header field: signature, version, flags, fps, pid,
    /// name or date.
    #[arg(long, short = 's')]
    show: Option<String>,

    /// Override the frame rate used for pacing and export.
    #[arg(long, short = 'f')]
    fps: Option<f64>,
    /// Rescale video: a factor, or an absolute WxH size.
    #[arg(long, short = 'r')]
    resize: Option<String>,
    /// Override color correction: "brightness;contrast;red;green;blue".
    #[arg(long, short = 'g')]
    adjust: Option<String>,
    /// Audio scheduling slack in microseconds.
    #[arg(long, short = 'l', default_value_t = 200_000)]
    silence: u64,
    /// ALSA playback device.
    #[arg(long, short = 'd', default_value = "default")]
    device: String,
    /// Compressed buffer size in MiB.
    #[arg(long, short = 'c', default_value_t = 10)]
    compressed: usize,
    /// Uncompressed buffer size in MiB.
    #[arg(long, short = 'u', default_value_t = 10)]
    uncompressed: usize,
    /// Log verbosity, 0 (errors) to 4 (trace).
    #[arg(long, short = 'v', default_value_t = 0)]
    verbosity: u32,
}

enum Action {
    Play,
    Info(u32),
    Wav(String),
    Img(ImageKind, String),
    Yuv4mpeg(String),
    Show(String),
}

impl Options {
    fn action(&self) -> Result<Action> {
        let mut actions = Vec::new();
        if let Some(level) = self.info {
            actions.push(Action::Info(level));
        }
        if let Some(pattern) = &self.wav {
            actions.push(Action::Wav(pattern.clone()));
        }
        if let Some(pattern) = &self.bmp {
            actions.push(Action::Img(ImageKind::Bmp, pattern.clone()));
        }
        if let Some(pattern) = &self.png {
            actions.push(Action::Img(ImageKind::Png, pattern.clone()));
        }
        if let Some(pattern) = &self.yuv4mpeg {
            actions.push(Action::Yuv4mpeg(pattern.clone()));
        }
        if let Some(field) = &self.show {
            actions.push(Action::Show(field.clone()));
        }

        match actions.len() {
            0 => Ok(Action::Play),
            1 => Ok(actions.remove(0)),
            _ => bail!("only one action may be selected"),
        }
    }

    fn scale_target(&self) -> Result<Option<ScaleTarget>> {
        let Some(spec) = &self.resize else {
            return Ok(None);
        };

        if let Some((w, h)) = spec.split_once('x') {
            let w = w.parse().map_err(|_| anyhow!("bad resize width"))?;
            let h = h.parse().map_err(|_| anyhow!("bad resize height"))?;
            return Ok(Some(ScaleTarget::Size(w, h)));
        }

        let factor: f64 = spec.parse().map_err(|_| anyhow!("bad resize factor"))?;
        if factor <= 0.0 {
            bail!("resize factor must be positive");
        }
        Ok(if factor == 1.0 {
            None
        } else {
            Some(ScaleTarget::Factor(factor))
        })
    }

    fn color_override(&self) -> Result<Option<ColorCorrection>> {
        let Some(spec) = &self.adjust else {
            return Ok(None);
        };

        let values: Vec<f32> = spec
            .split(';')
            .map(|v| v.parse())
            .collect::<Result<_, _>>()
            .map_err(|_| anyhow!("bad adjust specification"))?;
        let [brightness, contrast, red, green, blue] = values[..] else {
            bail!("adjust takes brightness;contrast;red;green;blue");
        };

        Ok(Some(ColorCorrection {
            id: 0,
            brightness,
            contrast,
            red,
            green,
            blue,
        }))
    }
}

/// One link in the replay chain: spawn `stage` reading `from`, return the
/// bus it drains into.
fn link<S: Stage>(
    processes: &mut Vec<Process>,
    buses: &mut Vec<Buffer>,
    from: &Buffer,
    size: usize,
    stage: S,
) -> Result<Buffer> {
    let to = Buffer::new(size);
    buses.push(to.clone());
    processes.push(spawn(stage, from, Some(&to), 0)?);
    Ok(to)
}

fn run() -> Result<()> {
    let options = Options::parse();

    let level = match options.verbosity {
        0 => LevelFilter::Error,
        1 => LevelFilter::Warn,
        2 => LevelFilter::Info,
        3 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    init_logger(level, None)?;

    let source = StreamSource::open(&options.file)?;
    let info = source.info().clone();
    let fps = options.fps.unwrap_or(info.fps);
    let action = options.action()?;

    if let Action::Show(field) = &action {
        match field.as_str() {
            "signature" => println!("0x{:08x}", SIGNATURE),
            "version" => println!("{}", VERSION),
            "flags" => println!("{}", info.flags),
            "fps" => println!("{}", info.fps),
            "pid" => println!("{}", info.pid),
            "name" => println!("{}", info.name),
            "date" => println!("{}", info.date),
            other => bail!("unknown header field \"{}\"", other),
        }
        return Ok(());
    }

    let session = Arc::new(Session::new());
    let compressed_size = options.compressed * 1024 * 1024;
    let uncompressed_size = options.uncompressed * 1024 * 1024;

    let mut processes = Vec::new();
    let mut buses = Vec::new();

    let head = Buffer::new(compressed_size);
    buses.push(head.clone());
    let mut bus = link(
        &mut processes,
        &mut buses,
        &head,
        uncompressed_size,
        Unpack,
    )?;

    let color = match options.color_override()? {
        Some(correction) => ColorCorrect::with_override(correction),
        None => ColorCorrect::new(),
    };
    let scale = options.scale_target()?;

    match &action {
        Action::Play | Action::Img(..) => {
            bus = link(&mut processes, &mut buses, &bus, uncompressed_size, ToBgr::new())?;
            bus = link(&mut processes, &mut buses, &bus, uncompressed_size, color)?;
            if let Some(target) = scale {
                bus = link(
                    &mut processes,
                    &mut buses,
                    &bus,
                    uncompressed_size,
                    Scale::new(target),
                )?;
            }
        }
        Action::Yuv4mpeg(_) => {
            bus = link(&mut processes, &mut buses, &bus, uncompressed_size, color)?;
            if let Some(target) = scale {
                bus = link(
                    &mut processes,
                    &mut buses,
                    &bus,
                    uncompressed_size,
                    Scale::new(target),
                )?;
            }
            bus = link(
                &mut processes,
                &mut buses,
                &bus,
                uncompressed_size,
                ToYcbcr::new(1.0),
            )?;
        }
        _ => (),
    }

    let pump = thread::Builder::new()
        .name("stream-source".to_owned())
        .spawn(move || source.pump(&head))?;

    let sink_result: Result<()> = match action {
        Action::Play => {
            let sinks = PlaybackSinks {
                fps,
                device: options.device.clone(),
                silence_threshold: options.silence,
            };
            run_demux(&session, &bus, &sinks, DemuxOptions::default()).map_err(Into::into)
        }
        Action::Info(level) => export_info(
            &bus,
            &info,
            InfoOptions { level },
            &mut std::io::stdout().lock(),
        )
        .map(|_| ())
        .map_err(Into::into),
        Action::Wav(pattern) => export_wav(
            &bus,
            &WavOptions {
                pattern,
                silence_threshold: options.silence,
            },
        )
        .map(|_| ())
        .map_err(Into::into),
        Action::Img(kind, pattern) => export_images(
            &bus,
            &ImgOptions {
                kind,
                pattern,
                fps,
            },
        )
        .map(|_| ())
        .map_err(Into::into),
        Action::Yuv4mpeg(pattern) => export_yuv4mpeg(&bus, &Y4mOptions { pattern, fps })
            .map(|_| ())
            .map_err(Into::into),
        Action::Show(_) => unreachable!("handled before the pipeline starts"),
    };

    if sink_result.is_err() {
        // Poison the chain so every worker and the pump unwind.
        for bus in &buses {
            bus.cancel();
        }
    }

    for process in processes {
        if let Err(err) = process.join() {
            log::error!("pipeline: {}", err);
        }
    }
    match pump.join() {
        Ok(result) => result?,
        Err(_) => bail!("stream source thread panicked"),
    }

    sink_result
}

fn main() {
    if let Err(err) = run() {
        eprintln!("kinescope-play: {:#}", err);
        exit(1);
    }
}
