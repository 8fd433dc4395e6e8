//! Capture library configuration from the process environment.
//!
//! Every knob lives under the `KINESCOPE_` prefix so a preloaded host
//! process can be configured without touching its command line.

use std::path::PathBuf;

use kinescope_pipeline::Codec;
use log::LevelFilter;

use crate::CaptureError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Colorspace {
    Ycbcr420Jpeg,
    Bgr,
}

/// `<Ctrl>` / `<Shift>` prefixes followed by a key symbol name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hotkey {
    pub ctrl: bool,
    pub shift: bool,
    pub key: String,
}

impl Hotkey {
    pub fn parse(spec: &str) -> Result<Self, CaptureError> {
        let mut rest = spec.trim();
        let mut ctrl = false;
        let mut shift = false;

        loop {
            let lower = rest.to_ascii_lowercase();
            if lower.starts_with("<ctrl>") {
                ctrl = true;
                rest = &rest[6..];
            } else if lower.starts_with("<shift>") {
                shift = true;
                rest = &rest[7..];
            } else {
                break;
            }
        }

        if rest.is_empty() {
            return Err(CaptureError::InvalidOption("HOTKEY", spec.to_owned()));
        }

        Ok(Self {
            ctrl,
            shift,
            key: rest.to_owned(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Crop {
    pub width: u32,
    pub height: u32,
    pub x: u32,
    pub y: u32,
}

impl Crop {
    /// `WxH+X+Y`.
    fn parse(spec: &str) -> Option<Self> {
        let (size, origin) = spec.split_once('+')?;
        let (w, h) = size.split_once('x')?;
        let (x, y) = origin.split_once('+')?;

        Some(Self {
            width: w.parse().ok()?,
            height: h.parse().ok()?,
            x: x.parse().ok()?,
            y: y.parse().ok()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Begin capturing at process start instead of waiting for the hotkey.
    pub start: bool,
    pub file: PathBuf,
    pub fps: f64,
    pub colorspace: Colorspace,
    pub hotkey: Hotkey,
    pub scale: f64,
    pub crop: Option<Crop>,
    pub capture_front: bool,
    pub compress: Option<Codec>,
    pub compressed_size: usize,
    pub uncompressed_size: usize,
    pub unscaled_size: usize,
    pub audio: bool,
    pub audio_skip: bool,
    pub indicator: bool,
    pub lock_fps: bool,
    pub try_pbo: bool,
    pub dword_aligned: bool,
    pub log_level: LevelFilter,
    pub log_file: Option<PathBuf>,
    pub sighandler: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            start: false,
            file: PathBuf::from(format!("capture-{}.glc", std::process::id())),
            fps: 30.0,
            colorspace: Colorspace::Ycbcr420Jpeg,
            hotkey: Hotkey {
                ctrl: false,
                shift: true,
                key: "F8".to_owned(),
            },
            scale: 1.0,
            crop: None,
            capture_front: true,
            compress: None,
            compressed_size: 10 * 1024 * 1024,
            uncompressed_size: 10 * 1024 * 1024,
            unscaled_size: 25 * 1024 * 1024,
            audio: true,
            audio_skip: true,
            indicator: false,
            lock_fps: false,
            try_pbo: true,
            dword_aligned: true,
            log_level: LevelFilter::Error,
            log_file: None,
            sighandler: false,
        }
    }
}

fn var(key: &str) -> Option<String> {
    std::env::var(format!("KINESCOPE_{}", key)).ok()
}

fn flag(key: &str, default: bool) -> bool {
    var(key).map(|v| v != "0").unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self, CaptureError> {
        let mut config = Self::default();

        config.start = flag("START", config.start);

        if let Some(file) = var("FILE") {
            config.file = PathBuf::from(file.replace("%d", &std::process::id().to_string()));
        }
        if let Some(fps) = var("FPS") {
            config.fps = fps
                .parse::<f64>()
                .ok()
                .filter(|fps| *fps > 0.0)
                .ok_or(CaptureError::InvalidOption("FPS", fps))?;
        }
        if let Some(cs) = var("COLORSPACE") {
            config.colorspace = match cs.as_str() {
                "420jpeg" => Colorspace::Ycbcr420Jpeg,
                "bgr" => Colorspace::Bgr,
                _ => return Err(CaptureError::InvalidOption("COLORSPACE", cs)),
            };
        }
        if let Some(hotkey) = var("HOTKEY") {
            config.hotkey = Hotkey::parse(&hotkey)?;
        }
        if let Some(scale) = var("SCALE") {
            config.scale = scale
                .parse::<f64>()
                .ok()
                .filter(|s| *s > 0.0)
                .ok_or(CaptureError::InvalidOption("SCALE", scale))?;
        }
        if let Some(crop) = var("CROP") {
            config.crop =
                Some(Crop::parse(&crop).ok_or(CaptureError::InvalidOption("CROP", crop))?);
        }
        if let Some(buffer) = var("CAPTURE") {
            config.capture_front = match buffer.as_str() {
                "front" => true,
                "back" => false,
                _ => return Err(CaptureError::InvalidOption("CAPTURE", buffer)),
            };
        }
        if let Some(compress) = var("COMPRESS") {
            config.compress = match compress.as_str() {
                "lzo" => Some(Codec::Lzo),
                "quicklz" => Some(Codec::QuickLz),
                "none" | "" => None,
                _ => return Err(CaptureError::InvalidOption("COMPRESS", compress)),
            };
        }
        fn buffer_size(key: &'static str, slot: &mut usize) -> Result<(), CaptureError> {
            if let Some(mib) = var(key) {
                *slot = mib
                    .parse::<usize>()
                    .ok()
                    .filter(|m| *m > 0)
                    .map(|m| m * 1024 * 1024)
                    .ok_or(CaptureError::InvalidOption(key, mib))?;
            }
            Ok(())
        }
        buffer_size("COMPRESSED_BUFFER_SIZE", &mut config.compressed_size)?;
        buffer_size("UNCOMPRESSED_BUFFER_SIZE", &mut config.uncompressed_size)?;
        buffer_size("UNSCALED_BUFFER_SIZE", &mut config.unscaled_size)?;
        config.audio = flag("AUDIO", config.audio);
        config.audio_skip = flag("AUDIO_SKIP", config.audio_skip);
        config.indicator = flag("INDICATOR", config.indicator);
        config.lock_fps = flag("LOCK_FPS", config.lock_fps);
        config.try_pbo = flag("TRY_PBO", config.try_pbo);
        config.dword_aligned = flag("CAPTURE_DWORD_ALIGNED", config.dword_aligned);
        config.sighandler = flag("SIGHANDLER", config.sighandler);

        if let Some(level) = var("LOG") {
            config.log_level = match level.as_str() {
                "0" => LevelFilter::Error,
                "1" => LevelFilter::Warn,
                "2" => LevelFilter::Info,
                "3" => LevelFilter::Debug,
                "4" => LevelFilter::Trace,
                _ => return Err(CaptureError::InvalidOption("LOG", level)),
            };
        }
        if let Some(file) = var("LOG_FILE") {
            config.log_file = Some(PathBuf::from(
                file.replace("%d", &std::process::id().to_string()),
            ));
        }

        Ok(config)
    }
}
