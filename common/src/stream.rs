use std::io::{Read, Write};

use bytes::{Buf, BufMut};
use chrono::Local;

use crate::FormatError;

/// "GLC\0", the stream file signature.
pub const SIGNATURE: u32 = 0x00434C47;
pub const VERSION: u32 = 3;

const FIXED_HEADER_SIZE: usize = 4 + 4 + 8 + 4 + 4 + 4 + 4;

/// The stream file header. Written once before the first envelope; readers
/// refuse a mismatched signature or an unsupported version.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamInfo {
    pub fps: f64,
    pub flags: u32,
    pub pid: u32,
    pub name: String,
    pub date: String,
}

impl StreamInfo {
    /// Populate a header for the current process: captor pid, executable
    /// path as the stream name and the local date.
    pub fn new(fps: f64) -> Self {
        let name = std::env::current_exe()
            .ok()
            .and_then(|p| p.to_str().map(|s| s.to_owned()))
            .unwrap_or_default();

        Self {
            fps,
            flags: 0,
            pid: std::process::id(),
            name,
            date: Local::now().format("%a %b %e %H:%M:%S %Y").to_string(),
        }
    }

    pub fn write_to(&self, to: &mut impl Write) -> Result<(), FormatError> {
        let mut buf = Vec::with_capacity(FIXED_HEADER_SIZE + self.name.len() + self.date.len() + 2);
        buf.put_u32_le(SIGNATURE);
        buf.put_u32_le(VERSION);
        buf.put_f64_le(self.fps);
        buf.put_u32_le(self.flags);
        buf.put_u32_le(self.pid);
        // Sizes include the terminating NUL.
        buf.put_u32_le(self.name.len() as u32 + 1);
        buf.put_u32_le(self.date.len() as u32 + 1);
        buf.put_slice(self.name.as_bytes());
        buf.put_u8(0);
        buf.put_slice(self.date.as_bytes());
        buf.put_u8(0);

        to.write_all(&buf)?;
        Ok(())
    }

    pub fn read_from(from: &mut impl Read) -> Result<Self, FormatError> {
        let mut fixed = [0u8; FIXED_HEADER_SIZE];
        from.read_exact(&mut fixed)?;
        let mut buf = &fixed[..];

        let signature = buf.get_u32_le();
        if signature != SIGNATURE {
            return Err(FormatError::BadSignature(signature));
        }

        let version = buf.get_u32_le();
        if version != VERSION {
            return Err(FormatError::BadVersion(version));
        }

        let fps = buf.get_f64_le();
        let flags = buf.get_u32_le();
        let pid = buf.get_u32_le();
        let name_size = buf.get_u32_le() as usize;
        let date_size = buf.get_u32_le() as usize;

        let mut name = vec![0u8; name_size];
        from.read_exact(&mut name)?;
        let mut date = vec![0u8; date_size];
        from.read_exact(&mut date)?;

        Ok(Self {
            fps,
            flags,
            pid,
            name: string_from_nul_terminated(name),
            date: string_from_nul_terminated(date),
        })
    }
}

fn string_from_nul_terminated(mut bytes: Vec<u8>) -> String {
    if bytes.last() == Some(&0) {
        bytes.pop();
    }
    String::from_utf8_lossy(&bytes).into_owned()
}
