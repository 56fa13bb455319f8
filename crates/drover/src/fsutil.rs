//! Filesystem helpers shared by the cursor store and the file-backed
//! source and destination drivers.
//!
//! The drivers persist append-only logs of checksummed frames:
//!
//! ```text
//! file header: | magic(4) | version(4) |
//! frame:       | magic(4) | len(4)     | payload(len) | sha1(20) |
//! ```
//!
//! A frame that stops short of its declared length at the end of the file
//! is the footprint of a crashed append ([`FrameError::Torn`]); anything
//! else malformed is corruption.

use std::fs;
use std::io::Write;
use std::path::Path;

use sha1::{Digest, Sha1};
use tracing::warn;

use drover_proto::error::DroverResult;

pub const FILE_HEADER_SIZE: usize = 8;
pub const FRAME_HEADER_SIZE: usize = 8;
pub const CHECKSUM_SIZE: usize = 20;

/// Atomic write: write data to a temporary file, sync, then rename into
/// place. The temp file is created in the same directory as `target` to
/// guarantee same-filesystem rename, so a crash mid-write never leaves a
/// torn file behind.
pub fn atomic_write(target: &Path, data: &[u8]) -> DroverResult<()> {
    let dir = target.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;

    // Tmp name includes the target name: concurrent writers to different
    // files in one directory must not collide.
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_path = dir.join(format!(".tmp_{}_{}", std::process::id(), name));

    let mut file = fs::File::create(&tmp_path)?;
    if let Err(e) = file.write_all(data).and_then(|_| file.sync_all()) {
        warn!("failed to write tmp file {}: {}", tmp_path.display(), e);
        let _ = fs::remove_file(&tmp_path);
        return Err(e.into());
    }
    drop(file);

    if let Err(e) = fs::rename(&tmp_path, target) {
        warn!(
            "failed to rename {} -> {}: {}",
            tmp_path.display(),
            target.display(),
            e
        );
        let _ = fs::remove_file(&tmp_path);
        return Err(e.into());
    }
    Ok(())
}

#[derive(Debug)]
pub enum FrameError {
    /// Incomplete frame at the end of the file.
    Torn,
    Corrupt(String),
}

/// The 8-byte file header for a log with the given magic and version.
pub fn file_header(magic: u32, version: u32) -> [u8; 8] {
    let mut h = [0u8; 8];
    h[..4].copy_from_slice(&magic.to_le_bytes());
    h[4..].copy_from_slice(&version.to_le_bytes());
    h
}

/// Validate a log file's header.
pub fn check_header(data: &[u8], magic: u32, version: u32) -> Result<(), String> {
    if data.len() < FILE_HEADER_SIZE {
        return Err("file shorter than its header".into());
    }
    let m = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    let v = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    if m != magic {
        return Err(format!("bad magic {m:#010x}"));
    }
    if v != version {
        return Err(format!("unsupported version {v}"));
    }
    Ok(())
}

/// Frame a payload for appending: header, payload, checksum.
pub fn encode_frame(magic: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len() + CHECKSUM_SIZE);
    out.extend_from_slice(&magic.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    let digest: [u8; 20] = Sha1::digest(payload).into();
    out.extend_from_slice(&digest);
    out
}

/// Parse one frame from the front of `buf`. Returns the payload slice and
/// the total frame size.
pub fn parse_frame(magic: u32, buf: &[u8]) -> Result<(&[u8], usize), FrameError> {
    if buf.len() < FRAME_HEADER_SIZE {
        return Err(FrameError::Torn);
    }
    let m = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if m != magic {
        return Err(FrameError::Corrupt("bad frame magic".into()));
    }
    let len = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
    let total = FRAME_HEADER_SIZE + len + CHECKSUM_SIZE;
    if buf.len() < total {
        return Err(FrameError::Torn);
    }
    let payload = &buf[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + len];
    let stored = &buf[FRAME_HEADER_SIZE + len..total];
    let digest: [u8; 20] = Sha1::digest(payload).into();
    if digest != stored {
        return Err(FrameError::Corrupt("frame checksum mismatch".into()));
    }
    Ok((payload, total))
}

/// Total on-disk size of a frame with a `len`-byte payload.
pub fn frame_size(len: u32) -> usize {
    FRAME_HEADER_SIZE + len as usize + CHECKSUM_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_round_trip() {
        let frame = encode_frame(0xabcd, b"payload");
        let (payload, total) = parse_frame(0xabcd, &frame).unwrap();
        assert_eq!(payload, b"payload");
        assert_eq!(total, frame.len());
    }

    #[test]
    fn test_frame_torn_and_corrupt() {
        let frame = encode_frame(0xabcd, b"payload");
        assert!(matches!(
            parse_frame(0xabcd, &frame[..frame.len() - 1]),
            Err(FrameError::Torn)
        ));
        let mut bad = frame.clone();
        bad[FRAME_HEADER_SIZE + 1] ^= 0xff;
        assert!(matches!(
            parse_frame(0xabcd, &bad),
            Err(FrameError::Corrupt(_))
        ));
        assert!(matches!(
            parse_frame(0x1234, &frame),
            Err(FrameError::Corrupt(_))
        ));
    }

    #[test]
    fn test_header_check() {
        let h = file_header(7, 1);
        assert!(check_header(&h, 7, 1).is_ok());
        assert!(check_header(&h, 8, 1).is_err());
        assert!(check_header(&h, 7, 2).is_err());
        assert!(check_header(&h[..4], 7, 1).is_err());
    }
}
