//! Gzip member framing.
//!
//! The header and trailer layouts come straight from RFC 1952. The deflate
//! body between them is produced block by block in [`crate::pipeline`]; the
//! functions here are pure, all multi-byte fields little-endian.
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{LittleEndian, WriteBytesExt};
use flate2::Compression;

/// FLG bit set when the header carries an original file name.
pub(crate) const FNAME: u8 = 1 << 3;

/// Metadata recorded in the member header.
///
/// The defaults leave the name out and set MTIME to 0, which RFC 1952
/// defines as "no time stamp available".
#[derive(Debug, Clone, Default)]
pub struct SourceMeta {
    /// Original file name, stored in the FNAME field when Latin-1 representable.
    pub filename: Option<String>,
    /// Modification time in seconds since the Unix epoch.
    pub mtime: u32,
}

impl SourceMeta {
    /// Metadata for an anonymous stream, stamped with the time compression started.
    pub fn from_wall_clock() -> Self {
        Self {
            filename: None,
            mtime: unix_now(),
        }
    }

    /// Metadata for a file on disk: its name plus its stat mtime, falling
    /// back to the wall clock when the mtime is unavailable.
    pub fn for_path<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        let mtime = fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or_else(unix_now, |d| d.as_secs() as u32);
        let filename = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(String::from);
        Self { filename, mtime }
    }
}

fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs() as u32)
}

/// Build the fixed member header for the given level and source metadata.
pub(crate) fn member_header(compression_level: Compression, meta: &SourceMeta) -> Vec<u8> {
    let fname = meta.filename.as_deref().and_then(encode_fname);
    let flg = if fname.is_some() { FNAME } else { 0 };

    let mut header = Vec::with_capacity(10 + fname.as_ref().map_or(0, Vec::len));
    header.write_u8(0x1f).unwrap(); // ID1
    header.write_u8(0x8b).unwrap(); // ID2
    header.write_u8(8).unwrap(); // CM, deflate
    header.write_u8(flg).unwrap();
    header.write_u32::<LittleEndian>(meta.mtime).unwrap();
    header.write_u8(extra_flags(compression_level)).unwrap();
    header.write_u8(operating_system()).unwrap();
    if let Some(fname) = fname {
        header.extend_from_slice(&fname);
    }
    header
}

/// Build the 8-byte member trailer: CRC-32 of the raw input, then ISIZE.
pub(crate) fn member_trailer(crc32: u32, input_size: u64) -> Vec<u8> {
    let mut trailer = Vec::with_capacity(8);
    trailer.write_u32::<LittleEndian>(crc32).unwrap();
    // ISIZE is the input length mod 2^32
    trailer.write_u32::<LittleEndian>(input_size as u32).unwrap();
    trailer
}

/// XFL byte: 2 flags maximum compression, 4 flags fastest.
fn extra_flags(compression_level: Compression) -> u8 {
    if compression_level.level() >= Compression::best().level() {
        2
    } else if compression_level.level() <= Compression::fast().level() {
        4
    } else {
        0
    }
}

/// OS byte: 3 for the Unix family, 0 for Windows, 255 for anything else.
fn operating_system() -> u8 {
    if cfg!(unix) {
        3
    } else if cfg!(windows) {
        0
    } else {
        255
    }
}

/// Encode a file name for the FNAME field.
///
/// RFC 1952 requires Latin-1, so names with code points above U+00FF are not
/// representable and the field is omitted entirely. A single trailing `.gz`
/// is dropped and a NUL terminator appended.
fn encode_fname(name: &str) -> Option<Vec<u8>> {
    let name = name.strip_suffix(".gz").unwrap_or(name);
    let mut bytes = Vec::with_capacity(name.len() + 1);
    for ch in name.chars() {
        if ch as u32 > 0xff {
            return None;
        }
        bytes.push(ch as u8);
    }
    bytes.push(0);
    Some(bytes)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_header_layout() {
        let meta = SourceMeta {
            filename: None,
            mtime: 0x0403_0201,
        };
        let header = member_header(Compression::new(6), &meta);
        assert_eq!(header.len(), 10);
        assert_eq!(&header[..4], &[0x1f, 0x8b, 8, 0]);
        assert_eq!(&header[4..8], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(header[8], 0); // XFL for mid levels
        #[cfg(unix)]
        assert_eq!(header[9], 3);
    }

    #[test]
    fn test_header_fname_strips_gz_suffix() {
        let meta = SourceMeta {
            filename: Some("report.txt.gz".to_string()),
            mtime: 0,
        };
        let header = member_header(Compression::new(9), &meta);
        assert_eq!(header[3], FNAME);
        assert_eq!(&header[10..], b"report.txt\0");
    }

    #[test]
    fn test_header_fname_latin1() {
        let meta = SourceMeta {
            filename: Some("r\u{e9}sum\u{e9}".to_string()),
            mtime: 0,
        };
        let header = member_header(Compression::new(9), &meta);
        assert_eq!(header[3], FNAME);
        assert_eq!(&header[10..], &[b'r', 0xe9, b's', b'u', b'm', 0xe9, 0][..]);
    }

    #[test]
    fn test_header_omits_non_latin1_fname() {
        let meta = SourceMeta {
            filename: Some("\u{62a5}\u{544a}.txt".to_string()),
            mtime: 0,
        };
        let header = member_header(Compression::new(9), &meta);
        assert_eq!(header[3], 0);
        assert_eq!(header.len(), 10);
    }

    #[test]
    fn test_extra_flags() {
        assert_eq!(extra_flags(Compression::new(9)), 2);
        assert_eq!(extra_flags(Compression::new(1)), 4);
        assert_eq!(extra_flags(Compression::new(5)), 0);
    }

    #[test]
    fn test_trailer_little_endian() {
        let trailer = member_trailer(0xdead_beef, 0x0102_0304);
        assert_eq!(trailer, [0xef, 0xbe, 0xad, 0xde, 0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn test_trailer_isize_wraps_mod_2_32() {
        let trailer = member_trailer(0, (1 << 32) + 5);
        assert_eq!(&trailer[4..], &[5, 0, 0, 0]);
    }

    #[test]
    fn test_for_path_keeps_final_component() {
        let meta = SourceMeta::for_path("/some/dir/report.txt.gz");
        assert_eq!(meta.filename.as_deref(), Some("report.txt.gz"));
    }
}
