//! Protocol file-type classification.
//!
//! Search types are stable protocol integers. Classification is by
//! extension, with two table families per type: three-character
//! extensions compared as a packed little-endian `u32` (the dot plus
//! the lowercased last three characters), and longer extensions
//! compared as case-insensitive suffixes.

use once_cell::sync::Lazy;
use regex::Regex;

/// File type codes as exposed to the NMDC/ADC protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum FileType {
    #[default]
    Any = 0,
    Audio = 1,
    Compressed = 2,
    Document = 3,
    Executable = 4,
    Picture = 5,
    Video = 6,
    Directory = 7,
    Tth = 8,
}

impl FileType {
    pub fn from_code(code: u8) -> Option<FileType> {
        Some(match code {
            0 => FileType::Any,
            1 => FileType::Audio,
            2 => FileType::Compressed,
            3 => FileType::Document,
            4 => FileType::Executable,
            5 => FileType::Picture,
            6 => FileType::Video,
            7 => FileType::Directory,
            8 => FileType::Tth,
            _ => return None,
        })
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    /// Bit for the per-directory content mask.
    pub fn mask_bit(self) -> u32 {
        1 << (self as u32)
    }
}

const fn pack(ext: &[u8; 4]) -> u32 {
    (ext[0] as u32) | ((ext[1] as u32) << 8) | ((ext[2] as u32) << 16) | ((ext[3] as u32) << 24)
}

const AUDIO: [u32; 36] = [
    pack(b".mp3"),
    pack(b".mp2"),
    pack(b".mid"),
    pack(b".wav"),
    pack(b".ogg"),
    pack(b".wma"),
    pack(b".669"),
    pack(b".aac"),
    pack(b".aif"),
    pack(b".amf"),
    pack(b".ams"),
    pack(b".ape"),
    pack(b".dbm"),
    pack(b".dmf"),
    pack(b".dsm"),
    pack(b".far"),
    pack(b".mdl"),
    pack(b".med"),
    pack(b".mod"),
    pack(b".mol"),
    pack(b".mp1"),
    pack(b".mp4"),
    pack(b".mpa"),
    pack(b".mpc"),
    pack(b".mpp"),
    pack(b".mtm"),
    pack(b".nst"),
    pack(b".okt"),
    pack(b".psm"),
    pack(b".ptm"),
    pack(b".rmi"),
    pack(b".s3m"),
    pack(b".stm"),
    pack(b".ult"),
    pack(b".umx"),
    pack(b".wow"),
];
const AUDIO_LONG: [&str; 7] = [".au", ".it", ".ra", ".xm", ".aiff", ".flac", ".midi"];

const COMPRESSED: [u32; 10] = [
    pack(b".rar"),
    pack(b".zip"),
    pack(b".ace"),
    pack(b".arj"),
    pack(b".hqx"),
    pack(b".lha"),
    pack(b".sea"),
    pack(b".tar"),
    pack(b".tgz"),
    pack(b".uc2"),
];
const COMPRESSED_LONG: [&str; 1] = [".gz"];

const DOCUMENT: [u32; 6] = [
    pack(b".nfo"),
    pack(b".htm"),
    pack(b".doc"),
    pack(b".txt"),
    pack(b".pdf"),
    pack(b".chm"),
];

const EXECUTABLE: [u32; 2] = [pack(b".exe"), pack(b".com")];

const PICTURE: [u32; 20] = [
    pack(b".jpg"),
    pack(b".gif"),
    pack(b".png"),
    pack(b".eps"),
    pack(b".img"),
    pack(b".pct"),
    pack(b".psp"),
    pack(b".pic"),
    pack(b".tif"),
    pack(b".rle"),
    pack(b".bmp"),
    pack(b".pcx"),
    pack(b".jpe"),
    pack(b".dcx"),
    pack(b".emf"),
    pack(b".ico"),
    pack(b".psd"),
    pack(b".tga"),
    pack(b".wmf"),
    pack(b".xif"),
];
const PICTURE_LONG: [&str; 5] = [".jpeg", ".ai", ".ps", ".pict", ".tiff"];

const VIDEO: [u32; 15] = [
    pack(b".vob"),
    pack(b".mpg"),
    pack(b".mov"),
    pack(b".asf"),
    pack(b".avi"),
    pack(b".wmv"),
    pack(b".ogm"),
    pack(b".mkv"),
    pack(b".pxp"),
    pack(b".m1v"),
    pack(b".m2v"),
    pack(b".mpe"),
    pack(b".mps"),
    pack(b".mpv"),
    pack(b".ram"),
];
const VIDEO_LONG: [&str; 10] = [
    ".mpeg", ".rm", ".divx", ".mp1v", ".mp2v", ".mpv1", ".mpv2", ".qt", ".rv", ".vivo",
];

// Multi-volume rar archives (.r01, .a42, ...) would otherwise fall
// through every table and classify as Any.
static RAR_VOLUME: Lazy<Regex> = Lazy::new(|| {
    Regex::new("[Rr0-9][Aa0-9][Rr0-9]").expect("static rar pattern")
});

/// Packed key for the short-extension tables: `.` plus the lowercased
/// last three characters of the name.
fn ext_key(name: &str) -> Option<u32> {
    if name.len() < 5 {
        return None;
    }
    let tail = &name.as_bytes()[name.len() - 3..];
    if !tail.is_ascii() {
        return None;
    }
    Some(
        (b'.' as u32)
            | ((tail[0].to_ascii_lowercase() as u32) << 8)
            | ((tail[1].to_ascii_lowercase() as u32) << 16)
            | ((tail[2].to_ascii_lowercase() as u32) << 24),
    )
}

fn has_long_ext(name: &str, table: &[&str]) -> bool {
    let lower = name.to_lowercase();
    table.iter().any(|ext| lower.ends_with(ext))
}

impl FileType {
    /// Does `name` classify as this search type? `Any` accepts
    /// everything; `Directory` and `Tth` never match a file name.
    pub fn matches(self, name: &str) -> bool {
        let key = ext_key(name);
        let short = |table: &[u32]| key.is_some_and(|k| table.contains(&k));
        match self {
            FileType::Any => true,
            FileType::Audio => short(&AUDIO) || has_long_ext(name, &AUDIO_LONG),
            FileType::Compressed => short(&COMPRESSED) || has_long_ext(name, &COMPRESSED_LONG),
            FileType::Document => short(&DOCUMENT),
            FileType::Executable => short(&EXECUTABLE),
            FileType::Picture => short(&PICTURE) || has_long_ext(name, &PICTURE_LONG),
            FileType::Video => short(&VIDEO) || has_long_ext(name, &VIDEO_LONG),
            FileType::Directory | FileType::Tth => false,
        }
    }
}

/// Classify a name into its protocol type. A trailing separator means
/// a directory; unknown extensions classify as `Any`.
pub fn file_type_of(name: &str) -> FileType {
    if name.ends_with('/') || name.ends_with('\\') {
        return FileType::Directory;
    }

    // Check rar volumes first; .r01-style names would otherwise be Any.
    if let Some((tail, _)) = name.char_indices().rev().nth(3) {
        if RAR_VOLUME.is_match(&name[tail..]) {
            return FileType::Compressed;
        }
    }

    for ty in [
        FileType::Audio,
        FileType::Video,
        FileType::Document,
        FileType::Compressed,
        FileType::Picture,
        FileType::Executable,
    ] {
        if ty.matches(name) {
            return ty;
        }
    }
    FileType::Any
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_extension_tables() {
        assert!(FileType::Audio.matches("my_song.mp3"));
        assert!(FileType::Video.matches("clip.mkv"));
        assert!(FileType::Document.matches("readme.nfo"));
        assert!(FileType::Picture.matches("cover.jpg"));
        assert!(!FileType::Audio.matches("my_song.txt"));
    }

    #[test]
    fn test_short_extensions_are_case_insensitive() {
        assert!(FileType::Audio.matches("SONG.MP3"));
        assert!(FileType::Compressed.matches("Archive.RAR"));
    }

    #[test]
    fn test_long_extension_suffix_match() {
        assert!(FileType::Audio.matches("song.flac"));
        assert!(FileType::Audio.matches("song.FLAC"));
        assert!(FileType::Picture.matches("scan.jpeg"));
        assert!(FileType::Video.matches("movie.mpeg"));
        assert!(FileType::Compressed.matches("bundle.tar.gz"));
    }

    #[test]
    fn test_minimum_length() {
        // Shorter than "x.mp3" can never carry a short extension.
        assert!(!FileType::Audio.matches(".mp3"));
    }

    #[test]
    fn test_file_type_of() {
        assert_eq!(file_type_of("a.mp3"), FileType::Audio);
        assert_eq!(file_type_of("a.avi"), FileType::Video);
        assert_eq!(file_type_of("a.rar"), FileType::Compressed);
        assert_eq!(file_type_of("archive.r01"), FileType::Compressed);
        assert_eq!(file_type_of("noext"), FileType::Any);
        assert_eq!(file_type_of("music/"), FileType::Directory);
    }

    #[test]
    fn test_stable_codes() {
        assert_eq!(FileType::Any.code(), 0);
        assert_eq!(FileType::Directory.code(), 7);
        assert_eq!(FileType::Tth.code(), 8);
        assert_eq!(FileType::from_code(6), Some(FileType::Video));
        assert_eq!(FileType::from_code(9), None);
    }
}
