//! Query types shared by the NMDC, ADC and direct search paths.

use crate::filetype::FileType;
use crate::tth::Tth;

/// Case-insensitive substring matcher. The pattern is lowercased once
/// at construction; haystacks are lowercased per match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringSearch {
    pattern: String,
}

impl StringSearch {
    pub fn new(pattern: &str) -> Self {
        Self {
            pattern: pattern.to_lowercase(),
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn matches(&self, haystack: &str) -> bool {
        haystack.to_lowercase().contains(&self.pattern)
    }
}

/// Translate a `*`/`?` wildcard into an anchored, case-insensitive
/// regex.
pub fn wildcard_to_regex(pattern: &str) -> String {
    let mut out = String::from("(?i)^");
    for c in pattern.chars() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            c if "\\.+()[]{}^$|".contains(c) => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push('$');
    out
}

/// Size comparison mode for NMDC searches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SizeMode {
    #[default]
    Any,
    AtLeast,
    AtMost,
}

/// An NMDC-style search: `$`-delimited tokens plus a size condition
/// and a file type.
#[derive(Debug, Clone)]
pub struct NmdcQuery {
    /// Lowercased, non-empty tokens.
    pub tokens: Vec<String>,
    pub size_mode: SizeMode,
    pub size: i64,
    pub file_type: FileType,
}

impl NmdcQuery {
    pub fn parse(raw: &str, size_mode: SizeMode, size: i64, file_type: FileType) -> Self {
        let tokens = raw
            .to_lowercase()
            .split('$')
            .filter(|t| !t.is_empty())
            .map(str::to_owned)
            .collect();
        Self {
            tokens,
            size_mode,
            size,
            file_type,
        }
    }

    pub fn size_ok(&self, size: i64) -> bool {
        match self.size_mode {
            SizeMode::Any => true,
            SizeMode::AtLeast => size >= self.size,
            SizeMode::AtMost => size <= self.size,
        }
    }
}

/// A structured ADC search.
#[derive(Debug, Clone)]
pub struct AdcQuery {
    pub include: Vec<StringSearch>,
    pub exclude: Vec<StringSearch>,
    /// `Some` short-circuits everything else: exact content lookup.
    pub root: Option<Tth>,
    /// Minimum size, inclusive.
    pub gt: i64,
    /// Maximum size, inclusive.
    pub lt: i64,
    /// Accepted extensions with a leading dot, lowercased. Empty
    /// accepts everything.
    pub ext: Vec<String>,
    /// Only directory results are wanted.
    pub is_directory: bool,
}

impl Default for AdcQuery {
    fn default() -> Self {
        Self {
            include: Vec::new(),
            exclude: Vec::new(),
            root: None,
            gt: 0,
            lt: i64::MAX,
            ext: Vec::new(),
            is_directory: false,
        }
    }
}

impl AdcQuery {
    /// Build from a free-form search string: whitespace-separated
    /// terms, a leading `-` marks an exclusion.
    pub fn parse(query: &str, extensions: &[String]) -> Self {
        let mut include = Vec::new();
        let mut exclude = Vec::new();
        for term in query.split_whitespace() {
            if let Some(neg) = term.strip_prefix('-') {
                if !neg.is_empty() {
                    exclude.push(StringSearch::new(neg));
                }
            } else {
                include.push(StringSearch::new(term));
            }
        }

        let ext = extensions
            .iter()
            .map(|e| {
                let e = e.to_lowercase();
                if e.starts_with('.') {
                    e
                } else {
                    format!(".{e}")
                }
            })
            .collect();

        Self {
            include,
            exclude,
            root: None,
            gt: 0,
            lt: i64::MAX,
            ext,
            is_directory: false,
        }
    }

    pub fn with_root(tth: Tth) -> Self {
        Self {
            root: Some(tth),
            lt: i64::MAX,
            ..Self::default()
        }
    }

    pub fn matches_size(&self, size: i64) -> bool {
        size >= self.gt && size <= self.lt
    }

    pub fn is_excluded(&self, name: &str) -> bool {
        self.exclude.iter().any(|s| s.matches(name))
    }

    pub fn has_ext(&self, name: &str) -> bool {
        if self.ext.is_empty() {
            return true;
        }
        let lower = name.to_lowercase();
        self.ext.iter().any(|e| lower.ends_with(e))
    }

    /// Directory-name predicate for direct searches: every include
    /// term matches the name and none of the excludes do.
    pub fn matches_direct_directory_name(&self, name: &str) -> bool {
        !self.include.is_empty()
            && self.include.iter().all(|s| s.matches(name))
            && !self.is_excluded(name)
    }

    /// File predicate for direct searches.
    pub fn matches_direct_file(&self, name: &str, size: i64) -> bool {
        self.matches_size(size)
            && self.include.iter().all(|s| s.matches(name))
            && !self.is_excluded(name)
            && self.has_ext(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_search_is_case_insensitive_substring() {
        let s = StringSearch::new("Song");
        assert!(s.matches("my_SONG.mp3"));
        assert!(s.matches("song"));
        assert!(!s.matches("sang"));
    }

    #[test]
    fn test_wildcard_translation() {
        assert_eq!(wildcard_to_regex("*.iso"), r"(?i)^.*\.iso$");
        assert_eq!(wildcard_to_regex("cover?"), r"(?i)^cover.$");
    }

    #[test]
    fn test_nmdc_tokenization() {
        let q = NmdcQuery::parse("Song$MP3$$", SizeMode::Any, 0, FileType::Audio);
        assert_eq!(q.tokens, vec!["song", "mp3"]);
    }

    #[test]
    fn test_nmdc_size_modes() {
        let q = NmdcQuery::parse("a", SizeMode::AtLeast, 100, FileType::Any);
        assert!(q.size_ok(100));
        assert!(q.size_ok(101));
        assert!(!q.size_ok(99));

        let q = NmdcQuery::parse("a", SizeMode::AtMost, 100, FileType::Any);
        assert!(q.size_ok(100));
        assert!(!q.size_ok(101));
    }

    #[test]
    fn test_adc_parse_excludes() {
        let q = AdcQuery::parse("linux iso -beta", &[]);
        assert_eq!(q.include.len(), 2);
        assert_eq!(q.exclude.len(), 1);
        assert!(q.is_excluded("some.beta.build"));
    }

    #[test]
    fn test_adc_extensions_normalized() {
        let q = AdcQuery::parse("a", &["MP3".to_string(), ".flac".to_string()]);
        assert!(q.has_ext("x.mp3"));
        assert!(q.has_ext("x.FLAC"));
        assert!(!q.has_ext("x.ogg"));
    }

    #[test]
    fn test_adc_direct_predicates() {
        let q = AdcQuery::parse("my.album", &[]);
        assert!(q.matches_direct_directory_name("My.Album"));
        assert!(!q.matches_direct_directory_name("other"));
        assert!(q.matches_direct_file("my.album.track01.mp3", 1));
    }

    #[test]
    fn test_adc_size_bounds() {
        let q = AdcQuery {
            gt: 10,
            lt: 20,
            ..AdcQuery::default()
        };
        assert!(q.matches_size(10));
        assert!(q.matches_size(20));
        assert!(!q.matches_size(9));
        assert!(!q.matches_size(21));
    }
}
