//! Version manifest parsing.
//!
//! ```text
//! 1.0.3
//! https://cdn.example.com/android/
//! main.dll.bytes.ab,1048576,9e107d9d372bb6826bd81d3542a419d6
//! scenes/main.ab,262144000,e4d909c290d0fb1ca068ffaddf22cbd0
//! ```

use std::path::{Path, PathBuf};
use url::Url;

use crate::error::ManifestError;

pub const DEFAULT_VERSION: &str = "1.0";

/// One file listed by a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateFile {
    /// Path relative to the data directory; also the key in the state store.
    pub local_path: String,
    pub remote_url: String,
    pub size: u64,
    /// Lowercase hex digest, empty when the manifest omits it.
    pub hash: String,
}

impl UpdateFile {
    pub fn full_local_path(&self, data_dir: &Path) -> PathBuf {
        data_dir.join(&self.local_path)
    }

    pub fn expected_hash(&self) -> Option<&str> {
        if self.hash.is_empty() {
            None
        } else {
            Some(&self.hash)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub version: String,
    pub base_url: String,
    pub files: Vec<UpdateFile>,
}

/// Non-blank trimmed lines with their 1-based line number in `content`.
/// `\r\n`, `\n` and a lone `\r` all end a line.
fn lines_of(content: &str) -> Vec<(usize, &str)> {
    content
        .split('\n')
        .flat_map(|line| line.strip_suffix('\r').unwrap_or(line).split('\r'))
        .enumerate()
        .map(|(index, line)| (index + 1, line.trim()))
        .filter(|(_, l)| !l.is_empty())
        .collect()
}

/// First non-empty line of a version file, or [`DEFAULT_VERSION`].
pub fn version_of(content: &str) -> String {
    lines_of(content)
        .first()
        .map(|(_, v)| v.to_string())
        .unwrap_or_else(|| DEFAULT_VERSION.to_string())
}

impl Manifest {
    /// Parses manifest text. `default_base_url` is used when the manifest
    /// only carries a version line.
    pub fn parse(content: &str, default_base_url: Option<&str>) -> Result<Self, ManifestError> {
        let lines = lines_of(content);
        let version = lines.first().ok_or(ManifestError::Empty)?.1.to_string();
        let base_url = match (lines.get(1), default_base_url) {
            (Some((_, line)), _) => line.to_string(),
            (None, Some(fallback)) => fallback.to_string(),
            (None, None) => {
                return Ok(Self {
                    version,
                    base_url: String::new(),
                    files: Vec::new(),
                })
            }
        };

        let base = parse_base(&base_url)?;
        let mut files = Vec::new();
        for &(line_number, line) in lines.iter().skip(2) {
            let parts: Vec<&str> = line.split(',').map(str::trim).collect();
            if parts.len() != 3 {
                continue;
            }
            let size = parts[1].parse::<u64>().map_err(|_| ManifestError::InvalidSize {
                line: line_number,
                value: parts[1].to_string(),
            })?;
            let remote_url = base
                .join(parts[0])
                .map_err(|e| ManifestError::InvalidPath(parts[0].to_string(), e))?;
            files.push(UpdateFile {
                local_path: parts[0].to_string(),
                remote_url: remote_url.to_string(),
                size,
                hash: parts[2].to_ascii_lowercase(),
            });
        }

        Ok(Self {
            version,
            base_url,
            files,
        })
    }

    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

/// Base URLs are joined as directories, so a missing trailing slash is added.
fn parse_base(base_url: &str) -> Result<Url, ManifestError> {
    let normalized = if base_url.ends_with('/') {
        base_url.to_string()
    } else {
        format!("{}/", base_url)
    };
    Url::parse(&normalized).map_err(|e| ManifestError::InvalidBaseUrl(base_url.to_string(), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_files_against_base_url() {
        let text = "1.0.3\r\nhttps://cdn.example.com/android\r\n\r\nmain.dll.bytes.ab, 1024 ,ABCDEF0123456789ABCDEF0123456789\r\nscenes/main.ab,2048,00112233445566778899aabbccddeeff\r\n";
        let manifest = Manifest::parse(text, None).unwrap();
        assert_eq!(manifest.version, "1.0.3");
        assert_eq!(manifest.files.len(), 2);
        assert_eq!(
            manifest.files[0].remote_url,
            "https://cdn.example.com/android/main.dll.bytes.ab"
        );
        assert_eq!(manifest.files[0].size, 1024);
        assert_eq!(manifest.files[0].hash, "abcdef0123456789abcdef0123456789");
        assert_eq!(
            manifest.files[1].remote_url,
            "https://cdn.example.com/android/scenes/main.ab"
        );
        assert_eq!(manifest.total_size(), 3072);
    }

    #[test]
    fn malformed_lines_are_skipped_but_bad_sizes_fail() {
        let text = "2\nhttps://cdn.example.com/\nno-commas\na,1,h,extra\nb,5,ff\n";
        let manifest = Manifest::parse(text, None).unwrap();
        assert_eq!(manifest.files.len(), 1);
        assert_eq!(manifest.files[0].local_path, "b");

        let err = Manifest::parse("2\nhttps://cdn.example.com/\nb,five,ff\n", None).unwrap_err();
        assert!(matches!(err, ManifestError::InvalidSize { line: 3, .. }));
    }

    #[test]
    fn bad_size_reports_line_in_source_text() {
        let text = "\n2\r\n\r\nhttps://cdn.example.com/\n\na,1,ff\n\nb,five,ff\n";
        let err = Manifest::parse(text, None).unwrap_err();
        assert!(matches!(err, ManifestError::InvalidSize { line: 8, .. }), "{err:?}");

        let err = Manifest::parse("2\rhttps://cdn.example.com/\rb,x,ff", None).unwrap_err();
        assert!(matches!(err, ManifestError::InvalidSize { line: 3, .. }), "{err:?}");
    }

    #[test]
    fn version_only_manifest_uses_fallback_base() {
        let manifest = Manifest::parse("3.1\n", Some("https://fallback.example.com/win32/")).unwrap();
        assert_eq!(manifest.base_url, "https://fallback.example.com/win32/");
        assert!(manifest.files.is_empty());
        assert!(matches!(Manifest::parse("\n\n", None), Err(ManifestError::Empty)));
    }

    #[test]
    fn version_defaults_when_missing() {
        assert_eq!(version_of(""), DEFAULT_VERSION);
        assert_eq!(version_of("\n 1.4 \nother"), "1.4");
    }
}
