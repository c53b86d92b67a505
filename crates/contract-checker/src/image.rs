//! Firmware image loading
//!
//! Object files (ELF, Mach-O, PE) contribute their code sections at their
//! link addresses. Anything `object` cannot parse is mapped as a raw image
//! starting at address 0, the usual layout of flash dumps.

use std::fs;
use std::path::{Path, PathBuf};

use object::{Object, ObjectSection, SectionKind};
use thiserror::Error;
use tracing::debug;

/// Errors raised while loading a firmware image
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("unable to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read section `{name}`: {source}")]
    Section {
        name: String,
        #[source]
        source: object::Error,
    },

    #[error("no code section found in {}", path.display())]
    NoCode { path: PathBuf },
}

/// Contiguous bytes mapped at an address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub address: u64,
    pub bytes: Vec<u8>,
}

impl Segment {
    pub fn end(&self) -> u64 {
        self.address.saturating_add(self.bytes.len() as u64)
    }

    fn contains(&self, address: u64) -> bool {
        self.address <= address && address < self.end()
    }
}

/// The code of the firmware, addressed as the processor sees it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodeImage {
    segments: Vec<Segment>,
}

impl CodeImage {
    /// Image made of a single segment.
    pub fn from_bytes(address: u64, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            segments: vec![Segment {
                address,
                bytes: bytes.into(),
            }],
        }
    }

    /// Load the code sections of the file at `path`.
    pub fn load(path: &Path) -> Result<Self, ImageError> {
        let data = fs::read(path).map_err(|source| ImageError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let file = match object::File::parse(&*data) {
            Ok(file) => file,
            Err(e) => {
                debug!("{} is not an object file ({}), mapping it raw at 0", path.display(), e);
                return Ok(Self::from_bytes(0, data));
            }
        };

        let mut segments = Vec::new();
        for section in file.sections().filter(|s| s.kind() == SectionKind::Text) {
            let name = section.name().unwrap_or("<unnamed>").to_string();
            let bytes = section
                .data()
                .map_err(|source| ImageError::Section {
                    name: name.clone(),
                    source,
                })?
                .to_vec();
            debug!(
                "code section {} at {:#x} ({} bytes)",
                name,
                section.address(),
                bytes.len()
            );
            segments.push(Segment {
                address: section.address(),
                bytes,
            });
        }

        if segments.is_empty() {
            return Err(ImageError::NoCode {
                path: path.to_path_buf(),
            });
        }
        segments.sort_by_key(|s| s.address);
        Ok(Self { segments })
    }

    /// Relocate every segment by `shift` bytes.
    pub fn shifted(mut self, shift: u64) -> Self {
        for segment in &mut self.segments {
            segment.address = segment.address.wrapping_add(shift);
        }
        self
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn contains(&self, address: u64) -> bool {
        self.segment_at(address).is_some()
    }

    /// Bytes `[address, address + len)`, if mapped in a single segment.
    pub fn read(&self, address: u64, len: usize) -> Option<&[u8]> {
        let segment = self.segment_at(address)?;
        let start = usize::try_from(address - segment.address).ok()?;
        segment.bytes.get(start..start.checked_add(len)?)
    }

    fn segment_at(&self, address: u64) -> Option<&Segment> {
        self.segments.iter().find(|s| s.contains(address))
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_read_within_segment() {
        let image = CodeImage::from_bytes(0x1000, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(image.read(0x1004, 4), Some(&[5, 6, 7, 8][..]));
        assert_eq!(image.read(0x1006, 4), None, "read crosses the segment end");
        assert_eq!(image.read(0xfff, 1), None);
        assert!(image.contains(0x1007));
        assert!(!image.contains(0x1008));
    }

    #[test]
    fn test_shifted_image() {
        let image = CodeImage::from_bytes(0, vec![0xaa; 4]).shifted(0x8000);
        assert_eq!(image.read(0x8000, 1), Some(&[0xaa][..]));
        assert!(!image.contains(0));
    }

    #[test]
    fn test_raw_file_maps_at_zero() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let path = dir.path().join("firmware.bin");
        fs::write(&path, [0x1f, 0x20, 0x03, 0xd5]).expect("failed to write image");

        let image = CodeImage::load(&path).expect("raw image should load");
        assert_eq!(image.segments().len(), 1);
        assert_eq!(image.read(0, 4), Some(&[0x1f, 0x20, 0x03, 0xd5][..]));
    }

    #[test]
    fn test_missing_file() {
        let err = CodeImage::load(Path::new("/nonexistent/firmware.bin")).unwrap_err();
        assert!(matches!(err, ImageError::Io { .. }));
    }
}
