//! Segment model shared by the playlist resolver, the fetchers and the
//! output stages.

use bytes::Bytes;
use url::Url;

use crate::error::HlsError;

/// One media segment extracted from a playlist poll.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    /// Sequence number parsed from the URI file name.
    pub sequence: u64,
    /// Absolute segment URL.
    pub url: Url,
    /// File name of the segment (`<sequence>.m4s`).
    pub name: String,
    /// Segment duration in seconds, from EXTINF.
    pub duration: f32,
    /// Absolute URL of the init section, when the playlist carries one.
    pub init_url: Option<Url>,
    /// File name of the init section.
    pub init_name: Option<String>,
    /// EXTINF title; encodes the expected byte size and checksum.
    pub title: String,
    /// True when the sequence gap to the previous segment was >= 2.
    pub discontinuous: bool,
}

/// The expected size and checksum encoded in a segment title as
/// `hex_size|crc32|…`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentCheck {
    pub size: usize,
    pub crc32: u32,
}

impl Segment {
    /// Parse the size/checksum fields from the EXTINF title.
    pub fn check(&self) -> Option<SegmentCheck> {
        let mut parts = self.title.split('|');
        let size = usize::from_str_radix(parts.next()?.trim(), 16).ok()?;
        let crc32 = u32::from_str_radix(parts.next()?.trim(), 16).ok()?;
        Some(SegmentCheck { size, crc32 })
    }

    /// Verify a downloaded body against the title's expectations.
    pub fn verify(&self, body: &[u8]) -> Result<(), HlsError> {
        let Some(check) = self.check() else {
            return Ok(());
        };
        if body.len() != check.size {
            return Err(HlsError::SizeMismatch {
                expected: check.size,
                actual: body.len(),
            });
        }
        let actual = crc32fast::hash(body);
        if actual != check.crc32 {
            return Err(HlsError::CrcMismatch {
                expected: check.crc32,
                actual,
            });
        }
        Ok(())
    }
}

/// Output of the segment fetcher.
#[derive(Debug, Clone, PartialEq)]
pub enum SegmentData {
    /// A (possibly new) init section; emitted once per change.
    InitSection { name: String, payload: Bytes },
    /// A media segment body, paired with its descriptor.
    Segment { segment: Segment, payload: Bytes },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(title: &str) -> Segment {
        Segment {
            sequence: 1,
            url: Url::parse("https://example.com/1.m4s").unwrap(),
            name: "1.m4s".to_string(),
            duration: 1.0,
            init_url: None,
            init_name: None,
            title: title.to_string(),
            discontinuous: false,
        }
    }

    #[test]
    fn test_title_check_parsing() {
        let body = b"hello world";
        let crc = crc32fast::hash(body);
        let seg = segment(&format!("{:x}|{:x}|extra", body.len(), crc));

        let check = seg.check().unwrap();
        assert_eq!(check.size, 11);
        assert_eq!(check.crc32, crc);
        assert!(seg.verify(body).is_ok());
    }

    #[test]
    fn test_verify_detects_mismatches() {
        let body = b"hello world";
        let crc = crc32fast::hash(body);

        let wrong_size = segment(&format!("{:x}|{:x}", body.len() + 1, crc));
        assert!(matches!(
            wrong_size.verify(body),
            Err(HlsError::SizeMismatch { .. })
        ));

        let wrong_crc = segment(&format!("{:x}|{:x}", body.len(), crc ^ 1));
        assert!(matches!(
            wrong_crc.verify(body),
            Err(HlsError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn test_unparseable_title_skips_verification() {
        let seg = segment("no checksum here");
        assert!(seg.check().is_none());
        assert!(seg.verify(b"anything").is_ok());
    }
}
