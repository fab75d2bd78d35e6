//! HTTP byte-range parsing and slicing (RFC 9110 Section 14.1.1).
//!
//! Only a single range spec is supported; a `Range` header naming more than
//! one range is rejected outright rather than served as a full response,
//! matching the original edge binary's `parseSingleByteRange`.

use bytes::Bytes;

/// A parsed, already-clamped byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn length(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn content_range_header(&self, total_length: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, total_length)
    }
}

/// Parses a `Range` header value against a known content length.
///
/// Returns `None` if the header is absent-equivalent (handled by the
/// caller); returns `Some(Err(()))` for anything malformed or naming more
/// than one range, which the caller turns into a 416 response with
/// `Content-Range: bytes */content_length`.
pub fn parse_single_byte_range(raw: &str, content_length: u64) -> Result<ByteRange, ()> {
    let spec = raw.strip_prefix("bytes=").ok_or(())?;
    if spec.is_empty() || spec.contains(',') {
        return Err(());
    }

    let (start_part, end_part) = spec.split_once('-').ok_or(())?;

    if start_part.is_empty() {
        // Suffix range: `-N` means the last N bytes.
        let suffix: u64 = end_part.parse().map_err(|_| ())?;
        if suffix == 0 {
            return Err(());
        }
        let suffix = suffix.min(content_length);
        return Ok(ByteRange::new(content_length - suffix, content_length - 1));
    }

    let start: u64 = start_part.parse().map_err(|_| ())?;

    if end_part.is_empty() {
        // Open-ended range: `S-` means from S to the end.
        if start >= content_length {
            return Err(());
        }
        return Ok(ByteRange::new(start, content_length - 1));
    }

    let end: u64 = end_part.parse().map_err(|_| ())?;
    if end < start || start >= content_length {
        return Err(());
    }
    let end = end.min(content_length.saturating_sub(1));
    Ok(ByteRange::new(start, end))
}

/// Slices `content` to the bytes named by `range`. Assumes `range` was
/// produced by `parse_single_byte_range` against the same content length.
pub fn extract_range(content: &Bytes, range: &ByteRange) -> Bytes {
    let start = range.start as usize;
    let end = ((range.end + 1) as usize).min(content.len());
    content.slice(start..end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_range() {
        let range = parse_single_byte_range("bytes=0-499", 1000).unwrap();
        assert_eq!(range, ByteRange::new(0, 499));
        assert_eq!(range.length(), 500);
    }

    #[test]
    fn open_ended_range() {
        let range = parse_single_byte_range("bytes=500-", 1000).unwrap();
        assert_eq!(range, ByteRange::new(500, 999));
    }

    #[test]
    fn suffix_range() {
        let range = parse_single_byte_range("bytes=-200", 1000).unwrap();
        assert_eq!(range, ByteRange::new(800, 999));
    }

    #[test]
    fn suffix_range_larger_than_content_is_clamped() {
        let range = parse_single_byte_range("bytes=-2000", 1000).unwrap();
        assert_eq!(range, ByteRange::new(0, 999));
    }

    #[test]
    fn closed_range_end_is_clamped() {
        let range = parse_single_byte_range("bytes=0-9999", 1000).unwrap();
        assert_eq!(range, ByteRange::new(0, 999));
    }

    #[test]
    fn multi_range_is_rejected() {
        assert!(parse_single_byte_range("bytes=0-100,200-300", 1000).is_err());
    }

    #[test]
    fn missing_prefix_is_rejected() {
        assert!(parse_single_byte_range("0-499", 1000).is_err());
    }

    #[test]
    fn start_after_end_is_rejected() {
        assert!(parse_single_byte_range("bytes=500-100", 1000).is_err());
    }

    #[test]
    fn start_beyond_content_is_rejected() {
        assert!(parse_single_byte_range("bytes=2000-", 1000).is_err());
    }

    #[test]
    fn empty_spec_is_rejected() {
        assert!(parse_single_byte_range("bytes=", 1000).is_err());
    }

    #[test]
    fn extract_range_slices_expected_bytes() {
        let content = Bytes::from("Hello, World!");
        assert_eq!(
            extract_range(&content, &ByteRange::new(0, 4)).as_ref(),
            b"Hello"
        );
        assert_eq!(
            extract_range(&content, &ByteRange::new(7, 11)).as_ref(),
            b"World"
        );
    }

    #[test]
    fn content_range_header_format() {
        assert_eq!(
            ByteRange::new(0, 499).content_range_header(1000),
            "bytes 0-499/1000"
        );
    }
}
