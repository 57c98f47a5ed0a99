//! Best-effort file type identification from leading magic bytes.
//!
//! The hint is informational only; it never influences matching. Archive
//! detection for the extractor lives in [`crate::archive`], which reuses
//! the signatures from [`crate::constants`].

use crate::constants::{GZIP_MAGIC, TAR_MAGIC, TAR_MAGIC_OFFSET, ZIP_MAGIC};

/// Returns a short type hint for the buffer, e.g. `application/zip` or
/// `text/plain`. `None` when nothing is recognized.
pub fn type_hint(content: &[u8]) -> Option<String> {
    let hint = if content.starts_with(ZIP_MAGIC) {
        "application/zip"
    } else if content.starts_with(GZIP_MAGIC) {
        "application/gzip"
    } else if has_tar_marker(content) {
        "application/x-tar"
    } else if content.starts_with(b"%PDF-") {
        "application/pdf"
    } else if content.starts_with(&[0x89, b'P', b'N', b'G']) {
        "image/png"
    } else if content.starts_with(&[0xff, 0xd8, 0xff]) {
        "image/jpeg"
    } else if content.starts_with(b"MZ") {
        "application/x-msdownload"
    } else if content.starts_with(&[0x7f, b'E', b'L', b'F']) {
        "application/x-elf"
    } else if content.starts_with(b"SQLite format 3\0") {
        "application/vnd.sqlite3"
    } else if looks_textual(content) {
        "text/plain"
    } else if content.is_empty() {
        return None;
    } else {
        "application/octet-stream"
    };
    Some(hint.to_string())
}

pub fn has_tar_marker(content: &[u8]) -> bool {
    content.len() > TAR_MAGIC_OFFSET + TAR_MAGIC.len()
        && &content[TAR_MAGIC_OFFSET..TAR_MAGIC_OFFSET + TAR_MAGIC.len()] == TAR_MAGIC
}

/// A buffer counts as text when its first kilobyte contains no NUL and is
/// mostly printable.
fn looks_textual(content: &[u8]) -> bool {
    if content.is_empty() {
        return false;
    }
    let sample = &content[..content.len().min(1024)];
    if sample.contains(&0) {
        return false;
    }
    let printable = sample
        .iter()
        .filter(|b| b.is_ascii_graphic() || b.is_ascii_whitespace() || **b >= 0x80)
        .count();
    printable * 100 / sample.len() >= 95
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_common_formats() {
        assert_eq!(type_hint(b"PK\x03\x04rest").as_deref(), Some("application/zip"));
        assert_eq!(
            type_hint(&[0x1f, 0x8b, 0x08, 0x00]).as_deref(),
            Some("application/gzip")
        );
        assert_eq!(type_hint(b"%PDF-1.7").as_deref(), Some("application/pdf"));
    }

    #[test]
    fn plain_text_detected() {
        assert_eq!(
            type_hint(b"password=hunter2\n").as_deref(),
            Some("text/plain")
        );
    }

    #[test]
    fn binary_falls_back_to_octet_stream() {
        let buffer: Vec<u8> = (0u16..512).map(|i| (i % 251) as u8).collect();
        assert_eq!(
            type_hint(&buffer).as_deref(),
            Some("application/octet-stream")
        );
    }

    #[test]
    fn tar_marker_at_offset() {
        let mut buffer = vec![0u8; 512];
        buffer[TAR_MAGIC_OFFSET..TAR_MAGIC_OFFSET + 5].copy_from_slice(TAR_MAGIC);
        assert_eq!(type_hint(&buffer).as_deref(), Some("application/x-tar"));
    }

    #[test]
    fn empty_buffer_has_no_hint() {
        assert_eq!(type_hint(b""), None);
    }
}
