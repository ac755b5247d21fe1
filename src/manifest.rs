//! Extraction of the embedded side-by-side manifest as text
//!
//! RT_MANIFEST resources are XML, usually UTF-8 but occasionally stored with
//! a byte-order mark or as UTF-16. Decoding is tolerant; whether the text is
//! well-formed XML is decided later, when it is actually parsed.

use crate::pe::PeImage;

/// Text of the embedded manifest, or None when the image carries none
///
/// An absent manifest is a normal condition, not an error.
pub fn manifest_text(image: &PeImage) -> Option<String> {
    let bytes = image.manifest_bytes();
    if bytes.is_empty() {
        return None;
    }
    Some(decode_manifest_bytes(bytes))
}

/// Decode raw manifest resource bytes into text, honoring a leading BOM
pub fn decode_manifest_bytes(bytes: &[u8]) -> String {
    if let Some(rest) = bytes.strip_prefix(&[0xef, 0xbb, 0xbf]) {
        return String::from_utf8_lossy(rest).into_owned();
    }
    if bytes.len() >= 2 && bytes[0] == 0xff && bytes[1] == 0xfe {
        let units: Vec<u16> = bytes[2..]
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        return String::from_utf16_lossy(&units);
    }
    let text = String::from_utf8_lossy(bytes).into_owned();
    // a BOM that survived a UTF-8 decode
    text.strip_prefix('\u{feff}').map(str::to_owned).unwrap_or(text)
}
