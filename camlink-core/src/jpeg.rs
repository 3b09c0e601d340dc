//! JPEG boundary helpers.
//!
//! Camera FIFOs hand back a buffer that may carry padding before the SOI
//! marker or after the EOI marker. Only the `FF D8 .. FF D9` span is a frame.

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

/// The `SOI..=EOI` span of `buf`, or `None` if either marker is missing.
pub fn extract(buf: &[u8]) -> Option<&[u8]> {
    let start = find(buf, &SOI, 0)?;
    let end = find(buf, &EOI, start + SOI.len())?;
    Some(&buf[start..end + EOI.len()])
}

/// True when `buf` starts with SOI and ends with EOI.
pub fn is_complete(buf: &[u8]) -> bool {
    buf.len() >= 4 && buf.starts_with(&SOI) && buf.ends_with(&EOI)
}

fn find(haystack: &[u8], needle: &[u8; 2], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(2)
        .position(|w| w == needle)
        .map(|pos| pos + from)
}
