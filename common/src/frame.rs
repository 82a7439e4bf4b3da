use tracing::debug;

use crate::codec::{ByteOffsetCodec, PixelCodec};

/// Separates the text header of a CBF frame from its binary payload.
pub const BINARY_MARKER: [u8; 4] = [0x0C, 0x1A, 0x04, 0xD5];

const ELEMENTS_KEY: &str = "X-Binary-Number-of-Elements:";
const SIZE_KEY: &str = "X-Binary-Size:";
const FASTEST_DIM_KEY: &str = "X-Binary-Size-Fastest-Dimension:";
const SECOND_DIM_KEY: &str = "X-Binary-Size-Second-Dimension:";

/// Fields extracted from the text header of one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Number of i32 pixels encoded in the payload. Always > 0.
    pub element_count: u32,
    /// Length of the compressed payload in bytes. Always > 0.
    pub compressed_len: u32,
    /// Grid width, when the header carries it.
    pub fastest_dimension: Option<u32>,
    /// Grid height, when the header carries it.
    pub second_dimension: Option<u32>,
}

impl FrameHeader {
    /// Grid dimensions declared by the header, if both are present and nonzero.
    pub fn dimensions(&self) -> Option<(usize, usize)> {
        match (self.fastest_dimension, self.second_dimension) {
            (Some(w), Some(h)) if w > 0 && h > 0 => Some((w as usize, h as usize)),
            _ => None,
        }
    }
}

/// Parse the text portion of a frame (everything before the binary marker).
///
/// Lines are `\n`-delimited; a trailing `\r` is tolerated. When a key appears
/// more than once the last parsable value wins. Lines that are not recognized
/// are ignored.
pub fn parse_header(text: &[u8]) -> Result<FrameHeader, FrameError> {
    let mut element_count = None;
    let mut compressed_len = None;
    let mut fastest_dimension = None;
    let mut second_dimension = None;

    for line in text.split(|&b| b == b'\n') {
        let Ok(line) = std::str::from_utf8(line) else {
            continue;
        };
        if let Some(v) = field_value(line, ELEMENTS_KEY) {
            element_count = Some(v);
        } else if let Some(v) = field_value(line, SIZE_KEY) {
            compressed_len = Some(v);
        } else if let Some(v) = field_value(line, FASTEST_DIM_KEY) {
            fastest_dimension = Some(v);
        } else if let Some(v) = field_value(line, SECOND_DIM_KEY) {
            second_dimension = Some(v);
        }
    }

    let element_count = element_count
        .filter(|&n| n > 0)
        .ok_or(FrameError::MissingField("X-Binary-Number-of-Elements"))?;
    let compressed_len = compressed_len
        .filter(|&n| n > 0)
        .ok_or(FrameError::MissingField("X-Binary-Size"))?;

    Ok(FrameHeader {
        element_count,
        compressed_len,
        fastest_dimension,
        second_dimension,
    })
}

/// Leading unsigned integer after `key`, skipping whitespace. Trailing text is ignored.
fn field_value(line: &str, key: &str) -> Option<u32> {
    let rest = line.strip_prefix(key)?.trim_start();
    let digits_end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    rest[..digits_end].parse().ok()
}

/// Offset of the first binary marker in `data`.
pub fn find_marker(data: &[u8]) -> Option<usize> {
    data.windows(BINARY_MARKER.len())
        .position(|window| window == BINARY_MARKER)
}

/// Expand a compressed payload into `element_count` pixels using `codec`.
///
/// Element counts the codec says the payload cannot hold are rejected before
/// allocating. The pixel buffer is then reserved fallibly so an oversized
/// frame surfaces as [`FrameError::Allocation`] instead of aborting the process.
pub fn decode_payload(
    codec: &dyn PixelCodec,
    compressed: &[u8],
    compressed_len: u32,
    element_count: u32,
) -> Result<Vec<i32>, FrameError> {
    let compressed_len = compressed_len as usize;
    if compressed.len() < compressed_len {
        return Err(FrameError::Truncated {
            got: compressed.len(),
            expected: compressed_len,
        });
    }

    let count = element_count as usize;
    if let Some(limit) = codec.max_elements(compressed_len) {
        if count > limit {
            return Err(FrameError::ElementCountExceedsPayload {
                elements: count,
                limit,
            });
        }
    }

    let mut pixels: Vec<i32> = Vec::new();
    pixels
        .try_reserve_exact(count)
        .map_err(|_| FrameError::Allocation(count))?;
    pixels.resize(count, 0);

    let consumed = codec.decode(&compressed[..compressed_len], &mut pixels);
    if consumed == 0 {
        return Err(FrameError::DecodeFailed(codec.name().to_string()));
    }
    debug!(
        codec = codec.name(),
        consumed,
        elements = count,
        "payload decoded"
    );
    Ok(pixels)
}

/// The bytes of one input file, held only until its pixels are decoded.
#[derive(Debug, Clone)]
pub struct RawFrame {
    bytes: Vec<u8>,
}

/// Header and pixels of a successfully decoded frame.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub header: FrameHeader,
    pub pixels: Vec<i32>,
}

impl RawFrame {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Parse the header and return it with the offset where the payload starts.
    pub fn header(&self) -> Result<(FrameHeader, usize), FrameError> {
        let marker = find_marker(&self.bytes).ok_or(FrameError::MissingMarker)?;
        let header = parse_header(&self.bytes[..marker])?;
        Ok((header, marker + BINARY_MARKER.len()))
    }

    /// Parse the header and decode the payload, consuming the raw bytes.
    pub fn decode(self, codec: &dyn PixelCodec) -> Result<DecodedFrame, FrameError> {
        let (header, payload_start) = self.header()?;
        let pixels = decode_payload(
            codec,
            &self.bytes[payload_start..],
            header.compressed_len,
            header.element_count,
        )?;
        Ok(DecodedFrame { header, pixels })
    }

    /// Build a minimal byte-offset CBF frame around `pixels`.
    pub fn synthesize(pixels: &[i32], dimensions: Option<(usize, usize)>) -> Self {
        let payload = ByteOffsetCodec::encode(pixels);
        let mut text = String::from("###CBF: VERSION 1.5\r\n");
        text.push_str("Content-Type: application/octet-stream;\r\n");
        text.push_str("     conversions=\"x-CBF_BYTE_OFFSET\"\r\n");
        text.push_str(&format!("{SIZE_KEY} {}\r\n", payload.len()));
        text.push_str(&format!("{ELEMENTS_KEY} {}\r\n", pixels.len()));
        if let Some((width, height)) = dimensions {
            text.push_str(&format!("{FASTEST_DIM_KEY} {width}\r\n"));
            text.push_str(&format!("{SECOND_DIM_KEY} {height}\r\n"));
        }
        text.push_str("\r\n");

        let mut bytes = text.into_bytes();
        bytes.extend_from_slice(&BINARY_MARKER);
        bytes.extend_from_slice(&payload);
        Self { bytes }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("binary section marker not found")]
    MissingMarker,
    #[error("header field {0} missing or zero")]
    MissingField(&'static str),
    #[error("payload truncated: got {got} bytes, expected {expected}")]
    Truncated { got: usize, expected: usize },
    #[error("header declares {elements} elements but the payload holds at most {limit}")]
    ElementCountExceedsPayload { elements: usize, limit: usize },
    #[error("decoder {0} failed to expand payload")]
    DecodeFailed(String),
    #[error("failed to allocate pixel buffer of {0} elements")]
    Allocation(usize),
}

impl FrameError {
    /// Allocation failures abort the run; everything else only skips the frame.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FrameError::Allocation(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingCodec;

    impl PixelCodec for FailingCodec {
        fn decode(&self, _compressed: &[u8], _out: &mut [i32]) -> usize {
            0
        }
    }

    #[test]
    fn parses_required_fields_with_crlf() {
        let text = b"###CBF: VERSION 1.5\r\nX-Binary-Size: 1234\r\nX-Binary-Number-of-Elements: 100\r\n";
        let header = parse_header(text).unwrap();
        assert_eq!(header.element_count, 100);
        assert_eq!(header.compressed_len, 1234);
        assert_eq!(header.dimensions(), None);
    }

    #[test]
    fn dimension_keys_do_not_shadow_size() {
        let text = b"X-Binary-Size-Fastest-Dimension: 10\nX-Binary-Size-Second-Dimension: 20\n\
X-Binary-Size: 55\nX-Binary-Number-of-Elements: 200\n";
        let header = parse_header(text).unwrap();
        assert_eq!(header.compressed_len, 55);
        assert_eq!(header.dimensions(), Some((10, 20)));
    }

    #[test]
    fn last_occurrence_wins() {
        let text = b"X-Binary-Size: 1\nX-Binary-Size: 9\nX-Binary-Number-of-Elements: 4\n";
        assert_eq!(parse_header(text).unwrap().compressed_len, 9);
    }

    #[test]
    fn missing_or_zero_fields_rejected() {
        let err = parse_header(b"X-Binary-Size: 10\n").unwrap_err();
        assert!(matches!(err, FrameError::MissingField("X-Binary-Number-of-Elements")));

        let err = parse_header(b"X-Binary-Size: 0\nX-Binary-Number-of-Elements: 3\n").unwrap_err();
        assert!(matches!(err, FrameError::MissingField("X-Binary-Size")));

        let err =
            parse_header(b"X-Binary-Size: abc\nX-Binary-Number-of-Elements: 3\n").unwrap_err();
        assert!(matches!(err, FrameError::MissingField("X-Binary-Size")));
    }

    #[test]
    fn marker_found_at_first_occurrence() {
        let mut data = b"abc".to_vec();
        data.extend_from_slice(&BINARY_MARKER);
        data.extend_from_slice(&BINARY_MARKER);
        assert_eq!(find_marker(&data), Some(3));
        assert_eq!(find_marker(b"no marker here"), None);
    }

    #[test]
    fn marker_at_end_of_file_is_found() {
        let mut data = b"X".to_vec();
        data.extend_from_slice(&BINARY_MARKER);
        assert_eq!(find_marker(&data), Some(1));
    }

    #[test]
    fn synthesized_frame_decodes() {
        let pixels: Vec<i32> = (0..12).map(|i| i * 300 - 1000).collect();
        let frame = RawFrame::synthesize(&pixels, Some((4, 3)));
        let decoded = frame.decode(&ByteOffsetCodec).unwrap();
        assert_eq!(decoded.pixels, pixels);
        assert_eq!(decoded.header.element_count, 12);
        assert_eq!(decoded.header.dimensions(), Some((4, 3)));
    }

    #[test]
    fn frame_without_marker_rejected() {
        let frame = RawFrame::new(b"X-Binary-Size: 1\nX-Binary-Number-of-Elements: 1\n".to_vec());
        assert!(matches!(frame.decode(&ByteOffsetCodec), Err(FrameError::MissingMarker)));
    }

    #[test]
    fn truncated_payload_rejected() {
        let mut bytes = RawFrame::synthesize(&[1, 2, 3, 4], None).into_bytes();
        bytes.truncate(bytes.len() - 2);
        let err = RawFrame::new(bytes).decode(&ByteOffsetCodec).unwrap_err();
        assert!(matches!(err, FrameError::Truncated { .. }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn corrupt_element_count_rejected_before_allocation() {
        let mut bytes =
            b"X-Binary-Size: 10\nX-Binary-Number-of-Elements: 4000000000\n".to_vec();
        bytes.extend_from_slice(&BINARY_MARKER);
        bytes.extend_from_slice(&[1; 10]);
        let err = RawFrame::new(bytes).decode(&ByteOffsetCodec).unwrap_err();
        assert!(matches!(
            err,
            FrameError::ElementCountExceedsPayload {
                elements: 4_000_000_000,
                limit: 10
            }
        ));
        assert!(!err.is_fatal());
    }

    #[test]
    fn codec_failure_reported() {
        let frame = RawFrame::synthesize(&[1, 2, 3], None);
        let err = frame.decode(&FailingCodec).unwrap_err();
        assert!(matches!(err, FrameError::DecodeFailed(ref name) if name == "unnamed"));
    }

    #[test]
    fn allocation_failure_is_fatal() {
        let err = FrameError::Allocation(usize::MAX);
        assert!(err.is_fatal());
    }
}
