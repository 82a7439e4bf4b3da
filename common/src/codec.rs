/// Decoder interface for the compressed pixel payload of a frame.
///
/// Implementations expand `compressed` into exactly `out.len()` signed
/// 32-bit intensities and return the number of input bytes consumed.
/// A return value of 0 signals failure; any other value is success and
/// callers do not validate it further.
pub trait PixelCodec: Send + Sync {
    fn decode(&self, compressed: &[u8], out: &mut [i32]) -> usize;

    /// Human-readable name for logging.
    fn name(&self) -> &str {
        "unnamed"
    }

    /// Most pixels `compressed_len` bytes can hold, when the format bounds it.
    /// Element counts above this are rejected before the pixel buffer is
    /// allocated.
    fn max_elements(&self, _compressed_len: usize) -> Option<usize> {
        None
    }
}

const ESCAPE_8: u8 = 0x80;
const ESCAPE_16: i16 = i16::MIN;
const ESCAPE_32: i32 = i32::MIN;

/// CBF byte-offset codec.
///
/// Each pixel is stored as the delta from the previous pixel (starting at 0).
/// Deltas that fit in an i8 take one byte; otherwise the byte 0x80 is
/// followed by a little-endian i16, which may in turn be the escape 0x8000
/// followed by an i32, which may be the escape 0x80000000 followed by an i64.
#[derive(Debug, Default, Clone, Copy)]
pub struct ByteOffsetCodec;

impl ByteOffsetCodec {
    /// Encode pixels in byte-offset form. Used to build frames for tests and
    /// fixtures; the scanner itself only decodes.
    pub fn encode(pixels: &[i32]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(pixels.len());
        let mut prev: i64 = 0;
        for &px in pixels {
            let delta = px as i64 - prev;
            if (-127..=127).contains(&delta) {
                buf.push(delta as i8 as u8);
            } else {
                buf.push(ESCAPE_8);
                if (-32767..=32767).contains(&delta) {
                    buf.extend_from_slice(&(delta as i16).to_le_bytes());
                } else {
                    buf.extend_from_slice(&ESCAPE_16.to_le_bytes());
                    if delta > i32::MIN as i64 && delta <= i32::MAX as i64 {
                        buf.extend_from_slice(&(delta as i32).to_le_bytes());
                    } else {
                        buf.extend_from_slice(&ESCAPE_32.to_le_bytes());
                        buf.extend_from_slice(&delta.to_le_bytes());
                    }
                }
            }
            prev = px as i64;
        }
        buf
    }
}

impl PixelCodec for ByteOffsetCodec {
    fn decode(&self, compressed: &[u8], out: &mut [i32]) -> usize {
        let mut pos = 0usize;
        let mut base: i64 = 0;

        for slot in out.iter_mut() {
            let Some(&first) = compressed.get(pos) else {
                return 0;
            };
            pos += 1;

            let delta = if first != ESCAPE_8 {
                first as i8 as i64
            } else {
                let Some(d16) = read_le::<2>(compressed, &mut pos).map(i16::from_le_bytes) else {
                    return 0;
                };
                if d16 != ESCAPE_16 {
                    d16 as i64
                } else {
                    let Some(d32) = read_le::<4>(compressed, &mut pos).map(i32::from_le_bytes)
                    else {
                        return 0;
                    };
                    if d32 != ESCAPE_32 {
                        d32 as i64
                    } else {
                        match read_le::<8>(compressed, &mut pos).map(i64::from_le_bytes) {
                            Some(d64) => d64,
                            None => return 0,
                        }
                    }
                }
            };

            base = base.wrapping_add(delta);
            *slot = base as i32;
        }

        pos
    }

    fn name(&self) -> &str {
        "byte_offset"
    }

    /// Every pixel takes at least one byte.
    fn max_elements(&self, compressed_len: usize) -> Option<usize> {
        Some(compressed_len)
    }
}

fn read_le<const N: usize>(data: &[u8], pos: &mut usize) -> Option<[u8; N]> {
    let bytes: [u8; N] = data.get(*pos..*pos + N)?.try_into().ok()?;
    *pos += N;
    Some(bytes)
}
