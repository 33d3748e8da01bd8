//! Per-frame metadata and its wire encoding.
//!
//! Every buffer handed to the bus carries a little-endian header: sequence,
//! timestamp, geometry, a length-prefixed damage list, and in metadata
//! cursor mode a trailing cursor block whose bitmap travels only when it
//! changed since the last frame of this stream.

use drm_fourcc::DrmFourcc;
use smallvec::SmallVec;
use thiserror::Error;

use crate::utils::{Point, Rectangle, Size};

/// Damage list storage; nearly all frames carry a handful of rects.
pub type DamageList = SmallVec<[Rectangle<i32>; 4]>;

/// Cursor bitmap pixels, ARGB8888 row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorBitmap {
    pub size: Size<i32>,
    pub data: Vec<u8>,
}

impl CursorBitmap {
    /// FNV-1a over the pixel data, used to detect bitmap changes between
    /// frames without keeping the previous copy around.
    pub fn content_hash(&self) -> u64 {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for &byte in &self.data {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        hash ^ (self.size.w as u64) << 32 ^ self.size.h as u64
    }
}

/// Cursor side-channel of one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorMeta {
    pub position: Point<i32>,
    pub hotspot: Point<i32>,
    /// Only set when the bitmap changed since the last frame sent on this
    /// stream; receivers keep the previous bitmap otherwise.
    pub bitmap: Option<CursorBitmap>,
}

/// Everything the consumer needs to interpret one buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameMeta {
    pub sequence: u64,
    pub timestamp_ns: u64,
    pub size: Size<i32>,
    pub stride: u32,
    pub fourcc: DrmFourcc,
    pub damage: DamageList,
    pub cursor: Option<CursorMeta>,
}

#[derive(Debug, Error)]
pub enum FrameDecodeError {
    #[error("header truncated")]
    Truncated,
    #[error("unknown fourcc {0:#010x}")]
    UnknownFourcc(u32),
}

impl FrameMeta {
    /// Encode the wire header.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.extend_from_slice(&self.sequence.to_le_bytes());
        out.extend_from_slice(&self.timestamp_ns.to_le_bytes());
        out.extend_from_slice(&(self.size.w as u32).to_le_bytes());
        out.extend_from_slice(&(self.size.h as u32).to_le_bytes());
        out.extend_from_slice(&self.stride.to_le_bytes());
        out.extend_from_slice(&(self.fourcc as u32).to_le_bytes());
        out.extend_from_slice(&(self.damage.len() as u32).to_le_bytes());
        for rect in &self.damage {
            out.extend_from_slice(&rect.loc.x.to_le_bytes());
            out.extend_from_slice(&rect.loc.y.to_le_bytes());
            out.extend_from_slice(&rect.size.w.to_le_bytes());
            out.extend_from_slice(&rect.size.h.to_le_bytes());
        }
        if let Some(ref cursor) = self.cursor {
            out.extend_from_slice(&cursor.position.x.to_le_bytes());
            out.extend_from_slice(&cursor.position.y.to_le_bytes());
            out.extend_from_slice(&(cursor.hotspot.x as u32).to_le_bytes());
            out.extend_from_slice(&(cursor.hotspot.y as u32).to_le_bytes());
            match &cursor.bitmap {
                Some(bitmap) => {
                    out.extend_from_slice(&(bitmap.size.w as u32).to_le_bytes());
                    out.extend_from_slice(&(bitmap.size.h as u32).to_le_bytes());
                    out.extend_from_slice(&bitmap.data);
                }
                None => {
                    out.extend_from_slice(&0u32.to_le_bytes());
                    out.extend_from_slice(&0u32.to_le_bytes());
                }
            }
        }
        out
    }

    /// Decode a wire header. `with_cursor` reflects the stream's cursor
    /// mode; the header is not self-describing in that regard.
    pub fn decode(bytes: &[u8], with_cursor: bool) -> Result<FrameMeta, FrameDecodeError> {
        let mut cursor = Reader { bytes, at: 0 };
        let sequence = cursor.u64()?;
        let timestamp_ns = cursor.u64()?;
        let width = cursor.u32()? as i32;
        let height = cursor.u32()? as i32;
        let stride = cursor.u32()?;
        let raw_fourcc = cursor.u32()?;
        let fourcc = DrmFourcc::try_from(raw_fourcc)
            .map_err(|_| FrameDecodeError::UnknownFourcc(raw_fourcc))?;
        let damage_len = cursor.u32()? as usize;
        let mut damage = DamageList::new();
        for _ in 0..damage_len {
            let x = cursor.i32()?;
            let y = cursor.i32()?;
            let w = cursor.i32()?;
            let h = cursor.i32()?;
            damage.push(Rectangle::new((x, y), (w, h)));
        }
        let cursor_meta = if with_cursor {
            let x = cursor.i32()?;
            let y = cursor.i32()?;
            let hx = cursor.u32()? as i32;
            let hy = cursor.u32()? as i32;
            let bw = cursor.u32()?;
            let bh = cursor.u32()?;
            let bitmap = if bw > 0 && bh > 0 {
                // Dimensions come off the wire; the byte count must not be
                // computed in overflowing integer math.
                let w = i32::try_from(bw).map_err(|_| FrameDecodeError::Truncated)?;
                let h = i32::try_from(bh).map_err(|_| FrameDecodeError::Truncated)?;
                let len = u64::from(bw) * u64::from(bh) * 4;
                let len = usize::try_from(len).map_err(|_| FrameDecodeError::Truncated)?;
                let data = cursor.bytes(len)?.to_vec();
                Some(CursorBitmap {
                    size: Size::from((w, h)),
                    data,
                })
            } else {
                None
            };
            Some(CursorMeta {
                position: Point::from((x, y)),
                hotspot: Point::from((hx, hy)),
                bitmap,
            })
        } else {
            None
        };
        Ok(FrameMeta {
            sequence,
            timestamp_ns,
            size: Size::from((width, height)),
            stride,
            fourcc,
            damage,
            cursor: cursor_meta,
        })
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    at: usize,
}

impl<'a> Reader<'a> {
    fn bytes(&mut self, len: usize) -> Result<&'a [u8], FrameDecodeError> {
        let end = self.at.checked_add(len).ok_or(FrameDecodeError::Truncated)?;
        let slice = self.bytes.get(self.at..end).ok_or(FrameDecodeError::Truncated)?;
        self.at = end;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32, FrameDecodeError> {
        Ok(u32::from_le_bytes(self.bytes(4)?.try_into().unwrap()))
    }

    fn i32(&mut self) -> Result<i32, FrameDecodeError> {
        Ok(i32::from_le_bytes(self.bytes(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, FrameDecodeError> {
        Ok(u64::from_le_bytes(self.bytes(8)?.try_into().unwrap()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    #[test]
    fn header_reads_back() {
        let meta = FrameMeta {
            sequence: 42,
            timestamp_ns: 1_000_000_007,
            size: Size::from((1920, 1080)),
            stride: 1920 * 4,
            fourcc: DrmFourcc::Xrgb8888,
            damage: smallvec![Rectangle::new((0, 0), (100, 100)), Rectangle::new((5, 7), (1, 1))],
            cursor: None,
        };
        let decoded = FrameMeta::decode(&meta.encode(), false).unwrap();
        assert_eq!(decoded, meta);
    }

    #[test]
    fn cursor_block_with_bitmap() {
        let bitmap = CursorBitmap {
            size: Size::from((2, 2)),
            data: vec![0xff; 16],
        };
        let meta = FrameMeta {
            sequence: 1,
            timestamp_ns: 1,
            size: Size::from((64, 64)),
            stride: 256,
            fourcc: DrmFourcc::Argb8888,
            damage: DamageList::new(),
            cursor: Some(CursorMeta {
                position: Point::from((10, -3)),
                hotspot: Point::from((1, 1)),
                bitmap: Some(bitmap),
            }),
        };
        let decoded = FrameMeta::decode(&meta.encode(), true).unwrap();
        assert_eq!(decoded, meta);
    }

    #[test]
    fn cursor_block_without_bitmap() {
        let meta = FrameMeta {
            sequence: 2,
            timestamp_ns: 2,
            size: Size::from((64, 64)),
            stride: 256,
            fourcc: DrmFourcc::Argb8888,
            damage: DamageList::new(),
            cursor: Some(CursorMeta {
                position: Point::from((0, 0)),
                hotspot: Point::from((0, 0)),
                bitmap: None,
            }),
        };
        let decoded = FrameMeta::decode(&meta.encode(), true).unwrap();
        assert_eq!(decoded, meta);
    }

    #[test]
    fn truncated_header_is_an_error() {
        let meta = FrameMeta {
            sequence: 3,
            timestamp_ns: 9,
            size: Size::from((8, 8)),
            stride: 32,
            fourcc: DrmFourcc::Xrgb8888,
            damage: smallvec![Rectangle::new((0, 0), (8, 8))],
            cursor: None,
        };
        let encoded = meta.encode();
        assert!(matches!(
            FrameMeta::decode(&encoded[..encoded.len() - 1], false),
            Err(FrameDecodeError::Truncated)
        ));
    }

    #[test]
    fn absurd_bitmap_dimensions_are_rejected() {
        let meta = FrameMeta {
            sequence: 4,
            timestamp_ns: 4,
            size: Size::from((64, 64)),
            stride: 256,
            fourcc: DrmFourcc::Argb8888,
            damage: DamageList::new(),
            cursor: Some(CursorMeta {
                position: Point::from((0, 0)),
                hotspot: Point::from((0, 0)),
                bitmap: None,
            }),
        };
        // Forge the trailing bitmap dimensions; 65536 x 65536 overflows a
        // 32-bit byte count and must error out instead of panicking.
        let mut forged = meta.encode();
        let at = forged.len() - 8;
        forged[at..at + 4].copy_from_slice(&65536u32.to_le_bytes());
        forged[at + 4..].copy_from_slice(&65536u32.to_le_bytes());
        assert!(matches!(
            FrameMeta::decode(&forged, true),
            Err(FrameDecodeError::Truncated)
        ));
    }

    #[test]
    fn bitmap_hash_tracks_content() {
        let a = CursorBitmap {
            size: Size::from((2, 2)),
            data: vec![1; 16],
        };
        let mut b = a.clone();
        assert_eq!(a.content_hash(), b.content_hash());
        b.data[3] = 2;
        assert_ne!(a.content_hash(), b.content_hash());
    }
}
