//! Little-endian element decoding and strided byte copies

use crate::CameraError;

/// Fixed-width integer stored little-endian
pub trait LeElement: Copy {
    /// Width in bytes
    const WIDTH: usize;

    /// Decode from exactly `WIDTH` bytes
    fn from_le_slice(bytes: &[u8]) -> Self;
}

macro_rules! le_element {
    ($($ty:ty),*) => {
        $(
            impl LeElement for $ty {
                const WIDTH: usize = std::mem::size_of::<$ty>();

                fn from_le_slice(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(bytes);
                    <$ty>::from_le_bytes(raw)
                }
            }
        )*
    };
}

le_element!(u8, u16, u32);

/// Decode a whole byte slice into elements; trailing partial bytes are ignored
pub fn decode_le<T: LeElement>(data: &[u8]) -> Vec<T> {
    data.chunks_exact(T::WIDTH).map(T::from_le_slice).collect()
}

/// Copy `count` chunks of `len` bytes, taken every `stride` bytes starting at
/// `offset` in `src`, packed back to back into `dst`.
pub fn copy_strided(
    src: &[u8],
    dst: &mut [u8],
    count: usize,
    len: usize,
    stride: usize,
    offset: usize,
) -> Result<(), CameraError> {
    let needed_dst = count * len;
    let needed_src = match count {
        0 => 0,
        n => offset + (n - 1) * stride + len,
    };
    if dst.len() < needed_dst {
        return Err(CameraError::BufferSize {
            expected: needed_dst,
            actual: dst.len(),
        });
    }
    if src.len() < needed_src {
        return Err(CameraError::BufferSize {
            expected: needed_src,
            actual: src.len(),
        });
    }

    for (i, chunk) in dst[..needed_dst].chunks_exact_mut(len.max(1)).enumerate() {
        let start = offset + i * stride;
        chunk.copy_from_slice(&src[start..start + chunk.len()]);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_le() {
        let data = [0x34, 0x12, 0xCD, 0xAB, 0x99];
        assert_eq!(decode_le::<u16>(&data), vec![0x1234, 0xABCD]);
        assert_eq!(decode_le::<u32>(&data[..4]), vec![0xABCD1234]);
        assert_eq!(decode_le::<u8>(&data[4..]), vec![0x99]);
    }

    #[test]
    fn test_copy_strided_drops_padding() {
        // Two rows of 3 bytes with 2 bytes of padding each
        let src = [1, 2, 3, 0, 0, 4, 5, 6, 0, 0];
        let mut dst = [0u8; 6];
        copy_strided(&src, &mut dst, 2, 3, 5, 0).unwrap();
        assert_eq!(dst, [1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_copy_strided_with_offset() {
        let src = [9, 1, 2, 9, 3, 4];
        let mut dst = [0u8; 4];
        copy_strided(&src, &mut dst, 2, 2, 3, 1).unwrap();
        assert_eq!(dst, [1, 2, 3, 4]);
    }

    #[test]
    fn test_copy_bounds() {
        let src = [0u8; 8];
        let mut dst = [0u8; 4];
        assert!(matches!(
            copy_strided(&src, &mut dst, 2, 4, 4, 0),
            Err(CameraError::BufferSize { expected: 8, actual: 4 })
        ));
        let mut dst = [0u8; 16];
        assert!(matches!(
            copy_strided(&src, &mut dst, 4, 4, 4, 0),
            Err(CameraError::BufferSize { expected: 16, actual: 8 })
        ));
    }
}
