//! Whole-blob compression above a size threshold, with magic-byte detection
//! so decompression on read is transparent to callers.

use super::error::SerializerError;

/// Leading bytes identifying a zstd-compressed blob. Anything else is
/// treated as uncompressed.
const MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Compress `data` iff its length exceeds `threshold_bytes`; a blob exactly
/// at the threshold is left unchanged. The magic bytes make this
/// self-describing on read.
pub fn compress_if_above_threshold(
    data: &[u8],
    threshold_bytes: usize,
) -> Result<Vec<u8>, SerializerError> {
    if data.len() <= threshold_bytes {
        return Ok(data.to_vec());
    }
    zstd::stream::encode_all(data, 0)
        .map_err(|e| SerializerError::IntegrityError(format!("compression failed: {e}")))
}

/// Decompress `data` if it carries the zstd magic bytes; otherwise return it
/// unchanged.
pub fn decompress_transparent(data: &[u8]) -> Result<Vec<u8>, SerializerError> {
    if data.len() >= MAGIC.len() && data[..MAGIC.len()] == MAGIC {
        return zstd::stream::decode_all(data)
            .map_err(|e| SerializerError::IntegrityError(format!("decompression failed: {e}")));
    }
    Ok(data.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaves_small_blobs_untouched() {
        let data = vec![1u8, 2, 3];
        let out = compress_if_above_threshold(&data, 4096).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn round_trips_large_blobs() {
        let data = vec![7u8; 10_000];
        let compressed = compress_if_above_threshold(&data, 4096).unwrap();
        assert!(compressed.len() < data.len());
        let decompressed = decompress_transparent(&compressed).unwrap();
        assert_eq!(decompressed, data);
    }

    #[test]
    fn decompress_is_a_noop_for_uncompressed_data() {
        let data = vec![9u8; 10];
        let out = decompress_transparent(&data).unwrap();
        assert_eq!(out, data);
    }
}
