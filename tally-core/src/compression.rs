/*!
Request body compression.

The agent compresses outgoing HTTP bodies with one of these adapters and
advertises the result through `Content-Encoding`; the server side undoes
it transparently in its middleware stack.
*/

use crate::{Result, TallyError};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use std::io::{Read, Write};

/// Compression abstraction for request bodies
pub trait CompressionAdapter: Send + Sync {
    /// Compress the input data
    ///
    /// # Arguments
    /// * `data` - The data to compress
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Decompress the input data
    ///
    /// # Errors
    /// Returns a validation error if `compressed_data` is not valid for this
    /// algorithm.
    fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>>;

    /// Value for the `Content-Encoding` header, `None` for identity
    fn content_encoding(&self) -> Option<&'static str>;
}

/// Gzip compression adapter
///
/// # Example
/// ```rust
/// use tally_core::{CompressionAdapter, GzipCompressor};
///
/// let compressor = GzipCompressor::new();
/// let data = br#"[{"id":"PollCount","type":"counter","delta":1}]"#;
/// let compressed = compressor.compress(data)?;
/// let decompressed = compressor.decompress(&compressed)?;
/// assert_eq!(data, &decompressed[..]);
/// # Ok::<(), tally_core::TallyError>(())
/// ```
#[derive(Debug, Clone)]
pub struct GzipCompressor {
    compression_level: Compression,
}

impl GzipCompressor {
    /// Create a new gzip compressor with the default compression level (6)
    pub fn new() -> Self {
        Self {
            compression_level: Compression::default(),
        }
    }
}

impl Default for GzipCompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl CompressionAdapter for GzipCompressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), self.compression_level);
        encoder.write_all(data)?;
        Ok(encoder.finish()?)
    }

    fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>> {
        let mut decoder = GzDecoder::new(compressed_data);
        let mut decompressed = Vec::new();

        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| TallyError::validation(format!("invalid gzip body: {e}")))?;

        Ok(decompressed)
    }

    fn content_encoding(&self) -> Option<&'static str> {
        Some("gzip")
    }
}

/// Pass-through adapter used when compression is switched off
#[derive(Debug, Clone, Default)]
pub struct NoCompression;

impl CompressionAdapter for NoCompression {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>> {
        Ok(compressed_data.to_vec())
    }

    fn content_encoding(&self) -> Option<&'static str> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gzip_shrinks_metric_batches() {
        let compressor = GzipCompressor::new();
        let batch = br#"{"id":"CPUutilization1","type":"gauge","value":12.5},"#.repeat(40);

        let compressed = compressor.compress(&batch).unwrap();
        assert!(compressed.len() < batch.len());
        assert_eq!(&compressed[..2], &[0x1f, 0x8b]);

        assert_eq!(compressor.decompress(&compressed).unwrap(), batch);
    }

    #[test]
    fn test_no_compression() {
        let compressor = NoCompression;
        let data = b"[]";

        assert_eq!(compressor.compress(data).unwrap(), data);
        assert_eq!(compressor.content_encoding(), None);
        assert_eq!(GzipCompressor::new().content_encoding(), Some("gzip"));
    }

    #[test]
    fn test_gzip_invalid_data_is_validation_error() {
        let result = GzipCompressor::new().decompress(b"this is not gzip");
        assert!(matches!(result, Err(TallyError::Validation(_))));
    }
}
