use futures::future::BoxFuture;

use baton_core::error::{BatonError, Result};
use baton_core::traits::Compressor;
use baton_core::types::CompressionOptions;

/// Pass-through codec: stores the UTF-8 bytes unchanged.
///
/// Used for local runs where no real codec is wired in.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityCompressor;

impl Compressor for IdentityCompressor {
    fn compress<'a>(
        &'a self,
        text: &'a str,
        _options: &'a CompressionOptions,
    ) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async move { Ok(text.as_bytes().to_vec()) })
    }

    fn decompress<'a>(&'a self, bytes: &'a [u8]) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            String::from_utf8(bytes.to_vec())
                .map_err(|e| BatonError::Compression(format!("payload is not UTF-8: {}", e)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use baton_core::types::Priority;

    #[tokio::test]
    async fn identity_round_trip() {
        let codec = IdentityCompressor;
        let opts = CompressionOptions::for_priority(Priority::Low);
        let bytes = codec.compress("{\"k\":1}", &opts).await.unwrap();
        assert_eq!(codec.decompress(&bytes).await.unwrap(), "{\"k\":1}");
    }

    #[tokio::test]
    async fn invalid_utf8_is_a_compression_error() {
        let err = IdentityCompressor.decompress(&[0xff, 0xfe]).await.unwrap_err();
        assert!(matches!(err, BatonError::Compression(_)));
    }
}
