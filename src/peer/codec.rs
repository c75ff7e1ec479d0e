use crate::peer::error::TransportError;
use crate::peer::types::SdpPayload;
use base64::{engine::general_purpose, Engine as _};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use std::io::{Read, Write};

/// Upper bound on a decompressed payload, against zip bombs
const MAX_DECOMPRESSED_SIZE: u64 = 256 * 1024;

fn codec_err(e: impl std::fmt::Display) -> TransportError {
    TransportError::Codec {
        message: e.to_string(),
    }
}

/// JSON -> gzip -> base64
pub fn enc(p: &SdpPayload) -> Result<String, TransportError> {
    let json = serde_json::to_vec(p).map_err(codec_err)?;

    let mut gz = GzEncoder::new(Vec::new(), Compression::fast());
    gz.write_all(&json).map_err(codec_err)?;
    let compressed = gz.finish().map_err(codec_err)?;

    Ok(general_purpose::STANDARD.encode(compressed))
}

/// base64 -> gunzip (size-capped) -> JSON
pub fn dec(s: &str) -> Result<SdpPayload, TransportError> {
    let compressed = general_purpose::STANDARD.decode(s).map_err(codec_err)?;

    let gz = GzDecoder::new(&compressed[..]);
    let mut json = Vec::new();
    let mut limited_reader = gz.take(MAX_DECOMPRESSED_SIZE);
    limited_reader.read_to_end(&mut json).map_err(codec_err)?;

    serde_json::from_slice(&json).map_err(codec_err)
}
