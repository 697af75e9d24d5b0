//! Minimal RIFF/WAVE container codec.
//!
//! The streaming path packages each incoming PCM slice as its own small WAV
//! container for low-latency playback, so encoding has to be cheap and
//! allocation-light. Decoding exists for the buffered path, where the backend
//! returns one complete WAV body. Only 16-bit PCM is playable; anything else
//! is rejected rather than resampled.

use crate::error::ClientError;

/// Byte length of the canonical header produced by [`encode`].
pub const HEADER_LEN: usize = 44;

/// A decoded WAV container: raw PCM plus its declared format.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedWav {
    pub pcm: Vec<u8>,
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

/// Encode raw PCM into a canonical 44-byte-header WAV container.
///
/// `fmt ` chunk size 16, PCM format tag 1, data chunk holding `pcm`
/// verbatim, all multi-byte integers little-endian. Always succeeds.
pub fn encode(pcm: &[u8], sample_rate: u32, channels: u16, bits_per_sample: u16) -> Vec<u8> {
    let byte_rate = sample_rate * u32::from(channels) * u32::from(bits_per_sample) / 8;
    let block_align = channels * bits_per_sample / 8;

    let mut out = Vec::with_capacity(HEADER_LEN + pcm.len());
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + pcm.len() as u32).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&channels.to_le_bytes());
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&byte_rate.to_le_bytes());
    out.extend_from_slice(&block_align.to_le_bytes());
    out.extend_from_slice(&bits_per_sample.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&(pcm.len() as u32).to_le_bytes());
    out.extend_from_slice(pcm);
    out
}

/// Decode a WAV container back into PCM and format metadata.
///
/// Sub-chunks are located by scanning chunk headers from offset 12, with
/// each sub-chunk padded to even length. A data chunk whose declared size
/// overruns the buffer is clamped to what is actually there (servers have
/// been seen declaring sizes for bodies they then truncate).
pub fn decode(bytes: &[u8]) -> Result<DecodedWav, ClientError> {
    if bytes.len() < 12 || &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        return Err(ClientError::MalformedContainer);
    }

    let mut format: Option<(u16, u16, u32, u16)> = None;
    let mut data: Option<(usize, usize)> = None;

    let mut pos = 12;
    while pos + 8 <= bytes.len() {
        let id = &bytes[pos..pos + 4];
        let declared = read_u32(bytes, pos + 4) as usize;
        let body = pos + 8;

        match id {
            b"fmt " => {
                if body + 16 > bytes.len() {
                    return Err(ClientError::MalformedContainer);
                }
                format = Some((
                    read_u16(bytes, body),      // format tag
                    read_u16(bytes, body + 2),  // channels
                    read_u32(bytes, body + 4),  // sample rate
                    read_u16(bytes, body + 14), // bits per sample
                ));
            }
            b"data" => {
                let end = (body + declared).min(bytes.len());
                data = Some((body.min(end), end));
            }
            _ => {}
        }

        // Sub-chunks are padded to even length.
        pos = body + declared + (declared & 1);
    }

    let (format_tag, channels, sample_rate, bits_per_sample) =
        format.ok_or(ClientError::MalformedContainer)?;
    let (start, end) = data.ok_or(ClientError::MalformedContainer)?;

    if format_tag != 1 || bits_per_sample != 16 {
        return Err(ClientError::UnsupportedFormat);
    }

    Ok(DecodedWav {
        pcm: bytes[start..end].to_vec(),
        sample_rate,
        channels,
        bits_per_sample,
    })
}

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn round_trip_preserves_pcm_and_format() {
        let pcm: Vec<u8> = (0..64).collect();
        for &(rate, channels) in &[(16000u32, 1u16), (24000, 1), (44100, 2)] {
            let encoded = encode(&pcm, rate, channels, 16);
            let decoded = decode(&encoded).unwrap();
            assert_eq!(decoded.pcm, pcm);
            assert_eq!(decoded.sample_rate, rate);
            assert_eq!(decoded.channels, channels);
            assert_eq!(decoded.bits_per_sample, 16);
        }
    }

    #[test]
    fn header_layout_is_canonical() {
        let encoded = encode(&[0u8; 10], 16000, 1, 16);
        assert_eq!(encoded.len(), HEADER_LEN + 10);
        assert_eq!(&encoded[0..4], b"RIFF");
        assert_eq!(read_u32(&encoded, 4), 36 + 10); // riff size
        assert_eq!(&encoded[8..12], b"WAVE");
        assert_eq!(&encoded[12..16], b"fmt ");
        assert_eq!(read_u32(&encoded, 16), 16); // fmt chunk size
        assert_eq!(read_u16(&encoded, 20), 1); // PCM format tag
        assert_eq!(read_u32(&encoded, 28), 32000); // byte rate = 16000 * 1 * 16 / 8
        assert_eq!(read_u16(&encoded, 32), 2); // block align
        assert_eq!(&encoded[36..40], b"data");
        assert_eq!(read_u32(&encoded, 40), 10);
    }

    #[test]
    fn hound_reads_our_output() {
        let samples: Vec<i16> = vec![100, -200, 3000, -4000];
        let pcm: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        let encoded = encode(&pcm, 24000, 1, 16);

        let mut reader = hound::WavReader::new(Cursor::new(encoded)).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.sample_rate, 24000);
        assert_eq!(spec.channels, 1);
        assert_eq!(spec.bits_per_sample, 16);
        let read: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(read, samples);
    }

    #[test]
    fn overlong_data_declaration_is_clamped() {
        let mut encoded = encode(&[1, 2, 3, 4], 16000, 1, 16);
        // Declare far more data than the buffer holds.
        encoded[40..44].copy_from_slice(&1_000_000u32.to_le_bytes());
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded.pcm, vec![1, 2, 3, 4]);
    }

    #[test]
    fn skips_unknown_chunks_with_odd_padding() {
        // RIFF header, then a 3-byte "LIST" chunk (padded to 4), then fmt/data.
        let inner = encode(&[9, 9], 16000, 1, 16);
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"RIFF");
        bytes.extend_from_slice(&0u32.to_le_bytes()); // riff size unused by decode
        bytes.extend_from_slice(b"WAVE");
        bytes.extend_from_slice(b"LIST");
        bytes.extend_from_slice(&3u32.to_le_bytes());
        bytes.extend_from_slice(&[0xAA, 0xBB, 0xCC, 0x00]); // 3 bytes + pad
        bytes.extend_from_slice(&inner[12..]); // fmt + data chunks
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.pcm, vec![9, 9]);
    }

    #[test]
    fn rejects_bad_magic() {
        assert_eq!(decode(b"OggS").unwrap_err(), ClientError::MalformedContainer);
        let mut encoded = encode(&[0; 4], 16000, 1, 16);
        encoded[9] = b'X'; // corrupt WAVE magic
        assert_eq!(decode(&encoded).unwrap_err(), ClientError::MalformedContainer);
    }

    #[test]
    fn rejects_missing_data_chunk() {
        let encoded = encode(&[0; 4], 16000, 1, 16);
        // Truncate right after the fmt chunk.
        assert_eq!(
            decode(&encoded[..36]).unwrap_err(),
            ClientError::MalformedContainer
        );
    }

    #[test]
    fn rejects_non_16bit_pcm() {
        let mut encoded = encode(&[0; 4], 16000, 1, 16);
        encoded[34..36].copy_from_slice(&8u16.to_le_bytes()); // bits per sample
        assert_eq!(decode(&encoded).unwrap_err(), ClientError::UnsupportedFormat);

        let mut encoded = encode(&[0; 4], 16000, 1, 16);
        encoded[20..22].copy_from_slice(&3u16.to_le_bytes()); // IEEE float tag
        assert_eq!(decode(&encoded).unwrap_err(), ClientError::UnsupportedFormat);
    }
}
