// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Decoder for the WAV subset the engine plays: RIFF/WAVE, 16-bit PCM at 44100Hz.

use std::io::{self, Read, Seek, SeekFrom};

use tracing::debug;

use super::error::FormatError;

/// The only sample rate the decoder accepts.
pub const SAMPLE_RATE: u32 = 44100;

/// Largest positive 16-bit magnitude, used for normalization in both directions.
pub const PCM_MAX: f32 = i16::MAX as f32;

const FORMAT_PCM: u16 = 1;
const FORMAT_EXTENSIBLE: u16 = 0xFFFE;
const FORMAT_BODY_LEN: u32 = 16;

/// Normalized audio produced by a successful decode.
#[derive(Debug, Clone)]
pub struct DecodedWave {
    /// Number of interleaved channels.
    pub channel_count: u16,
    /// Sample rate declared by the fmt chunk.
    pub sample_rate: u32,
    /// Interleaved values in [-1.0, 1.0]. Always a whole number of frames.
    pub frames: Vec<f32>,
}

impl DecodedWave {
    /// Number of complete frames.
    pub fn frame_count(&self) -> usize {
        self.frames.len() / self.channel_count as usize
    }
}

struct ChunkHeader {
    tag: [u8; 4],
    size: u32,
}

impl ChunkHeader {
    /// Bytes occupied by the chunk body, including the RIFF pad byte for odd sizes.
    fn padded_size(&self) -> u64 {
        u64::from(self.size) + u64::from(self.size & 1)
    }
}

/// Converts a 16-bit PCM value into the normalized float range.
#[inline]
pub fn pcm_to_float(value: i16) -> f32 {
    (f32::from(value) / PCM_MAX).clamp(-1.0, 1.0)
}

/// Decodes a WAV stream into normalized interleaved frames.
pub fn decode<R: Read + Seek>(mut reader: R) -> Result<DecodedWave, FormatError> {
    let mut tag = [0u8; 4];
    if !read_fully(&mut reader, &mut tag)? || &tag != b"RIFF" {
        return Err(FormatError::NotRiff);
    }
    // The RIFF size is unreliable in the wild and is not needed for the scan.
    let mut riff_size = [0u8; 4];
    if !read_fully(&mut reader, &mut riff_size)? || !read_fully(&mut reader, &mut tag)? {
        return Err(FormatError::NotWave);
    }
    if &tag != b"WAVE" {
        return Err(FormatError::NotWave);
    }

    let fmt = next_chunk_named(&mut reader, b"fmt ")?.ok_or(FormatError::MissingFormat)?;
    if fmt.size < FORMAT_BODY_LEN {
        return Err(FormatError::MissingFormat);
    }
    let mut body = [0u8; FORMAT_BODY_LEN as usize];
    if !read_fully(&mut reader, &mut body)? {
        return Err(FormatError::MissingFormat);
    }
    let format_tag = u16::from_le_bytes([body[0], body[1]]);
    let channel_count = u16::from_le_bytes([body[2], body[3]]);
    let sample_rate = u32::from_le_bytes([body[4], body[5], body[6], body[7]]);
    let bits_per_sample = u16::from_le_bytes([body[14], body[15]]);
    skip(&mut reader, fmt.padded_size() - u64::from(FORMAT_BODY_LEN))?;

    if format_tag != FORMAT_PCM && format_tag != FORMAT_EXTENSIBLE {
        return Err(FormatError::UnsupportedEncoding(format_tag));
    }
    if bits_per_sample != 16 {
        return Err(FormatError::UnsupportedBitDepth(bits_per_sample));
    }
    if sample_rate != SAMPLE_RATE {
        return Err(FormatError::UnsupportedSampleRate(sample_rate, SAMPLE_RATE));
    }
    if channel_count == 0 {
        return Err(FormatError::NoChannels);
    }

    let data = next_chunk_named(&mut reader, b"data")?.ok_or(FormatError::MissingData)?;
    let frame_bytes = usize::from(channel_count) * 2;
    let declared_frames = data.size as usize / frame_bytes;
    let expected_bytes = declared_frames * frame_bytes;

    let mut payload = Vec::new();
    reader
        .by_ref()
        .take(expected_bytes as u64)
        .read_to_end(&mut payload)?;

    // Stop at the last complete frame if the stream ended early. No zero fill.
    let complete = payload.len() / frame_bytes * frame_bytes;
    if complete < expected_bytes {
        debug!(
            declared_frames,
            read_frames = complete / frame_bytes,
            "WAV data chunk truncated"
        );
    }

    let frames = payload[..complete]
        .chunks_exact(2)
        .map(|pair| pcm_to_float(i16::from_le_bytes([pair[0], pair[1]])))
        .collect();

    Ok(DecodedWave {
        channel_count,
        sample_rate,
        frames,
    })
}

/// Scans forward for a chunk with the given tag, skipping everything else by size.
/// Returns None if the stream is exhausted first.
fn next_chunk_named<R: Read + Seek>(
    reader: &mut R,
    wanted: &[u8; 4],
) -> Result<Option<ChunkHeader>, FormatError> {
    loop {
        let mut header = [0u8; 8];
        if !read_fully(reader, &mut header)? {
            return Ok(None);
        }
        let chunk = ChunkHeader {
            tag: [header[0], header[1], header[2], header[3]],
            size: u32::from_le_bytes([header[4], header[5], header[6], header[7]]),
        };
        if &chunk.tag == wanted {
            return Ok(Some(chunk));
        }
        debug!(
            tag = %String::from_utf8_lossy(&chunk.tag),
            size = chunk.size,
            "Skipping WAV chunk"
        );
        skip(reader, chunk.padded_size())?;
    }
}

fn skip<R: Seek>(reader: &mut R, bytes: u64) -> io::Result<()> {
    if bytes > 0 {
        reader.seek(SeekFrom::Current(bytes as i64))?;
    }
    Ok(())
}

/// Fills `buf` completely. Returns false if the stream ended first.
fn read_fully<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}
