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
/// Errors produced while decoding a WAV stream. A failed decode never leaves
/// partial state in the sample store.
#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error("missing RIFF header")]
    NotRiff,

    #[error("RIFF container is not of type WAVE")]
    NotWave,

    #[error("missing or truncated fmt chunk")]
    MissingFormat,

    #[error("unsupported encoding {0:#06x}, only PCM is supported")]
    UnsupportedEncoding(u16),

    #[error("unsupported bit depth {0}, only 16-bit PCM is supported")]
    UnsupportedBitDepth(u16),

    #[error("unsupported sample rate {0}Hz, only {1}Hz is supported")]
    UnsupportedSampleRate(u32, u32),

    #[error("format declares zero channels")]
    NoChannels,

    #[error("no data chunk found")]
    MissingData,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
