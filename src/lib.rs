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

//! A real-time sample mixer for games. WAV samples are decoded into memory,
//! played as any number of overlapping instances, mixed with optional synth and
//! filter hooks, and streamed to an output device in fixed-size 16-bit blocks.

pub mod audio;
pub mod config;
pub mod engine;
pub mod playback;
pub mod playsync;
pub mod samples;
#[cfg(test)]
mod testutil;

pub use engine::AudioEngine;
pub use playback::InstanceHandle;
pub use samples::{FormatError, SampleId};
