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

//! Sample decoding and storage.
//!
//! This module provides:
//! - WAV decoding into normalized floating point frames
//! - The sample store, which owns decoded samples and issues their ids

mod error;
mod store;
pub mod wav;

pub use error::FormatError;
pub use store::{Sample, SampleId, SampleStore};
pub use wav::DecodedWave;
