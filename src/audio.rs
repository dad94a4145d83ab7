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
pub mod block;
pub mod cpal;
pub mod mixer;
pub mod mock;
pub mod pipe;
pub mod sink;
pub mod stream;
pub mod thread_priority;

pub use block::{Block, BlockPool, BlockRecycler};
pub use mixer::{FilterHook, Mixer, SynthHook};
pub use sink::{DeviceError, DeviceSink, PushOutcome, StreamConfig, WaitStrategy};
pub use stream::{
    GlobalClock, StreamEngine, StreamOptions, StreamState, StreamStats, StreamStatsSnapshot,
};

/// Lists devices known to cpal.
pub fn list_devices() -> Result<Vec<cpal::CpalSink>, DeviceError> {
    cpal::CpalSink::list()
}

/// Gets a sink for the given device name.
///
/// - `mock...` is a mock device that consumes blocks in real time.
/// - `pipe:-` writes raw PCM to stdout, `pipe:<path>` to a file.
/// - Anything else names a cpal output device; `default` is the host default.
pub fn get_sink(device: &str) -> Result<Box<dyn DeviceSink>, DeviceError> {
    if device.starts_with("mock") {
        return Ok(Box::new(mock::MockSink::paced(device)));
    }
    if let Some(target) = device.strip_prefix("pipe:") {
        return Ok(Box::new(pipe::PipeSink::new(pipe::PipeTarget::parse(
            target,
        ))));
    }

    Ok(Box::new(cpal::CpalSink::get(device)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_sink_by_name() {
        let mock = get_sink("mock-device").unwrap();
        assert_eq!(mock.to_string(), "mock-device (Mock)");
        assert_eq!(mock.strategy(), WaitStrategy::Blocking);

        let pipe = get_sink("pipe:-").unwrap();
        assert_eq!(pipe.to_string(), "stdout (Pipe)");

        let file = get_sink("pipe:/tmp/capture.pcm").unwrap();
        assert_eq!(file.to_string(), "/tmp/capture.pcm (Pipe)");
    }
}
