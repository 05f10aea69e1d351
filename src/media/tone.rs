//! Procedural outgoing media: a sine tone for audio and a moving-bar
//! pattern for video. These stand in for capture hardware, which stays
//! behind the engine seam.

use bytes::Bytes;
use std::time::Duration;

/// Audio frame cadence (20ms at 8kHz, 160 samples).
pub const AUDIO_FRAME: Duration = Duration::from_millis(20);
/// Video frame cadence (10 fps).
pub const VIDEO_FRAME: Duration = Duration::from_millis(100);

const AUDIO_SAMPLES_PER_FRAME: usize = 160;

/// Generates 1kHz sine wave frames as little-endian PCM.
pub struct ToneSource {
    phase: f64,
    frequency: f64,
    sample_rate: f64,
    amplitude: f64,
}

impl ToneSource {
    pub fn new() -> Self {
        Self {
            phase: 0.0,
            frequency: 1000.0,
            sample_rate: 8000.0,
            amplitude: 0.8,
        }
    }

    /// Generate the next 20ms frame.
    pub fn next_frame(&mut self) -> Bytes {
        let mut frame = Vec::with_capacity(AUDIO_SAMPLES_PER_FRAME * 2);
        let phase_inc = 2.0 * std::f64::consts::PI * self.frequency / self.sample_rate;
        for _ in 0..AUDIO_SAMPLES_PER_FRAME {
            let sample = (self.phase.sin() * self.amplitude * 32767.0) as i16;
            frame.extend_from_slice(&sample.to_le_bytes());
            self.phase += phase_inc;
            if self.phase > 2.0 * std::f64::consts::PI {
                self.phase -= 2.0 * std::f64::consts::PI;
            }
        }
        Bytes::from(frame)
    }
}

impl Default for ToneSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Generates a vertical bar sweeping across a small grayscale frame.
/// Switching the camera reverses the sweep direction, so the change is
/// observable without real hardware.
pub struct PatternSource {
    width: usize,
    height: usize,
    bar: usize,
    reversed: bool,
}

impl PatternSource {
    pub fn new() -> Self {
        Self {
            width: 64,
            height: 48,
            bar: 0,
            reversed: false,
        }
    }

    /// Reverse the sweep direction (camera-switch observable).
    pub fn set_reversed(&mut self, reversed: bool) {
        self.reversed = reversed;
    }

    /// Render the next frame and advance the bar one column.
    pub fn next_frame(&mut self) -> Bytes {
        let mut frame = vec![0u8; self.width * self.height];
        for row in 0..self.height {
            frame[row * self.width + self.bar] = 0xff;
        }

        self.bar = if self.reversed {
            self.bar.checked_sub(1).unwrap_or(self.width - 1)
        } else {
            (self.bar + 1) % self.width
        };

        Bytes::from(frame)
    }
}

impl Default for PatternSource {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tone_frame_shape() {
        let mut tone = ToneSource::new();
        let frame = tone.next_frame();
        assert_eq!(frame.len(), AUDIO_SAMPLES_PER_FRAME * 2);

        // A 1kHz tone is not silence.
        let any_nonzero = frame
            .chunks_exact(2)
            .any(|pair| i16::from_le_bytes([pair[0], pair[1]]) != 0);
        assert!(any_nonzero);
    }

    #[test]
    fn test_pattern_bar_advances_and_wraps() {
        let mut pattern = PatternSource::new();
        let first = pattern.next_frame();
        let second = pattern.next_frame();
        assert_ne!(first, second);

        // A full sweep returns to the starting column.
        for _ in 0..62 {
            pattern.next_frame();
        }
        let wrapped = pattern.next_frame();
        assert_eq!(first, wrapped);
    }

    #[test]
    fn test_pattern_reverse_direction() {
        let mut pattern = PatternSource::new();
        let start = pattern.next_frame();
        pattern.set_reversed(true);
        // One reversed step re-renders the advanced column, the next one
        // lands back on the start column.
        pattern.next_frame();
        let back = pattern.next_frame();
        assert_eq!(start, back);
    }
}
