//! PCM capability negotiation
//!
//! The head unit advertises one sampling rate and one sample width. Only the
//! combinations below can be streamed; anything else refuses to start.

use serde::{Deserialize, Serialize};

use crate::error::{AudioError, Result};

/// Raw PCM capability as advertised by the head unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioCapability {
    pub sampling_rate: u32,
    pub bits_per_sample: u8,
}

impl AudioCapability {
    pub const fn new(sampling_rate: u32, bits_per_sample: u8) -> Self {
        Self {
            sampling_rate,
            bits_per_sample,
        }
    }

    /// Resolve the capability to a streamable format
    pub fn format(&self) -> Result<AudioFormat> {
        let sample_rate = match self.sampling_rate {
            8_000 => 8_000,
            16_000 => 16_000,
            22_000 | 22_050 => 22_050,
            44_000 | 44_100 => 44_100,
            other => return Err(AudioError::UnsupportedSamplingRate(other)),
        };
        let sample_type = match self.bits_per_sample {
            8 => SampleType::Unsigned8,
            16 => SampleType::Signed16,
            other => return Err(AudioError::UnsupportedBitsPerSample(other)),
        };
        Ok(AudioFormat {
            sample_rate,
            sample_type,
        })
    }
}

impl Default for AudioCapability {
    fn default() -> Self {
        Self::new(16_000, 16)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleType {
    /// 8 bit, offset binary
    Unsigned8,
    /// 16 bit little endian
    Signed16,
}

impl SampleType {
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            SampleType::Unsigned8 => 1,
            SampleType::Signed16 => 2,
        }
    }
}

/// Output format handed to decoders
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub sample_type: SampleType,
}

impl AudioFormat {
    /// Mono byte rate of this format
    pub fn byte_rate(&self) -> u64 {
        self.sample_rate as u64 * self.sample_type.bytes_per_sample() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_16k_16bit() {
        let format = AudioCapability::default().format().unwrap();
        assert_eq!(format.sample_rate, 16_000);
        assert_eq!(format.sample_type, SampleType::Signed16);
        assert_eq!(format.byte_rate(), 32_000);
    }

    #[test]
    fn test_supported_rates() {
        for (advertised, expected) in [
            (8_000, 8_000),
            (16_000, 16_000),
            (22_000, 22_050),
            (22_050, 22_050),
            (44_100, 44_100),
        ] {
            let format = AudioCapability::new(advertised, 8).format().unwrap();
            assert_eq!(format.sample_rate, expected);
            assert_eq!(format.sample_type, SampleType::Unsigned8);
        }
    }

    #[test]
    fn test_unsupported_combinations() {
        assert!(matches!(
            AudioCapability::new(48_000, 16).format(),
            Err(AudioError::UnsupportedSamplingRate(48_000))
        ));
        assert!(matches!(
            AudioCapability::new(16_000, 24).format(),
            Err(AudioError::UnsupportedBitsPerSample(24))
        ));
    }
}
