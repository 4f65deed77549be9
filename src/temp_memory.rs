use crate::config::DetectorConfig;
use crate::error::SiftError;
use crate::pyramid::{octave_floats, octave_sizes};

/// Scratch memory holding the Gaussian and DoG scale space of one image.
///
/// One buffer serves one detection at a time; [`detect`](crate::detect) borrows it mutably for
/// the whole call.
#[derive(Debug)]
pub struct TempMemory {
    data: Vec<f32>,
}

impl TempMemory {
    /// Number of floats needed to detect on a `width`x`height` image.
    pub fn required_floats(width: u32, height: u32, num_octaves: usize, upsample: bool) -> usize {
        octave_sizes(width, height, num_octaves, upsample)
            .into_iter()
            .map(octave_floats)
            .sum()
    }

    pub fn required_bytes(width: u32, height: u32, num_octaves: usize, upsample: bool) -> usize {
        Self::required_floats(width, height, num_octaves, upsample) * std::mem::size_of::<f32>()
    }

    /// Allocate exactly what a detection with these parameters needs.
    pub fn alloc(
        width: u32,
        height: u32,
        num_octaves: usize,
        upsample: bool,
    ) -> Result<Self, SiftError> {
        Self::with_len(Self::required_floats(
            width,
            height,
            num_octaves,
            upsample,
        ))
    }

    pub fn for_config(width: u32, height: u32, config: &DetectorConfig) -> Result<Self, SiftError> {
        Self::alloc(width, height, config.num_octaves, config.upsample)
    }

    pub fn with_len(len: usize) -> Result<Self, SiftError> {
        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|_| SiftError::AllocationFailed {
                bytes: len.saturating_mul(std::mem::size_of::<f32>()),
            })?;
        data.resize(len, 0.0);
        Ok(Self { data })
    }

    /// Capacity in floats.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Frees the buffer now. Dropping the value does the same.
    pub fn release(self) {}

    pub(crate) fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }
}
