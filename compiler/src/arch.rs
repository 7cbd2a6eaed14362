// arch.rs — Target accelerator architecture descriptor
//
// A read-only record describing the fixed-function units the backend emits
// code for: systolic array geometry, hardware thread count, on-chip memory
// depths, and the stride/SIMD encoding capacities. Descriptors ship as JSON
// files next to the model; serde does the loading.
//
// Preconditions: none.
// Postconditions: a validated descriptor never changes for the lifetime of
//                 a compilation.
// Failure modes: `validate` rejects zero depths and non-power-of-two memory
//                splits.
// Side effects: none.

use std::io::Read;

use serde::{Deserialize, Serialize};

use crate::error::{BackendError, Result};

/// Scalar data type processed by the array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    /// 16-bit fixed point, binary point at bit 8.
    Fp16bp8,
    /// 32-bit floating point.
    Fp32,
}

fn default_stride_depth() -> u64 {
    8
}

fn default_simd_registers_depth() -> u64 {
    1
}

/// Architecture descriptor. Pure data; cheap to clone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Architecture {
    pub data_type: DataType,
    /// Systolic array dimension (array is `array_size × array_size`).
    pub array_size: u64,
    /// Hardware thread count. The overlay supports 1 or 2.
    pub threads: u32,
    /// Total local scratchpad depth, in vectors. Split evenly per thread.
    pub local_depth: u64,
    /// Accumulator register file depth, in vectors.
    pub accumulator_depth: u64,
    /// DRAM bank 0 depth (model variables), in vectors.
    pub dram0_depth: u64,
    /// DRAM bank 1 depth (model constants), in vectors.
    pub dram1_depth: u64,
    /// Number of encodable stride values for the local-side operand.
    #[serde(default = "default_stride_depth")]
    pub stride0_depth: u64,
    /// Number of encodable stride values for the acc/DRAM-side operand.
    #[serde(default = "default_stride_depth")]
    pub stride1_depth: u64,
    /// SIMD register file depth per ALU lane.
    #[serde(default = "default_simd_registers_depth")]
    pub simd_registers_depth: u64,
}

impl Architecture {
    /// Load a descriptor from a JSON reader and validate it.
    pub fn from_json_reader(reader: impl Read) -> Result<Self> {
        let arch: Architecture = serde_json::from_reader(reader)
            .map_err(|e| BackendError::config(format!("malformed architecture: {e}")))?;
        arch.validate()?;
        Ok(arch)
    }

    /// Reject descriptors the instruction layout cannot express.
    ///
    /// Thread-count legality is deliberately not checked here: the overlay
    /// window computation owns that check so it fails at emission time,
    /// before any output bytes.
    pub fn validate(&self) -> Result<()> {
        let depths = [
            ("array_size", self.array_size),
            ("local_depth", self.local_depth),
            ("accumulator_depth", self.accumulator_depth),
            ("dram0_depth", self.dram0_depth),
            ("dram1_depth", self.dram1_depth),
            ("stride0_depth", self.stride0_depth),
            ("stride1_depth", self.stride1_depth),
            ("simd_registers_depth", self.simd_registers_depth),
        ];
        for (name, depth) in depths {
            if depth == 0 {
                return Err(BackendError::config(format!("{name} must be non-zero")));
            }
        }
        if self.threads == 0 {
            return Err(BackendError::config("threads must be non-zero"));
        }
        if self.local_depth % u64::from(self.threads) != 0 {
            return Err(BackendError::config(format!(
                "local_depth {} is not divisible by {} threads",
                self.local_depth, self.threads
            )));
        }
        Ok(())
    }

    /// Per-thread scratchpad depth. Local addresses of thread `tid` are
    /// biased by `thread_local_depth() * tid` during the overlay.
    pub fn thread_local_depth(&self) -> u64 {
        self.local_depth / u64::from(self.threads)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn small_arch(threads: u32) -> Architecture {
        Architecture {
            data_type: DataType::Fp16bp8,
            array_size: 8,
            threads,
            local_depth: 2048,
            accumulator_depth: 512,
            dram0_depth: 1 << 20,
            dram1_depth: 1 << 20,
            stride0_depth: 8,
            stride1_depth: 8,
            simd_registers_depth: 1,
        }
    }

    #[test]
    fn thread_local_depth_splits_evenly() {
        assert_eq!(small_arch(1).thread_local_depth(), 2048);
        assert_eq!(small_arch(2).thread_local_depth(), 1024);
    }

    #[test]
    fn validate_rejects_zero_depth() {
        let mut arch = small_arch(1);
        arch.accumulator_depth = 0;
        assert!(arch.validate().is_err());
    }

    #[test]
    fn validate_rejects_uneven_split() {
        let mut arch = small_arch(2);
        arch.local_depth = 2047;
        assert!(arch.validate().is_err());
    }

    #[test]
    fn json_round_trip() {
        let arch = small_arch(2);
        let json = serde_json::to_string(&arch).unwrap();
        let back = Architecture::from_json_reader(json.as_bytes()).unwrap();
        assert_eq!(arch, back);
    }

    #[test]
    fn json_defaults_apply() {
        let json = r#"{
            "data_type": "fp16bp8",
            "array_size": 8,
            "threads": 1,
            "local_depth": 1024,
            "accumulator_depth": 256,
            "dram0_depth": 1048576,
            "dram1_depth": 1048576
        }"#;
        let arch = Architecture::from_json_reader(json.as_bytes()).unwrap();
        assert_eq!(arch.stride0_depth, 8);
        assert_eq!(arch.simd_registers_depth, 1);
    }
}
