// estimate.rs — Cycle and energy cost model
//
// Maps each LIR operation to an estimated cycle and energy cost. The model
// is pure and reproducible: same architecture, same operands, same answer.
// Costs feed three consumers: per-opcode stats, the overlay's per-thread
// cycle counters, and the cycle-balancing pad policy.
//
// Constants preserve the proportionality rules of the hardware units
// rather than any silicon calibration: the matrix unit streams one row per
// cycle and drains an array-deep pipeline, DRAM transfers pay a fixed
// latency plus per-word cost, the weight loader pays a setup cost.

use crate::arch::Architecture;
use crate::lir::MemoryTag;

/// Extra cycles to drain the weight loader before streaming.
const LOAD_WEIGHTS_SETUP_CYCLES: u64 = 2;
/// Cycles per vector moved to or from DRAM.
const DRAM_WORD_CYCLES: u64 = 2;
/// Fixed DRAM transaction latency.
const DRAM_LATENCY_CYCLES: u64 = 6;
/// Cycles beyond the stream length for an on-chip move.
const ON_CHIP_MOVE_OVERHEAD_CYCLES: u64 = 1;

/// Energy per multiply-accumulate, arbitrary units.
const MAC_ENERGY: f64 = 0.25;
/// Energy per scalar crossing the DRAM interface.
const DRAM_WORD_ENERGY: f64 = 2.5;
/// Energy per scalar moved on-chip.
const ON_CHIP_WORD_ENERGY: f64 = 0.5;
/// Energy per SIMD lane per operation.
const SIMD_LANE_ENERGY: f64 = 0.125;

/// Estimated cost of one instruction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Estimate {
    pub cycles: u64,
    pub energy: f64,
}

/// The cost model. Holds only what it needs from the architecture.
#[derive(Debug, Clone, Copy)]
pub struct Estimator {
    array_size: u64,
}

impl Estimator {
    pub fn new(arch: &Architecture) -> Self {
        Estimator {
            array_size: arch.array_size,
        }
    }

    pub fn no_op(&self) -> Estimate {
        Estimate {
            cycles: 1,
            energy: 0.0,
        }
    }

    pub fn wait(&self) -> Estimate {
        Estimate {
            cycles: 1,
            energy: 0.0,
        }
    }

    /// `size + 1` rows streamed through an array-deep pipeline.
    pub fn mat_mul(&self, size: u64) -> Estimate {
        let rows = size + 1;
        Estimate {
            cycles: rows + self.array_size,
            energy: (rows * self.array_size * self.array_size) as f64 * MAC_ENERGY,
        }
    }

    pub fn simd(&self) -> Estimate {
        Estimate {
            cycles: 1,
            energy: self.array_size as f64 * SIMD_LANE_ENERGY,
        }
    }

    /// Cost varies with the non-local operand's memory space.
    pub fn data_move(&self, tag: MemoryTag, size: u64) -> Estimate {
        let vectors = size + 1;
        match tag {
            MemoryTag::Dram0 | MemoryTag::Dram1 => Estimate {
                cycles: vectors * DRAM_WORD_CYCLES + DRAM_LATENCY_CYCLES,
                energy: (vectors * self.array_size) as f64 * DRAM_WORD_ENERGY,
            },
            _ => Estimate {
                cycles: vectors + ON_CHIP_MOVE_OVERHEAD_CYCLES,
                energy: (vectors * self.array_size) as f64 * ON_CHIP_WORD_ENERGY,
            },
        }
    }

    pub fn load_weights(&self, size: u64) -> Estimate {
        let rows = size + 1;
        Estimate {
            cycles: rows + LOAD_WEIGHTS_SETUP_CYCLES,
            energy: (rows * self.array_size) as f64 * ON_CHIP_WORD_ENERGY,
        }
    }
}
