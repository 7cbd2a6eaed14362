// stats.rs — Per-opcode cycle and energy accounting
//
// `Stats` accumulates estimated costs keyed by mnemonic; `LirEstimator` is
// the sink that feeds it. Data moves are keyed per transfer kind so DRAM
// traffic is visible separately from on-chip shuffles.
//
// BTreeMap keys give deterministic iteration for reports.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::Result;
use crate::estimate::{Estimate, Estimator};
use crate::lir::{LirSink, MemoryAddress, MemoryTag, SimdOp};

/// Accumulated cost for one mnemonic.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct OpCost {
    pub count: u64,
    pub cycles: u64,
    pub energy: f64,
}

/// Cost accumulator, attachable to segments and to the final emission.
#[derive(Debug, Clone, Default)]
pub struct Stats {
    entries: BTreeMap<&'static str, OpCost>,
}

impl Stats {
    pub fn new() -> Self {
        Stats::default()
    }

    pub fn add(&mut self, mnemonic: &'static str, estimate: Estimate) {
        let entry = self.entries.entry(mnemonic).or_default();
        entry.count += 1;
        entry.cycles += estimate.cycles;
        entry.energy += estimate.energy;
    }

    pub fn entries(&self) -> impl Iterator<Item = (&'static str, &OpCost)> {
        self.entries.iter().map(|(k, v)| (*k, v))
    }

    pub fn get(&self, mnemonic: &str) -> Option<&OpCost> {
        self.entries.get(mnemonic)
    }

    pub fn total_cycles(&self) -> u64 {
        self.entries.values().map(|e| e.cycles).sum()
    }

    pub fn total_energy(&self) -> f64 {
        self.entries.values().map(|e| e.energy).sum()
    }

    pub fn total_count(&self) -> u64 {
        self.entries.values().map(|e| e.count).sum()
    }
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (mnemonic, cost) in &self.entries {
            writeln!(
                f,
                "{:<24} count {:>8}  cycles {:>10}  energy {:>14.2}",
                mnemonic, cost.count, cost.cycles, cost.energy
            )?;
        }
        Ok(())
    }
}

/// Stats key for a data move, split by direction and peer space.
pub fn data_move_mnemonic(to_local: bool, tag: MemoryTag) -> &'static str {
    match (to_local, tag) {
        (true, MemoryTag::Dram0) => "DataMove(Dram0ToLocal)",
        (false, MemoryTag::Dram0) => "DataMove(LocalToDram0)",
        (true, MemoryTag::Dram1) => "DataMove(Dram1ToLocal)",
        (false, MemoryTag::Dram1) => "DataMove(LocalToDram1)",
        (true, MemoryTag::Accumulator) => "DataMove(AccToLocal)",
        (false, MemoryTag::Accumulator) => "DataMove(LocalToAcc)",
        // Illegal pairs are rejected by the generator; keyed here anyway so
        // the estimator sink stays total.
        (_, MemoryTag::Local | MemoryTag::Zero) => "DataMove(Other)",
    }
}

/// LIR sink that accumulates estimated costs into a `Stats`.
pub struct LirEstimator<'a> {
    estimator: Estimator,
    stats: &'a mut Stats,
}

impl<'a> LirEstimator<'a> {
    pub fn new(estimator: Estimator, stats: &'a mut Stats) -> Self {
        LirEstimator { estimator, stats }
    }
}

impl LirSink for LirEstimator<'_> {
    fn emit_no_op(&mut self) -> Result<()> {
        self.stats.add("NoOp", self.estimator.no_op());
        Ok(())
    }

    fn emit_wait(&mut self, _tid: u32) -> Result<()> {
        self.stats.add("Wait", self.estimator.wait());
        Ok(())
    }

    fn emit_mat_mul(
        &mut self,
        _accumulate: bool,
        _local_stride: u64,
        _local_addr: MemoryAddress,
        _acc_stride: u64,
        _acc_addr: MemoryAddress,
        size: u64,
    ) -> Result<()> {
        self.stats.add("MatMul", self.estimator.mat_mul(size));
        Ok(())
    }

    fn emit_simd(
        &mut self,
        _accumulate: bool,
        _op: SimdOp,
        _src_l: u64,
        _src_r: u64,
        _dst: u64,
        _write_acc_addr: MemoryAddress,
        _read_acc_addr: MemoryAddress,
    ) -> Result<()> {
        self.stats.add("SIMD", self.estimator.simd());
        Ok(())
    }

    fn emit_data_move(
        &mut self,
        to_local: bool,
        _accumulate: bool,
        _local_stride: u64,
        _local_addr: MemoryAddress,
        _stride: u64,
        addr: MemoryAddress,
        size: u64,
    ) -> Result<()> {
        self.stats.add(
            data_move_mnemonic(to_local, addr.tag),
            self.estimator.data_move(addr.tag, size),
        );
        Ok(())
    }

    fn emit_load_weights(
        &mut self,
        _local_stride: u64,
        _local_addr: MemoryAddress,
        size: u64,
    ) -> Result<()> {
        self.stats
            .add("LoadWeights", self.estimator.load_weights(size));
        Ok(())
    }
}
