// Shared helpers for backend integration tests: a reference architecture
// and a recording sink that captures LIR calls for structural comparison.

// Not every test binary uses every helper.
#![allow(dead_code)]

use tacc::arch::{Architecture, DataType};
use tacc::error::Result;
use tacc::lir::{LirSink, MemoryAddress, SimdOp};

pub fn small_arch(threads: u32) -> Architecture {
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

/// One captured emit call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedOp {
    NoOp,
    Wait {
        tid: u32,
    },
    MatMul {
        accumulate: bool,
        local_stride: u64,
        local_addr: MemoryAddress,
        acc_stride: u64,
        acc_addr: MemoryAddress,
        size: u64,
    },
    Simd {
        accumulate: bool,
        op: SimdOp,
        src_l: u64,
        src_r: u64,
        dst: u64,
        write_acc_addr: MemoryAddress,
        read_acc_addr: MemoryAddress,
    },
    DataMove {
        to_local: bool,
        accumulate: bool,
        local_stride: u64,
        local_addr: MemoryAddress,
        stride: u64,
        addr: MemoryAddress,
        size: u64,
    },
    LoadWeights {
        local_stride: u64,
        local_addr: MemoryAddress,
        size: u64,
    },
}

/// Sink that appends every call to `ops`.
#[derive(Debug, Default)]
pub struct Recorder {
    pub ops: Vec<RecordedOp>,
}

impl Recorder {
    pub fn new() -> Self {
        Recorder::default()
    }
}

impl LirSink for Recorder {
    fn emit_no_op(&mut self) -> Result<()> {
        self.ops.push(RecordedOp::NoOp);
        Ok(())
    }

    fn emit_wait(&mut self, tid: u32) -> Result<()> {
        self.ops.push(RecordedOp::Wait { tid });
        Ok(())
    }

    fn emit_mat_mul(
        &mut self,
        accumulate: bool,
        local_stride: u64,
        local_addr: MemoryAddress,
        acc_stride: u64,
        acc_addr: MemoryAddress,
        size: u64,
    ) -> Result<()> {
        self.ops.push(RecordedOp::MatMul {
            accumulate,
            local_stride,
            local_addr,
            acc_stride,
            acc_addr,
            size,
        });
        Ok(())
    }

    fn emit_simd(
        &mut self,
        accumulate: bool,
        op: SimdOp,
        src_l: u64,
        src_r: u64,
        dst: u64,
        write_acc_addr: MemoryAddress,
        read_acc_addr: MemoryAddress,
    ) -> Result<()> {
        self.ops.push(RecordedOp::Simd {
            accumulate,
            op,
            src_l,
            src_r,
            dst,
            write_acc_addr,
            read_acc_addr,
        });
        Ok(())
    }

    fn emit_data_move(
        &mut self,
        to_local: bool,
        accumulate: bool,
        local_stride: u64,
        local_addr: MemoryAddress,
        stride: u64,
        addr: MemoryAddress,
        size: u64,
    ) -> Result<()> {
        self.ops.push(RecordedOp::DataMove {
            to_local,
            accumulate,
            local_stride,
            local_addr,
            stride,
            addr,
            size,
        });
        Ok(())
    }

    fn emit_load_weights(
        &mut self,
        local_stride: u64,
        local_addr: MemoryAddress,
        size: u64,
    ) -> Result<()> {
        self.ops.push(RecordedOp::LoadWeights {
            local_stride,
            local_addr,
            size,
        });
        Ok(())
    }
}

/// Replay a recorded op into a sink.
pub fn apply(op: &RecordedOp, sink: &mut dyn LirSink) -> Result<()> {
    match *op {
        RecordedOp::NoOp => sink.emit_no_op(),
        RecordedOp::Wait { tid } => sink.emit_wait(tid),
        RecordedOp::MatMul {
            accumulate,
            local_stride,
            local_addr,
            acc_stride,
            acc_addr,
            size,
        } => sink.emit_mat_mul(accumulate, local_stride, local_addr, acc_stride, acc_addr, size),
        RecordedOp::Simd {
            accumulate,
            op,
            src_l,
            src_r,
            dst,
            write_acc_addr,
            read_acc_addr,
        } => sink.emit_simd(accumulate, op, src_l, src_r, dst, write_acc_addr, read_acc_addr),
        RecordedOp::DataMove {
            to_local,
            accumulate,
            local_stride,
            local_addr,
            stride,
            addr,
            size,
        } => sink.emit_data_move(to_local, accumulate, local_stride, local_addr, stride, addr, size),
        RecordedOp::LoadWeights {
            local_stride,
            local_addr,
            size,
        } => sink.emit_load_weights(local_stride, local_addr, size),
    }
}
