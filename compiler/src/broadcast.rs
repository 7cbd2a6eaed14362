// broadcast.rs — Fan-out LIR sink
//
// Forwards every emit call to an ordered list of downstream sinks. The
// first error aborts the call; later sinks in the list do not see the
// failed operation. Used to tee the overlay output to the binary
// generator, the disassembly printer, and the stats estimator.

use crate::error::Result;
use crate::lir::{LirSink, MemoryAddress, SimdOp};

pub struct LirBroadcast<'a> {
    sinks: Vec<&'a mut dyn LirSink>,
}

impl<'a> LirBroadcast<'a> {
    pub fn new(sinks: Vec<&'a mut dyn LirSink>) -> Self {
        LirBroadcast { sinks }
    }
}

impl LirSink for LirBroadcast<'_> {
    fn emit_no_op(&mut self) -> Result<()> {
        for sink in &mut self.sinks {
            sink.emit_no_op()?;
        }
        Ok(())
    }

    fn emit_wait(&mut self, tid: u32) -> Result<()> {
        for sink in &mut self.sinks {
            sink.emit_wait(tid)?;
        }
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
        for sink in &mut self.sinks {
            sink.emit_mat_mul(accumulate, local_stride, local_addr, acc_stride, acc_addr, size)?;
        }
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
        for sink in &mut self.sinks {
            sink.emit_simd(accumulate, op, src_l, src_r, dst, write_acc_addr, read_acc_addr)?;
        }
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
        for sink in &mut self.sinks {
            sink.emit_data_move(
                to_local,
                accumulate,
                local_stride,
                local_addr,
                stride,
                addr,
                size,
            )?;
        }
        Ok(())
    }

    fn emit_load_weights(
        &mut self,
        local_stride: u64,
        local_addr: MemoryAddress,
        size: u64,
    ) -> Result<()> {
        for sink in &mut self.sinks {
            sink.emit_load_weights(local_stride, local_addr, size)?;
        }
        Ok(())
    }
}
