// printer.rs — Human-readable disassembly sink
//
// One line per instruction: mnemonic, then operands in trait order, in
// decimal, addresses prefixed by their memory tag (`L`, `A`, `D0`, `D1`,
// `Z`). Boolean flags print as 0/1; SIMD sub-operations print by name.
// Lines terminate with CRLF. Debug output only; never affects program
// bytes.

use std::io::Write;

use crate::error::Result;
use crate::lir::{LirSink, MemoryAddress, SimdOp};

/// LIR sink that writes a disassembly listing.
pub struct LirPrinter<W: Write> {
    out: W,
}

impl<W: Write> LirPrinter<W> {
    pub fn new(out: W) -> Self {
        LirPrinter { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    /// Write a `; `-prefixed comment line. Not part of the sink contract;
    /// the backend uses this for segment boundary annotations.
    pub fn comment(&mut self, text: &str) -> Result<()> {
        write!(self.out, "; {text}\r\n")?;
        Ok(())
    }

    fn line(&mut self, text: String) -> Result<()> {
        write!(self.out, "{text}\r\n")?;
        Ok(())
    }
}

fn flag(value: bool) -> u8 {
    u8::from(value)
}

impl<W: Write> LirSink for LirPrinter<W> {
    fn emit_no_op(&mut self) -> Result<()> {
        self.line("NoOp".to_string())
    }

    fn emit_wait(&mut self, tid: u32) -> Result<()> {
        self.line(format!("Wait {tid}"))
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
        self.line(format!(
            "MatMul {} {} {} {} {} {}",
            flag(accumulate),
            local_stride,
            local_addr,
            acc_stride,
            acc_addr,
            size
        ))
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
        self.line(format!(
            "SIMD {} {} {} {} {} {} {}",
            flag(accumulate),
            op.mnemonic(),
            src_l,
            src_r,
            dst,
            write_acc_addr,
            read_acc_addr
        ))
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
        self.line(format!(
            "DataMove {} {} {} {} {} {} {}",
            flag(to_local),
            flag(accumulate),
            local_stride,
            local_addr,
            stride,
            addr,
            size
        ))
    }

    fn emit_load_weights(
        &mut self,
        local_stride: u64,
        local_addr: MemoryAddress,
        size: u64,
    ) -> Result<()> {
        self.line(format!("LoadWeights {local_stride} {local_addr} {size}"))
    }
}
