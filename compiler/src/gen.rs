// gen.rs — Binary instruction generator
//
// Serializes each LIR operation into one fixed-width instruction: operands
// packed LSB-first into a u128 image per the layout, header byte on top,
// then `instruction_size_bytes` little-endian bytes to the writer.
//
// Every field is validated against its layout width before any byte is
// written, so an encoding failure never leaves a partial instruction in the
// stream.
//
// Preconditions: `layout` describes the target architecture.
// Postconditions: output length is a multiple of the instruction size.
// Failure modes: `Encoding` on operand overflow or illegal operand tag;
//                `Io` on writer failure.
// Side effects: writes to the owned writer.

use std::io::Write;

use crate::error::{BackendError, Result};
use crate::layout::{InstructionLayout, OPCODE_BITS, SIMD_OP_BITS};
use crate::lir::{LirSink, MemoryAddress, MemoryTag, Opcode, SimdOp};

// ── Flag nibbles ───────────────────────────────────────────────────────────

pub const MATMUL_FLAG_ACCUMULATE: u8 = 0b0001;
pub const MATMUL_FLAG_ZEROES: u8 = 0b0010;
pub const DATAMOVE_FLAG_TO_LOCAL: u8 = 0b0001;
pub const DATAMOVE_FLAG_ACCUMULATE: u8 = 0b0010;
pub const SIMD_FLAG_ACCUMULATE: u8 = 0b0001;
pub const LOADWEIGHTS_FLAG_ZEROES: u8 = 0b0001;

/// Tag code carried in bits [3:2] of the data-move flag nibble.
pub fn data_move_tag_code(tag: MemoryTag) -> Result<u8> {
    match tag {
        MemoryTag::Dram0 => Ok(0),
        MemoryTag::Dram1 => Ok(1),
        MemoryTag::Accumulator => Ok(2),
        MemoryTag::Local | MemoryTag::Zero => Err(BackendError::invariant(format!(
            "data-move non-local operand has tag {tag:?}"
        ))),
    }
}

pub fn data_move_tag_from_code(code: u8) -> Option<MemoryTag> {
    match code {
        0 => Some(MemoryTag::Dram0),
        1 => Some(MemoryTag::Dram1),
        2 => Some(MemoryTag::Accumulator),
        _ => None,
    }
}

// ── Instruction packer ─────────────────────────────────────────────────────

/// Builds one instruction image. Fields are appended from bit 0 upward;
/// `field` validates the value against its semantic width and advances the
/// cursor by the placement width (padding high bits with zeros).
struct Packer<'a> {
    layout: &'a InstructionLayout,
    image: u128,
    cursor: u32,
}

impl<'a> Packer<'a> {
    fn new(layout: &'a InstructionLayout) -> Self {
        Packer {
            layout,
            image: 0,
            cursor: 0,
        }
    }

    fn field(
        &mut self,
        name: &'static str,
        value: u64,
        check_bits: u32,
        place_bits: u32,
    ) -> Result<()> {
        if check_bits < 64 && value >= 1u64 << check_bits {
            return Err(BackendError::Encoding {
                field: name,
                value,
                width: check_bits,
            });
        }
        self.image |= u128::from(value) << self.cursor;
        self.cursor += place_bits;
        Ok(())
    }

    fn exact(&mut self, name: &'static str, value: u64, bits: u32) -> Result<()> {
        self.field(name, value, bits, bits)
    }

    fn skip(&mut self, bits: u32) {
        self.cursor += bits;
    }

    /// Advance the cursor to the start of the next operand region.
    fn pad_to(&mut self, bit: u32) {
        debug_assert!(self.cursor <= bit);
        self.cursor = bit;
    }

    fn finish(mut self, opcode: Opcode, flags: u8) -> Vec<u8> {
        let size = self.layout.instruction_size_bytes as usize;
        let header = u128::from((opcode as u8) << OPCODE_BITS | (flags & 0xf));
        self.image |= header << ((size as u32 - 1) * 8);
        self.image.to_le_bytes()[..size].to_vec()
    }
}

// ── Generator ──────────────────────────────────────────────────────────────

/// LIR sink that serializes operations to a byte stream.
pub struct LirGen<W: Write> {
    layout: InstructionLayout,
    out: W,
}

impl<W: Write> LirGen<W> {
    pub fn new(layout: InstructionLayout, out: W) -> Self {
        LirGen { layout, out }
    }

    pub fn layout(&self) -> &InstructionLayout {
        &self.layout
    }

    /// Hand the writer back (used when sealing a segment store).
    pub fn into_inner(self) -> W {
        self.out
    }

    fn packer(&self) -> Packer<'_> {
        Packer::new(&self.layout)
    }

    fn write_instruction(&mut self, bytes: Vec<u8>) -> Result<()> {
        self.out.write_all(&bytes)?;
        Ok(())
    }

    /// The local-side operand accepts `Local` directly and `Zero` through
    /// the per-opcode zeroes flag.
    fn check_local_tag(addr: MemoryAddress, ctx: &'static str) -> Result<bool> {
        match addr.tag {
            MemoryTag::Local => Ok(false),
            MemoryTag::Zero => Ok(true),
            other => Err(BackendError::invariant(format!(
                "{ctx} local operand has tag {other:?}"
            ))),
        }
    }

    fn check_acc_tag(addr: MemoryAddress, ctx: &'static str) -> Result<()> {
        if addr.tag != MemoryTag::Accumulator {
            return Err(BackendError::invariant(format!(
                "{ctx} accumulator operand has tag {:?}",
                addr.tag
            )));
        }
        Ok(())
    }
}

impl<W: Write> LirSink for LirGen<W> {
    fn emit_no_op(&mut self) -> Result<()> {
        let p = self.packer();
        let bytes = p.finish(Opcode::NoOp, 0);
        self.write_instruction(bytes)
    }

    fn emit_wait(&mut self, tid: u32) -> Result<()> {
        let l = &self.layout;
        let mut p = Packer::new(l);
        p.pad_to(l.operand2_bits + l.operand1_bits);
        p.exact("thread id", u64::from(tid), l.operand0_addr_bits)?;
        let bytes = p.finish(Opcode::Wait, 0);
        self.write_instruction(bytes)
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
        let zeroes = Self::check_local_tag(local_addr, "matmul")?;
        Self::check_acc_tag(acc_addr, "matmul")?;

        let l = &self.layout;
        let mut p = Packer::new(l);
        p.field("size", size, l.size_bits, l.operand2_bits)?;
        p.field(
            "accumulator address",
            acc_addr.raw,
            l.accumulator_addr_bits,
            l.operand1_addr_bits,
        )?;
        p.exact("accumulator stride", acc_stride, l.stride1_bits)?;
        p.field(
            "local address",
            local_addr.raw,
            l.local_addr_bits,
            l.operand0_addr_bits,
        )?;
        p.exact("local stride", local_stride, l.stride0_bits)?;

        let mut flags = 0;
        if accumulate {
            flags |= MATMUL_FLAG_ACCUMULATE;
        }
        if zeroes {
            flags |= MATMUL_FLAG_ZEROES;
        }
        let bytes = p.finish(Opcode::MatMul, flags);
        self.write_instruction(bytes)
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
        Self::check_acc_tag(write_acc_addr, "simd write")?;
        Self::check_acc_tag(read_acc_addr, "simd read")?;

        let l = &self.layout;
        let mut p = Packer::new(l);
        p.exact("simd destination", dst, l.simd_arg_bits)?;
        p.exact("simd right source", src_r, l.simd_arg_bits)?;
        p.exact("simd left source", src_l, l.simd_arg_bits)?;
        p.exact("simd op", u64::from(op as u8), SIMD_OP_BITS)?;
        p.pad_to(l.operand2_bits);
        p.field(
            "simd write address",
            write_acc_addr.raw,
            l.accumulator_addr_bits,
            l.operand1_addr_bits,
        )?;
        p.skip(l.stride1_bits);
        p.field(
            "simd read address",
            read_acc_addr.raw,
            l.accumulator_addr_bits,
            l.operand0_addr_bits,
        )?;

        let flags = if accumulate { SIMD_FLAG_ACCUMULATE } else { 0 };
        let bytes = p.finish(Opcode::Simd, flags);
        self.write_instruction(bytes)
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
        if local_addr.tag != MemoryTag::Local {
            return Err(BackendError::invariant(format!(
                "data-move local operand has tag {:?}",
                local_addr.tag
            )));
        }
        let tag_code = data_move_tag_code(addr.tag)?;

        let l = &self.layout;
        let mut p = Packer::new(l);
        p.field("size", size, l.size_bits, l.operand2_bits)?;
        p.field(
            "address",
            addr.raw,
            l.addr_bits(addr.tag),
            l.operand1_addr_bits,
        )?;
        p.exact("stride", stride, l.stride1_bits)?;
        p.field(
            "local address",
            local_addr.raw,
            l.local_addr_bits,
            l.operand0_addr_bits,
        )?;
        p.exact("local stride", local_stride, l.stride0_bits)?;

        let mut flags = tag_code << 2;
        if to_local {
            flags |= DATAMOVE_FLAG_TO_LOCAL;
        }
        if accumulate {
            flags |= DATAMOVE_FLAG_ACCUMULATE;
        }
        let bytes = p.finish(Opcode::DataMove, flags);
        self.write_instruction(bytes)
    }

    fn emit_load_weights(
        &mut self,
        local_stride: u64,
        local_addr: MemoryAddress,
        size: u64,
    ) -> Result<()> {
        let zeroes = Self::check_local_tag(local_addr, "load-weights")?;

        let l = &self.layout;
        let mut p = Packer::new(l);
        p.field("size", size, l.size_bits, l.operand2_bits)?;
        p.pad_to(l.operand2_bits + l.operand1_bits);
        p.field(
            "local address",
            local_addr.raw,
            l.local_addr_bits,
            l.operand0_addr_bits,
        )?;
        p.exact("local stride", local_stride, l.stride0_bits)?;

        let flags = if zeroes { LOADWEIGHTS_FLAG_ZEROES } else { 0 };
        let bytes = p.finish(Opcode::LoadWeights, flags);
        self.write_instruction(bytes)
    }
}
