// parser.rs — Binary segment stream parser
//
// Reads a previously serialized instruction stream and replays each
// instruction into any LIR sink. The decode is the exact mirror of the
// generator's packing: little-endian image, operands LSB-first, header in
// the top byte.
//
// `CombinedParser` concatenates several parsers into one logical stream;
// the overlay uses it to feed one thread's segment slots as a single
// sequence.
//
// Preconditions: the stream was produced by `LirGen` under the same layout.
// Postconditions: each `parse_next` consumes exactly one instruction.
// Failure modes: `Encoding` on an unknown opcode or flag pattern; `Io` on
//                truncated reads.
// Side effects: consumes the reader.

use std::io::Read;

use crate::error::{BackendError, Result};
use crate::gen::{
    data_move_tag_from_code, DATAMOVE_FLAG_ACCUMULATE, DATAMOVE_FLAG_TO_LOCAL,
    LOADWEIGHTS_FLAG_ZEROES, MATMUL_FLAG_ACCUMULATE, MATMUL_FLAG_ZEROES, SIMD_FLAG_ACCUMULATE,
};
use crate::layout::{InstructionLayout, OPCODE_BITS, SIMD_OP_BITS};
use crate::lir::{LirSink, MemoryAddress, MemoryTag, Opcode, SimdOp};

/// Replays one serialized segment stream into LIR sinks.
pub struct LirParser<R: Read> {
    layout: InstructionLayout,
    reader: R,
    remaining: u64,
}

impl<R: Read> LirParser<R> {
    /// `instruction_count` frames the stream; segment stores carry it
    /// alongside the bytes.
    pub fn new(layout: InstructionLayout, reader: R, instruction_count: u64) -> Self {
        LirParser {
            layout,
            reader,
            remaining: instruction_count,
        }
    }

    pub fn has_next(&self) -> bool {
        self.remaining > 0
    }

    /// Consume exactly one instruction and replay it into `sink`.
    pub fn parse_next(&mut self, sink: &mut dyn LirSink) -> Result<()> {
        if self.remaining == 0 {
            return Err(BackendError::invariant("parse_next past end of stream"));
        }
        self.remaining -= 1;

        let size = self.layout.instruction_size_bytes as usize;
        let mut buf = [0u8; 16];
        self.reader.read_exact(&mut buf[..size])?;
        let image = u128::from_le_bytes(buf);

        let header = buf[size - 1];
        let opcode_code = header >> OPCODE_BITS;
        let flags = header & 0xf;
        let opcode = Opcode::from_code(opcode_code).ok_or(BackendError::Encoding {
            field: "opcode",
            value: u64::from(opcode_code),
            width: OPCODE_BITS,
        })?;

        let l = &self.layout;
        let op1_base = l.operand2_bits;
        let op0_base = l.operand2_bits + l.operand1_bits;

        let extract = |pos: u32, width: u32| -> u64 {
            ((image >> pos) & ((1u128 << width) - 1)) as u64
        };

        let operand2 = extract(0, l.operand2_bits);
        let op1_addr = extract(op1_base, l.operand1_addr_bits);
        let op1_stride = extract(op1_base + l.operand1_addr_bits, l.stride1_bits);
        let op0_addr = extract(op0_base, l.operand0_addr_bits);
        let op0_stride = extract(op0_base + l.operand0_addr_bits, l.stride0_bits);

        match opcode {
            Opcode::NoOp => sink.emit_no_op(),
            Opcode::Wait => sink.emit_wait(op0_addr as u32),
            Opcode::MatMul => {
                let local_tag = if flags & MATMUL_FLAG_ZEROES != 0 {
                    MemoryTag::Zero
                } else {
                    MemoryTag::Local
                };
                sink.emit_mat_mul(
                    flags & MATMUL_FLAG_ACCUMULATE != 0,
                    op0_stride,
                    MemoryAddress::new(local_tag, op0_addr),
                    op1_stride,
                    MemoryAddress::new(MemoryTag::Accumulator, op1_addr),
                    operand2,
                )
            }
            Opcode::Simd => {
                let arg = l.simd_arg_bits;
                let dst = extract(0, arg);
                let src_r = extract(arg, arg);
                let src_l = extract(2 * arg, arg);
                let op_code = extract(3 * arg, SIMD_OP_BITS) as u8;
                let op = SimdOp::from_code(op_code).ok_or(BackendError::Encoding {
                    field: "simd op",
                    value: u64::from(op_code),
                    width: SIMD_OP_BITS,
                })?;
                sink.emit_simd(
                    flags & SIMD_FLAG_ACCUMULATE != 0,
                    op,
                    src_l,
                    src_r,
                    dst,
                    MemoryAddress::new(MemoryTag::Accumulator, op1_addr),
                    MemoryAddress::new(MemoryTag::Accumulator, op0_addr),
                )
            }
            Opcode::DataMove => {
                let tag = data_move_tag_from_code(flags >> 2).ok_or(BackendError::Encoding {
                    field: "data-move tag code",
                    value: u64::from(flags >> 2),
                    width: 2,
                })?;
                sink.emit_data_move(
                    flags & DATAMOVE_FLAG_TO_LOCAL != 0,
                    flags & DATAMOVE_FLAG_ACCUMULATE != 0,
                    op0_stride,
                    MemoryAddress::new(MemoryTag::Local, op0_addr),
                    op1_stride,
                    MemoryAddress::new(tag, op1_addr),
                    operand2,
                )
            }
            Opcode::LoadWeights => {
                let local_tag = if flags & LOADWEIGHTS_FLAG_ZEROES != 0 {
                    MemoryTag::Zero
                } else {
                    MemoryTag::Local
                };
                sink.emit_load_weights(
                    op0_stride,
                    MemoryAddress::new(local_tag, op0_addr),
                    operand2,
                )
            }
        }
    }
}

/// Concatenates parsers into one logical stream, in supplied order.
pub struct CombinedParser<R: Read> {
    parsers: Vec<LirParser<R>>,
    current: usize,
}

impl<R: Read> CombinedParser<R> {
    pub fn new(parsers: Vec<LirParser<R>>) -> Self {
        CombinedParser {
            parsers,
            current: 0,
        }
    }

    pub fn has_next(&self) -> bool {
        self.parsers[self.current..].iter().any(|p| p.has_next())
    }

    pub fn parse_next(&mut self, sink: &mut dyn LirSink) -> Result<()> {
        while self.current < self.parsers.len() {
            if self.parsers[self.current].has_next() {
                return self.parsers[self.current].parse_next(sink);
            }
            self.current += 1;
        }
        Err(BackendError::invariant("parse_next past end of stream"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::tests::small_arch;
    use crate::gen::LirGen;

    fn layout() -> InstructionLayout {
        InstructionLayout::new(small_arch(2)).unwrap()
    }

    /// Replays into a generator and compares the bytes; cheap structural
    /// equality without a dedicated recording type.
    fn rewrite(bytes: &[u8], count: u64) -> Vec<u8> {
        let mut parser = LirParser::new(layout(), bytes, count);
        let mut g = LirGen::new(layout(), Vec::new());
        while parser.has_next() {
            parser.parse_next(&mut g).unwrap();
        }
        g.into_inner()
    }

    #[test]
    fn decode_reencode_is_identity() {
        let mut g = LirGen::new(layout(), Vec::new());
        g.emit_no_op().unwrap();
        g.emit_wait(1).unwrap();
        g.emit_mat_mul(
            true,
            2,
            MemoryAddress::new(MemoryTag::Local, 10),
            1,
            MemoryAddress::new(MemoryTag::Accumulator, 20),
            8,
        )
        .unwrap();
        g.emit_simd(
            false,
            SimdOp::Add,
            1,
            0,
            1,
            MemoryAddress::new(MemoryTag::Accumulator, 3),
            MemoryAddress::new(MemoryTag::Accumulator, 4),
        )
        .unwrap();
        g.emit_data_move(
            true,
            false,
            3,
            MemoryAddress::new(MemoryTag::Local, 5),
            1,
            MemoryAddress::new(MemoryTag::Dram1, 4000),
            7,
        )
        .unwrap();
        g.emit_load_weights(0, MemoryAddress::new(MemoryTag::Zero, 0), 7)
            .unwrap();
        let bytes = g.into_inner();

        assert_eq!(rewrite(&bytes, 6), bytes);
    }

    #[test]
    fn unknown_opcode_is_encoding_error() {
        let size = layout().instruction_size_bytes as usize;
        let mut bytes = vec![0u8; size];
        bytes[size - 1] = 0xf0;
        let mut parser = LirParser::new(layout(), bytes.as_slice(), 1);
        let mut g = LirGen::new(layout(), Vec::new());
        assert!(matches!(
            parser.parse_next(&mut g),
            Err(BackendError::Encoding { field: "opcode", .. })
        ));
    }

    #[test]
    fn truncated_stream_is_io_error() {
        let bytes = vec![0u8; 3];
        let mut parser = LirParser::new(layout(), bytes.as_slice(), 1);
        let mut g = LirGen::new(layout(), Vec::new());
        assert!(matches!(
            parser.parse_next(&mut g),
            Err(BackendError::Io(_))
        ));
    }

    #[test]
    fn parse_past_end_rejected() {
        let mut parser = LirParser::new(layout(), [].as_slice(), 0);
        let mut g = LirGen::new(layout(), Vec::new());
        assert!(!parser.has_next());
        assert!(parser.parse_next(&mut g).is_err());
    }

    #[test]
    fn combined_concatenates_in_order() {
        let mut a = LirGen::new(layout(), Vec::new());
        a.emit_no_op().unwrap();
        let a_bytes = a.into_inner();
        let mut b = LirGen::new(layout(), Vec::new());
        b.emit_wait(1).unwrap();
        b.emit_no_op().unwrap();
        let b_bytes = b.into_inner();

        let combined = CombinedParser::new(vec![
            LirParser::new(layout(), a_bytes.as_slice(), 1),
            LirParser::new(layout(), b_bytes.as_slice(), 2),
        ]);
        let mut out = LirGen::new(layout(), Vec::new());
        let mut combined = combined;
        let mut count = 0;
        while combined.has_next() {
            combined.parse_next(&mut out).unwrap();
            count += 1;
        }
        assert_eq!(count, 3);
        let expected: Vec<u8> = [a_bytes, b_bytes].concat();
        assert_eq!(out.into_inner(), expected);
    }

    #[test]
    fn combined_skips_empty_streams() {
        let mut b = LirGen::new(layout(), Vec::new());
        b.emit_no_op().unwrap();
        let b_bytes = b.into_inner();

        let mut combined = CombinedParser::new(vec![
            LirParser::new(layout(), [].as_slice(), 0),
            LirParser::new(layout(), b_bytes.as_slice(), 1),
        ]);
        assert!(combined.has_next());
        let mut out = LirGen::new(layout(), Vec::new());
        combined.parse_next(&mut out).unwrap();
        assert!(!combined.has_next());
    }
}
