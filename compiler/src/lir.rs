// lir.rs — Low-level IR for the accelerator backend
//
// The six-operation instruction set every backend component speaks, plus
// the memory address model. Sinks (generator, printer, estimator,
// broadcast, thread wrapper) implement `LirSink`; the parser replays a
// serialized stream into any of them.
//
// The variant set is closed: these six operations are the entire contract
// between the front end's scheduled segments and the emitted binary.

use std::fmt;

use crate::error::Result;

// ── Memory model ───────────────────────────────────────────────────────────

/// Memory space an address points into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryTag {
    /// On-chip per-thread scratchpad. Raw offsets are biased by
    /// `thread_local_depth * tid` during the overlay.
    Local,
    /// Shared accumulator register file. Never biased.
    Accumulator,
    /// DRAM bank 0 (model variables).
    Dram0,
    /// DRAM bank 1 (model constants).
    Dram1,
    /// The hardware zero plane; reads as zeros, raw offset is 0.
    Zero,
}

impl MemoryTag {
    /// Disassembly prefix.
    pub fn prefix(self) -> &'static str {
        match self {
            MemoryTag::Local => "L",
            MemoryTag::Accumulator => "A",
            MemoryTag::Dram0 => "D0",
            MemoryTag::Dram1 => "D1",
            MemoryTag::Zero => "Z",
        }
    }
}

/// Opaque symbolic reference carried by an address. Used only for
/// tracepoint resolution at segment build time; never serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemoryRef(pub u32);

impl MemoryRef {
    pub const NONE: MemoryRef = MemoryRef(u32::MAX);

    pub fn is_none(self) -> bool {
        self == MemoryRef::NONE
    }
}

/// A memory address: space tag, symbolic reference, raw offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryAddress {
    pub tag: MemoryTag,
    pub ref_: MemoryRef,
    pub raw: u64,
}

impl MemoryAddress {
    pub fn new(tag: MemoryTag, raw: u64) -> Self {
        MemoryAddress {
            tag,
            ref_: MemoryRef::NONE,
            raw,
        }
    }

    pub fn with_ref(tag: MemoryTag, ref_: MemoryRef, raw: u64) -> Self {
        MemoryAddress { tag, ref_, raw }
    }

    /// Same address shifted by `bias`. Tag and reference are preserved.
    pub fn biased(self, bias: u64) -> Self {
        MemoryAddress {
            raw: self.raw + bias,
            ..self
        }
    }
}

impl fmt::Display for MemoryAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.tag.prefix(), self.raw)
    }
}

// ── Opcodes ────────────────────────────────────────────────────────────────

/// Instruction opcode, as encoded in the header high nibble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    NoOp = 0x0,
    MatMul = 0x1,
    DataMove = 0x2,
    LoadWeights = 0x3,
    Simd = 0x4,
    Wait = 0x5,
}

impl Opcode {
    pub fn from_code(code: u8) -> Option<Opcode> {
        match code {
            0x0 => Some(Opcode::NoOp),
            0x1 => Some(Opcode::MatMul),
            0x2 => Some(Opcode::DataMove),
            0x3 => Some(Opcode::LoadWeights),
            0x4 => Some(Opcode::Simd),
            0x5 => Some(Opcode::Wait),
            _ => None,
        }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            Opcode::NoOp => "NoOp",
            Opcode::MatMul => "MatMul",
            Opcode::DataMove => "DataMove",
            Opcode::LoadWeights => "LoadWeights",
            Opcode::Simd => "SIMD",
            Opcode::Wait => "Wait",
        }
    }
}

// ── SIMD sub-operations ────────────────────────────────────────────────────

/// ALU sub-operation carried inside a `SIMD` instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SimdOp {
    Zero = 0x0,
    Move = 0x1,
    Not = 0x2,
    And = 0x3,
    Or = 0x4,
    Increment = 0x5,
    Decrement = 0x6,
    Add = 0x7,
    Subtract = 0x8,
    Multiply = 0x9,
    Abs = 0xa,
    GreaterThan = 0xb,
    GreaterThanEqual = 0xc,
    Min = 0xd,
    Max = 0xe,
}

impl SimdOp {
    pub fn from_code(code: u8) -> Option<SimdOp> {
        match code {
            0x0 => Some(SimdOp::Zero),
            0x1 => Some(SimdOp::Move),
            0x2 => Some(SimdOp::Not),
            0x3 => Some(SimdOp::And),
            0x4 => Some(SimdOp::Or),
            0x5 => Some(SimdOp::Increment),
            0x6 => Some(SimdOp::Decrement),
            0x7 => Some(SimdOp::Add),
            0x8 => Some(SimdOp::Subtract),
            0x9 => Some(SimdOp::Multiply),
            0xa => Some(SimdOp::Abs),
            0xb => Some(SimdOp::GreaterThan),
            0xc => Some(SimdOp::GreaterThanEqual),
            0xd => Some(SimdOp::Min),
            0xe => Some(SimdOp::Max),
            _ => None,
        }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            SimdOp::Zero => "Zero",
            SimdOp::Move => "Move",
            SimdOp::Not => "Not",
            SimdOp::And => "And",
            SimdOp::Or => "Or",
            SimdOp::Increment => "Increment",
            SimdOp::Decrement => "Decrement",
            SimdOp::Add => "Add",
            SimdOp::Subtract => "Subtract",
            SimdOp::Multiply => "Multiply",
            SimdOp::Abs => "Abs",
            SimdOp::GreaterThan => "GreaterThan",
            SimdOp::GreaterThanEqual => "GreaterThanEqual",
            SimdOp::Min => "Min",
            SimdOp::Max => "Max",
        }
    }
}

// ── Sink trait ─────────────────────────────────────────────────────────────

/// The polymorphic emit interface. Each operation either succeeds or fails
/// fatally with an encoding or I/O error.
pub trait LirSink {
    /// Emit a pad instruction.
    fn emit_no_op(&mut self) -> Result<()>;

    /// Synchronize on the peer thread's cycle counter.
    fn emit_wait(&mut self, tid: u32) -> Result<()>;

    fn emit_mat_mul(
        &mut self,
        accumulate: bool,
        local_stride: u64,
        local_addr: MemoryAddress,
        acc_stride: u64,
        acc_addr: MemoryAddress,
        size: u64,
    ) -> Result<()>;

    #[allow(clippy::too_many_arguments)]
    fn emit_simd(
        &mut self,
        accumulate: bool,
        op: SimdOp,
        src_l: u64,
        src_r: u64,
        dst: u64,
        write_acc_addr: MemoryAddress,
        read_acc_addr: MemoryAddress,
    ) -> Result<()>;

    /// `addr.tag` drives the transfer type; the local side is always the
    /// `local_addr` operand.
    #[allow(clippy::too_many_arguments)]
    fn emit_data_move(
        &mut self,
        to_local: bool,
        accumulate: bool,
        local_stride: u64,
        local_addr: MemoryAddress,
        stride: u64,
        addr: MemoryAddress,
        size: u64,
    ) -> Result<()>;

    fn emit_load_weights(
        &mut self,
        local_stride: u64,
        local_addr: MemoryAddress,
        size: u64,
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_codes_round_trip() {
        for code in 0x0..=0x5u8 {
            let op = Opcode::from_code(code).unwrap();
            assert_eq!(op as u8, code);
        }
        assert!(Opcode::from_code(0x6).is_none());
        assert!(Opcode::from_code(0xf).is_none());
    }

    #[test]
    fn simd_codes_round_trip() {
        for code in 0x0..=0xeu8 {
            let op = SimdOp::from_code(code).unwrap();
            assert_eq!(op as u8, code);
        }
        assert!(SimdOp::from_code(0xf).is_none());
    }

    #[test]
    fn address_display_uses_tag_prefix() {
        assert_eq!(MemoryAddress::new(MemoryTag::Local, 10).to_string(), "L10");
        assert_eq!(
            MemoryAddress::new(MemoryTag::Dram0, 512).to_string(),
            "D0512"
        );
    }

    #[test]
    fn biased_preserves_tag_and_ref() {
        let a = MemoryAddress::with_ref(MemoryTag::Local, MemoryRef(7), 10);
        let b = a.biased(1024);
        assert_eq!(b.raw, 1034);
        assert_eq!(b.tag, MemoryTag::Local);
        assert_eq!(b.ref_, MemoryRef(7));
    }

    #[test]
    fn none_ref_sentinel() {
        assert!(MemoryRef::NONE.is_none());
        assert!(!MemoryRef(0).is_none());
    }
}
