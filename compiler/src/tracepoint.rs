// tracepoint.rs — Observability records for emitted instructions
//
// A tracepoint marks an instruction that writes a watched memory object.
// The collector participates in the segment-build tee as an ordinary LIR
// sink: it watches the *written* address of each operation, matches it
// against the configured conditions, and records the segment-local
// instruction offset. The enclosing compiler's trace context consumes the
// per-segment maps; resolving references to front-end objects goes through
// the `SymbolResolver` seam.
//
// Offsets are segment-local. The overlay reorders instructions across
// threads, so a final-program-offset mapping is not produced here.

use std::collections::BTreeMap;

use crate::error::Result;
use crate::lir::{LirSink, MemoryAddress, MemoryRef, MemoryTag, SimdOp};

/// A watch condition: record instructions writing this object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TracepointCondition {
    pub tag: MemoryTag,
    pub ref_: MemoryRef,
}

/// One recorded write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tracepoint {
    pub tag: MemoryTag,
    pub ref_: MemoryRef,
}

/// Segment-local instruction offset to the tracepoints hit there.
pub type TracepointMap = BTreeMap<u64, Vec<Tracepoint>>;

/// Resolves an opaque memory reference back to a front-end object name.
/// Supplied by the front end; used only for formatting.
pub trait SymbolResolver {
    fn resolve_ref(&self, ref_: MemoryRef) -> Option<String>;
}

/// Render a tracepoint map for debug output, one line per instruction
/// offset. Unresolvable references print their raw index.
pub fn format_tracepoints(map: &TracepointMap, resolver: &dyn SymbolResolver) -> String {
    let mut out = String::new();
    for (offset, points) in map {
        let names: Vec<String> = points
            .iter()
            .map(|tp| {
                resolver
                    .resolve_ref(tp.ref_)
                    .unwrap_or_else(|| format!("ref#{}", tp.ref_.0))
            })
            .collect();
        out.push_str(&format!("{}: {}\n", offset, names.join(", ")));
    }
    out
}

/// LIR sink that records watched writes by instruction offset.
#[derive(Debug, Default)]
pub struct TracepointCollector {
    conditions: Vec<TracepointCondition>,
    offset: u64,
    map: TracepointMap,
}

impl TracepointCollector {
    pub fn new(conditions: Vec<TracepointCondition>) -> Self {
        TracepointCollector {
            conditions,
            offset: 0,
            map: TracepointMap::new(),
        }
    }

    pub fn map(&self) -> &TracepointMap {
        &self.map
    }

    pub fn into_map(self) -> TracepointMap {
        self.map
    }

    fn record_write(&mut self, addr: MemoryAddress) {
        if addr.ref_.is_none() {
            return;
        }
        for cond in &self.conditions {
            if cond.tag == addr.tag && cond.ref_ == addr.ref_ {
                self.map.entry(self.offset).or_default().push(Tracepoint {
                    tag: addr.tag,
                    ref_: addr.ref_,
                });
            }
        }
    }

    fn advance(&mut self) {
        self.offset += 1;
    }
}

impl LirSink for TracepointCollector {
    fn emit_no_op(&mut self) -> Result<()> {
        self.advance();
        Ok(())
    }

    fn emit_wait(&mut self, _tid: u32) -> Result<()> {
        self.advance();
        Ok(())
    }

    fn emit_mat_mul(
        &mut self,
        _accumulate: bool,
        _local_stride: u64,
        _local_addr: MemoryAddress,
        _acc_stride: u64,
        acc_addr: MemoryAddress,
        _size: u64,
    ) -> Result<()> {
        self.record_write(acc_addr);
        self.advance();
        Ok(())
    }

    fn emit_simd(
        &mut self,
        _accumulate: bool,
        _op: SimdOp,
        _src_l: u64,
        _src_r: u64,
        _dst: u64,
        write_acc_addr: MemoryAddress,
        _read_acc_addr: MemoryAddress,
    ) -> Result<()> {
        self.record_write(write_acc_addr);
        self.advance();
        Ok(())
    }

    fn emit_data_move(
        &mut self,
        to_local: bool,
        _accumulate: bool,
        _local_stride: u64,
        local_addr: MemoryAddress,
        _stride: u64,
        addr: MemoryAddress,
        _size: u64,
    ) -> Result<()> {
        // The written side is the transfer target.
        if to_local {
            self.record_write(local_addr);
        } else {
            self.record_write(addr);
        }
        self.advance();
        Ok(())
    }

    fn emit_load_weights(
        &mut self,
        _local_stride: u64,
        _local_addr: MemoryAddress,
        _size: u64,
    ) -> Result<()> {
        // Weight registers are not addressable memory; nothing to watch.
        self.advance();
        Ok(())
    }
}
