// segment.rs — Keys and the build-time segment accumulator
//
// A segment is a contiguous run of LIR operations identified by
// (layer, stage, partition, kind). During the build it behaves as an LIR
// sink teeing every operation to: (a) a generator writing the private
// byte-backed store, (b) the tracepoint collector, and (c) optionally a
// per-segment stats estimator. `close` seals the store into a
// `SegmentStore`; because `close` consumes the segment, emitting after it
// is unrepresentable.
//
// Stores are anonymous temp files: unlinked at creation, so they are
// released on every exit path, success or failure.

use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter, Seek, SeekFrom};

use crate::error::Result;
use crate::estimate::Estimator;
use crate::gen::LirGen;
use crate::layout::InstructionLayout;
use crate::lir::{LirSink, MemoryAddress, SimdOp};
use crate::stats::{LirEstimator, Stats};
use crate::tracepoint::{TracepointCollector, TracepointCondition, TracepointMap};

// ── Keys ───────────────────────────────────────────────────────────────────

/// Segment role within a tile. The discriminant order is the emission
/// order for serial (single-thread) overlays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum SegmentKind {
    Init = 0,
    Load = 1,
    Compute = 2,
    Save = 3,
}

impl fmt::Display for SegmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SegmentKind::Init => "Init",
            SegmentKind::Load => "Load",
            SegmentKind::Compute => "Compute",
            SegmentKind::Save => "Save",
        };
        write!(f, "{name}")
    }
}

/// Sorted-map key; the derived lexicographic order defines traversal
/// order during emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SegmentKey {
    pub layer: u32,
    pub stage: u32,
    pub partition: u32,
    pub kind: SegmentKind,
}

impl SegmentKey {
    pub fn new(layer: u32, stage: u32, partition: u32, kind: SegmentKind) -> Self {
        SegmentKey {
            layer,
            stage,
            partition,
            kind,
        }
    }
}

impl fmt::Display for SegmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.layer, self.stage, self.partition, self.kind
        )
    }
}

// ── Builder ────────────────────────────────────────────────────────────────

/// Build-time accumulator for one segment. Created by
/// `Backend::mk_segment`, mutated only through LIR emit calls, sealed by
/// `close`.
pub struct Segment {
    key: SegmentKey,
    gen: LirGen<BufWriter<File>>,
    collector: TracepointCollector,
    estimator: Estimator,
    stats: Option<Stats>,
    instructions: u64,
}

impl Segment {
    pub(crate) fn create(
        layout: InstructionLayout,
        key: SegmentKey,
        conditions: Vec<TracepointCondition>,
        estimator: Estimator,
        stats: Option<Stats>,
    ) -> Result<Self> {
        let store = tempfile::tempfile()?;
        Ok(Segment {
            key,
            gen: LirGen::new(layout, BufWriter::new(store)),
            collector: TracepointCollector::new(conditions),
            estimator,
            stats,
            instructions: 0,
        })
    }

    pub fn key(&self) -> SegmentKey {
        self.key
    }

    pub fn instructions_count(&self) -> u64 {
        self.instructions
    }

    pub fn instruction_tracepoints_map(&self) -> &TracepointMap {
        self.collector.map()
    }

    /// Flush and seal the store. Returns the consumable store and the
    /// per-segment stats, if any were attached.
    pub(crate) fn close(self) -> Result<(SegmentStore, Option<Stats>)> {
        let writer = self.gen.into_inner();
        let file = writer
            .into_inner()
            .map_err(|e| crate::error::BackendError::Io(e.into_error()))?;
        Ok((
            SegmentStore {
                key: self.key,
                file,
                instruction_count: self.instructions,
                tracepoints: self.collector.into_map(),
            },
            self.stats,
        ))
    }

    /// Tee one emit across generator, collector, and optional estimator.
    fn tee(&mut self, f: impl Fn(&mut dyn LirSink) -> Result<()>) -> Result<()> {
        f(&mut self.gen)?;
        f(&mut self.collector)?;
        if let Some(stats) = self.stats.as_mut() {
            let mut est = LirEstimator::new(self.estimator, stats);
            f(&mut est)?;
        }
        self.instructions += 1;
        Ok(())
    }
}

impl LirSink for Segment {
    fn emit_no_op(&mut self) -> Result<()> {
        self.tee(|s| s.emit_no_op())
    }

    fn emit_wait(&mut self, tid: u32) -> Result<()> {
        self.tee(|s| s.emit_wait(tid))
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
        self.tee(|s| {
            s.emit_mat_mul(accumulate, local_stride, local_addr, acc_stride, acc_addr, size)
        })
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
        self.tee(|s| {
            s.emit_simd(accumulate, op, src_l, src_r, dst, write_acc_addr, read_acc_addr)
        })
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
        self.tee(|s| {
            s.emit_data_move(to_local, accumulate, local_stride, local_addr, stride, addr, size)
        })
    }

    fn emit_load_weights(
        &mut self,
        local_stride: u64,
        local_addr: MemoryAddress,
        size: u64,
    ) -> Result<()> {
        self.tee(|s| s.emit_load_weights(local_stride, local_addr, size))
    }
}

// ── Sealed store ───────────────────────────────────────────────────────────

/// A sealed segment: random-access-readable bytes plus the metadata the
/// overlay needs. Dropping the store releases the backing file.
pub struct SegmentStore {
    pub key: SegmentKey,
    file: File,
    pub instruction_count: u64,
    pub tracepoints: TracepointMap,
}

impl SegmentStore {
    /// Fresh reader positioned at the first instruction. The Init store is
    /// read once per tile that shares it, so every reader rewinds.
    pub(crate) fn reader(&self) -> Result<BufReader<&File>> {
        let mut file = &self.file;
        file.seek(SeekFrom::Start(0))?;
        Ok(BufReader::new(file))
    }
}

impl fmt::Debug for SegmentStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentStore")
            .field("key", &self.key)
            .field("instruction_count", &self.instruction_count)
            .finish()
    }
}
