// backend.rs — Segment map and the overlay scheduler
//
// Owns the sorted map of sealed segments keyed by (layer, stage,
// partition, kind) and linearizes them into the final program. Segments
// sharing one (layer, stage, partition) form a tile; tiles slide through a
// window of 1 or 3 so distinct hardware threads execute save / init+load /
// compute of adjacent tiles concurrently. Per window the overlay rewrites
// Local addresses per thread, interleaves threads by least accumulated
// cycles, and pads the laggards so every thread leaves the window at the
// same cycle count.
//
// "Threads" are target tids, not host threads: the host emits one
// deterministic interleaving, single-threaded.
//
// Preconditions: segments were finalized under this backend's layout.
// Postconditions: program bytes are a pure function of the segment keys,
//                 their contents, the architecture, and the thread count.
// Failure modes: `Config` for unsupported thread counts (before any output
//                byte); `Encoding`/`Io` propagated from the sinks;
//                `Invariant` for impossible tile shapes.
// Side effects: consumes the segment map; writes to caller-owned streams.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader, Write};

use log::{debug, info};
use sha2::{Digest, Sha256};

use crate::arch::Architecture;
use crate::broadcast::LirBroadcast;
use crate::error::{BackendError, Result};
use crate::estimate::Estimator;
use crate::gen::LirGen;
use crate::layout::InstructionLayout;
use crate::lir::{LirSink, MemoryAddress, MemoryTag, SimdOp};
use crate::parser::{CombinedParser, LirParser};
use crate::printer::LirPrinter;
use crate::segment::{Segment, SegmentKey, SegmentKind, SegmentStore};
use crate::stats::{LirEstimator, Stats};
use crate::tracepoint::TracepointCondition;

/// Reborrow an `Option<&mut dyn Write>` for one loop iteration without
/// forcing the outer binding's lifetime to cover the whole loop.
fn reborrow_write<'a>(w: &'a mut Option<&mut dyn Write>) -> Option<&'a mut dyn Write> {
    match w {
        Some(x) => Some(&mut **x),
        None => None,
    }
}

/// Same reborrow trick as `reborrow_write`, for `&mut Stats`.
fn reborrow_stats<'a>(s: &'a mut Option<&mut Stats>) -> Option<&'a mut Stats> {
    match s {
        Some(x) => Some(&mut **x),
        None => None,
    }
}

// ── Emission summary ───────────────────────────────────────────────────────

/// What one `write_segments` call produced.
#[derive(Debug, Clone)]
pub struct EmitSummary {
    /// Instructions in the final stream, pads included.
    pub instruction_count: u64,
    /// Inserted cycle-balancing pads.
    pub pad_count: u64,
    /// Segments consumed from the map.
    pub segment_count: usize,
    pub program_bytes: u64,
    /// SHA-256 of the program stream, for artifact fingerprinting.
    pub program_hash: [u8; 32],
}

impl EmitSummary {
    /// Hex string of the program hash (64 characters).
    pub fn program_hash_hex(&self) -> String {
        self.program_hash.iter().map(|b| format!("{b:02x}")).collect()
    }
}

// ── Balancing policy ───────────────────────────────────────────────────────

/// End-of-window cycle balancing. The overlay hands the policy the active
/// threads' cycle counts and a callback that emits one pad instruction on
/// thread `i` and returns its updated count.
///
/// The default policy pads with `no_op`; a future policy may insert mutual
/// `wait` pairs instead without touching the overlay loop.
pub trait Balancer {
    fn balance(
        &self,
        cycles: &[u64],
        emit_pad: &mut dyn FnMut(usize) -> Result<u64>,
    ) -> Result<u64>;
}

/// Pads every under-budget thread with `no_op` until all threads reach the
/// window maximum.
pub struct NoOpPadBalancer;

impl Balancer for NoOpPadBalancer {
    fn balance(
        &self,
        cycles: &[u64],
        emit_pad: &mut dyn FnMut(usize) -> Result<u64>,
    ) -> Result<u64> {
        let Some(&target) = cycles.iter().max() else {
            return Ok(0);
        };
        let mut current = cycles.to_vec();
        let mut pads = 0u64;
        // One pad per under-budget thread per round, in tid order.
        while current.iter().any(|&c| c < target) {
            for i in 0..current.len() {
                if current[i] < target {
                    let updated = emit_pad(i)?;
                    if updated <= current[i] {
                        return Err(BackendError::invariant(
                            "pad instruction did not advance the thread cycle counter",
                        ));
                    }
                    current[i] = updated;
                    pads += 1;
                }
            }
        }
        Ok(pads)
    }
}

// ── Tiles ──────────────────────────────────────────────────────────────────

/// One (layer, stage, partition) group. Slots index into the drained store
/// list; the Init slot may be shared across tiles of the same layer.
#[derive(Debug, Clone, Default)]
struct Tile {
    tid: u32,
    init: Option<usize>,
    load: Option<usize>,
    compute: Option<usize>,
    save: Option<usize>,
}

/// Group sorted stores into tiles, assigning tids round-robin in creation
/// order. Padding tiles at both ends consume tids too, so the assignment
/// of real tiles depends on the full padded sequence.
fn build_tiles(stores: &[SegmentStore], threads: u32, window: usize) -> Result<Vec<Tile>> {
    let mut tiles: Vec<Tile> = Vec::new();
    let mut next_tid = 0u32;
    let mut alloc_tid = move || {
        let tid = next_tid;
        next_tid = (next_tid + 1) % threads;
        tid
    };

    for _ in 0..window - 1 {
        tiles.push(Tile {
            tid: alloc_tid(),
            ..Tile::default()
        });
    }

    let mut current_layer: Option<u32> = None;
    let mut layer_init: Option<usize> = None;
    let mut current_group: Option<(u32, u32, u32)> = None;

    for (idx, store) in stores.iter().enumerate() {
        let key = store.key;
        if current_layer != Some(key.layer) {
            current_layer = Some(key.layer);
            layer_init = None;
        }
        let group = (key.layer, key.stage, key.partition);
        if current_group != Some(group) {
            current_group = Some(group);
            // Init runs once per active thread at the start of a layer:
            // threads 0..T pick it up on partitions 0..T, later partitions
            // skip it.
            let inherited = if key.partition < threads {
                layer_init
            } else {
                None
            };
            tiles.push(Tile {
                tid: alloc_tid(),
                init: inherited,
                ..Tile::default()
            });
        }
        let tile = tiles
            .last_mut()
            .ok_or_else(|| BackendError::invariant("tile list empty after grouping"))?;
        match key.kind {
            SegmentKind::Init => {
                layer_init = Some(idx);
                if key.partition < threads {
                    tile.init = Some(idx);
                }
            }
            SegmentKind::Load => tile.load = Some(idx),
            SegmentKind::Compute => tile.compute = Some(idx),
            SegmentKind::Save => tile.save = Some(idx),
        }
    }

    for _ in 0..window - 1 {
        tiles.push(Tile {
            tid: alloc_tid(),
            ..Tile::default()
        });
    }

    Ok(tiles)
}

// ── Hashing writer ─────────────────────────────────────────────────────────

/// Tees program bytes through a SHA-256 hasher on their way out.
struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
    bytes: u64,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        HashingWriter {
            inner,
            hasher: Sha256::new(),
            bytes: 0,
        }
    }

    fn finish(self) -> (u64, [u8; 32]) {
        (self.bytes, self.hasher.finalize().into())
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

// ── Per-thread sink wrapper ────────────────────────────────────────────────

/// Wraps the outer broadcast for one hardware thread: charges estimated
/// cycles to the thread's counter and biases Local addresses into the
/// thread's scratchpad slice before forwarding.
struct ThreadSink<'a, 'b> {
    bias: u64,
    cycles: &'a mut u64,
    estimator: Estimator,
    inner: &'a mut LirBroadcast<'b>,
}

impl ThreadSink<'_, '_> {
    fn bias_local(&self, addr: MemoryAddress) -> MemoryAddress {
        if addr.tag == MemoryTag::Local {
            addr.biased(self.bias)
        } else {
            addr
        }
    }
}

impl LirSink for ThreadSink<'_, '_> {
    fn emit_no_op(&mut self) -> Result<()> {
        *self.cycles += self.estimator.no_op().cycles;
        self.inner.emit_no_op()
    }

    fn emit_wait(&mut self, tid: u32) -> Result<()> {
        *self.cycles += self.estimator.wait().cycles;
        self.inner.emit_wait(tid)
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
        *self.cycles += self.estimator.mat_mul(size).cycles;
        self.inner.emit_mat_mul(
            accumulate,
            local_stride,
            self.bias_local(local_addr),
            acc_stride,
            acc_addr,
            size,
        )
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
        *self.cycles += self.estimator.simd().cycles;
        self.inner
            .emit_simd(accumulate, op, src_l, src_r, dst, write_acc_addr, read_acc_addr)
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
        *self.cycles += self.estimator.data_move(addr.tag, size).cycles;
        self.inner.emit_data_move(
            to_local,
            accumulate,
            local_stride,
            self.bias_local(local_addr),
            stride,
            self.bias_local(addr),
            size,
        )
    }

    fn emit_load_weights(
        &mut self,
        local_stride: u64,
        local_addr: MemoryAddress,
        size: u64,
    ) -> Result<()> {
        *self.cycles += self.estimator.load_weights(size).cycles;
        self.inner
            .emit_load_weights(local_stride, self.bias_local(local_addr), size)
    }
}

// ── Backend ────────────────────────────────────────────────────────────────

/// One thread's instruction source within a window.
struct ThreadStream<'s> {
    tid: u32,
    cycles: u64,
    parser: CombinedParser<BufReader<&'s File>>,
}

pub struct Backend {
    arch: Architecture,
    layout: InstructionLayout,
    estimator: Estimator,
    segments: BTreeMap<SegmentKey, SegmentStore>,
    conditions: Vec<TracepointCondition>,
    balancer: Box<dyn Balancer>,
}

impl Backend {
    pub fn new(arch: Architecture) -> Result<Self> {
        let layout = InstructionLayout::new(arch.clone())?;
        let estimator = Estimator::new(&arch);
        Ok(Backend {
            arch,
            layout,
            estimator,
            segments: BTreeMap::new(),
            conditions: Vec::new(),
            balancer: Box::new(NoOpPadBalancer),
        })
    }

    /// Watch conditions handed to every segment built afterwards.
    pub fn with_tracepoint_conditions(mut self, conditions: Vec<TracepointCondition>) -> Self {
        self.conditions = conditions;
        self
    }

    pub fn with_balancer(mut self, balancer: Box<dyn Balancer>) -> Self {
        self.balancer = balancer;
        self
    }

    pub fn layout(&self) -> &InstructionLayout {
        &self.layout
    }

    pub fn estimator(&self) -> &Estimator {
        &self.estimator
    }

    /// Start a segment. Attach a `Stats` to also collect per-segment costs.
    pub fn mk_segment(&self, key: SegmentKey, stats: Option<Stats>) -> Result<Segment> {
        Segment::create(
            self.layout.clone(),
            key,
            self.conditions.clone(),
            self.estimator,
            stats,
        )
    }

    /// Seal a segment and move its store into the sorted map. Returns the
    /// per-segment stats, if any were attached.
    pub fn finalize_segment(&mut self, segment: Segment) -> Result<Option<Stats>> {
        let key = segment.key();
        if self.segments.contains_key(&key) {
            return Err(BackendError::invariant(format!(
                "duplicate segment key {key}"
            )));
        }
        let (store, stats) = segment.close()?;
        self.segments.insert(key, store);
        Ok(stats)
    }

    pub fn segments_pending(&self) -> usize {
        self.segments.len()
    }

    /// Consume the segment map and write the linearized program. Segment
    /// stores are released on return, on success and failure alike; output
    /// streams stay owned by the caller.
    pub fn write_segments(
        &mut self,
        program_out: &mut dyn Write,
        printer_out: Option<&mut dyn Write>,
        stats: Option<&mut Stats>,
    ) -> Result<EmitSummary> {
        let threads = self.arch.threads;
        let window = match threads {
            1 => 1usize,
            2 => 3usize,
            other => {
                return Err(BackendError::config(format!(
                    "unsupported thread count {other}; the overlay handles 1 or 2"
                )))
            }
        };

        let stores: Vec<SegmentStore> =
            std::mem::take(&mut self.segments).into_values().collect();
        let segment_count = stores.len();
        let tiles = build_tiles(&stores, threads, window)?;

        let mut hashed = HashingWriter::new(program_out);
        let mut printer_out = printer_out;
        let mut stats = stats;
        let mut instruction_count = 0u64;
        let mut pad_count = 0u64;

        for i in 0..(tiles.len() + 1).saturating_sub(window) {
            let (emitted, pads) = self.overlay_tiles(
                &tiles[i..i + window],
                &stores,
                &mut hashed,
                reborrow_write(&mut printer_out),
                reborrow_stats(&mut stats),
            )?;
            if emitted > 0 {
                debug!("window {i}: {emitted} instructions ({pads} pads)");
            }
            instruction_count += emitted;
            pad_count += pads;
        }

        let (program_bytes, program_hash) = hashed.finish();
        let summary = EmitSummary {
            instruction_count,
            pad_count,
            segment_count,
            program_bytes,
            program_hash,
        };
        info!(
            "emitted {} instructions ({} pads) from {} segments, {} bytes, sha256 {}",
            summary.instruction_count,
            summary.pad_count,
            summary.segment_count,
            summary.program_bytes,
            summary.program_hash_hex()
        );
        Ok(summary)
    }

    /// Emit the slots one window contributes: gather per-thread streams,
    /// interleave by least cycles, then balance. Returns (instructions
    /// emitted, pads thereof).
    fn overlay_tiles(
        &self,
        window_tiles: &[Tile],
        stores: &[SegmentStore],
        out: &mut dyn Write,
        printer_out: Option<&mut dyn Write>,
        stats: Option<&mut Stats>,
    ) -> Result<(u64, u64)> {
        // Step 1: contributing (tid, segment) pairs, in gather order. The
        // per-offset slot selection guarantees each real segment slot emits
        // in exactly one window.
        let slots: [(u32, Option<usize>); 4] = if window_tiles.len() == 3 {
            [
                (window_tiles[0].tid, window_tiles[0].save),
                (window_tiles[2].tid, window_tiles[2].init),
                (window_tiles[2].tid, window_tiles[2].load),
                (window_tiles[1].tid, window_tiles[1].compute),
            ]
        } else {
            [
                (window_tiles[0].tid, window_tiles[0].init),
                (window_tiles[0].tid, window_tiles[0].load),
                (window_tiles[0].tid, window_tiles[0].compute),
                (window_tiles[0].tid, window_tiles[0].save),
            ]
        };
        let pairs: Vec<(u32, usize)> = slots
            .into_iter()
            .filter_map(|(tid, slot)| slot.map(|idx| (tid, idx)))
            .collect();
        if pairs.is_empty() {
            return Ok((0, 0));
        }

        // Step 2: outer tee: binary, optional disassembly, optional stats.
        let mut gen = LirGen::new(self.layout.clone(), out);
        let mut printer = printer_out.map(LirPrinter::new);
        if let Some(pr) = printer.as_mut() {
            for (tid, idx) in &pairs {
                pr.comment(&format!("TID {tid}: {}", stores[*idx].key))?;
            }
        }
        let mut estimator_sink = stats.map(|s| LirEstimator::new(self.estimator, s));
        let mut sinks: Vec<&mut dyn LirSink> = Vec::with_capacity(3);
        sinks.push(&mut gen);
        if let Some(pr) = printer.as_mut() {
            sinks.push(pr);
        }
        if let Some(es) = estimator_sink.as_mut() {
            sinks.push(es);
        }
        let mut broadcast = LirBroadcast::new(sinks);

        // Group by tid, keeping gather order within each thread; arbitrate
        // across threads in tid order.
        let mut grouped: Vec<(u32, Vec<usize>)> = Vec::new();
        for (tid, idx) in pairs {
            match grouped.iter_mut().find(|(t, _)| *t == tid) {
                Some((_, idxs)) => idxs.push(idx),
                None => grouped.push((tid, vec![idx])),
            }
        }
        grouped.sort_by_key(|(tid, _)| *tid);

        let mut streams: Vec<ThreadStream<'_>> = Vec::with_capacity(grouped.len());
        for (tid, idxs) in grouped {
            let mut parsers = Vec::with_capacity(idxs.len());
            for idx in idxs {
                let store = &stores[idx];
                parsers.push(LirParser::new(
                    self.layout.clone(),
                    store.reader()?,
                    store.instruction_count,
                ));
            }
            streams.push(ThreadStream {
                tid,
                cycles: 0,
                parser: CombinedParser::new(parsers),
            });
        }

        // Step 3: least-cycles interleaving, stable tie-break by tid.
        let thread_local_depth = self.arch.thread_local_depth();
        let mut emitted = 0u64;
        loop {
            let next = streams
                .iter()
                .enumerate()
                .filter(|(_, s)| s.parser.has_next())
                .min_by_key(|(_, s)| (s.cycles, s.tid))
                .map(|(i, _)| i);
            let Some(i) = next else {
                break;
            };
            let stream = &mut streams[i];
            let bias = thread_local_depth * u64::from(stream.tid);
            let mut sink = ThreadSink {
                bias,
                cycles: &mut stream.cycles,
                estimator: self.estimator,
                inner: &mut broadcast,
            };
            stream.parser.parse_next(&mut sink)?;
            emitted += 1;
        }

        // Step 4: equalize thread cycle counts.
        let cycles: Vec<u64> = streams.iter().map(|s| s.cycles).collect();
        let mut emit_pad = |i: usize| -> Result<u64> {
            let stream = &mut streams[i];
            let bias = thread_local_depth * u64::from(stream.tid);
            let mut sink = ThreadSink {
                bias,
                cycles: &mut stream.cycles,
                estimator: self.estimator,
                inner: &mut broadcast,
            };
            sink.emit_no_op()?;
            Ok(*sink.cycles)
        };
        let pads = self.balancer.balance(&cycles, &mut emit_pad)?;

        Ok((emitted + pads, pads))
    }
}
