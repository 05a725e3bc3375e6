//! Allocation engine.
//!
//! [`Heap`] owns the region and the free list index and implements
//! allocate, free and reallocate on top of them. Offsets returned to callers
//! are payload offsets into the region; `0` is the null sentinel.
//!
//! The first fatal error of a trial is latched. Every later operation on the
//! same heap is refused with [`AllocError::TrialAborted`].

use serde::Serialize;

use super::block::{self, TAG_SIZE};
use super::check::{self, HeapReport};
use super::free_list::{self, FreeListIndex};
use super::region::HeapRegion;
use crate::config::HeapConfig;
use crate::error::AllocError;
use crate::params::ParamError;

/// Allocator lifecycle log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocatorLogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Structured allocator lifecycle record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AllocatorLogRecord {
    /// Monotonic decision/event id.
    pub decision_id: u64,
    /// Correlation id for this lifecycle record.
    pub trace_id: String,
    pub level: AllocatorLogLevel,
    /// Operation (`allocate`, `free`, `reallocate`, `heap_new`).
    pub symbol: &'static str,
    /// Event kind (`alloc`, `free`, `grow`, `split`, ...).
    pub event: &'static str,
    /// Payload or block offset involved in the event.
    pub offset: Option<usize>,
    /// Size value involved in the event.
    pub size: Option<usize>,
    /// Size class of the block involved.
    pub class: Option<usize>,
    /// Machine-readable outcome label.
    pub outcome: &'static str,
    pub details: String,
    /// Snapshot: heap length in bytes.
    pub heap_len: usize,
    /// Snapshot: live block count.
    pub live_blocks: usize,
    /// Snapshot: listed free block count.
    pub free_blocks: usize,
    pub fit_hits: u64,
    pub fit_misses: u64,
    pub splits: u64,
    pub coalesces: u64,
    pub grows: u64,
}

/// Running counters of one heap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HeapStats {
    pub allocations: u64,
    pub frees: u64,
    pub reallocations: u64,
    /// Blocks currently handed out.
    pub live_blocks: usize,
    /// Block bytes (tags included) currently handed out.
    pub live_bytes: usize,
    pub peak_live_bytes: usize,
    /// Searches answered from the free list.
    pub fit_hits: u64,
    /// Searches that forced the heap to grow.
    pub fit_misses: u64,
    pub splits: u64,
    /// Blocks handed out whole because the leftover was too small.
    pub unsplit_allocs: u64,
    pub coalesces: u64,
    pub grows: u64,
    pub in_place_reallocs: u64,
    pub moved_reallocs: u64,
}

/// Segregated-fit boundary-tag heap.
#[derive(Debug, Clone)]
pub struct Heap {
    config: HeapConfig,
    region: HeapRegion,
    index: FreeListIndex,
    min_block: usize,
    /// First fatal error; set once, never cleared.
    fault: Option<AllocError>,
    stats: HeapStats,
    next_decision_id: u64,
    lifecycle_logs: Vec<AllocatorLogRecord>,
}

impl Heap {
    /// Creates an empty heap for one trial.
    pub fn new(config: HeapConfig) -> Result<Self, ParamError> {
        config.validate()?;
        let region = HeapRegion::new(config.alignment, config.max_heap_bytes);
        let min_block = block::min_block(config.alignment);
        let mut heap = Self {
            config,
            region,
            index: FreeListIndex::new(),
            min_block,
            fault: None,
            stats: HeapStats::default(),
            next_decision_id: 1,
            lifecycle_logs: Vec::new(),
        };
        let HeapConfig {
            split_threshold,
            alignment,
            fit_policy,
            max_heap_bytes,
            ..
        } = heap.config;
        heap.record_lifecycle(
            AllocatorLogLevel::Info,
            "heap_new",
            "init",
            None,
            Some(max_heap_bytes),
            None,
            "ready",
            move || {
                format!(
                    "split_threshold={split_threshold};alignment={alignment};fit_policy={fit_policy:?}"
                )
            },
        );
        Ok(heap)
    }

    fn next_log_decision_id(&mut self) -> u64 {
        let id = self.next_decision_id;
        self.next_decision_id = self.next_decision_id.wrapping_add(1);
        id
    }

    #[allow(clippy::too_many_arguments)]
    fn record_lifecycle(
        &mut self,
        level: AllocatorLogLevel,
        symbol: &'static str,
        event: &'static str,
        offset: Option<usize>,
        size: Option<usize>,
        class: Option<usize>,
        outcome: &'static str,
        details: impl FnOnce() -> String,
    ) {
        if !self.config.log_level.admits(level) {
            return;
        }
        let decision_id = self.next_log_decision_id();
        let trace_id = format!("core::heap::{}::{:016x}", symbol, decision_id);
        self.lifecycle_logs.push(AllocatorLogRecord {
            decision_id,
            trace_id,
            level,
            symbol,
            event,
            offset,
            size,
            class,
            outcome,
            details: details(),
            heap_len: self.region.len(),
            live_blocks: self.stats.live_blocks,
            free_blocks: self.index.len(),
            fit_hits: self.stats.fit_hits,
            fit_misses: self.stats.fit_misses,
            splits: self.stats.splits,
            coalesces: self.stats.coalesces,
            grows: self.stats.grows,
        });
    }

    /// Allocates `size` payload bytes and returns the payload offset.
    ///
    /// `allocate(0)` hands out a minimum block.
    pub fn allocate(&mut self, size: usize) -> Result<usize, AllocError> {
        self.refuse_if_faulted("allocate")?;
        let result = self.allocate_block("allocate", size);
        if let Ok(ptr) = result {
            self.stats.allocations += 1;
            if self.config.log_level.admits(AllocatorLogLevel::Trace) {
                let block_size = self.region.block_size(ptr - TAG_SIZE);
                self.record_lifecycle(
                    AllocatorLogLevel::Trace,
                    "allocate",
                    "alloc",
                    Some(ptr),
                    Some(size),
                    Some(free_list::class_of(block_size)),
                    "success",
                    move || format!("block_size={block_size}"),
                );
            }
        }
        self.finish("allocate", result)
    }

    /// Releases the block whose payload starts at `ptr`. `free(0)` is a no-op.
    pub fn free(&mut self, ptr: usize) -> Result<(), AllocError> {
        self.refuse_if_faulted("free")?;
        if ptr == 0 {
            self.record_lifecycle(
                AllocatorLogLevel::Debug,
                "free",
                "free",
                Some(0),
                None,
                None,
                "noop",
                || "null_pointer".to_string(),
            );
            return Ok(());
        }
        let result = self.free_block(ptr);
        self.finish("free", result)
    }

    /// Resizes the block at `ptr` to hold `new_size` bytes.
    ///
    /// Returns the (possibly moved) payload offset. The payload prefix up to
    /// the smaller of the old capacity and `new_size` is preserved.
    pub fn reallocate(&mut self, ptr: usize, new_size: usize) -> Result<usize, AllocError> {
        self.refuse_if_faulted("reallocate")?;
        let result = if ptr == 0 {
            self.allocate_block("reallocate", new_size)
        } else {
            self.reallocate_block(ptr, new_size)
        };
        if let Ok(new_ptr) = result {
            self.stats.reallocations += 1;
            self.record_lifecycle(
                AllocatorLogLevel::Trace,
                "reallocate",
                "realloc",
                Some(new_ptr),
                Some(new_size),
                None,
                if new_ptr == ptr { "in_place" } else { "success" },
                move || format!("old_ptr={ptr:#x}"),
            );
        }
        self.finish("reallocate", result)
    }

    fn refuse_if_faulted(&mut self, op: &'static str) -> Result<(), AllocError> {
        let Some(cause) = self.fault.clone() else {
            return Ok(());
        };
        self.record_lifecycle(
            AllocatorLogLevel::Warn,
            op,
            "refused",
            None,
            None,
            None,
            "trial_aborted",
            || cause.kind().to_string(),
        );
        Err(AllocError::TrialAborted {
            op,
            cause: Box::new(cause),
        })
    }

    /// Runs the optional self-check and latches the first error.
    fn finish<T>(&mut self, op: &'static str, result: Result<T, AllocError>) -> Result<T, AllocError> {
        let result = match result {
            Ok(value) if self.config.check_each_op => {
                check::check_heap(op, &self.region, &self.index).map(|_| value)
            }
            other => other,
        };
        if let Err(err) = &result {
            self.fault = Some(err.clone());
            self.record_lifecycle(
                AllocatorLogLevel::Error,
                op,
                "fault",
                None,
                None,
                None,
                err.kind(),
                || err.to_string(),
            );
        }
        result
    }

    fn out_of_memory(&self, requested: usize) -> AllocError {
        AllocError::OutOfMemory {
            requested,
            heap_len: self.region.len(),
            limit: self.region.limit(),
        }
    }

    fn allocate_block(&mut self, op: &'static str, size: usize) -> Result<usize, AllocError> {
        let needed =
            block::wrap(size, self.config.alignment).ok_or_else(|| self.out_of_memory(size))?;
        let block = match self
            .index
            .find_fit(&self.region, needed, self.config.fit_policy)
        {
            Some(block) => {
                self.stats.fit_hits += 1;
                block
            }
            None => {
                self.stats.fit_misses += 1;
                self.grow(op, needed)?;
                self.index
                    .find_fit(&self.region, needed, self.config.fit_policy)
                    .ok_or_else(|| {
                        AllocError::corruption(
                            op,
                            self.region.epilogue(),
                            format!("no fit for {needed} bytes after growing the heap"),
                        )
                    })?
            }
        };
        let block_size = self.region.block_size(block);
        self.index.remove(&mut self.region, block, block_size);
        let used = self.place(op, block, block_size, needed)?;
        self.stats.live_blocks += 1;
        self.add_live_bytes(used);
        Ok(block + TAG_SIZE)
    }

    fn free_block(&mut self, ptr: usize) -> Result<(), AllocError> {
        let (block, size) = self.live_block("free", ptr)?;
        self.stats.live_blocks -= 1;
        self.stats.live_bytes -= size;
        let merged = self.release("free", block, size)?;
        self.stats.frees += 1;
        self.record_lifecycle(
            AllocatorLogLevel::Trace,
            "free",
            "free",
            Some(ptr),
            Some(size),
            Some(free_list::class_of(size)),
            "success",
            move || format!("merged_block={merged:#x}"),
        );
        Ok(())
    }

    fn reallocate_block(&mut self, ptr: usize, new_size: usize) -> Result<usize, AllocError> {
        const OP: &str = "reallocate";
        let (block, current) = self.live_block(OP, ptr)?;
        let needed = block::wrap(new_size, self.config.alignment)
            .ok_or_else(|| self.out_of_memory(new_size))?;

        if needed <= current {
            let used = self.place(OP, block, current, needed)?;
            self.stats.live_bytes -= current - used;
            self.stats.in_place_reallocs += 1;
            return Ok(ptr);
        }

        let next = block + current;
        let next_tag = self.tag_at(OP, next)?;
        let next_free = !next_tag.allocated;
        let available = current + if next_free { next_tag.size } else { 0 };
        let after = if next_free { next + next_tag.size } else { next };

        if available >= needed || after == self.region.epilogue() {
            if available < needed {
                let shortfall = (needed - available).max(self.min_block);
                self.region.grow(shortfall)?;
                self.stats.grows += 1;
                let heap_len = self.region.len();
                self.record_lifecycle(
                    AllocatorLogLevel::Debug,
                    OP,
                    "grow",
                    Some(after),
                    Some(shortfall),
                    None,
                    "absorbed",
                    move || format!("heap_len={heap_len}"),
                );
            }
            if next_free {
                self.index.remove(&mut self.region, next, next_tag.size);
                self.stats.coalesces += 1;
            }
            let total = if available >= needed {
                available
            } else {
                self.region.epilogue() - block
            };
            if next_free {
                self.clear_boundary(next);
            }
            if block + total > after {
                // The old epilogue is now inside the block.
                self.clear_boundary(after);
            }
            let used = self.place(OP, block, total, needed)?;
            self.add_live_bytes(used - current);
            self.stats.in_place_reallocs += 1;
            return Ok(ptr);
        }

        let new_ptr = self.allocate_block(OP, new_size)?;
        let keep = block::capacity(current).min(new_size);
        self.region.copy_within(ptr, new_ptr, keep);
        self.stats.live_blocks -= 1;
        self.stats.live_bytes -= current;
        self.release(OP, block, current)?;
        self.stats.moved_reallocs += 1;
        Ok(new_ptr)
    }

    /// Marks `block` (spanning `total` bytes) allocated for a `needed`-byte
    /// request, splitting off and releasing the tail when the split rule
    /// allows. Returns the final block size.
    fn place(
        &mut self,
        op: &'static str,
        block: usize,
        total: usize,
        needed: usize,
    ) -> Result<usize, AllocError> {
        match block::split_remainder(
            total,
            needed,
            self.config.split_threshold,
            self.config.alignment,
        ) {
            Some(rest) => {
                self.write_block(block, needed, true);
                self.stats.splits += 1;
                self.release(op, block + needed, rest)?;
                Ok(needed)
            }
            None => {
                self.write_block(block, total, true);
                self.stats.unsplit_allocs += 1;
                Ok(total)
            }
        }
    }

    /// Frees `block`, merges it with free neighbours and lists the result.
    /// Returns the merged block offset.
    fn release(&mut self, op: &'static str, block: usize, size: usize) -> Result<usize, AllocError> {
        let mut start = block;
        let mut total = size;

        let next = self.tag_at(op, block + size)?;
        if !next.allocated {
            self.index.remove(&mut self.region, block + size, next.size);
            total += next.size;
            self.stats.coalesces += 1;
            self.clear_boundary(block + size);
        }

        if block > self.region.first_block() {
            let prev = self.tag_at(op, block - TAG_SIZE)?;
            if !prev.allocated {
                start = block - prev.size;
                self.index.remove(&mut self.region, start, prev.size);
                total += prev.size;
                self.stats.coalesces += 1;
                self.clear_boundary(block);
            }
        }

        self.write_block(start, total, false);
        self.index.insert(&mut self.region, start, total);
        Ok(start)
    }

    /// Extends the heap by at least `minimum` bytes and lists the new space
    /// as one free block, merged with a free top block if there is one.
    fn grow(&mut self, op: &'static str, minimum: usize) -> Result<usize, AllocError> {
        let base = self.region.grow(minimum)?;
        let added = self.region.epilogue() - base;
        self.stats.grows += 1;
        let merged = self.release(op, base, added)?;
        let heap_len = self.region.len();
        self.record_lifecycle(
            AllocatorLogLevel::Debug,
            op,
            "grow",
            Some(base),
            Some(added),
            Some(free_list::class_of(added)),
            "success",
            move || format!("heap_len={heap_len};top_block={merged:#x}"),
        );
        Ok(merged)
    }

    fn write_block(&mut self, block: usize, size: usize, allocated: bool) {
        let tag = block::encode_tag(size, allocated);
        self.region.write_tag(block, tag);
        self.region.write_tag(block + size - TAG_SIZE, tag);
    }

    /// Zeroes the footer below and the header at a boundary that is now
    /// interior to a merged block, so stale offsets no longer decode.
    fn clear_boundary(&mut self, boundary: usize) {
        self.region.write_tag(boundary - TAG_SIZE, 0);
        self.region.write_tag(boundary, 0);
    }

    fn tag_at(&self,op: &'static str, offset: usize) -> Result<block::Tag, AllocError> {
        block::decode_tag(self.region.read_tag(offset))
            .ok_or_else(|| AllocError::corruption(op, offset, "boundary tag check word mismatch"))
    }

    fn add_live_bytes(&mut self, bytes: usize) {
        self.stats.live_bytes += bytes;
        self.stats.peak_live_bytes = self.stats.peak_live_bytes.max(self.stats.live_bytes);
    }

    /// Validates that `ptr` is the payload offset of an allocated block and
    /// returns `(header_offset, block_size)`.
    fn live_block(&self, op: &'static str, ptr: usize) -> Result<(usize, usize), AllocError> {
        let invalid = |reason| AllocError::InvalidFree {
            op,
            offset: ptr,
            reason,
        };
        if ptr % self.config.alignment != 0 {
            return Err(invalid("misaligned_pointer"));
        }
        let epilogue = self.region.epilogue();
        if ptr < self.region.first_block() + TAG_SIZE
            || ptr.saturating_add(self.min_block - TAG_SIZE) > epilogue
        {
            return Err(invalid("outside_heap"));
        }
        let header = ptr - TAG_SIZE;
        let raw = self.region.read_tag(header);
        let Some(tag) = block::decode_tag(raw) else {
            return Err(invalid("bad_header_tag"));
        };
        if !tag.allocated {
            return Err(invalid("block_not_allocated"));
        }
        if tag.size < self.min_block
            || tag.size % self.config.alignment != 0
            || header + tag.size > epilogue
        {
            return Err(invalid("size_out_of_heap"));
        }
        if self.region.read_tag(header + tag.size - TAG_SIZE) != raw {
            return Err(invalid("footer_mismatch"));
        }
        Ok((header, tag.size))
    }

    /// Payload bytes of the live block at `ptr`.
    pub fn payload(&self, ptr: usize) -> Result<&[u8], AllocError> {
        let (_, size) = self.live_block("payload", ptr)?;
        Ok(self.region.payload(ptr, block::capacity(size)))
    }

    /// Mutable payload bytes of the live block at `ptr`.
    pub fn payload_mut(&mut self, ptr: usize) -> Result<&mut [u8], AllocError> {
        let (_, size) = self.live_block("payload_mut", ptr)?;
        Ok(self.region.payload_mut(ptr, block::capacity(size)))
    }

    /// Usable payload capacity of the live block at `ptr`.
    pub fn usable_size(&self, ptr: usize) -> Result<usize, AllocError> {
        self.live_block("usable_size", ptr)
            .map(|(_, size)| block::capacity(size))
    }

    /// Runs the full consistency checker without latching its result.
    pub fn check(&self) -> Result<HeapReport, AllocError> {
        check::check_heap("check", &self.region, &self.index)
    }

    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    pub fn stats(&self) -> HeapStats {
        self.stats
    }

    pub fn heap_len(&self) -> usize {
        self.region.len()
    }

    /// Number of listed free blocks.
    pub fn free_block_count(&self) -> usize {
        self.index.len()
    }

    /// Bytes held by free blocks.
    pub fn free_bytes(&self) -> usize {
        self.index.free_bytes()
    }

    /// The latched fault, if the trial has failed.
    pub fn fault(&self) -> Option<&AllocError> {
        self.fault.as_ref()
    }

    pub fn is_faulted(&self) -> bool {
        self.fault.is_some()
    }

    /// Returns a view of allocator lifecycle log records.
    pub fn lifecycle_logs(&self) -> &[AllocatorLogRecord] {
        &self.lifecycle_logs
    }

    /// Drains allocator lifecycle log records.
    pub fn drain_lifecycle_logs(&mut self) -> Vec<AllocatorLogRecord> {
        std::mem::take(&mut self.lifecycle_logs)
    }
}
