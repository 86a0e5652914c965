//! Shared-memory market snapshot for one symbol.
//!
//! Segment layout (little-endian, `#[repr(C)]`):
//!
//! ```text
//! [0..64)            header: u32 lock word (holder pid, 0 = free) + padding
//! [64..64+1256)      MarketSnapshot
//! ```
//!
//! The producer writes under the lock and bumps `update_counter`. Readers
//! only ever try-lock; when the lock is busy they keep serving the last copy
//! they managed to take.

use serde::Serialize;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use crate::core::{Error, Result, Side};

/// "PAIRMD" + layout version 1.
pub const SNAPSHOT_SIGNATURE: u64 = 0x5041_4952_4D44_0001;
pub const DEPTH_LEVELS: usize = 10;
/// Position value of an unused depth slot.
pub const UNUSED_DEPTH: i64 = -1;

const SYMBOL_LEN: usize = 16;
const HEADER_SIZE: usize = 64;
pub const SEGMENT_SIZE: usize = HEADER_SIZE + std::mem::size_of::<MarketSnapshot>();

const PRODUCER_LOCK_TIMEOUT: Duration = Duration::from_millis(50);

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct Quote {
    pub px: f64,
    pub qty: i64,
    pub last_update_ns: i64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct TopOfBook {
    pub bid: Quote,
    pub ask: Quote,
    pub total_trading_qty: i64,
    pub last_update_ns: i64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct LastTrade {
    pub px: f64,
    pub qty: i64,
    pub exch_time_ns: i64,
    pub arrival_time_ns: i64,
    pub premium: f64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct DepthLevel {
    pub exch_time_ns: i64,
    pub px: f64,
    pub qty: i64,
    pub position: i64,
    pub cumulative_notional: f64,
    pub cumulative_qty: i64,
    pub cumulative_avg_px: f64,
}

impl Default for DepthLevel {
    fn default() -> Self {
        Self {
            exch_time_ns: 0,
            px: 0.0,
            qty: 0,
            position: UNUSED_DEPTH,
            cumulative_notional: 0.0,
            cumulative_qty: 0,
            cumulative_avg_px: 0.0,
        }
    }
}

impl DepthLevel {
    pub fn new(position: i64, px: f64, qty: i64) -> Self {
        Self {
            position,
            px,
            qty,
            ..Self::default()
        }
    }

    pub fn is_used(&self) -> bool {
        self.position != UNUSED_DEPTH
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct MarketSnapshot {
    pub signature: u64,
    pub update_counter: u64,
    pub symbol: [u8; SYMBOL_LEN],
    pub last_trade: LastTrade,
    pub top_of_book: TopOfBook,
    pub bid_depth: [DepthLevel; DEPTH_LEVELS],
    pub ask_depth: [DepthLevel; DEPTH_LEVELS],
}

const _: () = assert!(std::mem::size_of::<Quote>() == 24);
const _: () = assert!(std::mem::size_of::<DepthLevel>() == 56);
const _: () = assert!(std::mem::size_of::<MarketSnapshot>() == 1256);

impl MarketSnapshot {
    pub fn new(symbol: &str) -> Self {
        let mut sym = [0u8; SYMBOL_LEN];
        let bytes = symbol.as_bytes();
        let n = bytes.len().min(SYMBOL_LEN);
        sym[..n].copy_from_slice(&bytes[..n]);
        Self {
            signature: SNAPSHOT_SIGNATURE,
            symbol: sym,
            ..Self::default()
        }
    }

    pub fn symbol(&self) -> String {
        let end = self
            .symbol
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(SYMBOL_LEN);
        String::from_utf8_lossy(&self.symbol[..end]).into_owned()
    }

    pub fn signature_ok(&self) -> bool {
        self.signature == SNAPSHOT_SIGNATURE
    }

    /// Used bid levels; slots marked unused are skipped.
    pub fn bid_levels(&self) -> impl Iterator<Item = &DepthLevel> {
        self.bid_depth.iter().filter(|l| l.is_used())
    }

    pub fn ask_levels(&self) -> impl Iterator<Item = &DepthLevel> {
        self.ask_depth.iter().filter(|l| l.is_used())
    }

    pub fn depth(&self, side: Side) -> &[DepthLevel; DEPTH_LEVELS] {
        match side {
            Side::Buy => &self.bid_depth,
            Side::Sell => &self.ask_depth,
        }
    }

    pub fn best_bid_px(&self) -> Option<f64> {
        let px = self.top_of_book.bid.px;
        (px > 0.0).then_some(px)
    }

    pub fn best_ask_px(&self) -> Option<f64> {
        let px = self.top_of_book.ask.px;
        (px > 0.0).then_some(px)
    }

    pub fn to_view(&self) -> SnapshotView {
        SnapshotView {
            symbol: self.symbol(),
            signature_ok: self.signature_ok(),
            update_counter: self.update_counter,
            last_trade: self.last_trade,
            top_of_book: self.top_of_book,
            bids: self.bid_levels().copied().collect(),
            asks: self.ask_levels().copied().collect(),
        }
    }
}

/// Owned, serializable copy for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotView {
    pub symbol: String,
    pub signature_ok: bool,
    pub update_counter: u64,
    pub last_trade: LastTrade,
    pub top_of_book: TopOfBook,
    pub bids: Vec<DepthLevel>,
    pub asks: Vec<DepthLevel>,
}

/// Mapped segment: lock word + snapshot.
struct Segment {
    mmap: memmap2::MmapMut,
}

impl Segment {
    fn map(path: &Path, create: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .truncate(create)
            .open(path)?;
        if create {
            file.set_len(SEGMENT_SIZE as u64)?;
        }
        let len = file.metadata()?.len() as usize;
        if len < SEGMENT_SIZE {
            return Err(Error::Shm(format!(
                "{} is {} bytes, expected at least {}",
                path.display(),
                len,
                SEGMENT_SIZE
            )));
        }
        let mmap = unsafe { memmap2::MmapMut::map_mut(&file)? };
        Ok(Self { mmap })
    }

    #[inline(always)]
    fn lock_word(&self) -> &AtomicU32 {
        // page-aligned mapping, so offset 0 is aligned for u32
        unsafe { &*(self.mmap.as_ptr() as *const AtomicU32) }
    }

    #[inline(always)]
    fn snapshot_ptr(&self) -> *const MarketSnapshot {
        unsafe { self.mmap.as_ptr().add(HEADER_SIZE) as *const MarketSnapshot }
    }

    #[inline(always)]
    fn snapshot_mut_ptr(&mut self) -> *mut MarketSnapshot {
        unsafe { self.mmap.as_mut_ptr().add(HEADER_SIZE) as *mut MarketSnapshot }
    }

    fn copy_snapshot(&self) -> MarketSnapshot {
        unsafe { core::ptr::read_volatile(self.snapshot_ptr()) }
    }

    fn store_snapshot(&mut self, snap: MarketSnapshot) {
        unsafe { core::ptr::write_volatile(self.snapshot_mut_ptr(), snap) }
    }

    fn try_lock(&self) -> Option<ShmMutexGuard<'_>> {
        ShmMutexGuard::try_acquire(self.lock_word())
    }

    fn lock(&self, timeout: Duration) -> Result<ShmMutexGuard<'_>> {
        let deadline = Instant::now() + timeout;
        let mut spins = 0u32;
        loop {
            if let Some(guard) = self.try_lock() {
                return Ok(guard);
            }
            if Instant::now() >= deadline {
                return Err(Error::Shm(format!(
                    "mutex still held by pid {} after {:?}",
                    self.lock_word().load(Ordering::Relaxed),
                    timeout
                )));
            }
            spins += 1;
            if spins < 64 {
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
    }
}

/// Held process-shared mutex; released on drop.
pub struct ShmMutexGuard<'a> {
    word: &'a AtomicU32,
}

impl<'a> ShmMutexGuard<'a> {
    fn try_acquire(word: &'a AtomicU32) -> Option<Self> {
        word.compare_exchange(0, std::process::id(), Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| Self { word })
    }
}

impl Drop for ShmMutexGuard<'_> {
    fn drop(&mut self) {
        self.word.store(0, Ordering::Release);
    }
}

/// Producer side. One per segment.
pub struct SnapshotWriter {
    segment: Segment,
    path: PathBuf,
}

impl SnapshotWriter {
    /// Create (or truncate) the segment and stamp an empty snapshot.
    pub fn create(path: impl AsRef<Path>, symbol: &str) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut segment = Segment::map(&path, true)?;
        segment.lock_word().store(0, Ordering::Release);
        segment.store_snapshot(MarketSnapshot::new(symbol));
        segment.mmap.flush_async()?;
        tracing::info!(
            "shm: created {} ({} bytes) for {}",
            path.display(),
            SEGMENT_SIZE,
            symbol
        );
        Ok(Self { segment, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply `f` under the mutex and bump the update counter.
    pub fn update<F>(&mut self, f: F) -> Result<u64>
    where
        F: FnOnce(&mut MarketSnapshot),
    {
        // taken before the guard borrows the segment; the lock word and the
        // snapshot never overlap
        let ptr = self.segment.snapshot_mut_ptr();
        let _guard = self.segment.lock(PRODUCER_LOCK_TIMEOUT)?;
        let mut snap = unsafe { core::ptr::read_volatile(ptr) };
        f(&mut snap);
        snap.update_counter += 1;
        unsafe { core::ptr::write_volatile(ptr, snap) };
        Ok(snap.update_counter)
    }

    pub fn set_top_of_book(&mut self, tob: TopOfBook) -> Result<u64> {
        self.update(|s| s.top_of_book = tob)
    }

    pub fn set_last_trade(&mut self, trade: LastTrade) -> Result<u64> {
        self.update(|s| s.last_trade = trade)
    }

    pub fn set_depth(&mut self, side: Side, slot: usize, level: DepthLevel) -> Result<u64> {
        if slot >= DEPTH_LEVELS {
            return Err(Error::Shm(format!("depth slot {} out of range", slot)));
        }
        self.update(|s| match side {
            Side::Buy => s.bid_depth[slot] = level,
            Side::Sell => s.ask_depth[slot] = level,
        })
    }

    pub fn clear_depth(&mut self, side: Side, slot: usize) -> Result<u64> {
        self.set_depth(side, slot, DepthLevel::default())
    }

    /// Hold the segment mutex, e.g. for a multi-step external write.
    pub fn lock(&self) -> Result<ShmMutexGuard<'_>> {
        self.segment.lock(PRODUCER_LOCK_TIMEOUT)
    }
}

/// Consumer side. Any number per segment, in any process.
pub struct SnapshotReader {
    segment: Segment,
    path: PathBuf,
    last_good: Option<MarketSnapshot>,
    stale: bool,
}

impl SnapshotReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let segment = Segment::map(&path, false)?;
        tracing::info!("shm: mapped {} bytes from {}", segment.mmap.len(), path.display());
        Ok(Self {
            segment,
            path,
            last_good: None,
            stale: false,
        })
    }

    /// Best-effort copy. Never waits on the mutex: if it is busy, or the copy
    /// fails validation, the previous good copy is returned and marked stale.
    pub fn read(&mut self) -> Option<&MarketSnapshot> {
        let copied = match self.segment.try_lock() {
            Some(_guard) => self.segment.copy_snapshot(),
            None => {
                self.stale = true;
                tracing::warn!(
                    "shm {}: mutex busy (held by pid {}), serving potentially stale snapshot (counter {:?})",
                    self.path.display(),
                    self.segment.lock_word().load(Ordering::Relaxed),
                    self.last_good.map(|s| s.update_counter)
                );
                return self.last_good.as_ref();
            }
        };

        if !copied.signature_ok() {
            self.stale = true;
            tracing::error!(
                "shm {}: signature mismatch, found {:#018x} expected {:#018x}; treating map as stale/corrupt",
                self.path.display(),
                copied.signature,
                SNAPSHOT_SIGNATURE
            );
            return self.last_good.as_ref();
        }

        if let Some(prev) = &self.last_good
            && copied.update_counter < prev.update_counter
        {
            tracing::warn!(
                "shm {}: update counter went back from {} to {}, producer restarted?",
                self.path.display(),
                prev.update_counter,
                copied.update_counter
            );
        }

        self.stale = false;
        self.last_good = Some(copied);
        self.last_good.as_ref()
    }

    /// Counter of the last good copy, 0 before the first one.
    pub fn last_counter(&self) -> u64 {
        self.last_good.map(|s| s.update_counter).unwrap_or(0)
    }

    /// Whether the most recent `read` fell back to an older copy.
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    /// Pid currently holding the mutex, if any.
    pub fn holder_pid(&self) -> Option<u32> {
        match self.segment.lock_word().load(Ordering::Relaxed) {
            0 => None,
            pid => Some(pid),
        }
    }
}
