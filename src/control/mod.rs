//! Shared-memory control plane
//!
//! An external controller process creates a named shared-memory block and
//! drives volume, limiter and flow state through it; this process publishes
//! telemetry and an optional raw-sample tap back into the same block.
//!
//! There is no lock. Each field has exactly one writer across both
//! processes:
//!
//! | field                                   | writer      |
//! |-----------------------------------------|-------------|
//! | flags, volumes, thresholds, factors     | controller  |
//! | tap offset / capacity                   | controller  |
//! | tap write cursor, tap ring contents     | this process|
//! | limiter volumes, format, telemetry      | this process|
//!
//! Fields are accessed with relaxed atomics. Readers may see stale values;
//! the 64-bit tick count is stored as two halves and may be read torn.
//! Control values are re-read on every batch, so such glitches last at most
//! one batch.

pub mod stages;
pub mod volume;

pub use stages::{AveragingSink, FlowControlSink, TapSink};
pub use volume::{LimiterParams, LimiterState, VolumeSink};

use memmap2::MmapMut;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use crate::constants::MAX_CHANNELS;
use crate::error::ControlError;

pub const FLAG_INITIALIZED: u32 = 1;
pub const FLAG_ENABLED: u32 = 2;
pub const FLAG_ABORT_REQUESTED: u32 = 4;

/// f32 stored in an `AtomicU32`
#[repr(transparent)]
#[derive(Default)]
pub struct AtomicF32(AtomicU32);

impl AtomicF32 {
    pub fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub fn store(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::Relaxed)
    }
}

/// u64 stored as two 32-bit halves, low half first
#[repr(C)]
#[derive(Default)]
pub struct SplitU64([AtomicU32; 2]);

impl SplitU64 {
    pub fn load(&self) -> u64 {
        let low = self.0[0].load(Ordering::Relaxed) as u64;
        let high = self.0[1].load(Ordering::Relaxed) as u64;
        high << 32 | low
    }

    pub fn store(&self, value: u64) {
        self.0[0].store(value as u32, Ordering::Relaxed);
        self.0[1].store((value >> 32) as u32, Ordering::Relaxed);
    }
}

/// Fixed layout of the shared block header. The tap ring, if any, lives
/// after it at `tap_offset`.
#[repr(C)]
pub struct ControlBlock {
    pub flags: AtomicU32,
    pub tap_offset: AtomicI32,
    pub tap_write_cursor: AtomicI32,
    pub tap_capacity: AtomicI32,
    pub master_volume: AtomicF32,
    /// Indexed by speaker position
    pub channel_volumes: [AtomicF32; MAX_CHANNELS],
    pub saturation_threshold: AtomicF32,
    pub silence_threshold: AtomicF32,
    pub averaging_weight: AtomicF32,
    pub saturation_debounce_factor: AtomicF32,
    pub saturation_recovery_factor: AtomicF32,
    pub saturation_debounce_volume: AtomicF32,
    pub saturation_effective_volume: AtomicF32,
    pub samplerate: AtomicI32,
    pub channel_mask: AtomicU32,
    /// Milliseconds since the Unix epoch of the last processed batch
    pub last_frame_tick_count: SplitU64,
    pub last_frame_max_amplitude: AtomicF32,
}

/// Size of the block header in bytes
pub const CONTROL_BLOCK_SIZE: usize = std::mem::size_of::<ControlBlock>();

impl ControlBlock {
    fn has_flags(&self, mask: u32) -> bool {
        self.flags.load(Ordering::Relaxed) & mask == mask
    }

    /// False once the controller has initialized the block and requested
    /// an abort
    pub fn is_open(&self) -> bool {
        !self.has_flags(FLAG_INITIALIZED | FLAG_ABORT_REQUESTED)
    }

    pub fn is_playing(&self) -> bool {
        self.has_flags(FLAG_INITIALIZED | FLAG_ENABLED) && self.master_volume.load() != 0.0
    }

    /// Controller-side flag update
    pub fn set_flags(&self, mask: u32, value: bool) {
        if value {
            self.flags.fetch_or(mask, Ordering::Relaxed);
        } else {
            self.flags.fetch_and(!mask, Ordering::Relaxed);
        }
    }

    pub fn tap_capacity(&self) -> usize {
        self.tap_capacity.load(Ordering::Relaxed).max(0) as usize
    }
}

/// Location of shared memory `name` on this platform. A POSIX-style
/// leading `/` is ignored.
pub fn shm_path(name: &str) -> PathBuf {
    #[cfg(target_os = "linux")]
    let base = PathBuf::from("/dev/shm");

    #[cfg(not(target_os = "linux"))]
    let base = std::env::temp_dir();

    base.join(name.trim_start_matches('/'))
}

/// Mapped control block
pub struct SharedControl {
    name: String,
    mmap: MmapMut,
    block: NonNull<ControlBlock>,
}

// SAFETY: the header is only touched through atomics, and the tap ring is
// written by a single stage of a single pipeline.
unsafe impl Send for SharedControl {}
unsafe impl Sync for SharedControl {}

impl SharedControl {
    /// Open an existing block by name
    pub fn open(name: &str) -> Result<Self, ControlError> {
        Self::open_path(&shm_path(name))
    }

    pub fn open_path(path: &Path) -> Result<Self, ControlError> {
        let name = path.display().to_string();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| ControlError::OpenFailed {
                name: name.clone(),
                reason: e.to_string(),
            })?;

        let mmap = unsafe { MmapMut::map_mut(&file) }.map_err(|e| ControlError::MapFailed {
            name: name.clone(),
            reason: e.to_string(),
        })?;

        Self::from_mmap(name, mmap)
    }

    /// Create (or truncate) a block with a tap ring of `tap_capacity` bytes
    /// and controller defaults: initialized, unity volumes, limiter off.
    pub fn create_path(path: &Path, tap_capacity: usize) -> Result<Self, ControlError> {
        let name = path.display().to_string();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| ControlError::OpenFailed {
                name: name.clone(),
                reason: e.to_string(),
            })?;

        file.set_len((CONTROL_BLOCK_SIZE + tap_capacity) as u64)
            .map_err(|e| ControlError::OpenFailed {
                name: name.clone(),
                reason: e.to_string(),
            })?;

        let mmap = unsafe { MmapMut::map_mut(&file) }.map_err(|e| ControlError::MapFailed {
            name: name.clone(),
            reason: e.to_string(),
        })?;

        let control = Self::from_mmap(name, mmap)?;
        let block = control.block();
        block.tap_offset.store(CONTROL_BLOCK_SIZE as i32, Ordering::Relaxed);
        block.tap_write_cursor.store(0, Ordering::Relaxed);
        block.tap_capacity.store(tap_capacity as i32, Ordering::Relaxed);
        block.master_volume.store(1.0);
        for volume in &block.channel_volumes {
            volume.store(1.0);
        }
        block.saturation_debounce_factor.store(1.0);
        block.saturation_recovery_factor.store(1.0);
        block.saturation_debounce_volume.store(1.0);
        block.saturation_effective_volume.store(1.0);
        block.set_flags(FLAG_INITIALIZED, true);

        Ok(control)
    }

    fn from_mmap(name: String, mut mmap: MmapMut) -> Result<Self, ControlError> {
        if mmap.len() < CONTROL_BLOCK_SIZE {
            return Err(ControlError::TooSmall {
                name,
                size: mmap.len(),
                required: CONTROL_BLOCK_SIZE,
            });
        }

        let block = NonNull::new(mmap.as_mut_ptr().cast::<ControlBlock>()).ok_or_else(|| {
            ControlError::MapFailed {
                name: name.clone(),
                reason: "null mapping".into(),
            }
        })?;

        tracing::debug!("Mapped control block {} ({} bytes)", name, mmap.len());

        Ok(Self { name, mmap, block })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn block(&self) -> &ControlBlock {
        // SAFETY: the mapping is page aligned, at least CONTROL_BLOCK_SIZE
        // long and lives as long as self; every field is an atomic, valid
        // for any bit pattern.
        unsafe { self.block.as_ref() }
    }

    pub fn is_open(&self) -> bool {
        self.block().is_open()
    }

    pub fn is_playing(&self) -> bool {
        self.block().is_playing()
    }

    /// Offset and capacity of the tap ring, `None` when disabled or when the
    /// advertised region does not fit the mapping
    pub fn tap_region(&self) -> Option<(usize, usize)> {
        let block = self.block();
        let capacity = block.tap_capacity();
        if capacity == 0 {
            return None;
        }
        let offset = block.tap_offset.load(Ordering::Relaxed).max(0) as usize;
        if offset < CONTROL_BLOCK_SIZE || offset + capacity > self.mmap.len() {
            return None;
        }
        Some((offset, capacity))
    }

    /// Append `data` to the tap ring at the write cursor and publish the new
    /// cursor. Returns false when no usable tap is advertised.
    pub fn write_tap(&self, data: &[u8]) -> bool {
        let Some((offset, capacity)) = self.tap_region() else {
            return false;
        };

        let block = self.block();
        let cursor = block.tap_write_cursor.load(Ordering::Relaxed).max(0) as usize % capacity;

        // SAFETY: the region lies inside the mapping and does not overlap
        // the header; this process is its only writer and holds no other
        // reference to it.
        let ring = unsafe {
            std::slice::from_raw_parts_mut(self.block.as_ptr().cast::<u8>().add(offset), capacity)
        };
        let cursor = circular_write(ring, cursor, data);

        block
            .tap_write_cursor
            .store(cursor as i32, Ordering::Relaxed);
        true
    }
}

/// Copy `data` into `ring` starting at `cursor`, wrapping at the end.
/// Returns the cursor after the last byte written.
pub fn circular_write(ring: &mut [u8], mut cursor: usize, mut data: &[u8]) -> usize {
    let capacity = ring.len();
    while !data.is_empty() {
        let segment = data.len().min(capacity - cursor);
        ring[cursor..cursor + segment].copy_from_slice(&data[..segment]);
        cursor = (cursor + segment) % capacity;
        data = &data[segment..];
    }
    cursor
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Arc;

    /// Control block in a temporary file, initialized and enabled
    pub fn control_block(tap_capacity: usize) -> (tempfile::TempDir, Arc<SharedControl>) {
        let dir = tempfile::tempdir().unwrap();
        let control = SharedControl::create_path(&dir.path().join("ctl"), tap_capacity).unwrap();
        control.block().set_flags(FLAG_ENABLED, true);
        (dir, Arc::new(control))
    }
}
