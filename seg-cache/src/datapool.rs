//! Datapool: the contiguous byte region backing the segment heap
//!
//! The pool is either anonymous memory or a memory-mapped file. A page-sized
//! header at the base carries a signature, version, size, a dirty flag, the
//! user signature, and an opaque user data blob. A pool whose header does not
//! validate (or that was not closed cleanly) is treated as fresh and its
//! payload zeroed. The dirty flag is set while the pool is open and cleared
//! again by a clean close, so an unclean shutdown is detectable on the next
//! open.

use std::fs::OpenOptions;
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use memmap2::{MmapMut, MmapOptions};
use tracing::{debug, info, warn};

use crate::error::Result;

pub const DATAPOOL_SIGNATURE: &[u8; 16] = b"SEGCACHEDATAPOOL";
pub const DATAPOOL_VERSION: u32 = 1;
/// Full header block; page-sized so the payload stays page-aligned.
pub const DATAPOOL_HEADER_LEN: usize = 4096;
pub const DATAPOOL_USER_SIGNATURE_LEN: usize = 128;
pub const DATAPOOL_USER_DATA_LEN: usize = 256;

const FLAG_DIRTY: u64 = 1;
const VALID_FLAGS: u64 = FLAG_DIRTY;

const OFF_SIGNATURE: usize = 0;
const OFF_VERSION: usize = 16;
const OFF_SIZE: usize = 20;
const OFF_FLAGS: usize = 28;
const OFF_USER_SIGNATURE: usize = 36;
const OFF_USER_DATA: usize = OFF_USER_SIGNATURE + DATAPOOL_USER_SIGNATURE_LEN;

const PAGE_SIZE: usize = 4096;

pub struct Datapool {
    map: MmapMut,
    base: *mut u8,
    file_backed: bool,
    fresh: bool,
}

// The raw base pointer aliases memory owned by the map; handing it across
// threads is safe because all payload access is coordinated by the segment
// heap's reservation protocol.
unsafe impl Send for Datapool {}
unsafe impl Sync for Datapool {}

impl Datapool {
    /// Open (and if necessary initialize) a datapool with `payload_size`
    /// usable bytes. `path = None` falls back to anonymous memory, which is
    /// always fresh.
    pub fn open(
        path: Option<&Path>,
        user_signature: &str,
        payload_size: usize,
        prefault: bool,
    ) -> Result<Self> {
        let total = payload_size + DATAPOOL_HEADER_LEN;

        let (mut map, file_backed) = match path {
            Some(path) => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(path)?;
                file.set_len(total as u64)?;
                let map = unsafe { MmapOptions::new().len(total).map_mut(&file)? };
                info!("mapped datapool {} with {} bytes", path.display(), total);
                (map, true)
            }
            None => {
                let map = MmapOptions::new().len(total).map_anon()?;
                debug!("allocated anonymous datapool with {} bytes", total);
                (map, false)
            }
        };

        let fresh = !file_backed || !header_valid(&map, user_signature, total);
        if fresh {
            if file_backed {
                info!("initializing fresh datapool");
            }
            map[..total].fill(0);
            write_header(&mut map, user_signature, total);
        }

        if prefault {
            debug!("prefaulting {} datapool pages", total / PAGE_SIZE);
            let mut page = 0;
            while page < total {
                unsafe {
                    std::ptr::read_volatile(map.as_ptr().add(page));
                }
                page += PAGE_SIZE;
            }
        }

        let mut pool = Self {
            base: map.as_mut_ptr(),
            map,
            file_backed,
            fresh,
        };
        pool.set_flag(FLAG_DIRTY);
        pool.sync_header()?;

        Ok(pool)
    }

    /// Whether this open started from a zeroed payload.
    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    pub fn payload_len(&self) -> usize {
        self.map.len() - DATAPOOL_HEADER_LEN
    }

    /// Base of the usable region, past the header block.
    pub fn payload_ptr(&self) -> *mut u8 {
        unsafe { self.base.add(DATAPOOL_HEADER_LEN) }
    }

    /// Store up to 256 opaque bytes in the header.
    pub fn set_user_data(&mut self, data: &[u8]) {
        let len = data.len().min(DATAPOOL_USER_DATA_LEN);
        let slot = &mut self.map[OFF_USER_DATA..OFF_USER_DATA + DATAPOOL_USER_DATA_LEN];
        slot.fill(0);
        slot[..len].copy_from_slice(&data[..len]);
    }

    pub fn user_data(&self) -> &[u8] {
        &self.map[OFF_USER_DATA..OFF_USER_DATA + DATAPOOL_USER_DATA_LEN]
    }

    /// Flush everything and clear the dirty flag. Called on clean teardown.
    pub fn close(&mut self) -> Result<()> {
        if self.file_backed {
            self.map.flush()?;
        }
        self.clear_flag(FLAG_DIRTY);
        self.sync_header()?;
        Ok(())
    }

    fn set_flag(&mut self, flag: u64) {
        let flags = LittleEndian::read_u64(&self.map[OFF_FLAGS..OFF_FLAGS + 8]);
        LittleEndian::write_u64(&mut self.map[OFF_FLAGS..OFF_FLAGS + 8], flags | flag);
    }

    fn clear_flag(&mut self, flag: u64) {
        let flags = LittleEndian::read_u64(&self.map[OFF_FLAGS..OFF_FLAGS + 8]);
        LittleEndian::write_u64(&mut self.map[OFF_FLAGS..OFF_FLAGS + 8], flags & !flag);
    }

    fn sync_header(&self) -> Result<()> {
        if self.file_backed {
            self.map.flush_range(0, DATAPOOL_HEADER_LEN)?;
        }
        Ok(())
    }
}

impl Drop for Datapool {
    fn drop(&mut self) {
        // Best-effort clean close; an interrupted process leaves the dirty
        // flag set, which the next open treats as a fresh pool.
        if let Err(e) = self.close() {
            warn!("datapool close failed: {e}");
        }
    }
}

fn header_valid(map: &MmapMut, user_signature: &str, total: usize) -> bool {
    if &map[OFF_SIGNATURE..OFF_SIGNATURE + 16] != DATAPOOL_SIGNATURE {
        info!("no signature found in datapool");
        return false;
    }
    let version = LittleEndian::read_u32(&map[OFF_VERSION..OFF_VERSION + 4]);
    if version != DATAPOOL_VERSION {
        info!(
            "incompatible datapool version (is: {version}, expecting: {})",
            DATAPOOL_VERSION
        );
        return false;
    }
    let size = LittleEndian::read_u64(&map[OFF_SIZE..OFF_SIZE + 8]);
    if size != total as u64 {
        warn!("datapool has unexpected size (is: {size}, expecting: {total})");
        return false;
    }
    let flags = LittleEndian::read_u64(&map[OFF_FLAGS..OFF_FLAGS + 8]);
    if flags & !VALID_FLAGS != 0 {
        warn!("datapool has invalid flags set: {flags:#x}");
        return false;
    }
    if flags & FLAG_DIRTY != 0 {
        info!("datapool has a valid header but is dirty");
        return false;
    }
    let mut expected = [0u8; DATAPOOL_USER_SIGNATURE_LEN];
    let name = user_signature.as_bytes();
    let len = name.len().min(DATAPOOL_USER_SIGNATURE_LEN);
    expected[..len].copy_from_slice(&name[..len]);
    if map[OFF_USER_SIGNATURE..OFF_USER_SIGNATURE + DATAPOOL_USER_SIGNATURE_LEN] != expected {
        warn!("wrong user signature ({user_signature}) for this datapool");
        return false;
    }
    true
}

fn write_header(map: &mut MmapMut, user_signature: &str, total: usize) {
    map[..DATAPOOL_HEADER_LEN].fill(0);
    map[OFF_SIGNATURE..OFF_SIGNATURE + 16].copy_from_slice(DATAPOOL_SIGNATURE);
    LittleEndian::write_u32(&mut map[OFF_VERSION..OFF_VERSION + 4], DATAPOOL_VERSION);
    LittleEndian::write_u64(&mut map[OFF_SIZE..OFF_SIZE + 8], total as u64);
    LittleEndian::write_u64(&mut map[OFF_FLAGS..OFF_FLAGS + 8], 0);
    let name = user_signature.as_bytes();
    let len = name.len().min(DATAPOOL_USER_SIGNATURE_LEN);
    map[OFF_USER_SIGNATURE..OFF_USER_SIGNATURE + len].copy_from_slice(&name[..len]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anonymous_pool_is_fresh() {
        let pool = Datapool::open(None, "test_pool", 64 * 1024, false).unwrap();
        assert!(pool.is_fresh());
        assert_eq!(pool.payload_len(), 64 * 1024);
        assert!(!pool.payload_ptr().is_null());
    }

    #[test]
    fn test_file_pool_survives_clean_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.data");

        {
            let mut pool = Datapool::open(Some(&path), "test_pool", 64 * 1024, false).unwrap();
            assert!(pool.is_fresh());
            pool.set_user_data(b"layout-v1");
            pool.close().unwrap();
        }

        let pool = Datapool::open(Some(&path), "test_pool", 64 * 1024, false).unwrap();
        assert!(!pool.is_fresh());
        assert_eq!(&pool.user_data()[..9], b"layout-v1");
    }

    #[test]
    fn test_dirty_pool_reopens_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.data");

        {
            let mut pool = Datapool::open(Some(&path), "test_pool", 64 * 1024, false).unwrap();
            pool.close().unwrap();
        }
        {
            // Simulate a crash by setting the dirty flag behind the pool's
            // back; a real unclean shutdown leaves it set the same way.
            use std::io::{Seek, SeekFrom, Write};
            let mut file = OpenOptions::new().write(true).open(&path).unwrap();
            file.seek(SeekFrom::Start(OFF_FLAGS as u64)).unwrap();
            file.write_all(&[1]).unwrap();
        }

        let pool = Datapool::open(Some(&path), "test_pool", 64 * 1024, false).unwrap();
        assert!(pool.is_fresh());
    }

    #[test]
    fn test_wrong_signature_reopens_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.data");

        {
            let mut pool = Datapool::open(Some(&path), "pool_a", 64 * 1024, false).unwrap();
            pool.close().unwrap();
        }

        let pool = Datapool::open(Some(&path), "pool_b", 64 * 1024, false).unwrap();
        assert!(pool.is_fresh());
    }

    #[test]
    fn test_prefault_touches_every_page() {
        let pool = Datapool::open(None, "test_pool", 256 * 1024, true).unwrap();
        assert_eq!(pool.payload_len(), 256 * 1024);
    }
}
