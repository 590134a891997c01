//! # Target memory access
//!
//! [`MemoryIo`] is the capability the rest of the core programs against:
//! byte-granular reads and writes into the target address space, plus
//! [`MemoryIo::swap`], the read-then-write pair software breakpoints are
//! built from.
//!
//! [`TargetMemory`] adds the one-region read-through cache. Stack walks and
//! expression evaluation re-read the same small window of the target over
//! and over; constructing a cache over that window for the duration of the
//! scope turns those repeats into memcpys. Caching is always best-effort:
//! if the window cannot be pre-read the uncached access path is returned
//! unchanged.

use tracing::debug;

use crate::addr::Addr;
use crate::driver::{Driver, Tid};
use crate::errors::Result;

/// Read/write access to the address space of the debuggee.
pub trait MemoryIo {
    /// Read `n` bytes at `addr`. A zero-length read succeeds with an empty
    /// buffer and performs no syscall.
    fn read(&mut self, addr: Addr, n: usize) -> Result<Vec<u8>>;

    /// Write `data` at `addr`, returning the number of bytes written. An
    /// empty write succeeds with 0 and performs no syscall.
    fn write(&mut self, addr: Addr, data: &[u8]) -> Result<usize>;

    /// Replace the bytes at `addr` with `data` and return the previous
    /// contents.
    fn swap(&mut self, addr: Addr, data: &[u8]) -> Result<Vec<u8>> {
        let previous = self.read(addr, data.len())?;
        self.write(addr, data)?;
        Ok(previous)
    }
}

/// Memory of a live target, accessed through its [`Driver`].
pub struct ProcessMemory<'a> {
    driver: &'a mut dyn Driver,
    tid: Tid,
}

impl<'a> ProcessMemory<'a> {
    pub fn new(driver: &'a mut dyn Driver, tid: Tid) -> Self {
        Self { driver, tid }
    }
}

impl MemoryIo for ProcessMemory<'_> {
    fn read(&mut self, addr: Addr, n: usize) -> Result<Vec<u8>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        self.driver.read_memory(self.tid, addr, n)
    }

    fn write(&mut self, addr: Addr, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        self.driver.write_memory(self.tid, addr, data)
    }
}

/// Target memory with an optional single-window read cache.
///
/// The cache holds exactly one `[base, base+len)` window. Reads fully
/// contained in the window are served from it; everything else falls
/// through to the inner access path. Writes always fall through, and
/// writes overlapping the window also update it so later cached reads
/// observe the new bytes.
pub enum TargetMemory<M> {
    Direct(M),
    Cached {
        base: Addr,
        window: Vec<u8>,
        inner: M,
    },
}

impl<M: MemoryIo> TargetMemory<M> {
    pub fn new(inner: M) -> Self {
        TargetMemory::Direct(inner)
    }

    /// Layer a cache over `[addr, addr+size)`.
    ///
    /// Returns `self` unchanged when `size` is zero, when the existing
    /// window already covers the requested region, or when the window
    /// cannot be pre-read.
    pub fn cached(self, addr: Addr, size: usize) -> Self {
        if size == 0 {
            return self;
        }
        if let TargetMemory::Cached { base, window, .. } = &self {
            if window_contains(*base, window.len(), addr, size) {
                return self;
            }
        }
        let mut inner = match self {
            TargetMemory::Direct(inner) => inner,
            TargetMemory::Cached { inner, .. } => inner,
        };
        match inner.read(addr, size) {
            Ok(window) => TargetMemory::Cached {
                base: addr,
                window,
                inner,
            },
            Err(e) => {
                debug!("not caching [{addr}, +{size:#x}): {e}");
                TargetMemory::Direct(inner)
            }
        }
    }
}

impl<M: MemoryIo> MemoryIo for TargetMemory<M> {
    fn read(&mut self, addr: Addr, n: usize) -> Result<Vec<u8>> {
        match self {
            TargetMemory::Direct(inner) => inner.read(addr, n),
            TargetMemory::Cached {
                base,
                window,
                inner,
            } => {
                if window_contains(*base, window.len(), addr, n) {
                    let start = (addr - *base).usize();
                    Ok(window[start..start + n].to_vec())
                } else {
                    inner.read(addr, n)
                }
            }
        }
    }

    fn write(&mut self, addr: Addr, data: &[u8]) -> Result<usize> {
        if let TargetMemory::Cached { base, window, .. } = self {
            let w_start = base.usize();
            let w_end = w_start + window.len();
            let d_start = addr.usize();
            let d_end = d_start + data.len();
            let start = w_start.max(d_start);
            let end = w_end.min(d_end);
            if start < end {
                window[start - w_start..end - w_start]
                    .copy_from_slice(&data[start - d_start..end - d_start]);
            }
        }
        match self {
            TargetMemory::Direct(inner) => inner.write(addr, data),
            TargetMemory::Cached { inner, .. } => inner.write(addr, data),
        }
    }
}

fn window_contains(base: Addr, window_len: usize, addr: Addr, size: usize) -> bool {
    addr >= base && addr.usize() + size <= base.usize() + window_len
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::errors::DebuggerError;

    /// A flat chunk of fake target memory that counts accesses.
    struct VecMemory {
        base: Addr,
        bytes: Vec<u8>,
        reads: usize,
        writes: usize,
    }

    impl VecMemory {
        fn new(base: usize, bytes: &[u8]) -> Self {
            Self {
                base: Addr::from(base),
                bytes: bytes.to_vec(),
                reads: 0,
                writes: 0,
            }
        }

        fn offset(&self, addr: Addr, len: usize) -> Result<usize> {
            let off = addr.usize().wrapping_sub(self.base.usize());
            if addr < self.base || off + len > self.bytes.len() {
                return Err(DebuggerError::OutOfBounds { addr, len });
            }
            Ok(off)
        }
    }

    impl MemoryIo for VecMemory {
        fn read(&mut self, addr: Addr, n: usize) -> Result<Vec<u8>> {
            if n == 0 {
                return Ok(Vec::new());
            }
            self.reads += 1;
            let off = self.offset(addr, n)?;
            Ok(self.bytes[off..off + n].to_vec())
        }

        fn write(&mut self, addr: Addr, data: &[u8]) -> Result<usize> {
            if data.is_empty() {
                return Ok(0);
            }
            self.writes += 1;
            let off = self.offset(addr, data.len())?;
            self.bytes[off..off + data.len()].copy_from_slice(data);
            Ok(data.len())
        }
    }

    #[test]
    fn test_zero_size_returns_uncached() {
        let mem = TargetMemory::new(VecMemory::new(0x100, &[1, 2, 3, 4]));
        let mem = mem.cached(Addr::from(0x100usize), 0);
        assert!(matches!(mem, TargetMemory::Direct(_)));
    }

    #[test]
    fn test_cached_read_hits_window() {
        let mem = TargetMemory::new(VecMemory::new(0x100, &[1, 2, 3, 4, 5, 6, 7, 8]));
        let mut mem = mem.cached(Addr::from(0x100usize), 8);
        assert_eq!(mem.read(Addr::from(0x102usize), 3).unwrap(), vec![3, 4, 5]);
        assert_eq!(mem.read(Addr::from(0x100usize), 8).unwrap()[0], 1);
        if let TargetMemory::Cached { inner, .. } = &mem {
            // one read to fill the window, none for the cached reads
            assert_eq!(inner.reads, 1);
        } else {
            panic!("expected cached memory");
        }
    }

    #[test]
    fn test_read_outside_window_falls_through() {
        let mem = TargetMemory::new(VecMemory::new(0x100, &[0u8; 32]));
        let mut mem = mem.cached(Addr::from(0x100usize), 8);
        mem.read(Addr::from(0x110usize), 4).unwrap();
        if let TargetMemory::Cached { inner, .. } = &mem {
            assert_eq!(inner.reads, 2);
        } else {
            panic!("expected cached memory");
        }
    }

    #[test]
    fn test_write_through_updates_window() {
        let mem = TargetMemory::new(VecMemory::new(0x100, &[0u8; 8]));
        let mut mem = mem.cached(Addr::from(0x100usize), 8);
        // partial overlap: bytes 0x106..0x10a, window ends at 0x108
        mem.write(Addr::from(0x106usize), &[0xaa; 4]).unwrap();
        assert_eq!(mem.read(Addr::from(0x106usize), 2).unwrap(), vec![0xaa, 0xaa]);
        if let TargetMemory::Cached { inner, window, .. } = &mem {
            assert_eq!(inner.writes, 1);
            assert_eq!(&window[6..], &[0xaa, 0xaa]);
            assert_eq!(&inner.bytes[6..8], &[0xaa, 0xaa]);
        } else {
            panic!("expected cached memory");
        }
    }

    #[test]
    fn test_unreadable_window_stays_uncached() {
        let mem = TargetMemory::new(VecMemory::new(0x100, &[0u8; 8]));
        let mem = mem.cached(Addr::from(0x10_000usize), 16);
        assert!(matches!(mem, TargetMemory::Direct(_)));
    }

    #[test]
    fn test_covering_cache_reused() {
        let mem = TargetMemory::new(VecMemory::new(0x100, &[0u8; 32]));
        let mem = mem.cached(Addr::from(0x100usize), 32);
        let mem = mem.cached(Addr::from(0x108usize), 8);
        if let TargetMemory::Cached { base, inner, .. } = &mem {
            assert_eq!(*base, Addr::from(0x100usize));
            assert_eq!(inner.reads, 1);
        } else {
            panic!("expected cached memory");
        }
    }

    #[test]
    fn test_swap_roundtrip() {
        let mut mem = VecMemory::new(0x100, &[1, 2, 3, 4]);
        let prev = mem.swap(Addr::from(0x101usize), &[0xcc]).unwrap();
        assert_eq!(prev, vec![2]);
        assert_eq!(mem.read(Addr::from(0x101usize), 1).unwrap(), vec![0xcc]);
        let back = mem.swap(Addr::from(0x101usize), &prev).unwrap();
        assert_eq!(back, vec![0xcc]);
        assert_eq!(mem.read(Addr::from(0x100usize), 4).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_zero_length_io_makes_no_syscall() {
        let mut mem = VecMemory::new(0x100, &[1, 2, 3, 4]);
        assert!(mem.read(Addr::from(0x100usize), 0).unwrap().is_empty());
        assert_eq!(mem.write(Addr::from(0x100usize), &[]).unwrap(), 0);
        assert_eq!(mem.reads, 0);
        assert_eq!(mem.writes, 0);
    }
}
