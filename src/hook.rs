//! Provides types and functions for redirecting game code to our replacements.
//!
//! There is no hooking library to lean on here: the game binary never moves, so a hook is
//! just an x86 near jump written over the first five bytes of the target routine. Writing
//! the jump is also what commits it; there is no rollback, and none is wanted - an
//! installed hook lives for the rest of the process.

use eyre::{eyre, Result};
use once_cell::sync::OnceCell;
use std::marker::PhantomData;

/// Size of an x86 near jump (`E9` + rel32).
const JUMP_LEN: usize = 5;

/// Encodes a near jump written at `from` that lands at `to`.
///
/// The displacement is relative to the end of the instruction. Wrapping arithmetic is
/// correct here: every address in the 32-bit game image fits in rel32.
fn jump_to(from: usize, to: usize) -> [u8; JUMP_LEN] {
    let rel = (to.wrapping_sub(from + JUMP_LEN) as u32).to_le_bytes();
    [0xe9, rel[0], rel[1], rel[2], rel[3]]
}

/// Makes `len` bytes at `addr` writable and executable.
///
/// # Safety
///
/// `addr..addr + len` must be mapped in the current process.
#[cfg(windows)]
unsafe fn unprotect(addr: usize, len: usize) -> Result<()> {
    use windows_sys::Win32::System::Memory::{VirtualProtect, PAGE_EXECUTE_READWRITE};

    let mut old_protect = 0u32;

    if VirtualProtect(
        addr as *const std::ffi::c_void,
        len,
        PAGE_EXECUTE_READWRITE,
        &mut old_protect,
    ) == 0
    {
        return Err(eyre!("VirtualProtect failed for {addr:#x}"));
    }

    Ok(())
}

/// Makes `len` bytes at `addr` writable and executable.
///
/// # Safety
///
/// `addr..addr + len` must be mapped in the current process.
#[cfg(unix)]
unsafe fn unprotect(addr: usize, len: usize) -> Result<()> {
    let page_size = libc::sysconf(libc::_SC_PAGESIZE) as usize;

    // mprotect only accepts page-aligned addresses, so widen the span to page bounds.
    let start = addr & !(page_size - 1);
    let span = (addr + len).next_multiple_of(page_size) - start;

    if libc::mprotect(
        start as *mut libc::c_void,
        span,
        libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
    ) != 0
    {
        return Err(eyre!("mprotect failed for {addr:#x}"));
    }

    Ok(())
}

/// Overwrites the code at `addr` with `bytes`, making the page writable first.
///
/// # Safety
///
/// `addr` must point to mapped memory large enough for `bytes`, and nothing may be
/// executing the overwritten range during the call.
unsafe fn patch(addr: usize, bytes: &[u8]) -> Result<()> {
    unprotect(addr, bytes.len())?;

    (addr as *mut u8).copy_from(bytes.as_ptr(), bytes.len());

    Ok(())
}

/// A one-shot redirection of the game function at a fixed address.
///
/// Designed to live in a static: `new` is const, and `install` only writes the jump on
/// its first call. There is no way to obtain the original implementation - the routines
/// we hook are replaced outright.
pub struct Hook<FnType> {
    address: usize,
    installed: OnceCell<()>,
    _signature: PhantomData<FnType>,
}

// The OnceCell is the only state, and it serialises installation.
unsafe impl<FnType> Sync for Hook<FnType> {}

impl<FnType> Hook<FnType> {
    /// Creates a new hook for the function at `address`. This does not install the hook.
    pub const fn new(address: usize) -> Hook<FnType> {
        Hook {
            address,
            installed: OnceCell::new(),
            _signature: PhantomData,
        }
    }

    /// Replaces the target function's implementation with `replacement`.
    ///
    /// The first call writes and thereby commits the jump; later calls do nothing. An
    /// error means the target page could not be rewritten, in which case the game is
    /// still running its original code.
    pub fn install(&self, replacement: FnType) -> Result<()> {
        let replacement: usize = unsafe { std::mem::transmute_copy(&replacement) };

        self.installed
            .get_or_try_init(|| unsafe { patch(self.address, &jump_to(self.address, replacement)) })
            .map(|_| ())
    }
}

/// Reads the value held in a global cell of the game at a fixed address.
pub fn get_global<T: Copy>(address: usize) -> T {
    unsafe { *(address as *const T) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jump_encoding() {
        // 0x1000 + 5 + 0xffb == 0x2000.
        assert_eq!(jump_to(0x1000, 0x2000), [0xe9, 0xfb, 0x0f, 0x00, 0x00]);
    }

    #[test]
    fn jump_encoding_backwards() {
        // Jumping to the instruction's own start encodes -5.
        assert_eq!(jump_to(0x4000, 0x4000), [0xe9, 0xfb, 0xff, 0xff, 0xff]);
    }

    /// Decodes the jump at `addr` and returns where it lands.
    fn decode_jump(addr: usize) -> usize {
        let bytes = unsafe { std::slice::from_raw_parts(addr as *const u8, JUMP_LEN) };
        assert_eq!(bytes[0], 0xe9);

        let rel = i32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        (addr + JUMP_LEN).wrapping_add(rel as usize)
    }

    #[test]
    fn install_writes_jump_once() {
        // A page-sized buffer stands in for game code. The "functions" only need
        // addresses; nothing executes them.
        let mut code = vec![0x90u8; 4096].into_boxed_slice();
        let target = code.as_mut_ptr() as usize;

        let first = target + 0x40;
        let second = target + 0x80;

        let hook: Hook<usize> = Hook::new(target);

        hook.install(first).unwrap();
        assert_eq!(decode_jump(target), first);

        // A second install must not move an already-committed hook.
        hook.install(second).unwrap();
        assert_eq!(decode_jump(target), first);
    }
}
