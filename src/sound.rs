//! Replacement for the game's DirectSound play buffer setup.
//!
//! The original `Sound::Init` has a bug in its failure path: when the DirectSound buffer
//! creation call fails, it releases the buffer interface through its vtable without
//! checking that the interface pointer was ever written. A failed creation call leaves
//! that pointer unspecified, so the release dereferences null (or worse) and takes the
//! game down. The replacement here reproduces the original routine's observable
//! behaviour exactly, down to the log message, but only releases the interface when
//! there is actually one to release.

use std::ffi::c_void;
use std::ptr::NonNull;

use crate::{hook, targets};

/// Logged when the DirectSound buffer cannot be created. Byte-for-byte the message the
/// original routine passed to the game's logger.
const CREATE_FAILED: &[u8] = b"Error: Failed to create DirectSound play buffer\n";

/// A play buffer object as produced by the game's allocator.
///
/// Only the fields the setup routine touches are named; the rest of the block is opaque
/// to us and owned by the game's audio code.
#[repr(C)]
pub struct PlayBuffer {
    unknown: u32,

    /// The DirectSound buffer interface created for this object. Holds a valid interface
    /// pointer after a successful creation call, and garbage or null after a failed one.
    dsound_buffer: *mut c_void,

    /// Mix frequency, copied from the game's config before the creation call.
    frequency: u32,
}

// The game accesses these fields by hard-coded offset, so the layout is load-bearing.
#[cfg(target_pointer_width = "32")]
const _: () = {
    assert!(std::mem::offset_of!(PlayBuffer, dsound_buffer) == 4);
    assert!(std::mem::offset_of!(PlayBuffer, frequency) == 8);
};

/// The first three slots of a COM vtable. We only ever call `Release`.
#[repr(C)]
struct UnknownVtable {
    query_interface: *const c_void,
    add_ref: *const c_void,
    release: unsafe extern "system" fn(this: *mut c_void) -> u32,
}

/// A COM interface pointer that is known to be non-null.
///
/// Constructing one *is* the null check: `release` can only be reached through a value
/// that `from_raw` accepted, so the vtable of a null interface is never read. This is
/// the whole fix.
#[derive(Clone, Copy)]
struct ComHandle(NonNull<c_void>);

impl ComHandle {
    fn from_raw(ptr: *mut c_void) -> Option<ComHandle> {
        NonNull::new(ptr).map(ComHandle)
    }

    /// Calls `Release` through the object's vtable, dropping the game's reference. The
    /// object must be considered dead afterwards.
    ///
    /// # Safety
    ///
    /// The wrapped pointer must refer to a live COM object.
    unsafe fn release(self) {
        let vtable = *self.0.as_ptr().cast::<*const UnknownVtable>();
        ((*vtable).release)(self.0.as_ptr());
    }
}

/// The game routines the setup logic calls, collected so tests can substitute their own.
///
/// All three are plain cdecl functions in the game image. `create_buffer` receives the
/// address of the buffer's interface slot rather than its value; on failure it leaves
/// the slot in an unspecified state, which is why the failure path below trusts nothing
/// but null.
pub struct GameCalls {
    /// Allocates a play buffer object, or returns null when the game is out of memory.
    pub alloc_buffer: unsafe extern "C" fn() -> *mut PlayBuffer,

    /// Creates the DirectSound buffer for `buffer`, storing the interface pointer
    /// through `slot`. Negative return values mean failure.
    pub create_buffer: unsafe extern "C" fn(slot: *mut *mut c_void, buffer: *mut PlayBuffer) -> i32,

    /// Writes a diagnostic message to the game's log.
    pub log: unsafe extern "C" fn(message: *const u8, length: u32),
}

impl GameCalls {
    /// The real game routines, at their fixed addresses.
    fn game() -> GameCalls {
        unsafe {
            GameCalls {
                alloc_buffer: std::mem::transmute(targets::BUFFER_ALLOC),
                create_buffer: std::mem::transmute(targets::BUFFER_CREATE),
                log: std::mem::transmute(targets::GAME_LOG),
            }
        }
    }
}

/// Corrected play buffer setup.
///
/// Returns the new buffer on success, transferring ownership to the game. Returns null
/// when the subsystem is disabled, allocation fails, or buffer creation fails; in the
/// last case the partially-built buffer's interface is released (if there is one) and
/// the block itself is abandoned, exactly as the original routine left it.
///
/// # Safety
///
/// `calls` must hold functions honouring the contracts documented on [`GameCalls`].
pub unsafe fn setup_play_buffer(
    enabled: u8,
    frequency: u32,
    calls: &GameCalls,
) -> *mut PlayBuffer {
    // Audio can be disabled outright; nothing may be touched in that case.
    if enabled == 0 {
        return std::ptr::null_mut();
    }

    let buffer = (calls.alloc_buffer)();

    if buffer.is_null() {
        return std::ptr::null_mut();
    }

    (*buffer).frequency = frequency;

    let slot = std::ptr::addr_of_mut!((*buffer).dsound_buffer);
    let status = (calls.create_buffer)(slot, buffer);

    if status >= 0 {
        // The game owns the buffer from here on.
        return buffer;
    }

    (calls.log)(CREATE_FAILED.as_ptr(), CREATE_FAILED.len() as u32);

    // A failed creation call leaves the slot unspecified. Null is the one invalid state
    // we can detect, and it is the state that crashed the original routine.
    if let Some(interface) = ComHandle::from_raw(*slot) {
        interface.release();
    }

    *slot = std::ptr::null_mut();

    std::ptr::null_mut()
}

/// What runs at `Sound::Init` once the hook is installed.
///
/// Reads the same two globals the original read, at the same point: once, on entry,
/// before any other work. `extern "C"` on the 32-bit target gives the register
/// discipline the surrounding game code was compiled against (result in EAX, ESI/EDI
/// preserved).
extern "C" fn setup_hooked() -> *mut PlayBuffer {
    let enabled: u8 = hook::get_global(targets::SOUND_ENABLED);
    let frequency: u32 = hook::get_global(targets::MIX_FREQUENCY);

    unsafe { setup_play_buffer(enabled, frequency, &GameCalls::game()) }
}

static SETUP_HOOK: hook::Hook<extern "C" fn() -> *mut PlayBuffer> =
    hook::Hook::new(targets::SOUND_INIT);

pub fn init() {
    if let Err(err) = SETUP_HOOK.install(setup_hooked) {
        // Without the redirect the game keeps running its crashing setup routine, so
        // there is nothing useful left for this library to do.
        log::error!("failed to install sound setup hook: {err:?}");
        return;
    }

    log::info!("sound setup hook installed");
}
