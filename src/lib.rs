//! Sets up the patch when the library is loaded into the game.

use ctor::ctor;

mod hook;
mod logging;
mod sound;

/// Fixed addresses inside the game binary. The game ships without ASLR, so these are
/// absolute.
mod targets {
    #![allow(clippy::unreadable_literal)]

    /// `Sound::Init`, the routine we replace.
    pub const SOUND_INIT: usize = 0x463a80;

    /// Byte that enables the DirectSound subsystem. Zero means audio is off.
    pub const SOUND_ENABLED: usize = 0x1aa4908;

    /// Mix frequency copied into every new play buffer.
    pub const MIX_FREQUENCY: usize = 0x79b174;

    /// Allocates a raw play buffer object.
    pub const BUFFER_ALLOC: usize = 0x454e40;

    /// Creates the DirectSound buffer for a play buffer object.
    pub const BUFFER_CREATE: usize = 0x6015d0;

    /// The game's own logging routine.
    pub const GAME_LOG: usize = 0x402500;
}

#[ctor]
fn load() {
    // Load the logging system before everything else so we can log from the installer.
    logging::init();

    log::info!(
        "dsound-fix {} loaded, installing sound hook",
        env!("CARGO_PKG_VERSION")
    );

    sound::init();
}
