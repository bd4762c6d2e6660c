//! SIGINT/SIGTERM handling.
//!
//! The handler only flips an atomic flag; the event loop polls it.

use std::sync::atomic::{AtomicBool, Ordering};

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn request_shutdown(_signal: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

/// Installs the handlers and returns the flag they set.
pub fn install() -> Result<&'static AtomicBool, String> {
    let handler = request_shutdown as extern "C" fn(libc::c_int) as libc::sighandler_t;
    for (signal, name) in [(libc::SIGINT, "SIGINT"), (libc::SIGTERM, "SIGTERM")] {
        // SAFETY: the handler only performs an atomic store, which is
        // async-signal-safe.
        let previous = unsafe { libc::signal(signal, handler) };
        if previous == libc::SIG_ERR {
            return Err(format!(
                "Failed to install {} handler: {}",
                name,
                std::io::Error::last_os_error()
            ));
        }
    }
    Ok(&SHUTDOWN_REQUESTED)
}
