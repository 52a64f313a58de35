use std::sync::atomic::AtomicBool;
#[cfg(unix)]
use std::sync::atomic::Ordering;

use dbvault_core::cancel::CancelToken;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// Route SIGINT and SIGTERM into the shared shutdown flag.
///
/// Running dumps and restores see the flag through their [`CancelToken`],
/// kill their child process and leave a failed record. A second signal
/// gets the default disposition and ends the process at once.
pub(crate) fn install_signal_handlers() {
    #[cfg(unix)]
    for sig in [libc::SIGINT, libc::SIGTERM] {
        // Safety: the handler only touches an atomic and the signal disposition.
        unsafe {
            libc::signal(sig, on_shutdown_signal as *const () as libc::sighandler_t);
        }
    }
}

/// Token for one command, cancelled once a shutdown signal arrives.
pub(crate) fn cancel_token() -> CancelToken {
    CancelToken::linked(&SHUTDOWN)
}

#[cfg(unix)]
extern "C" fn on_shutdown_signal(sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
    unsafe {
        libc::signal(sig, libc::SIG_DFL);
    }
}
