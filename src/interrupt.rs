use std::sync::atomic::{AtomicBool, Ordering};

// Signal handling logic.
//
// The interesting interrupt signals are SIGHUP, SIGTERM, and SIGINT.  SIGHUP and SIGTERM are
// sent by the OS or by job control (and will often be followed by SIGKILL if not honored
// within some reasonable time); SIGINT is sent from the keyboard, which matters for an
// interactive runner.  On interrupt the scheduler loop unwinds cleanly and running children
// are left to be adopted by the OS.
//
// Call handle_interruptions() to establish handlers, then is_interrupted() to check whether
// signals have been received.

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn expsched_signal_handler(_: libc::c_int) {
    INTERRUPTED.store(true, Ordering::Relaxed);
}

pub fn handle_interruptions() {
    unsafe {
        let nomask: libc::sigset_t = std::mem::zeroed();
        let action = libc::sigaction {
            sa_sigaction: expsched_signal_handler as usize,
            sa_mask: nomask,
            sa_flags: 0,
            sa_restorer: None,
        };
        libc::sigaction(libc::SIGTERM, &action, std::ptr::null_mut());
        libc::sigaction(libc::SIGHUP, &action, std::ptr::null_mut());
        libc::sigaction(libc::SIGINT, &action, std::ptr::null_mut());
    }
}

pub fn is_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}
