//! SIGCHLD wakeup registration.
//!
//! A C signal handler cannot capture state, so the registered token is
//! published through a single atomic slot. The handler only posts the token;
//! reaping happens on the main thread once the relay's wait returns.

use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, Ordering};

use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::error::{Error, Result};

static REGISTERED: AtomicPtr<CancelToken> = AtomicPtr::new(ptr::null_mut());

extern "C" fn on_sigchld(_signal: libc::c_int) {
    let token = REGISTERED.load(Ordering::SeqCst);
    if !token.is_null() {
        // SAFETY: the pointer comes from an Arc held by the live
        // `ChildExitHook`, which clears the slot before releasing it.
        #[allow(unsafe_code)]
        unsafe {
            (*token).post();
        }
    }
}

/// Installs the SIGCHLD handler that posts `token` and ignores SIGPIPE.
///
/// Only one hook may exist per process. Dropping it restores the previous
/// dispositions.
pub struct ChildExitHook {
    token: Arc<CancelToken>,
    previous_chld: SigAction,
    previous_pipe: SigAction,
}

impl ChildExitHook {
    pub fn install(token: &Arc<CancelToken>) -> Result<Self> {
        let raw = Arc::as_ptr(token).cast_mut();
        REGISTERED
            .compare_exchange(ptr::null_mut(), raw, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| Error::AlreadyRegistered)?;

        let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
        let chld = SigAction::new(
            SigHandler::Handler(on_sigchld),
            SaFlags::SA_RESTART | SaFlags::SA_NOCLDSTOP,
            SigSet::empty(),
        );

        // SAFETY: the SIGPIPE action is SIG_IGN and `on_sigchld` only does an
        // atomic load, an atomic store and write(2).
        #[allow(unsafe_code)]
        let installed = unsafe {
            sigaction(Signal::SIGPIPE, &ignore)
                .map_err(|source| Error::Signal {
                    signal: Signal::SIGPIPE,
                    source,
                })
                .and_then(|previous_pipe| {
                    sigaction(Signal::SIGCHLD, &chld)
                        .map(|previous_chld| (previous_pipe, previous_chld))
                        .map_err(|source| Error::Signal {
                            signal: Signal::SIGCHLD,
                            source,
                        })
                })
        };

        match installed {
            Ok((previous_pipe, previous_chld)) => {
                debug!("SIGCHLD handler installed");
                Ok(Self {
                    token: Arc::clone(token),
                    previous_chld,
                    previous_pipe,
                })
            }
            Err(e) => {
                REGISTERED.store(ptr::null_mut(), Ordering::SeqCst);
                Err(e)
            }
        }
    }

    pub fn token(&self) -> &Arc<CancelToken> {
        &self.token
    }
}

impl Drop for ChildExitHook {
    fn drop(&mut self) {
        // Unpublish before the token can be released.
        REGISTERED.store(ptr::null_mut(), Ordering::SeqCst);
        // SAFETY: restoring the dispositions captured at install time.
        #[allow(unsafe_code)]
        unsafe {
            if let Err(e) = sigaction(Signal::SIGCHLD, &self.previous_chld) {
                warn!(error = %e, "Failed to restore SIGCHLD disposition");
            }
            if let Err(e) = sigaction(Signal::SIGPIPE, &self.previous_pipe) {
                warn!(error = %e, "Failed to restore SIGPIPE disposition");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::cancel::WaitOutcome;
    use std::process::Command;
    use std::sync::Mutex;

    // The hook is process-wide.
    static SERIAL: Mutex<()> = Mutex::new(());

    #[test]
    fn second_registration_is_rejected() {
        let _guard = SERIAL.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let first = Arc::new(CancelToken::new().unwrap());
        let second = Arc::new(CancelToken::new().unwrap());
        let hook = ChildExitHook::install(&first).unwrap();
        assert!(matches!(
            ChildExitHook::install(&second),
            Err(Error::AlreadyRegistered)
        ));
        drop(hook);
        let again = ChildExitHook::install(&second).unwrap();
        assert!(Arc::ptr_eq(again.token(), &second));
    }

    #[test]
    fn child_exit_posts_the_token() {
        let _guard = SERIAL.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let token = Arc::new(CancelToken::new().unwrap());
        let hook = ChildExitHook::install(&token).unwrap();
        let mut child = Command::new("/bin/sh").args(["-c", "exit 0"]).spawn().unwrap();
        assert_eq!(token.wait(&[]).unwrap(), WaitOutcome::Cancelled);
        assert!(token.is_cancelled());
        child.wait().unwrap();
        drop(hook);
    }

    #[test]
    fn dropped_hook_unpublishes_its_token() {
        let _guard = SERIAL.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let token = Arc::new(CancelToken::new().unwrap());
        let hook = ChildExitHook::install(&token).unwrap();
        drop(hook);
        assert!(REGISTERED.load(Ordering::SeqCst).is_null());
        assert_eq!(Arc::strong_count(&token), 1);

        let status = Command::new("/bin/sh").args(["-c", "exit 0"]).status().unwrap();
        assert!(status.success());
        assert!(!token.is_cancelled());
    }
}
