//! Process-shared mutex + condition variable
//!
//! Lets a consumer sleep until the publisher announces a frame instead of
//! polling. It never protects slot data; the seqlock does that.
//!
//! The mutex is robust: if a process dies while holding it, the next locker
//! sees the owner-died state, marks the mutex consistent and carries on. The
//! primitive tracks this as a small state machine kept next to the mutex in
//! shared memory:
//!
//! ```text
//! Uncontended --lock--> Held --unlock--> Uncontended
//! Held --holder dies--> Abandoned --recover ok--> Held
//!                                  --recover failed--> Poisoned (terminal)
//! ```

use std::cell::UnsafeCell;
use std::io;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::{error, warn};

/// Observable state of the shared mutex
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockState {
    /// Nobody holds the mutex
    Uncontended = 0,
    /// Some process holds the mutex
    Held = 1,
    /// The last holder died; recovery is in progress
    Abandoned = 2,
    /// Recovery failed; the primitive refuses all further use
    Poisoned = 3,
}

impl LockState {
    fn from_raw(raw: u32) -> Self {
        match raw {
            0 => LockState::Uncontended,
            1 => LockState::Held,
            2 => LockState::Abandoned,
            _ => LockState::Poisoned,
        }
    }
}

/// Why a [`SignalGuard::wait_timeout`] returned
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Signalled, or woken spuriously
    Woken,
    /// The timeout elapsed
    TimedOut,
}

/// Mutex/condvar pair living in shared memory
#[repr(C)]
pub struct SharedSignal {
    state: AtomicU32,
    mutex: UnsafeCell<libc::pthread_mutex_t>,
    cond: UnsafeCell<libc::pthread_cond_t>,
}

// SAFETY: pthread objects initialized PTHREAD_PROCESS_SHARED may be used from
// any thread of any process mapping them
unsafe impl Send for SharedSignal {}
unsafe impl Sync for SharedSignal {}

fn check(rc: libc::c_int) -> io::Result<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(rc))
    }
}

fn poisoned() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "shared mutex is poisoned")
}

impl SharedSignal {
    /// Initialize the primitive in place as process-shared and robust.
    ///
    /// # Safety
    /// `ptr` must be valid, properly aligned, writable memory that no other
    /// thread or process is using yet. The primitive must never move after
    /// this call.
    pub unsafe fn init(ptr: *mut Self) -> io::Result<()> {
        std::ptr::addr_of_mut!((*ptr).state).write(AtomicU32::new(LockState::Uncontended as u32));

        let mut mattr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
        check(libc::pthread_mutexattr_init(mattr.as_mut_ptr()))?;
        let rc = Self::init_mutex(ptr, mattr.as_mut_ptr());
        libc::pthread_mutexattr_destroy(mattr.as_mut_ptr());
        rc?;

        let mut cattr = MaybeUninit::<libc::pthread_condattr_t>::uninit();
        check(libc::pthread_condattr_init(cattr.as_mut_ptr()))?;
        let rc = Self::init_cond(ptr, cattr.as_mut_ptr());
        libc::pthread_condattr_destroy(cattr.as_mut_ptr());
        rc
    }

    unsafe fn init_mutex(ptr: *mut Self, attr: *mut libc::pthread_mutexattr_t) -> io::Result<()> {
        check(libc::pthread_mutexattr_setpshared(attr, libc::PTHREAD_PROCESS_SHARED))?;
        check(libc::pthread_mutexattr_setrobust(attr, libc::PTHREAD_MUTEX_ROBUST))?;
        check(libc::pthread_mutex_init(
            UnsafeCell::raw_get(std::ptr::addr_of!((*ptr).mutex)),
            attr,
        ))
    }

    unsafe fn init_cond(ptr: *mut Self, attr: *mut libc::pthread_condattr_t) -> io::Result<()> {
        check(libc::pthread_condattr_setpshared(attr, libc::PTHREAD_PROCESS_SHARED))?;
        // Deadlines are computed on the monotonic clock
        check(libc::pthread_condattr_setclock(attr, libc::CLOCK_MONOTONIC))?;
        check(libc::pthread_cond_init(
            UnsafeCell::raw_get(std::ptr::addr_of!((*ptr).cond)),
            attr,
        ))
    }

    /// Current state as last recorded by any participant
    pub fn state(&self) -> LockState {
        LockState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: LockState) {
        self.state.store(state as u32, Ordering::Release);
    }

    /// Lock the mutex, recovering it if its previous holder died.
    ///
    /// Fails once the primitive is poisoned.
    pub fn lock(&self) -> io::Result<SignalGuard<'_>> {
        if self.state() == LockState::Poisoned {
            return Err(poisoned());
        }

        let rc = unsafe { libc::pthread_mutex_lock(self.mutex.get()) };
        let recovered = self.settle(rc)?;
        Ok(SignalGuard {
            signal: self,
            recovered,
        })
    }

    /// Turn the return code of a lock acquisition into a held mutex.
    ///
    /// Returns whether the mutex had to be recovered.
    fn settle(&self, rc: libc::c_int) -> io::Result<bool> {
        match rc {
            0 => {
                self.set_state(LockState::Held);
                Ok(false)
            }
            libc::EOWNERDEAD => {
                self.set_state(LockState::Abandoned);
                warn!("shared mutex holder died, recovering");
                let rc = unsafe { libc::pthread_mutex_consistent(self.mutex.get()) };
                if rc == 0 {
                    self.set_state(LockState::Held);
                    Ok(true)
                } else {
                    self.set_state(LockState::Poisoned);
                    // Unlocking without consistent leaves it permanently unrecoverable
                    unsafe {
                        libc::pthread_mutex_unlock(self.mutex.get());
                    }
                    let err = io::Error::from_raw_os_error(rc);
                    error!(error = %err, "shared mutex recovery failed");
                    Err(err)
                }
            }
            libc::ENOTRECOVERABLE => {
                self.set_state(LockState::Poisoned);
                error!("shared mutex is not recoverable");
                Err(poisoned())
            }
            other => Err(io::Error::from_raw_os_error(other)),
        }
    }

    /// Wake every waiter in every process
    pub fn notify_all(&self) {
        unsafe {
            libc::pthread_cond_broadcast(self.cond.get());
        }
    }
}

/// A held [`SharedSignal`] mutex; unlocks on drop
pub struct SignalGuard<'a> {
    signal: &'a SharedSignal,
    recovered: bool,
}

impl SignalGuard<'_> {
    /// Whether taking this guard required recovering an abandoned mutex
    pub fn recovered(&self) -> bool {
        self.recovered
    }

    /// Release the mutex and sleep until notified or `timeout` elapses.
    ///
    /// The mutex is held again when this returns, unless reacquiring it
    /// found an abandoned mutex that could not be recovered.
    pub fn wait_timeout(&mut self, timeout: Duration) -> io::Result<WaitOutcome> {
        let deadline = monotonic_deadline(timeout)?;

        self.signal.set_state(LockState::Uncontended);
        let rc = unsafe {
            libc::pthread_cond_timedwait(self.signal.cond.get(), self.signal.mutex.get(), &deadline)
        };

        match rc {
            0 => {
                self.signal.set_state(LockState::Held);
                Ok(WaitOutcome::Woken)
            }
            libc::ETIMEDOUT => {
                self.signal.set_state(LockState::Held);
                Ok(WaitOutcome::TimedOut)
            }
            other => {
                // Reacquired after the previous holder died, or a real failure
                self.recovered |= self.signal.settle(other)?;
                Ok(WaitOutcome::Woken)
            }
        }
    }
}

impl Drop for SignalGuard<'_> {
    fn drop(&mut self) {
        if self.signal.state() != LockState::Poisoned {
            self.signal.set_state(LockState::Uncontended);
        }
        unsafe {
            libc::pthread_mutex_unlock(self.signal.mutex.get());
        }
    }
}

fn monotonic_deadline(timeout: Duration) -> io::Result<libc::timespec> {
    let mut now = MaybeUninit::<libc::timespec>::uninit();
    if unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, now.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    let now = unsafe { now.assume_init() };

    let mut sec = now.tv_sec + timeout.as_secs() as libc::time_t;
    let mut nsec = now.tv_nsec + timeout.subsec_nanos() as libc::c_long;
    if nsec >= 1_000_000_000 {
        sec += 1;
        nsec -= 1_000_000_000;
    }

    Ok(libc::timespec {
        tv_sec: sec,
        tv_nsec: nsec,
    })
}
