//! Real-time thread helpers: scheduler promotion and timer resolution.
//!
//! Both the virtual clock thread and the renderer thread register with the
//! system's pro-audio scheduling class. When that registration fails each
//! thread has its own fallback: the clock thread cannot miss its cadence
//! and goes time-critical, while the event-paced renderer settles for the
//! highest regular priority. The guards release everything on drop so a
//! panicking thread still restores system state.

use log::debug;

/// Priority applied when the multimedia scheduler rejects registration.
#[derive(Debug, Clone, Copy)]
pub enum FallbackPriority {
    /// For the clock thread; a late tick slips the whole cadence.
    TimeCritical,
    /// For the renderer; the endpoint event paces it anyway.
    Highest,
}

/// Scoped pro-audio scheduling registration for the current thread.
pub struct ProAudioGuard {
    #[cfg(windows)]
    task_handle: isize,
}

impl ProAudioGuard {
    /// Promote the calling thread. Infallible: when the multimedia
    /// scheduler rejects the registration the thread still gets the
    /// requested fallback priority.
    pub fn promote(fallback: FallbackPriority) -> Self {
        #[cfg(windows)]
        {
            use windows_sys::Win32::System::Threading::{
                AvSetMmThreadCharacteristicsW, GetCurrentThread, SetThreadPriority,
                THREAD_PRIORITY_HIGHEST, THREAD_PRIORITY_TIME_CRITICAL,
            };

            let task_name: Vec<u16> = "Pro Audio\0".encode_utf16().collect();
            let mut task_index: u32 = 0;
            let handle =
                unsafe { AvSetMmThreadCharacteristicsW(task_name.as_ptr(), &mut task_index) };

            if handle.is_null() {
                let priority = match fallback {
                    FallbackPriority::TimeCritical => THREAD_PRIORITY_TIME_CRITICAL,
                    FallbackPriority::Highest => THREAD_PRIORITY_HIGHEST,
                };
                debug!("MMCSS registration failed, using {fallback:?} priority");
                unsafe {
                    SetThreadPriority(GetCurrentThread(), priority);
                }
                Self { task_handle: 0 }
            } else {
                debug!("thread registered with Pro Audio class (task {task_index})");
                Self {
                    task_handle: handle as isize,
                }
            }
        }
        #[cfg(not(windows))]
        {
            debug!("pro-audio scheduling not available, {fallback:?} unused");
            Self {}
        }
    }
}

impl Drop for ProAudioGuard {
    fn drop(&mut self) {
        #[cfg(windows)]
        if self.task_handle != 0 {
            use windows_sys::Win32::System::Threading::AvRevertMmThreadCharacteristics;
            unsafe {
                AvRevertMmThreadCharacteristics(self.task_handle as *mut core::ffi::c_void);
            }
        }
    }
}

/// Scoped 1 ms system timer resolution. The virtual clock loop holds one
/// for its whole lifetime so short sleeps land where they should.
pub struct TimerResolutionGuard {
    #[cfg(windows)]
    active: bool,
}

impl TimerResolutionGuard {
    pub fn acquire() -> Self {
        #[cfg(windows)]
        {
            use windows_sys::Win32::Media::{timeBeginPeriod, TIMERR_NOERROR};
            let active = unsafe { timeBeginPeriod(1) } == TIMERR_NOERROR;
            if !active {
                debug!("timeBeginPeriod(1) rejected");
            }
            Self { active }
        }
        #[cfg(not(windows))]
        Self {}
    }
}

impl Drop for TimerResolutionGuard {
    fn drop(&mut self) {
        #[cfg(windows)]
        if self.active {
            use windows_sys::Win32::Media::timeEndPeriod;
            unsafe {
                timeEndPeriod(1);
            }
        }
    }
}
