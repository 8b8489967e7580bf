//! Real-time promotion of task threads
//!
//! Linux only: SCHED_FIFO through `sched_setscheduler` and CPU pinning through `core_affinity`.
//! Everything here applies to the calling thread.

use crate::config::RealtimeConfig;
use crate::error::{KestrelError, KestrelResult};

const FIFO_PRIORITIES: std::ops::RangeInclusive<i32> = 1..=99;

/// Scheduling classes a task thread moves between
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Policy {
    Fifo(i32),
    TimeSharing,
}

impl Policy {
    #[cfg(target_os = "linux")]
    fn apply(self) -> std::io::Result<()> {
        let (policy, sched_priority) = match self {
            Policy::Fifo(priority) => (libc::SCHED_FIFO, priority),
            Policy::TimeSharing => (libc::SCHED_OTHER, 0),
        };
        let param = libc::sched_param { sched_priority };
        // pid 0 targets the calling thread
        let rc = unsafe { libc::sched_setscheduler(0, policy, &param) };
        if rc == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn apply(self) -> std::io::Result<()> {
        match self {
            Policy::Fifo(_) => Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "SCHED_FIFO needs Linux",
            )),
            Policy::TimeSharing => Ok(()),
        }
    }
}

/// Switch the calling thread to SCHED_FIFO at `priority`
pub fn set_realtime_priority(priority: i32) -> KestrelResult<()> {
    if !FIFO_PRIORITIES.contains(&priority) {
        return Err(KestrelError::config(format!(
            "real-time priority {} outside {:?}",
            priority, FIFO_PRIORITIES
        )));
    }
    Policy::Fifo(priority).apply().map_err(|err| match err.kind() {
        std::io::ErrorKind::Unsupported => KestrelError::Unsupported(err.to_string()),
        std::io::ErrorKind::PermissionDenied => KestrelError::Internal(format!(
            "SCHED_FIFO {} refused ({}), the process lacks CAP_SYS_NICE or an rtprio limit",
            priority, err
        )),
        _ => KestrelError::Internal(format!("SCHED_FIFO {} refused: {}", priority, err)),
    })
}

/// Return the calling thread to the default time-sharing policy
pub fn clear_realtime_priority() -> KestrelResult<()> {
    Policy::TimeSharing
        .apply()
        .map_err(|err| KestrelError::Internal(format!("SCHED_OTHER refused: {}", err)))
}

/// Pin the calling thread to a CPU core
pub fn pin_to_cpu(cpu_id: usize) -> KestrelResult<()> {
    let cores = core_affinity::get_core_ids()
        .ok_or_else(|| KestrelError::Unsupported("CPU affinity is not available".to_string()))?;
    let core = cores
        .into_iter()
        .find(|core| core.id == cpu_id)
        .ok_or_else(|| KestrelError::config(format!("CPU core {} does not exist", cpu_id)))?;
    if core_affinity::set_for_current(core) {
        Ok(())
    } else {
        Err(KestrelError::Internal(format!(
            "Failed to set CPU affinity to core {}",
            cpu_id
        )))
    }
}

/// Apply `config` to the calling thread. Failures are logged; the task keeps running.
/// Returns true if the priority was raised.
pub(crate) fn promote(task: &str, config: &RealtimeConfig) -> bool {
    if let Some(cpu) = config.cpu {
        match pin_to_cpu(cpu) {
            Ok(()) => log::info!("Task '{}' pinned to CPU core {}", task, cpu),
            Err(e) => log::warn!("Task '{}': {}", task, e),
        }
    }
    match set_realtime_priority(config.priority) {
        Ok(()) => {
            log::info!(
                "Task '{}' running with real-time priority {} (SCHED_FIFO)",
                task,
                config.priority
            );
            true
        }
        Err(e) => {
            log::warn!("Task '{}' stays at normal priority: {}", task, e);
            false
        }
    }
}

pub(crate) fn demote(task: &str) {
    match clear_realtime_priority() {
        Ok(()) => log::info!("Task '{}' returned to normal scheduling", task),
        Err(e) => log::warn!("Task '{}': {}", task, e),
    }
}
