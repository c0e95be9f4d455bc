//! Ties this process's lifetime to another process

use std::thread::{self, JoinHandle};
use std::time::Duration;
use sysinfo::{Pid, System};

use crate::constants::LIFETIME_POLL_INTERVAL;
use crate::error::{Error, Result};

/// Whether process `pid` currently exists
pub fn process_exists(system: &mut System, pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    system.refresh_process(pid);
    system.process(pid).is_some()
}

/// Poll every `interval` until `pid` is gone
pub fn wait_for_exit(pid: u32, interval: Duration) {
    let mut system = System::new();
    while process_exists(&mut system, pid) {
        thread::sleep(interval);
    }
}

/// Spawn a watcher that exits this process with status 0 once `pid` is
/// gone. The watcher shares no state with the pipeline.
pub fn bind_to_process(pid: u32) -> Result<JoinHandle<()>> {
    let mut system = System::new();
    if !process_exists(&mut system, pid) {
        tracing::warn!("Lifetime process {} is not running", pid);
    }

    thread::Builder::new()
        .name("lifetime".into())
        .spawn(move || {
            wait_for_exit(pid, LIFETIME_POLL_INTERVAL);
            tracing::info!("Lifetime process {} exited, shutting down", pid);
            std::process::exit(0);
        })
        .map_err(Error::Io)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn test_current_process_exists() {
        let mut system = System::new();
        assert!(process_exists(&mut system, std::process::id()));
    }

    #[test]
    #[cfg(unix)]
    fn test_wait_for_exit_returns_after_child_exits() {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        wait_for_exit(pid, Duration::from_millis(10));
    }
}
