//! Process liveness checks for stale lock detection.

/// Whether a process with `pid` exists on this machine.
///
/// Sends signal 0; a permission error still proves the process exists.
#[cfg(unix)]
pub fn is_process_alive(pid: i32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    if pid <= 0 {
        return false;
    }
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Without a portable liveness check every holder is presumed alive; only the age
/// ceiling reclaims its lock.
#[cfg(not(unix))]
pub fn is_process_alive(_pid: i32) -> bool {
    true
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_current_process_is_alive() {
        assert!(is_process_alive(std::process::id() as i32));
    }

    #[test]
    fn test_nonexistent_pid_is_dead() {
        assert!(!is_process_alive(i32::MAX));
        assert!(!is_process_alive(0));
        assert!(!is_process_alive(-1));
    }
}
