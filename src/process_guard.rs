//! Process lifecycle management for spawned commands
//!
//! Every command started by the runner becomes the leader of its own process
//! group and carries a parent-death signal. That gives two guarantees:
//!
//! - A timed-out command can be torn down together with anything it forked,
//!   by signalling the whole group.
//! - If the installer itself is interrupted, the signal thread installed by
//!   `install_signal_handlers` terminates every group still registered, so no
//!   destructive command keeps running unattended.

use nix::errno::Errno;
use nix::libc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashSet;
use std::sync::{Mutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

static CHILD_REGISTRY: OnceLock<Mutex<ChildRegistry>> = OnceLock::new();

/// Process groups of commands that are currently running.
#[derive(Debug, Default)]
pub struct ChildRegistry {
    groups: HashSet<u32>,
}

impl ChildRegistry {
    /// The process-wide registry used by the runner and the signal thread.
    pub fn global() -> &'static Mutex<ChildRegistry> {
        CHILD_REGISTRY.get_or_init(|| Mutex::new(ChildRegistry::default()))
    }

    pub fn register(&mut self, pgid: u32) {
        self.groups.insert(pgid);
        debug!("Tracking process group {}", pgid);
    }

    pub fn unregister(&mut self, pgid: u32) {
        self.groups.remove(&pgid);
        debug!("No longer tracking process group {}", pgid);
    }

    pub fn count(&self) -> usize {
        self.groups.len()
    }

    pub fn contains(&self, pgid: u32) -> bool {
        self.groups.contains(&pgid)
    }

    /// SIGTERM every tracked group, wait up to `grace`, then SIGKILL the
    /// survivors. The registry is empty afterwards.
    pub fn terminate_all(&mut self, grace: Duration) {
        if self.groups.is_empty() {
            return;
        }
        info!("Terminating {} running command(s)", self.groups.len());

        let groups: Vec<u32> = self.groups.drain().collect();
        for &pgid in &groups {
            if let Err(e) = signal_group(pgid, Signal::SIGTERM) {
                debug!("SIGTERM to process group {} failed: {}", pgid, e);
            }
        }

        let start = Instant::now();
        while start.elapsed() < grace && groups.iter().any(|&pgid| group_exists(pgid)) {
            std::thread::sleep(Duration::from_millis(50));
        }

        // A dead leader says nothing about the rest of its group.
        for &pgid in &groups {
            match signal_group(pgid, Signal::SIGKILL) {
                Ok(()) => warn!("Process group {} outlived SIGTERM, sent SIGKILL", pgid),
                Err(Errno::ESRCH) => {}
                Err(e) => debug!("SIGKILL to process group {} failed: {}", pgid, e),
            }
        }
    }
}

/// True while any process, zombies included, remains in group `pgid`.
fn group_exists(pgid: u32) -> bool {
    signal::killpg(Pid::from_raw(pgid as i32), None).is_ok()
}

/// RAII registration of a running command's process group.
#[derive(Debug)]
pub struct TrackedChild {
    pgid: u32,
}

impl TrackedChild {
    pub fn new(pgid: u32) -> Self {
        lock_registry().register(pgid);
        Self { pgid }
    }
}

impl Drop for TrackedChild {
    fn drop(&mut self) {
        lock_registry().unregister(self.pgid);
    }
}

fn lock_registry() -> std::sync::MutexGuard<'static, ChildRegistry> {
    ChildRegistry::global()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

/// Send `signal` to every process in group `pgid`.
pub fn signal_group(pgid: u32, signal: Signal) -> Result<(), Errno> {
    signal::killpg(Pid::from_raw(pgid as i32), signal)
}

/// True while `pid` exists and is neither a zombie nor dead.
pub fn is_process_alive(pid: u32) -> bool {
    if signal::kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }
    // Third field of /proc/<pid>/stat is the state letter.
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().next())
            .is_none_or(|state| !matches!(state, "Z" | "X")),
        Err(_) => true,
    }
}

/// Terminate tracked commands when the installer receives SIGINT, SIGTERM
/// or SIGHUP, then exit with `128 + signal`. Call once at startup.
pub fn install_signal_handlers() -> std::io::Result<()> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;
    std::thread::Builder::new()
        .name("signal-guard".to_string())
        .spawn(move || {
            if let Some(sig) = signals.forever().next() {
                info!("Received signal {}, stopping running commands", sig);
                lock_registry().terminate_all(Duration::from_secs(3));
                std::process::exit(128 + sig);
            }
        })?;
    Ok(())
}

/// Extension trait for `std::process::Command` to isolate a child in its
/// own process group.
pub trait CommandProcessGroup {
    fn in_new_process_group(&mut self) -> &mut Self;
}

impl CommandProcessGroup for std::process::Command {
    fn in_new_process_group(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;

        self.process_group(0);
        // SAFETY: prctl is async-signal-safe and touches no Rust state.
        // PDEATHSIG fires when the spawning thread exits; the runner always
        // waits for its child on that same thread.
        unsafe {
            self.pre_exec(|| {
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    /// Reap `child` within `timeout`; true if it exited.
    fn reaped_within(child: &mut std::process::Child, timeout: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if let Ok(Some(_)) = child.try_wait() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_registry_register_unregister() {
        let mut registry = ChildRegistry::default();
        registry.register(1234);
        registry.register(5678);
        assert_eq!(registry.count(), 2);
        assert!(registry.contains(1234));

        registry.unregister(1234);
        assert_eq!(registry.count(), 1);
        assert!(!registry.contains(1234));
    }

    #[test]
    fn test_tracked_child_unregisters_on_drop() {
        let pgid = 4_000_001;
        {
            let _tracked = TrackedChild::new(pgid);
            assert!(lock_registry().contains(pgid));
        }
        assert!(!lock_registry().contains(pgid));
    }

    #[test]
    fn test_terminate_all_kills_process_group() {
        let mut child = Command::new("sh")
            .args(["-c", "sleep 60 & wait"])
            .in_new_process_group()
            .spawn()
            .expect("spawn sh");
        let pgid = child.id();

        let mut registry = ChildRegistry::default();
        registry.register(pgid);
        std::thread::sleep(Duration::from_millis(50));
        registry.terminate_all(Duration::from_millis(500));

        assert_eq!(registry.count(), 0);
        assert!(reaped_within(&mut child, Duration::from_secs(2)));
    }

    #[test]
    fn test_terminate_all_kills_members_ignoring_sigterm() {
        use std::io::{BufRead, BufReader};
        use std::process::Stdio;

        let mut child = Command::new("sh")
            .args(["-c", "(trap '' TERM; exec sleep 60) & echo $!; wait"])
            .stdout(Stdio::piped())
            .in_new_process_group()
            .spawn()
            .expect("spawn sh");
        let mut line = String::new();
        BufReader::new(child.stdout.take().unwrap())
            .read_line(&mut line)
            .unwrap();
        let member: u32 = line.trim().parse().unwrap();

        let mut registry = ChildRegistry::default();
        registry.register(child.id());
        std::thread::sleep(Duration::from_millis(50));
        registry.terminate_all(Duration::from_millis(300));

        assert!(reaped_within(&mut child, Duration::from_secs(2)));
        let start = Instant::now();
        while is_process_alive(member) && start.elapsed() < Duration::from_secs(2) {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(!is_process_alive(member), "member {} survived", member);
    }

    #[test]
    fn test_terminate_all_on_empty_registry() {
        let mut registry = ChildRegistry::default();
        registry.terminate_all(Duration::from_millis(10));
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_signal_group_nonexistent() {
        assert!(signal_group(3_999_999, Signal::SIGTERM).is_err());
    }

    #[test]
    fn test_is_process_alive() {
        assert!(is_process_alive(std::process::id()));
        assert!(!is_process_alive(3_999_999));
    }

    #[test]
    fn test_new_process_group_leader() {
        let mut child = Command::new("sleep")
            .arg("5")
            .in_new_process_group()
            .spawn()
            .expect("spawn sleep");
        let pid = Pid::from_raw(child.id() as i32);
        assert_eq!(nix::unistd::getpgid(Some(pid)), Ok(pid));
        let _ = child.kill();
        let _ = child.wait();
    }
}
