//! Signalling whole process groups.
//!
//! Both backends start the server as the leader of a process group of its
//! own. Anything the server launches (a launcher's `bedrock_server` child,
//! helper scripts) stays in that group, so a session only counts as dead
//! once the whole group is gone.
use crate::error::{Error, Result};
use std::time::Duration;
use tokio::time::Instant;

const GROUP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long a SIGKILLed group may take to disappear.
pub(crate) const GROUP_EXIT_TIMEOUT: Duration = Duration::from_secs(5);

#[cfg(unix)]
mod imp {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    fn group(pgid: u32) -> Option<Pid> {
        // 0 and 1 would address our own group or init.
        i32::try_from(pgid)
            .ok()
            .filter(|raw| *raw > 1)
            .map(Pid::from_raw)
    }

    pub(super) fn exists(pgid: u32) -> bool {
        let Some(pid) = group(pgid) else {
            return false;
        };
        #[cfg(target_os = "linux")]
        if let Some(live) = procfs::has_live_member(pgid) {
            return live;
        }
        !matches!(killpg(pid, None::<Signal>), Err(Errno::ESRCH))
    }

    pub(super) fn kill(pgid: u32) -> std::io::Result<()> {
        let Some(pid) = group(pgid) else {
            return Ok(());
        };
        match killpg(pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(errno.into()),
        }
    }

    /// Group membership from `/proc`, ignoring zombies that only wait to be
    /// reaped by their new parent.
    #[cfg(target_os = "linux")]
    mod procfs {
        use std::fs;

        pub(super) fn has_live_member(pgid: u32) -> Option<bool> {
            let entries = fs::read_dir("/proc").ok()?;
            let live = entries
                .filter_map(|entry| entry.ok())
                .filter(|entry| {
                    entry
                        .file_name()
                        .to_str()
                        .is_some_and(|name| name.bytes().all(|b| b.is_ascii_digit()))
                })
                .filter_map(|entry| fs::read_to_string(entry.path().join("stat")).ok())
                .filter_map(|stat| parse_stat(&stat))
                .any(|(state, group)| group == pgid && state != 'Z');
            Some(live)
        }

        /// State and process group from a `/proc/<pid>/stat` line.
        pub(super) fn parse_stat(stat: &str) -> Option<(char, u32)> {
            // The command name is parenthesised and may itself hold spaces.
            let rest = stat.get(stat.rfind(')')? + 1..)?;
            let mut fields = rest.split_whitespace();
            let state = fields.next()?.chars().next()?;
            let _ppid = fields.next()?;
            let group = fields.next()?.parse().ok()?;
            Some((state, group))
        }

    }
}

#[cfg(not(unix))]
mod imp {
    pub(super) fn exists(_pgid: u32) -> bool {
        false
    }

    pub(super) fn kill(_pgid: u32) -> std::io::Result<()> {
        Ok(())
    }
}

/// Whether any process of group `pgid` is still running.
pub(crate) fn group_exists(pgid: u32) -> bool {
    imp::exists(pgid)
}

/// SIGKILL every process of group `pgid`. A group that is already gone is
/// not an error.
pub(crate) fn kill_group(pgid: u32) -> Result<()> {
    imp::kill(pgid).map_err(|e| {
        Error::SpawnFailed(format!("Failed to kill process group {}: {}", pgid, e))
    })
}

/// Wait until group `pgid` has no running member, up to `timeout`.
pub(crate) async fn wait_group_gone(pgid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !group_exists(pgid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(GROUP_POLL_INTERVAL).await;
    }
}

/// Kill group `pgid` and return once it is confirmed gone.
pub(crate) async fn kill_group_and_wait(pgid: u32) -> Result<()> {
    kill_group(pgid)?;
    if wait_group_gone(pgid, GROUP_EXIT_TIMEOUT).await {
        Ok(())
    } else {
        Err(Error::SpawnFailed(format!(
            "process group {} still alive after SIGKILL",
            pgid
        )))
    }
}
