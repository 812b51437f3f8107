//! Process-group signalling.
//!
//! The child is spawned as the leader of its own process group, so its
//! pid doubles as the group id and a signal sent to the group reaches
//! everything the shell forked.

#[cfg(unix)]
mod imp {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;
    use tracing::debug;

    fn send(pgid: u32, signal: Option<Signal>) -> bool {
        let Ok(raw) = i32::try_from(pgid) else {
            return false;
        };
        match killpg(Pid::from_raw(raw), signal) {
            Ok(()) => true,
            Err(Errno::ESRCH) => false,
            Err(e) => {
                debug!("killpg({pgid}, {signal:?}) failed: {e}");
                false
            }
        }
    }

    /// Asks every member of the group to exit (SIGTERM).
    pub fn terminate(pgid: u32) -> bool {
        send(pgid, Some(Signal::SIGTERM))
    }

    /// Kills every member of the group (SIGKILL).
    pub fn kill(pgid: u32) -> bool {
        send(pgid, Some(Signal::SIGKILL))
    }

    /// True while any process (zombies included) remains in the group.
    pub fn is_alive(pgid: u32) -> bool {
        send(pgid, None)
    }
}

#[cfg(not(unix))]
mod imp {
    // No process groups: the session falls back to killing the leader.
    pub fn terminate(_pgid: u32) -> bool {
        false
    }

    pub fn kill(_pgid: u32) -> bool {
        false
    }

    pub fn is_alive(_pgid: u32) -> bool {
        false
    }
}

pub use imp::{is_alive, kill, terminate};
