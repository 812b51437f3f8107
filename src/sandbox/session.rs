use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use super::{signal, RunnerConfig, SandboxError};

/// File-name prefix shared by every temp artifact the runner creates.
/// The orphan sweeper keys on it.
pub const ARTIFACT_PREFIX: &str = "bash_mcp_";

/// How often the grace-period loop checks whether the group is gone.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// One running (or about to run) command and everything it owns:
/// three temp files and, once spawned, the child and its process group.
///
/// [`cleanup`](Self::cleanup) kills whatever is left of the group and
/// deletes the files. It runs once; later calls (including the one from
/// `Drop`) are no-ops, so a cancelled or panicking invocation still
/// releases its resources.
pub struct SandboxSession {
    id: String,
    stdout_path: PathBuf,
    stderr_path: PathBuf,
    script_path: PathBuf,
    /// Capture handles, handed to the child at spawn.
    capture: Option<(std::fs::File, std::fs::File)>,
    child: Option<Child>,
    pgid: Option<u32>,
    exited: bool,
    cleaned: bool,
}

impl SandboxSession {
    /// Creates the stdout/stderr capture files and the wrapper script.
    ///
    /// On failure every file created so far is removed before returning.
    pub async fn allocate(
        temp_dir: &Path,
        cwd: &Path,
        command: &str,
    ) -> Result<Self, SandboxError> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let artifact = |kind: &str| temp_dir.join(format!("{ARTIFACT_PREFIX}{id}.{kind}"));

        let mut session = Self {
            stdout_path: artifact("stdout"),
            stderr_path: artifact("stderr"),
            script_path: artifact("sh"),
            id,
            capture: None,
            child: None,
            pgid: None,
            exited: false,
            cleaned: false,
        };

        if let Err(e) = session.create_artifacts(cwd, command).await {
            session.cleanup();
            return Err(SandboxError::Resource(e));
        }

        debug!("Session {} allocated in {}", session.id, temp_dir.display());
        Ok(session)
    }

    async fn create_artifacts(&mut self, cwd: &Path, command: &str) -> io::Result<()> {
        let stdout = create_new(&self.stdout_path).await?;
        let stderr = create_new(&self.stderr_path).await?;
        self.capture = Some((stdout.into_std().await, stderr.into_std().await));

        let mut script = create_new(&self.script_path).await?;
        let body = wrapper_script(&self.stdout_path, &self.stderr_path, cwd, command);
        script.write_all(body.as_bytes()).await?;
        script.flush().await?;
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stdout_path(&self) -> &Path {
        &self.stdout_path
    }

    pub fn stderr_path(&self) -> &Path {
        &self.stderr_path
    }

    #[cfg(test)]
    pub fn script_path(&self) -> &Path {
        &self.script_path
    }

    /// Process-group id of the running child, if spawned.
    #[cfg(test)]
    pub fn pgid(&self) -> Option<u32> {
        self.pgid
    }

    /// Starts the wrapper script under a login shell, as the leader of a
    /// new process group. stdin is closed and stdout/stderr go to the
    /// capture files, so nothing the child does touches the server's own
    /// stdio (the MCP transport).
    pub fn spawn(&mut self, cwd: &Path, config: &RunnerConfig) -> Result<(), SandboxError> {
        let (stdout, stderr) = self.capture.take().ok_or_else(|| {
            SandboxError::Spawn(io::Error::new(
                io::ErrorKind::Other,
                "capture files already consumed",
            ))
        })?;

        let mut cmd = Command::new(&config.shell);
        cmd.arg("-l");
        if config.interactive {
            cmd.arg("-i");
        }
        cmd.arg(&self.script_path)
            .current_dir(cwd)
            .env("TERM", "dumb")
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn().map_err(SandboxError::Spawn)?;
        self.pgid = child.id();
        debug!("Session {} spawned (pgid {:?})", self.id, self.pgid);
        self.child = Some(child);
        Ok(())
    }

    /// Waits for the child to exit. `Ok(None)` means the deadline passed
    /// first; the child is still running.
    pub async fn wait(&mut self, timeout: Option<Duration>) -> io::Result<Option<ExitStatus>> {
        let child = self
            .child
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "no child to wait for"))?;

        let status = match timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => status?,
                Err(_) => return Ok(None),
            },
            None => child.wait().await?,
        };

        self.exited = true;
        Ok(Some(status))
    }

    /// SIGTERM to the whole group, up to `grace` for it to wind down, then
    /// SIGKILL to whatever remains and reap the leader.
    pub async fn terminate(&mut self, grace: Duration) {
        let Some(pgid) = self.pgid else {
            return;
        };

        debug!("Session {}: sending SIGTERM to group {pgid}", self.id);
        signal::terminate(pgid);

        let deadline = tokio::time::Instant::now() + grace;
        while tokio::time::Instant::now() < deadline {
            self.reap_if_exited();
            if self.exited && !signal::is_alive(pgid) {
                debug!("Session {}: group {pgid} exited after SIGTERM", self.id);
                return;
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }

        warn!("Session {}: group {pgid} still alive after {grace:?}, sending SIGKILL", self.id);
        self.force_kill();

        if let Some(child) = self.child.as_mut() {
            if tokio::time::timeout(grace, child.wait()).await.is_ok() {
                self.exited = true;
            }
        }
    }

    /// Best-effort immediate kill of the group and the leader.
    ///
    /// Once the leader has been reaped the group id is only signalled while
    /// members remain: an empty group's id can be reused by the kernel.
    pub fn force_kill(&mut self) {
        if let Some(pgid) = self.pgid {
            if group_needs_kill(self.exited, || signal::is_alive(pgid)) {
                signal::kill(pgid);
            }
        }
        if let Some(child) = self.child.as_mut() {
            let _ = child.start_kill();
        }
    }

    fn reap_if_exited(&mut self) {
        if self.exited {
            return;
        }
        if let Some(child) = self.child.as_mut() {
            if let Ok(Some(_)) = child.try_wait() {
                self.exited = true;
            }
        }
    }

    /// Kills anything still running in the group and deletes the three
    /// temp files. Missing files are ignored. Runs at most once.
    pub fn cleanup(&mut self) {
        if self.cleaned {
            return;
        }
        self.cleaned = true;

        // Also catches background jobs that outlived a leader which exited
        self.reap_if_exited();
        self.force_kill();

        self.capture = None;
        for path in [&self.stdout_path, &self.stderr_path, &self.script_path] {
            remove_artifact(path);
        }
        debug!("Session {} cleaned up", self.id);
    }
}

impl Drop for SandboxSession {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Whether the group still has to be SIGKILLed. While the leader is
/// unreaped its pid pins the group id; after that only live members do.
fn group_needs_kill(leader_exited: bool, group_alive: impl FnOnce() -> bool) -> bool {
    !leader_exited || group_alive()
}

/// Script run by the shell:
///
/// - `set +m` keeps every job in the leader's process group. An
///   interactive bash turns job monitoring on even without a terminal and
///   would otherwise move each job into a group of its own, out of reach
///   of the group signals.
/// - The captures are re-opened (truncating) so that anything the shell
///   and its profile printed during startup is dropped.
/// - `cd` into the working directory, then the command exactly as given.
fn wrapper_script(stdout: &Path, stderr: &Path, cwd: &Path, command: &str) -> String {
    format!(
        "set +m\nexec >|{} 2>|{} || exit 1\ncd {} || exit 1\n{command}\n",
        shell_quote(&stdout.to_string_lossy()),
        shell_quote(&stderr.to_string_lossy()),
        shell_quote(&cwd.to_string_lossy())
    )
}

/// Single-quotes `s` for POSIX shells.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

async fn create_new(path: &Path) -> io::Result<tokio::fs::File> {
    tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
}

fn remove_artifact(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {}: {e}", path.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RunnerConfig {
        RunnerConfig {
            shell: PathBuf::from("/bin/sh"),
            interactive: false,
            temp_dir: std::env::temp_dir(),
            grace_period: Duration::from_millis(500),
        }
    }

    // ── script generation ───────────────────────────────

    #[test]
    fn test_wrapper_script_layout() {
        let script = wrapper_script(
            Path::new("/tmp/x.stdout"),
            Path::new("/tmp/x.stderr"),
            Path::new("/tmp/work"),
            "ls -la",
        );
        assert_eq!(
            script,
            "set +m\n\
             exec >|'/tmp/x.stdout' 2>|'/tmp/x.stderr' || exit 1\n\
             cd '/tmp/work' || exit 1\n\
             ls -la\n"
        );
    }

    #[test]
    fn test_wrapper_script_disables_job_monitoring_first() {
        let script = wrapper_script(Path::new("/o"), Path::new("/e"), Path::new("/"), "true");
        assert_eq!(script.lines().next(), Some("set +m"));
    }

    // ── group kill decision ─────────────────────────────

    #[test]
    fn test_group_killed_while_leader_unreaped() {
        // The liveness probe is not even consulted
        assert!(group_needs_kill(false, || panic!("probed a pinned group")));
    }

    #[test]
    fn test_reaped_leader_group_killed_only_if_members_remain() {
        assert!(group_needs_kill(true, || true));
        assert!(!group_needs_kill(true, || false));
    }

    #[test]
    fn test_shell_quote_escapes_single_quote() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote("plain"), "'plain'");
    }

    // ── allocation / cleanup ────────────────────────────

    #[tokio::test]
    async fn test_allocate_creates_prefixed_files() {
        let dir = tempfile::tempdir().unwrap();
        let session = SandboxSession::allocate(dir.path(), Path::new("/tmp"), "echo hi")
            .await
            .unwrap();

        for path in [session.stdout_path(), session.stderr_path(), session.script_path()] {
            assert!(path.exists(), "{} missing", path.display());
            let name = path.file_name().unwrap().to_string_lossy();
            assert!(name.starts_with(ARTIFACT_PREFIX));
            assert!(name.contains(session.id()));
        }
        let script = std::fs::read_to_string(session.script_path()).unwrap();
        assert!(script.ends_with("echo hi\n"));
    }

    #[tokio::test]
    async fn test_allocate_names_are_unique() {
        let dir = tempfile::tempdir().unwrap();
        let a = SandboxSession::allocate(dir.path(), Path::new("/tmp"), "true").await.unwrap();
        let b = SandboxSession::allocate(dir.path(), Path::new("/tmp"), "true").await.unwrap();
        assert_ne!(a.id(), b.id());
        assert_ne!(a.stdout_path(), b.stdout_path());
    }

    #[tokio::test]
    async fn test_allocate_failure_is_resource_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("no-such-dir");
        let result = SandboxSession::allocate(&missing, Path::new("/tmp"), "true").await;
        assert!(matches!(result, Err(SandboxError::Resource(_))));
    }

    #[tokio::test]
    async fn test_cleanup_removes_files_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = SandboxSession::allocate(dir.path(), Path::new("/tmp"), "true")
            .await
            .unwrap();
        let paths = [
            session.stdout_path().to_path_buf(),
            session.stderr_path().to_path_buf(),
            session.script_path().to_path_buf(),
        ];

        // One file already gone must not stop the others from being removed
        std::fs::remove_file(&paths[0]).unwrap();
        session.cleanup();
        session.cleanup();

        for path in &paths {
            assert!(!path.exists());
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_drop_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        {
            let _session = SandboxSession::allocate(dir.path(), Path::new("/tmp"), "true")
                .await
                .unwrap();
            assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 3);
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    // ── process lifecycle ───────────────────────────────

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_runs_in_cwd_and_captures() {
        let dir = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let mut config = config();
        config.temp_dir = dir.path().to_path_buf();

        let mut session = SandboxSession::allocate(dir.path(), work.path(), "pwd")
            .await
            .unwrap();
        session.spawn(work.path(), &config).unwrap();
        let status = session.wait(None).await.unwrap().unwrap();
        assert!(status.success());

        let out = std::fs::read_to_string(session.stdout_path()).unwrap();
        let expected = std::fs::canonicalize(work.path()).unwrap();
        assert_eq!(std::fs::canonicalize(out.trim()).unwrap(), expected);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_child_leads_its_own_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = SandboxSession::allocate(dir.path(), Path::new("/tmp"), "sleep 5")
            .await
            .unwrap();
        session.spawn(Path::new("/tmp"), &config()).unwrap();
        let pgid = session.pgid().unwrap();

        let group = nix::unistd::getpgid(Some(nix::unistd::Pid::from_raw(pgid as i32))).unwrap();
        assert_eq!(group.as_raw(), pgid as i32);
        assert_ne!(group, nix::unistd::getpgrp());

        session.cleanup();
    }

    #[cfg(target_os = "linux")]
    use crate::sandbox::testutil::{
        bash_available, eventually, is_live, live_descendants, live_group_members,
    };

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_terminate_kills_whole_group() {
        let dir = tempfile::tempdir().unwrap();
        // Background job plus foreground sleep: both must die
        let mut session =
            SandboxSession::allocate(dir.path(), Path::new("/tmp"), "sleep 30 &\nsleep 30")
                .await
                .unwrap();
        session.spawn(Path::new("/tmp"), &config()).unwrap();
        let pgid = session.pgid().unwrap();

        assert!(session.wait(Some(Duration::from_millis(100))).await.unwrap().is_none());
        assert!(!live_group_members(pgid).is_empty());
        session.terminate(Duration::from_millis(500)).await;

        let gone = eventually(40, || live_group_members(pgid).is_empty()).await;
        assert!(gone, "process group {pgid} still has live members");
        session.cleanup();
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_cleanup_kills_unfinished_child() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = SandboxSession::allocate(dir.path(), Path::new("/tmp"), "sleep 30")
            .await
            .unwrap();
        session.spawn(Path::new("/tmp"), &config()).unwrap();
        let pgid = session.pgid().unwrap();

        drop(session);

        assert!(eventually(40, || live_group_members(pgid).is_empty()).await);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_cleanup_kills_background_job_of_exited_leader() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = SandboxSession::allocate(dir.path(), Path::new("/tmp"), "sleep 30 &")
            .await
            .unwrap();
        session.spawn(Path::new("/tmp"), &config()).unwrap();
        let pgid = session.pgid().unwrap();

        let status = session.wait(Some(Duration::from_secs(5))).await.unwrap();
        assert!(status.is_some(), "leader should exit right away");
        assert!(!live_group_members(pgid).is_empty(), "background sleep should still run");

        session.cleanup();
        assert!(eventually(40, || live_group_members(pgid).is_empty()).await);
    }

    // ── default shell (bash -l -i) ──────────────────────

    #[cfg(target_os = "linux")]
    fn default_config(temp_dir: &Path) -> RunnerConfig {
        RunnerConfig {
            temp_dir: temp_dir.to_path_buf(),
            ..RunnerConfig::default()
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_default_shell_keeps_jobs_in_leader_group() {
        if !bash_available() {
            eprintln!("/bin/bash not found, skipping");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let mut session =
            SandboxSession::allocate(dir.path(), Path::new("/tmp"), "sleep 30 &\nsleep 30")
                .await
                .unwrap();
        session
            .spawn(Path::new("/tmp"), &default_config(dir.path()))
            .unwrap();
        let leader = session.pgid().unwrap();

        // Profile loading time varies; wait until both sleeps are running
        let mut sleeps = Vec::new();
        let started = eventually(200, || {
            sleeps = live_descendants(leader)
                .into_iter()
                .filter(|e| e.comm == "sleep")
                .collect();
            sleeps.len() >= 2
        })
        .await;
        assert!(started, "sleeps never started under bash pid {leader}");
        for entry in &sleeps {
            assert_eq!(entry.pgrp, leader, "pid {} left the leader's group", entry.pid);
        }

        session.terminate(Duration::from_millis(500)).await;
        session.cleanup();

        let pids: Vec<u32> = sleeps.iter().map(|e| e.pid).collect();
        let gone = eventually(40, || pids.iter().all(|pid| !is_live(*pid))).await;
        assert!(gone, "descendants {pids:?} survived termination");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_default_shell_startup_noise_is_dropped() {
        if !bash_available() {
            eprintln!("/bin/bash not found, skipping");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let mut session = SandboxSession::allocate(dir.path(), Path::new("/tmp"), "echo hi")
            .await
            .unwrap();
        session
            .spawn(Path::new("/tmp"), &default_config(dir.path()))
            .unwrap();
        let status = session.wait(Some(Duration::from_secs(30))).await.unwrap();
        assert!(status.is_some_and(|s| s.success()));

        let out = std::fs::read_to_string(session.stdout_path()).unwrap();
        let err = std::fs::read_to_string(session.stderr_path()).unwrap();
        assert_eq!(out.lines().next(), Some("hi"));
        assert!(!err.contains("job control"), "startup stderr leaked: {err:?}");
        assert!(!err.contains("terminal process group"), "startup stderr leaked: {err:?}");
    }
}
