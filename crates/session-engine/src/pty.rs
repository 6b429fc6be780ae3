//! PTY process management: spawn a shell on a fresh pseudoterminal, resize
//! it, write input to it, and take it down again.

use std::collections::BTreeMap;
use std::env;
use std::ffi::{CString, OsStr};
use std::fs;
use std::future::Future;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{access, AccessFlags, Pid};
use serde::{Deserialize, Serialize};
use tokio::io::unix::AsyncFd;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::config::SpawnConfig;
use crate::error::{EngineError, Result};
use crate::multiplexer::{OutputSource, ReadOutcome, ReadWait};

// ── Dimensions ───────────────────────────────────────────────────────

pub const MIN_COLS: u16 = 20;
pub const MAX_COLS: u16 = 500;
pub const MIN_ROWS: u16 = 5;
pub const MAX_ROWS: u16 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub cols: u16,
    pub rows: u16,
}

impl Dimensions {
    /// Out-of-range requests are clamped, never rejected.
    pub fn clamped(cols: i64, rows: i64) -> Self {
        Self {
            cols: cols.clamp(MIN_COLS as i64, MAX_COLS as i64) as u16,
            rows: rows.clamp(MIN_ROWS as i64, MAX_ROWS as i64) as u16,
        }
    }

    fn winsize(self) -> libc::winsize {
        libc::winsize {
            ws_row: self.rows,
            ws_col: self.cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        }
    }
}

impl Default for Dimensions {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

// ── Session spec ─────────────────────────────────────────────────────

/// What the embedding application asks for when creating a session.
#[derive(Debug, Clone, Default)]
pub struct SessionSpec {
    /// Shell name or path; `None` uses the configured default shell.
    pub shell: Option<String>,
    pub args: Vec<String>,
    /// `None` starts in `$HOME` (or `/`).
    pub cwd: Option<PathBuf>,
    /// Added on top of the engine's own environment.
    pub env: BTreeMap<String, String>,
    pub dimensions: Dimensions,
}

// ── Termination ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct TerminationPolicy {
    pub poll_interval: Duration,
    pub deadline: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminationReport {
    /// Exit code, or 128 + signal number. `None` if the process could not be reaped.
    pub exit_code: Option<i32>,
    /// SIGKILL was needed.
    pub forced: bool,
}

// ── PtyProcess ───────────────────────────────────────────────────────

/// A child shell attached to the slave side of a PTY. The master fd is
/// non-blocking and registered with the tokio reactor.
pub struct PtyProcess {
    pid: Pid,
    master: Arc<AsyncFd<OwnedFd>>,
    shell: PathBuf,
    cwd: PathBuf,
    dimensions: Mutex<Dimensions>,
    exit: Mutex<Option<i32>>,
    start_ticks: Option<u64>,
    resize_signals: AtomicU64,
}

impl PtyProcess {
    /// Allocate a PTY pair and exec the requested shell on the slave side.
    ///
    /// Must be called from inside a tokio runtime.
    pub fn spawn(spec: &SessionSpec, config: &SpawnConfig) -> Result<Self> {
        let shell_name = spec.shell.as_deref().unwrap_or(&config.default_shell);
        let dims = Dimensions::clamped(spec.dimensions.cols.into(), spec.dimensions.rows.into());
        let env_vars = child_env(&spec.env, config.helper_bin_dir.as_deref());
        let path_var = env_vars
            .iter()
            .find(|(k, _)| k == "PATH")
            .map(|(_, v)| v.as_str());

        let shell = resolve_shell(shell_name, path_var)?;
        let cwd = match &spec.cwd {
            Some(cwd) => cwd.clone(),
            None => env::var_os("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/")),
        };
        if !cwd.is_dir() {
            return Err(EngineError::spawn(
                shell_name,
                format!("working directory {} is not a directory", cwd.display()),
            ));
        }

        // Everything the child touches is built before fork; the child only
        // calls signal/chdir/execve/_exit.
        let c_shell = cstring(shell.as_os_str(), shell_name)?;
        let c_cwd = cstring(cwd.as_os_str(), shell_name)?;
        let mut c_args = vec![c_shell.clone()];
        for arg in &spec.args {
            c_args.push(cstring(OsStr::new(arg), shell_name)?);
        }
        let mut c_env = Vec::with_capacity(env_vars.len());
        for (key, value) in &env_vars {
            c_env.push(cstring(OsStr::new(&format!("{key}={value}")), shell_name)?);
        }
        let argv: Vec<*const libc::c_char> = c_args
            .iter()
            .map(|a| a.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();
        let envp: Vec<*const libc::c_char> = c_env
            .iter()
            .map(|e| e.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();

        let mut winsize = dims.winsize();
        let mut master_fd: libc::c_int = -1;
        let pid = unsafe {
            libc::forkpty(
                &mut master_fd as *mut libc::c_int,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                &mut winsize as *mut libc::winsize,
            )
        };

        if pid < 0 {
            // EMFILE/ENFILE/EAGAIN: the OS refused a PTY or a process.
            return Err(EngineError::spawn(shell_name, io::Error::last_os_error()));
        }

        if pid == 0 {
            unsafe {
                // the Rust runtime ignores SIGPIPE; shells expect the default
                libc::signal(libc::SIGPIPE, libc::SIG_DFL);
                libc::chdir(c_cwd.as_ptr());
                libc::execve(c_shell.as_ptr(), argv.as_ptr(), envp.as_ptr());
                libc::_exit(127);
            }
        }

        // SAFETY: master_fd is valid from forkpty
        let owned = unsafe { OwnedFd::from_raw_fd(master_fd) };
        let pid = Pid::from_raw(pid);
        let master = set_nonblocking(&owned)
            .and_then(|_| AsyncFd::new(owned))
            .map_err(|err| {
                let _ = kill(pid, Signal::SIGKILL);
                let _ = waitpid(pid, None);
                EngineError::spawn(shell_name, err)
            })?;

        info!(
            pid = pid.as_raw(),
            shell = %shell.display(),
            cwd = %cwd.display(),
            cols = dims.cols,
            rows = dims.rows,
            "spawned PTY process"
        );

        Ok(Self {
            pid,
            master: Arc::new(master),
            shell,
            cwd,
            dimensions: Mutex::new(dims),
            exit: Mutex::new(None),
            start_ticks: process_start_ticks(pid.as_raw()),
            resize_signals: AtomicU64::new(0),
        })
    }

    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    pub fn shell(&self) -> &Path {
        &self.shell
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn start_ticks(&self) -> Option<u64> {
        self.start_ticks
    }

    pub fn dimensions(&self) -> Dimensions {
        *self.dimensions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of window-size notifications actually sent to the PTY.
    pub fn resize_signals(&self) -> u64 {
        self.resize_signals.load(Ordering::Relaxed)
    }

    /// A reader over the master side, for the output multiplexer.
    pub fn reader(&self) -> PtyReader {
        PtyReader {
            master: Arc::clone(&self.master),
        }
    }

    /// Apply a window size. Returns `false` when the clamped size equals the
    /// current one, in which case no ioctl is issued.
    pub fn resize(&self, requested: Dimensions) -> io::Result<bool> {
        let dims = Dimensions::clamped(requested.cols.into(), requested.rows.into());
        let mut current = self.dimensions.lock().unwrap_or_else(PoisonError::into_inner);
        if *current == dims {
            return Ok(false);
        }
        resize_pty(self.master.as_raw_fd(), dims)?;
        *current = dims;
        self.resize_signals.fetch_add(1, Ordering::Relaxed);
        debug!(pid = self.pid.as_raw(), cols = dims.cols, rows = dims.rows, "resized PTY");
        Ok(true)
    }

    /// Write all of `data` to the master side.
    pub async fn write(&self, mut data: &[u8]) -> io::Result<()> {
        while !data.is_empty() {
            let mut guard = self.master.writable().await?;
            match guard.try_io(|fd| write_fd(fd.as_raw_fd(), data)) {
                Ok(Ok(n)) => data = &data[n..],
                Ok(Err(err)) => return Err(err),
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }

    /// Non-blocking exit probe. The first successful reap is cached so the
    /// child is only ever waited on once.
    pub fn try_wait(&self) -> Option<i32> {
        let mut exit = self.exit.lock().unwrap_or_else(PoisonError::into_inner);
        if exit.is_some() {
            return *exit;
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => *exit = Some(code),
            Ok(WaitStatus::Signaled(_, signal, _)) => *exit = Some(128 + signal as i32),
            Ok(_) => {}
            Err(Errno::ECHILD) => *exit = Some(-1),
            Err(err) => debug!(pid = self.pid.as_raw(), %err, "waitpid failed"),
        }
        *exit
    }

    /// SIGHUP + SIGTERM, poll for exit until the deadline, then SIGKILL.
    pub async fn terminate(&self, policy: &TerminationPolicy) -> TerminationReport {
        escalate(self.pid, policy, || self.try_wait()).await
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        if self.try_wait().is_none() {
            let _ = killpg(self.pid, Signal::SIGKILL);
            let _ = kill(self.pid, Signal::SIGKILL);
            let _ = waitpid(self.pid, Some(WaitPidFlag::WNOHANG));
        }
    }
}

/// Terminate a process that is not our child (left over from an earlier
/// engine run). It cannot be reaped here, only observed gone.
pub async fn terminate_orphan(pid: i32, policy: &TerminationPolicy) -> TerminationReport {
    let pid = Pid::from_raw(pid);
    escalate(pid, policy, || (!pid_alive(pid.as_raw())).then_some(-1)).await
}

async fn escalate(
    pid: Pid,
    policy: &TerminationPolicy,
    mut exited: impl FnMut() -> Option<i32>,
) -> TerminationReport {
    if let Some(code) = exited() {
        return TerminationReport {
            exit_code: Some(code),
            forced: false,
        };
    }

    let _ = kill(pid, Signal::SIGHUP);
    let _ = kill(pid, Signal::SIGTERM);

    let deadline = Instant::now() + policy.deadline;
    loop {
        if let Some(code) = exited() {
            debug!(pid = pid.as_raw(), code, "process exited after SIGTERM");
            return TerminationReport {
                exit_code: Some(code),
                forced: false,
            };
        }
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        time::sleep(policy.poll_interval.min(deadline - now)).await;
    }

    warn!(
        error = %EngineError::TerminationTimeoutExceeded {
            pid: pid.as_raw(),
            deadline: policy.deadline,
        },
        "escalating to SIGKILL"
    );
    // forkpty children lead their own session, so pgid == pid.
    let _ = killpg(pid, Signal::SIGKILL);
    let _ = kill(pid, Signal::SIGKILL);

    for _ in 0..100 {
        if let Some(code) = exited() {
            return TerminationReport {
                exit_code: Some(code),
                forced: true,
            };
        }
        time::sleep(Duration::from_millis(10)).await;
    }
    TerminationReport {
        exit_code: None,
        forced: true,
    }
}

// ── Reader ───────────────────────────────────────────────────────────

/// Master-side reader. Waits on fd readiness, so a pending read wakes as soon
/// as the child writes.
pub struct PtyReader {
    master: Arc<AsyncFd<OwnedFd>>,
}

impl OutputSource for PtyReader {
    fn read_chunk<'a>(
        &'a mut self,
        buf: &'a mut [u8],
        wait: ReadWait,
    ) -> impl Future<Output = io::Result<ReadOutcome>> + Send + 'a {
        async move {
            let deadline = Instant::now() + wait.get();
            loop {
                let mut guard = match time::timeout_at(deadline, self.master.readable()).await {
                    Err(_) => return Ok(ReadOutcome::TimedOut),
                    Ok(ready) => ready?,
                };
                match guard.try_io(|fd| read_fd(fd.as_raw_fd(), buf)) {
                    Ok(Ok(0)) => return Ok(ReadOutcome::Eof),
                    Ok(Ok(n)) => return Ok(ReadOutcome::Data(n)),
                    // Linux reports EIO once every slave fd is closed.
                    Ok(Err(err)) if err.raw_os_error() == Some(libc::EIO) => {
                        return Ok(ReadOutcome::Eof)
                    }
                    Ok(Err(err)) => return Err(err),
                    Err(_would_block) => continue,
                }
            }
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────────────

/// Resolve a shell name against PATH, or check an explicit path.
pub fn resolve_shell(shell: &str, path_var: Option<&str>) -> Result<PathBuf> {
    if shell.is_empty() {
        return Err(EngineError::spawn(shell, "empty shell name"));
    }
    if shell.contains('/') {
        let path = PathBuf::from(shell);
        if is_executable(&path) {
            return Ok(path);
        }
        return Err(EngineError::spawn(shell, "not an executable file"));
    }
    let search = path_var.unwrap_or("/usr/local/bin:/usr/bin:/bin");
    search
        .split(':')
        .filter(|dir| !dir.is_empty())
        .map(|dir| Path::new(dir).join(shell))
        .find(|candidate| is_executable(candidate))
        .ok_or_else(|| EngineError::spawn(shell, "not found in PATH"))
}

fn is_executable(path: &Path) -> bool {
    path.is_file() && access(path, AccessFlags::X_OK).is_ok()
}

fn child_env(overrides: &BTreeMap<String, String>, helper_bin: Option<&Path>) -> Vec<(String, String)> {
    let mut vars: BTreeMap<String, String> = env::vars().collect();
    vars.insert("TERM".to_string(), "xterm-256color".to_string());
    if let Some(dir) = helper_bin {
        let dir = dir.display().to_string();
        let path = vars.get("PATH").cloned().unwrap_or_default();
        if !path.split(':').any(|p| p == dir) {
            let joined = if path.is_empty() { dir } else { format!("{dir}:{path}") };
            vars.insert("PATH".to_string(), joined);
        }
    }
    for (key, value) in overrides {
        vars.insert(key.clone(), value.clone());
    }
    vars.into_iter().collect()
}

fn cstring(value: &OsStr, shell: &str) -> Result<CString> {
    CString::new(value.as_bytes())
        .map_err(|_| EngineError::spawn(shell, format!("{value:?} contains a NUL byte")))
}

fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
    let raw = fd.as_raw_fd();
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn resize_pty(master_fd: RawFd, dims: Dimensions) -> io::Result<()> {
    let ws = dims.winsize();
    if unsafe { libc::ioctl(master_fd, libc::TIOCSWINSZ, &ws) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn read_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

fn write_fd(fd: RawFd, data: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Signal 0 probe. EPERM still means the pid exists.
pub fn pid_alive(pid: i32) -> bool {
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Process start time in clock ticks since boot (`/proc/<pid>/stat` field 22).
/// Used to tell a live process from a recycled pid. `None` off Linux.
pub fn process_start_ticks(pid: i32) -> Option<u64> {
    let stat = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // comm may contain spaces; fields resume after the last ')'
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.split_whitespace().nth(19)?.parse().ok()
}

// ── Unit tests ──────────────────────────────────────────────────────
