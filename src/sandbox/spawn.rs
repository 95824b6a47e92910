use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

use super::ExecutionIdentity;

#[cfg(all(target_os = "linux", target_env = "gnu"))]
type RlimitResource = libc::__rlimit_resource_t;
#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
type RlimitResource = libc::c_int;

/// OS-level limits installed in the child between fork and exec
#[derive(Debug, Clone, Default)]
pub(crate) struct SpawnLimits {
    pub wall: Duration,
    pub cpu_secs: Option<u64>,
    pub memory_bytes: Option<u64>,
    pub file_size_bytes: Option<u64>,
    pub num_procs: Option<u64>,
    pub identity: Option<ExecutionIdentity>,
    /// Bytes kept from each of stdout and stderr before the run is killed
    pub max_output: Option<usize>,
}

impl SpawnLimits {
    /// Only a wall-clock bound, for trusted helper commands like compilers
    pub fn wall_only(wall: Duration) -> Self {
        Self {
            wall,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct ProcessOutput {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    /// Killed for writing more than [`SpawnLimits::max_output`]
    pub output_exceeded: bool,
    pub elapsed: Duration,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && !self.output_exceeded && self.exit_code == Some(0)
    }
}

/// Runs a command to completion in `workdir`, feeding it `stdin`
///
/// The child leads its own process group so that everything it forked can be
/// killed once the wall-clock limit expires. Blocks the calling thread; must
/// not be called from inside an async context.
pub(crate) fn run_process(
    command: &[String],
    workdir: &Path,
    stdin: &str,
    limits: &SpawnLimits,
) -> Result<ProcessOutput> {
    if command.is_empty() {
        bail!("Empty command");
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build process runtime")?;

    runtime.block_on(run_process_async(command, workdir, stdin.as_bytes().to_vec(), limits))
}

async fn run_process_async(
    command: &[String],
    workdir: &Path,
    stdin: Vec<u8>,
    limits: &SpawnLimits,
) -> Result<ProcessOutput> {
    let mut cmd = tokio::process::Command::new(&command[0]);
    cmd.args(&command[1..])
        .current_dir(workdir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child_limits = limits.clone();
    // SAFETY: the closure only makes async-signal-safe libc calls
    unsafe {
        cmd.pre_exec(move || confine(&child_limits));
    }

    let start = Instant::now();
    let mut child = cmd
        .spawn()
        .with_context(|| format!("Failed to spawn {}", command[0]))?;
    let pid = child.id();

    if let Some(mut pipe) = child.stdin.take() {
        tokio::spawn(async move {
            // The program may exit without reading its input
            let _ = pipe.write_all(&stdin).await;
        });
    }

    let cap = limits.max_output.unwrap_or(usize::MAX);
    let mut stdout = Captured::default();
    let mut stderr = Captured::default();
    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();

    let finished = timeout(limits.wall, async {
        let (out, err) = tokio::join!(
            stdout.read_from(stdout_pipe, cap, pid),
            stderr.read_from(stderr_pipe, cap, pid),
        );
        out?;
        err?;
        child.wait().await
    })
    .await;

    let mut output = ProcessOutput {
        stdout: String::from_utf8_lossy(&stdout.bytes).into_owned(),
        stderr: String::from_utf8_lossy(&stderr.bytes).into_owned(),
        output_exceeded: stdout.overflowed || stderr.overflowed,
        ..Default::default()
    };
    match finished {
        Ok(status) => {
            let status = status?;
            output.exit_code = status.code();
            output.signal = status.signal();
        }
        Err(_) => {
            log::debug!("Killing process group of {} after {:?}", command[0], limits.wall);
            kill_group(pid);
            output.signal = Some(libc::SIGKILL);
            output.timed_out = true;
        }
    }
    output.elapsed = start.elapsed();
    Ok(output)
}

/// Output read from one pipe, bounded in size
#[derive(Default)]
struct Captured {
    bytes: Vec<u8>,
    overflowed: bool,
}

impl Captured {
    /// Reads until end of file, killing the process group once more than
    /// `cap` bytes arrive
    ///
    /// Bytes are appended as they are read so a cancelled read keeps what the
    /// program printed before it was stopped.
    async fn read_from<R: AsyncRead + Unpin>(
        &mut self,
        pipe: Option<R>,
        cap: usize,
        pid: Option<u32>,
    ) -> io::Result<()> {
        let Some(mut pipe) = pipe else {
            return Ok(());
        };
        let mut chunk = [0u8; 8192];
        loop {
            let n = pipe.read(&mut chunk).await?;
            if n == 0 {
                return Ok(());
            }
            let room = cap - self.bytes.len();
            if n > room {
                self.bytes.extend_from_slice(&chunk[..room]);
                self.overflowed = true;
                log::debug!("Output passed {cap} bytes, killing process group");
                kill_group(pid);
                return Ok(());
            }
            self.bytes.extend_from_slice(&chunk[..n]);
        }
    }
}

fn kill_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        // SAFETY: plain syscall on a process group we created
        unsafe {
            libc::killpg(pid as libc::pid_t, libc::SIGKILL);
        }
    }
}

fn confine(limits: &SpawnLimits) -> io::Result<()> {
    // SAFETY: called in the forked child before exec
    if unsafe { libc::setpgid(0, 0) } != 0 {
        return Err(io::Error::last_os_error());
    }
    if let Some(secs) = limits.cpu_secs {
        set_rlimit(libc::RLIMIT_CPU, secs)?;
    }
    if let Some(bytes) = limits.memory_bytes {
        set_rlimit(libc::RLIMIT_AS, bytes)?;
    }
    if let Some(bytes) = limits.file_size_bytes {
        set_rlimit(libc::RLIMIT_FSIZE, bytes)?;
    }
    if let Some(count) = limits.num_procs {
        set_rlimit(libc::RLIMIT_NPROC, count)?;
    }
    if let Some(identity) = limits.identity {
        // Group first, the user switch drops the right to change it
        if unsafe { libc::setgid(identity.gid as libc::gid_t) } != 0 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::setuid(identity.uid as libc::uid_t) } != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn set_rlimit(resource: RlimitResource, value: u64) -> io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: value as libc::rlim_t,
        rlim_max: value as libc::rlim_t,
    };
    if unsafe { libc::setrlimit(resource, &limit) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
