//! Loading executables from the volume and running pipelines.
//!
//! One process per stage. The parent creates every pipe before the first
//! fork, each child closes every descriptor it does not own as soon as
//! its own wiring is done, and the parent closes all pipe ends once the
//! last child exists. A write end left open anywhere keeps a downstream
//! reader from ever seeing end-of-stream.

use std::ffi::CString;
use std::fs::File;
use std::io::{self, Write};
use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{close, dup2, fork, fexecve, lseek, pipe, read, ForkResult, Pid, Whence};
use thiserror::Error;

use exfat::{Volume, VolumeError};

use crate::command::Command;
use crate::errors::ShellError;
use crate::path::join_path;
use crate::pipeline::PipelineCommands;

/// Chunk size for volume reads and tee copies.
pub const READ_CHUNK: usize = 4096;

pub const REDIRECT_MARKER: &str = "<";

const EXIT_REDIRECTION: i32 = 1;
const EXIT_EXEC: i32 = 126;
const EXIT_NOT_FOUND: i32 = 127;

/// Everything an execution needs, passed explicitly: the working
/// directory to resolve names against, and the session log when output
/// teeing is on.
pub struct ExecContext<'a> {
    pub cwd: &'a str,
    pub log: Option<&'a File>,
}

/// Per-stage exit statuses, in spawn order.
#[derive(Debug, Default)]
pub struct PipelineStatus {
    statuses: Vec<i32>,
}

impl PipelineStatus {
    pub fn success(&self) -> bool {
        self.statuses.iter().all(|&status| status == 0)
    }

    pub fn last(&self) -> i32 {
        self.statuses.last().copied().unwrap_or(0)
    }

    pub fn stage_statuses(&self) -> &[i32] {
        &self.statuses
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("not found")]
    NotFound,
    #[error(transparent)]
    Volume(VolumeError),
    #[error("anonymous memory object: {0}")]
    Memory(#[source] nix::Error),
    #[error("copy to memory object: {0}")]
    Copy(#[source] io::Error),
}

/// Scan a command for the input-redirection marker.
///
/// No marker is fine; the first marker must have at least one token
/// before it and a file name after it, with at least three tokens in
/// total. The returned command holds only the tokens strictly before the
/// marker: the marker, the file name, and anything after them never
/// reach the exec argument vector. Later markers are ignored.
pub fn split_redirection(cmd: &Command) -> Result<Option<(String, Command)>, ShellError> {
    let Some(at) = cmd.args().iter().position(|arg| arg == REDIRECT_MARKER) else {
        return Ok(None);
    };
    if cmd.argc() < 3 {
        return Err(ShellError::MalformedRedirection(
            "redirection needs a command and a file name",
        ));
    }
    if at == 0 {
        return Err(ShellError::MalformedRedirection(
            "nothing to run before the redirection operator",
        ));
    }
    if at + 1 >= cmd.argc() {
        return Err(ShellError::MalformedRedirection(
            "the redirection operator must be followed by a file name",
        ));
    }
    let file = cmd.args()[at + 1].clone();
    let trimmed = Command::from_args(cmd.args()[..at].to_vec());
    Ok(Some((file, trimmed)))
}

/// Copy a volume file into a fresh anonymous memory object, fully, then
/// rewind it to offset 0 so it is ready for process replacement (or to
/// serve as a replacement standard input).
pub fn load_image(
    volume: &mut dyn Volume,
    path: &str,
    name: &str,
) -> Result<OwnedFd, LoadError> {
    let handle = match volume.open(path) {
        Ok(handle) => handle,
        Err(VolumeError::NotFound) => return Err(LoadError::NotFound),
        Err(err) => return Err(LoadError::Volume(err)),
    };
    let memfd_name = CString::new(name).unwrap_or_default();
    let memory = match memfd_create(memfd_name.as_c_str(), MemFdCreateFlag::empty()) {
        Ok(fd) => fd,
        Err(err) => {
            volume.close(handle);
            return Err(LoadError::Memory(err));
        }
    };
    let mut buf = [0u8; READ_CHUNK];
    loop {
        let n = match volume.read(handle, &mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                volume.close(handle);
                return Err(LoadError::Volume(err));
            }
        };
        if let Err(err) = write_all_fd(memory.as_raw_fd(), &buf[..n]) {
            volume.close(handle);
            return Err(LoadError::Copy(err));
        }
    }
    volume.close(handle);
    if let Err(err) = lseek(memory.as_raw_fd(), 0, Whence::SeekSet) {
        return Err(LoadError::Memory(err));
    }
    Ok(memory)
}

/// Run a pipeline, teeing the last stage's output to the log when one is
/// configured. The single-stage path skips all pipe machinery so that a
/// plain command behaves (and fails) exactly like it always has.
pub fn run_pipeline(
    volume: &mut dyn Volume,
    ctx: &ExecContext,
    pipeline: &PipelineCommands,
) -> Result<PipelineStatus, ShellError> {
    if pipeline.num_stages() == 1 {
        return run_single(volume, ctx, &pipeline.stages()[0]);
    }

    let env = capture_env();
    let total = pipeline.num_stages();

    let tee = match ctx.log {
        Some(_) => Some(make_pipe().map_err(ShellError::Resource)?),
        None => None,
    };

    let mut pipes: Vec<(RawFd, RawFd)> = Vec::with_capacity(total - 1);
    for _ in 0..total - 1 {
        match make_pipe() {
            Ok(pair) => pipes.push(pair),
            Err(err) => {
                close_pairs(&pipes);
                if let Some(pair) = tee {
                    close_pair(pair);
                }
                return Err(ShellError::Resource(err));
            }
        }
    }

    let mut pids: Vec<Pid> = Vec::with_capacity(total);
    for (index, stage) in pipeline.stages().iter().enumerate() {
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                run_stage_child(volume, ctx, &env, stage, index, total, &pipes, tee)
            }
            Ok(ForkResult::Parent { child }) => pids.push(child),
            Err(err) => {
                close_pairs(&pipes);
                if let Some(pair) = tee {
                    close_pair(pair);
                }
                // the spawned children see EOF on their pipes and exit
                let _ = reap(&pids);
                return Err(ShellError::Resource(err));
            }
        }
    }

    close_pairs(&pipes);

    let mut tee_result = Ok(());
    if let (Some((tee_read, tee_write)), Some(log)) = (tee, ctx.log) {
        let _ = close(tee_write);
        let mut stdout = io::stdout();
        let mut log = log;
        tee_result = tee_stream(tee_read, &mut stdout, &mut log);
        let _ = close(tee_read);
    }

    let status = reap(&pids);
    tee_result?;
    Ok(status)
}

/// The degenerate one-command path. Redirection and the executable image
/// are resolved in the parent, so a malformed redirection, a missing
/// input file, or an unknown command are reported without spawning
/// anything.
pub fn run_single(
    volume: &mut dyn Volume,
    ctx: &ExecContext,
    cmd: &Command,
) -> Result<PipelineStatus, ShellError> {
    let env = capture_env();

    let (exec_cmd, stdin_image) = match split_redirection(cmd)? {
        None => (cmd.clone(), None),
        Some((file, trimmed)) => {
            let path = join_path(ctx.cwd, &file)?;
            let memory = load_image(volume, &path, &file)
                .map_err(|err| redirect_error(err, &file))?;
            (trimmed, Some(memory))
        }
    };

    let path = join_path(ctx.cwd, exec_cmd.name())?;
    let image = load_image(volume, &path, exec_cmd.name())
        .map_err(|err| command_error(err, exec_cmd.name()))?;
    let argv = exec_cmd.to_exec_argv()?;

    let tee = match ctx.log {
        Some(_) => Some(make_pipe().map_err(ShellError::Resource)?),
        None => None,
    };

    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            if let Some(memory) = &stdin_image {
                if dup2(memory.as_raw_fd(), libc::STDIN_FILENO).is_err() {
                    child_exit(EXIT_EXEC);
                }
                let _ = close(memory.as_raw_fd());
            }
            if let Some((tee_read, tee_write)) = tee {
                let _ = close(tee_read);
                if dup2(tee_write, libc::STDOUT_FILENO).is_err() {
                    child_exit(EXIT_EXEC);
                }
                let _ = close(tee_write);
            }
            if let Err(err) = fexecve(image.as_raw_fd(), &argv, &env) {
                eprintln!("cannot execute {}: {}", exec_cmd.name(), err);
            }
            child_exit(EXIT_EXEC)
        }
        Ok(ForkResult::Parent { child }) => {
            drop(stdin_image);
            drop(image);
            let mut tee_result = Ok(());
            if let (Some((tee_read, tee_write)), Some(log)) = (tee, ctx.log) {
                let _ = close(tee_write);
                let mut stdout = io::stdout();
                let mut log = log;
                tee_result = tee_stream(tee_read, &mut stdout, &mut log);
                let _ = close(tee_read);
            }
            let status = reap(&[child]);
            tee_result?;
            Ok(status)
        }
        Err(err) => {
            if let Some(pair) = tee {
                close_pair(pair);
            }
            Err(ShellError::Resource(err))
        }
    }
}

/// Child side of one pipeline stage. Wires stdin/stdout, sheds every
/// descriptor it does not own, loads its image, and replaces itself.
/// Never returns.
fn run_stage_child(
    volume: &mut dyn Volume,
    ctx: &ExecContext,
    env: &[CString],
    stage: &Command,
    index: usize,
    total: usize,
    pipes: &[(RawFd, RawFd)],
    tee: Option<(RawFd, RawFd)>,
) -> ! {
    let mut cmd = stage.clone();

    // only the first stage may carry a `<` redirection
    if index == 0 {
        match split_redirection(&cmd) {
            Ok(None) => {}
            Ok(Some((file, trimmed))) => match redirect_stdin(volume, ctx.cwd, &file) {
                Ok(()) => cmd = trimmed,
                Err(err) => {
                    eprintln!("{err}");
                    child_exit(EXIT_REDIRECTION);
                }
            },
            Err(err) => {
                eprintln!("{err}");
                child_exit(EXIT_REDIRECTION);
            }
        }
    }

    if index > 0 && dup2(pipes[index - 1].0, libc::STDIN_FILENO).is_err() {
        child_exit(EXIT_EXEC);
    }
    if index < total - 1 {
        if dup2(pipes[index].1, libc::STDOUT_FILENO).is_err() {
            child_exit(EXIT_EXEC);
        }
    } else if let Some((_, tee_write)) = tee {
        if dup2(tee_write, libc::STDOUT_FILENO).is_err() {
            child_exit(EXIT_EXEC);
        }
    }

    // the dup'd copies are all this stage needs
    close_pairs(pipes);
    if let Some(pair) = tee {
        close_pair(pair);
    }

    let path = match join_path(ctx.cwd, cmd.name()) {
        Ok(path) => path,
        Err(err) => {
            eprintln!("{err}");
            child_exit(EXIT_NOT_FOUND);
        }
    };
    let image = match load_image(volume, &path, cmd.name()) {
        Ok(image) => image,
        Err(LoadError::NotFound) => {
            eprintln!("command not found in mounted volume: {}", cmd.name());
            child_exit(EXIT_NOT_FOUND);
        }
        Err(err) => {
            eprintln!("{}: {}", cmd.name(), err);
            child_exit(EXIT_EXEC);
        }
    };
    let argv = match cmd.to_exec_argv() {
        Ok(argv) => argv,
        Err(err) => {
            eprintln!("{err}");
            child_exit(EXIT_EXEC);
        }
    };
    if let Err(err) = fexecve(image.as_raw_fd(), &argv, env) {
        eprintln!("cannot execute {}: {}", cmd.name(), err);
    }
    child_exit(EXIT_EXEC)
}

/// Load the redirection file and duplicate it onto standard input.
fn redirect_stdin(volume: &mut dyn Volume, cwd: &str, file: &str) -> Result<(), ShellError> {
    let path = join_path(cwd, file)?;
    let memory = load_image(volume, &path, file).map_err(|err| redirect_error(err, file))?;
    dup2(memory.as_raw_fd(), libc::STDIN_FILENO).map_err(ShellError::Resource)?;
    Ok(())
}

fn redirect_error(err: LoadError, file: &str) -> ShellError {
    match err {
        LoadError::NotFound => ShellError::RedirectNotFound(file.to_string()),
        LoadError::Volume(err) => ShellError::Volume(err),
        LoadError::Memory(err) => ShellError::Resource(err),
        LoadError::Copy(err) => ShellError::Io(err),
    }
}

fn command_error(err: LoadError, name: &str) -> ShellError {
    match err {
        LoadError::NotFound => ShellError::CommandNotFound(name.to_string()),
        LoadError::Volume(err) => ShellError::Volume(err),
        LoadError::Memory(err) => ShellError::Resource(err),
        LoadError::Copy(err) => ShellError::Io(err),
    }
}

/// Wait for every child in spawn order. A non-zero stage is reported but
/// never aborts the remaining waits.
fn reap(pids: &[Pid]) -> PipelineStatus {
    let mut statuses = Vec::with_capacity(pids.len());
    for (index, pid) in pids.iter().enumerate() {
        let code = loop {
            match waitpid(*pid, None) {
                Ok(WaitStatus::Exited(_, code)) => break code,
                Ok(WaitStatus::Signaled(_, signal, _)) => break 128 + signal as i32,
                Ok(_) => continue,
                Err(Errno::EINTR) => continue,
                Err(err) => {
                    eprintln!("wait for stage {}: {}", index + 1, err);
                    break EXIT_EXEC;
                }
            }
        };
        if code != 0 {
            eprintln!("stage {} exited with status {}", index + 1, code);
        }
        statuses.push(code);
    }
    PipelineStatus { statuses }
}

/// Drain `source` to end-of-stream, writing every chunk unmodified to
/// both sinks in order. What the terminal shows and what the log records
/// are byte-for-byte identical.
fn tee_stream(
    source: RawFd,
    primary: &mut dyn Write,
    secondary: &mut dyn Write,
) -> Result<(), ShellError> {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        let n = match read(source, &mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(Errno::EINTR) => continue,
            Err(err) => return Err(ShellError::Io(io::Error::from(err))),
        };
        primary.write_all(&buf[..n])?;
        secondary.write_all(&buf[..n])?;
    }
    primary.flush()?;
    secondary.flush()?;
    Ok(())
}

fn capture_env() -> Vec<CString> {
    std::env::vars()
        .filter_map(|(key, value)| CString::new(format!("{key}={value}")).ok())
        .collect()
}

fn make_pipe() -> Result<(RawFd, RawFd), nix::Error> {
    let (read_end, write_end) = pipe()?;
    Ok((read_end.into_raw_fd(), write_end.into_raw_fd()))
}

fn close_pair((read_end, write_end): (RawFd, RawFd)) {
    let _ = close(read_end);
    let _ = close(write_end);
}

fn close_pairs(pipes: &[(RawFd, RawFd)]) {
    for &pair in pipes {
        close_pair(pair);
    }
}

fn child_exit(code: i32) -> ! {
    unsafe { libc::_exit(code) }
}

/// libc write loop; retries on EINTR and never reports a short write.
fn write_all_fd(fd: RawFd, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        let rc = unsafe { libc::write(fd, buf.as_ptr() as *const _, buf.len()) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if rc == 0 {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
        }
        buf = &buf[rc as usize..];
    }
    Ok(())
}
