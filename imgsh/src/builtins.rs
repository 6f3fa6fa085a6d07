//! The directory builtins: `cd`, `ls`, `pwd`.
//!
//! Builtins are matched on the exact first token and only for
//! single-command lines; inside a pipeline every stage is an external
//! command resolved against the volume.

use std::fs::File;
use std::io::{self, Write};

use exfat::Volume;

use crate::command::Command;
use crate::errors::ShellError;
use crate::path::WorkingDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Cd,
    Ls,
    Pwd,
}

pub fn match_builtin(name: &str) -> Option<Builtin> {
    match name {
        "cd" => Some(Builtin::Cd),
        "ls" => Some(Builtin::Ls),
        "pwd" => Some(Builtin::Pwd),
        _ => None,
    }
}

/// Where builtin output goes: standard output, duplicated into the
/// session log when one is configured.
pub struct OutputSink<'a> {
    log: Option<&'a File>,
}

impl<'a> OutputSink<'a> {
    pub fn new(log: Option<&'a File>) -> OutputSink<'a> {
        OutputSink { log }
    }

    pub fn line(&mut self, text: &str) -> io::Result<()> {
        self.write(text.as_bytes())?;
        self.write(b"\n")
    }

    pub fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut stdout = io::stdout();
        stdout.write_all(bytes)?;
        stdout.flush()?;
        if let Some(mut log) = self.log {
            log.write_all(bytes)?;
        }
        Ok(())
    }
}

pub fn run_builtin(
    builtin: Builtin,
    cmd: &Command,
    cwd: &mut WorkingDir,
    volume: &mut dyn Volume,
    out: &mut OutputSink,
) -> Result<(), ShellError> {
    match builtin {
        Builtin::Pwd => {
            out.line(cwd.path())?;
            Ok(())
        }
        Builtin::Cd => cwd.change(cmd.arg(1), volume),
        Builtin::Ls => run_ls(cwd, volume, out),
    }
}

/// Stream the working directory's entries: inode number, name, and a
/// trailing `/` on directories. Stops at the first failed read, which on
/// the first entry also means "not a directory".
fn run_ls(
    cwd: &WorkingDir,
    volume: &mut dyn Volume,
    out: &mut OutputSink,
) -> Result<(), ShellError> {
    let handle = volume.open(cwd.path())?;
    let mut result = Ok(());
    loop {
        match volume.next_entry(handle) {
            Ok(Some(entry)) => {
                let suffix = if entry.is_dir { "/" } else { "" };
                if let Err(err) = out.line(&format!("{} {}{}", entry.inode, entry.name, suffix)) {
                    result = Err(ShellError::Io(err));
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                result = Err(ShellError::Volume(err));
                break;
            }
        }
    }
    volume.close(handle);
    result
}
