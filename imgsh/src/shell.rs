//! The read loop: read a line, parse, dispatch, repeat until end of
//! input. Orchestration only; everything interesting happens elsewhere.

use std::fs::File;
use std::io;

use anyhow::Result;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use exfat::Volume;

use crate::builtins::{match_builtin, run_builtin, OutputSink};
use crate::command::Command;
use crate::errors::ShellError;
use crate::exec::{run_pipeline, run_single, ExecContext};
use crate::path::WorkingDir;
use crate::pipeline::{scan_pipes, PipeScan, PipelineCommands};

pub struct Shell<V: Volume> {
    volume: V,
    cwd: WorkingDir,
    log: Option<File>,
}

/// Line editing with history when stdin is a terminal, plain buffered
/// lines when it is not (piped scripts).
enum LineSource {
    Interactive(DefaultEditor),
    Plain(io::Lines<io::StdinLock<'static>>),
}

impl LineSource {
    fn new() -> Result<LineSource> {
        if atty::is(atty::Stream::Stdin) {
            Ok(LineSource::Interactive(DefaultEditor::new()?))
        } else {
            Ok(LineSource::Plain(io::stdin().lines()))
        }
    }

    fn read_line(&mut self, prompt: &str) -> Option<String> {
        match self {
            LineSource::Interactive(editor) => match editor.readline(prompt) {
                Ok(line) => {
                    if !line.trim().is_empty() {
                        let _ = editor.add_history_entry(line.as_str());
                    }
                    Some(line)
                }
                Err(ReadlineError::Eof) | Err(ReadlineError::Interrupted) => None,
                Err(err) => {
                    eprintln!("read error: {err}");
                    None
                }
            },
            LineSource::Plain(lines) => lines.next().and_then(|line| line.ok()),
        }
    }
}

impl<V: Volume> Shell<V> {
    pub fn new(volume: V, log: Option<File>) -> Shell<V> {
        Shell {
            volume,
            cwd: WorkingDir::new(),
            log,
        }
    }

    pub fn run(&mut self) -> Result<()> {
        let prompt = format!("{}:\\> ", self.volume.label());
        let mut source = LineSource::new()?;
        while let Some(line) = source.read_line(&prompt) {
            match self.dispatch(&line) {
                Ok(()) => {}
                // a blank line just means "next prompt"
                Err(ShellError::EmptyInput) => {}
                Err(err) => eprintln!("{err}"),
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, line: &str) -> Result<(), ShellError> {
        let cmd = Command::create(line)?;
        match scan_pipes(&cmd) {
            PipeScan::Invalid => Err(ShellError::InvalidPipeUsage),
            PipeScan::Stages(num_stages) => {
                let pipeline = PipelineCommands::build(num_stages, line)?;
                let ctx = ExecContext {
                    cwd: self.cwd.path(),
                    log: self.log.as_ref(),
                };
                run_pipeline(&mut self.volume, &ctx, &pipeline).map(|_| ())
            }
            PipeScan::None => {
                if let Some(builtin) = match_builtin(cmd.name()) {
                    let mut sink = OutputSink::new(self.log.as_ref());
                    run_builtin(builtin, &cmd, &mut self.cwd, &mut self.volume, &mut sink)
                } else {
                    let ctx = ExecContext {
                        cwd: self.cwd.path(),
                        log: self.log.as_ref(),
                    };
                    run_single(&mut self.volume, &ctx, &cmd).map(|_| ())
                }
            }
        }
    }
}
