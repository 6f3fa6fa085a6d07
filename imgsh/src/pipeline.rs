//! Pipe-marker scanning and pipeline construction.

use crate::command::Command;
use crate::errors::ShellError;

pub const PIPE_MARKER: &str = "|";

/// Outcome of scanning a command for pipe markers. Callers branch three
/// ways: run as a single command, build an n-stage pipeline, or reject
/// the line without executing anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeScan {
    None,
    Stages(usize),
    Invalid,
}

/// Count standalone `|` tokens and validate their placement. A marker at
/// the start or end of the line, two markers side by side, or a glued
/// marker run (`||`) makes the whole line invalid.
pub fn scan_pipes(cmd: &Command) -> PipeScan {
    if cmd.args().iter().any(|arg| is_marker_run(arg)) {
        return PipeScan::Invalid;
    }
    let markers = cmd
        .args()
        .iter()
        .filter(|arg| arg.as_str() == PIPE_MARKER)
        .count();
    if markers == 0 {
        return PipeScan::None;
    }
    if !marker_positions_valid(cmd) {
        return PipeScan::Invalid;
    }
    PipeScan::Stages(markers + 1)
}

/// Two or more pipe characters fused into one token.
fn is_marker_run(arg: &str) -> bool {
    arg.len() >= 2 && arg.chars().all(|c| c == '|')
}

fn marker_positions_valid(cmd: &Command) -> bool {
    let args = cmd.args();
    for (i, arg) in args.iter().enumerate() {
        if arg == PIPE_MARKER {
            let before_ok = i > 0 && args[i - 1] != PIPE_MARKER;
            let after_ok = i + 1 < args.len() && args[i + 1] != PIPE_MARKER;
            if !before_ok || !after_ok {
                return false;
            }
        }
    }
    true
}

/// A non-empty sequence of commands, one per pipeline stage.
#[derive(Debug)]
pub struct PipelineCommands {
    stages: Vec<Command>,
}

impl PipelineCommands {
    /// Split the raw line on `|` into exactly `num_stages` commands.
    ///
    /// All-or-nothing: an empty segment, a failed tokenization, or a
    /// segment count that disagrees with the marker scan (a `|` glued to
    /// a word) discards the whole pipeline. No partial pipeline is ever
    /// returned.
    pub fn build(num_stages: usize, raw_line: &str) -> Result<PipelineCommands, ShellError> {
        let segments: Vec<&str> = raw_line.split('|').collect();
        if segments.len() != num_stages {
            return Err(ShellError::InvalidPipeUsage);
        }
        let mut stages = Vec::with_capacity(num_stages);
        for segment in segments {
            let segment = segment.trim();
            if segment.is_empty() {
                return Err(ShellError::InvalidPipeUsage);
            }
            stages.push(Command::create(segment)?);
        }
        Ok(PipelineCommands { stages })
    }

    /// A degenerate single-stage pipeline.
    pub fn single(cmd: Command) -> PipelineCommands {
        PipelineCommands { stages: vec![cmd] }
    }

    pub fn num_stages(&self) -> usize {
        self.stages.len()
    }

    pub fn stages(&self) -> &[Command] {
        &self.stages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(line: &str) -> Command {
        Command::create(line).expect("tokenize")
    }

    #[test]
    fn no_markers_means_single_command() {
        assert_eq!(scan_pipes(&cmd("ls -l somewhere")), PipeScan::None);
    }

    #[test]
    fn glued_pipes_are_not_markers() {
        // "|wc" is an ordinary token, not a stage boundary
        assert_eq!(scan_pipes(&cmd("ls |wc")), PipeScan::None);
    }

    #[test]
    fn two_stage_pipeline_is_counted() {
        assert_eq!(scan_pipes(&cmd("ls | wc")), PipeScan::Stages(2));
        assert_eq!(scan_pipes(&cmd("a | b | c")), PipeScan::Stages(3));
    }

    #[test]
    fn leading_trailing_and_adjacent_markers_are_invalid() {
        assert_eq!(scan_pipes(&cmd("| ls")), PipeScan::Invalid);
        assert_eq!(scan_pipes(&cmd("ls |")), PipeScan::Invalid);
        assert_eq!(scan_pipes(&cmd("ls | | wc")), PipeScan::Invalid);
        assert_eq!(scan_pipes(&cmd("ls || wc")), PipeScan::Invalid);
    }

    #[test]
    fn builds_one_command_per_stage() {
        let pipeline = PipelineCommands::build(2, "ls | wc").expect("build");
        assert_eq!(pipeline.num_stages(), 2);
        assert_eq!(pipeline.stages()[0].args(), ["ls"]);
        assert_eq!(pipeline.stages()[1].args(), ["wc"]);
    }

    #[test]
    fn trims_segment_whitespace() {
        let pipeline = PipelineCommands::build(2, "  cat a.txt   |   wc -l ").expect("build");
        assert_eq!(pipeline.stages()[0].args(), ["cat", "a.txt"]);
        assert_eq!(pipeline.stages()[1].args(), ["wc", "-l"]);
    }

    #[test]
    fn blank_segment_discards_the_pipeline() {
        assert!(matches!(
            PipelineCommands::build(2, "ls |   "),
            Err(ShellError::InvalidPipeUsage)
        ));
    }

    #[test]
    fn segment_count_mismatch_discards_the_pipeline() {
        // the scan saw one marker ("|wc" is a word) but the raw line
        // splits into three pieces
        assert!(matches!(
            PipelineCommands::build(2, "ls |wc | x"),
            Err(ShellError::InvalidPipeUsage)
        ));
    }
}
