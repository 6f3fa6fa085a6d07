//! End-to-end executor tests against an in-memory volume.
//!
//! The external-command tests copy real host binaries into the volume so
//! the executor genuinely forks and replaces process images; they skip
//! (with a note) on hosts that lack them.

use std::fs;
use std::io::{Read, Seek, SeekFrom};

use exfat::MemVolume;
use imgsh::command::Command;
use imgsh::errors::ShellError;
use imgsh::exec::{load_image, run_pipeline, run_single, ExecContext};
use imgsh::pipeline::PipelineCommands;

fn host_binary(name: &str) -> Option<Vec<u8>> {
    ["/bin", "/usr/bin"]
        .iter()
        .find_map(|dir| fs::read(format!("{dir}/{name}")).ok())
}

fn log_contents(mut log: fs::File) -> String {
    log.seek(SeekFrom::Start(0)).expect("rewind log");
    let mut content = String::new();
    log.read_to_string(&mut content).expect("read log");
    content
}

#[test]
fn loader_copies_the_whole_file_and_rewinds() {
    let mut volume = MemVolume::new("TEST");
    let payload: Vec<u8> = (0..10_000u32).flat_map(|i| i.to_le_bytes()).collect();
    volume.add_file("/blob", payload.clone());

    let memory = load_image(&mut volume, "/blob", "blob").expect("load");
    let mut file = fs::File::from(memory);
    assert_eq!(file.stream_position().expect("position"), 0);
    let mut copied = Vec::new();
    file.read_to_end(&mut copied).expect("read back");
    assert_eq!(copied, payload);
}

#[test]
fn missing_command_is_reported_without_spawning() {
    let mut volume = MemVolume::new("TEST");
    let ctx = ExecContext { cwd: "/", log: None };
    let cmd = Command::create("nosuch").expect("cmd");
    match run_single(&mut volume, &ctx, &cmd) {
        Err(ShellError::CommandNotFound(name)) => assert_eq!(name, "nosuch"),
        other => panic!("expected CommandNotFound, got {other:?}"),
    }
}

#[test]
fn missing_redirect_file_is_reported_without_spawning() {
    let Some(cat) = host_binary("cat") else {
        eprintln!("skipping: no host cat binary");
        return;
    };
    let mut volume = MemVolume::new("TEST");
    volume.add_file("/cat", cat);
    let ctx = ExecContext { cwd: "/", log: None };
    let cmd = Command::create("cat < missing.txt").expect("cmd");
    match run_single(&mut volume, &ctx, &cmd) {
        Err(ShellError::RedirectNotFound(file)) => assert_eq!(file, "missing.txt"),
        other => panic!("expected RedirectNotFound, got {other:?}"),
    }
}

#[test]
fn single_command_output_is_teed_to_the_log() {
    let Some(echo) = host_binary("echo") else {
        eprintln!("skipping: no host echo binary");
        return;
    };
    let mut volume = MemVolume::new("TEST");
    volume.add_file("/echo", echo);

    let log = tempfile::tempfile().expect("log");
    let ctx = ExecContext {
        cwd: "/",
        log: Some(&log),
    };
    let cmd = Command::create("echo hi").expect("cmd");
    let status = run_single(&mut volume, &ctx, &cmd).expect("run");
    assert!(status.success());
    assert_eq!(log_contents(log), "hi\n");
}

#[test]
fn redirection_replaces_standard_input() {
    let Some(cat) = host_binary("cat") else {
        eprintln!("skipping: no host cat binary");
        return;
    };
    let mut volume = MemVolume::new("TEST");
    volume.add_file("/cat", cat);
    volume.add_file("/notes.txt", b"from the volume\n".to_vec());

    let log = tempfile::tempfile().expect("log");
    let ctx = ExecContext {
        cwd: "/",
        log: Some(&log),
    };
    let cmd = Command::create("cat < notes.txt").expect("cmd");
    let status = run_single(&mut volume, &ctx, &cmd).expect("run");
    assert!(status.success());
    assert_eq!(log_contents(log), "from the volume\n");
}

#[test]
fn two_stage_pipeline_wires_stdout_to_stdin() {
    let (Some(echo), Some(cat)) = (host_binary("echo"), host_binary("cat")) else {
        eprintln!("skipping: no host echo/cat binaries");
        return;
    };
    let mut volume = MemVolume::new("TEST");
    volume.add_file("/echo", echo);
    volume.add_file("/cat", cat);

    let log = tempfile::tempfile().expect("log");
    let ctx = ExecContext {
        cwd: "/",
        log: Some(&log),
    };
    let pipeline = PipelineCommands::build(2, "echo across the pipe | cat").expect("build");
    let status = run_pipeline(&mut volume, &ctx, &pipeline).expect("run");
    assert!(status.success());
    assert_eq!(status.stage_statuses().len(), 2);
    assert_eq!(status.last(), 0);
    assert_eq!(log_contents(log), "across the pipe\n");
}

#[test]
fn single_stage_pipeline_takes_the_degenerate_path() {
    let Some(echo) = host_binary("echo") else {
        eprintln!("skipping: no host echo binary");
        return;
    };
    let mut volume = MemVolume::new("TEST");
    volume.add_file("/echo", echo);

    let log = tempfile::tempfile().expect("log");
    let ctx = ExecContext {
        cwd: "/",
        log: Some(&log),
    };
    let cmd = Command::create("echo lone stage").expect("cmd");
    let status = run_pipeline(&mut volume, &ctx, &PipelineCommands::single(cmd)).expect("run");
    assert!(status.success());
    assert_eq!(log_contents(log), "lone stage\n");
}

#[test]
fn missing_stage_surfaces_as_a_nonzero_status() {
    let Some(echo) = host_binary("echo") else {
        eprintln!("skipping: no host echo binary");
        return;
    };
    let mut volume = MemVolume::new("TEST");
    volume.add_file("/echo", echo);

    let ctx = ExecContext { cwd: "/", log: None };
    let pipeline = PipelineCommands::build(2, "echo hi | nosuch").expect("build");
    let status = run_pipeline(&mut volume, &ctx, &pipeline).expect("run");
    assert!(!status.success());
    assert_eq!(status.stage_statuses()[1], 127);
}
