use std::fs::OpenOptions;

use anyhow::{bail, Result};

use exfat::{ExfatVolume, MountError};
use imgsh::shell::Shell;

const USAGE: &str = "usage: imgsh <volume.img> [-o <log-file>]";

fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let mut image: Option<String> = None;
    let mut log_path: Option<String> = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-o" | "--log" => {
                let value = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("missing value after -o"))?;
                log_path = Some(value);
            }
            "-h" | "--help" => {
                eprintln!("{USAGE}");
                return Ok(());
            }
            other if image.is_none() => image = Some(other.to_string()),
            other => bail!("unknown arg: {other}"),
        }
    }
    let Some(image) = image else { bail!("{USAGE}") };

    let volume = match ExfatVolume::mount(&image) {
        Ok(volume) => volume,
        Err(MountError::FsckFail(_)) => {
            eprintln!("{image} is inconsistent, not mounting.");
            std::process::exit(1);
        }
        Err(err) => {
            eprintln!("{image}: {err}");
            std::process::exit(1);
        }
    };

    let log = match &log_path {
        Some(path) => Some(
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?,
        ),
        None => None,
    };

    Shell::new(volume, log).run()
}
