//! SwitchCrypt device tool
//!
//! Creates, verifies or journal-wipes a backing file and prints a JSON
//! summary of the device.

use anyhow::Context;
use std::path::{Path, PathBuf};
use switchcrypt::cli::{parse_args, RunMode};
use switchcrypt::{Capabilities, Device, FileCounter};
use tracing::info;

/// Side file emulating the counter device for a backing file
fn counter_path(backing_file: &Path) -> PathBuf {
    let mut name = backing_file.as_os_str().to_owned();
    name.push(".counter");
    PathBuf::from(name)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let invocation = parse_args(std::env::args_os())?.into_invocation()?;
    let counter = FileCounter::new(counter_path(&invocation.backing_file));
    let caps = Capabilities::new(counter);

    info!("Mode {:?} on {:?}", invocation.mode, invocation.backing_file);

    let mut device = match invocation.mode {
        RunMode::Create => Device::create(
            &invocation.backing_file,
            &invocation.config,
            &invocation.password,
            caps,
        )
        .with_context(|| format!("creating {}", invocation.backing_file.display()))?,
        RunMode::Open | RunMode::Wipe => Device::open(
            &invocation.backing_file,
            &invocation.config,
            &invocation.password,
            caps,
            invocation.ignore_integrity,
        )
        .with_context(|| format!("opening {}", invocation.backing_file.display()))?,
    };

    if invocation.mode == RunMode::Wipe {
        device.wipe_journal()?;
    }

    info!("Header root {}", hex::encode(device.merkle_tree().root()));
    println!("{}", serde_json::to_string_pretty(&device.stats())?);

    device.close()?;
    Ok(())
}
