/// `seamless checksum` command implementation
use anyhow::{Context, Result};
use seamless::calculate_checksum;

use crate::cli::ChecksumArgs;

pub fn run(args: &ChecksumArgs) -> Result<()> {
    let buffer = std::fs::read(&args.file).with_context(|| format!("Failed to read {}", args.file))?;
    println!("{}", calculate_checksum(&buffer));
    Ok(())
}
