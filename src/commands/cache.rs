/// Commands that act on a single checksum: fingertip, status, undo, clear-exception
use anyhow::Result;
use serde::Serialize;
use std::io::Write;

use seamless::TransformationStatus;

use crate::cli::{ChecksumTarget, CommonConfigArgs};
use crate::cli_utils::seamless_prefix;

#[derive(Serialize)]
struct StatusOutput {
    checksum: String,
    code: i32,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    progress: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    exception: Option<String>,
}

impl StatusOutput {
    fn new(checksum: String, status: TransformationStatus) -> Self {
        let code = status.code();
        let mut output = Self {
            checksum,
            code,
            status: "",
            result: None,
            progress: None,
            exception: None,
        };
        output.status = match status {
            TransformationStatus::Done(result) => {
                output.result = Some(result.to_hex());
                "done"
            }
            TransformationStatus::Running { progress, preliminary } => {
                output.progress = progress;
                output.result = preliminary.map(|p| p.to_hex());
                "running"
            }
            TransformationStatus::Error(exception) => {
                output.exception = Some(exception);
                "error"
            }
            TransformationStatus::Unknown => "unknown",
            TransformationStatus::NotRunnable => "not runnable",
            TransformationStatus::InputsUnavailable => "inputs unavailable",
            TransformationStatus::Runnable => "runnable",
        };
        output
    }
}

pub async fn fingertip(common: &CommonConfigArgs, target: &ChecksumTarget) -> Result<()> {
    let checksum = super::parse_checksum(&target.checksum)?;
    let service = super::open_service(common).await?;
    let buffer = service.fingertip_async(checksum).await;
    service.shutdown().await;
    std::io::stdout().write_all(&buffer?)?;
    Ok(())
}

pub async fn status(common: &CommonConfigArgs, target: &ChecksumTarget) -> Result<()> {
    let checksum = super::parse_checksum(&target.checksum)?;
    let service = super::open_service(common).await?;
    let status = service.status(&checksum).await;
    service.shutdown().await;
    let output = StatusOutput::new(checksum.to_hex(), status?);
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

pub async fn undo(common: &CommonConfigArgs, target: &ChecksumTarget) -> Result<()> {
    let checksum = super::parse_checksum(&target.checksum)?;
    let service = super::open_service(common).await?;
    let undone = service.undo(&checksum).await;
    service.shutdown().await;
    let result = undone?;
    eprintln!("{} Forgot result {} of {}", seamless_prefix(), result, checksum);
    Ok(())
}

pub async fn clear_exception(common: &CommonConfigArgs, target: &ChecksumTarget) -> Result<()> {
    let checksum = super::parse_checksum(&target.checksum)?;
    let service = super::open_service(common).await?;
    let cleared = service.clear_exception(&checksum).await;
    service.shutdown().await;
    if cleared? {
        eprintln!("{} Cleared exception of {}", seamless_prefix(), checksum);
    } else {
        eprintln!("{} No exception recorded for {}", seamless_prefix(), checksum);
    }
    Ok(())
}
