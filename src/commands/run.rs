/// `seamless run` command implementation
///
/// Registers a transformation dict, runs it (or looks its result up) and
/// prints the result checksum.
use anyhow::{Context, Result};
use std::time::Instant;

use seamless::{Celltype, RunOptions, SeamlessError, Transformation};

use crate::cli::{CommonConfigArgs, RunArgs};
use crate::cli_utils::seamless_prefix;

pub async fn run(common: &CommonConfigArgs, args: &RunArgs) -> Result<()> {
    let content = std::fs::read_to_string(&args.transformation)
        .with_context(|| format!("Failed to read transformation: {}", args.transformation))?;
    let dict: serde_json::Value = serde_json::from_str(&content)
        .with_context(|| format!("Transformation is not valid JSON: {}", args.transformation))?;

    let service = super::open_service(common).await?;
    let options = RunOptions {
        fingertip: args.fingertip,
        scratch: args.scratch,
    };

    let start = Instant::now();
    let outcome = service.run_transformation_dict_async(&dict, options).await;
    let result = match outcome {
        Ok(result) => result,
        Err(SeamlessError::Transformation { checksum, message }) => {
            let logs = service.logs(&checksum).await.ok().flatten();
            service.shutdown().await;
            eprintln!("{} Transformation {} failed", seamless_prefix(), checksum);
            if let Some(logs) = logs.filter(|l| !l.is_empty()) {
                eprintln!("{logs}");
            }
            anyhow::bail!("{message}");
        }
        Err(e) => {
            service.shutdown().await;
            return Err(e.into());
        }
    };
    eprintln!(
        "{} Done in {:.2}s",
        seamless_prefix(),
        start.elapsed().as_secs_f64()
    );

    if args.value {
        let transformation = Transformation::from_json(&dict)?;
        let celltype: Celltype = transformation.output.celltype;
        let value = service.get_value_async(result, celltype).await?;
        println!("{}", value.to_json());
    } else {
        println!("{result}");
    }
    service.shutdown().await;
    Ok(())
}
