pub mod cache;
pub mod checksum;
pub mod run;

use std::path::Path;

use anyhow::{Context, Result};
use seamless::{CacheService, Checksum, SeamlessConfig};

use crate::cli::CommonConfigArgs;

/// Config file (explicit or discovered) with command-line overrides applied
pub fn load_config(args: &CommonConfigArgs) -> Result<SeamlessConfig> {
    let mut config = SeamlessConfig::load(args.config.as_deref().map(Path::new))?;
    if let Some(dir) = &args.cache_dir {
        config.cache.dir = dir.clone();
    }
    if let Some(url) = &args.database {
        config.database.url = Some(url.clone());
    }
    if let Some(servers) = &args.buffer_server {
        config.buffer_remote.read_servers = servers.clone();
        config.buffer_remote.write_server = servers.first().cloned();
    }
    if let Some(folders) = &args.buffer_folder {
        config.buffer_remote.read_folders = folders.clone();
    }
    config.validate()?;
    Ok(config)
}

pub async fn open_service(args: &CommonConfigArgs) -> Result<CacheService> {
    let config = load_config(args)?;
    CacheService::from_config(&config)
        .await
        .context("Failed to start cache service")
}

pub fn parse_checksum(text: &str) -> Result<Checksum> {
    Checksum::from_hex(text.trim()).with_context(|| format!("Invalid checksum: {text}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    #[serial]
    fn test_overrides_win_over_config_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("seamless.toml");
        std::fs::write(&path, "[cache]\ndir = \"/from/file\"\n").unwrap();
        let args = CommonConfigArgs {
            config: Some(path.display().to_string()),
            cache_dir: Some("/from/flag".into()),
            buffer_server: Some(vec!["http://localhost:5577".into()]),
            ..Default::default()
        };
        let config = load_config(&args).unwrap();
        assert_eq!(config.cache.dir, "/from/flag");
        assert_eq!(
            config.buffer_remote.write_server.as_deref(),
            Some("http://localhost:5577")
        );
    }

    #[test]
    fn test_bad_checksum_is_reported() {
        let err = parse_checksum("xyz").unwrap_err();
        assert!(err.to_string().contains("Invalid checksum"));
    }
}
