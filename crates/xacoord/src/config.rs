//! Configuration loading and logging setup

use anyhow::Result;
use tracing_subscriber::EnvFilter;
use xacoord_common::config::{Config, LoggingConfig};

/// Load configuration from file, falling back to defaults when it is missing
pub async fn load(path: &str, log_dir: Option<String>) -> Result<Config> {
    let mut config = Config::load_or_default(path)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    if let Some(dir) = log_dir {
        config.log.dir = dir;
    }
    config.validate().map_err(|e| anyhow::anyhow!(e))?;
    Ok(config)
}

/// Initialize tracing; `RUST_LOG` directives override the configured level
pub fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("xacoord={}", logging.level)))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_log_dir_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.toml");

        let config = load(path.to_str().unwrap(), Some("/tmp/xa-log".to_string()))
            .await
            .unwrap();
        assert_eq!(config.log.dir, "/tmp/xa-log");
        assert_eq!(config.transaction.default_timeout_secs, 120);
    }
}
