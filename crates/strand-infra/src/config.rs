//! Configuration loader for Strand.
//!
//! Reads `config.toml` from the data directory (`~/.strand/` in production)
//! and deserializes it into [`StrandConfig`]. Falls back to defaults when
//! the file is missing or malformed.

use std::path::{Path, PathBuf};

use strand_types::config::StrandConfig;

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "STRAND_DATA_DIR";

/// Resolve the data directory: `$STRAND_DATA_DIR`, else `~/.strand`.
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".strand")
}

/// SQLite URL for the database inside `data_dir`.
pub fn database_url(data_dir: &Path) -> String {
    format!("sqlite://{}?mode=rwc", data_dir.join("strand.db").display())
}

/// Load configuration from `{data_dir}/config.toml`.
///
/// - Missing file: [`StrandConfig::default()`].
/// - Unreadable or malformed file: logs a warning and returns the default.
pub async fn load_config(data_dir: &Path) -> StrandConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return StrandConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return StrandConfig::default();
        }
    };

    match toml::from_str::<StrandConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            StrandConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_types::job::DispatchMode;
    use tempfile::TempDir;

    #[tokio::test]
    async fn missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_config(tmp.path()).await;
        assert_eq!(config.server.port, 7420);
        assert_eq!(config.engine.timer_sweep_interval_ms, 1000);
        assert!(config.webhook.secret.is_none());
    }

    #[tokio::test]
    async fn valid_toml_is_parsed() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join("config.toml"),
            r#"
[engine]
timer_sweep_interval_ms = 250

[dispatch]
mode = "remote"
trigger_url = "http://workers.internal:8080"

[webhook]
secret = "s3cret"
"#,
        )
        .await
        .unwrap();

        let config = load_config(tmp.path()).await;
        assert_eq!(config.engine.timer_sweep_interval_ms, 250);
        assert_eq!(config.engine.timer_batch_size, 100);
        assert_eq!(config.dispatch.mode, DispatchMode::Remote);
        assert_eq!(
            config.dispatch.trigger_url.as_deref(),
            Some("http://workers.internal:8080")
        );
        assert_eq!(config.webhook.secret.as_deref(), Some("s3cret"));
        assert!(!config.webhook.allow_unsigned_callbacks);
    }

    #[tokio::test]
    async fn invalid_toml_returns_default() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join("config.toml"), "this is not { valid toml !!!")
            .await
            .unwrap();

        let config = load_config(tmp.path()).await;
        assert_eq!(config.server.host, "127.0.0.1");
    }

    #[test]
    fn database_url_points_into_data_dir() {
        let url = database_url(Path::new("/tmp/strand-data"));
        assert_eq!(url, "sqlite:///tmp/strand-data/strand.db?mode=rwc");
    }
}
