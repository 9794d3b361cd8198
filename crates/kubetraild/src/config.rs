//! kubetraild.toml configuration parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use kubetrail_ingest::IngestOptions;
use kubetrail_retention::RetentionConfig;
use kubetrail_store::Granularity;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrailConfig {
    pub store: StoreConfig,
    pub retention: RetentionSection,
    pub ingest: IngestConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
    pub partition: Granularity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionSection {
    pub max_lookback: String,
    /// Zero disables the size trigger.
    pub max_disk_mb: u64,
    pub interval: String,
    pub deletion_batch_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub channel_capacity: usize,
    pub keep_minor_node_updates: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/kubetrail"),
            partition: Granularity::Hour,
        }
    }
}

impl Default for RetentionSection {
    fn default() -> Self {
        Self {
            max_lookback: "14d".to_string(),
            max_disk_mb: 32 * 1024,
            interval: "30m".to_string(),
            deletion_batch_size: 1000,
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1000,
            keep_minor_node_updates: false,
        }
    }
}

impl TrailConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: TrailConfig = toml::from_str(&content)?;
        config.retention()?;
        Ok(config)
    }

    /// Load `path` when given, otherwise use defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.store.data_dir.join("kubetrail.redb")
    }

    pub fn retention(&self) -> anyhow::Result<RetentionConfig> {
        let section = &self.retention;
        Ok(RetentionConfig {
            max_lookback: parse_duration(&section.max_lookback)
                .with_context(|| format!("invalid max_lookback {:?}", section.max_lookback))?,
            max_disk_bytes: section.max_disk_mb.saturating_mul(1024 * 1024),
            interval: parse_duration(&section.interval)
                .with_context(|| format!("invalid interval {:?}", section.interval))?,
        })
    }

    pub fn ingest_options(&self) -> IngestOptions {
        IngestOptions {
            keep_minor_node_updates: self.ingest.keep_minor_node_updates,
        }
    }
}

/// Parse a duration string like "500ms", "30s", "5m", "2h", "14d".
/// A bare number is taken as seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    let (value, unit_secs) = if let Some(ms) = s.strip_suffix("ms") {
        return ms.parse::<u64>().ok().map(Duration::from_millis);
    } else if let Some(secs) = s.strip_suffix('s') {
        (secs, 1)
    } else if let Some(mins) = s.strip_suffix('m') {
        (mins, 60)
    } else if let Some(hours) = s.strip_suffix('h') {
        (hours, 3_600)
    } else if let Some(days) = s.strip_suffix('d') {
        (days, 86_400)
    } else {
        (s, 1)
    };
    value
        .parse::<u64>()
        .ok()
        .and_then(|v| v.checked_mul(unit_secs))
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("2h"), Some(Duration::from_secs(7_200)));
        assert_eq!(parse_duration("14d"), Some(Duration::from_secs(14 * 86_400)));
        assert_eq!(parse_duration("90"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration("soon"), None);
        assert_eq!(parse_duration(""), None);
    }

    #[test]
    fn defaults_when_sections_missing() {
        let config: TrailConfig = toml::from_str("").unwrap();
        assert_eq!(config.store.partition, Granularity::Hour);
        assert_eq!(config.ingest.channel_capacity, 1000);
        assert!(!config.ingest.keep_minor_node_updates);

        let retention = config.retention().unwrap();
        assert_eq!(retention.max_lookback, Duration::from_secs(14 * 86_400));
        assert_eq!(retention.interval, Duration::from_secs(1_800));
        assert_eq!(retention.max_disk_bytes, 32 * 1024 * 1024 * 1024);
    }

    #[test]
    fn parse_full_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kubetraild.toml");
        std::fs::write(
            &path,
            r#"
[store]
data_dir = "/tmp/trail"
partition = "day"

[retention]
max_lookback = "7d"
max_disk_mb = 0
interval = "10m"
deletion_batch_size = 250

[ingest]
channel_capacity = 64
keep_minor_node_updates = true
"#,
        )
        .unwrap();

        let config = TrailConfig::from_file(&path).unwrap();
        assert_eq!(config.store.partition, Granularity::Day);
        assert_eq!(config.db_path(), PathBuf::from("/tmp/trail/kubetrail.redb"));
        assert_eq!(config.retention.deletion_batch_size, 250);
        assert_eq!(config.ingest.channel_capacity, 64);
        assert!(config.ingest_options().keep_minor_node_updates);

        let retention = config.retention().unwrap();
        assert_eq!(retention.max_disk_bytes, 0);
        assert_eq!(retention.max_lookback, Duration::from_secs(7 * 86_400));
    }

    #[test]
    fn bad_duration_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kubetraild.toml");
        std::fs::write(&path, "[retention]\ninterval = \"often\"\n").unwrap();
        assert!(TrailConfig::from_file(&path).is_err());
    }

    #[test]
    fn unknown_partition_rejected() {
        assert!(toml::from_str::<TrailConfig>("[store]\npartition = \"week\"\n").is_err());
    }
}
