use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

use crate::controller::ConcurrencyController;
use crate::distributor::Distributor;
use crate::endpoint::QuotaSnapshot;
use crate::transport::Transport;

/// State persisted between runs: the admission level and each endpoint's quota usage
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub concurrency_level: usize,
    /// Wall-clock capture time in unix seconds; window ages are relative to it
    #[serde(default)]
    pub saved_at: Option<u64>,
    #[serde(default)]
    pub endpoints: BTreeMap<String, QuotaSnapshot>,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |since| since.as_secs())
}

impl Checkpoint {
    /// Captures the current state of a controller and its distributor's endpoints
    #[must_use]
    pub fn capture<T: Transport>(
        controller: &ConcurrencyController,
        distributor: &Distributor<T>,
    ) -> Self {
        Self {
            concurrency_level: controller.current_level(),
            saved_at: Some(unix_now()),
            endpoints: distributor
                .endpoints()
                .iter()
                .map(|e| (e.name().to_string(), e.quota_snapshot()))
                .collect(),
        }
    }

    /// Load a checkpoint, returning `None` if the file does not exist
    ///
    /// # Errors
    ///
    /// This function will return an error if:
    /// - The file exists but cannot be read
    /// - The contents are not a valid checkpoint
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read checkpoint {}", path.display()))?;
        let checkpoint = serde_json::from_str(&contents)
            .with_context(|| format!("Invalid checkpoint {}", path.display()))?;
        Ok(Some(checkpoint))
    }

    /// Write the checkpoint as pretty JSON, replacing any previous one
    ///
    /// # Errors
    ///
    /// This function will return an error if:
    /// - The parent directory cannot be created
    /// - The file cannot be written
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        // write then rename so an interrupted save keeps the previous checkpoint
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json)
            .with_context(|| format!("Failed to write checkpoint {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("Failed to replace checkpoint {}", path.display()))?;
        info!(
            "Checkpoint saved to {} (concurrency {})",
            path.display(),
            self.concurrency_level
        );
        Ok(())
    }

    /// Wall-clock time since the capture, zero if unstamped or the clock went backwards
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.saved_at.map_or(Duration::ZERO, |saved_at| {
            Duration::from_secs(unix_now().saturating_sub(saved_at))
        })
    }

    /// Quota usage for `name` as it stands now, counting the time since the capture
    #[must_use]
    pub fn quota_for(&self, name: &str) -> Option<QuotaSnapshot> {
        let elapsed = self.elapsed();
        self.endpoints
            .get(name)
            .map(|snapshot| snapshot.aged(elapsed))
    }

    /// Restores quota counters onto matching endpoints
    pub fn restore_into<T: Transport>(&self, distributor: &Distributor<T>) {
        debug!("Restoring checkpoint taken {}s ago", self.elapsed().as_secs());
        for name in self.endpoints.keys() {
            match (distributor.endpoint(name), self.quota_for(name)) {
                (Some(endpoint), Some(snapshot)) => endpoint.restore_quota(&snapshot),
                _ => warn!("Checkpoint mentions unknown endpoint {}, ignoring", name),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::WindowSnapshot;
    use tempfile::tempdir;

    #[test]
    fn test_load_missing_is_none() {
        let dir = tempdir().unwrap();
        assert_eq!(Checkpoint::load(&dir.path().join("state.json")).unwrap(), None);
    }

    #[test]
    fn test_save_and_load() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("nested").join("state.json");
        let mut checkpoint = Checkpoint {
            concurrency_level: 4,
            ..Checkpoint::default()
        };
        checkpoint.endpoints.insert(
            "primary".to_string(),
            QuotaSnapshot {
                hour: WindowSnapshot {
                    count: 12,
                    age_seconds: 300,
                },
                ..QuotaSnapshot::default()
            },
        );

        checkpoint.save(&path)?;
        assert_eq!(Checkpoint::load(&path)?, Some(checkpoint));
        assert!(!path.with_extension("tmp").exists());
        Ok(())
    }

    #[test]
    fn test_elapsed_since_capture() {
        let mut checkpoint = Checkpoint::default();
        assert_eq!(checkpoint.elapsed(), Duration::ZERO);

        checkpoint.saved_at = Some(unix_now() - 90);
        assert!(checkpoint.elapsed() >= Duration::from_secs(90));

        // a clock that moved backwards never yields a negative age
        checkpoint.saved_at = Some(unix_now() + 3_600);
        assert_eq!(checkpoint.elapsed(), Duration::ZERO);
    }

    #[test]
    fn test_load_rejects_garbage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(Checkpoint::load(&path).is_err());
    }
}
