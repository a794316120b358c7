//! Load consumer targets from the rule configuration file and cache them.
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time;

use mailhook_common::target::{parse_targets, ConsumerTarget};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::TargetStoreError;
use crate::metrics_consts::{TARGETS_LOADED_GAUGE, TARGETS_REJECTED_COUNTER};

struct CachedTargets {
    targets: Arc<[ConsumerTarget]>,
    loaded_at: Instant,
}

/// Serves immutable snapshots of the consumer targets, re-reading the configuration file once
/// the cached copy is older than the TTL.
pub struct TargetStore {
    path: Option<PathBuf>,
    ttl: time::Duration,
    cache: Mutex<Option<CachedTargets>>,
}

impl TargetStore {
    pub fn new(path: impl Into<PathBuf>, ttl: time::Duration) -> Self {
        Self {
            path: Some(path.into()),
            ttl,
            cache: Mutex::new(None),
        }
    }

    /// A store that always serves the given targets.
    pub fn from_targets(targets: Vec<ConsumerTarget>) -> Self {
        Self {
            path: None,
            ttl: time::Duration::MAX,
            cache: Mutex::new(Some(CachedTargets {
                targets: targets.into(),
                loaded_at: Instant::now(),
            })),
        }
    }

    /// Return the current targets. When a reload fails and an older snapshot exists, the older
    /// snapshot keeps being served and the reload is attempted again on the next call.
    pub async fn snapshot(&self) -> Result<Arc<[ConsumerTarget]>, TargetStoreError> {
        let mut cache = self.cache.lock().await;

        if let Some(cached) = cache.as_ref() {
            if self.path.is_none() || cached.loaded_at.elapsed() < self.ttl {
                return Ok(cached.targets.clone());
            }
        }

        let Some(path) = self.path.as_ref() else {
            return Ok(Arc::from(Vec::new()));
        };

        match load(path).await {
            Ok(targets) => {
                *cache = Some(CachedTargets {
                    targets: targets.clone(),
                    loaded_at: Instant::now(),
                });
                Ok(targets)
            }
            Err(e) => match cache.as_ref() {
                Some(stale) => {
                    warn!(
                        path = %path.display(),
                        "failed to reload targets, serving previous configuration: {}", e
                    );
                    Ok(stale.targets.clone())
                }
                None => Err(e),
            },
        }
    }
}

async fn load(path: &Path) -> Result<Arc<[ConsumerTarget]>, TargetStoreError> {
    let document =
        tokio::fs::read_to_string(path)
            .await
            .map_err(|error| TargetStoreError::Io {
                path: path.display().to_string(),
                error,
            })?;

    let parsed = parse_targets(&document)?;

    for rejected in &parsed.rejected {
        warn!(path = %path.display(), "rejected consumer target: {}", rejected);
    }
    metrics::counter!(TARGETS_REJECTED_COUNTER).increment(parsed.rejected.len() as u64);

    for target in &parsed.targets {
        for problem in target.rule.problems() {
            warn!(
                target_name = target.label(),
                "condition will never match: {}", problem
            );
        }
    }

    let enabled = parsed.targets.iter().filter(|t| t.enabled).count();
    info!(
        path = %path.display(),
        loaded = parsed.targets.len(),
        enabled,
        rejected = parsed.rejected.len(),
        "loaded consumer targets"
    );
    metrics::gauge!(TARGETS_LOADED_GAUGE).set(parsed.targets.len() as f64);

    Ok(parsed.targets.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailhook_common::target::Endpoint;
    use uuid::Uuid;

    fn temp_path() -> PathBuf {
        std::env::temp_dir().join(format!("mailhook-targets-{}.json", Uuid::now_v7()))
    }

    #[tokio::test]
    async fn test_snapshot_loads_file_and_skips_invalid_targets() {
        let path = temp_path();
        std::fs::write(
            &path,
            r#"{"targets": [
                {"id": "a", "endpoint": {"url": "https://a"}},
                {"id": "", "endpoint": {"url": "https://b"}},
                {"id": "c", "enabled": false, "endpoint": {"url": "https://c"}}
            ]}"#,
        )
        .unwrap();

        let store = TargetStore::new(&path, time::Duration::from_secs(300));
        let targets = store.snapshot().await.expect("targets should load");

        let ids: Vec<&str> = targets.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);

        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_is_cached_until_ttl() {
        let path = temp_path();
        std::fs::write(&path, r#"[{"id": "a", "endpoint": {"url": "https://a"}}]"#).unwrap();

        let store = TargetStore::new(&path, time::Duration::from_secs(300));
        let first = store.snapshot().await.unwrap();

        std::fs::write(&path, r#"[]"#).unwrap();
        let second = store.snapshot().await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.len(), 1);

        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_reloads_after_ttl_and_keeps_last_good_config() {
        let path = temp_path();
        std::fs::write(&path, r#"[{"id": "a", "endpoint": {"url": "https://a"}}]"#).unwrap();

        let store = TargetStore::new(&path, time::Duration::ZERO);
        assert_eq!(store.snapshot().await.unwrap().len(), 1);

        std::fs::write(
            &path,
            r#"[{"id": "a", "endpoint": {"url": "https://a"}},
                {"id": "b", "endpoint": {"url": "https://b"}}]"#,
        )
        .unwrap();
        assert_eq!(store.snapshot().await.unwrap().len(), 2);

        std::fs::write(&path, "{ not json").unwrap();
        assert_eq!(store.snapshot().await.unwrap().len(), 2);

        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn test_missing_file_without_previous_config_is_an_error() {
        let store = TargetStore::new(temp_path(), time::Duration::from_secs(300));

        assert!(matches!(
            store.snapshot().await,
            Err(TargetStoreError::Io { .. })
        ));
    }

    #[tokio::test]
    async fn test_from_targets() {
        let store = TargetStore::from_targets(vec![ConsumerTarget {
            id: "fixed".to_owned(),
            name: String::new(),
            enabled: true,
            rule: Default::default(),
            endpoint: Endpoint::new("https://fixed"),
        }]);

        assert_eq!(store.snapshot().await.unwrap()[0].id, "fixed");
    }

    #[tokio::test]
    async fn test_bundled_targets_load_cleanly() {
        let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("config/targets.json");
        let store = TargetStore::new(path, time::Duration::from_secs(300));

        let targets = store.snapshot().await.expect("bundled targets should load");

        assert_eq!(targets.len(), 3);
        assert!(targets.iter().all(|t| t.rule.problems().is_empty()));
        assert!(!targets[2].enabled);
    }
}
