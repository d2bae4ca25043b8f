use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::repository::DurableUserRepository;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Compact the WAL whenever more than `threshold` events were appended since
/// the last compaction. Runs until the repository is dropped elsewhere and
/// this task holds the last reference.
pub async fn run_compactor(repo: Arc<DurableUserRepository>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        if Arc::strong_count(&repo) == 1 {
            debug!("repository dropped, compactor exiting");
            return;
        }
        compact_if_needed(&repo, threshold).await;
    }
}

/// Returns true if a compaction ran and succeeded.
pub async fn compact_if_needed(repo: &DurableUserRepository, threshold: u64) -> bool {
    let appends = repo.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match repo.compact_wal().await {
        Ok(()) => {
            metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL, "status" => "ok")
                .increment(1);
            info!("compacted WAL after {appends} appends");
            true
        }
        Err(e) => {
            metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL, "status" => "error")
                .increment(1);
            warn!("WAL compaction failed: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use crate::repository::UserRepository;
    use std::path::PathBuf;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("haven_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let repo = DurableUserRepository::open(path).unwrap();
        repo.create(User::new("a@x.com", None, None)).await.unwrap();
        for i in 0..4 {
            repo.update("a@x.com", UserPatch::PushFavorite(format!("R{i}")))
                .await
                .unwrap();
        }

        assert!(!compact_if_needed(&repo, 10).await);
        assert_eq!(repo.wal_appends_since_compact().await, 5);

        assert!(compact_if_needed(&repo, 5).await);
        assert_eq!(repo.wal_appends_since_compact().await, 0);

        let user = repo.find_by_email("a@x.com").await.unwrap().unwrap();
        assert_eq!(user.fav_residencies_id.len(), 4);
    }
}
