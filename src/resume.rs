//! Persisted per-segment completion state.
//!
//! One JSON record per job lives in the state directory. Every update is
//! written to a temporary file, synced, and renamed over the previous
//! record, so an interrupted write leaves the old record intact.

use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::ResumeError;
use crate::planner::SegmentPlan;
use crate::state::{CompletionBitmap, JobIdentity, ResumeRecord};

pub struct ResumeStore {
    dir: PathBuf,
    records: Mutex<HashMap<String, ResumeRecord>>,
}

impl ResumeStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            records: Mutex::new(HashMap::new()),
        }
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }

    /// Returns the completed segments of a previous attempt, or `None` when
    /// there is nothing usable. A record whose identity or layout differs
    /// from `plan` is deleted.
    pub async fn load(&self, identity: &JobIdentity, plan: &SegmentPlan) -> Option<CompletionBitmap> {
        let key = identity.record_key();
        let path = self.record_path(&key);
        let content = fs::read_to_string(&path).await.ok()?;

        let record: ResumeRecord = match serde_json::from_str(&content) {
            Ok(record) => record,
            Err(e) => {
                warn!(path = ?path, error = %e, "discarding unreadable resume record");
                let _ = fs::remove_file(&path).await;
                return None;
            }
        };

        if record.identity != *identity {
            info!(
                source = %identity.source,
                "source changed since the last attempt, restarting from scratch"
            );
            let _ = fs::remove_file(&path).await;
            return None;
        }
        if record.segment_count != plan.segment_count() || record.segment_size != plan.segment_size {
            info!(
                source = %identity.source,
                stored = record.segment_count,
                planned = plan.segment_count(),
                "segment layout changed, restarting from scratch"
            );
            let _ = fs::remove_file(&path).await;
            return None;
        }

        let bitmap = record.bitmap();
        debug!(source = %identity.source, done = bitmap.done_count(), "loaded resume record");
        self.records.lock().await.insert(key, record);
        Some(bitmap)
    }

    /// Opens the record for a job about to fetch. Progress already loaded
    /// for the same identity and segment layout is kept.
    pub async fn begin(&self, identity: &JobIdentity, plan: &SegmentPlan) -> Result<(), ResumeError> {
        let key = identity.record_key();
        let mut records = self.records.lock().await;
        let record = records
            .entry(key.clone())
            .or_insert_with(|| ResumeRecord {
                identity: identity.clone(),
                segment_count: plan.segment_count(),
                segment_size: plan.segment_size,
                done: BTreeSet::new(),
                updated_at: Utc::now(),
            });
        if record.identity != *identity
            || record.segment_count != plan.segment_count()
            || record.segment_size != plan.segment_size
        {
            *record = ResumeRecord {
                identity: identity.clone(),
                segment_count: plan.segment_count(),
                segment_size: plan.segment_size,
                done: BTreeSet::new(),
                updated_at: Utc::now(),
            };
        }
        self.persist(&key, record).await
    }

    /// Records one finished segment. Returns once the record is durable.
    pub async fn mark_done(&self, identity: &JobIdentity, index: usize) -> Result<(), ResumeError> {
        let key = identity.record_key();
        let mut records = self.records.lock().await;
        let record = records
            .get_mut(&key)
            .ok_or_else(|| ResumeError::Missing(identity.source.clone()))?;
        record.done.insert(index);
        record.updated_at = Utc::now();
        self.persist(&key, record).await
    }

    pub async fn delete(&self, identity: &JobIdentity) -> Result<(), ResumeError> {
        let key = identity.record_key();
        let mut records = self.records.lock().await;
        records.remove(&key);
        let path = self.record_path(&key);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ResumeError::Io { path, source }),
        }
    }

    /// Every readable record in the state directory.
    pub async fn list(&self) -> Result<Vec<ResumeRecord>, ResumeError> {
        let mut records = vec![];
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(records),
            Err(source) => {
                return Err(ResumeError::Io {
                    path: self.dir.clone(),
                    source,
                })
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            if let Ok(content) = fs::read_to_string(&path).await {
                if let Ok(record) = serde_json::from_str::<ResumeRecord>(&content) {
                    records.push(record);
                }
            }
        }
        records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(records)
    }

    async fn persist(&self, key: &str, record: &ResumeRecord) -> Result<(), ResumeError> {
        fs::create_dir_all(&self.dir).await.map_err(|source| ResumeError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let content = serde_json::to_vec_pretty(record)?;
        write_atomic(&self.record_path(key), &content).await
    }
}

async fn write_atomic(path: &Path, content: &[u8]) -> Result<(), ResumeError> {
    let tmp_path = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4()));
    let io_err = |source| ResumeError::Io {
        path: tmp_path.clone(),
        source,
    };

    let mut file = fs::File::create(&tmp_path).await.map_err(io_err)?;
    file.write_all(content).await.map_err(io_err)?;
    file.sync_all().await.map_err(io_err)?;
    drop(file);

    if let Err(source) = fs::rename(&tmp_path, path).await {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(ResumeError::Io {
            path: path.to_path_buf(),
            source,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::{self, SourceProbe};
    use tempfile::tempdir;

    fn identity(etag: &str, length: u64) -> JobIdentity {
        JobIdentity {
            source: "https://example.com/watch?v=abc#137".into(),
            destination: PathBuf::from("/downloads/clip.f137.mp4.part"),
            content_length: Some(length),
            etag: Some(etag.into()),
        }
    }

    fn plan_for(length: u64, segment: u64) -> SegmentPlan {
        let probe = SourceProbe {
            content_length: Some(length),
            accept_ranges: true,
            etag: None,
        };
        planner::plan(&probe, segment, 16)
    }

    #[tokio::test]
    async fn test_load_without_record_is_none() {
        let dir = tempdir().unwrap();
        let store = ResumeStore::new(dir.path());
        assert!(store.load(&identity("a", 400), &plan_for(400, 100)).await.is_none());
    }

    #[tokio::test]
    async fn test_mark_done_survives_reload() {
        let dir = tempdir().unwrap();
        let id = identity("a", 400);
        let plan = plan_for(400, 100);
        {
            let store = ResumeStore::new(dir.path());
            store.begin(&id, &plan).await.unwrap();
            for i in [0, 1, 3] {
                store.mark_done(&id, i).await.unwrap();
            }
        }

        let store = ResumeStore::new(dir.path());
        let bitmap = store.load(&id, &plan).await.unwrap();
        assert_eq!(bitmap.done_indices().collect::<Vec<_>>(), vec![0, 1, 3]);

        // loaded progress is kept when the job begins again
        store.begin(&id, &plan).await.unwrap();
        store.mark_done(&id, 2).await.unwrap();
        let fresh = ResumeStore::new(dir.path());
        assert_eq!(fresh.load(&id, &plan).await.unwrap().done_count(), 4);
    }

    #[tokio::test]
    async fn test_changed_etag_discards_record() {
        let dir = tempdir().unwrap();
        let plan = plan_for(400, 100);
        let store = ResumeStore::new(dir.path());
        store.begin(&identity("v1", 400), &plan).await.unwrap();
        store.mark_done(&identity("v1", 400), 0).await.unwrap();

        let store = ResumeStore::new(dir.path());
        assert!(store.load(&identity("v2", 400), &plan).await.is_none());
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_changed_length_discards_record() {
        let dir = tempdir().unwrap();
        let store = ResumeStore::new(dir.path());
        store.begin(&identity("v1", 400), &plan_for(400, 100)).await.unwrap();

        let store = ResumeStore::new(dir.path());
        assert!(store.load(&identity("v1", 500), &plan_for(500, 100)).await.is_none());
    }

    #[tokio::test]
    async fn test_segment_count_mismatch_is_none() {
        let dir = tempdir().unwrap();
        let id = identity("v1", 400);
        let store = ResumeStore::new(dir.path());
        store.begin(&id, &plan_for(400, 100)).await.unwrap();

        let store = ResumeStore::new(dir.path());
        assert!(store.load(&id, &plan_for(400, 200)).await.is_none());
    }

    #[tokio::test]
    async fn test_begin_resets_on_segment_size_change() {
        let dir = tempdir().unwrap();
        let id = identity("v1", 400);
        let store = ResumeStore::new(dir.path());
        let old = plan_for(400, 100);
        store.begin(&id, &old).await.unwrap();
        store.mark_done(&id, 0).await.unwrap();

        // same segment count, different boundaries
        let new = plan_for(400, 101);
        assert_eq!(new.segment_count(), old.segment_count());
        store.begin(&id, &new).await.unwrap();

        let records = store.list().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].segment_size, 101);
        assert!(records[0].done.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_record_is_discarded() {
        let dir = tempdir().unwrap();
        let id = identity("v1", 400);
        std::fs::write(dir.path().join(format!("{}.json", id.record_key())), b"{ not json").unwrap();

        let store = ResumeStore::new(dir.path());
        assert!(store.load(&id, &plan_for(400, 100)).await.is_none());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_delete_and_no_temp_files_left() {
        let dir = tempdir().unwrap();
        let id = identity("v1", 400);
        let store = ResumeStore::new(dir.path());
        store.begin(&id, &plan_for(400, 100)).await.unwrap();
        store.mark_done(&id, 1).await.unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec![format!("{}.json", id.record_key())]);

        store.delete(&id).await.unwrap();
        assert!(store.list().await.unwrap().is_empty());
        // deleting twice is fine
        store.delete(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_mark_done_without_begin_fails() {
        let dir = tempdir().unwrap();
        let store = ResumeStore::new(dir.path());
        let err = store.mark_done(&identity("v1", 400), 0).await.unwrap_err();
        assert!(matches!(err, ResumeError::Missing(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_mark_done() {
        let dir = tempdir().unwrap();
        let id = identity("v1", 1600);
        let plan = plan_for(1600, 100);
        let store = std::sync::Arc::new(ResumeStore::new(dir.path()));
        store.begin(&id, &plan).await.unwrap();

        let mut handles = vec![];
        for i in 0..16 {
            let store = store.clone();
            let id = id.clone();
            handles.push(tokio::spawn(async move { store.mark_done(&id, i).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let fresh = ResumeStore::new(dir.path());
        assert_eq!(fresh.load(&id, &plan).await.unwrap().done_count(), 16);
    }
}
