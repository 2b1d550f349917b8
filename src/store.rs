use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use image::GrayImage;
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::{
    error::{Error, Result},
    slip::SlipRecord,
};

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(10);

/// Remote gallery backend. One flat row per slip, keyed by the slip UUID so
/// a retried upload can never duplicate a record.
pub struct RecordStoreClient {
    http: reqwest::Client,
    url: String,
    key: String,
}

impl RecordStoreClient {
    pub fn new(url: &str, key: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.to_string(),
            key: key.to_string(),
        }
    }

    pub async fn upload(&self, record: &SlipRecord) -> Result<()> {
        let response = self
            .http
            .post(&self.url)
            .bearer_auth(&self.key)
            .header("Idempotency-Key", record.slip_uuid.to_string())
            .timeout(UPLOAD_TIMEOUT)
            .json(record)
            .send()
            .await
            .map_err(|err| Error::Upload(err.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::Upload(format!("HTTP {}", response.status())));
        }
        Ok(())
    }
}

/// Append-only slip log: one `<uuid>.json` per slip, with optional
/// `<uuid>.png` and `<uuid>.svg` figurine sidecars. Records are never
/// rewritten except to flip `uploaded` once the remote store has accepted
/// them.
pub struct SlipStore {
    dir: PathBuf,
    remote: Option<RecordStoreClient>,
}

impl SlipStore {
    pub fn new(dir: &Path, remote: Option<RecordStoreClient>) -> Result<Self> {
        fs::create_dir_all(dir)?;
        if remote.is_none() {
            info!("No record store configured, slips stay local");
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            remote,
        })
    }

    pub fn persist(
        &self,
        record: &SlipRecord,
        figurine: Option<&GrayImage>,
        vector: Option<&str>,
    ) -> Result<PathBuf> {
        let path = self.record_path(record.slip_uuid);
        if path.exists() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("slip {} already logged", record.slip_uuid),
            )));
        }

        fs::write(&path, serde_json::to_string_pretty(record)?)?;
        if let Some(bitmap) = figurine {
            let png_path = self.dir.join(format!("{}.png", record.slip_uuid));
            if let Err(err) = bitmap.save(&png_path) {
                warn!("Could not save figurine sidecar: {err}");
            }
        }
        if let Some(svg) = vector {
            let svg_path = self.dir.join(format!("{}.svg", record.slip_uuid));
            if let Err(err) = fs::write(&svg_path, svg) {
                warn!("Could not save vector sidecar: {err}");
            }
        }

        debug!("Slip {} logged at {}", record.slip_uuid, path.display());
        Ok(path)
    }

    /// Writes the record locally, then tries the remote store once. An upload
    /// failure leaves the record pending for a later flush.
    pub async fn persist_and_upload(
        &self,
        record: &SlipRecord,
        figurine: Option<&GrayImage>,
        vector: Option<&str>,
    ) -> Result<()> {
        self.persist(record, figurine, vector)?;

        if let Some(remote) = &self.remote {
            match remote.upload(record).await {
                Ok(()) => self.mark_uploaded(record.slip_uuid)?,
                Err(err) => warn!("Slip {} stays pending: {err}", record.slip_uuid),
            }
        }
        Ok(())
    }

    /// The one permitted mutation of a logged slip.
    pub fn mark_uploaded(&self, slip_uuid: Uuid) -> Result<()> {
        let path = self.record_path(slip_uuid);
        let mut record: SlipRecord = serde_json::from_str(&fs::read_to_string(&path)?)?;
        record.uploaded = true;
        fs::write(&path, serde_json::to_string_pretty(&record)?)?;
        Ok(())
    }

    /// Records logged but not yet accepted by the remote store, oldest first.
    pub fn pending(&self) -> Vec<SlipRecord> {
        let mut records: Vec<SlipRecord> = WalkDir::new(&self.dir)
            .max_depth(1)
            .into_iter()
            .filter_map(std::result::Result::ok)
            .filter(|entry| {
                entry.file_type().is_file()
                    && entry.path().extension().is_some_and(|ext| ext == "json")
            })
            .filter_map(|entry| {
                let raw = fs::read_to_string(entry.path()).ok()?;
                serde_json::from_str::<SlipRecord>(&raw).ok()
            })
            .filter(|record| !record.uploaded)
            .collect();

        records.sort_by_key(|record| record.generated_at);
        records
    }

    /// Retries pending uploads; called at the start of every cycle. Stops at
    /// the first failure since the store is most likely unreachable.
    pub async fn flush_pending(&self) -> usize {
        let Some(remote) = &self.remote else {
            return 0;
        };

        let mut flushed = 0;
        for record in self.pending() {
            match remote.upload(&record).await {
                Ok(()) => match self.mark_uploaded(record.slip_uuid) {
                    Ok(()) => flushed += 1,
                    Err(err) => warn!("Uploaded slip {} but could not flag it: {err}", record.slip_uuid),
                },
                Err(err) => {
                    warn!("Flush stopped at slip {}: {err}", record.slip_uuid);
                    break;
                }
            }
        }

        if flushed > 0 {
            info!("Flushed {flushed} pending slip(s)");
        }
        flushed
    }

    fn record_path(&self, slip_uuid: Uuid) -> PathBuf {
        self.dir.join(format!("{slip_uuid}.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use image::Luma;

    fn record_with(figurine_id: u32, at_secs: i64) -> SlipRecord {
        SlipRecord {
            slip_uuid: Uuid::new_v4(),
            figurine_id,
            answer_indices: [0; 6],
            paragraph1: "First.".to_string(),
            paragraph2: "Second.".to_string(),
            resources_tools: String::new(),
            resources_places: String::new(),
            resources_programs: String::new(),
            generated_at: Utc.timestamp_opt(at_secs, 0).single().expect("valid"),
            used_fallback: false,
            printed: true,
            uploaded: false,
        }
    }

    #[test]
    fn persist_writes_record_and_sidecar() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SlipStore::new(dir.path(), None).expect("store");
        let record = record_with(1, 1_000_000);
        let bitmap = GrayImage::from_pixel(4, 4, Luma([0x00]));

        let path = store.persist(&record, Some(&bitmap), Some("<svg/>")).expect("persists");
        assert!(path.exists());
        assert!(dir.path().join(format!("{}.png", record.slip_uuid)).exists());
        assert!(dir.path().join(format!("{}.svg", record.slip_uuid)).exists());

        let raw = fs::read_to_string(&path).expect("readable");
        let read_back: SlipRecord = serde_json::from_str(&raw).expect("valid json");
        assert_eq!(read_back.figurine_id, 1);
        assert!(!read_back.uploaded);
    }

    #[test]
    fn persist_refuses_to_overwrite() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SlipStore::new(dir.path(), None).expect("store");
        let record = record_with(1, 1_000_000);

        store.persist(&record, None, None).expect("first write");
        assert!(store.persist(&record, None, None).is_err());
    }

    #[test]
    fn mark_uploaded_flips_only_that_flag() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SlipStore::new(dir.path(), None).expect("store");
        let record = record_with(42, 1_000_000);

        store.persist(&record, None, None).expect("persists");
        store.mark_uploaded(record.slip_uuid).expect("flips flag");

        let raw = fs::read_to_string(dir.path().join(format!("{}.json", record.slip_uuid)))
            .expect("readable");
        let read_back: SlipRecord = serde_json::from_str(&raw).expect("valid json");
        assert!(read_back.uploaded);
        assert_eq!(read_back.figurine_id, 42);
        assert_eq!(read_back.generated_at, record.generated_at);
    }

    #[test]
    fn pending_lists_unuploaded_oldest_first() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SlipStore::new(dir.path(), None).expect("store");

        let newer = record_with(2, 2_000_000);
        let older = record_with(1, 1_000_000);
        let done = record_with(3, 1_500_000);

        store.persist(&newer, None, None).expect("persists");
        store.persist(&older, None, None).expect("persists");
        store.persist(&done, None, None).expect("persists");
        store.mark_uploaded(done.slip_uuid).expect("flips flag");

        let pending = store.pending();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].slip_uuid, older.slip_uuid);
        assert_eq!(pending[1].slip_uuid, newer.slip_uuid);
    }

    #[tokio::test]
    async fn flush_without_remote_is_a_no_op() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SlipStore::new(dir.path(), None).expect("store");
        store
            .persist(&record_with(1, 1_000_000), None, None)
            .expect("persists");

        assert_eq!(store.flush_pending().await, 0);
        assert_eq!(store.pending().len(), 1);
    }
}
