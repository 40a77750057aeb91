//! JSON file storage implementation.
//!
//! Stores one JSON file per ledger event under `events/`, cached snapshots
//! under `snapshots/` with small meta markers (version + updated_at), course
//! structures under `courses/`, and the client queue in `queue.json`.
//!
//! Event files are first written to a temporary name and then hard-linked
//! into place, so an event file is either absent or complete, and a second
//! insert of the same id can never overwrite the first.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use coursetrack_core::{
    Course, CourseId, EventId, ProgressEvent, ProgressSnapshot, SectionId, StudentId,
    SyncQueueEntry,
};
use tokio::fs;
use tracing::{debug, warn};

use super::{CourseStore, InsertOutcome, LedgerStore, QueueStore, Result};

/// File-based JSON storage backend.
pub struct JsonStorage {
    root: PathBuf,
    tmp_seq: AtomicU64,
}

impl JsonStorage {
    /// Create storage, creating the subdirectories it needs under `root`.
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        fs::create_dir_all(root.join("events")).await?;
        fs::create_dir_all(root.join("snapshots")).await?;
        fs::create_dir_all(root.join("courses")).await?;
        fs::create_dir_all(root.join("meta").join("snapshots")).await?;

        Ok(Self {
            root,
            tmp_seq: AtomicU64::new(0),
        })
    }

    /// Root directory of this store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn event_path(&self, id: EventId) -> PathBuf {
        self.root.join("events").join(format!("{}.json", id))
    }
    fn snapshot_key(student: &StudentId, course: &CourseId) -> String {
        format!("{}__{}", file_key(student.as_str()), file_key(course.as_str()))
    }
    fn snapshot_path(&self, key: &str) -> PathBuf {
        self.root.join("snapshots").join(format!("{}.json", key))
    }
    fn course_path(&self, id: &CourseId) -> PathBuf {
        self.root.join("courses").join(format!("{}.json", file_key(id.as_str())))
    }
    fn queue_path(&self) -> PathBuf {
        self.root.join("queue.json")
    }

    fn meta_path(&self, kind: &str, id: &str) -> PathBuf {
        self.root.join("meta").join(kind).join(format!("{}.meta.json", id))
    }

    fn tmp_path(&self, dir: &str, stem: &str) -> PathBuf {
        let seq = self.tmp_seq.fetch_add(1, Ordering::Relaxed);
        self.root
            .join(dir)
            .join(format!(".{}.{}.{}.tmp", stem, std::process::id(), seq))
    }

    /// Write a meta marker next to a cached object.
    async fn write_meta(&self, kind: &str, id: &str, version: u64) -> Result<()> {
        let meta = serde_json::json!({"version": version, "updated_at": chrono::Utc::now()});
        fs::write(self.meta_path(kind, id), serde_json::to_string_pretty(&meta)?).await?;
        Ok(())
    }

    /// Replace `path` atomically via a temp file + rename.
    async fn replace_file(&self, dir: &str, path: &Path, contents: &[u8]) -> Result<()> {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("file")
            .to_string();
        let tmp = self.tmp_path(dir, &stem);
        fs::write(&tmp, contents).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn all_events(&self) -> Result<Vec<ProgressEvent>> {
        let mut events: Vec<ProgressEvent> = list_dir(&self.root.join("events")).await?;
        events.sort_by(|a, b| {
            (a.server_timestamp, a.client_timestamp, a.event_id)
                .cmp(&(b.server_timestamp, b.client_timestamp, b.event_id))
        });
        Ok(events)
    }
}

#[async_trait]
impl LedgerStore for JsonStorage {
    async fn insert_event(&self, event: &ProgressEvent) -> Result<InsertOutcome> {
        let path = self.event_path(event.event_id);
        let tmp = self.tmp_path("events", &event.event_id.to_string());
        fs::write(&tmp, serde_json::to_string_pretty(event)?).await?;

        let linked = fs::hard_link(&tmp, &path).await;
        if let Err(e) = fs::remove_file(&tmp).await {
            warn!(path = %tmp.display(), error = %e, "Failed to remove temp event file");
        }

        match linked {
            Ok(()) => Ok(InsertOutcome::Inserted),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                debug!(event_id = %event.event_id, "Event file already present");
                Ok(InsertOutcome::AlreadyPresent)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn load_event(&self, id: EventId) -> Result<Option<ProgressEvent>> {
        read_json(&self.event_path(id)).await
    }

    async fn list_student_events(&self, student: &StudentId) -> Result<Vec<ProgressEvent>> {
        let all = self.all_events().await?;
        Ok(all.into_iter().filter(|e| &e.student_id == student).collect())
    }

    async fn list_section_events(
        &self,
        student: &StudentId,
        section: &SectionId,
    ) -> Result<Vec<ProgressEvent>> {
        let all = self.all_events().await?;
        Ok(all
            .into_iter()
            .filter(|e| &e.student_id == student && &e.section_id == section)
            .collect())
    }

    async fn save_snapshot(&self, snapshot: &ProgressSnapshot) -> Result<()> {
        let key = Self::snapshot_key(&snapshot.student_id, &snapshot.course_id);
        let json = serde_json::to_string_pretty(snapshot)?;
        self.replace_file("snapshots", &self.snapshot_path(&key), json.as_bytes())
            .await?;

        self.write_meta("snapshots", &key, snapshot.version).await
    }

    async fn load_snapshot(
        &self,
        student: &StudentId,
        course: &CourseId,
    ) -> Result<Option<ProgressSnapshot>> {
        read_json(&self.snapshot_path(&Self::snapshot_key(student, course))).await
    }

    async fn delete_snapshot(&self, student: &StudentId, course: &CourseId) -> Result<()> {
        let key = Self::snapshot_key(student, course);
        for path in [self.snapshot_path(&key), self.meta_path("snapshots", &key)] {
            fs::remove_file(&path).await.or_else(|e| {
                if e.kind() == std::io::ErrorKind::NotFound { Ok(()) } else { Err(e) }
            })?;
        }
        Ok(())
    }

    async fn health_check(&self) -> bool {
        fs::metadata(self.root.join("events")).await.is_ok()
    }
}

#[async_trait]
impl CourseStore for JsonStorage {
    async fn save_course(&self, course: &Course) -> Result<()> {
        let json = serde_json::to_string_pretty(course)?;
        self.replace_file("courses", &self.course_path(&course.id), json.as_bytes())
            .await
    }

    async fn load_course(&self, id: &CourseId) -> Result<Option<Course>> {
        read_json(&self.course_path(id)).await
    }

    async fn list_courses(&self) -> Result<Vec<Course>> {
        let mut courses: Vec<Course> = list_dir(&self.root.join("courses")).await?;
        courses.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(courses)
    }
}

#[async_trait]
impl QueueStore for JsonStorage {
    async fn save_queue(&self, entries: &[SyncQueueEntry]) -> Result<()> {
        let json = serde_json::to_string_pretty(entries)?;
        self.replace_file("", &self.queue_path(), json.as_bytes()).await
    }

    async fn load_queue(&self) -> Result<Vec<SyncQueueEntry>> {
        Ok(read_json(&self.queue_path()).await?.unwrap_or_default())
    }
}

/// Map an arbitrary id to a safe file name component.
fn file_key(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for c in id.chars() {
        if c.is_ascii_alphanumeric() || c == '-' {
            out.push(c);
        } else {
            let mut buf = [0u8; 4];
            for b in c.encode_utf8(&mut buf).bytes() {
                out.push_str(&format!("_{:02x}", b));
            }
        }
    }
    out
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read_to_string(path).await {
        Ok(json) => {
            let value = serde_json::from_str(&json)?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn list_dir<T: serde::de::DeserializeOwned>(dir: &Path) -> Result<Vec<T>> {
    let mut items = Vec::new();
    let mut rd = fs::read_dir(dir).await?;
    while let Some(entry) = rd.next_entry().await? {
        if entry.path().extension().and_then(|s| s.to_str()) != Some("json") {
            continue;
        }
        match read_json(&entry.path()).await {
            Ok(Some(item)) => items.push(item),
            Ok(None) => {}
            Err(e) => warn!(path = %entry.path().display(), error = %e, "Skipping unreadable file"),
        }
    }
    Ok(items)
}
