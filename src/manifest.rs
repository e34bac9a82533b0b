use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::error::{CaptureError, Result};

pub const MANIFEST_VERSION: &str = "1.0";
pub const DEFAULT_MANIFEST_NAME: &str = ".manifest.json";
const DESCRIPTION: &str = "Integrity manifest for agent transcripts";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub sha256: String,
    pub captured_at: String,
    pub agent_id: String,
    pub session_id: String,
    /// Artifact size in bytes.
    pub size: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Manifest {
    pub version: String,
    #[serde(default)]
    pub description: String,
    /// Keyed by artifact filename, relative to the manifest's directory.
    #[serde(default)]
    pub entries: BTreeMap<String, ManifestEntry>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            version: MANIFEST_VERSION.to_string(),
            description: DESCRIPTION.to_string(),
            entries: BTreeMap::new(),
        }
    }
}

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyStatus {
    Valid,
    Modified { expected: String, actual: String },
    Missing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyResult {
    pub filename: String,
    pub status: VerifyStatus,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerifySummary {
    pub valid: usize,
    pub modified: usize,
    pub missing: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyReport {
    pub results: Vec<VerifyResult>,
    pub summary: VerifySummary,
}

impl VerifyReport {
    /// True when nothing was modified or missing.
    pub fn is_clean(&self) -> bool {
        self.summary.modified + self.summary.missing == 0
    }
}

/// Hash manifest for the transcripts stored in one directory.
#[derive(Debug, Clone)]
pub struct IntegrityManifest {
    dir: PathBuf,
    path: PathBuf,
    lock_timeout: Duration,
}

impl IntegrityManifest {
    pub fn new(dir: impl Into<PathBuf>, manifest_name: &str, lock_timeout: Duration) -> Self {
        let dir = dir.into();
        let path = dir.join(manifest_name);
        Self {
            dir,
            path,
            lock_timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load the manifest. A missing file yields a fresh manifest; an
    /// unparsable one is an error rather than a silent reset.
    pub async fn load(&self) -> Result<Manifest> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => serde_json::from_str(&contents).map_err(|source| {
                CaptureError::ManifestCorrupt {
                    path: self.path.clone(),
                    source,
                }
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Manifest::default()),
            Err(e) => Err(CaptureError::io(&self.path, e)),
        }
    }

    /// Save the manifest via write-to-temp-then-rename.
    pub async fn save(&self, manifest: &Manifest) -> Result<()> {
        let json = serde_json::to_string_pretty(manifest)?;
        write_atomic(&self.path, json.as_bytes()).await
    }

    /// Hash `content` and store an entry for `filename` (load-modify-save
    /// under the manifest lock). Call only after the artifact is on disk.
    pub async fn record(
        &self,
        filename: &str,
        content: &[u8],
        agent_id: &str,
        session_id: &str,
    ) -> Result<ManifestEntry> {
        let entry = ManifestEntry {
            sha256: sha256_hex(content),
            captured_at: chrono::Utc::now()
                .to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            agent_id: agent_id.to_string(),
            session_id: session_id.to_string(),
            size: content.len() as u64,
        };

        let _lock = ManifestLock::acquire(&self.lock_path(), self.lock_timeout).await?;
        let mut manifest = self.load().await?;
        manifest
            .entries
            .insert(filename.to_string(), entry.clone());
        self.save(&manifest).await?;
        tracing::info!(filename, sha256 = %entry.sha256, "manifest entry recorded");
        Ok(entry)
    }

    /// Re-hash every recorded artifact and compare against the manifest.
    pub async fn verify(&self) -> Result<VerifyReport> {
        let manifest = self.load().await?;
        let mut report = VerifyReport::default();

        for (filename, entry) in &manifest.entries {
            let path = self.dir.join(filename);
            let status = match tokio::fs::read(&path).await {
                Ok(bytes) => {
                    let actual = sha256_hex(&bytes);
                    if actual == entry.sha256 {
                        report.summary.valid += 1;
                        VerifyStatus::Valid
                    } else {
                        report.summary.modified += 1;
                        VerifyStatus::Modified {
                            expected: entry.sha256.clone(),
                            actual,
                        }
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::warn!(filename, "recorded transcript is missing");
                    report.summary.missing += 1;
                    VerifyStatus::Missing
                }
                Err(e) => return Err(CaptureError::io(path, e)),
            };
            report.results.push(VerifyResult {
                filename: filename.clone(),
                status,
            });
        }

        Ok(report)
    }

    /// Drop entries whose artifact no longer exists. Returns the removed names.
    pub async fn prune(&self) -> Result<Vec<String>> {
        let _lock = ManifestLock::acquire(&self.lock_path(), self.lock_timeout).await?;
        let mut manifest = self.load().await?;

        let mut removed = Vec::new();
        for filename in manifest.entries.keys() {
            let exists = tokio::fs::try_exists(self.dir.join(filename))
                .await
                .unwrap_or(true);
            if !exists {
                removed.push(filename.clone());
            }
        }

        if !removed.is_empty() {
            for filename in &removed {
                manifest.entries.remove(filename);
            }
            self.save(&manifest).await?;
            tracing::info!(count = removed.len(), "pruned missing manifest entries");
        }
        Ok(removed)
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".lock");
        self.path.with_file_name(name)
    }
}

/// Write `bytes` to `path` through a uniquely named temp file in the same
/// directory, synced before the rename so readers see all or nothing.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::io::AsyncWriteExt;

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| CaptureError::io(parent, e))?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_path = path.with_file_name(format!(
        ".{file_name}.{}.{}.tmp",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed),
    ));

    let write = async {
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp_path, path).await
    };
    if let Err(e) = write.await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(CaptureError::io(path, e));
    }
    Ok(())
}

/// A lock file older than this is taken over regardless of its owner.
const STALE_LOCK_AGE: Duration = Duration::from_secs(600);

/// Advisory lock held as an exclusively created `<manifest>.lock` file
/// holding the owner's pid. Removed again on drop; a lock whose owner is
/// gone, or that is older than [`STALE_LOCK_AGE`], is taken over.
struct ManifestLock {
    path: PathBuf,
}

impl ManifestLock {
    async fn acquire(path: &Path, timeout: Duration) -> Result<Self> {
        use tokio::io::AsyncWriteExt;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CaptureError::io(parent, e))?;
        }

        let deadline = Instant::now() + timeout;
        let mut delay = Duration::from_millis(10);
        loop {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
                .await
            {
                Ok(mut file) => {
                    let _ = file
                        .write_all(std::process::id().to_string().as_bytes())
                        .await;
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if lock_is_stale(path).await {
                        tracing::warn!("removing stale manifest lock {}", path.display());
                        match tokio::fs::remove_file(path).await {
                            Ok(()) => continue,
                            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                            Err(e) => return Err(CaptureError::io(path, e)),
                        }
                    }
                    if Instant::now() >= deadline {
                        return Err(CaptureError::ManifestLocked {
                            path: path.to_path_buf(),
                        });
                    }
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_millis(200));
                }
                Err(e) => return Err(CaptureError::io(path, e)),
            }
        }
    }
}

/// True when the lock's owner process no longer runs, or the file is older
/// than [`STALE_LOCK_AGE`]. A lock without a readable pid is only stale by age,
/// since its owner may not have written the pid yet.
async fn lock_is_stale(path: &Path) -> bool {
    let Ok(meta) = tokio::fs::metadata(path).await else {
        return false;
    };
    let age = meta
        .modified()
        .ok()
        .and_then(|m| m.elapsed().ok())
        .unwrap_or_default();
    if age >= STALE_LOCK_AGE {
        return true;
    }
    let contents = tokio::fs::read_to_string(path).await.unwrap_or_default();
    match contents.trim().parse::<u32>() {
        Ok(pid) => !process_alive(pid),
        Err(_) => false,
    }
}

fn process_alive(pid: u32) -> bool {
    use sysinfo::{Pid, ProcessesToUpdate, System};

    if pid == std::process::id() {
        return true;
    }
    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    sys.process(pid).is_some()
}

impl Drop for ManifestLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOCK_WAIT: Duration = Duration::from_secs(5);

    fn manifest_in(dir: &Path) -> IntegrityManifest {
        IntegrityManifest::new(dir, DEFAULT_MANIFEST_NAME, LOCK_WAIT)
    }

    async fn write_and_record(m: &IntegrityManifest, name: &str, content: &str) {
        write_atomic(&m.dir().join(name), content.as_bytes())
            .await
            .unwrap();
        m.record(name, content.as_bytes(), "agent", "s1")
            .await
            .unwrap();
    }

    #[test]
    fn sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(sha256_hex(b"").len(), 64);
    }

    #[tokio::test]
    async fn load_missing_file_returns_fresh_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = manifest_in(dir.path()).load().await.unwrap();
        assert_eq!(manifest.version, MANIFEST_VERSION);
        assert!(manifest.entries.is_empty());
    }

    #[tokio::test]
    async fn corrupt_manifest_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let m = manifest_in(dir.path());
        tokio::fs::write(m.path(), "not valid json {{{").await.unwrap();
        let err = m.load().await.unwrap_err();
        assert!(matches!(err, CaptureError::ManifestCorrupt { .. }));
    }

    #[tokio::test]
    async fn record_writes_camel_case_entry() {
        let dir = tempfile::tempdir().unwrap();
        let m = manifest_in(dir.path());
        let entry = m
            .record("a-1.md", b"hello", "agent", "s1")
            .await
            .unwrap();
        assert_eq!(entry.sha256, sha256_hex(b"hello"));
        assert_eq!(entry.size, 5);

        let raw = tokio::fs::read_to_string(m.path()).await.unwrap();
        let v: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(v["version"], "1.0");
        let e = &v["entries"]["a-1.md"];
        assert_eq!(e["agentId"], "agent");
        assert_eq!(e["sessionId"], "s1");
        assert_eq!(e["size"], 5);
        assert!(e["capturedAt"].as_str().unwrap().ends_with('Z'));
    }

    #[tokio::test]
    async fn record_overwrites_existing_entry() {
        let dir = tempfile::tempdir().unwrap();
        let m = manifest_in(dir.path());
        m.record("a.md", b"one", "agent", "s1").await.unwrap();
        m.record("a.md", b"two", "agent", "s2").await.unwrap();
        let manifest = m.load().await.unwrap();
        assert_eq!(manifest.entries.len(), 1);
        assert_eq!(manifest.entries["a.md"].sha256, sha256_hex(b"two"));
        assert_eq!(manifest.entries["a.md"].session_id, "s2");
    }

    #[tokio::test]
    async fn reads_manifest_written_by_older_tool() {
        let dir = tempfile::tempdir().unwrap();
        let m = manifest_in(dir.path());
        let json = r#"{
  "version": "1.0",
  "description": "Integrity manifest for agent transcripts",
  "entries": {
    "w-2024.md": {"sha256": "ab", "capturedAt": "2024-01-01T00:00:00.000Z",
                  "agentId": "w", "sessionId": "unknown", "size": 12}
  }
}"#;
        tokio::fs::write(m.path(), json).await.unwrap();
        let manifest = m.load().await.unwrap();
        assert_eq!(manifest.entries["w-2024.md"].size, 12);
    }

    #[tokio::test]
    async fn verify_reports_valid_after_record() {
        let dir = tempfile::tempdir().unwrap();
        let m = manifest_in(dir.path());
        write_and_record(&m, "a.md", "transcript body").await;

        let report = m.verify().await.unwrap();
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].status, VerifyStatus::Valid);
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn verify_detects_appended_byte() {
        let dir = tempfile::tempdir().unwrap();
        let m = manifest_in(dir.path());
        write_and_record(&m, "a.md", "transcript body").await;
        tokio::fs::write(dir.path().join("a.md"), "transcript body!")
            .await
            .unwrap();

        let report = m.verify().await.unwrap();
        match &report.results[0].status {
            VerifyStatus::Modified { expected, actual } => {
                assert_eq!(expected, &sha256_hex(b"transcript body"));
                assert_eq!(actual, &sha256_hex(b"transcript body!"));
                assert_ne!(expected, actual);
            }
            other => panic!("expected Modified, got {other:?}"),
        }
        assert_eq!(report.summary.modified, 1);
        assert!(!report.is_clean());
    }

    #[tokio::test]
    async fn verify_detects_deleted_file() {
        let dir = tempfile::tempdir().unwrap();
        let m = manifest_in(dir.path());
        write_and_record(&m, "a.md", "x").await;
        write_and_record(&m, "b.md", "y").await;
        tokio::fs::remove_file(dir.path().join("a.md")).await.unwrap();

        let report = m.verify().await.unwrap();
        assert_eq!(
            report.summary,
            VerifySummary {
                valid: 1,
                modified: 0,
                missing: 1
            }
        );
        assert_eq!(report.results[0].filename, "a.md");
        assert_eq!(report.results[0].status, VerifyStatus::Missing);
        assert!(!report.is_clean());
    }

    #[tokio::test]
    async fn verify_on_empty_manifest_is_clean() {
        let dir = tempfile::tempdir().unwrap();
        let report = manifest_in(dir.path()).verify().await.unwrap();
        assert!(report.results.is_empty());
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn prune_removes_only_missing_entries() {
        let dir = tempfile::tempdir().unwrap();
        let m = manifest_in(dir.path());
        write_and_record(&m, "keep.md", "x").await;
        write_and_record(&m, "gone.md", "y").await;
        tokio::fs::remove_file(dir.path().join("gone.md"))
            .await
            .unwrap();

        let removed = m.prune().await.unwrap();
        assert_eq!(removed, vec!["gone.md".to_string()]);
        let manifest = m.load().await.unwrap();
        assert!(manifest.entries.contains_key("keep.md"));
        assert!(!manifest.entries.contains_key("gone.md"));

        assert!(m.prune().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn atomic_write_no_temp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let m = manifest_in(dir.path());
        m.record("a.md", b"x", "agent", "s1").await.unwrap();

        let mut names = Vec::new();
        let mut rd = tokio::fs::read_dir(dir.path()).await.unwrap();
        while let Some(e) = rd.next_entry().await.unwrap() {
            names.push(e.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec![DEFAULT_MANIFEST_NAME.to_string()]);
    }

    #[tokio::test]
    async fn held_lock_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let m = IntegrityManifest::new(
            dir.path(),
            DEFAULT_MANIFEST_NAME,
            Duration::from_millis(50),
        );
        let _held = ManifestLock::acquire(&m.lock_path(), LOCK_WAIT)
            .await
            .unwrap();
        let err = m.record("a.md", b"x", "agent", "s1").await.unwrap_err();
        assert!(matches!(err, CaptureError::ManifestLocked { .. }));
    }

    #[tokio::test]
    async fn lock_left_by_dead_process_is_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        let m = IntegrityManifest::new(
            dir.path(),
            DEFAULT_MANIFEST_NAME,
            Duration::from_millis(50),
        );
        // Above any pid_max, so no live process can own it.
        tokio::fs::write(m.lock_path(), "999999999").await.unwrap();

        m.record("a.md", b"x", "agent", "s1").await.unwrap();
        m.record("b.md", b"y", "agent", "s1").await.unwrap();
        assert!(!m.lock_path().exists());
        assert_eq!(m.load().await.unwrap().entries.len(), 2);
    }

    #[tokio::test]
    async fn old_lock_is_taken_over_even_with_live_owner() {
        let dir = tempfile::tempdir().unwrap();
        let m = IntegrityManifest::new(
            dir.path(),
            DEFAULT_MANIFEST_NAME,
            Duration::from_millis(50),
        );
        let lock = std::fs::File::create(m.lock_path()).unwrap();
        std::fs::write(m.lock_path(), std::process::id().to_string()).unwrap();
        lock.set_modified(std::time::SystemTime::now() - STALE_LOCK_AGE * 2)
            .unwrap();
        drop(lock);

        m.prune().await.unwrap();
        assert!(!m.lock_path().exists());
    }

    #[tokio::test]
    async fn fresh_lock_without_pid_is_respected() {
        let dir = tempfile::tempdir().unwrap();
        let m = IntegrityManifest::new(
            dir.path(),
            DEFAULT_MANIFEST_NAME,
            Duration::from_millis(50),
        );
        tokio::fs::write(m.lock_path(), "").await.unwrap();
        let err = m.record("a.md", b"x", "agent", "s1").await.unwrap_err();
        assert!(matches!(err, CaptureError::ManifestLocked { .. }));
        assert!(m.lock_path().exists());
    }

    #[test]
    fn own_process_counts_as_alive() {
        assert!(process_alive(std::process::id()));
        assert!(!process_alive(999_999_999));
    }

    #[tokio::test]
    async fn concurrent_records_keep_every_entry() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().to_path_buf();

        let mut handles = Vec::new();
        for i in 0..10 {
            let m = manifest_in(&base);
            handles.push(tokio::spawn(async move {
                m.record(&format!("agent-{i}.md"), b"body", &format!("agent-{i}"), "s")
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let manifest = manifest_in(&base).load().await.unwrap();
        assert_eq!(manifest.entries.len(), 10);
    }

    #[test]
    fn lock_path_sits_next_to_manifest() {
        let m = manifest_in(Path::new("/tmp/transcripts"));
        assert_eq!(
            m.lock_path(),
            PathBuf::from("/tmp/transcripts/.manifest.json.lock")
        );
    }
}
