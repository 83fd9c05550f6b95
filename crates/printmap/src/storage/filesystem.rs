use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::analyzer::manifest::Manifest;
use crate::error::StorageError;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const ERROR_FILE: &str = "error.json";
pub const ASSETS_DIR: &str = "assets";
pub const TMP_DIR: &str = "tmp";

/// Move a file from `src` to `dst`. Uses `rename` first (atomic on the same
/// filesystem), falling back to copy + delete.
fn move_file(src: &Path, dst: &Path) -> Result<(), StorageError> {
    if std::fs::rename(src, dst).is_ok() {
        return Ok(());
    }

    std::fs::copy(src, dst).map_err(|e| StorageError::WriteFile {
        path: dst.to_path_buf(),
        source: e,
    })?;
    std::fs::remove_file(src).map_err(|e| StorageError::Remove {
        path: src.to_path_buf(),
        source: e,
    })?;
    Ok(())
}

fn ensure_directory(path: &Path) -> Result<(), StorageError> {
    std::fs::create_dir_all(path).map_err(|e| StorageError::CreateDirectory {
        path: path.to_path_buf(),
        source: e,
    })
}

fn remove_if_exists(path: &Path) -> Result<(), StorageError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StorageError::Remove {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

fn remove_dir_all_if_exists(path: &Path) -> Result<(), StorageError> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StorageError::Remove {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Keeps job ids from escaping the work directory.
fn safe_component(id: &str) -> String {
    let cleaned: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match cleaned.trim_matches('.') {
        "" => "_".to_string(),
        _ => cleaned,
    }
}

/// Root of all per-job working directories.
#[derive(Debug, Clone)]
pub struct WorkArea {
    root: PathBuf,
}

impl WorkArea {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn job(&self, job_id: &str) -> JobWorkspace {
        JobWorkspace::new(self.root.join(safe_component(job_id)))
    }
}

/// Postmortem record written next to a failed attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub job_id: String,
    pub attempt: u32,
    pub kind: String,
    pub error: String,
    pub progress: u8,
    pub occurred_at: DateTime<Utc>,
}

/// `<work_dir>/<job_id>/` with `assets/` and `tmp/`, owned by the job's
/// current attempt.
///
/// Each attempt stages files in its own scratch directory under `tmp/`, so a
/// worker whose lease was reclaimed never cleans up after the live attempt.
#[derive(Debug, Clone)]
pub struct JobWorkspace {
    root: PathBuf,
    scratch: PathBuf,
}

impl JobWorkspace {
    pub fn new(root: PathBuf) -> Self {
        let scratch = root.join(TMP_DIR);
        Self { root, scratch }
    }

    /// The same job directory, with scratch space private to `attempt`.
    pub fn for_attempt(&self, attempt: &str) -> Self {
        Self {
            root: self.root.clone(),
            scratch: self.tmp_dir().join(safe_component(attempt)),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn assets_dir(&self) -> PathBuf {
        self.root.join(ASSETS_DIR)
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join(TMP_DIR)
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    pub fn error_path(&self) -> PathBuf {
        self.root.join(ERROR_FILE)
    }

    /// Creates the directory layout for a fresh attempt.
    pub fn prepare(&self) -> Result<(), StorageError> {
        ensure_directory(&self.assets_dir())?;
        ensure_directory(&self.scratch)
    }

    /// Writes an asset and returns its reference relative to the job root.
    pub fn write_asset(&self, name: &str, bytes: &[u8]) -> Result<String, StorageError> {
        let dir = self.assets_dir();
        ensure_directory(&dir)?;
        let path = dir.join(name);
        std::fs::write(&path, bytes).map_err(|e| StorageError::WriteFile { path, source: e })?;
        Ok(format!("{}/{}", ASSETS_DIR, name))
    }

    /// Writes `manifest.json` through a temp file and rename, so readers see
    /// either nothing or the complete document. Clears any stale error record.
    pub fn write_manifest(&self, manifest: &Manifest) -> Result<PathBuf, StorageError> {
        let dest = self.manifest_path();
        let json = serde_json::to_vec_pretty(manifest).map_err(|e| StorageError::Serialize {
            path: dest.clone(),
            source: e,
        })?;

        ensure_directory(&self.scratch)?;
        let staged = self.scratch.join(format!("{}.partial", MANIFEST_FILE));
        std::fs::write(&staged, json).map_err(|e| StorageError::WriteFile {
            path: staged.clone(),
            source: e,
        })?;
        move_file(&staged, &dest)?;

        remove_if_exists(&self.error_path())?;
        Ok(dest)
    }

    pub fn write_error(&self, record: &ErrorRecord) -> Result<PathBuf, StorageError> {
        ensure_directory(&self.root)?;
        let path = self.error_path();
        let json = serde_json::to_vec_pretty(record).map_err(|e| StorageError::Serialize {
            path: path.clone(),
            source: e,
        })?;
        std::fs::write(&path, json).map_err(|e| StorageError::WriteFile {
            path: path.clone(),
            source: e,
        })?;
        Ok(path)
    }

    /// Removes a manifest left by this attempt, so a failed attempt never
    /// leaves one behind.
    pub fn discard_manifest(&self) -> Result<(), StorageError> {
        remove_if_exists(&self.manifest_path())
    }

    /// Deletes this attempt's scratch space, and `tmp/` itself once no other
    /// attempt has anything left in it.
    pub fn remove_scratch(&self) -> Result<(), StorageError> {
        remove_dir_all_if_exists(&self.scratch)?;
        let tmp = self.tmp_dir();
        if self.scratch != tmp {
            // Fails while another attempt's scratch is still present.
            let _ = std::fs::remove_dir(&tmp);
        }
        Ok(())
    }

    /// Deletes the whole temp area, including scratch left by dead attempts.
    /// Only the lease holder of a finished job may call this.
    pub fn remove_tmp(&self) -> Result<(), StorageError> {
        remove_dir_all_if_exists(&self.tmp_dir())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::manifest::{ManifestParts, Materials, ParsingMethod, SourceInfo};

    fn manifest() -> Manifest {
        Manifest::assemble(ManifestParts {
            source: SourceInfo {
                original_name: "a.pdf".into(),
                file_size: 1,
            },
            width_mm: 10.0,
            height_mm: 10.0,
            page_count: 1,
            materials: Materials::default(),
            layers: vec![],
            base_ref: "assets/base_front.png".into(),
            method: ParsingMethod::Filename,
            elapsed_ms: 1,
        })
    }

    fn error_record() -> ErrorRecord {
        ErrorRecord {
            job_id: "job-1".into(),
            attempt: 1,
            kind: "InputMissing".into(),
            error: "gone".into(),
            progress: 0,
            occurred_at: Utc::now(),
        }
    }

    #[test]
    fn test_prepare_creates_layout() {
        let dir = tempfile::tempdir().unwrap();
        let ws = WorkArea::new(dir.path()).job("job-1");
        ws.prepare().unwrap();
        assert!(ws.assets_dir().is_dir());
        assert!(ws.tmp_dir().is_dir());
        assert_eq!(ws.root(), dir.path().join("job-1"));
    }

    #[test]
    fn test_job_ids_cannot_escape() {
        let area = WorkArea::new("/work");
        assert_eq!(area.job("../etc").root(), Path::new("/work/.._etc"));
        assert_eq!(area.job("..").root(), Path::new("/work/_"));
        assert_eq!(area.job("a/b").root(), Path::new("/work/a_b"));
    }

    #[test]
    fn test_write_asset_returns_relative_ref() {
        let dir = tempfile::tempdir().unwrap();
        let ws = WorkArea::new(dir.path()).job("job-1");
        let r = ws.write_asset("mask.png", b"png").unwrap();
        assert_eq!(r, "assets/mask.png");
        assert!(ws.root().join(&r).is_file());
    }

    #[test]
    fn test_manifest_write_is_staged_and_clears_error() {
        let dir = tempfile::tempdir().unwrap();
        let ws = WorkArea::new(dir.path()).job("job-1");
        ws.prepare().unwrap();
        ws.write_error(&error_record()).unwrap();

        let path = ws.write_manifest(&manifest()).unwrap();
        assert!(path.is_file());
        assert!(!ws.error_path().exists());
        assert!(!ws.scratch_dir().join("manifest.json.partial").exists());

        let back: Manifest = serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
        assert_eq!(back, manifest());
    }

    #[test]
    fn test_error_record_and_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let ws = WorkArea::new(dir.path()).job("job-1");
        ws.prepare().unwrap();
        std::fs::write(ws.tmp_dir().join("scratch.png"), b"x").unwrap();

        ws.write_error(&error_record()).unwrap();
        ws.discard_manifest().unwrap();
        ws.remove_tmp().unwrap();
        ws.remove_tmp().unwrap();

        assert!(!ws.tmp_dir().exists());
        assert!(!ws.manifest_path().exists());
        let record: ErrorRecord =
            serde_json::from_slice(&std::fs::read(ws.error_path()).unwrap()).unwrap();
        assert_eq!(record.kind, "InputMissing");
    }

    #[test]
    fn test_attempt_scratch_is_private() {
        let dir = tempfile::tempdir().unwrap();
        let job = WorkArea::new(dir.path()).job("job-1");
        let stale = job.for_attempt("w:0:old");
        let live = job.for_attempt("w:1:new");
        stale.prepare().unwrap();
        live.prepare().unwrap();
        assert_eq!(live.scratch_dir(), job.tmp_dir().join("w_1_new"));
        std::fs::write(live.scratch_dir().join("render.png"), b"x").unwrap();

        stale.remove_scratch().unwrap();
        assert!(!stale.scratch_dir().exists());
        assert!(live.scratch_dir().join("render.png").is_file());

        live.write_manifest(&manifest()).unwrap();
        live.remove_scratch().unwrap();
        assert!(!job.tmp_dir().exists());
        assert!(live.manifest_path().is_file());
    }

    #[test]
    fn test_remove_tmp_clears_dead_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let job = WorkArea::new(dir.path()).job("job-1");
        job.for_attempt("dead").prepare().unwrap();
        let live = job.for_attempt("live");
        live.prepare().unwrap();

        live.remove_scratch().unwrap();
        assert!(job.tmp_dir().exists());
        live.remove_tmp().unwrap();
        assert!(!job.tmp_dir().exists());
    }
}
