use crate::error::BackupError;
use crate::models::backup::{BackupReport, FileRecord, Manifest, SnapshotInfo};
use chrono::{DateTime, Duration, FixedOffset, Local, NaiveDateTime, TimeZone, Utc};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub const LABEL_FORMAT: &str = "%Y%m%d-%H%M%S";
const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Snapshots under `<backup_dir>/snapshots/<label>`, manifests under
/// `<backup_dir>/manifests/<label>.json`.
///
/// All operations block on filesystem I/O; async callers should use
/// `spawn_blocking`.
#[derive(Debug, Clone)]
pub struct BackupEngine {
    snapshots_dir: PathBuf,
    manifests_dir: PathBuf,
}

impl BackupEngine {
    pub fn new(backup_dir: &Path) -> Self {
        Self {
            snapshots_dir: backup_dir.join("snapshots"),
            manifests_dir: backup_dir.join("manifests"),
        }
    }

    pub fn manifest_path(&self, label: &str) -> PathBuf {
        self.manifests_dir.join(format!("{label}.json"))
    }

    /// Mirrors `sources` into a new snapshot and writes its manifest last.
    ///
    /// A source that fails to mirror is skipped and reported; a run that
    /// fails before the manifest is written leaves no manifest behind.
    pub fn perform_backup(&self, sources: &[PathBuf], label: &str) -> Result<BackupReport, BackupError> {
        validate_label(label)?;
        let manifest_path = self.manifest_path(label);
        if manifest_path.exists() {
            return Err(BackupError::LabelExists(label.to_string()));
        }

        // Claiming the label directory is the atomic step; a second run with
        // the same label stops here instead of sharing the snapshot.
        fs::create_dir_all(&self.snapshots_dir).map_err(|e| BackupError::io(&self.snapshots_dir, e))?;
        let snapshot_dir = self.snapshots_dir.join(label);
        match fs::create_dir(&snapshot_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(BackupError::LabelExists(label.to_string()));
            }
            Err(e) => return Err(BackupError::io(&snapshot_dir, e)),
        }

        let mut skipped_sources = Vec::new();
        for source in sources {
            if let Err(reason) = mirror_source(source, &snapshot_dir) {
                warn!(source = %source.display(), error = %reason, "Backup source skipped");
                skipped_sources.push(format!("{}: {}", source.display(), reason));
            }
        }

        let manifest = build_manifest(&snapshot_dir, label);
        write_manifest(&manifest_path, &manifest)?;

        info!(
            label,
            files = manifest.files.len(),
            skipped = skipped_sources.len(),
            "Backup snapshot written"
        );
        Ok(BackupReport {
            snapshot: snapshot_dir,
            manifest: manifest_path,
            files_indexed: manifest.files.len(),
            skipped_sources,
        })
    }

    pub fn verify_label(&self, label: &str) -> Result<Vec<String>, BackupError> {
        validate_label(label)?;
        verify_snapshot(&self.manifest_path(label))
    }

    pub fn list_snapshots(&self) -> Result<Vec<SnapshotInfo>, BackupError> {
        let entries = match fs::read_dir(&self.snapshots_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(BackupError::io(&self.snapshots_dir, e)),
        };

        let mut snapshots = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| BackupError::io(&self.snapshots_dir, e))?;
            if !entry.path().is_dir() {
                continue;
            }
            let label = entry.file_name().to_string_lossy().to_string();
            snapshots.push(SnapshotInfo {
                has_manifest: self.manifest_path(&label).exists(),
                label,
            });
        }
        snapshots.sort_by(|a, b| a.label.cmp(&b.label));
        Ok(snapshots)
    }

    /// Time of the newest manifest, from its `generated_at` or else its label.
    pub fn latest_backup_timestamp(&self) -> Option<DateTime<Utc>> {
        let entries = fs::read_dir(&self.manifests_dir).ok()?;
        entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.extension().map_or(false, |ext| ext == "json"))
            .filter_map(|path| manifest_timestamp(&path))
            .max()
    }
}

/// Re-hashes every file listed in the manifest and reports each one that is
/// missing or changed. An empty list means the snapshot is intact.
pub fn verify_snapshot(manifest_path: &Path) -> Result<Vec<String>, BackupError> {
    if !manifest_path.is_file() {
        return Err(BackupError::ManifestNotFound(manifest_path.to_path_buf()));
    }
    let manifest = read_manifest(manifest_path)?;
    let base_dir = manifest_path
        .parent()
        .and_then(Path::parent)
        .unwrap_or_else(|| Path::new("."))
        .join("snapshots")
        .join(&manifest.snapshot);

    let mut mismatches = Vec::new();
    for record in &manifest.files {
        let file_path = base_dir.join(&record.path);
        if !is_contained(&record.path) || !file_path.is_file() {
            mismatches.push(format!("missing: {}", record.path));
            continue;
        }
        match hash_file(&file_path) {
            Ok((digest, _)) if digest == record.sha256 => {}
            Ok(_) => mismatches.push(format!("changed: {}", record.path)),
            Err(e) => {
                warn!(path = %file_path.display(), error = %e, "Failed to re-hash file");
                mismatches.push(format!("changed: {}", record.path));
            }
        }
    }
    debug!(
        manifest = %manifest_path.display(),
        checked = manifest.files.len(),
        mismatches = mismatches.len(),
        "Snapshot verified"
    );
    Ok(mismatches)
}

/// True when no backup exists yet or the newest one is at least `tolerance` old.
pub fn should_run_backup(last: Option<DateTime<Utc>>, now: DateTime<Utc>, tolerance: Duration) -> bool {
    match last {
        None => true,
        Some(last) => now - last >= tolerance,
    }
}

pub fn default_label(now: DateTime<Local>) -> String {
    now.format(LABEL_FORMAT).to_string()
}

fn validate_label(label: &str) -> Result<(), BackupError> {
    let mut components = Path::new(label).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(BackupError::InvalidLabel(label.to_string())),
    }
}

fn is_contained(relative: &str) -> bool {
    Path::new(relative)
        .components()
        .all(|component| matches!(component, Component::Normal(_)))
}

fn mirror_source(source: &Path, snapshot_dir: &Path) -> Result<(), BackupError> {
    let name = source
        .file_name()
        .ok_or_else(|| BackupError::io(source, io::Error::new(io::ErrorKind::InvalidInput, "source has no file name")))?;
    let destination = snapshot_dir.join(name);

    let metadata = fs::metadata(source).map_err(|e| BackupError::io(source, e))?;
    if metadata.is_dir() {
        debug!(source = %source.display(), destination = %destination.display(), "Mirroring directory");
        mirror_dir(source, &destination)
    } else {
        copy_file(source, &destination)
    }
}

/// Makes `dst` an exact copy of `src`: new and changed entries are copied,
/// entries missing from `src` are deleted.
fn mirror_dir(src: &Path, dst: &Path) -> Result<(), BackupError> {
    clear_target(dst, true)?;
    fs::create_dir_all(dst).map_err(|e| BackupError::io(dst, e))?;

    for entry in WalkDir::new(src).min_depth(1).follow_links(false) {
        let entry = entry?;
        let Ok(relative) = entry.path().strip_prefix(src) else {
            continue;
        };
        let target = dst.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            clear_target(&target, true)?;
            fs::create_dir_all(&target).map_err(|e| BackupError::io(&target, e))?;
        } else if file_type.is_file() {
            copy_file(entry.path(), &target)?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        }
    }

    let mut stale = Vec::new();
    let mut walker = WalkDir::new(dst).min_depth(1).follow_links(false).into_iter();
    while let Some(entry) = walker.next() {
        let entry = entry?;
        let Ok(relative) = entry.path().strip_prefix(dst) else {
            continue;
        };
        if fs::symlink_metadata(src.join(relative)).is_err() {
            let is_dir = entry.file_type().is_dir();
            if is_dir {
                walker.skip_current_dir();
            }
            stale.push((entry.into_path(), is_dir));
        }
    }

    for (path, is_dir) in stale {
        debug!(path = %path.display(), "Removing entry absent from source");
        let result = if is_dir {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        result.map_err(|e| BackupError::io(&path, e))?;
    }
    Ok(())
}

/// Removes whatever sits at `target` if it would block writing a dir (`want_dir`) or a file.
fn clear_target(target: &Path, want_dir: bool) -> Result<(), BackupError> {
    let Ok(metadata) = fs::symlink_metadata(target) else {
        return Ok(());
    };
    let result = if metadata.is_dir() && !want_dir {
        fs::remove_dir_all(target)
    } else if !metadata.is_dir() && (want_dir || metadata.file_type().is_symlink()) {
        fs::remove_file(target)
    } else {
        Ok(())
    };
    result.map_err(|e| BackupError::io(target, e))
}

fn copy_file(src: &Path, dst: &Path) -> Result<(), BackupError> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).map_err(|e| BackupError::io(parent, e))?;
    }
    clear_target(dst, false)?;
    fs::copy(src, dst).map_err(|e| BackupError::io(src, e))?;
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> Result<(), BackupError> {
    let link = fs::read_link(src).map_err(|e| BackupError::io(src, e))?;
    if let Ok(existing) = fs::symlink_metadata(dst) {
        let removed = if existing.is_dir() {
            fs::remove_dir_all(dst)
        } else {
            fs::remove_file(dst)
        };
        removed.map_err(|e| BackupError::io(dst, e))?;
    }
    std::os::unix::fs::symlink(&link, dst).map_err(|e| BackupError::io(dst, e))
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, _dst: &Path) -> Result<(), BackupError> {
    debug!(path = %src.display(), "Skipping symlink on this platform");
    Ok(())
}

/// Hashes every regular file under `snapshot_dir`. Unreadable files are logged and left out.
fn build_manifest(snapshot_dir: &Path, label: &str) -> Manifest {
    let mut files = Vec::new();
    for entry in WalkDir::new(snapshot_dir).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "Skipping unreadable snapshot entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(snapshot_dir) else {
            continue;
        };
        match hash_file(entry.path()) {
            Ok((sha256, size)) => files.push(FileRecord {
                path: relative_path_string(relative),
                sha256,
                size,
            }),
            Err(e) => warn!(path = %entry.path().display(), error = %e, "Failed to hash file"),
        }
    }
    files.sort_by(|a, b| a.path.cmp(&b.path));

    Manifest {
        snapshot: label.to_string(),
        generated_at: DateTime::<FixedOffset>::from(Local::now()),
        files,
    }
}

fn relative_path_string(relative: &Path) -> String {
    relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Lowercase hex SHA-256 and byte length of a file, streamed.
fn hash_file(path: &Path) -> io::Result<(String, u64)> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut buffer = vec![0_u8; HASH_BUFFER_SIZE];
    let mut hasher = Sha256::new();
    let mut size = 0_u64;
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        size += read as u64;
    }

    let mut hex = String::with_capacity(64);
    for byte in hasher.finalize() {
        let _ = write!(hex, "{byte:02x}");
    }
    Ok((hex, size))
}

/// Writes to a temp file, syncs it, then renames into place.
fn write_manifest(path: &Path, manifest: &Manifest) -> Result<(), BackupError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| BackupError::io(parent, e))?;
    }
    let content = serde_json::to_vec_pretty(manifest).map_err(|source| BackupError::Manifest {
        path: path.to_path_buf(),
        source,
    })?;

    let temp_path = path.with_extension("json.tmp");
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&temp_path)
        .map_err(|e| BackupError::io(&temp_path, e))?;
    file.write_all(&content)
        .and_then(|_| file.sync_all())
        .map_err(|e| BackupError::io(&temp_path, e))?;
    fs::rename(&temp_path, path).map_err(|e| BackupError::io(path, e))
}

fn read_manifest(path: &Path) -> Result<Manifest, BackupError> {
    let content = fs::read(path).map_err(|e| BackupError::io(path, e))?;
    serde_json::from_slice(&content).map_err(|source| BackupError::Manifest {
        path: path.to_path_buf(),
        source,
    })
}

fn manifest_timestamp(path: &Path) -> Option<DateTime<Utc>> {
    if let Ok(manifest) = read_manifest(path) {
        return Some(manifest.generated_at.with_timezone(&Utc));
    }
    let label = path.file_stem()?.to_str()?;
    let naive = NaiveDateTime::parse_from_str(label, LABEL_FORMAT).ok()?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const LABEL: &str = "20240501-023000";

    struct Fixture {
        _root: TempDir,
        source: PathBuf,
        engine: BackupEngine,
        backup_dir: PathBuf,
    }

    fn fixture() -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let source = root.path().join("app");
        fs::create_dir_all(&source).unwrap();
        fs::write(source.join("config.txt"), b"0123456789").unwrap();
        let backup_dir = root.path().join("backups");
        Fixture {
            engine: BackupEngine::new(&backup_dir),
            source,
            backup_dir,
            _root: root,
        }
    }

    #[test]
    fn manifest_round_trip_detects_change_then_loss() {
        let fx = fixture();
        let report = fx.engine.perform_backup(&[fx.source.clone()], LABEL).unwrap();
        assert_eq!(report.files_indexed, 1);
        assert!(report.skipped_sources.is_empty());
        assert_eq!(report.snapshot, fx.backup_dir.join("snapshots").join(LABEL));
        assert_eq!(report.manifest, fx.backup_dir.join("manifests").join("20240501-023000.json"));

        assert!(verify_snapshot(&report.manifest).unwrap().is_empty());

        let copied = report.snapshot.join("app").join("config.txt");
        fs::write(&copied, b"9876543210").unwrap();
        assert_eq!(
            verify_snapshot(&report.manifest).unwrap(),
            vec!["changed: app/config.txt".to_string()]
        );

        fs::remove_file(&copied).unwrap();
        assert_eq!(
            verify_snapshot(&report.manifest).unwrap(),
            vec!["missing: app/config.txt".to_string()]
        );
    }

    #[test]
    fn manifest_records_hash_and_size() {
        let fx = fixture();
        fs::create_dir_all(fx.source.join("nested")).unwrap();
        fs::write(fx.source.join("nested").join("b.txt"), b"").unwrap();
        let report = fx.engine.perform_backup(&[fx.source.clone()], LABEL).unwrap();

        let manifest = read_manifest(&report.manifest).unwrap();
        assert_eq!(manifest.snapshot, LABEL);
        assert_eq!(
            manifest.files,
            vec![
                FileRecord {
                    path: "app/config.txt".to_string(),
                    sha256: "84d89877f0d4041efb6bf91a16f0248f2fd573e6af05c19f96bedb9f882f7882"
                        .to_string(),
                    size: 10,
                },
                FileRecord {
                    path: "app/nested/b.txt".to_string(),
                    sha256: "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
                        .to_string(),
                    size: 0,
                },
            ]
        );

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&report.manifest).unwrap()).unwrap();
        assert!(raw["generated_at"].as_str().is_some());
        assert!(!report.manifest.with_extension("json.tmp").exists());
    }

    #[test]
    fn single_files_are_copied_and_missing_sources_skipped() {
        let fx = fixture();
        let env_file = fx.source.parent().unwrap().join(".env");
        fs::write(&env_file, b"BOT_TOKEN=x").unwrap();
        let ghost = fx.source.parent().unwrap().join("ghost");

        let report = fx
            .engine
            .perform_backup(&[env_file, ghost.clone(), fx.source.clone()], LABEL)
            .unwrap();
        assert_eq!(report.files_indexed, 2);
        assert_eq!(report.skipped_sources.len(), 1);
        assert!(report.skipped_sources[0].starts_with(&ghost.display().to_string()));
        assert!(report.snapshot.join(".env").is_file());
    }

    #[test]
    fn mirror_propagates_deletions() {
        let fx = fixture();
        let dst = fx.backup_dir.join("mirror");
        fs::create_dir_all(dst.join("old_dir")).unwrap();
        fs::write(dst.join("old_dir").join("stale.log"), b"x").unwrap();
        fs::write(dst.join("stale.txt"), b"x").unwrap();
        // A file where the source has a directory.
        fs::create_dir_all(fx.source.join("sub")).unwrap();
        fs::write(fx.source.join("sub").join("keep.txt"), b"keep").unwrap();
        fs::write(dst.join("sub"), b"not a dir").unwrap();

        mirror_dir(&fx.source, &dst).unwrap();

        assert!(!dst.join("stale.txt").exists());
        assert!(!dst.join("old_dir").exists());
        assert_eq!(fs::read(dst.join("sub").join("keep.txt")).unwrap(), b"keep");
        assert_eq!(fs::read(dst.join("config.txt")).unwrap(), b"0123456789");
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_recreated_not_followed() {
        let fx = fixture();
        std::os::unix::fs::symlink("config.txt", fx.source.join("link.txt")).unwrap();
        let report = fx.engine.perform_backup(&[fx.source.clone()], LABEL).unwrap();

        let link = report.snapshot.join("app").join("link.txt");
        assert_eq!(fs::read_link(&link).unwrap(), PathBuf::from("config.txt"));
        assert_eq!(report.files_indexed, 1);
    }

    #[test]
    fn missing_manifest_is_not_found() {
        let fx = fixture();
        let err = fx.engine.verify_label("20200101-000000").unwrap_err();
        assert!(matches!(err, BackupError::ManifestNotFound(_)));
    }

    #[test]
    fn labels_are_single_use_and_plain() {
        let fx = fixture();
        fx.engine.perform_backup(&[fx.source.clone()], LABEL).unwrap();
        assert!(matches!(
            fx.engine.perform_backup(&[fx.source.clone()], LABEL),
            Err(BackupError::LabelExists(_))
        ));
        for bad in ["", "..", "a/b", "/abs"] {
            assert!(matches!(
                fx.engine.perform_backup(&[fx.source.clone()], bad),
                Err(BackupError::InvalidLabel(_))
            ));
        }
    }

    #[test]
    fn abandoned_snapshot_label_is_not_reused() {
        let fx = fixture();
        let partial = fx.backup_dir.join("snapshots").join(LABEL);
        fs::create_dir_all(&partial).unwrap();
        fs::write(partial.join("half.txt"), b"partial").unwrap();

        assert!(matches!(
            fx.engine.perform_backup(&[fx.source.clone()], LABEL),
            Err(BackupError::LabelExists(_))
        ));
        assert_eq!(fs::read(partial.join("half.txt")).unwrap(), b"partial");
        assert!(!fx.engine.manifest_path(LABEL).exists());
    }

    #[test]
    fn concurrent_runs_with_one_label_produce_one_snapshot() {
        let fx = fixture();
        let results: Vec<_> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| scope.spawn(|| fx.engine.perform_backup(&[fx.source.clone()], LABEL)))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, BackupError::LabelExists(_))));
        assert!(verify_snapshot(&fx.engine.manifest_path(LABEL)).unwrap().is_empty());
    }

    #[test]
    fn tampered_paths_are_reported_missing() {
        let fx = fixture();
        let report = fx.engine.perform_backup(&[fx.source.clone()], LABEL).unwrap();
        let mut manifest = read_manifest(&report.manifest).unwrap();
        manifest.files[0].path = "../../app/config.txt".to_string();
        fs::write(&report.manifest, serde_json::to_vec(&manifest).unwrap()).unwrap();

        assert_eq!(
            verify_snapshot(&report.manifest).unwrap(),
            vec!["missing: ../../app/config.txt".to_string()]
        );
    }

    #[test]
    fn lists_snapshots_with_manifest_state() {
        let fx = fixture();
        assert!(fx.engine.list_snapshots().unwrap().is_empty());

        fx.engine.perform_backup(&[fx.source.clone()], LABEL).unwrap();
        fs::create_dir_all(fx.backup_dir.join("snapshots").join("20240502-023000")).unwrap();

        let snapshots = fx.engine.list_snapshots().unwrap();
        assert_eq!(
            snapshots,
            vec![
                SnapshotInfo {
                    label: LABEL.to_string(),
                    has_manifest: true
                },
                SnapshotInfo {
                    label: "20240502-023000".to_string(),
                    has_manifest: false
                },
            ]
        );
    }

    #[test]
    fn latest_timestamp_prefers_embedded_time() {
        let fx = fixture();
        assert_eq!(fx.engine.latest_backup_timestamp(), None);

        let before = Utc::now();
        fx.engine.perform_backup(&[fx.source.clone()], LABEL).unwrap();
        let latest = fx.engine.latest_backup_timestamp().unwrap();
        assert!(latest >= before - Duration::seconds(1));

        // Unparseable manifest falls back to its label.
        let manifests = fx.backup_dir.join("manifests");
        fs::write(manifests.join("20990101-000000.json"), b"{").unwrap();
        let latest = fx.engine.latest_backup_timestamp().unwrap();
        assert_eq!(latest.with_timezone(&Local).format(LABEL_FORMAT).to_string(), "20990101-000000");
    }

    #[test]
    fn should_run_backup_respects_tolerance() {
        let now = Utc::now();
        assert!(should_run_backup(None, now, Duration::minutes(45)));

        let last = Some(now - Duration::minutes(30));
        assert!(!should_run_backup(last, now, Duration::minutes(45)));
        assert!(should_run_backup(last, now, Duration::minutes(20)));
    }

    #[test]
    fn default_label_is_sortable_timestamp() {
        let local = Local.with_ymd_and_hms(2024, 5, 1, 2, 30, 0).unwrap();
        assert_eq!(default_label(local), LABEL);
    }
}
