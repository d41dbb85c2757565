//! Conversation cache housekeeping.
//!
//! The IDE keeps one "brain" directory per task plus a `<task id>.pb`
//! conversation record, and one directory per code context. This module
//! measures them and trims everything but the newest tasks. All filesystem
//! access is best-effort: unreadable or missing paths count as empty.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Companion record extension in the conversations directory
const CONVERSATION_EXT: &str = "pb";

/// Locations of the IDE's cache directories
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePaths {
    pub brain_dir: PathBuf,
    pub conversations_dir: PathBuf,
    pub code_contexts_dir: PathBuf,
}

impl CachePaths {
    /// Directories under `<root>` (normally `~/.gemini/antigravity`)
    pub fn under(root: &Path) -> Self {
        Self {
            brain_dir: root.join("brain"),
            conversations_dir: root.join("conversations"),
            code_contexts_dir: root.join("code_tracker").join("active"),
        }
    }

    /// Default IDE data root
    pub fn default_root() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".gemini").join("antigravity"))
    }
}

/// One brain task directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrainTask {
    pub id: String,
    /// First heading of `task.md`, else its first line, else the id
    pub label: String,
    pub path: PathBuf,
    pub size: u64,
    pub file_count: usize,
    /// Last modification, Unix epoch milliseconds
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeContext {
    pub id: String,
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileItem {
    pub name: String,
    pub path: PathBuf,
}

/// Sizes, counts, and item lists of the cache directories
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheInfo {
    pub brain_size: u64,
    pub conversations_size: u64,
    pub total_size: u64,
    pub brain_count: usize,
    pub conversations_count: usize,
    pub brain_tasks: Vec<BrainTask>,
    pub code_contexts: Vec<CodeContext>,
}

/// Outcome of [`CacheService::clean_cache`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanReport {
    /// Brain tasks removed (orphan records are not counted)
    pub deleted_count: usize,
    pub freed_bytes: u64,
}

/// Scans and cleans the cache directories
#[derive(Debug, Clone)]
pub struct CacheService {
    paths: CachePaths,
}

impl CacheService {
    pub fn new(paths: CachePaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &CachePaths {
        &self.paths
    }

    pub fn cache_info(&self) -> CacheInfo {
        let brain_size = directory_size(&self.paths.brain_dir);
        let conversations_size = directory_size(&self.paths.conversations_dir);
        let brain_tasks = self.brain_tasks();

        CacheInfo {
            brain_size,
            conversations_size,
            total_size: brain_size + conversations_size,
            brain_count: brain_tasks.len(),
            conversations_count: file_count(&self.paths.conversations_dir),
            brain_tasks,
            code_contexts: self.code_contexts(),
        }
    }

    /// Brain tasks, newest first
    pub fn brain_tasks(&self) -> Vec<BrainTask> {
        let mut tasks: Vec<BrainTask> = subdirectories(&self.paths.brain_dir)
            .into_iter()
            .map(|(id, path)| BrainTask {
                label: task_label(&path, &id),
                size: directory_size(&path),
                file_count: file_count(&path),
                created_at: modified_ms(&path),
                id,
                path,
            })
            .collect();

        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        tasks
    }

    /// Code contexts, sorted by name
    pub fn code_contexts(&self) -> Vec<CodeContext> {
        let mut contexts: Vec<CodeContext> = subdirectories(&self.paths.code_contexts_dir)
            .into_iter()
            .map(|(id, path)| CodeContext {
                name: id.clone(),
                size: directory_size(&path),
                id,
            })
            .collect();
        contexts.sort_by(|a, b| a.name.cmp(&b.name));
        contexts
    }

    pub fn task_files(&self, task_id: &str) -> Result<Vec<FileItem>> {
        validate_id(task_id)?;
        Ok(files_in(&self.paths.brain_dir.join(task_id)))
    }

    pub fn context_files(&self, context_id: &str) -> Result<Vec<FileItem>> {
        validate_id(context_id)?;
        Ok(files_in(&self.paths.code_contexts_dir.join(context_id)))
    }

    /// Remove a task directory and its conversation record
    pub fn delete_task(&self, task_id: &str) -> Result<()> {
        validate_id(task_id)?;
        remove_dir_if_exists(&self.paths.brain_dir.join(task_id))?;
        remove_file_if_exists(&self.conversation_record(task_id))?;
        debug!("Deleted task {}", task_id);
        Ok(())
    }

    pub fn delete_context(&self, context_id: &str) -> Result<()> {
        validate_id(context_id)?;
        remove_dir_if_exists(&self.paths.code_contexts_dir.join(context_id))
    }

    pub fn delete_file(&self, path: &Path) -> Result<()> {
        remove_file_if_exists(path)
    }

    /// Keep the newest `keep_count` tasks and delete the rest, then trim
    /// conversation records to the newest `keep_count`.
    ///
    /// Freed bytes are measured before removal and include companion
    /// records. Failures are logged and skipped.
    pub fn clean_cache(&self, keep_count: usize) -> CleanReport {
        let mut report = CleanReport::default();

        for task in self.brain_tasks().into_iter().skip(keep_count) {
            let record_size = fs::metadata(self.conversation_record(&task.id))
                .map(|m| m.len())
                .unwrap_or(0);

            match self.delete_task(&task.id) {
                Ok(()) => {
                    report.freed_bytes += task.size + record_size;
                    report.deleted_count += 1;
                }
                Err(e) => debug!("Failed to delete task {}: {:#}", task.id, e),
            }
        }

        report.freed_bytes += self.sweep_orphan_records(keep_count);

        if report.deleted_count > 0 || report.freed_bytes > 0 {
            info!(
                "Cache cleaned: {} task(s), {} bytes freed",
                report.deleted_count, report.freed_bytes
            );
        }
        report
    }

    /// Delete all but the newest `keep_count` conversation records
    fn sweep_orphan_records(&self, keep_count: usize) -> u64 {
        let Ok(entries) = fs::read_dir(&self.paths.conversations_dir) else {
            return 0;
        };

        let mut records: Vec<(PathBuf, i64, u64)> = entries
            .flatten()
            .filter_map(|entry| {
                let path = entry.path();
                let meta = entry.metadata().ok()?;
                let is_record = meta.is_file()
                    && path.extension().and_then(|e| e.to_str()) == Some(CONVERSATION_EXT);
                is_record.then(|| (path, system_time_ms(meta.modified().ok()), meta.len()))
            })
            .collect();
        records.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let mut freed = 0;
        for (path, _, size) in records.into_iter().skip(keep_count) {
            match fs::remove_file(&path) {
                Ok(()) => freed += size,
                Err(e) => debug!("Skipping record {:?}: {}", path, e),
            }
        }
        freed
    }

    fn conversation_record(&self, task_id: &str) -> PathBuf {
        self.paths
            .conversations_dir
            .join(format!("{}.{}", task_id, CONVERSATION_EXT))
    }
}

/// Reject ids that would escape their parent directory
fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() || id == "." || id == ".." || id.contains('/') || id.contains('\\') {
        bail!("Invalid cache item id: {:?}", id);
    }
    Ok(())
}

fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {:?}", path)),
    }
}

fn remove_file_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {:?}", path)),
    }
}

/// Recursive size in bytes; unreadable entries count as zero
pub fn directory_size(path: &Path) -> u64 {
    let Ok(meta) = fs::symlink_metadata(path) else {
        return 0;
    };
    if !meta.is_dir() {
        return if meta.is_file() { meta.len() } else { 0 };
    }

    let Ok(entries) = fs::read_dir(path) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| directory_size(&entry.path()))
        .sum()
}

/// Number of regular files directly inside `path`
pub fn file_count(path: &Path) -> usize {
    fs::read_dir(path)
        .map(|entries| {
            entries
                .flatten()
                .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
                .count()
        })
        .unwrap_or(0)
}

fn subdirectories(path: &Path) -> Vec<(String, PathBuf)> {
    let Ok(entries) = fs::read_dir(path) else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter_map(|e| Some((e.file_name().to_str()?.to_string(), e.path())))
        .collect()
}

fn files_in(path: &Path) -> Vec<FileItem> {
    let Ok(entries) = fs::read_dir(path) else {
        return Vec::new();
    };
    let mut files: Vec<FileItem> = entries
        .flatten()
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter_map(|e| {
            Some(FileItem {
                name: e.file_name().to_str()?.to_string(),
                path: e.path(),
            })
        })
        .collect();
    files.sort_by(|a, b| a.name.cmp(&b.name));
    files
}

fn task_label(task_dir: &Path, fallback: &str) -> String {
    let Ok(content) = fs::read_to_string(task_dir.join("task.md")) else {
        return fallback.to_string();
    };

    let first_line = content.lines().next().unwrap_or("");
    if first_line.starts_with('#') {
        return first_line.trim_start_matches('#').trim().to_string();
    }

    content
        .trim()
        .lines()
        .next()
        .map(|line| line.to_string())
        .filter(|line| !line.is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

fn modified_ms(path: &Path) -> i64 {
    system_time_ms(fs::metadata(path).and_then(|m| m.modified()).ok())
}

fn system_time_ms(time: Option<SystemTime>) -> i64 {
    time.and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;

    fn set_mtime(path: &Path, secs: u64) {
        let time = SystemTime::UNIX_EPOCH + Duration::from_secs(secs);
        File::options()
            .write(true)
            .open(path)
            .or_else(|_| File::open(path))
            .unwrap()
            .set_modified(time)
            .unwrap();
    }

    fn write(path: &Path, bytes: usize) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, vec![b'x'; bytes]).unwrap();
    }

    /// Task dir with one file of `size` bytes plus a `size / 2` byte record
    fn make_task(paths: &CachePaths, id: &str, size: usize, mtime: u64) {
        let dir = paths.brain_dir.join(id);
        write(&dir.join("task.md"), size);
        let record = paths.conversations_dir.join(format!("{}.pb", id));
        write(&record, size / 2);
        set_mtime(&record, mtime);
        set_mtime(&dir, mtime);
    }

    fn service() -> (TempDir, CacheService) {
        let root = TempDir::new().unwrap();
        let service = CacheService::new(CachePaths::under(root.path()));
        (root, service)
    }

    #[test]
    fn test_retention_deletes_oldest_sets() {
        let (_root, service) = service();
        for i in 0..7u64 {
            make_task(service.paths(), &format!("task-{}", i), 100 * (i as usize + 1), 1_000 + i * 60);
        }

        let report = service.clean_cache(5);

        // task-0 (100 + 50) and task-1 (200 + 100) are the two oldest
        assert_eq!(
            report,
            CleanReport {
                deleted_count: 2,
                freed_bytes: 450
            }
        );
        let remaining: Vec<String> = service.brain_tasks().into_iter().map(|t| t.id).collect();
        assert_eq!(
            remaining,
            vec!["task-6", "task-5", "task-4", "task-3", "task-2"]
        );
        assert!(!service.paths().conversations_dir.join("task-0.pb").exists());
        assert!(service.paths().conversations_dir.join("task-2.pb").exists());
    }

    #[test]
    fn test_orphan_records_swept_without_counting() {
        let (_root, service) = service();
        make_task(service.paths(), "kept", 10, 5_000);
        for i in 0..3u64 {
            let orphan = service.paths().conversations_dir.join(format!("orphan-{}.pb", i));
            write(&orphan, 7);
            set_mtime(&orphan, 1_000 + i);
        }
        write(&service.paths().conversations_dir.join("notes.txt"), 3);

        let report = service.clean_cache(2);

        assert_eq!(report.deleted_count, 0);
        // orphan-0 and orphan-1 are beyond the newest two records
        assert_eq!(report.freed_bytes, 14);
        assert!(service.paths().conversations_dir.join("kept.pb").exists());
        assert!(service.paths().conversations_dir.join("orphan-2.pb").exists());
        assert!(service.paths().conversations_dir.join("notes.txt").exists());
    }

    #[test]
    fn test_clean_missing_directories_is_noop() {
        let (_root, service) = service();
        assert_eq!(service.clean_cache(5), CleanReport::default());
        assert_eq!(service.cache_info(), CacheInfo::default());
    }

    #[test]
    fn test_cache_info() {
        let (_root, service) = service();
        write(&service.paths().brain_dir.join("a").join("nested").join("img.png"), 60);
        make_task(service.paths(), "a", 40, 2_000);
        make_task(service.paths(), "b", 10, 3_000);
        write(&service.paths().code_contexts_dir.join("zeta").join("f.txt"), 5);
        write(&service.paths().code_contexts_dir.join("alpha").join("g.txt"), 6);

        let info = service.cache_info();

        assert_eq!(info.brain_size, 110);
        assert_eq!(info.conversations_size, 25);
        assert_eq!(info.total_size, 135);
        assert_eq!(info.brain_count, 2);
        assert_eq!(info.conversations_count, 2);
        assert_eq!(info.brain_tasks[0].id, "b");
        assert_eq!(info.brain_tasks[1].file_count, 1);
        let names: Vec<&str> = info.code_contexts.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
        assert_eq!(info.code_contexts[0].size, 6);
    }

    #[test]
    fn test_task_label() {
        let (_root, service) = service();
        let dir = service.paths().brain_dir.join("t1");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("task.md"), "## Refactor parser\n- [ ] step").unwrap();
        let plain = service.paths().brain_dir.join("t2");
        fs::create_dir_all(&plain).unwrap();
        fs::write(plain.join("task.md"), "\n\nJust text\nmore").unwrap();
        fs::create_dir_all(service.paths().brain_dir.join("t3")).unwrap();

        let labels: Vec<(String, String)> = service
            .brain_tasks()
            .into_iter()
            .map(|t| (t.id, t.label))
            .collect();

        assert!(labels.contains(&("t1".to_string(), "Refactor parser".to_string())));
        assert!(labels.contains(&("t2".to_string(), "Just text".to_string())));
        assert!(labels.contains(&("t3".to_string(), "t3".to_string())));
    }

    #[test]
    fn test_delete_operations() {
        let (_root, service) = service();
        make_task(service.paths(), "gone", 10, 1_000);
        write(&service.paths().code_contexts_dir.join("ctx").join("a.txt"), 1);

        assert_eq!(service.task_files("gone").unwrap().len(), 1);
        service.delete_task("gone").unwrap();
        assert!(!service.paths().brain_dir.join("gone").exists());
        assert!(!service.paths().conversations_dir.join("gone.pb").exists());
        service.delete_task("gone").unwrap();

        assert_eq!(service.context_files("ctx").unwrap()[0].name, "a.txt");
        service.delete_context("ctx").unwrap();
        assert!(service.code_contexts().is_empty());

        assert!(service.delete_task("../escape").is_err());
        assert!(service.delete_context("").is_err());
    }
}
