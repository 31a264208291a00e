//! Zips a task's collected artifacts for download.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;
use walkdir::WalkDir;
use zip::{write::FileOptions, CompressionMethod, ZipWriter};

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("invalid task id: {0}")]
    InvalidTaskId(String),
    #[error("no collected data at {0}")]
    MissingSource(PathBuf),
    #[error("{0} is not a directory")]
    NotADirectory(PathBuf),
    #[error("collected data at {0} is empty")]
    Empty(PathBuf),
    #[error("export io error: {0}")]
    Io(#[from] io::Error),
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportSummary {
    pub output_path: PathBuf,
    pub file_count: u64,
    pub bytes: u64,
}

pub fn default_output(exports_dir: &Path, task_id: &str) -> PathBuf {
    exports_dir.join(format!("task_{task_id}.zip"))
}

/// Blocking; callers on the runtime go through `spawn_blocking`.
pub fn export_collected_data(
    collected_dir: &Path,
    exports_dir: &Path,
    task_id: &str,
    output: Option<&Path>,
) -> Result<ExportSummary, ExportError> {
    if task_id.is_empty()
        || !task_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ExportError::InvalidTaskId(task_id.to_string()));
    }

    let source = collected_dir.join(task_id);
    if !source.exists() {
        return Err(ExportError::MissingSource(source));
    }
    if !source.is_dir() {
        return Err(ExportError::NotADirectory(source));
    }

    let files: Vec<(PathBuf, String)> = WalkDir::new(&source)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let name = entry
                .path()
                .strip_prefix(&source)
                .ok()?
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            Some((entry.into_path(), name))
        })
        .collect();
    if files.is_empty() {
        return Err(ExportError::Empty(source));
    }

    let output_path = output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| default_output(exports_dir, task_id));
    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut zip = ZipWriter::new(fs::File::create(&output_path)?);
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    for (path, name) in &files {
        zip.start_file(name.as_str(), options)?;
        let mut input = fs::File::open(path)?;
        io::copy(&mut input, &mut zip)?;
    }
    zip.finish()?;

    let bytes = fs::metadata(&output_path)?.len();
    info!(task_id, files = files.len(), bytes, "exported {}", output_path.display());
    Ok(ExportSummary {
        output_path,
        file_count: files.len() as u64,
        bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zips_nested_files() {
        let collected = tempfile::tempdir().unwrap();
        let exports = tempfile::tempdir().unwrap();
        let task_dir = collected.path().join("t-1");
        fs::create_dir_all(task_dir.join("shots")).unwrap();
        fs::write(task_dir.join("tree.json"), "{}").unwrap();
        fs::write(task_dir.join("shots/0001.png"), [0u8; 64]).unwrap();

        let summary = export_collected_data(collected.path(), exports.path(), "t-1", None).unwrap();
        assert_eq!(summary.output_path, exports.path().join("task_t-1.zip"));
        assert_eq!(summary.file_count, 2);
        assert!(summary.bytes > 0);

        let archive = zip::ZipArchive::new(fs::File::open(&summary.output_path).unwrap()).unwrap();
        let mut names: Vec<_> = archive.file_names().map(str::to_string).collect();
        names.sort();
        assert_eq!(names, vec!["shots/0001.png", "tree.json"]);
    }

    #[test]
    fn rejects_bad_sources() {
        let collected = tempfile::tempdir().unwrap();
        let exports = tempfile::tempdir().unwrap();
        assert!(matches!(
            export_collected_data(collected.path(), exports.path(), "../etc", None),
            Err(ExportError::InvalidTaskId(_))
        ));
        assert!(matches!(
            export_collected_data(collected.path(), exports.path(), "absent", None),
            Err(ExportError::MissingSource(_))
        ));
        fs::write(collected.path().join("file"), "x").unwrap();
        assert!(matches!(
            export_collected_data(collected.path(), exports.path(), "file", None),
            Err(ExportError::NotADirectory(_))
        ));
        fs::create_dir(collected.path().join("empty")).unwrap();
        assert!(matches!(
            export_collected_data(collected.path(), exports.path(), "empty", None),
            Err(ExportError::Empty(_))
        ));
    }

    #[test]
    fn honours_explicit_output_path() {
        let collected = tempfile::tempdir().unwrap();
        let exports = tempfile::tempdir().unwrap();
        fs::create_dir(collected.path().join("t2")).unwrap();
        fs::write(collected.path().join("t2/a.txt"), "a").unwrap();
        let target = exports.path().join("nested/out.zip");
        let summary =
            export_collected_data(collected.path(), exports.path(), "t2", Some(&target)).unwrap();
        assert_eq!(summary.output_path, target);
        assert!(target.is_file());
    }
}
