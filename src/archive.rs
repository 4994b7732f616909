use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::GearError;
use crate::workspace::Workspace;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SelectionReport {
    pub archived: Vec<String>,
    pub files_found: Vec<String>,
    pub dirs_found: Vec<String>,
    pub files_missing: Vec<String>,
    pub dirs_missing: Vec<String>,
}

/// Archives the files below `root_dir/dir_name` chosen by the selectors.
///
/// A file is chosen when its name is one of `selected_files`, when a file
/// selector matches the end of its path, or when a directory selector
/// matches the end of the path of any directory it lives in. Selectors may
/// hold `*` and `?` wildcards within a path segment. Entry names are
/// relative to `root_dir`, so the archive unpacks back into `dir_name/...`.
/// Any existing file at `output_path` is replaced.
pub fn zip_selected(
    root_dir: &Utf8Path,
    dir_name: &str,
    output_path: &Utf8Path,
    selected_files: &[String],
    selected_dirs: &[String],
) -> Result<SelectionReport, GearError> {
    let start = root_dir.join(dir_name);
    if !start.as_std_path().is_dir() {
        return Err(GearError::Archive(format!("{start} is not a directory")));
    }
    remove_existing(output_path)?;

    let mut report = SelectionReport::default();
    let mut archive = ArchiveWriter::create(output_path)?;

    for entry in WalkDir::new(start.as_std_path()).sort_by_file_name() {
        let entry = entry.map_err(|err| GearError::Filesystem(err.to_string()))?;
        if !entry.file_type().is_file() || archive.is_self(entry.path()) {
            continue;
        }
        let Some(relative) = relative_name(root_dir, entry.path()) else {
            warn!("Skipping {}, path is not valid UTF-8", entry.path().display());
            continue;
        };
        let segments: Vec<&str> = relative.split('/').collect();
        let file_name = segments[segments.len() - 1];

        let mut matched = false;
        if selected_files.iter().any(|sel| sel == file_name) {
            matched = true;
            record(&mut report.files_found, file_name);
        } else {
            for sel in selected_files {
                if trailing_match(&segments, sel) {
                    matched = true;
                    record(&mut report.files_found, sel);
                }
            }
        }
        if !matched {
            let dir_segments = &segments[..segments.len() - 1];
            for sel in selected_dirs {
                let inside = (1..=dir_segments.len())
                    .any(|depth| trailing_match(&dir_segments[..depth], sel));
                if inside {
                    matched = true;
                    record(&mut report.dirs_found, sel);
                }
            }
        }

        if matched {
            info!("Zipping {relative}");
            archive.add_file(&relative, entry.path())?;
            report.archived.push(relative);
        }
    }
    archive.finish(output_path)?;

    for sel in selected_files {
        if !report.files_found.contains(sel) {
            warn!("Looked for {sel} but could not find it.");
            report.files_missing.push(sel.clone());
        }
    }
    for sel in selected_dirs {
        if !report.dirs_found.contains(sel) {
            warn!("Looked for {sel} but could not find it.");
            report.dirs_missing.push(sel.clone());
        }
    }

    Ok(report)
}

pub fn zip_all(dir: &Utf8Path, output_path: &Utf8Path) -> Result<(), GearError> {
    if !dir.as_std_path().is_dir() {
        return Err(GearError::Archive(format!("{dir} is not a directory")));
    }
    let base = dir.parent().unwrap_or(Utf8Path::new(""));
    remove_existing(output_path)?;
    let mut archive = ArchiveWriter::create(output_path)?;
    add_tree(&mut archive, base, dir)?;
    archive.finish(output_path)
}

pub fn zip_intermediate_selected(
    workspace: &Workspace,
    run_label: &str,
    files: &[String],
    folders: &[String],
) -> Result<Option<SelectionReport>, GearError> {
    if files.is_empty() && folders.is_empty() {
        debug!("No files or folders specified in config to zip");
        return Ok(None);
    }
    if !files.is_empty() {
        debug!("Looking for these intermediate files to save: {files:?}");
    }
    if !folders.is_empty() {
        debug!("Looking for these intermediate folders to save: {folders:?}");
    }

    let dest = workspace.work_selected_archive(run_label);
    info!("Files and folders will be zipped to {dest}");
    let work_dir = workspace.work_dir();
    let (root, name) = split_dir(&work_dir)?;
    zip_selected(root, name, &dest, files, folders).map(Some)
}

pub fn zip_all_intermediate(workspace: &Workspace, run_label: &str) -> Result<Utf8PathBuf, GearError> {
    let dest = workspace.work_archive(run_label);
    info!("Zipping {} directory to {dest}.", workspace.work_dir());
    zip_all(&workspace.work_dir(), &dest)?;
    Ok(dest)
}

pub fn zip_output(workspace: &Workspace, run_label: &str) -> Result<Utf8PathBuf, GearError> {
    let source = workspace.analysis_output_dir();
    if !source.as_std_path().is_dir() {
        return Err(GearError::Archive(format!(
            "Output directory does not exist: {source}"
        )));
    }
    let dest = workspace.output_archive(run_label);
    info!("Zipping {source} directory to {dest}.");
    zip_all(&source, &dest)?;
    Ok(dest)
}

pub fn zip_htmls(workspace: &Workspace) -> Result<Vec<Utf8PathBuf>, GearError> {
    let results = workspace.analysis_output_dir();
    info!("Creating viewable archives for all html files");
    if !results.as_std_path().is_dir() {
        warn!("No results directory {results}, no html reports to archive");
        return Ok(Vec::new());
    }

    let mut reports = Vec::new();
    for entry in fs::read_dir(results.as_std_path()).map_err(|err| GearError::Filesystem(err.to_string()))? {
        let entry = entry.map_err(|err| GearError::Filesystem(err.to_string()))?;
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if name.ends_with(".html") && entry.path().is_file() {
            reports.push(name);
        }
    }
    reports.sort();
    if reports.is_empty() {
        warn!("No *.html files at {results}");
        return Ok(Vec::new());
    }

    let figures = figure_dirs(&results)?;
    let mut written = Vec::with_capacity(reports.len());
    for report in reports {
        let dest = workspace.html_archive(&report);
        info!("Creating viewable archive {dest}");
        remove_existing(&dest)?;
        let mut archive = ArchiveWriter::create(&dest)?;
        archive.add_file("index.html", results.join(&report).as_std_path())?;
        for dir in &figures {
            info!("including {}", dir.strip_prefix(&results).unwrap_or(dir.as_path()));
            add_tree(&mut archive, &results, dir)?;
        }
        archive.finish(&dest)?;
        written.push(dest);
    }
    Ok(written)
}

fn figure_dirs(results: &Utf8Path) -> Result<Vec<Utf8PathBuf>, GearError> {
    let mut dirs = Vec::new();
    for entry in WalkDir::new(results.as_std_path()).sort_by_file_name() {
        let entry = entry.map_err(|err| GearError::Filesystem(err.to_string()))?;
        if entry.file_type().is_dir() && entry.file_name() == "figures" {
            if let Some(path) = entry.path().to_str() {
                dirs.push(Utf8PathBuf::from(path));
            }
        }
    }
    Ok(dirs)
}

fn add_tree(archive: &mut ArchiveWriter, base: &Utf8Path, dir: &Utf8Path) -> Result<(), GearError> {
    for entry in WalkDir::new(dir.as_std_path()).sort_by_file_name() {
        let entry = entry.map_err(|err| GearError::Filesystem(err.to_string()))?;
        if archive.is_self(entry.path()) {
            continue;
        }
        let Some(relative) = relative_name(base, entry.path()) else {
            warn!("Skipping {}, path is not valid UTF-8", entry.path().display());
            continue;
        };
        if entry.file_type().is_dir() {
            archive.add_directory(&relative)?;
        } else if entry.file_type().is_file() {
            archive.add_file(&relative, entry.path())?;
        }
    }
    Ok(())
}

struct ArchiveWriter {
    zip: ZipWriter<NamedTempFile>,
    options: SimpleFileOptions,
    temp_path: PathBuf,
}

impl ArchiveWriter {
    fn create(output_path: &Utf8Path) -> Result<Self, GearError> {
        let parent = output_path
            .parent()
            .filter(|parent| !parent.as_str().is_empty())
            .unwrap_or(Utf8Path::new("."));
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| GearError::Filesystem(format!("create {parent}: {err}")))?;
        let temp = tempfile::Builder::new()
            .prefix(".bids-gear-zip")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| GearError::Filesystem(err.to_string()))?;
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .large_file(true);
        let temp_path = temp.path().to_path_buf();
        Ok(Self {
            zip: ZipWriter::new(temp),
            options,
            temp_path,
        })
    }

    fn is_self(&self, path: &Path) -> bool {
        path == self.temp_path
    }

    fn add_file(&mut self, name: &str, source: &Path) -> Result<(), GearError> {
        let mut input = fs::File::open(source)
            .map_err(|err| GearError::Archive(format!("open {}: {err}", source.display())))?;
        self.zip
            .start_file(name, self.options)
            .map_err(|err| GearError::Archive(err.to_string()))?;
        io::copy(&mut input, &mut self.zip)
            .map_err(|err| GearError::Archive(format!("write {name}: {err}")))?;
        Ok(())
    }

    fn add_directory(&mut self, name: &str) -> Result<(), GearError> {
        self.zip
            .add_directory(format!("{name}/"), self.options)
            .map_err(|err| GearError::Archive(err.to_string()))
    }

    fn finish(self, output_path: &Utf8Path) -> Result<(), GearError> {
        let temp = self
            .zip
            .finish()
            .map_err(|err| GearError::Archive(err.to_string()))?;
        temp.persist(output_path.as_std_path())
            .map_err(|err| GearError::Archive(format!("save {output_path}: {err}")))?;
        Ok(())
    }
}

fn remove_existing(path: &Utf8Path) -> Result<(), GearError> {
    if path.as_std_path().is_file() {
        fs::remove_file(path.as_std_path())
            .map_err(|err| GearError::Filesystem(format!("remove {path}: {err}")))?;
    }
    Ok(())
}

fn split_dir(dir: &Utf8Path) -> Result<(&Utf8Path, &str), GearError> {
    match (dir.parent(), dir.file_name()) {
        (Some(parent), Some(name)) => Ok((parent, name)),
        _ => Err(GearError::Archive(format!("{dir} has no parent directory"))),
    }
}

fn relative_name(base: &Utf8Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(base.as_std_path()).ok()?;
    let parts = relative
        .components()
        .map(|part| part.as_os_str().to_str())
        .collect::<Option<Vec<_>>>()?;
    Some(parts.join("/"))
}

pub fn trailing_match(segments: &[&str], selector: &str) -> bool {
    let pattern: Vec<&str> = selector.split('/').filter(|part| !part.is_empty()).collect();
    if pattern.is_empty() || pattern.len() > segments.len() {
        return false;
    }
    let tail = &segments[segments.len() - pattern.len()..];
    tail.iter()
        .zip(&pattern)
        .all(|(segment, part)| segment_match(segment, part))
}

fn segment_match(segment: &str, pattern: &str) -> bool {
    if !pattern.contains(['*', '?']) {
        return segment == pattern;
    }
    glob_regex(pattern).is_some_and(|regex| regex.is_match(segment))
}

fn glob_regex(pattern: &str) -> Option<Regex> {
    let mut expression = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => expression.push_str(".*"),
            '?' => expression.push('.'),
            other => expression.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }
    expression.push('$');
    Regex::new(&expression).ok()
}

fn record(found: &mut Vec<String>, selector: &str) {
    if !found.iter().any(|existing| existing == selector) {
        found.push(selector.to_string());
    }
}
