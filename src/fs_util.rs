use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use zip::ZipArchive;

use crate::error::GearError;

pub fn extract_zip(zip_path: &Path, target_dir: &Path) -> Result<Vec<PathBuf>, GearError> {
    let file = fs::File::open(zip_path)
        .map_err(|err| GearError::Archive(format!("open zip {}: {err}", zip_path.display())))?;
    let mut archive = ZipArchive::new(file).map_err(|err| GearError::Archive(err.to_string()))?;

    let mut written = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| GearError::Archive(err.to_string()))?;
        let entry_path = match entry.enclosed_name() {
            Some(path) => target_dir.join(path),
            None => {
                return Err(GearError::Archive(
                    "zip entry path traversal detected".to_string(),
                ));
            }
        };

        if entry.is_dir() {
            fs::create_dir_all(&entry_path).map_err(|err| GearError::Filesystem(err.to_string()))?;
            continue;
        }

        if let Some(parent) = entry_path.parent() {
            fs::create_dir_all(parent).map_err(|err| GearError::Filesystem(err.to_string()))?;
        }
        let mut outfile =
            fs::File::create(&entry_path).map_err(|err| GearError::Filesystem(err.to_string()))?;
        io::copy(&mut entry, &mut outfile).map_err(|err| GearError::Filesystem(err.to_string()))?;
        written.push(entry_path);
    }
    Ok(written)
}

pub fn validate_zip(zip_path: &Path) -> Result<(), GearError> {
    let file = fs::File::open(zip_path)
        .map_err(|err| GearError::Archive(format!("open zip {}: {err}", zip_path.display())))?;
    let mut archive = ZipArchive::new(file).map_err(|err| GearError::Archive(err.to_string()))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| GearError::Archive(err.to_string()))?;
        if entry.is_dir() {
            continue;
        }
        io::copy(&mut entry, &mut io::sink()).map_err(|err| GearError::Archive(err.to_string()))?;
    }
    Ok(())
}

pub fn zip_entry_names(zip_path: &Path) -> Result<Vec<String>, GearError> {
    let file = fs::File::open(zip_path)
        .map_err(|err| GearError::Archive(format!("open zip {}: {err}", zip_path.display())))?;
    let archive = ZipArchive::new(file).map_err(|err| GearError::Archive(err.to_string()))?;
    Ok(archive.file_names().map(str::to_string).collect())
}

pub fn write_file_atomic(dest: &Path, contents: &[u8]) -> Result<(), GearError> {
    let parent = dest
        .parent()
        .ok_or_else(|| GearError::Filesystem(format!("invalid destination path {}", dest.display())))?;
    fs::create_dir_all(parent).map_err(|err| GearError::Filesystem(err.to_string()))?;
    let mut temp = tempfile::Builder::new()
        .prefix(".bids-gear")
        .tempfile_in(parent)
        .map_err(|err| GearError::Filesystem(err.to_string()))?;
    io::Write::write_all(&mut temp, contents).map_err(|err| GearError::Filesystem(err.to_string()))?;
    temp.persist(dest)
        .map_err(|err| GearError::Filesystem(err.to_string()))?;
    Ok(())
}

pub fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}
