// Directory tree planning for the recursive upload/download surface: local
// tree enumeration, remote tree enumeration and the filename-collision map
// that keeps concurrent range writers off each other's output paths.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::PilotError;
use crate::api::ComputeApi;

#[derive(Debug, Default)]
pub struct LocalTree {
    /// Relative directory paths, parents before children.
    pub dirs: Vec<PathBuf>,
    /// Relative file paths with sizes.
    pub files: Vec<(PathBuf, u64)>,
    /// Symlinks encountered (skipped, surfaced to the caller).
    pub symlinks: Vec<PathBuf>,
}

fn is_hidden_name(name: &std::ffi::OsStr) -> bool {
    name.to_string_lossy().starts_with('.')
}

/// Walk a local tree. Hidden directories are always pruned; hidden files are
/// included only when asked.
pub fn scan_local(root: &Path, include_hidden: bool) -> anyhow::Result<LocalTree> {
    if !root.is_dir() {
        return Err(
            PilotError::Validation(format!("本地目录不存在: {}", root.display())).into()
        );
    }
    let mut tree = LocalTree::default();
    let walker = WalkDir::new(root).follow_links(false).sort_by_file_name().into_iter();
    let filtered = walker.filter_entry(|e| {
        // 始终跳过隐藏目录；隐藏文件由 include_hidden 决定
        if e.file_type().is_dir() && e.depth() > 0 {
            return !is_hidden_name(e.file_name());
        }
        true
    });
    for entry in filtered {
        crate::util::check_cancelled()?;
        let entry = entry.map_err(|e| PilotError::Fatal(format!("遍历目录失败: {}", e)))?;
        if entry.depth() == 0 {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(|_| PilotError::Fatal("目录项不在根目录下".to_string()))?
            .to_path_buf();
        let ft = entry.file_type();
        if ft.is_symlink() {
            tree.symlinks.push(rel);
        } else if ft.is_dir() {
            tree.dirs.push(rel);
        } else {
            if !include_hidden && is_hidden_name(entry.file_name()) {
                continue;
            }
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            tree.files.push((rel, size));
        }
    }
    Ok(tree)
}

#[derive(Debug, Clone)]
pub struct RemoteTreeFile {
    pub id: String,
    pub name: String,
    /// Path relative to the scanned folder, using '/' separators.
    pub rel_path: String,
    pub size: u64,
}

#[derive(Debug, Default)]
pub struct RemoteTree {
    /// Relative folder paths, parents before children.
    pub folders: Vec<String>,
    pub files: Vec<RemoteTreeFile>,
}

/// Recursively enumerate a remote folder, producing relative paths. File
/// names coming off the wire are validated before they touch any local path.
pub fn scan_remote(api: &dyn ComputeApi, folder_id: &str) -> anyhow::Result<RemoteTree> {
    let mut tree = RemoteTree::default();
    // (folder id, relative prefix)
    let mut queue: std::collections::VecDeque<(String, String)> = std::collections::VecDeque::new();
    queue.push_back((folder_id.to_string(), String::new()));
    while let Some((id, prefix)) = queue.pop_front() {
        crate::util::check_cancelled()?;
        for entry in api.list_folder(Some(&id))? {
            crate::util::validate_remote_name(&entry.name)?;
            let rel = if prefix.is_empty() {
                entry.name.clone()
            } else {
                format!("{}/{}", prefix, entry.name)
            };
            if entry.is_folder {
                tree.folders.push(rel.clone());
                queue.push_back((entry.id, rel));
            } else {
                tree.files.push(RemoteTreeFile {
                    id: entry.id,
                    name: entry.name,
                    rel_path: rel,
                    size: entry.size,
                });
            }
        }
    }
    Ok(tree)
}

/// Insert the remote file id before the extension: `model.sim` with id
/// `ABC123` becomes `model_ABC123.sim`.
fn disambiguate(rel_path: &str, id: &str) -> String {
    match rel_path.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !stem.ends_with('/') => {
            format!("{}_{}.{}", stem, id, ext)
        }
        _ => format!("{}_{}", rel_path, id),
    }
}

/// Precompute one distinct output path per remote file. Concurrent writers to
/// one path would corrupt each other, so colliding names are disambiguated up
/// front with their file ids; the returned warnings name each rewrite.
pub fn collision_safe_paths(
    files: &[RemoteTreeFile],
    out_root: &Path,
) -> anyhow::Result<(HashMap<String, PathBuf>, Vec<String>)> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for f in files {
        *counts.entry(f.rel_path.as_str()).or_default() += 1;
    }
    let mut out = HashMap::new();
    let mut warnings = Vec::new();
    for f in files {
        crate::util::validate_remote_rel_path(&f.rel_path)?;
        let rel = if counts[f.rel_path.as_str()] > 1 {
            let new_rel = disambiguate(&f.rel_path, &f.id);
            warnings.push(format!(
                "远端文件名冲突: {} -> {} (file_id={})",
                f.rel_path, new_rel, f.id
            ));
            new_rel
        } else {
            f.rel_path.clone()
        };
        out.insert(f.id.clone(), out_root.join(rel));
    }
    Ok((out, warnings))
}
