// Archive stage: deterministic tar of a job input directory. Entries are
// visited breadth-first, lexically sorted within each directory, so two runs
// over identical inputs produce byte-identical archives.

use std::collections::VecDeque;
use std::io::Write;
use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::PilotError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    Gzip,
}

#[derive(Debug, Clone, Default)]
pub struct ArchiveOptions {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    /// Strip directory prefixes: every file lands at the archive root.
    pub flatten: bool,
    pub compression: Compression,
}

#[derive(Debug, Default)]
pub struct ArchiveReport {
    pub entries: u64,
    pub bytes: u64,
    pub symlinks_skipped: Vec<PathBuf>,
    pub excluded: u64,
}

fn compile_globs(patterns: &[String], what: &str) -> anyhow::Result<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut b = GlobSetBuilder::new();
    for p in patterns {
        let g = Glob::new(p)
            .map_err(|e| PilotError::Validation(format!("非法 {} glob '{}': {}", what, p, e)))?;
        b.add(g);
    }
    Ok(Some(b.build().map_err(|e| {
        PilotError::Validation(format!("无法编译 {} glob 集合: {}", what, e))
    })?))
}

fn sorted_entries(dir: &Path) -> anyhow::Result<Vec<std::fs::DirEntry>> {
    let rd = std::fs::read_dir(dir).map_err(|e| PilotError::from_io(&e, "读取目录"))?;
    let mut entries: Vec<_> = Vec::new();
    for e in rd {
        entries.push(e.map_err(|e| PilotError::from_io(&e, "读取目录项"))?);
    }
    entries.sort_by_key(|e| e.file_name());
    Ok(entries)
}

/// Stream a tar (optionally gzip-framed) of `root` into `out`.
///
/// Rules: symlinks are skipped and reported; an entry matching any exclude
/// glob is omitted; when include globs are present, only matching files are
/// stored; paths are stored relative to `root`, or as bare file names when
/// flattening. Directory entries are stored only in the plain (non-flatten,
/// no-include) layout where the tree shape is being preserved.
pub fn write_archive<W: Write>(
    root: &Path,
    opts: &ArchiveOptions,
    out: W,
) -> anyhow::Result<ArchiveReport> {
    if !root.is_dir() {
        return Err(
            PilotError::Validation(format!("任务目录不存在或不是目录: {}", root.display())).into()
        );
    }
    match opts.compression {
        Compression::Gzip => {
            let gz = flate2::write::GzEncoder::new(out, flate2::Compression::default());
            let (report, gz) = append_tree(root, opts, gz)?;
            let mut out = gz.finish().map_err(|e| PilotError::from_io(&e, "结束压缩流"))?;
            out.flush().map_err(|e| PilotError::from_io(&e, "刷写归档"))?;
            Ok(report)
        }
        Compression::None => {
            let (report, mut out) = append_tree(root, opts, out)?;
            out.flush().map_err(|e| PilotError::from_io(&e, "刷写归档"))?;
            Ok(report)
        }
    }
}

fn append_tree<W: Write>(
    root: &Path,
    opts: &ArchiveOptions,
    out: W,
) -> anyhow::Result<(ArchiveReport, W)> {
    let include = compile_globs(&opts.include, "include")?;
    let exclude = compile_globs(&opts.exclude, "exclude")?;
    let mut report = ArchiveReport::default();
    let mut builder = tar::Builder::new(out);
    builder.follow_symlinks(false);

    // 广度优先；目录内字典序 — breadth-first, lexical within a directory
    let mut queue: VecDeque<PathBuf> = VecDeque::new();
    queue.push_back(root.to_path_buf());
    while let Some(dir) = queue.pop_front() {
        crate::util::check_cancelled()?;
        for entry in sorted_entries(&dir)? {
            let full = entry.path();
            let rel = full
                .strip_prefix(root)
                .map_err(|_| PilotError::Fatal("目录项不在根目录下".to_string()))?
                .to_path_buf();
            let rel_str = unix_rel(&rel);
            let meta = std::fs::symlink_metadata(&full)
                .map_err(|e| PilotError::from_io(&e, "读取项元数据"))?;

            if meta.file_type().is_symlink() {
                report.symlinks_skipped.push(full.clone());
                tracing::warn!("[archive] 跳过符号链接: {}", full.display());
                continue;
            }
            if let Some(ex) = &exclude
                && ex.is_match(&rel_str)
            {
                report.excluded += 1;
                continue;
            }

            if meta.is_dir() {
                if include.is_none() && !opts.flatten {
                    builder
                        .append_dir(&rel, &full)
                        .map_err(|e| PilotError::from_io(&e, "写入目录项"))?;
                }
                queue.push_back(full);
                continue;
            }

            if let Some(inc) = &include
                && !inc.is_match(&rel_str)
            {
                report.excluded += 1;
                continue;
            }

            let stored: PathBuf = if opts.flatten {
                PathBuf::from(rel.file_name().unwrap_or(rel.as_os_str()))
            } else {
                rel.clone()
            };
            builder
                .append_path_with_name(&full, &stored)
                .map_err(|e| PilotError::from_io(&e, "写入归档项"))?;
            report.entries += 1;
            report.bytes += meta.len();
        }
    }
    let inner = builder.into_inner().map_err(|e| PilotError::from_io(&e, "结束归档"))?;
    Ok((report, inner))
}

/// Archive into a file; the upload engine can also consume `write_archive`
/// directly with any writer.
pub fn build_archive(
    root: &Path,
    opts: &ArchiveOptions,
    dst: &Path,
) -> anyhow::Result<ArchiveReport> {
    let f = std::fs::File::create(dst).map_err(|e| PilotError::from_io(&e, "创建归档文件"))?;
    let mut w = std::io::BufWriter::new(f);
    let report = write_archive(root, opts, &mut w)?;
    let f = w.into_inner().map_err(|e| PilotError::Fatal(format!("刷写归档文件失败: {}", e)))?;
    f.sync_all().map_err(|e| PilotError::from_io(&e, "落盘归档文件"))?;
    Ok(report)
}

pub fn archive_file_name(job_name: &str, compression: Compression) -> String {
    match compression {
        Compression::Gzip => format!("{}.tar.gz", job_name),
        Compression::None => format!("{}.tar", job_name),
    }
}

fn unix_rel(rel: &Path) -> String {
    let s = rel.to_string_lossy().to_string();
    if s.contains('\\') { s.replace('\\', "/") } else { s }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_tree(dir: &Path) {
        std::fs::create_dir_all(dir.join("sub/inner")).unwrap();
        std::fs::write(dir.join("b.txt"), b"bee").unwrap();
        std::fs::write(dir.join("a.txt"), b"ay").unwrap();
        std::fs::write(dir.join("sub/c.log"), b"cee").unwrap();
        std::fs::write(dir.join("sub/inner/d.txt"), b"dee").unwrap();
    }

    fn entry_names(bytes: &[u8]) -> Vec<String> {
        let mut ar = tar::Archive::new(std::io::Cursor::new(bytes.to_vec()));
        ar.entries()
            .unwrap()
            .map(|e| {
                e.unwrap().path().unwrap().to_string_lossy().trim_end_matches('/').to_string()
            })
            .collect()
    }

    #[test]
    fn breadth_first_lexical_order() {
        let dir = tempfile::tempdir().unwrap();
        make_tree(dir.path());
        let mut buf = Vec::new();
        write_archive(dir.path(), &ArchiveOptions::default(), &mut buf).unwrap();
        let names = entry_names(&buf);
        assert_eq!(
            names,
            vec!["a.txt", "b.txt", "sub", "sub/c.log", "sub/inner", "sub/inner/d.txt"]
        );
    }

    #[test]
    fn byte_identical_between_runs() {
        let dir = tempfile::tempdir().unwrap();
        make_tree(dir.path());
        let opts =
            ArchiveOptions { compression: Compression::Gzip, ..ArchiveOptions::default() };
        let mut one = Vec::new();
        let mut two = Vec::new();
        write_archive(dir.path(), &opts, &mut one).unwrap();
        write_archive(dir.path(), &opts, &mut two).unwrap();
        assert_eq!(one, two);
    }

    #[test]
    fn exclude_wins_over_include() {
        let dir = tempfile::tempdir().unwrap();
        make_tree(dir.path());
        let opts = ArchiveOptions {
            include: vec!["*.txt".to_string()],
            exclude: vec!["sub/*".to_string()],
            ..ArchiveOptions::default()
        };
        let mut buf = Vec::new();
        let report = write_archive(dir.path(), &opts, &mut buf).unwrap();
        let names = entry_names(&buf);
        assert_eq!(names, vec!["a.txt", "b.txt"]);
        assert!(report.excluded >= 2);
    }

    #[test]
    fn include_only_matching() {
        let dir = tempfile::tempdir().unwrap();
        make_tree(dir.path());
        let opts =
            ArchiveOptions { include: vec!["*.log".to_string()], ..ArchiveOptions::default() };
        let mut buf = Vec::new();
        write_archive(dir.path(), &opts, &mut buf).unwrap();
        assert_eq!(entry_names(&buf), vec!["sub/c.log"]);
    }

    #[test]
    fn flatten_strips_prefixes() {
        let dir = tempfile::tempdir().unwrap();
        make_tree(dir.path());
        let opts = ArchiveOptions { flatten: true, ..ArchiveOptions::default() };
        let mut buf = Vec::new();
        write_archive(dir.path(), &opts, &mut buf).unwrap();
        assert_eq!(entry_names(&buf), vec!["a.txt", "b.txt", "c.log", "d.txt"]);
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_skipped_and_reported() {
        let dir = tempfile::tempdir().unwrap();
        make_tree(dir.path());
        std::os::unix::fs::symlink(dir.path().join("a.txt"), dir.path().join("link.txt"))
            .unwrap();
        let mut buf = Vec::new();
        let report = write_archive(dir.path(), &ArchiveOptions::default(), &mut buf).unwrap();
        assert_eq!(report.symlinks_skipped.len(), 1);
        assert!(!entry_names(&buf).iter().any(|n| n.contains("link")));
    }

    #[test]
    fn missing_root_is_validation_error() {
        let err = write_archive(
            Path::new("/no/such/dir"),
            &ArchiveOptions::default(),
            &mut Vec::new(),
        )
        .unwrap_err();
        assert_eq!(err.downcast_ref::<PilotError>().unwrap().kind(), "validation");
    }

    #[test]
    fn gzip_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        make_tree(dir.path());
        let opts =
            ArchiveOptions { compression: Compression::Gzip, ..ArchiveOptions::default() };
        let mut buf = Vec::new();
        write_archive(dir.path(), &opts, &mut buf).unwrap();
        let gz = flate2::read::GzDecoder::new(std::io::Cursor::new(buf));
        let mut ar = tar::Archive::new(gz);
        let n = ar.entries().unwrap().count();
        assert_eq!(n, 6);
    }

    #[test]
    fn archive_names() {
        assert_eq!(archive_file_name("job1", Compression::None), "job1.tar");
        assert_eq!(archive_file_name("job1", Compression::Gzip), "job1.tar.gz");
    }
}
