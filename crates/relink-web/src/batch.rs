//! Deploy-time correction of exported HTML.
//!
//! A page at `a/b/index.html` that references `./_next/...` points at
//! `a/b/_next/...`, which does not exist in a flat export. Each such
//! reference is rewritten to climb back to the export root. The depth comes
//! from the file's own location and the rewritten form no longer starts with
//! `./`, so running the corrector again changes nothing.

use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

const ATTRIBUTE_PREFIXES: [&str; 2] = ["href=\"./", "src=\"./"];
const ASSET_DIRS: [&str; 3] = ["_next/", "fonts/", "images/"];
const ASSET_EXTENSIONS: [&str; 2] = [".css", ".js"];

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("{} is not a directory", path.display())]
    NotADirectory { path: PathBuf },

    #[error("failed to read {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to write {}: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BatchOptions {
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub scanned: usize,
    pub files_changed: Vec<PathBuf>,
    pub references: usize,
    pub dry_run: bool,
}

pub fn correct_tree(root: &Path, options: &BatchOptions) -> Result<BatchReport, BatchError> {
    if !root.is_dir() {
        return Err(BatchError::NotADirectory {
            path: root.to_path_buf(),
        });
    }

    let files = html_files(root)?;

    let mut report = BatchReport {
        dry_run: options.dry_run,
        ..BatchReport::default()
    };

    for path in files {
        report.scanned += 1;
        let depth = depth_below(root, &path);
        if depth == 0 {
            continue;
        }

        let html = fs::read_to_string(&path).map_err(|source| BatchError::Read {
            path: path.clone(),
            source,
        })?;
        let Some((corrected, count)) = correct_html(&html, depth) else {
            continue;
        };

        debug!(path = %path.display(), depth, references = count, "corrected relative references");
        if !options.dry_run {
            fs::write(&path, corrected).map_err(|source| BatchError::Write {
                path: path.clone(),
                source,
            })?;
        }
        report.references += count;
        report.files_changed.push(path);
    }

    info!(
        root = %root.display(),
        scanned = report.scanned,
        changed = report.files_changed.len(),
        references = report.references,
        dry_run = options.dry_run,
        "batch correction finished"
    );
    Ok(report)
}

/// Rewrites eligible `./` references for a file `depth` levels below the
/// export root. `None` when nothing matched.
pub fn correct_html(html: &str, depth: usize) -> Option<(String, usize)> {
    if depth == 0 {
        return None;
    }
    let climb = "../".repeat(depth);
    let mut out = html.to_string();
    let mut count = 0usize;

    for prefix in ATTRIBUTE_PREFIXES {
        let mut rebuilt = String::with_capacity(out.len());
        let mut rest = out.as_str();
        while let Some(idx) = rest.find(prefix) {
            let at_boundary = rest[..idx]
                .chars()
                .next_back()
                .is_none_or(|c| c.is_ascii_whitespace());
            let value_start = idx + prefix.len();
            let target_end = rest[value_start..]
                .find('"')
                .map(|end| value_start + end)
                .unwrap_or(rest.len());
            let target = &rest[value_start..target_end];

            if at_boundary && is_asset_target(target) {
                let attr = &prefix[..prefix.len() - 2];
                rebuilt.push_str(&rest[..idx]);
                rebuilt.push_str(attr);
                rebuilt.push_str(&climb);
                count += 1;
            } else {
                rebuilt.push_str(&rest[..value_start]);
            }
            rest = &rest[value_start..];
        }
        rebuilt.push_str(rest);
        out = rebuilt;
    }

    (count > 0).then_some((out, count))
}

fn is_asset_target(target: &str) -> bool {
    let bare = target
        .split(|c: char| c == '?' || c == '#')
        .next()
        .unwrap_or_default();
    ASSET_DIRS.iter().any(|dir| bare.starts_with(dir))
        || ASSET_EXTENSIONS.iter().any(|ext| bare.ends_with(ext))
}

/// Directories between `root` and `file`.
fn depth_below(root: &Path, file: &Path) -> usize {
    file.strip_prefix(root)
        .map(|rel| rel.components().count().saturating_sub(1))
        .unwrap_or(0)
}

/// Every HTML file below `root`, sorted, skipping `.git` and `node_modules`.
pub fn html_files(root: &Path) -> Result<Vec<PathBuf>, BatchError> {
    let mut files = Vec::new();
    collect_html_files(root, &mut files)?;
    files.sort();
    Ok(files)
}

pub fn is_skipped_dir(name: &str) -> bool {
    matches!(name, ".git" | "node_modules")
}

pub fn is_html_file(path: &Path) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("html") || ext.eq_ignore_ascii_case("htm"))
}

fn collect_html_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), BatchError> {
    let read_dir = fs::read_dir(dir).map_err(|source| BatchError::Read {
        path: dir.to_path_buf(),
        source,
    })?;

    for entry in read_dir.flatten() {
        let path = entry.path();
        if path.is_dir() {
            let name = path
                .file_name()
                .and_then(|s| s.to_str())
                .unwrap_or_default();
            if is_skipped_dir(name) {
                continue;
            }
            collect_html_files(&path, out)?;
            continue;
        }

        if is_html_file(&path) {
            out.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const PAGE: &str = r#"<link rel="stylesheet" href="./_next/static/css/app.css"><script src="./_next/static/chunks/main.js"></script><img src="./images/me.png"><a href="./about">About</a><a data-href="./x.js">x</a>"#;

    #[test]
    fn rewrites_eligible_references_by_depth() {
        let (out, count) = correct_html(PAGE, 2).expect("changed");
        assert_eq!(count, 3);
        assert_eq!(
            out,
            r#"<link rel="stylesheet" href="../../_next/static/css/app.css"><script src="../../_next/static/chunks/main.js"></script><img src="../../images/me.png"><a href="./about">About</a><a data-href="./x.js">x</a>"#
        );
    }

    #[test]
    fn second_pass_is_a_no_op() {
        let (once, _) = correct_html(PAGE, 1).expect("changed");
        assert_eq!(correct_html(&once, 1), None);
    }

    #[test]
    fn extension_and_directory_eligibility() {
        assert!(is_asset_target("theme.css"));
        assert!(is_asset_target("vendor/lib.js?v=2"));
        assert!(is_asset_target("fonts/a.woff2"));
        assert!(!is_asset_target("about"));
        assert!(!is_asset_target("docs/readme.md"));
    }

    #[test]
    fn corrects_tree_and_skips_root_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        std::fs::write(root.join("index.html"), PAGE).expect("write root");
        std::fs::create_dir_all(root.join("projects/alpha")).expect("mkdir");
        std::fs::write(root.join("projects/index.html"), PAGE).expect("write");
        std::fs::write(root.join("projects/alpha/index.html"), PAGE).expect("write");
        std::fs::write(root.join("projects/notes.txt"), PAGE).expect("write");

        let report = correct_tree(root, &BatchOptions::default()).expect("batch");
        assert_eq!(report.scanned, 3);
        assert_eq!(report.files_changed.len(), 2);
        assert_eq!(report.references, 6);

        assert_eq!(std::fs::read_to_string(root.join("index.html")).expect("read"), PAGE);
        let nested = std::fs::read_to_string(root.join("projects/alpha/index.html")).expect("read");
        assert!(nested.contains(r#"href="../../_next/static/css/app.css""#));
        let one = std::fs::read_to_string(root.join("projects/index.html")).expect("read");
        assert!(one.contains(r#"src="../images/me.png""#));

        let again = correct_tree(root, &BatchOptions::default()).expect("batch");
        assert!(again.files_changed.is_empty());
    }

    #[test]
    fn html_files_skip_vendored_dirs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        std::fs::create_dir_all(root.join("node_modules/pkg")).expect("mkdir");
        std::fs::create_dir_all(root.join("blog")).expect("mkdir");
        std::fs::write(root.join("node_modules/pkg/index.html"), PAGE).expect("write");
        std::fs::write(root.join("blog/index.HTML"), PAGE).expect("write");
        std::fs::write(root.join("blog/post.md"), PAGE).expect("write");

        let files = html_files(root).expect("walk");
        assert_eq!(files, vec![root.join("blog/index.HTML")]);
    }

    #[test]
    fn dry_run_leaves_files_untouched() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("blog")).expect("mkdir");
        let file = dir.path().join("blog/index.html");
        std::fs::write(&file, PAGE).expect("write");

        let report = correct_tree(dir.path(), &BatchOptions { dry_run: true }).expect("batch");
        assert!(report.dry_run);
        assert_eq!(report.files_changed, vec![file.clone()]);
        assert_eq!(std::fs::read_to_string(&file).expect("read"), PAGE);
    }

    #[test]
    fn root_must_be_a_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("index.html");
        std::fs::write(&file, "").expect("write");
        assert!(matches!(
            correct_tree(&file, &BatchOptions::default()),
            Err(BatchError::NotADirectory { .. })
        ));
    }
}
