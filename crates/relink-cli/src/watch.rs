//! Watch mode for `serve`: keeps nested HTML in the export corrected while
//! the build tool rewrites it.

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use relink_web::{BatchOptions, correct_tree, html_files, is_html_file, is_skipped_dir};
use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Component, Path, PathBuf};
use tokio::sync::mpsc;
use tokio::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(1500);
/// Events closer together than this are one burst.
const QUIET_WINDOW: Duration = Duration::from_millis(120);

type Subscription = (RecommendedWatcher, mpsc::UnboundedReceiver<()>);

enum Wake {
    Poll,
    Changed,
    Closed,
}

pub(crate) struct ExportWatcher {
    root: PathBuf,
    fingerprint: u64,
    subscription: Option<Subscription>,
}

impl ExportWatcher {
    pub(crate) fn new(root: PathBuf) -> Self {
        let subscription = match subscribe(&root) {
            Ok(sub) => Some(sub),
            Err(err) => {
                tracing::warn!(error = %err, "filesystem events unavailable; polling the export");
                None
            }
        };
        Self {
            fingerprint: html_fingerprint(&root),
            root,
            subscription,
        }
    }

    pub(crate) async fn run(mut self) {
        let mut poll = tokio::time::interval(POLL_INTERVAL);
        loop {
            let wake = match self.subscription.as_mut() {
                Some((_, rx)) => tokio::select! {
                    _ = poll.tick() => Wake::Poll,
                    event = rx.recv() => match event {
                        Some(()) => Wake::Changed,
                        None => Wake::Closed,
                    },
                },
                None => {
                    poll.tick().await;
                    Wake::Poll
                }
            };

            match wake {
                Wake::Closed => {
                    tracing::warn!("filesystem event stream closed; polling only");
                    self.subscription = None;
                    continue;
                }
                Wake::Changed => self.wait_for_quiet().await,
                Wake::Poll => {}
            }
            self.correct_if_changed().await;
        }
    }

    async fn wait_for_quiet(&mut self) {
        let Some((_, rx)) = self.subscription.as_mut() else {
            return;
        };
        while let Ok(Some(())) = tokio::time::timeout(QUIET_WINDOW, rx.recv()).await {}
    }

    async fn correct_if_changed(&mut self) {
        let root = self.root.clone();
        let previous = self.fingerprint;
        let outcome = tokio::task::spawn_blocking(move || {
            if html_fingerprint(&root) == previous {
                return None;
            }
            let report = correct_tree(&root, &BatchOptions::default());
            Some((report, html_fingerprint(&root)))
        })
        .await;

        match outcome {
            Ok(None) => {}
            Ok(Some((report, fingerprint))) => {
                self.fingerprint = fingerprint;
                match report {
                    Ok(report) if !report.files_changed.is_empty() => tracing::info!(
                        files = report.files_changed.len(),
                        references = report.references,
                        "export changed; corrected nested HTML"
                    ),
                    Ok(_) => tracing::debug!("export changed; nothing to correct"),
                    Err(err) => tracing::warn!(error = %err, "batch correction failed"),
                }
            }
            Err(err) => tracing::warn!(error = %err, "batch correction task failed"),
        }
    }
}

fn subscribe(root: &Path) -> Result<Subscription, notify::Error> {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        // An error event may hide a change, so it still wakes the loop.
        let wake = res.map_or(true, |event| touches_html(&event));
        if wake {
            let _ = tx.send(());
        }
    })?;
    watcher.watch(root, RecursiveMode::Recursive)?;
    Ok((watcher, rx))
}

fn touches_html(event: &Event) -> bool {
    event
        .paths
        .iter()
        .any(|path| !under_skipped_dir(path) && (path.is_dir() || is_html_file(path)))
}

fn under_skipped_dir(path: &Path) -> bool {
    path.components().any(|c| match c {
        Component::Normal(seg) => seg.to_str().is_some_and(is_skipped_dir),
        _ => false,
    })
}

/// Changes whenever an HTML file below `root` is added, removed or edited.
pub(crate) fn html_fingerprint(root: &Path) -> u64 {
    let mut hasher = DefaultHasher::new();
    for path in html_files(root).unwrap_or_default() {
        path.strip_prefix(root).unwrap_or(&path).hash(&mut hasher);
        fs::read(&path).unwrap_or_default().hash(&mut hasher);
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_tracks_html_content_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        fs::create_dir_all(root.join("blog")).expect("mkdir");
        fs::write(root.join("blog/index.html"), "<a href=\"./a.css\">").expect("write");
        let before = html_fingerprint(root);

        fs::write(root.join("notes.txt"), "ignored").expect("write");
        assert_eq!(before, html_fingerprint(root));

        fs::write(root.join("blog/index.html"), "<a href=\"./b.css\">").expect("write");
        assert_ne!(before, html_fingerprint(root));
    }

    #[test]
    fn vendored_dirs_do_not_count() {
        assert!(under_skipped_dir(Path::new("/site/node_modules/x.html")));
        assert!(under_skipped_dir(Path::new("/site/.git/HEAD")));
        assert!(!under_skipped_dir(Path::new("/site/blog/index.html")));
    }

    #[tokio::test]
    async fn changed_export_is_corrected_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().to_path_buf();
        fs::create_dir_all(root.join("about")).expect("mkdir");
        let page = root.join("about/index.html");
        fs::write(&page, "<p>draft</p>").expect("write");

        let mut watcher = ExportWatcher {
            fingerprint: html_fingerprint(&root),
            root: root.clone(),
            subscription: None,
        };
        fs::write(&page, r#"<link href="./_next/static/app.css">"#).expect("write");
        watcher.correct_if_changed().await;

        assert_eq!(
            fs::read_to_string(&page).expect("read"),
            r#"<link href="../_next/static/app.css">"#
        );
        assert_eq!(watcher.fingerprint, html_fingerprint(&root));
    }
}
