//! Downloads into directories the engine cannot write natively.
//!
//! Such downloads land in a staging directory first and carry
//! [`AppData::StagedDownload`]; the relocator moves each finished root
//! transfer to its final directory.

use std::io;
use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use skyhop_engine::{AppData, EventFeed, Transfer, TransferEvent, TransferKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StagingConfig {
    /// Where constrained downloads are written first. No staging when unset.
    pub staging_dir: Option<PathBuf>,
    /// Roots the engine can write to directly.
    pub native_roots: Vec<PathBuf>,
}

impl StagingConfig {
    /// Whether a download into `destination` must go through staging.
    pub fn is_constrained(&self, destination: &Path) -> bool {
        self.staging_dir.is_some()
            && !self
                .native_roots
                .iter()
                .any(|root| destination.starts_with(root))
    }

    /// Engine destination and extra app data for a download into
    /// `destination`.
    pub fn resolve(&self, destination: &Path) -> (PathBuf, Option<AppData>) {
        match &self.staging_dir {
            Some(staging) if self.is_constrained(destination) => (
                staging.clone(),
                Some(AppData::StagedDownload {
                    final_dir: destination.to_path_buf(),
                }),
            ),
            _ => (destination.to_path_buf(), None),
        }
    }
}

/// Moves finished staged downloads into their final directories.
pub struct StagingRelocator {
    feed: EventFeed,
}

impl StagingRelocator {
    pub fn new(feed: EventFeed) -> Self {
        Self { feed }
    }

    /// Watches the feed until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        let mut events = self.feed.subscribe_filtered(|event| {
            let TransferEvent::Finished { transfer, error } = event else {
                return false;
            };
            error.is_none()
                && transfer.is_root()
                && transfer.kind == TransferKind::Download
                && transfer.app_data.iter().any(|d| d.staged_final_dir().is_some())
        });

        tokio::spawn(async move {
            info!("staging relocator started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.next() => match event {
                        Some(event) => {
                            if let Err(e) = relocate(event.transfer()).await {
                                error!(
                                    path = %event.transfer().local_path.display(),
                                    "failed to move staged download: {e}"
                                );
                            }
                        }
                        None => break,
                    },
                }
            }
            info!("staging relocator stopped");
        })
    }
}

/// Moves one finished staged transfer; returns its final path.
pub async fn relocate(transfer: &Transfer) -> io::Result<PathBuf> {
    let final_dir = transfer
        .app_data
        .iter()
        .find_map(AppData::staged_final_dir)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "transfer is not staged"))?;
    let source = &transfer.local_path;
    let name = source
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "staged path has no name"))?;
    let target = final_dir.join(name);

    tokio::fs::create_dir_all(final_dir).await?;
    match tokio::fs::rename(source, &target).await {
        Ok(()) => {}
        Err(e) => {
            // Typically a cross-device move.
            debug!("rename failed ({e}), copying instead");
            copy_recursive(source, &target).await?;
            if tokio::fs::metadata(source).await?.is_dir() {
                tokio::fs::remove_dir_all(source).await?;
            } else {
                tokio::fs::remove_file(source).await?;
            }
        }
    }
    info!(from = %source.display(), to = %target.display(), "staged download moved");
    Ok(target)
}

async fn copy_recursive(source: &Path, target: &Path) -> io::Result<()> {
    if !tokio::fs::metadata(source).await?.is_dir() {
        tokio::fs::copy(source, target).await?;
        return Ok(());
    }

    let mut pending = vec![(source.to_path_buf(), target.to_path_buf())];
    while let Some((from, to)) = pending.pop() {
        tokio::fs::create_dir_all(&to).await?;
        let mut entries = tokio::fs::read_dir(&from).await?;
        while let Some(entry) = entries.next_entry().await? {
            let dest = to.join(entry.file_name());
            if entry.file_type().await?.is_dir() {
                pending.push((entry.path(), dest));
            } else {
                tokio::fs::copy(entry.path(), dest).await?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn staged(tag: i32, path: PathBuf, final_dir: &Path) -> Transfer {
        let mut t = Transfer::new(tag, TransferKind::Download, "x");
        t.local_path = path;
        t.app_data = vec![AppData::StagedDownload {
            final_dir: final_dir.to_path_buf(),
        }];
        t
    }

    #[test]
    fn constrained_destinations() {
        let config = StagingConfig {
            staging_dir: Some(PathBuf::from("/data/staging")),
            native_roots: vec![PathBuf::from("/data")],
        };
        assert!(!config.is_constrained(Path::new("/data/downloads")));
        assert!(config.is_constrained(Path::new("/sdcard/Download")));

        let (dest, extra) = config.resolve(Path::new("/sdcard/Download"));
        assert_eq!(dest, PathBuf::from("/data/staging"));
        assert_eq!(
            extra.as_ref().and_then(AppData::staged_final_dir),
            Some(&PathBuf::from("/sdcard/Download"))
        );
        assert_eq!(config.resolve(Path::new("/data/x")).1, None);
        assert!(!StagingConfig::default().is_constrained(Path::new("/anything")));
    }

    #[tokio::test]
    async fn relocates_file() {
        let tmp = tempfile::tempdir().unwrap();
        let staging = tmp.path().join("staging");
        let final_dir = tmp.path().join("final");
        std::fs::create_dir_all(&staging).unwrap();
        std::fs::write(staging.join("a.txt"), b"hello").unwrap();

        let moved = relocate(&staged(1, staging.join("a.txt"), &final_dir))
            .await
            .unwrap();
        assert_eq!(moved, final_dir.join("a.txt"));
        assert_eq!(std::fs::read(&moved).unwrap(), b"hello");
        assert!(!staging.join("a.txt").exists());
    }

    #[tokio::test]
    async fn copies_directory_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        std::fs::create_dir_all(src.join("nested")).unwrap();
        std::fs::write(src.join("one"), b"1").unwrap();
        std::fs::write(src.join("nested/two"), b"2").unwrap();

        let dst = tmp.path().join("dst");
        copy_recursive(&src, &dst).await.unwrap();
        assert_eq!(std::fs::read(dst.join("one")).unwrap(), b"1");
        assert_eq!(std::fs::read(dst.join("nested/two")).unwrap(), b"2");
    }

    #[tokio::test]
    async fn unstaged_transfer_is_rejected() {
        let t = Transfer::new(1, TransferKind::Download, "x");
        let err = relocate(&t).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn relocator_moves_finished_downloads_only() {
        let tmp = tempfile::tempdir().unwrap();
        let staging = tmp.path().join("staging");
        let final_dir = tmp.path().join("final");
        std::fs::create_dir_all(&staging).unwrap();
        std::fs::write(staging.join("ok"), b"ok").unwrap();
        std::fs::write(staging.join("failed"), b"no").unwrap();

        let feed = EventFeed::default();
        let cancel = CancellationToken::new();
        let handle = StagingRelocator::new(feed.clone()).spawn(cancel.clone());

        feed.publish(TransferEvent::Finished {
            transfer: staged(2, staging.join("failed"), &final_dir),
            error: Some(skyhop_engine::EngineError::Cancelled),
        });
        feed.publish(TransferEvent::Finished {
            transfer: staged(1, staging.join("ok"), &final_dir),
            error: None,
        });

        let target = final_dir.join("ok");
        for _ in 0..100 {
            if target.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(target.exists());
        assert!(staging.join("failed").exists());

        cancel.cancel();
        handle.await.unwrap();
    }
}
