//! Local free-space lookup for download prechecks.

use std::io;
use std::path::Path;

use sysinfo::Disks;
use tracing::debug;

pub trait StorageProbe: Send + Sync {
    /// Bytes available on the volume holding `path`.
    fn available_bytes(&self, path: &Path) -> io::Result<u64>;
}

/// Reads free space from the mounted disk list.
#[derive(Debug, Default, Clone, Copy)]
pub struct SysinfoProbe;

impl StorageProbe for SysinfoProbe {
    fn available_bytes(&self, path: &Path) -> io::Result<u64> {
        let disks = Disks::new_with_refreshed_list();
        // Most specific mount point wins.
        let disk = disks
            .iter()
            .filter(|d| path.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len());

        match disk {
            Some(disk) => {
                debug!(
                    path = %path.display(),
                    mount = %disk.mount_point().display(),
                    available = disk.available_space(),
                    "free space lookup"
                );
                Ok(disk.available_space())
            }
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no mounted volume holds {}", path.display()),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmounted_relative_path_is_not_found() {
        let err = SysinfoProbe
            .available_bytes(Path::new("relative/path"))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
