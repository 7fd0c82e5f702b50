use ferry_core::{FerryError, FreeSpace, SpaceProbe};
use nix::sys::statvfs::statvfs;
use std::path::Path;

/// Free space from `statvfs(3)`. Counts blocks available to unprivileged
/// users, matching what `df` reports as available.
pub struct StatvfsSpaceProbe;

impl SpaceProbe for StatvfsSpaceProbe {
    fn free_space(&self, path: &Path) -> Result<FreeSpace, FerryError> {
        let stat = statvfs(path).map_err(|errno| {
            log::warn!("statvfs {} failed: {}", path.display(), errno);
            FerryError::from(std::io::Error::from(errno))
        })?;
        let fragment = stat.fragment_size() as u64;
        Ok(FreeSpace {
            total_bytes: stat.blocks() as u64 * fragment,
            available_bytes: stat.blocks_available() as u64 * fragment,
        })
    }
}
