use std::path::Path;

/// Free bytes on the filesystem holding `path`
#[cfg(unix)]
pub fn available_space(path: &Path) -> Option<u64> {
    use nix::sys::statvfs::statvfs;
    let stat = statvfs(path).ok()?;
    Some(stat.blocks_available() as u64 * stat.fragment_size() as u64)
}

#[cfg(not(unix))]
pub fn available_space(_path: &Path) -> Option<u64> {
    None
}

/// True when `path` has room for `required_bytes`, or when it can't be checked
pub fn has_enough_space(path: &Path, required_bytes: u64) -> bool {
    available_space(path)
        .map(|available| available > required_bytes)
        .unwrap_or(true)
}

/// Rough size of encoding `input` into `renditions` outputs: one input size each
pub fn estimate_rendition_bytes(input: &Path, renditions: usize) -> u64 {
    std::fs::metadata(input)
        .map(|m| m.len())
        .unwrap_or(0)
        .saturating_mul(renditions as u64)
}
