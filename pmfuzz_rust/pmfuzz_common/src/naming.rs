//! Naming scheme for crash images.
//!
//! A crash image for the pool `<base>.pm_pool` taken at failure id 5 with suffix `tc` is called
//! `<base>.tc.id=000005.crash_site`. Crash images can be used as pools themselves, so a previous
//! `.crash_site` suffix is stripped as well.

use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};

/// Suffix of PM pool files.
pub const POOL_SUFFIX: &str = ".pm_pool";
/// Suffix of generated crash images.
pub const CRASH_SITE_SUFFIX: &str = ".crash_site";

const ID_MARKER: &str = ".id=";

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Strip the pool and crash site suffixes from a pool path. Everything from the first occurrence
/// of either suffix onwards is removed.
pub fn pool_base_name(pool: &Path) -> OsString {
    let bytes = pool.as_os_str().as_bytes();
    let cut = [POOL_SUFFIX, CRASH_SITE_SUFFIX]
        .iter()
        .filter_map(|suffix| find(bytes, suffix.as_bytes()))
        .min()
        .unwrap_or(bytes.len());
    OsString::from_vec(bytes[..cut].to_vec())
}

/// Returns the path of the crash image for `pool` at failure id `id`.
pub fn crash_image_path(pool: &Path, suffix: &str, id: u32) -> PathBuf {
    let mut name = pool_base_name(pool);
    name.push(format!(".{}{}{:06}{}", suffix, ID_MARKER, id, CRASH_SITE_SUFFIX));
    PathBuf::from(name)
}

/// The parts of a crash image file name.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct CrashImageName {
    pub suffix: String,
    pub id: u32,
}

/// Parse a crash image file name (without directory) of the pool with base name `base`. Returns
/// `None` for files that are not crash images of that pool.
///
/// Suffixes may contain dots, so the suffix is everything between `<base>.` and the last `.id=`.
pub fn parse_crash_image_name(base: &OsStr, name: &OsStr) -> Option<CrashImageName> {
    let stem = name
        .as_bytes()
        .strip_prefix(base.as_bytes())?
        .strip_prefix(b".")?
        .strip_suffix(CRASH_SITE_SUFFIX.as_bytes())?;
    let marker = stem
        .windows(ID_MARKER.len())
        .rposition(|w| w == ID_MARKER.as_bytes())?;
    let id = std::str::from_utf8(&stem[marker + ID_MARKER.len()..])
        .ok()?
        .parse::<u32>()
        .ok()?;
    let suffix = std::str::from_utf8(&stem[..marker]).ok()?.to_string();
    Some(CrashImageName { suffix, id })
}
