use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use itertools::Itertools;

use pmfuzz_common::failure_list::parse_failure_list;
use pmfuzz_common::naming::{crash_image_path, parse_crash_image_name, pool_base_name};
use pmfuzz_runtime::bitfield::{BitFieldArena, ELEMENT_WIDTH};
use pmfuzz_runtime::config::DEFAULT_RESERVED_SLOTS;
use pmfuzz_runtime::AccessMap;

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the failure ids of a failure list.
    ReadFailureList {
        /// failure list to process (from a record run)
        #[clap(parse(from_os_str))]
        list: PathBuf,

        /// pool the list was recorded for, to show the crash image of each failure id
        #[clap(long, parse(from_os_str))]
        pool: Option<PathBuf>,

        /// crash image suffix of the record run
        #[clap(long, default_value = "")]
        suffix: String,
    },
    /// Print all non-zero counters of a saved access map.
    ReadMap {
        /// access map file
        #[clap(parse(from_os_str))]
        map: PathBuf,

        /// the map uses one byte counter per slot instead of bit fields
        #[clap(long)]
        path_mode: bool,

        /// number of slots at the end of each half that the runtime does not use for writes
        #[clap(long, default_value_t = DEFAULT_RESERVED_SLOTS)]
        reserved_slots: u32,
    },
    /// List the crash images of a pool and find duplicates.
    CrashImages {
        /// pool file the crash images were taken of
        #[clap(parse(from_os_str))]
        pool: PathBuf,
    },
}

fn read_failure_list(list: &Path, pool: Option<&Path>, suffix: &str) -> Result<()> {
    let file = BufReader::new(File::open(list).context("could not open failure list")?);
    for id in parse_failure_list(file) {
        let id = id?;
        match pool {
            Some(pool) => {
                let image = crash_image_path(pool, suffix, id);
                println!(
                    "{}\t{}{}",
                    id,
                    image.display(),
                    if image.exists() { "" } else { " (missing)" }
                );
            }
            None => println!("{}", id),
        }
    }
    Ok(())
}

/// Which part of the map a byte offset belongs to.
fn half_name(offset: usize, len: usize) -> &'static str {
    if offset < len / 2 {
        "read"
    } else {
        "write"
    }
}

/// Non-zero counters of `map` as (slot, byte offset, count).
fn map_counters(map: &AccessMap, path_mode: bool) -> Vec<(usize, usize, usize)> {
    if path_mode {
        map.snapshot()
            .into_iter()
            .enumerate()
            .filter(|(_, count)| *count != 0)
            .map(|(slot, count)| (slot, slot, count as usize))
            .collect()
    } else {
        let arena = BitFieldArena::new(map, ELEMENT_WIDTH);
        (0..arena.len())
            .filter_map(|slot| {
                let count = arena.field(slot, false)?.read();
                (count != 0).then(|| (slot, slot * ELEMENT_WIDTH, count))
            })
            .collect()
    }
}

fn read_map(path: &Path, path_mode: bool, reserved_slots: u32) -> Result<()> {
    let bytes = std::fs::read(path).context("could not read access map")?;
    let map = AccessMap::from_bytes(&bytes);
    let reserved = reserved_slots as usize;
    let counters = if path_mode {
        "byte counters".to_string()
    } else {
        let elements = (map.len() / ELEMENT_WIDTH).saturating_sub(reserved);
        format!("{} bit fields", elements)
    };
    println!(
        "{} bytes, {} write locations, {}",
        map.len(),
        (map.len() / 2).saturating_sub(reserved),
        counters
    );
    for (slot, offset, count) in map_counters(&map, path_mode) {
        println!("{}\t{}\t{}", slot, half_name(offset, map.len()), count);
    }
    Ok(())
}

struct CrashImage {
    id: u32,
    suffix: String,
    path: PathBuf,
    hash: blake3::Hash,
}

fn hash_file(path: &Path) -> Result<blake3::Hash> {
    let file = File::open(path)?;
    if file.metadata()?.len() == 0 {
        return Ok(blake3::hash(&[]));
    }
    let mmap = unsafe { memmap2::Mmap::map(&file)? };
    Ok(blake3::hash(&mmap))
}

/// Crash images of `pool` in its directory, sorted by failure id.
fn find_crash_images(pool: &Path) -> Result<Vec<CrashImage>> {
    let dir = match pool.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let file_name = pool.file_name().context("pool path has no file name")?;
    let base = pool_base_name(Path::new(file_name));
    let mut images = Vec::new();
    for entry in std::fs::read_dir(&dir).context("could not read pool directory")? {
        let entry = entry?;
        let name = match parse_crash_image_name(&base, &entry.file_name()) {
            Some(name) => name,
            None => continue,
        };
        let path = entry.path();
        let hash =
            hash_file(&path).with_context(|| format!("could not read {}", path.display()))?;
        images.push(CrashImage {
            id: name.id,
            suffix: name.suffix,
            path,
            hash,
        });
    }
    images.sort_by(|a, b| (a.id, &a.suffix).cmp(&(b.id, &b.suffix)));
    Ok(images)
}

fn crash_images(pool: &Path) -> Result<()> {
    let images = find_crash_images(pool)?;
    for image in &images {
        println!("{}\t{}\t{}", image.id, image.hash.to_hex(), image.path.display());
    }
    let duplicates: Vec<Vec<&CrashImage>> = images
        .iter()
        .into_group_map_by(|image| image.hash)
        .into_values()
        .filter(|group| group.len() > 1)
        .sorted_by_key(|group| group[0].id)
        .collect();
    println!(
        "{} crash images, {} unique",
        images.len(),
        images.iter().map(|image| image.hash).unique().count()
    );
    for group in duplicates {
        println!("duplicates: {}", group.iter().map(|image| image.id).join(", "));
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::ReadFailureList { list, pool, suffix } => {
            read_failure_list(&list, pool.as_deref(), &suffix)
        }
        Commands::ReadMap {
            map,
            path_mode,
            reserved_slots,
        } => read_map(&map, path_mode, reserved_slots),
        Commands::CrashImages { pool } => crash_images(&pool),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pmfuzz_runtime::{AccessRecorder, Encoding};

    #[test]
    fn test_map_counters() -> Result<()> {
        let recorder = AccessRecorder::new(AccessMap::new(1 << 16), Encoding::Baseline, 97)?;
        recorder.record_read(0);
        recorder.record_read(0);
        recorder.record_read(0);
        let saved = recorder.map().snapshot();

        let map = AccessMap::from_bytes(&saved);
        assert_eq!(map_counters(&map, false), vec![(0, 0, 3)]);
        // the same bytes read as byte counters
        assert_eq!(map_counters(&map, true), vec![(0, 0, 0b100)]);
        Ok(())
    }

    #[test]
    fn test_half_name() {
        assert_eq!(half_name(0, 100), "read");
        assert_eq!(half_name(49, 100), "read");
        assert_eq!(half_name(50, 100), "write");
    }

    #[test]
    fn test_find_crash_images() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let pool = dir.path().join("db.pm_pool");
        std::fs::write(&pool, b"pool")?;
        std::fs::write(crash_image_path(&pool, "tc", 10), b"a")?;
        std::fs::write(crash_image_path(&pool, "tc", 5), b"b")?;
        std::fs::write(crash_image_path(&pool, "tc", 7), b"a")?;
        std::fs::write(crash_image_path(&pool, "tc", 8), b"")?;
        // suffixes derived from test case names contain dots
        std::fs::write(crash_image_path(&pool, "id=010.id=016,id=012", 12), b"b")?;
        // images of another pool
        std::fs::write(dir.path().join("other.tc.id=000001.crash_site"), b"a")?;

        let images = find_crash_images(&pool)?;
        assert_eq!(images.iter().map(|i| i.id).collect::<Vec<_>>(), vec![5, 7, 8, 10, 12]);
        assert_eq!(images[4].suffix, "id=010.id=016,id=012");
        assert_eq!(images[0].hash, images[4].hash);
        assert_eq!(images[1].hash, images[3].hash);
        assert_ne!(images[0].hash, images[1].hash);
        assert_eq!(images[2].hash, blake3::hash(b""));
        Ok(())
    }
}
