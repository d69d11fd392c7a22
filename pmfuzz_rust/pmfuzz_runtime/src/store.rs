use std::fs::File;
use std::io::{BufReader, LineWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use bitvec::vec::BitVec;

use pmfuzz_common::failure_list::{parse_failure_list, write_failure_id, MAX_FAILURE_COUNT};

/// Which failure ids were selected for injection.
pub struct FailureDecisionList {
    selected: BitVec,
}

impl Default for FailureDecisionList {
    fn default() -> Self {
        Self::new()
    }
}

impl FailureDecisionList {
    pub fn new() -> Self {
        FailureDecisionList {
            selected: BitVec::repeat(false, MAX_FAILURE_COUNT),
        }
    }

    /// Mark `id` as selected. Returns false if `id` is beyond the capacity of the list.
    pub fn insert(&mut self, id: u32) -> bool {
        match self.selected.get_mut(id as usize) {
            Some(mut bit) => {
                *bit = true;
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: u32) -> bool {
        self.selected
            .get(id as usize)
            .map(|bit| *bit)
            .unwrap_or(false)
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.selected.iter_ones().map(|id| id as u32)
    }

    /// Read a failure list. Only the first `MAX_FAILURE_COUNT` entries are considered.
    pub fn load(file: impl std::io::BufRead) -> Result<Self> {
        let mut list = FailureDecisionList::new();
        for entry in parse_failure_list(file).take(MAX_FAILURE_COUNT) {
            let id = entry?;
            if !list.insert(id) {
                log::warn!(
                    "ignoring failure id {}, only ids below {} can be replayed",
                    id,
                    MAX_FAILURE_COUNT
                );
            }
        }
        Ok(list)
    }
}

/// Backing file of the failure ids selected in record mode, or read for replay.
pub enum FailureListStore {
    /// Selected ids are only written, record decisions never look them up.
    Record { writer: LineWriter<File> },
    Replay {
        /// Kept open until the store is closed.
        _file: File,
        selected: FailureDecisionList,
    },
}

impl FailureListStore {
    /// Create (or truncate) a failure list for recording.
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("could not create failure list {}", path.display()))?;
        Ok(FailureListStore::Record {
            writer: LineWriter::new(file),
        })
    }

    /// Open and read a failure list for replay.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("could not open failure list {}", path.display()))?;
        let selected = FailureDecisionList::load(BufReader::new(file.try_clone()?))
            .with_context(|| format!("failure list {} has an invalid format", path.display()))?;
        Ok(FailureListStore::Replay {
            _file: file,
            selected,
        })
    }

    /// The ids to replay. `None` when recording.
    pub fn selected(&self) -> Option<&FailureDecisionList> {
        match self {
            FailureListStore::Record { .. } => None,
            FailureListStore::Replay { selected, .. } => Some(selected),
        }
    }

    /// Record that failure id `id` was selected.
    pub fn append(&mut self, id: u32) -> Result<()> {
        match self {
            FailureListStore::Record { writer } => {
                write_failure_id(writer, id).context("could not write failure list")
            }
            FailureListStore::Replay { .. } => Ok(()),
        }
    }

    /// Flush and close the backing file.
    pub fn close(self) -> Result<()> {
        if let FailureListStore::Record { mut writer, .. } = self {
            writer.flush().context("could not flush failure list")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn test_decision_list_bounds() {
        let mut list = FailureDecisionList::new();
        assert!(list.insert(0));
        assert!(list.insert(9999));
        assert!(!list.insert(10000));
        assert!(list.contains(9999));
        assert!(!list.contains(10000));
        assert!(!list.contains(u32::MAX));
        assert_eq!(list.iter().collect::<Vec<_>>(), vec![0, 9999]);
    }

    #[test]
    fn test_load_indexes_by_value() -> Result<()> {
        let list = FailureDecisionList::load("5\n10\n12345\n".as_bytes())?;
        assert_eq!(list.iter().collect::<Vec<_>>(), vec![5, 10]);
        Ok(())
    }

    #[test]
    fn test_load_stops_at_capacity() -> Result<()> {
        let mut input = String::new();
        for _ in 0..MAX_FAILURE_COUNT {
            input.push_str("3\n");
        }
        input.push_str("not a number\n");
        let list = FailureDecisionList::load(input.as_bytes())?;
        assert_eq!(list.iter().collect::<Vec<_>>(), vec![3]);
        Ok(())
    }

    #[test]
    fn test_load_malformed() {
        assert!(FailureDecisionList::load("5\n-1\n".as_bytes()).is_err());
        assert!(FailureDecisionList::load("5\nabc\n".as_bytes()).is_err());
    }

    #[test]
    fn test_record_then_replay() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("failures.txt");
        std::fs::write(&path, "stale content\n")?;

        let mut store = FailureListStore::create(&path)?;
        store.append(5)?;
        store.append(10)?;
        assert!(store.selected().is_none());
        store.close()?;
        assert_eq!(std::fs::read_to_string(&path)?, "5\n10\n");

        let mut store = FailureListStore::load(&path)?;
        let selected = store.selected().unwrap();
        assert_eq!(selected.iter().collect::<Vec<_>>(), vec![5, 10]);
        assert!(!selected.contains(0));
        // replay never writes
        store.append(7)?;
        store.close()?;
        assert_eq!(std::fs::read_to_string(&path)?, "5\n10\n");
        Ok(())
    }

    #[test]
    fn test_load_missing_file() {
        assert!(FailureListStore::load(Path::new("/nonexistent/failures.txt")).is_err());
    }
}
