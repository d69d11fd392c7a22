//! Failure injection: decide at each failure point whether to take a crash image.
//!
//! Every call to [`FailureInjector::maybe_inject`] gets the next failure id, starting at 0. In
//! record mode, a failure point is selected with a probability that decreases with the failure
//! id, and only if the access map changed since the last injection. Selected ids are written to
//! the failure list, so that replay mode can reproduce exactly the same crash images.

use std::path::PathBuf;

use anyhow::{Context, Result};
use log::{debug, warn};

use crate::config::{Config, Mode};
use crate::image::{Capture, CrashImageWriter, PoolDescriptor};
use crate::map::AccessMap;
use crate::store::FailureListStore;

/// Selection probabilities are expressed in units of 1/SELECTION_SCALE.
pub const SELECTION_SCALE: u32 = 10000;
/// With `generate_all_crash_sites`, only ids below this bound are selected.
pub const GEN_ALL_LIMIT: u32 = 100;
/// With `generate_all_crash_sites`, every n-th id is selected.
pub const GEN_ALL_STRIDE: u32 = 5;

/// Overrides of the random selection in record mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SelectionPolicy {
    pub generate_all_crash_sites: bool,
    pub inject_all: bool,
}

impl SelectionPolicy {
    pub fn from_config(config: &Config) -> Self {
        SelectionPolicy {
            generate_all_crash_sites: config.generate_all_crash_sites,
            inject_all: config.inject_all,
        }
    }

    /// Should the crash image for failure id `id` be saved (provided the access map changed)?
    /// Always draws one random number, so the random sequence does not depend on the policy.
    pub fn should_save(&self, id: u32, rng: &mut fastrand::Rng) -> bool {
        let prob = rng.u32(0..SELECTION_SCALE);
        let divisor = id.max(1);
        let mut save = prob < SELECTION_SCALE / divisor;
        if self.generate_all_crash_sites {
            save = id < GEN_ALL_LIMIT && id % GEN_ALL_STRIDE == 0;
        }
        if self.inject_all {
            save = true;
        }
        // the first failure point is never selected, regardless of overrides
        save && id != 0
    }
}

/// A crash image that was taken at a failure point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Injection {
    pub id: u32,
    pub image: PathBuf,
}

pub struct FailureInjector {
    mode: Mode,
    /// Log every decision.
    debug: bool,
    policy: SelectionPolicy,
    /// Failure id of the most recent failure point.
    failure_id: Option<u32>,
    /// Access map content at the last injection.
    last_map: Vec<u8>,
    rng: fastrand::Rng,
    writer: CrashImageWriter,
    store: Option<FailureListStore>,
}

impl FailureInjector {
    /// Set up failure injection for `pool`. Opens the failure list for recording or reads it for
    /// replay.
    pub fn new(config: &Config, pool: PoolDescriptor, map_len: usize) -> Result<Self> {
        let store = match (config.mode, &config.failure_list) {
            (Mode::Record, Some(path)) => Some(FailureListStore::create(path)?),
            (Mode::Replay, Some(path)) => Some(FailureListStore::load(path)?),
            (Mode::Replay, None) => {
                // rejected by Config::validate() already
                anyhow::bail!("replay mode requires a failure list");
            }
            _ => None,
        };
        let capture = if config.raw_dump {
            Capture::RawDump
        } else {
            Capture::FileCopy
        };
        Ok(FailureInjector {
            mode: config.mode,
            debug: config.debug,
            policy: SelectionPolicy::from_config(config),
            failure_id: None,
            last_map: vec![0; map_len],
            rng: fastrand::Rng::with_seed(config.seed),
            writer: CrashImageWriter::new(pool, config.image_suffix.clone(), capture),
            store,
        })
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn failure_id(&self) -> Option<u32> {
        self.failure_id
    }

    pub fn writer(&self) -> &CrashImageWriter {
        &self.writer
    }

    fn next_failure_id(&mut self) -> u32 {
        let id = self.failure_id.map_or(0, |id| id.saturating_add(1));
        self.failure_id = Some(id);
        id
    }

    /// A failure point was reached at `file:line`. Takes a crash image if this failure point is
    /// selected.
    pub fn maybe_inject(&mut self, map: &AccessMap, file: &str, line: u32) -> Option<Injection> {
        let id = self.next_failure_id();
        if self.debug {
            debug!("failure id {} at {}:{}", id, file, line);
        }

        let inject = match self.mode {
            Mode::Disabled => return None,
            Mode::Replay => {
                let selected = self
                    .store
                    .as_ref()
                    .and_then(FailureListStore::selected)
                    .map_or(false, |selected| selected.contains(id));
                if !selected && self.debug {
                    debug!("failure id {} not in failure list", id);
                }
                selected
            }
            Mode::Record => {
                let changed = map.differs_from(&self.last_map);
                let save = self.policy.should_save(id, &mut self.rng);
                if changed && save {
                    map.copy_into(&mut self.last_map);
                    true
                } else {
                    if self.debug && !save {
                        debug!("failure id {} not selected", id);
                    } else if self.debug {
                        debug!("failure id {}: access map unchanged", id);
                    }
                    false
                }
            }
        };
        if !inject {
            return None;
        }

        let image = match self.writer.write(id) {
            Ok(image) => image,
            Err(err) => {
                warn!("dropping crash image for failure id {}: {:#}", id, err);
                return None;
            }
        };
        if self.debug {
            debug!("saved crash image {}", image.display());
        }

        if self.mode == Mode::Record {
            if let Some(store) = self.store.as_mut() {
                if let Err(err) = store.append(id) {
                    warn!("{:#}", err);
                }
            }
        }
        Some(Injection { id, image })
    }

    /// Close the failure list.
    pub fn close(self) -> Result<()> {
        if let Some(store) = self.store {
            store.close().context("could not close failure list")?;
        }
        Ok(())
    }
}
