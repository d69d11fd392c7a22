use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use log::debug;

pub mod bitfield;
pub mod config;
pub mod ffi;

mod failure;
pub use failure::{FailureInjector, Injection, SelectionPolicy};

mod image;
pub use image::{Capture, CrashImageWriter, PoolDescriptor};

mod map;
pub use map::AccessMap;

mod recorder;
pub use recorder::{AccessRecorder, Encoding, LocationHasher};

mod store;
pub use store::{FailureDecisionList, FailureListStore};

pub use config::{Config, Mode};

enum State {
    /// Waiting for the pool to be known.
    Uninitialized,
    Active(FailureInjector),
    Terminated,
}

/// The runtime context: records PM accesses and injects failures.
///
/// Record calls may happen concurrently from any thread. Failure points are serialized.
pub struct Engine {
    config: Config,
    recorder: AccessRecorder,
    state: Mutex<State>,
}

impl Engine {
    /// Create an engine recording into `map`. The configuration is fixed for the lifetime of the
    /// engine.
    pub fn new(map: AccessMap, config: Config) -> Result<Self> {
        config.validate()?;
        let encoding = if config.path_mode {
            Encoding::Path
        } else {
            Encoding::Baseline
        };
        let recorder = AccessRecorder::new(map, encoding, config.reserved_slots)?;
        Ok(Engine {
            config,
            recorder,
            state: Mutex::new(State::Uninitialized),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn recorder(&self) -> &AccessRecorder {
        &self.recorder
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_read(&self, id: u32) {
        self.recorder.record_read(id);
    }

    pub fn record_write(&self, id: u32) {
        self.recorder.record_write(id);
    }

    pub fn record_read_write(&self, id: u32) {
        self.recorder.record_read_write(id);
    }

    /// Set the pool under test and enable failure injection. Only the first call has an effect.
    pub fn init(&self, pool: PoolDescriptor) -> Result<()> {
        let mut state = self.state();
        if !matches!(*state, State::Uninitialized) {
            return Ok(());
        }
        if self.config.debug {
            debug!(
                "initializing failure injection for {} ({} bytes at 0x{:x}), mode {:?}",
                pool.path().display(),
                pool.size(),
                pool.address(),
                self.config.mode
            );
        }
        let injector = FailureInjector::new(&self.config, pool, self.recorder.map().len())?;
        *state = State::Active(injector);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        matches!(*self.state(), State::Active(_))
    }

    /// A failure point was reached at `file:line`. Returns the crash image, if one was taken.
    pub fn maybe_inject_failure(&self, file: &str, line: u32) -> Option<Injection> {
        match &mut *self.state() {
            State::Active(injector) => injector.maybe_inject(self.recorder.map(), file, line),
            _ => {
                if self.config.debug {
                    debug!("no failure injection at {}:{}, not initialized", file, line);
                }
                None
            }
        }
    }

    /// Failure id of the most recent failure point.
    pub fn failure_id(&self) -> Option<u32> {
        match &*self.state() {
            State::Active(injector) => injector.failure_id(),
            _ => None,
        }
    }

    /// Stop failure injection and close the failure list.
    pub fn term(&self) -> Result<()> {
        let state = std::mem::replace(&mut *self.state(), State::Terminated);
        match state {
            State::Active(injector) => injector.close(),
            _ => Ok(()),
        }
    }
}
