//! C interface for instrumented programs and the fuzzing harness.
//!
//! The harness attaches its access map with [`pmfuzz_attach_map`], which creates the process-wide
//! engine from the environment. Instrumented code then calls the record functions at PM accesses
//! and [`pmfuzz_inject_failure`] at failure points. All calls before the map is attached are
//! ignored.
//!
//! Invalid configuration terminates the process with exit code 1, an unusable failure list aborts
//! it.

use std::borrow::Cow;
use std::ffi::{CStr, OsStr};
use std::os::raw::{c_char, c_int, c_ulong, c_void};
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use std::sync::{PoisonError, RwLock};

use log::{debug, error, warn, LevelFilter};

use crate::{AccessMap, Config, Engine, PoolDescriptor};

/// State to keep between attach and detach
static ENGINE: RwLock<Option<Engine>> = RwLock::new(None);

static VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "\0");

fn init_logging(debug: bool) {
    // keep a logger the host installed already
    let _ = env_logger::Builder::new()
        .filter_level(if debug {
            LevelFilter::Debug
        } else {
            LevelFilter::Warn
        })
        .target(env_logger::Target::Stderr)
        .try_init();
}

fn with_engine<F: FnOnce(&Engine)>(f: F) {
    let engine = ENGINE.read().unwrap_or_else(PoisonError::into_inner);
    if let Some(engine) = engine.as_ref() {
        f(engine);
    }
}

/// Create the engine for the access map at `map` with `size` bytes.
///
/// # Safety
///
/// `map` must be valid for reads and writes of `size` bytes until [`pmfuzz_detach_map`] is
/// called.
#[no_mangle]
pub unsafe extern "C" fn pmfuzz_attach_map(map: *mut u8, size: usize) {
    let config = Config::from_env();
    init_logging(config.as_ref().map_or(false, |config| config.debug));
    let map = AccessMap::from_raw_parts(map, size);
    let engine = config.and_then(|config| Engine::new(map?, config));
    match engine {
        Ok(engine) => {
            let mut slot = ENGINE.write().unwrap_or_else(PoisonError::into_inner);
            if slot.is_some() {
                warn!("access map attached twice, keeping the first one");
                return;
            }
            *slot = Some(engine);
        }
        Err(err) => {
            error!("{:#}", err);
            std::process::exit(1);
        }
    }
}

/// Destroy the engine. The access map is no longer referenced afterwards.
#[no_mangle]
pub extern "C" fn pmfuzz_detach_map() {
    let engine = ENGINE
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    if let Some(engine) = engine {
        if let Err(err) = engine.term() {
            warn!("{:#}", err);
        }
    }
}

/// Record a read-only PM access of the call site `id`.
#[no_mangle]
pub extern "C" fn pmfuzz_ro(id: u32) {
    with_engine(|engine| engine.record_read(id));
}

/// Record a write-only PM access of the call site `id`.
#[no_mangle]
pub extern "C" fn pmfuzz_wo(id: u32) {
    with_engine(|engine| engine.record_write(id));
}

/// Record a read-write PM access of the call site `id`.
#[no_mangle]
pub extern "C" fn pmfuzz_rw(id: u32) {
    with_engine(|engine| engine.record_read_write(id));
}

/// Set the PM pool under test. Only the first call after [`pmfuzz_attach_map`] has an effect.
///
/// # Safety
///
/// `path` must be a valid C string. In raw dump mode, `addr` must be valid for reads of `size`
/// bytes for as long as failures are injected.
#[no_mangle]
pub unsafe extern "C" fn pmfuzz_init(addr: *mut c_void, size: c_ulong, path: *const c_char) {
    if path.is_null() {
        warn!("pmfuzz_init called without a pool path");
        return;
    }
    let path = PathBuf::from(OsStr::from_bytes(CStr::from_ptr(path).to_bytes()));
    let pool = PoolDescriptor::new(addr as *const u8, size as usize, path);
    let engine = ENGINE.read().unwrap_or_else(PoisonError::into_inner);
    match engine.as_ref() {
        Some(engine) => {
            if let Err(err) = engine.init(pool) {
                error!("{:#}", err);
                std::process::abort();
            }
        }
        None => {
            init_logging(Config::from_env().map_or(false, |config| config.debug));
            warn!(
                "pmfuzz_init called before the access map was attached, ignoring pool {}",
                pool.path().display()
            );
        }
    }
}

/// Close the failure list.
#[no_mangle]
pub extern "C" fn pmfuzz_term() {
    with_engine(|engine| {
        if let Err(err) = engine.term() {
            warn!("{:#}", err);
        }
    });
}

/// A failure point at `file:line` was reached.
///
/// # Safety
///
/// `file` must be null or a valid C string.
#[no_mangle]
pub unsafe extern "C" fn pmfuzz_inject_failure(file: *const c_char, line: c_int) {
    let file = if file.is_null() {
        Cow::Borrowed("?")
    } else {
        CStr::from_ptr(file).to_string_lossy()
    };
    with_engine(|engine| {
        let injection = engine.maybe_inject_failure(&file, line.max(0) as u32);
        if let Some(injection) = injection.filter(|_| engine.config().debug) {
            debug!(
                "injected failure {} at {}:{}, image {}",
                injection.id,
                file,
                line,
                injection.image.display()
            );
        }
    });
}

/// Version of the runtime as a C string.
#[no_mangle]
pub extern "C" fn pmfuzz_version() -> *const c_char {
    VERSION.as_ptr() as *const c_char
}
