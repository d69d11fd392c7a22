use std::sync::Mutex;

use anyhow::{anyhow, Result};
use log::{Level, LevelFilter, Log, Metadata, Record};

use pmfuzz_runtime::{AccessMap, Config, Engine, Mode, PoolDescriptor};

/// Collects the log records of this crate, whatever the configured level.
struct Collector;

static RECORDS: Mutex<Vec<(Level, String)>> = Mutex::new(Vec::new());
static COLLECTOR: Collector = Collector;

impl Log for Collector {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if record.target().starts_with("pmfuzz_runtime") {
            RECORDS
                .lock()
                .unwrap()
                .push((record.level(), record.args().to_string()));
        }
    }

    fn flush(&self) {}
}

fn run_decisions(debug: bool) -> Result<Vec<(Level, String)>> {
    let dir = tempfile::tempdir()?;
    let pool = dir.path().join("pool.pm_pool");
    std::fs::write(&pool, b"pool")?;
    let config = Config {
        mode: Mode::Record,
        inject_all: true,
        debug,
        ..Default::default()
    };
    let engine = Engine::new(AccessMap::new(1 << 16), config)?;
    // before init
    engine.maybe_inject_failure("a.c", 0);
    engine.init(PoolDescriptor::from_file(&pool))?;
    for line in 1..10 {
        if line % 2 == 0 {
            engine.record_write(line);
        }
        engine.maybe_inject_failure("a.c", line);
    }
    engine.term()?;
    Ok(std::mem::take(&mut *RECORDS.lock().unwrap()))
}

#[test]
fn test_decision_diagnostics_follow_debug_flag() -> Result<()> {
    log::set_logger(&COLLECTOR).map_err(|err| anyhow!("{}", err))?;
    log::set_max_level(LevelFilter::Trace);

    let quiet = run_decisions(false)?;
    assert!(quiet.iter().all(|(level, _)| *level <= Level::Info), "{:?}", quiet);

    let verbose = run_decisions(true)?;
    let messages: Vec<&str> = verbose
        .iter()
        .filter(|(level, _)| *level == Level::Debug)
        .map(|(_, message)| message.as_str())
        .collect();
    assert!(messages.iter().any(|m| m.contains("not initialized")));
    assert!(messages.iter().any(|m| m.contains("initializing failure injection")));
    assert!(messages.iter().any(|m| m.contains("access map unchanged")));
    assert!(messages.iter().any(|m| m.contains("saved crash image")));
    Ok(())
}
