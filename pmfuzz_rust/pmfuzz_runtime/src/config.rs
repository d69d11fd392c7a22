//! Runtime configuration, resolved once when the engine is created.

use std::fs::File;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Optional YAML file with the base configuration.
pub const CONFIG_ENV: &str = "PMFUZZ_CONFIG";
/// Failure injection mode.
pub const FI_MODE_ENV: &str = "FI_MODE";
/// File to write failure ids to (record) or read them from (replay).
pub const FAILURE_LIST_ENV: &str = "FAILURE_LIST";
/// Enables debug messages when set to "1".
pub const DEBUG_ENV: &str = "PMFUZZ_DEBUG";
/// Suffix for crash image names.
pub const IMG_SUFFIX_ENV: &str = "FI_IMG_SUFFIX";
/// Select every fifth failure point below 100.
pub const GEN_ALL_CS_ENV: &str = "GEN_ALL_CS";
/// Select every failure point.
pub const INJECT_ALL_ENV: &str = "IMG_CREAT_FINJ";
/// Use byte counters with path hashing.
pub const PATH_MODE_ENV: &str = "ENABLE_PM_PATH";
/// Alias of `ENABLE_PM_PATH`.
pub const UNFOCUSSED_MODE_ENV: &str = "UNFOCUSSED_MODE";
/// Dump the mapped pool instead of copying the pool file, when set to "1".
pub const RAW_DUMP_ENV: &str = "USE_FAKE_MMAP";
pub const RESERVED_SLOTS_ENV: &str = "PMFUZZ_RESERVED_SLOTS";
pub const SEED_ENV: &str = "PMFUZZ_SEED";

/// Number of counters at the end of each index space that are never addressed.
pub const DEFAULT_RESERVED_SLOTS: u32 = 97;
pub const DEFAULT_SEED: u64 = 1633634632;

/// Failure injection mode.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Mode {
    /// Never inject failures.
    #[default]
    #[serde(rename = "")]
    Disabled,
    /// Select failure points and generate crash images.
    #[serde(rename = "IMG_GEN")]
    Record,
    /// Generate crash images for previously selected failure points.
    #[serde(rename = "IMG_REP")]
    Replay,
}

impl FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "" => Mode::Disabled,
            "IMG_GEN" => Mode::Record,
            "IMG_REP" => Mode::Replay,
            other => bail!(
                "invalid failure injection mode ({}), expected IMG_GEN or IMG_REP",
                other
            ),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mode: Mode,
    pub failure_list: Option<PathBuf>,
    pub debug: bool,
    pub image_suffix: String,
    /// Select failure ids below 100 that are a multiple of 5.
    pub generate_all_crash_sites: bool,
    /// Select every failure id.
    pub inject_all: bool,
    /// Byte counters with path hashing instead of bit-field counters.
    pub path_mode: bool,
    /// Dump the mapped pool memory instead of copying the pool file.
    pub raw_dump: bool,
    pub reserved_slots: u32,
    /// Seed for selecting failure points in record mode.
    pub seed: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            mode: Mode::Disabled,
            failure_list: None,
            debug: false,
            image_suffix: String::new(),
            generate_all_crash_sites: false,
            inject_all: false,
            path_mode: false,
            raw_dump: false,
            reserved_slots: DEFAULT_RESERVED_SLOTS,
            seed: DEFAULT_SEED,
        }
    }
}

impl Config {
    /// Resolve the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Config::resolve(|name| std::env::var(name).ok())
    }

    /// Resolve the configuration using `lookup` to read variables. The YAML file named by
    /// `PMFUZZ_CONFIG` provides defaults; variables override it.
    pub fn resolve<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match lookup(CONFIG_ENV) {
            Some(path) if !path.is_empty() => {
                let f = File::open(&path)
                    .with_context(|| format!("could not open config file {}", path))?;
                serde_yaml::from_reader(f)
                    .with_context(|| format!("could not parse config file {}", path))?
            }
            _ => Config::default(),
        };

        if let Some(mode) = lookup(FI_MODE_ENV) {
            config.mode = mode.parse()?;
        }
        if let Some(path) = lookup(FAILURE_LIST_ENV) {
            config.failure_list = Some(PathBuf::from(path));
        }
        if let Some(debug) = lookup(DEBUG_ENV) {
            config.debug = debug == "1";
        }
        if let Some(suffix) = lookup(IMG_SUFFIX_ENV) {
            config.image_suffix = suffix;
        }
        config.generate_all_crash_sites |= lookup(GEN_ALL_CS_ENV).is_some();
        config.inject_all |= lookup(INJECT_ALL_ENV).is_some();
        config.path_mode |=
            lookup(PATH_MODE_ENV).is_some() || lookup(UNFOCUSSED_MODE_ENV).is_some();
        if let Some(raw_dump) = lookup(RAW_DUMP_ENV) {
            config.raw_dump = raw_dump == "1";
        }
        if let Some(slots) = lookup(RESERVED_SLOTS_ENV) {
            config.reserved_slots = slots
                .parse()
                .with_context(|| format!("invalid {} value {:?}", RESERVED_SLOTS_ENV, slots))?;
        }
        if let Some(seed) = lookup(SEED_ENV) {
            config.seed = seed
                .parse()
                .with_context(|| format!("invalid {} value {:?}", SEED_ENV, seed))?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.mode == Mode::Replay && self.failure_list.is_none() {
            bail!("{} is required in replay mode (IMG_REP)", FAILURE_LIST_ENV);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::collections::HashMap;
    use std::io::Write;

    fn resolve(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::resolve(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() -> Result<()> {
        let config = resolve(&[])?;
        assert_eq!(config, Config::default());
        assert_eq!(config.mode, Mode::Disabled);
        assert_eq!(config.reserved_slots, 97);
        Ok(())
    }

    #[test]
    fn test_modes() -> Result<()> {
        assert_eq!(resolve(&[(FI_MODE_ENV, "")])?.mode, Mode::Disabled);
        assert_eq!(resolve(&[(FI_MODE_ENV, "IMG_GEN")])?.mode, Mode::Record);
        let config = resolve(&[(FI_MODE_ENV, "IMG_REP"), (FAILURE_LIST_ENV, "/tmp/list")])?;
        assert_eq!(config.mode, Mode::Replay);
        assert_eq!(config.failure_list, Some(PathBuf::from("/tmp/list")));
        assert!(resolve(&[(FI_MODE_ENV, "FUZZ")]).is_err());
        Ok(())
    }

    #[test]
    fn test_replay_requires_failure_list() {
        let err = resolve(&[(FI_MODE_ENV, "IMG_REP")]).unwrap_err();
        assert!(err.to_string().contains(FAILURE_LIST_ENV));
    }

    #[test]
    fn test_flags() -> Result<()> {
        let config = resolve(&[
            (DEBUG_ENV, "1"),
            (IMG_SUFFIX_ENV, "tc1"),
            (GEN_ALL_CS_ENV, ""),
            (INJECT_ALL_ENV, "0"),
            (UNFOCUSSED_MODE_ENV, ""),
            (RAW_DUMP_ENV, "1"),
            (RESERVED_SLOTS_ENV, "13"),
            (SEED_ENV, "7"),
        ])?;
        assert!(config.debug);
        assert_eq!(config.image_suffix, "tc1");
        assert!(config.generate_all_crash_sites);
        // presence is enough, the value is not inspected
        assert!(config.inject_all);
        assert!(config.path_mode);
        assert!(config.raw_dump);
        assert_eq!(config.reserved_slots, 13);
        assert_eq!(config.seed, 7);

        let config = resolve(&[(DEBUG_ENV, "yes"), (RAW_DUMP_ENV, "0")])?;
        assert!(!config.debug);
        assert!(!config.raw_dump);
        Ok(())
    }

    #[test]
    fn test_yaml_config() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(file, "mode: IMG_GEN")?;
        writeln!(file, "image_suffix: from_yaml")?;
        writeln!(file, "path_mode: true")?;
        let path = file.path().to_str().unwrap().to_string();

        let config = resolve(&[(CONFIG_ENV, &path)])?;
        assert_eq!(config.mode, Mode::Record);
        assert_eq!(config.image_suffix, "from_yaml");
        assert!(config.path_mode);
        assert_eq!(config.reserved_slots, DEFAULT_RESERVED_SLOTS);

        // variables take precedence
        let config = resolve(&[(CONFIG_ENV, &path), (IMG_SUFFIX_ENV, "from_env")])?;
        assert_eq!(config.image_suffix, "from_env");
        Ok(())
    }
}
