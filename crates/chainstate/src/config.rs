//! Chain state settings and the `key=value` conf file they load from.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chaind_consensus::Network;
use chaind_log::{Category, Format, Level, LogConfig};

pub const DEFAULT_COINS_CACHE_MB: u64 = 450;
pub const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 60 * 60;
pub const DEFAULT_MAX_CONNECT_BATCH: usize = 32;
pub const DEFAULT_CHECK_LEVEL: u32 = 3;
pub const DEFAULT_CHECK_BLOCKS: u32 = 6;
pub const MAX_CHECK_LEVEL: u32 = 4;
pub const DEFAULT_MAX_BLOCK_FILE_SIZE: u64 = 128 * 1024 * 1024;

pub type ConfMap = HashMap<String, Vec<String>>;

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(message) | ConfigError::Invalid(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Clone, Debug)]
pub struct ChainStateConfig {
    pub network: Network,
    pub data_dir: PathBuf,
    /// Flush the tip coin cache once its estimated size passes this.
    pub coins_cache_bytes: usize,
    pub flush_interval_secs: u64,
    pub max_connect_batch: usize,
    pub check_scripts: bool,
    pub check_level: u32,
    pub check_blocks: u32,
    pub max_block_file_size: u64,
    pub log: LogConfig,
    pub debug_categories: Vec<Category>,
}

impl ChainStateConfig {
    pub fn new(network: Network, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            network,
            data_dir: data_dir.into(),
            coins_cache_bytes: mb_to_bytes(DEFAULT_COINS_CACHE_MB),
            flush_interval_secs: DEFAULT_FLUSH_INTERVAL_SECS,
            max_connect_batch: DEFAULT_MAX_CONNECT_BATCH,
            check_scripts: true,
            check_level: DEFAULT_CHECK_LEVEL,
            check_blocks: DEFAULT_CHECK_BLOCKS,
            max_block_file_size: DEFAULT_MAX_BLOCK_FILE_SIZE,
            log: LogConfig::default(),
            debug_categories: Vec::new(),
        }
    }

    pub fn blocks_dir(&self) -> PathBuf {
        self.data_dir.join("blocks")
    }

    /// Defaults for `data_dir` overridden by `<data_dir>/chaind.conf` or
    /// `conf_path`, whichever is given. A missing file is not an error.
    pub fn load(
        network: Network,
        data_dir: impl Into<PathBuf>,
        conf_path: Option<&Path>,
    ) -> Result<Self, ConfigError> {
        let mut config = Self::new(network, data_dir);
        let conf_file = conf_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| config.data_dir.join("chaind.conf"));
        if let Some(conf) = load_conf(&conf_file)? {
            config.apply_conf(&conf, &conf_file)?;
        }
        Ok(config)
    }

    pub fn apply_conf(&mut self, conf: &ConfMap, conf_file: &Path) -> Result<(), ConfigError> {
        let invalid = |key: &str, raw: &str| {
            ConfigError::Invalid(format!("invalid {key} '{raw}' in {}", conf_file.display()))
        };
        let last = |key: &str| conf.get(key).and_then(|values| values.last());

        if let Some(raw) = last("regtest") {
            if parse_conf_bool(raw).ok_or_else(|| invalid("regtest", raw))? {
                self.network = Network::Regtest;
            }
        }
        if self.network != Network::Regtest {
            if let Some(raw) = last("testnet") {
                if parse_conf_bool(raw).ok_or_else(|| invalid("testnet", raw))? {
                    self.network = Network::Testnet;
                }
            }
        }

        if let Some(raw) = last("dbcache") {
            let mb = raw.parse::<u64>().map_err(|_| invalid("dbcache", raw))?;
            self.coins_cache_bytes = mb_to_bytes(mb);
        }
        if let Some(raw) = last("flushinterval") {
            self.flush_interval_secs = raw
                .parse::<u64>()
                .map_err(|_| invalid("flushinterval", raw))?;
        }
        if let Some(raw) = last("maxconnectbatch") {
            self.max_connect_batch = raw
                .parse::<usize>()
                .ok()
                .filter(|value| *value > 0)
                .ok_or_else(|| invalid("maxconnectbatch", raw))?;
        }
        if let Some(raw) = last("checkscripts") {
            self.check_scripts = parse_conf_bool(raw).ok_or_else(|| invalid("checkscripts", raw))?;
        }
        if let Some(raw) = last("checklevel") {
            self.check_level = raw
                .parse::<u32>()
                .ok()
                .filter(|value| *value <= MAX_CHECK_LEVEL)
                .ok_or_else(|| invalid("checklevel", raw))?;
        }
        if let Some(raw) = last("checkblocks") {
            self.check_blocks = raw.parse::<u32>().map_err(|_| invalid("checkblocks", raw))?;
        }
        if let Some(raw) = last("maxblockfilesize") {
            let mb = raw
                .parse::<u64>()
                .ok()
                .filter(|value| *value > 0)
                .ok_or_else(|| invalid("maxblockfilesize", raw))?;
            self.max_block_file_size = mb_to_bytes(mb) as u64;
        }

        if let Some(raw) = last("loglevel") {
            self.log.level = Level::parse(raw).ok_or_else(|| invalid("loglevel", raw))?;
        }
        if let Some(raw) = last("logformat") {
            self.log.format = Format::parse(raw).ok_or_else(|| invalid("logformat", raw))?;
        }
        if let Some(raw) = last("logtimestamps") {
            self.log.timestamps =
                parse_conf_bool(raw).ok_or_else(|| invalid("logtimestamps value", raw))?;
        }
        for raw in conf.get("debug").into_iter().flatten() {
            match raw.trim() {
                "1" | "all" => self.debug_categories = Category::ALL.to_vec(),
                "0" | "none" => self.debug_categories.clear(),
                name => {
                    let category = Category::parse(name).ok_or_else(|| invalid("debug", raw))?;
                    if !self.debug_categories.contains(&category) {
                        self.debug_categories.push(category);
                    }
                }
            }
        }
        Ok(())
    }

    /// Installs the log settings process-wide.
    pub fn init_logging(&self) {
        chaind_log::init(self.log);
        for category in &self.debug_categories {
            chaind_log::enable_category(*category);
        }
    }
}

/// Reads a conf file into lower-cased keys with every value seen for each.
/// Returns `None` when the file does not exist.
pub fn load_conf(path: &Path) -> Result<Option<ConfMap>, ConfigError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(ConfigError::Io(format!("{}: {err}", path.display()))),
    };
    Ok(Some(parse_conf(&contents)))
}

pub fn parse_conf(contents: &str) -> ConfMap {
    let mut out = ConfMap::new();
    for raw_line in contents.lines() {
        let mut line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(idx) = line.find('#') {
            line = &line[..idx];
        }
        if let Some(idx) = line.find(';') {
            line = &line[..idx];
        }
        line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (key, value) = match line.split_once('=') {
            Some((key, value)) => (key.trim(), value.trim()),
            None => (line, "1"),
        };
        if key.is_empty() {
            continue;
        }
        out.entry(key.to_ascii_lowercase())
            .or_default()
            .push(value.to_string());
    }
    out
}

pub fn parse_conf_bool(value: &str) -> Option<bool> {
    let value = value.trim();
    if value.is_empty() {
        return Some(true);
    }
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

fn mb_to_bytes(mb: u64) -> usize {
    usize::try_from(mb.saturating_mul(1024 * 1024)).unwrap_or(usize::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conf_lines_accumulate_and_strip_comments() {
        let conf = parse_conf(
            "# header\nregtest\nDebug=bench ; trailing\ndebug=coindb\n\n=ignored\ndbcache = 16 # mb\n",
        );
        assert_eq!(conf.get("regtest"), Some(&vec!["1".to_string()]));
        assert_eq!(
            conf.get("debug"),
            Some(&vec!["bench".to_string(), "coindb".to_string()])
        );
        assert_eq!(conf.get("dbcache"), Some(&vec!["16".to_string()]));
        assert!(!conf.contains_key(""));
    }

    #[test]
    fn apply_conf_overrides_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("chaind.conf");
        fs::write(
            &path,
            "regtest=1\ndbcache=16\ncheckblocks=12\ncheckscripts=no\ndebug=bench\nloglevel=debug\n",
        )
        .expect("write conf");

        let config = ChainStateConfig::load(Network::Mainnet, dir.path(), None).expect("load");
        assert_eq!(config.network, Network::Regtest);
        assert_eq!(config.coins_cache_bytes, 16 * 1024 * 1024);
        assert_eq!(config.check_blocks, 12);
        assert_eq!(config.check_level, DEFAULT_CHECK_LEVEL);
        assert!(!config.check_scripts);
        assert_eq!(config.debug_categories, vec![Category::Bench]);
        assert_eq!(config.log.level, Level::Debug);
        assert_eq!(config.max_connect_batch, DEFAULT_MAX_CONNECT_BATCH);
    }

    #[test]
    fn invalid_values_name_key_and_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("custom.conf");
        fs::write(&path, "checklevel=9\n").expect("write conf");
        let err = ChainStateConfig::load(Network::Regtest, dir.path(), Some(&path))
            .expect_err("out of range");
        assert_eq!(
            err.to_string(),
            format!("invalid checklevel '9' in {}", path.display())
        );

        let missing = ChainStateConfig::load(Network::Regtest, dir.path().join("nope"), None)
            .expect("missing conf is fine");
        assert_eq!(missing.coins_cache_bytes, 450 * 1024 * 1024);
    }
}
