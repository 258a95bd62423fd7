use serde::{Deserialize, Serialize};
use std::{fs, path::{Path, PathBuf}};
use anyhow::{Context, Result};

/// Bundled defaults, used when no config file is given.
pub const DEFAULT_CONFIG: &str = include_str!("../config.toml");

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub backend: BackendConfig,
    #[serde(default)]
    pub chain: Chain,
    #[serde(default)]
    pub wallet: WalletSettings,
    pub storage: Storage,
    #[serde(default)]
    pub metrics: Metrics,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
    Electrum,
    Node,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    pub mode: BackendMode,
    pub host: String,
    pub port: u16,
    #[serde(default = "default_true")]
    pub tls: bool,
    /// Public Electrum servers mostly run self-signed certificates.
    #[serde(default = "default_true")]
    pub accept_invalid_certs: bool,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub pass: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Chain {
    #[serde(default = "default_network")]
    pub network: String,
}

impl Default for Chain {
    fn default() -> Self {
        Self { network: default_network() }
    }
}

/// User-tunable wallet behaviour. Persisted in the store once the user changes it.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct WalletSettings {
    /// sat/vbyte, never below 1.
    #[serde(default = "default_fee_rate")]
    pub fee_rate: u64,
    /// 0 keeps everything.
    #[serde(default)]
    pub retention_days: u32,
    /// Legacy node only; 0 means a 24 hour window.
    #[serde(default)]
    pub rescan_hours: u64,
    #[serde(default = "default_true")]
    pub allow_unconfirmed_spend: bool,
    /// Payment attached to a message when none is given, in satoshi.
    #[serde(default)]
    pub default_amount_sat: u64,
}

impl Default for WalletSettings {
    fn default() -> Self {
        Self {
            fee_rate: default_fee_rate(),
            retention_days: 0,
            rescan_hours: 0,
            allow_unconfirmed_spend: true,
            default_amount_sat: 0,
        }
    }
}

impl WalletSettings {
    pub fn normalized(mut self) -> Self {
        self.fee_rate = self.fee_rate.max(1);
        self
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Storage {
    pub path: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Metrics {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for Metrics {
    fn default() -> Self {
        Self { enabled: false, bind: default_bind() }
    }
}

fn default_true() -> bool { true }
fn default_timeout() -> u64 { 10 }
fn default_fee_rate() -> u64 { 1 }
fn default_network() -> String { "palladium".into() }
fn default_bind() -> String { "127.0.0.1:9100".into() }

impl Storage {
    /// Relative paths live under `~/.chainchat/`.
    pub fn resolved_path(&self) -> PathBuf {
        let p = Path::new(&self.path);
        if p.is_absolute() {
            return p.to_path_buf();
        }
        match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(".chainchat").join(p),
            None => p.to_path_buf(),
        }
    }
}

/// Read the TOML file at `p` and deserialize into `Config`.
///
/// # Errors
/// * Returns an anyhow::Error if the file cannot be read or parsed.
pub fn load<P: AsRef<Path>>(p: P) -> Result<Config> {
    let text = fs::read_to_string(&p)
        .with_context(|| format!("🗂️  couldn't read config file {}", p.as_ref().display()))?;
    parse(&text)
}

pub fn parse(text: &str) -> Result<Config> {
    let cfg: Config = toml::from_str(text)
        .with_context(|| "📝  invalid TOML in config file".to_string())?;
    Ok(Config { wallet: cfg.wallet.clone().normalized(), ..cfg })
}

/// The config file if given, else the bundled defaults.
pub fn load_or_default(p: Option<&Path>) -> Result<Config> {
    match p {
        Some(path) => load(path),
        None => parse(DEFAULT_CONFIG).context("bundled config.toml is invalid"),
    }
}
