use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use tracing::warn;

use crate::{
    error::{Error, Result},
    ratelimit,
    reader::{DEFAULT_TX_POWER_DBM, Region},
};

#[derive(Debug, Deserialize)]
pub struct Config {
    pub catalog: PathBuf,
    pub fallback: PathBuf,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    pub gallery_url: String,
    #[serde(default)]
    pub pipe: Option<PathBuf>,
    #[serde(default)]
    pub devices: DeviceConfig,
    #[serde(default)]
    pub cycle: CycleConfig,
    #[serde(default)]
    pub content: ContentConfig,
    #[serde(default)]
    pub record_store: Option<RecordStoreConfig>,
    #[serde(default)]
    pub slip: SlipConfig,
}

#[derive(Debug, Deserialize)]
pub struct DeviceConfig {
    #[serde(default)]
    pub rfid_port: Option<String>,
    #[serde(default)]
    pub display_port: Option<String>,
    #[serde(default = "default_printer_device")]
    pub printer_device: PathBuf,
    #[serde(default)]
    pub region: Region,
    #[serde(default = "default_tx_power")]
    pub tx_power_dbm: u16,
    #[serde(default)]
    pub display_brightness: Option<u8>,
    #[serde(default)]
    pub display_speed: Option<u8>,
}

#[derive(Debug, Deserialize)]
pub struct CycleConfig {
    #[serde(default = "default_target_tags")]
    pub target_tags: usize,
    #[serde(default = "default_inventory_timeout_s")]
    pub inventory_timeout_s: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_remove_timeout_s")]
    pub remove_timeout_s: u64,
    #[serde(default = "default_print_enabled")]
    pub print_enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct ContentConfig {
    #[serde(default)]
    pub api_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_rpm_limit")]
    pub rpm_limit: u32,
    #[serde(default = "default_daily_limit")]
    pub daily_limit: u32,
    #[serde(default = "default_max_wait_s")]
    pub max_wait_s: u64,
}

#[derive(Debug, Deserialize)]
pub struct RecordStoreConfig {
    pub url: String,
    #[serde(default)]
    pub key: String,
}

#[derive(Debug, Deserialize)]
pub struct SlipConfig {
    #[serde(default = "default_banner")]
    pub banner: String,
    #[serde(default = "default_figure_height")]
    pub figure_height: f32,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| Error::config(format!("cannot read {}: {err}", path.display())))?;
        let mut config: Config =
            toml::from_str(&raw).map_err(|err| Error::config(err.to_string()))?;

        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Environment wins over the TOML file; the command line wins over both.
    fn apply_env(&mut self) -> Result<()> {
        if let Ok(key) = env::var("CONTENT_API_KEY") {
            self.content.api_key = key;
        }
        if let Ok(model) = env::var("CONTENT_MODEL") {
            self.content.model = model;
        }
        if let Some(rpm) = env_u32("CONTENT_RPM_LIMIT")? {
            self.content.rpm_limit = rpm;
        }
        if let Some(daily) = env_u32("CONTENT_DAILY_LIMIT")? {
            self.content.daily_limit = daily;
        }
        if let Ok(url) = env::var("RECORD_STORE_URL") {
            let key = env::var("RECORD_STORE_KEY").unwrap_or_else(|_| {
                self.record_store
                    .as_ref()
                    .map(|store| store.key.clone())
                    .unwrap_or_default()
            });
            self.record_store = Some(RecordStoreConfig { url, key });
        } else if let (Some(store), Ok(key)) =
            (self.record_store.as_mut(), env::var("RECORD_STORE_KEY"))
        {
            store.key = key;
        }
        if let Ok(dir) = env::var("OUTPUT_DIR") {
            self.output_dir = PathBuf::from(dir);
        }
        Ok(())
    }

    pub fn apply_cli(
        &mut self,
        no_print: bool,
        region: Option<&str>,
        power: Option<u16>,
        target_tags: Option<usize>,
    ) -> Result<()> {
        if no_print {
            self.cycle.print_enabled = false;
        }
        if let Some(region) = region {
            self.devices.region = region.parse().map_err(|err: String| Error::config(err))?;
        }
        if let Some(power) = power {
            self.devices.tx_power_dbm = power;
        }
        if let Some(target) = target_tags {
            self.cycle.target_tags = target;
        }
        self.validate()
    }

    fn validate(&self) -> Result<()> {
        if !self.catalog.is_file() {
            return Err(Error::config(format!(
                "catalog must point to an existing file, got {}",
                self.catalog.display()
            )));
        }
        if !self.fallback.is_file() {
            return Err(Error::config(format!(
                "fallback must point to an existing file, got {}",
                self.fallback.display()
            )));
        }
        if self.gallery_url.trim().is_empty() {
            return Err(Error::config("gallery_url must be a non-empty URL"));
        }
        if self.cycle.target_tags == 0 {
            return Err(Error::config("[cycle].target_tags must be at least 1"));
        }
        let max_power = self.devices.region.max_power_dbm();
        if self.devices.tx_power_dbm > max_power {
            return Err(Error::config(format!(
                "{} dBm exceeds the {} limit of {} dBm",
                self.devices.tx_power_dbm, self.devices.region, max_power
            )));
        }
        if !self.slip.figure_height.is_finite() || self.slip.figure_height <= 0.0 {
            return Err(Error::config("[slip].figure_height must be positive"));
        }
        if self.content.api_url.trim().is_empty() {
            warn!("No content api_url configured; every slip will use fallback text");
        }
        Ok(())
    }

    pub fn slip_dir(&self) -> PathBuf {
        self.output_dir.join("slips")
    }

    pub fn window_file(&self) -> PathBuf {
        self.output_dir.join("rate_window.json")
    }

    pub fn inventory_timeout(&self) -> Duration {
        Duration::from_secs(self.cycle.inventory_timeout_s)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.cycle.poll_interval_ms)
    }

    pub fn remove_timeout(&self) -> Duration {
        Duration::from_secs(self.cycle.remove_timeout_s)
    }

    pub fn content_max_wait(&self) -> Duration {
        Duration::from_secs(self.content.max_wait_s)
    }
}

fn env_u32(name: &str) -> Result<Option<u32>> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|err| Error::config(format!("{name} must be a number: {err}"))),
        Err(_) => Ok(None),
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            rfid_port: None,
            display_port: None,
            printer_device: default_printer_device(),
            region: Region::default(),
            tx_power_dbm: default_tx_power(),
            display_brightness: None,
            display_speed: None,
        }
    }
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            target_tags: default_target_tags(),
            inventory_timeout_s: default_inventory_timeout_s(),
            poll_interval_ms: default_poll_interval_ms(),
            remove_timeout_s: default_remove_timeout_s(),
            print_enabled: default_print_enabled(),
        }
    }
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            api_key: String::new(),
            model: default_model(),
            rpm_limit: default_rpm_limit(),
            daily_limit: default_daily_limit(),
            max_wait_s: default_max_wait_s(),
        }
    }
}

impl Default for SlipConfig {
    fn default() -> Self {
        Self {
            banner: default_banner(),
            figure_height: default_figure_height(),
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_printer_device() -> PathBuf {
    PathBuf::from("/dev/usb/lp0")
}

const fn default_tx_power() -> u16 {
    DEFAULT_TX_POWER_DBM
}

const fn default_target_tags() -> usize {
    6
}

const fn default_inventory_timeout_s() -> u64 {
    120
}

const fn default_poll_interval_ms() -> u64 {
    30
}

const fn default_remove_timeout_s() -> u64 {
    20
}

const fn default_print_enabled() -> bool {
    true
}

fn default_model() -> String {
    "prose-large".to_string()
}

const fn default_rpm_limit() -> u32 {
    ratelimit::DEFAULT_RPM_LIMIT
}

const fn default_daily_limit() -> u32 {
    ratelimit::DEFAULT_DAILY_LIMIT
}

const fn default_max_wait_s() -> u64 {
    ratelimit::DEFAULT_MAX_WAIT.as_secs()
}

fn default_banner() -> String {
    "FIGURE WORKSHOP".to_string()
}

const fn default_figure_height() -> f32 {
    190.0
}
