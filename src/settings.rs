use config::{Config, Environment, File};
use serde::Deserialize;

use crate::APP_NAME;

const CONFIG_NAME: &str = "config.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub db_file: String,
    pub listen: String,
    /// The acting user for CLI invocations; the HTTP API resolves users
    /// per request instead.
    pub default_user: String,
    pub provider: Provider,
    pub classifier: Classifier,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Provider {
    pub client_id: String,
    pub secret: String,
    #[serde(default = "default_provider_base_url")]
    pub base_url: String,
    #[serde(default = "default_authorize_url")]
    pub authorize_url: String,
    pub redirect_uri: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Classifier {
    pub base_url: String,
    pub api_key: String,
    #[serde(default = "default_batch_min")]
    pub batch_min: usize,
    #[serde(default = "default_batch_max")]
    pub batch_max: usize,
}

impl Settings {
    pub fn new(config_path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut s = Config::builder()
            .set_default("db_file", default_data_path())?
            .set_default("listen", "127.0.0.1:8787")?
            .set_default("default_user", "local")?
            .add_source(Environment::with_prefix("BURSAR").separator("__"));

        if let Some(path) = config_path {
            s = s.add_source(File::with_name(path));
        } else {
            s = s.add_source(File::with_name(&default_config_path()));
        }

        s.build()?.try_deserialize()
    }

    /// SQLite connection string for the configured database file.
    pub fn db_url(&self) -> String {
        if self.db_file.starts_with("sqlite:") {
            return self.db_file.clone();
        }

        format!("sqlite://{}?mode=rwc", self.db_file)
    }
}

fn default_data_path() -> String {
    dirs::data_dir()
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| std::env::temp_dir()))
        .join(APP_NAME)
        .join(format!("{}.db", APP_NAME))
        .display()
        .to_string()
}

pub(crate) fn default_config_path() -> String {
    dirs::config_dir()
        .unwrap_or_else(|| std::env::current_dir().expect("read current working dir"))
        .join(APP_NAME)
        .join(CONFIG_NAME)
        .display()
        .to_string()
}

fn default_provider_base_url() -> String {
    "https://api.truelayer.com".to_string()
}

fn default_authorize_url() -> String {
    "https://auth.truelayer.com".to_string()
}

fn default_batch_min() -> usize {
    5
}

fn default_batch_max() -> usize {
    50
}
