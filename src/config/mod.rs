//! Configuration loading.
//!
//! Sources, lowest precedence first:
//! 1. `Settings::default()`
//! 2. `config/default.toml` (optional)
//! 3. `.env` in the working directory (optional, loaded into the environment)
//! 4. environment variables prefixed `MESHBUS_`, nested with `__`,
//!    e.g. `MESHBUS_SERVER__PORT=9000`

mod settings;

use config::{Config, ConfigError, Environment, File};

pub use settings::{
    BrokerSettings, DiscoverySettings, LoggingSettings, PredefinedService, PublisherSettings,
    RegistrationSettings, ServerSettings, Settings,
};

/// Loads the configuration from `config/default` and the environment.
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from("config/default")
}

/// Same as [`load_config`] with an explicit file (extension optional).
pub fn load_config_from(path: &str) -> Result<Settings, ConfigError> {
    let _ = dotenvy::dotenv();

    let builder = Config::builder()
        .add_source(Config::try_from(&Settings::default())?)
        .add_source(File::with_name(path).required(false))
        .add_source(
            Environment::with_prefix("MESHBUS")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("publisher.reconnect_delays_ms")
                .try_parsing(true),
        );

    builder.build()?.try_deserialize()
}
