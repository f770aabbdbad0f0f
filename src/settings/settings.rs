use anyhow::{Result, anyhow};
use config::{Config, File};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub auth: Auth,
    pub call: Call,
    pub chat: Chat,
    pub http: Http,
    pub kafka: Kafka,
    pub log: Log,
    pub mysql: Mysql,
    pub outbox: Outbox,
    pub redis: Redis,
}

#[derive(Debug, Deserialize)]
pub struct Auth {
    /// HS256 key for bearer-token verification; the env var wins when set.
    pub signing_key: String,
}

#[derive(Debug, Deserialize)]
pub struct Call {
    pub ring_timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct Chat {
    pub edit_window_minutes: i64,
    pub recall_window_minutes: i64,
    /// Cap on catch-up page size; also the default when the client omits one.
    pub catch_up_limit: u32,
}

#[derive(Debug, Deserialize)]
pub struct Http {
    pub cert_path: String,
    pub key_path: String,
    pub address: String,
}

#[derive(Debug, Deserialize)]
pub struct Kafka {
    pub bootstrap_server: String,
}

#[derive(Debug, Deserialize)]
pub struct Log {
    pub filter: String,
}

#[derive(Debug, Deserialize)]
pub struct Mysql {
    pub dsn: String,
}

#[derive(Debug, Deserialize)]
pub struct Outbox {
    pub poll_interval_ms: u64,
    pub batch_size: u32,
    pub max_attempts: u32,
    pub backoff_base_ms: i64,
    pub backoff_cap_ms: i64,
}

#[derive(Debug, Deserialize)]
pub struct Redis {
    pub dsn: String,
}

#[cfg(debug_assertions)]
const SETTINGS_PATH: &str = "settings/dev.toml";
#[cfg(not(debug_assertions))]
const SETTINGS_PATH: &str = "settings/release.toml";

pub fn parse_settings(path: Option<&str>) -> Result<Settings> {
    let path = path.unwrap_or(SETTINGS_PATH);

    let settings: Settings = Config::builder()
        .add_source(File::with_name(path))
        .build()
        .map_err(|e| anyhow!(e))?
        .try_deserialize()
        .map_err(|e| anyhow!(e))?;

    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_dev_settings_file() {
        let settings = parse_settings(Some("settings/dev.toml")).unwrap();
        assert!(settings.chat.edit_window_minutes > 0);
        assert!(settings.outbox.max_attempts > 0);
        assert!(settings.call.ring_timeout_secs > 0);
    }
}
