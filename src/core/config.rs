// 配置读取与覆盖合并：基础 YAML + 可选覆盖文件 + 环境变量占位符。
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

const DEFAULT_CONFIG_PATH: &str = "config/relay.yaml";
const DEFAULT_OVERRIDE_PATH: &str = "data/config/relay.override.yaml";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub cors: CorsConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub tiktok: TiktokConfig,
    #[serde(default)]
    pub youtube: YoutubeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(
        default = "default_port",
        deserialize_with = "deserialize_u16_from_any"
    )]
    pub port: u16,
    #[serde(default = "default_keep_alive_s")]
    pub keep_alive_s: u64,
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            keep_alive_s: default_keep_alive_s(),
            subscriber_buffer: default_subscriber_buffer(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_keep_alive_s() -> u64 {
    15
}

fn default_subscriber_buffer() -> usize {
    256
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CorsConfig {
    pub allow_origins: Option<Vec<String>>,
    pub allow_methods: Option<Vec<String>>,
    pub allow_headers: Option<Vec<String>>,
    pub allow_credentials: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub log_level: String,
}

/// 连接池的时间参数，0 表示沿用默认值。
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RelayConfig {
    #[serde(default)]
    pub idle_grace_s: u64,
    #[serde(default)]
    pub reconnect_delay_s: u64,
    #[serde(default)]
    pub connect_cooldown_s: u64,
    #[serde(default)]
    pub connect_timeout_s: u64,
    #[serde(default)]
    pub dedupe_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TiktokConfig {
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub ws_endpoint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct YoutubeConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default)]
    pub watch_base: Option<String>,
    #[serde(default)]
    pub poll_min_ms: u64,
    #[serde(default)]
    pub poll_max_ms: u64,
}

#[derive(Debug, Clone)]
pub struct TiktokCredentials {
    pub account_id: String,
    pub secret: String,
}

impl Config {
    /// 推送平台凭据：配置优先，其次读取历史遗留的环境变量。
    pub fn tiktok_credentials(&self) -> Option<TiktokCredentials> {
        let account_id = resolve_secret(
            self.tiktok.account_id.as_deref(),
            &["EULERSTREAM_ACCOUNT_ID", "VITE_EULERSTREAM_ACCOUNT_ID"],
        )?;
        let secret = resolve_secret(
            self.tiktok.secret.as_deref(),
            &["EULERSTREAM_WEBHOOK_SECRET", "VITE_EULERSTREAM_WEBHOOK_SECRET"],
        )?;
        Some(TiktokCredentials { account_id, secret })
    }

    pub fn youtube_api_key(&self) -> Option<String> {
        resolve_secret(self.youtube.api_key.as_deref(), &["YOUTUBE_API_KEY"])
    }
}

impl RelayConfig {
    pub fn idle_grace(&self) -> Duration {
        secs_or(self.idle_grace_s, 60)
    }

    pub fn reconnect_delay(&self) -> Duration {
        secs_or(self.reconnect_delay_s, 15)
    }

    pub fn connect_cooldown(&self) -> Duration {
        secs_or(self.connect_cooldown_s, 5)
    }

    pub fn connect_timeout(&self) -> Duration {
        secs_or(self.connect_timeout_s, 20)
    }

    pub fn dedupe_capacity(&self) -> usize {
        if self.dedupe_capacity == 0 {
            300
        } else {
            self.dedupe_capacity
        }
    }
}

fn secs_or(value: u64, fallback: u64) -> Duration {
    Duration::from_secs(if value == 0 { fallback } else { value })
}

fn resolve_secret(inline: Option<&str>, env_keys: &[&str]) -> Option<String> {
    let inline = inline.map(str::trim).filter(|value| !value.is_empty());
    if let Some(value) = inline {
        return Some(value.to_string());
    }
    env_keys.iter().find_map(|key| {
        env::var(key)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

fn deserialize_u16_from_any<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    struct U16Visitor;

    impl<'de> Visitor<'de> for U16Visitor {
        type Value = u16;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("u16 or numeric string")
        }

        fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            u16::try_from(value).map_err(|_| E::custom("u16 out of range"))
        }

        fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if value < 0 {
                return Err(E::custom("u16 must be non-negative"));
            }
            self.visit_u64(value as u64)
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                return Err(E::custom("u16 string is empty"));
            }
            trimmed
                .parse::<u16>()
                .map_err(|_| E::custom("invalid u16 string"))
        }

        fn visit_string<E>(self, value: String) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            self.visit_str(&value)
        }
    }

    deserializer.deserialize_any(U16Visitor)
}

pub fn load_config() -> Config {
    let base_path = env::var("RELAY_CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let override_path = env::var("RELAY_CONFIG_OVERRIDE_PATH")
        .unwrap_or_else(|_| DEFAULT_OVERRIDE_PATH.to_string());
    load_config_from(&base_path, Some(&override_path))
}

pub fn load_config_from(base_path: &str, override_path: Option<&str>) -> Config {
    let mut merged = read_yaml(base_path);
    if let Some(override_path) = override_path {
        if Path::new(override_path).exists() {
            // 只对非空字段做递归覆盖，避免误清空已有配置。
            merge_yaml(&mut merged, read_yaml(override_path));
        }
    }

    expand_yaml_env(&mut merged);

    if merged.is_null() {
        return Config::default();
    }
    serde_yaml::from_value::<Config>(merged).unwrap_or_else(|err| {
        warn!("配置解析失败，使用默认配置: {err}");
        Config::default()
    })
}

fn read_yaml(path: &str) -> Value {
    // 配置文件允许不存在，首次启动直接使用默认值。
    let content = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) => {
            warn!("读取配置失败: {path}, {err}");
            return Value::Null;
        }
    };
    serde_yaml::from_str(&content).unwrap_or_else(|err| {
        warn!("解析 YAML 失败: {path}, {err}");
        Value::Null
    })
}

fn merge_yaml(base: &mut Value, override_value: Value) {
    match (base, override_value) {
        (Value::Mapping(base_map), Value::Mapping(override_map)) => {
            for (key, value) in override_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_yaml(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base_slot, override_value) => {
            if !override_value.is_null() {
                *base_slot = override_value;
            }
        }
    }
}

fn expand_yaml_env(value: &mut Value) {
    match value {
        Value::String(text) => {
            *text = expand_env_placeholders(text);
        }
        Value::Sequence(items) => {
            for item in items {
                expand_yaml_env(item);
            }
        }
        Value::Mapping(map) => {
            for (_, value) in map.iter_mut() {
                expand_yaml_env(value);
            }
        }
        _ => {}
    }
}

fn expand_env_placeholders(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);
        rest = &rest[start + 2..];
        let Some(end) = rest.find('}') else {
            output.push_str("${");
            output.push_str(rest);
            return output;
        };
        let inner = &rest[..end];
        rest = &rest[end + 1..];
        let (name, default_value) = match inner.split_once(":-") {
            Some((name, default_value)) => (name.trim(), Some(default_value)),
            None => (inner.trim(), None),
        };
        if name.is_empty() {
            output.push_str("${");
            output.push_str(inner);
            output.push('}');
            continue;
        }
        let resolved = env::var(name).ok().filter(|value| !value.is_empty());
        match (resolved, default_value) {
            (Some(value), _) => output.push_str(&value),
            (None, Some(default_value)) => output.push_str(default_value),
            (None, None) => {}
        }
    }
    output.push_str(rest);
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_expand_env_placeholders() {
        std::env::remove_var("RELAY_TEST_PLACEHOLDER");
        assert_eq!(
            expand_env_placeholders("${RELAY_TEST_PLACEHOLDER:-default}"),
            "default"
        );
        assert_eq!(
            expand_env_placeholders("prefix-${RELAY_TEST_PLACEHOLDER:-d}-suffix"),
            "prefix-d-suffix"
        );

        std::env::set_var("RELAY_TEST_PLACEHOLDER", "value");
        assert_eq!(
            expand_env_placeholders("${RELAY_TEST_PLACEHOLDER:-default}"),
            "value"
        );
        assert_eq!(
            expand_env_placeholders("prefix-${RELAY_TEST_PLACEHOLDER}-suffix"),
            "prefix-value-suffix"
        );

        std::env::remove_var("RELAY_TEST_PLACEHOLDER");
        assert_eq!(expand_env_placeholders("${RELAY_TEST_PLACEHOLDER}"), "");
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = load_config_from("/nonexistent/relay.yaml", None);
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.relay.idle_grace(), Duration::from_secs(60));
        assert_eq!(config.relay.reconnect_delay(), Duration::from_secs(15));
        assert_eq!(config.relay.connect_cooldown(), Duration::from_secs(5));
        assert_eq!(config.relay.dedupe_capacity(), 300);
    }

    #[test]
    fn override_file_merges_over_base() {
        let dir = tempfile::tempdir().expect("temp dir");
        let base = dir.path().join("relay.yaml");
        let overlay = dir.path().join("relay.override.yaml");
        let mut file = fs::File::create(&base).expect("create base");
        writeln!(
            file,
            "server:\n  host: 127.0.0.1\n  port: \"8080\"\nrelay:\n  idle_grace_s: 30\ntiktok:\n  account_id: acct\n  secret: s3cr3t"
        )
        .expect("write base");
        let mut file = fs::File::create(&overlay).expect("create override");
        writeln!(file, "relay:\n  dedupe_capacity: 50").expect("write override");

        let config = load_config_from(
            base.to_str().expect("utf8 path"),
            Some(overlay.to_str().expect("utf8 path")),
        );
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.relay.idle_grace(), Duration::from_secs(30));
        assert_eq!(config.relay.dedupe_capacity(), 50);
        let credentials = config.tiktok_credentials().expect("credentials");
        assert_eq!(credentials.account_id, "acct");
        assert_eq!(credentials.secret, "s3cr3t");
    }
}
