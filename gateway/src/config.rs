use std::net::SocketAddr;

use envconfig::Envconfig;
use tracing::Level;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(default = "false")]
    pub print_publisher: bool,

    #[envconfig(default = "127.0.0.1:8080")]
    pub address: SocketAddr,

    #[envconfig(default = "tcp://127.0.0.1:8050")]
    pub sender_bindings: String, // Comma-delimited endpoints, tcp://host:port or ipc:///path

    pub ip_key_salt: Option<String>,

    #[envconfig(default = "1000")]
    pub publish_buffer_frames: usize, // Frames queued per subscriber before it starts skipping

    pub publish_concurrency_limit: Option<usize>,

    #[envconfig(default = "20971520")]
    pub max_payload_bytes: usize, // 20MiB, applies to the body and to the decompressed payload

    #[envconfig(default = "67108864")]
    pub max_frame_bytes: usize, // 64MiB, subscribers must read with at least this limit

    // Used for integration tests
    #[envconfig(default = "true")]
    pub export_prometheus: bool,

    pub otel_url: Option<String>,

    #[envconfig(default = "1.0")]
    pub otel_sampling_rate: f64,

    #[envconfig(default = "gateway")]
    pub otel_service_name: String,

    #[envconfig(default = "info")]
    pub log_level: Level,
}

impl Config {
    pub fn bindings(&self) -> Vec<String> {
        self.sender_bindings
            .split(',')
            .map(str::trim)
            .filter(|binding| !binding.is_empty())
            .map(String::from)
            .collect()
    }

    /// An empty salt is treated as unset, upload keys are only added with a usable salt.
    pub fn salt(&self) -> Option<String> {
        self.ip_key_salt
            .as_ref()
            .filter(|salt| !salt.is_empty())
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use envconfig::Envconfig;

    use super::Config;

    fn config_from(vars: &[(&str, &str)]) -> Config {
        let env: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::init_from_hashmap(&env).expect("failed to load config")
    }

    #[test]
    fn defaults() {
        let config = config_from(&[]);
        assert_eq!(config.address.to_string(), "127.0.0.1:8080");
        assert_eq!(config.bindings(), vec!["tcp://127.0.0.1:8050".to_string()]);
        assert_eq!(config.salt(), None);
        assert_eq!(config.publish_concurrency_limit, None);
        assert_eq!(config.max_payload_bytes, 20 * 1024 * 1024);
        assert_eq!(config.max_frame_bytes, 64 * 1024 * 1024);
        assert!(!config.print_publisher);
    }

    #[test]
    fn splits_bindings() {
        let config = config_from(&[(
            "SENDER_BINDINGS",
            "tcp://*:8050, ipc:///tmp/gateway-sender,,",
        )]);
        assert_eq!(
            config.bindings(),
            vec![
                "tcp://*:8050".to_string(),
                "ipc:///tmp/gateway-sender".to_string()
            ]
        );
    }

    #[test]
    fn empty_salt_is_unset() {
        assert_eq!(config_from(&[("IP_KEY_SALT", "")]).salt(), None);
        assert_eq!(
            config_from(&[("IP_KEY_SALT", "pepper")]).salt(),
            Some("pepper".to_string())
        );
    }
}
