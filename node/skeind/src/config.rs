use hashbrown::HashMap;
use keel::logging::{self, Logger};
use serde_derive::Deserialize;
use serdeconv;
use skein::logic::controller::NodeDefinition;
use std::net::SocketAddrV4;
use std::path::Path;

pub const DEFAULT_SALT_LEN: usize = 8;
pub const DEFAULT_IV_LEN: usize = 12;

#[derive(Deserialize)]
pub struct Config {
    pub basic: Basic,
    pub net: Net,
    pub shm: Shm,
    #[serde(default)]
    pub cluster_entrance: Option<Entrance>,
    #[serde(default)]
    pub cluster_nodes: HashMap<String, NodeDefinition>,
    #[serde(default)]
    pub log: HashMap<String, LogSection>,
}

#[derive(Deserialize)]
pub struct Basic {
    pub node_id: u8,
    pub pid_file: String,
    pub worker_amount: u32,
}

#[derive(Deserialize)]
pub struct Net {
    #[serde(default)]
    pub ipv6: bool,
    #[serde(default = "default_listen_addr")]
    pub aff_listen_addr: String,
    pub aff_listen_port: u16,
    pub identification: String,
    pub crypto: Crypto,
}

#[derive(Deserialize)]
pub struct Crypto {
    pub cipher: String,
    pub password: String,
    #[serde(default = "default_iv_len")]
    pub iv_len: usize,
    pub iv_duration_range: (u64, u64),
    #[serde(default = "default_salt_len")]
    pub salt_len: usize,
}

#[derive(Deserialize)]
pub struct Shm {
    pub socket_dir: String,
    pub manager_socket_name: String,
}

#[derive(Deserialize)]
pub struct Entrance {
    pub ip: String,
    pub port: u16,
}

#[derive(Deserialize, Default)]
pub struct LogSection {
    pub level: Option<String>,
    pub path: Option<String>,
    #[serde(default)]
    pub stdout: bool,
}

fn default_listen_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_iv_len() -> usize {
    DEFAULT_IV_LEN
}

fn default_salt_len() -> usize {
    DEFAULT_SALT_LEN
}

impl Config {
    /// Loads and validates the node configuration. Violations are fatal, a
    /// node must never come up half-configured.
    pub fn load<P: AsRef<Path>>(path: P) -> Config {
        let config: Config = serdeconv::from_toml_file(path).expect("Error loading node configuration file");
        config.validate();
        config
    }

    fn validate(&self) {
        if self.net.ipv6 {
            panic!("IPv6 transport is not supported by protocol v0");
        }

        let (lo, hi) = self.net.crypto.iv_duration_range;
        if lo == 0 || hi < lo {
            panic!("iv_duration_range must be a non-empty ascending pair");
        }
    }

    /// The socket address workers bind and advertise.
    pub fn listen(&self) -> SocketAddrV4 {
        format!("{}:{}", self.net.aff_listen_addr, self.net.aff_listen_port)
            .parse()
            .expect("Invalid listen address")
    }

    pub fn entrance(&self) -> Option<SocketAddrV4> {
        self.cluster_entrance
            .as_ref()
            .map(|entrance| {
                format!("{}:{}", entrance.ip, entrance.port)
                    .parse()
                    .expect("Invalid cluster entrance address")
            })
    }

    /// Builds the logger configured under `[log.<name>]`, falling back to
    /// `[log.main]` and then to a default terminal logger.
    pub fn logger(&self, name: &str) -> Logger {
        let section = self.log.get(name).or_else(|| self.log.get("main"));

        match section {
            Some(section) => {
                let level = section.level.as_ref().map(String::as_str).unwrap_or("info");

                match &section.path {
                    Some(path) => logging::file(level, path),
                    None => logging::terminal(level, section.stdout),
                }
            }
            None => logging::terminal("info", false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein::cluster::Role;

    const SAMPLE: &str = r#"
        [basic]
        node_id = 7
        pid_file = "/run/skeind.pid"
        worker_amount = 2

        [net]
        aff_listen_port = 9000
        identification = "node-a"

        [net.crypto]
        cipher = "chacha20-poly1305"
        password = "the shared secret"
        iv_duration_range = [10000, 20000]

        [shm]
        socket_dir = "/tmp/skein"
        manager_socket_name = "manager.socket"

        [cluster_entrance]
        ip = "10.0.0.9"
        port = 9000

        [cluster_nodes.node-b]
        ip = "10.0.0.2"
        role = "relay"

        [log.main]
        level = "debug"
        stdout = true
    "#;

    #[test]
    fn test_sample_roundtrip() {
        let config: Config = serdeconv::from_toml_str(SAMPLE).unwrap();
        config.validate();

        assert_eq!(config.basic.node_id, 7);
        assert_eq!(config.basic.worker_amount, 2);
        assert_eq!(config.listen(), "0.0.0.0:9000".parse().unwrap());
        assert_eq!(config.entrance(), Some("10.0.0.9:9000".parse().unwrap()));
        assert_eq!(config.net.crypto.salt_len, DEFAULT_SALT_LEN);
        assert_eq!(config.net.crypto.iv_len, DEFAULT_IV_LEN);
        assert_eq!(config.net.crypto.iv_duration_range, (10_000, 20_000));

        let node = config.cluster_nodes.get("node-b").unwrap();
        assert_eq!(node.ip, "10.0.0.2");
        assert_eq!(node.role, Role::Relay);
    }

    #[test]
    #[should_panic(expected = "IPv6 transport is not supported")]
    fn test_ipv6_is_rejected() {
        let sample = SAMPLE.replace("[net]", "[net]\n        ipv6 = true");
        let config: Config = serdeconv::from_toml_str(&sample).unwrap();
        config.validate();
    }

    #[test]
    #[should_panic(expected = "iv_duration_range")]
    fn test_descending_iv_duration_range_is_rejected() {
        let sample = SAMPLE.replace("[10000, 20000]", "[20000, 10000]");
        let config: Config = serdeconv::from_toml_str(&sample).unwrap();
        config.validate();
    }
}
