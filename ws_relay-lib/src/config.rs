use std::env;
use std::net::SocketAddr;

use crate::error::ConfigError;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_PATH: &str = "ws";

/// What a read loop does after a read fault that is not a clean close.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadErrorPolicy {
    /// Log the fault and keep reading. The connection stays registered
    /// until the transport reports a close or the stream ends.
    Tolerate,
    /// Treat the fault as terminal and deregister the connection.
    Disconnect,
}

/// Knobs for the broadcast dispatcher.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Whether a sender receives its own messages back.
    pub echo_to_sender: bool,
    pub read_errors: ReadErrorPolicy,
    /// Upper bound on writes in flight across all broadcasts.
    /// `None` spawns every write immediately.
    pub max_concurrent_writes: Option<usize>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            echo_to_sender: true,
            read_errors: ReadErrorPolicy::Disconnect,
            max_concurrent_writes: None,
        }
    }
}

/// Process configuration, read from `RELAY_*` environment variables.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayConfig {
    pub listen: SocketAddr,
    /// Single path segment the upgrade route is mounted on.
    pub path: String,
    pub dispatch: DispatchConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            path: DEFAULT_PATH.to_owned(),
            dispatch: DispatchConfig::default(),
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from an arbitrary variable source. Unset or blank
    /// variables fall back to defaults; malformed ones are errors.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_owned())
                .filter(|v| !v.is_empty())
        };
        let mut config = RelayConfig::default();

        if let Some(addr) = get("RELAY_ADDR") {
            config.listen = addr.parse().map_err(|source| ConfigError::Addr {
                var: "RELAY_ADDR",
                source,
            })?;
        }

        if let Some(path) = get("RELAY_PATH") {
            config.path = parse_path(&path)?;
        }

        if let Some(echo) = get("RELAY_ECHO_SELF") {
            config.dispatch.echo_to_sender = match echo.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => true,
                "false" | "0" | "no" => false,
                _ => {
                    return Err(ConfigError::Choice {
                        var: "RELAY_ECHO_SELF",
                        expected: "true|false",
                        value: echo,
                    });
                }
            };
        }

        if let Some(policy) = get("RELAY_READ_ERRORS") {
            config.dispatch.read_errors = match policy.to_ascii_lowercase().as_str() {
                "tolerate" => ReadErrorPolicy::Tolerate,
                "disconnect" => ReadErrorPolicy::Disconnect,
                _ => {
                    return Err(ConfigError::Choice {
                        var: "RELAY_READ_ERRORS",
                        expected: "tolerate|disconnect",
                        value: policy,
                    });
                }
            };
        }

        if let Some(limit) = get("RELAY_MAX_WRITES") {
            match limit.parse::<usize>() {
                Ok(n) if n > 0 => config.dispatch.max_concurrent_writes = Some(n),
                _ => {
                    return Err(ConfigError::Count {
                        var: "RELAY_MAX_WRITES",
                        value: limit,
                    });
                }
            }
        }

        Ok(config)
    }
}

fn parse_path(raw: &str) -> Result<String, ConfigError> {
    let path = raw.trim_matches('/');
    if path.is_empty() || path.contains('/') {
        return Err(ConfigError::Path {
            var: "RELAY_PATH",
            value: raw.to_owned(),
        });
    }
    Ok(path.to_owned())
}
