use crate::error::ConfigError;
use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Path prefix of the local tools event stream
pub const LOCAL_TOOLS_SSE_PATH: &str = "/sse";
/// Path prefix of the local tools message endpoint
pub const LOCAL_TOOLS_MESSAGE_PATH: &str = "/messages";
/// Event stream sub-path served by every adapter
pub const ADAPTER_SSE_PATH: &str = "/sse";
/// Message sub-path served by every adapter
pub const ADAPTER_MESSAGE_PATH: &str = "/message";

/// Server names that would shadow the local tools routes
const RESERVED_NAMES: &[&str] = &["sse", "messages"];

/// One entry under `mcpServers` as written in the server list
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ServerEntry {
    /// Executable that speaks MCP over stdio
    pub command: String,

    /// Arguments passed to the executable
    #[serde(default, deserialize_with = "null_as_default")]
    pub args: Vec<String>,

    /// Extra environment variables, merged over the gateway's environment
    #[serde(default, deserialize_with = "null_as_default")]
    pub env: HashMap<String, String>,
}

/// Treat an explicit `null` like a missing field
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// `mcpServers` entries in document order
#[derive(Debug, Default)]
struct OrderedServers(Vec<(String, ServerEntry)>);

impl<'de> Deserialize<'de> for OrderedServers {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ServersVisitor;

        impl<'de> Visitor<'de> for ServersVisitor {
            type Value = OrderedServers;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a mapping of server name to {command, args, env}")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut servers: Vec<(String, ServerEntry)> =
                    Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((name, entry)) = map.next_entry::<String, ServerEntry>()? {
                    if servers.iter().any(|(existing, _)| *existing == name) {
                        return Err(de::Error::custom(format!(
                            "server '{}' is defined more than once",
                            name
                        )));
                    }
                    servers.push((name, entry));
                }
                Ok(OrderedServers(servers))
            }
        }

        deserializer.deserialize_map(ServersVisitor)
    }
}

#[derive(Debug, Deserialize)]
struct ServerListDocument {
    #[serde(rename = "mcpServers", default)]
    mcp_servers: Option<OrderedServers>,
}

/// A validated backend, ready to be assigned a port and spawned
#[derive(Debug, Clone, PartialEq)]
pub struct BackendSpec {
    /// Lower-cased, URL-safe identifier, also the route segment
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

impl BackendSpec {
    /// Build a spec from a raw entry, normalizing and validating the name
    pub fn from_entry(raw_name: &str, entry: ServerEntry) -> Result<Self, ConfigError> {
        let name = normalize_name(raw_name)?;
        if entry.command.trim().is_empty() {
            return Err(ConfigError::EmptyCommand {
                name: raw_name.to_string(),
            });
        }
        Ok(Self {
            name,
            command: entry.command,
            args: entry.args,
            env: entry.env,
        })
    }

    /// Executable followed by its arguments
    pub fn command_line(&self) -> Vec<String> {
        std::iter::once(self.command.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }

    /// The native command line as a single shell-quoted string
    pub fn command_string(&self) -> String {
        shell_words::join(self.command_line())
    }

    /// Public event stream path, e.g. `/weather/sse`
    pub fn sse_path(&self) -> String {
        format!("/{}{}", self.name, ADAPTER_SSE_PATH)
    }

    /// Public message path, e.g. `/weather/message`
    pub fn message_path(&self) -> String {
        format!("/{}{}", self.name, ADAPTER_MESSAGE_PATH)
    }
}

/// Lower-case a server name and check it can be used as a URL path segment
pub fn normalize_name(raw: &str) -> Result<String, ConfigError> {
    let valid = !raw.is_empty()
        && raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    // "." and ".." are resolved away by clients before they reach us
    if !valid || raw.chars().all(|c| c == '.') {
        return Err(ConfigError::InvalidName {
            name: raw.to_string(),
        });
    }

    let normalized = raw.to_ascii_lowercase();
    if RESERVED_NAMES.contains(&normalized.as_str()) {
        return Err(ConfigError::ReservedName {
            name: raw.to_string(),
            normalized,
        });
    }
    Ok(normalized)
}

/// Loader for the `mcpServers` document
pub struct ServerList;

impl ServerList {
    /// Load and validate the server list. Files ending in `.toml` are read as
    /// TOML, everything else as JSON.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Vec<BackendSpec>, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound {
                path: path.to_path_buf(),
            });
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;

        let is_toml = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("toml"))
            .unwrap_or(false);
        if is_toml {
            Self::parse_toml(path, &content)
        } else {
            Self::parse_json(path, &content)
        }
    }

    /// Parse a JSON server list. `origin` is only used in error messages.
    pub fn parse_json(origin: &Path, content: &str) -> Result<Vec<BackendSpec>, ConfigError> {
        let document: ServerListDocument =
            serde_json::from_str(content).map_err(|e| ConfigError::InvalidJson {
                path: origin.to_path_buf(),
                message: e.to_string(),
            })?;
        Self::validate(origin, document)
    }

    /// Parse a TOML server list (`[mcpServers.<name>]` tables)
    pub fn parse_toml(origin: &Path, content: &str) -> Result<Vec<BackendSpec>, ConfigError> {
        let document: ServerListDocument =
            toml::from_str(content).map_err(|e| ConfigError::InvalidToml {
                path: origin.to_path_buf(),
                message: e.to_string(),
            })?;
        Self::validate(origin, document)
    }

    fn validate(
        origin: &Path,
        document: ServerListDocument,
    ) -> Result<Vec<BackendSpec>, ConfigError> {
        let OrderedServers(entries) = document.mcp_servers.unwrap_or_default();
        if entries.is_empty() {
            return Err(ConfigError::NoServers {
                path: origin.to_path_buf(),
            });
        }

        let mut specs: Vec<BackendSpec> = Vec::with_capacity(entries.len());
        let mut raw_names: Vec<String> = Vec::with_capacity(entries.len());
        for (raw_name, entry) in entries {
            let spec = BackendSpec::from_entry(&raw_name, entry)?;
            if let Some(pos) = specs.iter().position(|s| s.name == spec.name) {
                return Err(ConfigError::DuplicateName {
                    first: raw_names[pos].clone(),
                    second: raw_name,
                    normalized: spec.name,
                });
            }
            raw_names.push(raw_name);
            specs.push(spec);
        }
        Ok(specs)
    }
}

/// Gateway settings taken from the environment
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    /// Externally facing HTTP port (`PORT`)
    pub listen_port: u16,
    /// Listener bind address (`BIND_ADDRESS`)
    pub bind: String,
    /// First port handed to adapters (`BASE_INTERNAL_PORT`)
    pub base_internal_port: u16,
    /// Port of the local tools process (`PYTHON_SERVER_PORT`)
    pub local_tools_port: u16,
    /// Location of the server list (`MCP_CONFIG`, or the first CLI argument)
    pub config_path: PathBuf,
    /// Adapter program and its leading arguments (`ADAPTER_COMMAND`)
    pub adapter_command: Vec<String>,
    /// Local tools command line (`LOCAL_TOOLS_COMMAND`)
    pub local_tools_command: Vec<String>,
    /// Whether to spawn the local tools process (`LOCAL_TOOLS_ENABLED`)
    pub local_tools_enabled: bool,
    /// Time between SIGTERM and SIGKILL on shutdown (`SHUTDOWN_GRACE_PERIOD_SECS`)
    pub shutdown_grace_period: Duration,
    /// Loopback diagnostics port, 0 disables it (`ADMIN_PORT`)
    pub admin_port: u16,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            bind: default_bind_address(),
            base_internal_port: default_base_internal_port(),
            local_tools_port: default_local_tools_port(),
            config_path: PathBuf::from(default_config_path()),
            adapter_command: split_default(default_adapter_command()),
            local_tools_command: split_default(default_local_tools_command()),
            local_tools_enabled: true,
            shutdown_grace_period: Duration::from_secs(default_shutdown_grace_period()),
            admin_port: 0,
        }
    }
}

impl GatewaySettings {
    /// Read settings from the process environment
    pub fn from_env(cli_config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok(), cli_config_path)
    }

    /// Read settings through `lookup`, which returns the value of a variable if set
    pub fn from_lookup<F>(lookup: F, cli_config_path: Option<PathBuf>) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config_path = cli_config_path
            .or_else(|| lookup("MCP_CONFIG").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(default_config_path()));

        Ok(Self {
            listen_port: parse_setting(&lookup, "PORT", default_listen_port(), "a port number")?,
            bind: lookup("BIND_ADDRESS").unwrap_or_else(default_bind_address),
            base_internal_port: parse_setting(
                &lookup,
                "BASE_INTERNAL_PORT",
                default_base_internal_port(),
                "a port number",
            )?,
            local_tools_port: parse_setting(
                &lookup,
                "PYTHON_SERVER_PORT",
                default_local_tools_port(),
                "a port number",
            )?,
            config_path,
            adapter_command: parse_command(&lookup, "ADAPTER_COMMAND", default_adapter_command())?,
            local_tools_command: parse_command(
                &lookup,
                "LOCAL_TOOLS_COMMAND",
                default_local_tools_command(),
            )?,
            local_tools_enabled: parse_setting(&lookup, "LOCAL_TOOLS_ENABLED", true, "true or false")?,
            shutdown_grace_period: Duration::from_secs(parse_setting(
                &lookup,
                "SHUTDOWN_GRACE_PERIOD_SECS",
                default_shutdown_grace_period(),
                "a whole number of seconds",
            )?),
            admin_port: parse_setting(&lookup, "ADMIN_PORT", 0, "a port number (0 disables)")?,
        })
    }
}

fn parse_setting<F, T>(
    lookup: &F,
    var: &'static str,
    default: T,
    expected: &'static str,
) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(var) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidSetting {
                var,
                value,
                expected,
            }),
        None => Ok(default),
    }
}

fn parse_command<F>(
    lookup: &F,
    var: &'static str,
    default: &str,
) -> Result<Vec<String>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(value) = lookup(var) else {
        return Ok(split_default(default));
    };
    match shell_words::split(&value) {
        Ok(words) if !words.is_empty() => Ok(words),
        _ => Err(ConfigError::InvalidSetting {
            var,
            value,
            expected: "a non-empty command line",
        }),
    }
}

fn split_default(command: &str) -> Vec<String> {
    command.split_whitespace().map(String::from).collect()
}

// Default value functions
fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_base_internal_port() -> u16 {
    8100
}

fn default_local_tools_port() -> u16 {
    8000
}

fn default_config_path() -> &'static str {
    "mcp.json"
}

fn default_adapter_command() -> &'static str {
    "npx -y supergateway"
}

fn default_local_tools_command() -> &'static str {
    "python server/start_mcp.py"
}

fn default_shutdown_grace_period() -> u64 {
    5
}
