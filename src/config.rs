use std::env;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use clap::{App, Arg, ArgMatches};
use thiserror::Error;

pub const DEFAULT_ENDPOINT: &str = "/webhook";
pub const DEFAULT_ADDR: &str = ":4000";
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("webhook endpoint not set")]
    MissingEndpoint,
    #[error("webhook endpoint should start with '/': {0}")]
    InvalidEndpoint(String),
    #[error("webhook address not set")]
    MissingAddr,
    #[error("webhook address should look like host:port or :port: {value} ({source})")]
    InvalidAddr {
        value: String,
        #[source]
        source: io::Error,
    },
    #[error("webhook address {0} did not resolve to anything")]
    Unresolved(String),
    #[error("{name} should contain a number of seconds: {value}")]
    InvalidSeconds { name: &'static str, value: String },
    #[error("{0} should be greater than zero")]
    ZeroSeconds(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub webhook_endpoint: String,
    pub webhook_addr: SocketAddr,
    pub timeout: Duration,
    pub shutdown_grace: Duration,
}

impl Config {
    pub fn new(endpoint: &str, addr: &str) -> Result<Config, ConfigError> {
        Ok(Config {
            webhook_endpoint: parse_endpoint(endpoint)?,
            webhook_addr: parse_addr(addr)?,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            shutdown_grace: Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS),
        })
    }

    pub fn app() -> App<'static, 'static> {
        App::new("webman")
            .about("Relays runtime tasks as HTTP POST calls and webhook calls as runtime events")
            .arg(
                Arg::with_name("endpoint")
                    .long("endpoint")
                    .takes_value(true)
                    .help("Path the webhook listens on [env: WEBMAN_ENDPOINT] [default: /webhook]"),
            )
            .arg(
                Arg::with_name("addr")
                    .long("addr")
                    .takes_value(true)
                    .help("Webhook listen address, host:port or :port [env: WEBMAN_ADDR] [default: :4000]"),
            )
            .arg(
                Arg::with_name("timeout")
                    .long("timeout")
                    .takes_value(true)
                    .help("Outbound request timeout in seconds [env: WEBMAN_TIMEOUT] [default: 10]"),
            )
            .arg(
                Arg::with_name("shutdown-grace")
                    .long("shutdown-grace")
                    .takes_value(true)
                    .help("Seconds in-flight webhook calls get on shutdown [env: WEBMAN_SHUTDOWN_GRACE] [default: 10]"),
            )
    }

    /// Flags win over environment variables, which win over defaults.
    pub fn from_matches(matches: &ArgMatches) -> Result<Config, ConfigError> {
        Config::from_sources(matches, |var| env::var(var).ok())
    }

    /// Same as [`Config::from_matches`], reading variables through `lookup`.
    pub fn from_sources<F>(matches: &ArgMatches, lookup: F) -> Result<Config, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let endpoint = setting(matches, &lookup, "endpoint", "WEBMAN_ENDPOINT", DEFAULT_ENDPOINT);
        let addr = setting(matches, &lookup, "addr", "WEBMAN_ADDR", DEFAULT_ADDR);
        let timeout = setting(matches, &lookup, "timeout", "WEBMAN_TIMEOUT", "");
        let grace = setting(matches, &lookup, "shutdown-grace", "WEBMAN_SHUTDOWN_GRACE", "");

        let mut config = Config::new(&endpoint, &addr)?;
        if !timeout.is_empty() {
            config.timeout = parse_seconds("timeout", &timeout)?;
            if config.timeout == Duration::from_secs(0) {
                return Err(ConfigError::ZeroSeconds("timeout"));
            }
        }
        if !grace.is_empty() {
            config.shutdown_grace = parse_seconds("shutdown-grace", &grace)?;
        }
        Ok(config)
    }
}

fn setting<F>(matches: &ArgMatches, lookup: &F, name: &str, var: &str, default: &str) -> String
where
    F: Fn(&str) -> Option<String>,
{
    matches
        .value_of(name)
        .map(str::to_owned)
        .or_else(|| lookup(var))
        .unwrap_or_else(|| default.to_owned())
}

fn parse_endpoint(endpoint: &str) -> Result<String, ConfigError> {
    let endpoint = endpoint.trim();
    if endpoint.is_empty() {
        return Err(ConfigError::MissingEndpoint);
    }
    if !endpoint.starts_with('/') {
        return Err(ConfigError::InvalidEndpoint(endpoint.to_owned()));
    }
    Ok(endpoint.to_owned())
}

fn parse_addr(addr: &str) -> Result<SocketAddr, ConfigError> {
    let addr = addr.trim();
    if addr.is_empty() {
        return Err(ConfigError::MissingAddr);
    }
    let full = if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_owned()
    };
    // Hostnames are resolved once here; the first address wins.
    let mut resolved = full
        .to_socket_addrs()
        .map_err(|source| ConfigError::InvalidAddr {
            value: addr.to_owned(),
            source,
        })?;
    resolved
        .next()
        .ok_or_else(|| ConfigError::Unresolved(addr.to_owned()))
}

fn parse_seconds(name: &'static str, value: &str) -> Result<Duration, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|_| ConfigError::InvalidSeconds {
            name,
            value: value.to_owned(),
        })
}
