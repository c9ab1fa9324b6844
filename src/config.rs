use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;

#[derive(Deserialize, Debug, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: Server,
    #[serde(default)]
    pub log: Log,
}

#[derive(Deserialize, Debug)]
pub struct Server {
    #[serde(default = "default_bind_ip")]
    pub bind_ip: String,
    #[serde(default = "default_rest_port")]
    pub rest_port: u16,
    #[serde(default = "default_grpc_port")]
    pub grpc_port: u16,
}

#[derive(Deserialize, Debug, Default)]
pub struct Log {
    #[serde(default)]
    pub json: bool,
    #[serde(default)]
    pub verbose: u8,
}

fn default_bind_ip() -> String {
    String::from("0.0.0.0")
}
fn default_rest_port() -> u16 {
    8090
}
fn default_grpc_port() -> u16 {
    9090
}

impl Default for Server {
    fn default() -> Self {
        Server {
            bind_ip: default_bind_ip(),
            rest_port: default_rest_port(),
            grpc_port: default_grpc_port(),
        }
    }
}

impl AppConfig {
    pub fn rest_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.server.bind_ip, self.server.rest_port)
            .parse()
            .with_context(|| format!("invalid bind address {:?}", self.server.bind_ip))
    }

    pub fn grpc_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.server.bind_ip, self.server.grpc_port)
            .parse()
            .with_context(|| format!("invalid bind address {:?}", self.server.bind_ip))
    }
}

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    #[arg(short, long, default_value = "config.toml")]
    pub config: String,

    #[arg(long)]
    pub bind_ip: Option<String>,

    #[arg(long)]
    pub rest_port: Option<u16>,

    #[arg(long)]
    pub grpc_port: Option<u16>,

    /// Emit JSON formatted logs
    #[arg(short = 'j', long)]
    pub json_logs: bool,

    /// Verbose logging (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

pub fn load_config() -> Result<AppConfig> {
    merge(CliArgs::parse())
}

fn merge(cli: CliArgs) -> Result<AppConfig> {
    let mut config = AppConfig::default();

    if Path::new(&cli.config).exists() {
        let contents = fs::read_to_string(&cli.config)
            .with_context(|| format!("failed to read config file {:?}", cli.config))?;
        config = toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file {:?}", cli.config))?;
    }

    if let Some(bind_ip) = cli.bind_ip {
        config.server.bind_ip = bind_ip;
    }
    if let Some(rest_port) = cli.rest_port {
        config.server.rest_port = rest_port;
    }
    if let Some(grpc_port) = cli.grpc_port {
        config.server.grpc_port = grpc_port;
    }
    if cli.json_logs {
        config.log.json = true;
    }
    if cli.verbose > 0 {
        config.log.verbose = cli.verbose;
    }

    Ok(config)
}
