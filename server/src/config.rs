//! Command-line and environment configuration.

use crate::auth::TokenVerifier;
use crate::scheduler::ScheduleConfig;
use chrono::FixedOffset;
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use thiserror::Error;
use vivid_abuse::AbuseEngineConfig;
use vivid_types::TrialPolicy;

#[derive(Parser, Debug, Clone)]
#[command(name = "vivid-server")]
#[command(about = "Vivid entitlement server", version)]
pub struct Args {
    /// Address to bind the HTTP API to
    #[arg(long, env = "VIVID_BIND", default_value = "0.0.0.0")]
    pub bind: IpAddr,

    /// HTTP API port
    #[arg(short, long, env = "VIVID_PORT", default_value = "8080")]
    pub port: u16,

    /// Path to the registry database
    #[arg(short, long, env = "VIVID_DATABASE", default_value = "vivid-registry.db")]
    pub database: PathBuf,

    /// Hex-encoded Ed25519 public key for app attestation tokens
    #[arg(long, env = "VIVID_ATTESTATION_KEY")]
    pub attestation_key: String,

    /// Hex-encoded Ed25519 public key for session tokens
    #[arg(long, env = "VIVID_SESSION_KEY")]
    pub session_key: String,

    /// App id expected in attestation tokens
    #[arg(long, env = "VIVID_APP_ID", default_value = "ai.vivid.app")]
    pub app_id: String,

    /// Trial length in days
    #[arg(long, env = "VIVID_TRIAL_DAYS", default_value_t = 3)]
    pub trial_days: i64,

    /// Generation cap for limited trials
    #[arg(long, env = "VIVID_LIMITED_MAX_GENERATIONS", default_value_t = 3)]
    pub limited_max_generations: u32,

    /// Generation cap for freemium trials
    #[arg(long, env = "VIVID_FREEMIUM_MAX_GENERATIONS", default_value_t = 1)]
    pub freemium_max_generations: u32,

    /// Server local time as an offset from UTC in hours
    #[arg(long, env = "VIVID_UTC_OFFSET_HOURS", default_value_t = 0, allow_hyphen_values = true)]
    pub utc_offset_hours: i32,

    /// Do not run the expiry sweep and weekly report
    #[arg(long)]
    pub no_scheduler: bool,

    /// Enable verbose debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid {name} key: {reason}")]
    InvalidKey { name: &'static str, reason: String },

    #[error("UTC offset out of range: {0}h")]
    InvalidOffset(i32),

    #[error("invalid trial policy: {0}")]
    InvalidPolicy(String),
}

/// Validated server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub database: PathBuf,
    pub verifier: TokenVerifier,
    pub policy: TrialPolicy,
    pub offset: FixedOffset,
    pub run_scheduler: bool,
    pub verbose: bool,
}

impl ServerConfig {
    #[must_use]
    pub fn engine_config(&self) -> AbuseEngineConfig {
        AbuseEngineConfig {
            server_offset: self.offset,
            ..AbuseEngineConfig::default()
        }
    }

    #[must_use]
    pub fn schedule_config(&self) -> ScheduleConfig {
        ScheduleConfig {
            offset: self.offset,
            ..ScheduleConfig::default()
        }
    }
}

impl TryFrom<Args> for ServerConfig {
    type Error = ConfigError;

    fn try_from(args: Args) -> Result<Self, Self::Error> {
        let attestation = parse_key("attestation", &args.attestation_key)?;
        let session = parse_key("session", &args.session_key)?;
        let verifier = TokenVerifier::from_bytes(&attestation, &session, args.app_id).map_err(
            |e| ConfigError::InvalidKey {
                name: "public",
                reason: e.to_string(),
            },
        )?;

        if args.trial_days <= 0 {
            return Err(ConfigError::InvalidPolicy(format!(
                "trial length must be positive, got {} days",
                args.trial_days
            )));
        }
        let offset = (-14..=14)
            .contains(&args.utc_offset_hours)
            .then(|| FixedOffset::east_opt(args.utc_offset_hours * 3600))
            .flatten()
            .ok_or(ConfigError::InvalidOffset(args.utc_offset_hours))?;

        Ok(Self {
            listen: SocketAddr::new(args.bind, args.port),
            database: args.database,
            verifier,
            policy: TrialPolicy {
                duration_days: args.trial_days,
                limited_max_generations: args.limited_max_generations,
                freemium_max_generations: args.freemium_max_generations,
            },
            offset,
            run_scheduler: !args.no_scheduler,
            verbose: args.verbose,
        })
    }
}

fn parse_key(name: &'static str, hex_key: &str) -> Result<[u8; 32], ConfigError> {
    let bytes = hex::decode(hex_key.trim()).map_err(|e| ConfigError::InvalidKey {
        name,
        reason: e.to_string(),
    })?;
    bytes.try_into().map_err(|b: Vec<u8>| ConfigError::InvalidKey {
        name,
        reason: format!("expected 32 bytes, got {}", b.len()),
    })
}
