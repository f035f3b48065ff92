use crate::membership::{HostLeave, MembershipPolicy};

const DEFAULT_PORT: u16 = 4010;
const DEFAULT_READINESS_INTERVAL_SECS: u64 = 15;

/// Session API configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the HTTP server binds to.
    pub port: u16,
    /// PostgreSQL connection string. The in-memory store is used when unset.
    pub database_url: Option<String>,
    /// Redis connection string for the token store. In-memory when unset.
    pub redis_url: Option<String>,
    /// Gateway URL handed out with WS tickets.
    pub public_ws_url: String,
    pub host_occupies_slot: bool,
    pub host_leave: HostLeave,
    /// How often the readiness task looks for due sessions.
    pub readiness_interval_secs: u64,
    /// Enables `POST /api/v1/auth/dev-login`.
    pub dev_login_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        let policy = MembershipPolicy::default();
        Self {
            port: DEFAULT_PORT,
            database_url: None,
            redis_url: None,
            public_ws_url: default_ws_url(DEFAULT_PORT),
            host_occupies_slot: policy.host_occupies_slot,
            host_leave: policy.host_leave,
            readiness_interval_secs: DEFAULT_READINESS_INTERVAL_SECS,
            dev_login_enabled: false,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let port = match var("PORT") {
            Some(v) => v.parse::<u16>().map_err(|_| format!("PORT must be a port number, got `{v}`"))?,
            None => defaults.port,
        };
        let host_occupies_slot = match var("HOST_OCCUPIES_SLOT") {
            Some(v) => parse_bool("HOST_OCCUPIES_SLOT", &v)?,
            None => defaults.host_occupies_slot,
        };
        let host_leave = match var("HOST_LEAVE_POLICY") {
            Some(v) => v.parse::<HostLeave>()?,
            None => defaults.host_leave,
        };
        let readiness_interval_secs = match var("READINESS_INTERVAL_SECS") {
            Some(v) => match v.parse::<u64>() {
                Ok(secs) if secs > 0 => secs,
                _ => return Err(format!("READINESS_INTERVAL_SECS must be a positive integer, got `{v}`")),
            },
            None => defaults.readiness_interval_secs,
        };
        let dev_login_enabled = match var("DEV_LOGIN_ENABLED") {
            Some(v) => parse_bool("DEV_LOGIN_ENABLED", &v)?,
            None => defaults.dev_login_enabled,
        };

        Ok(Self {
            port,
            database_url: var("DATABASE_URL"),
            redis_url: var("REDIS_URL"),
            public_ws_url: var("PUBLIC_WS_URL").unwrap_or_else(|| default_ws_url(port)),
            host_occupies_slot,
            host_leave,
            readiness_interval_secs,
            dev_login_enabled,
        })
    }

    pub fn policy(&self) -> MembershipPolicy {
        MembershipPolicy {
            host_occupies_slot: self.host_occupies_slot,
            host_leave: self.host_leave,
        }
    }
}

fn default_ws_url(port: u16) -> String {
    format!("ws://localhost:{port}/gateway")
}

fn parse_bool(name: &str, value: &str) -> Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        _ => Err(format!("{name} must be true or false, got `{value}`")),
    }
}
