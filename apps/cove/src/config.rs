use std::env;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:8000/ws/sessions";
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Coarse link-quality signal used to size the channel-open timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetworkHint {
    Fast,
    #[default]
    Unknown,
    Slow,
}

impl FromStr for NetworkHint {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "fast" | "4g" | "5g" | "wifi" | "ethernet" => Ok(NetworkHint::Fast),
            "unknown" | "" => Ok(NetworkHint::Unknown),
            "slow" | "slow-2g" | "2g" | "3g" => Ok(NetworkHint::Slow),
            other => Err(format!("unknown network hint '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SignalingConfig {
    /// Base websocket URL; the token and participant id are appended per session.
    pub relay_url: String,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub max_reconnect_attempts: u32,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            max_reconnect_attempts: 10,
        }
    }
}

impl SignalingConfig {
    /// Backoff before reconnect `attempt` (1-based). The exponent stops growing at 6.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.clamp(1, 6) - 1;
        let scaled = self
            .reconnect_base_delay
            .saturating_mul(1u32 << exponent);
        scaled.min(self.reconnect_max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub ice_servers: Vec<String>,
    pub network_hint: NetworkHint,
    pub fast_channel_timeout: Duration,
    pub default_channel_timeout: Duration,
    pub slow_channel_timeout: Duration,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            network_hint: NetworkHint::Unknown,
            fast_channel_timeout: Duration::from_secs(10),
            default_channel_timeout: Duration::from_secs(15),
            slow_channel_timeout: Duration::from_secs(30),
        }
    }
}

impl PeerConfig {
    pub fn channel_timeout(&self) -> Duration {
        match self.network_hint {
            NetworkHint::Fast => self.fast_channel_timeout,
            NetworkHint::Unknown => self.default_channel_timeout,
            NetworkHint::Slow => self.slow_channel_timeout,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub signaling: SignalingConfig,
    pub peer: PeerConfig,
    pub negotiation_debounce: Duration,
    pub capability_retry_interval: Duration,
    pub capability_retry_limit: u32,
    /// Host retry `n` waits `n * ice_retry_step`.
    pub ice_retry_step: Duration,
    pub ice_retry_limit: u32,
    pub guest_recovery_delay: Duration,
    /// When false the session announces `supportsEncryption: false` and sends plaintext.
    pub encryption: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            signaling: SignalingConfig::default(),
            peer: PeerConfig::default(),
            negotiation_debounce: Duration::from_millis(500),
            capability_retry_interval: Duration::from_secs(2),
            capability_retry_limit: 5,
            ice_retry_step: Duration::from_secs(2),
            ice_retry_limit: 3,
            guest_recovery_delay: Duration::from_secs(2),
            encryption: true,
        }
    }
}

impl SessionConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup; unset or unparsable keys keep defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let millis = |key: &str| {
            lookup(key)
                .and_then(|raw| raw.trim().parse::<u64>().ok())
                .map(Duration::from_millis)
        };
        let count = |key: &str| lookup(key).and_then(|raw| raw.trim().parse::<u32>().ok());

        if let Some(url) = lookup("COVE_RELAY_URL").filter(|value| !value.trim().is_empty()) {
            config.signaling.relay_url = url.trim().trim_end_matches('/').to_string();
        }
        if let Some(delay) = millis("COVE_RECONNECT_BASE_MS") {
            config.signaling.reconnect_base_delay = delay;
        }
        if let Some(delay) = millis("COVE_RECONNECT_MAX_MS") {
            config.signaling.reconnect_max_delay = delay;
        }
        if let Some(attempts) = count("COVE_RECONNECT_ATTEMPTS") {
            config.signaling.max_reconnect_attempts = attempts;
        }
        if let Some(servers) = lookup("COVE_ICE_SERVERS") {
            config.peer.ice_servers = servers
                .split(',')
                .map(str::trim)
                .filter(|server| !server.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(hint) = lookup("COVE_NETWORK_HINT").and_then(|raw| raw.parse().ok()) {
            config.peer.network_hint = hint;
        }
        if let Some(delay) = millis("COVE_NEGOTIATION_DEBOUNCE_MS") {
            config.negotiation_debounce = delay;
        }
        if let Some(limit) = count("COVE_ICE_RETRY_LIMIT") {
            config.ice_retry_limit = limit;
        }
        if let Some(delay) = millis("COVE_GUEST_RECOVERY_MS") {
            config.guest_recovery_delay = delay;
        }
        if lookup("COVE_DISABLE_ENCRYPTION").is_some_and(|raw| raw != "0" && !raw.is_empty()) {
            config.encryption = false;
        }
        config
    }
}
