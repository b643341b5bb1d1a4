//! Session endpoint configuration

use std::time::Duration;

/// Shortest timer period; timestamps have millisecond resolution
pub const MIN_TIMER_INTERVAL: Duration = Duration::from_millis(1);

/// Session endpoint configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    /// Prefix prepended to the session code to form the moderator identity
    pub identity_prefix: String,
    /// Moderator keep-alive period per link
    pub heartbeat_interval: Duration,
    /// Contributor delay before re-joining after a lost link
    pub reconnect_delay: Duration,
    /// Participants not heard from for this long are dropped. `None` keeps
    /// them until their link closes.
    pub presence_timeout: Option<Duration>,
    /// Driver polling period
    pub poll_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            identity_prefix: "retro-app-".to_string(),
            heartbeat_interval: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(3),
            presence_timeout: Some(Duration::from_secs(15)),
            poll_interval: Duration::from_millis(50),
        }
    }
}

impl SessionConfig {
    /// Defaults overridden by `RETRO_*` environment variables.
    ///
    /// Durations use humantime syntax (`5s`, `250ms`). Invalid values are
    /// ignored with a warning.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = SessionConfig::default();

        if let Some(prefix) = lookup("RETRO_IDENTITY_PREFIX") {
            if prefix.trim().is_empty() {
                tracing::warn!("ignoring empty RETRO_IDENTITY_PREFIX");
            } else {
                config.identity_prefix = prefix.trim().to_string();
            }
        }
        if let Some(d) = duration_var(&lookup, "RETRO_HEARTBEAT_INTERVAL") {
            config.heartbeat_interval = d;
        }
        if let Some(d) = duration_var(&lookup, "RETRO_RECONNECT_DELAY") {
            config.reconnect_delay = d;
        }
        if let Some(raw) = lookup("RETRO_PRESENCE_TIMEOUT") {
            if raw.trim().eq_ignore_ascii_case("off") {
                config.presence_timeout = None;
            } else if let Some(d) = parse_duration("RETRO_PRESENCE_TIMEOUT", &raw) {
                config.presence_timeout = Some(d);
            }
        }
        if let Some(d) = duration_var(&lookup, "RETRO_POLL_INTERVAL") {
            config.poll_interval = d;
        }

        config
    }

    /// Clamped to [`MIN_TIMER_INTERVAL`]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval.max(MIN_TIMER_INTERVAL);
        self
    }

    /// Clamped to [`MIN_TIMER_INTERVAL`]
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay.max(MIN_TIMER_INTERVAL);
        self
    }

    /// Heartbeat period as scheduled, never below [`MIN_TIMER_INTERVAL`]
    pub fn heartbeat_period(&self) -> Duration {
        self.heartbeat_interval.max(MIN_TIMER_INTERVAL)
    }

    /// Reconnect delay as scheduled, never below [`MIN_TIMER_INTERVAL`]
    pub fn reconnect_period(&self) -> Duration {
        self.reconnect_delay.max(MIN_TIMER_INTERVAL)
    }

    pub fn with_presence_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.presence_timeout = timeout;
        self
    }
}

fn duration_var(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<Duration> {
    lookup(name).and_then(|raw| parse_duration(name, &raw))
}

fn parse_duration(name: &str, raw: &str) -> Option<Duration> {
    match humantime::parse_duration(raw.trim()) {
        Ok(d) if !d.is_zero() => Some(d),
        Ok(_) => {
            tracing::warn!(var = name, "ignoring zero duration");
            None
        }
        Err(e) => {
            tracing::warn!(var = name, value = raw, error = %e, "ignoring invalid duration");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.identity_prefix, "retro-app-");
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.reconnect_delay, Duration::from_secs(3));
        assert_eq!(config.presence_timeout, Some(Duration::from_secs(15)));
    }

    #[test]
    fn test_env_overrides() {
        let config = SessionConfig::from_lookup(lookup(&[
            ("RETRO_IDENTITY_PREFIX", "team-"),
            ("RETRO_HEARTBEAT_INTERVAL", "2s"),
            ("RETRO_RECONNECT_DELAY", "500ms"),
            ("RETRO_PRESENCE_TIMEOUT", "off"),
        ]));
        assert_eq!(config.identity_prefix, "team-");
        assert_eq!(config.heartbeat_interval, Duration::from_secs(2));
        assert_eq!(config.reconnect_delay, Duration::from_millis(500));
        assert_eq!(config.presence_timeout, None);
    }

    #[test]
    fn test_invalid_values_ignored() {
        let config = SessionConfig::from_lookup(lookup(&[
            ("RETRO_HEARTBEAT_INTERVAL", "soon"),
            ("RETRO_RECONNECT_DELAY", "0s"),
            ("RETRO_PRESENCE_TIMEOUT", "1m"),
        ]));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.reconnect_delay, Duration::from_secs(3));
        assert_eq!(config.presence_timeout, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_timer_periods_never_zero() {
        let built = SessionConfig::default()
            .with_heartbeat_interval(Duration::ZERO)
            .with_reconnect_delay(Duration::from_micros(200));
        assert_eq!(built.heartbeat_interval, MIN_TIMER_INTERVAL);
        assert_eq!(built.reconnect_delay, MIN_TIMER_INTERVAL);

        let mut raw = SessionConfig::default();
        raw.heartbeat_interval = Duration::ZERO;
        raw.reconnect_delay = Duration::ZERO;
        assert_eq!(raw.heartbeat_period(), MIN_TIMER_INTERVAL);
        assert_eq!(raw.reconnect_period(), MIN_TIMER_INTERVAL);
    }
}
