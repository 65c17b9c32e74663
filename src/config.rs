// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Owned configuration map passed to the stack at construction.
//!
//! Keys are dotted strings (`evs.suspect_timeout`), values are strings.
//! Durations accept an ISO-8601 subset (`PT5S`, `PT1M30S`, `P1D`) or a
//! plain decimal number of seconds.

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::time::Duration;

/// Recognized configuration keys.
pub mod keys {
    pub const BASE_HOST: &str = "base_host";
    pub const BASE_PORT: &str = "base_port";

    pub const GMCAST_VERSION: &str = "gmcast.version";
    pub const GMCAST_GROUP: &str = "gmcast.group";
    pub const GMCAST_LISTEN_ADDR: &str = "gmcast.listen_addr";
    pub const GMCAST_MCAST_ADDR: &str = "gmcast.mcast_addr";
    pub const GMCAST_MCAST_PORT: &str = "gmcast.mcast_port";
    pub const GMCAST_MCAST_TTL: &str = "gmcast.mcast_ttl";
    pub const GMCAST_PEER_ADDR: &str = "gmcast.peer_addr";
    pub const GMCAST_TIME_WAIT: &str = "gmcast.time_wait";
    pub const GMCAST_PEER_TIMEOUT: &str = "gmcast.peer_timeout";
    pub const GMCAST_MIRA: &str = "gmcast.mira";
    pub const GMCAST_SEGMENT: &str = "gmcast.segment";
    pub const GMCAST_ISOLATE: &str = "gmcast.isolate";

    pub const EVS_VERSION: &str = "evs.version";
    pub const EVS_VIEW_FORGET_TIMEOUT: &str = "evs.view_forget_timeout";
    pub const EVS_INACTIVE_TIMEOUT: &str = "evs.inactive_timeout";
    pub const EVS_SUSPECT_TIMEOUT: &str = "evs.suspect_timeout";
    pub const EVS_INACTIVE_CHECK_PERIOD: &str = "evs.inactive_check_period";
    pub const EVS_INSTALL_TIMEOUT: &str = "evs.install_timeout";
    pub const EVS_KEEPALIVE_PERIOD: &str = "evs.keepalive_period";
    pub const EVS_RETRANS_PERIOD: &str = "evs.retrans_period";
    pub const EVS_JOIN_RETRANS_PERIOD: &str = "evs.join_retrans_period";
    pub const EVS_STATS_REPORT_PERIOD: &str = "evs.stats_report_period";
    pub const EVS_CAUSAL_KEEPALIVE_PERIOD: &str = "evs.causal_keepalive_period";
    pub const EVS_DELAY_MARGIN: &str = "evs.delay_margin";
    pub const EVS_DELAYED_KEEP_PERIOD: &str = "evs.delayed_keep_period";
    pub const EVS_SEND_WINDOW: &str = "evs.send_window";
    pub const EVS_USER_SEND_WINDOW: &str = "evs.user_send_window";
    pub const EVS_USE_AGGREGATE: &str = "evs.use_aggregate";
    pub const EVS_MAX_INSTALL_TIMEOUTS: &str = "evs.max_install_timeouts";
    pub const EVS_AUTO_EVICT: &str = "evs.auto_evict";
    pub const EVS_EVICT: &str = "evs.evict";

    pub const PC_VERSION: &str = "pc.version";
    pub const PC_IGNORE_SB: &str = "pc.ignore_sb";
    pub const PC_IGNORE_QUORUM: &str = "pc.ignore_quorum";
    pub const PC_NPVO: &str = "pc.npvo";
    pub const PC_CHECKSUM: &str = "pc.checksum";
    pub const PC_BOOTSTRAP: &str = "pc.bootstrap";
    pub const PC_WAIT_PRIM: &str = "pc.wait_prim";
    pub const PC_WAIT_PRIM_TIMEOUT: &str = "pc.wait_prim_timeout";
    pub const PC_ANNOUNCE_TIMEOUT: &str = "pc.announce_timeout";
    pub const PC_LINGER: &str = "pc.linger";
    pub const PC_WEIGHT: &str = "pc.weight";
    pub const PC_RECOVERY: &str = "pc.recovery";

    pub const SOCKET_SSL: &str = "socket.ssl";
    pub const SOCKET_SSL_KEY: &str = "socket.ssl_key";
    pub const SOCKET_SSL_CERT: &str = "socket.ssl_cert";
    pub const SOCKET_SSL_CA: &str = "socket.ssl_ca";
    pub const SOCKET_SSL_CIPHER: &str = "socket.ssl_cipher";
    pub const SOCKET_SSL_PASSWORD_FILE: &str = "socket.ssl_password_file";
    pub const SOCKET_SSL_COMPRESSION: &str = "socket.ssl_compression";
    pub const SOCKET_CHECKSUM: &str = "socket.checksum";
}

const DEFAULTS: &[(&str, &str)] = &[
    (keys::BASE_HOST, ""),
    (keys::BASE_PORT, "4567"),
    (keys::GMCAST_VERSION, "0"),
    (keys::GMCAST_GROUP, ""),
    (keys::GMCAST_LISTEN_ADDR, "tcp://0.0.0.0:4567"),
    (keys::GMCAST_MCAST_ADDR, ""),
    (keys::GMCAST_MCAST_PORT, "4567"),
    (keys::GMCAST_MCAST_TTL, "1"),
    (keys::GMCAST_TIME_WAIT, "PT5S"),
    (keys::GMCAST_PEER_TIMEOUT, "PT3S"),
    (keys::GMCAST_MIRA, "30"),
    (keys::GMCAST_SEGMENT, "0"),
    (keys::GMCAST_ISOLATE, "0"),
    (keys::EVS_VERSION, "1"),
    (keys::EVS_VIEW_FORGET_TIMEOUT, "P1D"),
    (keys::EVS_INACTIVE_TIMEOUT, "PT15S"),
    (keys::EVS_SUSPECT_TIMEOUT, "PT5S"),
    (keys::EVS_INACTIVE_CHECK_PERIOD, "PT0.5S"),
    (keys::EVS_INSTALL_TIMEOUT, "PT7.5S"),
    (keys::EVS_KEEPALIVE_PERIOD, "PT1S"),
    (keys::EVS_RETRANS_PERIOD, "PT1S"),
    (keys::EVS_JOIN_RETRANS_PERIOD, "PT1S"),
    (keys::EVS_STATS_REPORT_PERIOD, "PT1M"),
    (keys::EVS_CAUSAL_KEEPALIVE_PERIOD, "PT0S"),
    (keys::EVS_DELAY_MARGIN, "PT1S"),
    (keys::EVS_DELAYED_KEEP_PERIOD, "PT30S"),
    (keys::EVS_SEND_WINDOW, "4"),
    (keys::EVS_USER_SEND_WINDOW, "2"),
    (keys::EVS_USE_AGGREGATE, "true"),
    (keys::EVS_MAX_INSTALL_TIMEOUTS, "3"),
    (keys::EVS_AUTO_EVICT, "0"),
    (keys::PC_VERSION, "0"),
    (keys::PC_IGNORE_SB, "false"),
    (keys::PC_IGNORE_QUORUM, "false"),
    (keys::PC_NPVO, "false"),
    (keys::PC_CHECKSUM, "false"),
    (keys::PC_WAIT_PRIM, "true"),
    (keys::PC_WAIT_PRIM_TIMEOUT, "PT30S"),
    (keys::PC_ANNOUNCE_TIMEOUT, "PT3S"),
    (keys::PC_LINGER, "PT20S"),
    (keys::PC_WEIGHT, "1"),
    (keys::PC_RECOVERY, "true"),
    (keys::SOCKET_CHECKSUM, "1"),
];

// Keys accepted without a default value.
const OPTIONAL: &[&str] = &[
    keys::GMCAST_PEER_ADDR,
    keys::EVS_EVICT,
    keys::PC_BOOTSTRAP,
    keys::SOCKET_SSL,
    keys::SOCKET_SSL_KEY,
    keys::SOCKET_SSL_CERT,
    keys::SOCKET_SSL_CA,
    keys::SOCKET_SSL_CIPHER,
    keys::SOCKET_SSL_PASSWORD_FILE,
    keys::SOCKET_SSL_COMPRESSION,
];

/// A time period in the ISO-8601 duration subset used by the timing keys.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct Period(Duration);

impl Period {
    pub fn new(duration: Duration) -> Self {
        Period(duration)
    }

    pub fn duration(&self) -> Duration {
        self.0
    }

    /// Parse `P[nD][T[nH][nM][n[.f]S]]` or a plain number of seconds.
    pub fn parse(s: &str) -> Result<Self> {
        let bad = || Error::InvalidConfig(format!("invalid duration: {}", s));
        let s = s.trim();
        if s.is_empty() {
            return Err(bad());
        }
        if !s.starts_with('P') {
            let secs: f64 = s.parse().map_err(|_| bad())?;
            if secs < 0.0 {
                return Err(bad());
            }
            return Ok(Period(Duration::from_secs_f64(secs)));
        }

        let mut total = 0.0f64;
        let mut in_time = false;
        let mut num = String::new();
        for c in s[1..].chars() {
            match c {
                'T' => in_time = true,
                '0'..='9' | '.' => num.push(c),
                'D' | 'H' | 'M' | 'S' => {
                    let value: f64 = num.parse().map_err(|_| bad())?;
                    num.clear();
                    total += match (c, in_time) {
                        ('D', false) => value * 86_400.0,
                        ('H', true) => value * 3_600.0,
                        ('M', true) => value * 60.0,
                        ('S', true) => value,
                        _ => return Err(bad()),
                    };
                }
                _ => return Err(bad()),
            }
        }
        if !num.is_empty() {
            return Err(bad());
        }
        Ok(Period(Duration::from_secs_f64(total)))
    }
}

impl Display for Period {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let secs = self.0.as_secs_f64();
        if secs == secs.trunc() && secs >= 86_400.0 && secs % 86_400.0 == 0.0 {
            write!(f, "P{}D", (secs / 86_400.0) as u64)
        } else {
            write!(f, "PT{}S", secs)
        }
    }
}

impl From<Duration> for Period {
    fn from(duration: Duration) -> Self {
        Period(duration)
    }
}

/// Owned key/value configuration. Unknown keys are rejected at
/// construction so that typos surface before the stack starts.
#[derive(Clone, Debug, Default)]
pub struct Config {
    entries: BTreeMap<String, String>,
}

impl Config {
    /// A configuration holding only the defaults.
    pub fn new() -> Self {
        let mut entries = BTreeMap::new();
        for (key, value) in DEFAULTS {
            let _ = entries.insert((*key).to_string(), (*value).to_string());
        }
        Config { entries }
    }

    /// Build from user supplied overrides on top of the defaults.
    pub fn with_overrides<I, K, V>(overrides: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::new();
        for (key, value) in overrides {
            config.set(key.as_ref(), value.as_ref())?;
        }
        Ok(config)
    }

    pub fn is_known(key: &str) -> bool {
        DEFAULTS.iter().any(|(k, _)| *k == key) || OPTIONAL.contains(&key)
    }

    /// Set a value, rejecting unrecognized keys.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        if !Self::is_known(key) {
            return Err(Error::UnknownParameter(key.to_string()));
        }
        let _ = self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    fn require(&self, key: &str) -> Result<&str> {
        self.get(key)
            .ok_or_else(|| Error::InvalidConfig(format!("missing key: {}", key)))
    }

    pub fn get_bool(&self, key: &str) -> Result<bool> {
        match self.require(key)? {
            "true" | "yes" | "1" => Ok(true),
            "false" | "no" | "0" => Ok(false),
            other => Err(Error::InvalidConfig(format!(
                "{}: invalid boolean: {}",
                key, other
            ))),
        }
    }

    pub fn get_u32(&self, key: &str) -> Result<u32> {
        let value = self.require(key)?;
        value
            .parse()
            .map_err(|_| Error::InvalidConfig(format!("{}: invalid integer: {}", key, value)))
    }

    pub fn get_i64(&self, key: &str) -> Result<i64> {
        let value = self.require(key)?;
        value
            .parse()
            .map_err(|_| Error::InvalidConfig(format!("{}: invalid integer: {}", key, value)))
    }

    pub fn get_u8(&self, key: &str) -> Result<u8> {
        let value = self.require(key)?;
        value
            .parse()
            .map_err(|_| Error::InvalidConfig(format!("{}: invalid integer: {}", key, value)))
    }

    pub fn get_duration(&self, key: &str) -> Result<Duration> {
        Period::parse(self.require(key)?).map(|p| p.duration())
    }

    /// Snapshot of the effective configuration for status reporting.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn defaults_are_present() -> anyhow::Result<()> {
        let config = Config::new();
        assert_eq!(config.get_duration(keys::EVS_SUSPECT_TIMEOUT)?.as_secs(), 5);
        assert_eq!(config.get_u32(keys::EVS_SEND_WINDOW)?, 4);
        assert!(!config.get_bool(keys::PC_NPVO)?);
        Ok(())
    }

    #[test]
    fn unknown_key_rejected() {
        let mut config = Config::new();
        assert_matches!(
            config.set("evs.suspect_timeuot", "PT1S"),
            Err(Error::UnknownParameter(_))
        );
    }

    #[test]
    fn period_parsing() -> anyhow::Result<()> {
        assert_eq!(Period::parse("PT5S")?.duration(), Duration::from_secs(5));
        assert_eq!(
            Period::parse("PT0.5S")?.duration(),
            Duration::from_millis(500)
        );
        assert_eq!(
            Period::parse("PT1M30S")?.duration(),
            Duration::from_secs(90)
        );
        assert_eq!(Period::parse("P1D")?.duration(), Duration::from_secs(86_400));
        assert_eq!(Period::parse("30")?.duration(), Duration::from_secs(30));
        assert!(Period::parse("five seconds").is_err());
        assert!(Period::parse("PT5X").is_err());
        Ok(())
    }

    #[test]
    fn period_display_round_trip() -> anyhow::Result<()> {
        for s in &["PT5S", "PT0.5S", "P1D", "PT90S"] {
            let period = Period::parse(s)?;
            assert_eq!(Period::parse(&period.to_string())?, period);
        }
        Ok(())
    }

    #[test]
    fn overrides_apply() -> anyhow::Result<()> {
        let config =
            Config::with_overrides(vec![("evs.send_window", "16"), ("pc.weight", "3")])?;
        assert_eq!(config.get_u32(keys::EVS_SEND_WINDOW)?, 16);
        assert_eq!(config.get_i64(keys::PC_WEIGHT)?, 3);
        Ok(())
    }
}
