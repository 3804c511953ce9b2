//! Per-path configuration template.
//!
//! A [`PathConf`] describes how a path name (or a family of names, when
//! the template is a regex or the wildcard) behaves: where its media
//! comes from, who may publish and read, on-demand timings, and the hook
//! commands bracketing its lifecycle.

use std::net::IpAddr;
use std::time::Duration;

use crate::conf::matcher::check_path_name;
use crate::error::{CoreError, Result};

/// Where a path's media comes from.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(try_from = "String")]
pub enum Source {
    /// An external publisher session must provide the media.
    Publisher,
    /// The media is pulled from an upstream URL or device.
    Upstream(String),
}

impl Source {
    /// Whether the source is an upstream pulled by the core.
    pub fn is_static(&self) -> bool {
        matches!(self, Source::Upstream(_))
    }
}

impl TryFrom<String> for Source {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self> {
        if s.is_empty() {
            return Err(CoreError::Conf("'source' cannot be empty".into()));
        }
        if s == "publisher" {
            return Ok(Source::Publisher);
        }
        Ok(Source::Upstream(s))
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Source::Publisher => write!(f, "publisher"),
            Source::Upstream(url) => write!(f, "{}", url),
        }
    }
}

/// An IPv4/IPv6 network in CIDR notation, or a single host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(try_from = "String")]
pub struct IpNetwork {
    addr: IpAddr,
    prefix: u8,
}

impl IpNetwork {
    /// Whether the network contains the given address.
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u32::MAX << (32 - u32::from(self.prefix))
                };
                (u32::from(net) & mask) == (u32::from(ip) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u128::MAX << (128 - u32::from(self.prefix))
                };
                (u128::from(net) & mask) == (u128::from(ip) & mask)
            }
            _ => false,
        }
    }
}

impl TryFrom<String> for IpNetwork {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl std::str::FromStr for IpNetwork {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || CoreError::Conf(format!("invalid IP or network '{}'", s));

        match s.split_once('/') {
            Some((addr, prefix)) => {
                let addr: IpAddr = addr.parse().map_err(|_| invalid())?;
                let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
                let max = if addr.is_ipv4() { 32 } else { 128 };
                if prefix > max {
                    return Err(invalid());
                }
                Ok(Self { addr, prefix })
            }
            None => {
                let addr: IpAddr = s.parse().map_err(|_| invalid())?;
                let prefix = if addr.is_ipv4() { 32 } else { 128 };
                Ok(Self { addr, prefix })
            }
        }
    }
}

/// Whether any of the networks contains the address. An empty list
/// allows everything.
pub(crate) fn ip_allowed(networks: &[IpNetwork], ip: IpAddr) -> bool {
    networks.is_empty() || networks.iter().any(|n| n.contains(ip))
}

fn default_on_demand_timeout() -> Duration {
    Duration::from_secs(10)
}

mod duration_secs {
    //! Serde helper: durations expressed as (possibly fractional) seconds.

    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(de)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom("duration must be non-negative"));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}

/// A path configuration template.
///
/// The name may be a literal ("cam1"), a regex ("~^cam[0-9]+$"), or one
/// of the wildcard aliases `all`, `all_others` and `~^.*$` (which are the
/// same thing and cannot coexist).
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct PathConf {
    /// Template name; filled by [`PathConfSet`](crate::conf::PathConfSet)
    /// from the map key.
    #[serde(skip)]
    pub name: String,

    /// Source of the path's media.
    pub source: Source,

    /// Pull the upstream source only while readers are present.
    pub source_on_demand: bool,

    /// How long an on-demand upstream source may take to become ready.
    #[serde(deserialize_with = "duration_secs::deserialize")]
    pub source_on_demand_start_timeout: Duration,

    /// How long an on-demand upstream source stays up after the last
    /// reader leaves.
    #[serde(deserialize_with = "duration_secs::deserialize")]
    pub source_on_demand_close_after: Duration,

    /// Maximum simultaneous readers, 0 = unlimited.
    pub max_readers: usize,

    /// Record the path. Recording itself happens outside the core; the
    /// flag participates in reload compatibility.
    pub record: bool,

    /// Allow a new publisher to evict the current one.
    pub override_publisher: bool,

    /// User required to publish, empty = none.
    pub publish_user: String,
    /// Password required to publish.
    pub publish_pass: String,
    /// Networks allowed to publish, empty = all.
    pub publish_ips: Vec<IpNetwork>,

    /// User required to read, empty = none.
    pub read_user: String,
    /// Password required to read.
    pub read_pass: String,
    /// Networks allowed to read, empty = all.
    pub read_ips: Vec<IpNetwork>,

    /// Command run when the path is created.
    pub run_on_init: String,
    /// Respawn `run_on_init` when it exits.
    pub run_on_init_restart: bool,

    /// Command run when a reader requests the path and no one is
    /// publishing; expected to publish to the path.
    pub run_on_demand: String,
    /// Respawn `run_on_demand` when it exits.
    pub run_on_demand_restart: bool,
    /// How long `run_on_demand` may take to start publishing.
    #[serde(deserialize_with = "duration_secs::deserialize")]
    pub run_on_demand_start_timeout: Duration,
    /// How long `run_on_demand` stays up after the last reader leaves.
    #[serde(deserialize_with = "duration_secs::deserialize")]
    pub run_on_demand_close_after: Duration,
    /// Command run when the demand ends.
    pub run_on_un_demand: String,

    /// Command run when the path becomes ready.
    pub run_on_ready: String,
    /// Respawn `run_on_ready` while the path stays ready.
    pub run_on_ready_restart: bool,
    /// Command run when the path stops being ready.
    pub run_on_not_ready: String,

    /// Command run when a reader attaches.
    pub run_on_read: String,
    /// Respawn `run_on_read` while the reader stays attached.
    pub run_on_read_restart: bool,
    /// Command run when a reader detaches.
    pub run_on_unread: String,
}

impl Default for PathConf {
    fn default() -> Self {
        Self {
            name: String::new(),
            source: Source::Publisher,
            source_on_demand: false,
            source_on_demand_start_timeout: default_on_demand_timeout(),
            source_on_demand_close_after: default_on_demand_timeout(),
            max_readers: 0,
            record: false,
            override_publisher: true,
            publish_user: String::new(),
            publish_pass: String::new(),
            publish_ips: Vec::new(),
            read_user: String::new(),
            read_pass: String::new(),
            read_ips: Vec::new(),
            run_on_init: String::new(),
            run_on_init_restart: false,
            run_on_demand: String::new(),
            run_on_demand_restart: false,
            run_on_demand_start_timeout: default_on_demand_timeout(),
            run_on_demand_close_after: default_on_demand_timeout(),
            run_on_un_demand: String::new(),
            run_on_ready: String::new(),
            run_on_ready_restart: false,
            run_on_not_ready: String::new(),
            run_on_read: String::new(),
            run_on_read_restart: false,
            run_on_unread: String::new(),
        }
    }
}

impl PathConf {
    /// Whether the template name is a regex pattern.
    pub fn is_pattern(&self) -> bool {
        self.name.starts_with('~')
    }

    /// Whether the template name is one of the wildcard aliases.
    pub fn is_wildcard(&self) -> bool {
        matches!(self.name.as_str(), "all" | "all_others" | "~^.*$")
    }

    /// Whether the path pulls its media from an upstream source.
    pub fn has_static_source(&self) -> bool {
        self.source.is_static()
    }

    /// Whether an on-demand trigger exists for this path: either an
    /// on-demand upstream source or a `run_on_demand` command.
    pub fn has_on_demand(&self) -> bool {
        (self.has_static_source() && self.source_on_demand) || !self.run_on_demand.is_empty()
    }

    /// Start timeout of the active on-demand flavor.
    pub fn on_demand_start_timeout(&self) -> Duration {
        if self.has_static_source() {
            self.source_on_demand_start_timeout
        } else {
            self.run_on_demand_start_timeout
        }
    }

    /// Close-after-idle delay of the active on-demand flavor.
    pub fn on_demand_close_after(&self) -> Duration {
        if self.has_static_source() {
            self.source_on_demand_close_after
        } else {
            self.run_on_demand_close_after
        }
    }

    /// Validates the template. `name` is the map key the template was
    /// declared under.
    pub fn check(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(CoreError::invalid_name("", "cannot be empty"));
        }

        if self.is_pattern() {
            if !self.is_wildcard() {
                regex::Regex::new(&self.name[1..]).map_err(|e| {
                    CoreError::Conf(format!("invalid regular expression '{}': {}", self.name, e))
                })?;
            }
        } else if !self.is_wildcard() {
            check_path_name(&self.name)
                .map_err(|reason| CoreError::invalid_name(&self.name, &reason))?;
        }

        if (self.is_pattern() || self.is_wildcard()) && self.has_static_source() {
            return Err(CoreError::Conf(format!(
                "path '{}': a path with a static source cannot have a regular expression as name",
                self.name
            )));
        }

        if !self.has_static_source() && self.source_on_demand {
            return Err(CoreError::Conf(format!(
                "path '{}': 'sourceOnDemand' is useless when source is 'publisher'",
                self.name
            )));
        }

        if !self.run_on_demand.is_empty() && self.source != Source::Publisher {
            return Err(CoreError::Conf(format!(
                "path '{}': 'runOnDemand' can be used only when source is 'publisher'",
                self.name
            )));
        }

        Ok(())
    }

    /// Whether a live path holding `self` can switch to `new` without
    /// being torn down. Hook templates and their restart flags may change
    /// live; everything else (source, auth, record, on-demand timings,
    /// reader limits) invalidates running sessions.
    pub fn can_update_in_place(&self, new: &PathConf) -> bool {
        self.without_hooks() == new.without_hooks()
    }

    fn without_hooks(&self) -> PathConf {
        PathConf {
            run_on_init: String::new(),
            run_on_init_restart: false,
            run_on_demand: String::new(),
            run_on_demand_restart: false,
            run_on_un_demand: String::new(),
            run_on_ready: String::new(),
            run_on_ready_restart: false,
            run_on_not_ready: String::new(),
            run_on_read: String::new(),
            run_on_read_restart: false,
            run_on_unread: String::new(),
            ..self.clone()
        }
    }
}
