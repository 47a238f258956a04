//! Options for configuring a replay run.

use std::{
    fmt::{self, Display, Formatter},
    hash::{Hash, Hasher},
    str::FromStr,
    time::Duration,
};

use serde::Deserialize;
use typed_builder::TypedBuilder;

use crate::error::{Error, ErrorKind, Result};

pub(crate) const DEFAULT_PORT: u16 = 27017;

/// An ordinary TCP address at which the replay target can be reached.
#[derive(Clone, Debug, Eq)]
pub struct ServerAddress {
    /// The hostname or IP address where the target server can be found.
    pub host: String,

    /// The TCP port that the target server is listening on.
    ///
    /// The default is 27017.
    pub port: Option<u16>,
}

impl Default for ServerAddress {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: None,
        }
    }
}

impl PartialEq for ServerAddress {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host
            && self.port.unwrap_or(DEFAULT_PORT) == other.port.unwrap_or(DEFAULT_PORT)
    }
}

impl Hash for ServerAddress {
    fn hash<H>(&self, state: &mut H)
    where
        H: Hasher,
    {
        self.host.hash(state);
        self.port.unwrap_or(DEFAULT_PORT).hash(state);
    }
}

impl FromStr for ServerAddress {
    type Err = Error;
    fn from_str(address: &str) -> Result<Self> {
        ServerAddress::parse(address)
    }
}

impl<'de> Deserialize<'de> for ServerAddress {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        Self::parse(s.as_str())
            .map_err(|e| <D::Error as serde::de::Error>::custom(format!("{}", e)))
    }
}

impl ServerAddress {
    /// Parses an address string into a `ServerAddress`.
    ///
    /// Accepts `host`, `host:port`, and a `mongodb://` prefixed form of
    /// either, since captures commonly record the full connection string.
    pub fn parse(address: impl AsRef<str>) -> Result<Self> {
        let address = address.as_ref();
        let address = address.strip_prefix("mongodb://").unwrap_or(address);
        let address = address.split('/').next().unwrap_or(address);

        let mut parts = address.split(':');
        let hostname = match parts.next() {
            Some(part) => {
                if part.is_empty() {
                    return Err(ErrorKind::InvalidArgument {
                        message: format!(
                            "invalid server address: \"{}\"; hostname cannot be empty",
                            address
                        ),
                    }
                    .into());
                }
                part
            }
            None => {
                return Err(ErrorKind::InvalidArgument {
                    message: format!("invalid server address: \"{}\"", address),
                }
                .into())
            }
        };

        let port = match parts.next() {
            Some(part) => {
                let port = u16::from_str(part).map_err(|_| ErrorKind::InvalidArgument {
                    message: format!(
                        "port must be valid 16-bit unsigned integer, instead got: {}",
                        part
                    ),
                })?;

                if port == 0 {
                    return Err(ErrorKind::InvalidArgument {
                        message: format!(
                            "invalid server address: \"{}\"; port must be non-zero",
                            address
                        ),
                    }
                    .into());
                }
                if parts.next().is_some() {
                    return Err(ErrorKind::InvalidArgument {
                        message: format!(
                            "address \"{}\" contains more than one unescaped ':'",
                            address
                        ),
                    }
                    .into());
                }

                Some(port)
            }
            None => None,
        };

        Ok(ServerAddress {
            host: hostname.to_lowercase(),
            port,
        })
    }

    pub(crate) fn host(&self) -> &str {
        self.host.as_str()
    }

    pub(crate) fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }
}

impl Display for ServerAddress {
    fn fmt(&self, fmt: &mut Formatter) -> fmt::Result {
        write!(fmt, "{}:{}", self.host, self.port())
    }
}

/// Contains the options that tune a replay run.
#[derive(Clone, Debug, TypedBuilder)]
#[non_exhaustive]
pub struct ReplayOptions {
    /// The address of the server the captured traffic is replayed against.
    pub target: ServerAddress,

    /// Time-compression multiplier applied to the capture's inter-op gaps.
    /// `2.0` replays twice as fast as recorded; `f64::INFINITY` replays with
    /// no sleeping at all.
    ///
    /// The default is 1.0.
    #[builder(default = 1.0)]
    pub speed: f64,

    /// The bound on each session worker's inbound op queue. A full queue
    /// blocks the dispatcher, which bounds total in-flight memory.
    ///
    /// The default is 10,000 ops.
    #[builder(default = 10_000)]
    pub queue_capacity: usize,

    /// How far ahead of the scheduled replay start each worker dials its
    /// live session, so bursty captures don't race TCP handshakes against
    /// their first ops.
    ///
    /// The default is 5 seconds.
    #[builder(default = Duration::from_secs(5))]
    pub predial_lead: Duration,

    /// The capture-time gap on an endpoint pair after which the next op is
    /// treated as a new connection reusing the same address, starting a
    /// fresh generation.
    ///
    /// The default is 30 seconds.
    #[builder(default = Duration::from_secs(30))]
    pub idle_gap_for_new_generation: Duration,

    /// How long a half-complete reply pair is kept before being evicted.
    ///
    /// The default is 60 seconds.
    #[builder(default = Duration::from_secs(60))]
    pub pair_ttl: Duration,

    /// How long a recorded-to-live cursor id mapping is kept, measured from
    /// its most recent write.
    ///
    /// The default is 600 seconds.
    #[builder(default = Duration::from_secs(600))]
    pub cursor_ttl: Duration,
}

impl ReplayOptions {
    /// Validates that the options make sense for a run.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.speed.is_nan() || self.speed <= 0.0 {
            return Err(Error::invalid_argument(format!(
                "speed must be a positive multiplier or +inf, instead got: {}",
                self.speed
            )));
        }
        if self.queue_capacity == 0 {
            return Err(Error::invalid_argument(
                "queue_capacity must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether deadline sleeping is disabled entirely.
    pub(crate) fn uncapped(&self) -> bool {
        self.speed.is_infinite()
    }
}

#[cfg(test)]
mod test {
    use super::{ReplayOptions, ServerAddress};

    #[test]
    fn parse_bare_host() {
        let address = ServerAddress::parse("Db0.Example.COM").unwrap();
        assert_eq!(address.host, "db0.example.com");
        assert_eq!(address.port, None);
        assert_eq!(address.port(), 27017);
    }

    #[test]
    fn parse_host_and_port() {
        let address = ServerAddress::parse("localhost:27018").unwrap();
        assert_eq!(address.host, "localhost");
        assert_eq!(address.port, Some(27018));
    }

    #[test]
    fn parse_connection_string_prefix() {
        let address = ServerAddress::parse("mongodb://replay-target:9999/admin").unwrap();
        assert_eq!(address.host, "replay-target");
        assert_eq!(address.port, Some(9999));
    }

    #[test]
    fn parse_rejects_bad_ports() {
        assert!(ServerAddress::parse("localhost:0").is_err());
        assert!(ServerAddress::parse("localhost:seventeen").is_err());
        assert!(ServerAddress::parse("localhost:1:2").is_err());
        assert!(ServerAddress::parse(":27017").is_err());
    }

    #[test]
    fn speed_validation() {
        let mut options = ReplayOptions::builder()
            .target(ServerAddress::default())
            .build();
        assert!(options.validate().is_ok());

        options.speed = f64::INFINITY;
        assert!(options.validate().is_ok());
        assert!(options.uncapped());

        options.speed = 0.0;
        assert!(options.validate().is_err());

        options.speed = -2.0;
        assert!(options.validate().is_err());

        options.speed = f64::NAN;
        assert!(options.validate().is_err());
    }
}
