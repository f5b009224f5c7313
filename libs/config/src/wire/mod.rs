use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize, de};

/// top-level config type
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub endpoints: Option<MaybeList<String>>,
    #[serde(default, deserialize_with = "deserialize_optional_duration")]
    pub dial_timeout: Option<Duration>,
    #[serde(default, deserialize_with = "deserialize_optional_duration")]
    pub request_timeout: Option<Duration>,
    #[serde(default, deserialize_with = "deserialize_optional_duration")]
    pub session_ttl: Option<Duration>,
    #[serde(default, deserialize_with = "deserialize_optional_duration")]
    pub lock_timeout: Option<Duration>,
    pub auth: Option<Auth>,
}

/// etcd user credentials
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Auth {
    pub username: String,
    pub password: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum MaybeList<T> {
    Val(T),
    List(Vec<T>),
}

impl<T> MaybeList<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            MaybeList::Val(v) => vec![v],
            MaybeList::List(list) => list,
        }
    }
}

/// Parse a duration string with optional time units
/// Accepts: "2", "2s", "500ms", "1m", "1h"
/// If no unit is specified, assumes seconds
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        anyhow::bail!("empty duration string");
    }

    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    // split units
    let (num, unit) = s.split_at(end);
    let num = num.parse::<u64>().context("invalid number")?;

    let millis_per_unit = match unit.trim() {
        "ms" => 1,
        "" | "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        other => anyhow::bail!(
            "unknown time unit '{}', only 'h', 'm', 's' or 'ms' are supported",
            other
        ),
    };

    num.checked_mul(millis_per_unit)
        .map(Duration::from_millis)
        .context("duration value overflow")
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireDuration {
    Seconds(u64),
    String(String),
}

impl WireDuration {
    fn into_duration<E: de::Error>(self) -> Result<Duration, E> {
        match self {
            WireDuration::Seconds(secs) => Ok(Duration::from_secs(secs)),
            WireDuration::String(s) => parse_duration(&s).map_err(E::custom),
        }
    }
}

fn deserialize_optional_duration<'de, D>(de: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<WireDuration>::deserialize(de)?
        .map(WireDuration::into_duration)
        .transpose()
}
