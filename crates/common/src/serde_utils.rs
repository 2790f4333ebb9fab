//! Serde helpers for APIs that quote every number as a decimal string.

use serde::{Deserialize, Deserializer, Serializer};
use url::Url;

pub mod as_str {
    use std::{fmt::Display, str::FromStr};

    use serde::{de::Deserializer, Deserialize, Serializer};

    pub fn serialize<T: Display, S>(x: &T, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        s.collect_str(x)
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        T: FromStr,
        T::Err: Display,
        D: Deserializer<'de>,
    {
        let value: String = Deserialize::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}

pub mod as_opt_str {
    use std::{fmt::Display, str::FromStr};

    use serde::{de::Deserializer, Deserialize, Serializer};

    pub fn serialize<T: Display, S>(x: &Option<T>, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match x {
            Some(value) => s.collect_str(value),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
    where
        T: FromStr,
        T::Err: Display,
        D: Deserializer<'de>,
    {
        let value: Option<String> = Deserialize::deserialize(deserializer)?;
        match value {
            Some(raw) if !raw.is_empty() => {
                raw.parse().map(Some).map_err(serde::de::Error::custom)
            }
            _ => Ok(None),
        }
    }
}

pub fn deserialize_url<'de, D>(deserializer: D) -> Result<Url, D::Error>
where
    D: Deserializer<'de>,
{
    let url_str: String = Deserialize::deserialize(deserializer)?;
    Url::parse(&url_str).map_err(serde::de::Error::custom)
}

pub fn serialize_url<S>(url: &Url, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(url.as_str())
}
