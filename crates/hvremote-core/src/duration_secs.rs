//! Serde codec for durations given in whole seconds.
//!
//! Use with `#[serde(with = "hvremote_core::duration_secs")]`, or
//! `hvremote_core::duration_secs::option` for `Option<Duration>`.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer};

pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(value.as_secs())
}

pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_secs)
}

pub mod option {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&d.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|v| v.map(Duration::from_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Timings {
        #[serde(with = "crate::duration_secs")]
        period: Duration,
        #[serde(with = "crate::duration_secs::option", default)]
        limit: Option<Duration>,
    }

    #[test]
    fn whole_seconds_both_ways() {
        let timings = Timings {
            period: Duration::from_millis(2500),
            limit: None,
        };
        assert_eq!(serde_json::to_string(&timings).unwrap(), r#"{"period":2,"limit":null}"#);

        let parsed: Timings = serde_json::from_str(r#"{"period":3,"limit":10}"#).unwrap();
        assert_eq!(parsed.period, Duration::from_secs(3));
        assert_eq!(parsed.limit, Some(Duration::from_secs(10)));

        let parsed: Timings = serde_json::from_str(r#"{"period":0}"#).unwrap();
        assert_eq!(parsed.limit, None);
    }
}
