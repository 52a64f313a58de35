use std::fmt;

use serde::Deserialize;

use super::defaults::parse_human_duration;

const NULL_VALUE_ERROR: &str = "value cannot be null; provide a value or omit the field";

/// Duration written either as a string (`"4h"`) or a bare integer (days),
/// validated at load time so a typo fails the config, not the first run.
#[derive(Debug, Clone, PartialEq, Eq)]
struct DurationString(String);

impl<'de> Deserialize<'de> for DurationString {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de;

        struct DurationStringVisitor;

        impl de::Visitor<'_> for DurationStringVisitor {
            type Value = DurationString;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a duration string or integer")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<DurationString, E> {
                parse_human_duration(v).map_err(E::custom)?;
                Ok(DurationString(v.to_string()))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<DurationString, E> {
                self.visit_str(&v.to_string())
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<DurationString, E> {
                self.visit_str(&v.to_string())
            }
        }

        deserializer.deserialize_any(DurationStringVisitor)
    }
}

pub(super) fn deserialize_duration_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    DurationString::deserialize(deserializer).map(|d| d.0)
}

pub(super) fn deserialize_optional_duration_string<'de, D>(
    deserializer: D,
) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    match Option::<DurationString>::deserialize(deserializer)? {
        Some(v) => Ok(Some(v.0)),
        None => Err(D::Error::custom(NULL_VALUE_ERROR)),
    }
}
