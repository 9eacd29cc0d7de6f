//! Binary output level of a digital line.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Logical value driven onto an output line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Level {
    /// Logical 0.
    #[default]
    Low,
    /// Logical 1.
    High,
}

impl Level {
    /// Raw value as written to the kernel (0 or 1).
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Level::Low => 0,
            Level::High => 1,
        }
    }

    /// The opposite level.
    #[must_use]
    pub fn inverted(self) -> Self {
        match self {
            Level::Low => Level::High,
            Level::High => Level::Low,
        }
    }
}

impl From<bool> for Level {
    fn from(value: bool) -> Self {
        if value {
            Level::High
        } else {
            Level::Low
        }
    }
}

impl From<Level> for bool {
    fn from(level: Level) -> Self {
        level == Level::High
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

impl Serialize for Level {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u8(self.as_u8())
    }
}

impl<'de> Deserialize<'de> for Level {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::{self, Visitor};

        struct LevelVisitor;

        impl<'de> Visitor<'de> for LevelVisitor {
            type Value = Level;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("0, 1, a boolean, or \"low\"/\"high\"")
            }

            fn visit_bool<E>(self, value: bool) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(Level::from(value))
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                match value {
                    0 => Ok(Level::Low),
                    1 => Ok(Level::High),
                    other => Err(de::Error::custom(format!("level must be 0 or 1, got {other}"))),
                }
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                if value < 0 {
                    return Err(de::Error::custom("level cannot be negative"));
                }
                self.visit_u64(value as u64)
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                match value.to_ascii_lowercase().as_str() {
                    "low" | "0" => Ok(Level::Low),
                    "high" | "1" => Ok(Level::High),
                    other => Err(de::Error::custom(format!("unknown level {other:?}"))),
                }
            }
        }

        deserializer.deserialize_any(LevelVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_variants() {
        let l: Level = serde_json::from_str("1").unwrap();
        assert_eq!(l, Level::High);
        let l: Level = serde_json::from_str("false").unwrap();
        assert_eq!(l, Level::Low);
        let l: Level = serde_json::from_str("\"HIGH\"").unwrap();
        assert_eq!(l, Level::High);
        assert!(serde_json::from_str::<Level>("2").is_err());
    }

    #[test]
    fn test_invert() {
        assert_eq!(Level::High.inverted(), Level::Low);
        assert_eq!(Level::Low.inverted().as_u8(), 1);
        assert!(bool::from(Level::High));
    }
}
