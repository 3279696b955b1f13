pub use self::glob::GlobPattern;
pub use self::seconds::Seconds;

pub mod glob {
    use std::ops::Deref;

    use ::glob::PatternError;
    use ::serde::{
        de::{self, Visitor},
        Deserialize, Serialize,
    };

    /// Glob pattern validated at deserialization time.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct GlobPattern(::glob::Pattern);

    impl GlobPattern {
        pub fn parse(pattern: &str) -> Result<Self, PatternError> {
            ::glob::Pattern::new(pattern).map(Self)
        }
    }

    impl Deref for GlobPattern {
        type Target = ::glob::Pattern;

        fn deref(&self) -> &Self::Target {
            &self.0
        }
    }

    impl Serialize for GlobPattern {
        fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: serde::Serializer,
        {
            serializer.serialize_str(self.0.as_str())
        }
    }

    impl<'de> Deserialize<'de> for GlobPattern {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: serde::Deserializer<'de>,
        {
            struct GlobPatternVisitor;

            impl<'de> Visitor<'de> for GlobPatternVisitor {
                type Value = GlobPattern;

                fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                    write!(f, "a glob pattern string")
                }

                fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
                where
                    E: de::Error,
                {
                    Self::Value::parse(v).map_err(de::Error::custom)
                }
            }

            deserializer.deserialize_str(GlobPatternVisitor)
        }
    }

    #[cfg(test)]
    mod test {
        use super::*;

        const PATTERN: &str = "./problems/*";
        const SERIALIZED_PATTERN: &str = concat!('"', "./problems/*", '"');

        #[test]
        fn serialize_glob_pattern_ok() {
            let pat = GlobPattern::parse(PATTERN).unwrap();
            let json = serde_json::to_string(&pat).unwrap();
            assert_eq!(json, SERIALIZED_PATTERN);
        }

        #[test]
        fn deserialize_glob_pattern_ok() {
            let pat: GlobPattern = serde_json::from_str(SERIALIZED_PATTERN).unwrap();
            assert_eq!(pat.as_str(), PATTERN);
            assert!(pat.matches("./problems/aplusb"));
        }

        #[test]
        fn deserialize_glob_pattern_ng() {
            let res: Result<GlobPattern, _> = serde_json::from_str(r#""[a""#);
            assert!(res.is_err());
        }
    }
}

pub mod seconds {
    use std::{fmt, time::Duration};

    use ::serde::{
        de::{self, Visitor},
        Deserialize, Serialize,
    };

    /// Non-negative span of time written as (fractional) seconds, e.g. `2` or `0.5`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
    pub struct Seconds(Duration);

    impl Seconds {
        pub fn from_secs_f64(secs: f64) -> Option<Self> {
            Duration::try_from_secs_f64(secs).ok().map(Self)
        }

        pub const fn from_duration(d: Duration) -> Self {
            Self(d)
        }

        pub const fn as_duration(&self) -> Duration {
            self.0
        }

        pub fn as_secs_f64(&self) -> f64 {
            self.0.as_secs_f64()
        }
    }

    impl From<Seconds> for Duration {
        fn from(value: Seconds) -> Self {
            value.0
        }
    }

    impl fmt::Display for Seconds {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}s", self.0.as_secs_f64())
        }
    }

    impl Serialize for Seconds {
        fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: serde::Serializer,
        {
            serializer.serialize_f64(self.0.as_secs_f64())
        }
    }

    impl<'de> Deserialize<'de> for Seconds {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: serde::Deserializer<'de>,
        {
            struct SecondsVisitor;

            impl<'de> Visitor<'de> for SecondsVisitor {
                type Value = Seconds;

                fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                    write!(f, "a non-negative number of seconds")
                }

                fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
                where
                    E: de::Error,
                {
                    Seconds::from_secs_f64(v).ok_or_else(|| {
                        de::Error::invalid_value(de::Unexpected::Float(v), &self)
                    })
                }

                fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
                where
                    E: de::Error,
                {
                    u64::try_from(v)
                        .map(|secs| Seconds(Duration::from_secs(secs)))
                        .map_err(|_| de::Error::invalid_value(de::Unexpected::Signed(v), &self))
                }

                fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
                where
                    E: de::Error,
                {
                    Ok(Seconds(Duration::from_secs(v)))
                }
            }

            deserializer.deserialize_any(SecondsVisitor)
        }
    }

    #[cfg(test)]
    mod test {
        use super::*;

        #[derive(Debug, Deserialize)]
        struct Limits {
            time: Seconds,
        }

        #[test]
        fn deserialize_seconds_from_integer_and_float() {
            let x: Limits = toml::from_str("time = 2").unwrap();
            assert_eq!(x.time.as_duration(), Duration::from_secs(2));

            let x: Limits = toml::from_str("time = 0.25").unwrap();
            assert_eq!(x.time.as_duration(), Duration::from_millis(250));
        }

        #[test]
        fn deserialize_seconds_ng() {
            assert!(toml::from_str::<Limits>("time = -1").is_err());
            assert!(toml::from_str::<Limits>("time = -0.5").is_err());
            assert!(toml::from_str::<Limits>(r#"time = "1s""#).is_err());
        }

        #[test]
        fn serialize_seconds() {
            let s = Seconds::from_secs_f64(1.5).unwrap();
            assert_eq!(serde_json::to_string(&s).unwrap(), "1.5");
        }
    }
}
