use getrandom::getrandom;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

const BASE36_ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const TASK_SUFFIX_LEN: usize = 8;

pub fn validate_identifier_value(kind: &str, value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err(format!("{kind} must be non-empty"));
    }
    if value
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
    {
        return Ok(());
    }
    Err(format!(
        "{kind} must use only ASCII letters, digits, '-' or '_'"
    ))
}

macro_rules! define_id_type {
    ($name:ident, $kind:literal) => {
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn parse(raw: &str) -> Result<Self, String> {
                validate_identifier_value($kind, raw)?;
                Ok(Self(raw.to_string()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                self.as_str()
            }
        }

        impl TryFrom<String> for $name {
            type Error = String;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::parse(&value)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                let raw = String::deserialize(deserializer)?;
                Self::parse(&raw).map_err(|err| {
                    D::Error::custom(format!("invalid {} `{}`: {}", $kind, raw, err))
                })
            }
        }
    };
}

define_id_type!(TaskId, "task id");

impl TaskId {
    /// `task-<base36 seconds>-<random base36>`; callers check for collisions.
    pub fn generate(now: i64) -> Result<Self, String> {
        let mut bytes = [0u8; TASK_SUFFIX_LEN];
        getrandom(&mut bytes).map_err(|err| format!("failed to generate task id: {err}"))?;
        let suffix = bytes
            .iter()
            .map(|byte| BASE36_ALPHABET[(*byte as usize) % BASE36_ALPHABET.len()] as char)
            .collect::<String>();
        Ok(Self(format!(
            "task-{}-{suffix}",
            base36_encode_u64(now.max(0) as u64)
        )))
    }

    /// Short prefix used in status lines and runtime log messages.
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(13)
            .map(|(idx, _)| idx)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

fn base36_encode_u64(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(BASE36_ALPHABET[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_task_ids_validate_and_differ() {
        let first = TaskId::generate(1_700_000_000).expect("first id");
        let second = TaskId::generate(1_700_000_000).expect("second id");
        assert!(first.as_str().starts_with("task-"));
        assert!(TaskId::parse(first.as_str()).is_ok());
        assert_ne!(first, second);
    }

    #[test]
    fn task_id_rejects_path_like_values() {
        assert!(TaskId::parse("../escape").is_err());
        assert!(TaskId::parse("").is_err());
        assert!(TaskId::parse("task-abc_1").is_ok());
    }

    #[test]
    fn base36_encoding_matches_known_values() {
        assert_eq!(base36_encode_u64(0), "0");
        assert_eq!(base36_encode_u64(35), "z");
        assert_eq!(base36_encode_u64(36), "10");
    }
}
