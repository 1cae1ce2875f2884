//! Identity key derivation.
//!
//! Keys are derived from geometry, not content: a key identifies "a region at
//! this position (or rank) of one image", never a person across photos. Pick
//! one policy per registry; switching mid-dataset changes what counts as a
//! duplicate.

use crate::types::{Detection, IdentityKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const KEY_PREFIX: &str = "usuario";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyPolicy {
    /// `usuario_{x}_{y}` from the detection's top-left corner.
    #[default]
    Positional,
    /// `usuario_{idx}` from the detection's 0-based rank in the batch.
    Ordinal,
}

impl KeyPolicy {
    /// Derive the key for `detection`, found at `index` in the current batch.
    pub fn derive(&self, detection: &Detection, index: usize) -> IdentityKey {
        match self {
            KeyPolicy::Positional => {
                IdentityKey::new(format!("{KEY_PREFIX}_{}_{}", detection.x, detection.y))
            }
            KeyPolicy::Ordinal => IdentityKey::new(format!("{KEY_PREFIX}_{index}")),
        }
    }
}

impl fmt::Display for KeyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPolicy::Positional => f.write_str("positional"),
            KeyPolicy::Ordinal => f.write_str("ordinal"),
        }
    }
}

impl FromStr for KeyPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "positional" => Ok(KeyPolicy::Positional),
            "ordinal" => Ok(KeyPolicy::Ordinal),
            other => Err(format!("unknown key policy: {other} (expected positional or ordinal)")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DetectionKind;

    fn det(x: i32, y: i32) -> Detection {
        Detection::new(x, y, 50, 50, DetectionKind::Face)
    }

    #[test]
    fn test_positional_key() {
        let key = KeyPolicy::Positional.derive(&det(10, 20), 3);
        assert_eq!(key.as_str(), "usuario_10_20");
    }

    #[test]
    fn test_positional_key_negative_origin() {
        let key = KeyPolicy::Positional.derive(&det(-4, 7), 0);
        assert_eq!(key.as_str(), "usuario_-4_7");
    }

    #[test]
    fn test_ordinal_key_ignores_geometry() {
        assert_eq!(KeyPolicy::Ordinal.derive(&det(10, 10), 0).as_str(), "usuario_0");
        assert_eq!(KeyPolicy::Ordinal.derive(&det(200, 200), 1).as_str(), "usuario_1");
        assert_eq!(
            KeyPolicy::Ordinal.derive(&det(1, 1), 1),
            KeyPolicy::Ordinal.derive(&det(99, 99), 1)
        );
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!("Ordinal".parse::<KeyPolicy>().unwrap(), KeyPolicy::Ordinal);
        assert_eq!("positional".parse::<KeyPolicy>().unwrap(), KeyPolicy::Positional);
        assert!("content".parse::<KeyPolicy>().is_err());
    }
}
