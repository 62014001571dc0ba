//! The logical data categories a target can back up.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Domain {
    Database,
    ActiveAssets,
    Archives,
}

impl Domain {
    pub const ALL: [Domain; 3] = [Domain::Database, Domain::ActiveAssets, Domain::Archives];

    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Database => "database",
            Domain::ActiveAssets => "active-assets",
            Domain::Archives => "archives",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Domain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Domain::ALL
            .into_iter()
            .find(|d| d.as_str() == s)
            .ok_or_else(|| format!("unknown domain: {s}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for domain in Domain::ALL {
            assert_eq!(domain.as_str().parse::<Domain>().unwrap(), domain);
        }
        assert!("assets".parse::<Domain>().is_err());
        assert_eq!(
            serde_json::to_string(&Domain::ActiveAssets).unwrap(),
            "\"active-assets\""
        );
    }
}
