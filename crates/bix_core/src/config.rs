use crate::consts::CONFIG_FILE;
use crate::errors::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// How a decode error inside one branch of a query is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorPolicy {
    /// Any read error fails the whole query.
    #[default]
    Fail,
    /// A failing `or` branch contributes nothing; `and` still fails.
    SkipInUnion,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Superseded generations kept on disk besides the current one.
    pub keep_generations: usize,
    pub error_policy: ErrorPolicy,
    /// Returned by custom predicates nobody handles.
    pub custom_default: bool,
    pub fsync: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            keep_generations: 2,
            error_policy: ErrorPolicy::Fail,
            custom_default: false,
            fsync: true,
        }
    }
}

impl IndexConfig {
    /// `config.json` in the index directory, defaults when absent.
    pub fn load(dir: &Path) -> Result<Self> {
        let p = dir.join(CONFIG_FILE);
        if !p.exists() {
            return Ok(Self::default());
        }
        let s = fs::read_to_string(p)?;
        Ok(serde_json::from_str(&s)?)
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        let p = dir.join(CONFIG_FILE);
        fs::write(p, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_gives_defaults_and_partial_file_merges() {
        let dir = tempdir().unwrap();
        let c = IndexConfig::load(dir.path()).unwrap();
        assert_eq!(c.keep_generations, 2);
        assert_eq!(c.error_policy, ErrorPolicy::Fail);

        fs::write(dir.path().join(CONFIG_FILE), r#"{"error_policy":"skip-in-union","fsync":false}"#).unwrap();
        let c = IndexConfig::load(dir.path()).unwrap();
        assert_eq!(c.error_policy, ErrorPolicy::SkipInUnion);
        assert!(!c.fsync);
        assert!(!c.custom_default);
    }
}
