//! On-disk configuration loading (ambient surface; spec.md §6 treats the
//! input as just "a sequence of `ForwardSpec` records" with no mandated file
//! format). This module supplies the `serde_json` schema of the teacher's
//! `config.rs`: a thin, fallible `load_forward_specs` over a list of
//! [`ForwardSpec`].

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::forward::ForwardSpec;

/// Top-level on-disk schema: a bare list of forwards. Kept as a newtype
/// (rather than a raw `Vec`) so future ambient fields (log level, bootstrap
/// peers) can be added without breaking existing config files.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForwardConfig {
    #[serde(default)]
    pub forwards: Vec<ForwardSpec>,
}

/// Load and validate a list of [`ForwardSpec`]s from a JSON file.
/// `ConfigError` here is fatal at startup per spec.md §7: no forwards run if
/// the file is malformed.
pub fn load_forward_specs(path: impl AsRef<Path>) -> Result<Vec<ForwardSpec>, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    let config: ForwardConfig = serde_json::from_str(&content)?;
    for spec in &config.forwards {
        spec.validate()?;
    }
    Ok(config.forwards)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_valid_forward_list() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"forwards": [
                {{"role": "server", "proto": "tcp", "remote_port": 7000, "secret": "abc"}}
            ]}}"#
        )
        .unwrap();
        let specs = load_forward_specs(file.path()).unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].remote_port, 7000);
    }

    #[test]
    fn rejects_missing_file() {
        let result = load_forward_specs("/nonexistent/tunnelmesh.json");
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn rejects_invalid_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        let result = load_forward_specs(file.path());
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }
}
