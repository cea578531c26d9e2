#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use miette::Diagnostic;
use serde::Deserialize;
use strata_bytecode::LowerOptions;
use thiserror::Error;

pub const DEFAULT_CONFIG: &str = "strata.toml";

#[derive(Debug, Error, Diagnostic)]
#[error("config error in {}: {message}", path.display())]
#[diagnostic(code(strata::config))]
pub struct ConfigError {
    pub path: PathBuf,
    pub message: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub lower: LowerSection,
    #[serde(default)]
    pub api: ApiSection,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LowerSection {
    #[serde(default = "default_rounds")]
    pub max_specialization_rounds: usize,
}

impl Default for LowerSection {
    fn default() -> Self {
        Self {
            max_specialization_rounds: default_rounds(),
        }
    }
}

fn default_rounds() -> usize {
    LowerOptions::default().max_specialization_rounds
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiSection {
    #[serde(default)]
    pub entrypoints: Vec<String>,
    /// Report `TestableType` instead of `APIType`.
    #[serde(default)]
    pub test_build: bool,
}

impl Config {
    pub fn parse(path: &Path, raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|e| ConfigError {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// An explicit path must exist; the implicit `./strata.toml` is optional.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match explicit {
            Some(p) => p.to_path_buf(),
            None => {
                let p = PathBuf::from(DEFAULT_CONFIG);
                if !p.exists() {
                    return Ok(Self::default());
                }
                p
            }
        };

        let raw = fs::read_to_string(&path).map_err(|e| ConfigError {
            path: path.clone(),
            message: format!("failed to read: {e}"),
        })?;
        Self::parse(&path, &raw)
    }

    pub fn lower_options(&self, rounds: Option<usize>) -> LowerOptions {
        LowerOptions {
            max_specialization_rounds: rounds.unwrap_or(self.lower.max_specialization_rounds),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let cfg = Config::parse(Path::new("strata.toml"), "").expect("parse");
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.lower.max_specialization_rounds, 64);
        assert!(!cfg.api.test_build);
    }

    #[test]
    fn sections_are_read() {
        let raw = r#"
            [lower]
            max_specialization_rounds = 3

            [api]
            entrypoints = ["Main::main", "Main::aux"]
            test_build = true
        "#;
        let cfg = Config::parse(Path::new("strata.toml"), raw).expect("parse");
        assert_eq!(cfg.lower.max_specialization_rounds, 3);
        assert_eq!(cfg.api.entrypoints, vec!["Main::main", "Main::aux"]);
        assert!(cfg.api.test_build);
    }

    #[test]
    fn flags_override_the_file() {
        let cfg = Config::parse(Path::new("strata.toml"), "[lower]\nmax_specialization_rounds = 3\n")
            .expect("parse");
        assert_eq!(cfg.lower_options(None).max_specialization_rounds, 3);
        assert_eq!(cfg.lower_options(Some(9)).max_specialization_rounds, 9);
    }

    #[test]
    fn bad_files_name_the_path() {
        let err = Config::parse(Path::new("conf/strata.toml"), "[lower]\nrounds = \"x\"\n")
            .expect_err("unknown key");
        assert!(err.to_string().contains("conf/strata.toml"));
    }

    #[test]
    fn explicit_paths_must_exist() {
        let missing = std::env::temp_dir().join("strata-config-that-does-not-exist.toml");
        assert!(Config::load(Some(&missing)).is_err());
    }
}
