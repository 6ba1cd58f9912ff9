//! Node start arguments
//!
//! Each argument is either a bare flag (`--txindex`) or a flag carrying a
//! value (`--rpclisten=127.0.0.1:20001`). A `StartArgs` collection keeps
//! insertion order and never holds two arguments with the same name.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Errors building an argument set
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArgsError {
    #[error("duplicate start argument '{0}'")]
    Duplicate(String),

    #[error("invalid start argument name '{0}'")]
    InvalidName(String),
}

/// One node start argument.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StartArg {
    /// Flag present, takes no value
    Flag { name: String },
    /// Flag with a value
    FlagWithValue { name: String, value: String },
}

impl StartArg {
    pub fn flag(name: impl Into<String>) -> Self {
        StartArg::Flag { name: name.into() }
    }

    pub fn with_value(name: impl Into<String>, value: impl fmt::Display) -> Self {
        StartArg::FlagWithValue {
            name: name.into(),
            value: value.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            StartArg::Flag { name } | StartArg::FlagWithValue { name, .. } => name,
        }
    }

    pub fn value(&self) -> Option<&str> {
        match self {
            StartArg::Flag { .. } => None,
            StartArg::FlagWithValue { value, .. } => Some(value),
        }
    }

    /// Command-line form: `--name` or `--name=value`
    pub fn render(&self) -> String {
        match self {
            StartArg::Flag { name } => format!("--{}", name),
            StartArg::FlagWithValue { name, value } => format!("--{}={}", name, value),
        }
    }

    fn validate_name(name: &str) -> Result<(), ArgsError> {
        let valid = !name.is_empty()
            && !name.starts_with('-')
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
        if valid {
            Ok(())
        } else {
            Err(ArgsError::InvalidName(name.to_string()))
        }
    }
}

impl fmt::Display for StartArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Ordered set of start arguments keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct StartArgs {
    args: Vec<StartArg>,
}

impl StartArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a list, rejecting duplicate names.
    pub fn from_args(args: impl IntoIterator<Item = StartArg>) -> Result<Self, ArgsError> {
        let mut set = Self::new();
        for arg in args {
            set.insert(arg)?;
        }
        Ok(set)
    }

    /// Add an argument. Fails if the name is already present.
    pub fn insert(&mut self, arg: StartArg) -> Result<(), ArgsError> {
        StartArg::validate_name(arg.name())?;
        if self.contains(arg.name()) {
            return Err(ArgsError::Duplicate(arg.name().to_string()));
        }
        self.args.push(arg);
        Ok(())
    }

    /// Builder form of `insert` for bare flags
    pub fn flag(mut self, name: impl Into<String>) -> Result<Self, ArgsError> {
        self.insert(StartArg::flag(name))?;
        Ok(self)
    }

    /// Builder form of `insert` for valued flags
    pub fn value(mut self, name: impl Into<String>, value: impl fmt::Display) -> Result<Self, ArgsError> {
        self.insert(StartArg::with_value(name, value))?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&StartArg> {
        self.args.iter().find(|a| a.name() == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StartArg> {
        self.args.iter()
    }

    /// Apply `overrides` on top of `self`: same-named arguments are
    /// replaced in place, new ones are appended.
    pub fn merged_with(&self, overrides: &StartArgs) -> StartArgs {
        let mut merged = self.clone();
        for arg in &overrides.args {
            match merged.args.iter_mut().find(|a| a.name() == arg.name()) {
                Some(existing) => *existing = arg.clone(),
                None => merged.args.push(arg.clone()),
            }
        }
        merged
    }

    /// Render as argv entries
    pub fn to_argv(&self) -> Vec<String> {
        self.args.iter().map(StartArg::render).collect()
    }
}

impl<'a> IntoIterator for &'a StartArgs {
    type Item = &'a StartArg;
    type IntoIter = std::slice::Iter<'a, StartArg>;

    fn into_iter(self) -> Self::IntoIter {
        self.args.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render() {
        assert_eq!(StartArg::flag("txindex").render(), "--txindex");
        assert_eq!(
            StartArg::with_value("rpclisten", "127.0.0.1:20001").render(),
            "--rpclisten=127.0.0.1:20001"
        );
    }

    #[test]
    fn test_duplicate_rejected() {
        let err = StartArgs::new()
            .flag("txindex")
            .unwrap()
            .value("txindex", 1)
            .unwrap_err();
        assert_eq!(err, ArgsError::Duplicate("txindex".to_string()));
    }

    #[test]
    fn test_invalid_names_rejected() {
        let mut args = StartArgs::new();
        assert!(matches!(args.insert(StartArg::flag("")), Err(ArgsError::InvalidName(_))));
        assert!(matches!(args.insert(StartArg::flag("--txindex")), Err(ArgsError::InvalidName(_))));
        assert!(matches!(args.insert(StartArg::flag("a b")), Err(ArgsError::InvalidName(_))));
        assert!(args.is_empty());
    }

    #[test]
    fn test_merge_overrides_defaults_in_place() {
        let defaults = StartArgs::new()
            .flag("simnet")
            .unwrap()
            .value("listen", "127.0.0.1:20000")
            .unwrap()
            .value("datadir", "/tmp/a")
            .unwrap();
        let extra = StartArgs::new()
            .value("listen", "127.0.0.1:9999")
            .unwrap()
            .flag("txindex")
            .unwrap();

        let merged = defaults.merged_with(&extra);
        assert_eq!(
            merged.to_argv(),
            vec![
                "--simnet".to_string(),
                "--listen=127.0.0.1:9999".to_string(),
                "--datadir=/tmp/a".to_string(),
                "--txindex".to_string(),
            ]
        );
        // Inputs untouched
        assert_eq!(defaults.get("listen").unwrap().value(), Some("127.0.0.1:20000"));
    }

    #[test]
    fn test_override_can_change_variant() {
        let defaults = StartArgs::new().value("debuglevel", "info").unwrap();
        let extra = StartArgs::new().flag("debuglevel").unwrap();
        let merged = defaults.merged_with(&extra);
        assert_eq!(merged.get("debuglevel"), Some(&StartArg::flag("debuglevel")));
        assert_eq!(merged.len(), 1);
    }

    #[test]
    fn test_serialize_tagged() {
        let args = StartArgs::new().flag("txindex").unwrap().value("rpcuser", "u").unwrap();
        let json = serde_json::to_value(&args).unwrap();
        assert_eq!(json[0]["kind"], "flag");
        assert_eq!(json[1]["kind"], "flag_with_value");
        assert_eq!(json[1]["value"], "u");
    }
}
