use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Command-line options for a managed process.
///
/// `flags` render as `--name value`, or a bare `--name` when the value is
/// empty. `set_parameters` render as `--setParameter name=value`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchOptions {
    #[serde(default)]
    pub flags: BTreeMap<String, String>,
    #[serde(default)]
    pub set_parameters: BTreeMap<String, String>,
}

impl LaunchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`insert`](Self::insert).
    pub fn set(mut self, name: &str, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    /// A flag with no value, e.g. `--shardsvr`.
    pub fn flag(self, name: &str) -> Self {
        self.set(name, "")
    }

    pub fn parameter(mut self, name: &str, value: impl Into<String>) -> Self {
        self.set_parameters.insert(name.to_owned(), value.into());
        self
    }

    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        self.flags.insert(normalize(name), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.flags.get(&normalize(name)).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.flags.contains_key(&normalize(name))
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.flags.remove(&normalize(name))
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty() && self.set_parameters.is_empty()
    }

    /// A copy of `self` with every option in `overrides` applied on top.
    pub fn merged(&self, overrides: &LaunchOptions) -> LaunchOptions {
        let mut out = self.clone();
        out.flags.extend(overrides.flags.iter().map(|(k, v)| (k.clone(), v.clone())));
        out.set_parameters
            .extend(overrides.set_parameters.iter().map(|(k, v)| (k.clone(), v.clone())));
        out
    }

    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(self.flags.len() * 2 + self.set_parameters.len() * 2);
        for (name, value) in &self.flags {
            args.push(format!("--{name}"));
            if !value.is_empty() {
                args.push(value.clone());
            }
        }
        for (name, value) in &self.set_parameters {
            args.push("--setParameter".to_owned());
            args.push(format!("{name}={value}"));
        }
        args
    }
}

fn normalize(name: &str) -> String {
    name.trim_start_matches('-').to_owned()
}
