//! The dependency allow-set a lab request may name.
//!
//! Tokens are matched exactly and case-sensitively. Each entry also carries
//! the distribution packages the instance's bootstrap installs for it.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ProvisionError;

/// Installable software a lab may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dependency {
    Node,
    Postgresql,
    Nginx,
    Redis,
    Docker,
    Mongodb,
}

/// Token, variant and distribution packages for every allowed dependency.
const DEPENDENCIES: &[(&str, Dependency, &[&str])] = &[
    ("node", Dependency::Node, &["nodejs", "npm"]),
    (
        "postgresql",
        Dependency::Postgresql,
        &["postgresql", "postgresql-contrib"],
    ),
    ("nginx", Dependency::Nginx, &["nginx"]),
    ("redis", Dependency::Redis, &["redis-server"]),
    ("docker", Dependency::Docker, &["docker.io"]),
    ("mongodb", Dependency::Mongodb, &["mongodb"]),
];

impl Dependency {
    pub fn as_str(&self) -> &'static str {
        DEPENDENCIES
            .iter()
            .find(|(_, dep, _)| dep == self)
            .map(|(token, _, _)| *token)
            .unwrap_or("unknown")
    }

    /// Distribution packages that provide this dependency.
    pub fn packages(&self) -> &'static [&'static str] {
        DEPENDENCIES
            .iter()
            .find(|(_, dep, _)| dep == self)
            .map(|(_, _, packages)| *packages)
            .unwrap_or(&[])
    }

    /// Every allowed token, in declaration order.
    pub fn allowed() -> impl Iterator<Item = &'static str> {
        DEPENDENCIES.iter().map(|(token, _, _)| *token)
    }
}

impl std::fmt::Display for Dependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dependency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DEPENDENCIES
            .iter()
            .find(|(token, _, _)| *token == s)
            .map(|(_, dep, _)| *dep)
            .ok_or_else(|| s.to_string())
    }
}

/// Parse every token against the allow-set.
///
/// On failure the error lists every unknown token in input order, not just
/// the first one. Valid input keeps its order (and any repeats).
pub fn validate_dependencies<S: AsRef<str>>(tokens: &[S]) -> Result<Vec<Dependency>, ProvisionError> {
    let mut valid = Vec::with_capacity(tokens.len());
    let mut invalid = Vec::new();

    for token in tokens {
        match token.as_ref().parse::<Dependency>() {
            Ok(dep) => valid.push(dep),
            Err(bad) => invalid.push(bad),
        }
    }

    if invalid.is_empty() {
        Ok(valid)
    } else {
        Err(ProvisionError::InvalidDependency { tokens: invalid })
    }
}

/// Distribution packages for a dependency list, de-duplicated, first
/// occurrence wins.
pub fn package_names(deps: &[Dependency]) -> Vec<&'static str> {
    let mut packages: Vec<&'static str> = Vec::new();
    for dep in deps {
        for package in dep.packages() {
            if !packages.contains(package) {
                packages.push(package);
            }
        }
    }
    packages
}
