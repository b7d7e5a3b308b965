/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

use std::fmt;
use std::fmt::Debug;
use std::fmt::Display;
use std::fmt::Formatter;
use std::sync::Arc;

use allocative::Allocative;
use derive_more::Display;
use dupe::Dupe;
use itertools::Itertools;

#[derive(Debug, thiserror::Error)]
pub enum TargetLabelParseError {
    #[error("target label must start with `//`: `{0}`")]
    MissingRootPrefix(String),
    #[error("target label must contain `:` followed by a target name: `{0}`")]
    MissingName(String),
    #[error("target label has an empty target name: `{0}`")]
    EmptyName(String),
    #[error("target label has an empty flavor: `{0}`")]
    EmptyFlavor(String),
    #[error("invalid character `{1}` in flavor `{0}`")]
    InvalidFlavorCharacter(String, char),
    #[error("invalid character `{1}` in target name of `{0}`")]
    InvalidNameCharacter(String, char),
    #[error("invalid character `{1}` in package of `{0}`")]
    InvalidPackageCharacter(String, char),
}

/// A variant applied to a target, e.g. `headers` in `//foo:bar#headers`.
#[derive(Clone, Dupe, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash, Allocative)]
#[display(fmt = "{}", _0)]
pub struct Flavor(Arc<str>);

impl Flavor {
    pub fn new(flavor: &str) -> Result<Flavor, TargetLabelParseError> {
        if flavor.is_empty() {
            return Err(TargetLabelParseError::EmptyFlavor(flavor.to_owned()));
        }
        if let Some(c) = flavor
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '=')))
        {
            return Err(TargetLabelParseError::InvalidFlavorCharacter(
                flavor.to_owned(),
                c,
            ));
        }
        Ok(Flavor(Arc::from(flavor)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Uniquely names one node of the target graph: a package, a target name within that package
/// and the (possibly empty) set of flavors applied to it.
///
/// Labels order by package, then name, then flavors, so an unflavored target sorts before any of
/// its flavored variants. Cloning is a reference count bump.
#[derive(Clone, Dupe, PartialEq, Eq, PartialOrd, Ord, Hash, Allocative)]
pub struct TargetLabel(Arc<TargetLabelData>);

#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Allocative)]
struct TargetLabelData {
    /// Package path without the leading `//`, e.g. `foo/bar`.
    package: Arc<str>,
    name: Arc<str>,
    /// Sorted and deduplicated.
    flavors: Vec<Flavor>,
}

impl TargetLabel {
    pub fn new(package: &str, name: &str) -> Result<TargetLabel, TargetLabelParseError> {
        Self::with_parts(package, name, Vec::new())
    }

    fn with_parts(
        package: &str,
        name: &str,
        mut flavors: Vec<Flavor>,
    ) -> Result<TargetLabel, TargetLabelParseError> {
        if name.is_empty() {
            return Err(TargetLabelParseError::EmptyName(format!(
                "//{}:{}",
                package, name
            )));
        }
        // Anything that `parse` splits on would make the label print as a different one.
        if let Some(c) = name.chars().find(|c| matches!(c, ':' | '#' | ',' | '/')) {
            return Err(TargetLabelParseError::InvalidNameCharacter(
                format!("//{}:{}", package, name),
                c,
            ));
        }
        if let Some(c) = package.chars().find(|c| matches!(c, ':' | '#')) {
            return Err(TargetLabelParseError::InvalidPackageCharacter(
                format!("//{}:{}", package, name),
                c,
            ));
        }
        flavors.sort();
        flavors.dedup();
        Ok(TargetLabel(Arc::new(TargetLabelData {
            package: Arc::from(package.trim_end_matches('/')),
            name: Arc::from(name),
            flavors,
        })))
    }

    /// Parses `//package/path:name` or `//package/path:name#flavor1,flavor2`.
    pub fn parse(label: &str) -> Result<TargetLabel, TargetLabelParseError> {
        let rest = label
            .strip_prefix("//")
            .ok_or_else(|| TargetLabelParseError::MissingRootPrefix(label.to_owned()))?;
        let (unflavored, flavors) = match rest.split_once('#') {
            Some((unflavored, flavors)) => (unflavored, Some(flavors)),
            None => (rest, None),
        };
        let (package, name) = unflavored
            .rsplit_once(':')
            .ok_or_else(|| TargetLabelParseError::MissingName(label.to_owned()))?;
        let flavors = match flavors {
            Some(flavors) => flavors.split(',').map(Flavor::new).collect::<Result<_, _>>()?,
            None => Vec::new(),
        };
        Self::with_parts(package, name, flavors)
    }

    /// Parse a label known to be valid. Only for tests.
    pub fn testing_parse(label: &str) -> TargetLabel {
        TargetLabel::parse(label).unwrap()
    }

    pub fn package(&self) -> &str {
        &self.0.package
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn flavors(&self) -> &[Flavor] {
        &self.0.flavors
    }

    pub fn has_flavors(&self) -> bool {
        !self.0.flavors.is_empty()
    }

    pub fn has_flavor(&self, flavor: &Flavor) -> bool {
        self.0.flavors.binary_search(flavor).is_ok()
    }

    /// This label with `flavors` added to the ones it already has.
    pub fn with_flavors(&self, flavors: impl IntoIterator<Item = Flavor>) -> TargetLabel {
        let mut all = self.0.flavors.clone();
        all.extend(flavors);
        self.rebuild(all)
    }

    /// This label with every flavor in `flavors` removed.
    pub fn without_flavors<'a>(&self, flavors: impl IntoIterator<Item = &'a Flavor>) -> TargetLabel {
        let remove = flavors.into_iter().collect::<Vec<_>>();
        let kept = self
            .0
            .flavors
            .iter()
            .filter(|f| !remove.contains(f))
            .cloned()
            .collect();
        self.rebuild(kept)
    }

    pub fn unflavored(&self) -> TargetLabel {
        if !self.has_flavors() {
            return self.dupe();
        }
        self.rebuild(Vec::new())
    }

    fn rebuild(&self, mut flavors: Vec<Flavor>) -> TargetLabel {
        flavors.sort();
        flavors.dedup();
        if flavors == self.0.flavors {
            return self.dupe();
        }
        TargetLabel(Arc::new(TargetLabelData {
            package: self.0.package.dupe(),
            name: self.0.name.dupe(),
            flavors,
        }))
    }
}

impl Display for TargetLabel {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "//{}:{}", self.0.package, self.0.name)?;
        if self.has_flavors() {
            write!(f, "#{}", self.0.flavors.iter().join(","))?;
        }
        Ok(())
    }
}

impl Debug for TargetLabel {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "TargetLabel({})", self)
    }
}
