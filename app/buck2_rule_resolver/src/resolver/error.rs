/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

use dupe::Dupe;

use crate::rule::BuildRuleRef;
use crate::target::label::TargetLabel;

#[derive(Debug, thiserror::Error)]
pub enum BuildRuleResolverError {
    #[error("Rule for target `{0}` could not be resolved")]
    UnresolvedTarget(TargetLabel),
    #[error(
        "Race condition while requiring rule for target `{target}`:\n\
         created rule `{created}` does not match existing rule `{existing}`"
    )]
    InconsistentRuleConstruction {
        target: TargetLabel,
        created: String,
        existing: String,
    },
    #[error("A build rule for target `{0}` has already been created")]
    DuplicateRule(TargetLabel),
    #[error(
        "Rule for target `{target}` is present but not of expected type `{expected}` (got `{actual}`)"
    )]
    TypeMismatch {
        target: TargetLabel,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("Constructing target `{expected}` produced a rule for a different target `{actual}`")]
    RuleLabelMismatch {
        expected: TargetLabel,
        actual: TargetLabel,
    },
    #[error(
        "Metadata requested as `{expected}` for target `{target}` was provided as `{actual}`"
    )]
    MetadataTypeMismatch {
        target: TargetLabel,
        expected: &'static str,
        actual: &'static str,
    },
}

impl BuildRuleResolverError {
    pub(crate) fn inconsistent(
        target: &TargetLabel,
        created: &BuildRuleRef,
        existing: &BuildRuleRef,
    ) -> BuildRuleResolverError {
        BuildRuleResolverError::InconsistentRuleConstruction {
            target: target.dupe(),
            created: format!("{:?}", created),
            existing: format!("{:?}", existing),
        }
    }
}
