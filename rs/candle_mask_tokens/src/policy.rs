//! Composition policy for the per-mask feature applier.
//!
//! A policy is the product of four independent choices. Every combination is
//! meaningful, so the set of legal policies is closed: there is no flag matrix
//! with unreachable corners.

use serde::{Deserialize, Serialize};

use crate::error::{MaskTokenError, Result};

/// How many masks of an image are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "limit")]
pub enum MaskBudget {
    /// Keep every mask.
    #[default]
    Unlimited,
    /// Drop all masks of an image that has more than `limit` of them.
    Remove(usize),
    /// Keep only the first `limit` masks.
    Limit(usize),
}

impl MaskBudget {
    /// Number of leading masks to keep out of `num_masks`.
    pub fn keep(&self, num_masks: usize) -> usize {
        match *self {
            MaskBudget::Unlimited => num_masks,
            MaskBudget::Remove(limit) if num_masks > limit => 0,
            MaskBudget::Remove(_) => num_masks,
            MaskBudget::Limit(limit) => num_masks.min(limit),
        }
    }
}

/// What a single mask contributes to the sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reduction {
    /// Every selected feature row.
    #[default]
    Tokens,
    /// The mean of the selected rows, one vector per mask.
    Mean,
}

/// Whether the unmasked feature grid leads the sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GlobalView {
    #[default]
    Omit,
    /// All feature rows of the grid.
    Full,
    /// The mean feature row of the grid.
    Mean,
}

/// Whether the boundary token precedes each mask segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Markers {
    #[default]
    Interleave,
    Suppress,
}

/// Full composition policy of the per-mask applier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CompositionPolicy {
    pub budget: MaskBudget,
    pub reduction: Reduction,
    pub global_view: GlobalView,
    pub markers: Markers,
}

/// The legacy boolean switches, as exposed by older model configs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyFlags {
    pub global_view: bool,
    pub averaging: bool,
    pub mask_removing: bool,
    pub mask_limiting: bool,
    pub mask_limit: usize,
    pub averaging_global_view: bool,
    pub no_masktoken: bool,
}

impl CompositionPolicy {
    /// Map a legacy flag set onto a policy.
    ///
    /// `averaging_global_view` only has an effect together with `global_view`.
    /// Removal and limiting together have no defined meaning and are rejected.
    pub fn from_flags(flags: &PolicyFlags) -> Result<Self> {
        let budget = match (flags.mask_removing, flags.mask_limiting) {
            (true, true) => {
                return Err(MaskTokenError::ConflictingPolicy(
                    "mask_removing and mask_limiting are mutually exclusive",
                ))
            }
            (true, false) => MaskBudget::Remove(flags.mask_limit),
            (false, true) => MaskBudget::Limit(flags.mask_limit),
            (false, false) => MaskBudget::Unlimited,
        };
        let global_view = match (flags.global_view, flags.averaging_global_view) {
            (false, _) => GlobalView::Omit,
            (true, false) => GlobalView::Full,
            (true, true) => GlobalView::Mean,
        };
        Ok(Self {
            budget,
            reduction: if flags.averaging {
                Reduction::Mean
            } else {
                Reduction::Tokens
            },
            global_view,
            markers: if flags.no_masktoken {
                Markers::Suppress
            } else {
                Markers::Interleave
            },
        })
    }

    pub fn with_budget(mut self, budget: MaskBudget) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_reduction(mut self, reduction: Reduction) -> Self {
        self.reduction = reduction;
        self
    }

    pub fn with_global_view(mut self, global_view: GlobalView) -> Self {
        self.global_view = global_view;
        self
    }

    pub fn with_markers(mut self, markers: Markers) -> Self {
        self.markers = markers;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_keep() {
        assert_eq!(MaskBudget::Unlimited.keep(30), 30);
        assert_eq!(MaskBudget::Remove(20).keep(21), 0);
        assert_eq!(MaskBudget::Remove(20).keep(20), 20);
        assert_eq!(MaskBudget::Limit(20).keep(25), 20);
        assert_eq!(MaskBudget::Limit(20).keep(3), 3);
    }

    #[test]
    fn test_from_flags_default() {
        let policy = CompositionPolicy::from_flags(&PolicyFlags::default()).unwrap();
        assert_eq!(policy, CompositionPolicy::default());
    }

    #[test]
    fn test_from_flags_mean_global_view_without_markers() {
        let flags = PolicyFlags {
            global_view: true,
            averaging_global_view: true,
            no_masktoken: true,
            ..Default::default()
        };
        let policy = CompositionPolicy::from_flags(&flags).unwrap();
        assert_eq!(policy.global_view, GlobalView::Mean);
        assert_eq!(policy.markers, Markers::Suppress);
        assert_eq!(policy.reduction, Reduction::Tokens);
    }

    #[test]
    fn test_averaging_global_view_needs_global_view() {
        let flags = PolicyFlags {
            averaging_global_view: true,
            no_masktoken: true,
            ..Default::default()
        };
        let policy = CompositionPolicy::from_flags(&flags).unwrap();
        assert_eq!(policy.global_view, GlobalView::Omit);
        assert_eq!(policy.markers, Markers::Suppress);
    }

    #[test]
    fn test_removal_and_limiting_conflict() {
        let flags = PolicyFlags {
            mask_removing: true,
            mask_limiting: true,
            mask_limit: 20,
            ..Default::default()
        };
        assert!(matches!(
            CompositionPolicy::from_flags(&flags),
            Err(MaskTokenError::ConflictingPolicy(_))
        ));
    }

    #[test]
    fn test_policy_json() {
        let policy = CompositionPolicy::default()
            .with_budget(MaskBudget::Limit(20))
            .with_reduction(Reduction::Mean);
        let json = serde_json::to_string(&policy).unwrap();
        let back: CompositionPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(back, policy);
    }
}
