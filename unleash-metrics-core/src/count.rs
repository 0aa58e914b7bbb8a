//! Normalising raw toggle counts into yes/no tallies

use serde::{Deserialize, Serialize};

use crate::model::ToggleCount;

/// Variant reported when the toggle evaluated to off.
pub const DISABLED_VARIANT: &str = "disabled";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct YesNoCount {
    pub yes: u64,
    pub no: u64,
}

impl YesNoCount {
    pub fn new(yes: u64, no: u64) -> Self {
        Self { yes, no }
    }

    pub fn total(&self) -> u64 {
        self.yes.saturating_add(self.no)
    }
}

/// Fold variant hits into yes/no: the `disabled` variant counts as a no,
/// every other variant as a yes.
pub fn normalize(count: &ToggleCount) -> YesNoCount {
    let mut yes = count.yes.unwrap_or(0);
    let mut no = count.no.unwrap_or(0);

    if let Some(variants) = &count.variants {
        for (name, hits) in variants {
            if name == DISABLED_VARIANT {
                no = no.saturating_add(*hits);
            } else {
                yes = yes.saturating_add(*hits);
            }
        }
    }

    YesNoCount { yes, no }
}
