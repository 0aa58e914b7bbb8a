//! Running per-toggle yes/no totals

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::count::{self, YesNoCount};
use crate::model::{SharedToggles, ToggleName};
use crate::ttl::ExpiryListener;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Projection {
    store: BTreeMap<ToggleName, YesNoCount>,
}

impl Projection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, toggle: &str, counts: YesNoCount) {
        let entry = self.store.entry(toggle.to_string()).or_default();
        entry.yes = entry.yes.saturating_add(counts.yes);
        entry.no = entry.no.saturating_add(counts.no);
    }

    /// Reverse a previous [`add`](Self::add). Toggles never added are ignored.
    /// A toggle brought back to zero keeps its `{ yes: 0, no: 0 }` entry.
    pub fn subtract(&mut self, toggle: &str, counts: YesNoCount) {
        if let Some(entry) = self.store.get_mut(toggle) {
            entry.yes = entry.yes.saturating_sub(counts.yes);
            entry.no = entry.no.saturating_sub(counts.no);
        }
    }

    pub fn get(&self, toggle: &str) -> Option<YesNoCount> {
        self.store.get(toggle).copied()
    }

    /// Owned snapshot of all totals.
    pub fn get_projection(&self) -> BTreeMap<ToggleName, YesNoCount> {
        self.store.clone()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

/// A window of bucket toggles subtracts each expired bucket from its projection.
impl ExpiryListener<SharedToggles> for Projection {
    fn on_expire(&mut self, toggles: SharedToggles, _expiry: DateTime<Utc>) {
        for (name, raw) in toggles.iter() {
            self.subtract(name, count::normalize(raw));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BucketToggles, ToggleCount};
    use std::sync::Arc;

    #[test]
    fn test_add_accumulates() {
        let mut p = Projection::new();
        p.add("a", YesNoCount::new(1, 2));
        p.add("a", YesNoCount::new(3, 4));
        p.add("b", YesNoCount::new(5, 0));

        assert_eq!(p.get("a"), Some(YesNoCount::new(4, 6)));
        assert_eq!(p.get("b"), Some(YesNoCount::new(5, 0)));
        assert_eq!(p.len(), 2);
    }

    #[test]
    fn test_add_then_subtract_round_trips() {
        let mut p = Projection::new();
        p.add("t", YesNoCount::new(10, 3));
        let before = p.get_projection();

        p.add("t", YesNoCount::new(7, 2));
        p.subtract("t", YesNoCount::new(7, 2));

        assert_eq!(p.get_projection(), before);
    }

    #[test]
    fn test_subtract_unseen_toggle_is_ignored() {
        let mut p = Projection::new();
        p.subtract("ghost", YesNoCount::new(5, 5));
        assert!(p.is_empty());
        assert_eq!(p.get("ghost"), None);
    }

    #[test]
    fn test_drained_toggle_stays_at_zero() {
        let mut p = Projection::new();
        p.add("t", YesNoCount::new(2, 2));
        p.subtract("t", YesNoCount::new(2, 2));
        assert_eq!(p.get("t"), Some(YesNoCount::default()));
    }

    #[test]
    fn test_snapshot_is_detached() {
        let mut p = Projection::new();
        p.add("t", YesNoCount::new(1, 1));
        let snapshot = p.get_projection();
        p.add("t", YesNoCount::new(1, 1));
        assert_eq!(snapshot["t"], YesNoCount::new(1, 1));
    }

    #[test]
    fn test_expiry_subtracts_normalized_bucket() {
        let mut toggles = BucketToggles::new();
        toggles.insert("a".into(), ToggleCount::new(1, 0).with_variant("disabled", 2));
        toggles.insert("b".into(), ToggleCount::new(4, 4));

        let mut p = Projection::new();
        for (name, raw) in &toggles {
            p.add(name, count::normalize(raw));
        }
        assert_eq!(p.get("a"), Some(YesNoCount::new(1, 2)));

        p.on_expire(Arc::new(toggles), Utc::now());

        assert_eq!(p.get("a"), Some(YesNoCount::default()));
        assert_eq!(p.get("b"), Some(YesNoCount::default()));
    }
}
