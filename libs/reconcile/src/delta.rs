//! Set difference between announced and desired hostnames.

use std::collections::BTreeSet;

/// Hostnames to add and remove to move from one set to another.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostnameDelta {
    pub to_register: BTreeSet<String>,
    pub to_unregister: BTreeSet<String>,
}

impl HostnameDelta {
    /// Compute the delta that turns `announced` into `desired`.
    pub fn between(announced: &BTreeSet<String>, desired: &BTreeSet<String>) -> Self {
        Self {
            to_register: desired.difference(announced).cloned().collect(),
            to_unregister: announced.difference(desired).cloned().collect(),
        }
    }

    /// Delta that withdraws everything in `announced`.
    pub fn withdraw(announced: &BTreeSet<String>) -> Self {
        Self {
            to_register: BTreeSet::new(),
            to_unregister: announced.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.to_register.is_empty() && self.to_unregister.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_delta_between() {
        let delta = HostnameDelta::between(&set(&["h1", "h2"]), &set(&["h1", "h3"]));
        assert_eq!(delta.to_register, set(&["h3"]));
        assert_eq!(delta.to_unregister, set(&["h2"]));
        assert!(!delta.is_empty());
    }

    #[test]
    fn test_delta_between_equal_sets_is_empty() {
        let delta = HostnameDelta::between(&set(&["h1"]), &set(&["h1"]));
        assert!(delta.is_empty());
    }

    #[test]
    fn test_withdraw() {
        let delta = HostnameDelta::withdraw(&set(&["h1", "h2"]));
        assert!(delta.to_register.is_empty());
        assert_eq!(delta.to_unregister, set(&["h1", "h2"]));
    }
}
