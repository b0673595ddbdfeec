use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use tracing::debug;

/// A named system-permission predicate that can gate whole packages or
/// individual steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Condition {
    Superuser,
}

impl Condition {
    pub const SUPERUSER_IDENTIFIER: &'static str = "superuser";

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Superuser => Self::SUPERUSER_IDENTIFIER,
        }
    }

    /// Resolving an identifier no condition kind is registered for is a
    /// programming error in the descriptor, not a silent "false".
    pub fn parse(identifier: &str) -> Result<Self> {
        match identifier {
            Self::SUPERUSER_IDENTIFIER => Ok(Self::Superuser),
            other => Err(anyhow!("unknown condition identifier: '{other}'")),
        }
    }
}

/// Evaluates one condition against the live system. Implemented by the
/// engine (privilege probe) and by test stubs.
pub trait ConditionProbe {
    fn probe(&self, condition: Condition) -> bool;
}

/// Caches condition results so a system probe runs at most once per run.
pub struct ConditionStore {
    probe: Box<dyn ConditionProbe>,
    cache: BTreeMap<Condition, bool>,
}

impl ConditionStore {
    pub fn new(probe: Box<dyn ConditionProbe>) -> Self {
        Self {
            probe,
            cache: BTreeMap::new(),
        }
    }

    /// Evaluate the condition, probing the system only on first access.
    pub fn check_and_store_if_new(&mut self, condition: Condition) -> bool {
        if let Some(&cached) = self.cache.get(&condition) {
            return cached;
        }

        let value = self.probe.probe(condition);
        debug!(condition = condition.as_str(), value, "probed condition");
        self.cache.insert(condition, value);
        value
    }

    /// Explicitly override a condition's value for the rest of the run.
    pub fn update(&mut self, condition: Condition, value: bool) {
        self.cache.insert(condition, value);
    }

    /// Evaluate a descriptor-provided identifier list: true when every named
    /// condition holds. An unknown identifier is fatal.
    pub fn check_identifiers(&mut self, identifiers: &[String]) -> Result<bool> {
        let mut all = true;
        for identifier in identifiers {
            let condition = Condition::parse(identifier)?;
            all = all && self.check_and_store_if_new(condition);
        }
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::{Condition, ConditionProbe, ConditionStore};

    struct CountingProbe {
        value: bool,
        calls: Rc<Cell<usize>>,
    }

    impl ConditionProbe for CountingProbe {
        fn probe(&self, _condition: Condition) -> bool {
            self.calls.set(self.calls.get() + 1);
            self.value
        }
    }

    #[test]
    fn probe_runs_at_most_once() {
        let calls = Rc::new(Cell::new(0));
        let mut store = ConditionStore::new(Box::new(CountingProbe {
            value: true,
            calls: Rc::clone(&calls),
        }));

        assert!(store.check_and_store_if_new(Condition::Superuser));
        assert!(store.check_and_store_if_new(Condition::Superuser));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn update_overrides_without_probing() {
        let calls = Rc::new(Cell::new(0));
        let mut store = ConditionStore::new(Box::new(CountingProbe {
            value: true,
            calls: Rc::clone(&calls),
        }));

        store.update(Condition::Superuser, false);
        assert!(!store.check_and_store_if_new(Condition::Superuser));
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn unknown_identifier_is_fatal() {
        let calls = Rc::new(Cell::new(0));
        let mut store = ConditionStore::new(Box::new(CountingProbe {
            value: true,
            calls,
        }));

        let err = store
            .check_identifiers(&["no-such-condition".to_string()])
            .expect_err("unknown identifier must error");
        assert!(err.to_string().contains("unknown condition identifier"));
    }

    #[test]
    fn identifier_list_requires_all() {
        let calls = Rc::new(Cell::new(0));
        let mut store = ConditionStore::new(Box::new(CountingProbe {
            value: false,
            calls,
        }));
        assert!(store
            .check_identifiers(&[])
            .expect("empty list must succeed"));
        assert!(!store
            .check_identifiers(&[Condition::SUPERUSER_IDENTIFIER.to_string()])
            .expect("known identifier must evaluate"));
    }
}
