//! Vector of the newest change observed per replica.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::proto::{ChangeNumber, ServerId};

/// Mapping replica ID -> newest change number produced by that replica as
/// observed locally. Merges are monotone.
#[derive(Debug, PartialEq, Eq, Clone, Default, Serialize, Deserialize)]
pub struct ServerState {
    list: BTreeMap<ServerId, ChangeNumber>,
}

impl ServerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `cn` if it is newer than what is known for its replica.
    /// Returns true if the state changed.
    pub fn update(&mut self, cn: ChangeNumber) -> bool {
        match self.list.get(&cn.replica_id) {
            Some(known) if !cn.newer(known) => false,
            _ => {
                self.list.insert(cn.replica_id, cn);
                true
            }
        }
    }

    /// Merges every entry of `other` into `self`. Returns true if anything
    /// changed.
    pub fn update_from(&mut self, other: &ServerState) -> bool {
        let mut changed = false;
        for cn in other.list.values() {
            changed |= self.update(*cn);
        }
        changed
    }

    #[inline]
    pub fn get(&self, replica_id: ServerId) -> Option<ChangeNumber> {
        self.list.get(&replica_id).copied()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn replica_ids(&self) -> impl Iterator<Item = ServerId> + '_ {
        self.list.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ServerId, &ChangeNumber)> {
        self.list.iter()
    }

    /// True if `self` has seen at least everything `other` has.
    pub fn cover(&self, other: &ServerState) -> bool {
        other.list.iter().all(|(rid, cn)| match self.list.get(rid) {
            Some(mine) => mine >= cn,
            None => false,
        })
    }

    /// True if `self` has seen `cn` (or something newer from its replica).
    pub fn cover_cn(&self, cn: &ChangeNumber) -> bool {
        self.list
            .get(&cn.replica_id)
            .is_some_and(|mine| mine >= cn)
    }

    pub fn clear(&mut self) {
        self.list.clear();
    }
}

/// Cookie form: `rid:cn;rid:cn`.
impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut first = true;
        for (rid, cn) in self.list.iter() {
            if !first {
                write!(f, ";")?;
            }
            write!(f, "{}:{}", rid, cn)?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod serverstate_tests {
    use super::*;

    #[test]
    fn monotone_update() {
        let mut state = ServerState::new();
        assert!(state.update(ChangeNumber::new(10, 0, 1)));
        assert!(!state.update(ChangeNumber::new(9, 0, 1)));
        assert!(!state.update(ChangeNumber::new(10, 0, 1)));
        assert!(state.update(ChangeNumber::new(10, 1, 1)));
        assert!(state.update(ChangeNumber::new(3, 0, 2)));
        assert_eq!(state.get(1), Some(ChangeNumber::new(10, 1, 1)));
        assert_eq!(state.get(2), Some(ChangeNumber::new(3, 0, 2)));
        assert_eq!(state.get(3), None);
        assert_eq!(state.replica_ids().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn cover_and_merge() {
        let mut a = ServerState::new();
        a.update(ChangeNumber::new(10, 0, 1));
        a.update(ChangeNumber::new(20, 0, 2));
        let mut b = ServerState::new();
        b.update(ChangeNumber::new(15, 0, 1));
        assert!(!a.cover(&b));
        assert!(b.cover_cn(&ChangeNumber::new(12, 0, 1)));
        assert!(a.update_from(&b));
        assert!(a.cover(&b));
        assert!(!a.update_from(&b));
        assert_eq!(a.get(1), Some(ChangeNumber::new(15, 0, 1)));
    }

    #[test]
    fn cookie_form() {
        let mut state = ServerState::new();
        assert_eq!(state.to_string(), "");
        state.update(ChangeNumber::new(1, 0, 2));
        state.update(ChangeNumber::new(1, 0, 1));
        let cookie = state.to_string();
        assert!(cookie.starts_with("1:"));
        assert_eq!(cookie.split(';').count(), 2);
    }
}
