//! Per-replica logical clock identifying one change.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use get_size::GetSize;
use serde::{Deserialize, Serialize};

use crate::utils::ChorusError;

/// Server ID type, shared by directory servers (replicas) and replication
/// servers. Replica ID 0 is reserved for synthetic change log records.
pub type ServerId = i32;

/// Reserved replica ID of the change log counter records.
pub const COUNTER_REPLICA_ID: ServerId = 0;

/// Length of the order-preserving key encoding of a `ChangeNumber`.
pub const CN_KEY_LEN: usize = 14;

/// Current wall clock in milliseconds since epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Identifier of a single replicated change. Ordered by timestamp, then
/// sequence number, then replica ID.
#[derive(
    Debug,
    PartialEq,
    Eq,
    Hash,
    Clone,
    Copy,
    Default,
    Serialize,
    Deserialize,
    GetSize,
)]
pub struct ChangeNumber {
    /// Milliseconds since epoch at the originating replica.
    pub timestamp: i64,

    /// Disambiguates changes generated within the same millisecond.
    pub seq: u16,

    /// Originating replica.
    pub replica_id: ServerId,
}

impl ChangeNumber {
    pub fn new(timestamp: i64, seq: u16, replica_id: ServerId) -> Self {
        ChangeNumber {
            timestamp,
            seq,
            replica_id,
        }
    }

    /// True if `self` is strictly newer than `other`.
    #[inline]
    pub fn newer(&self, other: &ChangeNumber) -> bool {
        self > other
    }

    /// Smallest change number ordered after `self`. Every change of the
    /// same replica newer than `self` is at-or-after it.
    pub fn successor(&self) -> ChangeNumber {
        match self.replica_id.checked_add(1) {
            Some(rid) => ChangeNumber::new(self.timestamp, self.seq, rid),
            None => match self.seq.checked_add(1) {
                Some(seq) => ChangeNumber::new(self.timestamp, seq, ServerId::MIN),
                None => ChangeNumber::new(self.timestamp + 1, 0, ServerId::MIN),
            },
        }
    }

    /// The counter record key sitting right before this change in its
    /// replica's log.
    #[inline]
    pub fn counter_sibling(&self) -> ChangeNumber {
        ChangeNumber::new(self.timestamp, self.seq, COUNTER_REPLICA_ID)
    }

    #[inline]
    pub fn is_counter(&self) -> bool {
        self.replica_id == COUNTER_REPLICA_ID
    }

    /// Encodes into a fixed-size big-endian key whose byte order matches the
    /// `Ord` of change numbers.
    pub fn to_key(&self) -> [u8; CN_KEY_LEN] {
        let mut key = [0u8; CN_KEY_LEN];
        let ts = (self.timestamp as u64) ^ (1u64 << 63);
        let rid = (self.replica_id as u32) ^ (1u32 << 31);
        key[..8].copy_from_slice(&ts.to_be_bytes());
        key[8..10].copy_from_slice(&self.seq.to_be_bytes());
        key[10..].copy_from_slice(&rid.to_be_bytes());
        key
    }

    /// Decodes a key produced by `to_key()`.
    pub fn from_key(key: &[u8]) -> Result<Self, ChorusError> {
        if key.len() != CN_KEY_LEN {
            return Err(ChorusError::storage(format!(
                "invalid change number key length {}",
                key.len()
            )));
        }
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&key[..8]);
        let mut seq = [0u8; 2];
        seq.copy_from_slice(&key[8..10]);
        let mut rid = [0u8; 4];
        rid.copy_from_slice(&key[10..]);
        Ok(ChangeNumber {
            timestamp: (u64::from_be_bytes(ts) ^ (1u64 << 63)) as i64,
            seq: u16::from_be_bytes(seq),
            replica_id: (u32::from_be_bytes(rid) ^ (1u32 << 31)) as i32,
        })
    }
}

impl Ord for ChangeNumber {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then(self.seq.cmp(&other.seq))
            .then(self.replica_id.cmp(&other.replica_id))
    }
}

impl PartialOrd for ChangeNumber {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ChangeNumber {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:016x}{:04x}{:08x}",
            self.timestamp, self.seq, self.replica_id as u32
        )
    }
}

impl FromStr for ChangeNumber {
    type Err = ChorusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 28 || !s.is_ascii() {
            return Err(ChorusError::msg(format!(
                "malformed change number '{}'",
                s
            )));
        }
        Ok(ChangeNumber {
            timestamp: u64::from_str_radix(&s[..16], 16)? as i64,
            seq: u16::from_str_radix(&s[16..20], 16)?,
            replica_id: u32::from_str_radix(&s[20..], 16)? as i32,
        })
    }
}

/// Produces strictly increasing change numbers on behalf of one replica.
#[derive(Debug)]
pub struct ChangeNumberGenerator {
    replica_id: ServerId,
    last_time: i64,
    seq: u16,
}

impl ChangeNumberGenerator {
    pub fn new(replica_id: ServerId) -> Self {
        ChangeNumberGenerator {
            replica_id,
            last_time: 0,
            seq: 0,
        }
    }

    /// Next change number at the given wall clock reading.
    pub fn next_at(&mut self, now: i64) -> ChangeNumber {
        if now > self.last_time {
            self.last_time = now;
            self.seq = 0;
        } else if self.seq == u16::MAX {
            self.last_time += 1;
            self.seq = 0;
        } else {
            self.seq += 1;
        }
        ChangeNumber::new(self.last_time, self.seq, self.replica_id)
    }

    pub fn next(&mut self) -> ChangeNumber {
        self.next_at(now_millis())
    }

    /// Moves the generator past a change observed from another replica so
    /// that later local changes order after it.
    pub fn adjust(&mut self, seen: &ChangeNumber) {
        if seen.timestamp > self.last_time
            || (seen.timestamp == self.last_time && seen.seq > self.seq)
        {
            self.last_time = seen.timestamp;
            self.seq = seen.seq;
        }
    }
}

#[cfg(test)]
mod changenumber_tests {
    use super::*;

    #[test]
    fn total_order() {
        let a = ChangeNumber::new(100, 0, 2);
        let b = ChangeNumber::new(100, 1, 1);
        let c = ChangeNumber::new(101, 0, 1);
        let d = ChangeNumber::new(100, 1, 3);
        assert!(a < b && b < d && d < c);
        assert!(c.newer(&a));
        assert!(!a.newer(&a));
    }

    #[test]
    fn successor_is_next() {
        let cn = ChangeNumber::new(100, 4, 7);
        let next = cn.successor();
        assert!(next > cn);
        assert!(next <= ChangeNumber::new(100, 5, 7));
        assert!(next <= ChangeNumber::new(100, 4, 8));
        let edge = ChangeNumber::new(100, 4, ServerId::MAX).successor();
        assert_eq!(edge, ChangeNumber::new(100, 5, ServerId::MIN));
    }

    #[test]
    fn key_preserves_order() -> Result<(), ChorusError> {
        let mut cns = vec![
            ChangeNumber::new(-5, 0, 1),
            ChangeNumber::new(0, 7, 1),
            ChangeNumber::new(1_700_000_000_000, 0, 0),
            ChangeNumber::new(1_700_000_000_000, 0, 9),
            ChangeNumber::new(1_700_000_000_000, 1, 2),
        ];
        let mut keys: Vec<_> = cns.iter().map(|cn| cn.to_key()).collect();
        cns.sort();
        keys.sort();
        for (cn, key) in cns.iter().zip(keys.iter()) {
            assert_eq!(ChangeNumber::from_key(key)?, *cn);
        }
        assert!(ChangeNumber::from_key(&[0u8; 3]).is_err());
        Ok(())
    }

    #[test]
    fn counter_sibling_sorts_first() {
        let cn = ChangeNumber::new(42, 3, 7);
        let ctr = cn.counter_sibling();
        assert!(ctr.is_counter());
        assert!(ctr < cn);
        assert!(ChangeNumber::new(42, 2, 7) < ctr);
    }

    #[test]
    fn string_form() -> Result<(), ChorusError> {
        let cn = ChangeNumber::new(1_700_000_000_123, 17, 4);
        let s = cn.to_string();
        assert_eq!(s.len(), 28);
        assert_eq!(s.parse::<ChangeNumber>()?, cn);
        assert!("xyz".parse::<ChangeNumber>().is_err());
        Ok(())
    }

    #[test]
    fn generator_monotonic() {
        let mut gen = ChangeNumberGenerator::new(5);
        let a = gen.next_at(1000);
        let b = gen.next_at(1000);
        let c = gen.next_at(999);
        let d = gen.next_at(1001);
        assert!(a < b && b < c && c < d);
        gen.adjust(&ChangeNumber::new(5000, 4, 9));
        let e = gen.next_at(1002);
        assert_eq!(e, ChangeNumber::new(5000, 5, 5));
    }
}
