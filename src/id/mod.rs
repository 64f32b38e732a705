//! Sortable, time-ordered identifiers.
//!
//! An identifier looks like `prt_0195f3a2c41e8000Xk3m9QpLr2TbWz`: a type
//! prefix, 16 hex characters encoding `unix_millis * 4096 + counter`, and 14
//! random base-62 characters. Ascending IDs sort oldest-first; descending IDs
//! invert the encoded value so plain string ordering yields newest-first.
//!
//! Only ascending IDs can be decoded back to a timestamp.

use std::sync::{Mutex, OnceLock};

use rand::Rng;
use strum::{AsRefStr, Display, EnumString};

use crate::error::{KilnError, Result};

const RANDOM_LEN: usize = 14;
const TIME_HEX_LEN: usize = 16;
const COUNTER_SPACE: u64 = 0x1000;
const BASE62: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

static DEFAULT_GENERATOR: OnceLock<IdGenerator> = OnceLock::new();

/// Identifier type prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, AsRefStr)]
pub enum IdPrefix {
    #[strum(serialize = "ses")]
    Session,
    #[strum(serialize = "msg")]
    Message,
    #[strum(serialize = "prt")]
    Part,
    #[strum(serialize = "per")]
    Permission,
    #[strum(serialize = "tool")]
    Tool,
    #[strum(serialize = "call")]
    Call,
}

impl IdPrefix {
    pub fn as_str(&self) -> &str {
        self.as_ref()
    }
}

/// Sort direction of a generated identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Debug, Default)]
struct ClockState {
    last_millis: u64,
    counter: u64,
}

/// Generator holding the per-millisecond counter.
///
/// Most callers use the free functions backed by a process-wide generator;
/// tests may construct their own.
#[derive(Debug, Default)]
pub struct IdGenerator {
    state: Mutex<ClockState>,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ascending(&self, prefix: IdPrefix) -> String {
        self.create(prefix, Direction::Ascending)
    }

    pub fn descending(&self, prefix: IdPrefix) -> String {
        self.create(prefix, Direction::Descending)
    }

    pub fn create(&self, prefix: IdPrefix, direction: Direction) -> String {
        let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
        self.create_at(prefix, direction, now)
    }

    fn create_at(&self, prefix: IdPrefix, direction: Direction, now_millis: u64) -> String {
        let encoded = self.next_value(now_millis);
        let value = match direction {
            Direction::Ascending => encoded,
            Direction::Descending => !encoded,
        };
        format!(
            "{}_{:0width$x}{}",
            prefix.as_str(),
            value,
            random_base62(RANDOM_LEN),
            width = TIME_HEX_LEN
        )
    }

    fn next_value(&self, now_millis: u64) -> u64 {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // A clock that steps backwards keeps counting on the last millisecond.
        if now_millis > state.last_millis {
            state.last_millis = now_millis;
            state.counter = 0;
        }
        state.counter += 1;
        state
            .last_millis
            .wrapping_mul(COUNTER_SPACE)
            .wrapping_add(state.counter)
    }
}

fn default_generator() -> &'static IdGenerator {
    DEFAULT_GENERATOR.get_or_init(IdGenerator::new)
}

/// New ascending identifier from the process-wide generator.
pub fn ascending(prefix: IdPrefix) -> String {
    default_generator().ascending(prefix)
}

/// New descending identifier from the process-wide generator.
pub fn descending(prefix: IdPrefix) -> String {
    default_generator().descending(prefix)
}

/// Accept an externally supplied identifier if it carries the expected prefix.
pub fn given(prefix: IdPrefix, id: &str) -> Result<String> {
    let expected = format!("{}_", prefix.as_str());
    if !id.starts_with(&expected) {
        return Err(KilnError::Validation(format!(
            "ID {id} does not start with {}",
            prefix.as_str()
        )));
    }
    Ok(id.to_string())
}

/// Decode the creation time (unix millis) of an ascending identifier.
///
/// The value returned for a descending identifier is meaningless.
pub fn timestamp(id: &str) -> Option<u64> {
    let (_, rest) = id.split_once('_')?;
    let hex = rest.get(..TIME_HEX_LEN)?;
    let encoded = u64::from_str_radix(hex, 16).ok()?;
    Some(encoded / COUNTER_SPACE)
}

fn random_base62(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| BASE62[rng.random_range(0..BASE62.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascending_ids_sort_in_creation_order() {
        let generator = IdGenerator::new();
        let ids: Vec<String> = (0..200)
            .map(|_| generator.ascending(IdPrefix::Part))
            .collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn descending_ids_sort_newest_first() {
        let generator = IdGenerator::new();
        let ids: Vec<String> = (0..200)
            .map(|_| generator.descending(IdPrefix::Session))
            .collect();
        let mut sorted = ids.clone();
        sorted.sort();
        sorted.reverse();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn timestamp_round_trips_ascending_ids() {
        let before = chrono::Utc::now().timestamp_millis() as u64;
        let id = ascending(IdPrefix::Message);
        let after = chrono::Utc::now().timestamp_millis() as u64;
        let decoded = timestamp(&id).expect("decodable");
        assert!(decoded + 1 >= before && decoded <= after + 1, "{decoded} not in [{before}, {after}]");
    }

    #[test]
    fn same_millisecond_ids_are_disambiguated_by_counter() {
        let generator = IdGenerator::new();
        let a = generator.create_at(IdPrefix::Tool, Direction::Ascending, 1_000);
        let b = generator.create_at(IdPrefix::Tool, Direction::Ascending, 1_000);
        assert!(a < b);
        assert_eq!(timestamp(&a), Some(1_000));
        assert_eq!(timestamp(&b), Some(1_000));
    }

    #[test]
    fn backwards_clock_keeps_ordering() {
        let generator = IdGenerator::new();
        let a = generator.create_at(IdPrefix::Part, Direction::Ascending, 5_000);
        let b = generator.create_at(IdPrefix::Part, Direction::Ascending, 4_000);
        assert!(a < b);
    }

    #[test]
    fn id_shape_has_prefix_hex_and_random_tail() {
        let id = ascending(IdPrefix::Permission);
        let rest = id.strip_prefix("per_").expect("prefix");
        assert_eq!(rest.len(), TIME_HEX_LEN + RANDOM_LEN);
        assert!(rest[..TIME_HEX_LEN].chars().all(|c| c.is_ascii_hexdigit()));
        assert!(rest[TIME_HEX_LEN..].chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn given_passes_through_matching_prefix() {
        let id = ascending(IdPrefix::Session);
        assert_eq!(given(IdPrefix::Session, &id).unwrap(), id);
    }

    #[test]
    fn given_rejects_mismatched_prefix() {
        let id = ascending(IdPrefix::Session);
        let err = given(IdPrefix::Message, &id).unwrap_err();
        assert!(matches!(err, KilnError::Validation(_)));
    }

    #[test]
    fn prefix_parses_from_string() {
        assert_eq!("prt".parse::<IdPrefix>().unwrap(), IdPrefix::Part);
        assert_eq!(IdPrefix::Tool.to_string(), "tool");
    }
}
