// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Hierarchical identifiers
//!
//! The `hiid` module provides the `AtomicID` and `HIID` types. An `HIID` is an
//! ordered sequence of atomic name tokens used as message ids, subscription
//! masks and event-registration keys throughout the kernel.
//!

use serde::{Deserialize, Serialize};

use std::fmt::{Error as FmtError, Formatter};
use std::ops::{Bound, RangeBounds};

/// Atomic name token, the building block of an [`HIID`].
///
/// The token universe is a small closed set of reserved names (wildcard,
/// scope, priority and system-event tokens) plus numeric literals and
/// free-form interned names. Equality is structural, ordering is derived
/// from the declaration order of the reserved set.
///
/// Reserved tokens render under their canonical names (`Local`, `Timeout`,
/// ...), the wildcard renders as `*`, numeric literals as plain digits.
#[derive(
    Clone, Debug, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum AtomicID {
    /// Wildcard token, matches any single token in a mask.
    Any,
    /// Publish marker used in addresses to request subscription routing.
    Publish,
    /// Scope token: same process.
    Local,
    /// Scope token: same host.
    Host,
    /// Scope token: anywhere.
    Global,
    /// Priority token.
    Lowest,
    /// Priority token.
    Lower,
    /// Priority token.
    Low,
    /// Priority token.
    Normal,
    /// Priority token.
    High,
    /// Priority token.
    Higher,
    /// Reserved first token of every system-generated event message.
    Event,
    /// System-event sub-token for timeout events.
    Timeout,
    /// System-event sub-token for input (fd readiness) events.
    Input,
    /// System-event sub-token for signal events.
    Signal,
    /// First token of the work-process lifecycle protocol messages.
    Wp,
    /// Lifecycle protocol sub-token: a work process has started.
    Hello,
    /// Lifecycle protocol sub-token: a work process has stopped.
    Bye,
    /// Lifecycle protocol sub-token: a subscription-set broadcast.
    Subscriptions,
    /// Class token of the dispatcher's own address.
    Dispatcher,
    /// Numeric literal token.
    Index(u64),
    /// Free-form name token.
    Name(String),
}

impl AtomicID {
    /// Parses a single token. Returns `None` for malformed text (empty
    /// tokens, or names that are not identifiers).
    fn parse(token: &str) -> Option<AtomicID> {
        match token {
            "" => None,
            "*" => Some(AtomicID::Any),
            "Publish" => Some(AtomicID::Publish),
            "Local" => Some(AtomicID::Local),
            "Host" => Some(AtomicID::Host),
            "Global" => Some(AtomicID::Global),
            "Lowest" => Some(AtomicID::Lowest),
            "Lower" => Some(AtomicID::Lower),
            "Low" => Some(AtomicID::Low),
            "Normal" => Some(AtomicID::Normal),
            "High" => Some(AtomicID::High),
            "Higher" => Some(AtomicID::Higher),
            "Event" => Some(AtomicID::Event),
            "Timeout" => Some(AtomicID::Timeout),
            "Input" => Some(AtomicID::Input),
            "Signal" => Some(AtomicID::Signal),
            "Wp" => Some(AtomicID::Wp),
            "Hello" => Some(AtomicID::Hello),
            "Bye" => Some(AtomicID::Bye),
            "Subscriptions" => Some(AtomicID::Subscriptions),
            "Dispatcher" => Some(AtomicID::Dispatcher),
            text => {
                if text.bytes().all(|b| b.is_ascii_digit()) {
                    text.parse().ok().map(AtomicID::Index)
                } else if text
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'_')
                {
                    Some(AtomicID::Name(text.to_string()))
                } else {
                    None
                }
            }
        }
    }

    /// True for the wildcard token.
    pub fn is_wildcard(&self) -> bool {
        matches!(self, AtomicID::Any)
    }
}

impl std::fmt::Display for AtomicID {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            AtomicID::Any => write!(f, "*"),
            AtomicID::Publish => write!(f, "Publish"),
            AtomicID::Local => write!(f, "Local"),
            AtomicID::Host => write!(f, "Host"),
            AtomicID::Global => write!(f, "Global"),
            AtomicID::Lowest => write!(f, "Lowest"),
            AtomicID::Lower => write!(f, "Lower"),
            AtomicID::Low => write!(f, "Low"),
            AtomicID::Normal => write!(f, "Normal"),
            AtomicID::High => write!(f, "High"),
            AtomicID::Higher => write!(f, "Higher"),
            AtomicID::Event => write!(f, "Event"),
            AtomicID::Timeout => write!(f, "Timeout"),
            AtomicID::Input => write!(f, "Input"),
            AtomicID::Signal => write!(f, "Signal"),
            AtomicID::Wp => write!(f, "Wp"),
            AtomicID::Hello => write!(f, "Hello"),
            AtomicID::Bye => write!(f, "Bye"),
            AtomicID::Subscriptions => write!(f, "Subscriptions"),
            AtomicID::Dispatcher => write!(f, "Dispatcher"),
            AtomicID::Index(n) => write!(f, "{}", n),
            AtomicID::Name(name) => write!(f, "{}", name),
        }
    }
}

impl From<&str> for AtomicID {
    fn from(token: &str) -> Self {
        AtomicID::parse(token).unwrap_or(AtomicID::Name(String::new()))
    }
}

impl From<u64> for AtomicID {
    fn from(index: u64) -> Self {
        AtomicID::Index(index)
    }
}

/// Hierarchical identifier: an ordered, immutable sequence of atomic tokens.
///
/// `HIID`s identify messages, subscription masks and event registrations.
/// They are value types: cloning is the only way to share one, and every
/// operation returns a new instance or mutates in place through `&mut self`.
///
/// # Matching
///
/// A mask `HIID` matches a candidate token-by-token: each mask token must be
/// identical to the candidate token or be the wildcard `*`. A mask shorter
/// than the candidate matches by prefix; [`HIID::matches_exact`] additionally
/// requires both sequences to have the same length. This single algorithm is
/// reused for routing, subscription matching and registration lookups.
///
/// # Text form
///
/// Tokens are joined with `.`: `Weather.Update.Rain`, `Event.Timeout.Sweep`.
/// Parsing malformed text does not panic or error: it yields the invalid
/// sentinel, which callers must check with [`HIID::is_valid`].
///
/// ```ignore
/// use dispatch::HIID;
///
/// let id = HIID::from("Weather.Update.Rain");
/// let mask = HIID::from("Weather.*");
/// assert!(mask.matches(&id));
/// assert_eq!(HIID::from(id.to_string().as_str()), id);
/// ```
#[derive(
    Clone, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct HIID {
    tokens: Vec<AtomicID>,
    valid: bool,
}

impl HIID {
    /// Creates an empty, valid identifier.
    pub fn new() -> Self {
        HIID {
            tokens: Vec::new(),
            valid: true,
        }
    }

    /// Returns the invalid sentinel produced by failed construction.
    pub fn invalid() -> Self {
        HIID {
            tokens: Vec::new(),
            valid: false,
        }
    }

    /// True unless this identifier is the invalid sentinel.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Number of tokens.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// True if the identifier holds no tokens.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// First token, if any.
    pub fn front(&self) -> Option<&AtomicID> {
        self.tokens.first()
    }

    /// Token at `index`, if any.
    pub fn get(&self, index: usize) -> Option<&AtomicID> {
        self.tokens.get(index)
    }

    /// Appends a single token.
    pub fn push(&mut self, token: AtomicID) {
        self.tokens.push(token);
    }

    /// Appends all tokens of `other`.
    pub fn append(&mut self, other: &HIID) {
        self.tokens.extend(other.tokens.iter().cloned());
    }

    /// Removes and returns the first token.
    pub fn pop_front(&mut self) -> Option<AtomicID> {
        if self.tokens.is_empty() {
            None
        } else {
            Some(self.tokens.remove(0))
        }
    }

    /// Returns the sub-identifier covering `range`. Out-of-bounds ranges are
    /// clamped, never panic.
    pub fn sub_id<R: RangeBounds<usize>>(&self, range: R) -> HIID {
        let start = match range.start_bound() {
            Bound::Included(n) => *n,
            Bound::Excluded(n) => n + 1,
            Bound::Unbounded => 0,
        };
        let end = match range.end_bound() {
            Bound::Included(n) => n + 1,
            Bound::Excluded(n) => *n,
            Bound::Unbounded => self.tokens.len(),
        };
        let start = start.min(self.tokens.len());
        let end = end.clamp(start, self.tokens.len());
        HIID {
            tokens: self.tokens[start..end].to_vec(),
            valid: self.valid,
        }
    }

    /// Matches this identifier, treated as a mask, against a candidate.
    ///
    /// Token-by-token: a mask token matches when it is the wildcard or equal
    /// to the candidate token. A mask shorter than the candidate matches by
    /// prefix; a mask longer than the candidate never matches.
    pub fn matches(&self, candidate: &HIID) -> bool {
        if self.tokens.len() > candidate.tokens.len() {
            return false;
        }
        self.tokens
            .iter()
            .zip(candidate.tokens.iter())
            .all(|(mask, token)| mask.is_wildcard() || mask == token)
    }

    /// Like [`HIID::matches`], but both sequences must have the same length.
    pub fn matches_exact(&self, candidate: &HIID) -> bool {
        self.tokens.len() == candidate.tokens.len() && self.matches(candidate)
    }
}

impl Default for HIID {
    fn default() -> Self {
        HIID::new()
    }
}

impl From<Vec<AtomicID>> for HIID {
    fn from(tokens: Vec<AtomicID>) -> Self {
        HIID {
            tokens,
            valid: true,
        }
    }
}

/// Parses a `.`-separated token sequence. An empty string yields the empty
/// identifier; any malformed token yields the invalid sentinel.
impl From<&str> for HIID {
    fn from(text: &str) -> Self {
        if text.is_empty() {
            return HIID::new();
        }
        let mut tokens = Vec::new();
        for part in text.split('.') {
            match AtomicID::parse(part) {
                Some(token) => tokens.push(token),
                None => return HIID::invalid(),
            }
        }
        HIID {
            tokens,
            valid: true,
        }
    }
}

impl From<String> for HIID {
    fn from(text: String) -> Self {
        HIID::from(text.as_str())
    }
}

/// Extension sugar mirroring path building: `id / "token"` appends the
/// parsed tokens of the right-hand side.
impl std::ops::Div<&str> for HIID {
    type Output = HIID;

    fn div(self, rhs: &str) -> Self::Output {
        let mut id = self;
        let tail = HIID::from(rhs);
        if !tail.valid {
            return HIID::invalid();
        }
        id.append(&tail);
        id
    }
}

impl std::fmt::Display for HIID {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        if !self.valid {
            return write!(f, "(invalid)");
        }
        let mut first = true;
        for token in &self.tokens {
            if !first {
                write!(f, ".")?;
            }
            write!(f, "{}", token)?;
            first = false;
        }
        Ok(())
    }
}

impl std::fmt::Debug for HIID {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        write!(f, "{}", self)
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn parse_empty_string() {
        let id = HIID::from("");
        assert!(id.is_valid());
        assert!(id.is_empty());
    }

    #[test]
    fn parse_tokens() {
        let id = HIID::from("Weather.Update.Rain");
        assert_eq!(id.len(), 3);
        assert_eq!(id.front(), Some(&AtomicID::Name("Weather".to_string())));
    }

    #[test]
    fn parse_reserved_and_numeric() {
        let id = HIID::from("Event.Timeout.42");
        assert_eq!(id.get(0), Some(&AtomicID::Event));
        assert_eq!(id.get(1), Some(&AtomicID::Timeout));
        assert_eq!(id.get(2), Some(&AtomicID::Index(42)));
    }

    #[test]
    fn parse_malformed_is_sentinel() {
        let id = HIID::from("Weather..Rain");
        assert!(!id.is_valid());
        let id = HIID::from("Weather.Ra-in");
        assert!(!id.is_valid());
    }

    #[test]
    fn round_trip() {
        for text in ["Weather.Update.Rain", "Event.Signal.2", "*.Update", "A"]
        {
            let id = HIID::from(text);
            assert!(id.is_valid());
            assert_eq!(HIID::from(id.to_string().as_str()), id);
        }
    }

    #[test]
    fn matches_equal_and_wildcard() {
        let id = HIID::from("Weather.Update.Rain");
        assert!(HIID::from("Weather.Update.Rain").matches(&id));
        assert!(HIID::from("Weather.*.Rain").matches(&id));
        assert!(!HIID::from("Weather.*.Snow").matches(&id));
    }

    #[test]
    fn matches_prefix() {
        let id = HIID::from("Weather.Update.Rain");
        assert!(HIID::from("Weather").matches(&id));
        assert!(HIID::from("Weather.Update").matches(&id));
        assert!(!HIID::from("Weather.Update.Rain.Heavy").matches(&id));
    }

    #[test]
    fn matches_exact_requires_length() {
        let id = HIID::from("Weather.Update.Rain");
        assert!(!HIID::from("Weather.Update").matches_exact(&id));
        assert!(HIID::from("Weather.*.Rain").matches_exact(&id));
    }

    #[test]
    fn empty_mask_matches_everything() {
        let id = HIID::from("Weather.Update");
        assert!(HIID::new().matches(&id));
        assert!(!HIID::new().matches_exact(&id));
    }

    #[test]
    fn pop_front_and_sub_id() {
        let mut id = HIID::from("Event.Timeout.Sweep.Fast");
        assert_eq!(id.pop_front(), Some(AtomicID::Event));
        assert_eq!(id.len(), 3);
        let tail = id.sub_id(1..);
        assert_eq!(tail, HIID::from("Sweep.Fast"));
        let clamped = id.sub_id(1..100);
        assert_eq!(clamped, tail);
    }

    #[test]
    fn div_appends() {
        let id = HIID::from("Weather") / "Update" / "Rain";
        assert_eq!(id, HIID::from("Weather.Update.Rain"));
    }
}
