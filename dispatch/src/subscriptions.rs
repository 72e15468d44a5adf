//! Subscription sets for publish matching.
//!
//! Each work process carries a set of `(mask, scope pattern)` subscriptions.
//! Publish routing delivers a message to an actor when any subscription mask
//! matches the message id and the scope pattern matches the sender address.
//! The set serializes with bincode so the subscriptions-changed broadcast can
//! carry it as an opaque payload for gateways to rebuild routing tables.

use crate::error::Error;
use crate::hiid::HIID;
use crate::message::{Message, MsgAddress};

use serde::{Deserialize, Serialize};

/// One subscription: an id mask plus a sender scope pattern.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    /// Mask matched against message ids.
    pub mask: HIID,
    /// Wildcard address matched against the sender.
    pub scope: MsgAddress,
}

/// The scope-tagged subscription set of one work process.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionSet {
    subs: Vec<Subscription>,
}

impl SubscriptionSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        SubscriptionSet::default()
    }

    /// Adds a subscription, replacing an existing one with an equal mask.
    /// Returns true if the set changed.
    pub fn add(&mut self, sub: Subscription) -> bool {
        match self.subs.iter_mut().find(|s| s.mask == sub.mask) {
            Some(existing) => {
                if *existing == sub {
                    false
                } else {
                    *existing = sub;
                    true
                }
            }
            None => {
                self.subs.push(sub);
                true
            }
        }
    }

    /// Removes the subscription with exactly this mask. Returns true if one
    /// was removed.
    pub fn remove(&mut self, mask: &HIID) -> bool {
        let before = self.subs.len();
        self.subs.retain(|s| s.mask != *mask);
        self.subs.len() != before
    }

    /// Drops every subscription.
    pub fn clear(&mut self) {
        self.subs.clear();
    }

    /// True if no subscriptions are held.
    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }

    /// Number of subscriptions.
    pub fn len(&self) -> usize {
        self.subs.len()
    }

    /// True if any subscription matches the message id and sender.
    pub fn matches(&self, msg: &Message) -> bool {
        self.subs
            .iter()
            .any(|s| s.mask.matches(&msg.id) && s.scope.matches(&msg.from))
    }

    /// Iterates over the subscriptions.
    pub fn iter(&self) -> impl Iterator<Item = &Subscription> {
        self.subs.iter()
    }

    /// Encodes the set for the subscriptions-changed broadcast payload.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        bincode::serialize(self)
            .map_err(|e| Error::Subscription(e.to_string()))
    }

    /// Decodes a set from a broadcast payload.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        bincode::deserialize(bytes)
            .map_err(|e| Error::Subscription(e.to_string()))
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::hiid::AtomicID;
    use crate::message::{Priority, Scope};

    fn subscription(mask: &str, scope: Scope) -> Subscription {
        let process = AtomicID::from("proc");
        let host = AtomicID::from("hostA");
        Subscription {
            mask: HIID::from(mask),
            scope: MsgAddress::scope_pattern(scope, &process, &host),
        }
    }

    #[test]
    fn add_replace_remove() {
        let mut set = SubscriptionSet::new();
        assert!(set.add(subscription("Weather.Update", Scope::Global)));
        assert!(!set.add(subscription("Weather.Update", Scope::Global)));
        assert!(set.add(subscription("Weather.Update", Scope::Local)));
        assert_eq!(set.len(), 1);
        assert!(set.remove(&HIID::from("Weather.Update")));
        assert!(set.is_empty());
        assert!(!set.remove(&HIID::from("Weather.Update")));
    }

    #[test]
    fn matching_respects_mask_and_scope() {
        let mut set = SubscriptionSet::new();
        set.add(subscription("Weather.Update", Scope::Local));

        let mut msg = Message::new(
            HIID::from("Weather.Update.Rain"),
            Priority::Normal,
        );
        msg.from = MsgAddress::new(
            AtomicID::from("Sensor"),
            AtomicID::Index(0),
            AtomicID::from("proc"),
            AtomicID::from("hostA"),
        );
        assert!(set.matches(&msg));

        // Same id from a foreign process fails the Local scope pattern.
        msg.from.process = AtomicID::from("other");
        assert!(!set.matches(&msg));

        msg.from.process = AtomicID::from("proc");
        msg.id = HIID::from("Pointing.Update");
        assert!(!set.matches(&msg));
    }

    #[test]
    fn bytes_round_trip() {
        let mut set = SubscriptionSet::new();
        set.add(subscription("Weather.Update", Scope::Global));
        set.add(subscription("Pointing", Scope::Host));
        let bytes = set.to_bytes().unwrap();
        let decoded = SubscriptionSet::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, set);
    }
}
