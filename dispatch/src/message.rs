// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Messages and addressing
//!
//! The `message` module provides the `Message` envelope, the four-part
//! `MsgAddress` and the `Priority`/`Scope` token resolvers.
//!

use crate::hiid::{AtomicID, HIID};

use serde::{Deserialize, Serialize};
use tracing::debug;

use std::any::Any;
use std::fmt::{Error as FmtError, Formatter};
use std::sync::Arc;

/// Message priority. Six levels, ordered; higher priorities are delivered
/// first.
#[derive(
    Clone,
    Copy,
    Debug,
    Hash,
    Eq,
    PartialEq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
pub enum Priority {
    /// Lowest priority.
    Lowest,
    /// Lower priority.
    Lower,
    /// Low priority.
    Low,
    /// Normal priority, the default.
    Normal,
    /// High priority. System event messages are enqueued at this level.
    High,
    /// Highest priority.
    Higher,
}

impl Priority {
    /// Strips a recognized leading priority token from `id` and returns the
    /// corresponding priority, else returns `default`.
    pub fn resolve(id: &mut HIID, default: Priority) -> Priority {
        let priority = match id.front() {
            Some(AtomicID::Lowest) => Priority::Lowest,
            Some(AtomicID::Lower) => Priority::Lower,
            Some(AtomicID::Low) => Priority::Low,
            Some(AtomicID::Normal) => Priority::Normal,
            Some(AtomicID::High) => Priority::High,
            Some(AtomicID::Higher) => Priority::Higher,
            _ => return default,
        };
        id.pop_front();
        priority
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Routing breadth of a message: same process, same host, or anywhere.
#[derive(
    Clone,
    Copy,
    Debug,
    Hash,
    Eq,
    PartialEq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
pub enum Scope {
    /// Same process only.
    Local,
    /// Same host only.
    Host,
    /// Any host.
    Global,
}

impl Scope {
    /// Strips a recognized leading scope token from `id` and returns the
    /// corresponding scope, else returns `default`.
    pub fn resolve(id: &mut HIID, default: Scope) -> Scope {
        let scope = match id.front() {
            Some(AtomicID::Local) => Scope::Local,
            Some(AtomicID::Host) => Scope::Host,
            Some(AtomicID::Global) => Scope::Global,
            _ => return default,
        };
        id.pop_front();
        scope
    }
}

/// Four-part work-process address: actor class, instance, process and host.
///
/// The wildcard tokens `Any` and `Publish` participate in matching: an
/// address matches a concrete one when every field is a wildcard or equal to
/// the corresponding concrete field. Addresses are assigned once when a work
/// process attaches to a dispatcher and are immutable afterwards.
#[derive(Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct MsgAddress {
    /// Actor class token.
    pub class: AtomicID,
    /// Instance number within the class, assigned at attach time.
    pub inst: AtomicID,
    /// Process the actor lives in.
    pub process: AtomicID,
    /// Host the actor lives on.
    pub host: AtomicID,
}

impl MsgAddress {
    /// Creates an address from its four fields.
    pub fn new(
        class: AtomicID,
        inst: AtomicID,
        process: AtomicID,
        host: AtomicID,
    ) -> Self {
        MsgAddress {
            class,
            inst,
            process,
            host,
        }
    }

    /// Builds the publish address for `scope`. Fields outside the scope are
    /// the `Publish` wildcard; fields inside it are pinned to the local
    /// process and host so narrower scopes do not leave them.
    pub fn publish(scope: Scope, process: &AtomicID, host: &AtomicID) -> Self {
        match scope {
            Scope::Global => MsgAddress::new(
                AtomicID::Publish,
                AtomicID::Publish,
                AtomicID::Publish,
                AtomicID::Publish,
            ),
            Scope::Host => MsgAddress::new(
                AtomicID::Publish,
                AtomicID::Publish,
                AtomicID::Publish,
                host.clone(),
            ),
            Scope::Local => MsgAddress::new(
                AtomicID::Publish,
                AtomicID::Publish,
                process.clone(),
                host.clone(),
            ),
        }
    }

    /// Builds the wildcard pattern a subscriber at `process`/`host` uses to
    /// restrict matched senders to `scope`.
    pub fn scope_pattern(
        scope: Scope,
        process: &AtomicID,
        host: &AtomicID,
    ) -> Self {
        match scope {
            Scope::Global => MsgAddress::new(
                AtomicID::Any,
                AtomicID::Any,
                AtomicID::Any,
                AtomicID::Any,
            ),
            Scope::Host => MsgAddress::new(
                AtomicID::Any,
                AtomicID::Any,
                AtomicID::Any,
                host.clone(),
            ),
            Scope::Local => MsgAddress::new(
                AtomicID::Any,
                AtomicID::Any,
                process.clone(),
                host.clone(),
            ),
        }
    }

    fn field_matches(field: &AtomicID, concrete: &AtomicID) -> bool {
        matches!(field, AtomicID::Any | AtomicID::Publish)
            || field == concrete
    }

    /// Matches this address, treated as a pattern, against a concrete one.
    pub fn matches(&self, concrete: &MsgAddress) -> bool {
        Self::field_matches(&self.class, &concrete.class)
            && Self::field_matches(&self.inst, &concrete.inst)
            && Self::field_matches(&self.process, &concrete.process)
            && Self::field_matches(&self.host, &concrete.host)
    }

    /// True if any field carries the `Publish` marker, requesting
    /// subscription-based routing.
    pub fn is_publish(&self) -> bool {
        self.class == AtomicID::Publish
            || self.inst == AtomicID::Publish
            || self.process == AtomicID::Publish
            || self.host == AtomicID::Publish
    }

    /// True if the class or instance field is a wildcard.
    pub fn is_broadcast(&self) -> bool {
        matches!(self.class, AtomicID::Any | AtomicID::Publish)
            || matches!(self.inst, AtomicID::Any | AtomicID::Publish)
    }
}

impl Default for MsgAddress {
    fn default() -> Self {
        MsgAddress::new(
            AtomicID::Any,
            AtomicID::Any,
            AtomicID::Any,
            AtomicID::Any,
        )
    }
}

impl std::fmt::Display for MsgAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        write!(
            f,
            "{}.{}@{}.{}",
            self.class, self.inst, self.process, self.host
        )
    }
}

impl std::fmt::Debug for MsgAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        write!(f, "{}", self)
    }
}

/// Object-safe payload contract. Any `Clone + Debug + Send + Sync` type is a
/// payload; the manual clone hook supports deep-copying behind `dyn`.
pub trait Payload: Any + Send + Sync + std::fmt::Debug {
    /// Deep-copies the payload.
    fn clone_payload(&self) -> Box<dyn Payload>;
    /// Upcast for downcasting to the concrete type.
    fn as_any(&self) -> &dyn Any;
    /// Mutable upcast for downcasting to the concrete type.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T> Payload for T
where
    T: Any + Clone + Send + Sync + std::fmt::Debug,
{
    fn clone_payload(&self) -> Box<dyn Payload> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Message envelope: id, priority, addresses, an opaque shared payload and
/// the `state` scratch field.
///
/// A message is conceptually read-only once delivered to more than one
/// recipient. The dispatcher calls [`Message::privatize`] exactly once per
/// send fan-out, deep-copying the payload into a private instance; every
/// further recipient receives a shallow [`Clone`] sharing that instance. A
/// recipient that wants to mutate its payload goes through
/// [`Message::payload_mut`], which copies the payload out of the shared
/// allocation first, so no recipient ever observes another's mutation.
///
/// `state` is the only mutable field: it carries synthetic event data
/// (fd readiness bits) for system event messages and is reset to zero after
/// every delivery.
#[derive(Clone, Debug)]
pub struct Message {
    /// Message identifier, never empty.
    pub id: HIID,
    /// Delivery priority.
    pub priority: Priority,
    /// Sender address.
    pub from: MsgAddress,
    /// Destination address, set by the dispatcher on send.
    pub to: MsgAddress,
    /// Synthetic event scratch field.
    pub state: u32,
    payload: Option<Arc<dyn Payload>>,
}

impl Message {
    /// Creates a message from an id and priority. The id must be a valid,
    /// non-empty identifier; anything else is a programmer error and fails
    /// fast.
    pub fn new(id: HIID, priority: Priority) -> Self {
        assert!(
            id.is_valid() && !id.is_empty(),
            "message id must be a valid non-empty identifier"
        );
        Message {
            id,
            priority,
            from: MsgAddress::default(),
            to: MsgAddress::default(),
            state: 0,
            payload: None,
        }
    }

    /// Attaches a payload.
    pub fn with_payload<P>(mut self, payload: P) -> Self
    where
        P: Payload,
    {
        self.payload = Some(Arc::new(payload));
        self
    }

    /// True if a payload is attached.
    pub fn has_payload(&self) -> bool {
        self.payload.is_some()
    }

    /// Read access to the payload, downcast to `P`.
    pub fn payload_ref<P: Payload>(&self) -> Option<&P> {
        self.payload
            .as_deref()
            .and_then(|p| p.as_any().downcast_ref())
    }

    /// Mutable access to the payload, downcast to `P`. If the payload is
    /// shared with other recipients it is copied out first, so the mutation
    /// stays private to this message.
    pub fn payload_mut<P: Payload>(&mut self) -> Option<&mut P> {
        let payload = self.payload.as_mut()?;
        if Arc::get_mut(payload).is_none() {
            debug!(id = %self.id, "copying shared payload before mutation");
            let private: Arc<dyn Payload> =
                Arc::from(payload.clone_payload());
            *payload = private;
        }
        Arc::get_mut(payload).and_then(|p| p.as_any_mut().downcast_mut())
    }

    /// Deep-copies the payload into a fresh private allocation. Called by
    /// the dispatcher once per send, before the first delivery of a fan-out.
    pub fn privatize(&mut self) {
        if let Some(payload) = self.payload.as_mut() {
            if Arc::get_mut(payload).is_none() {
                *payload = Arc::from(payload.clone_payload());
            }
        }
    }

    /// True if this message is a system-generated event message.
    pub fn is_event(&self) -> bool {
        self.front_is(&AtomicID::Event)
    }

    /// True if this id starts with `token`.
    pub fn front_is(&self, token: &AtomicID) -> bool {
        self.id.front() == Some(token)
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn priority_order() {
        assert!(Priority::Higher > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert!(Priority::Low > Priority::Lower);
        assert!(Priority::Lower > Priority::Lowest);
    }

    #[test]
    fn resolve_priority_strips_token() {
        let mut id = HIID::from("High.Weather.Update");
        let priority = Priority::resolve(&mut id, Priority::Normal);
        assert_eq!(priority, Priority::High);
        assert_eq!(id, HIID::from("Weather.Update"));

        let mut id = HIID::from("Weather.Update");
        let priority = Priority::resolve(&mut id, Priority::Normal);
        assert_eq!(priority, Priority::Normal);
        assert_eq!(id, HIID::from("Weather.Update"));
    }

    #[test]
    fn resolve_scope_strips_token() {
        let mut id = HIID::from("Global.Weather.Update");
        let scope = Scope::resolve(&mut id, Scope::Local);
        assert_eq!(scope, Scope::Global);
        assert_eq!(id, HIID::from("Weather.Update"));

        let mut id = HIID::from("Weather.Update");
        assert_eq!(Scope::resolve(&mut id, Scope::Host), Scope::Host);
    }

    #[test]
    fn address_matching() {
        let concrete = MsgAddress::new(
            AtomicID::from("Sensor"),
            AtomicID::Index(1),
            AtomicID::from("proc"),
            AtomicID::from("hostA"),
        );
        let any = MsgAddress::default();
        assert!(any.matches(&concrete));

        let pattern = MsgAddress::new(
            AtomicID::from("Sensor"),
            AtomicID::Any,
            AtomicID::from("proc"),
            AtomicID::from("hostA"),
        );
        assert!(pattern.matches(&concrete));

        let other = MsgAddress::new(
            AtomicID::from("Sensor"),
            AtomicID::Index(1),
            AtomicID::from("proc"),
            AtomicID::from("hostB"),
        );
        assert!(!pattern.matches(&other));
    }

    #[test]
    fn publish_address_by_scope() {
        let process = AtomicID::from("proc");
        let host = AtomicID::from("hostA");
        let global = MsgAddress::publish(Scope::Global, &process, &host);
        assert!(global.is_publish());
        assert_eq!(global.host, AtomicID::Publish);

        let local = MsgAddress::publish(Scope::Local, &process, &host);
        assert_eq!(local.process, process);
        assert_eq!(local.host, host);
        assert!(local.is_publish());
    }

    #[test]
    #[should_panic(expected = "message id must be a valid non-empty")]
    fn empty_id_fails_fast() {
        let _ = Message::new(HIID::new(), Priority::Normal);
    }

    #[test]
    fn payload_round_trip() {
        let msg = Message::new(HIID::from("Data"), Priority::Normal)
            .with_payload(vec![1u32, 2, 3]);
        assert_eq!(msg.payload_ref::<Vec<u32>>(), Some(&vec![1, 2, 3]));
        assert!(msg.payload_ref::<String>().is_none());
    }

    #[test]
    fn shared_payload_mutation_is_private() {
        let mut first = Message::new(HIID::from("Data"), Priority::Normal)
            .with_payload(vec![1u32, 2, 3]);
        first.privatize();
        let mut second = first.clone();
        let third = first.clone();

        second.payload_mut::<Vec<u32>>().unwrap().push(4);

        assert_eq!(second.payload_ref::<Vec<u32>>().unwrap().len(), 4);
        assert_eq!(first.payload_ref::<Vec<u32>>().unwrap().len(), 3);
        assert_eq!(third.payload_ref::<Vec<u32>>().unwrap().len(), 3);
    }
}
