// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Dispatch Kernel
//!
//! A single-threaded, prioritized message-passing runtime for building
//! control and data-processing suites out of cooperating actors ("work
//! processes"). The kernel gives every actor a priority-ordered mailbox, a
//! uniform four-part addressing scheme with publish/subscribe routing, and
//! one event loop that multiplexes timers, POSIX signals and file-descriptor
//! readiness into the same delivery mechanism as ordinary messages.
//!
//! ## Overview
//!
//! A [`Dispatcher`] owns a set of attached [`WorkProcess`] actors. Messages
//! carry a hierarchical identifier ([`HIID`]), a six-level [`Priority`] and
//! sender/destination addresses ([`MsgAddress`]); the payload is an opaque
//! shared value. Routing evaluates three independent branches per send:
//! exact local delivery, wildcard/publish broadcast, and relaying through
//! declared gateway actors for non-local destinations. Fan-out pays exactly
//! one deep copy of the payload: the message is privatized before the first
//! delivery and shared read-only afterwards, so no recipient ever observes
//! another's mutation.
//!
//! ## Execution model
//!
//! The kernel is a cooperative single-threaded reactor: exactly one logical
//! task runs [`Dispatcher::poll`]/[`Dispatcher::poll_loop`], and delivery is
//! always sequential, so actors need no locking between them. Event sources
//! (heartbeat timer, timeouts, fd readiness, signals) are converted into
//! system messages and delivered through the same mailboxes; the only
//! asynchronous code path — signal forwarding — is restricted to setting
//! atomic flags.
//!
//! In response to a message, a work process can:
//! - consume, hold or requeue it through its [`ReturnCode`]
//! - send or publish further messages through its [`WpContext`]
//! - change its subscription set (broadcast to peers and gateways)
//! - register or cancel timeout, input and signal event sources
//!
//! ## Getting started
//!
//! ```ignore
//! use dispatch::{
//!     AtomicID, Dispatcher, DispatcherConfig, HIID, Message, Priority,
//!     ReturnCode, Scope, WorkProcess, WpContext,
//! };
//! use async_trait::async_trait;
//!
//! struct WeatherDisplay;
//!
//! #[async_trait]
//! impl WorkProcess for WeatherDisplay {
//!     fn class_id(&self) -> AtomicID {
//!         AtomicID::from("WeatherDisplay")
//!     }
//!
//!     async fn start(
//!         &mut self,
//!         ctx: &mut WpContext<'_>,
//!     ) -> Result<(), dispatch::Error> {
//!         ctx.subscribe(HIID::from("Weather.Update"), Scope::Global);
//!         Ok(())
//!     }
//!
//!     async fn receive(
//!         &mut self,
//!         msg: &mut dispatch::Message,
//!         _ctx: &mut WpContext<'_>,
//!     ) -> ReturnCode {
//!         println!("weather: {}", msg.id);
//!         ReturnCode::Accept
//!     }
//! }
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), dispatch::Error> {
//!     let mut dispatcher = Dispatcher::new(DispatcherConfig::default());
//!     dispatcher.attach(Box::new(WeatherDisplay)).await?;
//!     dispatcher.start().await?;
//!
//!     let msg = Message::new(
//!         HIID::from("Weather.Update.Rain"),
//!         Priority::Normal,
//!     );
//!     dispatcher.publish(msg, Scope::Global);
//!     while dispatcher.poll().await {}
//!     Ok(())
//! }
//! ```
//!
//! Daemon-style programs run [`Dispatcher::poll_loop`] with a cancellation
//! token instead of draining [`Dispatcher::poll`] by hand; the loop blocks
//! on the heartbeat, timeout deadlines, fd readiness and raised signals,
//! whichever comes first.
//!

// Private modules containing the implementation
mod dispatcher;
mod error;
mod events;
mod hiid;
mod mailbox;
mod message;
mod subscriptions;
mod wp;

//
// Identifiers and addressing
//

/// Atomic name token: the reserved token universe plus numeric literals and
/// free-form names.
pub use hiid::AtomicID;

/// Hierarchical identifier: an ordered token sequence with wildcard/prefix
/// matching, used for message ids, subscription masks and registration keys.
pub use hiid::HIID;

/// Four-part work-process address with `Any`/`Publish` wildcard matching.
pub use message::MsgAddress;

//
// Messages
//

/// Message envelope: id, priority, addresses, shared payload and the
/// synthetic-event scratch field.
pub use message::Message;

/// Object-safe payload contract; any `Clone + Debug + Send + Sync` type
/// qualifies.
pub use message::Payload;

/// Six-level message priority, `Lowest` through `Higher`.
pub use message::Priority;

/// Routing breadth: `Local`, `Host` or `Global`.
pub use message::Scope;

//
// Mailboxes
//

/// Priority-ordered message queue of one work process.
pub use mailbox::Mailbox;

/// Status codes of the synchronous mailbox accessor: `Success`, `Wait`,
/// `Closed`, `OutOfSeq`.
pub use mailbox::EventStatus;

//
// Work processes
//

/// The actor contract: lifecycle hooks, message/event handlers and the
/// forwarding predicate.
pub use wp::WorkProcess;

/// Execution context handed to handlers; defers kernel mutations until the
/// handler returns.
pub use wp::WpContext;

/// Handler return codes: `Accept`, `Hold`, `Requeue`, `Cancel`.
pub use wp::ReturnCode;

/// Lifecycle state of an attached work process.
pub use wp::WpState;

//
// Subscriptions
//

/// One subscription: id mask plus sender scope pattern.
pub use subscriptions::Subscription;

/// The scope-tagged subscription set of one work process.
pub use subscriptions::SubscriptionSet;

//
// Event sources
//

/// Continuous event flag: the registration refires until removed.
pub use events::EV_CONT;

/// One-shot event flag: the registration fires once and is removed.
pub use events::EV_ONESHOT;

/// Discrete signal flag: one fresh message per raise instead of coalescing.
pub use events::EV_DISCRETE;

/// Counting signal flag: raises are counted, no message is enqueued.
pub use events::EV_IGNORE;

/// Input readiness bit: readable.
pub use events::INPUT_READ;

/// Input readiness bit: writable.
pub use events::INPUT_WRITE;

/// Input readiness bit: exceptional condition.
pub use events::INPUT_EXCEPT;

//
// The kernel
//

/// The event kernel: actor ownership, routing, event sources and the poll
/// loop.
pub use dispatcher::Dispatcher;

/// Dispatcher configuration: process and host tokens plus the heartbeat
/// rate.
pub use dispatcher::DispatcherConfig;

//
// Error handling
//

/// Error type for all kernel operations.
pub use error::Error;
