// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Work processes
//!
//! The `wp` module provides the `WorkProcess` trait — the handler and
//! lifecycle contract every actor implements — together with the `WpContext`
//! handed to handlers and the dispatcher-internal attachment record.
//!
//! Handlers never touch the kernel directly: every operation requested
//! through the context (sends, subscriptions, event registrations) is
//! deferred into an op queue the dispatcher drains right after the handler
//! returns. Delivery is therefore always sequential and reentrancy-free,
//! which is what the single-threaded cooperative model promises.
//!

use crate::error::Error;
use crate::hiid::{AtomicID, HIID};
use crate::mailbox::Mailbox;
use crate::message::{Message, MsgAddress, Priority, Scope};
use crate::subscriptions::{Subscription, SubscriptionSet};

use async_trait::async_trait;
use tokio::time::Duration;
use tracing::{debug, error};

use std::os::unix::io::RawFd;

/// Handler return codes, the full closed set.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReturnCode {
    /// The message was consumed; drop it.
    Accept,
    /// Put the message back at the head of the queue, unpolled. The actor is
    /// not repolled until its queue changes.
    Hold,
    /// Reinsert the message into the queue by priority.
    Requeue,
    /// Event handlers only: remove the registration that produced this
    /// event. The dispatcher performs the removal right after delivery.
    Cancel,
}

/// Lifecycle state of an attached work process. Transitions are driven
/// exclusively by the dispatcher; a stopped actor cannot be restarted
/// without being re-attached.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WpState {
    /// Attached, not yet initialized.
    Attached,
    /// `init()` has completed.
    Initialized,
    /// `start()` has completed; messages are delivered.
    Started,
    /// `stop()` has run; the mailbox is closed.
    Stopped,
}

/// The actor contract: a prioritized mailbox plus handler and lifecycle
/// hooks, driven by exactly one dispatcher for the actor's lifetime.
///
/// All hooks have default implementations; a minimal actor only provides
/// [`WorkProcess::class_id`]. Handlers receive a [`WpContext`] for sending,
/// publishing, subscribing and managing event registrations.
///
/// ```ignore
/// use dispatch::{AtomicID, Message, ReturnCode, WorkProcess, WpContext};
/// use async_trait::async_trait;
///
/// struct Logger;
///
/// #[async_trait]
/// impl WorkProcess for Logger {
///     fn class_id(&self) -> AtomicID {
///         AtomicID::from("Logger")
///     }
///
///     async fn receive(
///         &mut self,
///         msg: &mut Message,
///         _ctx: &mut WpContext<'_>,
///     ) -> ReturnCode {
///         println!("{}", msg.id);
///         ReturnCode::Accept
///     }
/// }
/// ```
#[async_trait]
pub trait WorkProcess: Send + 'static {
    /// Actor class token, the first field of the assigned address.
    fn class_id(&self) -> AtomicID;

    /// Called once after attach, before any message delivery.
    async fn init(&mut self, _ctx: &mut WpContext<'_>) -> Result<(), Error> {
        Ok(())
    }

    /// Called once when the actor starts. Subscriptions registered here are
    /// broadcast as part of the startup flush.
    async fn start(&mut self, _ctx: &mut WpContext<'_>) -> Result<(), Error> {
        Ok(())
    }

    /// Called once when the actor stops or is detached.
    async fn stop(&mut self, _ctx: &mut WpContext<'_>) -> Result<(), Error> {
        Ok(())
    }

    /// Handles an ordinary message.
    async fn receive(
        &mut self,
        _msg: &mut Message,
        _ctx: &mut WpContext<'_>,
    ) -> ReturnCode {
        ReturnCode::Accept
    }

    /// Handles a timeout event. `id` is the identifier the timeout was
    /// registered under.
    async fn timeout(
        &mut self,
        _id: &HIID,
        _ctx: &mut WpContext<'_>,
    ) -> ReturnCode {
        ReturnCode::Accept
    }

    /// Handles an input event: `fd` became ready with the given readiness
    /// bits.
    async fn input(
        &mut self,
        _fd: RawFd,
        _ready: u32,
        _ctx: &mut WpContext<'_>,
    ) -> ReturnCode {
        ReturnCode::Accept
    }

    /// Handles a signal event.
    async fn signal(
        &mut self,
        _signum: i32,
        _ctx: &mut WpContext<'_>,
    ) -> ReturnCode {
        ReturnCode::Accept
    }

    /// Forwarding predicate, consulted for declared forwarders only: true if
    /// this actor relays the given non-local message.
    fn will_forward(&self, _msg: &Message) -> bool {
        false
    }
}

/// Kernel operation requested by a handler, applied by the dispatcher after
/// the handler returns.
#[derive(Debug)]
pub(crate) enum DispatchOp {
    Send { msg: Message, to: MsgAddress },
    Subscribe { mask: HIID, scope: MsgAddress },
    Unsubscribe { mask: HIID },
    AddTimeout { period: Duration, id: HIID, flags: u32 },
    RemoveTimeout { mask: HIID },
    AddInput { fd: RawFd, flags: u32 },
    RemoveInput { fd: RawFd },
    AddSignal { signum: i32, flags: u32 },
    RemoveSignal { signum: i32 },
}

/// Registration removal requested by a `Cancel` handler return.
#[derive(Debug)]
pub(crate) enum CancelRequest {
    Timeout(HIID),
    Input(RawFd),
    Signal(i32),
}

/// Execution context handed to work-process hooks.
///
/// All mutations are deferred: the context records the requested operations
/// and the dispatcher applies them once the handler has returned.
pub struct WpContext<'a> {
    address: &'a MsgAddress,
    process: &'a AtomicID,
    host: &'a AtomicID,
    ops: &'a mut Vec<DispatchOp>,
}

impl<'a> WpContext<'a> {
    pub(crate) fn new(
        address: &'a MsgAddress,
        process: &'a AtomicID,
        host: &'a AtomicID,
        ops: &'a mut Vec<DispatchOp>,
    ) -> Self {
        WpContext {
            address,
            process,
            host,
            ops,
        }
    }

    /// The address assigned to this work process at attach time.
    pub fn address(&self) -> &MsgAddress {
        self.address
    }

    /// Sends a message to an explicit destination. The sender field is
    /// stamped with this actor's address.
    pub fn send(&mut self, mut msg: Message, to: MsgAddress) {
        msg.from = self.address.clone();
        self.ops.push(DispatchOp::Send { msg, to });
    }

    /// Publishes a message to all subscribers within `scope`.
    pub fn publish(&mut self, msg: Message, scope: Scope) {
        let to = MsgAddress::publish(scope, self.process, self.host);
        self.send(msg, to);
    }

    /// Sends a reply to the originator of `original`.
    pub fn reply(&mut self, original: &Message, msg: Message) {
        let to = original.from.clone();
        self.send(msg, to);
    }

    /// Relays a message without restamping the sender field. Gateways use
    /// this to re-inject messages received from remote peers.
    pub fn forward(&mut self, msg: Message, to: MsgAddress) {
        self.ops.push(DispatchOp::Send { msg, to });
    }

    /// Subscribes to ids matching `mask` from senders within `scope`. The
    /// updated subscription set is broadcast once the actor has started.
    pub fn subscribe(&mut self, mask: HIID, scope: Scope) {
        let scope =
            MsgAddress::scope_pattern(scope, self.process, self.host);
        self.ops.push(DispatchOp::Subscribe { mask, scope });
    }

    /// Removes the subscription with exactly this mask.
    pub fn unsubscribe(&mut self, mask: HIID) {
        self.ops.push(DispatchOp::Unsubscribe { mask });
    }

    /// Registers a timeout firing every `period` under `id`.
    pub fn add_timeout(&mut self, period: Duration, id: HIID, flags: u32) {
        self.ops.push(DispatchOp::AddTimeout { period, id, flags });
    }

    /// Removes every timeout whose id matches `mask`, purging undelivered
    /// timeout messages from the mailbox.
    pub fn remove_timeout(&mut self, mask: HIID) {
        self.ops.push(DispatchOp::RemoveTimeout { mask });
    }

    /// Registers an fd readiness watch.
    pub fn add_input(&mut self, fd: RawFd, flags: u32) {
        self.ops.push(DispatchOp::AddInput { fd, flags });
    }

    /// Removes the watch on `fd`, purging undelivered input messages.
    pub fn remove_input(&mut self, fd: RawFd) {
        self.ops.push(DispatchOp::RemoveInput { fd });
    }

    /// Registers a signal watch.
    pub fn add_signal(&mut self, signum: i32, flags: u32) {
        self.ops.push(DispatchOp::AddSignal { signum, flags });
    }

    /// Removes this actor's watch on `signum`, purging undelivered signal
    /// messages.
    pub fn remove_signal(&mut self, signum: i32) {
        self.ops.push(DispatchOp::RemoveSignal { signum });
    }
}

/// Dispatcher-internal attachment record: the boxed actor plus everything
/// the kernel owns on its behalf.
pub(crate) struct WpRecord {
    pub wp: Box<dyn WorkProcess>,
    pub address: MsgAddress,
    pub mailbox: Mailbox,
    pub subscriptions: SubscriptionSet,
    pub state: WpState,
    pub lock_receive: bool,
    pub lock_queue: bool,
}

impl WpRecord {
    pub(crate) fn new(wp: Box<dyn WorkProcess>, address: MsgAddress) -> Self {
        WpRecord {
            wp,
            address,
            mailbox: Mailbox::new(),
            subscriptions: SubscriptionSet::new(),
            state: WpState::Attached,
            lock_receive: false,
            lock_queue: false,
        }
    }

    /// True while delivery to this actor must not happen: a handler is
    /// executing or the queue is administratively frozen.
    pub(crate) fn queue_locked(&self) -> bool {
        self.lock_receive || self.lock_queue
    }

    pub(crate) fn started(&self) -> bool {
        self.state == WpState::Started
    }

    /// Builds a lifecycle protocol message (`Wp.<kind>.<class>.<inst>`).
    fn protocol_message(&self, kind: AtomicID) -> Message {
        let mut id = HIID::from(vec![AtomicID::Wp, kind]);
        id.push(self.address.class.clone());
        id.push(self.address.inst.clone());
        let mut msg = Message::new(id, Priority::Normal);
        msg.from = self.address.clone();
        msg
    }

    /// Builds the subscriptions-changed broadcast carrying the encoded set.
    pub(crate) fn subscription_update(&self) -> Option<Message> {
        match self.subscriptions.to_bytes() {
            Ok(bytes) => {
                let msg = self.protocol_message(AtomicID::Subscriptions);
                Some(msg.with_payload(bytes))
            }
            Err(err) => {
                error!(
                    "Failed to encode subscription set of {}: {}",
                    self.address, err
                );
                None
            }
        }
    }

    /// Runs the `init()` hook.
    pub(crate) async fn do_init(
        &mut self,
        process: &AtomicID,
        host: &AtomicID,
        ops: &mut Vec<DispatchOp>,
    ) -> Result<(), Error> {
        debug!("Initializing work process {}.", self.address);
        {
            let mut ctx =
                WpContext::new(&self.address, process, host, ops);
            self.wp.init(&mut ctx).await.map_err(|err| {
                Error::Init(self.address.clone(), err.to_string())
            })?;
        }
        self.state = WpState::Initialized;
        Ok(())
    }

    /// Publishes the hello message, runs `start()` and flushes the
    /// subscription set. The protocol messages are emitted exactly once per
    /// transition regardless of what the override does.
    pub(crate) async fn do_start(
        &mut self,
        process: &AtomicID,
        host: &AtomicID,
        ops: &mut Vec<DispatchOp>,
    ) -> Result<(), Error> {
        debug!("Starting work process {}.", self.address);
        let hello = self.protocol_message(AtomicID::Hello);
        ops.push(DispatchOp::Send {
            msg: hello,
            to: MsgAddress::publish(Scope::Global, process, host),
        });
        {
            let mut ctx =
                WpContext::new(&self.address, process, host, ops);
            self.wp.start(&mut ctx).await.map_err(|err| {
                Error::Start(self.address.clone(), err.to_string())
            })?;
        }
        self.state = WpState::Started;
        if !self.subscriptions.is_empty() {
            if let Some(update) = self.subscription_update() {
                ops.push(DispatchOp::Send {
                    msg: update,
                    to: MsgAddress::publish(Scope::Global, process, host),
                });
            }
        }
        Ok(())
    }

    /// Publishes the bye message, runs `stop()` and closes the mailbox.
    pub(crate) async fn do_stop(
        &mut self,
        process: &AtomicID,
        host: &AtomicID,
        ops: &mut Vec<DispatchOp>,
    ) {
        debug!("Stopping work process {}.", self.address);
        let bye = self.protocol_message(AtomicID::Bye);
        ops.push(DispatchOp::Send {
            msg: bye,
            to: MsgAddress::publish(Scope::Global, process, host),
        });
        self.state = WpState::Stopped;
        {
            let mut ctx =
                WpContext::new(&self.address, process, host, ops);
            if let Err(err) = self.wp.stop(&mut ctx).await {
                error!(
                    "Work process {} failed to stop: {}",
                    self.address, err
                );
            }
        }
        self.mailbox.close();
    }

    /// Records a subscription change directly. Returns true if the set
    /// changed.
    pub(crate) fn apply_subscription(
        &mut self,
        mask: HIID,
        scope: MsgAddress,
    ) -> bool {
        self.subscriptions.add(Subscription { mask, scope })
    }

    /// Delivers the head of the queue: routes system event messages to the
    /// `timeout`/`input`/`signal` handlers by their id prefix, everything
    /// else to `receive`, and mutates the queue according to the handler's
    /// return code. Returns a registration removal request on `Cancel`.
    pub(crate) async fn poll(
        &mut self,
        process: &AtomicID,
        host: &AtomicID,
        ops: &mut Vec<DispatchOp>,
    ) -> Option<CancelRequest> {
        let Some(mut msg) = self.mailbox.pop_head() else {
            self.mailbox.set_repoll(false);
            return None;
        };
        debug!(
            "Delivering message {} to work process {}.",
            msg.id, self.address
        );
        self.lock_receive = true;
        let event_kind = if msg.is_event() {
            msg.id.get(1).cloned()
        } else {
            None
        };
        let code = {
            let mut ctx =
                WpContext::new(&self.address, process, host, ops);
            match event_kind {
                Some(AtomicID::Timeout) => {
                    let id = msg.id.sub_id(2..);
                    self.wp.timeout(&id, &mut ctx).await
                }
                Some(AtomicID::Input) => {
                    let fd = match msg.id.get(2) {
                        Some(AtomicID::Index(fd)) => *fd as RawFd,
                        _ => -1,
                    };
                    self.wp.input(fd, msg.state, &mut ctx).await
                }
                Some(AtomicID::Signal) => {
                    let signum = match msg.id.get(2) {
                        Some(AtomicID::Index(signum)) => *signum as i32,
                        _ => 0,
                    };
                    self.wp.signal(signum, &mut ctx).await
                }
                _ => self.wp.receive(&mut msg, &mut ctx).await,
            }
        };
        self.lock_receive = false;

        let cancel = if code == ReturnCode::Cancel && msg.is_event() {
            match (msg.id.get(1), msg.id.get(2)) {
                (Some(AtomicID::Timeout), _) => {
                    Some(CancelRequest::Timeout(msg.id.sub_id(2..)))
                }
                (Some(AtomicID::Input), Some(AtomicID::Index(fd))) => {
                    Some(CancelRequest::Input(*fd as RawFd))
                }
                (Some(AtomicID::Signal), Some(AtomicID::Index(signum))) => {
                    Some(CancelRequest::Signal(*signum as i32))
                }
                _ => None,
            }
        } else {
            None
        };

        msg.state = 0;
        match code {
            ReturnCode::Hold => {
                self.mailbox.push_head(msg);
                self.mailbox.set_repoll(false);
            }
            ReturnCode::Requeue => {
                self.mailbox.enqueue(msg);
                self.mailbox.set_repoll(true);
            }
            ReturnCode::Accept | ReturnCode::Cancel => {
                let more = !self.mailbox.is_empty();
                self.mailbox.set_repoll(more);
            }
        }
        cancel
    }
}
