//! Core library for the Dispatch message-passing runtime.
//! Provides the foundational components for building actor-based control and
//! data-processing suites: the dispatcher event kernel, prioritized
//! mailboxes, hierarchical addressing and publish/subscribe routing.
//! It is designed to be embedded, allowing adapter layers to drive the
//! kernel synchronously or to run the blocking poll loop as a daemon.

pub use dispatch::{
    AtomicID, Dispatcher, DispatcherConfig, Error as DispatchError,
    EventStatus, HIID, Mailbox, Message, MsgAddress, Payload,
    Priority, ReturnCode, Scope, Subscription, SubscriptionSet,
    WorkProcess, WpContext, WpState,
    EV_CONT, EV_DISCRETE, EV_IGNORE, EV_ONESHOT,
    INPUT_EXCEPT, INPUT_READ, INPUT_WRITE,
};
