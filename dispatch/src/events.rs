// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! Event-source registrations: timeouts, fd inputs and signals.
//!
//! All three kinds share one registration struct with a kind tag; the
//! dispatcher dispatches on the tag. Each registration carries a template
//! message (addressed from the dispatcher to the owning work process, id
//! prefixed with the reserved `Event` token) that is cloned and enqueued
//! when the source fires.

use crate::error::Error;
use crate::message::{Message, MsgAddress};

use tokio::io::unix::AsyncFd;
use tokio::io::{Interest, Ready};
use tokio::time::{Duration, Instant};

use std::future::Future;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::task::{Context, Poll};

/// Continuous event: refires until removed.
pub const EV_CONT: u32 = 0x01;
/// One-shot event: fires once, then the registration is removed.
pub const EV_ONESHOT: u32 = 0x02;
/// Signals only: enqueue a fresh message per raise instead of coalescing.
pub const EV_DISCRETE: u32 = 0x04;
/// Signals only: count raises, enqueue nothing.
pub const EV_IGNORE: u32 = 0x08;

/// Input readiness bit: the fd is readable.
pub const INPUT_READ: u32 = 0x01;
/// Input readiness bit: the fd is writable.
pub const INPUT_WRITE: u32 = 0x02;
/// Input readiness bit: an exceptional condition is pending.
pub const INPUT_EXCEPT: u32 = 0x04;

/// Kind-specific part of an event registration.
#[derive(Debug)]
pub(crate) enum EventKind {
    /// Interval timer.
    Timeout {
        period: Duration,
        next: Instant,
        flags: u32,
    },
    /// File-descriptor readiness watch.
    Input {
        fd: RawFd,
        flags: u32,
        afd: AsyncFd<RawFd>,
        pending: u32,
    },
    /// POSIX signal watch.
    Signal {
        signum: i32,
        flags: u32,
        counter: u64,
    },
}

/// One event registration, owned by the dispatcher on behalf of one work
/// process.
#[derive(Debug)]
pub(crate) struct EventRegistration {
    pub owner: MsgAddress,
    pub template: Message,
    pub kind: EventKind,
}

/// Maps input flag bits to the OS interest set. An empty flag set defaults
/// to read interest.
pub(crate) fn interest_from_flags(flags: u32) -> Interest {
    let mut interest = None;
    if flags & INPUT_READ != 0 {
        interest = Some(Interest::READABLE);
    }
    if flags & INPUT_WRITE != 0 {
        interest = Some(match interest {
            Some(i) => i | Interest::WRITABLE,
            None => Interest::WRITABLE,
        });
    }
    if flags & INPUT_EXCEPT != 0 {
        interest = Some(match interest {
            Some(i) => i | Interest::PRIORITY,
            None => Interest::PRIORITY,
        });
    }
    interest.unwrap_or(Interest::READABLE)
}

/// Maps an OS readiness report back to input flag bits.
pub(crate) fn ready_to_flags(ready: Ready) -> u32 {
    let mut flags = 0;
    if ready.is_readable() {
        flags |= INPUT_READ;
    }
    if ready.is_writable() {
        flags |= INPUT_WRITE;
    }
    if ready.is_priority() {
        flags |= INPUT_EXCEPT;
    }
    flags
}

/// Registers `fd` with the runtime reactor for the interests implied by the
/// input flags. The kernel never takes ownership of the descriptor; closing
/// it remains the caller's business.
pub(crate) fn async_fd(fd: RawFd, flags: u32) -> Result<AsyncFd<RawFd>, Error> {
    AsyncFd::with_interest(fd, interest_from_flags(flags))
        .map_err(|err| Error::Input(fd, err.to_string()))
}

/// Non-blocking readiness probe. Polls the fd once with a no-op waker and
/// returns the readiness bits, clearing the cached readiness so the next
/// edge re-arms the watch.
pub(crate) fn probe_ready(afd: &AsyncFd<RawFd>, flags: u32) -> u32 {
    let waker = futures::task::noop_waker_ref();
    let mut cx = Context::from_waker(waker);
    let fut = afd.ready(interest_from_flags(flags));
    let mut fut = std::pin::pin!(fut);
    match fut.as_mut().poll(&mut cx) {
        Poll::Ready(Ok(mut guard)) => {
            let bits = ready_to_flags(guard.ready());
            guard.clear_ready();
            bits
        }
        _ => 0,
    }
}

/// Waits until any registered input becomes ready, returning its index in
/// the registration list and the readiness bits. Pends forever when no
/// inputs are registered. Signal interruptions of the underlying wait retry
/// transparently.
pub(crate) async fn wait_input(
    events: &[EventRegistration],
) -> (usize, u32) {
    let waiters: Vec<_> = events
        .iter()
        .enumerate()
        .filter_map(|(index, reg)| match &reg.kind {
            EventKind::Input { afd, flags, .. } => {
                let interest = interest_from_flags(*flags);
                Some(Box::pin(async move {
                    loop {
                        if let Ok(mut guard) = afd.ready(interest).await {
                            let bits = ready_to_flags(guard.ready());
                            guard.clear_ready();
                            if bits != 0 {
                                return (index, bits);
                            }
                        }
                    }
                }))
            }
            _ => None,
        })
        .collect();
    if waiters.is_empty() {
        std::future::pending().await
    } else {
        let ((index, bits), _, _) =
            futures::future::select_all(waiters).await;
        (index, bits)
    }
}

/// Raised-signal flags shared between the kernel loop and the per-signal
/// forwarder tasks.
///
/// The forwarder side may only set bits and bump counters; converting raises
/// into mailbox insertions happens later, inside the loop. This preserves
/// the discipline the OS imposes on real signal handlers.
#[derive(Debug)]
pub(crate) struct RaisedSignals {
    mask: AtomicU64,
    counts: [AtomicU32; 64],
}

impl RaisedSignals {
    pub fn new() -> Self {
        RaisedSignals {
            mask: AtomicU64::new(0),
            counts: std::array::from_fn(|_| AtomicU32::new(0)),
        }
    }

    /// Marks `signum` raised. Safe to call from any task at any time.
    pub fn raise(&self, signum: i32) {
        if !(1..=64).contains(&signum) {
            return;
        }
        let slot = (signum - 1) as usize;
        self.counts[slot].fetch_add(1, Ordering::Relaxed);
        self.mask.fetch_or(1 << slot, Ordering::Release);
    }

    /// Drains the raised set: every raised signal with the number of raises
    /// since the last drain.
    pub fn take(&self) -> Vec<(i32, u32)> {
        let mask = self.mask.swap(0, Ordering::Acquire);
        if mask == 0 {
            return Vec::new();
        }
        let mut raised = Vec::new();
        for slot in 0..64 {
            if mask & (1 << slot) != 0 {
                let count = self.counts[slot].swap(0, Ordering::Relaxed);
                raised.push((slot as i32 + 1, count.max(1)));
            }
        }
        raised
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn raise_and_take() {
        let raised = RaisedSignals::new();
        raised.raise(10);
        raised.raise(10);
        raised.raise(2);
        let mut drained = raised.take();
        drained.sort();
        assert_eq!(drained, vec![(2, 1), (10, 2)]);
        assert!(raised.take().is_empty());
    }

    #[test]
    fn out_of_range_signum_ignored() {
        let raised = RaisedSignals::new();
        raised.raise(0);
        raised.raise(65);
        assert!(raised.take().is_empty());
    }

    #[test]
    fn interest_defaults_to_read() {
        assert!(interest_from_flags(0).is_readable());
        assert!(interest_from_flags(INPUT_READ).is_readable());
        let both = interest_from_flags(INPUT_READ | INPUT_WRITE);
        assert!(both.is_readable() && both.is_writable());
    }

    #[test]
    fn ready_bits_round_trip() {
        assert_eq!(ready_to_flags(Ready::EMPTY), 0);
    }
}
