// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Dispatcher
//!
//! The `dispatcher` module provides the event kernel: it owns the attached
//! work processes, the event-source registrations and the poll loop that
//! turns timer expiries, fd readiness and raised signals into mailbox
//! insertions, and delivers exactly one top-priority message per pass.
//!
//! ## Execution model
//!
//! The dispatcher is a single-threaded cooperative reactor. One task drives
//! [`Dispatcher::poll_loop`]; there is no actor-level parallelism, so no
//! locking between actors is needed. The only asynchronous inputs are the
//! per-signal forwarder tasks, which are restricted to setting atomic flags
//! and pinging a [`Notify`] — the loop converts raised flags into messages
//! on its next pass.
//!
//! [`Dispatcher::poll`] never blocks: it performs event-source bookkeeping
//! plus at most one delivery and returns. Callers that embed the kernel in
//! their own loop (adapter layers) call it directly; daemon-style programs
//! run `poll_loop` until the cancellation token fires.

use crate::error::Error;
use crate::events::{
    probe_ready, wait_input, EventKind, EventRegistration, RaisedSignals,
    EV_DISCRETE, EV_IGNORE, EV_ONESHOT,
};
use crate::hiid::{AtomicID, HIID};
use crate::message::{Message, MsgAddress, Priority, Scope};
use crate::wp::{CancelRequest, DispatchOp, WorkProcess, WpRecord, WpState};

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::Arc;

/// Dispatcher configuration.
#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    /// Process token of every address assigned by this dispatcher.
    pub process: AtomicID,
    /// Host token of every address assigned by this dispatcher.
    pub host: AtomicID,
    /// Heartbeat rate in Hz; the granularity floor of timeout and input
    /// checks when the loop is otherwise idle.
    pub heartbeat_hz: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            process: AtomicID::from("local"),
            host: AtomicID::from("localhost"),
            heartbeat_hz: 100,
        }
    }
}

/// The event kernel.
///
/// Owns the attached work processes and all event-source registrations.
/// Everything is instance state; the process-global part of signal delivery
/// lives in the tokio signal driver, and the per-signal forwarder tasks this
/// kernel spawns only touch the shared raised-flags word.
pub struct Dispatcher {
    config: DispatcherConfig,
    address: MsgAddress,
    wps: Vec<WpRecord>,
    instance_counts: HashMap<AtomicID, u64>,
    forwarders: Vec<MsgAddress>,
    events: Vec<EventRegistration>,
    raised: Arc<RaisedSignals>,
    signal_tasks: HashMap<i32, JoinHandle<()>>,
    notify: Arc<Notify>,
    started: bool,
    polling: bool,
    undelivered: u64,
}

impl Dispatcher {
    /// Creates a dispatcher from its configuration.
    pub fn new(config: DispatcherConfig) -> Self {
        let address = MsgAddress::new(
            AtomicID::Dispatcher,
            AtomicID::Index(0),
            config.process.clone(),
            config.host.clone(),
        );
        Dispatcher {
            config,
            address,
            wps: Vec::new(),
            instance_counts: HashMap::new(),
            forwarders: Vec::new(),
            events: Vec::new(),
            raised: Arc::new(RaisedSignals::new()),
            signal_tasks: HashMap::new(),
            notify: Arc::new(Notify::new()),
            started: false,
            polling: false,
            undelivered: 0,
        }
    }

    /// The dispatcher's own address, the sender of system messages.
    pub fn address(&self) -> &MsgAddress {
        &self.address
    }

    /// True once [`Dispatcher::start`] has run.
    pub fn is_running(&self) -> bool {
        self.started
    }

    /// Addresses of all attached work processes, in attach order.
    pub fn attached(&self) -> Vec<MsgAddress> {
        self.wps.iter().map(|rec| rec.address.clone()).collect()
    }

    /// Lifecycle state of the work process at `address`.
    pub fn wp_state(&self, address: &MsgAddress) -> Option<WpState> {
        self.record(address).map(|rec| rec.state)
    }

    /// Number of event registrations owned by `owner`.
    pub fn owned_registrations(&self, owner: &MsgAddress) -> usize {
        self.events.iter().filter(|reg| reg.owner == *owner).count()
    }

    /// Queue length of the mailbox at `address`.
    pub fn mailbox_len(&self, address: &MsgAddress) -> Option<usize> {
        self.record(address).map(|rec| rec.mailbox.len())
    }

    /// Freezes or thaws delivery to `address` without touching its queue.
    pub fn set_queue_locked(
        &mut self,
        address: &MsgAddress,
        locked: bool,
    ) -> Result<(), Error> {
        let rec = self.record_mut_err(address)?;
        rec.lock_queue = locked;
        Ok(())
    }

    fn record(&self, address: &MsgAddress) -> Option<&WpRecord> {
        self.wps.iter().find(|rec| rec.address == *address)
    }

    fn record_mut_err(
        &mut self,
        address: &MsgAddress,
    ) -> Result<&mut WpRecord, Error> {
        self.wps
            .iter_mut()
            .find(|rec| rec.address == *address)
            .ok_or_else(|| Error::UnknownAddress(address.clone()))
    }

    /// Attaches a work process, assigning its address from the per-class
    /// instance counter and this dispatcher's process and host. If the
    /// dispatcher is already running, the actor is initialized and started
    /// immediately.
    pub async fn attach(
        &mut self,
        wp: Box<dyn WorkProcess>,
    ) -> Result<MsgAddress, Error> {
        let class = wp.class_id();
        let count = self.instance_counts.entry(class.clone()).or_insert(0);
        let inst = *count;
        *count += 1;
        let address = MsgAddress::new(
            class,
            AtomicID::Index(inst),
            self.config.process.clone(),
            self.config.host.clone(),
        );
        debug!("Attaching work process {}.", address);
        let mut record = WpRecord::new(wp, address.clone());
        if self.started {
            let process = self.config.process.clone();
            let host = self.config.host.clone();
            let mut ops = Vec::new();
            record.do_init(&process, &host, &mut ops).await?;
            record.do_start(&process, &host, &mut ops).await?;
            self.wps.push(record);
            self.apply_ops(address.clone(), ops);
        } else {
            self.wps.push(record);
        }
        Ok(address)
    }

    /// Detaches the work process at `address`: runs its stop hook, purges
    /// every registration and queued message it owns and releases it.
    pub async fn detach(&mut self, address: &MsgAddress) -> Result<(), Error> {
        let idx = self
            .wps
            .iter()
            .position(|rec| rec.address == *address)
            .ok_or_else(|| Error::UnknownAddress(address.clone()))?;
        debug!("Detaching work process {}.", address);
        let process = self.config.process.clone();
        let host = self.config.host.clone();
        let mut ops = Vec::new();
        if self.wps[idx].started() {
            self.wps[idx].do_stop(&process, &host, &mut ops).await;
        } else {
            self.wps[idx].state = WpState::Stopped;
            self.wps[idx].mailbox.close();
        }
        self.apply_ops(address.clone(), ops);
        self.purge_owner(address);
        self.forwarders.retain(|fwd| fwd != address);
        self.wps.retain(|rec| rec.address != *address);
        Ok(())
    }

    /// Starts the dispatcher: initializes then starts every attached work
    /// process in attach order.
    pub async fn start(&mut self) -> Result<(), Error> {
        if self.started {
            return Err(Error::AlreadyRunning);
        }
        debug!("Starting dispatcher {}.", self.address);
        self.started = true;
        let process = self.config.process.clone();
        let host = self.config.host.clone();
        for idx in 0..self.wps.len() {
            // A stopped actor stays stopped until re-attached.
            if self.wps[idx].state != WpState::Attached {
                continue;
            }
            let owner = self.wps[idx].address.clone();
            let mut ops = Vec::new();
            self.wps[idx].do_init(&process, &host, &mut ops).await?;
            self.apply_ops(owner, ops);
        }
        for idx in 0..self.wps.len() {
            if self.wps[idx].state != WpState::Initialized {
                continue;
            }
            let owner = self.wps[idx].address.clone();
            let mut ops = Vec::new();
            self.wps[idx].do_start(&process, &host, &mut ops).await?;
            self.apply_ops(owner, ops);
        }
        Ok(())
    }

    /// Stops the dispatcher: stops every started work process in reverse
    /// attach order and tears down all event sources.
    pub async fn stop(&mut self) {
        if !self.started {
            return;
        }
        debug!("Stopping dispatcher {}.", self.address);
        let process = self.config.process.clone();
        let host = self.config.host.clone();
        for idx in (0..self.wps.len()).rev() {
            if !self.wps[idx].started() {
                continue;
            }
            let owner = self.wps[idx].address.clone();
            let mut ops = Vec::new();
            self.wps[idx].do_stop(&process, &host, &mut ops).await;
            self.apply_ops(owner, ops);
        }
        self.started = false;
        self.events.clear();
        for (_, task) in self.signal_tasks.drain() {
            task.abort();
        }
    }

    /// Declares the work process at `address` a forwarder: its
    /// `will_forward` predicate gates relaying of non-local messages.
    pub fn declare_forwarder(
        &mut self,
        address: &MsgAddress,
    ) -> Result<(), Error> {
        if self.record(address).is_none() {
            return Err(Error::UnknownAddress(address.clone()));
        }
        if !self.forwarders.contains(address) {
            debug!("Declaring {} a forwarder.", address);
            self.forwarders.push(address.clone());
        }
        Ok(())
    }

    /// Revokes a forwarder declaration.
    pub fn revoke_forwarder(&mut self, address: &MsgAddress) {
        self.forwarders.retain(|fwd| fwd != address);
    }

    /// Sends a message. The sender field is stamped with the dispatcher's
    /// own address; work processes send through their context instead.
    /// Returns the number of actors the message was queued to — zero is not
    /// an error, only logged.
    pub fn send(&mut self, mut msg: Message, to: MsgAddress) -> usize {
        msg.from = self.address.clone();
        self.route(msg, to)
    }

    /// Publishes a message to all subscribers within `scope`.
    pub fn publish(&mut self, msg: Message, scope: Scope) -> usize {
        let to = MsgAddress::publish(
            scope,
            &self.config.process,
            &self.config.host,
        );
        self.send(msg, to)
    }

    /// Routes a message to its targets. Three branches are evaluated
    /// independently: exact local delivery, local broadcast/publish, and
    /// remote forwarding through declared forwarders.
    fn route(&mut self, mut msg: Message, to: MsgAddress) -> usize {
        msg.to = to.clone();
        let mut targets: Vec<usize> = Vec::new();

        if to.is_broadcast() {
            let publish = to.is_publish();
            for (idx, rec) in self.wps.iter().enumerate() {
                if rec.mailbox.is_closed() {
                    continue;
                }
                if to.matches(&rec.address)
                    && (!publish || rec.subscriptions.matches(&msg))
                {
                    targets.push(idx);
                }
            }
        } else if let Some(idx) = self.wps.iter().position(|rec| {
            !rec.mailbox.is_closed() && to.matches(&rec.address)
        }) {
            targets.push(idx);
        }

        let local = to.process == self.config.process
            && to.host == self.config.host;
        if !local {
            for fwd in &self.forwarders {
                let Some(idx) = self
                    .wps
                    .iter()
                    .position(|rec| rec.address == *fwd)
                else {
                    continue;
                };
                if targets.contains(&idx)
                    || self.wps[idx].mailbox.is_closed()
                    || self.wps[idx].address == msg.from
                {
                    continue;
                }
                if self.wps[idx].wp.will_forward(&msg) {
                    targets.push(idx);
                }
            }
        }

        if targets.is_empty() {
            self.undelivered += 1;
            warn!(
                "Message {} to {} not delivered anywhere ({} so far).",
                msg.id, to, self.undelivered
            );
            return 0;
        }

        // One private deep copy per send; recipients share it afterwards.
        msg.privatize();
        let count = targets.len();
        let last = targets.pop();
        for idx in targets {
            self.wps[idx].mailbox.enqueue(msg.clone());
        }
        if let Some(idx) = last {
            self.wps[idx].mailbox.enqueue(msg);
        }
        self.notify.notify_one();
        count
    }

    /// Registers a timeout for `owner`, firing every `period` under `id`.
    pub fn add_timeout(
        &mut self,
        owner: &MsgAddress,
        period: Duration,
        id: HIID,
        flags: u32,
    ) -> Result<(), Error> {
        if !id.is_valid() {
            return Err(Error::InvalidId(id.to_string()));
        }
        self.record_mut_err(owner)?;
        let mut template_id =
            HIID::from(vec![AtomicID::Event, AtomicID::Timeout]);
        template_id.append(&id);
        let mut template = Message::new(template_id, Priority::High);
        template.from = self.address.clone();
        template.to = owner.clone();
        debug!("Adding timeout {} for {}.", id, owner);
        self.events.push(EventRegistration {
            owner: owner.clone(),
            template,
            kind: EventKind::Timeout {
                period,
                next: Instant::now() + period,
                flags,
            },
        });
        Ok(())
    }

    /// Removes every timeout of `owner` whose id matches `mask` and purges
    /// undelivered timeout messages from its mailbox. Returns the number of
    /// registrations removed.
    pub fn remove_timeout(
        &mut self,
        owner: &MsgAddress,
        mask: &HIID,
    ) -> usize {
        let before = self.events.len();
        self.events.retain(|reg| {
            !(matches!(reg.kind, EventKind::Timeout { .. })
                && reg.owner == *owner
                && mask.matches(&reg.template.id.sub_id(2..)))
        });
        let removed = before - self.events.len();
        let mut purge =
            HIID::from(vec![AtomicID::Event, AtomicID::Timeout]);
        purge.append(mask);
        if let Some(rec) =
            self.wps.iter_mut().find(|rec| rec.address == *owner)
        {
            rec.mailbox.dequeue_mask(&purge, true);
        }
        removed
    }

    /// Registers an fd readiness watch for `owner`. An existing watch on
    /// the same fd is replaced.
    pub fn add_input(
        &mut self,
        owner: &MsgAddress,
        fd: RawFd,
        flags: u32,
    ) -> Result<(), Error> {
        self.record_mut_err(owner)?;
        self.remove_input(owner, fd);
        let afd = crate::events::async_fd(fd, flags)?;
        let template_id = HIID::from(vec![
            AtomicID::Event,
            AtomicID::Input,
            AtomicID::Index(fd as u64),
        ]);
        let mut template = Message::new(template_id, Priority::High);
        template.from = self.address.clone();
        template.to = owner.clone();
        debug!("Adding input watch on fd {} for {}.", fd, owner);
        self.events.push(EventRegistration {
            owner: owner.clone(),
            template,
            kind: EventKind::Input {
                fd,
                flags,
                afd,
                pending: 0,
            },
        });
        Ok(())
    }

    /// Removes the watch of `owner` on `fd` and purges undelivered input
    /// messages from its mailbox.
    pub fn remove_input(&mut self, owner: &MsgAddress, fd: RawFd) -> usize {
        let before = self.events.len();
        self.events.retain(|reg| {
            !(matches!(reg.kind, EventKind::Input { fd: watched, .. } if watched == fd)
                && reg.owner == *owner)
        });
        let removed = before - self.events.len();
        let purge = HIID::from(vec![
            AtomicID::Event,
            AtomicID::Input,
            AtomicID::Index(fd as u64),
        ]);
        if let Some(rec) =
            self.wps.iter_mut().find(|rec| rec.address == *owner)
        {
            rec.mailbox.dequeue_mask(&purge, true);
        }
        removed
    }

    /// Registers a signal watch for `owner`. The first watch of a signal
    /// number installs the forwarder task for it.
    pub fn add_signal(
        &mut self,
        owner: &MsgAddress,
        signum: i32,
        flags: u32,
    ) -> Result<(), Error> {
        self.record_mut_err(owner)?;
        if !self.signal_tasks.contains_key(&signum) {
            let mut stream = signal(SignalKind::from_raw(signum))
                .map_err(|err| Error::Signal(signum, err.to_string()))?;
            let raised = self.raised.clone();
            let notify = self.notify.clone();
            let task = tokio::spawn(async move {
                while stream.recv().await.is_some() {
                    raised.raise(signum);
                    notify.notify_one();
                }
            });
            self.signal_tasks.insert(signum, task);
        }
        let template_id = HIID::from(vec![
            AtomicID::Event,
            AtomicID::Signal,
            AtomicID::Index(signum as u64),
        ]);
        let mut template = Message::new(template_id, Priority::High);
        template.from = self.address.clone();
        template.to = owner.clone();
        debug!("Adding signal watch on {} for {}.", signum, owner);
        self.events.push(EventRegistration {
            owner: owner.clone(),
            template,
            kind: EventKind::Signal {
                signum,
                flags,
                counter: 0,
            },
        });
        Ok(())
    }

    /// Removes the watch of `owner` on `signum` and purges undelivered
    /// signal messages from its mailbox. The forwarder task is torn down
    /// with the last watch of a signal number.
    pub fn remove_signal(
        &mut self,
        owner: &MsgAddress,
        signum: i32,
    ) -> usize {
        let before = self.events.len();
        self.events.retain(|reg| {
            !(matches!(reg.kind, EventKind::Signal { signum: watched, .. } if watched == signum)
                && reg.owner == *owner)
        });
        let removed = before - self.events.len();
        let purge = HIID::from(vec![
            AtomicID::Event,
            AtomicID::Signal,
            AtomicID::Index(signum as u64),
        ]);
        if let Some(rec) =
            self.wps.iter_mut().find(|rec| rec.address == *owner)
        {
            rec.mailbox.dequeue_mask(&purge, true);
        }
        self.gc_signal_task(signum);
        removed
    }

    /// Marks `signum` raised, exactly as OS delivery would. Embeddings and
    /// tests drive the signal path through this without a real signal.
    pub fn raise_signal(&self, signum: i32) {
        self.raised.raise(signum);
        self.notify.notify_one();
    }

    /// Removes every registration owned by `address`.
    fn purge_owner(&mut self, address: &MsgAddress) {
        let mut orphaned: Vec<i32> = Vec::new();
        self.events.retain(|reg| {
            if reg.owner != *address {
                return true;
            }
            if let EventKind::Signal { signum, .. } = reg.kind {
                orphaned.push(signum);
            }
            false
        });
        for signum in orphaned {
            self.gc_signal_task(signum);
        }
    }

    /// Tears down the forwarder task of `signum` if no watch remains.
    fn gc_signal_task(&mut self, signum: i32) {
        let watched = self.events.iter().any(|reg| {
            matches!(reg.kind, EventKind::Signal { signum: s, .. } if s == signum)
        });
        if !watched {
            if let Some(task) = self.signal_tasks.remove(&signum) {
                debug!("Tearing down signal forwarder for {}.", signum);
                task.abort();
            }
        }
    }

    /// Earliest pending timeout deadline across all registrations.
    fn next_deadline(&self) -> Option<Instant> {
        self.events
            .iter()
            .filter_map(|reg| match &reg.kind {
                EventKind::Timeout { next, .. } => Some(*next),
                _ => None,
            })
            .min()
    }

    /// Turns due timeouts, accumulated fd readiness and raised signals into
    /// mailbox insertions.
    fn check_events(&mut self) {
        let now = Instant::now();
        let drained = self.raised.take();
        let mut orphaned: Vec<i32> = Vec::new();
        {
            let Self { events, wps, .. } = &mut *self;
            events.retain_mut(|reg| match &mut reg.kind {
                EventKind::Timeout { period, next, flags } => {
                    if *next > now {
                        return true;
                    }
                    let Some(rec) =
                        wps.iter_mut().find(|r| r.address == reg.owner)
                    else {
                        return false;
                    };
                    debug!(
                        "Timeout {} fired for {}.",
                        reg.template.id, reg.owner
                    );
                    rec.mailbox.enqueue(reg.template.clone());
                    if *flags & EV_ONESHOT != 0 {
                        return false;
                    }
                    *next += *period;
                    true
                }
                EventKind::Input {
                    flags,
                    afd,
                    pending,
                    ..
                } => {
                    *pending |= probe_ready(afd, *flags);
                    if *pending == 0 {
                        return true;
                    }
                    let Some(rec) =
                        wps.iter_mut().find(|r| r.address == reg.owner)
                    else {
                        return false;
                    };
                    // Coalesce into a still-undelivered input message.
                    if let Some(pos) =
                        rec.mailbox.search(&reg.template.id, 0)
                    {
                        rec.mailbox.or_state(pos, *pending);
                    } else {
                        let mut msg = reg.template.clone();
                        msg.state = *pending;
                        rec.mailbox.enqueue(msg);
                    }
                    *pending = 0;
                    true
                }
                EventKind::Signal {
                    signum,
                    flags,
                    counter,
                } => {
                    let raised = drained
                        .iter()
                        .find(|(s, _)| s == signum)
                        .map(|(_, count)| *count)
                        .unwrap_or(0);
                    if raised == 0 {
                        return true;
                    }
                    *counter += u64::from(raised);
                    if *flags & EV_IGNORE != 0 {
                        return true;
                    }
                    let Some(rec) =
                        wps.iter_mut().find(|r| r.address == reg.owner)
                    else {
                        orphaned.push(*signum);
                        return false;
                    };
                    if *flags & EV_DISCRETE != 0 {
                        for _ in 0..raised {
                            rec.mailbox.enqueue(reg.template.clone());
                        }
                    } else if rec
                        .mailbox
                        .search(&reg.template.id, 0)
                        .is_none()
                    {
                        rec.mailbox.enqueue(reg.template.clone());
                    }
                    if *flags & EV_ONESHOT != 0 {
                        orphaned.push(*signum);
                        return false;
                    }
                    true
                }
            });
        }
        for signum in orphaned {
            self.gc_signal_task(signum);
        }
    }

    /// One non-blocking kernel pass: event-source bookkeeping plus at most
    /// one delivery — to the actor with the numerically highest head
    /// priority among those needing a repoll and not queue-locked, ties
    /// broken by attach order. Returns true while any actor still needs a
    /// repoll.
    pub async fn poll(&mut self) -> bool {
        if !self.started {
            return false;
        }
        self.check_events();

        let mut best: Option<(usize, Priority)> = None;
        for (idx, rec) in self.wps.iter().enumerate() {
            if !rec.started()
                || rec.queue_locked()
                || !rec.mailbox.need_repoll()
            {
                continue;
            }
            let Some(head) = rec.mailbox.head() else {
                continue;
            };
            match best {
                Some((_, priority)) if head.priority <= priority => {}
                _ => best = Some((idx, head.priority)),
            }
        }

        if let Some((idx, _)) = best {
            let owner = self.wps[idx].address.clone();
            let process = self.config.process.clone();
            let host = self.config.host.clone();
            let mut ops = Vec::new();
            let cancel =
                self.wps[idx].poll(&process, &host, &mut ops).await;
            match cancel {
                Some(CancelRequest::Timeout(mask)) => {
                    self.remove_timeout(&owner, &mask);
                }
                Some(CancelRequest::Input(fd)) => {
                    self.remove_input(&owner, fd);
                }
                Some(CancelRequest::Signal(signum)) => {
                    self.remove_signal(&owner, signum);
                }
                None => {}
            }
            self.apply_ops(owner, ops);
        }

        self.wps.iter().any(|rec| {
            rec.started()
                && !rec.queue_locked()
                && rec.mailbox.need_repoll()
        })
    }

    /// Runs the blocking loop: drains [`Dispatcher::poll`] until quiescent,
    /// then waits for the heartbeat, the earliest timeout deadline, fd
    /// readiness, a raised signal or cancellation — whichever comes first.
    /// Non-reentrant; a second entry is a usage error.
    pub async fn poll_loop(
        &mut self,
        token: CancellationToken,
    ) -> Result<(), Error> {
        if !self.started {
            return Err(Error::NotRunning);
        }
        if self.polling {
            error!("Nested poll loop rejected.");
            return Err(Error::AlreadyPolling);
        }
        self.polling = true;
        debug!("Entering poll loop of dispatcher {}.", self.address);

        let hz = u64::from(self.config.heartbeat_hz.max(1));
        let mut heartbeat = interval(Duration::from_micros(1_000_000 / hz));
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let notify = self.notify.clone();

        enum Wake {
            Run,
            Input(usize, u32),
            Stop,
        }

        loop {
            while !token.is_cancelled() && self.poll().await {}
            if token.is_cancelled() {
                break;
            }
            let deadline = self.next_deadline();
            let wake = {
                let input_wait = wait_input(&self.events);
                tokio::select! {
                    _ = token.cancelled() => Wake::Stop,
                    _ = heartbeat.tick() => Wake::Run,
                    _ = notify.notified() => Wake::Run,
                    _ = sleep_until(deadline.unwrap_or_else(Instant::now)),
                        if deadline.is_some() => Wake::Run,
                    ready = input_wait => Wake::Input(ready.0, ready.1),
                }
            };
            match wake {
                Wake::Stop => break,
                Wake::Input(index, bits) => {
                    if let Some(EventRegistration {
                        kind: EventKind::Input { pending, .. },
                        ..
                    }) = self.events.get_mut(index)
                    {
                        *pending |= bits;
                    }
                }
                Wake::Run => {}
            }
        }

        self.polling = false;
        debug!("Poll loop of dispatcher {} finished.", self.address);
        Ok(())
    }

    /// Applies the operations a handler deferred through its context.
    fn apply_ops(&mut self, owner: MsgAddress, ops: Vec<DispatchOp>) {
        for op in ops {
            match op {
                DispatchOp::Send { msg, to } => {
                    self.route(msg, to);
                }
                DispatchOp::Subscribe { mask, scope } => {
                    let update = match self
                        .wps
                        .iter_mut()
                        .find(|rec| rec.address == owner)
                    {
                        Some(rec) => {
                            let changed =
                                rec.apply_subscription(mask, scope);
                            if changed && rec.started() {
                                rec.subscription_update()
                            } else {
                                None
                            }
                        }
                        None => {
                            debug!(
                                "Dropping subscription of detached {}.",
                                owner
                            );
                            None
                        }
                    };
                    if let Some(update) = update {
                        let to = MsgAddress::publish(
                            Scope::Global,
                            &self.config.process,
                            &self.config.host,
                        );
                        self.route(update, to);
                    }
                }
                DispatchOp::Unsubscribe { mask } => {
                    let update = match self
                        .wps
                        .iter_mut()
                        .find(|rec| rec.address == owner)
                    {
                        Some(rec) => {
                            if rec.subscriptions.remove(&mask)
                                && rec.started()
                            {
                                rec.subscription_update()
                            } else {
                                None
                            }
                        }
                        None => None,
                    };
                    if let Some(update) = update {
                        let to = MsgAddress::publish(
                            Scope::Global,
                            &self.config.process,
                            &self.config.host,
                        );
                        self.route(update, to);
                    }
                }
                DispatchOp::AddTimeout { period, id, flags } => {
                    if let Err(err) =
                        self.add_timeout(&owner, period, id, flags)
                    {
                        error!("Failed to add timeout: {}", err);
                    }
                }
                DispatchOp::RemoveTimeout { mask } => {
                    self.remove_timeout(&owner, &mask);
                }
                DispatchOp::AddInput { fd, flags } => {
                    if let Err(err) = self.add_input(&owner, fd, flags) {
                        error!("Failed to add input watch: {}", err);
                    }
                }
                DispatchOp::RemoveInput { fd } => {
                    self.remove_input(&owner, fd);
                }
                DispatchOp::AddSignal { signum, flags } => {
                    if let Err(err) =
                        self.add_signal(&owner, signum, flags)
                    {
                        error!("Failed to add signal watch: {}", err);
                    }
                }
                DispatchOp::RemoveSignal { signum } => {
                    self.remove_signal(&owner, signum);
                }
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        for (_, task) in self.signal_tasks.drain() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::wp::{ReturnCode, WpContext};

    use async_trait::async_trait;

    use std::sync::{Arc, Mutex};

    struct Probe {
        class: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl WorkProcess for Probe {
        fn class_id(&self) -> AtomicID {
            AtomicID::from(self.class)
        }

        async fn receive(
            &mut self,
            msg: &mut Message,
            _ctx: &mut WpContext<'_>,
        ) -> ReturnCode {
            self.log.lock().unwrap().push(msg.id.to_string());
            ReturnCode::Accept
        }
    }

    fn probe(
        class: &'static str,
    ) -> (Box<dyn WorkProcess>, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        (
            Box::new(Probe {
                class,
                log: log.clone(),
            }),
            log,
        )
    }

    #[tokio::test]
    async fn attach_assigns_sequential_instances() {
        let mut dispatcher = Dispatcher::new(DispatcherConfig::default());
        let (first, _) = probe("Sensor");
        let (second, _) = probe("Sensor");
        let (other, _) = probe("Pump");
        let a = dispatcher.attach(first).await.unwrap();
        let b = dispatcher.attach(second).await.unwrap();
        let c = dispatcher.attach(other).await.unwrap();
        assert_eq!(a.inst, AtomicID::Index(0));
        assert_eq!(b.inst, AtomicID::Index(1));
        assert_eq!(c.inst, AtomicID::Index(0));
        assert_eq!(dispatcher.attached().len(), 3);
    }

    #[tokio::test]
    async fn exact_send_delivers_to_one() {
        let mut dispatcher = Dispatcher::new(DispatcherConfig::default());
        let (wp, log) = probe("Sensor");
        let addr = dispatcher.attach(wp).await.unwrap();
        dispatcher.start().await.unwrap();

        let msg = Message::new(HIID::from("Ping"), Priority::Normal);
        assert_eq!(dispatcher.send(msg, addr.clone()), 1);
        while dispatcher.poll().await {}
        assert_eq!(log.lock().unwrap().as_slice(), ["Ping"]);

        // A miss is not an error, just zero deliveries.
        let mut to = addr;
        to.class = AtomicID::from("Nothing");
        let msg = Message::new(HIID::from("Ping"), Priority::Normal);
        assert_eq!(dispatcher.send(msg, to), 0);
    }

    #[tokio::test]
    async fn wildcard_send_broadcasts_to_class() {
        let mut dispatcher = Dispatcher::new(DispatcherConfig::default());
        let (first, log_a) = probe("Sensor");
        let (second, log_b) = probe("Sensor");
        dispatcher.attach(first).await.unwrap();
        dispatcher.attach(second).await.unwrap();
        dispatcher.start().await.unwrap();

        let to = MsgAddress::new(
            AtomicID::from("Sensor"),
            AtomicID::Any,
            AtomicID::Any,
            AtomicID::Any,
        );
        let msg = Message::new(HIID::from("Sweep"), Priority::Normal);
        assert_eq!(dispatcher.send(msg, to), 2);
        while dispatcher.poll().await {}
        assert_eq!(log_a.lock().unwrap().len(), 1);
        assert_eq!(log_b.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn queue_lock_defers_delivery() {
        let mut dispatcher = Dispatcher::new(DispatcherConfig::default());
        let (wp, log) = probe("Sensor");
        let addr = dispatcher.attach(wp).await.unwrap();
        dispatcher.start().await.unwrap();
        dispatcher.set_queue_locked(&addr, true).unwrap();

        let msg = Message::new(HIID::from("Ping"), Priority::Normal);
        dispatcher.send(msg, addr.clone());
        assert!(!dispatcher.poll().await);
        assert!(log.lock().unwrap().is_empty());

        dispatcher.set_queue_locked(&addr, false).unwrap();
        dispatcher.poll().await;
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn detach_unknown_address_fails() {
        let mut dispatcher = Dispatcher::new(DispatcherConfig::default());
        let missing = MsgAddress::new(
            AtomicID::from("Sensor"),
            AtomicID::Index(7),
            AtomicID::from("local"),
            AtomicID::from("localhost"),
        );
        let result = dispatcher.detach(&missing).await;
        assert_eq!(result, Err(Error::UnknownAddress(missing)));
    }

    #[tokio::test]
    async fn poll_loop_requires_running_dispatcher() {
        let mut dispatcher = Dispatcher::new(DispatcherConfig::default());
        let result = dispatcher.poll_loop(CancellationToken::new()).await;
        assert_eq!(result, Err(Error::NotRunning));
    }
}
