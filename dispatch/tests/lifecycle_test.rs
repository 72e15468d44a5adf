// Integration tests for the work-process lifecycle: the hello/bye protocol,
// subscription broadcasts, repoll fairness and detach cleanup.

use dispatch::{
    AtomicID, Dispatcher, DispatcherConfig, Error, Message, Priority,
    ReturnCode, Scope, WorkProcess, WpContext, WpState, HIID, INPUT_READ,
};

use async_trait::async_trait;
use tokio::time::Duration;

use std::os::unix::io::IntoRawFd;
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex};

type Seen = Arc<Mutex<Vec<String>>>;

// Watches the work-process protocol traffic.
struct ProtocolWatch {
    mask: &'static str,
    seen: Seen,
}

#[async_trait]
impl WorkProcess for ProtocolWatch {
    fn class_id(&self) -> AtomicID {
        AtomicID::from("Watch")
    }

    async fn start(&mut self, ctx: &mut WpContext<'_>) -> Result<(), Error> {
        ctx.subscribe(HIID::from(self.mask), Scope::Global);
        Ok(())
    }

    async fn receive(
        &mut self,
        msg: &mut Message,
        _ctx: &mut WpContext<'_>,
    ) -> ReturnCode {
        self.seen.lock().unwrap().push(msg.id.to_string());
        ReturnCode::Accept
    }
}

struct Worker;

#[async_trait]
impl WorkProcess for Worker {
    fn class_id(&self) -> AtomicID {
        AtomicID::from("Worker")
    }
}

// Subscribes before being started; the broadcast must wait for start.
struct EarlySubscriber;

#[async_trait]
impl WorkProcess for EarlySubscriber {
    fn class_id(&self) -> AtomicID {
        AtomicID::from("Early")
    }

    async fn init(&mut self, ctx: &mut WpContext<'_>) -> Result<(), Error> {
        ctx.subscribe(HIID::from("Stuff"), Scope::Global);
        Ok(())
    }
}

#[tokio::test]
async fn hello_and_bye_are_published_once_per_transition() {
    let mut dispatcher = Dispatcher::new(DispatcherConfig::default());
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    dispatcher
        .attach(Box::new(ProtocolWatch {
            mask: "Wp",
            seen: seen.clone(),
        }))
        .await
        .unwrap();
    dispatcher.start().await.unwrap();
    while dispatcher.poll().await {}

    let worker = dispatcher.attach(Box::new(Worker)).await.unwrap();
    while dispatcher.poll().await {}
    {
        let seen = seen.lock().unwrap();
        let hellos = seen.iter().filter(|s| *s == "Wp.Hello.Worker.0");
        assert_eq!(hellos.count(), 1);
    }

    dispatcher.detach(&worker).await.unwrap();
    while dispatcher.poll().await {}
    {
        let seen = seen.lock().unwrap();
        let byes = seen.iter().filter(|s| *s == "Wp.Bye.Worker.0");
        assert_eq!(byes.count(), 1);
    }
}

#[tokio::test]
async fn subscription_broadcast_waits_for_start() {
    let mut dispatcher = Dispatcher::new(DispatcherConfig::default());
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    dispatcher
        .attach(Box::new(ProtocolWatch {
            mask: "Wp.Subscriptions.Early",
            seen: seen.clone(),
        }))
        .await
        .unwrap();
    dispatcher.attach(Box::new(EarlySubscriber)).await.unwrap();

    dispatcher.start().await.unwrap();
    while dispatcher.poll().await {}

    // Exactly one broadcast: the startup flush, nothing from init().
    let seen = seen.lock().unwrap();
    let broadcasts = seen
        .iter()
        .filter(|s| s.starts_with("Wp.Subscriptions.Early"))
        .count();
    assert_eq!(broadcasts, 1);
}

// Labels every delivery into a shared order log.
struct Sink {
    label: &'static str,
    order: Seen,
}

#[async_trait]
impl WorkProcess for Sink {
    fn class_id(&self) -> AtomicID {
        AtomicID::from("Sink")
    }

    async fn receive(
        &mut self,
        msg: &mut Message,
        _ctx: &mut WpContext<'_>,
    ) -> ReturnCode {
        self.order
            .lock()
            .unwrap()
            .push(format!("{}:{}", self.label, msg.id));
        ReturnCode::Accept
    }
}

#[tokio::test]
async fn higher_priority_head_is_delivered_first() {
    let mut dispatcher = Dispatcher::new(DispatcherConfig::default());
    let order: Seen = Arc::new(Mutex::new(Vec::new()));
    let a = dispatcher
        .attach(Box::new(Sink {
            label: "a",
            order: order.clone(),
        }))
        .await
        .unwrap();
    let b = dispatcher
        .attach(Box::new(Sink {
            label: "b",
            order: order.clone(),
        }))
        .await
        .unwrap();
    dispatcher.start().await.unwrap();

    let low = Message::new(HIID::from("Background"), Priority::Low);
    let high = Message::new(HIID::from("Urgent"), Priority::High);
    dispatcher.send(low, b.clone());
    dispatcher.send(high, a.clone());

    // One delivery per pass: the high-priority head wins the first pass.
    dispatcher.poll().await;
    assert_eq!(order.lock().unwrap().as_slice(), ["a:Urgent"]);
    dispatcher.poll().await;
    assert_eq!(
        order.lock().unwrap().as_slice(),
        ["a:Urgent", "b:Background"]
    );
}

#[tokio::test]
async fn equal_priorities_keep_arrival_order() {
    let mut dispatcher = Dispatcher::new(DispatcherConfig::default());
    let order: Seen = Arc::new(Mutex::new(Vec::new()));
    let a = dispatcher
        .attach(Box::new(Sink {
            label: "a",
            order: order.clone(),
        }))
        .await
        .unwrap();
    dispatcher.start().await.unwrap();

    dispatcher.send(
        Message::new(HIID::from("First"), Priority::Normal),
        a.clone(),
    );
    dispatcher.send(
        Message::new(HIID::from("Second"), Priority::Normal),
        a.clone(),
    );
    while dispatcher.poll().await {}

    assert_eq!(order.lock().unwrap().as_slice(), ["a:First", "a:Second"]);
}

struct Idle;

#[async_trait]
impl WorkProcess for Idle {
    fn class_id(&self) -> AtomicID {
        AtomicID::from("Idle")
    }
}

#[tokio::test]
async fn detach_purges_registrations_and_messages() {
    let mut dispatcher = Dispatcher::new(DispatcherConfig::default());
    let addr = dispatcher.attach(Box::new(Idle)).await.unwrap();
    dispatcher.start().await.unwrap();

    for name in ["Sweep", "Refresh", "Report"] {
        dispatcher
            .add_timeout(
                &addr,
                Duration::from_secs(3600),
                HIID::from(name),
                0,
            )
            .unwrap();
    }
    let (_writer, reader) = UnixStream::pair().unwrap();
    reader.set_nonblocking(true).unwrap();
    dispatcher
        .add_input(&addr, reader.into_raw_fd(), INPUT_READ)
        .unwrap();
    dispatcher.send(
        Message::new(HIID::from("Pending.One"), Priority::Normal),
        addr.clone(),
    );
    dispatcher.send(
        Message::new(HIID::from("Pending.Two"), Priority::Normal),
        addr.clone(),
    );

    assert_eq!(dispatcher.owned_registrations(&addr), 4);
    assert_eq!(dispatcher.mailbox_len(&addr), Some(2));

    dispatcher.detach(&addr).await.unwrap();

    assert_eq!(dispatcher.owned_registrations(&addr), 0);
    assert_eq!(dispatcher.mailbox_len(&addr), None);
    assert!(dispatcher.attached().is_empty());
}

#[tokio::test]
async fn lifecycle_states_follow_the_dispatcher() {
    let mut dispatcher = Dispatcher::new(DispatcherConfig::default());
    let addr = dispatcher.attach(Box::new(Idle)).await.unwrap();
    assert_eq!(dispatcher.wp_state(&addr), Some(WpState::Attached));

    dispatcher.start().await.unwrap();
    assert_eq!(dispatcher.wp_state(&addr), Some(WpState::Started));

    dispatcher.stop().await;
    assert_eq!(dispatcher.wp_state(&addr), Some(WpState::Stopped));
    assert!(!dispatcher.is_running());

    // A stopped actor is not revived by a new start; it must re-attach.
    dispatcher.start().await.unwrap();
    assert_eq!(dispatcher.wp_state(&addr), Some(WpState::Stopped));
}
