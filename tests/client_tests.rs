use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
        mpsc,
    },
    thread,
    time::Duration,
};

use ca_client::{
    client::{
        Channel, ChannelState, ClientError, ConnectionEvent, ContextBuilder, RequestType,
        Subscription, is_dispatch_thread,
    },
    config::ContextConfig,
    dbr::{Dbr, DbrBasicType, DbrCategory, DbrValue},
    messages::MonitorMask,
};

mod common;
use common::{MockServer, Received, init_logging, wait_until};

const WAIT: Duration = Duration::from_secs(5);

#[test]
fn test_get_and_put() {
    init_logging();
    let server = MockServer::start(&[("TEMP1", 21.5f64.into())]);
    let context = server.client();
    let channel = context.create_channel("TEMP1").unwrap();
    context.pend_io(WAIT).unwrap();
    assert_eq!(channel.state(), ChannelState::Connected);
    assert_eq!(channel.native_type(), Some(DbrBasicType::Double));
    assert_eq!(channel.element_count(), Some(1));
    assert!(channel.access_rights().can_write());
    assert_eq!(context.circuit_count(), 1);

    let reading = channel
        .get(RequestType::default())
        .unwrap()
        .wait(WAIT)
        .unwrap();
    assert_eq!(reading.value(), &DbrValue::Double(vec![21.5]));
    assert!(reading.timestamp().is_some());

    let (done, done_rx) = mpsc::channel();
    channel
        .put_with_callback(30.0f64, move |result| {
            let _ = done.send(result);
        })
        .unwrap();
    context.flush_io();
    done_rx.recv_timeout(WAIT).unwrap().unwrap();
    assert_eq!(server.value("TEMP1"), Some(DbrValue::Double(vec![30.0])));

    // Ask for a different type than the native one
    let reading = channel
        .get(RequestType::new(DbrCategory::Basic).with_type(DbrBasicType::Long))
        .unwrap()
        .wait(WAIT)
        .unwrap();
    assert_eq!(reading, Dbr::Basic(DbrValue::Long(vec![30])));
    assert_eq!(context.outstanding_requests(), 0);
}

#[test]
fn test_unanswered_search_reports_not_found() {
    init_logging();
    let server = MockServer::start(&[]);
    let context = ContextBuilder::from_config(ContextConfig {
        max_search_retries: Some(3),
        ..server.client_config()
    })
    .start()
    .unwrap();
    let (events, event_rx) = mpsc::channel();
    let channel = context
        .create_channel_with_callback("MISSING", move |event| {
            let _ = events.send(event);
        })
        .unwrap();
    assert_eq!(event_rx.recv_timeout(WAIT).unwrap(), ConnectionEvent::NotFound);
    assert_eq!(channel.state(), ChannelState::Searching);
    assert_eq!(context.circuit_count(), 0);
}

#[test]
fn test_subscription_survives_reconnection() {
    init_logging();
    let server = MockServer::start(&[("TEMP1", 1.0f64.into())]);
    let context = server.client();
    let (events, event_rx) = mpsc::channel();
    let channel = context
        .create_channel_with_callback("TEMP1", move |event| {
            let _ = events.send(event);
        })
        .unwrap();
    let (updates, update_rx) = mpsc::channel();
    let _subscription = channel
        .subscribe(
            RequestType::new(DbrCategory::Basic),
            MonitorMask::default(),
            move |update| {
                let _ = updates.send(update.map(Dbr::take_value));
            },
        )
        .unwrap();

    assert!(matches!(
        event_rx.recv_timeout(WAIT).unwrap(),
        ConnectionEvent::Connected {
            native_type: DbrBasicType::Double,
            element_count: 1,
            ..
        }
    ));
    assert_eq!(
        update_rx.recv_timeout(WAIT).unwrap().unwrap(),
        DbrValue::Double(vec![1.0])
    );
    server.set_value("TEMP1", 2.0f64);
    assert_eq!(
        update_rx.recv_timeout(WAIT).unwrap().unwrap(),
        DbrValue::Double(vec![2.0])
    );

    server.drop_connections();
    assert_eq!(
        event_rx.recv_timeout(WAIT).unwrap(),
        ConnectionEvent::Disconnected
    );
    assert!(matches!(
        update_rx.recv_timeout(WAIT).unwrap(),
        Err(ClientError::Disconnected)
    ));

    // Reinstated on the new circuit, starting with the current value
    assert!(matches!(
        event_rx.recv_timeout(WAIT).unwrap(),
        ConnectionEvent::Connected { .. }
    ));
    assert_eq!(
        update_rx.recv_timeout(WAIT).unwrap().unwrap(),
        DbrValue::Double(vec![2.0])
    );
    server.set_value("TEMP1", 3.0f64);
    assert_eq!(
        update_rx.recv_timeout(WAIT).unwrap().unwrap(),
        DbrValue::Double(vec![3.0])
    );

    let installs = server
        .received()
        .iter()
        .filter(|r| **r == Received::Subscribe("TEMP1".to_owned()))
        .count();
    assert_eq!(installs, 2);
    assert_eq!(channel.state(), ChannelState::Connected);
}

#[test]
fn test_subscription_follows_name_to_new_server() {
    init_logging();
    let first = MockServer::start(&[("TEMP1", 1.0f64.into())]);
    let second = MockServer::start(&[]);
    let context = ContextBuilder::from_config(ContextConfig {
        search_addresses: vec![first.search_address(), second.search_address()],
        ..first.client_config()
    })
    .start()
    .unwrap();
    let (events, event_rx) = mpsc::channel();
    let channel = context
        .create_channel_with_callback("TEMP1", move |event| {
            let _ = events.send(event);
        })
        .unwrap();
    let (updates, update_rx) = mpsc::channel();
    let _subscription = channel
        .subscribe(
            RequestType::new(DbrCategory::Basic),
            MonitorMask::default(),
            move |update| {
                let _ = updates.send(update.map(Dbr::take_value));
            },
        )
        .unwrap();
    assert!(matches!(
        event_rx.recv_timeout(WAIT).unwrap(),
        ConnectionEvent::Connected { server, .. } if server == first.circuit_address()
    ));
    assert_eq!(
        update_rx.recv_timeout(WAIT).unwrap().unwrap(),
        DbrValue::Double(vec![1.0])
    );

    // The name moves to another server
    second.set_value("TEMP1", 7.0f64);
    first.remove("TEMP1");
    first.drop_connections();
    assert_eq!(
        event_rx.recv_timeout(WAIT).unwrap(),
        ConnectionEvent::Disconnected
    );
    assert!(matches!(
        update_rx.recv_timeout(WAIT).unwrap(),
        Err(ClientError::Disconnected)
    ));
    assert!(matches!(
        event_rx.recv_timeout(WAIT).unwrap(),
        ConnectionEvent::Connected { server, .. } if server == second.circuit_address()
    ));
    assert_eq!(
        update_rx.recv_timeout(WAIT).unwrap().unwrap(),
        DbrValue::Double(vec![7.0])
    );
    second.set_value("TEMP1", 8.0f64);
    assert_eq!(
        update_rx.recv_timeout(WAIT).unwrap().unwrap(),
        DbrValue::Double(vec![8.0])
    );

    assert_eq!(channel.server_address(), Some(second.circuit_address()));
    assert_eq!(context.circuit_count(), 1);
    assert!(
        second
            .received()
            .contains(&Received::Subscribe("TEMP1".to_owned()))
    );
}

#[test]
fn test_failing_circuit_paces_searches() {
    init_logging();
    let server = MockServer::start(&[("TEMP1", 1.0f64.into())]);
    // Searches are answered, but no circuit ever holds
    server.refuse_circuits(true);
    let context = server.client();
    let channel = context.create_channel("TEMP1").unwrap();
    thread::sleep(Duration::from_secs(1));
    let searches = server.search_count();
    assert!(searches >= 2, "Stopped searching after {searches} datagrams");
    assert!(searches < 30, "Sent {searches} searches in one second");
    assert_ne!(channel.state(), ChannelState::Connected);

    server.refuse_circuits(false);
    context.pend_io(WAIT).unwrap();
    assert_eq!(channel.state(), ChannelState::Connected);
}

#[test]
fn test_puts_arrive_in_order() {
    init_logging();
    let server = MockServer::start(&[("COUNTER", 0i32.into())]);
    // Small enough that the puts have to wait for the writer
    let context = ContextBuilder::from_config(ContextConfig {
        send_buffer_capacity: 4096,
        ..server.client_config()
    })
    .start()
    .unwrap();
    let channel = context.create_channel("COUNTER").unwrap();
    context.pend_io(WAIT).unwrap();

    for i in 0..10_000i32 {
        channel.put(i).unwrap();
    }
    let (done, done_rx) = mpsc::channel();
    channel
        .put_with_callback(10_000i32, move |result| {
            let _ = done.send(result);
        })
        .unwrap();
    context.flush_io();
    done_rx
        .recv_timeout(Duration::from_secs(30))
        .unwrap()
        .unwrap();

    let writes: Vec<i32> = server
        .received()
        .into_iter()
        .filter_map(|r| match r {
            Received::Write(_, DbrValue::Long(v)) => v.first().copied(),
            _ => None,
        })
        .collect();
    assert_eq!(writes, (0..=10_000).collect::<Vec<_>>());
}

#[test]
fn test_no_callbacks_after_cancel() {
    init_logging();
    let server = Arc::new(MockServer::start(&[("FAST", 0i32.into())]));
    let context = server.client();
    let channel = context.create_channel("FAST").unwrap();
    context.pend_io(WAIT).unwrap();

    let count = Arc::new(AtomicUsize::new(0));
    let counter = count.clone();
    let subscription = channel
        .subscribe(
            RequestType::new(DbrCategory::Basic),
            MonitorMask::default(),
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_micros(200));
            },
        )
        .unwrap();
    context.flush_io();
    wait_until("the first update", || count.load(Ordering::SeqCst) > 0);

    let stop = Arc::new(AtomicBool::new(false));
    let publisher = {
        let server = server.clone();
        let stop = stop.clone();
        thread::spawn(move || {
            let mut value = 0i32;
            while !stop.load(Ordering::SeqCst) {
                value += 1;
                server.set_value("FAST", value);
                thread::sleep(Duration::from_micros(100));
            }
        })
    };
    thread::sleep(Duration::from_millis(50));

    subscription.cancel();
    let after_cancel = count.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(100));
    assert_eq!(count.load(Ordering::SeqCst), after_cancel);

    stop.store(true, Ordering::SeqCst);
    publisher.join().unwrap();
    wait_until("the cancel to be confirmed", || {
        context.outstanding_requests() == 0
    });
}

#[test]
fn test_cancel_twice_sends_one_cancel() {
    init_logging();
    let server = MockServer::start(&[("TEMP1", 1.0f64.into())]);
    let context = server.client();
    let channel = context.create_channel("TEMP1").unwrap();
    context.pend_io(WAIT).unwrap();
    let subscription = channel
        .subscribe(RequestType::default(), MonitorMask::default(), |_| {})
        .unwrap();
    context.flush_io();
    wait_until("the subscription", || server.subscriber_count() == 1);

    subscription.cancel();
    subscription.cancel();
    drop(subscription);
    context.flush_io();
    wait_until("the server to drop it", || server.subscriber_count() == 0);
    wait_until("the cancel to be confirmed", || {
        context.outstanding_requests() == 0
    });

    let cancels = server
        .received()
        .iter()
        .filter(|r| matches!(r, Received::CancelSubscription(_)))
        .count();
    assert_eq!(cancels, 1);
}

#[test]
fn test_creates_wait_for_identification() {
    init_logging();
    let names = ["A", "B", "C", "D"];
    let pvs: Vec<(&str, DbrValue)> = names.iter().map(|n| (*n, 0i32.into())).collect();
    let server = MockServer::start(&pvs);
    server.set_handshake_delay(Duration::from_millis(200));
    let context = server.client();
    let channels: Vec<_> = names
        .iter()
        .map(|name| context.create_channel(name).unwrap())
        .collect();
    context.pend_io(WAIT).unwrap();
    assert!(channels.iter().all(|c| c.state() == ChannelState::Connected));
    assert_eq!(context.circuit_count(), 1);

    let received = server.received();
    assert!(matches!(received[0], Received::ClientName(_)));
    assert!(matches!(received[1], Received::HostName(_)));
    let creates: Vec<String> = received[2..]
        .iter()
        .filter_map(|r| match r {
            Received::Create(name) => Some(name.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(creates, names);
}

#[test]
fn test_callbacks_can_call_back_in() {
    init_logging();
    let server = MockServer::start(&[("TEMP1", 5.0f64.into())]);
    let context = server.client();
    let channel = Arc::new(context.create_channel("TEMP1").unwrap());
    context.pend_io(WAIT).unwrap();
    assert!(!is_dispatch_thread());

    let (blocking, blocking_rx) = mpsc::channel();
    let (values, value_rx) = mpsc::channel();
    let inner = channel.clone();
    let subscription = channel
        .subscribe(RequestType::default(), MonitorMask::default(), move |_| {
            let values = values.clone();
            let _ = inner.get_with_callback(RequestType::new(DbrCategory::Basic), move |r| {
                let _ = values.send(r.map(Dbr::take_value));
            });
            let waited = inner
                .get(RequestType::default())
                .and_then(|pending| pending.wait(Duration::from_secs(1)));
            let _ = blocking.send((is_dispatch_thread(), waited.map(|_| ())));
        })
        .unwrap();
    context.flush_io();

    let (on_dispatch, waited) = blocking_rx.recv_timeout(WAIT).unwrap();
    assert!(on_dispatch);
    assert!(matches!(waited, Err(ClientError::NotAllowedInCallback)));
    assert_eq!(
        value_rx.recv_timeout(WAIT).unwrap().unwrap(),
        DbrValue::Double(vec![5.0])
    );
    subscription.cancel();
}

#[test]
fn test_subscription_cancelled_from_its_own_callback() {
    init_logging();
    let server = MockServer::start(&[("TEMP1", 0i32.into())]);
    let context = server.client();
    let channel = context.create_channel("TEMP1").unwrap();
    context.pend_io(WAIT).unwrap();

    let (handle, handle_rx) = mpsc::channel::<Subscription>();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let subscription = channel
        .subscribe(RequestType::default(), MonitorMask::default(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            if let Ok(subscription) = handle_rx.recv_timeout(WAIT) {
                subscription.cancel();
            }
        })
        .unwrap();
    handle.send(subscription).unwrap();
    context.flush_io();

    wait_until("the first update", || calls.load(Ordering::SeqCst) > 0);
    wait_until("the cancel to be confirmed", || {
        context.outstanding_requests() == 0
    });
    for value in 1..5i32 {
        server.set_value("TEMP1", value);
    }
    thread::sleep(Duration::from_millis(100));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(server.subscriber_count(), 0);
}

#[test]
fn test_channel_destroyed_from_its_own_callback() {
    init_logging();
    let server = MockServer::start(&[("TEMP1", 0i32.into()), ("TEMP2", 0i32.into())]);
    let context = server.client();
    // Keeps the circuit open once TEMP1 is gone
    let _other = context.create_channel("TEMP2").unwrap();
    context.pend_io(WAIT).unwrap();

    let (handle, handle_rx) = mpsc::channel::<Channel>();
    let (done, done_rx) = mpsc::channel();
    let events = Arc::new(AtomicUsize::new(0));
    let counter = events.clone();
    let channel = context
        .create_channel_with_callback("TEMP1", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            if let Ok(channel) = handle_rx.recv_timeout(WAIT) {
                channel.destroy();
                let _ = done.send(channel.state());
            }
        })
        .unwrap();
    handle.send(channel).unwrap();

    assert_eq!(done_rx.recv_timeout(WAIT).unwrap(), ChannelState::Destroyed);
    wait_until("the server to see the clear", || {
        server
            .received()
            .contains(&Received::Clear("TEMP1".to_owned()))
    });
    assert_eq!(events.load(Ordering::SeqCst), 1);
    assert_eq!(context.circuit_count(), 1);
}

#[test]
fn test_dropping_context_closes_circuits() {
    init_logging();
    let server = MockServer::start(&[("TEMP1", 1.0f64.into())]);
    let context = server.client();
    let channel = context.create_channel("TEMP1").unwrap();
    context.pend_io(WAIT).unwrap();
    let _subscription = channel
        .subscribe(RequestType::default(), MonitorMask::default(), |_| {})
        .unwrap();
    context.flush_io();
    wait_until("the subscription", || server.subscriber_count() == 1);

    drop(context);
    wait_until("the circuit to close", || server.subscriber_count() == 0);
    assert_eq!(channel.state(), ChannelState::Destroyed);
    assert!(matches!(
        channel.get(RequestType::default()),
        Err(ClientError::ContextClosed)
    ));
}
