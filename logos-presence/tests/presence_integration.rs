//! Multi-client presence scenarios over an in-memory signal network.

use logos_presence::{
    latest, latest_map, notifications, Audience, AttendeeEvent, AttendeeStatus, ClientConnectionId, ClientSessionId, InboundSignal, JoinState,
    Latest, LatestEvent, LatestMapEvent, ManualClock, OutboundSignal, PresenceConfig, PresenceError, PresenceManager,
    SharedAudience, SignalTransport, WorkspaceSchema,
};
use logos_presence::state::RawState;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

const START: i64 = 1_700_000_000_000;
const POINTERS: &str = "name:pointers";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct Point {
    x: i32,
    y: i32,
}

type Outbox = Arc<Mutex<Vec<(ClientConnectionId, OutboundSignal)>>>;

struct NetworkTransport {
    connection: ClientConnectionId,
    outbox: Outbox,
}

impl SignalTransport for NetworkTransport {
    fn submit_signal(&mut self, signal: OutboundSignal) {
        self.outbox.lock().unwrap().push((self.connection.clone(), signal));
    }
}

struct Peer {
    connection: ClientConnectionId,
    clock: ManualClock,
    presence: PresenceManager,
}

/// Broadcast network with a shared audience. Signals are delivered in send
/// order once `deliver` runs; every sender also gets its own echo.
struct Network {
    audience: SharedAudience,
    outbox: Outbox,
    history: Vec<(ClientConnectionId, OutboundSignal)>,
    peers: Vec<Peer>,
}

impl Network {
    fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        Self {
            audience: SharedAudience::new(),
            outbox: Arc::new(Mutex::new(Vec::new())),
            history: Vec::new(),
            peers: Vec::new(),
        }
    }

    fn add_peer(&mut self, session: &str) -> usize {
        self.add_peer_with(session, PresenceConfig::default(), 0)
    }

    fn add_peer_with(&mut self, session: &str, config: PresenceConfig, clock_offset: i64) -> usize {
        let connection = ClientConnectionId::new(format!("{session}-conn"));
        let clock = ManualClock::new(START + clock_offset);
        let transport = NetworkTransport { connection: connection.clone(), outbox: self.outbox.clone() };
        let presence = PresenceManager::new(session.into(), config, transport, self.audience.clone(), clock.clone());
        self.peers.push(Peer { connection, clock, presence });
        self.peers.len() - 1
    }

    fn join(&mut self, index: usize) {
        let connection = self.peers[index].connection.clone();
        self.audience.add(connection.clone());
        for (i, peer) in self.peers.iter_mut().enumerate() {
            if i != index {
                peer.presence.on_client_connected(&connection);
            }
        }
        self.peers[index].presence.join_session(connection);
        self.deliver();
    }

    fn leave(&mut self, index: usize) {
        let connection = self.peers[index].connection.clone();
        self.audience.remove(&connection);
        for peer in &mut self.peers {
            peer.presence.on_client_disconnected(&connection);
        }
    }

    fn take_outbox(&self) -> Vec<(ClientConnectionId, OutboundSignal)> {
        std::mem::take(&mut *self.outbox.lock().unwrap())
    }

    fn route(&mut self, sender: &ClientConnectionId, signal: &OutboundSignal) {
        let members = self.audience.members();
        for peer in &mut self.peers {
            if !members.contains(&peer.connection) {
                continue;
            }
            let local = peer.connection == *sender;
            if !local && signal.target_client_id.as_ref().is_some_and(|target| *target != peer.connection) {
                continue;
            }
            peer.presence.process_signal(InboundSignal::from_outbound(sender.clone(), signal), local);
        }
    }

    fn route_all(&mut self, signals: Vec<(ClientConnectionId, OutboundSignal)>) {
        for (sender, signal) in signals {
            self.route(&sender, &signal);
            self.history.push((sender, signal));
        }
    }

    fn deliver(&mut self) {
        for _ in 0..100 {
            let pending = self.take_outbox();
            if pending.is_empty() {
                return;
            }
            self.route_all(pending);
        }
        panic!("Signals did not settle");
    }

    /// Advance every clock in 10ms steps, polling and delivering after each.
    fn advance(&mut self, ms: i64) {
        for _ in 0..ms / 10 {
            for peer in &mut self.peers {
                peer.clock.advance(10);
                peer.presence.poll();
            }
            self.deliver();
        }
    }

    fn presence(&mut self, index: usize) -> &mut PresenceManager {
        &mut self.peers[index].presence
    }

    fn complete_broadcasts_since(&self, mark: usize) -> Vec<&ClientConnectionId> {
        self.history[mark..]
            .iter()
            .filter(|(_, signal)| signal.content.get("isComplete") == Some(&json!(true)))
            .map(|(sender, _)| sender)
            .collect()
    }
}

fn cursor(presence: &mut PresenceManager) -> Latest<'_, Point> {
    presence.workspace(POINTERS).unwrap().latest::<Point>("cursor").unwrap()
}

fn with_cursor(net: &mut Network, index: usize, start: Point) {
    net.presence(index).workspace(POINTERS).unwrap().add("cursor", latest(start));
}

#[test]
fn test_joining_clients_converge() {
    let mut net = Network::new();
    let names = ["a", "b", "c", "d"];
    for (i, name) in names.iter().enumerate() {
        let index = net.add_peer(name);
        with_cursor(&mut net, index, Point { x: i as i32, y: 0 });
        net.join(index);
        cursor(net.presence(index)).set_local(Point { x: i as i32, y: 1 }).unwrap();
        net.advance(100);
    }

    for index in 0..names.len() {
        let view = cursor(net.presence(index));
        let mut remote: Vec<_> = view.client_values().into_iter().map(|data| (data.client, data.value)).collect();
        remote.sort_by(|a, b| a.0.cmp(&b.0));
        let expected: Vec<_> = names
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != index)
            .map(|(i, name)| (ClientSessionId::from(*name), Point { x: i as i32, y: 1 }))
            .collect();
        assert_eq!(remote, expected, "client {index} did not converge");
    }
}

#[test]
fn test_providers_answer_and_others_cancel() {
    let mut net = Network::new();
    for name in ["a", "b", "c", "d"] {
        let index = net.add_peer(name);
        net.join(index);
    }
    let late = net.add_peer("e");
    let mark = net.history.len();

    net.join(late);

    let senders: Vec<_> = net.complete_broadcasts_since(mark).into_iter().map(|c| c.as_str().to_string()).collect();
    assert_eq!(senders, vec!["a-conn", "b-conn", "c-conn"]);
    assert!(matches!(net.presence(3).join_state(), JoinState::Cancelled { .. }));

    net.advance(500);
    assert_eq!(net.complete_broadcasts_since(mark).len(), 3);
    assert_eq!(net.presence(3).join_state(), JoinState::Idle);
}

#[test]
fn test_single_provider_answers_and_the_rest_cancel() {
    let mut net = Network::new();
    for (i, name) in ["a", "b", "c"].into_iter().enumerate() {
        let index = net.add_peer(name);
        with_cursor(&mut net, index, Point { x: i as i32, y: 0 });
        net.join(index);
    }
    let config = PresenceConfig { max_update_providers: 1, ..PresenceConfig::default() };
    let d = net.add_peer_with("d", config, 0);
    with_cursor(&mut net, d, Point { x: 3, y: 0 });
    let mark = net.history.len();

    net.join(d);

    let joins: Vec<_> = net.history[mark..]
        .iter()
        .filter(|(_, signal)| signal.message_type == "Pres:ClientJoin")
        .map(|(_, signal)| signal.content["updateProviders"].clone())
        .collect();
    assert_eq!(joins, vec![json!(["a-conn"])]);
    assert!(matches!(net.presence(1).join_state(), JoinState::Cancelled { deadline } if deadline == START + 220));
    assert!(matches!(net.presence(2).join_state(), JoinState::Cancelled { deadline } if deadline == START + 240));

    net.advance(500);

    let senders = net.complete_broadcasts_since(mark);
    assert_eq!(senders.len(), 1);
    assert_eq!(senders[0].as_str(), "a-conn");
    let view = cursor(net.presence(d));
    let mut seen: Vec<_> = view.client_values().into_iter().map(|data| (data.client, data.value.x)).collect();
    seen.sort_by(|a, b| a.0.cmp(&b.0));
    let expected: Vec<(ClientSessionId, i32)> =
        vec![(ClientSessionId::from("a"), 0), (ClientSessionId::from("b"), 1), (ClientSessionId::from("c"), 2)];
    assert_eq!(seen, expected);
}

#[test]
fn test_join_without_providers_is_answered_after_stagger() {
    let mut net = Network::new();
    let a = net.add_peer("a");
    let b = net.add_peer("b");
    with_cursor(&mut net, a, Point { x: 1, y: 1 });
    with_cursor(&mut net, b, Point { x: 2, y: 2 });
    net.join(a);
    net.join(b);

    let config = PresenceConfig { max_update_providers: 0, ..PresenceConfig::default() };
    let c = net.add_peer_with("c", config, 0);
    with_cursor(&mut net, c, Point { x: 3, y: 3 });
    let mark = net.history.len();
    net.join(c);

    assert!(net.complete_broadcasts_since(mark).is_empty());
    assert_eq!(net.presence(a).join_state(), JoinState::Scheduled { deadline: START + 200 });
    assert_eq!(net.presence(b).join_state(), JoinState::Scheduled { deadline: START + 220 });

    net.advance(300);

    let senders = net.complete_broadcasts_since(mark);
    assert_eq!(senders.len(), 1);
    assert_eq!(senders[0].as_str(), "a-conn");
    let seen = cursor(net.presence(c)).client_value(&"b".into()).unwrap();
    assert_eq!(seen.value, Point { x: 2, y: 2 });
}

#[test]
fn test_out_of_order_delivery_keeps_newest() {
    let mut net = Network::new();
    let a = net.add_peer("a");
    let b = net.add_peer("b");
    net.presence(a)
        .workspace(POINTERS)
        .unwrap()
        .add("cursor", latest(Point { x: 0, y: 0 }).with_allowable_latency(0));
    with_cursor(&mut net, b, Point { x: 0, y: 0 });
    net.join(a);
    net.join(b);
    let mut events = cursor(net.presence(b)).subscribe();

    cursor(net.presence(a)).set_local(Point { x: 1, y: 0 }).unwrap();
    let first = net.take_outbox();
    cursor(net.presence(a)).set_local(Point { x: 2, y: 0 }).unwrap();
    let second = net.take_outbox();
    net.route_all(second);
    net.route_all(first);

    let seen = cursor(net.presence(b)).client_value(&"a".into()).unwrap();
    assert_eq!(seen.value, Point { x: 2, y: 0 });
    assert_eq!(seen.metadata.revision, 2);
    match events.try_recv() {
        Ok(LatestEvent::Updated(data)) => assert_eq!(data.value, Point { x: 2, y: 0 }),
        other => panic!("Unexpected event {other:?}"),
    }
    assert!(events.try_recv().is_err());
}

#[test]
fn test_map_deletion_replicates_to_current_and_late_clients() {
    let mut net = Network::new();
    let a = net.add_peer("a");
    let b = net.add_peer("b");
    for index in [a, b] {
        net.presence(index)
            .workspace(POINTERS)
            .unwrap()
            .add("selected", latest_map::<String, u32>());
    }
    net.join(a);
    net.join(b);
    let mut events = net.presence(b).workspace(POINTERS).unwrap().latest_map::<String, u32>("selected").unwrap().subscribe();

    {
        let mut selected = net.presence(a).workspace(POINTERS).unwrap().latest_map::<String, u32>("selected").unwrap();
        selected.set("shape-1".into(), 1).unwrap();
        selected.set("shape-2".into(), 2).unwrap();
    }
    net.advance(100);
    while events.try_recv().is_ok() {}

    let removed = net
        .presence(a)
        .workspace(POINTERS)
        .unwrap()
        .latest_map::<String, u32>("selected")
        .unwrap()
        .delete(&"shape-1".to_string());
    assert!(removed);
    net.advance(100);

    assert!(matches!(
        events.try_recv(),
        Ok(LatestMapEvent::ItemRemoved { key, .. }) if key == "shape-1"
    ));
    let items = net
        .presence(b)
        .workspace(POINTERS)
        .unwrap()
        .latest_map::<String, u32>("selected")
        .unwrap()
        .client_value(&"a".into())
        .unwrap();
    assert_eq!(items.keys().collect::<Vec<_>>(), vec!["shape-2"]);

    let c = net.add_peer("c");
    net.presence(c).workspace(POINTERS).unwrap().add("selected", latest_map::<String, u32>());
    net.join(c);
    let items = net
        .presence(c)
        .workspace(POINTERS)
        .unwrap()
        .latest_map::<String, u32>("selected")
        .unwrap()
        .client_value(&"a".into())
        .unwrap();
    assert_eq!(items.keys().collect::<Vec<_>>(), vec!["shape-2"]);
    assert_eq!(items["shape-2"].value, 2);
}

#[test]
fn test_unregistered_keys_are_kept_and_adopted_later() {
    let mut net = Network::new();
    let a = net.add_peer("a");
    let b = net.add_peer("b");
    net.presence(a).workspace(POINTERS).unwrap().add("laser", latest(Point { x: 5, y: 5 }));
    net.presence(a).workspace("name:extra").unwrap().add("misc", latest(json!("hello")));
    net.join(a);
    net.join(b);

    let known = net.presence(b).workspace(POINTERS).unwrap().known_values("laser").map(|known| known.states.len());
    assert_eq!(known, Some(1));
    assert!(net.presence(b).workspace_addresses().any(|address| address.as_str() == "name:extra"));

    net.presence(b).workspace(POINTERS).unwrap().add("laser", latest(Point { x: 0, y: 0 }));
    let laser = net.presence(b).workspace(POINTERS).unwrap().latest::<Point>("laser").unwrap();
    assert_eq!(laser.client_value(&"a".into()).unwrap().value, Point { x: 5, y: 5 });

    // B forwards what it only holds raw to a client that joins later.
    net.leave(a);
    let c = net.add_peer("c");
    net.join(c);
    let known = net.presence(c).workspace("name:extra").unwrap().known_values("misc").map(|known| known.states.len());
    assert_eq!(known, Some(1));
}

#[test]
fn test_unknown_nested_state_retained_verbatim_after_skew() {
    let mut net = Network::new();
    let b = net.add_peer_with("b", PresenceConfig::default(), 1_000);
    net.join(b);

    let sent = json!({
        "revision": 4,
        "items": {
            "title": { "revision": 2, "timestamp": 100, "value": "Board" },
            "frames": {
                "revision": 3,
                "items": {
                    "f1": { "revision": 1, "timestamp": 200, "value": { "w": 10 } },
                    "f2": { "revision": 2, "timestamp": 300 }
                }
            }
        }
    });
    let signal = InboundSignal {
        client_id: "a-conn".into(),
        message_type: "Pres:DatastoreUpdate".to_string(),
        content: json!({
            "sendTimestamp": START,
            "avgLatency": 0.0,
            "data": { "name:pointers": { "layout": { "a": sent } } },
        }),
        target_client_id: None,
    };
    net.presence(b).process_signal(signal, false);

    let expected: RawState = serde_json::from_value(json!({
        "revision": 4,
        "items": {
            "title": { "revision": 2, "timestamp": 1_100, "value": "Board" },
            "frames": {
                "revision": 3,
                "items": {
                    "f1": { "revision": 1, "timestamp": 1_200, "value": { "w": 10 } },
                    "f2": { "revision": 2, "timestamp": 1_300 }
                }
            }
        }
    }))
    .unwrap();
    let raw = |presence: &mut PresenceManager| -> Option<RawState> {
        let workspace = presence.workspace(POINTERS).unwrap();
        let known = workspace.known_values("layout")?;
        let state = known.states.get(&ClientSessionId::from("a")).cloned();
        state
    };
    assert_eq!(raw(net.presence(b)), Some(expected.clone()));

    net.presence(b)
        .workspace(POINTERS)
        .unwrap()
        .add("layout", latest_map::<String, Value>());
    assert_eq!(raw(net.presence(b)), Some(expected));
}

#[test]
fn test_notification_relayed_by_unaware_client_fires_once() {
    let mut net = Network::new();
    let mut waves = Vec::new();
    for name in ["a", "b", "c"] {
        let index = net.add_peer(name);
        if name != "c" {
            net.presence(index).workspace(POINTERS).unwrap().add("reactions", notifications());
            let mut reactions = net.presence(index).workspace(POINTERS).unwrap().notifications("reactions").unwrap();
            waves.push(reactions.on("wave"));
        }
        net.join(index);
    }

    net.presence(0)
        .workspace(POINTERS)
        .unwrap()
        .notifications("reactions")
        .unwrap()
        .broadcast("wave", &1)
        .unwrap();
    net.deliver();
    for name in ["d", "e", "f"] {
        let index = net.add_peer(name);
        net.join(index);
        net.advance(300);
    }

    let received = std::iter::from_fn(|| waves[1].try_recv().ok()).count();
    assert_eq!(received, 1);
    assert!(waves[0].try_recv().is_err());
}

#[test]
fn test_notifications_broadcast_and_unicast() {
    let mut net = Network::new();
    let mut listeners = Vec::new();
    for name in ["a", "b", "c"] {
        let index = net.add_peer(name);
        net.presence(index).workspace(POINTERS).unwrap().add("reactions", notifications());
        net.join(index);
        let mut reactions = net.presence(index).workspace(POINTERS).unwrap().notifications("reactions").unwrap();
        listeners.push((reactions.on("wave"), reactions.subscribe_unattended()));
    }

    net.presence(0)
        .workspace(POINTERS)
        .unwrap()
        .notifications("reactions")
        .unwrap()
        .broadcast("wave", &json!({ "emoji": "hand" }))
        .unwrap();
    net.deliver();

    for (index, (waves, _)) in listeners.iter_mut().enumerate().skip(1) {
        let event = waves.try_recv().unwrap_or_else(|err| panic!("client {index} missed the wave: {err}"));
        assert_eq!(event.client.as_str(), "a");
        assert_eq!(event.args["emoji"], "hand");
    }
    assert!(listeners[0].0.try_recv().is_err());

    net.presence(0)
        .workspace(POINTERS)
        .unwrap()
        .notifications("reactions")
        .unwrap()
        .unicast("nudge", &3, &"c".into())
        .unwrap();
    net.deliver();

    assert!(listeners[1].1.try_recv().is_err());
    let nudge = listeners[2].1.try_recv().unwrap();
    assert_eq!(nudge.name, "nudge");
    assert_eq!(nudge.args_as::<u32>().unwrap(), 3);

    let unknown = net
        .presence(0)
        .workspace(POINTERS)
        .unwrap()
        .notifications("reactions")
        .unwrap()
        .unicast("nudge", &3, &"nobody".into());
    assert!(matches!(unknown, Err(PresenceError::AttendeeNotFound(_))));

    // Nothing was retained by anyone.
    for index in 0..3 {
        let known = net.presence(index).workspace(POINTERS).unwrap().known_values("reactions").map(|k| k.states.len());
        assert_eq!(known, None);
    }
}

#[test]
fn test_remote_timestamps_corrected_by_skew() {
    let mut net = Network::new();
    let a = net.add_peer("a");
    let b = net.add_peer_with("b", PresenceConfig::default(), 5_000);
    net.presence(a)
        .workspace(POINTERS)
        .unwrap()
        .add("cursor", latest(Point { x: 0, y: 0 }).with_allowable_latency(0));
    with_cursor(&mut net, b, Point { x: 0, y: 0 });
    net.join(a);
    net.join(b);

    net.advance(50);
    cursor(net.presence(a)).set_local(Point { x: 9, y: 9 }).unwrap();
    let sent_at = cursor(net.presence(a)).local_metadata().timestamp;
    net.deliver();

    let seen = cursor(net.presence(b)).client_value(&"a".into()).unwrap();
    assert_eq!(seen.metadata.timestamp, sent_at + 5_000);
}

#[test]
fn test_attendee_lifecycle() {
    let mut net = Network::new();
    let a = net.add_peer("a");
    let b = net.add_peer("b");
    with_cursor(&mut net, a, Point { x: 0, y: 0 });
    with_cursor(&mut net, b, Point { x: 4, y: 4 });
    net.join(a);
    let mut events = net.presence(a).subscribe_attendees();
    net.join(b);

    match events.try_recv() {
        Ok(AttendeeEvent::Connected(attendee)) => {
            assert_eq!(attendee.session_id.as_str(), "b");
            assert_eq!(attendee.connection_id.as_str(), "b-conn");
        }
        other => panic!("Unexpected event {other:?}"),
    }
    assert_eq!(net.presence(b).get_myself().unwrap().status, AttendeeStatus::Connected);
    assert_eq!(net.presence(b).get_attendee(&"a".into()).unwrap().status, AttendeeStatus::Connected);

    net.leave(b);
    assert!(matches!(events.try_recv(), Ok(AttendeeEvent::Disconnected(_))));
    assert_eq!(net.presence(a).get_attendee(&"b".into()).unwrap().status, AttendeeStatus::Disconnected);
    assert!(cursor(net.presence(a)).client_value(&"b".into()).is_ok());

    net.presence(a).remove_client_session(&"b".into());
    assert!(net.presence(a).get_attendee(&"b".into()).is_none());
    assert!(matches!(
        cursor(net.presence(a)).client_value(&"b".into()),
        Err(PresenceError::NotFound(_))
    ));
}

#[test]
fn test_workspace_lookup_errors() {
    let mut net = Network::new();
    let a = net.add_peer("a");
    let presence = net.presence(a);

    assert!(matches!(presence.workspace("pointers"), Err(PresenceError::InvalidWorkspaceAddress(_))));
    assert!(matches!(presence.workspace("system:presence"), Err(PresenceError::ReservedWorkspace(_))));

    presence.workspace(POINTERS).unwrap().add("cursor", latest(Point { x: 0, y: 0 }));
    assert!(matches!(
        presence.workspace(POINTERS).unwrap().latest::<Point>("missing"),
        Err(PresenceError::ManagerNotFound(_))
    ));
    assert!(matches!(
        presence.workspace(POINTERS).unwrap().latest_map::<String, Point>("cursor"),
        Err(PresenceError::ManagerTypeMismatch { expected: "LatestMap", .. })
    ));
    assert!(matches!(
        cursor(presence).client_value(&"ghost".into()),
        Err(PresenceError::NotFound(_))
    ));
}

#[test]
fn test_ensure_content_keeps_existing_managers() {
    let mut net = Network::new();
    let a = net.add_peer("a");
    let presence = net.presence(a);
    presence.workspace(POINTERS).unwrap().add("cursor", latest(Point { x: 0, y: 0 }));
    cursor(presence).set_local(Point { x: 7, y: 7 }).unwrap();

    let schema = WorkspaceSchema::new()
        .with_latest("cursor", Point { x: 1, y: 1 })
        .with_latest_map::<String, bool>("selected")
        .with_notifications("reactions");
    let workspace = presence.workspace_with(POINTERS, schema).unwrap();
    let mut keys = workspace.keys();
    keys.sort_unstable();
    assert_eq!(keys, vec!["cursor", "reactions", "selected"]);

    assert_eq!(*cursor(presence).local(), Point { x: 7, y: 7 });
}

#[test]
#[should_panic(expected = "already registered")]
fn test_duplicate_registration_panics() {
    let mut net = Network::new();
    let a = net.add_peer("a");
    let mut workspace = net.presence(a).workspace(POINTERS).unwrap();
    workspace.add("cursor", latest(Point { x: 0, y: 0 }));
    workspace.add("cursor", latest(Point { x: 0, y: 0 }));
}
