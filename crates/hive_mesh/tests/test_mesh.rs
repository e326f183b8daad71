use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use hive_mesh::{MeshConfig, MeshError, MeshRouter, NodeId, PeerUrl, TopologyEvent};
use serde_json::{Value, json};
use tokio::sync::mpsc::UnboundedReceiver;

/// Reserve a loopback port by binding and immediately releasing it.
fn free_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

fn node(name: &str, listen: SocketAddr, peer: Option<SocketAddr>) -> MeshRouter {
    let config = MeshConfig {
        listen_addr: listen,
        peers: peer
            .map(|addr| vec![PeerUrl::new(format!("ws://{addr}"))])
            .unwrap_or_default(),
        reconnect_delay: Duration::from_millis(50),
        request_timeout: Duration::from_secs(2),
        ..MeshConfig::default()
    };
    MeshRouter::with_node_id(NodeId::from(name), config)
}

fn hop_counts(router: &MeshRouter) -> BTreeMap<String, usize> {
    router
        .routes()
        .iter()
        .map(|r| (r.destination().to_string(), r.hop_count()))
        .collect()
}

fn expected(pairs: &[(&str, usize)]) -> BTreeMap<String, usize> {
    pairs.iter().map(|(n, h)| (n.to_string(), *h)).collect()
}

async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    let reached = tokio::time::timeout(Duration::from_secs(20), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for {what}");
}

/// Messages received within `window`, ignoring network change events.
async fn drain_messages(rx: &mut UnboundedReceiver<TopologyEvent>, window: Duration) -> Vec<(NodeId, Value)> {
    let mut out = Vec::new();
    while let Ok(Some(event)) = tokio::time::timeout(window, rx.recv()).await {
        if let TopologyEvent::Message(m) = event {
            out.push((m.sender, m.data));
        }
    }
    out
}

/// a dials b, b dials c, c dials d, d dials a.
async fn ring() -> [MeshRouter; 4] {
    let addrs = [free_addr(), free_addr(), free_addr(), free_addr()];
    let nodes = [
        node("a", addrs[0], Some(addrs[1])),
        node("b", addrs[1], Some(addrs[2])),
        node("c", addrs[2], Some(addrs[3])),
        node("d", addrs[3], Some(addrs[0])),
    ];
    for n in &nodes {
        n.start().await.unwrap();
    }
    for n in &nodes {
        wait_until("ring convergence", || n.nodes().len() == 3).await;
    }
    nodes
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ring_hop_counts() {
    let [a, b, c, d] = ring().await;

    // a is directly linked to b (outbound) and d (inbound); c is two hops
    // away in either direction.
    wait_until("a's table", || hop_counts(&a) == expected(&[("b", 1), ("c", 2), ("d", 1)])).await;
    wait_until("c's table", || hop_counts(&c) == expected(&[("a", 2), ("b", 1), ("d", 1)])).await;

    for router in [&a, &b, &c, &d] {
        for route in router.routes() {
            assert_eq!(router.route_to(route.destination()), Some(route.clone()));
            assert!(!route.contains(router.id()));
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_broadcast_delivered_exactly_once() {
    let [a, b, c, d] = ring().await;
    wait_until("a sees two-hop c", || hop_counts(&a).get("c") == Some(&2)).await;

    let mut inboxes = [b.subscribe(), c.subscribe(), d.subscribe()];
    let mut a_inbox = a.subscribe();

    assert_eq!(a.broadcast(json!({"seq": 1})), 3);

    for inbox in &mut inboxes {
        let got = drain_messages(inbox, Duration::from_millis(750)).await;
        assert_eq!(got, vec![(NodeId::from("a"), json!({"seq": 1}))]);
    }
    assert!(drain_messages(&mut a_inbox, Duration::from_millis(200)).await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_named_delivery_two_hops_away() {
    // a <- b <- c
    let (addr_a, addr_b) = (free_addr(), free_addr());
    let mut config_a = MeshConfig {
        listen_addr: addr_a,
        reconnect_delay: Duration::from_millis(50),
        request_timeout: Duration::from_secs(2),
        ..MeshConfig::default()
    };
    config_a.node_name = Some("worker-1".into());
    let a = MeshRouter::with_node_id(NodeId::from("a"), config_a);
    let b = node("b", addr_b, Some(addr_a));
    let c = node("c", free_addr(), Some(addr_b));
    for n in [&a, &b, &c] {
        n.start().await.unwrap();
    }

    wait_until("c learns a's name", || c.node_name(a.id()).as_deref() == Some("worker-1")).await;
    assert_eq!(c.route_to(a.id()).unwrap().hop_count(), 2);

    let mut a_inbox = a.subscribe();
    let mut b_inbox = b.subscribe();
    let mut c_inbox = c.subscribe();

    c.send_to_node("worker-1", json!("job-42")).unwrap();

    let at_a = drain_messages(&mut a_inbox, Duration::from_millis(750)).await;
    assert_eq!(at_a, vec![(NodeId::from("c"), json!("job-42"))]);
    assert!(drain_messages(&mut b_inbox, Duration::from_millis(200)).await.is_empty());
    assert!(drain_messages(&mut c_inbox, Duration::from_millis(200)).await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reply_travels_back_over_relay() {
    // a <- b <- c
    let (addr_a, addr_b) = (free_addr(), free_addr());
    let a = node("a", addr_a, None);
    let b = node("b", addr_b, Some(addr_a));
    let c = node("c", free_addr(), Some(addr_b));
    for n in [&a, &b, &c] {
        n.start().await.unwrap();
    }
    wait_until("c reaches a", || c.route_to(a.id()).is_some()).await;

    let mut a_inbox = a.subscribe();
    let mut c_inbox = c.subscribe();
    c.send_to_node("a", json!("ping")).unwrap();

    let incoming = loop {
        match tokio::time::timeout(Duration::from_secs(2), a_inbox.recv()).await.unwrap().unwrap() {
            TopologyEvent::Message(m) => break m,
            TopologyEvent::NetworkChanged(_) => continue,
        }
    };
    assert_eq!(incoming.return_route(), &[NodeId::from("b"), NodeId::from("c")]);
    incoming.send_back(json!("pong")).unwrap();

    let back = drain_messages(&mut c_inbox, Duration::from_millis(750)).await;
    assert_eq!(back, vec![(NodeId::from("a"), json!("pong"))]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_link_loss_reroutes() {
    let [a, b, c, _d] = ring().await;
    wait_until("a sees c", || hop_counts(&a).get("c") == Some(&2)).await;

    b.stop().await;

    wait_until("a reroutes around b", || hop_counts(&a) == expected(&[("c", 2), ("d", 1)])).await;
    let via = a.route_to(c.id()).unwrap();
    assert_eq!(via.hops(), &[NodeId::from("d"), NodeId::from("c")]);
    wait_until("c drops b", || !c.nodes().contains(b.id())).await;

    // Still deliverable after the reroute.
    let mut c_inbox = c.subscribe();
    a.send_to_node("c", json!("after")).unwrap();
    let got = drain_messages(&mut c_inbox, Duration::from_millis(750)).await;
    assert_eq!(got, vec![(NodeId::from("a"), json!("after"))]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rebuild_is_idempotent() {
    let [a, _b, _c, _d] = ring().await;
    wait_until("a converged", || hop_counts(&a).len() == 3).await;

    a.refresh_routes().await.unwrap();
    let first = hop_counts(&a);
    a.refresh_routes().await.unwrap();
    assert_eq!(hop_counts(&a), first);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_discovered_route_is_never_longer_than_path() {
    // a <- b <- c <- d : the only path from d to a has three hops.
    let (addr_a, addr_b, addr_c) = (free_addr(), free_addr(), free_addr());
    let a = node("a", addr_a, None);
    let b = node("b", addr_b, Some(addr_a));
    let c = node("c", addr_c, Some(addr_b));
    let d = node("d", free_addr(), Some(addr_c));
    for n in [&a, &b, &c, &d] {
        n.start().await.unwrap();
    }
    wait_until("d reaches a", || d.route_to(a.id()).is_some()).await;

    let route = d.route_to(a.id()).unwrap();
    assert!(route.hop_count() <= 3);
    let neighbours = d
        .send_with_result(&route, hive_mesh::MessageKind::TraceProbe, Value::Null)
        .await
        .unwrap();
    assert_eq!(neighbours, json!([]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unknown_identificator_rejected() {
    let [a, _b, _c, _d] = ring().await;
    match a.send_to_node("no-such-node", json!(1)) {
        Err(MeshError::RouteNotFound { target, local }) => {
            assert_eq!(target, "no-such-node");
            assert_eq!(&local, a.id());
        }
        other => panic!("expected RouteNotFound, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_secret_gates_peers() {
    let guarded_addr = free_addr();
    let guarded = MeshRouter::with_node_id(
        NodeId::from("guarded"),
        MeshConfig {
            listen_addr: guarded_addr,
            secret: Some("s3cr3t".into()),
            reconnect_delay: Duration::from_millis(50),
            request_timeout: Duration::from_secs(2),
            ..MeshConfig::default()
        },
    );
    guarded.start().await.unwrap();

    let with_secret = |name: &str, secret: &str| {
        MeshRouter::with_node_id(
            NodeId::from(name),
            MeshConfig {
                listen_addr: free_addr(),
                peers: vec![format!("{secret}@ws://{guarded_addr}").parse().unwrap()],
                reconnect_delay: Duration::from_millis(50),
                request_timeout: Duration::from_secs(2),
                ..MeshConfig::default()
            },
        )
    };
    let intruder = with_secret("intruder", "wrong");
    let friend = with_secret("friend", "s3cr3t");
    intruder.start().await.unwrap();
    friend.start().await.unwrap();

    wait_until("friend admitted", || guarded.nodes() == vec![NodeId::from("friend")]).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(guarded.nodes(), vec![NodeId::from("friend")]);
    assert!(intruder.nodes().is_empty());
    assert_eq!(guarded.connections().len(), 1);
}
