//! Routes, the routing table and the breadth-first discovery worklist.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::identity::NodeId;

/// Ordered hops from the local node to a destination.
///
/// Never empty: the first hop is a direct peer and the last hop is the
/// destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Route(Vec<NodeId>);

impl Route {
    /// A single-hop route to a direct peer.
    pub fn direct(peer: NodeId) -> Self {
        Self(vec![peer])
    }

    /// Build a route from explicit hops. Returns `None` for an empty list.
    pub fn from_hops(hops: Vec<NodeId>) -> Option<Self> {
        (!hops.is_empty()).then_some(Self(hops))
    }

    pub fn first_hop(&self) -> &NodeId {
        &self.0[0]
    }

    pub fn destination(&self) -> &NodeId {
        &self.0[self.0.len() - 1]
    }

    pub fn hop_count(&self) -> usize {
        self.0.len()
    }

    pub fn hops(&self) -> &[NodeId] {
        &self.0
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.0.contains(id)
    }

    /// This route followed by one more hop.
    pub fn extended(&self, next: NodeId) -> Self {
        let mut hops = self.0.clone();
        hops.push(next);
        Self(hops)
    }
}

/// Destination → shortest known route, iterated in discovery order.
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    routes: Vec<Route>,
    index: HashMap<NodeId, usize>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer a candidate route. It is kept if no route to its destination
    /// exists yet or if it is strictly shorter than the current one.
    /// Returns whether the table changed.
    pub fn offer(&mut self, route: Route) -> bool {
        match self.index.get(route.destination()) {
            Some(&slot) => {
                if route.hop_count() < self.routes[slot].hop_count() {
                    self.routes[slot] = route;
                    true
                } else {
                    false
                }
            }
            None => {
                self.index.insert(route.destination().clone(), self.routes.len());
                self.routes.push(route);
                true
            }
        }
    }

    pub fn get(&self, destination: &NodeId) -> Option<&Route> {
        self.index.get(destination).map(|&slot| &self.routes[slot])
    }

    pub fn contains(&self, destination: &NodeId) -> bool {
        self.index.contains_key(destination)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Route> {
        self.routes.iter()
    }

    /// Known destinations in discovery order.
    pub fn destinations(&self) -> Vec<NodeId> {
        self.routes.iter().map(|r| r.destination().clone()).collect()
    }

    /// Destination → hop count, for comparing tables independent of order.
    pub fn hop_counts(&self) -> BTreeMap<NodeId, usize> {
        self.routes
            .iter()
            .map(|r| (r.destination().clone(), r.hop_count()))
            .collect()
    }
}

/// Breadth-first expansion of a routing table by probing.
///
/// Seeded with one single-hop route per direct peer. Routes are handed out
/// in table order; neighbours reported by each probe are offered back as
/// one-hop extensions, so routes are visited in order of hop count.
#[derive(Debug)]
pub struct RouteDiscovery {
    local: NodeId,
    table: RoutingTable,
    cursor: usize,
}

impl RouteDiscovery {
    pub fn new(local: NodeId, direct_peers: impl IntoIterator<Item = NodeId>) -> Self {
        let mut table = RoutingTable::new();
        for peer in direct_peers {
            if peer != local {
                table.offer(Route::direct(peer));
            }
        }
        Self {
            local,
            table,
            cursor: 0,
        }
    }

    /// The next route to probe, or `None` once the worklist is exhausted.
    pub fn next_route(&mut self) -> Option<Route> {
        let route = self.table.routes.get(self.cursor).cloned()?;
        self.cursor += 1;
        Some(route)
    }

    /// Offer the neighbours reported by the endpoint of `via`.
    pub fn offer_neighbours(&mut self, via: &Route, neighbours: &[NodeId]) {
        for neighbour in neighbours {
            if *neighbour == self.local || via.contains(neighbour) {
                continue;
            }
            self.table.offer(via.extended(neighbour.clone()));
        }
    }

    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    pub fn finish(self) -> RoutingTable {
        self.table
    }
}

/// NodeId → human-readable name, with reverse lookup in registration order.
#[derive(Debug, Clone, Default)]
pub struct NodeNameRegistry {
    entries: Vec<(NodeId, String)>,
}

impl NodeNameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record or update the name of a node. An existing node keeps its
    /// registration position.
    pub fn register(&mut self, id: NodeId, name: impl Into<String>) {
        let name = name.into();
        match self.entries.iter_mut().find(|(known, _)| *known == id) {
            Some(entry) => entry.1 = name,
            None => self.entries.push((id, name)),
        }
    }

    pub fn name_of(&self, id: &NodeId) -> Option<&str> {
        self.entries
            .iter()
            .find(|(known, _)| known == id)
            .map(|(_, name)| name.as_str())
    }

    /// First registered node with this name.
    pub fn lookup(&self, name: &str) -> Option<&NodeId> {
        self.named(name).next()
    }

    /// Every node registered under this name, in registration order.
    pub fn named<'s, 'n>(&'s self, name: &'n str) -> impl Iterator<Item = &'s NodeId> + use<'s, 'n> {
        self.entries
            .iter()
            .filter(move |(_, n)| n == name)
            .map(|(id, _)| id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
