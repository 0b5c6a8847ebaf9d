//! Dependency graph analysis for tix
//!
//! Edges point from a ticket to the tickets it depends on. Cycles are
//! allowed; they simply keep every ticket on the cycle out of the ready
//! queue.

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeSet, HashMap};

use crate::ticket::{State, Ticket, TicketId};

/// Ticket dependency graph
pub struct TicketGraph {
    graph: DiGraph<TicketId, ()>,
    node_map: HashMap<TicketId, NodeIndex>,
    states: HashMap<TicketId, State>,
}

impl TicketGraph {
    /// Build a graph from a list of tickets
    pub fn from_tickets(tickets: &[Ticket]) -> Self {
        let mut graph = DiGraph::new();
        let mut node_map = HashMap::new();
        let mut states = HashMap::new();

        for ticket in tickets {
            let idx = graph.add_node(ticket.id.clone());
            node_map.insert(ticket.id.clone(), idx);
            states.insert(ticket.id.clone(), ticket.state.clone());
        }

        for ticket in tickets {
            let from = node_map[&ticket.id];
            let deps: BTreeSet<_> = ticket.depends_on.iter().collect();
            for dep in deps {
                // Dangling references get no edge
                if let Some(&to) = node_map.get(dep) {
                    graph.add_edge(from, to, ());
                }
            }
        }

        Self {
            graph,
            node_map,
            states,
        }
    }

    /// Tickets that depend on `id`, sorted
    pub fn dependents(&self, id: &str) -> Vec<TicketId> {
        let Some(&idx) = self.node_map.get(id) else {
            return Vec::new();
        };
        let ids: BTreeSet<_> = self
            .graph
            .neighbors_directed(idx, Direction::Incoming)
            .map(|n| self.graph[n].clone())
            .collect();
        ids.into_iter().collect()
    }

    /// Dependencies of `ticket` that are not in `done`
    ///
    /// A dependency that does not exist is never satisfied.
    pub fn unmet_dependencies(&self, ticket: &Ticket, done: &State) -> Vec<TicketId> {
        let mut seen = BTreeSet::new();
        ticket
            .depends_on
            .iter()
            .filter(|dep| seen.insert(dep.as_str()))
            .filter(|dep| self.states.get(dep.as_str()) != Some(done))
            .cloned()
            .collect()
    }

    /// Tickets in `initial` whose dependencies are all `done`, in input order
    pub fn ready<'a>(&self, tickets: &'a [Ticket], initial: &State, done: &State) -> Vec<&'a Ticket> {
        tickets
            .iter()
            .filter(|t| &t.state == initial && self.unmet_dependencies(t, done).is_empty())
            .collect()
    }

    /// Tickets in `initial` held back by unmet dependencies, with those dependencies
    pub fn blocked<'a>(
        &self,
        tickets: &'a [Ticket],
        initial: &State,
        done: &State,
    ) -> Vec<(&'a Ticket, Vec<TicketId>)> {
        tickets
            .iter()
            .filter(|t| &t.state == initial)
            .filter_map(|t| {
                let unmet = self.unmet_dependencies(t, done);
                (!unmet.is_empty()).then_some((t, unmet))
            })
            .collect()
    }
}
