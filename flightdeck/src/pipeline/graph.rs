//! Channel data-flow graph.
//!
//! Nodes are channels; a pool that reads channel `a` and writes channel `b`
//! adds the edge `a -> b`. The graph must stay acyclic, and its reverse
//! topological order is the order channels are drained at shutdown:
//! downstream channels first, so nothing upstream is still feeding a
//! channel that was already emptied.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use crate::channel::PortRef;
use crate::ipc::shmem::ShmPath;

/// Errors from wiring a pool into the graph.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("pool `{pool}` uses channel `{channel}`, which is not registered")]
    UnknownChannel { pool: String, channel: String },
    #[error("pool `{pool}` would close a cycle through {}", .channels.join(" -> "))]
    Cycle { pool: String, channels: Vec<String> },
}

#[derive(Debug, Clone)]
struct PoolEdges {
    name: String,
    inputs: Vec<usize>,
    outputs: Vec<usize>,
}

/// Registered channels and the pools connecting them.
#[derive(Debug, Clone, Default)]
pub struct ChannelGraph {
    names: Vec<String>,
    index: HashMap<ShmPath, usize>,
    pools: Vec<PoolEdges>,
}

impl ChannelGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a channel; returns its node id. Idempotent.
    pub fn add_channel(&mut self, port: &PortRef) -> usize {
        if let Some(&id) = self.index.get(port.path()) {
            return id;
        }
        let id = self.names.len();
        self.names.push(port.name().to_string());
        self.index.insert(port.path().clone(), id);
        id
    }

    /// Wires a pool between already registered channels.
    ///
    /// The graph is left untouched on error.
    ///
    /// # Errors
    ///
    /// [`GraphError::UnknownChannel`] for an unregistered port,
    /// [`GraphError::Cycle`] if the new edges close a cycle.
    pub fn add_pool(
        &mut self,
        name: &str,
        inputs: &[PortRef],
        outputs: &[PortRef],
    ) -> Result<(), GraphError> {
        let resolve = |ports: &[PortRef]| -> Result<Vec<usize>, GraphError> {
            ports
                .iter()
                .map(|p| {
                    self.index
                        .get(p.path())
                        .copied()
                        .ok_or_else(|| GraphError::UnknownChannel {
                            pool: name.to_string(),
                            channel: p.name().to_string(),
                        })
                })
                .collect()
        };
        let edges = PoolEdges {
            name: name.to_string(),
            inputs: resolve(inputs)?,
            outputs: resolve(outputs)?,
        };

        self.pools.push(edges);
        if let Err(stuck) = self.topological_order() {
            self.pools.pop();
            return Err(GraphError::Cycle {
                pool: name.to_string(),
                channels: stuck.into_iter().map(|id| self.names[id].clone()).collect(),
            });
        }
        Ok(())
    }

    /// Forgets every pool, keeping the channels.
    pub fn clear_pools(&mut self) {
        self.pools.clear();
    }

    /// Kahn's algorithm, lowest node id first among ready nodes.
    ///
    /// On a cycle, returns the ids that never became ready.
    fn topological_order(&self) -> Result<Vec<usize>, Vec<usize>> {
        let n = self.names.len();
        let mut in_degree = vec![0usize; n];
        let mut adj: Vec<Vec<usize>> = vec![Vec::new(); n];
        for pool in &self.pools {
            for &from in &pool.inputs {
                for &to in &pool.outputs {
                    adj[from].push(to);
                    in_degree[to] += 1;
                }
            }
        }

        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, &d)| d == 0)
            .map(|(id, _)| Reverse(id))
            .collect();

        let mut order = Vec::with_capacity(n);
        while let Some(Reverse(node)) = ready.pop() {
            order.push(node);
            for &next in &adj[node] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.push(Reverse(next));
                }
            }
        }

        if order.len() == n {
            Ok(order)
        } else {
            Err((0..n).filter(|id| in_degree[*id] > 0).collect())
        }
    }

    /// Channel ids in drain order: reverse topological, downstream first.
    #[must_use]
    pub fn drain_order(&self) -> Vec<usize> {
        // add_pool rejects cycles, so the graph is always a DAG here.
        let mut order = self
            .topological_order()
            .unwrap_or_else(|_| (0..self.names.len()).collect());
        order.reverse();
        order
    }

    /// Name of channel `id`.
    #[must_use]
    pub fn channel_name(&self, id: usize) -> Option<&str> {
        self.names.get(id).map(String::as_str)
    }

    /// Node id of a registered channel.
    #[must_use]
    pub fn channel_id(&self, port: &PortRef) -> Option<usize> {
        self.index.get(port.path()).copied()
    }

    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.names.len()
    }

    /// Names of the pools wired so far.
    pub fn pool_names(&self) -> impl Iterator<Item = &str> {
        self.pools.iter().map(|p| p.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{BoundedChannel, ChannelOptions};

    fn port(name: &str) -> PortRef {
        let opts = ChannelOptions {
            shm_prefix: "flightdeck-test".to_string(),
            ..ChannelOptions::default()
        };
        // The port stays valid as a graph key after the channel is dropped.
        BoundedChannel::<u32>::create(name, 1, &opts).unwrap().port()
    }

    fn names(graph: &ChannelGraph, ids: &[usize]) -> Vec<String> {
        ids.iter()
            .map(|&id| graph.channel_name(id).unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_chain_drains_downstream_first() {
        let (a, b, c) = (port("a"), port("b"), port("c"));
        let mut graph = ChannelGraph::new();
        for p in [&a, &b, &c] {
            graph.add_channel(p);
        }
        graph.add_pool("source", &[], &[a.clone()]).unwrap();
        graph.add_pool("stage1", &[a.clone()], &[b.clone()]).unwrap();
        graph.add_pool("stage2", &[b.clone()], &[c.clone()]).unwrap();
        graph.add_pool("sink", &[c.clone()], &[]).unwrap();

        assert_eq!(names(&graph, &graph.drain_order()), ["c", "b", "a"]);
    }

    #[test]
    fn test_registration_order_breaks_ties() {
        let (hb, tel, cmd) = (port("heartbeat"), port("telemetry"), port("command"));
        let mut graph = ChannelGraph::new();
        for p in [&hb, &tel, &cmd] {
            graph.add_channel(p);
        }
        graph.add_pool("heartbeat_receiver", &[], &[hb.clone()]).unwrap();
        graph.add_pool("telemetry", &[], &[tel.clone()]).unwrap();
        graph.add_pool("command", &[tel.clone()], &[cmd.clone()]).unwrap();

        assert_eq!(
            names(&graph, &graph.drain_order()),
            ["command", "telemetry", "heartbeat"]
        );
    }

    #[test]
    fn test_cycle_rejected_and_graph_unchanged() {
        let (a, b) = (port("a"), port("b"));
        let mut graph = ChannelGraph::new();
        graph.add_channel(&a);
        graph.add_channel(&b);
        graph.add_pool("forward", &[a.clone()], &[b.clone()]).unwrap();

        let err = graph.add_pool("backward", &[b.clone()], &[a.clone()]).unwrap_err();
        match err {
            GraphError::Cycle { pool, channels } => {
                assert_eq!(pool, "backward");
                assert_eq!(channels, ["a", "b"]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
        assert_eq!(graph.pool_names().collect::<Vec<_>>(), ["forward"]);
        assert_eq!(names(&graph, &graph.drain_order()), ["b", "a"]);
    }

    #[test]
    fn test_unknown_channel() {
        let mut graph = ChannelGraph::new();
        let stray = port("stray");
        assert_eq!(
            graph.add_pool("p", &[stray], &[]),
            Err(GraphError::UnknownChannel {
                pool: "p".to_string(),
                channel: "stray".to_string()
            })
        );
    }

    #[test]
    fn test_add_channel_is_idempotent() {
        let a = port("a");
        let mut graph = ChannelGraph::new();
        assert_eq!(graph.add_channel(&a), 0);
        assert_eq!(graph.add_channel(&a), 0);
        assert_eq!(graph.channel_count(), 1);
        assert_eq!(graph.channel_id(&a), Some(0));
    }
}
