//! ---
//! ems_section: "08-energy-models-optimization"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Radial tree index built once per calculation."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::VecDeque;

use indexmap::{IndexMap, IndexSet};
use petgraph::{
    graph::{NodeIndex, UnGraph},
    visit::EdgeRef,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    errors::{CalcEngineError, Result},
    model::{CableMaterial, InstallationMethod, Network},
};

/// A cable oriented away from the source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Branch {
    pub cable_id: Uuid,
    pub parent: Uuid,
    pub child: Uuid,
    pub length_m: f64,
    /// Phase conductor resistance at 20 °C.
    pub r_phase_ohm: f64,
    /// Neutral conductor resistance at 20 °C.
    pub r_neutral_ohm: f64,
    pub ampacity_a: f64,
    pub material: CableMaterial,
    pub installation: InstallationMethod,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct UpstreamImpedance {
    pub phase_ohm: f64,
    pub neutral_ohm: f64,
}

#[derive(Debug, Clone, Copy, Default)]
struct PathMetrics {
    length_m: f64,
    impedance: UpstreamImpedance,
}

#[derive(Debug, Clone)]
pub struct TopologyIndex {
    source: Uuid,
    order: Vec<Uuid>,
    position: IndexMap<Uuid, usize>,
    parent_branch: IndexMap<Uuid, Branch>,
    children: IndexMap<Uuid, Vec<Uuid>>,
    metrics: IndexMap<Uuid, PathMetrics>,
    unreachable: Vec<Uuid>,
    loop_cables: Vec<Uuid>,
}

impl TopologyIndex {
    /// Indexes the network by breadth-first search from its single source.
    ///
    /// The first path discovered to a node is kept; any further cable reaching
    /// an already discovered node is recorded in [`TopologyIndex::loop_cables`].
    pub fn build(network: &Network) -> Result<Self> {
        let sources: Vec<Uuid> = network.source_nodes().map(|n| n.id).collect();
        let source = match sources.as_slice() {
            [] => return Err(CalcEngineError::MissingSource),
            [single] => *single,
            _ => return Err(CalcEngineError::MultipleSources(sources)),
        };

        let mut graph = UnGraph::<Uuid, usize>::new_undirected();
        let mut indices: IndexMap<Uuid, NodeIndex> = IndexMap::new();
        for node in &network.nodes {
            indices.insert(node.id, graph.add_node(node.id));
        }

        for (cable_idx, cable) in network.cables.iter().enumerate() {
            for endpoint in [cable.from, cable.to] {
                if !indices.contains_key(&endpoint) {
                    return Err(CalcEngineError::UnknownNode {
                        cable: cable.id,
                        node: endpoint,
                    });
                }
            }
            if network.cable_type(&cable.cable_type).is_none() {
                return Err(CalcEngineError::UnknownCableType {
                    cable: cable.id,
                    cable_type: cable.cable_type.clone(),
                });
            }
            graph.add_edge(indices[&cable.from], indices[&cable.to], cable_idx);
        }

        let mut order = Vec::with_capacity(network.nodes.len());
        let mut parent_branch: IndexMap<Uuid, Branch> = IndexMap::new();
        let mut children: IndexMap<Uuid, Vec<Uuid>> = IndexMap::new();
        let mut metrics: IndexMap<Uuid, PathMetrics> = IndexMap::new();
        let mut loop_cables: IndexSet<Uuid> = IndexSet::new();
        let mut visited: IndexSet<NodeIndex> = IndexSet::new();

        let mut queue = VecDeque::new();
        let source_idx = indices[&source];
        visited.insert(source_idx);
        metrics.insert(source, PathMetrics::default());
        queue.push_back(source_idx);

        while let Some(current_idx) = queue.pop_front() {
            let current = graph[current_idx];
            order.push(current);
            let arrived_by = parent_branch.get(&current).map(|b| b.cable_id);

            let mut edges: Vec<(usize, NodeIndex)> = graph
                .edges(current_idx)
                .map(|edge| {
                    let other = if edge.source() == current_idx {
                        edge.target()
                    } else {
                        edge.source()
                    };
                    (*edge.weight(), other)
                })
                .collect();
            // Input order keeps the traversal independent of graph internals.
            edges.sort_by_key(|(cable_idx, _)| *cable_idx);
            edges.dedup();

            for (cable_idx, next_idx) in edges {
                let cable = &network.cables[cable_idx];
                if Some(cable.id) == arrived_by {
                    continue;
                }
                if visited.contains(&next_idx) {
                    loop_cables.insert(cable.id);
                    continue;
                }
                visited.insert(next_idx);
                let next = graph[next_idx];
                let cable_type = network
                    .cable_type(&cable.cable_type)
                    .ok_or_else(|| CalcEngineError::UnknownCableType {
                        cable: cable.id,
                        cable_type: cable.cable_type.clone(),
                    })?;
                if !cable.has_length() {
                    warn!(cable = %cable.id, "cable has neither length nor geometry, assuming 0 m");
                }
                let length_m = cable.length_m();
                let branch = Branch {
                    cable_id: cable.id,
                    parent: current,
                    child: next,
                    length_m,
                    r_phase_ohm: cable_type.phase_resistance_ohm(length_m),
                    r_neutral_ohm: cable_type.neutral_resistance_ohm(length_m),
                    ampacity_a: cable_type.ampacity_a,
                    material: cable_type.material,
                    installation: cable.installation,
                };
                let upstream = metrics.get(&current).copied().unwrap_or_default();
                metrics.insert(
                    next,
                    PathMetrics {
                        length_m: upstream.length_m + branch.length_m,
                        impedance: UpstreamImpedance {
                            phase_ohm: upstream.impedance.phase_ohm + branch.r_phase_ohm,
                            neutral_ohm: upstream.impedance.neutral_ohm + branch.r_neutral_ohm,
                        },
                    },
                );
                children.entry(current).or_default().push(next);
                parent_branch.insert(next, branch);
                queue.push_back(next_idx);
            }
        }

        let unreachable: Vec<Uuid> = network
            .nodes
            .iter()
            .filter(|n| !metrics.contains_key(&n.id))
            .map(|n| n.id)
            .collect();
        for node in &unreachable {
            warn!(node = %node, "node is not connected to the source and is excluded");
        }
        for cable in &loop_cables {
            warn!(cable = %cable, "cable closes a loop in the network");
        }

        let position = order.iter().enumerate().map(|(i, id)| (*id, i)).collect();
        debug!(
            reachable = order.len(),
            unreachable = unreachable.len(),
            "topology indexed"
        );

        Ok(Self {
            source,
            order,
            position,
            parent_branch,
            children,
            metrics,
            unreachable,
            loop_cables: loop_cables.into_iter().collect(),
        })
    }

    pub fn source(&self) -> Uuid {
        self.source
    }

    /// Reachable nodes, parents always before their children.
    pub fn order(&self) -> &[Uuid] {
        &self.order
    }

    pub fn position(&self, node: Uuid) -> Option<usize> {
        self.position.get(&node).copied()
    }

    pub fn is_reachable(&self, node: Uuid) -> bool {
        self.metrics.contains_key(&node)
    }

    pub fn is_radial(&self) -> bool {
        self.loop_cables.is_empty()
    }

    pub fn unreachable(&self) -> &[Uuid] {
        &self.unreachable
    }

    pub fn loop_cables(&self) -> &[Uuid] {
        &self.loop_cables
    }

    /// Incoming branch of a reachable, non-source node.
    pub fn parent_branch(&self, node: Uuid) -> Option<&Branch> {
        self.parent_branch.get(&node)
    }

    pub fn parent(&self, node: Uuid) -> Option<Uuid> {
        self.parent_branch(node).map(|b| b.parent)
    }

    pub fn children(&self, node: Uuid) -> &[Uuid] {
        self.children.get(&node).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Branches in traversal order of their child node.
    pub fn branches(&self) -> impl Iterator<Item = &Branch> {
        self.order.iter().filter_map(|id| self.parent_branch.get(id))
    }

    /// Cables from the source to `node`, or `None` when unreachable.
    pub fn path_to(&self, node: Uuid) -> Option<Vec<Uuid>> {
        if !self.is_reachable(node) {
            return None;
        }
        let mut path = Vec::new();
        let mut cursor = node;
        while let Some(branch) = self.parent_branch.get(&cursor) {
            path.push(branch.cable_id);
            cursor = branch.parent;
        }
        path.reverse();
        Some(path)
    }

    pub fn upstream_impedance(&self, node: Uuid) -> Option<UpstreamImpedance> {
        self.metrics.get(&node).map(|m| m.impedance)
    }

    pub fn path_length(&self, node: Uuid) -> Option<f64> {
        self.metrics.get(&node).map(|m| m.length_m)
    }

    pub fn max_upstream_phase_impedance(&self) -> f64 {
        self.metrics
            .values()
            .map(|m| m.impedance.phase_ohm)
            .fold(0.0, f64::max)
    }

    /// The subtree rooted at `node` (node included), in traversal order.
    pub fn downstream(&self, node: Uuid) -> Vec<Uuid> {
        if !self.is_reachable(node) {
            return Vec::new();
        }
        let mut collected = Vec::new();
        let mut stack = vec![node];
        while let Some(current) = stack.pop() {
            collected.push(current);
            stack.extend(self.children(current).iter().copied());
        }
        collected.sort_by_key(|id| self.position(*id).unwrap_or(usize::MAX));
        collected
    }
}
