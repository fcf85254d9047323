//! Parent-before-child ordering of the section hierarchy.

use anyhow::Result;
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;

use crate::error::SyncError;
use crate::model::Section;

/// Order sections so every parent precedes its children.
///
/// A `parent_id` that is not part of `sections` is treated as a root. Any
/// cycle (including a section that is its own parent) fails with
/// [`SyncError::SectionCycle`] naming every section on the cycle.
pub fn order_sections(sections: &[Section]) -> Result<Vec<&Section>> {
    let mut graph: DiGraph<usize, ()> = DiGraph::with_capacity(sections.len(), sections.len());
    let mut nodes: HashMap<i64, NodeIndex> = HashMap::with_capacity(sections.len());

    for (idx, section) in sections.iter().enumerate() {
        nodes.insert(section.id, graph.add_node(idx));
    }

    for section in sections {
        if let Some(parent_id) = section.parent_id {
            if let Some(&parent) = nodes.get(&parent_id) {
                graph.add_edge(parent, nodes[&section.id], ());
            }
        }
    }

    match toposort(&graph, None) {
        Ok(order) => Ok(order.into_iter().map(|node| &sections[graph[node]]).collect()),
        Err(_) => {
            let mut cyclic: Vec<i64> = tarjan_scc(&graph)
                .into_iter()
                .filter(|component| {
                    component.len() > 1
                        || graph.contains_edge(component[0], component[0])
                })
                .flatten()
                .map(|node| sections[graph[node]].id)
                .collect();
            cyclic.sort_unstable();
            Err(SyncError::SectionCycle(cyclic).into())
        }
    }
}
