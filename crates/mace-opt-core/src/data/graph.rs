//! Batched atomic graphs.

use super::neighbors::neighbor_list;
use super::structure::Configuration;
use crate::error::{MaceOptError, Result};
use candle_core::{Device, Tensor};

/// Maps atomic numbers to one-hot indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtomicNumberTable {
    zs: Vec<u32>,
}

impl AtomicNumberTable {
    /// Table over `zs`, in the given order.
    pub fn new(zs: Vec<u32>) -> Self {
        Self { zs }
    }

    /// Atomic numbers in one-hot order.
    pub fn zs(&self) -> &[u32] {
        &self.zs
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.zs.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.zs.is_empty()
    }

    /// One-hot index of atomic number `z`.
    pub fn index_of(&self, z: u32) -> Option<usize> {
        self.zs.iter().position(|&x| x == z)
    }
}

/// Graphs of one or more structures, concatenated into one disjoint graph.
#[derive(Debug, Clone)]
pub struct AtomicGraph {
    /// [n, 3] f64
    positions: Tensor,
    /// [n, num_elements] f64 one-hot
    node_attrs: Tensor,
    /// [2, e] i64, sorted by receiver
    edge_index: Tensor,
    /// [e, 3] f64 cartesian
    shifts: Tensor,
    /// [n] u32 graph id per node
    batch: Tensor,
    num_graphs: usize,
    num_nodes: usize,
    num_edges: usize,
}

impl AtomicGraph {
    /// Build the batched graph of `configs` with cutoff `r_max`.
    pub fn from_configurations(
        configs: &[Configuration],
        table: &AtomicNumberTable,
        r_max: f64,
        device: &Device,
    ) -> Result<Self> {
        if configs.is_empty() {
            return Err(MaceOptError::StructureError(
                "cannot build a graph from zero structures".to_string(),
            ));
        }
        let num_elements = table.len();
        let mut positions = Vec::new();
        let mut node_attrs = Vec::new();
        let mut senders = Vec::new();
        let mut receivers = Vec::new();
        let mut shifts = Vec::new();
        let mut batch = Vec::new();

        let mut offset = 0;
        for (graph, config) in configs.iter().enumerate() {
            for (&z, p) in config.atomic_numbers.iter().zip(&config.positions) {
                let index = table.index_of(z).ok_or_else(|| {
                    MaceOptError::StructureError(format!(
                        "structure {graph}: element Z={z} is not in the model's table {:?}",
                        table.zs()
                    ))
                })?;
                let mut one_hot = vec![0.0f64; num_elements];
                one_hot[index] = 1.0;
                node_attrs.extend(one_hot);
                positions.extend_from_slice(p);
                batch.push(graph as u32);
            }
            for edge in neighbor_list(config, r_max)? {
                senders.push((edge.sender + offset) as i64);
                receivers.push((edge.receiver + offset) as i64);
                shifts.extend_from_slice(&edge.shift);
            }
            offset += config.len();
        }

        let num_nodes = offset;
        let num_edges = senders.len();
        senders.extend(receivers);
        let graph = Self {
            positions: Tensor::from_vec(positions, (num_nodes, 3), device)?,
            node_attrs: Tensor::from_vec(node_attrs, (num_nodes, num_elements), device)?,
            edge_index: Tensor::from_vec(senders, (2, num_edges), device)?,
            shifts: Tensor::from_vec(shifts, (num_edges, 3), device)?,
            batch: Tensor::from_vec(batch, num_nodes, device)?,
            num_graphs: configs.len(),
            num_nodes,
            num_edges,
        };
        tracing::debug!(
            graphs = graph.num_graphs,
            nodes = num_nodes,
            edges = num_edges,
            "built atomic graph"
        );
        Ok(graph)
    }

    /// Positions [n, 3].
    pub fn positions(&self) -> &Tensor {
        &self.positions
    }

    /// One-hot element attributes [n, num_elements].
    pub fn node_attrs(&self) -> &Tensor {
        &self.node_attrs
    }

    /// Sender (row 0) and receiver (row 1) indices [2, e].
    pub fn edge_index(&self) -> &Tensor {
        &self.edge_index
    }

    /// Cartesian receiver shifts [e, 3].
    pub fn shifts(&self) -> &Tensor {
        &self.shifts
    }

    /// Graph id of every node [n].
    pub fn batch(&self) -> &Tensor {
        &self.batch
    }

    /// Number of structures.
    pub fn num_graphs(&self) -> usize {
        self.num_graphs
    }

    /// Total number of atoms.
    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    /// Total number of edges.
    pub fn num_edges(&self) -> usize {
        self.num_edges
    }

    /// Move every tensor to `device`.
    pub fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            positions: self.positions.to_device(device)?,
            node_attrs: self.node_attrs.to_device(device)?,
            edge_index: self.edge_index.to_device(device)?,
            shifts: self.shifts.to_device(device)?,
            batch: self.batch.to_device(device)?,
            ..*self
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::diamond;

    fn table() -> AtomicNumberTable {
        AtomicNumberTable::new(vec![1, 6])
    }

    #[test]
    fn table_lookup() {
        let t = table();
        assert_eq!(t.index_of(6), Some(1));
        assert_eq!(t.index_of(8), None);
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn single_structure_shapes() {
        let graph =
            AtomicGraph::from_configurations(&[diamond(3.567)], &table(), 1.6, &Device::Cpu)
                .unwrap();
        assert_eq!(graph.num_nodes(), 8);
        assert_eq!(graph.num_edges(), 32);
        assert_eq!(graph.edge_index().dims(), &[2, 32]);
        assert_eq!(graph.shifts().dims(), &[32, 3]);

        let attrs: Vec<Vec<f64>> = graph.node_attrs().to_vec2().unwrap();
        assert!(attrs.iter().all(|row| row == &[0.0, 1.0]));
    }

    #[test]
    fn batched_indices_are_offset_and_sorted() {
        let configs = [diamond(3.567), diamond(3.6)];
        let graph =
            AtomicGraph::from_configurations(&configs, &table(), 1.6, &Device::Cpu).unwrap();
        assert_eq!(graph.num_graphs(), 2);

        let receivers: Vec<i64> = graph.edge_index().get(1).unwrap().to_vec1().unwrap();
        assert!(receivers.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*receivers.last().unwrap(), 15);

        let batch: Vec<u32> = graph.batch().to_vec1().unwrap();
        assert_eq!(batch.iter().filter(|&&b| b == 1).count(), 8);
    }

    #[test]
    fn unknown_element() {
        let config = Configuration::isolated(vec![8], vec![[0.0; 3]]).unwrap();
        let err =
            AtomicGraph::from_configurations(&[config], &table(), 2.0, &Device::Cpu).unwrap_err();
        assert!(err.to_string().contains("Z=8"));
    }
}
