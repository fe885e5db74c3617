//! Invariant message passing over receiver buckets.
//!
//! Edges must be sorted by receiver. The edges of node `i` then form the
//! contiguous bucket `offsets[i]..offsets[i + 1]`, so the per-receiver sum
//! becomes a segment reduction.
//!
//! # Formula
//!
//! `out[i, c, lm] = sum_{e in bucket(i)} w[e, l, c] * x[sender(e), c] * Y[e, lm]`

use super::{require_dtype, require_u32};
use crate::error::{MaceOptError, Result};
use candle_core::{Device, Tensor};
use parking_lot::Mutex;

/// Fill `out` with the CSR row pointers of sorted `receivers`.
///
/// `out[i]` is the first edge whose receiver is `>= i`; `out[num_nodes]` is
/// the edge count.
pub fn first_occurrences(receivers: &[u32], num_nodes: usize, out: &mut Vec<u32>) -> Result<()> {
    if let Some(pos) = receivers.windows(2).position(|w| w[0] > w[1]) {
        return Err(MaceOptError::UnsortedReceivers(pos + 1));
    }
    if let Some(&last) = receivers.last() {
        if last as usize >= num_nodes {
            return Err(MaceOptError::ShapeMismatch(format!(
                "receiver {last} out of range for {num_nodes} nodes"
            )));
        }
    }

    out.clear();
    out.reserve(num_nodes + 1);
    let mut edge = 0;
    for node in 0..=num_nodes {
        while edge < receivers.len() && (receivers[edge] as usize) < node {
            edge += 1;
        }
        out.push(edge as u32);
    }
    Ok(())
}

/// Tensor-product message passing with receiver-bucket reduction.
pub struct InvariantMessagePassing {
    channels: usize,
    lmax: u32,
    /// Reused between calls to hold bucket offsets on the host
    scratch: Mutex<Vec<u32>>,
}

impl Clone for InvariantMessagePassing {
    fn clone(&self) -> Self {
        Self::new(self.channels, self.lmax)
    }
}

impl std::fmt::Debug for InvariantMessagePassing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvariantMessagePassing")
            .field("channels", &self.channels)
            .field("lmax", &self.lmax)
            .finish()
    }
}

impl InvariantMessagePassing {
    /// Create a primitive for `channels` scalar channels and degree `lmax`.
    pub fn new(channels: usize, lmax: u32) -> Self {
        Self {
            channels,
            lmax,
            scratch: Mutex::new(Vec::new()),
        }
    }

    /// Number of scalar channels.
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Maximum harmonic degree.
    pub fn lmax(&self) -> u32 {
        self.lmax
    }

    /// Bucket offsets [num_nodes + 1] of sorted u32 `receiver` indices.
    pub fn calculate_first_occurrences(&self, receiver: &Tensor, num_nodes: usize) -> Result<Tensor> {
        require_u32("message passing receiver", receiver)?;
        let receivers = receiver.to_vec1::<u32>()?;

        let mut scratch = self.scratch.lock();
        first_occurrences(&receivers, num_nodes, &mut scratch)?;
        Ok(Tensor::from_slice(scratch.as_slice(), num_nodes + 1, receiver.device())?)
    }

    /// Degree `l` of every harmonic component, as u32 indices [K].
    fn degree_index(&self, device: &Device) -> Result<Tensor> {
        let index: Vec<u32> = (0..=self.lmax)
            .flat_map(|l| std::iter::repeat(l).take(2 * l as usize + 1))
            .collect();
        let k = index.len();
        Ok(Tensor::from_vec(index, k, device)?)
    }

    /// Edge ids -> receiver node, reconstructed from the bucket offsets.
    fn segment_ids(offsets: &[u32], device: &Device) -> Result<Tensor> {
        let num_edges = offsets.last().copied().unwrap_or(0) as usize;
        let mut ids = Vec::with_capacity(num_edges);
        for (node, bounds) in offsets.windows(2).enumerate() {
            let len = bounds[1].saturating_sub(bounds[0]) as usize;
            ids.extend(std::iter::repeat(node as u32).take(len));
        }
        Ok(Tensor::from_vec(ids, num_edges, device)?)
    }

    /// Forward pass.
    ///
    /// # Arguments
    ///
    /// * `node_feats` - Node features [n, C]
    /// * `edge_attrs` - Edge harmonics [e, (lmax + 1)^2]
    /// * `edge_weights` - Per-edge path weights [e, lmax + 1, C]
    /// * `sender` - u32 sender indices [e]
    /// * `receiver` - u32 receiver indices [e], sorted
    /// * `offsets` - Bucket offsets from [`Self::calculate_first_occurrences`]
    ///
    /// Debug builds check that `offsets` were computed from `receiver`.
    ///
    /// # Returns
    ///
    /// Messages [n, C, (lmax + 1)^2]
    pub fn forward(
        &self,
        node_feats: &Tensor,
        edge_attrs: &Tensor,
        edge_weights: &Tensor,
        sender: &Tensor,
        receiver: &Tensor,
        offsets: &Tensor,
    ) -> Result<Tensor> {
        require_u32("message passing sender", sender)?;
        require_u32("message passing receiver", receiver)?;
        require_u32("message passing offsets", offsets)?;
        require_dtype(
            "message passing",
            node_feats.dtype(),
            &[edge_attrs, edge_weights],
        )?;

        let (n, c) = node_feats.dims2()?;
        let (e, k) = edge_attrs.dims2()?;
        let num_degrees = self.lmax as usize + 1;
        if c != self.channels
            || k != num_degrees * num_degrees
            || edge_weights.dims() != [e, num_degrees, c]
        {
            return Err(MaceOptError::ShapeMismatch(format!(
                "message passing expects node feats [n, {}], edge attrs [e, {}], weights [e, {}, {}]; got {:?}, {:?}, {:?}",
                self.channels,
                num_degrees * num_degrees,
                num_degrees,
                self.channels,
                node_feats.dims(),
                edge_attrs.dims(),
                edge_weights.dims()
            )));
        }

        if sender.dims1()? != e || receiver.dims1()? != e {
            return Err(MaceOptError::ShapeMismatch(format!(
                "message passing expects {e} sender and receiver indices, got {:?} and {:?}",
                sender.dims(),
                receiver.dims()
            )));
        }
        let offsets_host = offsets.to_vec1::<u32>()?;
        if offsets_host.len() != n + 1 || offsets_host[n] as usize != e {
            return Err(MaceOptError::ShapeMismatch(format!(
                "bucket offsets of length {} ending at {:?} do not describe {n} nodes and {e} edges",
                offsets_host.len(),
                offsets_host.last()
            )));
        }

        let device = node_feats.device();
        if e == 0 {
            return Ok(Tensor::zeros((n, c, k), node_feats.dtype(), device)?);
        }

        let segments = Self::segment_ids(&offsets_host, device)?;
        if cfg!(debug_assertions) {
            let expected = receiver.to_vec1::<u32>()?;
            if let Some(edge) = expected
                .iter()
                .zip(segments.to_vec1::<u32>()?)
                .position(|(r, s)| *r != s)
            {
                return Err(MaceOptError::ShapeMismatch(format!(
                    "bucket offsets disagree with receiver {} at edge {edge}",
                    expected[edge]
                )));
            }
        }

        // [e, K, C] -> [e, C, K]
        let w = edge_weights
            .index_select(&self.degree_index(device)?, 1)?
            .transpose(1, 2)?;
        let x = node_feats.index_select(sender, 0)?.unsqueeze(2)?;
        let y = edge_attrs.unsqueeze(1)?;
        let mji = w.broadcast_mul(&x)?.broadcast_mul(&y)?.contiguous()?;

        Ok(Tensor::zeros((n, c, k), node_feats.dtype(), device)?.index_add(&segments, &mji, 0)?)
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Invariant: every bucket holds exactly the edges of its node
        #[test]
        fn invariant_offsets_bound_every_bucket(mut receivers in prop::collection::vec(0u32..20, 0..200)) {
            receivers.sort_unstable();
            let mut out = Vec::new();
            first_occurrences(&receivers, 20, &mut out).unwrap();

            prop_assert_eq!(out.len(), 21);
            prop_assert_eq!(out[20] as usize, receivers.len());
            for node in 0..20u32 {
                let (start, end) = (out[node as usize] as usize, out[node as usize + 1] as usize);
                prop_assert!(start <= end);
                prop_assert!(receivers[start..end].iter().all(|&r| r == node));
            }
        }
    }
}
