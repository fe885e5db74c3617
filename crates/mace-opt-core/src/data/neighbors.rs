//! Periodic neighbor lists.
//!
//! Every periodic image within the cutoff is enumerated explicitly, then
//! candidate pairs are found through a spatial hash with bins of edge
//! `r_max`, so only the 27 surrounding bins of a sender are scanned.
//!
//! Edges point from `sender` to the image `receiver + shift` and are sorted
//! by receiver, then sender, as the bucketed message passing requires.

use super::structure::Configuration;
use crate::error::{MaceOptError, Result};
use std::collections::HashMap;

/// One directed edge.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Edge {
    /// Source atom.
    pub sender: usize,
    /// Target atom.
    pub receiver: usize,
    /// Lattice translation of the receiver image, in units of the cell.
    pub unit_shift: [i32; 3],
    /// Cartesian shift `unit_shift @ cell`.
    pub shift: [f64; 3],
}

fn cross(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

/// Images needed along each lattice vector to cover `r_max`.
fn image_counts(config: &Configuration, r_max: f64) -> Result<[i32; 3]> {
    if !config.pbc.iter().any(|&p| p) {
        return Ok([0; 3]);
    }
    let cell = config.cell;
    let volume = dot(cell[0], cross(cell[1], cell[2])).abs();
    if volume < 1e-12 {
        return Err(MaceOptError::StructureError(
            "periodic structure has a degenerate cell".to_string(),
        ));
    }
    let mut counts = [0; 3];
    for k in 0..3 {
        if !config.pbc[k] {
            continue;
        }
        let face = cross(cell[(k + 1) % 3], cell[(k + 2) % 3]);
        // distance between opposite faces
        let height = volume / dot(face, face).sqrt();
        counts[k] = (r_max / height).ceil() as i32;
    }
    Ok(counts)
}

/// All edges of `config` shorter than `r_max`, without self-interaction.
pub fn neighbor_list(config: &Configuration, r_max: f64) -> Result<Vec<Edge>> {
    if !(r_max > 0.0) {
        return Err(MaceOptError::StructureError(format!(
            "cutoff must be positive, got {r_max}"
        )));
    }
    let counts = image_counts(config, r_max)?;
    let cell = config.cell;

    let bin_of = |p: [f64; 3]| p.map(|v| (v / r_max).floor() as i64);
    let mut images: Vec<(usize, [i32; 3], [f64; 3], [f64; 3])> = Vec::new();
    let mut bins: HashMap<[i64; 3], Vec<usize>> = HashMap::new();
    for a in -counts[0]..=counts[0] {
        for b in -counts[1]..=counts[1] {
            for c in -counts[2]..=counts[2] {
                let unit_shift = [a, b, c];
                let shift: [f64; 3] = std::array::from_fn(|d| {
                    (0..3).map(|k| unit_shift[k] as f64 * cell[k][d]).sum()
                });
                for (atom, p) in config.positions.iter().enumerate() {
                    let image = [p[0] + shift[0], p[1] + shift[1], p[2] + shift[2]];
                    bins.entry(bin_of(image)).or_default().push(images.len());
                    images.push((atom, unit_shift, shift, image));
                }
            }
        }
    }

    let cutoff2 = r_max * r_max;
    let mut edges = Vec::new();
    for (sender, p) in config.positions.iter().enumerate() {
        let home = bin_of(*p);
        for dx in -1..=1 {
            for dy in -1..=1 {
                for dz in -1..=1 {
                    let Some(members) = bins.get(&[home[0] + dx, home[1] + dy, home[2] + dz])
                    else {
                        continue;
                    };
                    for &index in members {
                        let (receiver, unit_shift, shift, image) = images[index];
                        if receiver == sender && unit_shift == [0; 3] {
                            continue;
                        }
                        let d = [image[0] - p[0], image[1] - p[1], image[2] - p[2]];
                        if dot(d, d) < cutoff2 {
                            edges.push(Edge {
                                sender,
                                receiver,
                                unit_shift,
                                shift,
                            });
                        }
                    }
                }
            }
        }
    }

    edges.sort_by(|x, y| {
        (x.receiver, x.sender, x.unit_shift).cmp(&(y.receiver, y.sender, y.unit_shift))
    });
    Ok(edges)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::diamond;

    fn length(config: &Configuration, e: &Edge) -> f64 {
        let s = config.positions[e.sender];
        let r = config.positions[e.receiver];
        let d: [f64; 3] = std::array::from_fn(|k| r[k] + e.shift[k] - s[k]);
        dot(d, d).sqrt()
    }

    #[test]
    fn diamond_has_four_nearest_neighbors() {
        let config = diamond(3.567);
        // bond length a * sqrt(3) / 4 = 1.545
        let edges = neighbor_list(&config, 1.6).unwrap();
        assert_eq!(edges.len(), 8 * 4);
        for atom in 0..8 {
            assert_eq!(edges.iter().filter(|e| e.receiver == atom).count(), 4);
        }
        assert!(edges.iter().all(|e| (length(&config, e) - 1.5446).abs() < 1e-3));
    }

    #[test]
    fn sorted_by_receiver_then_sender() {
        let edges = neighbor_list(&diamond(3.567), 3.0).unwrap();
        assert!(edges
            .windows(2)
            .all(|w| (w[0].receiver, w[0].sender) <= (w[1].receiver, w[1].sender)));
    }

    #[test]
    fn small_cell_sees_own_images() {
        let config = Configuration::new(
            vec![1],
            vec![[0.0; 3]],
            [[2.0, 0.0, 0.0], [0.0, 2.0, 0.0], [0.0, 0.0, 2.0]],
            [true; 3],
        )
        .unwrap();
        let edges = neighbor_list(&config, 2.5).unwrap();
        // 6 faces at 2.0, 12 edges at 2.83 are outside
        assert_eq!(edges.len(), 6);
        assert!(edges.iter().all(|e| e.sender == 0 && e.receiver == 0));
        assert!(edges.iter().all(|e| e.unit_shift != [0; 3]));
    }

    #[test]
    fn isolated_pair() {
        let config = Configuration::isolated(vec![1, 1], vec![[0.0; 3], [0.0, 0.0, 0.74]]).unwrap();
        let edges = neighbor_list(&config, 1.0).unwrap();
        assert_eq!(edges.len(), 2);
        assert_eq!((edges[0].sender, edges[0].receiver), (1, 0));
        assert!(edges.iter().all(|e| e.shift == [0.0; 3]));
    }

    #[test]
    fn edges_are_symmetric() {
        let mut config = diamond(3.567);
        config.rattle(0.1, 3);
        let edges = neighbor_list(&config, 2.6).unwrap();
        for e in &edges {
            let back = [-e.unit_shift[0], -e.unit_shift[1], -e.unit_shift[2]];
            assert!(edges.iter().any(|f| f.sender == e.receiver
                && f.receiver == e.sender
                && f.unit_shift == back));
        }
    }

    #[test]
    fn rejects_degenerate_periodic_cell() {
        let config = Configuration::new(vec![1], vec![[0.0; 3]], [[0.0; 3]; 3], [true; 3]).unwrap();
        assert!(neighbor_list(&config, 2.0).is_err());
    }
}
