//! Atomic structures.

use crate::error::{MaceOptError, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const SYMBOLS: [&str; 118] = [
    "H", "He", "Li", "Be", "B", "C", "N", "O", "F", "Ne", "Na", "Mg", "Al", "Si", "P", "S", "Cl",
    "Ar", "K", "Ca", "Sc", "Ti", "V", "Cr", "Mn", "Fe", "Co", "Ni", "Cu", "Zn", "Ga", "Ge", "As",
    "Se", "Br", "Kr", "Rb", "Sr", "Y", "Zr", "Nb", "Mo", "Tc", "Ru", "Rh", "Pd", "Ag", "Cd", "In",
    "Sn", "Sb", "Te", "I", "Xe", "Cs", "Ba", "La", "Ce", "Pr", "Nd", "Pm", "Sm", "Eu", "Gd", "Tb",
    "Dy", "Ho", "Er", "Tm", "Yb", "Lu", "Hf", "Ta", "W", "Re", "Os", "Ir", "Pt", "Au", "Hg", "Tl",
    "Pb", "Bi", "Po", "At", "Rn", "Fr", "Ra", "Ac", "Th", "Pa", "U", "Np", "Pu", "Am", "Cm", "Bk",
    "Cf", "Es", "Fm", "Md", "No", "Lr", "Rf", "Db", "Sg", "Bh", "Hs", "Mt", "Ds", "Rg", "Cn", "Nh",
    "Fl", "Mc", "Lv", "Ts", "Og",
];

/// Atomic number of a chemical symbol such as `"C"`.
pub fn atomic_number(symbol: &str) -> Option<u32> {
    SYMBOLS
        .iter()
        .position(|s| *s == symbol)
        .map(|i| i as u32 + 1)
}

/// Chemical symbol of atomic number `z`.
pub fn chemical_symbol(z: u32) -> Option<&'static str> {
    SYMBOLS.get((z as usize).checked_sub(1)?).copied()
}

/// A single atomic structure.
#[derive(Debug, Clone, PartialEq)]
pub struct Configuration {
    /// Atomic number per atom.
    pub atomic_numbers: Vec<u32>,
    /// Cartesian positions in Angstrom.
    pub positions: Vec<[f64; 3]>,
    /// Lattice vectors as rows; all zeros for an isolated structure.
    pub cell: [[f64; 3]; 3],
    /// Periodicity along each lattice vector.
    pub pbc: [bool; 3],
}

impl Configuration {
    /// Create a structure, checking that every atom has a position.
    pub fn new(
        atomic_numbers: Vec<u32>,
        positions: Vec<[f64; 3]>,
        cell: [[f64; 3]; 3],
        pbc: [bool; 3],
    ) -> Result<Self> {
        if atomic_numbers.len() != positions.len() {
            return Err(MaceOptError::StructureError(format!(
                "{} atomic numbers for {} positions",
                atomic_numbers.len(),
                positions.len()
            )));
        }
        Ok(Self {
            atomic_numbers,
            positions,
            cell,
            pbc,
        })
    }

    /// Isolated structure without a cell.
    pub fn isolated(atomic_numbers: Vec<u32>, positions: Vec<[f64; 3]>) -> Result<Self> {
        Self::new(atomic_numbers, positions, [[0.0; 3]; 3], [false; 3])
    }

    /// Number of atoms.
    pub fn len(&self) -> usize {
        self.atomic_numbers.len()
    }

    /// Whether the structure has no atoms.
    pub fn is_empty(&self) -> bool {
        self.atomic_numbers.is_empty()
    }

    /// Supercell with `reps[k]` copies along lattice vector `k`.
    pub fn repeat(&self, reps: [usize; 3]) -> Self {
        let copies = reps.iter().product::<usize>();
        let mut atomic_numbers = Vec::with_capacity(self.len() * copies);
        let mut positions = Vec::with_capacity(self.len() * copies);
        for i in 0..reps[0] {
            for j in 0..reps[1] {
                for k in 0..reps[2] {
                    let shift = [i as f64, j as f64, k as f64];
                    let offset: [f64; 3] = std::array::from_fn(|d| {
                        (0..3).map(|a| shift[a] * self.cell[a][d]).sum()
                    });
                    atomic_numbers.extend_from_slice(&self.atomic_numbers);
                    positions.extend(
                        self.positions
                            .iter()
                            .map(|p| [p[0] + offset[0], p[1] + offset[1], p[2] + offset[2]]),
                    );
                }
            }
        }
        let cell = std::array::from_fn(|a| self.cell[a].map(|v| v * reps[a] as f64));
        Self {
            atomic_numbers,
            positions,
            cell,
            pbc: self.pbc,
        }
    }

    /// Displace every coordinate uniformly within `[-amplitude, amplitude]`.
    pub fn rattle(&mut self, amplitude: f64, seed: u64) {
        if amplitude <= 0.0 {
            return;
        }
        let mut rng = StdRng::seed_from_u64(seed);
        for p in &mut self.positions {
            for v in p.iter_mut() {
                *v += rng.gen_range(-amplitude..=amplitude);
            }
        }
    }
}

/// Cubic diamond cell (8 carbon atoms) with lattice constant `a`.
pub fn diamond(a: f64) -> Configuration {
    const BASIS: [[f64; 3]; 8] = [
        [0.0, 0.0, 0.0],
        [0.25, 0.25, 0.25],
        [0.0, 0.5, 0.5],
        [0.25, 0.75, 0.75],
        [0.5, 0.0, 0.5],
        [0.75, 0.25, 0.75],
        [0.5, 0.5, 0.0],
        [0.75, 0.75, 0.25],
    ];
    Configuration {
        atomic_numbers: vec![6; BASIS.len()],
        positions: BASIS.iter().map(|f| f.map(|v| v * a)).collect(),
        cell: [[a, 0.0, 0.0], [0.0, a, 0.0], [0.0, 0.0, a]],
        pbc: [true; 3],
    }
}
