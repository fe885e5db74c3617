//! Extended XYZ reader.
//!
//! Each frame is an atom count line, a comment line of `key=value` pairs and
//! one line per atom:
//!
//! ```text
//! 2
//! Lattice="5.0 0 0 0 5.0 0 0 0 5.0" Properties=species:S:1:pos:R:3 pbc="T T T"
//! H 0.0 0.0 0.0
//! H 0.0 0.0 0.74
//! ```
//!
//! Only species (or `Z`) and positions are read. Other columns are skipped.

use super::structure::{atomic_number, Configuration};
use crate::error::{MaceOptError, Result};
use std::collections::HashMap;
use std::path::Path;

/// Read every frame of an extended XYZ file.
pub fn read_extxyz(path: &Path) -> Result<Vec<Configuration>> {
    let contents = std::fs::read_to_string(path)?;
    let frames = parse_extxyz(&contents)?;
    tracing::debug!(path = %path.display(), frames = frames.len(), "read extxyz");
    Ok(frames)
}

/// Parse every frame of extended XYZ text.
pub fn parse_extxyz(text: &str) -> Result<Vec<Configuration>> {
    let mut lines = text.lines().enumerate();
    let mut frames = Vec::new();

    while let Some((lineno, header)) = lines.next() {
        let header = header.trim();
        if header.is_empty() {
            continue;
        }
        let num_atoms: usize = header.parse().map_err(|_| {
            MaceOptError::StructureError(format!(
                "line {}: expected an atom count, found `{header}`",
                lineno + 1
            ))
        })?;
        let (_, comment) = lines.next().ok_or_else(|| {
            MaceOptError::StructureError(format!("line {}: missing comment line", lineno + 2))
        })?;
        let info = parse_info(comment)?;
        let columns = Columns::from_properties(info.get("properties").map(String::as_str))?;

        let mut atomic_numbers = Vec::with_capacity(num_atoms);
        let mut positions = Vec::with_capacity(num_atoms);
        for _ in 0..num_atoms {
            let (lineno, line) = lines.next().ok_or_else(|| {
                MaceOptError::StructureError(format!(
                    "frame {}: expected {num_atoms} atoms",
                    frames.len()
                ))
            })?;
            let (z, pos) = columns.parse_atom(line).map_err(|e| {
                MaceOptError::StructureError(format!("line {}: {e}", lineno + 1))
            })?;
            atomic_numbers.push(z);
            positions.push(pos);
        }

        let (cell, pbc) = match info.get("lattice") {
            Some(lattice) => {
                let cell = parse_lattice(lattice)?;
                let pbc = match info.get("pbc") {
                    Some(pbc) => parse_pbc(pbc)?,
                    None => [true; 3],
                };
                (cell, pbc)
            }
            None => ([[0.0; 3]; 3], [false; 3]),
        };
        frames.push(Configuration::new(atomic_numbers, positions, cell, pbc)?);
    }
    Ok(frames)
}

/// Split a comment line into lowercase keys and unquoted values.
fn parse_info(line: &str) -> Result<HashMap<String, String>> {
    let mut info = HashMap::new();
    let mut chars = line.trim().chars().peekable();
    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }
        let mut key = String::new();
        while let Some(c) = chars.next_if(|c| *c != '=' && !c.is_whitespace()) {
            key.push(c);
        }
        let mut value = String::new();
        if chars.next_if_eq(&'=').is_some() {
            if chars.next_if_eq(&'"').is_some() {
                value.extend(chars.by_ref().take_while(|c| *c != '"'));
            } else {
                while let Some(c) = chars.next_if(|c| !c.is_whitespace()) {
                    value.push(c);
                }
            }
        }
        if key.is_empty() {
            return Err(MaceOptError::StructureError(format!(
                "malformed comment line `{line}`"
            )));
        }
        info.insert(key.to_ascii_lowercase(), value);
    }
    Ok(info)
}

fn parse_lattice(value: &str) -> Result<[[f64; 3]; 3]> {
    let numbers = value
        .split_whitespace()
        .map(str::parse::<f64>)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| MaceOptError::StructureError(format!("Lattice: {e}")))?;
    if numbers.len() != 9 {
        return Err(MaceOptError::StructureError(format!(
            "Lattice has {} values, expected 9",
            numbers.len()
        )));
    }
    Ok(std::array::from_fn(|a| std::array::from_fn(|d| numbers[3 * a + d])))
}

fn parse_pbc(value: &str) -> Result<[bool; 3]> {
    let flags = value
        .split_whitespace()
        .map(|f| match f {
            "T" | "True" | "true" | "1" => Ok(true),
            "F" | "False" | "false" | "0" => Ok(false),
            other => Err(MaceOptError::StructureError(format!("pbc flag `{other}`"))),
        })
        .collect::<Result<Vec<_>>>()?;
    match flags.as_slice() {
        [a, b, c] => Ok([*a, *b, *c]),
        [a] => Ok([*a; 3]),
        _ => Err(MaceOptError::StructureError(format!(
            "pbc has {} flags, expected 3",
            flags.len()
        ))),
    }
}

/// Column positions of the fields we read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Columns {
    species: usize,
    numeric_species: bool,
    pos: usize,
    width: usize,
}

impl Columns {
    fn from_properties(properties: Option<&str>) -> Result<Self> {
        let Some(properties) = properties else {
            return Ok(Self {
                species: 0,
                numeric_species: false,
                pos: 1,
                width: 4,
            });
        };

        let fields: Vec<&str> = properties.split(':').collect();
        if fields.len() % 3 != 0 {
            return Err(MaceOptError::StructureError(format!(
                "Properties=`{properties}` is not name:type:count triples"
            )));
        }
        let mut species = None;
        let mut pos = None;
        let mut column = 0;
        for field in fields.chunks(3) {
            let count: usize = field[2].parse().map_err(|_| {
                MaceOptError::StructureError(format!("Properties column count `{}`", field[2]))
            })?;
            match (field[0], field[1]) {
                ("species", "S") => species = Some((column, false)),
                ("Z", "I") if species.is_none() => species = Some((column, true)),
                ("pos", "R") if count == 3 => pos = Some(column),
                _ => {}
            }
            column += count;
        }
        match (species, pos) {
            (Some((species, numeric_species)), Some(pos)) => Ok(Self {
                species,
                numeric_species,
                pos,
                width: column,
            }),
            _ => Err(MaceOptError::StructureError(format!(
                "Properties=`{properties}` lacks species or pos"
            ))),
        }
    }

    fn parse_atom(&self, line: &str) -> std::result::Result<(u32, [f64; 3]), String> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < self.width {
            return Err(format!(
                "{} columns, expected {}",
                tokens.len(),
                self.width
            ));
        }
        let species = tokens[self.species];
        let z = if self.numeric_species {
            species
                .parse()
                .map_err(|_| format!("atomic number `{species}`"))?
        } else {
            atomic_number(species).ok_or_else(|| format!("unknown element `{species}`"))?
        };
        let mut pos = [0.0; 3];
        for (d, p) in pos.iter_mut().enumerate() {
            let token = tokens[self.pos + d];
            *p = token
                .parse()
                .map_err(|_| format!("coordinate `{token}`"))?;
        }
        Ok((z, pos))
    }
}
