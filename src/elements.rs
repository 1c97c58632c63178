//! Tabulated element data used for bond perception and mass weighting.
//!
//! Covalent radii are single-bond radii in Angstrom (Cordero et al., Dalton
//! Trans. 2008); masses are standard atomic weights in amu.

/// Radius used for symbols missing from the table.
pub const DEFAULT_COVALENT_RADIUS: f64 = 1.50;

/// Mass used for symbols missing from the table.
pub const DEFAULT_MASS: f64 = 12.0;

struct Element {
    symbol: &'static str,
    covalent_radius: f64,
    mass: f64,
}

const ELEMENTS: &[Element] = &[
    Element { symbol: "H", covalent_radius: 0.31, mass: 1.008 },
    Element { symbol: "He", covalent_radius: 0.28, mass: 4.0026 },
    Element { symbol: "Li", covalent_radius: 1.28, mass: 6.94 },
    Element { symbol: "Be", covalent_radius: 0.96, mass: 9.0122 },
    Element { symbol: "B", covalent_radius: 0.84, mass: 10.81 },
    Element { symbol: "C", covalent_radius: 0.76, mass: 12.011 },
    Element { symbol: "N", covalent_radius: 0.71, mass: 14.007 },
    Element { symbol: "O", covalent_radius: 0.66, mass: 15.999 },
    Element { symbol: "F", covalent_radius: 0.57, mass: 18.998 },
    Element { symbol: "Ne", covalent_radius: 0.58, mass: 20.180 },
    Element { symbol: "Na", covalent_radius: 1.66, mass: 22.990 },
    Element { symbol: "Mg", covalent_radius: 1.41, mass: 24.305 },
    Element { symbol: "Al", covalent_radius: 1.21, mass: 26.982 },
    Element { symbol: "Si", covalent_radius: 1.11, mass: 28.085 },
    Element { symbol: "P", covalent_radius: 1.07, mass: 30.974 },
    Element { symbol: "S", covalent_radius: 1.05, mass: 32.06 },
    Element { symbol: "Cl", covalent_radius: 1.02, mass: 35.45 },
    Element { symbol: "Ar", covalent_radius: 1.06, mass: 39.948 },
    Element { symbol: "K", covalent_radius: 2.03, mass: 39.098 },
    Element { symbol: "Ca", covalent_radius: 1.76, mass: 40.078 },
    Element { symbol: "Fe", covalent_radius: 1.32, mass: 55.845 },
    Element { symbol: "Co", covalent_radius: 1.26, mass: 58.933 },
    Element { symbol: "Ni", covalent_radius: 1.24, mass: 58.693 },
    Element { symbol: "Cu", covalent_radius: 1.32, mass: 63.546 },
    Element { symbol: "Zn", covalent_radius: 1.22, mass: 65.38 },
    Element { symbol: "Br", covalent_radius: 1.20, mass: 79.904 },
    Element { symbol: "Ru", covalent_radius: 1.46, mass: 101.07 },
    Element { symbol: "Rh", covalent_radius: 1.42, mass: 102.91 },
    Element { symbol: "Pd", covalent_radius: 1.39, mass: 106.42 },
    Element { symbol: "Ag", covalent_radius: 1.45, mass: 107.87 },
    Element { symbol: "Sn", covalent_radius: 1.39, mass: 118.71 },
    Element { symbol: "I", covalent_radius: 1.39, mass: 126.90 },
    Element { symbol: "Pt", covalent_radius: 1.36, mass: 195.08 },
    Element { symbol: "Au", covalent_radius: 1.36, mass: 196.97 },
    Element { symbol: "Pb", covalent_radius: 1.46, mass: 207.2 },
];

fn lookup(symbol: &str) -> Option<&'static Element> {
    let symbol = symbol.trim();
    ELEMENTS
        .iter()
        .find(|e| e.symbol.eq_ignore_ascii_case(symbol))
}

/// Covalent radius in Angstrom, if the element is tabulated.
pub fn covalent_radius(symbol: &str) -> Option<f64> {
    lookup(symbol).map(|e| e.covalent_radius)
}

/// Standard atomic mass in amu, if the element is tabulated.
pub fn atomic_mass(symbol: &str) -> Option<f64> {
    lookup(symbol).map(|e| e.mass)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_is_case_insensitive() {
        assert_eq!(covalent_radius("c"), Some(0.76));
        assert_eq!(covalent_radius(" CL "), Some(1.02));
        assert_eq!(atomic_mass("H"), Some(1.008));
    }

    #[test]
    fn test_unknown_symbol() {
        assert!(covalent_radius("Xx").is_none());
        assert!(atomic_mass("").is_none());
    }
}
