use crate::models::WaypointSymbol;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A positional graph node. The waypoint's own symbol is deliberately not a
/// field: a waypoint is always addressed through the map that holds it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Waypoint {
    pub x: f64,
    pub y: f64,
    pub waypoint_type: String,
    pub traits: BTreeSet<String>,
    pub has_fuel: bool,
    pub orbitals: BTreeSet<WaypointSymbol>,
}

/// waypoint symbol -> waypoint, for one system
pub type SystemGraph = BTreeMap<WaypointSymbol, Waypoint>;

impl Waypoint {
    pub fn distance_to(&self, other: &Waypoint) -> f64 {
        (other.x - self.x).hypot(other.y - self.y)
    }

    pub fn is_orbital_of(&self, other_symbol: &WaypointSymbol) -> bool {
        self.orbitals.contains(other_symbol)
    }

    pub fn has_trait(&self, trait_symbol: &str) -> bool {
        self.traits.contains(trait_symbol)
    }
}

/// Orbital siblings (parent/child orbital relationship or identical
/// coordinates) travel for free: 0 fuel, 1 second, any flight mode.
pub fn is_orbital_hop(
    a_symbol: &WaypointSymbol,
    a: &Waypoint,
    b_symbol: &WaypointSymbol,
    b: &Waypoint,
) -> bool {
    a.is_orbital_of(b_symbol) || b.is_orbital_of(a_symbol) || a.distance_to(b) == 0.0
}

#[cfg(test)]
mod test {
    use super::*;

    pub fn waypoint(x: f64, y: f64) -> Waypoint {
        Waypoint {
            x,
            y,
            waypoint_type: "PLANET".to_string(),
            traits: BTreeSet::new(),
            has_fuel: false,
            orbitals: BTreeSet::new(),
        }
    }

    #[test]
    fn test_distance() {
        let a = waypoint(0.0, 0.0);
        let b = waypoint(3.0, 4.0);
        assert_eq!(a.distance_to(&b), 5.0);
    }

    #[test]
    fn test_orbital_hop_by_listing() {
        let a_symbol = WaypointSymbol::new("X1-S1-A1");
        let b_symbol = WaypointSymbol::new("X1-S1-A2");
        let mut a = waypoint(5.0, 5.0);
        let b = waypoint(40.0, 40.0);
        a.orbitals.insert(b_symbol.clone());
        assert!(is_orbital_hop(&a_symbol, &a, &b_symbol, &b));
        assert!(is_orbital_hop(&b_symbol, &b, &a_symbol, &a));
    }

    #[test]
    fn test_orbital_hop_by_coordinates() {
        let a_symbol = WaypointSymbol::new("X1-S1-A1");
        let b_symbol = WaypointSymbol::new("X1-S1-B1");
        let a = waypoint(5.0, 5.0);
        let b = waypoint(5.0, 5.0);
        assert!(is_orbital_hop(&a_symbol, &a, &b_symbol, &b));
    }
}
