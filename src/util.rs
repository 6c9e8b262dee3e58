use rand::Rng;

use crate::Role;

const FLEET_NODE_ADDR: &str = "FLEET_NODE_ADDR";

/// Address this node joins the fleet under.
///
/// Taken from `FLEET_NODE_ADDR`, otherwise `<role>-<n>` with a random `n`.
pub fn get_node_addr(role: Role) -> String {
    std::env::var(FLEET_NODE_ADDR).unwrap_or_else(|_| {
        let n: u16 = rand::rng().random_range(1..2000);
        format!("{role}-{n}")
    })
}

const FLEET_SEGMENT: &str = "FLEET_SEGMENT";

pub fn get_segment() -> Option<String> {
    std::env::var(FLEET_SEGMENT).ok()
}

