//! Fixed roster of reusable synthetic entities
//!
//! Roster ids are derived from the display name, so every worker computes
//! the same id and upserts stay idempotent across processes.

use sha2::{Digest, Sha256};

use crate::naming::{self, CHARACTER_ROSTER, LOCATION_ROSTER};
use crate::types::{EntityKind, TestCustomer, TestDataMarker, TestEntity, TestRoute};

/// Stable identifier for a named entity
pub fn stable_id(kind: EntityKind, name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(name.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{}-{}", kind.as_str(), &digest[..12])
}

/// Home service location for a roster character
fn service_location(index: usize) -> &'static str {
    LOCATION_ROSTER[index % LOCATION_ROSTER.len()]
}

pub fn customers() -> Vec<TestCustomer> {
    CHARACTER_ROSTER
        .iter()
        .enumerate()
        .map(|(i, character)| {
            let name = naming::display_name(character);
            TestCustomer {
                id: stable_id(EntityKind::Customer, &name),
                email: naming::email(character),
                phone: Some(format!("555-01{:02}", i + 1)),
                service_address: Some(format!("{} Acme Way, {}", 100 + i, service_location(i))),
                name,
                is_test_data: TestDataMarker,
            }
        })
        .collect()
}

pub fn routes() -> Vec<TestRoute> {
    LOCATION_ROSTER
        .iter()
        .map(|location| {
            let name = naming::route_name(location);
            TestRoute {
                id: stable_id(EntityKind::Route, &name),
                location: location.to_string(),
                name,
                is_test_data: TestDataMarker,
            }
        })
        .collect()
}

/// Every roster entity, parents first
pub fn entities() -> Vec<TestEntity> {
    customers()
        .into_iter()
        .map(TestEntity::from)
        .chain(routes().into_iter().map(TestEntity::from))
        .collect()
}

/// Whether an entity id belongs to the fixed roster
pub fn is_roster_id(id: &str) -> bool {
    entities().iter().any(|e| e.id() == id)
}
