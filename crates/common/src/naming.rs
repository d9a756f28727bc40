//! Synthetic-data naming convention
//!
//! Everything the harness creates in a shared environment is identifiable by
//! the `looneyTunesTest` marker. The formats here are consumed verbatim by
//! downstream validators and must not drift.

use crate::types::TestEntity;

/// Marker embedded in every synthetic display name
pub const TEST_MARKER: &str = "looneyTunesTest";

/// Email domain used for roster customers
pub const TEST_EMAIL_DOMAIN: &str = "looneytunestest.com";

/// Fixed character roster
pub const CHARACTER_ROSTER: [&str; 4] = ["Bugs Bunny", "Daffy Duck", "Porky Pig", "Tweety Bird"];

/// Fixed service-location roster
pub const LOCATION_ROSTER: [&str; 3] = ["Cedar Falls", "Winfield", "O'Fallon"];

/// `"<Character> - looneyTunesTest"`
pub fn display_name(character: &str) -> String {
    format!("{} - {}", character, TEST_MARKER)
}

/// `"<character.lowercase.dotted>@looneytunestest.com"`
pub fn email(character: &str) -> String {
    let local = character
        .split_whitespace()
        .map(|part| {
            part.chars()
                .filter(|c| c.is_ascii_alphanumeric())
                .collect::<String>()
                .to_ascii_lowercase()
        })
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(".");
    format!("{}@{}", local, TEST_EMAIL_DOMAIN)
}

/// `"[<Location>] Test Route - looneyTunesTest"`
pub fn route_name(location: &str) -> String {
    format!("[{}] Test Route - {}", location, TEST_MARKER)
}

/// Name for an entity created during a scenario. The run id keeps parallel
/// scenarios from colliding on the same name.
pub fn derived_name(base: &str, test_run_id: &str) -> String {
    format!("{} [{}] - {}", base, test_run_id, TEST_MARKER)
}

/// Case-insensitive marker check
pub fn contains_marker(value: &str) -> bool {
    value
        .to_ascii_lowercase()
        .contains(&TEST_MARKER.to_ascii_lowercase())
}

/// True iff any of the entity's identifiers carries the test marker
pub fn is_test_entity(entity: &TestEntity) -> bool {
    entity.identifiers().into_iter().any(contains_marker)
}
