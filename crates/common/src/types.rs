//! Core types for the test-data lifecycle

use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::Error;

/// Execution mode of a scenario
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestMode {
    /// Disposable private database restored from a snapshot
    Isolated,
    /// Shared production-like environment, synthetic roster data only
    Production,
    /// Scenario is valid in either environment
    Dual,
}

impl TestMode {
    pub const ALL: [TestMode; 3] = [TestMode::Isolated, TestMode::Production, TestMode::Dual];

    pub fn as_str(&self) -> &'static str {
        match self {
            TestMode::Isolated => "isolated",
            TestMode::Production => "production",
            TestMode::Dual => "dual",
        }
    }

    /// Scenario tag that selects this mode
    pub fn tag(&self) -> &'static str {
        match self {
            TestMode::Isolated => "@isolated",
            TestMode::Production => "@production",
            TestMode::Dual => "@dual",
        }
    }

    /// Whether the snapshot database can back this mode
    pub fn uses_database(&self) -> bool {
        matches!(self, TestMode::Isolated | TestMode::Dual)
    }

    /// Whether the shared production store can back this mode
    pub fn uses_production(&self) -> bool {
        matches!(self, TestMode::Production | TestMode::Dual)
    }
}

impl fmt::Display for TestMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TestMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "isolated" => Ok(TestMode::Isolated),
            "production" => Ok(TestMode::Production),
            "dual" => Ok(TestMode::Dual),
            other => Err(Error::InvalidConfig(format!(
                "unknown test mode '{}' (expected isolated, production or dual)",
                other
            ))),
        }
    }
}

/// Marker carried by every entity exposed through a data context.
///
/// Serializes as `true` and refuses to deserialize anything else, so a row
/// that is not flagged as test data can never be loaded into a data set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TestDataMarker;

impl Serialize for TestDataMarker {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bool(true)
    }
}

impl<'de> Deserialize<'de> for TestDataMarker {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if bool::deserialize(deserializer)? {
            Ok(TestDataMarker)
        } else {
            Err(D::Error::custom("entity is not marked as test data"))
        }
    }
}

/// The fixed set of entity kinds the harness manages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Customer,
    Route,
    Ticket,
    Assignment,
}

impl EntityKind {
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Customer,
        EntityKind::Route,
        EntityKind::Ticket,
        EntityKind::Assignment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Customer => "customer",
            EntityKind::Route => "route",
            EntityKind::Ticket => "ticket",
            EntityKind::Assignment => "assignment",
        }
    }

    /// Backing table name
    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::Customer => "customers",
            EntityKind::Route => "routes",
            EntityKind::Ticket => "tickets",
            EntityKind::Assignment => "assignments",
        }
    }

    pub fn from_table(table: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.table() == table)
    }

    /// Cleanup priority: children are removed before their parents
    pub fn cleanup_priority(&self) -> u32 {
        match self {
            EntityKind::Assignment => 40,
            EntityKind::Ticket => 30,
            EntityKind::Route => 20,
            EntityKind::Customer => 10,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCustomer {
    pub id: String,
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub service_address: Option<String>,
    pub is_test_data: TestDataMarker,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRoute {
    pub id: String,
    pub name: String,
    pub location: String,
    pub is_test_data: TestDataMarker,
}

/// Ticket status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    #[default]
    Open,
    InProgress,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestTicket {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub customer_id: String,
    #[serde(default)]
    pub route_id: Option<String>,
    #[serde(default)]
    pub status: TicketStatus,
    pub is_test_data: TestDataMarker,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestAssignment {
    pub id: String,
    pub ticket_id: String,
    pub route_id: String,
    pub technician: String,
    pub is_test_data: TestDataMarker,
}

/// Closed union over every entity kind a data context can hold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TestEntity {
    Customer(TestCustomer),
    Route(TestRoute),
    Ticket(TestTicket),
    Assignment(TestAssignment),
}

impl TestEntity {
    pub fn kind(&self) -> EntityKind {
        match self {
            TestEntity::Customer(_) => EntityKind::Customer,
            TestEntity::Route(_) => EntityKind::Route,
            TestEntity::Ticket(_) => EntityKind::Ticket,
            TestEntity::Assignment(_) => EntityKind::Assignment,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            TestEntity::Customer(c) => &c.id,
            TestEntity::Route(r) => &r.id,
            TestEntity::Ticket(t) => &t.id,
            TestEntity::Assignment(a) => &a.id,
        }
    }

    /// Unique display identifier (the store's name column)
    pub fn name(&self) -> &str {
        match self {
            TestEntity::Customer(c) => &c.name,
            TestEntity::Route(r) => &r.name,
            TestEntity::Ticket(t) => &t.title,
            TestEntity::Assignment(a) => &a.id,
        }
    }

    /// Every human-visible identifier that may carry the test marker
    pub fn identifiers(&self) -> Vec<&str> {
        match self {
            TestEntity::Customer(c) => vec![c.name.as_str(), c.email.as_str()],
            TestEntity::Route(r) => vec![r.name.as_str()],
            TestEntity::Ticket(t) => vec![t.title.as_str(), t.description.as_str()],
            TestEntity::Assignment(a) => vec![a.id.as_str(), a.technician.as_str()],
        }
    }
}

impl From<TestCustomer> for TestEntity {
    fn from(c: TestCustomer) -> Self {
        TestEntity::Customer(c)
    }
}

impl From<TestRoute> for TestEntity {
    fn from(r: TestRoute) -> Self {
        TestEntity::Route(r)
    }
}

impl From<TestTicket> for TestEntity {
    fn from(t: TestTicket) -> Self {
        TestEntity::Ticket(t)
    }
}

impl From<TestAssignment> for TestEntity {
    fn from(a: TestAssignment) -> Self {
        TestEntity::Assignment(a)
    }
}

/// Correlation metadata attached to a data set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestMetadata {
    pub created_at: DateTime<Utc>,
    pub mode: TestMode,
    pub version: String,
    pub test_run_id: String,
}

impl TestMetadata {
    pub fn new(mode: TestMode, test_run_id: impl Into<String>) -> Self {
        Self {
            created_at: Utc::now(),
            mode,
            version: crate::VERSION.to_string(),
            test_run_id: test_run_id.into(),
        }
    }
}

/// Entities provisioned for one scenario
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestDataSet {
    #[serde(default)]
    pub customers: Vec<TestCustomer>,
    #[serde(default)]
    pub routes: Vec<TestRoute>,
    #[serde(default)]
    pub tickets: Vec<TestTicket>,
    #[serde(default)]
    pub assignments: Vec<TestAssignment>,
    pub metadata: TestMetadata,
}

impl TestDataSet {
    pub fn empty(metadata: TestMetadata) -> Self {
        Self {
            customers: Vec::new(),
            routes: Vec::new(),
            tickets: Vec::new(),
            assignments: Vec::new(),
            metadata,
        }
    }

    /// Build a data set from a flat entity list
    pub fn from_entities(entities: impl IntoIterator<Item = TestEntity>, metadata: TestMetadata) -> Self {
        let mut set = Self::empty(metadata);
        for entity in entities {
            set.push(entity);
        }
        set
    }

    pub fn push(&mut self, entity: TestEntity) {
        match entity {
            TestEntity::Customer(c) => self.customers.push(c),
            TestEntity::Route(r) => self.routes.push(r),
            TestEntity::Ticket(t) => self.tickets.push(t),
            TestEntity::Assignment(a) => self.assignments.push(a),
        }
    }

    /// All entities as a flat list
    pub fn entities(&self) -> Vec<TestEntity> {
        self.customers
            .iter()
            .cloned()
            .map(TestEntity::from)
            .chain(self.routes.iter().cloned().map(TestEntity::from))
            .chain(self.tickets.iter().cloned().map(TestEntity::from))
            .chain(self.assignments.iter().cloned().map(TestEntity::from))
            .collect()
    }

    pub fn total_entities(&self) -> usize {
        self.customers.len() + self.routes.len() + self.tickets.len() + self.assignments.len()
    }

    pub fn customer_by_name(&self, name: &str) -> Option<&TestCustomer> {
        self.customers.iter().find(|c| c.name == name)
    }

    pub fn route_by_location(&self, location: &str) -> Option<&TestRoute> {
        self.routes.iter().find(|r| r.location == location)
    }
}
