//! Production safety guard
//!
//! Every read or write that touches the shared store must target an entity
//! carrying the test marker. Violations are fatal and never retried.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::error;

use fieldsvc_common::{is_test_entity, TestEntity, TestMode, TEST_MARKER};

use crate::error::{E2eError, E2eResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Read,
    Update,
    Delete,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationKind::Create => "create",
            OperationKind::Read => "read",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        };
        f.write_str(s)
    }
}

pub struct ProductionSafetyValidator;

impl ProductionSafetyValidator {
    /// Modes that operate on the shared store
    pub fn is_enforced(mode: TestMode) -> bool {
        mode.uses_production()
    }

    /// Reject `operation` on `entity` unless it is marked as test data.
    ///
    /// Checked before the operation is dispatched to any store.
    pub fn validate_test_operation(
        mode: TestMode,
        operation: OperationKind,
        entity: &TestEntity,
    ) -> E2eResult<()> {
        if !Self::is_enforced(mode) || is_test_entity(entity) {
            return Ok(());
        }

        error!(
            %mode,
            %operation,
            kind = %entity.kind(),
            entity = entity.name(),
            "Blocked operation on non-test entity"
        );
        Err(E2eError::ProductionSafetyViolation {
            operation: operation.to_string(),
            kind: entity.kind(),
            entity: entity.name().to_string(),
            reason: format!("no identifier carries the '{}' marker", TEST_MARKER),
        })
    }

    pub fn validate_all<'a>(
        mode: TestMode,
        operation: OperationKind,
        entities: impl IntoIterator<Item = &'a TestEntity>,
    ) -> E2eResult<()> {
        for entity in entities {
            Self::validate_test_operation(mode, operation, entity)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldsvc_common::{roster, EntityKind, TestCustomer, TestDataMarker};

    fn acme() -> TestEntity {
        TestEntity::Customer(TestCustomer {
            id: "cust-1".to_string(),
            name: "Acme Corp".to_string(),
            email: "billing@acme.example".to_string(),
            phone: None,
            service_address: None,
            is_test_data: TestDataMarker,
        })
    }

    #[test]
    fn test_unmarked_entity_rejected_in_production() {
        let err = ProductionSafetyValidator::validate_test_operation(
            TestMode::Production,
            OperationKind::Delete,
            &acme(),
        )
        .unwrap_err();

        match err {
            E2eError::ProductionSafetyViolation { kind, entity, operation, .. } => {
                assert_eq!(kind, EntityKind::Customer);
                assert_eq!(entity, "Acme Corp");
                assert_eq!(operation, "delete");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_dual_is_guarded_isolated_is_not() {
        assert!(ProductionSafetyValidator::validate_test_operation(
            TestMode::Dual,
            OperationKind::Read,
            &acme()
        )
        .is_err());
        assert!(ProductionSafetyValidator::validate_test_operation(
            TestMode::Isolated,
            OperationKind::Delete,
            &acme()
        )
        .is_ok());
    }

    #[test]
    fn test_roster_passes() {
        let roster = roster::entities();
        ProductionSafetyValidator::validate_all(TestMode::Production, OperationKind::Create, &roster)
            .unwrap();
    }
}
