//! Cross-worker isolation
//!
//! Parallel workers share the roster but never share derived data: every
//! entity a scenario creates embeds the context's run id in its name, and
//! run ids are unique per context. Runs that crashed before teardown are
//! reclaimed by age.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use fieldsvc_common::{naming, roster, EntityKind, TestAssignment, TestDataMarker, TestMode, TestTicket};

use crate::context::DataContext;
use crate::error::E2eResult;
use crate::store::ProductionDataStore;

static RUN_ID_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(isolated|production|dual)-\d{13}-[0-9a-f]{8}$").expect("valid run id pattern")
});

/// Result of an orphan sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrphanSweep {
    pub reclaimed_runs: Vec<String>,
    pub entities_removed: usize,
}

pub struct IsolationManager;

impl IsolationManager {
    /// `<mode>-<unix millis>-<8 hex>`
    pub fn generate_test_run_id(mode: TestMode) -> String {
        let suffix = Uuid::new_v4().simple().to_string();
        format!(
            "{}-{:013}-{}",
            mode,
            chrono::Utc::now().timestamp_millis(),
            &suffix[..8]
        )
    }

    pub fn is_valid_test_run_id(id: &str) -> bool {
        RUN_ID_PATTERN.is_match(id)
    }

    /// A ticket whose title is unique to the context's run
    pub fn derived_ticket(
        context: &DataContext,
        base_title: &str,
        customer_id: &str,
        route_id: Option<&str>,
    ) -> TestTicket {
        let title = naming::derived_name(base_title, context.test_run_id());
        TestTicket {
            id: roster::stable_id(EntityKind::Ticket, &title),
            description: format!("Created by {} for {}", context.test_run_id(), context.test_id()),
            title,
            customer_id: customer_id.to_string(),
            route_id: route_id.map(str::to_string),
            status: Default::default(),
            is_test_data: TestDataMarker,
        }
    }

    /// Assign a roster technician to a derived ticket
    pub fn derived_assignment(
        context: &DataContext,
        ticket_id: &str,
        route_id: &str,
        character: &str,
    ) -> TestAssignment {
        let technician = naming::display_name(character);
        let key = format!("{}:{}:{}", context.test_run_id(), ticket_id, technician);
        TestAssignment {
            id: roster::stable_id(EntityKind::Assignment, &key),
            ticket_id: ticket_id.to_string(),
            route_id: route_id.to_string(),
            technician,
            is_test_data: TestDataMarker,
        }
    }

    /// Delete derived rows of runs that are no longer active and older than
    /// `max_age`. Roster rows carry no run id and are never touched.
    pub async fn reclaim_orphans(
        store: &dyn ProductionDataStore,
        active_run_ids: &HashSet<String>,
        max_age: Duration,
    ) -> E2eResult<OrphanSweep> {
        let cutoff = chrono::Utc::now().timestamp() - max_age.as_secs() as i64;
        let mut sweep = OrphanSweep::default();

        for run in store.list_runs().await? {
            if active_run_ids.contains(&run.test_run_id) || run.oldest_created_at > cutoff {
                continue;
            }
            if !Self::is_valid_test_run_id(&run.test_run_id) {
                warn!(test_run_id = %run.test_run_id, "Reclaiming rows under a malformed run id");
            }
            sweep.entities_removed += store.delete_run(&run.test_run_id).await?;
            sweep.reclaimed_runs.push(run.test_run_id);
        }

        if !sweep.reclaimed_runs.is_empty() {
            info!(
                runs = sweep.reclaimed_runs.len(),
                entities = sweep.entities_removed,
                "Reclaimed orphaned test runs"
            );
        }
        Ok(sweep)
    }
}
