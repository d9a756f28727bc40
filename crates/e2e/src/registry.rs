//! Active-context registry keyed by test id
//!
//! A test id is reserved before any setup work starts, so two workers racing
//! on the same scenario cannot both build a context. Each slot carries the
//! scenario's lifecycle state; once a slot is released its final state stays
//! queryable until the id is reserved again.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::warn;

use crate::context::DataContext;
use crate::error::{E2eError, E2eResult};
use crate::lifecycle::{LifecycleInput, LifecycleMachine, LifecycleState};

struct Slot {
    context: Option<DataContext>,
    state: LifecycleState,
}

#[derive(Default)]
struct Slots {
    live: HashMap<String, Slot>,
    finished: HashMap<String, LifecycleState>,
}

#[derive(Clone, Default)]
pub struct ContextRegistry {
    slots: Arc<RwLock<Slots>>,
}

/// Claim on a test id held while its context is being set up.
/// Dropping an unattached reservation releases the id.
pub struct Reservation<'a> {
    registry: &'a ContextRegistry,
    test_id: String,
    attached: bool,
}

impl Reservation<'_> {
    pub fn set_state(&self, state: LifecycleState) {
        if let Some(slot) = self.registry.slots.write().live.get_mut(&self.test_id) {
            slot.state = state;
        }
    }

    /// Bind the established context to the reserved id
    pub fn attach(mut self, context: DataContext, state: LifecycleState) -> E2eResult<()> {
        if context.test_id() != self.test_id {
            return Err(E2eError::Configuration(format!(
                "context for '{}' cannot attach to reservation '{}'",
                context.test_id(),
                self.test_id
            )));
        }
        let mut slots = self.registry.slots.write();
        let slot = slots.live.get_mut(&self.test_id).ok_or_else(|| {
            E2eError::Configuration(format!("test id '{}' is no longer reserved", self.test_id))
        })?;
        slot.context = Some(context);
        slot.state = state;
        self.attached = true;
        Ok(())
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.attached {
            self.registry.release(&self.test_id);
        }
    }
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// At most one live slot per test id
    pub fn reserve(&self, test_id: &str) -> E2eResult<Reservation<'_>> {
        let mut slots = self.slots.write();
        if slots.live.contains_key(test_id) {
            return Err(E2eError::Configuration(format!(
                "test id '{}' already has an active data context",
                test_id
            )));
        }
        slots.finished.remove(test_id);
        slots.live.insert(
            test_id.to_string(),
            Slot {
                context: None,
                state: LifecycleState::Detecting,
            },
        );
        Ok(Reservation {
            registry: self,
            test_id: test_id.to_string(),
            attached: false,
        })
    }

    /// Drop a reservation; only a terminal state is kept for later queries
    fn release(&self, test_id: &str) {
        let mut slots = self.slots.write();
        if let Some(slot) = slots.live.remove(test_id) {
            if slot.state.is_terminal() {
                slots.finished.insert(test_id.to_string(), slot.state);
            }
        }
    }

    fn start_cleanup(machine: &LifecycleMachine, slot: &mut Slot) -> Option<(DataContext, LifecycleState)> {
        let ctx = slot.context.take()?;
        let next = match machine.transition(slot.state, LifecycleInput::ScenarioFinished) {
            Ok(next) => next,
            Err(e) => {
                warn!(test_id = ctx.test_id(), "{}", e);
                LifecycleState::CleaningUp { mode: ctx.mode() }
            }
        };
        slot.state = next;
        Some((ctx, next))
    }

    /// Hand the attached context to the caller for teardown. The slot stays
    /// live in `CleaningUp` until [`complete`](Self::complete).
    pub fn begin_cleanup(&self, test_id: &str, machine: &LifecycleMachine) -> Option<(DataContext, LifecycleState)> {
        let mut slots = self.slots.write();
        let slot = slots.live.get_mut(test_id)?;
        Self::start_cleanup(machine, slot)
    }

    /// `begin_cleanup` for every attached slot. Reservations still in setup
    /// are left to their owners.
    pub fn drain_attached(&self, machine: &LifecycleMachine) -> Vec<(DataContext, LifecycleState)> {
        let mut slots = self.slots.write();
        slots
            .live
            .values_mut()
            .filter_map(|slot| Self::start_cleanup(machine, slot))
            .collect()
    }

    /// Close the slot with its final state
    pub fn complete(&self, test_id: &str, state: LifecycleState) {
        let mut slots = self.slots.write();
        slots.live.remove(test_id);
        slots.finished.insert(test_id.to_string(), state);
    }

    /// Current state of a live slot, else the state it finished in
    pub fn state(&self, test_id: &str) -> Option<LifecycleState> {
        let slots = self.slots.read();
        slots
            .live
            .get(test_id)
            .map(|slot| slot.state)
            .or_else(|| slots.finished.get(test_id).copied())
    }

    pub fn contains(&self, test_id: &str) -> bool {
        self.slots.read().live.contains_key(test_id)
    }

    pub fn is_empty(&self) -> bool {
        self.slots.read().live.is_empty()
    }

    pub fn test_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.slots.read().live.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn active_run_ids(&self) -> HashSet<String> {
        self.slots
            .read()
            .live
            .values()
            .filter_map(|slot| slot.context.as_ref())
            .map(|ctx| ctx.test_run_id().to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleanup::CleanupReport;
    use crate::context::{ConnectionInfo, ContextFinalizer};
    use async_trait::async_trait;
    use fieldsvc_common::{TestDataSet, TestMetadata, TestMode};

    struct NoopFinalizer;

    #[async_trait]
    impl ContextFinalizer for NoopFinalizer {
        async fn finalize(&self, _context: &DataContext) -> E2eResult<CleanupReport> {
            Ok(CleanupReport::default())
        }
    }

    fn ctx(test_id: &str, run_id: &str) -> DataContext {
        DataContext::new(
            test_id,
            TestDataSet::empty(TestMetadata::new(TestMode::Isolated, run_id)),
            ConnectionInfo {
                connection_string: "memory".to_string(),
                is_test_connection: true,
                production_safe: false,
                test_run_id: run_id.to_string(),
            },
            "test",
            Arc::new(NoopFinalizer),
        )
    }

    const ATTACHED: LifecycleState = LifecycleState::Attached { mode: TestMode::Isolated };

    #[test]
    fn test_reservation_blocks_second_setup() {
        let registry = ContextRegistry::new();
        let first = registry.reserve("a.feature:1").unwrap();
        assert!(registry.reserve("a.feature:1").is_err());
        assert!(registry.contains("a.feature:1"));
        assert!(registry.active_run_ids().is_empty());

        first.attach(ctx("a.feature:1", "run-a"), ATTACHED).unwrap();
        assert!(registry.reserve("a.feature:1").is_err());
        assert!(registry.active_run_ids().contains("run-a"));
    }

    #[test]
    fn test_dropped_reservation_releases_id() {
        let registry = ContextRegistry::new();
        {
            let reservation = registry.reserve("b.feature:2").unwrap();
            reservation.set_state(LifecycleState::Aborted {
                attempts: 3,
                final_mode: TestMode::Isolated,
            });
        }
        assert!(registry.is_empty());
        assert!(matches!(
            registry.state("b.feature:2"),
            Some(LifecycleState::Aborted { attempts: 3, .. })
        ));
        assert!(registry.reserve("b.feature:2").is_ok());

        drop(registry.reserve("b.feature:3").unwrap());
        assert_eq!(registry.state("b.feature:3"), None);
    }

    #[test]
    fn test_cleanup_walks_to_done() {
        let machine = LifecycleMachine::new(3);
        let registry = ContextRegistry::new();
        registry
            .reserve("c.feature:3")
            .unwrap()
            .attach(ctx("c.feature:3", "run-c"), ATTACHED)
            .unwrap();

        let (context, state) = registry.begin_cleanup("c.feature:3", &machine).unwrap();
        assert_eq!(context.test_id(), "c.feature:3");
        assert_eq!(state, LifecycleState::CleaningUp { mode: TestMode::Isolated });
        assert!(registry.begin_cleanup("c.feature:3", &machine).is_none());
        assert_eq!(registry.state("c.feature:3"), Some(state));

        let done = machine.transition(state, LifecycleInput::CleanupFinished).unwrap();
        registry.complete("c.feature:3", done);
        assert!(registry.is_empty());
        assert_eq!(registry.state("c.feature:3"), Some(LifecycleState::Done));
    }

    #[test]
    fn test_drain_skips_reservations_in_setup() {
        let machine = LifecycleMachine::new(3);
        let registry = ContextRegistry::new();
        let _pending = registry.reserve("d.feature:1").unwrap();
        registry
            .reserve("d.feature:2")
            .unwrap()
            .attach(ctx("d.feature:2", "run-d"), ATTACHED)
            .unwrap();

        let drained = registry.drain_attached(&machine);
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].0.test_id(), "d.feature:2");
        assert_eq!(registry.test_ids(), vec!["d.feature:1".to_string(), "d.feature:2".to_string()]);
    }
}
