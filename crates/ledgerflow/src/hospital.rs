//! The flow hospital: diagnoses errors raised by flows and decides whether
//! to retry from the last safe checkpoint, keep the patient in for
//! observation, or let the error propagate to counter-flows.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use time::OffsetDateTime;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::checkpoint::StateMachineState;
use crate::clock::Clock;
use crate::error::{FlowError, FlowErrorKind};
use crate::event::Event;
use crate::ids::FlowId;

/// Channel a hospital uses to schedule events back onto a flow's queue.
pub type EventSender = tokio::sync::mpsc::UnboundedSender<Event>;

/// A staff member's verdict on one error.
///
/// Ordered by priority: the strongest diagnosis across the staff wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Diagnosis {
    /// Never retry; propagate immediately.
    Terminal,
    /// Retry from the last safe checkpoint.
    Discharge,
    /// Park the flow hospitalized and await intervention or restart.
    OvernightObservation,
    /// Someone else's problem.
    NotMySpecialty,
}

/// Final outcome of one admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Discharge,
    OvernightObservation,
    Untreatable,
}

/// One entry in a patient's medical history.
#[derive(Debug, Clone)]
pub enum MedicalRecord {
    Admitted {
        at: OffsetDateTime,
        suspend_count: u32,
    },
    Discharged {
        at: OffsetDateTime,
        suspend_count: u32,
        by: &'static str,
        error: FlowError,
    },
}

/// The retained history of one flow's hospital visits.
#[derive(Debug, Clone, Default)]
pub struct MedicalHistory {
    pub records: Vec<MedicalRecord>,
}

impl MedicalHistory {
    /// How many times `by` discharged an error at the given suspension
    /// point. Bounds retry loops for deterministically recurring errors.
    pub fn times_discharged(&self, by: &'static str, suspend_count: u32) -> u32 {
        self.records
            .iter()
            .filter(|record| {
                matches!(
                    record,
                    MedicalRecord::Discharged {
                        by: record_by,
                        suspend_count: record_count,
                        ..
                    } if *record_by == by && *record_count == suspend_count
                )
            })
            .count() as u32
    }
}

/// Published for every admission, for operational tooling.
#[derive(Debug, Clone)]
pub struct HospitalOutcomeRecord {
    pub flow_id: FlowId,
    pub at: OffsetDateTime,
    pub suspend_count: u32,
    pub outcome: Outcome,
    pub by: Vec<&'static str>,
    pub errors: Vec<FlowError>,
}

/// A diagnostician consulted for every admitted error.
pub trait Staff: Send + Sync {
    fn name(&self) -> &'static str;

    fn consult(
        &self,
        flow_id: FlowId,
        state: &StateMachineState,
        error: &FlowError,
        history: &MedicalHistory,
    ) -> Diagnosis;
}

/// Routing seam between the fiber and a hospital implementation.
pub trait FlowHospital: Send + Sync + 'static {
    /// The flow's transition left it errored.
    fn flow_errored(
        &self,
        flow_id: FlowId,
        sender: &EventSender,
        state: &StateMachineState,
        errors: &[FlowError],
    );

    /// The flow transitioned back to a clean state.
    fn flow_cleaned(&self, flow_id: FlowId);

    /// The flow left the manager; drop its history.
    fn flow_removed(&self, flow_id: FlowId);
}

/// Hospital that consults an ordered staff list per error.
///
/// Synthesis per admission: any untreatable error propagates; otherwise any
/// observation verdict hospitalizes; otherwise every error was discharged
/// and the flow retries from its last safe checkpoint.
pub struct StaffedFlowHospital {
    clock: Arc<dyn Clock>,
    staff: Vec<Arc<dyn Staff>>,
    patients: Mutex<HashMap<FlowId, MedicalHistory>>,
    in_hospital: Mutex<HashSet<FlowId>>,
    records_tx: broadcast::Sender<HospitalOutcomeRecord>,
}

impl StaffedFlowHospital {
    /// Hospital with the built-in staff.
    pub fn new(clock: Arc<dyn Clock>, duplicate_discharge_limit: u32) -> Self {
        Self::with_staff(
            clock,
            vec![
                Arc::new(DeadlockNurse),
                Arc::new(DuplicateInsertSpecialist {
                    limit: duplicate_discharge_limit,
                }),
                Arc::new(DoctorTimeout),
                Arc::new(TransitionPractitioner {
                    limit: duplicate_discharge_limit,
                }),
                Arc::new(SedationNurse),
            ],
        )
    }

    /// Hospital with a custom staff list, consulted in order.
    pub fn with_staff(clock: Arc<dyn Clock>, staff: Vec<Arc<dyn Staff>>) -> Self {
        let (records_tx, _) = broadcast::channel(64);
        Self {
            clock,
            staff,
            patients: Mutex::new(HashMap::new()),
            in_hospital: Mutex::new(HashSet::new()),
            records_tx,
        }
    }

    /// Stream of admission outcomes.
    pub fn subscribe(&self) -> broadcast::Receiver<HospitalOutcomeRecord> {
        self.records_tx.subscribe()
    }

    /// True while the flow is admitted and undiagnosed-or-parked.
    pub fn contains(&self, flow_id: FlowId) -> bool {
        self.patients
            .lock()
            .expect("hospital lock poisoned")
            .contains_key(&flow_id)
    }

    fn best_diagnosis(
        &self,
        flow_id: FlowId,
        state: &StateMachineState,
        error: &FlowError,
        history: &MedicalHistory,
    ) -> (Diagnosis, Vec<&'static str>) {
        let mut best = Diagnosis::NotMySpecialty;
        let mut by = vec![];
        for staff in &self.staff {
            let diagnosis = staff.consult(flow_id, state, error, history);
            if diagnosis < best {
                best = diagnosis;
                by = vec![staff.name()];
            } else if diagnosis == best && diagnosis != Diagnosis::NotMySpecialty {
                by.push(staff.name());
            }
        }
        (best, by)
    }
}

impl FlowHospital for StaffedFlowHospital {
    fn flow_errored(
        &self,
        flow_id: FlowId,
        sender: &EventSender,
        state: &StateMachineState,
        errors: &[FlowError],
    ) {
        if state.is_removed || errors.is_empty() {
            return;
        }
        if !self
            .in_hospital
            .lock()
            .expect("hospital lock poisoned")
            .insert(flow_id)
        {
            // Already admitted; the previous admission decides.
            return;
        }

        let now = self.clock.now();
        let suspend_count = state.checkpoint.number_of_suspends;
        info!(flow_id = %flow_id, errors = errors.len(), "Flow admitted to hospital");

        let (outcome, by) = {
            let mut patients = self.patients.lock().expect("hospital lock poisoned");
            let history = patients.entry(flow_id).or_default();
            history.records.push(MedicalRecord::Admitted {
                at: now,
                suspend_count,
            });

            let mut all_by = vec![];
            let mut worst = Outcome::Discharge;
            let mut discharges = vec![];
            for error in errors {
                let (diagnosis, by) = self.best_diagnosis(flow_id, state, error, history);
                all_by.extend(by.iter().copied());
                match diagnosis {
                    Diagnosis::Discharge => {
                        discharges.push((by.first().copied().unwrap_or("staff"), error.clone()));
                    }
                    Diagnosis::OvernightObservation => {
                        if worst == Outcome::Discharge {
                            worst = Outcome::OvernightObservation;
                        }
                    }
                    Diagnosis::NotMySpecialty | Diagnosis::Terminal => {
                        worst = Outcome::Untreatable;
                    }
                }
            }

            if worst == Outcome::Discharge {
                for (by, error) in discharges {
                    history.records.push(MedicalRecord::Discharged {
                        at: now,
                        suspend_count,
                        by,
                        error,
                    });
                }
            }
            (worst, all_by)
        };

        let event = match outcome {
            Outcome::Discharge => {
                info!(flow_id = %flow_id, by = ?by, "Flow error discharged, retrying from safe point");
                Event::RetryFlowFromSafePoint
            }
            Outcome::OvernightObservation => {
                info!(flow_id = %flow_id, by = ?by, "Flow kept in for overnight observation");
                Event::OvernightObservation
            }
            Outcome::Untreatable => {
                info!(flow_id = %flow_id, "Flow errors allowed to propagate");
                Event::StartErrorPropagation
            }
        };

        let record = HospitalOutcomeRecord {
            flow_id,
            at: now,
            suspend_count,
            outcome,
            by,
            errors: errors.to_vec(),
        };
        let _ = self.records_tx.send(record);

        if sender.send(event).is_err() {
            debug!(flow_id = %flow_id, "Patient's event queue is gone");
        }
    }

    fn flow_cleaned(&self, flow_id: FlowId) {
        self.in_hospital
            .lock()
            .expect("hospital lock poisoned")
            .remove(&flow_id);
    }

    fn flow_removed(&self, flow_id: FlowId) {
        self.in_hospital
            .lock()
            .expect("hospital lock poisoned")
            .remove(&flow_id);
        self.patients
            .lock()
            .expect("hospital lock poisoned")
            .remove(&flow_id);
    }
}

/// Hospital variant that always propagates without consulting staff.
///
/// Used where retry would mask bugs. A flow must never return to a clean
/// state after this hospital started propagation; seeing that indicates a
/// logic error in the transition engine.
#[derive(Default)]
pub struct PropagatingFlowHospital {
    propagated: Mutex<HashSet<FlowId>>,
}

impl PropagatingFlowHospital {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FlowHospital for PropagatingFlowHospital {
    fn flow_errored(
        &self,
        flow_id: FlowId,
        sender: &EventSender,
        state: &StateMachineState,
        _errors: &[FlowError],
    ) {
        if state.is_removed {
            return;
        }
        self.propagated
            .lock()
            .expect("hospital lock poisoned")
            .insert(flow_id);
        let _ = sender.send(Event::StartErrorPropagation);
    }

    fn flow_cleaned(&self, flow_id: FlowId) {
        let propagated = self
            .propagated
            .lock()
            .expect("hospital lock poisoned")
            .contains(&flow_id);
        if propagated {
            error!(flow_id = %flow_id, "Flow cleaned after error propagation began");
            debug_assert!(false, "flow cleaned after propagation began");
        }
    }

    fn flow_removed(&self, flow_id: FlowId) {
        self.propagated
            .lock()
            .expect("hospital lock poisoned")
            .remove(&flow_id);
    }
}

/// Discharges database deadlocks: the canonical transient error.
pub struct DeadlockNurse;

impl Staff for DeadlockNurse {
    fn name(&self) -> &'static str {
        "DeadlockNurse"
    }

    fn consult(
        &self,
        _flow_id: FlowId,
        _state: &StateMachineState,
        error: &FlowError,
        _history: &MedicalHistory,
    ) -> Diagnosis {
        if error.kind.mentions_deadlock() {
            Diagnosis::Discharge
        } else {
            Diagnosis::NotMySpecialty
        }
    }
}

/// Discharges constraint violations (duplicate inserts), but only a bounded
/// number of times per suspension point: the same bug deterministically
/// re-triggering must not retry forever.
pub struct DuplicateInsertSpecialist {
    pub limit: u32,
}

impl Staff for DuplicateInsertSpecialist {
    fn name(&self) -> &'static str {
        "DuplicateInsertSpecialist"
    }

    fn consult(
        &self,
        _flow_id: FlowId,
        state: &StateMachineState,
        error: &FlowError,
        history: &MedicalHistory,
    ) -> Diagnosis {
        let suspend_count = state.checkpoint.number_of_suspends;
        if error.kind.mentions_constraint_violation()
            && history.times_discharged(self.name(), suspend_count) < self.limit
        {
            Diagnosis::Discharge
        } else {
            Diagnosis::NotMySpecialty
        }
    }
}

/// Restarts timed flows when their timeout fires.
pub struct DoctorTimeout;

impl Staff for DoctorTimeout {
    fn name(&self) -> &'static str {
        "DoctorTimeout"
    }

    fn consult(
        &self,
        _flow_id: FlowId,
        _state: &StateMachineState,
        error: &FlowError,
        _history: &MedicalHistory,
    ) -> Diagnosis {
        if matches!(error.kind, FlowErrorKind::FlowTimeout { .. }) {
            Diagnosis::Discharge
        } else {
            Diagnosis::NotMySpecialty
        }
    }
}

/// Handles failures of the transition machinery itself: retried a bounded
/// number of times, then parked for observation rather than propagated,
/// since the flow's own logic was not at fault.
pub struct TransitionPractitioner {
    pub limit: u32,
}

impl Staff for TransitionPractitioner {
    fn name(&self) -> &'static str {
        "TransitionPractitioner"
    }

    fn consult(
        &self,
        _flow_id: FlowId,
        state: &StateMachineState,
        error: &FlowError,
        history: &MedicalHistory,
    ) -> Diagnosis {
        if !matches!(error.kind, FlowErrorKind::StateTransitionFailed { .. }) {
            return Diagnosis::NotMySpecialty;
        }
        let suspend_count = state.checkpoint.number_of_suspends;
        if history.times_discharged(self.name(), suspend_count) < self.limit {
            Diagnosis::Discharge
        } else {
            Diagnosis::OvernightObservation
        }
    }
}

/// Honors explicit hospitalization requests from flow code.
pub struct SedationNurse;

impl Staff for SedationNurse {
    fn name(&self) -> &'static str {
        "SedationNurse"
    }

    fn consult(
        &self,
        _flow_id: FlowId,
        _state: &StateMachineState,
        error: &FlowError,
        _history: &MedicalHistory,
    ) -> Diagnosis {
        if matches!(error.kind, FlowErrorKind::Hospitalize { .. }) {
            Diagnosis::OvernightObservation
        } else {
            Diagnosis::NotMySpecialty
        }
    }
}
