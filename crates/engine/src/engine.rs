//! The scenario engine: single-threaded, deterministic transformer of the
//! per-session clinical state.
//!
//! All methods are synchronous and non-blocking. Callers (the
//! orchestrator) serialize access; the engine itself never spawns work.
//! Scheduled changes go through the pending-effect queue and fire on
//! `tick` in `(fire_at, seq)` order.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::intent::{IvParams, ToolIntent, VitalsDelta};
use crate::rhythm;
use crate::scenarios::{self, ScenarioDefinition};
use crate::stages::StageDefinition;
use crate::state::{
    EKG_HISTORY_LIMIT, Demographics, EkgEntry, EngineState, ExtendedState, IvAccess, Order,
    OrderStatus, OrderType, PendingEffect, TelemetryEntry, TreatmentEntry,
};
use crate::treatments::{self, TreatmentRequest, TreatmentType};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What happened during an engine call. The orchestrator turns these into
/// session events and broadcast decisions.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    VitalsUpdated,
    FindingRevealed {
        finding_id: String,
    },
    TreatmentApplied {
        treatment_type: String,
        note: String,
    },
    OrderPlaced {
        order_id: u64,
        order_type: OrderType,
    },
    OrderCompleted {
        order_id: u64,
        order_type: OrderType,
        result: String,
    },
    StageChanged {
        from: String,
        to: String,
        forced: bool,
    },
    RhythmChanged {
        rhythm: String,
    },
    ExamRevealed {
        section: String,
    },
    IntentRejected {
        reason: String,
    },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Engine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ScenarioEngine {
    definition: ScenarioDefinition,
    state: EngineState,
}

impl ScenarioEngine {
    pub fn new(scenario_id: &str, now: DateTime<Utc>) -> Option<Self> {
        let definition = scenarios::by_id(scenario_id)?;
        let state = scenarios::initial_state(scenario_id, now)?;
        Some(Self { definition, state })
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn definition(&self) -> &ScenarioDefinition {
        &self.definition
    }

    pub fn current_stage(&self) -> &StageDefinition {
        self.definition
            .stage(&self.state.stage_id)
            .unwrap_or(&self.definition.stages[0])
    }

    pub fn demographics(&self) -> &Demographics {
        &self.state.demographics
    }

    pub fn patient_weight_kg(&self) -> f64 {
        self.state.demographics.weight_kg
    }

    pub fn dynamic_rhythm(&self) -> &'static str {
        rhythm::dynamic_rhythm(&self.state)
    }

    /// Full-state snapshot for persistence. `hydrate(snapshot())` is the
    /// identity.
    pub fn snapshot(&self) -> EngineState {
        self.state.clone()
    }

    /// Replace the engine state from a persisted snapshot. Fails when the
    /// snapshot names an unknown scenario.
    pub fn hydrate(&mut self, snapshot: EngineState) -> bool {
        match scenarios::by_id(&snapshot.scenario_id) {
            Some(definition) => {
                self.definition = definition;
                self.state = snapshot;
                true
            }
            None => false,
        }
    }

    /// Reset onto a different scenario.
    pub fn set_scenario(&mut self, scenario_id: &str, now: DateTime<Utc>) -> bool {
        match (scenarios::by_id(scenario_id), scenarios::initial_state(scenario_id, now)) {
            (Some(definition), Some(state)) => {
                self.definition = definition;
                self.state = state;
                true
            }
            _ => false,
        }
    }

    // ── Clock ────────────────────────────────────────────────────────

    /// Whether the complex-scenario clock is paused. Simple scenarios
    /// have no clock to pause.
    pub fn is_paused(&self) -> bool {
        match &self.state.extended {
            Some(ExtendedState::Svt(s)) => s.clock_paused_at.is_some(),
            Some(ExtendedState::Myocarditis(m)) => m.clock_paused_at.is_some(),
            None => false,
        }
    }

    pub fn pause_clock(&mut self, now: DateTime<Utc>) {
        match &mut self.state.extended {
            Some(ExtendedState::Svt(s)) => s.pause_clock(now),
            Some(ExtendedState::Myocarditis(m)) => m.pause_clock(now),
            None => {}
        }
    }

    pub fn resume_clock(&mut self, now: DateTime<Utc>) {
        match &mut self.state.extended {
            Some(ExtendedState::Svt(s)) => s.resume_clock(now),
            Some(ExtendedState::Myocarditis(m)) => m.resume_clock(now),
            None => {}
        }
    }

    /// Pause-adjusted elapsed milliseconds for complex scenarios,
    /// wall-clock for simple ones.
    pub fn elapsed_ms(&self, now: DateTime<Utc>) -> i64 {
        match &self.state.extended {
            Some(ExtendedState::Svt(s)) => s.elapsed_since_start(now),
            Some(ExtendedState::Myocarditis(m)) => m.elapsed_since_start(now),
            None => (now - self.state.scenario_started_at)
                .num_milliseconds()
                .max(0),
        }
    }

    // ── Direct setters (handler-owned transformations) ───────────────

    pub fn set_vitals(&mut self, vitals: crate::state::Vitals, now: DateTime<Utc>) {
        self.state.vitals = vitals;
        self.refresh_rhythm(now);
    }

    pub fn set_telemetry(&mut self, on: bool, now: DateTime<Utc>) {
        self.state.telemetry = on;
        self.state.interventions.monitor = on;
        if on {
            if let Some(ExtendedState::Svt(svt)) = &mut self.state.extended {
                svt.record_monitor_on(now);
            }
            let label = rhythm::dynamic_rhythm(&self.state).to_string();
            self.state.rhythm_summary = Some(rhythm::rhythm_summary(&self.state));
            self.push_telemetry_entry(now, label);
        }
    }

    pub fn set_rhythm_summary(&mut self, summary: impl Into<String>) {
        self.state.rhythm_summary = Some(summary.into());
    }

    /// Queue a state change for a later heartbeat.
    pub fn schedule_effect(&mut self, fire_at: DateTime<Utc>, intent: ToolIntent) {
        let seq = self.state.next_effect_seq;
        self.state.next_effect_seq += 1;
        self.state.pending_effects.push(PendingEffect {
            fire_at,
            seq,
            intent,
        });
    }

    // ── Intents ──────────────────────────────────────────────────────

    /// Apply one intent. Invalid intents reject without partial mutation;
    /// events preserve application order.
    pub fn apply_intent(&mut self, intent: &ToolIntent, now: DateTime<Utc>) -> Vec<EngineEvent> {
        match intent {
            ToolIntent::UpdateVitals { deltas } => self.apply_vitals_delta(deltas, now),
            ToolIntent::RevealFinding { finding_id } => {
                if self.state.findings.insert(finding_id.clone()) {
                    vec![EngineEvent::FindingRevealed {
                        finding_id: finding_id.clone(),
                    }]
                } else {
                    Vec::new()
                }
            }
            ToolIntent::ApplyTreatment { treatment } => self.apply_treatment(treatment, now),
            ToolIntent::SubmitOrder {
                order_type,
                ordered_by,
                iv_params,
            } => self.submit_order(*order_type, ordered_by.clone(), iv_params.clone(), now),
            ToolIntent::SetStage { stage_id } => self.force_stage(stage_id, now),
            ToolIntent::CompleteOrder { order_id } => self.complete_order(*order_id, now),
        }
    }

    fn apply_vitals_delta(&mut self, deltas: &VitalsDelta, now: DateTime<Utc>) -> Vec<EngineEvent> {
        if deltas.is_empty() {
            return vec![EngineEvent::IntentRejected {
                reason: "empty vitals delta".into(),
            }];
        }
        let v = &mut self.state.vitals;
        if let Some(d) = deltas.hr {
            v.hr = (v.hr as i64 + d as i64).max(0) as u32;
        }
        if let Some(d) = deltas.spo2 {
            v.spo2 = (v.spo2 as i64 + d as i64).clamp(0, 100) as u32;
        }
        if let Some(d) = deltas.rr {
            v.rr = (v.rr as i64 + d as i64).max(0) as u32;
        }
        if let Some(d) = deltas.temp {
            v.temp = (v.temp + d).clamp(25.0, 45.0);
        }
        if let Some(bp) = &deltas.bp {
            v.bp = bp.clone();
        }

        let mut events = vec![EngineEvent::VitalsUpdated];
        if let Some(evt) = self.refresh_rhythm(now) {
            events.push(evt);
        }
        events
    }

    fn apply_treatment(&mut self, req: &TreatmentRequest, now: DateTime<Utc>) -> Vec<EngineEvent> {
        let demo = self.state.demographics.clone();
        let effect = treatments::effect_for(req, &demo);
        let dose = treatments::resolve_dose(req, &demo);

        let mut events = Vec::new();

        // Immediate physiologic deltas.
        if !effect.delta_vitals.is_empty() {
            events.extend(self.apply_vitals_delta(&effect.delta_vitals, now));
        }

        // Transient effects revert on a later heartbeat.
        if let Some((decay_ms, decay_deltas)) = &effect.decay {
            self.schedule_effect(
                now + chrono::Duration::milliseconds(*decay_ms),
                ToolIntent::UpdateVitals {
                    deltas: decay_deltas.clone(),
                },
            );
        }

        // Drugs pushed through a line imply the line exists.
        if req.treatment_type.needs_iv() && self.state.interventions.iv.is_none() {
            self.state.interventions.iv = Some(IvAccess {
                gauge: 22,
                site: "left antecubital".into(),
            });
        }

        // Complex-scenario consequences.
        events.extend(self.route_to_sub_engine(req, &dose, now));

        self.state.treatment_history.push(TreatmentEntry {
            ts: now,
            treatment_type: req.treatment_type.as_str().to_string(),
            note: Some(dose.note.clone()),
        });

        if let Some(evt) = self.refresh_rhythm(now) {
            events.push(evt);
        }
        events.push(EngineEvent::TreatmentApplied {
            treatment_type: req.treatment_type.as_str().to_string(),
            note: effect.nurse_line,
        });
        events
    }

    fn route_to_sub_engine(
        &mut self,
        req: &TreatmentRequest,
        dose: &treatments::ResolvedDose,
        now: DateTime<Utc>,
    ) -> Vec<EngineEvent> {
        let demo = self.state.demographics.clone();
        let mut vitals_override = None;

        match &mut self.state.extended {
            Some(ExtendedState::Svt(svt)) => {
                let directive = match req.treatment_type {
                    TreatmentType::VagalManeuver => Some(svt.apply_vagal(now)),
                    TreatmentType::Adenosine => Some(svt.apply_adenosine(
                        now,
                        &demo,
                        dose.dose_mg.unwrap_or(0.0),
                        req.rapid_push.unwrap_or(true),
                        req.flush_given.unwrap_or(true),
                    )),
                    TreatmentType::Cardioversion => Some(svt.apply_cardioversion(
                        now,
                        dose.joules_per_kg.unwrap_or(0.0),
                        req.synchronized.unwrap_or(true),
                        req.sedated.unwrap_or(false),
                    )),
                    TreatmentType::Defibrillation => Some(svt.apply_cardioversion(
                        now,
                        dose.joules_per_kg.unwrap_or(0.0),
                        false,
                        req.sedated.unwrap_or(false),
                    )),
                    TreatmentType::Sedation => {
                        svt.record_sedation(now);
                        None
                    }
                    _ => None,
                };
                if let Some(d) = directive {
                    vitals_override = d.vitals_override;
                }
            }
            Some(ExtendedState::Myocarditis(myo)) => {
                let directive = match req.treatment_type {
                    TreatmentType::IvFluids => {
                        Some(myo.apply_fluid_bolus(now, req.volume_ml_kg.unwrap_or(20.0)))
                    }
                    TreatmentType::Inotrope => Some(myo.apply_inotrope(now)),
                    _ => None,
                };
                if let Some(d) = directive {
                    vitals_override = d.vitals_override;
                }
            }
            None => {}
        }

        let mut events = Vec::new();
        if let Some(vitals) = vitals_override {
            // The override establishes a new baseline; queued transient
            // deltas would land on the wrong numbers.
            self.state
                .pending_effects
                .retain(|e| !matches!(e.intent, ToolIntent::UpdateVitals { .. }));
            self.state.vitals = vitals;
            events.push(EngineEvent::VitalsUpdated);
        }
        events
    }

    fn submit_order(
        &mut self,
        order_type: OrderType,
        ordered_by: Option<String>,
        iv_params: Option<IvParams>,
        now: DateTime<Utc>,
    ) -> Vec<EngineEvent> {
        let id = self.state.next_order_id;
        self.state.next_order_id += 1;
        self.state.orders.push(Order {
            id,
            order_type,
            status: OrderStatus::Pending,
            result: None,
            completed_at: None,
            ordered_by,
            iv_params,
        });
        self.schedule_effect(
            now + chrono::Duration::milliseconds(order_type.eta_ms()),
            ToolIntent::CompleteOrder { order_id: id },
        );

        // The sub-engines time these workup milestones from order time,
        // not result time.
        match (&mut self.state.extended, order_type) {
            (Some(ExtendedState::Svt(svt)), OrderType::Ekg) => svt.record_ecg_ordered(now),
            (Some(ExtendedState::Myocarditis(m)), OrderType::Ekg) => m.record_ecg_ordered(now),
            (Some(ExtendedState::Myocarditis(m)), OrderType::Imaging) => {
                m.record_echo_ordered(now)
            }
            _ => {}
        }

        vec![EngineEvent::OrderPlaced {
            order_id: id,
            order_type,
        }]
    }

    fn complete_order(&mut self, order_id: u64, now: DateTime<Utc>) -> Vec<EngineEvent> {
        let Some(idx) = self
            .state
            .orders
            .iter()
            .position(|o| o.id == order_id && o.status == OrderStatus::Pending)
        else {
            return vec![EngineEvent::IntentRejected {
                reason: format!("no pending order {order_id}"),
            }];
        };

        let order_type = self.state.orders[idx].order_type;
        let iv_params = self.state.orders[idx].iv_params.clone();
        let result = self.compose_order_result(order_type, iv_params, now);

        let order = &mut self.state.orders[idx];
        order.status = OrderStatus::Complete;
        order.completed_at = Some(now);
        order.result = Some(result.clone());

        let mut events = vec![EngineEvent::OrderCompleted {
            order_id,
            order_type,
            result,
        }];
        if matches!(
            order_type,
            OrderType::CardiacExam | OrderType::LungExam | OrderType::GeneralExam
        ) {
            events.push(EngineEvent::ExamRevealed {
                section: order_type.as_str().to_string(),
            });
        }
        events
    }

    fn compose_order_result(
        &mut self,
        order_type: OrderType,
        iv_params: Option<IvParams>,
        now: DateTime<Utc>,
    ) -> String {
        match order_type {
            OrderType::Vitals => self.state.vitals.summary_line(),
            OrderType::Ekg => {
                let summary = rhythm::rhythm_summary(&self.state);
                self.state.ekg_history.push(EkgEntry {
                    ts: now,
                    summary: summary.clone(),
                    image_url: self.definition.ekg_image_url.map(str::to_string),
                });
                if self.state.ekg_history.len() > EKG_HISTORY_LIMIT {
                    let excess = self.state.ekg_history.len() - EKG_HISTORY_LIMIT;
                    self.state.ekg_history.drain(..excess);
                }
                summary
            }
            OrderType::Labs => self.definition.labs_summary.to_string(),
            OrderType::Imaging => self.definition.imaging_summary.to_string(),
            OrderType::CardiacExam => {
                let text = self
                    .definition
                    .exam
                    .cardio
                    .clone()
                    .unwrap_or_else(|| "Unremarkable cardiac exam.".into());
                let exam = self.state.exam.get_or_insert_with(Default::default);
                exam.cardio = Some(text.clone());
                exam.heart_audio_url = self.definition.exam.heart_audio_url.clone();
                text
            }
            OrderType::LungExam => {
                let text = self
                    .definition
                    .exam
                    .lungs
                    .clone()
                    .unwrap_or_else(|| "Clear lungs.".into());
                let exam = self.state.exam.get_or_insert_with(Default::default);
                exam.lungs = Some(text.clone());
                exam.lung_audio_url = self.definition.exam.lung_audio_url.clone();
                text
            }
            OrderType::GeneralExam => {
                let text = self
                    .definition
                    .exam
                    .general
                    .clone()
                    .unwrap_or_else(|| "No acute distress.".into());
                let exam = self.state.exam.get_or_insert_with(Default::default);
                exam.general = Some(text.clone());
                exam.perfusion = self.definition.exam.perfusion.clone();
                exam.neuro = self.definition.exam.neuro.clone();
                text
            }
            OrderType::IvAccess => {
                let params = iv_params.unwrap_or_default();
                let gauge = if params.gauge == 0 { 22 } else { params.gauge };
                let site = if params.site.is_empty() {
                    "left antecubital".to_string()
                } else {
                    params.site
                };
                self.state.interventions.iv = Some(IvAccess {
                    gauge,
                    site: site.clone(),
                });
                if let Some(ExtendedState::Svt(svt)) = &mut self.state.extended {
                    svt.record_iv_access(now);
                }
                format!("{gauge}g IV established, {site}")
            }
        }
    }

    /// Bedside exam performed immediately (voice command, not an order).
    /// Reveals the matching exam sections and registers the exam finding.
    /// Returns the exam text for the nurse transcript.
    pub fn perform_exam(&mut self, order_type: OrderType, now: DateTime<Utc>) -> Option<String> {
        if !matches!(
            order_type,
            OrderType::CardiacExam | OrderType::LungExam | OrderType::GeneralExam
        ) {
            return None;
        }
        let text = self.compose_order_result(order_type, None, now);
        self.state
            .findings
            .insert("physical_exam_performed".to_string());
        Some(text)
    }

    /// Record that a non-player character was engaged. Drives the
    /// communication flags the debrief scores (reassurance, parent
    /// updates, PICU consult).
    pub fn note_character_contact(&mut self, character: &str, now: DateTime<Utc>) {
        match &mut self.state.extended {
            Some(ExtendedState::Svt(svt)) => match character {
                "patient" if !svt.flags.patient_reassured => {
                    svt.flags.patient_reassured = true;
                    svt.note(now, "communication", "Patient spoken to and reassured");
                }
                "parent" if !svt.flags.parent_informed => {
                    svt.flags.parent_informed = true;
                    svt.note(now, "communication", "Parent updated");
                }
                _ => {}
            },
            Some(ExtendedState::Myocarditis(myo)) => {
                if character == "consultant" {
                    myo.record_picu_consult(now);
                }
            }
            None => {}
        }
    }

    /// Presenter inject: age-group-aware vitals override or explicit
    /// deltas. Returns the narration line for the nurse channel.
    pub fn inject_event(
        &mut self,
        kind: scenarios::ScenarioEventKind,
        explicit: Option<VitalsDelta>,
        now: DateTime<Utc>,
    ) -> (String, Vec<EngineEvent>) {
        use scenarios::ScenarioEventKind;

        let mut events = Vec::new();
        let description;

        match kind {
            ScenarioEventKind::VitalsChange => {
                description = "Vitals updated".to_string();
                if let Some(deltas) = explicit {
                    events.extend(self.apply_vitals_delta(&deltas, now));
                }
            }
            ScenarioEventKind::RhythmChange => {
                description = "Rhythm change on the monitor".to_string();
                if let Some(ExtendedState::Svt(svt)) = &mut self.state.extended {
                    if svt.converted {
                        // Converted SVT that re-enters is a rebound; the
                        // original conversion method stays on the record.
                        svt.converted = false;
                        svt.current_rhythm = "svt".into();
                        svt.flags.rebound_svt = true;
                        svt.note_negative(now, "response", "SVT rebound on the monitor");
                        self.state.vitals = self.definition.initial_vitals.clone();
                        events.push(EngineEvent::VitalsUpdated);
                    }
                }
            }
            other => {
                let (vitals, line) = scenarios::vitals_for_event(
                    other,
                    self.state.demographics.age_group,
                    &self.state.vitals,
                );
                description = line.to_string();
                if let Some(v) = vitals {
                    self.state.vitals = v;
                    events.push(EngineEvent::VitalsUpdated);
                }
            }
        }

        if let Some(evt) = self.refresh_rhythm(now) {
            events.push(evt);
        }
        (description, events)
    }

    fn force_stage(&mut self, stage_id: &str, now: DateTime<Utc>) -> Vec<EngineEvent> {
        if self.definition.stage(stage_id).is_none() {
            return vec![EngineEvent::IntentRejected {
                reason: format!("unknown stage {stage_id}"),
            }];
        }
        let from = std::mem::replace(&mut self.state.stage_id, stage_id.to_string());
        self.state.stage_entered_at = now;
        vec![EngineEvent::StageChanged {
            from,
            to: stage_id.to_string(),
            forced: true,
        }]
    }

    // ── Transitions ──────────────────────────────────────────────────

    /// Evaluate the current stage's exit rules in declared order. At most
    /// one transition fires.
    pub fn evaluate_automatic_transitions(
        &mut self,
        action_hints: &[String],
        now: DateTime<Utc>,
    ) -> Option<EngineEvent> {
        let time_in_stage = (now - self.state.stage_entered_at).num_seconds().max(0) as u64;
        let stage = self.definition.stage(&self.state.stage_id)?;

        let target = stage
            .exit_rules
            .iter()
            .find(|rule| rule.matches(&self.state, time_in_stage, action_hints))
            .map(|rule| rule.target.clone())?;

        let baseline = self
            .definition
            .stage(&target)
            .and_then(|s| s.baseline_vitals.clone());
        let from = std::mem::replace(&mut self.state.stage_id, target.clone());
        self.state.stage_entered_at = now;
        if let Some(vitals) = baseline {
            self.state.vitals = vitals;
        }
        Some(EngineEvent::StageChanged {
            from,
            to: target,
            forced: false,
        })
    }

    // ── Heartbeat ────────────────────────────────────────────────────

    /// Advance elapsed time, fire due scheduled effects, tick the
    /// sub-engine phase machine, and evaluate time-based transitions.
    /// A no-op (beyond the elapsed clamp) while the clock is paused.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<EngineEvent> {
        self.state.elapsed_seconds = (self.elapsed_ms(now) / 1000).max(0) as u64;
        if self.is_paused() {
            return Vec::new();
        }

        let mut events = Vec::new();

        // Fire due effects in (fire_at, seq) order.
        let mut due: Vec<PendingEffect> = Vec::new();
        self.state.pending_effects.retain(|e| {
            if e.fire_at <= now {
                due.push(e.clone());
                false
            } else {
                true
            }
        });
        due.sort_by_key(|e| (e.fire_at, e.seq));
        for effect in due {
            events.extend(self.apply_intent(&effect.intent, now));
        }

        // Sub-engine phase machine.
        let mut vitals_override = None;
        match &mut self.state.extended {
            Some(ExtendedState::Svt(svt)) => {
                let directive = svt.tick(now);
                vitals_override = directive.vitals_override;
            }
            Some(ExtendedState::Myocarditis(myo)) => {
                let directive = myo.tick(now);
                vitals_override = directive.vitals_override;
            }
            None => {}
        }
        if let Some(vitals) = vitals_override {
            self.state.vitals = vitals;
            events.push(EngineEvent::VitalsUpdated);
        }

        if let Some(evt) = self.evaluate_automatic_transitions(&[], now) {
            events.push(evt);
        }
        if let Some(evt) = self.refresh_rhythm(now) {
            events.push(evt);
        }
        events
    }

    // ── Rhythm ───────────────────────────────────────────────────────

    /// Re-derive the rhythm label; appends to the telemetry history only
    /// when the label changes while telemetry is on.
    fn refresh_rhythm(&mut self, now: DateTime<Utc>) -> Option<EngineEvent> {
        let label = rhythm::dynamic_rhythm(&self.state).to_string();
        let summary = rhythm::rhythm_summary(&self.state);

        let changed = self
            .state
            .telemetry_history
            .last()
            .map(|e| e.rhythm.as_deref() != Some(label.as_str()))
            .unwrap_or(true);

        if self.state.telemetry {
            self.state.rhythm_summary = Some(summary);
            if changed {
                self.push_telemetry_entry(now, label.clone());
                return Some(EngineEvent::RhythmChanged { rhythm: label });
            }
        }
        None
    }

    fn push_telemetry_entry(&mut self, now: DateTime<Utc>, rhythm_label: String) {
        let is_new = self
            .state
            .telemetry_history
            .last()
            .map(|e| e.rhythm.as_deref() != Some(rhythm_label.as_str()))
            .unwrap_or(true);
        if is_new {
            self.state.telemetry_history.push(TelemetryEntry {
                ts: now,
                rhythm: Some(rhythm_label),
                note: None,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn svt_engine(now: DateTime<Utc>) -> ScenarioEngine {
        ScenarioEngine::new("teen_svt_complex_v1", now).unwrap()
    }

    #[test]
    fn vitals_clamp_at_bounds() {
        let now = Utc::now();
        let mut engine = svt_engine(now);
        let events = engine.apply_intent(
            &ToolIntent::UpdateVitals {
                deltas: VitalsDelta {
                    spo2: Some(50),
                    hr: Some(-500),
                    ..Default::default()
                },
            },
            now,
        );
        assert!(matches!(events[0], EngineEvent::VitalsUpdated));
        assert_eq!(engine.state().vitals.spo2, 100);
        assert_eq!(engine.state().vitals.hr, 0);
    }

    #[test]
    fn delta_applied_twice_shifts_twice_unless_clamped() {
        let now = Utc::now();
        let mut engine = svt_engine(now);
        let delta = ToolIntent::UpdateVitals {
            deltas: VitalsDelta {
                hr: Some(-10),
                ..Default::default()
            },
        };
        engine.apply_intent(&delta, now);
        let after_one = engine.state().vitals.hr;
        engine.apply_intent(&delta, now);
        assert_eq!(engine.state().vitals.hr, after_one - 10);

        // At the clamp bound a second application is a no-op.
        let floor = ToolIntent::UpdateVitals {
            deltas: VitalsDelta {
                spo2: Some(10),
                ..Default::default()
            },
        };
        engine.apply_intent(&floor, now);
        engine.apply_intent(&floor, now);
        let at_cap = engine.state().vitals.spo2;
        engine.apply_intent(&floor, now);
        assert_eq!(engine.state().vitals.spo2, at_cap);
    }

    #[test]
    fn order_lifecycle_fields_are_consistent() {
        let now = Utc::now();
        let mut engine = svt_engine(now);
        engine.apply_intent(
            &ToolIntent::SubmitOrder {
                order_type: OrderType::Ekg,
                ordered_by: Some("u1".into()),
                iv_params: None,
            },
            now,
        );
        let pending = &engine.state().orders[0];
        assert_eq!(pending.status, OrderStatus::Pending);
        assert!(pending.result.is_none());
        assert!(pending.completed_at.is_none());

        // Fires on the heartbeat after the ETA.
        let later = now + Duration::milliseconds(OrderType::Ekg.eta_ms() + 500);
        let events = engine.tick(later);
        assert!(events
            .iter()
            .any(|e| matches!(e, EngineEvent::OrderCompleted { .. })));
        let complete = &engine.state().orders[0];
        assert_eq!(complete.status, OrderStatus::Complete);
        assert!(complete.result.is_some());
        assert!(complete.completed_at.is_some());
        assert_eq!(engine.state().ekg_history.len(), 1);
    }

    #[test]
    fn ekg_history_is_bounded() {
        let now = Utc::now();
        let mut engine = svt_engine(now);
        for i in 0..5 {
            let t = now + Duration::seconds(i * 60);
            engine.apply_intent(
                &ToolIntent::SubmitOrder {
                    order_type: OrderType::Ekg,
                    ordered_by: None,
                    iv_params: None,
                },
                t,
            );
            engine.tick(t + Duration::milliseconds(OrderType::Ekg.eta_ms() + 500));
        }
        assert_eq!(engine.state().ekg_history.len(), EKG_HISTORY_LIMIT);
    }

    #[test]
    fn adenosine_converts_and_stage_follows() {
        let now = Utc::now();
        let mut engine = svt_engine(now);

        // ECG order advances presentation -> active_svt via the hint.
        engine.apply_intent(
            &ToolIntent::SubmitOrder {
                order_type: OrderType::Ekg,
                ordered_by: None,
                iv_params: None,
            },
            now,
        );
        let evt = engine.evaluate_automatic_transitions(&["order:ekg".to_string()], now);
        assert!(matches!(
            evt,
            Some(EngineEvent::StageChanged { ref to, .. }) if to == "active_svt"
        ));

        let mut req = TreatmentRequest::new(TreatmentType::Adenosine);
        req.dose_mg = Some(5.0);
        req.rapid_push = Some(true);
        req.flush_given = Some(true);
        engine.apply_intent(
            &ToolIntent::ApplyTreatment { treatment: req },
            now + Duration::seconds(60),
        );

        let Some(ExtendedState::Svt(svt)) = &engine.state().extended else {
            panic!("svt extended state expected");
        };
        assert!(svt.converted);
        assert_eq!(svt.conversion_method.as_deref(), Some("adenosine_first"));
        assert_eq!(engine.state().vitals.hr, 96);
        assert_eq!(engine.dynamic_rhythm(), "sinus");

        let evt =
            engine.evaluate_automatic_transitions(&[], now + Duration::seconds(61));
        assert!(matches!(
            evt,
            Some(EngineEvent::StageChanged { ref to, .. }) if to == "converted"
        ));
    }

    #[test]
    fn treatment_timestamps_after_start() {
        let now = Utc::now();
        let mut engine = svt_engine(now);
        let mut req = TreatmentRequest::new(TreatmentType::VagalManeuver);
        req.route = None;
        engine.apply_intent(
            &ToolIntent::ApplyTreatment { treatment: req },
            now + Duration::seconds(5),
        );
        for t in &engine.state().treatment_history {
            assert!(t.ts >= engine.state().scenario_started_at);
        }
    }

    #[test]
    fn decay_effects_fire_in_order() {
        let now = Utc::now();
        let mut engine = svt_engine(now);
        engine.schedule_effect(
            now + Duration::seconds(5),
            ToolIntent::RevealFinding {
                finding_id: "second".into(),
            },
        );
        engine.schedule_effect(
            now + Duration::seconds(3),
            ToolIntent::RevealFinding {
                finding_id: "first".into(),
            },
        );
        let events = engine.tick(now + Duration::seconds(6));
        let revealed: Vec<String> = events
            .iter()
            .filter_map(|e| match e {
                EngineEvent::FindingRevealed { finding_id } => Some(finding_id.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(revealed, vec!["first".to_string(), "second".to_string()]);
    }

    #[test]
    fn hydrate_snapshot_round_trip() {
        let now = Utc::now();
        let mut engine = svt_engine(now);
        engine.apply_intent(
            &ToolIntent::SubmitOrder {
                order_type: OrderType::Labs,
                ordered_by: Some("u2".into()),
                iv_params: None,
            },
            now,
        );
        engine.apply_intent(
            &ToolIntent::RevealFinding {
                finding_id: "pallor".into(),
            },
            now,
        );
        let snapshot = engine.snapshot();

        let mut other = ScenarioEngine::new("child_asthma_basic_v1", now).unwrap();
        assert!(other.hydrate(snapshot.clone()));
        assert_eq!(other.snapshot(), snapshot);
        assert_eq!(other.definition().id, "teen_svt_complex_v1");
    }

    #[test]
    fn unknown_intent_target_rejects_without_mutation() {
        let now = Utc::now();
        let mut engine = svt_engine(now);
        let before = engine.snapshot();
        let events = engine.apply_intent(&ToolIntent::CompleteOrder { order_id: 99 }, now);
        assert!(matches!(events[0], EngineEvent::IntentRejected { .. }));
        assert_eq!(engine.snapshot(), before);

        let events = engine.apply_intent(
            &ToolIntent::SetStage {
                stage_id: "not_a_stage".into(),
            },
            now,
        );
        assert!(matches!(events[0], EngineEvent::IntentRejected { .. }));
        assert_eq!(engine.snapshot(), before);
    }

    #[test]
    fn paused_clock_freezes_tick() {
        let now = Utc::now();
        let mut engine = svt_engine(now);
        engine.pause_clock(now + Duration::seconds(10));
        engine.schedule_effect(
            now + Duration::seconds(20),
            ToolIntent::RevealFinding {
                finding_id: "should_wait".into(),
            },
        );
        let events = engine.tick(now + Duration::seconds(30));
        assert!(events.is_empty());
        assert!(!engine.state().findings.contains("should_wait"));
        assert_eq!(engine.state().elapsed_seconds, 10);

        engine.resume_clock(now + Duration::seconds(40));
        let events = engine.tick(now + Duration::seconds(41));
        assert!(events
            .iter()
            .any(|e| matches!(e, EngineEvent::FindingRevealed { .. })));
    }

    #[test]
    fn bedside_exam_reveals_and_flags() {
        let now = Utc::now();
        let mut engine = svt_engine(now);
        let text = engine.perform_exam(OrderType::CardiacExam, now).unwrap();
        assert!(text.contains("Rapid regular rhythm"));
        assert!(engine.state().findings.contains("physical_exam_performed"));
        let exam = engine.state().exam.as_ref().unwrap();
        assert!(exam.cardio.is_some());
        assert!(exam.heart_audio_url.is_some());

        assert!(engine.perform_exam(OrderType::Labs, now).is_none());
    }

    #[test]
    fn rhythm_change_inject_rebounds_converted_svt() {
        let now = Utc::now();
        let mut engine = svt_engine(now);
        let mut req = TreatmentRequest::new(TreatmentType::Adenosine);
        req.dose_mg = Some(5.0);
        engine.apply_intent(&ToolIntent::ApplyTreatment { treatment: req }, now);
        assert_eq!(engine.dynamic_rhythm(), "sinus");

        let (_, events) = engine.inject_event(
            crate::scenarios::ScenarioEventKind::RhythmChange,
            None,
            now + Duration::seconds(30),
        );
        assert!(events
            .iter()
            .any(|e| matches!(e, EngineEvent::VitalsUpdated)));
        assert_eq!(engine.dynamic_rhythm(), "svt");
        let Some(ExtendedState::Svt(svt)) = &engine.state().extended else {
            panic!("svt state expected");
        };
        assert!(svt.flags.rebound_svt);
        assert_eq!(svt.conversion_method.as_deref(), Some("adenosine_first"));
    }

    #[test]
    fn hypoxia_inject_applies_age_table() {
        let now = Utc::now();
        let mut engine = ScenarioEngine::new("child_asthma_basic_v1", now).unwrap();
        let (line, events) =
            engine.inject_event(crate::scenarios::ScenarioEventKind::Hypoxia, None, now);
        assert_eq!(line, "Saturation is falling");
        assert!(!events.is_empty());
        assert_eq!(engine.state().vitals.spo2, 84);
    }

    #[test]
    fn telemetry_history_appends_only_on_rhythm_change() {
        let now = Utc::now();
        let mut engine = svt_engine(now);
        engine.set_telemetry(true, now);
        assert_eq!(engine.state().telemetry_history.len(), 1);

        // Same rhythm: tick adds nothing.
        engine.tick(now + Duration::seconds(1));
        assert_eq!(engine.state().telemetry_history.len(), 1);

        // Conversion flips the label.
        let mut req = TreatmentRequest::new(TreatmentType::Adenosine);
        req.dose_mg = Some(5.0);
        engine.apply_intent(
            &ToolIntent::ApplyTreatment { treatment: req },
            now + Duration::seconds(30),
        );
        assert_eq!(engine.state().telemetry_history.len(), 2);
        assert_eq!(
            engine.state().telemetry_history[1].rhythm.as_deref(),
            Some("sinus")
        );
    }
}
