//! Role-gated `sim_state` snapshot builder.
//!
//! Presenters see everything. Participants see clinical data only once
//! the matching order has completed (or telemetry is on): vitals behind a
//! vitals order, rhythm/waveform/EKG behind an EKG order, exam sections
//! behind their exam orders. Interventions, orders, treatments, and
//! findings are always visible. Extended state and the stage list never
//! leave the presenter view.

use pg_engine::state::{EngineState, Exam, OrderStatus, OrderType};
use pg_protocol::{BudgetView, ExamAudio, Role, SimState};

use crate::runtime::SessionRuntime;
use crate::telemetry;

fn has_complete_order(state: &EngineState, order_type: OrderType) -> bool {
    state
        .orders
        .iter()
        .any(|o| o.order_type == order_type && o.status == OrderStatus::Complete)
}

/// Build the snapshot for one role.
pub fn build_sim_state(
    session_id: &str,
    runtime: &SessionRuntime,
    role: Role,
    session_fallback: bool,
    elapsed_seconds: u64,
) -> SimState {
    let state = runtime.engine.state();
    let presenter = role == Role::Presenter;

    let vitals_visible =
        presenter || state.telemetry || has_complete_order(state, OrderType::Vitals);
    let rhythm_visible = presenter || state.telemetry || has_complete_order(state, OrderType::Ekg);

    let waveform = if state.telemetry && rhythm_visible {
        Some(telemetry::synthesize_waveform(
            state.vitals.hr,
            runtime.engine.dynamic_rhythm(),
        ))
    } else {
        None
    };

    let (exam, exam_audio) = visible_exam(state, presenter);

    SimState {
        session_id: session_id.to_string(),
        stage_id: state.stage_id.clone(),
        scenario_id: state.scenario_id.clone(),
        vitals: vitals_visible.then(|| state.vitals.clone()),
        exam,
        exam_audio,
        interventions: state.interventions.clone(),
        telemetry: state.telemetry,
        rhythm_summary: rhythm_visible
            .then(|| state.rhythm_summary.clone())
            .flatten(),
        telemetry_waveform: waveform,
        findings: state.findings.iter().cloned().collect(),
        orders: state.orders.clone(),
        ekg_history: rhythm_visible.then(|| state.ekg_history.clone()),
        telemetry_history: rhythm_visible.then(|| state.telemetry_history.clone()),
        treatment_history: state.treatment_history.clone(),
        scenario_started_at: Some(state.scenario_started_at),
        stage_entered_at: Some(state.stage_entered_at),
        elapsed_seconds: Some(elapsed_seconds),
        fallback: session_fallback,
        voice_fallback: runtime.voice_fallback,
        correlation_id: runtime.correlation_id.clone(),
        budget: presenter.then(|| BudgetView {
            usd_estimate: runtime.cost.usd_estimate,
            soft_limit_reached: runtime.cost.soft_fired,
            hard_limit_reached: runtime.cost.hard_fired,
        }),
        extended: presenter.then(|| state.extended.clone()).flatten(),
        stage_ids: presenter.then(|| state.stage_ids.clone()),
    }
}

/// Exam sections the role may see. Presenters get whatever has been
/// revealed; participants get the subsets behind completed exam orders.
fn visible_exam(state: &EngineState, presenter: bool) -> (Option<Exam>, Option<ExamAudio>) {
    let Some(revealed) = &state.exam else {
        return (None, None);
    };

    if presenter {
        let audio = ExamAudio {
            heart_audio_url: revealed.heart_audio_url.clone(),
            lung_audio_url: revealed.lung_audio_url.clone(),
        };
        let mut text = revealed.clone();
        text.heart_audio_url = None;
        text.lung_audio_url = None;
        return (Some(text), (!audio.is_empty()).then_some(audio));
    }

    let cardiac = has_complete_order(state, OrderType::CardiacExam);
    let lungs = has_complete_order(state, OrderType::LungExam);
    let general = has_complete_order(state, OrderType::GeneralExam);
    if !cardiac && !lungs && !general {
        return (None, None);
    }

    let exam = Exam {
        general: general.then(|| revealed.general.clone()).flatten(),
        cardio: cardiac.then(|| revealed.cardio.clone()).flatten(),
        lungs: lungs.then(|| revealed.lungs.clone()).flatten(),
        perfusion: general.then(|| revealed.perfusion.clone()).flatten(),
        neuro: general.then(|| revealed.neuro.clone()).flatten(),
        heart_audio_url: None,
        lung_audio_url: None,
    };
    let audio = ExamAudio {
        heart_audio_url: cardiac.then(|| revealed.heart_audio_url.clone()).flatten(),
        lung_audio_url: lungs.then(|| revealed.lung_audio_url.clone()).flatten(),
    };
    (Some(exam), (!audio.is_empty()).then_some(audio))
}
