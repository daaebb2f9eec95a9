use std::collections::BTreeMap;
use std::fmt::Write;
use std::time::{Duration, Instant};

use crate::core::StepId;
use crate::plan::ExecutionPlan;

/// Lifecycle of one step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    Pending,
    Running,
    Succeeded,
    Failed,
    /// Not launched because a step it depends on failed or was skipped.
    Skipped,
}

/// Lifecycle of a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Planned,
    Running,
    Completed,
    Aborted,
}

#[derive(Debug, Clone)]
pub struct StepRecord {
    pub wave: usize,
    pub state: StepState,
    pub start: Option<Instant>,
    pub duration: Duration,
}

/// What happened to every step of a run.
#[derive(Debug, Clone)]
pub struct Diagnostics {
    pub state: ExecutionState,
    pub steps: BTreeMap<StepId, StepRecord>,
}

impl Diagnostics {
    pub(crate) fn planned(plan: &ExecutionPlan) -> Self {
        let steps = plan
            .waves()
            .into_iter()
            .enumerate()
            .flat_map(|(wave, ids)| {
                ids.into_iter().map(move |id| {
                    let record = StepRecord {
                        wave,
                        state: StepState::Pending,
                        start: None,
                        duration: Duration::ZERO,
                    };
                    (id.clone(), record)
                })
            })
            .collect();

        Self {
            state: ExecutionState::Planned,
            steps,
        }
    }

    pub(crate) fn transition(&mut self, id: &StepId, state: StepState) {
        if let Some(record) = self.steps.get_mut(id) {
            record.state = state;
        }
    }

    pub(crate) fn finish(
        &mut self,
        id: &StepId,
        state: StepState,
        start: Instant,
        duration: Duration,
    ) {
        if let Some(record) = self.steps.get_mut(id) {
            record.state = state;
            record.start = Some(start);
            record.duration = duration;
        }
    }

    pub fn step(&self, id: &str) -> Option<&StepRecord> {
        self.steps.get(id)
    }

    /// Ids of the steps in `state`.
    pub fn in_state(&self, state: StepState) -> Vec<&StepId> {
        self.steps
            .iter()
            .filter(|(_, record)| record.state == state)
            .map(|(id, _)| id)
            .collect()
    }

    /// SVG timeline of the steps that ran, one row per step, grouped by wave.
    pub fn render_waterfall(&self) -> String {
        let mut rows: Vec<(&StepId, &StepRecord, Instant)> = self
            .steps
            .iter()
            .filter_map(|(id, record)| record.start.map(|start| (id, record, start)))
            .collect();

        if rows.is_empty() {
            return "<svg width=\"200\" height=\"50\" xmlns=\"http://www.w3.org/2000/svg\"><text x=\"10\" y=\"30\" font-family=\"sans-serif\">No steps ran</text></svg>".to_string();
        }

        rows.sort_by_key(|(_, record, start)| (record.wave, *start));

        let global_start = rows
            .iter()
            .map(|(_, _, start)| *start)
            .min()
            .unwrap_or_else(Instant::now);
        let global_end = rows
            .iter()
            .map(|(_, record, start)| *start + record.duration)
            .max()
            .unwrap_or(global_start);
        let total_micros = global_end.duration_since(global_start).as_micros().max(1) as f64;

        let row_height = 24;
        let label_width = 280;
        let chart_width = 720;
        let padding = 10;
        let width = label_width + chart_width + padding * 2 + 80;
        let height = rows.len() as u32 * row_height + padding * 2;

        let mut out = String::new();
        let _ = writeln!(
            out,
            r#"<svg width="{width}" height="{height}" xmlns="http://www.w3.org/2000/svg">
    <style>
        text {{ font-family: sans-serif; font-size: 12px; }}
        .ok {{ fill: #3b82f6; }}
        .failed {{ fill: #ef4444; }}
        .wave {{ fill: #9ca3af; font-size: 10px; }}
    </style>
    <rect width="100%" height="100%" fill="white" />"#
        );

        for (i, (id, record, start)) in rows.iter().enumerate() {
            let y = padding + i as u32 * row_height;
            let offset = start.duration_since(global_start).as_micros() as f64;
            let length = record.duration.as_micros() as f64;

            let x = (label_width + padding) as f64 + offset / total_micros * chart_width as f64;
            let w = (length / total_micros * chart_width as f64).max(1.0);
            let class = match record.state {
                StepState::Failed => "failed",
                _ => "ok",
            };

            let _ = writeln!(
                out,
                r#"    <text x="{padding}" y="{ty}" class="wave">{wave}</text>
    <text x="{lx}" y="{ty}">{name}</text>
    <rect x="{x:.1}" y="{ry}" width="{w:.1}" height="{h}" class="{class}"><title>{name}: {dur:.2?}</title></rect>
    <text x="{tx:.1}" y="{ty}">{dur:.2?}</text>"#,
                ty = y + row_height / 2 + 4,
                wave = record.wave,
                lx = padding + 30,
                name = escape(id.as_str()),
                ry = y + 4,
                h = row_height - 8,
                tx = x + w + 5.0,
                dur = record.duration,
            );
        }

        out.push_str("</svg>");
        out
    }
}

fn escape(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
