//! Staged movement plan execution.
//!
//! Vents move in steps so the structure is never jerked open or shut in one
//! travel, and zones can be sequenced: serial stages drive each zone to its
//! target before the next starts, parallel stages round-robin one step per
//! zone per pass.

use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::warn;

use canopy_actuators::Vent;
use canopy_core::config::{CloseStrategy, GroupConfig, PlanConfig, StageMode};

/// A vent shared between the controller and in-flight group moves.
pub type SharedVent = Arc<Mutex<Vent>>;

/// One zone inside an executable plan.
#[derive(Debug, Clone)]
pub struct GroupPlan {
    pub id: String,
    pub vent_ids: Vec<u32>,
    /// A force-closed zone moves even against the pass direction.
    pub force_close: bool,
}

/// One stage: an ordered list of zones and how to walk them.
#[derive(Debug, Clone)]
pub struct StagePlan {
    pub mode: StageMode,
    pub step_percent: f64,
    pub delay_s: f64,
    pub close_strategy: CloseStrategy,
    pub groups: Vec<GroupPlan>,
}

/// A fully resolved plan, ready to execute against per-vent targets.
#[derive(Debug, Clone)]
pub struct MovementPlan {
    pub stages: Vec<StagePlan>,
    pub close_strategy: CloseStrategy,
    pub step_delay_s: f64,
    pub tolerance: f64,
}

/// Zone facts the builder needs beyond the raw config.
#[derive(Debug, Clone)]
pub struct ZoneInfo {
    pub id: String,
    pub vent_ids: Vec<u32>,
    pub force_close: bool,
}

impl MovementPlan {
    /// Resolve a configured plan against the zones.
    ///
    /// Without configured stages, a single serial stage is synthesized: the
    /// configured zones in order, plus one trailing group for vents outside
    /// any zone.
    pub fn build(
        plan: &PlanConfig,
        groups: &[GroupConfig],
        zones: &BTreeMap<String, ZoneInfo>,
        all_vents: &[u32],
        default_step: f64,
        step_delay_s: f64,
        tolerance: f64,
    ) -> Self {
        let plan_strategy = plan.close_strategy.unwrap_or_default();
        let group_plan = |id: &str| -> Option<GroupPlan> {
            zones.get(id).map(|z| GroupPlan {
                id: z.id.clone(),
                vent_ids: z.vent_ids.clone(),
                force_close: z.force_close,
            })
        };

        let stages: Vec<StagePlan> = if plan.stages.is_empty() {
            let mut grouped: Vec<GroupPlan> = groups
                .iter()
                .filter_map(|g| group_plan(&g.id))
                .collect();
            let covered: Vec<u32> = grouped.iter().flat_map(|g| g.vent_ids.clone()).collect();
            let rest: Vec<u32> = all_vents
                .iter()
                .copied()
                .filter(|id| !covered.contains(id))
                .collect();
            if !rest.is_empty() {
                grouped.push(GroupPlan {
                    id: "ungrouped".to_string(),
                    vent_ids: rest,
                    force_close: false,
                });
            }
            vec![StagePlan {
                mode: StageMode::Serial,
                step_percent: default_step,
                delay_s: 0.0,
                close_strategy: plan_strategy,
                groups: grouped,
            }]
        } else {
            plan.stages
                .iter()
                .map(|stage| StagePlan {
                    mode: stage.mode,
                    step_percent: stage.step_percent.unwrap_or(default_step),
                    delay_s: stage.delay_s,
                    close_strategy: stage.close_strategy.unwrap_or(plan_strategy),
                    groups: stage.groups.iter().filter_map(|id| group_plan(id)).collect(),
                })
                .collect()
        };

        Self {
            stages,
            close_strategy: plan_strategy,
            step_delay_s,
            tolerance,
        }
    }

    /// Walk the plan until no vent can take another step.
    ///
    /// `closing` selects the pass direction: stages and zone lists are
    /// reversed under a LIFO strategy so the zones opened last close first,
    /// while opening always runs in configured order.
    pub async fn execute(
        &self,
        vents: &BTreeMap<u32, SharedVent>,
        targets: &BTreeMap<u32, f64>,
        closing: bool,
    ) -> bool {
        let mut stages: Vec<&StagePlan> = self.stages.iter().collect();
        if closing && self.close_strategy == CloseStrategy::Lifo {
            stages.reverse();
        }
        let mut any_moved = false;
        for stage in stages {
            let mut groups: Vec<&GroupPlan> = stage.groups.iter().collect();
            if closing && stage.close_strategy == CloseStrategy::Lifo {
                groups.reverse();
            }
            match stage.mode {
                StageMode::Serial => {
                    for (index, group) in groups.iter().enumerate() {
                        loop {
                            let moved = self
                                .step_group(vents, group, targets, stage.step_percent, closing)
                                .await;
                            if !moved {
                                break;
                            }
                            any_moved = true;
                            self.pause(self.step_delay_s).await;
                        }
                        if index + 1 < groups.len() {
                            self.pause(stage.delay_s).await;
                        }
                    }
                }
                StageMode::Parallel => loop {
                    let mut pass_moved = false;
                    for (index, group) in groups.iter().enumerate() {
                        if self
                            .step_group(vents, group, targets, stage.step_percent, closing)
                            .await
                        {
                            pass_moved = true;
                            any_moved = true;
                        }
                        if index + 1 < groups.len() {
                            self.pause(stage.delay_s).await;
                        }
                    }
                    if !pass_moved {
                        break;
                    }
                    self.pause(self.step_delay_s).await;
                },
            }
        }
        any_moved
    }

    async fn pause(&self, seconds: f64) {
        if seconds > 0.0 {
            sleep(Duration::from_secs_f64(seconds)).await;
        }
    }

    /// One step of one group. Vents inside a group move concurrently.
    async fn step_group(
        &self,
        vents: &BTreeMap<u32, SharedVent>,
        group: &GroupPlan,
        targets: &BTreeMap<u32, f64>,
        step: f64,
        closing: bool,
    ) -> bool {
        let mut moves = Vec::new();
        for id in &group.vent_ids {
            let (vent, target) = match (vents.get(id), targets.get(id)) {
                (Some(v), Some(t)) => (v, *t),
                _ => continue,
            };
            let (position, available) = {
                let guard = vent.lock().await;
                (guard.position(), guard.is_available())
            };
            if !available {
                continue;
            }
            let diff = target - position;
            if diff.abs() <= self.tolerance {
                continue;
            }
            // A vent moving against the pass direction waits for its own
            // pass, unless its zone is force-closed.
            if (diff > 0.0) == closing && !group.force_close {
                continue;
            }
            let amount = diff.abs().min(step);
            let next = if diff > 0.0 {
                position + amount
            } else {
                position - amount
            };
            moves.push((*id, vent.clone(), next));
        }
        if moves.is_empty() {
            return false;
        }
        let results = join_all(moves.into_iter().map(|(id, vent, next)| async move {
            let mut vent = vent.lock().await;
            match vent.move_to(next).await {
                Ok(moved) => moved,
                Err(e) => {
                    warn!(vent = id, error = %e, "vent move failed");
                    false
                }
            }
        }))
        .await;
        results.into_iter().any(|moved| moved)
    }
}

/// Infer the pass direction from the pending deltas: whichever side has the
/// majority of vents wins, ties follow whether the requested target sits
/// below the previous one.
pub fn infer_closing(
    deltas: impl Iterator<Item = (f64, f64)>,
    tolerance: f64,
    requested: f64,
    last_target: Option<f64>,
) -> bool {
    let mut closers = 0usize;
    let mut openers = 0usize;
    for (position, target) in deltas {
        if position - target > tolerance {
            closers += 1;
        } else if target - position > tolerance {
            openers += 1;
        }
    }
    if closers != openers {
        return closers > openers;
    }
    match last_target {
        Some(last) => requested < last,
        None => false,
    }
}
