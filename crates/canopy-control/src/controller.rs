//! The control loop.
//!
//! One task owns every piece of mutable state: vent models, zone lock state,
//! mode, heating, CO2 edge detection. Sensors reach it through shared
//! snapshots, operators through the command channel. Nothing else mutates.

use chrono::{DateTime, Local};
use futures::future::join_all;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use canopy_actuators::{ThreeWayValve, Vent};
use canopy_core::command::CommandSink;
use canopy_core::config::{
    validate_groups, validate_heating, validate_plan, validate_vents, ControlConfig, GroupConfig,
    HeatingConfig, PlanConfig, VentConfig, VentDefaults,
};
use canopy_core::error::Result;
use canopy_core::metrics::{Metric, SharedSnapshot};
use canopy_core::schedule::is_daytime;
use canopy_devices::{SerialOverlay, VentFault};
use canopy_storage::{EventKind, EventLog, Mode, StateStore, VentState};

use crate::command::{Command, ConfigUpdate, ControllerHandle};
use crate::harness::HarnessOverrides;
use crate::plan::{infer_closing, MovementPlan, SharedVent, ZoneInfo};
use crate::scheduler::{DailySchedule, DailyTask};

/// Configuration the controller runs with. Sections can be replaced at
/// runtime through [`ConfigUpdate`].
#[derive(Debug, Clone, Default)]
pub struct ControllerSettings {
    pub control: ControlConfig,
    pub heating: HeatingConfig,
    pub vent_defaults: VentDefaults,
    pub vents: Vec<VentConfig>,
    pub groups: Vec<GroupConfig>,
    pub plan: PlanConfig,
}

impl ControllerSettings {
    pub fn validate(&self) -> Result<()> {
        validate_vents(&self.vents)?;
        let vent_ids = self.vents.iter().map(|v| v.id).collect();
        validate_groups(&self.groups, &vent_ids)?;
        let group_ids = self.groups.iter().map(|g| g.id.clone()).collect();
        validate_plan(&self.plan, &group_ids)?;
        validate_heating(&self.heating)
    }
}

/// Shared collaborators handed to the controller at startup.
pub struct ControllerDeps {
    pub store: StateStore,
    pub events: EventLog,
    pub snapshot: SharedSnapshot,
    pub overlay: SerialOverlay,
    pub harness: HarnessOverrides,
    pub sink: Arc<dyn CommandSink>,
    pub faults: mpsc::Receiver<VentFault>,
}

/// A vent group with its runtime wind-lock state.
struct Zone {
    config: GroupConfig,
    /// `None` until the first wind direction observation.
    locked: Option<bool>,
}

impl Zone {
    fn is_locked(&self) -> bool {
        self.locked == Some(true)
    }

    fn close_percent(&self) -> f64 {
        self.config.wind_lock_close_percent.unwrap_or(0.0)
    }
}

pub struct Controller {
    settings: ControllerSettings,
    vents: BTreeMap<u32, SharedVent>,
    zones: Vec<Zone>,
    mode: Mode,
    user_targets: BTreeMap<u32, f64>,
    last_auto_target: Option<f64>,
    last_readings: BTreeMap<Metric, Option<f64>>,
    co2_high: bool,
    heating_on: bool,
    valve: Option<ThreeWayValve>,
    schedule: DailySchedule,
    store: StateStore,
    events: EventLog,
    snapshot: SharedSnapshot,
    overlay: SerialOverlay,
    harness: HarnessOverrides,
    sink: Arc<dyn CommandSink>,
    commands: mpsc::Receiver<Command>,
    faults: mpsc::Receiver<VentFault>,
}

impl Controller {
    /// Validate the settings, restore persisted state and build the
    /// controller together with its command handle.
    ///
    /// A persisted manual mode is rewritten to auto: after a restart nobody
    /// is necessarily watching, so the controller must be in charge.
    pub fn new(
        mut settings: ControllerSettings,
        deps: ControllerDeps,
    ) -> Result<(Self, ControllerHandle)> {
        settings.validate()?;

        for (name, value) in deps.store.control_overrides().map_err(canopy_core::Error::from)? {
            if let Err(e) = settings.control.apply_value(&name, &value) {
                warn!(field = %name, error = %e, "dropping invalid persisted override");
            }
        }

        let mut vents = BTreeMap::new();
        let mut user_targets = BTreeMap::new();
        for config in &settings.vents {
            let mut vent = Vent::new(config, &settings.vent_defaults, deps.sink.clone());
            match deps
                .store
                .vent_state(config.id)
                .map_err(canopy_core::Error::from)?
            {
                Some(state) => {
                    vent.restore_position(state.position);
                    user_targets.insert(config.id, state.user_target);
                }
                None => {
                    user_targets.insert(config.id, 0.0);
                }
            }
            vents.insert(config.id, Arc::new(Mutex::new(vent)));
        }

        let stored_mode = deps.store.mode().map_err(canopy_core::Error::from)?;
        if stored_mode != Some(Mode::Auto) {
            if stored_mode == Some(Mode::Manual) {
                info!("persisted manual mode reset to auto at startup");
            }
            deps.store
                .set_mode(Mode::Auto)
                .map_err(canopy_core::Error::from)?;
        }

        let prefs = deps
            .store
            .notification_preferences()
            .map_err(canopy_core::Error::from)?;
        if prefs.is_empty() {
            let defaults: BTreeMap<String, bool> = EventKind::CATEGORIES
                .iter()
                .map(|c| (c.to_string(), true))
                .collect();
            deps.store
                .set_notification_preferences(&defaults)
                .map_err(canopy_core::Error::from)?;
        }

        let zones = settings
            .groups
            .iter()
            .map(|g| Zone {
                config: g.clone(),
                locked: None,
            })
            .collect();
        let valve = settings
            .heating
            .valve
            .clone()
            .map(|v| ThreeWayValve::new(v, deps.sink.clone()));
        let schedule = DailySchedule::new(
            settings.control.flush_hour,
            settings.control.calibration_hour,
        );

        let (tx, commands) = mpsc::channel(32);
        let controller = Self {
            settings,
            vents,
            zones,
            mode: Mode::Auto,
            user_targets,
            last_auto_target: None,
            last_readings: BTreeMap::new(),
            co2_high: false,
            heating_on: false,
            valve,
            schedule,
            store: deps.store,
            events: deps.events,
            snapshot: deps.snapshot,
            overlay: deps.overlay,
            harness: deps.harness,
            sink: deps.sink,
            commands,
            faults: deps.faults,
        };
        Ok((controller, ControllerHandle::new(tx)))
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Run until `shutdown` fires.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let loop_s = self.settings.control.controller_loop_s.max(0.1);
        let mut ticker = tokio::time::interval(Duration::from_secs_f64(loop_s));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(loop_s, mode = %self.mode, "controller started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = Local::now();
                    for task in self.schedule.due(now) {
                        self.run_task(task).await;
                    }
                    if let Err(e) = self.tick(now).await {
                        warn!(error = %e, "control tick failed");
                    }
                }
                Some(command) = self.commands.recv() => {
                    self.handle_command(command).await;
                }
                Some(fault) = self.faults.recv() => {
                    self.handle_fault(fault).await;
                }
                _ = shutdown.changed() => {
                    info!("controller shutting down");
                    break;
                }
            }
        }
    }

    /// One pass of the control algorithm.
    pub async fn tick(&mut self, now: DateTime<Local>) -> Result<()> {
        let readings = self.collect_readings().await;
        let get = |metric: Metric| readings.get(&metric).copied().flatten();

        // CO2 edge detection and heating keep running on partial data; they
        // only need their own inputs.
        self.update_co2_state(get(Metric::InternalCo2)).await?;
        self.heating_tick(get(Metric::InternalTemp), now).await?;
        self.update_wind_locks(get(Metric::WindDirection)).await?;

        let required = (
            get(Metric::InternalTemp),
            get(Metric::ExternalTemp),
            get(Metric::InternalHum),
            get(Metric::WindSpeed),
        );
        let (Some(int_temp), Some(ext_temp), Some(int_hum), Some(wind)) = required else {
            debug!("required sensors missing, holding vents");
            return Ok(());
        };
        let rain = get(Metric::Rain).unwrap_or(0.0);

        if self.mode == Mode::Manual {
            return self.manual_tick(wind, rain, int_hum).await;
        }

        let control = &self.settings.control;
        let daytime = is_daytime(now.time(), control.day_start, control.night_start);
        let mut target = self.thermal_target(int_temp, ext_temp, daytime);
        if int_hum > control.humidity_thr {
            target = target.max(control.min_open_hum_percent);
        }
        if self.co2_high {
            if let Some(floor) = control.min_open_co2_percent {
                target = target.max(floor);
            }
        }
        target = self.safety_clamp(target, wind, rain, int_hum);
        if !daytime && !self.settings.heating.enabled {
            target = target.min(self.settings.control.night_max_open_percent);
        }

        let tolerance = self.settings.control.tolerance();
        let effective = self.effective_targets(target);
        let mut should_move = match self.last_auto_target {
            None => true,
            Some(last) => (target - last).abs() >= 1.0,
        };
        if !should_move {
            // An unchanged target can still demand movement when a zone lock
            // flipped and pinned some vents elsewhere.
            for (id, vent) in &self.vents {
                let eff = effective[id];
                if (eff - target).abs() > f64::EPSILON {
                    let position = vent.lock().await.position();
                    if (eff - position).abs() > tolerance {
                        should_move = true;
                        break;
                    }
                }
            }
        }
        if !should_move {
            return Ok(());
        }

        debug!(target, "auto target computed");
        let mut deltas = Vec::new();
        for (id, vent) in &self.vents {
            deltas.push((vent.lock().await.position(), effective[id]));
        }
        let closing = infer_closing(deltas.into_iter(), tolerance, target, self.last_auto_target);
        let plan = self.build_plan(tolerance);
        plan.execute(&self.vents, &effective, closing).await;
        for id in self.vents.keys().copied().collect::<Vec<_>>() {
            self.user_targets.insert(id, target);
        }
        self.persist_vents().await?;
        self.last_auto_target = Some(target);
        Ok(())
    }

    /// Merge the three sensor sources: MQTT averages as the baseline, fresh
    /// serial readings on top, harness overrides over everything.
    async fn collect_readings(&mut self) -> BTreeMap<Metric, Option<f64>> {
        let mut readings = self.snapshot.averages().await;
        for (metric, value) in self.overlay.read().await.iter() {
            if let Some(v) = value {
                readings.insert(*metric, Some(*v));
            }
        }
        self.harness.apply(&mut readings).await;
        self.last_readings = readings.clone();
        readings
    }

    fn thermal_target(&self, int_temp: f64, ext_temp: f64, daytime: bool) -> f64 {
        let control = &self.settings.control;
        let setpoint = control.environment_target(daytime);
        let diff = int_temp - setpoint;
        // Venting only helps when the outside air pushes the right way.
        if diff > 0.0 && ext_temp < int_temp {
            (diff * control.temp_diff_percent).min(100.0)
        } else if diff < 0.0 && ext_temp > int_temp {
            (diff.abs() * control.temp_diff_percent).min(100.0)
        } else {
            0.0
        }
    }

    fn safety_clamp(&self, target: f64, wind: f64, rain: f64, humidity: f64) -> f64 {
        let control = &self.settings.control;
        if wind >= control.wind_crit_ms || rain > control.rain_threshold {
            if control.allow_humidity_override && humidity > control.humidity_thr {
                // The crack is an absolute position, not a cap: condensation
                // needs the gap even when the wish was smaller.
                return control.crit_hum_crack_percent;
            }
            return 0.0;
        }
        if wind >= control.wind_risk_ms {
            return target.min(control.risk_open_limit_percent);
        }
        target
    }

    async fn manual_tick(&mut self, wind: f64, rain: f64, humidity: f64) -> Result<()> {
        let mut moved_any = false;
        for (id, vent) in &self.vents {
            let Some(wish) = self.user_targets.get(id).copied() else {
                continue;
            };
            let safe = self.safety_clamp(wish, wind, rain, humidity);
            let mut guard = vent.lock().await;
            if !guard.is_available() {
                continue;
            }
            if (safe - guard.position()).abs() >= 1.0 {
                match guard.move_to(safe).await {
                    Ok(moved) => moved_any |= moved,
                    Err(e) => warn!(vent = id, error = %e, "manual move failed"),
                }
            }
        }
        if moved_any {
            self.persist_vents().await?;
        }
        Ok(())
    }

    async fn update_co2_state(&mut self, co2: Option<f64>) -> Result<()> {
        let Some(threshold) = self.settings.control.co2_thr_ppm else {
            return Ok(());
        };
        let Some(co2) = co2 else {
            return Ok(());
        };
        if co2 > threshold && !self.co2_high {
            self.co2_high = true;
            warn!(co2, threshold, "co2 above threshold");
            self.notify(
                EventKind::Co2High,
                format!("CO2 {co2:.0} ppm above {threshold:.0} ppm"),
            )
            .await?;
        } else if co2 <= threshold && self.co2_high {
            self.co2_high = false;
            info!(co2, threshold, "co2 back below threshold");
            self.notify(
                EventKind::Co2Normal,
                format!("CO2 {co2:.0} ppm back below {threshold:.0} ppm"),
            )
            .await?;
        }
        Ok(())
    }

    async fn heating_tick(&mut self, temp: Option<f64>, now: DateTime<Local>) -> Result<()> {
        let heating = &self.settings.heating;
        if !heating.enabled {
            if self.heating_on {
                self.set_heating(false, "heating disabled".to_string()).await?;
            }
            return Ok(());
        }
        let Some(temp) = temp else {
            return Ok(());
        };
        let day_start = heating.day_start.or(self.settings.control.day_start);
        let night_start = heating.night_start.or(self.settings.control.night_start);
        let daytime = is_daytime(now.time(), day_start, night_start);
        let target = if daytime {
            heating.day_target_c.or(heating.night_target_c)
        } else {
            heating.night_target_c.or(heating.day_target_c)
        };
        let Some(target) = target else {
            return Ok(());
        };
        let hysteresis = heating.hysteresis();
        if !self.heating_on && temp <= target - hysteresis {
            self.set_heating(
                true,
                format!("{temp:.1} C at or below {:.1} C", target - hysteresis),
            )
            .await?;
        } else if self.heating_on && temp >= target {
            self.set_heating(false, format!("{temp:.1} C reached {target:.1} C"))
                .await?;
        }
        Ok(())
    }

    async fn set_heating(&mut self, on: bool, reason: String) -> Result<()> {
        if let Some(valve) = self.valve.as_mut() {
            let target = if on { 100.0 } else { 0.0 };
            if let Err(e) = valve.move_to(target).await {
                warn!(error = %e, "heating valve move failed");
                return Ok(());
            }
        }
        if let Some(topic) = self.settings.heating.topic.clone() {
            let payload = if on {
                self.settings
                    .heating
                    .payload_on
                    .clone()
                    .unwrap_or_else(|| "ON".to_string())
            } else {
                self.settings
                    .heating
                    .payload_off
                    .clone()
                    .unwrap_or_else(|| "OFF".to_string())
            };
            if let Err(e) = self.sink.publish(&topic, &payload).await {
                warn!(error = %e, "heating switch publish failed");
                return Ok(());
            }
        }
        self.heating_on = on;
        let kind = if on {
            EventKind::HeatingOn
        } else {
            EventKind::HeatingOff
        };
        info!(on, "heating state changed: {reason}");
        self.notify(kind, reason).await
    }

    async fn update_wind_locks(&mut self, direction: Option<f64>) -> Result<()> {
        let Some(direction) = direction else {
            return Ok(());
        };
        let global = self.settings.control.wind_lock_enabled;
        let mut transitions = Vec::new();
        for zone in &mut self.zones {
            let eligible =
                global && zone.config.wind_lock_enabled && !zone.config.wind_upwind_deg.is_empty();
            if !eligible {
                continue;
            }
            let locked = zone
                .config
                .wind_upwind_deg
                .iter()
                .any(|range| range.contains(direction));
            match zone.locked {
                None => {
                    zone.locked = Some(locked);
                    if locked {
                        transitions.push((zone.config.id.clone(), true));
                    }
                }
                Some(previous) if previous != locked => {
                    zone.locked = Some(locked);
                    transitions.push((zone.config.id.clone(), locked));
                }
                _ => {}
            }
        }
        if !transitions.is_empty() {
            // Force a fresh move decision: an unchanged target must still
            // re-place the vents a lock just pinned or released.
            self.last_auto_target = None;
        }
        for (id, locked) in transitions {
            if locked {
                warn!(group = %id, direction, "group upwind, wind lock engaged");
                self.notify(
                    EventKind::WindLockOn,
                    format!("group '{id}' upwind at {direction:.0} deg, forcing closed"),
                )
                .await?;
            } else {
                info!(group = %id, direction, "wind lock released");
                self.notify(
                    EventKind::WindLockOff,
                    format!("group '{id}' no longer upwind, lock released"),
                )
                .await?;
            }
        }
        Ok(())
    }

    /// Per-vent targets with zone locks applied: a locked zone pins its
    /// vents at the configured close position.
    fn effective_targets(&self, target: f64) -> BTreeMap<u32, f64> {
        let mut targets: BTreeMap<u32, f64> =
            self.vents.keys().map(|id| (*id, target)).collect();
        for zone in &self.zones {
            if zone.is_locked() {
                for id in &zone.config.vents {
                    targets.insert(*id, zone.close_percent());
                }
            }
        }
        targets
    }

    fn build_plan(&self, tolerance: f64) -> MovementPlan {
        let zone_infos: BTreeMap<String, ZoneInfo> = self
            .zones
            .iter()
            .map(|z| {
                (
                    z.config.id.clone(),
                    ZoneInfo {
                        id: z.config.id.clone(),
                        vent_ids: z.config.vents.clone(),
                        force_close: z.is_locked(),
                    },
                )
            })
            .collect();
        let all_vents: Vec<u32> = self.vents.keys().copied().collect();
        MovementPlan::build(
            &self.settings.plan,
            &self.settings.groups,
            &zone_infos,
            &all_vents,
            self.settings.control.step_percent,
            self.settings.control.step_delay_s,
            tolerance,
        )
    }

    async fn run_task(&mut self, task: DailyTask) {
        match task {
            DailyTask::Flush => {
                info!("daily flush: opening all vents");
                if let Err(e) = self.move_all_staged(100.0).await {
                    warn!(error = %e, "daily flush failed");
                }
            }
            DailyTask::Calibrate => {
                info!("daily calibration close");
                if let Err(e) = self.calibrate_all().await {
                    warn!(error = %e, "daily calibration failed");
                }
            }
        }
    }

    fn safety_inputs(&self) -> Option<(f64, f64, f64)> {
        let get = |m: Metric| self.last_readings.get(&m).copied().flatten();
        match (get(Metric::WindSpeed), get(Metric::InternalHum)) {
            (Some(wind), Some(hum)) => Some((wind, get(Metric::Rain).unwrap_or(0.0), hum)),
            _ => None,
        }
    }

    /// Move every vent toward `percent` through the staged plan, keeping the
    /// safety clamp when current readings allow one.
    async fn move_all_staged(&mut self, percent: f64) -> Result<()> {
        let requested = percent.clamp(0.0, 100.0);
        let target = match self.safety_inputs() {
            Some((wind, rain, hum)) => self.safety_clamp(requested, wind, rain, hum),
            None => requested,
        };
        let tolerance = self.settings.control.tolerance();
        let effective = self.effective_targets(target);
        let mut deltas = Vec::new();
        for (id, vent) in &self.vents {
            deltas.push((vent.lock().await.position(), effective[id]));
        }
        let closing = infer_closing(deltas.into_iter(), tolerance, target, self.last_auto_target);
        let plan = self.build_plan(tolerance);
        plan.execute(&self.vents, &effective, closing).await;
        for id in self.vents.keys().copied().collect::<Vec<_>>() {
            self.user_targets.insert(id, target);
        }
        self.persist_vents().await
    }

    async fn calibrate_all(&mut self) -> Result<()> {
        info!("calibrating all vents closed");
        let moves: Vec<_> = self
            .vents
            .iter()
            .map(|(id, vent)| {
                let id = *id;
                let vent = vent.clone();
                async move {
                    let mut guard = vent.lock().await;
                    if !guard.is_available() {
                        return None;
                    }
                    Some((id, guard.calibrate_close().await))
                }
            })
            .collect();
        for (id, result) in join_all(moves).await.into_iter().flatten() {
            match result {
                Ok(()) => {
                    self.user_targets.insert(id, 0.0);
                }
                Err(e) => warn!(vent = id, error = %e, "calibration failed"),
            }
        }
        self.persist_vents().await
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::SetMode { mode, reply } => {
                let ok = match self.set_mode(mode).await {
                    Ok(ok) => ok,
                    Err(e) => {
                        warn!(error = %e, "mode change failed");
                        false
                    }
                };
                let _ = reply.send(ok);
            }
            Command::SetVent { id, percent, reply } => {
                let ok = match self.set_vent_target(id, percent).await {
                    Ok(ok) => ok,
                    Err(e) => {
                        warn!(vent = id, error = %e, "manual vent command failed");
                        false
                    }
                };
                let _ = reply.send(ok);
            }
            Command::SetGroup {
                group,
                percent,
                reply,
            } => {
                let ok = match self.set_group_target(&group, percent).await {
                    Ok(ok) => ok,
                    Err(e) => {
                        warn!(group = %group, error = %e, "manual group command failed");
                        false
                    }
                };
                let _ = reply.send(ok);
            }
            Command::MarkError { id, faulted, reply } => {
                let known = self.vents.contains_key(&id);
                if known {
                    self.handle_fault(VentFault { vent: id, faulted }).await;
                }
                let _ = reply.send(known);
            }
            Command::SetAll { percent, reply } => {
                let ok = match self.set_all_targets(percent).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(error = %e, "manual set-all failed");
                        false
                    }
                };
                let _ = reply.send(ok);
            }
            Command::CalibrateAll { reply } => {
                let ok = match self.calibrate_all().await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(error = %e, "calibration failed");
                        false
                    }
                };
                let _ = reply.send(ok);
            }
            Command::UpdateControl { values, reply } => {
                let result = self.update_control(values).await.map_err(|e| e.to_string());
                let _ = reply.send(result);
            }
            Command::UpdateConfig { update, reply } => {
                let result = self.update_config(update).await.map_err(|e| e.to_string());
                let _ = reply.send(result);
            }
            Command::SetNotificationPreferences { prefs, reply } => {
                let ok = self.store.set_notification_preferences(&prefs).is_ok();
                let _ = reply.send(ok);
            }
        }
    }

    async fn set_mode(&mut self, mode: Mode) -> Result<bool> {
        if mode == self.mode {
            return Ok(true);
        }
        self.mode = mode;
        self.store
            .set_mode(mode)
            .map_err(canopy_core::Error::from)?;
        self.notify(EventKind::ModeChange, format!("mode changed to {mode}"))
            .await?;
        match mode {
            Mode::Manual => {
                // Freeze everything where it stands and adopt the current
                // positions as the operator's targets.
                for (id, vent) in &self.vents {
                    let guard = vent.lock().await;
                    if let Err(e) = guard.stop().await {
                        warn!(vent = id, error = %e, "stop failed during mode change");
                    }
                    self.user_targets.insert(*id, guard.position());
                }
                self.last_auto_target = None;
                self.persist_vents().await?;
            }
            Mode::Auto => {
                self.last_auto_target = None;
                self.calibrate_all().await?;
            }
        }
        Ok(true)
    }

    async fn set_vent_target(&mut self, id: u32, percent: f64) -> Result<bool> {
        if !self.vents.contains_key(&id) {
            debug!(vent = id, "manual command for unknown vent");
            return Ok(false);
        }
        // An operator command implies manual mode; otherwise the next auto
        // pass would overwrite the target.
        self.set_mode(Mode::Manual).await?;
        let percent = percent.clamp(0.0, 100.0);
        self.user_targets.insert(id, percent);
        self.notify(
            EventKind::ManualAction,
            format!("vent {id} set to {percent:.0}%"),
        )
        .await?;
        // The next manual tick performs the move so the safety clamp always
        // sees current readings.
        self.persist_vents().await?;
        Ok(true)
    }

    async fn set_group_target(&mut self, group: &str, percent: f64) -> Result<bool> {
        let Some(zone) = self.zones.iter().find(|z| z.config.id == group) else {
            debug!(group, "manual command for unknown group");
            return Ok(false);
        };
        let ids = zone.config.vents.clone();
        self.set_mode(Mode::Manual).await?;
        let percent = percent.clamp(0.0, 100.0);
        for id in &ids {
            self.user_targets.insert(*id, percent);
        }
        self.notify(
            EventKind::ManualAction,
            format!("group '{group}' set to {percent:.0}%"),
        )
        .await?;
        self.persist_vents().await?;
        Ok(true)
    }

    async fn set_all_targets(&mut self, percent: f64) -> Result<()> {
        self.set_mode(Mode::Manual).await?;
        let percent = percent.clamp(0.0, 100.0);
        self.notify(
            EventKind::ManualAction,
            format!("all vents set to {percent:.0}%"),
        )
        .await?;
        self.move_all_staged(percent).await
    }

    async fn update_control(&mut self, values: BTreeMap<String, Value>) -> Result<()> {
        self.update_config(ConfigUpdate {
            control: Some(values),
            ..ConfigUpdate::default()
        })
        .await
    }

    /// Apply a reconfiguration between ticks.
    ///
    /// The whole candidate is validated before anything changes; either every
    /// section applies or none does. Rebuilt vents keep their position and
    /// availability, rebuilt zones keep their wind-lock state, matched by id.
    async fn update_config(&mut self, update: ConfigUpdate) -> Result<()> {
        let mut candidate = self.settings.clone();
        if let Some(values) = &update.control {
            for (name, value) in values {
                candidate.control.apply_value(name, value)?;
            }
        }
        let heating_changed = update.heating.is_some();
        if let Some(heating) = update.heating {
            candidate.heating = heating;
        }
        let vents_changed = update.vents.is_some();
        if let Some(vents) = update.vents {
            candidate.vents = vents;
        }
        let groups_changed = update.groups.is_some();
        if let Some(groups) = update.groups {
            candidate.groups = groups;
        }
        if let Some(plan) = update.plan {
            candidate.plan = plan;
        }
        candidate.validate()?;

        // Only control scalars persist; topology reloads from the settings
        // file at the next start.
        if let Some(values) = &update.control {
            for (name, value) in values {
                self.store
                    .set_control_override(name, value)
                    .map_err(canopy_core::Error::from)?;
            }
        }

        if vents_changed {
            let mut vents = BTreeMap::new();
            let mut targets = BTreeMap::new();
            for config in &candidate.vents {
                let mut vent = Vent::new(config, &candidate.vent_defaults, self.sink.clone());
                match self.vents.get(&config.id) {
                    Some(old) => {
                        let old = old.lock().await;
                        vent.restore_position(old.position());
                        vent.set_available(old.is_available());
                        let target = self
                            .user_targets
                            .get(&config.id)
                            .copied()
                            .unwrap_or_else(|| old.position());
                        targets.insert(config.id, target);
                    }
                    None => {
                        targets.insert(config.id, 0.0);
                    }
                }
                vents.insert(config.id, Arc::new(Mutex::new(vent)));
            }
            self.vents = vents;
            self.user_targets = targets;
        }
        if groups_changed {
            let zones: Vec<Zone> = candidate
                .groups
                .iter()
                .map(|g| Zone {
                    config: g.clone(),
                    locked: self
                        .zones
                        .iter()
                        .find(|z| z.config.id == g.id)
                        .and_then(|z| z.locked),
                })
                .collect();
            self.zones = zones;
        }
        if heating_changed {
            self.valve = candidate
                .heating
                .valve
                .clone()
                .map(|v| ThreeWayValve::new(v, self.sink.clone()));
        }
        self.settings = candidate;
        self.schedule.set_hours(
            self.settings.control.flush_hour,
            self.settings.control.calibration_hour,
        );
        // The changed geometry or tunables must produce a fresh placement
        // even when the computed target happens to match the previous one.
        self.last_auto_target = None;
        if vents_changed {
            self.persist_vents().await?;
        }
        info!("configuration updated");
        Ok(())
    }

    async fn handle_fault(&mut self, fault: VentFault) {
        let Some(vent) = self.vents.get(&fault.vent) else {
            warn!(vent = fault.vent, "fault report for unknown vent");
            return;
        };
        let mut guard = vent.lock().await;
        let healthy = !fault.faulted;
        if guard.is_available() != healthy {
            guard.set_available(healthy);
            if fault.faulted {
                warn!(vent = fault.vent, "vent drive reported a fault, excluded from moves");
            } else {
                info!(vent = fault.vent, "vent drive fault cleared");
            }
        }
    }

    /// Record an event and deliver the notification if its category is
    /// enabled.
    async fn notify(&self, kind: EventKind, message: String) -> Result<()> {
        self.events
            .append(kind, &message)
            .map_err(canopy_core::Error::from)?;
        let prefs = self
            .store
            .notification_preferences()
            .map_err(canopy_core::Error::from)?;
        let enabled = prefs.get(kind.category()).copied().unwrap_or(true);
        if enabled {
            let topic = format!("canopy/events/{}", kind.category());
            if let Err(e) = self.sink.publish(&topic, &message).await {
                warn!(error = %e, "notification publish failed");
            }
        }
        Ok(())
    }

    async fn persist_vents(&self) -> Result<()> {
        for (id, vent) in &self.vents {
            let position = vent.lock().await.position();
            let user_target = self.user_targets.get(id).copied().unwrap_or(position);
            self.store
                .set_vent_state(
                    *id,
                    VentState {
                        position,
                        user_target,
                    },
                )
                .map_err(canopy_core::Error::from)?;
        }
        Ok(())
    }

    #[cfg(test)]
    async fn vent_position(&self, id: u32) -> f64 {
        self.vents[&id].lock().await.position()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_core::command::RecordingSink;
    use canopy_core::config::{VentTopics, WindRange};
    use canopy_core::schedule::TimeOfDay;
    use canopy_storage::{MemoryBackend, StateStore};
    use chrono::TimeZone;

    fn vent_config(id: u32) -> VentConfig {
        VentConfig {
            id,
            name: format!("Vent {id}"),
            travel_time_s: 10.0,
            topics: VentTopics {
                up: format!("relay/{id}/up"),
                down: format!("relay/{id}/down"),
                error_in: None,
            },
            reverse_pause_s: Some(0.0),
            min_move_s: Some(0.0),
            calibration_buffer_s: Some(0.0),
            ignore_delta_percent: None,
        }
    }

    fn settings() -> ControllerSettings {
        let mut control = ControlConfig::default();
        control.step_percent = 100.0;
        control.step_delay_s = 0.0;
        ControllerSettings {
            control,
            heating: HeatingConfig::default(),
            vent_defaults: VentDefaults::default(),
            vents: vec![vent_config(1), vent_config(2)],
            groups: vec![],
            plan: PlanConfig::default(),
        }
    }

    struct TestRig {
        controller: Controller,
        handle: ControllerHandle,
        sink: Arc<RecordingSink>,
        harness: HarnessOverrides,
        store: StateStore,
        events: EventLog,
    }

    fn rig(settings: ControllerSettings) -> TestRig {
        let backend = Arc::new(MemoryBackend::new());
        rig_with_store(settings, StateStore::new(backend))
    }

    fn rig_with_store(settings: ControllerSettings, store: StateStore) -> TestRig {
        let sink = Arc::new(RecordingSink::new());
        let harness = HarnessOverrides::new();
        let events = EventLog::new(store.backend());
        let (_fault_tx, faults) = mpsc::channel(8);
        let deps = ControllerDeps {
            store: store.clone(),
            events: events.clone(),
            snapshot: SharedSnapshot::new(5),
            overlay: SerialOverlay::default(),
            harness: harness.clone(),
            sink: sink.clone(),
            faults,
        };
        let (controller, handle) = Controller::new(settings, deps).unwrap();
        TestRig {
            controller,
            handle,
            sink,
            harness,
            store,
            events,
        }
    }

    async fn feed(
        harness: &HarnessOverrides,
        int_temp: f64,
        ext_temp: f64,
        int_hum: f64,
        wind: f64,
    ) {
        harness.set(Metric::InternalTemp, int_temp).await;
        harness.set(Metric::ExternalTemp, ext_temp).await;
        harness.set(Metric::InternalHum, int_hum).await;
        harness.set(Metric::WindSpeed, wind).await;
    }

    fn noon() -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 8, 20, 12, 0, 0).unwrap()
    }

    fn midnight() -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 8, 20, 1, 0, 0).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_proportional_opening_from_excess_temperature() {
        let mut rig = rig(settings());
        // 30 C inside against a 25 C setpoint, gain 5 %/C: 25% open.
        feed(&rig.harness, 30.0, 20.0, 50.0, 2.0).await;
        rig.controller.tick(noon()).await.unwrap();
        assert_eq!(rig.controller.vent_position(1).await, 25.0);
        assert_eq!(rig.controller.vent_position(2).await, 25.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_vent_when_outside_air_works_against_us() {
        let mut rig = rig(settings());
        // Hotter outside than inside: opening would heat the house further.
        feed(&rig.harness, 30.0, 35.0, 50.0, 2.0).await;
        rig.controller.tick(noon()).await.unwrap();
        assert_eq!(rig.controller.vent_position(1).await, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_wind_closes_everything() {
        let mut rig = rig(settings());
        feed(&rig.harness, 30.0, 20.0, 50.0, 25.0).await;
        rig.controller.tick(noon()).await.unwrap();
        assert_eq!(rig.controller.vent_position(1).await, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_risk_wind_caps_opening() {
        let mut rig = rig(settings());
        // Thermal demand of 100% but wind in the risk band caps at 50%.
        feed(&rig.harness, 45.0, 20.0, 50.0, 12.0).await;
        rig.controller.tick(noon()).await.unwrap();
        assert_eq!(rig.controller.vent_position(1).await, 50.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rain_closes_everything() {
        let mut rig = rig(settings());
        feed(&rig.harness, 30.0, 20.0, 50.0, 2.0).await;
        rig.harness.set(Metric::Rain, 1.0).await;
        rig.controller.tick(noon()).await.unwrap();
        assert_eq!(rig.controller.vent_position(1).await, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_humidity_crack_override() {
        let mut settings = settings();
        settings.control.allow_humidity_override = true;
        let mut rig = rig(settings);
        // Critical wind but saturated air: crack open instead of sealing.
        feed(&rig.harness, 30.0, 20.0, 90.0, 25.0).await;
        rig.controller.tick(noon()).await.unwrap();
        assert_eq!(rig.controller.vent_position(1).await, 10.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_humidity_floor() {
        let mut rig = rig(settings());
        // No thermal demand, but the air is too damp to stay closed.
        feed(&rig.harness, 24.0, 20.0, 85.0, 2.0).await;
        rig.controller.tick(noon()).await.unwrap();
        assert_eq!(rig.controller.vent_position(1).await, 20.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_co2_floor_and_single_edge_event() {
        let mut settings = settings();
        settings.control.co2_thr_ppm = Some(800.0);
        settings.control.min_open_co2_percent = Some(50.0);
        let mut rig = rig(settings);
        feed(&rig.harness, 24.0, 20.0, 50.0, 2.0).await;
        rig.harness.set(Metric::InternalCo2, 950.0).await;
        rig.controller.tick(noon()).await.unwrap();
        assert_eq!(rig.controller.vent_position(1).await, 50.0);

        // Repeated ticks above the threshold produce exactly one event.
        rig.controller.tick(noon()).await.unwrap();
        rig.controller.tick(noon()).await.unwrap();
        let events = rig.events.recent(100, None).unwrap();
        let highs = events
            .iter()
            .filter(|e| e.kind == EventKind::Co2High)
            .count();
        assert_eq!(highs, 1);

        // Falling back under the threshold raises the matching edge.
        rig.harness.set(Metric::InternalCo2, 600.0).await;
        rig.controller.tick(noon()).await.unwrap();
        let events = rig.events.recent(100, None).unwrap();
        assert!(events.iter().any(|e| e.kind == EventKind::Co2Normal));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_required_sensor_holds_vents() {
        let mut rig = rig(settings());
        feed(&rig.harness, 30.0, 20.0, 50.0, 2.0).await;
        rig.controller.tick(noon()).await.unwrap();
        assert_eq!(rig.controller.vent_position(1).await, 25.0);

        // Wind drops out: the controller must hold, not move to a guess.
        rig.harness.clear(Metric::WindSpeed).await;
        rig.harness.set(Metric::InternalTemp, 45.0).await;
        rig.sink.clear();
        rig.controller.tick(noon()).await.unwrap();
        assert_eq!(rig.controller.vent_position(1).await, 25.0);
        assert!(rig.sink.published().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_target_does_not_remove() {
        let mut rig = rig(settings());
        feed(&rig.harness, 30.0, 20.0, 50.0, 2.0).await;
        rig.controller.tick(noon()).await.unwrap();
        rig.sink.clear();
        // Same conditions: target unchanged, no relay chatter.
        rig.controller.tick(noon()).await.unwrap();
        assert!(rig.sink.published().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_night_cap_without_heating() {
        let mut settings = settings();
        settings.control.day_start = Some(TimeOfDay::new(6, 0));
        settings.control.night_start = Some(TimeOfDay::new(20, 0));
        let mut rig = rig(settings);
        // Heavy thermal demand at night is capped at 40%.
        feed(&rig.harness, 45.0, 20.0, 50.0, 2.0).await;
        rig.controller.tick(midnight()).await.unwrap();
        assert_eq!(rig.controller.vent_position(1).await, 40.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wind_lock_wrapping_range_and_events() {
        let mut settings = settings();
        settings.groups = vec![GroupConfig {
            id: "south".into(),
            name: "South".into(),
            vents: vec![1],
            wind_upwind_deg: vec![WindRange::from([350.0, 10.0])],
            wind_lock_enabled: true,
            wind_lock_close_percent: None,
        }];
        let mut rig = rig(settings);
        feed(&rig.harness, 30.0, 20.0, 50.0, 2.0).await;
        // Wind from 5 deg sits inside the wrapped 350-10 range.
        rig.harness.set(Metric::WindDirection, 5.0).await;
        rig.controller.tick(noon()).await.unwrap();
        // Vent 1 pinned closed by the lock, vent 2 follows the thermal target.
        assert_eq!(rig.controller.vent_position(1).await, 0.0);
        assert_eq!(rig.controller.vent_position(2).await, 25.0);
        let events = rig.events.recent(100, None).unwrap();
        assert!(events.iter().any(|e| e.kind == EventKind::WindLockOn));

        // Wind swings away: lock releases and the vent rejoins the target.
        rig.harness.set(Metric::WindDirection, 180.0).await;
        rig.controller.tick(noon()).await.unwrap();
        let events = rig.events.recent(100, None).unwrap();
        assert!(events.iter().any(|e| e.kind == EventKind::WindLockOff));
        rig.controller.tick(noon()).await.unwrap();
        assert_eq!(rig.controller.vent_position(1).await, 25.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_mode_freezes_and_adopts_positions() {
        let mut rig = rig(settings());
        feed(&rig.harness, 30.0, 20.0, 50.0, 2.0).await;
        rig.controller.tick(noon()).await.unwrap();
        assert_eq!(rig.controller.vent_position(1).await, 25.0);

        assert!(rig.controller.set_mode(Mode::Manual).await.unwrap());
        assert_eq!(rig.controller.user_targets[&1], 25.0);
        assert_eq!(rig.store.mode().unwrap(), Some(Mode::Manual));

        // Auto logic no longer drives the vents.
        rig.harness.set(Metric::InternalTemp, 45.0).await;
        rig.controller.tick(noon()).await.unwrap();
        assert_eq!(rig.controller.vent_position(1).await, 25.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_target_moves_with_safety_clamp() {
        let mut rig = rig(settings());
        feed(&rig.harness, 24.0, 20.0, 50.0, 2.0).await;
        rig.controller.tick(noon()).await.unwrap();
        rig.controller.set_mode(Mode::Manual).await.unwrap();

        assert!(rig.controller.set_vent_target(1, 80.0).await.unwrap());
        rig.controller.tick(noon()).await.unwrap();
        assert_eq!(rig.controller.vent_position(1).await, 80.0);

        // A storm overrides the operator's wish on the next tick.
        rig.harness.set(Metric::WindSpeed, 25.0).await;
        rig.controller.tick(noon()).await.unwrap();
        assert_eq!(rig.controller.vent_position(1).await, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_group_target_moves_its_vents_only() {
        let mut settings = settings();
        settings.groups = vec![GroupConfig {
            id: "south".into(),
            name: "South".into(),
            vents: vec![1],
            wind_upwind_deg: vec![],
            wind_lock_enabled: true,
            wind_lock_close_percent: None,
        }];
        let mut rig = rig(settings);
        feed(&rig.harness, 24.0, 20.0, 50.0, 2.0).await;
        rig.controller.tick(noon()).await.unwrap();
        rig.controller.set_mode(Mode::Manual).await.unwrap();

        assert!(!rig.controller.set_group_target("ghost", 60.0).await.unwrap());
        assert!(rig.controller.set_group_target("south", 60.0).await.unwrap());
        rig.controller.tick(noon()).await.unwrap();
        assert_eq!(rig.controller.vent_position(1).await, 60.0);
        assert_eq!(rig.controller.vent_position(2).await, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_command_for_unknown_vent_is_refused() {
        let mut rig = rig(settings());
        assert!(!rig.controller.set_vent_target(99, 50.0).await.unwrap());
        // A refused command must not switch the mode either.
        assert_eq!(rig.controller.mode(), Mode::Auto);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_command_in_auto_switches_to_manual() {
        let mut rig = rig(settings());
        feed(&rig.harness, 30.0, 20.0, 50.0, 2.0).await;
        rig.controller.tick(noon()).await.unwrap();
        assert_eq!(rig.controller.mode(), Mode::Auto);

        assert!(rig.controller.set_vent_target(1, 80.0).await.unwrap());
        assert_eq!(rig.controller.mode(), Mode::Manual);
        assert_eq!(rig.store.mode().unwrap(), Some(Mode::Manual));

        // The operator's target takes effect instead of being overwritten
        // by the next auto pass.
        rig.controller.tick(noon()).await.unwrap();
        assert_eq!(rig.controller.vent_position(1).await, 80.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_humidity_crack_overrides_lower_target() {
        let mut settings = settings();
        settings.control.allow_humidity_override = true;
        settings.control.min_open_hum_percent = 5.0;
        let mut rig = rig(settings);
        // No thermal demand and a small humidity floor: the crack is an
        // absolute position and must still open fully to it.
        feed(&rig.harness, 24.0, 20.0, 90.0, 25.0).await;
        rig.controller.tick(noon()).await.unwrap();
        assert_eq!(rig.controller.vent_position(1).await, 10.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_calibration_skips_unavailable_vents() {
        let mut rig = rig(settings());
        feed(&rig.harness, 30.0, 20.0, 50.0, 2.0).await;
        rig.controller.tick(noon()).await.unwrap();
        rig.controller
            .handle_fault(VentFault {
                vent: 1,
                faulted: true,
            })
            .await;
        rig.sink.clear();
        rig.controller.calibrate_all().await.unwrap();
        assert_eq!(rig.controller.vent_position(1).await, 25.0);
        assert_eq!(rig.controller.vent_position(2).await, 0.0);
        assert!(rig.sink.payloads_for("relay/1/down").is_empty());
        assert_eq!(rig.controller.user_targets[&1], 25.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_config_rebuilds_vents_keeping_positions() {
        let mut rig = rig(settings());
        feed(&rig.harness, 30.0, 20.0, 50.0, 2.0).await;
        rig.controller.tick(noon()).await.unwrap();
        rig.controller
            .handle_fault(VentFault {
                vent: 2,
                faulted: true,
            })
            .await;

        let update = ConfigUpdate {
            vents: Some(vec![vent_config(1), vent_config(2), vent_config(3)]),
            ..ConfigUpdate::default()
        };
        rig.controller.update_config(update).await.unwrap();
        // Kept vents carry position and availability; the new one starts
        // closed.
        assert_eq!(rig.controller.vent_position(1).await, 25.0);
        assert!(!rig.controller.vents[&2].lock().await.is_available());
        assert_eq!(rig.controller.vent_position(3).await, 0.0);

        // The next pass drives the newcomer to the computed target.
        rig.controller.tick(noon()).await.unwrap();
        assert_eq!(rig.controller.vent_position(3).await, 25.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_config_carries_wind_lock_state() {
        let mut settings = settings();
        settings.groups = vec![GroupConfig {
            id: "south".into(),
            name: "South".into(),
            vents: vec![1],
            wind_upwind_deg: vec![WindRange::from([350.0, 10.0])],
            wind_lock_enabled: true,
            wind_lock_close_percent: None,
        }];
        let mut rig = rig(settings);
        feed(&rig.harness, 30.0, 20.0, 50.0, 2.0).await;
        rig.harness.set(Metric::WindDirection, 5.0).await;
        rig.controller.tick(noon()).await.unwrap();
        assert_eq!(rig.controller.vent_position(1).await, 0.0);

        // Reconfigure the group while no wind reading is present: the lock
        // state must carry over by id.
        rig.harness.clear(Metric::WindDirection).await;
        let update = ConfigUpdate {
            groups: Some(vec![GroupConfig {
                id: "south".into(),
                name: "South side".into(),
                vents: vec![1],
                wind_upwind_deg: vec![WindRange::from([350.0, 10.0])],
                wind_lock_enabled: true,
                wind_lock_close_percent: Some(0.0),
            }]),
            ..ConfigUpdate::default()
        };
        rig.controller.update_config(update).await.unwrap();
        rig.controller.tick(noon()).await.unwrap();
        // Vent 1 stays pinned, vent 2 follows the thermal target.
        assert_eq!(rig.controller.vent_position(1).await, 0.0);
        assert_eq!(rig.controller.vent_position(2).await, 25.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_config_rejects_invalid_batch_atomically() {
        let mut rig = rig(settings());
        let update = ConfigUpdate {
            vents: Some(vec![vent_config(1)]),
            groups: Some(vec![GroupConfig {
                id: "south".into(),
                name: "South".into(),
                vents: vec![7],
                wind_upwind_deg: vec![],
                wind_lock_enabled: true,
                wind_lock_close_percent: None,
            }]),
            ..ConfigUpdate::default()
        };
        assert!(rig.controller.update_config(update).await.is_err());
        // Nothing was applied.
        assert_eq!(rig.controller.settings.vents.len(), 2);
        assert!(rig.controller.zones.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_back_to_auto_calibrates() {
        let mut rig = rig(settings());
        feed(&rig.harness, 30.0, 20.0, 50.0, 2.0).await;
        rig.controller.tick(noon()).await.unwrap();
        rig.controller.set_mode(Mode::Manual).await.unwrap();
        rig.controller.set_mode(Mode::Auto).await.unwrap();
        // Calibration drives everything to a known zero.
        assert_eq!(rig.controller.vent_position(1).await, 0.0);
        assert!(rig.controller.last_auto_target.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_persisted_manual_mode_boots_as_auto() {
        let backend = Arc::new(MemoryBackend::new());
        let store = StateStore::new(backend);
        store.set_mode(Mode::Manual).unwrap();
        let rig = rig_with_store(settings(), store);
        assert_eq!(rig.controller.mode(), Mode::Auto);
        assert_eq!(rig.store.mode().unwrap(), Some(Mode::Auto));
    }

    #[tokio::test(start_paused = true)]
    async fn test_positions_restored_from_store() {
        let backend = Arc::new(MemoryBackend::new());
        let store = StateStore::new(backend);
        store
            .set_vent_state(
                1,
                VentState {
                    position: 60.0,
                    user_target: 60.0,
                },
            )
            .unwrap();
        let rig = rig_with_store(settings(), store);
        assert_eq!(rig.controller.vent_position(1).await, 60.0);
        assert_eq!(rig.controller.vent_position(2).await, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_control_rejects_batch_on_one_bad_field() {
        let mut rig = rig(settings());
        let mut values = BTreeMap::new();
        values.insert("wind_crit_ms".to_string(), serde_json::json!(15.0));
        values.insert("humidity_thr".to_string(), serde_json::json!(400.0));
        let err = rig.controller.update_control(values).await.unwrap_err();
        assert!(err.to_string().contains("humidity_thr"));
        // The valid field must not have been applied either.
        assert_eq!(rig.controller.settings.control.wind_crit_ms, 20.0);
        assert!(rig.store.control_overrides().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_control_overrides_survive_restart() {
        let backend = Arc::new(MemoryBackend::new());
        let store = StateStore::new(backend);
        {
            let mut rig = rig_with_store(settings(), store.clone());
            let mut values = BTreeMap::new();
            values.insert("wind_crit_ms".to_string(), serde_json::json!(15.0));
            rig.controller.update_control(values).await.unwrap();
        }
        let rig = rig_with_store(settings(), store);
        assert_eq!(rig.controller.settings.control.wind_crit_ms, 15.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heating_hysteresis_transitions_only() {
        let mut settings = settings();
        settings.heating = HeatingConfig {
            enabled: true,
            topic: Some("heating/switch".into()),
            day_target_c: Some(18.0),
            hysteresis_c: Some(2.0),
            ..HeatingConfig::default()
        };
        let mut rig = rig(settings);
        rig.harness.set(Metric::InternalTemp, 15.0).await;
        rig.controller.tick(noon()).await.unwrap();
        assert_eq!(
            rig.sink.payloads_for("heating/switch"),
            vec!["ON".to_string()]
        );

        // Inside the band: no chatter.
        rig.harness.set(Metric::InternalTemp, 17.0).await;
        rig.controller.tick(noon()).await.unwrap();
        assert_eq!(rig.sink.payloads_for("heating/switch").len(), 1);

        // Reaching the target turns it off, once.
        rig.harness.set(Metric::InternalTemp, 18.2).await;
        rig.controller.tick(noon()).await.unwrap();
        rig.controller.tick(noon()).await.unwrap();
        assert_eq!(
            rig.sink.payloads_for("heating/switch"),
            vec!["ON".to_string(), "OFF".to_string()]
        );
        let events = rig.events.recent(100, None).unwrap();
        assert!(events.iter().any(|e| e.kind == EventKind::HeatingOn));
        assert!(events.iter().any(|e| e.kind == EventKind::HeatingOff));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabling_heating_turns_it_off() {
        let mut settings = settings();
        settings.heating = HeatingConfig {
            enabled: true,
            topic: Some("heating/switch".into()),
            day_target_c: Some(18.0),
            ..HeatingConfig::default()
        };
        let mut rig = rig(settings);
        rig.harness.set(Metric::InternalTemp, 10.0).await;
        rig.controller.tick(noon()).await.unwrap();
        assert!(rig.controller.heating_on);

        rig.controller.settings.heating.enabled = false;
        rig.controller.tick(noon()).await.unwrap();
        assert!(!rig.controller.heating_on);
        assert_eq!(
            rig.sink.payloads_for("heating/switch"),
            vec!["ON".to_string(), "OFF".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_vent_fault_excludes_vent_until_cleared() {
        let mut rig = rig(settings());
        rig.controller
            .handle_fault(VentFault {
                vent: 1,
                faulted: true,
            })
            .await;
        feed(&rig.harness, 30.0, 20.0, 50.0, 2.0).await;
        rig.controller.tick(noon()).await.unwrap();
        assert_eq!(rig.controller.vent_position(1).await, 0.0);
        assert_eq!(rig.controller.vent_position(2).await, 25.0);

        rig.controller
            .handle_fault(VentFault {
                vent: 1,
                faulted: false,
            })
            .await;
        rig.harness.set(Metric::InternalTemp, 32.0).await;
        rig.controller.tick(noon()).await.unwrap();
        assert_eq!(rig.controller.vent_position(1).await, 35.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_daily_flush_opens_everything() {
        let mut rig = rig(settings());
        feed(&rig.harness, 24.0, 20.0, 50.0, 2.0).await;
        rig.controller.tick(noon()).await.unwrap();
        rig.controller.run_task(DailyTask::Flush).await;
        assert_eq!(rig.controller.vent_position(1).await, 100.0);
        assert_eq!(rig.controller.vent_position(2).await, 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_notification_preference_gates_delivery() {
        let mut settings = settings();
        settings.control.co2_thr_ppm = Some(800.0);
        let mut rig = rig(settings);
        let mut prefs = rig.store.notification_preferences().unwrap();
        prefs.insert("environment".to_string(), false);
        rig.store.set_notification_preferences(&prefs).unwrap();

        feed(&rig.harness, 24.0, 20.0, 50.0, 2.0).await;
        rig.harness.set(Metric::InternalCo2, 950.0).await;
        rig.controller.tick(noon()).await.unwrap();

        // The event is still recorded, but nothing is published for it.
        let events = rig.events.recent(100, None).unwrap();
        assert!(events.iter().any(|e| e.kind == EventKind::Co2High));
        assert!(rig
            .sink
            .payloads_for("canopy/events/environment")
            .is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_round_trip() {
        let rig = rig(settings());
        let handle = rig.handle.clone();
        let mut controller = rig.controller;
        let task = tokio::spawn(async move {
            // Serve exactly two commands, then hand the controller back.
            for _ in 0..2 {
                if let Some(cmd) = controller.commands.recv().await {
                    controller.handle_command(cmd).await;
                }
            }
            controller
        });
        assert!(!handle.set_vent(99, 50.0).await);
        assert!(handle.set_vent(1, 50.0).await);
        let controller = task.await.unwrap();
        assert_eq!(controller.user_targets[&1], 50.0);
    }
}
