//! Coordinator: wires the links, the mapping store, the reassembler and
//! the state machine into one event loop
//!
//! All component events funnel into two channels (CAN and printer). The
//! loop consumes them in arrival order, drives the state machine, and turns
//! accepted transitions into I/O through a pure action planner: the
//! transition record plus the current snapshot and mapping produce a list
//! of [`Action`]s, which are then executed sequentially. An action failure
//! sends the machine to ERROR with a structured reason.
//!
//! The loop also owns the filament-bitmap protocol, printer-state
//! forwarding to the cabinet, the CAN-reconnect re-sync, the periodic state
//! audit, and the RFID session sweep.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::can::frame::CabinetCommand;
use crate::can::{CanEvent, CanLink, CanLinkConfig};
use crate::common::{
    HubError, HubResult, ShutdownReceiver, ShutdownSender, StateMachine, StatePayload, SystemState,
    Transition,
};
use crate::config::Config;
use crate::klipper::{
    KlipperEvent, KlipperHandle, KlipperLink, KlipperLinkConfig, PrintState, PrinterSnapshot,
    SensorBinding,
};
use crate::mapping::{MappingStore, TubeMapping};
use crate::rfid::{RfidOutcome, RfidReassembler};
use crate::spoolman::SpoolmanClient;

/// Extruder temperature above which the resume sequence primes filament
const PRIME_MIN_TEMP_C: f64 = 175.0;
/// Prime extrusion: relative mode, 100 mm push, back to absolute
const PRIME_GCODE: [&str; 3] = ["G91", "G1 E100 F600", "G90"];

/// Settle time after a resubscribe before the snapshot is trusted
const RESYNC_SETTLE: Duration = Duration::from_secs(1);
/// Divergence check between the forwarded state and the snapshot
const STATE_AUDIT_PERIOD: Duration = Duration::from_secs(60);
/// RFID session sweep cadence
const RFID_SWEEP_PERIOD: Duration = Duration::from_secs(2);

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// I/O steps produced by the action planner for one transition
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    PausePrint,
    ResumePrint,
    SendGcode(String),
    SendCan(CabinetCommand),
    /// Chain into a follow-up transition once the preceding actions ran
    TransitionTo(SystemState, StatePayload),
}

/// Pure action planner: what to do on entry to `transition.new`.
pub fn plan_actions(
    transition: &Transition,
    snapshot: &PrinterSnapshot,
    mapping: TubeMapping,
    bindings: &[SensorBinding],
) -> Vec<Action> {
    match transition.new {
        // runout detected: get the printer paused, feed follows from PAUSED
        SystemState::Runout => vec![Action::PausePrint],

        // on pause, feed whenever the concerned extruder's tube is empty;
        // this also covers user pauses that coincide with an empty tube
        SystemState::Paused => {
            let extruder = transition
                .payload
                .extruder
                .unwrap_or(snapshot.active_extruder);
            let sensor_empty = bindings
                .iter()
                .find(|binding| binding.extruder == extruder)
                .map(|binding| snapshot.sensor_present(&binding.name) != Some(true))
                .unwrap_or(false);
            if !sensor_empty {
                return Vec::new();
            }
            match mapping.tube_for_extruder(extruder) {
                Some(tube) => vec![
                    Action::SendCan(CabinetCommand::RequestFeed { tube }),
                    Action::TransitionTo(SystemState::Feeding, StatePayload::extruder(extruder)),
                ],
                None => {
                    warn!(extruder, "no tube mapped, cannot request feed");
                    Vec::new()
                }
            }
        }

        // filament is back: prime if the nozzle is hot, then resume
        SystemState::Resuming => {
            let mut actions = Vec::new();
            if snapshot.active_extruder_status().temperature > PRIME_MIN_TEMP_C {
                for gcode in PRIME_GCODE {
                    actions.push(Action::SendGcode(gcode.to_string()));
                }
            }
            actions.push(Action::ResumePrint);
            actions
        }

        SystemState::Error => vec![Action::SendCan(CabinetCommand::PrinterError {
            extruder: snapshot.active_extruder,
        })],

        _ => Vec::new(),
    }
}

/// Bitmap with bit `t` set iff the extruder mapped to tube `t` has filament.
pub fn filament_bitmap(
    snapshot: &PrinterSnapshot,
    bindings: &[SensorBinding],
    mapping: TubeMapping,
) -> u8 {
    let mut bitmap = 0u8;
    for binding in bindings {
        if snapshot.sensor_present(&binding.name) == Some(true) {
            if let Some(tube) = mapping.tube_for_extruder(binding.extruder) {
                bitmap |= 1 << tube;
            }
        }
    }
    bitmap
}

/// CAN announcement for a printer state, if one is defined for it.
pub fn can_command_for_state(state: PrintState, extruder: u8) -> Option<CabinetCommand> {
    match state {
        PrintState::Printing => Some(CabinetCommand::Printing { extruder }),
        PrintState::Paused => Some(CabinetCommand::PrintPause { extruder }),
        PrintState::Complete => Some(CabinetCommand::PrintComplete { extruder }),
        PrintState::Cancelled => Some(CabinetCommand::PrintCancel { extruder }),
        PrintState::Standby | PrintState::Ready => Some(CabinetCommand::PrinterIdle { extruder }),
        PrintState::Error => Some(CabinetCommand::PrinterError { extruder }),
        PrintState::Unknown => None,
    }
}

/// The coordinator component.
pub struct Coordinator {
    config: Config,
    bindings: Vec<SensorBinding>,
    machine: StateMachine,
    can: CanLink,
    can_rx: mpsc::Receiver<CanEvent>,
    klipper_link: Option<KlipperLink>,
    klipper: Option<KlipperHandle>,
    klipper_rx: mpsc::Receiver<KlipperEvent>,
    mapping: MappingStore,
    rfid: RfidReassembler,
    spoolman: Option<SpoolmanClient>,
    /// Last printer state announced on CAN; `Unknown` forces a re-announce
    last_announced: PrintState,
    /// Last seen sensor values, for change detection
    last_sensors: HashMap<String, bool>,
    /// Set on printer reconnect so the first status burst pushes a bitmap
    /// even when no sensor value changed
    bitmap_resync_pending: bool,
}

impl Coordinator {
    pub fn new(config: Config, config_path: Option<PathBuf>, shutdown: ShutdownSender) -> Self {
        let (can_tx, can_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (klipper_tx, klipper_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let can = CanLink::new(
            CanLinkConfig::new(&config.can.interface),
            can_tx,
            shutdown.clone(),
        );
        let klipper_config = KlipperLinkConfig::from_config(&config);
        let bindings = klipper_config.sensors.clone();
        let klipper_link = KlipperLink::new(klipper_config, klipper_tx);
        let mapping = MappingStore::from_config(&config, config_path);
        let spoolman = config
            .spoolman
            .enabled
            .then(|| SpoolmanClient::from_config(&config.spoolman));

        Self {
            config,
            bindings,
            machine: StateMachine::new(),
            can,
            can_rx,
            klipper_link: Some(klipper_link),
            klipper: None,
            klipper_rx,
            mapping,
            rfid: RfidReassembler::default(),
            spoolman,
            last_announced: PrintState::Unknown,
            last_sensors: HashMap::new(),
            bitmap_resync_pending: false,
        }
    }

    fn printer(&self) -> &KlipperHandle {
        self.klipper.as_ref().expect("printer link started in run()")
    }

    /// Bring the links up and run the event loop until shutdown.
    pub async fn run(mut self, mut shutdown: ShutdownReceiver) -> HubResult<()> {
        // printer link dials and reconnects on its own
        let link = self
            .klipper_link
            .take()
            .ok_or_else(|| HubError::other("printer link already started"))?;
        self.klipper = Some(link.start(shutdown.resubscribe()));

        // CAN is brought up here; a failure hands over to the reconnect
        // driver instead of aborting startup
        match self.can.connect().await {
            Ok(()) => {
                let _ = self
                    .can
                    .send(CabinetCommand::PrinterIdle {
                        extruder: self.config.extruders.active,
                    })
                    .await;
            }
            Err(err) => {
                warn!(error = %err, "initial CAN connect failed, reconnect driver takes over");
                self.can.trigger_reconnect();
            }
        }

        self.machine.transition_to(SystemState::Idle, StatePayload::none());
        info!("coordinator started, entering idle");

        let mut audit_tick = tokio::time::interval(STATE_AUDIT_PERIOD);
        audit_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        audit_tick.reset();
        let mut sweep_tick = tokio::time::interval(RFID_SWEEP_PERIOD);
        sweep_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    info!("coordinator received shutdown signal");
                    break;
                }

                Some(event) = self.can_rx.recv() => {
                    self.handle_can_event(event).await;
                }

                Some(event) = self.klipper_rx.recv() => {
                    self.handle_klipper_event(event).await;
                }

                _ = sweep_tick.tick() => {
                    self.rfid.sweep_expired();
                }

                _ = audit_tick.tick() => {
                    self.audit_state_sync().await;
                }
            }
        }

        self.machine
            .transition_to(SystemState::Disconnected, StatePayload::none());
        self.printer().disconnect().await;
        self.can.disconnect().await;
        info!("coordinator stopped");
        Ok(())
    }

    async fn handle_can_event(&mut self, event: CanEvent) {
        match event {
            CanEvent::Status(report) => {
                debug!(
                    status = %report.cabinet_status(),
                    progress = report.progress,
                    error_code = report.error_code,
                    "cabinet status"
                );
            }
            CanEvent::FilamentQuery => {
                self.send_filament_bitmap("cabinet query").await;
            }
            CanEvent::MappingSet { left, right } => {
                self.handle_mapping_set(left, right).await;
            }
            CanEvent::Rfid(data) => {
                if let Some(outcome) = self.rfid.handle_frame(&data) {
                    self.handle_rfid_outcome(outcome).await;
                }
            }
            CanEvent::Reconnected => {
                self.resync_after_can_reconnect().await;
            }
        }
    }

    async fn handle_klipper_event(&mut self, event: KlipperEvent) {
        match event {
            KlipperEvent::Connected => {
                info!("printer link up");
                self.bitmap_resync_pending = true;
            }
            KlipperEvent::Disconnected => {
                warn!("printer link down, clearing state cache");
                // force a fresh announce once the status burst returns
                self.last_announced = PrintState::Unknown;
            }
            KlipperEvent::Status(status) => {
                self.handle_status_update(&status).await;
            }
        }
    }

    /// One raw status map: forward state changes to the cabinet, drive the
    /// machine, detect sensor changes and runouts.
    async fn handle_status_update(&mut self, status: &serde_json::Map<String, serde_json::Value>) {
        let snapshot = self.printer().snapshot();

        // printer state forwarding, exactly once per change
        let reported = status
            .get("print_stats")
            .and_then(|stats| stats.get("state"))
            .and_then(serde_json::Value::as_str)
            .map(PrintState::parse);
        if let Some(new_state) = reported {
            if new_state != PrintState::Unknown && new_state != self.last_announced {
                info!(from = %self.last_announced, to = %new_state, "printer state change");
                self.last_announced = new_state;
                self.announce_printer_state(new_state, snapshot.active_extruder)
                    .await;
                self.drive_machine_for_state(new_state).await;
            }
        }

        // sensor edge detection → proactive bitmap notification
        let mut sensors_changed = false;
        for binding in self.bindings.clone() {
            let Some(detected) = status
                .get(&binding.object)
                .and_then(|sensor| sensor.get("filament_detected"))
                .and_then(serde_json::Value::as_bool)
            else {
                continue;
            };
            let previous = self.last_sensors.insert(binding.name.clone(), detected);
            if previous == Some(detected) {
                continue;
            }
            sensors_changed = true;
            info!(sensor = %binding.name, detected, "filament sensor change");
            self.handle_sensor_edge(&binding, detected, &snapshot).await;
        }
        if sensors_changed {
            self.bitmap_resync_pending = false;
            self.send_filament_bitmap("sensor change").await;
        } else if self.bitmap_resync_pending && !self.last_sensors.is_empty() {
            // first burst after a printer reconnect: push the bitmap even
            // though no value changed, so the cabinet re-syncs
            self.bitmap_resync_pending = false;
            self.send_filament_bitmap("printer reconnect").await;
        }
    }

    /// React to one sensor value change according to the current state.
    async fn handle_sensor_edge(
        &mut self,
        binding: &SensorBinding,
        detected: bool,
        snapshot: &PrinterSnapshot,
    ) {
        if !self.config.filament_runout.enabled {
            return;
        }

        if !detected && self.machine.is_state(SystemState::Printing) {
            if binding.extruder == snapshot.active_extruder {
                let transition = self
                    .machine
                    .transition_to(SystemState::Runout, StatePayload::extruder(binding.extruder));
                if let Some(transition) = transition {
                    self.apply_transition(transition).await;
                }
            } else {
                // logged only, never a transition
                info!(
                    extruder = binding.extruder,
                    active = snapshot.active_extruder,
                    "runout on non-active extruder, ignoring"
                );
            }
        }

        if detected && self.machine.is_state(SystemState::Feeding) {
            let feeding_extruder = self.machine.payload().extruder;
            if feeding_extruder == Some(binding.extruder) {
                let transition = self
                    .machine
                    .transition_to(SystemState::Resuming, StatePayload::extruder(binding.extruder));
                if let Some(transition) = transition {
                    self.apply_transition(transition).await;
                }
            }
        }
    }

    /// Map a reported printer state onto a machine transition request. The
    /// machine's admissibility table does the filtering.
    async fn drive_machine_for_state(&mut self, state: PrintState) {
        let requested = match state {
            PrintState::Printing => Some((SystemState::Printing, StatePayload::none())),
            // carry the payload so a runout's extruder survives into PAUSED
            PrintState::Paused => Some((SystemState::Paused, self.machine.payload().clone())),
            PrintState::Complete | PrintState::Cancelled => {
                Some((SystemState::Idle, StatePayload::none()))
            }
            PrintState::Error => Some((
                SystemState::Error,
                StatePayload::reason("printer reported an error"),
            )),
            PrintState::Standby | PrintState::Ready => self
                .machine
                .is_state(SystemState::Error)
                .then(|| (SystemState::Idle, StatePayload::none())),
            PrintState::Unknown => None,
        };

        if let Some((target, payload)) = requested {
            if let Some(transition) = self.machine.transition_to(target, payload) {
                self.apply_transition(transition).await;
            }
        }
    }

    /// Run the post-transition handler: plan actions, execute them, chain
    /// follow-up transitions, and fall into ERROR on action failure.
    async fn apply_transition(&mut self, transition: Transition) {
        let mut queue = vec![transition];
        while let Some(transition) = queue.pop() {
            let snapshot = self.printer().snapshot();
            let actions = plan_actions(&transition, &snapshot, self.mapping.get(), &self.bindings);
            debug!(from = %transition.old, to = %transition.new, ?actions, "executing transition actions");

            for action in actions {
                match self.execute_action(action).await {
                    Ok(Some(follow_up)) => {
                        if let Some(next) = self.machine.transition_to(follow_up.0, follow_up.1) {
                            queue.push(next);
                        }
                    }
                    Ok(None) => {}
                    Err(reason) => {
                        warn!(reason = %reason, "transition action failed");
                        if let Some(next) = self
                            .machine
                            .transition_to(SystemState::Error, StatePayload::reason(reason))
                        {
                            queue.push(next);
                        }
                        break;
                    }
                }
            }
        }
    }

    async fn execute_action(
        &mut self,
        action: Action,
    ) -> Result<Option<(SystemState, StatePayload)>, String> {
        match action {
            Action::PausePrint => self
                .printer()
                .pause()
                .await
                .map(|_| None)
                .map_err(|err| format!("failed to pause print: {err}")),
            Action::ResumePrint => self
                .printer()
                .resume()
                .await
                .map(|_| None)
                .map_err(|err| format!("failed to resume print: {err}")),
            Action::SendGcode(script) => self
                .printer()
                .send_gcode(&script)
                .await
                .map(|_| None)
                .map_err(|err| format!("failed to send {script}: {err}")),
            Action::SendCan(command) => self
                .can
                .send(command)
                .await
                .map(|_| None)
                .map_err(|err| format!("failed to send {command}: {err}")),
            Action::TransitionTo(state, payload) => Ok(Some((state, payload))),
        }
    }

    /// Announce a printer state change on the CAN side, once.
    async fn announce_printer_state(&mut self, state: PrintState, extruder: u8) {
        let Some(command) = can_command_for_state(state, extruder) else {
            return;
        };
        if let Err(err) = self.can.send(command).await {
            warn!(error = %err, %state, "failed to announce printer state");
        }
    }

    /// Emit the filament bitmap. With the printer link down the response is
    /// explicitly invalid so the cabinet never trusts stale data.
    async fn send_filament_bitmap(&mut self, reason: &str) {
        let response = if self.printer().is_connected() {
            let snapshot = self.printer().snapshot();
            let bitmap = filament_bitmap(&snapshot, &self.bindings, self.mapping.get());
            CabinetCommand::FilamentStatusResponse {
                valid: true,
                bitmap,
            }
        } else {
            CabinetCommand::FilamentStatusResponse {
                valid: false,
                bitmap: 0,
            }
        };
        info!(reason, %response, "sending filament status");
        if let Err(err) = self.can.send(response).await {
            warn!(error = %err, "failed to send filament status");
        }
    }

    /// Apply a cabinet-initiated mapping change, acknowledge it, and
    /// re-emit the bitmap under the new mapping.
    async fn handle_mapping_set(&mut self, left: u8, right: u8) {
        let (status, accepted) = match self.mapping.set_from_remote(left, right) {
            Ok(_) => (0u8, true),
            Err(err) => {
                warn!(error = %err, left, right, "mapping set failed");
                (1u8, false)
            }
        };

        let response = CabinetCommand::FeederMappingResponse {
            left,
            right,
            status,
        };
        if let Err(err) = self.can.send(response).await {
            warn!(error = %err, "failed to acknowledge mapping set");
            return;
        }
        if accepted {
            // the cabinet re-indexes tubes under the new assignment
            self.send_filament_bitmap("mapping updated").await;
        }
    }

    /// After the CAN link comes back: align the mapping, force a fresh
    /// status burst, then re-announce printer state and bitmap.
    async fn resync_after_can_reconnect(&mut self) {
        info!("CAN link restored, resyncing cabinet");
        if let Err(err) = self.can.send(CabinetCommand::QueryFeederMapping).await {
            warn!(error = %err, "mapping query after reconnect failed");
        }

        if !self.printer().is_connected() {
            // the printer link's own reconnect will push status when ready
            warn!("printer link down, skipping state resync");
            return;
        }

        if let Err(err) = self.printer().resubscribe().await {
            warn!(error = %err, "resubscribe after CAN reconnect failed");
        }
        tokio::time::sleep(RESYNC_SETTLE).await;

        let snapshot = self.printer().snapshot();
        if snapshot.print_state != PrintState::Unknown {
            self.last_announced = snapshot.print_state;
            self.announce_printer_state(snapshot.print_state, snapshot.active_extruder)
                .await;
            // a recovered printer clears a stale ERROR
            if matches!(
                snapshot.print_state,
                PrintState::Standby | PrintState::Ready
            ) && self.machine.is_state(SystemState::Error)
            {
                if let Some(transition) = self
                    .machine
                    .transition_to(SystemState::Idle, StatePayload::none())
                {
                    self.apply_transition(transition).await;
                }
            }
        }
        self.send_filament_bitmap("CAN reconnect").await;
    }

    /// Periodic divergence check between what was announced to the cabinet
    /// and what the snapshot holds; on mismatch, resubscribe and re-send.
    async fn audit_state_sync(&mut self) {
        if !self.printer().is_connected() {
            return;
        }
        let snapshot = self.printer().snapshot();
        if snapshot.print_state == PrintState::Unknown
            || snapshot.print_state == self.last_announced
        {
            return;
        }

        warn!(
            announced = %self.last_announced,
            cached = %snapshot.print_state,
            "state divergence detected, resyncing"
        );
        if let Err(err) = self.printer().resubscribe().await {
            warn!(error = %err, "resubscribe during audit failed");
            return;
        }
        tokio::time::sleep(RESYNC_SETTLE).await;

        let snapshot = self.printer().snapshot();
        if snapshot.print_state != PrintState::Unknown {
            self.last_announced = snapshot.print_state;
            self.announce_printer_state(snapshot.print_state, snapshot.active_extruder)
                .await;
        }
    }

    /// Completed records go to the archive directory, optionally set the
    /// nozzle temperature, and are uploaded to Spoolman in the background.
    async fn handle_rfid_outcome(&mut self, outcome: RfidOutcome) {
        let RfidOutcome::Complete {
            extruder, record, ..
        } = outcome
        else {
            return;
        };
        if !self.config.rfid.enabled {
            return;
        }

        if let Some(data_dir) = &self.config.rfid.data_dir {
            let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
            let path = data_dir.join(format!("rfid_extruder{extruder}_{stamp}.json"));
            let written = std::fs::create_dir_all(data_dir)
                .and_then(|_| serde_json::to_vec_pretty(&record).map_err(std::io::Error::other))
                .and_then(|body| std::fs::write(&path, body));
            match written {
                Ok(()) => info!(path = %path.display(), "RFID record archived"),
                Err(err) => warn!(error = %err, "failed to archive RFID record"),
            }
        }

        if self.config.rfid.auto_set_temperature && record.print_temp_c > 0 {
            let heater = if extruder == 0 {
                "extruder".to_string()
            } else {
                format!("extruder{extruder}")
            };
            let script = format!(
                "SET_HEATER_TEMPERATURE HEATER={heater} TARGET={}",
                record.print_temp_c
            );
            if let Err(err) = self.printer().send_gcode(&script).await {
                warn!(error = %err, "failed to apply tag temperature");
            }
        }

        if self.config.spoolman.auto_sync_rfid {
            if let Some(client) = self.spoolman.clone() {
                let record = record.clone();
                tokio::spawn(async move {
                    if let Err(err) = client.sync(&record).await {
                        warn!(error = %err, "Spoolman sync failed");
                    }
                });
            }
        }
    }
}
