use std::collections::VecDeque;

use log::{debug, info, warn};
use serde::Serialize;
use serde_json::Value;

use crate::{
    clock::Millis,
    command::{CommandDispatcher, CommandOutcome, CommandRequest},
    config::{RuntimeConfig, TimingConfig},
    connectivity::{AttemptPolicy, ConnectivitySupervisor, Transport},
    devices::{DeviceModel, DeviceState},
    error::PublishError,
    identity::DeviceIdentity,
    input::{Debounce, InputFlag},
    ota::{OtaRequest, OtaState, OtaStateMachine, OtaTransport},
    persistence::{NvStore, StatePersistence},
    scheduler::HeartbeatScheduler,
    session::{Credentials, MqttClient, MqttSessionManager, Route},
    system::System,
    topics::{TopicKind, TopicSet},
    types::{ConnectivityState, OnlinePayload, StatePayload, StatusPayload, VersionReport},
};

/// The capabilities one board (or the host simulation) provides.
pub trait Platform {
    type Transport: Transport;
    type Mqtt: MqttClient;
    type Store: NvStore;
    type Ota: OtaTransport;
    type System: System;
}

pub struct PlatformParts<P: Platform> {
    pub transport: P::Transport,
    pub mqtt: P::Mqtt,
    pub store: P::Store,
    pub ota: P::Ota,
    pub system: P::System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Duty {
    PollPeripherals,
    PublishState,
    Heartbeat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Continue,
    /// A restart went through [`System::restart`]; stop ticking.
    Restart,
}

/// Read-only view for local control surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct NodeSnapshot {
    pub device_id: String,
    pub device_type: &'static str,
    pub firmware_version: String,
    pub mac_address: String,
    pub ip_address: String,
    pub online: bool,
    pub connectivity: ConnectivityState,
    pub ota: OtaState,
    pub free_heap: u32,
    pub uptime: u32,
    pub state: Value,
}

pub struct Node<M: DeviceModel, P: Platform> {
    identity: DeviceIdentity,
    timing: TimingConfig,
    state: DeviceState<M>,
    io: Box<M::Io>,
    supervisor: ConnectivitySupervisor<P::Transport>,
    session: MqttSessionManager<P::Mqtt>,
    dispatcher: CommandDispatcher,
    ota: OtaStateMachine,
    ota_transport: P::Ota,
    persistence: StatePersistence<P::Store>,
    scheduler: HeartbeatScheduler<Duty>,
    system: P::System,
    button: &'static InputFlag,
    debounce: Debounce,
    local_commands: VecDeque<CommandRequest>,
    booted_at: Millis,
    restart_requested: bool,
}

impl<M: DeviceModel, P: Platform> Node<M, P> {
    /// Restores persisted state and drives the outputs once, so the relay and
    /// LEDs match the record before the network comes up.
    pub fn new(
        identity: DeviceIdentity,
        config: &RuntimeConfig,
        mut io: Box<M::Io>,
        parts: PlatformParts<P>,
        button: &'static InputFlag,
        now: Millis,
    ) -> Self {
        debug_assert_eq!(identity.kind(), M::KIND, "device model and identity disagree");

        let timing = config.timing();
        let persistence = StatePersistence::new(parts.store);
        let model: M = persistence.restore();
        model.drive_outputs(&mut *io);

        let topics = TopicSet::for_identity(&config.device.namespace, &identity);
        let session = MqttSessionManager::new(
            parts.mqtt,
            topics,
            identity.device_id(),
            Credentials::from_parts(&config.network.mqtt_user, &config.network.mqtt_pass),
            config.network.keep_alive_secs,
        );
        let supervisor = ConnectivitySupervisor::new(
            parts.transport,
            AttemptPolicy {
                max_attempts: timing.max_connect_attempts,
                retry_delay_ms: timing.connect_retry_delay_ms,
            },
        );

        let mut scheduler = HeartbeatScheduler::new();
        if M::HAS_SENSORS {
            scheduler.register(Duty::PollPeripherals, timing.poll_interval_ms, now);
        }
        scheduler.register(Duty::PublishState, timing.state_publish_interval_ms, now);
        scheduler.register(Duty::Heartbeat, timing.heartbeat_interval_ms, now);

        info!(
            "{} {} firmware {} ready",
            identity.device_type(),
            identity.device_id(),
            identity.firmware_version()
        );

        Self {
            ota: OtaStateMachine::new(
                identity.device_id(),
                config.max_payload_bytes,
                timing.ota_progress_step,
            ),
            dispatcher: CommandDispatcher::new(config.max_payload_bytes),
            debounce: Debounce::new(timing.button_debounce_ms),
            identity,
            timing,
            state: DeviceState::new(model),
            io,
            supervisor,
            session,
            ota_transport: parts.ota,
            persistence,
            scheduler,
            system: parts.system,
            button,
            local_commands: VecDeque::new(),
            booted_at: now,
            restart_requested: false,
        }
    }

    /// One pass of the cooperative loop.
    pub fn tick(&mut self, now: Millis) -> TickOutcome {
        if self.restart_requested {
            return TickOutcome::Restart;
        }
        self.system.feed_watchdog();

        let link = self.supervisor.tick(now);
        if self.supervisor.take_exhausted() {
            warn!("network unreachable after repeated attempts, entering provisioning");
            self.system.enter_provisioning();
        }

        let identity = &self.identity;
        let transport = self.supervisor.transport();
        let system = &self.system;
        let uptime = now.elapsed_since(self.booted_at);
        self.session.ensure_session(link, now, || {
            status_payload(identity, transport.local_address(), system, uptime, true)
        });

        for _ in 0..self.timing.inbound_budget {
            let Some(message) = self.session.poll_incoming() else {
                break;
            };
            let outcome = match self.session.dispatch_incoming(&message.topic, &message.payload) {
                Route::Command(payload) => self.handle_command(payload, now),
                Route::Ota(payload) => {
                    self.handle_ota_request(payload, now);
                    TickOutcome::Continue
                }
                Route::Ignored => {
                    debug!("ignoring message on {}", message.topic);
                    TickOutcome::Continue
                }
            };
            if outcome == TickOutcome::Restart {
                return outcome;
            }
        }

        if self.button.take() && self.debounce.accept(now) {
            info!("button pressed");
            if self.state.apply_local(M::on_button) {
                self.after_mutation(now);
            }
        }
        while let Some(request) = self.local_commands.pop_front() {
            if self.handle_local(&request, now) == TickOutcome::Restart {
                return TickOutcome::Restart;
            }
        }

        for duty in self.scheduler.tick(now) {
            match duty {
                Duty::PollPeripherals => self.state.refresh(&mut *self.io),
                Duty::PublishState => self.publish_state(now),
                Duty::Heartbeat => self.publish_online(true, now),
            }
        }

        self.drive_ota(now)
    }

    /// Queues a command from a local surface; it runs during the next tick.
    pub fn queue_local(&mut self, request: CommandRequest) {
        self.local_commands.push_back(request);
    }

    /// Runs a command that did not arrive over MQTT.
    pub fn handle_local(&mut self, request: &CommandRequest, now: Millis) -> TickOutcome {
        match self.dispatcher.execute(&mut self.state, request) {
            Ok(outcome) => self.apply(outcome, now),
            Err(err) => {
                warn!("dropping local command `{}`: {err}", request.command);
                TickOutcome::Continue
            }
        }
    }

    pub fn snapshot(&self, now: Millis) -> NodeSnapshot {
        NodeSnapshot {
            device_id: self.identity.device_id().to_string(),
            device_type: self.identity.device_type(),
            firmware_version: self.identity.firmware_version().to_string(),
            mac_address: self.identity.mac().to_string(),
            ip_address: self.supervisor.transport().local_address(),
            online: self.session.is_up(),
            connectivity: self.connectivity(),
            ota: self.ota.state(),
            free_heap: self.system.free_memory(),
            uptime: now.elapsed_since(self.booted_at),
            state: serde_json::to_value(self.state.model()).unwrap_or(Value::Null),
        }
    }

    pub fn connectivity(&self) -> ConnectivityState {
        ConnectivityState {
            link: self.supervisor.state(),
            session: self.session.state(),
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn model(&self) -> &M {
        self.state.model()
    }

    pub fn is_dirty(&self) -> bool {
        self.state.is_dirty()
    }

    pub fn ota_state(&self) -> OtaState {
        self.ota.state()
    }

    pub fn session(&self) -> &MqttSessionManager<P::Mqtt> {
        &self.session
    }

    pub fn supervisor(&self) -> &ConnectivitySupervisor<P::Transport> {
        &self.supervisor
    }

    pub fn system(&self) -> &P::System {
        &self.system
    }

    pub fn store(&self) -> &P::Store {
        self.persistence.store()
    }

    /// Tears the node down, handing back everything needed to build it again.
    pub fn into_parts(self) -> (PlatformParts<P>, Box<M::Io>) {
        let parts = PlatformParts {
            transport: self.supervisor.into_transport(),
            mqtt: self.session.into_client(),
            store: self.persistence.into_inner(),
            ota: self.ota_transport,
            system: self.system,
        };
        (parts, self.io)
    }

    fn handle_command(&mut self, payload: &[u8], now: Millis) -> TickOutcome {
        match self.dispatcher.handle(&mut self.state, payload) {
            Ok(outcome) => self.apply(outcome, now),
            Err(err) => {
                warn!("dropping command: {err}");
                TickOutcome::Continue
            }
        }
    }

    fn apply(&mut self, outcome: CommandOutcome, now: Millis) -> TickOutcome {
        match outcome {
            CommandOutcome::Ignored { .. } => {}
            CommandOutcome::Mutated => self.after_mutation(now),
            CommandOutcome::ReportStatus => {
                self.publish_status(now);
                self.publish_state(now);
            }
            CommandOutcome::RefreshSensors => {
                self.state.refresh(&mut *self.io);
                self.publish_state(now);
            }
            CommandOutcome::Restart => {
                info!("restart requested");
                self.publish_online(false, now);
                return self.restart(self.timing.restart_delay_ms);
            }
        }
        TickOutcome::Continue
    }

    fn after_mutation(&mut self, now: Millis) {
        self.state.model().drive_outputs(&mut *self.io);
        self.publish_state(now);
        if let Err(err) = self.persistence.persist(&mut self.state) {
            warn!("failed to persist {} state: {err}", M::KIND);
        }
    }

    fn handle_ota_request(&mut self, payload: &[u8], now: Millis) {
        match self.ota.parse_request(payload) {
            Ok(OtaRequest::Check) => {
                let report = VersionReport::ready(
                    self.identity.device_id(),
                    self.identity.firmware_version(),
                );
                let result = self.session.publish_json(TopicKind::Status, &report, false);
                log_publish("version report", result);
            }
            Ok(OtaRequest::Update { url }) => {
                if let Err(err) = self.ota.request_update(&url) {
                    warn!("ota request rejected: {err}");
                }
            }
            Err(err) => warn!("dropping ota message at {now}: {err}"),
        }
    }

    /// The only place a firmware transfer runs. Blocks for its duration.
    fn drive_ota(&mut self, now: Millis) -> TickOutcome {
        let Some(start) = self.ota.begin() else {
            return TickOutcome::Continue;
        };
        let result = self.session.publish_json(TopicKind::Status, &start, false);
        log_publish("ota start", result);

        let session = &mut self.session;
        let system = &mut self.system;
        let finished = self.ota.run_step(&mut self.ota_transport, |report| {
            system.feed_watchdog();
            if let Some(report) = report {
                log_publish(
                    "ota progress",
                    session.publish_json(TopicKind::Status, &report, false),
                );
            }
        });
        if let Some(report) = finished {
            let result = self.session.publish_json(TopicKind::Status, &report, false);
            log_publish("ota result", result);
        }

        match self.ota.complete() {
            Some(OtaState::Succeeded) => {
                info!("firmware updated at {now}, restarting");
                self.restart(self.timing.ota_restart_delay_ms)
            }
            _ => TickOutcome::Continue,
        }
    }

    fn restart(&mut self, delay_ms: u32) -> TickOutcome {
        self.system.delay_ms(delay_ms);
        self.restart_requested = true;
        self.system.restart();
        TickOutcome::Restart
    }

    fn publish_state(&mut self, now: Millis) {
        let payload = StatePayload {
            device_id: self.identity.device_id(),
            state: self.state.model(),
            timestamp: now,
        };
        let result = self.session.publish_json(TopicKind::State, &payload, false);
        log_publish("state", result);
    }

    fn publish_status(&mut self, now: Millis) {
        let payload = status_payload(
            &self.identity,
            self.supervisor.transport().local_address(),
            &self.system,
            now.elapsed_since(self.booted_at),
            self.session.is_up(),
        );
        let result = self.session.publish_json(TopicKind::Status, &payload, true);
        log_publish("status", result);
    }

    fn publish_online(&mut self, online: bool, now: Millis) {
        let payload = OnlinePayload {
            online,
            timestamp: now,
        };
        let result = self.session.publish_json(TopicKind::Online, &payload, true);
        log_publish("online", result);
    }
}

fn status_payload<'a, S: System>(
    identity: &'a DeviceIdentity,
    ip_address: String,
    system: &S,
    uptime: u32,
    online: bool,
) -> StatusPayload<'a> {
    let memory = system.free_memory();
    let wireless = identity.kind().is_wireless();
    StatusPayload {
        device_id: identity.device_id(),
        device_type: identity.device_type(),
        firmware_version: identity.firmware_version(),
        mac_address: identity.mac().to_string(),
        ip_address,
        online,
        free_heap: wireless.then_some(memory),
        free_memory: (!wireless).then_some(memory),
        uptime,
        wifi_rssi: if wireless { system.wifi_rssi() } else { None },
    }
}

/// Session-down drops and client failures are logged by the session itself.
fn log_publish(what: &str, result: Result<(), PublishError>) {
    if let Err(err @ (PublishError::Encode(_) | PublishError::NoTopic(_))) = result {
        warn!("{what} publish failed: {err}");
    }
}
