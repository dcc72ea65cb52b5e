//! Bootstrap Orchestrator.
//!
//! Runs the bootstrap stages in order on one thread, then hands the frozen
//! session to a round engine on a second thread and waits for the
//! cancellation signal. Every state change goes through `advance`, which
//! refuses anything but the strict successor (or `Terminated`).
//!
//! Control from other threads goes through `StopHandle`. Stopping sets the
//! cancellation signal, marks a launched round as done and pushes a wake
//! sentinel into the inbound channel so a parked receive returns at once.

use super::signal::CancelSignal;
use super::stages::{BootstrapState, StageObserver};
use super::{BootstrapError, BootstrapReport, Termination};
use crate::config::{FailurePolicy, MixerConfig};
use crate::logger::{ConsoleLogger, Logger};
use crate::net::channel::{Channel, ChannelError};
use crate::net::tcp::{TcpConfig, TcpTransport};
use crate::net::transport::Transport;
use crate::net::NetError;
use crate::protocol::messaging::{Messages, Phase};
use crate::protocol::round::{RoundFactory, RoundOutcome, RoundParams};
use crate::protocol::session::{MixParams, Session, VerificationKey};
use crate::protocol::ProtocolError;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

type Stage<T, F> = fn(&mut BootstrapOrchestrator<T, F>) -> Result<(), BootstrapError>;

/// State shared between the orchestrator and its stop handles.
struct Control {
    cancel: CancelSignal,
    round_done: Arc<AtomicBool>,
    round_launched: AtomicBool,
    from_pool: Channel,
}

/// Requests an orchestrator to stop. Cheap to clone, safe from any thread.
#[derive(Clone)]
pub struct StopHandle {
    control: Arc<Control>,
}

impl StopHandle {
    /// Idempotent. Marks a launched round as done, sets the cancellation
    /// signal and wakes a receive parked on the inbound channel.
    pub fn stop(&self) {
        if self.control.round_launched.load(Ordering::SeqCst) {
            self.control.round_done.store(true, Ordering::SeqCst);
        }
        if self.control.cancel.set() {
            log::info!("Stop requested");
        }
        // A closed channel has nobody left to wake.
        let _ = self.control.from_pool.send(None);
    }

    pub fn is_stopped(&self) -> bool {
        self.control.cancel.is_set()
    }

    pub fn cancel_signal(&self) -> CancelSignal {
        self.control.cancel.clone()
    }
}

/// Drives one participant through the bootstrap of one session.
pub struct BootstrapOrchestrator<T: Transport, F: RoundFactory> {
    config: MixerConfig,
    params: MixParams,
    transport: T,
    factory: F,
    logger: Arc<dyn Logger>,
    messages: Messages,
    to_pool: Channel,
    from_pool: Channel,
    session: Session,
    /// Set at round launch; from then on the session is read-only.
    frozen: Option<Arc<Session>>,
    state: BootstrapState,
    termination: Option<Termination>,
    control: Arc<Control>,
    observers: Vec<Box<dyn StageObserver>>,
    round: Option<(JoinHandle<()>, flume::Receiver<RoundOutcome>)>,
    /// Set once `connect_transport` has both connected and started the transport.
    transport_started: bool,
    has_run: bool,
}

impl<F: RoundFactory> BootstrapOrchestrator<TcpTransport, F> {
    /// Orchestrator over a TCP connection to `config.host:config.port`,
    /// encrypted when `use_transport_encryption` is set.
    pub fn tcp(
        config: MixerConfig,
        params: MixParams,
        factory: F,
        logger: Option<Arc<dyn Logger>>,
    ) -> Result<Self, BootstrapError> {
        let transport = TcpTransport::new(TcpConfig::from(&config));
        Self::new(config, params, transport, factory, logger)
    }
}

impl<T: Transport, F: RoundFactory> BootstrapOrchestrator<T, F> {
    /// Creates an orchestrator in the `Disconnected` state.
    ///
    /// Without a logger, status lines go to the console.
    pub fn new(
        config: MixerConfig,
        params: MixParams,
        transport: T,
        factory: F,
        logger: Option<Arc<dyn Logger>>,
    ) -> Result<Self, BootstrapError> {
        config.validate()?;
        params.validate()?;

        let from_pool = Channel::new();
        let control = Arc::new(Control {
            cancel: CancelSignal::new(),
            round_done: Arc::new(AtomicBool::new(false)),
            round_launched: AtomicBool::new(false),
            from_pool: from_pool.clone(),
        });

        Ok(Self {
            config,
            params,
            transport,
            factory,
            logger: logger.unwrap_or_else(|| Arc::new(ConsoleLogger)),
            messages: Messages::new(),
            to_pool: Channel::new(),
            from_pool,
            session: Session::new(),
            frozen: None,
            state: BootstrapState::Disconnected,
            termination: None,
            control,
            observers: Vec::new(),
            round: None,
            transport_started: false,
            has_run: false,
        })
    }

    pub fn add_observer(&mut self, observer: Box<dyn StageObserver>) {
        self.observers.push(observer);
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            control: self.control.clone(),
        }
    }

    /// Same as `stop_handle().stop()`.
    pub fn stop(&self) {
        self.stop_handle().stop();
    }

    pub fn state(&self) -> BootstrapState {
        self.state
    }

    pub fn session(&self) -> &Session {
        self.frozen.as_deref().unwrap_or(&self.session)
    }

    pub fn termination(&self) -> Option<&Termination> {
        self.termination.as_ref()
    }

    pub fn is_cancelled(&self) -> bool {
        self.control.cancel.is_set()
    }

    pub fn config(&self) -> &MixerConfig {
        &self.config
    }

    /// Runs every stage in order, exactly once.
    ///
    /// Never returns an error: the outcome is in `termination()` and in the
    /// status lines sent to the logger.
    pub fn run(&mut self) {
        if self.has_run {
            log::warn!("Bootstrap already ran; ignoring");
            return;
        }
        self.has_run = true;
        log::info!(
            "Bootstrapping with pool {}:{} ({:?})",
            self.config.host,
            self.config.port,
            self.config.failure_policy
        );

        let stages: [(BootstrapState, Stage<T, F>); 6] = [
            (BootstrapState::Connected, Self::connect_transport),
            (BootstrapState::Registered, Self::register_on_the_pool),
            (BootstrapState::AnnouncementReceived, Self::wait_for_announcement),
            (BootstrapState::KeysShared, Self::share_the_key),
            (BootstrapState::KeysGathered, Self::gather_the_keys),
            (BootstrapState::RoundRunning, Self::start_round),
        ];

        for (target, stage) in stages {
            if !self.run_stage(target, stage) {
                break;
            }
        }
        if self.round.is_some() {
            self.await_round();
        }
        self.finish();
    }

    /// Moves the orchestrator onto a thread named `shuffle-bootstrap` and runs it there.
    pub fn spawn(self) -> Result<OrchestratorHandle, BootstrapError>
    where
        T: 'static,
        F: 'static,
    {
        let stop = self.stop_handle();
        let (report_tx, reports) = flume::bounded(1);
        let mut orchestrator = self;
        let thread = thread::Builder::new()
            .name("shuffle-bootstrap".into())
            .spawn(move || {
                orchestrator.run();
                let _ = report_tx.send(orchestrator.into_report());
            })
            .map_err(|_| BootstrapError::Spawn)?;

        Ok(OrchestratorHandle {
            stop,
            thread: Some(thread),
            reports,
        })
    }

    /// Consumes the orchestrator into its final snapshot.
    pub fn into_report(self) -> BootstrapReport {
        let session = match self.frozen {
            Some(shared) => Arc::try_unwrap(shared).unwrap_or_else(|shared| (*shared).clone()),
            None => self.session,
        };
        BootstrapReport {
            session,
            state: self.state,
            termination: self.termination,
        }
    }

    /// Runs one stage with the cancellation guard and the failure policy.
    /// Returns whether the sequence should go on.
    fn run_stage(&mut self, target: BootstrapState, stage: Stage<T, F>) -> bool {
        if self.control.cancel.is_set() {
            log::debug!("Skipping {:?}: cancelled", target);
            self.terminate_with(Termination::Stopped { at: self.state });
            return false;
        }

        let error = match stage(self) {
            Ok(()) => {
                self.advance(target);
                return true;
            }
            Err(error) => error,
        };

        match error {
            BootstrapError::Cancelled => {
                log::info!("{:?} interrupted by stop", target);
                self.terminate_with(Termination::Stopped { at: self.state });
                false
            }
            BootstrapError::Protocol(violation) if violation.is_violation() => {
                self.logger.send(&format!("Error: {}", violation));
                log::error!("Protocol violation while entering {:?}: {}", target, violation);
                self.control.cancel.set();
                self.terminate_with(Termination::ProtocolViolation {
                    at: self.state,
                    error: violation,
                });
                false
            }
            error => {
                self.logger.send(target.failure_message());
                log::error!("Stage {:?} failed: {}", target, error);
                let at = self.state;
                self.terminate_with(Termination::Aborted { at, error });

                let keep_going = self.config.failure_policy == FailurePolicy::BestEffort
                    && target != BootstrapState::RoundRunning;
                if keep_going {
                    self.advance(target);
                } else {
                    self.control.cancel.set();
                }
                keep_going
            }
        }
    }

    /// Records the first termination reason only.
    fn terminate_with(&mut self, termination: Termination) {
        if self.termination.is_none() {
            self.termination = Some(termination);
        }
    }

    fn advance(&mut self, to: BootstrapState) {
        let from = self.state;
        if !from.can_enter(to) {
            log::error!("{}: {:?} -> {:?}", ProtocolError::InvalidState, from, to);
            return;
        }
        self.state = to;
        log::info!("Bootstrap transition: {:?} -> {:?}", from, to);
        for observer in &self.observers {
            observer.on_transition(from, to);
        }
    }

    /// Next inbound payload, sentinel included. Polls so that the
    /// cancellation signal is seen within one poll interval.
    fn next_payload(&self) -> Result<Option<Vec<u8>>, BootstrapError> {
        let poll = self.config.poll_interval();
        loop {
            if self.control.cancel.is_set() {
                return Err(BootstrapError::Cancelled);
            }
            match self.from_pool.recv_timeout(poll) {
                Ok(_) if self.control.cancel.is_set() => return Err(BootstrapError::Cancelled),
                Ok(payload) => return Ok(payload),
                Err(ChannelError::Timeout) => continue,
                Err(ChannelError::Closed) => return Err(NetError::StreamClosed.into()),
                Err(e @ ChannelError::Full) => return Err(e.into()),
            }
        }
    }

    /// Next inbound message. Wake sentinels mean "not ready yet".
    fn next_message(&self) -> Result<Vec<u8>, BootstrapError> {
        loop {
            match self.next_payload()? {
                Some(bytes) => return Ok(bytes),
                None => {
                    log::debug!("Pool not ready; backing off");
                    thread::sleep(self.config.not_ready_backoff());
                }
            }
        }
    }

    fn connect_transport(&mut self) -> Result<(), BootstrapError> {
        let host = self.config.host.clone();
        self.transport.connect(&host, self.config.port)?;
        self.transport
            .start(self.to_pool.clone(), self.from_pool.clone())?;
        self.transport_started = true;
        Ok(())
    }

    /// Stages after the first need a started transport; a failed connect
    /// leaves the inbound channel with no writer.
    fn require_transport(&self) -> Result<(), BootstrapError> {
        if self.transport_started {
            Ok(())
        } else {
            Err(NetError::NotConnected.into())
        }
    }

    fn register_on_the_pool(&mut self) -> Result<(), BootstrapError> {
        self.require_transport()?;
        self.messages
            .make_greeting(&self.params.verification_key, self.params.amount);
        self.to_pool.send(Some(self.messages.serialize()?))?;

        let reply = self.next_message()?;
        self.messages.parse(&reply)?;
        let last = self
            .messages
            .last()
            .ok_or(ProtocolError::RegistrationRejected)?;
        let (session_id, number) = (last.session.clone(), last.number);

        self.session.assign(session_id, number)?;
        log::info!("Registered in session {}", self.session.session_id());
        self.logger
            .send(&format!("Player {} get session number.", number));
        Ok(())
    }

    fn wait_for_announcement(&mut self) -> Result<(), BootstrapError> {
        self.require_transport()?;
        loop {
            let payload = self.next_message()?;
            if let Err(e) = self.messages.parse(&payload) {
                log::debug!("Discarding unreadable pool message: {}", e);
                continue;
            }
            let (Some(phase), Some(number)) = (self.messages.phase(), self.messages.number())
            else {
                log::debug!("Discarding empty pool message");
                continue;
            };

            match phase {
                Phase::Announcement => {
                    self.session.set_player_count(number)?;
                    log::info!("Pool announced {} players", number);
                    return Ok(());
                }
                Phase::None
                | Phase::Shuffle
                | Phase::Broadcast
                | Phase::EquivocationCheck
                | Phase::Signing
                | Phase::VerificationAndSubmission
                | Phase::Blame => {
                    log::info!("Player {} joined", number);
                    self.logger
                        .send(&format!("Player {} joined the pool!", number));
                }
            }
        }
    }

    fn share_the_key(&mut self) -> Result<(), BootstrapError> {
        self.require_transport()?;
        let number = self
            .session
            .player_number()
            .ok_or(ProtocolError::IncompleteSession("player number"))?;
        let count = self
            .session
            .player_count()
            .ok_or(ProtocolError::IncompleteSession("player count"))?;
        if self.session.session_id().is_empty() {
            return Err(ProtocolError::IncompleteSession("session id").into());
        }

        self.logger.send(&format!(
            "Player {} is about to share verification key with {} players.",
            number, count
        ));
        self.messages.clear();
        self.messages.add_key_share(
            &self.params.verification_key,
            self.session.session_id(),
            number,
        );
        self.to_pool.send(Some(self.messages.serialize()?))?;
        Ok(())
    }

    fn gather_the_keys(&mut self) -> Result<(), BootstrapError> {
        self.require_transport()?;
        let count = self
            .session
            .player_count()
            .ok_or(ProtocolError::IncompleteSession("player count"))?;

        let mut gathered = Vec::new();
        for _ in 0..count {
            gathered.extend(self.next_message()?);
        }
        self.messages.parse(&gathered)?;

        let players: BTreeMap<u32, VerificationKey> = self
            .messages
            .entries()
            .iter()
            .map(|p| (p.number, p.from_key.clone()))
            .collect();
        for (number, key) in &players {
            log::debug!("Player {} key {}", number, key.fingerprint());
        }

        self.session.set_players(players)?;
        self.logger
            .send(&format!("Gathered verification keys of {} players.", count));
        Ok(())
    }

    fn start_round(&mut self) -> Result<(), BootstrapError> {
        if !self.session.is_complete() {
            return Err(ProtocolError::IncompleteSession("session").into());
        }

        let session = Arc::new(std::mem::take(&mut self.session));
        self.frozen = Some(session.clone());
        self.messages.clear();

        let params = RoundParams {
            network: self.config.network,
            codec: Messages::new(),
            to_pool: self.to_pool.clone(),
            from_pool: self.from_pool.clone(),
            logger: self.logger.clone(),
            session: session.clone(),
            begin_phase: Phase::Announcement,
            amount: self.params.amount,
            fee: self.params.fee,
            secret_key: self.params.secret_key.clone(),
            verification_key: self.params.verification_key.clone(),
            dest_addr: self.params.dest_addr.clone(),
            change_addr: self.params.change_addr.clone(),
            done: self.control.round_done.clone(),
        };
        let mut engine = self.factory.build(params);

        let (outcome_tx, outcomes) = flume::bounded(1);
        let cancel = self.control.cancel.clone();
        let handle = thread::Builder::new()
            .name("shuffle-round".into())
            .spawn(move || {
                let _finished = cancel.set_on_drop();
                let _ = outcome_tx.send(engine.run_loop());
            })
            .map_err(|_| BootstrapError::Spawn)?;

        self.control.round_launched.store(true, Ordering::SeqCst);
        self.round = Some((handle, outcomes));
        if let Some(number) = session.player_number() {
            self.logger.send(&format!(
                "Player {} starts the shuffle round with {} players.",
                number,
                session.players().len()
            ));
        }
        Ok(())
    }

    /// Blocks until the round ends or a stop arrives, then reaps the round thread.
    fn await_round(&mut self) {
        self.control.cancel.wait();
        self.control.round_done.store(true, Ordering::SeqCst);

        let Some((handle, outcomes)) = self.round.take() else {
            return;
        };
        let outcome = match handle.join() {
            Ok(()) => outcomes.try_recv().unwrap_or(RoundOutcome::Failed {
                reason: "round ended without an outcome".into(),
            }),
            Err(_) => RoundOutcome::Failed {
                reason: "round engine panicked".into(),
            },
        };

        match &outcome {
            RoundOutcome::Completed => self.logger.send("Shuffle round completed."),
            RoundOutcome::Failed { reason } => {
                log::error!("Round failed: {}", reason);
                self.logger.send(&format!("Error: shuffle round failed: {}", reason));
            }
            RoundOutcome::Interrupted => self.logger.send("Shuffle round stopped."),
        }
        self.termination = Some(Termination::RoundFinished(outcome));
    }

    fn finish(&mut self) {
        self.control.cancel.set();
        self.to_pool.close();
        if self.transport.is_alive() {
            log::debug!("Waiting for transport to wind down");
        }
        self.transport.shutdown();
        self.transport.join();

        let at = self.state;
        self.terminate_with(Termination::Stopped { at });
        self.advance(BootstrapState::Terminated);
        if let Some(termination) = &self.termination {
            log::info!("Bootstrap finished: {}", termination);
        }
    }
}

/// Handle to an orchestrator running on its own thread.
pub struct OrchestratorHandle {
    stop: StopHandle,
    thread: Option<JoinHandle<()>>,
    reports: flume::Receiver<BootstrapReport>,
}

impl OrchestratorHandle {
    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Stops the orchestrator and waits for it.
    ///
    /// Returns `None` on timeout (the call may be repeated), when the
    /// report was already taken, or when the bootstrap thread panicked.
    pub fn join(&mut self, timeout: Option<Duration>) -> Option<BootstrapReport> {
        self.stop();
        self.wait(timeout)
    }

    /// Waits for the orchestrator to finish on its own.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Option<BootstrapReport> {
        self.thread.as_ref()?;
        let report = match timeout {
            Some(limit) => match self.reports.recv_timeout(limit) {
                Ok(report) => Some(report),
                Err(flume::RecvTimeoutError::Timeout) => return None,
                Err(flume::RecvTimeoutError::Disconnected) => None,
            },
            None => self.reports.recv().ok(),
        };

        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Bootstrap thread panicked");
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::MemoryLogger;
    use crate::net::channel::Payload;
    use crate::protocol::messaging::Packet;
    use crate::protocol::round::RoundEngine;
    use crate::protocol::session::{SecretKey, SessionId};
    use std::sync::Mutex;
    use std::time::Instant;

    // --- pool doubles ---

    #[derive(Clone, Default)]
    struct Recorder {
        calls: Arc<Mutex<Vec<&'static str>>>,
        to_pool: Arc<Mutex<Option<Channel>>>,
    }

    impl Recorder {
        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }

        fn sent(&self) -> Vec<u8> {
            let guard = self.to_pool.lock().unwrap();
            let mut out = Vec::new();
            if let Some(channel) = guard.as_ref() {
                while let Ok(Some(payload)) = channel.try_recv() {
                    if let Some(bytes) = payload {
                        out.extend(bytes);
                    }
                }
            }
            out
        }
    }

    /// Feeds a fixed script into the inbound channel on start.
    struct ScriptedTransport {
        incoming: Vec<Payload>,
        fail_connect: bool,
        recorder: Recorder,
    }

    impl ScriptedTransport {
        fn new(incoming: Vec<Payload>, recorder: &Recorder) -> Self {
            Self {
                incoming,
                fail_connect: false,
                recorder: recorder.clone(),
            }
        }
    }

    impl Transport for ScriptedTransport {
        fn connect(&mut self, _host: &str, _port: u16) -> Result<(), NetError> {
            self.recorder.calls.lock().unwrap().push("connect");
            if self.fail_connect {
                return Err(NetError::ConnectionFailed);
            }
            Ok(())
        }

        fn start(&mut self, to_pool: Channel, from_pool: Channel) -> Result<(), NetError> {
            self.recorder.calls.lock().unwrap().push("start");
            *self.recorder.to_pool.lock().unwrap() = Some(to_pool);
            for payload in self.incoming.drain(..) {
                from_pool.send(payload).map_err(|_| NetError::StreamClosed)?;
            }
            Ok(())
        }

        fn is_alive(&self) -> bool {
            false
        }

        fn shutdown(&mut self) {
            self.recorder.calls.lock().unwrap().push("shutdown");
        }

        fn join(&mut self) {
            self.recorder.calls.lock().unwrap().push("join");
        }
    }

    fn encode(packets: Vec<Packet>) -> Payload {
        let mut m = Messages::new();
        for p in packets {
            m.push(p);
        }
        Some(m.serialize().unwrap())
    }

    fn reply(session: &[u8], number: u32) -> Payload {
        let mut p = Packet::new(Phase::None, number);
        p.session = SessionId::new(session.to_vec());
        encode(vec![p])
    }

    fn joined(number: u32) -> Payload {
        encode(vec![Packet::new(Phase::None, number)])
    }

    fn announcement(count: u32) -> Payload {
        encode(vec![Packet::new(Phase::Announcement, count)])
    }

    fn share(number: u32, key: &str) -> Payload {
        let mut p = Packet::new(Phase::None, number);
        p.session = SessionId::new(b"sess".to_vec());
        p.from_key = VerificationKey::new(key);
        encode(vec![p])
    }

    fn pool_script(keys: [&str; 3]) -> Vec<Payload> {
        vec![
            reply(b"sess", 2),
            joined(1),
            Some(vec![0xde, 0xad]),
            joined(3),
            announcement(3),
            share(1, keys[0]),
            share(2, keys[1]),
            share(3, keys[2]),
        ]
    }

    // --- round doubles ---

    #[derive(Clone, Copy)]
    enum Behaviour {
        Complete,
        UntilDone,
        Panic,
        Slow,
    }

    struct TestEngine {
        behaviour: Behaviour,
        done: Arc<AtomicBool>,
    }

    impl RoundEngine for TestEngine {
        fn run_loop(&mut self) -> RoundOutcome {
            match self.behaviour {
                Behaviour::Complete => RoundOutcome::Completed,
                Behaviour::UntilDone => {
                    while !self.done.load(Ordering::SeqCst) {
                        thread::sleep(Duration::from_millis(5));
                    }
                    RoundOutcome::Interrupted
                }
                Behaviour::Panic => panic!("round engine exploded"),
                Behaviour::Slow => {
                    thread::sleep(Duration::from_millis(300));
                    RoundOutcome::Completed
                }
            }
        }
    }

    type Built = Arc<Mutex<Option<Arc<Session>>>>;

    fn factory(
        behaviour: Behaviour,
        built: &Built,
    ) -> impl FnMut(RoundParams) -> Box<dyn RoundEngine> + Send {
        let built = built.clone();
        move |p: RoundParams| -> Box<dyn RoundEngine> {
            *built.lock().unwrap() = Some(p.session.clone());
            Box::new(TestEngine {
                behaviour,
                done: p.done.clone(),
            })
        }
    }

    fn config() -> MixerConfig {
        MixerConfig {
            poll_interval_ms: 10,
            not_ready_backoff_ms: 10,
            ..MixerConfig::default()
        }
    }

    fn params() -> MixParams {
        MixParams {
            amount: 100_000,
            fee: 1_000,
            secret_key: SecretKey::new("sk"),
            verification_key: VerificationKey::new("vk"),
            dest_addr: "dest".into(),
            change_addr: "change".into(),
        }
    }

    type Transitions = Arc<Mutex<Vec<(BootstrapState, BootstrapState)>>>;

    fn record(orch: &mut BootstrapOrchestrator<ScriptedTransport, impl RoundFactory>) -> Transitions {
        let seen: Transitions = Arc::default();
        let sink = seen.clone();
        orch.add_observer(Box::new(move |from: BootstrapState, to: BootstrapState| {
            sink.lock().unwrap().push((from, to))
        }));
        seen
    }

    fn wait_for(seen: &Transitions, state: BootstrapState) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !seen.lock().unwrap().iter().any(|(_, to)| *to == state) {
            assert!(Instant::now() < deadline, "never reached {:?}", state);
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_three_players_reach_the_round() {
        let recorder = Recorder::default();
        let built = Built::default();
        let logger = Arc::new(MemoryLogger::new());
        let mut orch = BootstrapOrchestrator::new(
            config(),
            params(),
            ScriptedTransport::new(pool_script(["a", "vk", "c"]), &recorder),
            factory(Behaviour::Complete, &built),
            Some(logger.clone()),
        )
        .unwrap();
        let seen = record(&mut orch);

        orch.run();

        use BootstrapState::*;
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (Disconnected, Connected),
                (Connected, Registered),
                (Registered, AnnouncementReceived),
                (AnnouncementReceived, KeysShared),
                (KeysShared, KeysGathered),
                (KeysGathered, RoundRunning),
                (RoundRunning, Terminated),
            ]
        );
        assert_eq!(
            orch.termination(),
            Some(&Termination::RoundFinished(RoundOutcome::Completed))
        );
        assert!(orch.is_cancelled());

        let session = orch.session();
        assert_eq!(session.player_number(), Some(2));
        assert_eq!(session.player_count(), Some(3));
        assert_eq!(session.players().len(), 3);
        let handed = built.lock().unwrap().clone().unwrap();
        assert_eq!(handed.players(), session.players());

        assert!(logger.contains("Player 2 get session number."));
        assert!(logger.contains("Player 1 joined the pool!"));
        assert!(logger.contains("Player 3 joined the pool!"));
        assert_eq!(recorder.calls(), vec!["connect", "start", "shutdown", "join"]);

        // Greeting, then our key share.
        let mut sent = Messages::new();
        sent.parse(&recorder.sent()).unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent.entries()[0].amount, 100_000);
        assert_eq!(sent.entries()[1].number, 2);
        assert_eq!(sent.entries()[1].session, SessionId::new(b"sess".to_vec()));
        assert_eq!(sent.entries()[1].from_key, VerificationKey::new("vk"));
    }

    #[test]
    fn test_duplicate_keys_cancel_before_round() {
        let recorder = Recorder::default();
        let built = Built::default();
        let logger = Arc::new(MemoryLogger::new());
        let mut orch = BootstrapOrchestrator::new(
            config(),
            params(),
            ScriptedTransport::new(pool_script(["a", "vk", "a"]), &recorder),
            factory(Behaviour::Complete, &built),
            Some(logger.clone()),
        )
        .unwrap();

        orch.run();

        assert!(orch.is_cancelled());
        assert!(built.lock().unwrap().is_none());
        assert!(orch.session().players().is_empty());
        assert_eq!(
            orch.termination(),
            Some(&Termination::ProtocolViolation {
                at: BootstrapState::KeysShared,
                error: ProtocolError::DuplicateKeys { expected: 3, distinct: 2 },
            })
        );
        assert_eq!(orch.state(), BootstrapState::Terminated);
        assert!(logger.contains("Duplicate verification keys"));
    }

    #[test]
    fn test_short_roster_is_a_violation() {
        let recorder = Recorder::default();
        let built = Built::default();
        let mut script = pool_script(["a", "vk", "c"]);
        script[7] = share(2, "b");
        let mut orch = BootstrapOrchestrator::new(
            config(),
            params(),
            ScriptedTransport::new(script, &recorder),
            factory(Behaviour::Complete, &built),
            Some(Arc::new(MemoryLogger::new())),
        )
        .unwrap();

        orch.run();

        assert!(built.lock().unwrap().is_none());
        assert!(matches!(
            orch.termination(),
            Some(Termination::ProtocolViolation {
                error: ProtocolError::RosterMismatch { expected: 3, received: 2 },
                ..
            })
        ));
    }

    #[test]
    fn test_connect_failure_short_circuits() {
        let recorder = Recorder::default();
        let logger = Arc::new(MemoryLogger::new());
        let mut transport = ScriptedTransport::new(Vec::new(), &recorder);
        transport.fail_connect = true;
        let mut orch = BootstrapOrchestrator::new(
            config(),
            params(),
            transport,
            factory(Behaviour::Complete, &Built::default()),
            Some(logger.clone()),
        )
        .unwrap();
        let seen = record(&mut orch);

        orch.run();

        assert_eq!(
            orch.termination(),
            Some(&Termination::Aborted {
                at: BootstrapState::Disconnected,
                error: BootstrapError::Net(NetError::ConnectionFailed),
            })
        );
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(BootstrapState::Disconnected, BootstrapState::Terminated)]
        );
        assert!(logger.contains("Error: cannot connect to server"));
        assert_eq!(recorder.calls(), vec!["connect", "shutdown", "join"]);
    }

    #[test]
    fn test_best_effort_keeps_going_but_never_launches_incomplete_round() {
        let recorder = Recorder::default();
        let built = Built::default();
        let logger = Arc::new(MemoryLogger::new());
        let script = vec![Some(vec![0xff]), announcement(1), share(1, "vk")];
        let mut orch = BootstrapOrchestrator::new(
            MixerConfig {
                failure_policy: FailurePolicy::BestEffort,
                ..config()
            },
            params(),
            ScriptedTransport::new(script, &recorder),
            factory(Behaviour::Complete, &built),
            Some(logger.clone()),
        )
        .unwrap();

        orch.run();

        assert!(logger.contains("Error: cannot register on the pool"));
        assert!(logger.contains("Error: cannot share the keys"));
        assert!(logger.contains("Error: cannot start the shuffle round"));
        assert!(built.lock().unwrap().is_none());
        assert_eq!(orch.session().player_count(), Some(1));
        assert!(matches!(
            orch.termination(),
            Some(Termination::Aborted {
                at: BootstrapState::Connected,
                error: BootstrapError::Codec(_),
            })
        ));
    }

    #[test]
    fn test_best_effort_connect_failure_terminates() {
        let recorder = Recorder::default();
        let built = Built::default();
        let logger = Arc::new(MemoryLogger::new());
        let mut transport = ScriptedTransport::new(Vec::new(), &recorder);
        transport.fail_connect = true;
        let orch = BootstrapOrchestrator::new(
            MixerConfig {
                failure_policy: FailurePolicy::BestEffort,
                ..config()
            },
            params(),
            transport,
            factory(Behaviour::Complete, &built),
            Some(logger.clone()),
        )
        .unwrap();
        let mut handle = orch.spawn().unwrap();

        let report = handle.wait(Some(Duration::from_secs(3))).unwrap();

        assert_eq!(
            report.termination,
            Some(Termination::Aborted {
                at: BootstrapState::Disconnected,
                error: BootstrapError::Net(NetError::ConnectionFailed),
            })
        );
        assert_eq!(report.state, BootstrapState::Terminated);
        assert!(logger.contains("Error: cannot connect to server"));
        assert!(logger.contains("Error: cannot register on the pool"));
        assert!(logger.contains("Error: cannot gather the keys"));
        assert!(built.lock().unwrap().is_none());
        assert_eq!(recorder.calls(), vec!["connect", "shutdown", "join"]);
    }

    #[test]
    fn test_wake_sentinel_means_not_ready() {
        let recorder = Recorder::default();
        let mut script = pool_script(["a", "vk", "c"]);
        script.insert(0, None);
        script.insert(5, None);
        let mut orch = BootstrapOrchestrator::new(
            config(),
            params(),
            ScriptedTransport::new(script, &recorder),
            factory(Behaviour::Complete, &Built::default()),
            Some(Arc::new(MemoryLogger::new())),
        )
        .unwrap();

        orch.run();

        assert_eq!(
            orch.termination(),
            Some(&Termination::RoundFinished(RoundOutcome::Completed))
        );
    }

    #[test]
    fn test_stop_before_run_skips_every_stage() {
        let recorder = Recorder::default();
        let mut orch = BootstrapOrchestrator::new(
            config(),
            params(),
            ScriptedTransport::new(pool_script(["a", "vk", "c"]), &recorder),
            factory(Behaviour::Complete, &Built::default()),
            Some(Arc::new(MemoryLogger::new())),
        )
        .unwrap();
        let handle = orch.stop_handle();
        handle.stop();
        handle.stop();

        orch.run();

        assert!(!recorder.calls().contains(&"connect"));
        assert_eq!(
            orch.termination(),
            Some(&Termination::Stopped { at: BootstrapState::Disconnected })
        );
        assert_eq!(orch.state(), BootstrapState::Terminated);
    }

    #[test]
    fn test_concurrent_stop_is_idempotent() {
        let orch = BootstrapOrchestrator::new(
            config(),
            params(),
            ScriptedTransport::new(Vec::new(), &Recorder::default()),
            factory(Behaviour::Complete, &Built::default()),
            Some(Arc::new(MemoryLogger::new())),
        )
        .unwrap();

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let h = orch.stop_handle();
                thread::spawn(move || h.stop())
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        assert!(orch.is_cancelled());
    }

    #[test]
    fn test_stop_while_waiting_for_announcement() {
        let recorder = Recorder::default();
        let built = Built::default();
        let mut orch = BootstrapOrchestrator::new(
            config(),
            params(),
            ScriptedTransport::new(vec![reply(b"sess", 1), joined(2)], &recorder),
            factory(Behaviour::Complete, &built),
            Some(Arc::new(MemoryLogger::new())),
        )
        .unwrap();
        let seen = record(&mut orch);
        let mut handle = orch.spawn().unwrap();

        wait_for(&seen, BootstrapState::Registered);
        let report = handle.join(Some(Duration::from_secs(5))).unwrap();

        assert_eq!(
            report.termination,
            Some(Termination::Stopped { at: BootstrapState::Registered })
        );
        assert_eq!(report.state, BootstrapState::Terminated);
        assert_eq!(report.session.player_count(), None);
        assert!(built.lock().unwrap().is_none());
        assert!(recorder.calls().contains(&"shutdown"));
        assert!(handle.is_finished());
        assert!(handle.join(None).is_none());
    }

    #[test]
    fn test_stop_interrupts_running_round() {
        let recorder = Recorder::default();
        let mut orch = BootstrapOrchestrator::new(
            config(),
            params(),
            ScriptedTransport::new(pool_script(["a", "vk", "c"]), &recorder),
            factory(Behaviour::UntilDone, &Built::default()),
            Some(Arc::new(MemoryLogger::new())),
        )
        .unwrap();
        let seen = record(&mut orch);
        let mut handle = orch.spawn().unwrap();

        wait_for(&seen, BootstrapState::RoundRunning);
        let report = handle.join(Some(Duration::from_secs(5))).unwrap();

        assert_eq!(
            report.termination,
            Some(Termination::RoundFinished(RoundOutcome::Interrupted))
        );
        assert_eq!(report.session.players().len(), 3);
    }

    #[test]
    fn test_round_panic_is_reported_as_failure() {
        let mut orch = BootstrapOrchestrator::new(
            config(),
            params(),
            ScriptedTransport::new(pool_script(["a", "vk", "c"]), &Recorder::default()),
            factory(Behaviour::Panic, &Built::default()),
            Some(Arc::new(MemoryLogger::new())),
        )
        .unwrap();

        orch.run();

        assert!(matches!(
            orch.termination(),
            Some(Termination::RoundFinished(RoundOutcome::Failed { .. }))
        ));
        assert_eq!(orch.state(), BootstrapState::Terminated);
    }

    #[test]
    fn test_join_timeout_can_be_retried() {
        let mut orch = BootstrapOrchestrator::new(
            config(),
            params(),
            ScriptedTransport::new(pool_script(["a", "vk", "c"]), &Recorder::default()),
            factory(Behaviour::Slow, &Built::default()),
            Some(Arc::new(MemoryLogger::new())),
        )
        .unwrap();
        let seen = record(&mut orch);
        let mut handle = orch.spawn().unwrap();

        wait_for(&seen, BootstrapState::RoundRunning);
        assert!(handle.join(Some(Duration::from_millis(10))).is_none());
        assert!(!handle.is_finished());

        let report = handle.join(None).unwrap();
        assert_eq!(
            report.termination,
            Some(Termination::RoundFinished(RoundOutcome::Completed))
        );
    }

    #[test]
    fn test_run_is_single_shot() {
        let recorder = Recorder::default();
        let mut orch = BootstrapOrchestrator::new(
            config(),
            params(),
            ScriptedTransport::new(pool_script(["a", "vk", "c"]), &recorder),
            factory(Behaviour::Complete, &Built::default()),
            Some(Arc::new(MemoryLogger::new())),
        )
        .unwrap();

        orch.run();
        let calls = recorder.calls();
        orch.run();

        assert_eq!(recorder.calls(), calls);
    }

    #[test]
    fn test_invalid_params_rejected() {
        let mut p = params();
        p.amount = 0;
        let result = BootstrapOrchestrator::new(
            config(),
            p,
            ScriptedTransport::new(Vec::new(), &Recorder::default()),
            factory(Behaviour::Complete, &Built::default()),
            None,
        );
        assert!(matches!(
            result,
            Err(BootstrapError::Protocol(ProtocolError::InvalidParameters("amount")))
        ));
    }
}
