//! One logical channel bound to one conversation
//!
//! A `Connection` owns its socket writer, lifecycle state machine,
//! outbound queue and heartbeat monitor. It never blocks and never holds
//! a lock itself: the manager calls into it with the pool locked, and it
//! reports what happened by appending to an event buffer the manager
//! dispatches afterwards.
//!
//! Every background task it spawns (open attempt, socket reader, retry,
//! heartbeat and pong timers) carries only the conversation id and the
//! connection's epoch. The manager drops a task's callback when the epoch
//! no longer matches, so a task that outlived a reconnect, a restart or
//! an eviction can never act on the connection that replaced it.

use std::collections::VecDeque;
use std::time::Duration;

use chat_shared::codec::{self, CodecError};
use chat_shared::protocol::ControlFrame;
use chat_shared::{
    defaults, now_ms, ConnectionState, HeartbeatMonitor, InboundFrame, LinkEvent,
    LinkStateMachine, Transition,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

use super::error::ConnectionError;
use super::events::{ConnectionEvent, ConnectionStats, ErrorInfo, StatusSnapshot};
use super::manager::Shared;
use crate::transport::{channel_url, SocketEvent, SocketWriter, TransportError, TransportSocket};

/// Timer callbacks routed back through the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerKind {
    Retry,
    Heartbeat,
    PongTimeout { timestamp: u64 },
}

#[derive(Debug, Default)]
struct Tasks {
    attempt: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
    retry: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    pong: Option<JoinHandle<()>>,
}

impl Tasks {
    fn abort_all(&mut self) {
        for handle in [
            self.attempt.take(),
            self.reader.take(),
            self.retry.take(),
            self.heartbeat.take(),
            self.pong.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }
}

pub(crate) struct Connection {
    id: String,
    fsm: LinkStateMachine,
    heartbeat: HeartbeatMonitor,
    socket: Option<SocketWriter>,
    /// Encoded payloads waiting for an open socket, oldest first
    queue: VecDeque<String>,
    max_queued: usize,
    last_error: Option<String>,
    epoch: u64,
    tasks: Tasks,
    pub(crate) created_seq: u64,
    pub(crate) activated_seq: u64,
}

impl Connection {
    pub(crate) fn new(id: &str, shared: &Shared, seq: u64) -> Self {
        let config = &shared.config;
        Self {
            id: id.to_owned(),
            fsm: LinkStateMachine::new(config.backoff(), config.max_reconnect_attempts),
            heartbeat: HeartbeatMonitor::new(config.stability_threshold()),
            socket: None,
            queue: VecDeque::new(),
            max_queued: config.max_queued_messages,
            last_error: None,
            epoch: shared.next_epoch(),
            tasks: Tasks::default(),
            created_seq: seq,
            activated_seq: seq,
        }
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.fsm.state()
    }

    pub(crate) fn is_open(&self) -> bool {
        self.fsm.state().is_open()
    }

    pub(crate) fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            is_open: self.is_open(),
            state: self.state(),
            last_error: self.last_error.clone(),
            quality: self.heartbeat.quality(),
            queue_depth: self.queue.len(),
            reconnect_attempts: self.fsm.reconnect_attempts(),
        }
    }

    pub(crate) fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            conversation_id: self.id.clone(),
            state: self.state(),
            is_open: self.is_open(),
            last_error: self.last_error.clone(),
            latency: self.heartbeat.quality().latency,
            queue_depth: self.queue.len(),
            reconnect_attempts: self.fsm.reconnect_attempts(),
        }
    }

    /// First open attempt after creation
    pub(crate) fn start(&mut self, shared: &Shared, out: &mut Vec<ConnectionEvent>) {
        if self.apply(LinkEvent::Start, out).is_valid() {
            self.begin_attempt(shared);
        }
    }

    /// Open again from zero attempts, keeping the outbound queue
    pub(crate) fn restart(&mut self, shared: &Shared, out: &mut Vec<ConnectionEvent>) {
        self.cancel_tasks(shared);
        if self.apply(LinkEvent::Restart, out).is_valid() {
            info!("[CONN] {} restarting", self.id);
            self.begin_attempt(shared);
        }
    }

    /// Write `line` now if open, otherwise queue it.
    ///
    /// Returns `Ok(true)` when written, `Ok(false)` when queued.
    pub(crate) fn send(&mut self, line: String) -> Result<bool, ConnectionError> {
        let line = match (&self.socket, self.is_open()) {
            (Some(socket), true) => match socket.send_text(line) {
                Ok(()) => return Ok(true),
                // Writer is gone; the close event follows shortly
                Err(line) => line,
            },
            _ => line,
        };

        if self.queue.len() >= self.max_queued {
            return Err(ConnectionError::QueueFull {
                conversation_id: self.id.clone(),
                capacity: self.max_queued,
            });
        }

        self.queue.push_back(line);
        debug!("[CONN] {} queued payload ({} waiting)", self.id, self.queue.len());
        Ok(false)
    }

    /// Cancel every timer, close with normal closure and discard the queue
    pub(crate) fn disconnect(&mut self, shared: &Shared, out: &mut Vec<ConnectionEvent>) {
        self.cancel_tasks(shared);
        let was_open = self.is_open();

        self.apply(LinkEvent::DisconnectRequested, out);
        if let Some(socket) = self.socket.take() {
            socket.close(defaults::NORMAL_CLOSURE, "client disconnect");
        }
        self.heartbeat.on_close();
        if was_open {
            out.push(ConnectionEvent::Closed {
                conversation_id: self.id.clone(),
                code: Some(defaults::NORMAL_CLOSURE),
            });
        }
        self.apply(LinkEvent::CloseConfirmed, out);

        if !self.queue.is_empty() {
            warn!(
                "[CONN] {} discarding {} queued payloads",
                self.id,
                self.queue.len()
            );
            self.queue.clear();
        }
        info!("[CONN] {} disconnected", self.id);
    }

    pub(crate) fn on_connect_result(
        &mut self,
        shared: &Shared,
        result: Result<TransportSocket, TransportError>,
        out: &mut Vec<ConnectionEvent>,
    ) {
        self.tasks.attempt = None;
        match result {
            Ok(socket) => self.on_opened(shared, socket, out),
            Err(e) => {
                warn!("[CONN] {} open failed: {}", self.id, e);
                let message = e.to_string();
                self.last_error = Some(message.clone());
                out.push(self.error(ErrorInfo::Transport(message)));
                self.handle_close(shared, None, out);
            }
        }
    }

    pub(crate) fn on_socket_event(
        &mut self,
        shared: &Shared,
        event: SocketEvent,
        out: &mut Vec<ConnectionEvent>,
    ) {
        match event {
            SocketEvent::Text(text) => match codec::decode_frame(&text) {
                Ok(records) => {
                    for record in records {
                        match record {
                            Ok(frame) => self.on_frame(frame, out),
                            Err(e) => self.on_malformed(e, out),
                        }
                    }
                }
                Err(e) => self.on_malformed(e, out),
            },
            SocketEvent::Error(message) => {
                warn!("[CONN] {} socket error: {}", self.id, message);
                self.last_error = Some(message.clone());
                out.push(self.error(ErrorInfo::Transport(message)));
            }
            SocketEvent::Closed { code, reason } => {
                info!(
                    "[CONN] {} socket closed (code {:?}) {}",
                    self.id, code, reason
                );
                self.handle_close(shared, code, out);
            }
        }
    }

    pub(crate) fn on_timer(
        &mut self,
        shared: &Shared,
        timer: TimerKind,
        out: &mut Vec<ConnectionEvent>,
    ) {
        match timer {
            TimerKind::Retry => {
                self.tasks.retry = None;
                if self.apply(LinkEvent::RetryDue, out).is_valid() {
                    self.begin_attempt(shared);
                }
            }
            TimerKind::Heartbeat => self.send_ping(shared),
            TimerKind::PongTimeout { timestamp } => {
                if self.heartbeat.on_pong_timeout(timestamp) {
                    self.tasks.pong = None;
                    warn!(
                        "[HB] {} no pong within {:?}, link unstable",
                        self.id,
                        shared.config.pong_timeout()
                    );
                }
            }
        }
    }

    fn on_opened(&mut self, shared: &Shared, socket: TransportSocket, out: &mut Vec<ConnectionEvent>) {
        if !self.apply(LinkEvent::Opened, out).is_valid() {
            socket.close(defaults::NORMAL_CLOSURE, "superseded");
            return;
        }
        let (writer, inbound) = socket.split();

        self.last_error = None;
        self.heartbeat.on_open();
        self.tasks.reader = Some(spawn_reader(shared, &self.id, self.epoch, inbound));
        if shared.config.enable_heartbeat {
            self.tasks.heartbeat = Some(spawn_timer(
                shared,
                &self.id,
                self.epoch,
                shared.config.heartbeat_interval(),
                TimerKind::Heartbeat,
            ));
        }

        let queued = self.queue.len();
        while let Some(line) = self.queue.pop_front() {
            if let Err(line) = writer.send_text(line) {
                self.queue.push_front(line);
                break;
            }
        }
        self.socket = Some(writer);

        info!(
            "[CONN] {} open via {} (flushed {} queued)",
            self.id,
            shared.connector.name(),
            queued - self.queue.len()
        );
        out.push(ConnectionEvent::Opened {
            conversation_id: self.id.clone(),
        });
    }

    fn on_frame(&mut self, frame: InboundFrame, out: &mut Vec<ConnectionEvent>) {
        match frame {
            InboundFrame::Ping { timestamp } => {
                self.write_control(ControlFrame::Pong { timestamp });
            }
            InboundFrame::Pong { timestamp } => {
                match self.heartbeat.on_pong(timestamp, Instant::now().into_std()) {
                    Some(latency) => {
                        if let Some(pong) = self.tasks.pong.take() {
                            pong.abort();
                        }
                        debug!("[HB] {} pong after {:?}", self.id, latency);
                    }
                    None => debug!("[HB] {} ignoring unmatched pong {}", self.id, timestamp),
                }
            }
            InboundFrame::ServerError { message } => {
                warn!("[CONN] {} server error: {}", self.id, message);
                self.last_error = Some(message.clone());
                out.push(self.error(ErrorInfo::Server(message)));
            }
            InboundFrame::Message(message) => out.push(ConnectionEvent::Message {
                conversation_id: self.id.clone(),
                message,
            }),
        }
    }

    fn on_malformed(&mut self, e: CodecError, out: &mut Vec<ConnectionEvent>) {
        warn!("[CONN] {} dropping inbound record: {}", self.id, e);
        out.push(self.error(ErrorInfo::Malformed(e.to_string())));
    }

    fn handle_close(&mut self, shared: &Shared, code: Option<u16>, out: &mut Vec<ConnectionEvent>) {
        let was_open = self.is_open();
        self.cancel_tasks(shared);
        self.socket = None;
        self.heartbeat.on_close();

        if was_open {
            out.push(ConnectionEvent::Closed {
                conversation_id: self.id.clone(),
                code,
            });
        }

        match self.apply(LinkEvent::SocketClosed { code }, out) {
            Transition::ScheduleRetry { delay, attempt, .. } => {
                warn!(
                    "[CONN] {} reconnecting in {:?} (attempt {}/{})",
                    self.id,
                    delay,
                    attempt,
                    self.fsm.max_reconnect_attempts()
                );
                self.tasks.retry = Some(spawn_timer(
                    shared,
                    &self.id,
                    self.epoch,
                    delay,
                    TimerKind::Retry,
                ));
            }
            Transition::Exhausted { attempts, .. } => {
                let info = ErrorInfo::Exhausted { attempts };
                error!("[CONN] {} {}", self.id, info);
                self.last_error = Some(info.to_string());
                out.push(self.error(info));
            }
            Transition::Moved { .. } => info!("[CONN] {} closed normally", self.id),
            Transition::Invalid { .. } => {}
        }
    }

    /// Spawn an open attempt under a fresh epoch
    fn begin_attempt(&mut self, shared: &Shared) {
        self.cancel_tasks(shared);
        self.socket = None;

        let token = shared.tokens.token();
        let url = channel_url(&shared.config.base_url, &self.id, token.as_deref());
        info!(
            "[CONN] {} connecting via {} (retry {})",
            self.id,
            shared.connector.name(),
            self.fsm.reconnect_attempts()
        );

        let connector = shared.connector.clone();
        let weak = shared.me.clone();
        let id = self.id.clone();
        let epoch = self.epoch;
        let deadline = shared.config.connect_timeout();

        self.tasks.attempt = Some(tokio::spawn(async move {
            let result = match timeout(deadline, connector.connect(&url)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(deadline.as_millis() as u64)),
            };
            if let Some(shared) = weak.upgrade() {
                shared.on_connect_result(&id, epoch, result).await;
            }
        }));
    }

    fn send_ping(&mut self, shared: &Shared) {
        self.tasks.heartbeat = None;
        if !self.is_open() || self.socket.is_none() {
            return;
        }

        // The outstanding ping keeps its deadline; a new one would hide it
        if self.heartbeat.is_awaiting_pong() {
            debug!("[HB] {} still awaiting pong, skipping ping", self.id);
        } else {
            let timestamp = self
                .heartbeat
                .begin_ping(Instant::now().into_std(), now_ms());
            self.write_control(ControlFrame::Ping { timestamp });
            self.tasks.pong = Some(spawn_timer(
                shared,
                &self.id,
                self.epoch,
                shared.config.pong_timeout(),
                TimerKind::PongTimeout { timestamp },
            ));
        }
        self.tasks.heartbeat = Some(spawn_timer(
            shared,
            &self.id,
            self.epoch,
            shared.config.heartbeat_interval(),
            TimerKind::Heartbeat,
        ));
    }

    fn write_control(&self, frame: ControlFrame) {
        let Some(socket) = &self.socket else {
            return;
        };
        match codec::encode(&frame.into()) {
            Ok(line) => {
                if socket.send_text(line).is_err() {
                    debug!("[HB] {} control frame not written, socket gone", self.id);
                }
            }
            Err(e) => error!("[HB] {} cannot encode control frame: {}", self.id, e),
        }
    }

    /// Run the state machine and report any state change
    fn apply(&mut self, event: LinkEvent, out: &mut Vec<ConnectionEvent>) -> Transition {
        let from = self.fsm.state();
        let transition = self.fsm.process_event(event);

        match transition.target() {
            Some(to) if to != from => out.push(ConnectionEvent::StateChanged {
                conversation_id: self.id.clone(),
                from,
                to,
            }),
            Some(_) => {}
            None => debug!("[CONN] {} ignoring {:?} while {}", self.id, event, from),
        }
        transition
    }

    /// Abort every task and move to a new epoch
    fn cancel_tasks(&mut self, shared: &Shared) {
        self.tasks.abort_all();
        self.epoch = shared.next_epoch();
    }

    fn error(&self, error: ErrorInfo) -> ConnectionEvent {
        ConnectionEvent::Error {
            conversation_id: self.id.clone(),
            error,
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.tasks.abort_all();
        if let Some(socket) = self.socket.take() {
            socket.close(defaults::NORMAL_CLOSURE, "client shutdown");
        }
    }
}

fn spawn_timer(
    shared: &Shared,
    id: &str,
    epoch: u64,
    delay: Duration,
    timer: TimerKind,
) -> JoinHandle<()> {
    let weak = shared.me.clone();
    let id = id.to_owned();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if let Some(shared) = weak.upgrade() {
            shared.on_timer(&id, epoch, timer).await;
        }
    })
}

/// Forward socket events until the socket closes
fn spawn_reader(
    shared: &Shared,
    id: &str,
    epoch: u64,
    mut inbound: mpsc::UnboundedReceiver<SocketEvent>,
) -> JoinHandle<()> {
    let weak = shared.me.clone();
    let id = id.to_owned();
    tokio::spawn(async move {
        loop {
            // A transport that vanishes without a close frame counts as an abnormal close
            let event = inbound.recv().await.unwrap_or(SocketEvent::Closed {
                code: None,
                reason: "transport dropped".into(),
            });
            let closed = matches!(event, SocketEvent::Closed { .. });

            let Some(shared) = weak.upgrade() else {
                break;
            };
            shared.on_socket_event(&id, epoch, event).await;
            if closed {
                break;
            }
        }
    })
}
