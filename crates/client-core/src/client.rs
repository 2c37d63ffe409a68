//! The client engine and its public handle
//!
//! All protocol state lives in one [`Engine`] owned by a single spawned
//! task. The task multiplexes three inputs with `select!`: commands from
//! [`SipClient`] handles, parsed messages from the transport, and the
//! earliest deadline across the registration refresh, every transaction's
//! retransmission timer and every call's answer timeout. Nothing else ever
//! touches the state, so there are no locks and no timer task can outlive
//! the thing it was timing.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use sipline_sip_core::SipMessage;
use sipline_sip_transport::{Transport, TransportEvent, UdpTransport};

use crate::call::Call;
use crate::config::ClientConfig;
use crate::dialog::DialogContext;
use crate::error::{ClientError, Result};
use crate::events::{CallState, ClientEvent, ConnectionState};
use crate::transaction::{TimerAction, Transaction, TransactionOwner};

const EVENT_CHANNEL_CAPACITY: usize = 128;
const COMMAND_CHANNEL_CAPACITY: usize = 32;

/// Registrations are refreshed this long before they would lapse
const REFRESH_MARGIN: Duration = Duration::from_secs(30);

/// Handle to a running client engine
///
/// Cheap to clone; every method is a message to the engine task and
/// returns once the engine has acted on it.
#[derive(Debug, Clone)]
pub struct SipClient {
    commands: mpsc::Sender<Command>,
}

/// Handle to one call, for accepting, rejecting or ending it
#[derive(Debug, Clone)]
pub struct CallHandle {
    id: String,
    commands: mpsc::Sender<Command>,
}

#[derive(Debug)]
enum Command {
    Connect { reply: oneshot::Sender<Result<()>> },
    Disconnect { reply: oneshot::Sender<Result<()>> },
    Call { recipient: String, reply: oneshot::Sender<Result<String>> },
    Accept { call_id: String, reply: oneshot::Sender<Result<()>> },
    Reject { call_id: String, reply: oneshot::Sender<Result<()>> },
    Hangup { call_id: String, reply: oneshot::Sender<Result<()>> },
}

impl SipClient {
    /// Binds the socket, spawns the engine task and returns the handle
    /// together with the event stream.
    pub async fn new(config: ClientConfig) -> Result<(SipClient, mpsc::Receiver<ClientEvent>)> {
        let (transport, transport_rx) = UdpTransport::bind(config.local_addr, None).await?;
        let local_addr = transport.local_addr()?;
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (commands, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);

        let engine = Engine::new(config, transport, local_addr, events_tx);
        tokio::spawn(engine.run(commands_rx, transport_rx));

        Ok((SipClient { commands }, events_rx))
    }

    /// Registers with the server; completion is signaled by a
    /// `ConnectionStateChanged` event reaching `Connected`.
    pub async fn connect(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Connect { reply: tx }).await?;
        rx.await.map_err(|_| ClientError::EngineStopped)?
    }

    /// Hangs up every call and un-registers
    pub async fn disconnect(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Disconnect { reply: tx }).await?;
        rx.await.map_err(|_| ClientError::EngineStopped)?
    }

    /// Places a call to a SIP address such as `sip:bob@example.com`
    pub async fn call(&self, recipient: impl Into<String>) -> Result<CallHandle> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Call {
            recipient: recipient.into(),
            reply: tx,
        })
        .await?;
        let id = rx.await.map_err(|_| ClientError::EngineStopped)??;
        Ok(CallHandle {
            id,
            commands: self.commands.clone(),
        })
    }

    /// Builds a handle for a call announced by a `CallReceived` event
    pub fn call_handle(&self, call_id: impl Into<String>) -> CallHandle {
        CallHandle {
            id: call_id.into(),
            commands: self.commands.clone(),
        }
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ClientError::EngineStopped)
    }
}

impl CallHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Answers an incoming call
    pub async fn accept(&self) -> Result<()> {
        self.send(|reply| Command::Accept {
            call_id: self.id.clone(),
            reply,
        })
        .await
    }

    /// Declines an incoming call
    pub async fn reject(&self) -> Result<()> {
        self.send(|reply| Command::Reject {
            call_id: self.id.clone(),
            reply,
        })
        .await
    }

    /// Ends the call, cancelling the INVITE if it is still unanswered
    pub async fn hangup(&self) -> Result<()> {
        self.send(|reply| Command::Hangup {
            call_id: self.id.clone(),
            reply,
        })
        .await
    }

    async fn send(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<()>>) -> Command,
    ) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| ClientError::EngineStopped)?;
        rx.await.map_err(|_| ClientError::EngineStopped)?
    }
}

/// Registration dialog state: the exchange shares one call id and one
/// CSeq space across REGISTER and SUBSCRIBE.
#[derive(Debug)]
struct Registration {
    ctx: DialogContext,
    call_id: String,
    /// The last REGISTER or SUBSCRIBE sent, kept for the auth retry
    request: Option<SipMessage>,
    refresh_at: Option<Instant>,
}

impl Registration {
    fn new() -> Self {
        Registration {
            ctx: DialogContext::new(),
            call_id: random_hex(32),
            request: None,
            refresh_at: None,
        }
    }

    fn schedule_refresh(&mut self, granted_secs: u32) {
        let margin = REFRESH_MARGIN.as_secs() as u32;
        let delay = if granted_secs > margin {
            granted_secs - margin
        } else {
            granted_secs.max(2) / 2
        };
        self.refresh_at = Some(Instant::now() + Duration::from_secs(u64::from(delay)));
    }
}

/// All mutable client state, owned by the engine task
pub(crate) struct Engine {
    pub(crate) config: ClientConfig,
    transport: UdpTransport,
    local_addr: SocketAddr,
    events_tx: mpsc::Sender<ClientEvent>,
    state: ConnectionState,
    /// Our `From` tag, fixed for the lifetime of the engine
    tag: String,
    /// Contact instance id, fixed for the lifetime of the engine
    rinstance: String,
    registration: Registration,
    /// Public address the server saw us from, learned via `received`/`rport`
    reflexive: Option<SocketAddr>,
    calls: HashMap<String, Call>,
    transactions: Vec<Transaction>,
}

impl Engine {
    pub(crate) fn new(
        config: ClientConfig,
        transport: UdpTransport,
        local_addr: SocketAddr,
        events_tx: mpsc::Sender<ClientEvent>,
    ) -> Engine {
        Engine {
            config,
            transport,
            local_addr,
            events_tx,
            state: ConnectionState::Disconnected,
            tag: random_hex(16),
            rinstance: random_hex(16),
            registration: Registration::new(),
            reflexive: None,
            calls: HashMap::new(),
            transactions: Vec::new(),
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut transport_rx: mpsc::Receiver<TransportEvent>,
    ) {
        info!(local = %self.local_addr, server = %self.config.server_addr, "client engine started");
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    // every handle dropped, shut down
                    None => break,
                },
                event = transport_rx.recv() => match event {
                    Some(TransportEvent::MessageReceived { message, source }) => {
                        self.on_message(message, source).await;
                    }
                    Some(TransportEvent::Error { error }) => {
                        self.transport_failed(format!("transport error: {}", error))
                            .await;
                    }
                    Some(TransportEvent::Closed) | None => break,
                },
                _ = sleep_or_forever(deadline) => {
                    self.on_deadline(Instant::now()).await;
                }
            }
        }
        let _ = self.transport.close().await;
        info!("client engine stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { reply } => {
                let _ = reply.send(self.connect().await);
            }
            Command::Disconnect { reply } => {
                let _ = reply.send(self.disconnect().await);
            }
            Command::Call { recipient, reply } => {
                let _ = reply.send(self.place_call(&recipient).await);
            }
            Command::Accept { call_id, reply } => {
                let _ = reply.send(self.with_call(&call_id, CallOp::Accept).await);
            }
            Command::Reject { call_id, reply } => {
                let _ = reply.send(self.with_call(&call_id, CallOp::Reject).await);
            }
            Command::Hangup { call_id, reply } => {
                let _ = reply.send(self.with_call(&call_id, CallOp::Hangup).await);
            }
        }
    }

    async fn connect(&mut self) -> Result<()> {
        if self.state != ConnectionState::Disconnected {
            return Err(ClientError::InvalidState {
                message: format!("cannot connect while {:?}", self.state),
            });
        }
        info!(server = %self.config.server_addr, "connecting to SIP server");

        self.registration = Registration::new();
        self.send_register().await?;
        self.set_state(ConnectionState::Connecting).await;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.registration.refresh_at = None;

        let ids: Vec<String> = self.calls.keys().cloned().collect();
        for id in ids {
            if let Some(mut call) = self.calls.remove(&id) {
                if let Err(e) = call.hangup(self).await {
                    warn!(call_id = %id, "failed to hang up: {}", e);
                }
                self.reinsert(call);
            }
        }

        match self.state {
            ConnectionState::Connected => {
                let uri = format!("sip:{}", self.config.domain);
                let cseq = self.registration.ctx.next_cseq();
                let call_id = self.registration.call_id.clone();
                let mut request = self.build_request("REGISTER", &uri, &call_id, cseq);
                // zero-lifetime binding removes our contact from the registrar
                let contact = request.header("Contact").unwrap_or_default();
                request.set_header("Contact", format!("{};expires=0", contact));
                self.prepare_request(&mut request, &self.registration.ctx);
                if let Err(e) = self
                    .start_transaction(request.clone(), TransactionOwner::Registration)
                    .await
                {
                    self.transport_failed(format!("failed to send REGISTER: {}", e))
                        .await;
                    return Ok(());
                }
                self.registration.request = Some(request);
                self.set_state(ConnectionState::Disconnecting).await;
            }
            ConnectionState::Disconnected => {}
            _ => {
                // an in-flight registration is abandoned; its late replies
                // must not revive the connection
                self.transactions
                    .retain(|tx| tx.owner() != &TransactionOwner::Registration);
                self.registration.request = None;
                self.set_state(ConnectionState::Disconnected).await;
            }
        }
        Ok(())
    }

    async fn place_call(&mut self, recipient: &str) -> Result<String> {
        if self.state != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }
        let id = random_hex(32);
        info!(call_id = %id, %recipient, "placing call");
        let mut call = Call::outgoing(id.clone(), recipient);
        let result = call.start(self).await;
        self.reinsert(call);
        result.map(|_| id)
    }

    async fn with_call(&mut self, call_id: &str, op: CallOp) -> Result<()> {
        let mut call = self
            .calls
            .remove(call_id)
            .ok_or_else(|| ClientError::UnknownCall {
                call_id: call_id.to_string(),
            })?;
        let result = match op {
            CallOp::Accept => call.accept(self).await,
            CallOp::Reject => call.reject(self).await,
            CallOp::Hangup => call.hangup(self).await,
        };
        self.reinsert(call);
        result
    }

    /// Puts a call back into the map unless it has finished
    fn reinsert(&mut self, call: Call) {
        if call.state() != CallState::Finished {
            self.calls.insert(call.id().to_string(), call);
        } else {
            debug!(call_id = %call.id(), "call finished");
        }
    }

    async fn on_message(&mut self, message: SipMessage, source: SocketAddr) {
        if message.is_reply() {
            self.on_reply(message).await;
        } else {
            self.on_request(message, source).await;
        }
    }

    async fn on_reply(&mut self, reply: SipMessage) {
        // Transactions get first pick: they consume the replies to the
        // requests they are retransmitting.
        if let Some(index) = self.transactions.iter().position(|tx| tx.matches(&reply)) {
            if !self.transactions[index].on_reply(&reply) {
                return;
            }
            let tx = self.transactions.remove(index);
            self.transaction_concluded(tx, Some(reply)).await;
            return;
        }

        let call_id = match reply.header("Call-ID") {
            Some(id) => id,
            None => {
                warn!("dropping reply without Call-ID");
                return;
            }
        };
        if call_id == self.registration.call_id {
            warn!("dropping registration reply outside any transaction");
            return;
        }
        let Some(mut call) = self.calls.remove(&call_id) else {
            debug!(%call_id, "dropping reply for unknown call");
            return;
        };
        let result = call.handle_reply(self, &reply).await;
        self.reinsert(call);
        if let Err(e) = result {
            self.signaling_failed(e).await;
        }
    }

    async fn on_request(&mut self, request: SipMessage, source: SocketAddr) {
        let call_id = match request.header("Call-ID") {
            Some(id) => id,
            None => {
                warn!(%source, "dropping request without Call-ID");
                return;
            }
        };

        if let Some(mut call) = self.calls.remove(&call_id) {
            let result = call.handle_request(self, &request).await;
            self.reinsert(call);
            if let Err(e) = result {
                self.signaling_failed(e).await;
            }
            return;
        }

        if request.method() == Some("INVITE") {
            match Call::incoming(&request) {
                Some(call) => {
                    info!(%call_id, remote = %call.remote(), "incoming call");
                    let ringing = self.build_response(&request, 180, "Ringing");
                    if let Err(e) = self.send_message(&ringing).await {
                        warn!("failed to send 180: {}", e);
                    }
                    self.emit(ClientEvent::CallReceived {
                        call_id: call.id().to_string(),
                        remote: call.remote().to_string(),
                    })
                    .await;
                    self.calls.insert(call.id().to_string(), call);
                }
                None => warn!(%source, "dropping INVITE without dialog headers"),
            }
            return;
        }

        debug!(%call_id, "dropping request for unknown dialog");
    }

    /// A transaction reached its end: final reply, or `None` on timeout
    async fn transaction_concluded(&mut self, tx: Transaction, reply: Option<SipMessage>) {
        match tx.owner().clone() {
            TransactionOwner::Registration => match reply {
                Some(reply) => self.handle_registration_reply(reply).await,
                None => {
                    self.emit(ClientEvent::Error {
                        message: format!("no reply from server to {}", tx.method()),
                    })
                    .await;
                    self.registration.refresh_at = None;
                    self.set_state(ConnectionState::Disconnected).await;
                }
            },
            TransactionOwner::Call(call_id) => {
                let Some(mut call) = self.calls.remove(&call_id) else {
                    return;
                };
                let _ = call
                    .transaction_finished(self, tx.method(), reply.is_none())
                    .await;
                self.reinsert(call);
            }
        }
    }

    async fn handle_registration_reply(&mut self, reply: SipMessage) {
        let status = reply.status_code().unwrap_or(0);
        let method = reply.cseq_method().unwrap_or_default();

        match status {
            401 | 407 => self.retry_registration(reply, status).await,
            200..=299 if method == "REGISTER" => self.handle_registered(reply).await,
            200..=299 if method == "SUBSCRIBE" => {
                self.set_state(ConnectionState::Connected).await;
            }
            100..=299 => {}
            _ => {
                self.emit(ClientEvent::Error {
                    message: format!(
                        "registration failed: {} {}",
                        status,
                        reply.reason_phrase().unwrap_or("")
                    ),
                })
                .await;
                self.registration.refresh_at = None;
                self.set_state(ConnectionState::Disconnected).await;
            }
        }
    }

    /// Answers a challenge by re-sending the challenged request with
    /// credentials. A second challenge for the same request means the
    /// credentials are wrong and the client gives up.
    async fn retry_registration(&mut self, reply: SipMessage, status: u16) {
        let challenged = match self.registration.request.clone() {
            Some(request)
                if !DialogContext::already_answered(status, &request)
                    && self.registration.ctx.store_challenge(&reply).is_ok() =>
            {
                Some(request)
            }
            _ => None,
        };
        let Some(mut retry) = challenged else {
            self.emit(ClientEvent::Error {
                message: "authentication failed, check your credentials".to_string(),
            })
            .await;
            self.registration.refresh_at = None;
            self.set_state(ConnectionState::Disconnected).await;
            return;
        };
        let cseq = self.registration.ctx.next_cseq();
        let method = retry.method().unwrap_or("REGISTER").to_string();
        retry.set_header("CSeq", format!("{} {}", cseq, method));
        self.prepare_request(&mut retry, &self.registration.ctx);
        if let Err(e) = self
            .start_transaction(retry.clone(), TransactionOwner::Registration)
            .await
        {
            self.transport_failed(format!("failed to send {}: {}", method, e))
                .await;
            return;
        }
        self.registration.request = Some(retry);
    }

    async fn handle_registered(&mut self, reply: SipMessage) {
        match self.state {
            ConnectionState::Disconnecting => {
                self.set_state(ConnectionState::Disconnected).await;
                return;
            }
            // Disconnected is left only through connect(); a reply to a
            // REGISTER abandoned by disconnect() changes nothing
            ConnectionState::Disconnected => return,
            ConnectionState::Connecting | ConnectionState::Connected => {}
        }

        // Learn our public address from the Via the server echoed back.
        let params = reply.header_parameters("Via");
        if let (Some(received), Some(rport)) = (params.get("received"), params.get("rport")) {
            if let (Ok(ip), Ok(port)) = (received.parse::<IpAddr>(), rport.parse::<u16>()) {
                let addr = SocketAddr::new(ip, port);
                if self.reflexive != Some(addr) {
                    info!(%addr, "discovered reflexive address");
                    self.reflexive = Some(addr);
                }
            }
        }

        let granted = reply
            .header("Expires")
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(self.config.register_expires);
        self.registration.schedule_refresh(granted);

        // Subscribe to our own address; completing it is what makes the
        // client Connected.
        let uri = self.config.uri();
        let cseq = self.registration.ctx.next_cseq();
        let call_id = self.registration.call_id.clone();
        let mut request = self.build_request("SUBSCRIBE", &uri, &call_id, cseq);
        request.set_header("Expires", self.config.register_expires.to_string());
        self.prepare_request(&mut request, &self.registration.ctx);
        if let Err(e) = self
            .start_transaction(request.clone(), TransactionOwner::Registration)
            .await
        {
            self.transport_failed(format!("failed to send SUBSCRIBE: {}", e))
                .await;
            return;
        }
        self.registration.request = Some(request);
    }

    async fn send_register(&mut self) -> Result<()> {
        let uri = format!("sip:{}", self.config.domain);
        let cseq = self.registration.ctx.next_cseq();
        let call_id = self.registration.call_id.clone();
        let mut request = self.build_request("REGISTER", &uri, &call_id, cseq);
        request.set_header("Expires", self.config.register_expires.to_string());
        self.prepare_request(&mut request, &self.registration.ctx);
        self.start_transaction(request.clone(), TransactionOwner::Registration)
            .await?;
        self.registration.request = Some(request);
        Ok(())
    }

    /// Earliest deadline across the refresh timer, every transaction and
    /// every call. `None` means nothing is waiting on time.
    fn next_deadline(&self) -> Option<Instant> {
        let mut deadline = self.registration.refresh_at;
        for tx in &self.transactions {
            deadline = earliest(deadline, Some(tx.next_deadline()));
        }
        for call in self.calls.values() {
            deadline = earliest(deadline, call.next_deadline());
        }
        deadline
    }

    async fn on_deadline(&mut self, now: Instant) {
        if self.registration.refresh_at.is_some_and(|at| now >= at) {
            self.registration.refresh_at = None;
            if self.state == ConnectionState::Connected {
                debug!("refreshing registration");
                if let Err(e) = self.send_register().await {
                    self.transport_failed(format!("failed to refresh registration: {}", e))
                        .await;
                }
            }
        }

        // Transaction timers: retransmit in place, collect the expired.
        let mut timed_out = Vec::new();
        let mut send_failure = None;
        let mut index = 0;
        while index < self.transactions.len() {
            match self.transactions[index].poll(now) {
                Some(TimerAction::TimedOut) => {
                    timed_out.push(self.transactions.remove(index));
                }
                Some(TimerAction::Retransmit(bytes)) => {
                    let destination = self.transactions[index].destination();
                    debug!(method = self.transactions[index].method(), "retransmitting");
                    if let Err(e) = self.transport.send_bytes(&bytes, destination).await {
                        send_failure = Some(e);
                        break;
                    }
                    index += 1;
                }
                None => index += 1,
            }
        }
        if let Some(error) = send_failure {
            self.transport_failed(format!("retransmission failed: {}", error))
                .await;
            return;
        }
        for tx in timed_out {
            warn!(method = tx.method(), "transaction timed out");
            self.transaction_concluded(tx, None).await;
        }

        // Call answer timeouts.
        let expired: Vec<String> = self
            .calls
            .iter()
            .filter(|(_, call)| call.next_deadline().is_some_and(|at| now >= at))
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            if let Some(mut call) = self.calls.remove(&id) {
                let _ = call.on_timeout(self).await;
                self.reinsert(call);
            }
        }
    }

    // --- helpers lent to calls ---

    /// Builds a request with the headers every request shares. `To` is set
    /// to our own address; callers override it for remote parties.
    pub(crate) fn build_request(
        &self,
        method: &str,
        uri: &str,
        call_id: &str,
        cseq: u32,
    ) -> SipMessage {
        let address = self.config.address();
        let mut request = SipMessage::request(method, uri);
        request.set_header(
            "Via",
            format!(
                "SIP/2.0/UDP {};branch=z9hG4bK-{};rport",
                self.local_addr,
                random_hex(16)
            ),
        );
        request.set_header("Max-Forwards", "70");
        request.set_header("Call-ID", call_id);
        request.set_header("CSeq", format!("{} {}", cseq, method));
        request.set_header("Contact", self.contact_value());
        request.set_header("To", &address);
        request.set_header("From", format!("{};tag={}", address, self.tag));
        if method != "ACK" && method != "CANCEL" {
            request.set_header(
                "Allow",
                "INVITE, ACK, CANCEL, OPTIONS, BYE, NOTIFY, MESSAGE, SUBSCRIBE, INFO",
            );
        }
        request
    }

    /// Builds a response echoing the request's routing headers
    pub(crate) fn build_response(
        &self,
        request: &SipMessage,
        status: u16,
        reason: &str,
    ) -> SipMessage {
        let mut response = SipMessage::reply(status, reason);
        for name in ["Via", "Record-Route", "From", "To", "Call-ID", "CSeq"] {
            for value in request.header_values(name) {
                response.add_header(name, value.to_string());
            }
        }
        response.add_header("Contact", self.contact_value());
        response
    }

    /// Attaches credentials and the user agent; done last, just before a
    /// request goes on the wire or into a transaction.
    pub(crate) fn prepare_request(&self, request: &mut SipMessage, ctx: &DialogContext) {
        ctx.apply_authorization(request, &self.config.username, &self.config.password);
        request.set_header("User-Agent", self.config.user_agent.clone());
    }

    pub(crate) async fn send_message(&self, message: &SipMessage) -> Result<()> {
        self.transport
            .send_message(message, self.config.server_addr)
            .await?;
        Ok(())
    }

    async fn start_transaction(
        &mut self,
        request: SipMessage,
        owner: TransactionOwner,
    ) -> Result<()> {
        let tx = Transaction::new(&request, self.config.server_addr, owner, Instant::now());
        self.transport.send_bytes(tx.wire(), tx.destination()).await?;
        self.transactions.push(tx);
        Ok(())
    }

    pub(crate) async fn start_call_transaction(
        &mut self,
        request: SipMessage,
        call_id: &str,
    ) -> Result<()> {
        self.start_transaction(request, TransactionOwner::Call(call_id.to_string()))
            .await
    }

    /// A dead socket is fatal: everything waiting on the wire is dropped
    /// and the client returns to Disconnected.
    async fn transport_failed(&mut self, message: String) {
        warn!("{}", message);
        self.emit(ClientEvent::Error { message }).await;
        self.registration.refresh_at = None;
        self.registration.request = None;
        self.transactions.clear();
        self.set_state(ConnectionState::Disconnected).await;
    }

    /// Routes a call-level failure: send errors take the whole client
    /// down, anything else is reported and contained to the call.
    async fn signaling_failed(&mut self, error: ClientError) {
        let message = format!("call signaling failed: {}", error);
        match error {
            ClientError::Transport(_) => self.transport_failed(message).await,
            _ => self.emit(ClientEvent::Error { message }).await,
        }
    }

    pub(crate) async fn emit(&self, event: ClientEvent) {
        if self.events_tx.send(event).await.is_err() {
            debug!("event receiver dropped");
        }
    }

    async fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        let previous = std::mem::replace(&mut self.state, state);
        info!(?previous, current = ?state, "connection state changed");
        self.emit(ClientEvent::ConnectionStateChanged {
            previous,
            current: state,
        })
        .await;
    }

    /// The address we put in `Contact` headers and SDP: the reflexive
    /// address once the server has told us one, the local socket before.
    pub(crate) fn contact_host(&self) -> SocketAddr {
        self.reflexive.unwrap_or(self.local_addr)
    }

    fn contact_value(&self) -> String {
        let host = self.contact_host();
        format!(
            "<sip:{}@{};rinstance={}>",
            self.config.username, host, self.rinstance
        )
    }

    pub(crate) fn local_tag(&self) -> &str {
        &self.tag
    }

    /// Fresh SDP origin session id
    pub(crate) fn session_id(&self) -> u64 {
        u64::from(rand::thread_rng().gen::<u32>())
    }
}

#[derive(Debug, Clone, Copy)]
enum CallOp {
    Accept,
    Reject,
    Hangup,
}

async fn sleep_or_forever(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => futures::future::pending().await,
    }
}

fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

fn random_hex(digits: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..digits / 2)
        .map(|_| format!("{:02x}", rng.gen::<u8>()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn engine() -> Engine {
        let config = ClientConfig::new(
            "alice",
            "secret",
            "example.com",
            "127.0.0.1:5060".parse().unwrap(),
        );
        let (transport, _rx) = UdpTransport::bind("127.0.0.1:0".parse().unwrap(), None)
            .await
            .unwrap();
        let local_addr = transport.local_addr().unwrap();
        let (events_tx, _events_rx) = mpsc::channel(8);
        Engine::new(config, transport, local_addr, events_tx)
    }

    #[tokio::test]
    async fn requests_carry_shared_headers() {
        let engine = engine().await;
        let request = engine.build_request("REGISTER", "sip:example.com", "abc", 3);
        assert_eq!(request.method(), Some("REGISTER"));
        assert_eq!(request.header("Call-ID").as_deref(), Some("abc"));
        assert_eq!(request.header("CSeq").as_deref(), Some("3 REGISTER"));
        assert_eq!(request.header("Max-Forwards").as_deref(), Some("70"));
        let via = request.header("Via").unwrap();
        assert!(via.starts_with("SIP/2.0/UDP "));
        assert!(via.contains(";branch=z9hG4bK-"));
        assert!(via.ends_with(";rport"));
        let from = request.header("From").unwrap();
        assert!(from.starts_with("<sip:alice@example.com>;tag="));
        assert!(request.header("Allow").is_some());
        assert!(request
            .header("Contact")
            .unwrap()
            .contains(";rinstance="));
    }

    #[tokio::test]
    async fn ack_and_cancel_omit_allow() {
        let engine = engine().await;
        for method in ["ACK", "CANCEL"] {
            let request = engine.build_request(method, "sip:bob@example.com", "abc", 1);
            assert!(request.header("Allow").is_none(), "{} carried Allow", method);
        }
    }

    #[tokio::test]
    async fn responses_echo_routing_headers() {
        let engine = engine().await;
        let mut invite = SipMessage::request("INVITE", "sip:alice@example.com");
        invite.add_header("Via", "SIP/2.0/UDP proxy.example.com;branch=z9hG4bK-1");
        invite.add_header("Via", "SIP/2.0/UDP 10.0.0.2:5060;branch=z9hG4bK-2");
        invite.set_header("Record-Route", "<sip:proxy.example.com;lr>");
        invite.set_header("From", "<sip:bob@example.com>;tag=b1");
        invite.set_header("To", "<sip:alice@example.com>");
        invite.set_header("Call-ID", "xyz");
        invite.set_header("CSeq", "1 INVITE");

        let response = engine.build_response(&invite, 200, "OK");
        assert_eq!(response.status_code(), Some(200));
        assert_eq!(
            response.header_values("Via"),
            invite.header_values("Via")
        );
        assert_eq!(response.header("Record-Route"), invite.header("Record-Route"));
        assert_eq!(response.header("CSeq").as_deref(), Some("1 INVITE"));
        assert!(response.header("Contact").is_some());
    }

    #[tokio::test]
    async fn reflexive_address_feeds_contact() {
        let mut engine = engine().await;
        let before = engine.contact_host();
        assert_eq!(before, engine.local_addr);
        engine.reflexive = Some("1.2.3.4:9999".parse().unwrap());
        assert_eq!(engine.contact_host(), "1.2.3.4:9999".parse().unwrap());
        assert!(engine.contact_value().contains("alice@1.2.3.4:9999"));
    }

    #[tokio::test]
    async fn unanswered_invite_times_out() {
        let config = ClientConfig::new(
            "alice",
            "secret",
            "example.com",
            "127.0.0.1:5060".parse().unwrap(),
        );
        let (transport, _rx) = UdpTransport::bind("127.0.0.1:0".parse().unwrap(), None)
            .await
            .unwrap();
        let local_addr = transport.local_addr().unwrap();
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let mut engine = Engine::new(config, transport, local_addr, events_tx);

        let mut call = Call::outgoing(random_hex(32), "sip:bob@example.com");
        call.start(&mut engine).await.unwrap();
        assert!(call.next_deadline().is_some());
        assert!(matches!(
            events_rx.recv().await.unwrap(),
            ClientEvent::CallStateChanged {
                current: CallState::Connecting,
                ..
            }
        ));

        call.on_timeout(&mut engine).await.unwrap();
        assert!(call.next_deadline().is_none());
        assert!(matches!(
            events_rx.recv().await.unwrap(),
            ClientEvent::Error { .. }
        ));
        assert!(matches!(
            events_rx.recv().await.unwrap(),
            ClientEvent::CallStateChanged {
                current: CallState::Finished,
                ..
            }
        ));
        assert_eq!(call.state(), CallState::Finished);
    }

    #[tokio::test]
    async fn send_failure_disconnects_the_engine() {
        let mut engine = engine().await;
        engine.state = ConnectionState::Connected;
        let request = engine.build_request("REGISTER", "sip:example.com", "reg-1", 1);
        engine
            .start_transaction(request, TransactionOwner::Registration)
            .await
            .unwrap();
        engine.transport.close().await.unwrap();

        // the retransmission hits the dead socket
        let deadline = engine.next_deadline().unwrap();
        engine.on_deadline(deadline).await;

        assert_eq!(engine.state, ConnectionState::Disconnected);
        assert!(engine.transactions.is_empty());
    }

    #[test]
    fn refresh_is_scheduled_before_expiry() {
        let mut registration = Registration::new();
        registration.schedule_refresh(300);
        let now = Instant::now();
        let at = registration.refresh_at.unwrap();
        let delay = at - now;
        assert!(delay >= Duration::from_secs(269) && delay <= Duration::from_secs(270));

        // Tiny grants still refresh at half their lifetime.
        registration.schedule_refresh(10);
        let delay = registration.refresh_at.unwrap() - Instant::now();
        assert!(delay <= Duration::from_secs(5));
    }
}
