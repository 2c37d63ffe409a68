//! Call dialog state machine
//!
//! A [`Call`] owns everything scoped to one dialog: its identifiers, the
//! remote party's route and media parameters, the pending INVITE (kept
//! around both for the auth retry and for building the ACK) and the answer
//! timeout. It performs no I/O of its own; the engine lends itself to every
//! method so the call can build and send messages through the one socket.
//!
//! States move strictly forward: Offer, Connecting, Active, Disconnecting,
//! Finished. A BYE received in any state still gets its 200 OK and lands
//! the call in Finished.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use sipline_sip_core::{SdpMessage, SipMessage};

use crate::client::Engine;
use crate::codec::{select_codec, AudioCodec, TELEPHONE_EVENT_ID};
use crate::config::DEFAULT_INVITE_TIMEOUT_SECS;
use crate::dialog::DialogContext;
use crate::error::{ClientError, Result};
use crate::events::{CallDirection, CallState, ClientEvent};

const INVITE_TIMEOUT: Duration = Duration::from_secs(DEFAULT_INVITE_TIMEOUT_SECS);

/// One call dialog, incoming or outgoing
#[derive(Debug)]
pub(crate) struct Call {
    id: String,
    direction: CallDirection,
    state: CallState,
    ctx: DialogContext,
    /// The remote party in header form, e.g. `"Bob" <sip:bob@example.com>`
    recipient: String,
    /// Request-URI used for the INVITE and a later CANCEL
    invite_uri: String,
    /// True between sending an INVITE and receiving its final reply
    invite_pending: bool,
    /// Our INVITE as sent, for the auth retry and the ACK
    invite_request: Option<SipMessage>,
    /// The peer's INVITE, kept until the application accepts or rejects
    incoming_invite: Option<SipMessage>,
    /// `To` value from the latest reply, carrying the remote tag
    remote_recipient: Option<String>,
    /// Remote target from `Contact`, where in-dialog requests go
    remote_uri: Option<String>,
    /// `Record-Route` to echo as `Route` on in-dialog requests
    remote_route: Option<String>,
    remote_rtp: Option<SocketAddr>,
    codec: Option<AudioCodec>,
    /// When the pending INVITE gives up waiting for an answer
    timeout_at: Option<Instant>,
}

impl Call {
    pub(crate) fn outgoing(id: String, recipient: &str) -> Call {
        Call {
            id,
            direction: CallDirection::Outgoing,
            state: CallState::Offer,
            ctx: DialogContext::new(),
            recipient: address_form(recipient),
            invite_uri: address_uri(recipient),
            invite_pending: false,
            invite_request: None,
            incoming_invite: None,
            remote_recipient: None,
            remote_uri: None,
            remote_route: None,
            remote_rtp: None,
            codec: None,
            timeout_at: None,
        }
    }

    /// Builds a call from a peer's INVITE. `None` when the INVITE lacks
    /// the headers needed to identify a dialog.
    pub(crate) fn incoming(invite: &SipMessage) -> Option<Call> {
        let id = invite.header("Call-ID")?;
        let from = invite.header("From")?;
        let contact = invite.header("Contact").map(|c| strip_angle(&c));
        Some(Call {
            id,
            direction: CallDirection::Incoming,
            state: CallState::Connecting,
            ctx: DialogContext::new(),
            invite_uri: contact.clone().unwrap_or_else(|| address_uri(&from)),
            invite_pending: false,
            invite_request: None,
            incoming_invite: Some(invite.clone()),
            remote_recipient: Some(from.clone()),
            remote_uri: contact,
            remote_route: invite.header("Record-Route"),
            remote_rtp: None,
            codec: None,
            timeout_at: None,
            recipient: from,
        })
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn state(&self) -> CallState {
        self.state
    }

    pub(crate) fn remote(&self) -> &str {
        &self.recipient
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.timeout_at
    }

    /// Sends the INVITE with our SDP offer and starts the answer timeout
    pub(crate) async fn start(&mut self, engine: &mut Engine) -> Result<()> {
        let cseq = self.ctx.next_cseq();
        let mut request = engine.build_request("INVITE", &self.invite_uri, &self.id, cseq);
        request.set_header("To", &self.recipient);
        request.set_header("Content-Type", "application/sdp");
        request.set_body(build_offer(engine).to_bytes());
        engine.prepare_request(&mut request, &self.ctx);
        engine.send_message(&request).await?;

        self.invite_request = Some(request);
        self.invite_pending = true;
        self.timeout_at = Some(Instant::now() + INVITE_TIMEOUT);
        self.set_state(engine, CallState::Connecting).await;
        Ok(())
    }

    /// Handles a reply routed to this dialog. Only INVITE replies arrive
    /// here; BYE and CANCEL replies are consumed by their transactions.
    pub(crate) async fn handle_reply(&mut self, engine: &mut Engine, reply: &SipMessage) -> Result<()> {
        if let Some(to) = reply.header("To") {
            self.remote_recipient = Some(to);
        }
        if let Some(contact) = reply.header("Contact") {
            self.remote_uri = Some(strip_angle(&contact));
        }
        if let Some(route) = reply.header("Record-Route") {
            self.remote_route = Some(route);
        }

        if reply.cseq_method().as_deref() != Some("INVITE") {
            debug!(call_id = %self.id, "ignoring reply outside the INVITE exchange");
            return Ok(());
        }

        let status = reply.status_code().unwrap_or(0);

        // Every final INVITE reply is acknowledged, including rejections
        // and authentication challenges.
        if status >= 200 && self.invite_pending {
            self.invite_pending = false;
            self.send_ack(engine, reply).await?;
        }

        match status {
            180 => {
                engine
                    .emit(ClientEvent::Ringing {
                        call_id: self.id.clone(),
                    })
                    .await;
            }
            100..=199 => {}
            401 | 407 => self.retry_invite(engine, reply, status).await?,
            200..=299 => self.handle_invite_accepted(engine, reply).await?,
            _ => {
                self.timeout_at = None;
                // a rejection of an INVITE we already cancelled is expected
                if self.state != CallState::Disconnecting {
                    engine
                        .emit(ClientEvent::Error {
                            message: format!(
                                "call failed: {} {}",
                                status,
                                reply.reason_phrase().unwrap_or("")
                            ),
                        })
                        .await;
                }
                self.set_state(engine, CallState::Finished).await;
            }
        }
        Ok(())
    }

    /// Re-sends the INVITE with credentials, once.
    ///
    /// A challenge on a request that already carried the matching
    /// authorization header means the credentials are wrong; the call
    /// fails instead of looping.
    async fn retry_invite(&mut self, engine: &mut Engine, reply: &SipMessage, status: u16) -> Result<()> {
        let invite = match self.invite_request.clone() {
            Some(request) => request,
            None => return self.fail_auth(engine).await,
        };
        if DialogContext::already_answered(status, &invite)
            || self.ctx.store_challenge(reply).is_err()
        {
            return self.fail_auth(engine).await;
        }

        let mut retry = invite;
        let cseq = self.ctx.next_cseq();
        retry.set_header("CSeq", format!("{} INVITE", cseq));
        engine.prepare_request(&mut retry, &self.ctx);
        engine.send_message(&retry).await?;

        self.invite_request = Some(retry);
        self.invite_pending = true;
        self.timeout_at = Some(Instant::now() + INVITE_TIMEOUT);
        Ok(())
    }

    async fn fail_auth(&mut self, engine: &mut Engine) -> Result<()> {
        self.timeout_at = None;
        engine
            .emit(ClientEvent::Error {
                message: format!("call to {} failed: authentication rejected", self.recipient),
            })
            .await;
        self.set_state(engine, CallState::Finished).await;
        Ok(())
    }

    async fn handle_invite_accepted(&mut self, engine: &mut Engine, reply: &SipMessage) -> Result<()> {
        if self.state != CallState::Connecting {
            // a retransmitted 200, or an answer racing our own teardown;
            // it has been acknowledged above and changes nothing
            return Ok(());
        }
        self.timeout_at = None;

        // A call is never active without a negotiated stream; an answer
        // lacking a usable description fails the same way as an answer
        // offering no common codec.
        if reply.header("Content-Type").as_deref() != Some("application/sdp") {
            warn!(call_id = %self.id, "answer carries no session description");
        }
        if !self.apply_remote_description(engine, reply.body()).await {
            return Ok(());
        }
        self.set_state(engine, CallState::Active).await;
        Ok(())
    }

    /// Reads the peer's SDP and picks the codec. Returns false (with the
    /// call failed) when no usable audio stream can be agreed on.
    async fn apply_remote_description(&mut self, engine: &mut Engine, body: &[u8]) -> bool {
        let sdp = SdpMessage::parse(body);
        let address = sdp.connection_address();
        let media = sdp.audio_media();
        let codec = media
            .as_ref()
            .and_then(|(_, ids)| select_codec(&engine.config.codecs, ids));

        match (address, media, codec) {
            (Some(address), Some((port, _)), Some(codec)) => {
                self.remote_rtp = Some(SocketAddr::new(address, port));
                debug!(call_id = %self.id, codec = %codec.rtpmap(), "negotiated audio stream");
                self.codec = Some(codec);
                true
            }
            _ => {
                engine
                    .emit(ClientEvent::Error {
                        message: format!(
                            "call with {} failed: no usable audio description",
                            self.recipient
                        ),
                    })
                    .await;
                self.set_state(engine, CallState::Finished).await;
                false
            }
        }
    }

    /// Acknowledges a final INVITE reply.
    ///
    /// The ACK reuses the INVITE's Via, Contact and authorization headers
    /// and its sequence number, and is aimed at the remote target learned
    /// from the reply's Contact.
    async fn send_ack(&mut self, engine: &mut Engine, reply: &SipMessage) -> Result<()> {
        let invite = match &self.invite_request {
            Some(request) => request,
            None => return Ok(()),
        };

        let uri = self
            .remote_uri
            .clone()
            .unwrap_or_else(|| self.invite_uri.clone());
        let mut ack = SipMessage::request("ACK", uri);
        for via in invite.header_values("Via") {
            ack.add_header("Via", via);
        }
        if let Some(route) = &self.remote_route {
            ack.set_header("Route", route);
        }
        for name in ["Max-Forwards", "Contact", "Authorization", "Proxy-Authorization"] {
            if let Some(value) = invite.header(name) {
                ack.set_header(name, value);
            }
        }
        if let Some(from) = reply.header("From") {
            ack.set_header("From", from);
        }
        if let Some(to) = reply.header("To") {
            ack.set_header("To", to);
        }
        ack.set_header("Call-ID", &self.id);
        ack.set_header(
            "CSeq",
            format!("{} ACK", invite.sequence_number().unwrap_or(1)),
        );
        engine.send_message(&ack).await
    }

    /// Handles an in-dialog request from the peer
    pub(crate) async fn handle_request(&mut self, engine: &mut Engine, request: &SipMessage) -> Result<()> {
        let method = request.method().unwrap_or("");
        match method {
            "ACK" => return Ok(()),
            // a retransmitted INVITE must not be answered 200, which would
            // look like an acceptance; keep it ringing instead
            "INVITE" => {
                if self.direction == CallDirection::Incoming
                    && self.state == CallState::Connecting
                {
                    let ringing = engine.build_response(request, 180, "Ringing");
                    engine.send_message(&ringing).await?;
                }
                return Ok(());
            }
            _ => {}
        }

        let response = engine.build_response(request, 200, "OK");
        engine.send_message(&response).await?;

        match method {
            "BYE" => {
                self.teardown_media();
                self.set_state(engine, CallState::Finished).await;
            }
            "CANCEL" => {
                if self.direction == CallDirection::Incoming && self.state == CallState::Connecting {
                    self.incoming_invite = None;
                    self.set_state(engine, CallState::Finished).await;
                }
            }
            other => debug!(call_id = %self.id, method = other, "answered in-dialog request"),
        }
        Ok(())
    }

    /// The stored INVITE, consumed only while the call is still answerable
    fn take_ringing_invite(&mut self) -> Option<SipMessage> {
        if self.direction == CallDirection::Incoming && self.state == CallState::Connecting {
            self.incoming_invite.take()
        } else {
            None
        }
    }

    /// Accepts a ringing incoming call with a 200 OK and our SDP answer
    pub(crate) async fn accept(&mut self, engine: &mut Engine) -> Result<()> {
        // Guard before consuming the stored INVITE: a mis-sequenced accept
        // must leave the call answerable.
        let invite = match self.take_ringing_invite() {
            Some(invite) => invite,
            None => {
                return Err(ClientError::InvalidState {
                    message: format!("call {} cannot be accepted", self.id),
                })
            }
        };

        let sdp = SdpMessage::parse(invite.body());
        let address = sdp.connection_address();
        let media = sdp.audio_media();
        let codec = media
            .as_ref()
            .and_then(|(_, ids)| select_codec(&engine.config.codecs, ids));

        let (address, port, codec) = match (address, media, codec) {
            (Some(address), Some((port, _)), Some(codec)) => (address, port, codec),
            _ => {
                let mut response = engine.build_response(&invite, 488, "Not Acceptable Here");
                add_local_tag(&mut response, engine);
                engine.send_message(&response).await?;
                engine
                    .emit(ClientEvent::Error {
                        message: format!(
                            "call from {} failed: no usable audio description",
                            self.recipient
                        ),
                    })
                    .await;
                self.set_state(engine, CallState::Finished).await;
                return Ok(());
            }
        };

        self.remote_rtp = Some(SocketAddr::new(address, port));
        self.codec = Some(codec.clone());

        let mut response = engine.build_response(&invite, 200, "OK");
        add_local_tag(&mut response, engine);
        response.set_header("Content-Type", "application/sdp");
        response.set_body(build_answer(engine, &codec).to_bytes());
        engine.send_message(&response).await?;

        self.set_state(engine, CallState::Active).await;
        Ok(())
    }

    /// Declines a ringing incoming call with 603
    pub(crate) async fn reject(&mut self, engine: &mut Engine) -> Result<()> {
        let invite = match self.take_ringing_invite() {
            Some(invite) => invite,
            None => {
                return Err(ClientError::InvalidState {
                    message: format!("call {} cannot be rejected", self.id),
                })
            }
        };

        let mut response = engine.build_response(&invite, 603, "Decline");
        add_local_tag(&mut response, engine);
        engine.send_message(&response).await?;
        self.set_state(engine, CallState::Finished).await;
        Ok(())
    }

    /// Ends the call: CANCEL while our INVITE is unanswered, BYE once a
    /// dialog exists. Local media use stops immediately either way.
    pub(crate) async fn hangup(&mut self, engine: &mut Engine) -> Result<()> {
        match self.state {
            CallState::Disconnecting | CallState::Finished => return Ok(()),
            _ => {}
        }
        if self.direction == CallDirection::Incoming && self.incoming_invite.is_some() {
            return self.reject(engine).await;
        }

        self.teardown_media();
        self.timeout_at = None;

        let mut request = if self.invite_pending {
            let invite = match &self.invite_request {
                Some(invite) => invite,
                None => {
                    // never got on the wire; nothing to tear down remotely
                    self.set_state(engine, CallState::Finished).await;
                    return Ok(());
                }
            };
            // CANCEL mirrors the INVITE's sequence number and Via so the
            // server can match the two.
            let mut cancel = engine.build_request(
                "CANCEL",
                &self.invite_uri,
                &self.id,
                invite.sequence_number().unwrap_or(1),
            );
            if let Some(via) = invite.header("Via") {
                cancel.set_header("Via", via);
            }
            cancel.set_header("To", &self.recipient);
            cancel.remove_header("Contact");
            cancel
        } else {
            let uri = self
                .remote_uri
                .clone()
                .unwrap_or_else(|| self.invite_uri.clone());
            let cseq = self.ctx.next_cseq();
            let mut bye = engine.build_request("BYE", &uri, &self.id, cseq);
            if let Some(to) = &self.remote_recipient {
                bye.set_header("To", to);
            } else {
                bye.set_header("To", &self.recipient);
            }
            if let Some(route) = &self.remote_route {
                bye.set_header("Route", route);
            }
            bye
        };

        engine.prepare_request(&mut request, &self.ctx);
        engine.start_call_transaction(request, &self.id).await?;
        self.set_state(engine, CallState::Disconnecting).await;
        Ok(())
    }

    /// Called when a BYE or CANCEL transaction reached its end
    pub(crate) async fn transaction_finished(
        &mut self,
        engine: &mut Engine,
        method: &str,
        timed_out: bool,
    ) -> Result<()> {
        if timed_out {
            engine
                .emit(ClientEvent::Error {
                    message: format!("no reply to {} for call with {}", method, self.recipient),
                })
                .await;
        }
        self.set_state(engine, CallState::Finished).await;
        Ok(())
    }

    /// Called when the answer timeout for a pending INVITE expires
    pub(crate) async fn on_timeout(&mut self, engine: &mut Engine) -> Result<()> {
        self.timeout_at = None;
        self.invite_pending = false;
        self.teardown_media();
        engine
            .emit(ClientEvent::Error {
                message: format!("call to {} timed out: no answer", self.recipient),
            })
            .await;
        self.set_state(engine, CallState::Finished).await;
        Ok(())
    }

    fn teardown_media(&mut self) {
        let peer = self.remote_rtp.take();
        if let Some(codec) = self.codec.take() {
            debug!(call_id = %self.id, codec = %codec.rtpmap(), ?peer, "releasing audio stream");
        }
    }

    async fn set_state(&mut self, engine: &Engine, state: CallState) {
        if self.state == state {
            return;
        }
        let previous = std::mem::replace(&mut self.state, state);
        engine
            .emit(ClientEvent::CallStateChanged {
                call_id: self.id.clone(),
                previous,
                current: state,
            })
            .await;
    }
}

fn build_offer(engine: &Engine) -> SdpMessage {
    let host = engine.contact_host().ip();
    let mut sdp = session_prelude(engine, host);

    let ids: Vec<String> = engine
        .config
        .codecs
        .iter()
        .map(|codec| codec.id.to_string())
        .chain(std::iter::once(TELEPHONE_EVENT_ID.to_string()))
        .collect();
    sdp.add_field(
        'm',
        format!(
            "audio {} RTP/AVP {}",
            engine.config.media_port,
            ids.join(" ")
        ),
    );
    for codec in &engine.config.codecs {
        sdp.add_field('a', format!("rtpmap:{} {}", codec.id, codec.rtpmap()));
    }
    finish_media_section(&mut sdp);
    sdp
}

fn build_answer(engine: &Engine, codec: &AudioCodec) -> SdpMessage {
    let host = engine.contact_host().ip();
    let mut sdp = session_prelude(engine, host);

    sdp.add_field(
        'm',
        format!(
            "audio {} RTP/AVP {} {}",
            engine.config.media_port, codec.id, TELEPHONE_EVENT_ID
        ),
    );
    sdp.add_field('a', format!("rtpmap:{} {}", codec.id, codec.rtpmap()));
    finish_media_section(&mut sdp);
    sdp
}

fn session_prelude(engine: &Engine, host: std::net::IpAddr) -> SdpMessage {
    let mut sdp = SdpMessage::new();
    sdp.add_field('v', "0");
    sdp.add_field(
        'o',
        format!("- {} 1 IN IP4 {}", engine.session_id(), host),
    );
    sdp.add_field('s', engine.config.user_agent.clone());
    sdp.add_field('c', format!("IN IP4 {}", host));
    sdp.add_field('t', "0 0");
    sdp
}

fn finish_media_section(sdp: &mut SdpMessage) {
    sdp.add_field(
        'a',
        format!("rtpmap:{} telephone-event/8000", TELEPHONE_EVENT_ID),
    );
    sdp.add_field('a', format!("fmtp:{} 0-15", TELEPHONE_EVENT_ID));
    sdp.add_field('a', "sendrecv");
}

/// Extracts the URI from a header-form address, `Bob <sip:b@x>` or bare
pub(crate) fn address_uri(address: &str) -> String {
    match (address.find('<'), address.find('>')) {
        (Some(open), Some(close)) if open < close => address[open + 1..close].to_string(),
        _ => address.trim().to_string(),
    }
}

/// Wraps a bare URI in angle brackets for use in `To`/`From` headers
pub(crate) fn address_form(address: &str) -> String {
    if address.contains('<') {
        address.to_string()
    } else {
        format!("<{}>", address.trim())
    }
}

/// Drops everything around the URI of a `Contact` value
pub(crate) fn strip_angle(value: &str) -> String {
    address_uri(value)
}

fn add_local_tag(response: &mut SipMessage, engine: &Engine) {
    if let Some(to) = response.header("To") {
        if !to.contains(";tag=") {
            response.set_header("To", format!("{};tag={}", to, engine.local_tag()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::sync::mpsc;

    use sipline_sip_transport::{Transport, UdpTransport};

    use crate::config::ClientConfig;

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

    fn ringing_invite() -> SipMessage {
        let mut invite = SipMessage::request("INVITE", "sip:alice@example.com");
        invite.set_header("Call-ID", "abc");
        invite.set_header("From", "<sip:bob@example.com>;tag=b1");
        invite
    }

    #[tokio::test]
    async fn accept_outside_ringing_keeps_the_stored_invite() {
        let mut engine = engine().await;
        let mut call = Call::incoming(&ringing_invite()).unwrap();

        call.state = CallState::Active;
        assert!(call.accept(&mut engine).await.is_err());
        assert!(call.incoming_invite.is_some());
        assert!(call.reject(&mut engine).await.is_err());
        assert!(call.incoming_invite.is_some());

        // back in the answerable state the stored INVITE is still usable
        call.state = CallState::Connecting;
        call.reject(&mut engine).await.unwrap();
        assert_eq!(call.state(), CallState::Finished);
    }

    #[test]
    fn address_uri_unwraps_angle_brackets() {
        assert_eq!(
            address_uri("\"Bob\" <sip:bob@example.com>;tag=x"),
            "sip:bob@example.com"
        );
        assert_eq!(address_uri("sip:bob@example.com"), "sip:bob@example.com");
        assert_eq!(address_uri(" sip:bob@example.com "), "sip:bob@example.com");
    }

    #[test]
    fn address_form_wraps_bare_uris() {
        assert_eq!(address_form("sip:bob@example.com"), "<sip:bob@example.com>");
        assert_eq!(
            address_form("\"Bob\" <sip:bob@example.com>"),
            "\"Bob\" <sip:bob@example.com>"
        );
    }

    #[test]
    fn incoming_requires_dialog_headers() {
        let mut invite = SipMessage::request("INVITE", "sip:alice@example.com");
        assert!(Call::incoming(&invite).is_none());
        invite.set_header("Call-ID", "abc");
        invite.set_header("From", "<sip:bob@example.com>;tag=b1");
        let call = Call::incoming(&invite).unwrap();
        assert_eq!(call.id(), "abc");
        assert_eq!(call.state(), CallState::Connecting);
        assert_eq!(call.remote(), "<sip:bob@example.com>;tag=b1");
    }
}
