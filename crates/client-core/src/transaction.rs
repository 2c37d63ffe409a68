//! Client non-INVITE transactions
//!
//! REGISTER, SUBSCRIBE, BYE and CANCEL are sent inside a transaction that
//! retransmits the identical wire image on a doubling timer until a final
//! reply arrives or the whole attempt times out. INVITE is deliberately not
//! retransmitted; its recovery is the call-level answer timeout.
//!
//! Transactions own no tasks and no sockets. The engine polls their
//! deadlines from its single event loop and performs the sends, so a timer
//! can never fire for a transaction that no longer exists.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use sipline_sip_core::SipMessage;

/// Base retransmission interval (RFC 3261 T1)
pub const T1: Duration = Duration::from_millis(500);

/// Retransmission interval cap (RFC 3261 T2)
pub const T2: Duration = Duration::from_secs(4);

/// Absolute transaction lifetime (64 * T1)
pub const TRANSACTION_TIMEOUT: Duration = Duration::from_secs(32);

/// Where replies routed through a transaction are delivered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionOwner {
    /// The registration exchange (REGISTER and SUBSCRIBE)
    Registration,
    /// A call dialog, by call id (BYE and CANCEL)
    Call(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Request sent, nothing heard yet
    Trying,
    /// A provisional reply arrived; still waiting for the final one
    Proceeding,
    /// A final reply arrived; the transaction is done
    Completed,
}

/// What the engine should do when a transaction's deadline fires
#[derive(Debug)]
pub enum TimerAction {
    /// Send these exact bytes again
    Retransmit(Bytes),
    /// Give up; the owner must treat the request as unanswered
    TimedOut,
}

/// A client transaction for one non-INVITE request
#[derive(Debug)]
pub struct Transaction {
    state: TransactionState,
    wire: Bytes,
    destination: SocketAddr,
    call_id: String,
    cseq: Option<u32>,
    method: String,
    owner: TransactionOwner,
    interval: Duration,
    retransmit_at: Instant,
    expires_at: Instant,
}

impl Transaction {
    /// Creates a transaction for an already-built request.
    ///
    /// The request is serialized once here; every retransmission reuses
    /// the same bytes. The caller is responsible for the initial send.
    pub fn new(
        request: &SipMessage,
        destination: SocketAddr,
        owner: TransactionOwner,
        now: Instant,
    ) -> Self {
        Transaction {
            state: TransactionState::Trying,
            wire: request.to_bytes(),
            destination,
            call_id: request.header("Call-ID").unwrap_or_default(),
            cseq: request.sequence_number(),
            method: request.method().unwrap_or_default().to_string(),
            owner,
            interval: T1,
            retransmit_at: now + T1,
            expires_at: now + TRANSACTION_TIMEOUT,
        }
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn owner(&self) -> &TransactionOwner {
        &self.owner
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn wire(&self) -> &Bytes {
        &self.wire
    }

    pub fn destination(&self) -> SocketAddr {
        self.destination
    }

    /// Whether a reply belongs to this transaction: same dialog, same
    /// sequence number and same method echoed in `CSeq`.
    pub fn matches(&self, reply: &SipMessage) -> bool {
        reply.header("Call-ID").as_deref() == Some(self.call_id.as_str())
            && reply.sequence_number() == self.cseq
            && reply.cseq_method().as_deref() == Some(self.method.as_str())
    }

    /// Feeds a matching reply in. Returns `true` when the reply is final
    /// and the transaction should be removed.
    pub fn on_reply(&mut self, reply: &SipMessage) -> bool {
        match reply.status_code() {
            Some(code) if code < 200 => {
                self.state = TransactionState::Proceeding;
                false
            }
            _ => {
                self.state = TransactionState::Completed;
                true
            }
        }
    }

    /// The next instant at which [`poll`](Self::poll) will have work to do
    pub fn next_deadline(&self) -> Instant {
        self.retransmit_at.min(self.expires_at)
    }

    /// Advances the timers. Returns an action when a deadline has passed.
    pub fn poll(&mut self, now: Instant) -> Option<TimerAction> {
        if now >= self.expires_at {
            return Some(TimerAction::TimedOut);
        }
        if now >= self.retransmit_at {
            self.interval = (self.interval * 2).min(T2);
            self.retransmit_at = now + self.interval;
            return Some(TimerAction::Retransmit(self.wire.clone()));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> SipMessage {
        let mut req = SipMessage::request("REGISTER", "sip:example.com");
        req.set_header("Call-ID", "reg-1");
        req.set_header("CSeq", "1 REGISTER");
        req
    }

    fn reply(status: u16, call_id: &str, cseq: &str) -> SipMessage {
        let mut rep = SipMessage::reply(status, "Test");
        rep.set_header("Call-ID", call_id);
        rep.set_header("CSeq", cseq);
        rep
    }

    fn transaction(now: Instant) -> Transaction {
        Transaction::new(
            &request(),
            "1.2.3.4:5060".parse().unwrap(),
            TransactionOwner::Registration,
            now,
        )
    }

    #[test]
    fn matches_on_dialog_and_cseq() {
        let tx = transaction(Instant::now());
        assert!(tx.matches(&reply(200, "reg-1", "1 REGISTER")));
        assert!(!tx.matches(&reply(200, "other", "1 REGISTER")));
        assert!(!tx.matches(&reply(200, "reg-1", "2 REGISTER")));
        assert!(!tx.matches(&reply(200, "reg-1", "1 SUBSCRIBE")));
    }

    #[test]
    fn provisional_then_final() {
        let mut tx = transaction(Instant::now());
        assert_eq!(tx.state(), TransactionState::Trying);
        assert!(!tx.on_reply(&reply(100, "reg-1", "1 REGISTER")));
        assert_eq!(tx.state(), TransactionState::Proceeding);
        assert!(tx.on_reply(&reply(200, "reg-1", "1 REGISTER")));
        assert_eq!(tx.state(), TransactionState::Completed);
    }

    #[test]
    fn retransmission_interval_doubles_and_caps() {
        let start = Instant::now();
        let mut tx = transaction(start);
        let original_wire = tx.wire().clone();

        // Expected offsets of successive retransmissions from the start:
        // 0.5s, then +1s, +2s, +4s, +4s...
        let mut now = start;
        let mut intervals = Vec::new();
        for _ in 0..5 {
            now = tx.next_deadline();
            match tx.poll(now) {
                Some(TimerAction::Retransmit(bytes)) => {
                    assert_eq!(bytes, original_wire);
                    intervals.push(tx.retransmit_at - now);
                }
                other => panic!("expected retransmit, got {:?}", other),
            }
        }
        assert_eq!(
            intervals,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(4),
                Duration::from_secs(4),
            ]
        );
    }

    #[test]
    fn times_out_after_absolute_deadline() {
        let start = Instant::now();
        let mut tx = transaction(start);
        assert!(matches!(
            tx.poll(start + TRANSACTION_TIMEOUT),
            Some(TimerAction::TimedOut)
        ));
    }

    #[test]
    fn no_action_before_first_deadline() {
        let start = Instant::now();
        let mut tx = transaction(start);
        assert!(tx.poll(start + Duration::from_millis(100)).is_none());
        assert_eq!(tx.next_deadline(), start + T1);
    }
}
