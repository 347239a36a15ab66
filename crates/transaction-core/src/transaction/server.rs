//! Server transactions (RFC 3261 17.2, RFC 6026).
//!
//! The transaction owns retransmission of the last response: a
//! retransmitted request is answered from the stored response, and a
//! non-2xx final response to an INVITE is repeated on Timer G until the ACK
//! arrives or Timer H gives up. An INVITE that the application leaves
//! unanswered for a short while gets an automatic `100 Trying`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use sipflow_sip_core::{status, Message, Request, Response};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::TimerSettings;
use crate::error::{Error, Result};
use crate::fsm::{lookup, row, TransactionState, Transition};
use crate::key::TransactionKey;
use crate::timer::{TimerType, Timers};
use crate::transaction::transport_error;
use crate::transport::TxTransport;

use TransactionState::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Input {
    Request,
    Ack,
    Cancel,
    User1xx,
    User2xx,
    User300Plus,
    TimerG,
    TimerH,
    TimerI,
    TimerJ,
    TimerL,
    TransportErr,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    None,
    Respond,
    RespondComplete,
    RespondAccept,
    Final,
    Confirm,
    PassUpAck,
    Cancel,
    Timeout,
    TransportErr,
    ReportTransportErr,
    Delete,
}

type Table = [Transition<Input, Action>];

static INVITE_TABLE: &Table = &[
    row(Proceeding, Input::Request, Proceeding, Action::Respond),
    row(Proceeding, Input::Ack, Proceeding, Action::None),
    row(Proceeding, Input::Cancel, Proceeding, Action::Cancel),
    row(Proceeding, Input::User1xx, Proceeding, Action::Respond),
    row(Proceeding, Input::User2xx, Accepted, Action::RespondAccept),
    row(Proceeding, Input::User300Plus, Completed, Action::RespondComplete),
    row(Proceeding, Input::TransportErr, Terminated, Action::TransportErr),
    row(Completed, Input::Request, Completed, Action::Respond),
    row(Completed, Input::Ack, Confirmed, Action::Confirm),
    row(Completed, Input::Cancel, Completed, Action::Cancel),
    row(Completed, Input::User1xx, Completed, Action::None),
    row(Completed, Input::User2xx, Completed, Action::None),
    row(Completed, Input::User300Plus, Completed, Action::None),
    row(Completed, Input::TimerG, Completed, Action::RespondComplete),
    row(Completed, Input::TimerH, Terminated, Action::Timeout),
    row(Completed, Input::TransportErr, Terminated, Action::TransportErr),
    row(Confirmed, Input::Request, Confirmed, Action::None),
    row(Confirmed, Input::Ack, Confirmed, Action::None),
    row(Confirmed, Input::Cancel, Confirmed, Action::Cancel),
    row(Confirmed, Input::User1xx, Confirmed, Action::None),
    row(Confirmed, Input::User2xx, Confirmed, Action::None),
    row(Confirmed, Input::User300Plus, Confirmed, Action::None),
    row(Confirmed, Input::TimerG, Confirmed, Action::None),
    row(Confirmed, Input::TimerH, Confirmed, Action::None),
    row(Confirmed, Input::TimerI, Terminated, Action::Delete),
    row(Confirmed, Input::TransportErr, Confirmed, Action::None),
    row(Accepted, Input::Request, Accepted, Action::None),
    row(Accepted, Input::Ack, Accepted, Action::PassUpAck),
    row(Accepted, Input::Cancel, Accepted, Action::Cancel),
    row(Accepted, Input::User1xx, Accepted, Action::None),
    row(Accepted, Input::User2xx, Accepted, Action::Respond),
    row(Accepted, Input::User300Plus, Accepted, Action::None),
    row(Accepted, Input::TransportErr, Accepted, Action::ReportTransportErr),
    row(Accepted, Input::TimerL, Terminated, Action::Delete),
    row(Terminated, Input::Request, Terminated, Action::None),
    row(Terminated, Input::Ack, Terminated, Action::None),
    row(Terminated, Input::Cancel, Terminated, Action::None),
    row(Terminated, Input::User1xx, Terminated, Action::None),
    row(Terminated, Input::User2xx, Terminated, Action::None),
    row(Terminated, Input::User300Plus, Terminated, Action::None),
    row(Terminated, Input::TimerG, Terminated, Action::None),
    row(Terminated, Input::TimerH, Terminated, Action::None),
    row(Terminated, Input::TimerI, Terminated, Action::None),
    row(Terminated, Input::TimerL, Terminated, Action::None),
    row(Terminated, Input::TransportErr, Terminated, Action::None),
    row(Terminated, Input::Delete, Terminated, Action::Delete),
];

static NON_INVITE_TABLE: &Table = &[
    row(Trying, Input::Request, Trying, Action::None),
    row(Trying, Input::Ack, Trying, Action::None),
    row(Trying, Input::Cancel, Trying, Action::Cancel),
    row(Trying, Input::User1xx, Proceeding, Action::Respond),
    row(Trying, Input::User2xx, Completed, Action::Final),
    row(Trying, Input::User300Plus, Completed, Action::Final),
    row(Trying, Input::TransportErr, Terminated, Action::TransportErr),
    row(Proceeding, Input::Request, Proceeding, Action::Respond),
    row(Proceeding, Input::Ack, Proceeding, Action::None),
    row(Proceeding, Input::Cancel, Proceeding, Action::Cancel),
    row(Proceeding, Input::User1xx, Proceeding, Action::Respond),
    row(Proceeding, Input::User2xx, Completed, Action::Final),
    row(Proceeding, Input::User300Plus, Completed, Action::Final),
    row(Proceeding, Input::TransportErr, Terminated, Action::TransportErr),
    row(Completed, Input::Request, Completed, Action::Respond),
    row(Completed, Input::Ack, Completed, Action::None),
    row(Completed, Input::Cancel, Completed, Action::Cancel),
    row(Completed, Input::User1xx, Completed, Action::None),
    row(Completed, Input::User2xx, Completed, Action::None),
    row(Completed, Input::User300Plus, Completed, Action::None),
    row(Completed, Input::TimerJ, Terminated, Action::Delete),
    row(Completed, Input::TransportErr, Terminated, Action::TransportErr),
    row(Terminated, Input::Request, Terminated, Action::None),
    row(Terminated, Input::Ack, Terminated, Action::None),
    row(Terminated, Input::Cancel, Terminated, Action::None),
    row(Terminated, Input::User1xx, Terminated, Action::None),
    row(Terminated, Input::User2xx, Terminated, Action::None),
    row(Terminated, Input::User300Plus, Terminated, Action::None),
    row(Terminated, Input::TimerJ, Terminated, Action::None),
    row(Terminated, Input::TransportErr, Terminated, Action::None),
    row(Terminated, Input::Delete, Terminated, Action::Delete),
];

/// Handle to a server transaction; clones share the transaction
#[derive(Clone)]
pub struct ServerTransaction {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    key: TransactionKey,
    origin: Request,
    invite: bool,
    reliable: bool,
    timers: TimerSettings,
    transport: Arc<dyn TxTransport>,
    core: Mutex<ServerCore>,
    acks: SyncMutex<Option<mpsc::UnboundedReceiver<Request>>>,
    cancels: SyncMutex<Option<mpsc::UnboundedReceiver<Request>>>,
    errors: SyncMutex<Option<mpsc::UnboundedReceiver<Error>>>,
    done: CancellationToken,
}

struct ServerCore {
    state: TransactionState,
    timers: Timers,
    /// Current Timer G interval, unset until the first final response
    timer_g_interval: Option<Duration>,
    /// Response handed in by the application, adopted by the sending action
    outgoing: Option<Response>,
    last_response: Option<Response>,
    last_ack: Option<Request>,
    last_cancel: Option<Request>,
    last_error: Option<Error>,
    acks: Option<mpsc::UnboundedSender<Request>>,
    cancels: Option<mpsc::UnboundedSender<Request>>,
    errors: Option<mpsc::UnboundedSender<Error>>,
}

impl ServerTransaction {
    pub(crate) fn new(
        origin: Request,
        transport: Arc<dyn TxTransport>,
        timers: TimerSettings,
    ) -> Result<Self> {
        let key = TransactionKey::server(&Message::Request(origin.clone()))?;
        let invite = origin.is_invite();
        let reliable = transport.is_reliable(origin.transport());
        let state = if invite { Proceeding } else { Trying };

        let (acks_tx, acks_rx) = mpsc::unbounded_channel();
        let (cancels_tx, cancels_rx) = mpsc::unbounded_channel();
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();

        Ok(ServerTransaction {
            inner: Arc::new(ServerInner {
                key,
                origin,
                invite,
                reliable,
                timers,
                transport,
                core: Mutex::new(ServerCore {
                    state,
                    timers: Timers::new(),
                    timer_g_interval: None,
                    outgoing: None,
                    last_response: None,
                    last_ack: None,
                    last_cancel: None,
                    last_error: None,
                    acks: Some(acks_tx),
                    cancels: Some(cancels_tx),
                    errors: Some(errors_tx),
                }),
                acks: SyncMutex::new(Some(acks_rx)),
                cancels: SyncMutex::new(Some(cancels_rx)),
                errors: SyncMutex::new(Some(errors_rx)),
                done: CancellationToken::new(),
            }),
        })
    }

    /// Arm the automatic `100 Trying` for INVITE
    pub(crate) async fn init(&self) {
        let mut core = self.inner.core.lock().await;
        debug!(key = %self.inner.key, "server transaction created for {}", self.inner.origin.short());
        if self.inner.invite {
            self.inner.arm(&mut core, TimerType::Trying, self.inner.timers.timer_1xx);
        }
    }

    pub fn key(&self) -> &TransactionKey {
        &self.inner.key
    }

    /// The request that created the transaction
    pub fn origin(&self) -> &Request {
        &self.inner.origin
    }

    pub fn is_invite(&self) -> bool {
        self.inner.invite
    }

    pub async fn state(&self) -> TransactionState {
        self.inner.core.lock().await.state
    }

    /// ACKs for a non-2xx final response; only the first call returns the queue.
    pub fn take_acks(&self) -> Option<mpsc::UnboundedReceiver<Request>> {
        self.inner.acks.lock().take()
    }

    /// CANCEL requests matching this transaction; only the first call returns the queue.
    pub fn take_cancels(&self) -> Option<mpsc::UnboundedReceiver<Request>> {
        self.inner.cancels.lock().take()
    }

    /// Timeout and transport errors; only the first call returns the queue.
    pub fn take_errors(&self) -> Option<mpsc::UnboundedReceiver<Error>> {
        self.inner.errors.lock().take()
    }

    /// Feed an inbound request (retransmission, ACK or CANCEL)
    pub async fn receive(&self, msg: Message) -> Result<()> {
        let req = match msg {
            Message::Request(req) => req,
            Message::Response(res) => {
                return Err(self.inner.unexpected(res.short(), "server transaction only accepts requests"))
            }
        };

        let mut core = self.inner.core.lock().await;
        let input = if req.method == self.inner.origin.method {
            Input::Request
        } else if req.is_ack() {
            // A 2xx ACK carries a new branch, so matching us means the peer reused it
            if core.state == Accepted {
                return Err(self
                    .inner
                    .unexpected(req.short(), "ack for non-2xx but current state is post-2xx"));
            }
            core.last_ack = Some(req);
            Input::Ack
        } else if req.is_cancel() {
            core.last_cancel = Some(req);
            Input::Cancel
        } else {
            return Err(self.inner.unexpected(req.short(), "request method does not match the transaction"));
        };
        self.inner.spin(&mut core, input).await
    }

    /// Send `res` through the transaction.
    ///
    /// Responses to a CANCEL bypass the state machine and are sent as is.
    /// Other send failures end the transaction and are reported on its error
    /// queue.
    pub async fn respond(&self, res: Response) -> Result<()> {
        if res.is_cancel() {
            let msg = Message::Response(res);
            return self
                .inner
                .transport
                .send(&msg)
                .await
                .map_err(|e| transport_error(&self.inner.key, &msg, &e));
        }

        let mut core = self.inner.core.lock().await;
        let input = if res.is_provisional() {
            Input::User1xx
        } else if res.is_success() {
            Input::User2xx
        } else {
            Input::User300Plus
        };
        core.timers.stop(TimerType::Trying);
        core.outgoing = Some(res);
        let result = self.inner.spin(&mut core, input).await;
        if let Some(ignored) = core.outgoing.take() {
            debug!(key = %self.inner.key, state = %core.state, "ignoring {}", ignored.short());
        }
        result
    }

    /// Delete the transaction regardless of its state
    pub async fn terminate(&self) {
        let mut core = self.inner.core.lock().await;
        self.inner.delete(&mut core);
    }

    pub async fn done(&self) {
        self.inner.done.cancelled().await;
    }

    pub fn is_done(&self) -> bool {
        self.inner.done.is_cancelled()
    }

    pub(crate) fn same(&self, other: &ServerTransaction) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for ServerTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerTransaction")
            .field("key", &self.inner.key)
            .field("origin", &self.inner.origin.short())
            .finish()
    }
}

impl ServerInner {
    fn unexpected(&self, message: String, reason: &str) -> Error {
        Error::UnexpectedMessage {
            key: self.key.clone(),
            message,
            reason: reason.to_string(),
        }
    }

    async fn spin(self: &Arc<Self>, core: &mut ServerCore, input: Input) -> Result<()> {
        let table = if self.invite { INVITE_TABLE } else { NON_INVITE_TABLE };
        let mut next = Some(input);
        while let Some(input) = next.take() {
            let Some((to, action)) = lookup(table, core.state, input) else {
                return Err(Error::InvalidTransition {
                    key: self.key.clone(),
                    state: core.state.to_string(),
                    input: format!("{:?}", input),
                });
            };
            if to != core.state {
                debug!(key = %self.key, from = %core.state, to = %to, "server transaction state changed");
            }
            core.state = to;
            next = self.act(core, action).await;
        }
        Ok(())
    }

    async fn act(self: &Arc<Self>, core: &mut ServerCore, action: Action) -> Option<Input> {
        match action {
            Action::None => None,
            Action::Respond => {
                if let Some(res) = core.outgoing.take() {
                    core.last_response = Some(res);
                } else if core.last_response.is_none() && self.invite {
                    // Retransmitted INVITE before the application answered
                    core.timers.stop(TimerType::Trying);
                    core.last_response = Some(self.trying());
                }
                self.send_last_response(core).await
            }
            Action::RespondComplete => {
                if let Some(res) = core.outgoing.take() {
                    core.last_response = Some(res);
                }
                let next = self.send_last_response(core).await;
                if !self.reliable {
                    let interval = match core.timer_g_interval {
                        None => self.timers.timer_g(),
                        Some(interval) => (interval * 2).min(self.timers.t2),
                    };
                    core.timer_g_interval = Some(interval);
                    self.arm(core, TimerType::G, interval);
                }
                if !core.timers.is_armed(TimerType::H) {
                    self.arm(core, TimerType::H, self.timers.timer_h());
                }
                next
            }
            Action::RespondAccept => {
                if let Some(res) = core.outgoing.take() {
                    core.last_response = Some(res);
                }
                let next = self.send_last_response(core).await;
                self.arm(core, TimerType::L, self.timers.timer_l());
                next
            }
            Action::Final => {
                if let Some(res) = core.outgoing.take() {
                    core.last_response = Some(res);
                }
                let next = self.send_last_response(core).await;
                self.arm(core, TimerType::J, self.timers.timer_j(self.reliable));
                next
            }
            Action::Confirm => {
                core.timers.stop(TimerType::G);
                core.timers.stop(TimerType::H);
                self.arm(core, TimerType::I, self.timers.timer_i(self.reliable));
                self.pass_up_ack(core);
                None
            }
            Action::PassUpAck => {
                self.pass_up_ack(core);
                None
            }
            Action::Cancel => {
                if let (Some(cancel), Some(queue)) = (&core.last_cancel, &core.cancels) {
                    let _ = queue.send(cancel.clone());
                }
                None
            }
            Action::Timeout => {
                self.report(core, Error::Timeout { key: self.key.clone() });
                Some(Input::Delete)
            }
            Action::TransportErr => {
                self.report_transport_error(core);
                Some(Input::Delete)
            }
            Action::ReportTransportErr => {
                self.report_transport_error(core);
                None
            }
            Action::Delete => {
                self.delete(core);
                None
            }
        }
    }

    fn trying(&self) -> Response {
        Response::from_request(&self.origin, status::TRYING, None)
    }

    fn arm(self: &Arc<Self>, core: &mut ServerCore, timer: TimerType, after: Duration) {
        let weak = Arc::downgrade(self);
        core.timers.arm(timer, after, move |id| async move {
            if let Some(inner) = weak.upgrade() {
                inner.fire(timer, id).await;
            }
        });
    }

    async fn fire(self: Arc<Self>, timer: TimerType, id: u64) {
        if self.done.is_cancelled() {
            return;
        }
        let mut core = self.core.lock().await;
        if !core.timers.take(timer, id) {
            return;
        }
        debug!(key = %self.key, timer = %timer, "timer fired");

        let input = match timer {
            TimerType::Trying => {
                if core.last_response.is_some() {
                    return;
                }
                core.outgoing = Some(self.trying());
                Input::User1xx
            }
            TimerType::G => Input::TimerG,
            TimerType::H => Input::TimerH,
            TimerType::I => Input::TimerI,
            TimerType::J => Input::TimerJ,
            TimerType::L => Input::TimerL,
            other => {
                warn!(key = %self.key, timer = %other, "timer not used by server transactions");
                return;
            }
        };
        if let Err(e) = self.spin(&mut core, input).await {
            error!(key = %self.key, "spin on timer {} failed: {}", timer, e);
        }
        core.outgoing = None;
    }

    async fn send_last_response(&self, core: &mut ServerCore) -> Option<Input> {
        let Some(res) = core.last_response.clone() else {
            return None;
        };
        let msg = Message::Response(res);
        match self.transport.send(&msg).await {
            Ok(()) => None,
            Err(e) => {
                error!(key = %self.key, "send {} failed: {}", msg.short(), e);
                core.last_error = Some(transport_error(&self.key, &msg, &e));
                Some(Input::TransportErr)
            }
        }
    }

    fn pass_up_ack(&self, core: &ServerCore) {
        if let (Some(ack), Some(queue)) = (&core.last_ack, &core.acks) {
            let _ = queue.send(ack.clone());
        }
    }

    fn report(&self, core: &ServerCore, err: Error) {
        debug!(key = %self.key, "reporting {}", err);
        if let Some(queue) = &core.errors {
            let _ = queue.send(err);
        }
    }

    fn report_transport_error(&self, core: &mut ServerCore) {
        let err = core.last_error.take().unwrap_or_else(|| Error::Transport {
            key: self.key.clone(),
            message: self.origin.short(),
            reason: "unknown transport failure".to_string(),
        });
        self.report(core, err);
    }

    fn delete(&self, core: &mut ServerCore) {
        if self.done.is_cancelled() {
            return;
        }
        core.timers.stop_all();
        core.acks = None;
        core.cancels = None;
        core.errors = None;
        self.done.cancel();
        debug!(key = %self.key, "server transaction done");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransport;
    use sipflow_sip_core::{Method, Uri};

    fn request(method: Method) -> Request {
        let cseq = format!("7 {}", method);
        Request::new(method, Uri::sip("127.0.0.1", Some(5060)))
            .with_header("Via", "SIP/2.0/UDP 127.0.0.1:5070;branch=z9hG4bKserverunit")
            .with_header("From", "<sip:alice@example.com>;tag=s1")
            .with_header("To", "<sip:bob@example.com>")
            .with_header("Call-ID", "server-unit")
            .with_header("CSeq", cseq)
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_invite_final_then_retransmission() {
        let transport = MockTransport::new();
        let req = request(Method::Options);
        let tx = ServerTransaction::new(req.clone(), transport.clone(), TimerSettings::default()).unwrap();
        tx.init().await;
        assert_eq!(tx.state().await, Trying);

        // Nothing stored yet, a retransmission is absorbed
        tx.receive(req.clone().into()).await.unwrap();
        assert!(transport.sent_statuses().is_empty());

        tx.respond(Response::from_request(&req, 200, None)).await.unwrap();
        assert_eq!(tx.state().await, Completed);
        tx.receive(req.into()).await.unwrap();
        assert_eq!(transport.sent_statuses(), vec![200, 200]);

        // Timer J
        tx.done().await;
        assert_eq!(tx.state().await, Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_after_2xx_with_same_branch_is_rejected() {
        let transport = MockTransport::new();
        let invite = request(Method::Invite);
        let tx = ServerTransaction::new(invite.clone(), transport, TimerSettings::default()).unwrap();
        tx.init().await;
        tx.respond(Response::from_request(&invite, 200, None)).await.unwrap();
        assert_eq!(tx.state().await, Accepted);

        let ack = request(Method::Ack);
        let err = tx.receive(ack.into()).await.unwrap_err();
        match err {
            Error::UnexpectedMessage { reason, .. } => {
                assert_eq!(reason, "ack for non-2xx but current state is post-2xx")
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_response_is_not_replaced() {
        let transport = MockTransport::new();
        let req = request(Method::Register);
        let tx = ServerTransaction::new(req.clone(), transport.clone(), TimerSettings::default()).unwrap();
        tx.init().await;

        tx.respond(Response::from_request(&req, 404, None)).await.unwrap();
        tx.respond(Response::from_request(&req, 200, None)).await.unwrap();
        tx.receive(req.into()).await.unwrap();
        assert_eq!(transport.sent_statuses(), vec![404, 404]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_send_is_reported_and_deletes() {
        let transport = MockTransport::new();
        let req = request(Method::Bye);
        let tx = ServerTransaction::new(req.clone(), transport.clone(), TimerSettings::default()).unwrap();
        let mut errors = tx.take_errors().unwrap();
        tx.init().await;

        transport.set_failing(true);
        tx.respond(Response::from_request(&req, 200, None)).await.unwrap();
        assert!(errors.recv().await.unwrap().is_transport());
        assert!(errors.recv().await.is_none());
        assert!(tx.is_done());
    }
}
