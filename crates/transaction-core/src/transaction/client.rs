//! Client transactions (RFC 3261 17.1).
//!
//! ```text
//! INVITE                                    non-INVITE
//!
//! Calling --1xx--> Proceeding               Trying --1xx--> Proceeding
//!    |  \             |    \                   |               |
//!    | 2xx          2xx   300-699            200-699         200-699
//!    |    \           |      \                 |               |
//!    |     +----> Accepted    +--> Completed   +-------> Completed
//!    |               |              ^  |                       |
//!    +---300-699-----|--------------+  | Timer D               | Timer K
//!                    | Timer M         v                       v
//!                    +----------> Terminated <-- Timer B/F, transport error
//! ```
//!
//! Retransmission timers (A, E) are only armed on unreliable transports.
//! A non-2xx final response to an INVITE is acknowledged by the transaction
//! itself; acknowledging a 2xx is left to the application.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use sipflow_sip_core::{generate_branch, Message, Request, Response, ViaHop};
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
    Provisional,
    Success,
    Failure,
    TimerA,
    TimerB,
    TimerD,
    TimerE,
    TimerF,
    TimerK,
    TimerM,
    TransportErr,
    Delete,
    /// The application asked to cancel
    Cancel,
    /// A response to our CANCEL arrived
    Canceled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    None,
    InviteResend,
    NonInviteResend,
    InviteProceeding,
    NonInviteProceeding,
    PassUp,
    PassUpAccept,
    InviteFinal,
    NonInviteFinal,
    Ack,
    Cancel,
    CancelTimeout,
    Canceled,
    Timeout,
    TransportErr,
    ReportTransportErr,
    Delete,
}

type Table = [Transition<Input, Action>];

static INVITE_TABLE: &Table = &[
    row(Calling, Input::Provisional, Proceeding, Action::InviteProceeding),
    row(Calling, Input::Success, Accepted, Action::PassUpAccept),
    row(Calling, Input::Failure, Completed, Action::InviteFinal),
    row(Calling, Input::Cancel, Calling, Action::Cancel),
    row(Calling, Input::Canceled, Calling, Action::Canceled),
    row(Calling, Input::TimerA, Calling, Action::InviteResend),
    row(Calling, Input::TimerB, Terminated, Action::Timeout),
    row(Calling, Input::TransportErr, Terminated, Action::TransportErr),
    row(Proceeding, Input::Provisional, Proceeding, Action::PassUp),
    row(Proceeding, Input::Success, Accepted, Action::PassUpAccept),
    row(Proceeding, Input::Failure, Completed, Action::InviteFinal),
    row(Proceeding, Input::Cancel, Proceeding, Action::CancelTimeout),
    row(Proceeding, Input::Canceled, Proceeding, Action::Canceled),
    row(Proceeding, Input::TimerA, Proceeding, Action::None),
    row(Proceeding, Input::TimerB, Terminated, Action::Timeout),
    row(Proceeding, Input::TransportErr, Terminated, Action::TransportErr),
    row(Completed, Input::Provisional, Completed, Action::None),
    row(Completed, Input::Success, Completed, Action::None),
    row(Completed, Input::Failure, Completed, Action::Ack),
    row(Completed, Input::Cancel, Completed, Action::None),
    row(Completed, Input::Canceled, Completed, Action::None),
    row(Completed, Input::TransportErr, Terminated, Action::TransportErr),
    row(Completed, Input::TimerA, Completed, Action::None),
    row(Completed, Input::TimerB, Completed, Action::None),
    row(Completed, Input::TimerD, Terminated, Action::Delete),
    row(Accepted, Input::Provisional, Accepted, Action::None),
    row(Accepted, Input::Success, Accepted, Action::PassUp),
    row(Accepted, Input::Failure, Accepted, Action::None),
    row(Accepted, Input::Cancel, Accepted, Action::None),
    row(Accepted, Input::Canceled, Accepted, Action::None),
    row(Accepted, Input::TransportErr, Accepted, Action::ReportTransportErr),
    row(Accepted, Input::TimerA, Accepted, Action::None),
    row(Accepted, Input::TimerB, Accepted, Action::None),
    row(Accepted, Input::TimerM, Terminated, Action::Delete),
    row(Terminated, Input::Provisional, Terminated, Action::None),
    row(Terminated, Input::Success, Terminated, Action::None),
    row(Terminated, Input::Failure, Terminated, Action::None),
    row(Terminated, Input::Cancel, Terminated, Action::None),
    row(Terminated, Input::Canceled, Terminated, Action::None),
    row(Terminated, Input::TimerA, Terminated, Action::None),
    row(Terminated, Input::TimerB, Terminated, Action::None),
    row(Terminated, Input::TimerD, Terminated, Action::None),
    row(Terminated, Input::TimerM, Terminated, Action::None),
    row(Terminated, Input::TransportErr, Terminated, Action::None),
    row(Terminated, Input::Delete, Terminated, Action::Delete),
];

static NON_INVITE_TABLE: &Table = &[
    row(Trying, Input::Provisional, Proceeding, Action::NonInviteProceeding),
    row(Trying, Input::Success, Completed, Action::NonInviteFinal),
    row(Trying, Input::Failure, Completed, Action::NonInviteFinal),
    row(Trying, Input::TimerE, Trying, Action::NonInviteResend),
    row(Trying, Input::TimerF, Terminated, Action::Timeout),
    row(Trying, Input::TransportErr, Terminated, Action::TransportErr),
    row(Trying, Input::Cancel, Trying, Action::None),
    row(Trying, Input::Canceled, Trying, Action::None),
    row(Proceeding, Input::Provisional, Proceeding, Action::PassUp),
    row(Proceeding, Input::Success, Completed, Action::NonInviteFinal),
    row(Proceeding, Input::Failure, Completed, Action::NonInviteFinal),
    row(Proceeding, Input::TimerE, Proceeding, Action::NonInviteResend),
    row(Proceeding, Input::TimerF, Terminated, Action::Timeout),
    row(Proceeding, Input::TransportErr, Terminated, Action::TransportErr),
    row(Proceeding, Input::Cancel, Proceeding, Action::None),
    row(Proceeding, Input::Canceled, Proceeding, Action::None),
    row(Completed, Input::Provisional, Completed, Action::None),
    row(Completed, Input::Success, Completed, Action::None),
    row(Completed, Input::Failure, Completed, Action::None),
    row(Completed, Input::TimerE, Completed, Action::None),
    row(Completed, Input::TimerF, Completed, Action::None),
    row(Completed, Input::TimerK, Terminated, Action::Delete),
    row(Completed, Input::Cancel, Completed, Action::None),
    row(Completed, Input::Canceled, Completed, Action::None),
    row(Completed, Input::TransportErr, Terminated, Action::TransportErr),
    row(Terminated, Input::Provisional, Terminated, Action::None),
    row(Terminated, Input::Success, Terminated, Action::None),
    row(Terminated, Input::Failure, Terminated, Action::None),
    row(Terminated, Input::TimerE, Terminated, Action::None),
    row(Terminated, Input::TimerF, Terminated, Action::None),
    row(Terminated, Input::TimerK, Terminated, Action::None),
    row(Terminated, Input::Cancel, Terminated, Action::None),
    row(Terminated, Input::Canceled, Terminated, Action::None),
    row(Terminated, Input::TransportErr, Terminated, Action::None),
    row(Terminated, Input::Delete, Terminated, Action::Delete),
];

/// Handle to a client transaction; clones share the transaction
#[derive(Clone)]
pub struct ClientTransaction {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    key: TransactionKey,
    origin: Request,
    invite: bool,
    reliable: bool,
    timers: TimerSettings,
    transport: Arc<dyn TxTransport>,
    core: Mutex<ClientCore>,
    responses: SyncMutex<Option<mpsc::UnboundedReceiver<Response>>>,
    errors: SyncMutex<Option<mpsc::UnboundedReceiver<Error>>>,
    done: CancellationToken,
}

struct ClientCore {
    state: TransactionState,
    timers: Timers,
    /// Current Timer A / Timer E interval
    retransmit_interval: Duration,
    last_response: Option<Response>,
    last_error: Option<Error>,
    responses: Option<mpsc::UnboundedSender<Response>>,
    errors: Option<mpsc::UnboundedSender<Error>>,
}

impl ClientTransaction {
    /// Build a client transaction for `origin`.
    ///
    /// The top Via gets a fresh branch if it has none; a request without a
    /// Via gets one whose sent-by is filled in by the transport.
    pub(crate) fn new(
        origin: Request,
        transport: Arc<dyn TxTransport>,
        timers: TimerSettings,
    ) -> Result<Self> {
        let origin = prepare_request(origin);
        let key = TransactionKey::client(&Message::Request(origin.clone()))?;
        let invite = origin.is_invite();
        let reliable = transport.is_reliable(origin.transport());
        let state = if invite { Calling } else { Trying };

        let (responses_tx, responses_rx) = mpsc::unbounded_channel();
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();

        Ok(ClientTransaction {
            inner: Arc::new(ClientInner {
                key,
                origin,
                invite,
                reliable,
                timers,
                transport,
                core: Mutex::new(ClientCore {
                    state,
                    timers: Timers::new(),
                    retransmit_interval: timers.t1,
                    last_response: None,
                    last_error: None,
                    responses: Some(responses_tx),
                    errors: Some(errors_tx),
                }),
                responses: SyncMutex::new(Some(responses_rx)),
                errors: SyncMutex::new(Some(errors_rx)),
                done: CancellationToken::new(),
            }),
        })
    }

    /// Send the request and arm the initial timers.
    ///
    /// A failed first send terminates the transaction and is returned as
    /// well as queued on its error queue.
    pub(crate) async fn init(&self) -> Result<()> {
        self.inner.init().await
    }

    pub fn key(&self) -> &TransactionKey {
        &self.inner.key
    }

    /// The request as sent, including its Via branch
    pub fn origin(&self) -> &Request {
        &self.inner.origin
    }

    pub fn is_invite(&self) -> bool {
        self.inner.invite
    }

    pub async fn state(&self) -> TransactionState {
        self.inner.core.lock().await.state
    }

    /// Responses passed up by the transaction; only the first call returns
    /// the queue. It closes when the transaction is deleted.
    pub fn take_responses(&self) -> Option<mpsc::UnboundedReceiver<Response>> {
        self.inner.responses.lock().take()
    }

    /// Timeout and transport errors; only the first call returns the queue.
    pub fn take_errors(&self) -> Option<mpsc::UnboundedReceiver<Error>> {
        self.inner.errors.lock().take()
    }

    /// Feed an inbound response
    pub async fn receive(&self, msg: Message) -> Result<()> {
        let res = match msg {
            Message::Response(res) => res,
            Message::Request(req) => {
                return Err(Error::UnexpectedMessage {
                    key: self.inner.key.clone(),
                    message: req.short(),
                    reason: "client transaction only accepts responses".to_string(),
                })
            }
        };

        let mut core = self.inner.core.lock().await;
        let input = if res.is_cancel() {
            Input::Canceled
        } else {
            let input = if res.is_provisional() {
                Input::Provisional
            } else if res.is_success() {
                Input::Success
            } else {
                Input::Failure
            };
            // Responses the current state ignores must not replace the one to acknowledge
            if self.inner.acts_on(core.state, input) {
                core.last_response = Some(res);
            }
            input
        };
        self.inner.spin(&mut core, input).await
    }

    /// Cancel a pending INVITE by sending CANCEL (RFC 3261 9.1).
    ///
    /// Ignored for non-INVITE transactions and once a final response arrived.
    pub async fn cancel(&self) -> Result<()> {
        let mut core = self.inner.core.lock().await;
        self.inner.spin(&mut core, Input::Cancel).await
    }

    /// Re-send the ACK for the last non-2xx final response
    pub async fn ack(&self) -> Result<()> {
        let mut core = self.inner.core.lock().await;
        let acknowledgeable = core
            .last_response
            .as_ref()
            .map_or(false, |res| res.is_error());
        if !self.inner.invite || !acknowledgeable {
            return Err(Error::InvalidTransition {
                key: self.inner.key.clone(),
                state: core.state.to_string(),
                input: "ack".to_string(),
            });
        }
        if let Some(input) = self.inner.send_ack(&mut core).await {
            let err = core.last_error.clone();
            self.inner.spin(&mut core, input).await?;
            if let Some(err) = err {
                return Err(err);
            }
        }
        Ok(())
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

    pub(crate) fn same(&self, other: &ClientTransaction) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for ClientTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientTransaction")
            .field("key", &self.inner.key)
            .field("origin", &self.inner.origin.short())
            .finish()
    }
}

impl ClientInner {
    async fn init(self: &Arc<Self>) -> Result<()> {
        let mut core = self.core.lock().await;
        debug!(key = %self.key, "client transaction created for {}", self.origin.short());

        let origin = Message::Request(self.origin.clone());
        if let Err(e) = self.transport.send(&origin).await {
            let err = transport_error(&self.key, &origin, &e);
            core.last_error = Some(err.clone());
            if let Err(spin_err) = self.spin(&mut core, Input::TransportErr).await {
                error!(key = %self.key, "{}", spin_err);
            }
            return Err(err);
        }

        let (retransmit, timeout, timeout_after) = if self.invite {
            (TimerType::A, TimerType::B, self.timers.timer_b())
        } else {
            (TimerType::E, TimerType::F, self.timers.timer_f())
        };
        // RFC 3261 17.1.1.2 and 17.1.2.2: no retransmissions over reliable transports
        if !self.reliable {
            let interval = self.timers.timer_a();
            core.retransmit_interval = interval;
            self.arm(&mut core, retransmit, interval);
        }
        self.arm(&mut core, timeout, timeout_after);
        Ok(())
    }

    fn table(&self) -> &'static Table {
        if self.invite {
            INVITE_TABLE
        } else {
            NON_INVITE_TABLE
        }
    }

    fn acts_on(&self, state: TransactionState, input: Input) -> bool {
        lookup(self.table(), state, input).map_or(false, |(_, action)| action != Action::None)
    }

    async fn spin(self: &Arc<Self>, core: &mut ClientCore, input: Input) -> Result<()> {
        let table = self.table();
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
                debug!(key = %self.key, from = %core.state, to = %to, "client transaction state changed");
            }
            core.state = to;
            next = self.act(core, action).await;
        }
        Ok(())
    }

    async fn act(self: &Arc<Self>, core: &mut ClientCore, action: Action) -> Option<Input> {
        match action {
            Action::None => None,
            Action::InviteResend => {
                let interval = core.retransmit_interval * 2;
                core.retransmit_interval = interval;
                self.arm(core, TimerType::A, interval);
                self.resend(core).await
            }
            Action::NonInviteResend => {
                let interval = (core.retransmit_interval * 2).min(self.timers.t2);
                core.retransmit_interval = interval;
                self.arm(core, TimerType::E, interval);
                self.resend(core).await
            }
            Action::InviteProceeding => {
                self.pass_up(core);
                core.timers.stop(TimerType::A);
                core.timers.stop(TimerType::B);
                None
            }
            Action::NonInviteProceeding => {
                self.pass_up(core);
                // RFC 3261 17.1.2.2: keep retransmitting, every T2
                if core.timers.is_armed(TimerType::E) {
                    core.retransmit_interval = self.timers.t2;
                    self.arm(core, TimerType::E, self.timers.t2);
                }
                None
            }
            Action::PassUp => {
                self.pass_up(core);
                None
            }
            Action::PassUpAccept => {
                self.pass_up(core);
                core.timers.stop(TimerType::A);
                core.timers.stop(TimerType::B);
                self.arm(core, TimerType::M, self.timers.timer_m());
                None
            }
            Action::InviteFinal => {
                let next = self.send_ack(core).await;
                self.pass_up(core);
                core.timers.stop(TimerType::A);
                core.timers.stop(TimerType::B);
                self.arm(core, TimerType::D, self.timers.timer_d(self.reliable));
                next
            }
            Action::NonInviteFinal => {
                self.pass_up(core);
                core.timers.stop(TimerType::E);
                core.timers.stop(TimerType::F);
                self.arm(core, TimerType::K, self.timers.timer_k(self.reliable));
                None
            }
            Action::Ack => self.send_ack(core).await,
            Action::Cancel => self.send_cancel(core).await,
            Action::CancelTimeout => {
                let next = self.send_cancel(core).await;
                self.arm(core, TimerType::B, self.timers.timer_b());
                next
            }
            Action::Canceled => {
                debug!(key = %self.key, "CANCEL answered");
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

    fn arm(self: &Arc<Self>, core: &mut ClientCore, timer: TimerType, after: Duration) {
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
            TimerType::A => Input::TimerA,
            TimerType::B => Input::TimerB,
            TimerType::D => Input::TimerD,
            TimerType::E => Input::TimerE,
            TimerType::F => Input::TimerF,
            TimerType::K => Input::TimerK,
            TimerType::M => Input::TimerM,
            other => {
                warn!(key = %self.key, timer = %other, "timer not used by client transactions");
                return;
            }
        };
        if let Err(e) = self.spin(&mut core, input).await {
            error!(key = %self.key, "spin on timer {} failed: {}", timer, e);
        }
    }

    async fn resend(&self, core: &mut ClientCore) -> Option<Input> {
        if self.done.is_cancelled() {
            return None;
        }
        debug!(key = %self.key, "resend origin request");
        self.send(core, Message::Request(self.origin.clone())).await
    }

    async fn send(&self, core: &mut ClientCore, msg: Message) -> Option<Input> {
        match self.transport.send(&msg).await {
            Ok(()) => None,
            Err(e) => {
                error!(key = %self.key, "send {} failed: {}", msg.short(), e);
                core.last_error = Some(transport_error(&self.key, &msg, &e));
                Some(Input::TransportErr)
            }
        }
    }

    async fn send_ack(&self, core: &mut ClientCore) -> Option<Input> {
        let Some(res) = core.last_response.as_ref() else {
            return None;
        };
        match Request::ack_for(&self.origin, res) {
            Ok(ack) => self.send(core, Message::Request(ack)).await,
            Err(e) => {
                error!(key = %self.key, "cannot build ACK for {}: {}", res.short(), e);
                None
            }
        }
    }

    async fn send_cancel(&self, core: &mut ClientCore) -> Option<Input> {
        if !self.invite {
            return None;
        }
        match Request::cancel_for(&self.origin) {
            Ok(cancel) => self.send(core, Message::Request(cancel)).await,
            Err(e) => {
                error!(key = %self.key, "cannot build CANCEL: {}", e);
                None
            }
        }
    }

    fn pass_up(&self, core: &ClientCore) {
        if let (Some(res), Some(queue)) = (&core.last_response, &core.responses) {
            let _ = queue.send(res.clone());
        }
    }

    fn report(&self, core: &ClientCore, err: Error) {
        debug!(key = %self.key, "reporting {}", err);
        if let Some(queue) = &core.errors {
            let _ = queue.send(err);
        }
    }

    fn report_transport_error(&self, core: &mut ClientCore) {
        let err = core.last_error.take().unwrap_or_else(|| Error::Transport {
            key: self.key.clone(),
            message: self.origin.short(),
            reason: "unknown transport failure".to_string(),
        });
        self.report(core, err);
    }

    fn delete(&self, core: &mut ClientCore) {
        if self.done.is_cancelled() {
            return;
        }
        core.timers.stop_all();
        core.responses = None;
        core.errors = None;
        self.done.cancel();
        debug!(key = %self.key, "client transaction done");
    }
}

/// Make sure the request carries a top Via with a branch (RFC 3261 8.1.1.7)
fn prepare_request(mut origin: Request) -> Request {
    match origin.via_hop() {
        Ok(mut hop) => {
            if hop.branch().map_or(true, str::is_empty) {
                hop.params.set("branch", Some(generate_branch()));
                origin.set_via_hop(&hop);
            }
        }
        Err(_) => {
            // No port: the transport fills in one of its listening ports.
            let hop = ViaHop::new(origin.transport().as_str(), "127.0.0.1", None).with_branch(generate_branch());
            origin.headers.prepend("Via", hop.to_string());
        }
    }
    origin
}
