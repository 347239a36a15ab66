//! Transaction layer.
//!
//! Sits between the transport layer and the application. Outbound requests
//! become client transactions and responses are routed to the server
//! transaction they answer. Inbound messages are matched against the store
//! of live transactions (RFC 3261 17.1.3 and 17.2.3); what matches nothing
//! is handled here:
//!
//! - an ACK (for a 2xx) goes to the ACK queue
//! - a CANCEL is answered with `481 Transaction Does Not Exist`
//! - any other request creates a server transaction, passed up on the
//!   request queue
//! - a response goes to the response queue (RFC 3261 17.1.1.2)
//!
//! Every stored transaction is watched by a task that drops it from the
//! store once it is done, or terminates it when the layer is canceled.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use sipflow_infra_common::task::{spawn_guarded, spawn_tracked};
use sipflow_sip_core::{status, Message, Request, Response};
use sipflow_sip_transport::TransportLayer;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::TransactionConfig;
use crate::error::{Error, Result};
use crate::key::TransactionKey;
use crate::transaction::{transport_error, ClientTransaction, ServerTransaction, Transaction};
use crate::transport::TxTransport;

#[derive(Clone)]
pub struct TransactionLayer {
    inner: Arc<LayerInner>,
}

struct LayerInner {
    config: TransactionConfig,
    transport: Arc<dyn TxTransport>,
    store: DashMap<TransactionKey, Transaction>,
    requests: Mutex<Option<mpsc::Receiver<ServerTransaction>>>,
    acks: Mutex<Option<mpsc::Receiver<Request>>>,
    responses: Mutex<Option<mpsc::Receiver<Response>>>,
    errors: Mutex<Option<mpsc::Receiver<Error>>>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    done: CancellationToken,
}

/// Sending halves of the application queues, owned by the serve loop
struct Outputs {
    requests: mpsc::Sender<ServerTransaction>,
    acks: mpsc::Sender<Request>,
    responses: mpsc::Sender<Response>,
    errors: mpsc::Sender<Error>,
}

impl TransactionLayer {
    /// Layer on top of `transport`, consuming its inbound message queue.
    ///
    /// Fails if that queue was already taken. Transport errors stay on the
    /// transport layer's own error queue.
    pub fn new(transport: TransportLayer, config: TransactionConfig) -> Result<Self> {
        let inbound = transport
            .take_messages()
            .ok_or_else(|| Error::Config("transport message queue already taken".to_string()))?;
        Ok(Self::with_transport(Arc::new(transport), inbound, config))
    }

    /// Layer over any transaction transport, fed from `inbound`.
    pub fn with_transport(
        transport: Arc<dyn TxTransport>,
        inbound: mpsc::Receiver<Message>,
        config: TransactionConfig,
    ) -> Self {
        let capacity = config.queue_capacity.max(1);
        let (requests_tx, requests_rx) = mpsc::channel(capacity);
        let (acks_tx, acks_rx) = mpsc::channel(capacity);
        let (responses_tx, responses_rx) = mpsc::channel(capacity);
        let (errors_tx, errors_rx) = mpsc::channel(capacity);

        let inner = Arc::new(LayerInner {
            config,
            transport,
            store: DashMap::new(),
            requests: Mutex::new(Some(requests_rx)),
            acks: Mutex::new(Some(acks_rx)),
            responses: Mutex::new(Some(responses_rx)),
            errors: Mutex::new(Some(errors_rx)),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            done: CancellationToken::new(),
        });
        let outputs = Outputs {
            requests: requests_tx,
            acks: acks_tx,
            responses: responses_tx,
            errors: errors_tx,
        };
        spawn_guarded("transaction-layer", LayerInner::serve(inner.clone(), inbound, outputs));
        TransactionLayer { inner }
    }

    pub fn config(&self) -> &TransactionConfig {
        &self.inner.config
    }

    /// Send `req` as a new client transaction.
    ///
    /// ACK is rejected: an ACK for a 2xx is sent directly through the
    /// transport and an ACK for a non-2xx is sent by the INVITE transaction.
    pub async fn request(&self, req: Request) -> Result<ClientTransaction> {
        if self.inner.cancel.is_cancelled() {
            return Err(Error::LayerCanceled);
        }
        if req.is_ack() {
            return Err(Error::AckNotAllowed);
        }

        let tx = ClientTransaction::new(req, self.inner.transport.clone(), self.inner.config.timers)?;
        // Stored before the first send so that a fast response finds it
        self.inner.insert(Transaction::Client(tx.clone()))?;
        tx.init().await?;
        Ok(tx)
    }

    /// Send `res` through the server transaction it answers
    pub async fn respond(&self, res: Response) -> Result<ServerTransaction> {
        if self.inner.cancel.is_cancelled() {
            return Err(Error::LayerCanceled);
        }

        let key = TransactionKey::server(&Message::Response(res.clone()))?;
        let tx = self.inner.server(&key).ok_or(Error::NoTransaction(key))?;
        tx.respond(res).await?;
        Ok(tx)
    }

    /// Live transaction stored under `key`
    pub fn transaction(&self, key: &TransactionKey) -> Option<Transaction> {
        self.inner.store.get(key).map(|entry| entry.value().clone())
    }

    /// Number of live transactions
    pub fn len(&self) -> usize {
        self.inner.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.store.is_empty()
    }

    /// New server transactions; only the first call returns the queue.
    pub fn take_requests(&self) -> Option<mpsc::Receiver<ServerTransaction>> {
        self.inner.requests.lock().take()
    }

    /// ACKs matching no transaction; only the first call returns the queue.
    pub fn take_acks(&self) -> Option<mpsc::Receiver<Request>> {
        self.inner.acks.lock().take()
    }

    /// Responses matching no transaction; only the first call returns the queue.
    pub fn take_responses(&self) -> Option<mpsc::Receiver<Response>> {
        self.inner.responses.lock().take()
    }

    /// Failures handling inbound messages; only the first call returns the queue.
    pub fn take_errors(&self) -> Option<mpsc::Receiver<Error>> {
        self.inner.errors.lock().take()
    }

    /// Start shutting down; every live transaction is terminated. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Resolves once every transaction is gone and the queues are closed
    pub async fn done(&self) {
        self.inner.done.cancelled().await;
    }
}

impl LayerInner {
    async fn serve(self: Arc<Self>, mut inbound: mpsc::Receiver<Message>, outputs: Outputs) {
        debug!("transaction layer started");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                msg = inbound.recv() => match msg {
                    Some(msg) => self.handle_message(msg, &outputs).await,
                    None => {
                        debug!("inbound message queue closed");
                        break;
                    }
                },
            }
        }

        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        drop(outputs);
        info!("transaction layer stopped");
        self.done.cancel();
    }

    /// Store `tx` and watch it until it ends. A live transaction under the
    /// same key is left alone and the new one is refused.
    fn insert(self: &Arc<Self>, tx: Transaction) -> Result<()> {
        match self.store.entry(tx.key().clone()) {
            Entry::Occupied(_) => return Err(Error::DuplicateKey(tx.key().clone())),
            Entry::Vacant(slot) => {
                slot.insert(tx.clone());
            }
        }

        let inner = self.clone();
        spawn_tracked(&self.tracker, "transaction", async move {
            tokio::select! {
                _ = inner.cancel.cancelled() => tx.terminate().await,
                _ = tx.done() => {}
            }
            inner.remove(&tx);
        });
        Ok(())
    }

    fn remove(&self, tx: &Transaction) {
        if self.store.remove_if(tx.key(), |_, stored| stored.same(tx)).is_some() {
            debug!(key = %tx.key(), "transaction removed");
        }
    }

    fn client(&self, key: &TransactionKey) -> Option<ClientTransaction> {
        match self.store.get(key).as_deref() {
            Some(Transaction::Client(tx)) => Some(tx.clone()),
            _ => None,
        }
    }

    fn server(&self, key: &TransactionKey) -> Option<ServerTransaction> {
        match self.store.get(key).as_deref() {
            Some(Transaction::Server(tx)) => Some(tx.clone()),
            _ => None,
        }
    }

    async fn handle_message(self: &Arc<Self>, msg: Message, outputs: &Outputs) {
        debug!("handling {}", msg.short());
        match msg {
            Message::Request(req) => self.handle_request(req, outputs).await,
            Message::Response(res) => self.handle_response(res, outputs).await,
        }
    }

    async fn handle_request(self: &Arc<Self>, req: Request, outputs: &Outputs) {
        let key = match TransactionKey::server(&Message::Request(req.clone())) {
            Ok(key) => Some(key),
            Err(e) if !req.is_ack() => {
                warn!("dropping {}: {}", req.short(), e);
                self.report(outputs, e);
                return;
            }
            Err(_) => None,
        };

        // Retransmission, CANCEL or ACK for a non-2xx
        if let Some(tx) = key.as_ref().and_then(|key| self.server(key)) {
            match tx.receive(Message::Request(req.clone())).await {
                Ok(()) => return,
                Err(e) if !req.is_ack() => {
                    error!(key = %tx.key(), "{}", e);
                    self.report(outputs, e);
                    return;
                }
                // ACK for a 2xx from a peer that reused the INVITE branch
                Err(e) => debug!(key = %tx.key(), "{}", e),
            }
        }

        if req.is_ack() {
            forward(&self.cancel, &outputs.acks, req).await;
            return;
        }

        if req.is_cancel() {
            if let Some(key) = key {
                self.reject_cancel(key, &req, outputs).await;
            }
            return;
        }

        let tx = match ServerTransaction::new(req, self.transport.clone(), self.config.timers) {
            Ok(tx) => tx,
            Err(e) => {
                warn!("cannot create server transaction: {}", e);
                self.report(outputs, e);
                return;
            }
        };
        if let Err(e) = self.insert(Transaction::Server(tx.clone())) {
            warn!("dropping {}: {}", tx.origin().short(), e);
            self.report(outputs, e);
            return;
        }
        tx.init().await;
        forward(&self.cancel, &outputs.requests, tx).await;
    }

    /// RFC 3261 9.2: a CANCEL matching no transaction gets a 481
    async fn reject_cancel(&self, key: TransactionKey, req: &Request, outputs: &Outputs) {
        let res = Response::from_request(
            req,
            status::CALL_TRANSACTION_DOES_NOT_EXIST,
            Some("Transaction Does Not Exist"),
        );
        let msg = Message::Response(res);
        if let Err(e) = self.transport.send(&msg).await {
            error!(key = %key, "respond 481 on unmatched CANCEL failed: {}", e);
            self.report(outputs, transport_error(&key, &msg, &e));
        }
    }

    async fn handle_response(&self, res: Response, outputs: &Outputs) {
        let matched = TransactionKey::client(&Message::Response(res.clone()))
            .ok()
            .and_then(|key| self.client(&key));

        match matched {
            Some(tx) => {
                if let Err(e) = tx.receive(Message::Response(res)).await {
                    error!(key = %tx.key(), "{}", e);
                    self.report(outputs, e);
                }
            }
            None => {
                debug!("passing up unmatched {}", res.short());
                forward(&self.cancel, &outputs.responses, res).await;
            }
        }
    }

    fn report(&self, outputs: &Outputs, err: Error) {
        match outputs.errors.try_send(err) {
            Ok(()) => {}
            Err(TrySendError::Full(err)) => warn!("transaction error queue full, dropping: {}", err),
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

/// Push `item` to an application queue unless the layer is canceled first
async fn forward<T>(cancel: &CancellationToken, queue: &mpsc::Sender<T>, item: T) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        sent = queue.send(item) => if sent.is_err() {
            debug!("application queue closed");
        },
    }
}
