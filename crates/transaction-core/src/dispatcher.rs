//! Per-method dispatch of inbound requests.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use sipflow_infra_common::task::spawn_tracked;
use sipflow_sip_core::{status, Method, Request, Response};
use tokio_util::task::TaskTracker;
use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::layer::TransactionLayer;
use crate::transaction::ServerTransaction;

/// Handler for requests of one method.
///
/// Gets the request and, except for ACKs passed up outside a transaction,
/// the server transaction to respond through.
pub type RequestHandler =
    Arc<dyn Fn(Request, Option<ServerTransaction>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Routes inbound requests to handlers by method.
///
/// Requests with no handler are answered `405 Method Not Allowed` with an
/// `Allow` header listing the registered methods. ACKs are never answered.
#[derive(Default)]
pub struct RequestDispatcher {
    handlers: HashMap<Method, RequestHandler>,
}

impl RequestDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `method`, replacing any previous one
    pub fn on<F, Fut>(mut self, method: Method, handler: F) -> Self
    where
        F: Fn(Request, Option<ServerTransaction>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: RequestHandler = Arc::new(move |req, tx| handler(req, tx).boxed());
        self.handlers.insert(method, handler);
        self
    }

    /// Registered methods, sorted
    pub fn allowed(&self) -> Vec<Method> {
        let mut methods: Vec<Method> = self.handlers.keys().cloned().collect();
        methods.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        methods
    }

    /// Run the handler for `req`, or answer 405 through `tx`
    pub async fn dispatch(&self, req: Request, tx: Option<ServerTransaction>) -> Result<()> {
        if let Some(handler) = self.handlers.get(&req.method) {
            handler(req, tx).await;
            return Ok(());
        }

        debug!("no handler for {}", req.short());
        match tx {
            Some(tx) if !req.is_ack() => tx.respond(self.method_not_allowed(&req)).await,
            _ => Ok(()),
        }
    }

    /// Consume the request and ACK queues of `layer` until they close,
    /// running every request in its own task.
    pub async fn serve(self: Arc<Self>, layer: TransactionLayer) -> Result<()> {
        let mut requests = layer
            .take_requests()
            .ok_or_else(|| Error::Config("transaction request queue already taken".to_string()))?;
        let mut acks = layer
            .take_acks()
            .ok_or_else(|| Error::Config("transaction ACK queue already taken".to_string()))?;

        let tracker = TaskTracker::new();
        let (mut requests_open, mut acks_open) = (true, true);
        while requests_open || acks_open {
            let (req, tx) = tokio::select! {
                tx = requests.recv(), if requests_open => match tx {
                    Some(tx) => (tx.origin().clone(), Some(tx)),
                    None => {
                        requests_open = false;
                        continue;
                    }
                },
                ack = acks.recv(), if acks_open => match ack {
                    Some(ack) => (ack, None),
                    None => {
                        acks_open = false;
                        continue;
                    }
                },
            };

            let dispatcher = self.clone();
            spawn_tracked(&tracker, "request-handler", async move {
                let short = req.short();
                if let Err(e) = dispatcher.dispatch(req, tx).await {
                    error!("handling {} failed: {}", short, e);
                }
            });
        }

        tracker.close();
        tracker.wait().await;
        debug!("request dispatcher stopped");
        Ok(())
    }

    fn method_not_allowed(&self, req: &Request) -> Response {
        let allow = self
            .allowed()
            .iter()
            .map(Method::as_str)
            .collect::<Vec<_>>()
            .join(", ");
        let mut res = Response::from_request(req, status::METHOD_NOT_ALLOWED, None);
        if !allow.is_empty() {
            res.headers.push("Allow", allow);
        }
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimerSettings;
    use crate::testing::MockTransport;
    use sipflow_sip_core::Uri;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn request(method: Method) -> Request {
        let cseq = format!("1 {}", method);
        Request::new(method, Uri::sip("127.0.0.1", None))
            .with_header("Via", "SIP/2.0/UDP 127.0.0.1:5070;branch=z9hG4bKdispatch")
            .with_header("From", "<sip:alice@example.com>;tag=d1")
            .with_header("To", "<sip:bob@example.com>")
            .with_header("Call-ID", "dispatch-unit")
            .with_header("CSeq", cseq)
    }

    #[tokio::test]
    async fn test_unhandled_method_gets_405() {
        let transport = MockTransport::new();
        let dispatcher = RequestDispatcher::new()
            .on(Method::Options, |_, _| async {})
            .on(Method::Bye, |_, _| async {});
        assert_eq!(dispatcher.allowed(), vec![Method::Bye, Method::Options]);

        let req = request(Method::Message);
        let tx = ServerTransaction::new(req.clone(), transport.clone(), TimerSettings::default()).unwrap();
        tx.init().await;
        dispatcher.dispatch(req, Some(tx)).await.unwrap();

        let sent = transport.next_sent().await.unwrap();
        match sent.message {
            sipflow_sip_core::Message::Response(res) => {
                assert_eq!(res.status, 405);
                assert_eq!(res.headers.get("Allow"), Some("BYE, OPTIONS"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handler_runs_and_ack_is_never_answered() {
        let transport = MockTransport::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let dispatcher = RequestDispatcher::new().on(Method::Options, move |_, tx| {
            let counter = counter.clone();
            async move {
                assert!(tx.is_some());
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let req = request(Method::Options);
        let tx = ServerTransaction::new(req.clone(), transport.clone(), TimerSettings::default()).unwrap();
        dispatcher.dispatch(req, Some(tx)).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        dispatcher.dispatch(request(Method::Ack), None).await.unwrap();
        assert!(transport.sent().is_empty());
    }
}
