//! Front-end side of the message bus
//!
//! `MessageService` assigns correlation ids, writes one envelope per call and
//! routes every inbound response back to its caller (or subscriber) purely by
//! id.

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::protocol::{
    IdRequest, MessageRequest, Origin, TransportRequest, TransportResponse,
    PROVIDER_RPC_INTERNAL_ERROR,
};
use crate::transport::FrontendPort;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The background answered with an error
    #[error("{0}")]
    Remote(String),

    /// Error raised on behalf of an injected provider
    #[error("{message}")]
    ProviderRpc { message: String, code: i64 },

    #[error("Message port disconnected")]
    Disconnected,

    #[error("Failed to encode request: {0}")]
    Encode(String),

    #[error("Unexpected response: {0}")]
    Decode(String),
}

/// Where transport-level problems go: responses nobody asked for,
/// subscriptions the background refused.
pub trait ErrorSink: Send + Sync {
    fn report(&self, message: &str, context: Value);
}

pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn report(&self, message: &str, context: Value) {
        tracing::error!(context = %context, "{}", message);
    }
}

struct Handler {
    resolve: Option<oneshot::Sender<Result<Value, BusError>>>,
    subscriber: Option<mpsc::UnboundedSender<Value>>,
}

pub struct MessageService {
    origin: Origin,
    outbound: mpsc::UnboundedSender<TransportRequest>,
    handlers: Mutex<HashMap<String, Handler>>,
    id_counter: AtomicU64,
    errors: Arc<dyn ErrorSink>,
}

impl MessageService {
    pub fn new(
        origin: Origin,
        outbound: mpsc::UnboundedSender<TransportRequest>,
        errors: Arc<dyn ErrorSink>,
    ) -> Self {
        Self {
            origin,
            outbound,
            handlers: Mutex::new(HashMap::new()),
            id_counter: AtomicU64::new(0),
            errors,
        }
    }

    /// Wrap a port and start routing its responses.
    pub fn connect(port: FrontendPort, origin: Origin, errors: Arc<dyn ErrorSink>) -> Arc<Self> {
        let FrontendPort { tx, mut rx } = port;
        let service = Arc::new(Self::new(origin, tx, errors));

        // Weak so an abandoned service can drop its port and end the loop
        let weak = Arc::downgrade(&service);
        tokio::spawn(async move {
            while let Some(response) = rx.recv().await {
                let Some(service) = weak.upgrade() else {
                    return;
                };
                service.handle_response(response);
            }
            if let Some(service) = weak.upgrade() {
                service.disconnect();
            }
        });

        service
    }

    /// Send a request and wait for its single response.
    pub async fn send_message(&self, request: &MessageRequest) -> Result<Value, BusError> {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.handlers().insert(
            id.clone(),
            Handler {
                resolve: Some(tx),
                subscriber: None,
            },
        );

        if let Err(e) = self.post(&id, request) {
            self.handlers().remove(&id);
            return Err(e);
        }

        rx.await.unwrap_or(Err(BusError::Disconnected))
    }

    /// `send_message` with the response decoded into `T`
    pub async fn send<T: DeserializeOwned>(&self, request: &MessageRequest) -> Result<T, BusError> {
        let value = self.send_message(request).await?;
        serde_json::from_value(value).map_err(|e| BusError::Decode(e.to_string()))
    }

    /// Open a subscription. Payloads arrive on the returned stream until
    /// `Subscription::unsubscribe` completes.
    pub fn subscribe(self: &Arc<Self>, request: &MessageRequest) -> Result<Subscription, BusError> {
        let id = self.next_id();
        let (tx, updates) = mpsc::unbounded_channel();
        self.handlers().insert(
            id.clone(),
            Handler {
                resolve: None,
                subscriber: Some(tx),
            },
        );

        if let Err(e) = self.post(&id, request) {
            self.handlers().remove(&id);
            return Err(e);
        }

        Ok(Subscription {
            id,
            updates,
            service: self.clone(),
        })
    }

    /// Route one inbound response. Never writes to the transport.
    pub fn handle_response(&self, data: TransportResponse) {
        let (resolve, subscriber) = {
            let mut handlers = self.handlers();
            let Some(mut handler) = handlers.remove(&data.id) else {
                drop(handlers);
                self.errors.report(
                    "No handler for this response",
                    json!({
                        "id": data.id,
                        "error": data.error,
                        "subscription": data.subscription,
                        "response": data.response,
                    }),
                );
                return;
            };

            let resolve = handler.resolve.take();
            let subscriber = handler.subscriber.clone();
            if subscriber.is_some() {
                // Subscriptions live until unsubscribe
                handlers.insert(data.id.clone(), handler);
            }
            (resolve, subscriber)
        };

        if let (Some(payload), Some(subscriber)) = (data.subscription, &subscriber) {
            if subscriber.send(payload).is_err() {
                tracing::debug!("Subscriber for {} went away", data.id);
            }
            return;
        }

        let result = match data.error {
            Some(message) if data.is_provider_rpc_error == Some(true) => Err(BusError::ProviderRpc {
                message,
                code: data.code.unwrap_or(PROVIDER_RPC_INTERNAL_ERROR),
            }),
            Some(message) => Err(BusError::Remote(message)),
            None => Ok(data.response.unwrap_or(Value::Null)),
        };

        match resolve {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => {
                if let Err(e) = result {
                    self.errors.report(
                        "subscription failed",
                        json!({ "id": data.id, "error": e.to_string() }),
                    );
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn handler_count(&self) -> usize {
        self.handlers().len()
    }

    fn disconnect(&self) {
        let handlers: Vec<Handler> = self.handlers().drain().map(|(_, h)| h).collect();
        if !handlers.is_empty() {
            tracing::warn!("Port closed with {} calls outstanding", handlers.len());
        }
        for handler in handlers {
            if let Some(tx) = handler.resolve {
                let _ = tx.send(Err(BusError::Disconnected));
            }
        }
    }

    fn post(&self, id: &str, request: &MessageRequest) -> Result<(), BusError> {
        let envelope = TransportRequest::new(id, self.origin, request)
            .map_err(|e| BusError::Encode(format!("{:#}", e)))?;
        self.outbound
            .send(envelope)
            .map_err(|_| BusError::Disconnected)
    }

    fn next_id(&self) -> String {
        let count = self.id_counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}.{}", crate::now_millis(), count)
    }

    fn handlers(&self) -> MutexGuard<'_, HashMap<String, Handler>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct Subscription {
    id: String,
    updates: mpsc::UnboundedReceiver<Value>,
    service: Arc<MessageService>,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn next(&mut self) -> Option<Value> {
        self.updates.recv().await
    }

    /// Ask the background to stop, then forget the handler.
    pub async fn unsubscribe(self) -> Result<(), BusError> {
        let request = MessageRequest::Unsubscribe(IdRequest {
            id: self.id.clone(),
        });
        self.service.send_message(&request).await?;
        self.service.handlers().remove(&self.id);
        Ok(())
    }
}
