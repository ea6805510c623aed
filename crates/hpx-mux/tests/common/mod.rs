//! In-memory connector for driving the manager without a network.

#![allow(dead_code)]

use std::{collections::VecDeque, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures_util::stream;
use hpx_mux::{
    ConnectionManager, Connector, CredentialProvider, EventKind, ManagerConfig, SocketInput,
    SocketParts, SocketRequest, SocketWriter, TransportError, TransportEvent, TransportResult,
    frame::Inbound,
};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

/// What the next dial does.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dial {
    Accept,
    Refuse,
    Hang,
}

#[derive(Default)]
struct ConnectorState {
    requests: Vec<SocketRequest>,
    script: VecDeque<Dial>,
    fallback: Option<Dial>,
    sockets: Vec<MockSocket>,
}

#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<ConnectorState>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every dial is refused unless scripted otherwise.
    pub fn refusing() -> Self {
        let connector = Self::default();
        connector.state.lock().fallback = Some(Dial::Refuse);
        connector
    }

    /// Queue behaviours for the next dials.
    pub fn script(&self, dials: impl IntoIterator<Item = Dial>) {
        self.state.lock().script.extend(dials);
    }

    pub fn dial_count(&self) -> usize {
        self.state.lock().requests.len()
    }

    pub fn requests(&self) -> Vec<SocketRequest> {
        self.state.lock().requests.clone()
    }

    pub fn sockets(&self) -> Vec<MockSocket> {
        self.state.lock().sockets.clone()
    }

    pub fn socket(&self, index: usize) -> MockSocket {
        self.state.lock().sockets[index].clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, request: SocketRequest) -> TransportResult<SocketParts> {
        let dial = {
            let mut state = self.state.lock();
            state.requests.push(request.clone());
            let fallback = state.fallback.unwrap_or(Dial::Accept);
            state.script.pop_front().unwrap_or(fallback)
        };

        match dial {
            Dial::Accept => {
                let (socket, parts) = MockSocket::pair(request);
                self.state.lock().sockets.push(socket);
                Ok(parts)
            }
            Dial::Refuse => Err(TransportError::websocket("connection refused")),
            Dial::Hang => std::future::pending().await,
        }
    }
}

/// Server side of one accepted socket.
#[derive(Clone)]
pub struct MockSocket {
    pub request: SocketRequest,
    written: Arc<Mutex<Vec<String>>>,
    closed: Arc<Mutex<Option<(u16, String)>>>,
    inbound: Arc<Mutex<Option<mpsc::UnboundedSender<TransportResult<SocketInput>>>>>,
}

impl MockSocket {
    fn pair(request: SocketRequest) -> (Self, SocketParts) {
        let (tx, rx) = mpsc::unbounded_channel();
        let written = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(Mutex::new(None));

        let socket = Self {
            request,
            written: Arc::clone(&written),
            closed: Arc::clone(&closed),
            inbound: Arc::new(Mutex::new(Some(tx))),
        };
        let reader = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        let parts = SocketParts {
            writer: Box::new(MockWriter { written, closed }),
            reader: Box::pin(reader),
        };
        (socket, parts)
    }

    fn push(&self, item: TransportResult<SocketInput>) {
        if let Some(tx) = self.inbound.lock().as_ref() {
            let _ = tx.send(item);
        }
    }

    /// Deliver a text frame to the client.
    pub fn push_text(&self, text: impl Into<String>) {
        self.push(Ok(SocketInput::Message(Inbound::Text(text.into()))));
    }

    /// Deliver a JSON frame to the client.
    pub fn push_json(&self, value: Value) {
        self.push_text(value.to_string());
    }

    /// Send a close frame to the client.
    pub fn close(&self, code: u16, reason: &str) {
        self.push(Ok(SocketInput::Close {
            code,
            reason: reason.to_string(),
        }));
        self.inbound.lock().take();
    }

    /// Fail the read half.
    pub fn fail(&self, message: &str) {
        self.push(Err(TransportError::websocket(message)));
        self.inbound.lock().take();
    }

    /// Frames the client wrote.
    pub fn written(&self) -> Vec<String> {
        self.written.lock().clone()
    }

    /// Frames the client wrote, parsed as JSON where possible.
    pub fn written_json(&self) -> Vec<Value> {
        self.written()
            .iter()
            .map(|text| serde_json::from_str(text).unwrap_or(Value::String(text.clone())))
            .collect()
    }

    /// Close frame the client sent.
    pub fn closed_with(&self) -> Option<(u16, String)> {
        self.closed.lock().clone()
    }
}

struct MockWriter {
    written: Arc<Mutex<Vec<String>>>,
    closed: Arc<Mutex<Option<(u16, String)>>>,
}

#[async_trait]
impl SocketWriter for MockWriter {
    async fn send_text(&mut self, text: String) -> TransportResult<()> {
        if self.closed.lock().is_some() {
            return Err(TransportError::websocket("write after close"));
        }
        self.written.lock().push(text);
        Ok(())
    }

    async fn close(&mut self, code: u16, reason: &str) -> TransportResult<()> {
        *self.closed.lock() = Some((code, reason.to_string()));
        Ok(())
    }
}

pub fn resolver(path: &str) -> String {
    format!("ws://mock.test{path}")
}

pub fn manager<C: CredentialProvider>(
    config: ManagerConfig,
    connector: &MockConnector,
    credentials: C,
) -> ConnectionManager {
    ConnectionManager::with_connector(config, resolver, credentials, connector.clone())
        .expect("valid config")
}

/// Let every spawned task run until the runtime is idle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

/// Events received so far.
pub fn drain(rx: &mut broadcast::Receiver<TransportEvent>) -> Vec<TransportEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn kinds(events: &[TransportEvent]) -> Vec<EventKind> {
    events.iter().map(|event| event.kind).collect()
}

pub fn count(events: &[TransportEvent], kind: EventKind) -> usize {
    events.iter().filter(|event| event.kind == kind).count()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
