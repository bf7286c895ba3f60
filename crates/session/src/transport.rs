// Replication transport: carries y-sync binary frames between the session
// controller and the replication endpoint.
//
// The controller is synchronous; a transport only *starts* work and reports
// results back as `TransportEvent`s on a channel. Every event carries the
// generation of the connection attempt that produced it so late events from
// an abandoned socket can be told apart from the current one.

use std::net::IpAddr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures_util::{SinkExt, StreamExt};
use tandem_common::protocol::TOKEN_QUERY_PARAM;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::debug;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEventKind {
    /// Handshake finished; frames may flow.
    Opened,
    Frame(Vec<u8>),
    /// The attempt failed or the open socket went away.
    Closed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportEvent {
    pub generation: u64,
    pub kind: TransportEventKind,
}

/// Abstraction over the network transport for testability.
pub trait ReplicationTransport {
    /// Start a connection attempt tagged `generation`, replacing any
    /// previous one. The outcome is reported asynchronously.
    fn connect(&mut self, generation: u64) -> Result<()>;

    /// Queue one binary frame on the open connection.
    fn send(&mut self, frame: Vec<u8>) -> Result<()>;

    fn close(&mut self);
}

/// Build `{endpoint}/{document_id}?token=...`. Plain `ws` is accepted only
/// for loopback hosts.
pub fn replication_url(endpoint: &str, document_id: &str, token: Option<&str>) -> Result<Url> {
    let mut url = Url::parse(endpoint).map_err(|error| anyhow!("invalid endpoint `{endpoint}`: {error}"))?;
    match url.scheme() {
        "wss" => {}
        "ws" if is_loopback_host(url.host_str()) => {}
        _ => return Err(anyhow!("endpoint must use wss (ws is allowed only for localhost testing)")),
    }
    url.path_segments_mut()
        .map_err(|()| anyhow!("endpoint `{endpoint}` cannot carry a document path"))?
        .pop_if_empty()
        .push(document_id);
    if let Some(token) = token {
        url.query_pairs_mut().append_pair(TOKEN_QUERY_PARAM, token);
    }
    Ok(url)
}

fn is_loopback_host(host: Option<&str>) -> bool {
    let Some(host) = host else {
        return false;
    };
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .is_ok_and(|addr| addr.is_loopback())
}

/// Stand-in for sessions with no replication endpoint. Every attempt fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedTransport;

impl ReplicationTransport for DetachedTransport {
    fn connect(&mut self, _generation: u64) -> Result<()> {
        Err(anyhow!("no replication endpoint configured"))
    }

    fn send(&mut self, _frame: Vec<u8>) -> Result<()> {
        Err(anyhow!("no replication endpoint configured"))
    }

    fn close(&mut self) {}
}

/// tokio-tungstenite transport. Each attempt runs in its own task.
pub struct WsTransport {
    url: Url,
    connect_timeout: Duration,
    events: mpsc::UnboundedSender<TransportEvent>,
    outbound: Option<mpsc::UnboundedSender<Vec<u8>>>,
    task: Option<JoinHandle<()>>,
}

impl WsTransport {
    pub fn new(url: Url, connect_timeout: Duration, events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self { url, connect_timeout, events, outbound: None, task: None }
    }
}

impl ReplicationTransport for WsTransport {
    fn connect(&mut self, generation: u64) -> Result<()> {
        self.close();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let handle = tokio::runtime::Handle::try_current().context("transport requires a tokio runtime")?;
        self.task = Some(handle.spawn(run_connection(
            self.url.clone(),
            generation,
            self.connect_timeout,
            self.events.clone(),
            outbound_rx,
        )));
        self.outbound = Some(outbound_tx);
        Ok(())
    }

    fn send(&mut self, frame: Vec<u8>) -> Result<()> {
        let outbound = self.outbound.as_ref().ok_or_else(|| anyhow!("transport is not connected"))?;
        outbound.send(frame).map_err(|_| anyhow!("transport connection task has exited"))
    }

    fn close(&mut self) {
        // Dropping the sender lets the task send a close frame and exit.
        self.outbound = None;
        self.task = None;
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run_connection(
    url: Url,
    generation: u64,
    connect_timeout: Duration,
    events: mpsc::UnboundedSender<TransportEvent>,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    let emit = |kind: TransportEventKind| {
        let _ = events.send(TransportEvent { generation, kind });
    };

    let socket = match tokio::time::timeout(connect_timeout, connect_async(url.as_str())).await {
        Ok(Ok((socket, _response))) => socket,
        Ok(Err(error)) => {
            emit(TransportEventKind::Closed { reason: format!("connect failed: {error}") });
            return;
        }
        Err(_) => {
            emit(TransportEventKind::Closed { reason: "connect timed out".to_string() });
            return;
        }
    };
    emit(TransportEventKind::Opened);
    debug!(generation, "replication socket open");

    let (mut sink, mut stream) = socket.split();
    let reason = loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    break "closed locally".to_string();
                };
                if let Err(error) = sink.send(WsMessage::Binary(frame.into())).await {
                    break format!("send failed: {error}");
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(WsMessage::Binary(payload))) => {
                        emit(TransportEventKind::Frame(payload.to_vec()));
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        break match frame {
                            Some(frame) => format!("closed by server ({})", u16::from(frame.code)),
                            None => "closed by server".to_string(),
                        };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(error)) => break format!("receive failed: {error}"),
                    None => break "stream ended".to_string(),
                }
            }
        }
    };

    debug!(generation, %reason, "replication socket closed");
    emit(TransportEventKind::Closed { reason });
}
