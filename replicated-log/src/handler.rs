//! Inbound request multiplexer.
//!
//! The transport authenticates every connection and tags each inbound
//! message with the sender's logical id and [`PeerClass`]. [`Handlers`] then
//! routes it to the node handler or the client handler. The two paths never
//! mix: protocol traffic from a client, or a client request relayed by a
//! node, is an error.

use std::sync::Arc;

use anyhow::{Result, bail, ensure};
use tracing::trace;

use crate::directory::PeerClass;
use crate::engine::{EngineIngress, WatermarkTable};
use crate::wire::{Envelope, encode_watermark};

/// One message as delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub sender: u64,
    pub class: PeerClass,
    pub payload: Vec<u8>,
    /// Set for request/response exchanges; the returned bytes become the
    /// response.
    pub is_request: bool,
}

/// Handles inbound traffic of one peer class.
///
/// Called concurrently from connection threads. An error closes the
/// connection the message arrived on.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, msg: InboundMessage) -> Result<Vec<u8>>;
}

/// Handlers registered with a transport, keyed by peer class.
#[derive(Clone)]
pub struct Handlers {
    node: Arc<dyn MessageHandler>,
    client: Option<Arc<dyn MessageHandler>>,
}

impl Handlers {
    pub fn new(node: Arc<dyn MessageHandler>, client: Option<Arc<dyn MessageHandler>>) -> Self {
        Self { node, client }
    }

    /// Handlers for a replica: node traffic steps the engine, client traffic
    /// becomes proposals.
    pub fn replica(ingress: EngineIngress, watermarks: Arc<WatermarkTable>) -> Self {
        Self::new(
            Arc::new(NodeHandler::new(ingress.clone())),
            Some(Arc::new(ClientHandler::new(ingress, watermarks))),
        )
    }

    pub fn dispatch(&self, msg: InboundMessage) -> Result<Vec<u8>> {
        match msg.class {
            PeerClass::Node => self.node.handle(msg),
            PeerClass::Client => match &self.client {
                Some(handler) => handler.handle(msg),
                None => bail!("client {} traffic is not accepted here", msg.sender),
            },
        }
    }
}

/// Feeds protocol messages from other nodes into the engine.
pub struct NodeHandler {
    ingress: EngineIngress,
}

impl NodeHandler {
    pub fn new(ingress: EngineIngress) -> Self {
        Self { ingress }
    }
}

impl MessageHandler for NodeHandler {
    fn handle(&self, msg: InboundMessage) -> Result<Vec<u8>> {
        ensure!(
            !msg.is_request,
            "node {} sent a request, nodes only send",
            msg.sender
        );
        match Envelope::decode(&msg.payload)? {
            Envelope::Protocol(bytes) => {
                trace!(from = msg.sender, len = bytes.len(), "protocol message");
                self.ingress.step(msg.sender, bytes)?;
                Ok(Vec::new())
            }
            Envelope::Request(request) => bail!(
                "node {} relayed a request from client {}",
                msg.sender,
                request.client_id
            ),
        }
    }
}

/// Accepts client requests and answers watermark queries.
pub struct ClientHandler {
    ingress: EngineIngress,
    watermarks: Arc<WatermarkTable>,
}

impl ClientHandler {
    pub fn new(ingress: EngineIngress, watermarks: Arc<WatermarkTable>) -> Self {
        Self {
            ingress,
            watermarks,
        }
    }
}

impl MessageHandler for ClientHandler {
    fn handle(&self, msg: InboundMessage) -> Result<Vec<u8>> {
        if msg.is_request && msg.payload.is_empty() {
            let next = self.watermarks.next_req_no(msg.sender);
            trace!(client = msg.sender, next, "watermark query");
            return Ok(encode_watermark(next));
        }

        match Envelope::decode(&msg.payload)? {
            Envelope::Request(request) => {
                ensure!(
                    request.client_id == msg.sender,
                    "client ID mismatch, claims to be {} but is {}",
                    request.client_id,
                    msg.sender
                );
                self.ingress.propose(request)?;
                Ok(Vec::new())
            }
            Envelope::Protocol(_) => bail!("client {} sent protocol traffic", msg.sender),
        }
    }
}
