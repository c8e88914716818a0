//! Load-generating client.
//!
//! A client connects to every node and streams numbered requests to all of
//! them. In watermark mode it first asks each node for the next request
//! number it expects, so a restarted client resumes where the network left
//! off instead of replaying committed work.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use tracing::{debug, info};

use crate::config::ClientConfig;
use crate::directory::PeerClass;
use crate::transport::{Transport, TransportConfig, TransportError};
use crate::wire::{ClientRequest, Envelope, decode_watermark};

const PAYLOAD_PREFIX_MIN: usize = 26;

/// Client side of the transport.
pub trait RequestLink {
    fn send(&self, dest: u64, payload: Vec<u8>) -> Result<(), TransportError>;
    fn request(&self, dest: u64, payload: Vec<u8>) -> Result<Vec<u8>, TransportError>;
}

impl RequestLink for Transport {
    fn send(&self, dest: u64, payload: Vec<u8>) -> Result<(), TransportError> {
        Transport::send(self, dest, payload)
    }

    fn request(&self, dest: u64, payload: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        Transport::request(self, dest, payload)
    }
}

impl<L: RequestLink + ?Sized> RequestLink for Arc<L> {
    fn send(&self, dest: u64, payload: Vec<u8>) -> Result<(), TransportError> {
        (**self).send(dest, payload)
    }

    fn request(&self, dest: u64, payload: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        (**self).request(dest, payload)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Send request numbers `0..count` to every node.
    Fixed,
    /// Query node watermarks first and continue from them.
    Watermark,
}

/// How many requests to send and how.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub count: u64,
    /// Payload size in bytes, raised to fit the request tag if smaller.
    pub request_size: usize,
    pub mode: Mode,
    /// Time to wait after the last send before closing connections.
    pub linger: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            count: 100,
            request_size: 64,
            mode: Mode::Fixed,
            linger: Duration::from_secs(1),
        }
    }
}

/// Request numbers to stream, derived from per-node watermarks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatermarkPlan {
    pub low: u64,
    pub high: u64,
    /// Last request number to send, inclusive.
    pub target: u64,
}

/// `watermarks` holds one query result per node; `count` requests are sent
/// beyond the highest of them.
pub fn plan_watermarks(watermarks: &[u64], count: u64) -> Option<WatermarkPlan> {
    let low = *watermarks.iter().min()?;
    let high = *watermarks.iter().max()?;
    if count == 0 {
        return None;
    }
    Some(WatermarkPlan {
        low,
        high,
        target: high + count - 1,
    })
}

/// Payload for one request: a readable tag zero padded to `size` bytes.
pub fn request_payload(client_id: u64, req_no: u64, size: usize) -> Vec<u8> {
    let mut data = format!("my-request-{client_id}.{req_no}.data").into_bytes();
    let size = size.max(PAYLOAD_PREFIX_MIN).max(data.len());
    data.resize(size, 0);
    data
}

/// Streams requests for one client over `link` to `nodes`.
pub struct Client<L> {
    id: u64,
    nodes: Vec<u64>,
    link: L,
    options: ClientOptions,
}

impl<L: RequestLink> Client<L> {
    pub fn new(id: u64, nodes: Vec<u64>, link: L, options: ClientOptions) -> Self {
        Self {
            id,
            nodes,
            link,
            options,
        }
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    /// Sends every request and returns how many sends were made.
    pub fn run(&self) -> Result<u64> {
        let sent = match self.options.mode {
            Mode::Fixed => self.run_fixed()?,
            Mode::Watermark => self.run_watermark()?,
        };
        info!(client = self.id, sent, "all requests submitted");
        Ok(sent)
    }

    fn run_fixed(&self) -> Result<u64> {
        let mut sent = 0;
        for req_no in 0..self.options.count {
            for &node in &self.nodes {
                self.submit(node, req_no)?;
                sent += 1;
            }
        }
        Ok(sent)
    }

    fn run_watermark(&self) -> Result<u64> {
        let watermarks = self.query_watermarks()?;
        let levels: Vec<u64> = watermarks.iter().map(|(_, level)| *level).collect();
        let Some(plan) = plan_watermarks(&levels, self.options.count) else {
            return Ok(0);
        };
        info!(
            client = self.id,
            low = plan.low,
            high = plan.high,
            target = plan.target,
            "resuming from watermarks"
        );

        let mut sent = 0;
        for req_no in plan.low..=plan.target {
            for &(node, watermark) in &watermarks {
                if req_no < watermark {
                    continue;
                }
                self.submit(node, req_no)?;
                sent += 1;
            }
        }
        Ok(sent)
    }

    /// Next expected request number at each node.
    pub fn query_watermarks(&self) -> Result<Vec<(u64, u64)>> {
        self.nodes
            .iter()
            .map(|&node| {
                let response = self
                    .link
                    .request(node, Vec::new())
                    .with_context(|| format!("watermark query to node {node} failed"))?;
                let watermark = decode_watermark(&response)
                    .with_context(|| format!("bad watermark from node {node}"))?;
                debug!(client = self.id, node, watermark, "queried watermark");
                Ok((node, watermark))
            })
            .collect()
    }

    fn submit(&self, node: u64, req_no: u64) -> Result<()> {
        let request = ClientRequest {
            client_id: self.id,
            req_no,
            data: request_payload(self.id, req_no, self.options.request_size),
        };
        let payload = Envelope::Request(request).encode()?;
        self.link
            .send(node, payload)
            .with_context(|| format!("could not send request {req_no} to node {node}"))
    }
}

/// Runs a client from its configuration file contents until every request
/// has been submitted.
pub fn run(config: &ClientConfig, options: ClientOptions) -> Result<u64> {
    ensure!(!config.nodes.is_empty(), "client {} has no nodes", config.id);
    let directory = config.directory()?;
    let nodes = directory.node_ids();
    let transport = Arc::new(Transport::new(TransportConfig {
        id: config.id,
        class: PeerClass::Client,
        listen: None,
        identity: config.identity()?,
        directory,
    }));
    transport.start().context("could not start networking")?;

    let linger = options.linger;
    let client = Client::new(config.id, nodes, Arc::clone(&transport), options);
    let result = client.run();
    if result.is_ok() && !linger.is_zero() {
        // Close does not flush in-flight sends, give nodes time to read them.
        thread::sleep(linger);
    }
    transport.close();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::encode_watermark;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeLink {
        watermarks: HashMap<u64, u64>,
        sent: Mutex<Vec<(u64, ClientRequest)>>,
        fail_node: Option<u64>,
    }

    impl RequestLink for FakeLink {
        fn send(&self, dest: u64, payload: Vec<u8>) -> Result<(), TransportError> {
            if self.fail_node == Some(dest) {
                return Err(TransportError::UnknownPeer(dest));
            }
            let Ok(Envelope::Request(request)) = Envelope::decode(&payload) else {
                panic!("client sent something other than a request");
            };
            self.sent.lock().unwrap().push((dest, request));
            Ok(())
        }

        fn request(&self, dest: u64, payload: Vec<u8>) -> Result<Vec<u8>, TransportError> {
            assert!(payload.is_empty());
            let level = self
                .watermarks
                .get(&dest)
                .copied()
                .ok_or(TransportError::UnknownPeer(dest))?;
            Ok(encode_watermark(level))
        }
    }

    fn options(mode: Mode, count: u64) -> ClientOptions {
        ClientOptions {
            count,
            request_size: 32,
            mode,
            linger: Duration::ZERO,
        }
    }

    #[test]
    fn test_plan_from_watermarks() {
        let plan = plan_watermarks(&[5, 7, 5, 9], 3).unwrap();
        assert_eq!(
            plan,
            WatermarkPlan {
                low: 5,
                high: 9,
                target: 11
            }
        );
        assert_eq!(plan_watermarks(&[], 3), None);
        assert_eq!(plan_watermarks(&[1, 2], 0), None);
    }

    #[test]
    fn test_fixed_mode_sends_each_number_to_each_node() -> Result<()> {
        let client = Client::new(3, vec![0, 1], FakeLink::default(), options(Mode::Fixed, 4));
        assert_eq!(client.run()?, 8);

        let sent = client.link().sent.lock().unwrap();
        for node in [0, 1] {
            let numbers: Vec<u64> = sent
                .iter()
                .filter(|(dest, _)| *dest == node)
                .map(|(_, request)| request.req_no)
                .collect();
            assert_eq!(numbers, vec![0, 1, 2, 3]);
        }
        assert!(sent.iter().all(|(_, request)| request.client_id == 3));
        Ok(())
    }

    #[test]
    fn test_watermark_mode_respects_node_floor() -> Result<()> {
        let link = FakeLink {
            watermarks: HashMap::from([(0, 5), (1, 7), (2, 5), (3, 9)]),
            ..Default::default()
        };
        let client = Client::new(0, vec![0, 1, 2, 3], link, options(Mode::Watermark, 3));
        client.run()?;

        let sent = client.link().sent.lock().unwrap();
        let numbers_for = |node: u64| -> Vec<u64> {
            sent.iter()
                .filter(|(dest, _)| *dest == node)
                .map(|(_, request)| request.req_no)
                .collect()
        };
        assert_eq!(numbers_for(0), (5..=11).collect::<Vec<_>>());
        assert_eq!(numbers_for(1), (7..=11).collect::<Vec<_>>());
        assert_eq!(numbers_for(3), vec![9, 10, 11]);
        Ok(())
    }

    #[test]
    fn test_send_failure_aborts_run() {
        let link = FakeLink {
            fail_node: Some(1),
            ..Default::default()
        };
        let client = Client::new(0, vec![0, 1], link, options(Mode::Fixed, 5));
        let err = client.run().unwrap_err();
        assert!(format!("{err:#}").contains("could not send request 0 to node 1"));
        assert_eq!(client.link().sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_payload_is_tagged_and_padded() {
        let payload = request_payload(2, 17, 10);
        assert_eq!(payload.len(), 26);
        assert!(payload.starts_with(b"my-request-2.17.data"));
        assert!(payload[20..].iter().all(|byte| *byte == 0));
        assert_eq!(request_payload(2, 17, 100).len(), 100);
    }
}
