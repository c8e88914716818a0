//! Node and client runtime for a replicated request log.
//!
//! A fixed set of nodes orders client requests through a consensus engine and
//! applies them, in the same order, to an application log. Clients submit each
//! request to every node; the engine deduplicates them against per-client
//! windows so each request is applied exactly once.
//!
//! # Architecture
//!
//! - **Driver thread**: owns the consensus engine. A `crossbeam_channel`
//!   select loop feeds it ticks, peer messages and client proposals, then
//!   drains its action batches through a processor.
//! - **Transport threads**: a listener plus one thread per inbound
//!   connection. Each connection is authenticated, decrypted and handed to
//!   the node or client handler, which only talk to the driver through its
//!   ingress channel. Outbound messages go through one writer thread per
//!   destination.
//! - **Processor**: persists, sends, applies and checkpoints each batch,
//!   either inline or with a pool of send workers.
//!
//! The engine is single-threaded and lock free; concurrency lives at the
//! edges, as in a classic actor setup.
//!
//! # Modules
//!
//! - [`directory`]: node and client identities, key to id lookup
//! - [`handshake`]: authenticated key exchange and sealed frames
//! - [`wire`]: bincode envelopes and frames
//! - [`transport`]: connection management, send and request/response
//! - [`handler`]: inbound multiplexer for node and client traffic
//! - [`engine`]: the engine boundary and its batch types
//! - [`raft_engine`]: the engine, built on tikv/raft
//! - [`storage`]: write-ahead log and request store
//! - [`app`]: the application log
//! - [`processor`]: action batch execution
//! - [`driver`]: replica lifecycle and event loop
//! - [`eventlog`]: optional gzip record of engine inputs and outputs
//! - [`shutdown`]: stop token shared by the driver and its callers
//! - [`client`]: request generator
//! - [`config`], [`bootstrap`], [`cli`], [`signals`]: configuration files and
//!   the binary

pub mod app;
pub mod bootstrap;
pub mod cli;
pub mod client;
pub mod config;
pub mod directory;
pub mod driver;
pub mod engine;
pub mod eventlog;
pub mod handler;
pub mod handshake;
pub mod processor;
pub mod raft_engine;
pub mod shutdown;
pub mod signals;
pub mod storage;
pub mod transport;
pub mod wire;
