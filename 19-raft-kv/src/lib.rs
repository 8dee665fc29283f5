//! Raft-based replicated key-value store.
//!
//! This crate implements a distributed key-value store on top of the tikv/raft
//! consensus library. Writes are replicated through Raft's log and applied to
//! every node's store in the same order; reads pass a read-index barrier so a
//! follower never answers with data older than the latest committed write.
//!
//! # Architecture
//!
//! - **HTTP tasks** (tokio/axum): parse requests, then call the core on the
//!   blocking pool
//! - **Worker thread**: Drives the Raft state machine, applies committed entries
//! - **Network listener thread**: Accepts incoming Raft messages from peers
//! - **Outbox threads**: Send Raft messages to one peer each
//!
//! The core ([`write_path`], [`read`], [`membership`]) only sees the engine
//! through the [`engine::ConsensusEngine`] trait.
//!
//! # Modules
//!
//! - [`store`]: Thread-safe in-memory key-value storage
//! - [`command`]: Commands replicated through Raft log
//! - [`fsm`]: Deterministic apply/snapshot/restore and the applied index
//! - [`node`]: Core Raft node wrapping tikv/raft library
//! - [`storage`]: Raft log storage that serves state machine snapshots
//! - [`runtime`]: Worker loop, network handling, node spawning
//! - [`service`]: Per-node bundle handed to the HTTP layer
//! - [`api`], [`auth`], [`config`]: HTTP routes, bearer gate, CLI

pub mod api;
pub mod auth;
pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod fsm;
pub mod membership;
pub mod node;
pub mod read;
pub mod runtime;
pub mod service;
pub mod storage;
pub mod store;
pub mod write_path;
