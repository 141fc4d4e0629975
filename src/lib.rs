//! TweetChain - a minimal peer-to-peer ledger of signed social ops
//!
//! # Architecture
//!
//! The crate is organized into logical modules:
//!
//! ## Core Blockchain
//! - [`blockchain`] - Blocks, merkle commitment, validation, fork-choice and consensus state
//! - [`op`] - Op data model, canonical payloads and standalone verification
//! - [`mempool`] - Fee-ranked admission queue
//!
//! ## Consensus
//! - [`miner`] - Proof-of-work search with preemption
//! - [`governance`] - Proposals, block-scoped votes and their application
//!
//! ## Cryptography
//! - [`crypto`] - SHA-256, secp256k1 signatures, key fingerprints
//!
//! ## State Management
//! - [`persistence`] - Atomic JSON files and an in-memory backend
//! - [`timeline`] - Read model over the accepted chain
//!
//! ## Networking
//! - [`sync`] - Wire messages, peer guard and the sync state machine
//! - [`network`] - TCP transport
//! - [`node`] - Wiring of state, mempool, miner and network
//!
//! ## Configuration & Utilities
//! - [`config`] - Configuration management
//! - [`error`] - Error types

#![forbid(unsafe_code)]

// ============================================================================
// Core Blockchain
// ============================================================================
pub mod blockchain;
pub mod mempool;
pub mod op;

// ============================================================================
// Consensus & Mining
// ============================================================================
pub mod governance;
pub mod miner;

// ============================================================================
// Cryptography
// ============================================================================
pub mod crypto;

// ============================================================================
// State Management
// ============================================================================
pub mod persistence;
pub mod timeline;

// ============================================================================
// Networking
// ============================================================================
pub mod network;
pub mod node;
pub mod sync;

// ============================================================================
// Configuration & Utilities
// ============================================================================
pub mod config;
pub mod error;
