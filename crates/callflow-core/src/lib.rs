// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Callflow Core - Call Lifecycle Engine
//!
//! This crate ingests ordered audio packets for phone calls, tracks sequence
//! gaps, and drives completed calls through an asynchronous enrichment step
//! (transcription and sentiment) with retries. All state lives in SQLite so a
//! restarted process picks up exactly where the previous one left off.
//!
//! # Architecture
//!
//! ```text
//!   packets / complete / queries           background
//!   ───────────────────────────            ──────────
//!          CallService                    CallProcessor
//!              │                      poll ─┤ claim ─┤ enrich ─┤ reconcile
//!              ▼                            ▼        ▼         ▼
//!   ┌────────────────────────────────────────────────────────────────┐
//!   │                    Persistence (SQLite)                        │
//!   └────────────────────────────────────────────────────────────────┘
//!              │                            │
//!              └──────── NotificationBus ◄──┘
//! ```
//!
//! # Operations
//!
//! | Operation | Module | Description |
//! |-----------|--------|-------------|
//! | `ingest_packet` | [`calls`] | Store a packet, create the call on first packet, track gaps |
//! | `complete_call` | [`calls`] | Mark a call finished; makes it eligible for enrichment |
//! | `archive_call` | [`calls`] | Move a finished call out of circulation |
//! | `get_call` / `list_calls` | [`calls`] | Read calls with packet counts |
//! | `run` / `run_once` | [`processor`] | Poll, claim, enrich, reconcile |
//!
//! # Call Status State Machine
//!
//! | From | Allowed targets |
//! |------|-----------------|
//! | `in_progress` | `completed`, `failed` |
//! | `completed` | `processing_enrichment`, `archived` |
//! | `processing_enrichment` | `completed`, `failed`, `archived` |
//! | `failed` | `archived` |
//! | `archived` | none |
//!
//! Every status write is conditioned on the status the writer observed. A
//! claim also hands out a generation that fences the owner's later writes,
//! and the owner refreshes it while enriching, so concurrent processors never
//! enrich the same call at once.
//!
//! # Configuration
//!
//! See [`config::Config::from_env`] for the environment variables read by the
//! `callflow-core` binary.

#![warn(missing_docs)]

/// Call ingestion, completion, and query operations.
pub mod calls;

/// Environment-based configuration.
pub mod config;

/// Enrichment provider contract and implementations.
pub mod enrichment;

/// Error types.
pub mod error;

/// Embedded schema migrations.
pub mod migrations;

/// Best-effort call event publication.
pub mod notifications;

/// Storage contract and SQLite backend.
pub mod persistence;

/// Background enrichment processor.
pub mod processor;

/// Exponential backoff retry.
pub mod retry;

/// Packet sequence tracking.
pub mod sequence;

/// Call status transitions.
pub mod state_machine;

pub use calls::{CallDetail, CallService, IngestReceipt, PacketInput};
pub use error::{CoreError, Result};
pub use processor::{CallProcessor, CallProcessorConfig};
pub use state_machine::CallStatus;
