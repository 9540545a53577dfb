#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Relay Core
//!
//! Resilient message-delivery pipeline for chat-style integrations.
//!
//! ## Overview
//!
//! Inbound event payloads (webhooks) and outbound send requests flow through
//! a deduplication cache, a prioritized retry queue with bounded concurrency,
//! and per-dependency circuit breakers. Items that exhaust their retry budget
//! are persisted as dead-letter records and re-attempted by a periodic
//! recovery service.
//!
//! ## Module Organization
//!
//! - [`resilience`] - Circuit breakers, the breaker registry and backoff policy
//! - [`messaging`] - Deduplication, durable lanes and the in-process fallback queue
//! - [`dead_letter`] - Dead-letter records, storage and the retry service
//! - [`collaborators`] - Interfaces to the transports and the conversation engine
//! - [`pipeline`] - The [`DeliveryPipeline`] facade tying everything together
//! - [`config`] - Layered configuration loading and validation
//! - [`logging`] - Structured logging setup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use relay_core::config::ConfigManager;
//! use relay_core::pipeline::DeliveryPipeline;
//! # use relay_core::collaborators::{InboundEventHandler, OutboundTransport};
//! # use std::sync::Arc;
//!
//! # async fn example(
//! #     handler: Arc<dyn InboundEventHandler>,
//! #     transport: Arc<dyn OutboundTransport>,
//! # ) -> anyhow::Result<()> {
//! relay_core::logging::init_structured_logging();
//! let manager = ConfigManager::load()?;
//!
//! let pipeline = DeliveryPipeline::builder(manager.config().clone())
//!     .inbound_handler(handler)
//!     .outbound_transport(transport)
//!     .build()?;
//! pipeline.start().await;
//!
//! let submission = pipeline
//!     .submit_inbound(serde_json::json!({"entry": []}))
//!     .await?;
//! println!("submitted: {submission}");
//! # Ok(())
//! # }
//! ```

pub mod collaborators;
pub mod config;
pub mod constants;
pub mod dead_letter;
pub mod error;
pub mod logging;
pub mod messaging;
pub mod pipeline;
pub mod resilience;

pub use error::{DeliveryError, ErrorClass, Result};
pub use pipeline::{DeliveryPipeline, PipelineBuilder};
