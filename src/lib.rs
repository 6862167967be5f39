//! Room Coordination Engine
//!
//! Server-side core of a real-time multi-party voice collaboration system:
//! room lifecycle and presence, turn queueing, provider-agnostic AI session
//! orchestration, interrupt handling, mixed-audio gating, transcript
//! materialization and periodic summarization.
//!
//! Browser UI, peer-to-peer WebRTC media, auth, and concrete vendor wire
//! protocols live outside this crate's scope; they are represented here by
//! capability traits (see [`provider`] and [`search`]) with named contracts.

pub mod ai;
pub mod api;
pub mod audio;
pub mod config;
pub mod error;
pub mod interrupt;
pub mod personality;
pub mod presence;
pub mod provider;
pub mod ratelimit;
pub mod room;
pub mod search;
pub mod signaling;
pub mod summarization;
pub mod transcript;
pub mod turn_queue;
