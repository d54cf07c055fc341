//! Image-generation backend clients and job orchestration.
//!
//! Provides the [`gateway::BackendGateway`] contract with HTTP and AI
//! Horde implementations, capability synchronization, bounded progress
//! polling, generation events, and the [`orchestrator::Orchestrator`] that
//! drives a job from admission to delivered images.

pub mod api;
pub mod events;
pub mod gateway;
pub mod horde;
pub mod orchestrator;
pub mod poller;
pub mod sync;
