//! ACM Supervision - orchestration engine for automation compositions
//!
//! The supervisor owns every definition and instance and drives them by
//! one-way messages to participant agents:
//!
//! - **PrimeCoordinator**: commission, prime, deprime and decommission definitions
//! - **PhaseCoordinator**: deploy, undeploy, delete, lock, unlock and update in
//!   `startPhase` order
//! - **MigrationCoordinator**: staged migration, rollback, precheck, prepare and review
//! - **AckCorrelator**: revision-checked ack application and phase/stage progression
//! - **SupervisionScanner**: operation timeouts and participant liveness
//! - **ResyncProtocol**: authoritative snapshots for restarted or new replicas
//!
//! No component ever waits for a participant. Progress happens when acks
//! arrive, each one applied through a versioned compare-and-swap.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod bus;
pub mod config;
pub mod context;
pub mod correlator;
pub mod error;
pub mod events;
pub mod handler;
pub mod migration;
pub mod phase;
mod plan;
pub mod prime;
pub mod resync;
pub mod scanner;
#[cfg(feature = "simulator")]
pub mod sim;
pub mod supervisor;

// Re-exports
pub use bus::{BusError, InMemoryBus, MessagePublisher};
pub use config::SupervisionConfig;
pub use context::SupervisionContext;
pub use correlator::{AckCorrelator, AckOutcome, InstanceAck};
pub use error::{Result, SupervisionError};
pub use events::EventEmitter;
pub use handler::{Handled, MessageHandler};
pub use migration::MigrationCoordinator;
pub use phase::PhaseCoordinator;
pub use plan::current_operation;
pub use prime::{PrimeAck, PrimeCoordinator};
pub use resync::ResyncProtocol;
pub use scanner::{ScanReport, SupervisionScanner};
pub use supervisor::Supervisor;
