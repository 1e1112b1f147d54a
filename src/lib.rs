//! Peer registration and liveness management for the Open Smart Charging
//! Protocol.
//!
//! Peers onboard by exchanging bearer tokens and agreeing on a protocol
//! version, negotiate heartbeat cadence with a handshake, and are then kept
//! alive by the [`scheduler::Scheduler`], which also notices when a peer
//! passes the offline time it declared in its last heartbeat.

pub mod accept_stream;
pub mod auth;
pub mod error;
pub mod handlers;
pub mod messenger;
pub mod peers;
pub mod registration;
pub mod registry;
pub mod scheduler;
pub mod server_loop;
pub mod shutdown;
pub mod store;
pub mod token;
pub mod types;
pub mod version;

pub use error::RegistrationError;
pub use messenger::{Messenger, MessengerError};
pub use peers::{HandshakeState, Liveness, PeerRecord, PeerStatus};
pub use registration::{RegisterOutcome, RegistrationManager};
pub use registry::Registry;
pub use scheduler::{Scheduler, SchedulerConfig};
pub use shutdown::Shutdown;
pub use store::{FileBackedStore, InMemoryStore, PeerStore, StoreError};
pub use types::{ConnectTarget, RequestContext, VersionUrl};
