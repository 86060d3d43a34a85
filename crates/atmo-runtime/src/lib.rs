//! # atmo-runtime
//!
//! Carries a routed request to the capability that will serve it.
//!
//! Requests and responses travel as write-once records in a replicated
//! [`Mailbox`]; the caller polls for the matching response with a
//! mandatory timeout. [`AtmosphereNode`] ties identity, tokens, the
//! capability table, the router and the mailbox into the API the
//! application layer uses.

pub mod mailbox;
pub mod node;
pub mod session;
pub mod store;

pub use mailbox::{Mailbox, MailboxRecord, RecordStatus, REQUESTS, RESPONSES, target_project_path};
pub use node::{AtmosphereNode, NodeState};
pub use session::{RoutingSession, SessionManager, SessionState};
pub use store::{MemoryStore, ReplicatedStore};
