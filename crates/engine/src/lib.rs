//! Host-side reconciliation: the probe, the applier, the container-runtime
//! and init-system clients, and the session/pool abstraction that bundles
//! them.

pub mod apply;
pub mod docker;
pub mod pool;
pub mod probe;
pub mod session;
pub mod systemd;

pub use apply::{apply, ApplySettings};
pub use pool::{SessionLease, SessionPool};
pub use session::{Session, SessionFactory};
