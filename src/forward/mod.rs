pub mod filter;
pub mod manager;
pub mod pcapng;
pub mod session;
pub mod udp;

pub use manager::{ForwardSessionManager, FwdError};
pub use session::{ForwardSession, SessionFactories, SessionHandle};
