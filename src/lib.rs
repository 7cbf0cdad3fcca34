pub mod calls;
pub mod config;

pub use calls::{CallAdapters, CallError, CallManager, CallNotification, CallStatus, Identity};
pub use config::CallConfig;
