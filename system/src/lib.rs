pub mod error;
mod message;
pub mod ordering;
pub mod permission;
pub mod room;
mod traits;
mod types;

pub use message::*;
pub use ordering::{OrderingQueue, QueueFull};
pub use permission::{PermissionRule, PermissionTable};
pub use room::{LockExtend, LockGrant, LockRelease, RoomState};
pub use traits::*;
pub use types::*;

pub use bincode;
pub use serde;
pub use serde_json;
