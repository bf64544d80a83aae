pub mod auth;
pub mod copy;
pub mod hosted;
pub mod memory;
pub mod pending;
pub mod realtime;
pub mod remote;
pub mod vault;

// 重新导出常用类型
pub use auth::{GateOptions, LoginEntry, Route, SessionGate, VaultSession};
pub use copy::CopyFeedback;
pub use hosted::HostedStore;
pub use memory::MemoryStore;
pub use pending::{PendingWrite, WriteOutcome};
pub use realtime::RealtimeClient;
pub use remote::{ChangeSubscription, RemoteStore, SelectQuery};
pub use vault::{BookmarkVault, VaultOptions};
