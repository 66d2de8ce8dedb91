pub mod auth;
pub mod client;
pub mod conversation;
pub mod coordinator;
pub mod error;
pub mod event;
pub mod fallback;
pub mod message;
pub mod serialization;
pub mod store;
pub mod transport;
pub mod types;

// 重新导出同步引擎入口
pub use client::{ChatSyncEngine, ClientConfig};
pub use coordinator::SyncCoordinator;
pub use event::{ChatEvent, EventBus, EventSubscription};
pub use store::LocalStore;
pub use transport::{ChannelState, ReconnectPolicy, TransportChannel};
