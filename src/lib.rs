pub mod im;

// 重新导出常用类型，方便外部使用
pub use im::{
    auth::{CredentialProvider, StaticToken},
    client::{ChatSyncEngine, ClientConfig},
    conversation::LocalConversation,
    error::{Result, SyncError},
    event::{ChatEvent, EventSubscription},
    message::{LocalChatMessage, MessageKind, MessageStatus},
};
