pub mod config;
pub mod gateway;
pub mod seeds;

pub use config::{ProviderInfo, ProviderSelection};
pub use gateway::{ChatBackend, ChatMessage, ProviderGateway, ProviderReply};
