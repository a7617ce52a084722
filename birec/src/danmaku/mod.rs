pub mod dumper;
pub mod models;
pub mod receiver;

pub use dumper::{DanmakuMetadata, DanmakuWriter, RawDanmakuWriter};
pub use models::{Danmu, GiftSendRecord, GuardBuyRecord, SuperChatRecord};
