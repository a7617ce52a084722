pub mod client;
pub mod frame;

pub use client::{DanmakuClient, DanmakuListener};
pub use frame::Frame;
