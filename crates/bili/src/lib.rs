//! Client library for Bilibili live rooms.
//!
//! Covers the four provider-facing concerns of the recorder: the playback
//! REST API (`api`, `sign`), per-room state and stream URL selection
//! (`live`, `stream`), the binary chat channel (`ws`), and the live-state
//! machine (`monitor`).

pub mod api;
pub mod errors;
pub mod live;
pub mod models;
pub mod monitor;
pub mod sign;
pub mod stream;
pub mod ws;

pub use api::{ApiHeaders, AppApi, WebApi};
pub use errors::{ApiError, BiliError, StreamError, WsError};
pub use live::Live;
pub use models::{
    ApiPlatform, DanmuHost, DanmuInfo, LiveStatus, QualityNumber, RoomInfo, StreamCodec,
    StreamFormat, StreamParams, UserInfo,
};
pub use monitor::{LiveEventListener, LiveMonitor};
pub use stream::StreamUrlResolver;
pub use ws::{DanmakuClient, DanmakuListener};
