//! Danmaku sidecar files.
//!
//! For every video file the recorder opens, a sibling `.xml` file captures
//! the chat with timestamps relative to the recording start; optionally a
//! `.jsonl` sibling keeps the raw command JSON. The XML layout matches the
//! de-facto player exchange format: a fixed head, one `<metadata>` block,
//! then `<d p="stime,mode,size,color,date,pool,uid_hash,dmid">text</d>`
//! lines.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use super::models::{Danmu, GiftSendRecord, GuardBuyRecord, SuperChatRecord};

const XML_HEAD: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<i>
    <chatserver>chat.bilibili.com</chatserver>
    <chatid>0</chatid>
    <mission>0</mission>
    <maxlimit>0</maxlimit>
    <state>0</state>
    <real_name>0</real_name>
    <source>e-r</source>
"#;

/// Header metadata written once per file.
#[derive(Debug, Clone, Default)]
pub struct DanmakuMetadata {
    pub user_name: String,
    pub room_id: u64,
    pub room_title: String,
    pub area: String,
    pub parent_area: String,
    /// Unix seconds.
    pub live_start_time: i64,
    /// Unix seconds.
    pub record_start_time: i64,
    pub recorder: String,
}

fn xml_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

pub struct DanmakuWriter {
    path: PathBuf,
    file: BufWriter<File>,
}

impl DanmakuWriter {
    pub fn create(path: impl Into<PathBuf>, metadata: &DanmakuMetadata) -> std::io::Result<Self> {
        let path = path.into();
        let mut file = BufWriter::new(File::create(&path)?);
        file.write_all(XML_HEAD.as_bytes())?;
        write!(
            file,
            "    <metadata>\n\
             \x20       <user_name>{}</user_name>\n\
             \x20       <room_id>{}</room_id>\n\
             \x20       <room_title>{}</room_title>\n\
             \x20       <area>{}</area>\n\
             \x20       <parent_area>{}</parent_area>\n\
             \x20       <live_start_time>{}</live_start_time>\n\
             \x20       <record_start_time>{}</record_start_time>\n\
             \x20       <recorder>{}</recorder>\n\
             \x20   </metadata>\n",
            xml_escape(&metadata.user_name),
            metadata.room_id,
            xml_escape(&metadata.room_title),
            xml_escape(&metadata.area),
            xml_escape(&metadata.parent_area),
            metadata.live_start_time,
            metadata.record_start_time,
            xml_escape(&metadata.recorder),
        )?;
        debug!(path = %path.display(), "opened danmaku file");
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_danmu(&mut self, danmu: &Danmu) -> std::io::Result<()> {
        writeln!(
            self.file,
            r#"    <d p="{:.5},{},{},{},{},{},{},{}">{}</d>"#,
            danmu.stime,
            danmu.mode,
            danmu.size,
            danmu.color,
            danmu.date,
            danmu.pool,
            danmu.uid_hash,
            danmu.dmid,
            xml_escape(&danmu.text)
        )
    }

    pub fn write_gift(&mut self, gift: &GiftSendRecord) -> std::io::Result<()> {
        writeln!(
            self.file,
            r#"    <gift ts="{:.5}" uid="{}" user="{}" giftname="{}" giftcount="{}" cointype="{}" price="{}"/>"#,
            gift.ts,
            gift.uid,
            xml_escape(&gift.user),
            xml_escape(&gift.giftname),
            gift.giftcount,
            gift.cointype,
            gift.price
        )
    }

    pub fn write_guard_buy(&mut self, record: &GuardBuyRecord) -> std::io::Result<()> {
        writeln!(
            self.file,
            r#"    <guard ts="{:.5}" uid="{}" user="{}" giftname="{}" count="{}" price="{}" level="{}"/>"#,
            record.ts,
            record.uid,
            xml_escape(&record.user),
            xml_escape(&record.giftname),
            record.count,
            record.price,
            record.level
        )
    }

    pub fn write_super_chat(&mut self, record: &SuperChatRecord) -> std::io::Result<()> {
        writeln!(
            self.file,
            r#"    <sc ts="{:.5}" uid="{}" user="{}" price="{}" time="{}">{}</sc>"#,
            record.ts,
            record.uid,
            xml_escape(&record.user),
            record.price,
            record.time,
            xml_escape(&record.message)
        )
    }

    /// Write the closing tag and flush. Returns the final path.
    pub fn complete(mut self) -> std::io::Result<PathBuf> {
        self.file.write_all(b"</i>")?;
        self.file.flush()?;
        debug!(path = %self.path.display(), "completed danmaku file");
        Ok(self.path)
    }
}

/// Raw danmaku sibling: one JSON document per line.
pub struct RawDanmakuWriter {
    path: PathBuf,
    file: BufWriter<File>,
}

impl RawDanmakuWriter {
    pub fn create(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let file = BufWriter::new(File::create(&path)?);
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&mut self, value: &serde_json::Value) -> std::io::Result<()> {
        serde_json::to_writer(&mut self.file, value)?;
        self.file.write_all(b"\n")
    }

    pub fn complete(mut self) -> std::io::Result<PathBuf> {
        self.file.flush()?;
        Ok(self.path)
    }
}
