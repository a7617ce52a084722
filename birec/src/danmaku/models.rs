//! Chat message records extracted from the raw command JSON.

use serde_json::Value;

/// A plain danmaku comment.
#[derive(Debug, Clone, PartialEq)]
pub struct Danmu {
    /// Seconds relative to the start of the video file.
    pub stime: f64,
    pub mode: i64,
    pub size: i64,
    pub color: i64,
    /// Unix milliseconds.
    pub date: i64,
    pub pool: i64,
    pub uid_hash: String,
    pub uid: i64,
    pub uname: String,
    pub dmid: i64,
    pub text: String,
}

impl Danmu {
    /// Parse a `DANMU_MSG` command. The payload is positional:
    /// `info[0]` carries the display parameters, `info[1]` the text,
    /// `info[2]` the sender.
    pub fn from_cmd(value: &Value) -> Option<Self> {
        let info = value.get("info")?.as_array()?;
        let meta = info.first()?.as_array()?;
        let text = info.get(1)?.as_str()?.to_string();
        let user = info.get(2)?.as_array()?;

        Some(Danmu {
            stime: 0.0,
            mode: meta.get(1)?.as_i64().unwrap_or(1),
            size: meta.get(2)?.as_i64().unwrap_or(25),
            color: meta.get(3)?.as_i64().unwrap_or(0xFFFFFF),
            date: meta.get(4)?.as_i64().unwrap_or(0),
            pool: meta.get(5).and_then(Value::as_i64).unwrap_or(0),
            uid_hash: meta
                .get(7)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            uid: user.first().and_then(Value::as_i64).unwrap_or(0),
            uname: user
                .get(1)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            dmid: meta.get(8).and_then(Value::as_i64).unwrap_or(0),
            text,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GiftSendRecord {
    pub ts: f64,
    pub uid: i64,
    pub user: String,
    pub giftname: String,
    pub giftcount: i64,
    pub cointype: String,
    pub price: i64,
}

impl GiftSendRecord {
    pub fn from_cmd(value: &Value) -> Option<Self> {
        let data = value.get("data")?;
        Some(GiftSendRecord {
            ts: 0.0,
            uid: data.get("uid")?.as_i64()?,
            user: data.get("uname")?.as_str()?.to_string(),
            giftname: data.get("giftName")?.as_str()?.to_string(),
            giftcount: data.get("num").and_then(Value::as_i64).unwrap_or(1),
            cointype: data
                .get("coin_type")
                .and_then(Value::as_str)
                .unwrap_or("silver")
                .to_string(),
            price: data.get("price").and_then(Value::as_i64).unwrap_or(0),
        })
    }

    pub fn is_free_gift(&self) -> bool {
        self.cointype != "gold"
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GuardBuyRecord {
    pub ts: f64,
    pub uid: i64,
    pub user: String,
    pub giftname: String,
    pub count: i64,
    pub price: i64,
    pub level: i64,
}

impl GuardBuyRecord {
    pub fn from_cmd(value: &Value) -> Option<Self> {
        let data = value.get("data")?;
        Some(GuardBuyRecord {
            ts: 0.0,
            uid: data.get("uid")?.as_i64()?,
            user: data.get("username")?.as_str()?.to_string(),
            giftname: data
                .get("gift_name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            count: data.get("num").and_then(Value::as_i64).unwrap_or(1),
            price: data.get("price").and_then(Value::as_i64).unwrap_or(0),
            level: data.get("guard_level").and_then(Value::as_i64).unwrap_or(0),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SuperChatRecord {
    pub ts: f64,
    pub uid: i64,
    pub user: String,
    pub price: i64,
    pub time: i64,
    pub message: String,
}

impl SuperChatRecord {
    pub fn from_cmd(value: &Value) -> Option<Self> {
        let data = value.get("data")?;
        Some(SuperChatRecord {
            ts: 0.0,
            uid: data.get("uid")?.as_i64()?,
            user: data
                .pointer("/user_info/uname")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            price: data.get("price").and_then(Value::as_i64).unwrap_or(0),
            time: data.get("time").and_then(Value::as_i64).unwrap_or(0),
            message: data.get("message")?.as_str()?.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_danmu_msg() {
        let cmd = json!({
            "cmd": "DANMU_MSG",
            "info": [
                [0, 1, 25, 16777215, 1700000000123_i64, 0, 0, "a1b2c3d4", 987654321],
                "hello",
                [12345, "someone", 0, 0, 0]
            ]
        });

        let danmu = Danmu::from_cmd(&cmd).unwrap();
        assert_eq!(danmu.text, "hello");
        assert_eq!(danmu.mode, 1);
        assert_eq!(danmu.color, 0xFFFFFF);
        assert_eq!(danmu.date, 1700000000123);
        assert_eq!(danmu.uid, 12345);
        assert_eq!(danmu.uname, "someone");
        assert_eq!(danmu.uid_hash, "a1b2c3d4");
        assert_eq!(danmu.dmid, 987654321);
    }

    #[test]
    fn test_parse_gift() {
        let cmd = json!({
            "cmd": "SEND_GIFT",
            "data": {
                "uid": 42, "uname": "g", "giftName": "辣条", "num": 5,
                "coin_type": "gold", "price": 100
            }
        });
        let gift = GiftSendRecord::from_cmd(&cmd).unwrap();
        assert_eq!(gift.giftcount, 5);
        assert!(!gift.is_free_gift());
    }

    #[test]
    fn test_parse_super_chat() {
        let cmd = json!({
            "cmd": "SUPER_CHAT_MESSAGE",
            "data": {
                "uid": 9, "price": 30, "time": 60, "message": "hi",
                "user_info": {"uname": "sc"}
            }
        });
        let sc = SuperChatRecord::from_cmd(&cmd).unwrap();
        assert_eq!(sc.user, "sc");
        assert_eq!(sc.price, 30);
    }

    #[test]
    fn test_malformed_commands_rejected() {
        assert!(Danmu::from_cmd(&json!({"cmd": "DANMU_MSG"})).is_none());
        assert!(GiftSendRecord::from_cmd(&json!({"cmd": "SEND_GIFT", "data": {}})).is_none());
    }
}
