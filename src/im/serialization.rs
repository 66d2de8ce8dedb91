//! 帧编解码与标识符生成
//!
//! gzip 压缩、base64 字段编解码、会话级 clientRef 与确定性 chatId 的生成。

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serializer};
use std::io::{Read, Write};

/// Base64 序列化函数（信封 data 字段）
pub fn serialize_base64<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    use base64::Engine;
    serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(data))
}

/// Base64 反序列化函数（支持 null 值）
pub fn deserialize_base64<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use base64::Engine;
    // 先尝试反序列化为 Option<String>，以支持 null 值
    let opt_s: Option<String> = Deserialize::deserialize(deserializer)?;
    let s = match opt_s {
        Some(s) => s,
        None => return Ok(Vec::new()),
    };
    if s.is_empty() {
        return Ok(Vec::new());
    }
    base64::engine::general_purpose::STANDARD
        .decode(s)
        .map_err(serde::de::Error::custom)
}

/// 解压 gzip 数据
pub fn decompress_gzip(data: &[u8]) -> Result<Vec<u8>, std::io::Error> {
    let mut decoder = GzDecoder::new(data);
    let mut decompressed = Vec::new();
    decoder.read_to_end(&mut decompressed)?;
    Ok(decompressed)
}

/// 压缩数据为 gzip 格式
pub fn compress_gzip(data: &[u8]) -> Result<Vec<u8>, std::io::Error> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

/// 是否为 gzip 帧（魔数嗅探）
pub fn is_gzip(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] == 0x1f && data[1] == 0x8b
}

/// 生成会话级命名空间（引擎每次启动铸造一次）
///
/// 作为 clientRef 前缀；停机排空后迟到的确认按前缀识别并丢弃。
pub fn new_session_namespace() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// 生成 clientRef（设备内全局唯一，带会话命名空间前缀）
pub fn generate_client_ref(session_ns: &str, user_id: &str) -> String {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("{}-{}-{}", session_ns, user_id, nanos)
}

/// clientRef 是否属于指定会话命名空间
pub fn ref_in_session(client_ref: &str, session_ns: &str) -> bool {
    client_ref
        .split('-')
        .next()
        .map(|ns| ns == session_ns)
        .unwrap_or(false)
}

/// 计算两人会话的确定性 chatId（参与者 ID 排序后拼接，双端一致）
pub fn derive_chat_id(a: &str, b: &str) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("si_{}_{}", lo, hi)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gzip_roundtrip() {
        let raw = br#"{"event":"messageArrived","data":"aG9sYQ=="}"#;
        let packed = compress_gzip(raw).unwrap();
        assert!(is_gzip(&packed));
        assert_eq!(decompress_gzip(&packed).unwrap(), raw);
    }

    #[test]
    fn chat_id_is_order_independent() {
        assert_eq!(derive_chat_id("u2", "u1"), derive_chat_id("u1", "u2"));
        assert_eq!(derive_chat_id("u1", "u2"), "si_u1_u2");
    }

    #[test]
    fn client_ref_carries_session_namespace() {
        let ns = new_session_namespace();
        let r1 = generate_client_ref(&ns, "u1");
        let r2 = generate_client_ref(&ns, "u1");
        assert_ne!(r1, r2);
        assert!(ref_in_session(&r1, &ns));
        assert!(!ref_in_session(&r1, "deadbeef"));
    }
}
