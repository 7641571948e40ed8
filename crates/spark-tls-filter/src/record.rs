//! TLS 记录头解析。
//!
//! 只读取头部字节计算“声明的记录总长度”，从不消费负载；
//! 解码循环据此判断缓冲中是否已有一条完整记录。

use crate::error::TlsError;

/// 记录头长度：1 字节内容类型 + 2 字节版本 + 2 字节大端长度。
pub const RECORD_HEADER_LEN: usize = 5;

const CHANGE_CIPHER_SPEC: u8 = 20;
const APPLICATION_DATA_UPPER: u8 = 24;
const SSLV2_CLIENT_HELLO: u8 = 1;

/// 计算缓冲起始处记录的声明总长度（含头部）。
///
/// - 不足 5 字节时返回 `Ok(None)`，表示需要更多数据；
/// - 内容类型 20..=24 且主版本为 3：`5 + length`；
/// - SSLv2 兼容的 ClientHello（首字节最高位置位、消息类型为 ClientHello、主版本 2 或 3）：
///   `2 + ((b0 & 0x7f) << 8 | b1)`；
/// - 其余头部视为协议违规。
pub fn packet_size(header: &[u8]) -> Result<Option<usize>, TlsError> {
    if header.len() < RECORD_HEADER_LEN {
        return Ok(None);
    }
    let content_type = header[0];
    let major = header[1];

    if (CHANGE_CIPHER_SPEC..=APPLICATION_DATA_UPPER).contains(&content_type) && major == 3 {
        let length = u16::from_be_bytes([header[3], header[4]]) as usize;
        return Ok(Some(RECORD_HEADER_LEN + length));
    }

    // SSLv2 头部：两字节长度，随后是消息类型与版本。
    if content_type & 0x80 != 0 && header[2] == SSLV2_CLIENT_HELLO && matches!(header[3], 2 | 3) {
        let length = (((content_type & 0x7f) as usize) << 8) | header[1] as usize;
        return Ok(Some(2 + length));
    }

    Err(TlsError::Protocol(format!(
        "unsupported record: type={content_type} version={major}.{}",
        header[2]
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_header_needs_more_bytes() {
        assert!(matches!(packet_size(&[22, 3, 3, 0]), Ok(None)));
    }

    #[test]
    fn tls_record_length_includes_header() {
        assert_eq!(packet_size(&[23, 3, 3, 0x05, 0xdc]).ok().flatten(), Some(1505));
        assert_eq!(packet_size(&[22, 3, 1, 0, 0, 9]).ok().flatten(), Some(5));
    }

    #[test]
    fn sslv2_client_hello_is_recognized() {
        assert_eq!(packet_size(&[0x80, 0x2e, 1, 3, 1]).ok().flatten(), Some(0x30));
    }

    #[test]
    fn garbage_is_a_protocol_violation() {
        assert!(matches!(
            packet_size(b"GET / HTTP/1.1"),
            Err(TlsError::Protocol(_))
        ));
    }
}
