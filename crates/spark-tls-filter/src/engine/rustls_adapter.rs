use std::{
    io::{self, Read, Write},
    sync::Arc,
};

use arc_swap::ArcSwap;
use rustls::{ClientConfig, ClientConnection, ServerConfig, ServerConnection, pki_types::ServerName};
use spark_buffer::Buffer;
use spark_filterchain::Connection;
use tracing::trace;

use super::{
    DelegatedTask, EngineError, EngineFactory, EngineResult, EngineStatus, HandshakeStatus,
    RawCertificate, TlsEngine,
};

/// 单条 TLS 记录在线路上的最大字节数（5 字节头 + 16 KiB 明文 + 加密扩展）。
pub const NET_BUFFER_SIZE: usize = 16_709;

/// 单条 TLS 记录可承载的最大明文字节数。
pub const APP_BUFFER_SIZE: usize = 16_384;

/// 基于 `rustls` 的握手引擎。
///
/// # 设计背景（Why）
/// - `rustls` 采用“内部缓冲 + `read_tls`/`write_tls`”的推模型，过滤器需要的是
///   “握手状态 + 单次 wrap/unwrap”的拉模型，本适配器负责两者之间的换算；
/// - 过滤器自己负责记录分帧，因此 `unwrap` 每次只喂入一条完整记录，明文立即搬入目标缓冲。
///
/// # 逻辑（How）
/// - 握手状态：握手中且有待发送数据 → `NeedWrap`；握手中 → `NeedUnwrap`；
///   握手已结束但收尾数据（例如 TLS 1.3 会话票据）尚未发出 → `NeedWrap`；
///   首次观察到“握手结束且无待发送数据”的那次操作报告 `Finished`；
/// - `wrap` 先把至多一条记录的明文交给 `writer()`，再把待发送的加密字节全部排入目标缓冲；
/// - `rustls` 不会产生委托任务，也不支持重协商。
///
/// # 契约（What）
/// - 客户端认证由 `ServerConfig` 的校验器决定，`want`/`need` 标志只作为过滤器的重协商策略输入。
pub struct RustlsEngine {
    conn: rustls::Connection,
    established: bool,
    want_client_auth: bool,
    need_client_auth: bool,
}

impl RustlsEngine {
    pub fn new(conn: impl Into<rustls::Connection>) -> Self {
        Self {
            conn: conn.into(),
            established: false,
            want_client_auth: false,
            need_client_auth: false,
        }
    }

    fn observe_completion(&mut self) -> HandshakeStatus {
        if !self.established && !self.conn.is_handshaking() && !self.conn.wants_write() {
            self.established = true;
            return HandshakeStatus::Finished;
        }
        self.handshake_status()
    }

    fn drain_tls(&mut self, dst: &mut Buffer) -> Result<usize, EngineError> {
        let mut produced = 0;
        while self.conn.wants_write() && dst.remaining_mut() > 0 {
            let written = self
                .conn
                .write_tls(&mut BufferWriter(&mut *dst))
                .map_err(|err| EngineError::Record(err.to_string()))?;
            if written == 0 {
                break;
            }
            produced += written;
        }
        Ok(produced)
    }
}

impl TlsEngine for RustlsEngine {
    fn begin_handshake(&mut self) -> Result<(), EngineError> {
        if !self.established && self.conn.is_handshaking() {
            return Ok(());
        }
        Err(EngineError::RenegotiationUnsupported(
            "rustls does not implement TLS renegotiation",
        ))
    }

    fn handshake_status(&self) -> HandshakeStatus {
        match (self.conn.is_handshaking(), self.conn.wants_write()) {
            (true, true) => HandshakeStatus::NeedWrap,
            (true, false) => HandshakeStatus::NeedUnwrap,
            (false, true) if !self.established => HandshakeStatus::NeedWrap,
            (false, _) => HandshakeStatus::NotHandshaking,
        }
    }

    fn wrap(&mut self, src: &[u8], dst: &mut Buffer) -> Result<EngineResult, EngineError> {
        let mut consumed = 0;
        if !src.is_empty() {
            if dst.remaining_mut() < NET_BUFFER_SIZE {
                return Ok(EngineResult::new(
                    EngineStatus::BufferOverflow,
                    self.handshake_status(),
                    0,
                    0,
                ));
            }
            let chunk = &src[..src.len().min(APP_BUFFER_SIZE)];
            consumed = self
                .conn
                .writer()
                .write(chunk)
                .map_err(|err| EngineError::Record(err.to_string()))?;
        }
        let produced = self.drain_tls(dst)?;
        let status = if self.conn.wants_write() && dst.remaining_mut() == 0 {
            EngineStatus::BufferOverflow
        } else {
            EngineStatus::Ok
        };
        let handshake_status = self.observe_completion();
        trace!(target: "spark::tls", consumed, produced, ?status, "rustls wrap");
        Ok(EngineResult::new(status, handshake_status, consumed, produced))
    }

    fn unwrap(&mut self, src: &[u8], dst: &mut Buffer) -> Result<EngineResult, EngineError> {
        let mut rd = src;
        while !rd.is_empty() {
            let read = self
                .conn
                .read_tls(&mut rd)
                .map_err(|err| EngineError::Record(err.to_string()))?;
            if read == 0 {
                break;
            }
            self.conn.process_new_packets()?;
        }
        let consumed = src.len() - rd.len();
        let state = self.conn.process_new_packets()?;

        let mut pending = state.plaintext_bytes_to_read();
        let mut produced = 0;
        while pending > 0 && dst.remaining_mut() > 0 {
            let conn = &mut self.conn;
            let read = dst
                .fill_with(pending, |window| conn.reader().read(window))
                .map_err(|err| EngineError::Record(err.to_string()))?;
            if read == 0 {
                break;
            }
            produced += read;
            pending -= read;
        }

        let status = if pending > 0 {
            EngineStatus::BufferOverflow
        } else if state.peer_has_closed() {
            EngineStatus::Closed
        } else {
            EngineStatus::Ok
        };
        let handshake_status = self.observe_completion();
        trace!(target: "spark::tls", consumed, produced, ?status, "rustls unwrap");
        Ok(EngineResult::new(status, handshake_status, consumed, produced))
    }

    fn delegated_task(&mut self) -> Option<DelegatedTask> {
        None
    }

    fn invalidate_session(&mut self) {
        trace!(target: "spark::tls", "rustls sessions are not resumable from this engine; nothing to invalidate");
    }

    fn peer_certificates(&self) -> Result<Vec<RawCertificate>, EngineError> {
        let certificates = self
            .conn
            .peer_certificates()
            .ok_or(EngineError::PeerUnverified)?;
        Ok(certificates
            .iter()
            .map(|cert| RawCertificate(cert.as_ref().to_vec()))
            .collect())
    }

    fn want_client_auth(&self) -> bool {
        self.want_client_auth
    }

    fn need_client_auth(&self) -> bool {
        self.need_client_auth
    }

    fn set_want_client_auth(&mut self, want: bool) {
        self.want_client_auth = want;
    }

    fn set_need_client_auth(&mut self, need: bool) {
        self.need_client_auth = need;
    }

    fn net_buffer_size(&self) -> usize {
        NET_BUFFER_SIZE
    }

    fn app_buffer_size(&self) -> usize {
        APP_BUFFER_SIZE
    }

    fn negotiated_protocol(&self) -> Option<Vec<u8>> {
        self.conn.alpn_protocol().map(<[u8]>::to_vec)
    }
}

/// 把 `write_tls` 的输出限制在缓冲的逻辑容量内。
struct BufferWriter<'a>(&'a mut Buffer);

impl Write for BufferWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let len = buf.len().min(self.0.remaining_mut());
        self.0
            .put_slice(&buf[..len])
            .map_err(|err| io::Error::new(io::ErrorKind::WriteZero, err))?;
        Ok(len)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// 服务端引擎工厂。
///
/// 通过 [`ArcSwap`] 支持热更新 [`ServerConfig`]：替换只影响之后创建的连接，
/// 已在握手或通信中的连接继续使用创建时的配置。
#[derive(Debug)]
pub struct RustlsServerFactory {
    config: ArcSwap<ServerConfig>,
}

impl RustlsServerFactory {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self {
            config: ArcSwap::new(config),
        }
    }

    /// 替换当前 TLS 配置，通常用于证书热更新。
    pub fn replace_config(&self, config: Arc<ServerConfig>) {
        self.config.store(config);
    }

    pub fn config_snapshot(&self) -> Arc<ServerConfig> {
        self.config.load_full()
    }
}

impl EngineFactory for RustlsServerFactory {
    fn create_engine(&self, _connection: &Connection) -> Result<Box<dyn TlsEngine>, EngineError> {
        let conn = ServerConnection::new(self.config.load_full())?;
        Ok(Box::new(RustlsEngine::new(conn)))
    }
}

/// 客户端引擎工厂，每条连接以同一个服务器名称发起握手。
#[derive(Debug)]
pub struct RustlsClientFactory {
    config: ArcSwap<ClientConfig>,
    server_name: ServerName<'static>,
}

impl RustlsClientFactory {
    pub fn new(config: Arc<ClientConfig>, server_name: ServerName<'static>) -> Self {
        Self {
            config: ArcSwap::new(config),
            server_name,
        }
    }

    pub fn replace_config(&self, config: Arc<ClientConfig>) {
        self.config.store(config);
    }

    pub fn config_snapshot(&self) -> Arc<ClientConfig> {
        self.config.load_full()
    }
}

impl EngineFactory for RustlsClientFactory {
    fn create_engine(&self, _connection: &Connection) -> Result<Box<dyn TlsEngine>, EngineError> {
        let conn = ClientConnection::new(self.config.load_full(), self.server_name.clone())?;
        Ok(Box::new(RustlsEngine::new(conn)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_writer_stops_at_logical_capacity() {
        let mut buffer = Buffer::with_capacity(4);
        let mut writer = BufferWriter(&mut buffer);
        assert_eq!(writer.write(b"abcdef").expect("部分写入"), 4);
        assert_eq!(writer.write(b"gh").expect("已满"), 0);
        assert_eq!(buffer.chunk(), b"abcd");
    }
}
