//! 集成测试共享的脚本引擎与连接夹具。
//!
//! 脚本引擎按预设步骤报告握手状态，并把每次引擎操作记入共享日志，
//! 使测试能精确断言驱动器执行了哪些操作、以什么顺序执行。
//! 记录格式与真实 TLS 一致：`[type, 3, 3, len_hi, len_lo] + payload`，应用数据以明文承载。

#![allow(dead_code)]

use std::{collections::VecDeque, sync::Arc, time::Duration};

use parking_lot::Mutex;
use spark_buffer::Buffer;
use spark_filterchain::{
    Connection, Message, Result, TransportFilter,
    mock::{CollectingFilter, MemoryTransport},
};
use spark_tls_filter::{
    EngineError, EngineFactory, EngineResult, EngineStatus, HandshakeListener, HandshakeStatus,
    RawCertificate, SessionContext, StageChainBuilder, TlsEngine, TlsError, TlsFilter,
    TlsFilterConfig, engine::DelegatedTask,
};

pub const HANDSHAKE: u8 = 22;
pub const ALERT: u8 = 21;
pub const APPLICATION_DATA: u8 = 23;

pub type OpsLog = Arc<Mutex<Vec<String>>>;

/// 构造一条记录。
pub fn record(content_type: u8, payload: &[u8]) -> Vec<u8> {
    let len = u16::try_from(payload.len()).expect("记录负载不超过 u16");
    let mut bytes = vec![content_type, 3, 3];
    bytes.extend_from_slice(&len.to_be_bytes());
    bytes.extend_from_slice(payload);
    bytes
}

/// 总长度为 `total` 字节的握手记录。
pub fn handshake_record(total: usize) -> Vec<u8> {
    record(HANDSHAKE, &vec![0xAB; total - 5])
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    Unwrap,
    /// 产出一条总长为给定字节数的握手记录。
    Wrap(usize),
    Task,
}

/// 脚本引擎的行为描述。
#[derive(Clone)]
pub struct Script {
    pub handshake: Vec<Step>,
    /// `None` 表示不支持重协商。
    pub renegotiation: Option<Vec<Step>>,
    pub renegotiation_error: Option<fn() -> EngineError>,
    pub certificates: Vec<Vec<u8>>,
    pub certificates_after_renegotiation: Vec<Vec<u8>>,
    pub want_client_auth: bool,
    pub net_buffer_size: usize,
    pub app_buffer_size: usize,
    /// 单条应用数据记录承载的最大明文字节数。
    pub record_payload: usize,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            handshake: vec![Step::Unwrap],
            renegotiation: None,
            renegotiation_error: None,
            certificates: Vec::new(),
            certificates_after_renegotiation: Vec::new(),
            want_client_auth: false,
            net_buffer_size: 2048,
            app_buffer_size: 1024,
            record_payload: 1000,
        }
    }
}

pub struct ScriptedFactory {
    script: Script,
    ops: OpsLog,
}

impl ScriptedFactory {
    pub fn new(script: Script, ops: OpsLog) -> Self {
        Self { script, ops }
    }
}

impl EngineFactory for ScriptedFactory {
    fn create_engine(&self, _connection: &Connection) -> std::result::Result<Box<dyn TlsEngine>, EngineError> {
        self.ops.lock().push("create".into());
        Ok(Box::new(ScriptedEngine::new(self.script.clone(), Arc::clone(&self.ops))))
    }
}

pub struct ScriptedEngine {
    script: Script,
    steps: VecDeque<Step>,
    ops: OpsLog,
    started: bool,
    renegotiating: bool,
    want: bool,
    need: bool,
    certificates: Vec<RawCertificate>,
}

impl ScriptedEngine {
    pub fn new(script: Script, ops: OpsLog) -> Self {
        Self {
            steps: script.handshake.iter().copied().collect(),
            certificates: script
                .certificates
                .iter()
                .cloned()
                .map(RawCertificate)
                .collect(),
            want: script.want_client_auth,
            need: false,
            started: false,
            renegotiating: false,
            script,
            ops,
        }
    }

    fn log(&self, entry: impl Into<String>) {
        self.ops.lock().push(entry.into());
    }

    fn advance(&mut self) {
        self.steps.pop_front();
        if self.steps.is_empty() && std::mem::take(&mut self.renegotiating) {
            self.certificates.extend(
                self.script
                    .certificates_after_renegotiation
                    .iter()
                    .cloned()
                    .map(RawCertificate),
            );
        }
    }

    fn load_renegotiation(&mut self) -> bool {
        match &self.script.renegotiation {
            Some(steps) => {
                self.steps = steps.iter().copied().collect();
                self.renegotiating = true;
                true
            }
            None => false,
        }
    }

    fn result(&self, status: EngineStatus, consumed: usize, produced: usize) -> EngineResult {
        EngineResult::new(status, self.handshake_status(), consumed, produced)
    }
}

impl TlsEngine for ScriptedEngine {
    fn begin_handshake(&mut self) -> std::result::Result<(), EngineError> {
        if !self.started {
            self.started = true;
            self.log("begin");
            return Ok(());
        }
        if let Some(make_error) = self.script.renegotiation_error {
            self.log("begin rejected");
            return Err(make_error());
        }
        let need = self.need;
        if self.load_renegotiation() {
            self.log(format!("renegotiate need={need}"));
            Ok(())
        } else {
            Err(EngineError::RenegotiationUnsupported("scripted engine"))
        }
    }

    fn handshake_status(&self) -> HandshakeStatus {
        match self.steps.front() {
            Some(Step::Unwrap) => HandshakeStatus::NeedUnwrap,
            Some(Step::Wrap(_)) => HandshakeStatus::NeedWrap,
            Some(Step::Task) => HandshakeStatus::NeedTask,
            None => HandshakeStatus::NotHandshaking,
        }
    }

    fn wrap(&mut self, src: &[u8], dst: &mut Buffer) -> std::result::Result<EngineResult, EngineError> {
        if let Some(Step::Wrap(total)) = self.steps.front().copied() {
            if dst.remaining_mut() < total {
                return Ok(self.result(EngineStatus::BufferOverflow, 0, 0));
            }
            dst.put_slice(&handshake_record(total))
                .map_err(|err| EngineError::Record(err.to_string()))?;
            self.log(format!("wrap {total}"));
            self.advance();
            return Ok(self.result(EngineStatus::Ok, 0, total));
        }
        if !self.steps.is_empty() || src.is_empty() {
            return Ok(self.result(EngineStatus::Ok, 0, 0));
        }
        let chunk = src.len().min(self.script.record_payload);
        let sealed = record(APPLICATION_DATA, &src[..chunk]);
        if dst.remaining_mut() < sealed.len() {
            return Ok(self.result(EngineStatus::BufferOverflow, 0, 0));
        }
        dst.put_slice(&sealed)
            .map_err(|err| EngineError::Record(err.to_string()))?;
        self.log(format!("seal {chunk}"));
        Ok(self.result(EngineStatus::Ok, chunk, sealed.len()))
    }

    fn unwrap(&mut self, src: &[u8], dst: &mut Buffer) -> std::result::Result<EngineResult, EngineError> {
        match self.steps.front() {
            Some(Step::Unwrap) => {
                self.log(format!("unwrap {}", src.len()));
                self.advance();
                return Ok(self.result(EngineStatus::Ok, src.len(), 0));
            }
            Some(_) => return Err(EngineError::Record("record arrived out of turn".into())),
            None => {}
        }
        match src.first().copied() {
            Some(HANDSHAKE) => {
                if !self.load_renegotiation() {
                    return Err(EngineError::RenegotiationUnsupported("scripted engine"));
                }
                self.log("peer renegotiation");
                Ok(self.result(EngineStatus::Ok, src.len(), 0))
            }
            Some(ALERT) => {
                self.log("close_notify");
                Ok(self.result(EngineStatus::Closed, src.len(), 0))
            }
            Some(APPLICATION_DATA) => {
                let payload = &src[5..];
                if dst.remaining_mut() < payload.len() {
                    return Ok(self.result(EngineStatus::BufferOverflow, 0, 0));
                }
                dst.put_slice(payload)
                    .map_err(|err| EngineError::Record(err.to_string()))?;
                self.log(format!("open {}", payload.len()));
                Ok(self.result(EngineStatus::Ok, src.len(), payload.len()))
            }
            other => Err(EngineError::Record(format!("unexpected content type {other:?}"))),
        }
    }

    fn delegated_task(&mut self) -> Option<DelegatedTask> {
        if self.steps.front() != Some(&Step::Task) {
            return None;
        }
        self.advance();
        let ops = Arc::clone(&self.ops);
        Some(Box::new(move || ops.lock().push("task".into())))
    }

    fn invalidate_session(&mut self) {
        self.log("invalidate");
    }

    fn peer_certificates(&self) -> std::result::Result<Vec<RawCertificate>, EngineError> {
        if self.certificates.is_empty() {
            return Err(EngineError::PeerUnverified);
        }
        Ok(self.certificates.clone())
    }

    fn want_client_auth(&self) -> bool {
        self.want
    }

    fn need_client_auth(&self) -> bool {
        self.need
    }

    fn set_want_client_auth(&mut self, want: bool) {
        self.want = want;
    }

    fn set_need_client_auth(&mut self, need: bool) {
        self.need = need;
    }

    fn net_buffer_size(&self) -> usize {
        self.script.net_buffer_size
    }

    fn app_buffer_size(&self) -> usize {
        self.script.app_buffer_size
    }
}

/// 按顺序记录握手通知。
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<String>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }
}

impl HandshakeListener for RecordingListener {
    fn on_start(&self, _connection: &Connection) {
        self.events.lock().push("start".into());
    }

    fn on_complete(&self, _connection: &Connection) {
        self.events.lock().push("complete".into());
    }

    fn on_failure(&self, _connection: &Connection, error: &TlsError) {
        self.events.lock().push(format!("failure:{}", error.code()));
    }
}

/// 单条连接的测试夹具：`传输(装饰) -> TLS -> 应用收集器`。
pub struct Harness {
    pub transport: Arc<MemoryTransport>,
    pub connection: Arc<Connection>,
    pub tls: Arc<TlsFilter>,
    pub app: Arc<CollectingFilter>,
    pub listener: Arc<RecordingListener>,
    pub ops: OpsLog,
}

impl Harness {
    pub fn new(script: Script) -> Self {
        Self::build(script, TlsFilterConfig::default(), MemoryTransport::new())
    }

    pub fn with_config(script: Script, config: TlsFilterConfig) -> Self {
        Self::build(script, config, MemoryTransport::new())
    }

    pub fn queued(script: Script) -> Self {
        Self::build(script, TlsFilterConfig::default(), MemoryTransport::queued())
    }

    fn build(script: Script, config: TlsFilterConfig, transport: Arc<MemoryTransport>) -> Self {
        let ops = OpsLog::default();
        let tls = Arc::new(
            TlsFilter::new(Arc::new(ScriptedFactory::new(script, Arc::clone(&ops))))
                .with_config(config),
        );
        let listener = RecordingListener::new();
        tls.add_handshake_listener(listener.clone());
        let app = CollectingFilter::new();
        let chain = StageChainBuilder::new()
            .transport(Arc::new(TransportFilter))
            .tls(Arc::clone(&tls))
            .application(app.clone())
            .build();
        let connection = Connection::new(transport.clone(), chain);
        Self {
            transport,
            connection,
            tls,
            app,
            listener,
            ops,
        }
    }

    pub fn session(&self) -> Arc<SessionContext> {
        self.tls.session(&self.connection)
    }

    pub fn read(&self, bytes: &[u8]) -> Result<()> {
        self.connection
            .fire_read(Message::Buffer(Buffer::copy_from_slice(bytes)))
    }

    /// 以默认脚本（一条入站握手记录）完成握手，并清空日志与写出记录。
    pub fn establish(&self) {
        self.read(&handshake_record(40)).expect("握手成功");
        assert!(!self.session().is_handshaking());
        self.ops.lock().clear();
        self.transport.take_written();
    }

    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().clone()
    }
}

pub fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}
