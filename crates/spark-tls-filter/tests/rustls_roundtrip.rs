//! `rustls_roundtrip` 集成测试：两端均为基于 rustls 的过滤链，经内存传输互相投递字节。
//!
//! # 测试目标（Why）
//! - 任意明文经 `wrap_all` 加密、再以任意切分方式投递给对端 `unwrap_all`，必须逐字节还原；
//! - 客户端通过事件发起握手，服务端由装饰后的传输阶段在首个读事件时创建引擎。

use std::sync::{Arc, LazyLock};

use proptest::{collection::vec, prelude::*};
use rustls::{
    ClientConfig, RootCertStore, ServerConfig,
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName},
};
use spark_buffer::Buffer;
use spark_filterchain::{
    Connection, Message, TransportFilter,
    mock::{CollectingFilter, MemoryTransport},
};
use spark_tls_filter::{
    CertificateEvent, EngineFactory, RustlsClientFactory, RustlsServerFactory, SessionState,
    StageChainBuilder, StartHandshakeEvent, TlsFilter,
};

struct Configs {
    server: Arc<ServerConfig>,
    client: Arc<ClientConfig>,
    certificate: CertificateDer<'static>,
}

static CONFIGS: LazyLock<Configs> = LazyLock::new(|| {
    let certified =
        rcgen::generate_simple_self_signed(vec!["localhost".into()]).expect("生成自签名证书");
    let certificate = certified.cert.der().clone();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()));
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let server = ServerConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .expect("协议版本")
        .with_no_client_auth()
        .with_single_cert(vec![certificate.clone()], key)
        .expect("服务端证书");

    let mut roots = RootCertStore::empty();
    roots.add(certificate.clone()).expect("信任锚");
    let client = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .expect("协议版本")
        .with_root_certificates(roots)
        .with_no_client_auth();

    Configs {
        server: Arc::new(server),
        client: Arc::new(client),
        certificate,
    }
});

struct Peer {
    transport: Arc<MemoryTransport>,
    connection: Arc<Connection>,
    tls: Arc<TlsFilter>,
    app: Arc<CollectingFilter>,
}

impl Peer {
    fn new(factory: Arc<dyn EngineFactory>) -> Self {
        let transport = MemoryTransport::new();
        let tls = Arc::new(TlsFilter::new(factory));
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
        }
    }

    fn server() -> Self {
        Self::new(Arc::new(RustlsServerFactory::new(Arc::clone(&CONFIGS.server))))
    }

    fn client() -> Self {
        let name = ServerName::try_from("localhost").expect("合法主机名");
        Self::new(Arc::new(RustlsClientFactory::new(
            Arc::clone(&CONFIGS.client),
            name,
        )))
    }

    fn state(&self) -> SessionState {
        self.tls.session(&self.connection).state()
    }

    fn send(&self, plaintext: &[u8]) {
        self.connection
            .fire_write(Message::Buffer(Buffer::copy_from_slice(plaintext)))
            .expect("加密写出");
    }
}

/// 把 `from` 写出的全部字节按 `split` 切块投递给 `to`；返回是否有字节被投递。
fn deliver(from: &Peer, to: &Peer, split: usize) -> bool {
    let bytes = from.transport.take_written_bytes();
    for piece in bytes.chunks(split.max(1)) {
        to.connection
            .fire_read(Message::Buffer(Buffer::copy_from_slice(piece)))
            .expect("对端读事件");
    }
    !bytes.is_empty()
}

fn connected_pair() -> (Peer, Peer) {
    let client = Peer::client();
    let server = Peer::server();
    client
        .connection
        .filter_chain()
        .fire_event(&client.connection, &mut StartHandshakeEvent)
        .expect("客户端发起握手");

    for _ in 0..16 {
        let forward = deliver(&client, &server, usize::MAX);
        let backward = deliver(&server, &client, usize::MAX);
        if !forward && !backward {
            break;
        }
    }
    assert_eq!(client.state(), SessionState::Established);
    assert_eq!(server.state(), SessionState::Established);
    (client, server)
}

#[test]
fn handshake_completes_and_exposes_server_certificate() {
    let (client, server) = connected_pair();

    let mut event = CertificateEvent::new(false);
    client
        .connection
        .filter_chain()
        .fire_event(&client.connection, &mut event)
        .expect("证书请求");
    let chain = event.certificates.expect("服务端证书链");
    assert_eq!(chain[0].der(), CONFIGS.certificate.as_ref());

    let mut event = CertificateEvent::new(false);
    server
        .connection
        .filter_chain()
        .fire_event(&server.connection, &mut event)
        .expect("证书请求");
    assert!(event.certificates.is_none(), "服务端未要求客户端证书");
}

#[test]
fn server_to_client_application_data() {
    let (client, server) = connected_pair();

    server.send(b"hello from server");
    deliver(&server, &client, usize::MAX);

    assert_eq!(client.app.received(), b"hello from server");
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn plaintext_survives_wrap_and_unwrap(
        plaintext in vec(any::<u8>(), 1..40_000),
        write_chunk in 1usize..20_000,
        split in 64usize..5_000,
    ) {
        let (client, server) = connected_pair();

        for piece in plaintext.chunks(write_chunk) {
            client.send(piece);
        }
        deliver(&client, &server, split);

        prop_assert_eq!(server.app.received(), plaintext);
        prop_assert_eq!(server.tls.session(&server.connection).remainder_len(), 0);
    }
}
