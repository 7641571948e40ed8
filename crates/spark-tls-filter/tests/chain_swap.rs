//! `chain_swap` 集成测试：握手完成后切换到登记的替换过滤链。
//!
//! 替换链与原链共享同一个 TLS 过滤器实例，剩余的加密字节在新链的同一索引处以新任务解密。

mod support;

use std::sync::Arc;

use spark_buffer::Buffer;
use spark_filterchain::{
    Connection, FilterChain, Message, TransportFilter,
    mock::{CollectingFilter, MemoryTransport},
};
use spark_tls_filter::{SessionState, StageChainBuilder, TlsFilter};
use support::{APPLICATION_DATA, OpsLog, Script, ScriptedFactory, handshake_record, record};

struct Fixture {
    connection: Arc<Connection>,
    tls: Arc<TlsFilter>,
    original_app: Arc<CollectingFilter>,
    replacement_app: Arc<CollectingFilter>,
    replacement: Arc<FilterChain>,
}

fn fixture() -> Fixture {
    let tls = Arc::new(TlsFilter::new(Arc::new(ScriptedFactory::new(
        Script::default(),
        OpsLog::default(),
    ))));
    let original_app = CollectingFilter::new();
    let replacement_app = CollectingFilter::new();
    let original = StageChainBuilder::new()
        .transport(Arc::new(TransportFilter))
        .tls(Arc::clone(&tls))
        .application(original_app.clone())
        .build();
    let replacement = StageChainBuilder::new()
        .transport(Arc::new(TransportFilter))
        .tls(Arc::clone(&tls))
        .application(replacement_app.clone())
        .build();
    let connection = Connection::new(MemoryTransport::new(), original);
    tls.session(&connection)
        .set_pending_chain(Arc::clone(&replacement));
    Fixture {
        connection,
        tls,
        original_app,
        replacement_app,
        replacement,
    }
}

fn read(fixture: &Fixture, bytes: &[u8]) {
    fixture
        .connection
        .fire_read(Message::Buffer(Buffer::copy_from_slice(bytes)))
        .expect("读事件成功");
}

#[test]
fn leftover_bytes_are_rehomed_onto_the_replacement_chain() {
    let fixture = fixture();
    let mut bytes = handshake_record(40);
    bytes.extend(record(APPLICATION_DATA, b"after"));

    read(&fixture, &bytes);

    assert!(Arc::ptr_eq(
        &fixture.connection.filter_chain(),
        &fixture.replacement
    ));
    assert_eq!(fixture.replacement_app.received(), b"after");
    assert_eq!(fixture.original_app.read_count(), 0);
    assert_eq!(
        fixture.tls.session(&fixture.connection).state(),
        SessionState::Established
    );
}

#[test]
fn swap_without_leftover_waits_for_the_next_read() {
    let fixture = fixture();

    read(&fixture, &handshake_record(40));
    assert!(Arc::ptr_eq(
        &fixture.connection.filter_chain(),
        &fixture.replacement
    ));
    assert_eq!(fixture.replacement_app.read_count(), 0);

    read(&fixture, &record(APPLICATION_DATA, b"next"));
    assert_eq!(fixture.replacement_app.received(), b"next");
    assert_eq!(fixture.original_app.read_count(), 0);
}
