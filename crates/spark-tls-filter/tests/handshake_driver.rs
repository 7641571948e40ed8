//! `handshake_driver` 集成测试：事件驱动与同步两种握手模式。
//!
//! # 测试目标（Why）
//! - 握手记录在一次循环内累积、循环结束时只写一次；
//! - 需要更多数据时驱动器返回而不阻塞，不完整的记录原样保留到下一次读事件；
//! - 监听器通知次数与顺序、失败通知、同步模式的超时与超时恢复。

mod support;

use std::{sync::Arc, time::Duration};

use spark_buffer::Buffer;
use spark_filterchain::{Connection, ErrorCategory, FilterContext, Message, mock::MemoryTransport};
use spark_tls_filter::{
    HandshakeListener, SessionState, StartHandshakeEvent, TlsError, TlsFilterConfig, codes,
};
use support::{Harness, RecordingListener, Script, Step, handshake_record, millis};

#[test]
fn consecutive_wraps_are_flushed_as_one_write() {
    let harness = Harness::new(Script {
        handshake: vec![Step::Unwrap, Step::Wrap(1300), Step::Wrap(400), Step::Unwrap],
        ..Script::default()
    });

    harness.read(&handshake_record(60)).expect("握手推进");

    assert_eq!(harness.transport.write_count(), 1);
    let mut expected = handshake_record(1300);
    expected.extend(handshake_record(400));
    assert_eq!(harness.transport.take_written_bytes(), expected);
    assert_eq!(
        harness.ops(),
        ["create", "begin", "unwrap 60", "wrap 1300", "wrap 400"]
    );
    assert!(harness.session().is_handshaking());
    assert_eq!(harness.listener.events(), ["start"]);
}

#[test]
fn partial_handshake_record_waits_for_next_read() {
    let harness = Harness::new(Script {
        handshake: vec![Step::Unwrap, Step::Unwrap],
        ..Script::default()
    });
    let first = handshake_record(40);
    let second = handshake_record(30);
    let mut bytes = first.clone();
    bytes.extend_from_slice(&second[..12]);

    harness.read(&bytes).expect("首个读事件");
    assert_eq!(harness.session().remainder_len(), 12);
    assert_eq!(harness.ops(), ["create", "begin", "unwrap 40"]);
    assert_eq!(harness.listener.events(), ["start"]);

    harness.read(&second[12..]).expect("补齐记录");
    assert_eq!(harness.ops().last().map(String::as_str), Some("unwrap 30"));
    assert_eq!(harness.session().remainder_len(), 0);
    assert_eq!(harness.session().state(), SessionState::Established);
    assert_eq!(harness.listener.events(), ["start", "complete"]);
    assert_eq!(harness.app.read_count(), 0, "握手字节不得作为明文上送");
}

#[test]
fn delegated_tasks_run_before_the_next_step() {
    let harness = Harness::new(Script {
        handshake: vec![Step::Unwrap, Step::Task, Step::Wrap(100)],
        ..Script::default()
    });

    harness.read(&handshake_record(40)).expect("握手完成");

    assert_eq!(
        harness.ops(),
        ["create", "begin", "unwrap 40", "task", "wrap 100"]
    );
    assert_eq!(harness.transport.take_written_bytes(), handshake_record(100));
    assert_eq!(harness.listener.events(), ["start", "complete"]);
}

#[test]
fn completed_handshake_step_is_a_no_op() {
    let harness = Harness::new(Script::default());
    harness.establish();

    let chain = harness.connection.filter_chain();
    let ctx = FilterContext::new(&harness.connection, &chain, 1);
    let session = harness.session();

    let leftover = harness
        .tls
        .handshake_step(&session, &ctx, None)
        .expect("空输入");
    assert!(leftover.is_none());

    let leftover = harness
        .tls
        .handshake_step(&session, &ctx, Some(Buffer::copy_from_slice(b"xyz")))
        .expect("输入原样返回")
        .expect("仍有剩余");
    assert_eq!(leftover.chunk(), b"xyz");

    assert!(harness.ops().is_empty());
    assert_eq!(harness.transport.write_count(), 0);
    assert_eq!(harness.listener.events(), ["start", "complete"]);
}

#[test]
fn listeners_observe_start_before_complete_once() {
    let harness = Harness::new(Script {
        handshake: vec![Step::Unwrap, Step::Wrap(80)],
        ..Script::default()
    });

    harness.read(&handshake_record(40)).expect("握手完成");
    harness.read(&[]).expect("握手完成后的空读");

    assert_eq!(harness.listener.events(), ["start", "complete"]);
}

#[test]
fn connection_listener_only_observes_its_own_connection() {
    let harness = Harness::new(Script::default());
    let own = RecordingListener::new();
    harness.session().add_handshake_listener(own.clone());
    let other = Connection::new(MemoryTransport::new(), harness.connection.filter_chain());

    harness.read(&handshake_record(40)).expect("握手完成");
    other
        .fire_read(Message::Buffer(Buffer::copy_from_slice(&handshake_record(40))))
        .expect("第二条连接握手完成");

    assert_eq!(own.events(), ["start", "complete"]);
    assert_eq!(
        harness.listener.events(),
        ["start", "complete", "start", "complete"],
        "过滤器级监听器覆盖所有连接"
    );
    assert_eq!(harness.tls.session(&other).listeners().len(), 0);

    let handle: Arc<dyn HandshakeListener> = own.clone();
    assert!(harness.session().remove_handshake_listener(&handle));
    assert!(harness.session().listeners().is_empty());
}

#[test]
fn unrecognised_record_fails_the_handshake_and_notifies() {
    let harness = Harness::new(Script::default());

    let err = harness
        .read(&[0x99, 0, 0, 0, 0, 0])
        .expect_err("无法识别的记录头");

    assert_eq!(err.code(), codes::PROTOCOL_VIOLATION);
    assert!(matches!(err.cause_ref::<TlsError>(), Some(TlsError::Protocol(_))));
    assert_eq!(
        harness.listener.events(),
        ["start", "failure:spark.transport.tls.protocol_violation"]
    );
}

#[test]
fn endless_handshake_overflow_gives_up() {
    let harness = Harness::new(Script {
        handshake: vec![Step::Wrap(1_000_000)],
        ..Script::default()
    });

    let err = harness.read(&[]).expect_err("输出缓冲无法满足引擎");

    assert_eq!(err.code(), codes::PROTOCOL_VIOLATION);
    assert_eq!(harness.transport.write_count(), 0);
    assert_eq!(
        harness.listener.events(),
        ["start", "failure:spark.transport.tls.protocol_violation"]
    );
}

#[test]
fn sync_handshake_times_out_and_restores_read_timeout() {
    let config = TlsFilterConfig::from_toml_str("handshake_timeout_ms = 50").expect("配置合法");
    let harness = Harness::with_config(
        Script {
            handshake: vec![Step::Unwrap, Step::Wrap(100), Step::Unwrap],
            ..Script::default()
        },
        config,
    );
    harness
        .connection
        .set_blocking_read_timeout(Some(Duration::from_secs(7)));

    let err = harness
        .read(&handshake_record(40))
        .expect_err("阻塞读超时");

    assert_eq!(err.code(), codes::HANDSHAKE_TIMEOUT);
    assert_eq!(err.category(), ErrorCategory::Timeout);
    assert_eq!(harness.transport.observed_timeouts(), [Some(millis(50))]);
    assert_eq!(
        harness.connection.blocking_read_timeout(),
        Some(Duration::from_secs(7))
    );
    assert_eq!(harness.transport.take_written_bytes(), handshake_record(100));
    assert_eq!(
        harness.listener.events(),
        ["start", "failure:spark.transport.tls.handshake_timeout"]
    );
}

#[test]
fn sync_handshake_completes_with_blocking_reads() {
    let harness = Harness::with_config(
        Script {
            handshake: vec![Step::Unwrap, Step::Wrap(100), Step::Unwrap],
            ..Script::default()
        },
        TlsFilterConfig::builder()
            .handshake_timeout(Some(millis(50)))
            .build(),
    );
    harness.transport.push_inbound(&handshake_record(30));

    harness.read(&handshake_record(40)).expect("同步握手完成");

    assert_eq!(
        harness.ops(),
        ["create", "begin", "unwrap 40", "wrap 100", "unwrap 30"]
    );
    assert_eq!(harness.transport.observed_timeouts(), [Some(millis(50))]);
    assert_eq!(harness.connection.blocking_read_timeout(), None);
    assert_eq!(harness.listener.events(), ["start", "complete"]);
}

#[test]
fn start_handshake_event_flushes_client_flight() {
    let harness = Harness::new(Script {
        handshake: vec![Step::Wrap(120), Step::Unwrap],
        ..Script::default()
    });

    let chain = harness.connection.filter_chain();
    chain
        .fire_event(&harness.connection, &mut StartHandshakeEvent)
        .expect("发起握手");

    assert_eq!(harness.transport.take_written_bytes(), handshake_record(120));
    assert!(harness.session().is_handshaking());
    assert!(harness.app.events().is_empty(), "事件应被 TLS 阶段截断");
    assert_eq!(harness.listener.events(), ["start"]);

    harness.read(&handshake_record(50)).expect("服务端响应");
    assert_eq!(harness.listener.events(), ["start", "complete"]);
}
