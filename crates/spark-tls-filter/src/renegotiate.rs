use spark_buffer::Buffer;
use spark_filterchain::FilterContext;
use tracing::{debug, error};

use crate::{
    certificate::{X509Certificate, convert_chain},
    context::SessionContext,
    engine::RawCertificate,
    error::TlsError,
    filter::TlsFilter,
};

const INSECURE_RENEGOTIATION_DIAGNOSTIC: &str = "Secure SSL/TLS renegotiation is not supported by the peer. \
     This is most likely due to the peer using an older SSL/TLS implementation that does not implement RFC 5746.";

impl TlsFilter {
    /// 在已建立的会话上重新握手，用于补取客户端证书。
    ///
    /// # 逻辑（How）
    /// 1. 引擎只“希望”客户端认证且配置不允许为此重协商时直接返回；
    /// 2. 引擎尚未配置客户端认证时，在本次重协商期间临时强制 `need_client_auth`；
    /// 3. 使当前会话失效、开始新握手，并以同步模式驱动至完成；
    /// 4. 无论成败，临时强制的标志都恢复为 `false`。
    ///
    /// # 契约（What）
    /// - 对端不支持安全重协商时记录运维诊断日志，并返回 [`TlsError::InsecureRenegotiation`]；
    /// - 握手留下的未消费字节保存为会话的输入余量。
    pub fn renegotiate(&self, session: &SessionContext, ctx: &FilterContext<'_>) -> Result<(), TlsError> {
        let (want, need) = session
            .with_engine(|engine| (engine.want_client_auth(), engine.need_client_auth()))?;
        if want && !self.config_snapshot().renegotiate_on_client_auth_want {
            return Ok(());
        }

        let auth_configured = want || need;
        if !auth_configured {
            session.with_engine(|engine| engine.set_need_client_auth(true))?;
        }
        let _restore = ClientAuthRestore {
            session,
            armed: !auth_configured,
        };

        self.renegotiate_inner(session, ctx)
            .map_err(|err| self.classify_renegotiation_failure(ctx, err))
    }

    fn renegotiate_inner(&self, session: &SessionContext, ctx: &FilterContext<'_>) -> Result<(), TlsError> {
        session.with_engine(|engine| {
            engine.invalidate_session();
            engine.begin_handshake()
        })??;
        let leftover = self.rehandshake(session, ctx, session.take_remainder())?;
        session.store_remainder(leftover);
        Ok(())
    }

    fn classify_renegotiation_failure(&self, ctx: &FilterContext<'_>, err: TlsError) -> TlsError {
        match err {
            TlsError::Engine(engine) if engine.is_insecure_renegotiation() => {
                error!(
                    target: "spark::tls",
                    connection = %ctx.connection().id(),
                    "{INSECURE_RENEGOTIATION_DIAGNOSTIC}"
                );
                TlsError::InsecureRenegotiation(engine)
            }
            other => other,
        }
    }

    /// 以同步模式驱动一次完整握手（重协商），并通知监听器开始与完成。
    pub(crate) fn rehandshake(
        &self,
        session: &SessionContext,
        ctx: &FilterContext<'_>,
        input: Option<Buffer>,
    ) -> Result<Option<Buffer>, TlsError> {
        let connection = ctx.connection();
        session.mark_handshaking();
        self.notify_start(session, connection);
        let timeout = self.config_snapshot().handshake_timeout;
        let leftover = self.handshake_sync(session, ctx, input, timeout)?;
        session.mark_established();
        self.notify_complete(session, connection);
        Ok(leftover)
    }

    /// 读取对端证书链；缺失且要求客户端认证时触发一次重协商后再读取。
    ///
    /// 重协商失败在此降级为“没有可用证书链”，只记录调试日志。
    pub fn peer_certificate_chain(
        &self,
        session: &SessionContext,
        ctx: &FilterContext<'_>,
        need_client_auth: bool,
    ) -> Option<Vec<X509Certificate>> {
        if let Some(raw) = current_peer_certificates(session) {
            return convert_chain(&raw);
        }
        if !need_client_auth {
            return None;
        }
        if let Err(err) = self.renegotiate(session, ctx) {
            debug!(
                target: "spark::tls",
                connection = %ctx.connection().id(),
                error = %err,
                "renegotiation for client certificate failed"
            );
            return None;
        }
        current_peer_certificates(session).and_then(|raw| convert_chain(&raw))
    }
}

fn current_peer_certificates(session: &SessionContext) -> Option<Vec<RawCertificate>> {
    match session.with_engine(|engine| engine.peer_certificates()) {
        Ok(Ok(chain)) if !chain.is_empty() => Some(chain),
        Ok(Ok(_)) => None,
        Ok(Err(err)) => {
            debug!(target: "spark::tls", error = %err, "peer certificates unavailable");
            None
        }
        Err(err) => {
            debug!(target: "spark::tls", error = %err, "peer certificates unavailable");
            None
        }
    }
}

/// 作用域结束时撤销临时强制的 `need_client_auth`。
struct ClientAuthRestore<'a> {
    session: &'a SessionContext,
    armed: bool,
}

impl Drop for ClientAuthRestore<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(err) = self
            .session
            .with_engine(|engine| engine.set_need_client_auth(false))
        {
            debug!(
                target: "spark::tls",
                connection = %self.session.connection_id(),
                error = %err,
                "could not restore need_client_auth after renegotiation"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use spark_buffer::SlabBufferPool;
    use spark_filterchain::{Connection, FilterChain, mock::MemoryTransport};
    use tracing_test::traced_test;

    use super::*;

    #[test]
    #[traced_test]
    fn restore_without_engine_is_logged() {
        let connection = Connection::new(MemoryTransport::new(), FilterChain::builder().build());
        let session = SessionContext::obtain(&connection, &SlabBufferPool::new());

        drop(ClientAuthRestore {
            session: &session,
            armed: true,
        });

        assert!(logs_contain("could not restore need_client_auth"));
    }

    #[test]
    #[traced_test]
    fn disarmed_restore_stays_silent() {
        let connection = Connection::new(MemoryTransport::new(), FilterChain::builder().build());
        let session = SessionContext::obtain(&connection, &SlabBufferPool::new());

        drop(ClientAuthRestore {
            session: &session,
            armed: false,
        });

        assert!(!logs_contain("could not restore need_client_auth"));
    }
}
