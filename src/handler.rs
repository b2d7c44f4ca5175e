//! Pluggable seams: the application callback for non-session messages and
//! the identity resolver that authorizes Logons.

use async_trait::async_trait;

use crate::protocol::FixMessage;
use crate::session::{DisconnectReason, SessionId};

/// Receives in-order application messages for one session. Returned
/// messages are sent back on the same session; the engine assigns their
/// sequence numbers and header fields.
#[async_trait]
pub trait ApplicationHandler: Send + Sync + 'static {
    async fn on_message(&self, session: &SessionId, msg: FixMessage) -> Vec<FixMessage>;

    async fn on_logon(&self, _session: &SessionId) {}

    async fn on_logout(&self, _session: &SessionId, _reason: DisconnectReason) {}
}

/// Swallows application traffic; useful for routing-only deployments and
/// tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHandler;

#[async_trait]
impl ApplicationHandler for NoopHandler {
    async fn on_message(&self, _session: &SessionId, _msg: FixMessage) -> Vec<FixMessage> {
        Vec::new()
    }
}

/// Session parameters granted to an authorized counterparty.
#[derive(Debug, Clone)]
pub struct SessionPermit {
    /// Heartbeat interval when the Logon does not offer one.
    pub heartbeat_interval_secs: u64,
    /// Force a sequence-number reset at logon even if the counterparty
    /// did not send ResetSeqNumFlag=Y.
    pub reset_on_logon: bool,
}

/// Maps an inbound (SenderCompID, TargetCompID) pair to a permit, or
/// denies it. Denied Logons are closed without a reply.
#[async_trait]
pub trait IdentityResolver: Send + Sync + 'static {
    async fn resolve(&self, sender_comp_id: &str, target_comp_id: &str)
        -> Option<SessionPermit>;
}

/// Accepts any counterparty that addresses the configured local CompID.
#[derive(Debug, Clone)]
pub struct OpenResolver {
    pub local_comp_id: String,
    pub heartbeat_interval_secs: u64,
}

#[async_trait]
impl IdentityResolver for OpenResolver {
    async fn resolve(
        &self,
        sender_comp_id: &str,
        target_comp_id: &str,
    ) -> Option<SessionPermit> {
        if target_comp_id != self.local_comp_id || sender_comp_id.is_empty() {
            return None;
        }
        Some(SessionPermit {
            heartbeat_interval_secs: self.heartbeat_interval_secs,
            reset_on_logon: false,
        })
    }
}

/// Allows only an explicit list of counterparty CompIDs.
#[derive(Debug, Clone)]
pub struct AllowListResolver {
    pub local_comp_id: String,
    pub allowed: Vec<String>,
    pub heartbeat_interval_secs: u64,
}

#[async_trait]
impl IdentityResolver for AllowListResolver {
    async fn resolve(
        &self,
        sender_comp_id: &str,
        target_comp_id: &str,
    ) -> Option<SessionPermit> {
        if target_comp_id != self.local_comp_id {
            return None;
        }
        self.allowed
            .iter()
            .any(|c| c == sender_comp_id)
            .then(|| SessionPermit {
                heartbeat_interval_secs: self.heartbeat_interval_secs,
                reset_on_logon: false,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_resolver_checks_target() {
        let r = OpenResolver {
            local_comp_id: "SRV".into(),
            heartbeat_interval_secs: 30,
        };
        assert!(r.resolve("ANY", "SRV").await.is_some());
        assert!(r.resolve("ANY", "OTHER").await.is_none());
        assert!(r.resolve("", "SRV").await.is_none());
    }

    #[tokio::test]
    async fn allow_list_resolver_filters_senders() {
        let r = AllowListResolver {
            local_comp_id: "SRV".into(),
            allowed: vec!["CLI".into()],
            heartbeat_interval_secs: 20,
        };
        assert_eq!(
            r.resolve("CLI", "SRV").await.map(|p| p.heartbeat_interval_secs),
            Some(20)
        );
        assert!(r.resolve("EVE", "SRV").await.is_none());
    }
}
