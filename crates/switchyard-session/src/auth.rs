//! Authorization coordination.
//!
//! The only place a session's auth handle is ever set.

use std::sync::Arc;

use switchyard_core::{AuthProvider, AuthStatus, GatewayError, ServerMessage};
use tracing::debug;

use crate::{SessionRegistry, record::SessionRecord};

/// Drives the authorization handshake for sessions.
pub struct AuthCoordinator {
    provider: Arc<dyn AuthProvider>,
    registry: SessionRegistry,
}

impl AuthCoordinator {
    #[must_use]
    pub fn new(provider: Arc<dyn AuthProvider>, registry: SessionRegistry) -> Self {
        Self { provider, registry }
    }

    /// Start the handshake; the reply carries the URL to visit.
    ///
    /// # Errors
    /// Returns `Auth` if the provider fails.
    pub async fn begin(&self, session: &SessionRecord) -> Result<ServerMessage, GatewayError> {
        let url = self
            .provider
            .begin_auth(session.id())
            .await
            .map_err(|e| GatewayError::Auth(e.to_string()))?;
        debug!(session_id = %session.id(), "authorization started");
        Ok(ServerMessage::AuthUrl { url })
    }

    /// Poll the handshake and store the client handle once it is ready.
    ///
    /// # Errors
    /// Returns `Auth` if the provider fails.
    pub async fn complete(&self, session: &SessionRecord) -> Result<ServerMessage, GatewayError> {
        if session.auth_handle().is_some() {
            return Ok(ServerMessage::AuthCompleted);
        }

        let status = self
            .provider
            .complete_auth(session.id())
            .await
            .map_err(|e| GatewayError::Auth(e.to_string()))?;

        match status {
            AuthStatus::Complete(handle) => {
                if session.set_auth(handle) {
                    self.registry.record_authorized(session.id());
                }
                Ok(ServerMessage::AuthCompleted)
            }
            AuthStatus::Pending => Ok(ServerMessage::AuthPending),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use switchyard_core::{AuthError, AuthHandle, LifecycleEvent, SessionId, SessionState};

    use super::*;
    use crate::record::tests::parts;

    #[derive(Default)]
    struct FakeProvider {
        approved: AtomicBool,
    }

    #[async_trait]
    impl AuthProvider for FakeProvider {
        async fn begin_auth(&self, session_id: &SessionId) -> Result<String, AuthError> {
            Ok(format!("https://auth.example/authorize?state={session_id}"))
        }

        async fn complete_auth(&self, session_id: &SessionId) -> Result<AuthStatus, AuthError> {
            if session_id.as_str() == "broken" {
                return Err(AuthError::Provider("exchange rejected".into()));
            }
            if self.approved.load(Ordering::SeqCst) {
                Ok(AuthStatus::Complete(AuthHandle::new(format!("client-{session_id}"))))
            } else {
                Ok(AuthStatus::Pending)
            }
        }
    }

    async fn setup(id: &str) -> (Arc<FakeProvider>, SessionRegistry, AuthCoordinator) {
        let provider = Arc::new(FakeProvider::default());
        let registry = SessionRegistry::default();
        let owned = id.to_owned();
        registry
            .get_or_create(&SessionId::from(id), move || async move { Ok(parts(&owned)) })
            .await
            .unwrap();
        let coordinator = AuthCoordinator::new(provider.clone(), registry.clone());
        (provider, registry, coordinator)
    }

    #[tokio::test]
    async fn test_handshake_activates_session() {
        let (provider, registry, auth) = setup("s").await;
        let session = registry.get(&SessionId::from("s")).unwrap();

        let reply = auth.begin(&session).await.unwrap();
        assert_eq!(
            reply,
            ServerMessage::AuthUrl {
                url: "https://auth.example/authorize?state=s".into()
            }
        );

        assert_eq!(auth.complete(&session).await.unwrap(), ServerMessage::AuthPending);
        assert_eq!(session.state(), SessionState::PendingAuth);

        provider.approved.store(true, Ordering::SeqCst);
        assert_eq!(auth.complete(&session).await.unwrap(), ServerMessage::AuthCompleted);
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(
            session
                .auth_handle()
                .and_then(|h| h.downcast_ref::<String>().cloned()),
            Some("client-s".to_string())
        );
        assert!(registry.events().history().contains(&LifecycleEvent::SessionAuthorized {
            session_id: SessionId::from("s"),
        }));

        // Already authorized: no second exchange.
        provider.approved.store(false, Ordering::SeqCst);
        assert_eq!(auth.complete(&session).await.unwrap(), ServerMessage::AuthCompleted);
    }

    #[tokio::test]
    async fn test_provider_failure_maps_to_auth_error() {
        let (_provider, registry, auth) = setup("broken").await;
        let session = registry.get(&SessionId::from("broken")).unwrap();
        let err = auth.complete(&session).await.unwrap_err();
        assert!(matches!(err, GatewayError::Auth(_)));
        assert_eq!(session.state(), SessionState::PendingAuth);
    }
}
