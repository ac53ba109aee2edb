// Legacy API session handling
//
// `Session.login` hands out an id that travels as `_session_id_` in every
// call. Ids are renewed lazily once they are older than the renew window,
// and dropped on `Session.logout`.

use std::time::Duration;

use secrecy::ExposeSecret;
use serde_json::{Map, json};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::Error;
use crate::legacy::client::LegacyClient;

/// Age after which a session id is renewed before its next use.
pub const SESSION_RENEW_AFTER: Duration = Duration::from_secs(90);

#[derive(Debug, Clone)]
pub(crate) struct Session {
    pub(crate) id: String,
    pub(crate) refreshed_at: Instant,
}

impl LegacyClient {
    /// Log in and store the new session id.
    ///
    /// Returns `Ok(None)` when no credentials are configured; such backends
    /// accept calls without a session.
    pub async fn login(&self) -> Result<Option<String>, Error> {
        let mut guard = self.session.lock().await;
        let id = self.login_locked().await?;
        *guard = id.clone().map(|id| Session {
            id,
            refreshed_at: Instant::now(),
        });
        Ok(id)
    }

    /// End the current session, if any. Failures are logged and swallowed.
    pub async fn logout(&self) -> Result<(), Error> {
        let Some(session) = self.session.lock().await.take() else {
            return Ok(());
        };

        let mut params = Map::new();
        params.insert("_session_id_".into(), json!(session.id));
        if let Err(e) = self.post("Session.logout", params).await {
            warn!(error = %e, "legacy logout failed");
        }
        debug!("legacy session closed");
        Ok(())
    }

    /// Current session id, logging in or renewing as needed.
    pub(crate) async fn session_id(&self) -> Result<Option<String>, Error> {
        if self.credentials().is_none() {
            return Ok(None);
        }

        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_mut() {
            if session.refreshed_at.elapsed() < SESSION_RENEW_AFTER {
                return Ok(Some(session.id.clone()));
            }

            let mut params = Map::new();
            params.insert("_session_id_".into(), json!(session.id));
            let renewed = self
                .post("Session.renew", params)
                .await
                .map(|r| r.as_bool().unwrap_or(false));
            if let Ok(true) = renewed {
                debug!("legacy session renewed");
                session.refreshed_at = Instant::now();
                return Ok(Some(session.id.clone()));
            }
            debug!("legacy session renew refused, logging in again");
        }

        let id = self.login_locked().await?;
        *guard = id.clone().map(|id| Session {
            id,
            refreshed_at: Instant::now(),
        });
        Ok(id)
    }

    /// Drop the stored session so the next call logs in afresh.
    pub(crate) async fn invalidate_session(&self) {
        self.session.lock().await.take();
    }

    /// Perform `Session.login`. Caller holds the session lock.
    async fn login_locked(&self) -> Result<Option<String>, Error> {
        let Some(credentials) = self.credentials() else {
            return Ok(None);
        };

        debug!(username = %credentials.username, "legacy login");

        let mut params = Map::new();
        params.insert("username".into(), json!(credentials.username));
        params.insert(
            "password".into(),
            json!(credentials.password.expose_secret()),
        );

        let result = self
            .post("Session.login", params)
            .await
            .map_err(|e| match e {
                Error::Transport(_) | Error::Deserialization { .. } => e,
                other => Error::Authentication {
                    message: other.to_string(),
                },
            })?;

        match result.as_str() {
            Some(id) if !id.is_empty() => Ok(Some(id.to_owned())),
            _ => Err(Error::Authentication {
                message: "login returned no session id".into(),
            }),
        }
    }
}
