//! Top-level client factory.
//!
//! A [`Client`] owns the HTTP transport and hands out [`Session`] handles.
//! Sessions are cached by id, so asking for the same session twice yields
//! handles sharing one producer identity and one canonical log.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use secrecy::SecretString;
use starcite_types::SessionId;
use starcite_types::api::v1::{
    CreateSessionRequest, IssueSessionTokenRequest, IssueSessionTokenResponse,
    ListSessionsResponse, SessionRecord,
};
use tracing::instrument;

use crate::error::Error;
use crate::http::HttpTransport;
use crate::session::{ProducerIdentity, Session};
use crate::tail::WsAuth;

/// Configuration of a [`Client`].
#[derive(Clone)]
pub struct ClientConfig {
    /// Base URL of the Starcite server, `http(s)://host[:port][/v1]`.
    pub base_url: String,
    /// Long-lived API key.
    pub api_key: Option<SecretString>,
    /// Short-lived session token. Wins over the API key when both are set.
    pub session_token: Option<SecretString>,
    /// How tail sockets present their credential.
    pub ws_auth: WsAuth,
    /// Base URL of the token issuer. Defaults to the `STARCITE_AUTH_URL`
    /// environment variable, then to `base_url`.
    pub auth_base_url: Option<String>,
}

impl ClientConfig {
    /// A config for the given base URL, reading `STARCITE_AUTH_URL` for the
    /// token-issuer override.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            session_token: None,
            ws_auth: WsAuth::default(),
            auth_base_url: std::env::var("STARCITE_AUTH_URL").ok(),
        }
    }

    /// Sets the API key.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(SecretString::from(api_key.into()));
        self
    }

    /// Sets the session token.
    pub fn with_session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(SecretString::from(token.into()));
        self
    }

    /// Selects the tail credential transport.
    pub fn with_ws_auth(mut self, ws_auth: WsAuth) -> Self {
        self.ws_auth = ws_auth;
        self
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.is_some())
            .field("session_token", &self.session_token.is_some())
            .field("ws_auth", &self.ws_auth)
            .finish()
    }
}

struct ClientInner {
    transport: Arc<HttpTransport>,
    auth_transport: Arc<HttpTransport>,
    ws_auth: WsAuth,
    sessions: Mutex<HashMap<SessionId, Session>>,
}

/// A Starcite client.
///
/// Cheap to clone; clones share the transport and the session cache.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("ws_auth", &self.inner.ws_auth)
            .finish()
    }
}

impl Client {
    /// Creates a client from the given configuration.
    ///
    /// # Errors
    /// [`Error::Config`] when a base URL is not `http(s)://`.
    pub fn new(config: ClientConfig) -> Result<Self, Error> {
        let bearer = config.session_token.clone().or_else(|| config.api_key.clone());
        let transport = Arc::new(HttpTransport::new(&config.base_url, bearer)?);
        let auth_transport = match &config.auth_base_url {
            // the issuer mints from the API key, never from a session token
            Some(auth_base_url) => Arc::new(HttpTransport::new(
                auth_base_url,
                config.api_key.clone(),
            )?),
            None => match &config.api_key {
                Some(api_key) => Arc::new(HttpTransport::new(
                    &config.base_url,
                    Some(api_key.clone()),
                )?),
                None => Arc::clone(&transport),
            },
        };
        Ok(Self {
            inner: Arc::new(ClientInner {
                transport,
                auth_transport,
                ws_auth: config.ws_auth,
                sessions: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// The normalized base URL this client talks to.
    pub fn base_url(&self) -> &str {
        self.inner.transport.base_url()
    }

    /// Creates a session.
    ///
    /// # Errors
    /// A session that already exists surfaces as [`Error::Api`] with code
    /// `session_exists`; see [`Error::is_session_exists`].
    #[instrument(level = "debug", skip_all)]
    pub async fn create_session(
        &self,
        request: CreateSessionRequest,
    ) -> Result<SessionRecord, Error> {
        self.inner.transport.post("/sessions", &request).await
    }

    /// Lists sessions, newest first.
    ///
    /// The metadata filter is encoded as repeated `metadata.<key>=<value>`
    /// query parameters; keys and values must be non-empty.
    #[instrument(level = "debug", skip_all)]
    pub async fn list_sessions(&self, query: ListSessionsQuery) -> Result<ListSessionsResponse, Error> {
        let mut params: Vec<(String, String)> = Vec::new();
        if let Some(limit) = query.limit {
            params.push(("limit".to_owned(), limit.to_string()));
        }
        if let Some(cursor) = query.cursor {
            params.push(("cursor".to_owned(), cursor));
        }
        for (key, value) in query.metadata {
            if key.is_empty() || value.is_empty() {
                return Err(Error::Config(
                    "metadata filter keys and values must be non-empty".to_owned(),
                ));
            }
            params.push((format!("metadata.{key}"), value));
        }
        self.inner.transport.get("/sessions", &params).await
    }

    /// Mints a short-lived session token from the API key.
    #[instrument(level = "debug", skip_all, fields(session = %request.session_id))]
    pub async fn issue_session_token(
        &self,
        request: IssueSessionTokenRequest,
    ) -> Result<IssueSessionTokenResponse, Error> {
        self.inner
            .auth_transport
            .post("/auth/session-tokens", &request)
            .await
    }

    /// Returns the session handle for `id`, creating and caching it on
    /// first use.
    pub fn session(&self, id: impl Into<SessionId>) -> Session {
        let id = id.into();
        let mut sessions = self.inner.sessions.lock();
        if let Some(session) = sessions.get(&id) {
            return session.clone();
        }
        let session = Session::new(
            id.clone(),
            Arc::clone(&self.inner.transport),
            self.inner.ws_auth,
            ProducerIdentity::generate(),
        );
        sessions.insert(id, session.clone());
        session
    }

    /// Like [`Client::session`], but with an injected producer identity —
    /// for processes that persist their identity across restarts. Replaces
    /// a cached handle for the same id.
    pub fn session_with_identity(
        &self,
        id: impl Into<SessionId>,
        identity: ProducerIdentity,
    ) -> Session {
        let id = id.into();
        let session = Session::new(
            id.clone(),
            Arc::clone(&self.inner.transport),
            self.inner.ws_auth,
            identity,
        );
        self.inner.sessions.lock().insert(id, session.clone());
        session
    }
}

/// Filters of [`Client::list_sessions`].
#[derive(Clone, Debug, Default)]
pub struct ListSessionsQuery {
    /// Page size.
    pub limit: Option<u32>,
    /// Opaque pagination cursor from a previous response.
    pub cursor: Option<String>,
    /// Metadata equality filters.
    pub metadata: Vec<(String, String)>,
}

#[cfg(test)]
mod tests;
