use async_trait::async_trait;
use bytes::{BufMut, BytesMut};

use crate::errors::CredentialsError;

/// One authentication exchange with a server.
#[async_trait]
pub trait AuthSession: Send + Sync {
    /// To handle an authentication challenge initiated by the server.
    /// The information contained in the token parameter is authentication protocol specific.
    /// It may be NULL or empty.
    async fn evaluate_challenge(
        &mut self,
        token: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>, CredentialsError>;

    /// To handle the success phase of exchange.
    /// The token parameters contain information that may be used to finalize the request.
    async fn success(&mut self, token: Option<&[u8]>) -> Result<(), CredentialsError>;
}

/// Produces credentials when a server demands authentication.
///
/// A new [`AuthSession`] is started for every connection that needs it.
/// [`PlainTextAuthenticator`] is the default implementation.
#[async_trait]
pub trait AuthProvider: Sync + Send {
    /// Returns the initial `AUTH_RESPONSE` token and the session that
    /// answers any further challenges. `authenticator_name` is the class
    /// name sent by the server in its `AUTHENTICATE` response.
    async fn start_authentication_session(
        &self,
        authenticator_name: &str,
    ) -> Result<(Option<Vec<u8>>, Box<dyn AuthSession>), CredentialsError>;
}

struct PlainTextAuthSession;

#[async_trait]
impl AuthSession for PlainTextAuthSession {
    async fn evaluate_challenge(
        &mut self,
        _token: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>, CredentialsError> {
        Err(CredentialsError(
            "Challenges are not expected during PlainTextAuthentication".to_string(),
        ))
    }

    async fn success(&mut self, _token: Option<&[u8]>) -> Result<(), CredentialsError> {
        Ok(())
    }
}

/// Authenticates with a static username and password using the SASL PLAIN
/// layout: `\0username\0password`.
#[derive(Clone)]
pub struct PlainTextAuthenticator {
    username: String,
    password: String,
}

impl PlainTextAuthenticator {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        PlainTextAuthenticator {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }
}

impl std::fmt::Debug for PlainTextAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlainTextAuthenticator")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[async_trait]
impl AuthProvider for PlainTextAuthenticator {
    async fn start_authentication_session(
        &self,
        _authenticator_name: &str,
    ) -> Result<(Option<Vec<u8>>, Box<dyn AuthSession>), CredentialsError> {
        let username_as_bytes = self.username.as_bytes();
        let password_as_bytes = self.password.as_bytes();
        if username_as_bytes.contains(&0) || password_as_bytes.contains(&0) {
            return Err(CredentialsError(
                "Username and password must not contain NUL bytes".to_string(),
            ));
        }

        let mut response =
            BytesMut::with_capacity(2 + username_as_bytes.len() + password_as_bytes.len());
        response.put_u8(0);
        response.put_slice(username_as_bytes);
        response.put_u8(0);
        response.put_slice(password_as_bytes);

        Ok((Some(response.to_vec()), Box::new(PlainTextAuthSession)))
    }
}
