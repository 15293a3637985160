//! Identity of a remote endpoint and credential pair

use std::fmt;

/// One logical remote endpoint together with the credentials used on it.
///
/// Equality and hashing cover all four fields, so the same host reached with
/// two different accounts is tracked as two identities.
///
/// # Examples
///
/// ```
/// use esox_connection_manager::ConnectionIdentity;
///
/// let identity = ConnectionIdentity::new("127.0.0.1", 2222, "test", "test");
/// assert_eq!(identity.to_string(), "test@127.0.0.1:2222");
/// assert!(!format!("{:?}", identity).contains("password: \"test\""));
/// ```
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ConnectionIdentity {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl ConnectionIdentity {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Display for ConnectionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.host, self.port)
    }
}

// Never print the password, errors and logs carry identities around.
impl fmt::Debug for ConnectionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionIdentity")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}
