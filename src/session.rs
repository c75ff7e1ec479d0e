use serde::{Deserialize, Serialize};
use std::fmt;

/// Short room code shared by everyone in a session; the discovery namespace
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl SessionId {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Who this client is inside a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub session: SessionId,
    pub user: UserId,
}

impl LocalIdentity {
    pub fn new(session: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            session: SessionId::new(session),
            user: UserId::new(user),
        }
    }

    /// Name of the local transport endpoint
    pub fn endpoint_id(&self) -> String {
        endpoint_id(self.session.as_str(), self.user.as_str())
    }
}

pub fn endpoint_id(session: &str, user: &str) -> String {
    format!("{session}-{user}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_is_session_then_user() {
        let me = LocalIdentity::new("123456", "alice");
        assert_eq!(me.endpoint_id(), "123456-alice");
        assert_eq!(me.session.to_string(), "123456");
    }
}
