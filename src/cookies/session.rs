use serde::{Deserialize, Serialize};

/// The authenticated user's identity and authorization flag. Sealed into the
/// session cookie on [`Authorize`](super::CookieStore::authorize), never
/// mutated after creation — a changed field means a new `Session` is sealed
/// and the old cookie is overwritten wholesale.
#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub user: String,
    pub authorized: bool,
    pub expires_at: i64,
}

impl Session {
    /// A session claiming `authorized` with no `user` is malformed and must
    /// never be trusted, however it got constructed.
    pub fn is_authorized(&self) -> bool {
        self.authorized && !self.user.is_empty()
    }
}
