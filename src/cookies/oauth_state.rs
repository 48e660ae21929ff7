use serde::{Deserialize, Serialize};

/// Ephemeral state bound to an in-flight OAuth login, sealed into the
/// `state`/companion-cookie pair by [`CookieStore::create_state`](super::CookieStore::create_state)
/// and consumed exactly once by [`CookieStore::redeem_state`](super::CookieStore::redeem_state).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OAuthState {
    pub redirect_url: String,
}
