//! The sealed-box state engine: a nonce-per-message authenticated-encryption
//! construction wrapping a time-bounded envelope. Every cookie in the system
//! (OAuth state and user sessions alike) goes through [`SealedBox::seal`] and
//! [`SealedBox::open`] — this is the only trust anchor in the proxy.

mod clock;
mod sealed_box;

pub use clock::{Clock, SystemClock};
#[cfg(test)]
pub use clock::FixedClock;
pub use sealed_box::{state_key_len, SealedBox};
