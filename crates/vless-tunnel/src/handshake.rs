//! Identity greeting
//!
//! The only client-side framing of the protocol: written once, right after
//! the transport is ready, before any packet is relayed.
//!
//! ```text
//! +----------------------------+----------+
//! | identity (16, RFC 4122)    | 00 00    |
//! +----------------------------+----------+
//! ```

use crate::config::TunnelConfiguration;
use crate::transport::TransportHandle;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;
use uuid::Uuid;

/// Length of the greeting on the wire
pub const GREETING_LEN: usize = 18;

/// Encode the greeting for an identity
pub fn encode_greeting(identity: &Uuid) -> [u8; GREETING_LEN] {
    let mut frame = [0u8; GREETING_LEN];
    // as_bytes() is the RFC 4122 (big-endian) layout on every platform
    frame[..16].copy_from_slice(identity.as_bytes());
    frame
}

/// Write the greeting to a freshly negotiated transport
///
/// At most once per handle: a second call fails without writing.
pub async fn greet<S>(
    handle: &mut TransportHandle<S>,
    config: &TunnelConfiguration,
) -> Result<(), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if handle.is_greeted() {
        return Err(HandshakeError::AlreadySent);
    }

    let frame = encode_greeting(&config.identity);
    handle
        .writer()
        .send(&frame)
        .await
        .map_err(|e| HandshakeError::WriteFailed(e.to_string()))?;
    handle.mark_greeted();

    debug!("Greeting sent to {}", handle.peer());
    Ok(())
}

/// Greeting errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    #[error("Failed to write greeting: {0}")]
    WriteFailed(String),

    #[error("Greeting already sent on this transport")]
    AlreadySent,
}
