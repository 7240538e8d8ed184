use thiserror::Error;

/// Terminal client-manager failures.
///
/// Transient transport trouble never surfaces here; it shows up as the
/// `Reconnecting` state while the retry policy runs.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Every attempt in the retry budget failed.
    #[error("gateway connection failed after {attempts} attempt(s)")]
    ConnectFailed { attempts: u32 },
}
