//! Customized unified error type.

use std::fmt;
use std::io;
use std::net;

/// Customized error type for lodestone.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct LodestoneError(pub String);

impl LodestoneError {
    /// Constructs an error from any printable message.
    pub fn msg(m: impl ToString) -> Self {
        LodestoneError(m.to_string())
    }
}

impl fmt::Display for LodestoneError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

impl std::error::Error for LodestoneError {}

// Helper macro for saving boiler-plate `impl From<T>`s for transparent
// conversion from various common error types to `LodestoneError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for LodestoneError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                LodestoneError(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(net::AddrParseError);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(toml::ser::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(tokio::task::JoinError);
