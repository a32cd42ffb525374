//! Secret types for protecting sensitive values from accidental logging.
//!
//! Re-exports the [`secrecy`] types used for the admin token signing secret
//! and any other credential that flows through configuration. `Debug` output
//! of these types is redacted, so structs holding them can derive `Debug`
//! safely.
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! let secret = SecretString::from("signing-key");
//! assert!(!format!("{secret:?}").contains("signing-key"));
//! assert_eq!(secret.expose_secret(), "signing-key");
//! ```

pub use secrecy::{ExposeSecret, SecretBox, SecretString};
