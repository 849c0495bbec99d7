mod gate;
mod key;
mod middleware;
pub mod paseto;

pub use gate::{API_SESSION_TTL, AuthGate};
pub use key::{Credential, LEGACY_MARKER, generate_credential, parse_credential};
pub use middleware::{RequireSession, Usage, account_usage};
