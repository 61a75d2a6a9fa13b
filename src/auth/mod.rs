// Authentication module
// OAuth2 token lifecycle: redemption, persistence, renewal

mod clock;
mod codes;
mod credentials;
mod endpoint;
mod location;
mod manager;
mod store;
mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use codes::{is_plausible_code, RedeemedCodes, MAX_REDEEMED_CODES, MIN_CODE_LENGTH};
pub use credentials::keys;
pub use location::{has_auth_params, strip_auth_params, Navigator, RequestLocation, AUTH_QUERY_PARAMS};
pub use manager::TokenManager;
pub use store::{KeyValueStore, MemoryStore, SqliteStore};
pub use types::{preview, AccessToken, Credential, PermissionCheck, SessionStatus};
