use serde::{Deserialize, Serialize};

/// JWT claims for authenticated requests. `sub` is the user id the identity
/// provider issued the token for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}
