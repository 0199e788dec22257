//! Admin authorization.
//!
//! Admin-only operations take an [`AdminCapability`]. The only way to get one
//! is [`AdminAuthorizer::authorize`], so the token check happens once at the
//! boundary and the reviewer identity travels with the capability.

use sha2::{Digest, Sha256};
use tracing::warn;

use crate::errors::ServiceError;

/// Proof that the caller presented a valid admin token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminCapability {
    reviewer: String,
}

impl AdminCapability {
    /// Identity recorded as `reviewed_by` on cancellation requests.
    pub fn reviewer(&self) -> &str {
        &self.reviewer
    }
}

#[derive(Clone)]
pub struct AdminAuthorizer {
    token_digests: Vec<[u8; 32]>,
}

fn digest(token: &str) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(token.as_bytes()));
    out
}

fn constant_time_eq(a: &[u8; 32], b: &[u8; 32]) -> bool {
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

impl AdminAuthorizer {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let token_digests = tokens
            .into_iter()
            .map(|t| t.as_ref().trim().to_string())
            .filter(|t| !t.is_empty())
            .map(|t| digest(&t))
            .collect();
        Self { token_digests }
    }

    pub fn authorize(&self, token: &str, reviewer: &str) -> Result<AdminCapability, ServiceError> {
        let reviewer = reviewer.trim();
        if reviewer.is_empty() {
            return Err(ServiceError::ValidationError(
                "Reviewer identity is required".to_string(),
            ));
        }

        let presented = digest(token.trim());
        let matched = self
            .token_digests
            .iter()
            .fold(false, |found, known| found | constant_time_eq(known, &presented));
        if !matched {
            warn!(reviewer, "Admin token rejected");
            return Err(ServiceError::Forbidden(
                "Admin privileges required".to_string(),
            ));
        }

        Ok(AdminCapability {
            reviewer: reviewer.to_string(),
        })
    }
}
