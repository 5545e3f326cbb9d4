//! Bearer credential verification
//!
//! Credentials are issued by the account service in the form
//! `<account_id>.<expiry_unix>.<hex hmac-sha256(account_id "." expiry)>`.
//! Without a configured secret the server runs in development mode and
//! trusts whatever account id a client announces.

use chrono::Utc;
use hmac::{Hmac, Mac};
use parley_shared::AccountId;
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Verifies bearer credentials against the shared secret
#[derive(Clone)]
pub struct TokenAuthority {
    secret: Option<Vec<u8>>,
}

impl TokenAuthority {
    /// Create an authority; `None` trusts announced identities
    pub fn new(secret: Option<&str>) -> Self {
        Self {
            secret: secret.map(|s| s.as_bytes().to_vec()),
        }
    }

    /// Whether credentials are actually checked
    pub fn is_enforcing(&self) -> bool {
        self.secret.is_some()
    }

    /// Issue a credential valid for `ttl_seconds`
    ///
    /// Returns `None` in development mode, where no credential is needed.
    pub fn issue(&self, account: &AccountId, ttl_seconds: i64) -> Option<String> {
        let secret = self.secret.as_ref()?;
        let expiry = Utc::now().timestamp() + ttl_seconds;
        let signature = sign(secret, account.as_str(), expiry)?;
        Some(format!("{}.{}.{}", account, expiry, hex::encode(signature)))
    }

    /// Resolve a bearer credential to the account it was issued for
    ///
    /// In development mode a bare account id is accepted as the credential.
    /// Only a well-formed credential (numeric expiry, hex signature) is
    /// unwrapped there; anything else is taken as the id itself.
    pub fn authenticate(&self, token: &str) -> Option<AccountId> {
        let Some(secret) = self.secret.as_ref() else {
            let account = split_token(token)
                .filter(|(_, expiry, signature)| {
                    expiry.parse::<i64>().is_ok() && hex::decode(signature).is_ok()
                })
                .map_or(token, |(account, _, _)| account);
            return AccountId::new(account).ok();
        };

        let (account, expiry, signature) = split_token(token)?;
        let expiry: i64 = expiry.parse().ok()?;
        if expiry < Utc::now().timestamp() {
            return None;
        }
        let provided = hex::decode(signature).ok()?;
        let expected = sign(secret, account, expiry)?;
        if !bool::from(expected.as_slice().ct_eq(&provided)) {
            return None;
        }
        AccountId::new(account).ok()
    }

    /// Check an `identify` announcement
    pub fn verify_identity(&self, account: &AccountId, token: Option<&str>) -> bool {
        if !self.is_enforcing() {
            return true;
        }
        token
            .and_then(|t| self.authenticate(t))
            .is_some_and(|authenticated| &authenticated == account)
    }
}

/// Split from the right so account ids may contain dots
fn split_token(token: &str) -> Option<(&str, &str, &str)> {
    let mut parts = token.rsplitn(3, '.');
    let signature = parts.next()?;
    let expiry = parts.next()?;
    let account = parts.next()?;
    Some((account, expiry, signature))
}

fn sign(secret: &[u8], account: &str, expiry: i64) -> Option<Vec<u8>> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret).ok()?;
    mac.update(account.as_bytes());
    mac.update(b".");
    mac.update(expiry.to_string().as_bytes());
    Some(mac.finalize().into_bytes().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> AccountId {
        AccountId::new(s).unwrap()
    }

    #[test]
    fn test_issued_token_authenticates() {
        let auth = TokenAuthority::new(Some("s3cret"));
        let token = auth.issue(&id("alice.smith"), 60).unwrap();
        assert_eq!(auth.authenticate(&token), Some(id("alice.smith")));
        assert!(auth.verify_identity(&id("alice.smith"), Some(&token)));
        assert!(!auth.verify_identity(&id("bob"), Some(&token)));
        assert!(!auth.verify_identity(&id("alice.smith"), None));
    }

    #[test]
    fn test_forged_and_expired_tokens_rejected() {
        let auth = TokenAuthority::new(Some("s3cret"));
        let other = TokenAuthority::new(Some("different"));
        let forged = other.issue(&id("alice"), 60).unwrap();
        assert_eq!(auth.authenticate(&forged), None);

        let expired = auth.issue(&id("alice"), -5).unwrap();
        assert_eq!(auth.authenticate(&expired), None);

        assert_eq!(auth.authenticate("alice"), None);
        assert_eq!(auth.authenticate("alice.123.zz"), None);
    }

    #[test]
    fn test_development_mode_trusts_announced_ids() {
        let auth = TokenAuthority::new(None);
        assert!(!auth.is_enforcing());
        assert!(auth.issue(&id("alice"), 60).is_none());
        assert_eq!(auth.authenticate("alice"), Some(id("alice")));
        assert!(auth.verify_identity(&id("alice"), None));
    }

    #[test]
    fn test_development_mode_keeps_dotted_ids_whole() {
        let auth = TokenAuthority::new(None);
        assert_eq!(auth.authenticate("first.last.x"), Some(id("first.last.x")));
        assert_eq!(auth.authenticate("a.b.c.d"), Some(id("a.b.c.d")));
        assert_eq!(auth.authenticate("first.last"), Some(id("first.last")));

        // A credential issued elsewhere still resolves to its account
        let issued = TokenAuthority::new(Some("s3cret"))
            .issue(&id("first.last"), 60)
            .unwrap();
        assert_eq!(auth.authenticate(&issued), Some(id("first.last")));
    }
}
