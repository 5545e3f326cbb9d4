//! Local key storage
//!
//! The account key pair is kept in the data directory, encrypted with
//! Argon2id + AES-256-GCM so it is safe at rest. A wrong password is an
//! error; the vault never silently replaces an existing key.

use parley_shared::{export_public, fingerprint, AccountId, AccountKeyPair, ProfileDirectory};
use std::path::PathBuf;
use tracing::{info, warn};

use crate::error::Result;

const KEY_FILE: &str = "account.key";

pub struct KeyVault {
    data_dir: PathBuf,
}

impl KeyVault {
    pub fn with_dir(data_dir: PathBuf) -> Self {
        info!("KeyVault: data_dir={}", data_dir.display());
        Self { data_dir }
    }

    fn path(&self) -> PathBuf {
        self.data_dir.join(KEY_FILE)
    }

    /// Encrypt and write the key pair
    pub async fn store(&self, pair: &AccountKeyPair, password: &str) -> Result<()> {
        let encrypted = parley_shared::secure_store(pair, password)?;
        tokio::fs::create_dir_all(&self.data_dir).await?;
        let path = self.path();
        tokio::fs::write(&path, &encrypted).await?;
        info!("Key pair stored at {} ({} bytes)", path.display(), encrypted.len());
        Ok(())
    }

    /// Read and decrypt the key pair
    pub async fn load(&self, password: &str) -> Result<AccountKeyPair> {
        let encrypted = tokio::fs::read(self.path()).await?;
        let pair = parley_shared::secure_load(&encrypted, password)?;
        info!("Key pair {} loaded", fingerprint(&pair.public_key()));
        Ok(pair)
    }

    pub fn has_key(&self) -> bool {
        self.path().exists()
    }

    /// Load the stored pair, generating and storing one on first use
    ///
    /// The flag is true when the pair was just created and its public half
    /// still has to be published.
    pub async fn load_or_create(&self, password: &str) -> Result<(AccountKeyPair, bool)> {
        if self.has_key() {
            return Ok((self.load(password).await?, false));
        }
        let pair = parley_shared::generate_key_pair();
        self.store(&pair, password).await?;
        info!("Generated key pair {}", fingerprint(&pair.public_key()));
        Ok((pair, true))
    }

    /// Load or create the pair and make sure the profile carries its public key
    ///
    /// Publishing is retried on every start until the profile matches. A
    /// failed publish is logged; peers fall back to unencrypted sends until
    /// it succeeds.
    pub async fn bootstrap<P: ProfileDirectory + ?Sized>(
        &self,
        password: &str,
        me: &AccountId,
        profiles: &P,
    ) -> Result<AccountKeyPair> {
        let (pair, created) = self.load_or_create(password).await?;
        let document = export_public(&pair.public_key());

        let published = if created {
            None
        } else {
            match profiles.fetch_public_key(me).await {
                Ok(published) => published,
                Err(e) => {
                    warn!("Could not read published key for {}: {}", me.short(), e);
                    None
                }
            }
        };

        if published.as_deref() != Some(document.as_str()) {
            match profiles.publish_public_key(me, &document).await {
                Ok(()) => info!("Published public key {}", fingerprint(&pair.public_key())),
                Err(e) => warn!("Failed to publish public key: {}", e),
            }
        }
        Ok(pair)
    }
}
