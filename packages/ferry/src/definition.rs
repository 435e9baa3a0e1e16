//! Backup definition model, as read by the transports.
//!
//! Definitions are produced by the configuration loader; transports only ever
//! read them. The shape mirrors one entry of the controller configuration:
//! which collection the backup belongs to, how to reach the catalogue server
//! and which key material encrypts the stream.

use serde::Deserialize;

/// A single configured backup: collection identity, server access and
/// encryption material. Opaque to the transports except for the accessors.
#[derive(Clone, Debug, Deserialize)]
pub struct BackupDefinition {
    name: String,
    access: ServerAccess,
    collection_id: String,
    encryption: Encryption,
}

impl BackupDefinition {
    pub fn new(
        name: impl Into<String>,
        access: ServerAccess,
        collection_id: impl Into<String>,
        encryption: Encryption,
    ) -> Self {
        Self {
            name: name.into(),
            access,
            collection_id: collection_id.into(),
            encryption,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn access(&self) -> &ServerAccess {
        &self.access
    }

    pub fn collection_id(&self) -> &str {
        &self.collection_id
    }

    pub fn encryption(&self) -> &Encryption {
        &self.encryption
    }
}

/// Backup catalogue server coordinates.
#[derive(Clone, Debug, Deserialize)]
pub struct ServerAccess {
    url: String,
    token: String,
}

impl ServerAccess {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

/// Encryption identity for a definition.
///
/// Key paths point at files on the controller host; either may be empty when
/// the definition only uses one half of the pair (e.g. public-key-only
/// encryption for append-only backups).
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Encryption {
    #[serde(default)]
    passphrase: String,
    #[serde(default)]
    recipient: String,
    #[serde(default)]
    public_key_path: String,
    #[serde(default)]
    private_key_path: String,
}

impl Encryption {
    pub fn new(
        passphrase: impl Into<String>,
        recipient: impl Into<String>,
        public_key_path: impl Into<String>,
        private_key_path: impl Into<String>,
    ) -> Self {
        Self {
            passphrase: passphrase.into(),
            recipient: recipient.into(),
            public_key_path: public_key_path.into(),
            private_key_path: private_key_path.into(),
        }
    }

    pub fn passphrase(&self) -> &str {
        &self.passphrase
    }

    pub fn recipient(&self) -> &str {
        &self.recipient
    }

    pub fn public_key_path(&self) -> &str {
        &self.public_key_path
    }

    pub fn private_key_path(&self) -> &str {
        &self.private_key_path
    }
}
