use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::fmt;

use crate::error::{AppError, Result};

// ==================== REQUEST KIND ====================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestKind {
    SiteAuthorization,
    TxSignSubstrate,
    TxSignEvm,
    TxSendEvm,
    NetworkAdd,
    WatchAsset,
    MetadataApprove,
    Encrypt,
    Decrypt,
}

impl RequestKind {
    pub fn all() -> [Self; 9] {
        [
            Self::SiteAuthorization,
            Self::TxSignSubstrate,
            Self::TxSignEvm,
            Self::TxSendEvm,
            Self::NetworkAdd,
            Self::WatchAsset,
            Self::MetadataApprove,
            Self::Encrypt,
            Self::Decrypt,
        ]
    }

    /// Prefix of every request id of this kind, e.g. `auth.3`.
    pub fn id_prefix(&self) -> &'static str {
        match self {
            Self::SiteAuthorization => "auth",
            Self::TxSignSubstrate => "substrate-sign",
            Self::TxSignEvm => "eth-sign",
            Self::TxSendEvm => "eth-send",
            Self::NetworkAdd => "eth-network-add",
            Self::WatchAsset => "eth-watchasset",
            Self::MetadataApprove => "metadata",
            Self::Encrypt => "encrypt",
            Self::Decrypt => "decrypt",
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::SiteAuthorization => "site-authorization",
            Self::TxSignSubstrate => "tx-sign-substrate",
            Self::TxSignEvm => "tx-sign-evm",
            Self::TxSendEvm => "tx-send-evm",
            Self::NetworkAdd => "network-add",
            Self::WatchAsset => "watch-asset",
            Self::MetadataApprove => "metadata-approve",
            Self::Encrypt => "encrypt",
            Self::Decrypt => "decrypt",
        };
        f.write_str(name)
    }
}

// ==================== PAYLOAD ====================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum RequestPayload {
    SiteAuthorization {
        #[serde(default)]
        eth: bool,
    },
    TxSignSubstrate {
        address: String,
        payload: serde_json::Value,
    },
    TxSignEvm {
        address: String,
        method: String,
        params: serde_json::Value,
    },
    TxSendEvm {
        from: String,
        tx: serde_json::Value,
    },
    NetworkAdd {
        chain_id: String,
        network: serde_json::Value,
    },
    WatchAsset {
        chain_id: String,
        contract_address: String,
        symbol: Option<String>,
        decimals: Option<u8>,
    },
    MetadataApprove {
        genesis_hash: String,
        spec_version: u32,
    },
    Encrypt {
        address: String,
        message: String,
    },
    Decrypt {
        address: String,
        message: String,
    },
}

impl RequestPayload {
    pub fn kind(&self) -> RequestKind {
        match self {
            Self::SiteAuthorization { .. } => RequestKind::SiteAuthorization,
            Self::TxSignSubstrate { .. } => RequestKind::TxSignSubstrate,
            Self::TxSignEvm { .. } => RequestKind::TxSignEvm,
            Self::TxSendEvm { .. } => RequestKind::TxSendEvm,
            Self::NetworkAdd { .. } => RequestKind::NetworkAdd,
            Self::WatchAsset { .. } => RequestKind::WatchAsset,
            Self::MetadataApprove { .. } => RequestKind::MetadataApprove,
            Self::Encrypt { .. } => RequestKind::Encrypt,
            Self::Decrypt { .. } => RequestKind::Decrypt,
        }
    }

    /// Key identifying "the same logical request" for `origin_url`.
    ///
    /// Authorization collapses on the site, asset/network requests on the
    /// site plus target, signing-style requests on the exact payload.
    pub fn dedup_key(&self, origin_url: &str) -> Result<String> {
        let site = origin_site(origin_url);
        let discriminator = match self {
            Self::SiteAuthorization { .. } => site,
            Self::NetworkAdd { chain_id, .. } => {
                format!("{}:{}", site, chain_id.trim().to_ascii_lowercase())
            }
            Self::WatchAsset {
                chain_id,
                contract_address,
                ..
            } => format!(
                "{}:{}:{}",
                site,
                chain_id.trim().to_ascii_lowercase(),
                contract_address.trim().to_ascii_lowercase()
            ),
            Self::MetadataApprove {
                genesis_hash,
                spec_version,
            } => format!("{}:{}", genesis_hash.trim().to_ascii_lowercase(), spec_version),
            _ => format!("{}:{}", site, self.payload_digest()?),
        };

        if discriminator.trim_matches(':').is_empty() {
            return Err(AppError::BadRequest(
                "Request origin or target is empty".to_string(),
            ));
        }

        Ok(format!("{}:{}", self.kind().id_prefix(), discriminator))
    }

    // serde_json maps are ordered, so the encoding is canonical.
    fn payload_digest(&self) -> Result<String> {
        let bytes = serde_json::to_vec(self)?;
        Ok(hex::encode(Keccak256::digest(&bytes)))
    }
}

/// Lower-cased host of the origin, or the trimmed origin itself when it is
/// not a URL (extension-internal callers identify by name).
pub fn origin_site(origin_url: &str) -> String {
    let trimmed = origin_url.trim();
    url::Url::parse(trimmed)
        .ok()
        .and_then(|url| url.host_str().map(str::to_ascii_lowercase))
        .unwrap_or_else(|| trimmed.to_ascii_lowercase())
}

// ==================== PENDING REQUEST ====================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRequest {
    pub id: String,
    pub kind: RequestKind,
    pub origin_url: String,
    pub dedup_key: String,
    pub payload: RequestPayload,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub port_id: Option<String>,
}

/// Inbound request before the store assigns an id.
#[derive(Debug, Clone)]
pub struct NewRequest {
    pub origin_url: String,
    pub payload: RequestPayload,
    pub port_id: Option<String>,
}

impl NewRequest {
    pub fn new(origin_url: impl Into<String>, payload: RequestPayload) -> Self {
        Self {
            origin_url: origin_url.into(),
            payload,
            port_id: None,
        }
    }

    pub fn on_port(mut self, port_id: impl Into<String>) -> Self {
        self.port_id = Some(port_id.into());
        self
    }
}
