use bytes::Bytes;
use hmac::{Hmac, Mac};
use http::HeaderMap;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use std::net::IpAddr;
use subtle::ConstantTimeEq;

use crate::models::ServiceIntegration;
use crate::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Inbound webhook as delivered by the transport.
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    pub method: String,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Peer address of the connection, when the transport knows it.
    pub remote_addr: Option<IpAddr>,
}

impl WebhookRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            headers: HeaderMap::new(),
            body: body.into(),
            remote_addr: None,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Why a webhook was refused. Never collapsed into a generic failure.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    MissingSignature,
    MissingNonce,
    InvalidSignature,
    AddressNotAllowed,
    MissingSharedSecret,
    InvalidSharedSecret,
}

impl RejectionReason {
    pub fn code(&self) -> &'static str {
        match self {
            RejectionReason::MissingSignature => "missing_signature",
            RejectionReason::MissingNonce => "missing_nonce",
            RejectionReason::InvalidSignature => "invalid_signature",
            RejectionReason::AddressNotAllowed => "address_not_allowed",
            RejectionReason::MissingSharedSecret => "missing_shared_secret",
            RejectionReason::InvalidSharedSecret => "invalid_shared_secret",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            RejectionReason::AddressNotAllowed => 403,
            _ => 401,
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Outcome of `validate_webhook`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookVerdict {
    pub accept: bool,
    pub http_status: u16,
    pub reason: Option<RejectionReason>,
}

impl WebhookVerdict {
    pub fn accepted() -> Self {
        Self {
            accept: true,
            http_status: 200,
            reason: None,
        }
    }

    pub fn rejected(reason: RejectionReason) -> Self {
        Self {
            accept: false,
            http_status: reason.http_status(),
            reason: Some(reason),
        }
    }

    pub fn into_result(self) -> Result<()> {
        match self.reason {
            Some(reason) if !self.accept => Err(Error::ValidationRejected(reason)),
            _ => Ok(()),
        }
    }
}

/// How an adapter authenticates its inbound webhooks.
///
/// Secrets come from the integration's `webhook_secret`.
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookValidation {
    /// Accept everything (origin-trusted or synchronous-protocol sources).
    None,
    /// Compare a header value against the shared secret.
    SharedSecret { header: String },
    /// HMAC-SHA256 over `METHOD\nPATH\nNONCE\n` followed by the raw body.
    HmacSignature {
        signature_header: String,
        nonce_header: String,
    },
    /// Accept only when the peer or first forwarded-for address is in `blocks`.
    IpAllowList {
        blocks: Vec<IpNet>,
        forwarded_header: Option<String>,
    },
}

impl WebhookValidation {
    pub fn needs_secret(&self) -> bool {
        matches!(
            self,
            WebhookValidation::SharedSecret { .. } | WebhookValidation::HmacSignature { .. }
        )
    }

    /// Parses allow-list entries; bare addresses become host-length prefixes.
    pub fn ip_allow_list(entries: &[&str], forwarded_header: Option<&str>) -> Result<Self> {
        let mut blocks = Vec::with_capacity(entries.len());
        for entry in entries {
            let net = if entry.contains('/') {
                entry
                    .parse::<IpNet>()
                    .map_err(|e| Error::InvalidInput(format!("invalid CIDR '{entry}': {e}")))?
            } else {
                let ip = entry
                    .parse::<IpAddr>()
                    .map_err(|e| Error::InvalidInput(format!("invalid IP '{entry}': {e}")))?;
                IpNet::from(ip)
            };
            blocks.push(net);
        }
        Ok(WebhookValidation::IpAllowList {
            blocks,
            forwarded_header: forwarded_header.map(str::to_string),
        })
    }

    #[tracing::instrument(level = "debug", skip_all, fields(integration = %integration.id))]
    pub fn validate(&self, integration: &ServiceIntegration, request: &WebhookRequest) -> WebhookVerdict {
        let outcome = match self {
            WebhookValidation::None => Ok(()),
            WebhookValidation::SharedSecret { header } => {
                check_shared_secret(integration.webhook_secret.as_deref(), request.header(header))
            }
            WebhookValidation::HmacSignature {
                signature_header,
                nonce_header,
            } => check_signature(
                integration.webhook_secret.as_deref(),
                request,
                signature_header,
                nonce_header,
            ),
            WebhookValidation::IpAllowList {
                blocks,
                forwarded_header,
            } => check_address(blocks, request, forwarded_header.as_deref()),
        };
        match outcome {
            Ok(()) => WebhookVerdict::accepted(),
            Err(reason) => {
                tracing::warn!(reason = %reason, "webhook rejected");
                WebhookVerdict::rejected(reason)
            }
        }
    }
}

fn check_shared_secret(
    expected: Option<&str>,
    provided: Option<&str>,
) -> std::result::Result<(), RejectionReason> {
    let Some(provided) = provided.map(str::trim).filter(|s| !s.is_empty()) else {
        return Err(RejectionReason::MissingSharedSecret);
    };
    let Some(expected) = expected.filter(|s| !s.is_empty()) else {
        return Err(RejectionReason::InvalidSharedSecret);
    };
    if provided.len() == expected.len() && bool::from(provided.as_bytes().ct_eq(expected.as_bytes()))
    {
        Ok(())
    } else {
        Err(RejectionReason::InvalidSharedSecret)
    }
}

fn check_signature(
    secret: Option<&str>,
    request: &WebhookRequest,
    signature_header: &str,
    nonce_header: &str,
) -> std::result::Result<(), RejectionReason> {
    let present = |name: &str| request.header(name).map(str::trim).filter(|s| !s.is_empty());
    let Some(signature) = present(signature_header) else {
        return Err(RejectionReason::MissingSignature);
    };
    let Some(nonce) = present(nonce_header) else {
        return Err(RejectionReason::MissingNonce);
    };
    let Some(secret) = secret.filter(|s| !s.is_empty()) else {
        return Err(RejectionReason::InvalidSignature);
    };

    let sig_hex = signature.strip_prefix("sha256=").unwrap_or(signature);
    let provided = hex::decode(sig_hex).map_err(|_| RejectionReason::InvalidSignature)?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| RejectionReason::InvalidSignature)?;
    mac.update(&canonical_request(&request.method, &request.path, nonce));
    mac.update(&request.body);
    mac.verify_slice(&provided)
        .map_err(|_| RejectionReason::InvalidSignature)
}

fn check_address(
    blocks: &[IpNet],
    request: &WebhookRequest,
    forwarded_header: Option<&str>,
) -> std::result::Result<(), RejectionReason> {
    let forwarded = forwarded_header
        .and_then(|h| request.header(h))
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse::<IpAddr>().ok());

    let allowed = [request.remote_addr, forwarded]
        .into_iter()
        .flatten()
        .any(|ip| blocks.iter().any(|net| net.contains(&ip)));
    if allowed {
        Ok(())
    } else {
        Err(RejectionReason::AddressNotAllowed)
    }
}

fn canonical_request(method: &str, path: &str, nonce: &str) -> Vec<u8> {
    format!("{}\n{}\n{}\n", method.to_ascii_uppercase(), path, nonce).into_bytes()
}

/// Compute the signature header value (`sha256=<hex>`) a sender attaches.
pub fn sign_request(secret: &str, method: &str, path: &str, nonce: &str, body: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| Error::InvalidInput(format!("invalid hmac key: {e}")))?;
    mac.update(&canonical_request(method, path, nonce));
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}
