//! SAS token generation and renewal tracking
//!
//! Token format: `SharedAccessSignature sr={uri}&sig={signature}&se={expiry}` where the
//! signature is `base64(hmac_sha256(key, "{uri}\n{expiry}"))` and both the URI and the signature
//! are form-url-encoded.

use super::{Credential, DeviceIdentity};
use crate::error::{TransportError, TransportResult};
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;
use tracing::{debug, info};

pub const SAS_TOKEN_PREFIX: &str = "SharedAccessSignature";

type HmacSha256 = Hmac<Sha256>;

/// When a token is replaced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalMode {
    /// Replace the token on the live connection before it expires (AMQP CBS)
    Proactive,
    /// Reconnect with a fresh token once the old one has expired (MQTT, HTTPS)
    Reactive,
}

#[derive(Clone, PartialEq, Eq)]
pub struct SasToken {
    value: String,
    issued_at: DateTime<Utc>,
    expiry: DateTime<Utc>,
}

impl std::fmt::Debug for SasToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SasToken")
            .field("issued_at", &self.issued_at)
            .field("expiry", &self.expiry)
            .finish_non_exhaustive()
    }
}

fn url_encode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

impl SasToken {
    /// Sign a token for `resource_uri` with any signing capability
    pub fn generate<F>(
        resource_uri: &str,
        issued_at: DateTime<Utc>,
        ttl: Duration,
        sign: F,
    ) -> TransportResult<Self>
    where
        F: FnOnce(&[u8]) -> TransportResult<Vec<u8>>,
    {
        let ttl = ChronoDuration::from_std(ttl)
            .map_err(|e| TransportError::Security(format!("Invalid token lifetime: {e}")))?;
        let expiry = issued_at
            .checked_add_signed(ttl)
            .ok_or_else(|| TransportError::Security("Token expiry overflows".to_string()))?;
        let expiry_secs = expiry.timestamp();

        let encoded_uri = url_encode(resource_uri);
        let string_to_sign = format!("{encoded_uri}\n{expiry_secs}");
        let signature = general_purpose::STANDARD.encode(sign(string_to_sign.as_bytes())?);

        Ok(Self {
            value: format!(
                "{SAS_TOKEN_PREFIX} sr={encoded_uri}&sig={}&se={expiry_secs}",
                url_encode(&signature)
            ),
            issued_at,
            expiry: Utc
                .timestamp_opt(expiry_secs, 0)
                .single()
                .unwrap_or(expiry),
        })
    }

    /// Sign with a base64-encoded shared access key
    pub fn from_symmetric_key(
        resource_uri: &str,
        key_base64: &str,
        issued_at: DateTime<Utc>,
        ttl: Duration,
    ) -> TransportResult<Self> {
        let key = general_purpose::STANDARD
            .decode(key_base64.trim())
            .map_err(|e| TransportError::Security(format!("Shared access key is not base64: {e}")))?;

        Self::generate(resource_uri, issued_at, ttl, |payload| {
            let mut mac = HmacSha256::new_from_slice(&key)
                .map_err(|e| TransportError::Security(format!("Invalid shared access key: {e}")))?;
            mac.update(payload);
            Ok(mac.finalize().into_bytes().to_vec())
        })
    }

    /// Parse a finished token; only the `se` field is interpreted
    pub fn parse(value: &str, received_at: DateTime<Utc>) -> TransportResult<Self> {
        let fields = value
            .trim()
            .strip_prefix(SAS_TOKEN_PREFIX)
            .ok_or_else(|| {
                TransportError::Security(format!("Token does not start with {SAS_TOKEN_PREFIX}"))
            })?
            .trim_start();

        let expiry_secs = fields
            .split('&')
            .find_map(|field| field.strip_prefix("se="))
            .ok_or_else(|| TransportError::Security("Token has no se field".to_string()))?
            .parse::<i64>()
            .map_err(|e| TransportError::Security(format!("Token expiry is not numeric: {e}")))?;

        let expiry = Utc
            .timestamp_opt(expiry_secs, 0)
            .single()
            .ok_or_else(|| TransportError::Security("Token expiry out of range".to_string()))?;

        Ok(Self {
            value: value.trim().to_string(),
            issued_at: received_at.min(expiry),
            expiry,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn expiry(&self) -> DateTime<Utc> {
        self.expiry
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    /// A token is unusable from its expiry second onward
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiry
    }

    /// Percentage of the lifetime consumed at `now`, capped at 100
    pub fn elapsed_percent(&self, now: DateTime<Utc>) -> u8 {
        let lifetime = (self.expiry - self.issued_at).num_milliseconds();
        if lifetime <= 0 {
            return 100;
        }
        let elapsed = (now - self.issued_at).num_milliseconds().max(0);
        ((elapsed.saturating_mul(100)) / lifetime).min(100) as u8
    }
}

/// Current token of one device identity plus the rules for replacing it
#[derive(Debug)]
pub struct SasTokenLifecycle {
    identity: DeviceIdentity,
    credential: Credential,
    ttl: Duration,
    renewal_threshold_percent: u8,
    mode: RenewalMode,
    current: Option<SasToken>,
}

impl SasTokenLifecycle {
    pub fn new(
        identity: DeviceIdentity,
        credential: Credential,
        ttl: Duration,
        renewal_threshold_percent: u8,
        mode: RenewalMode,
    ) -> Self {
        Self {
            identity,
            credential,
            ttl,
            renewal_threshold_percent: renewal_threshold_percent.clamp(1, 99),
            mode,
            current: None,
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub fn renewal_mode(&self) -> RenewalMode {
        self.mode
    }

    pub fn current(&self) -> Option<&SasToken> {
        self.current.as_ref()
    }

    /// Only software and hardware signers produce new tokens without user involvement
    pub fn can_auto_renew(&self) -> bool {
        matches!(
            self.credential,
            Credential::SymmetricKey(_) | Credential::Hardware(_)
        )
    }

    /// True once the current token has consumed the renewal threshold of its lifetime
    pub fn is_renewal_necessary(&self, now: DateTime<Utc>) -> bool {
        if !self.can_auto_renew() {
            return false;
        }
        match &self.current {
            None => true,
            Some(token) => {
                token.is_expired_at(now)
                    || token.elapsed_percent(now) >= self.renewal_threshold_percent
            }
        }
    }

    pub fn has_expired(&self, now: DateTime<Utc>) -> bool {
        self.current
            .as_ref()
            .map(|token| token.is_expired_at(now))
            .unwrap_or(false)
    }

    /// Produce a new token and make it current
    pub fn renew(&mut self, now: DateTime<Utc>) -> TransportResult<&SasToken> {
        let resource_uri = self.identity.resource_uri();
        let token = match &self.credential {
            Credential::SymmetricKey(key) => {
                SasToken::from_symmetric_key(&resource_uri, key, now, self.ttl)?
            }
            Credential::Hardware(signer) => {
                SasToken::generate(&resource_uri, now, self.ttl, |payload| signer.sign(payload))?
            }
            Credential::Provided(provider) => SasToken::parse(&provider.sas_token()?, now)?,
            Credential::X509 => {
                return Err(TransportError::unsupported(
                    "X.509 authenticated devices have no SAS token",
                ))
            }
        };

        info!(
            device = %self.identity,
            expiry = %token.expiry(),
            credential = self.credential.kind_name(),
            "SAS token renewed"
        );
        Ok(&*self.current.insert(token))
    }

    /// Token to present when (re)opening a connection
    ///
    /// Returns `None` for X.509. A provided token that has already expired is a security error.
    pub fn prepare_for_open(&mut self, now: DateTime<Utc>) -> TransportResult<Option<String>> {
        if !self.credential.uses_sas() {
            return Ok(None);
        }

        if !self.can_auto_renew() {
            let (expired, expiry, value) = {
                let token = self.renew(now)?;
                (
                    token.is_expired_at(now),
                    token.expiry(),
                    token.as_str().to_string(),
                )
            };
            if expired {
                return Err(TransportError::TokenExpired(format!(
                    "Provided SAS token for {} expired at {expiry}",
                    self.identity
                )));
            }
            return Ok(Some(value));
        }

        if self.is_renewal_necessary(now) {
            self.renew(now)?;
        } else {
            debug!(device = %self.identity, "Reusing current SAS token");
        }
        Ok(self.current.as_ref().map(|token| token.as_str().to_string()))
    }
}
