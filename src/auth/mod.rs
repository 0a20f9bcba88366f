//! Device identities and the credentials they authenticate with
//!
//! Credentials are capability variants rather than a class hierarchy: a symmetric key signs
//! tokens in software, a hardware signer signs them elsewhere, a provider hands out finished
//! tokens, and X.509 authenticates at the TLS layer with no token at all.

pub mod sas;

pub use sas::{RenewalMode, SasToken, SasTokenLifecycle, SAS_TOKEN_PREFIX};

use crate::error::TransportResult;
use std::fmt;
use std::sync::Arc;

/// Hub host plus the device (and optional module) the credential belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceIdentity {
    pub hostname: String,
    pub device_id: String,
    pub module_id: Option<String>,
}

impl DeviceIdentity {
    pub fn new(hostname: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            device_id: device_id.into(),
            module_id: None,
        }
    }

    pub fn with_module(mut self, module_id: impl Into<String>) -> Self {
        self.module_id = Some(module_id.into());
        self
    }

    /// `{hostname}/devices/{deviceId}[/modules/{moduleId}]`, the audience of the SAS token
    pub fn resource_uri(&self) -> String {
        match &self.module_id {
            Some(module_id) => format!(
                "{}/devices/{}/modules/{}",
                self.hostname, self.device_id, module_id
            ),
            None => format!("{}/devices/{}", self.hostname, self.device_id),
        }
    }

    /// `deviceId[/moduleId]`, unique per logical client on one connection
    pub fn session_key(&self) -> String {
        match &self.module_id {
            Some(module_id) => format!("{}/{}", self.device_id, module_id),
            None => self.device_id.clone(),
        }
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.session_key(), self.hostname)
    }
}

/// Signs SAS payloads with a key that never leaves a hardware module
pub trait TokenSigner: Send + Sync + fmt::Debug {
    fn sign(&self, payload: &[u8]) -> TransportResult<Vec<u8>>;
}

/// Supplies complete SAS tokens; the client never generates or renews them itself
pub trait SasTokenProvider: Send + Sync + fmt::Debug {
    fn sas_token(&self) -> TransportResult<String>;
}

/// How a device authenticates
#[derive(Clone)]
pub enum Credential {
    /// Base64-encoded shared access key
    SymmetricKey(String),
    Hardware(Arc<dyn TokenSigner>),
    Provided(Arc<dyn SasTokenProvider>),
    /// Client certificate presented during the TLS handshake
    X509,
}

impl Credential {
    pub fn is_symmetric_key(&self) -> bool {
        matches!(self, Credential::SymmetricKey(_))
    }

    /// Whether the credential authenticates with SAS tokens at all
    pub fn uses_sas(&self) -> bool {
        !matches!(self, Credential::X509)
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Credential::SymmetricKey(_) => "symmetric_key",
            Credential::Hardware(_) => "hardware",
            Credential::Provided(_) => "provided_token",
            Credential::X509 => "x509",
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::SymmetricKey(_) => f.write_str("SymmetricKey(***)"),
            Credential::Hardware(signer) => f.debug_tuple("Hardware").field(signer).finish(),
            Credential::Provided(provider) => f.debug_tuple("Provided").field(provider).finish(),
            Credential::X509 => f.write_str("X509"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_uri_and_session_key() {
        let device = DeviceIdentity::new("hub.azure-devices.net", "dev1");
        assert_eq!(device.resource_uri(), "hub.azure-devices.net/devices/dev1");
        assert_eq!(device.session_key(), "dev1");

        let module = device.with_module("filter");
        assert_eq!(
            module.resource_uri(),
            "hub.azure-devices.net/devices/dev1/modules/filter"
        );
        assert_eq!(module.session_key(), "dev1/filter");
        assert_eq!(module.to_string(), "dev1/filter@hub.azure-devices.net");
    }

    #[test]
    fn test_credential_debug_hides_key() {
        let credential = Credential::SymmetricKey("c2VjcmV0".to_string());
        let rendered = format!("{credential:?}");
        assert!(!rendered.contains("c2VjcmV0"));
        assert!(credential.is_symmetric_key());
        assert!(credential.uses_sas());
        assert!(!Credential::X509.uses_sas());
    }
}
