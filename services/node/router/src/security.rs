//! Pluggable message verification.
//!
//! Every locally delivered message passes through a [`SecurityManager`]
//! before it reaches the dispatcher or a response stream. The default
//! [`NoopSecurity`] performs structural checks only; with the `tls` feature
//! the [`CertificateSecurity`] manager additionally pins the envelope sender
//! to the CN of the certificate carried in the signed wrapper.

use crate::RouterError;
use receptor_wire::{InnerEnvelope, SignedEnvelope};

/// Signs outgoing envelopes and verifies incoming ones.
pub trait SecurityManager: Send + Sync {
    /// Wrap an outgoing envelope in its signed form.
    fn sign(&self, envelope: InnerEnvelope) -> Result<SignedEnvelope, RouterError>;

    /// Check the signature of an incoming envelope.
    fn verify(&self, signed: &SignedEnvelope) -> Result<(), RouterError>;

    /// Check that the envelope's claimed sender matches its signer identity.
    fn verify_node(&self, signed: &SignedEnvelope) -> Result<(), RouterError>;
}

/// Structural verification only; signature and certificate stay empty.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSecurity;

impl SecurityManager for NoopSecurity {
    fn sign(&self, envelope: InnerEnvelope) -> Result<SignedEnvelope, RouterError> {
        Ok(SignedEnvelope {
            m: envelope,
            s: String::new(),
            c: String::new(),
        })
    }

    fn verify(&self, signed: &SignedEnvelope) -> Result<(), RouterError> {
        if signed.m.message_id.is_empty() {
            return Err(RouterError::Verification("empty message id".to_string()));
        }
        Ok(())
    }

    fn verify_node(&self, _signed: &SignedEnvelope) -> Result<(), RouterError> {
        Ok(())
    }
}

/// Pins envelope senders to the CN of the certificate in the `c` field.
#[cfg(feature = "tls")]
#[derive(Debug, Clone)]
pub struct CertificateSecurity {
    cert_pem: String,
}

#[cfg(feature = "tls")]
impl CertificateSecurity {
    /// Manager carrying the local certificate attached to signed envelopes.
    pub fn new(cert_pem: impl Into<String>) -> Self {
        Self {
            cert_pem: cert_pem.into(),
        }
    }

    fn common_name(pem: &str) -> Result<String, RouterError> {
        let (_, parsed) = x509_parser::pem::parse_x509_pem(pem.as_bytes())
            .map_err(|e| RouterError::Verification(format!("bad certificate PEM: {e}")))?;
        let cert = parsed
            .parse_x509()
            .map_err(|e| RouterError::Verification(format!("bad certificate: {e}")))?;
        cert.subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(str::to_string)
            .ok_or_else(|| RouterError::Verification("certificate has no CN".to_string()))
    }
}

#[cfg(feature = "tls")]
impl SecurityManager for CertificateSecurity {
    fn sign(&self, envelope: InnerEnvelope) -> Result<SignedEnvelope, RouterError> {
        Ok(SignedEnvelope {
            m: envelope,
            s: String::new(),
            c: self.cert_pem.clone(),
        })
    }

    fn verify(&self, signed: &SignedEnvelope) -> Result<(), RouterError> {
        if signed.m.message_id.is_empty() {
            return Err(RouterError::Verification("empty message id".to_string()));
        }
        if signed.c.is_empty() {
            return Err(RouterError::Verification("missing certificate".to_string()));
        }
        Ok(())
    }

    fn verify_node(&self, signed: &SignedEnvelope) -> Result<(), RouterError> {
        let cn = Self::common_name(&signed.c)?;
        if cn != signed.m.sender {
            return Err(RouterError::Verification(format!(
                "certificate CN {:?} does not match sender {:?}",
                cn, signed.m.sender
            )));
        }
        Ok(())
    }
}
