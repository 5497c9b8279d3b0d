// agent/src/sys/tls.rs

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use lapin::tcp::{OwnedIdentity, OwnedTLSConfig};
use p12_keystore::{Certificate, KeyStore, KeyStoreEntry, PrivateKeyChain};
use serde::Deserialize;
use zeroize::Zeroizing;

use crate::sys::secrets::KeyMaterial;

const PEM_MARKER: &str = "-----BEGIN";
const IDENTITY_ALIAS: &str = "fleet-agent";

/// Client certificate, private key and CA bundle for amqps relays. Supplied
/// as configuration content, never read from runtime paths.
#[derive(Debug, Deserialize)]
pub struct TlsMaterial {
    pub cert_pem: String,
    pub key_pem: KeyMaterial,
    pub ca_pem: String,
}

/// Decodes every PEM block carrying `label`, in file order.
fn pem_blocks(pem: &str, label: &str) -> Result<Vec<Vec<u8>>, String> {
    let begin = format!("-----BEGIN {}-----", label);
    let end = format!("-----END {}-----", label);

    let mut blocks = Vec::new();
    let mut rest = pem;
    while let Some(start) = rest.find(&begin) {
        let body_start = start + begin.len();
        let body_len = rest[body_start..]
            .find(&end)
            .ok_or_else(|| format!("unterminated {} block", label))?;
        let body: Zeroizing<String> = Zeroizing::new(
            rest[body_start..body_start + body_len]
                .chars()
                .filter(|c| !c.is_whitespace())
                .collect(),
        );
        let der = STANDARD
            .decode(body.as_bytes())
            .map_err(|e| format!("invalid base64 in {} block: {}", label, e))?;
        blocks.push(der);
        rest = &rest[body_start + body_len + end.len()..];
    }
    Ok(blocks)
}

impl TlsMaterial {
    pub fn validate(&self) -> Result<(), String> {
        if !self.cert_pem.contains(PEM_MARKER) {
            return Err("failed to import client certificate: not PEM encoded".into());
        }
        if !self.key_pem.use_secret(|pem| pem.contains(PEM_MARKER)) {
            return Err("failed to import client key: not PEM encoded".into());
        }
        if !self.ca_pem.contains(PEM_MARKER) {
            return Err("failed to import CA certificate: not PEM encoded".into());
        }
        Ok(())
    }

    /// Bundles the certificate chain and the PKCS#8 key into the PKCS#12
    /// identity the transport expects. The bundle password is random and
    /// never leaves this process.
    pub fn client_identity(&self) -> Result<OwnedIdentity, String> {
        let chain = pem_blocks(&self.cert_pem, "CERTIFICATE")
            .map_err(|e| format!("failed to import client certificate: {}", e))?
            .iter()
            .map(|der| {
                Certificate::from_der(der).map_err(|e| format!("failed to import client certificate: {}", e))
            })
            .collect::<Result<Vec<_>, _>>()?;
        if chain.is_empty() {
            return Err("failed to import client certificate: no CERTIFICATE block".into());
        }

        let keys = Zeroizing::new(
            self.key_pem
                .use_secret(|pem| pem_blocks(pem, "PRIVATE KEY"))
                .map_err(|e| format!("failed to import client key: {}", e))?,
        );
        let key_der = keys
            .first()
            .ok_or("failed to import client key: expected a PKCS#8 PRIVATE KEY block")?;

        let local_key_id = uuid::Uuid::new_v4();
        let mut keystore = KeyStore::new();
        keystore.add_entry(
            IDENTITY_ALIAS,
            KeyStoreEntry::PrivateKeyChain(PrivateKeyChain::new(
                key_der.as_slice(),
                local_key_id.as_bytes(),
                chain,
            )),
        );

        let password = uuid::Uuid::new_v4().simple().to_string();
        let der = keystore
            .writer(&password)
            .write()
            .map_err(|e| format!("failed to bundle client identity: {}", e))?;

        Ok(OwnedIdentity { der, password })
    }

    /// Builds the transport TLS configuration. Peer verification against
    /// `ca_pem` is always on; there is no switch to disable it.
    pub fn owned_config(&self) -> Result<OwnedTLSConfig, String> {
        self.validate()?;

        Ok(OwnedTLSConfig {
            identity: Some(self.client_identity()?),
            cert_chain: Some(self.ca_pem.clone()),
        })
    }
}
