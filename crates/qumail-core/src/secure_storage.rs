use anyhow::{anyhow, Result};
use base64::{engine::general_purpose, Engine as _};
use keyring::Entry;
use zeroize::Zeroizing;

const SERVICE_NAME: &str = "QuMailClient";
const OUTBOX_KEY: &str = "outbox_key";
const CREDENTIAL_KEY: &str = "app_credential";
const KMS_API_KEY: &str = "kms_api_key";

fn entry(kind: &str, account: &str) -> Result<Entry> {
    Entry::new(SERVICE_NAME, &format!("{}:{}", kind, account))
        .map_err(|e| anyhow!("keyring init: {e}"))
}

/// Returns `Ok(None)` when no outbox key has been stored for `account` yet.
pub fn get_outbox_key(account: &str) -> Result<Option<Zeroizing<Vec<u8>>>> {
    match entry(OUTBOX_KEY, account)?.get_password() {
        Ok(encoded) => {
            let encoded = Zeroizing::new(encoded);
            let decoded = general_purpose::STANDARD
                .decode(encoded.as_bytes())
                .map_err(|e| anyhow!("decode outbox key: {e}"))?;
            Ok(Some(Zeroizing::new(decoded)))
        }
        Err(keyring::Error::NoEntry) => Ok(None),
        Err(e) => Err(anyhow!("load outbox key: {e}")),
    }
}

pub fn store_outbox_key(account: &str, key: &[u8]) -> Result<()> {
    let encoded = Zeroizing::new(general_purpose::STANDARD.encode(key));
    entry(OUTBOX_KEY, account)?
        .set_password(&encoded)
        .map_err(|e| anyhow!("store outbox key: {e}"))?;
    Ok(())
}

pub fn store_credential(user: &str, credential: &str) -> Result<()> {
    entry(CREDENTIAL_KEY, user)?
        .set_password(credential)
        .map_err(|e| anyhow!("store credential: {e}"))?;
    Ok(())
}

pub fn get_credential(user: &str) -> Result<Option<Zeroizing<String>>> {
    match entry(CREDENTIAL_KEY, user)?.get_password() {
        Ok(credential) => Ok(Some(Zeroizing::new(credential))),
        Err(keyring::Error::NoEntry) => Ok(None),
        Err(e) => Err(anyhow!("load credential: {e}")),
    }
}

pub fn store_kms_api_key(endpoint: &str, api_key: &str) -> Result<()> {
    entry(KMS_API_KEY, endpoint)?
        .set_password(api_key)
        .map_err(|e| anyhow!("store kms api key: {e}"))?;
    Ok(())
}

pub fn get_kms_api_key(endpoint: &str) -> Result<Option<Zeroizing<String>>> {
    match entry(KMS_API_KEY, endpoint)?.get_password() {
        Ok(api_key) => Ok(Some(Zeroizing::new(api_key))),
        Err(keyring::Error::NoEntry) => Ok(None),
        Err(e) => Err(anyhow!("load kms api key: {e}")),
    }
}
