//! BIP-39 / BIP-32 key derivation.
//!
//! Path layout is `m/44'/{coin}'/0'/0/{index}`: purpose and coin type come from the key type,
//! account and change are fixed at zero, and only the non-hardened leaf varies.

use crate::{chains, errors::VaultError, wallet::KeyType};
use bip39::{Language, Mnemonic};
use bitcoin::bip32::{DerivationPath, Xpriv};
use bitcoin::secp256k1::Secp256k1;
use bitcoin::Network;
use secrecy::{ExposeSecret as _, SecretString};
use zeroize::Zeroizing;

/// Largest leaf index (the hardened-derivation ceiling, 2^31 - 1).
pub const MAX_INDEX: u32 = 0x7FFF_FFFF;

pub type PrivateKey = Zeroizing<[u8; 32]>;

pub fn validate_index(index: u64) -> Result<u32, VaultError> {
    match u32::try_from(index) {
        Ok(i) if i <= MAX_INDEX => Ok(i),
        _ => Err(VaultError::IndexOutOfRange(index)),
    }
}

pub fn derivation_path(key_type: KeyType, index: u32) -> String {
    format!("m/44'/{}'/0'/0/{index}", key_type.coin_type())
}

/// Parse a mnemonic after collapsing whitespace and case; the checksum word must verify.
pub fn parse_mnemonic(phrase: &SecretString) -> Result<Mnemonic, VaultError> {
    let normalized = Zeroizing::new(
        phrase
            .expose_secret()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase(),
    );
    Mnemonic::parse_in_normalized(Language::English, normalized.as_str())
        .map_err(|e| {
            tracing::debug!(error = %e, "mnemonic rejected");
            VaultError::InvalidMnemonic
        })
}

/// Derives keys for the enabled key types. Disabled or unknown families fail closed.
#[derive(Debug, Clone)]
pub struct DerivationEngine {
    enabled: Vec<KeyType>,
}

impl Default for DerivationEngine {
    fn default() -> Self {
        Self::new(KeyType::ALL.to_vec())
    }
}

impl DerivationEngine {
    pub const fn new(enabled: Vec<KeyType>) -> Self {
        Self { enabled }
    }

    pub fn ensure_enabled(&self, key_type: KeyType) -> Result<(), VaultError> {
        if self.enabled.contains(&key_type) {
            Ok(())
        } else {
            Err(VaultError::UnsupportedKeyType(key_type.as_str().to_owned()))
        }
    }

    /// Pure function of its inputs: the same mnemonic, passphrase, key type and index always
    /// produce the same 32 bytes.
    pub fn derive(
        &self,
        mnemonic: &SecretString,
        passphrase: &SecretString,
        key_type: KeyType,
        index: u64,
    ) -> Result<PrivateKey, VaultError> {
        self.ensure_enabled(key_type)?;
        let index = validate_index(index)?;
        let mnemonic = parse_mnemonic(mnemonic)?;
        let seed = Zeroizing::new(mnemonic.to_seed_normalized(passphrase.expose_secret()));

        let secp = Secp256k1::signing_only();
        let master = Xpriv::new_master(Network::Bitcoin, seed.as_slice())
            .map_err(|e| VaultError::DerivationFailed(format!("master key: {e}")))?;
        let path: DerivationPath = derivation_path(key_type, index)
            .parse()
            .map_err(|e| VaultError::DerivationFailed(format!("path: {e}")))?;
        let child = master
            .derive_priv(&secp, &path)
            .map_err(|e| VaultError::DerivationFailed(format!("child key: {e}")))?;
        Ok(Zeroizing::new(child.private_key.secret_bytes()))
    }

    /// Canonical (checksummed) address for a private key in the given family.
    pub fn derive_address(&self, key: &[u8; 32], key_type: KeyType) -> Result<String, VaultError> {
        self.ensure_enabled(key_type)?;
        chains::address_from_secret(key_type, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::signers::local::{coins_bip39::English, MnemonicBuilder};

    const HARDHAT: &str = "test test test test test test test test test test test junk";
    const ABANDON: &str =
        "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    fn secret(s: &str) -> SecretString {
        SecretString::new(s.to_owned().into())
    }

    fn address_at(phrase: &str, key_type: KeyType, index: u64) -> eyre::Result<String> {
        let engine = DerivationEngine::default();
        let key = engine.derive(&secret(phrase), &secret(""), key_type, index)?;
        Ok(engine.derive_address(&key, key_type)?)
    }

    #[test]
    fn evm_index_zero_matches_known_vector() -> eyre::Result<()> {
        assert_eq!(
            address_at(HARDHAT, KeyType::Evm, 0)?,
            "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266"
        );
        assert_eq!(
            address_at(HARDHAT, KeyType::Evm, 1)?,
            "0x70997970C51812dc3A010C7d01b50e0d17dc79C8"
        );
        assert_eq!(
            address_at(ABANDON, KeyType::Evm, 0)?,
            "0x9858EfFD232B4033E47d90003D41EC34EcaEda94"
        );
        Ok(())
    }

    #[test]
    fn tron_uses_its_own_coin_type() -> eyre::Result<()> {
        assert_eq!(
            address_at(ABANDON, KeyType::Tron, 0)?,
            "TUEZSdKsoDHQMeZwihtdoBiN46zxhGWYdH"
        );
        assert_eq!(
            address_at(HARDHAT, KeyType::Tron, 0)?,
            "TWer2Ygk5TEheHp3TPuYeqxmB6SsGZmaL6"
        );
        Ok(())
    }

    #[test]
    fn leaf_key_bytes_match_known_vector() -> eyre::Result<()> {
        let engine = DerivationEngine::default();
        let key = engine.derive(&secret(HARDHAT), &secret(""), KeyType::Evm, 0)?;
        assert_eq!(
            hex::encode(key.as_slice()),
            "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80"
        );
        Ok(())
    }

    #[test]
    fn derivation_is_deterministic() -> eyre::Result<()> {
        let engine = DerivationEngine::default();
        for index in [0_u64, 7, u64::from(MAX_INDEX)] {
            let a = engine.derive(&secret(ABANDON), &secret("pw"), KeyType::Tron, index)?;
            let b = engine.derive(&secret(ABANDON), &secret("pw"), KeyType::Tron, index)?;
            assert_eq!(*a, *b, "index {index}");
        }
        Ok(())
    }

    #[test]
    fn agrees_with_alloy_mnemonic_builder() -> eyre::Result<()> {
        for i in 0_u32..3 {
            let wallet = MnemonicBuilder::<English>::default()
                .phrase(ABANDON)
                .index(i)?
                .build()?;
            assert_eq!(
                address_at(ABANDON, KeyType::Evm, u64::from(i))?,
                wallet.address().to_checksum(None)
            );
        }
        Ok(())
    }

    #[test]
    fn passphrase_changes_the_tree() -> eyre::Result<()> {
        let engine = DerivationEngine::default();
        let plain = engine.derive(&secret(ABANDON), &secret(""), KeyType::Evm, 0)?;
        let salted = engine.derive(&secret(ABANDON), &secret("TREZOR"), KeyType::Evm, 0)?;
        assert_ne!(*plain, *salted);
        Ok(())
    }

    #[test]
    fn whitespace_and_case_are_normalized() -> eyre::Result<()> {
        let messy = format!("  {}  ", ABANDON.to_uppercase().replace(' ', "   "));
        assert_eq!(
            address_at(&messy, KeyType::Evm, 0)?,
            "0x9858EfFD232B4033E47d90003D41EC34EcaEda94"
        );
        Ok(())
    }

    #[test]
    fn bad_inputs_fail_with_typed_errors() {
        let engine = DerivationEngine::default();
        let bad_checksum = "abandon ".repeat(12);
        assert_eq!(
            engine
                .derive(&secret(&bad_checksum), &secret(""), KeyType::Evm, 0)
                .err(),
            Some(VaultError::InvalidMnemonic)
        );
        assert_eq!(
            engine
                .derive(&secret(ABANDON), &secret(""), KeyType::Evm, 1_u64 << 31)
                .err(),
            Some(VaultError::IndexOutOfRange(1_u64 << 31))
        );
        let evm_only = DerivationEngine::new(vec![KeyType::Evm]);
        assert_eq!(
            evm_only
                .derive(&secret(ABANDON), &secret(""), KeyType::Tron, 0)
                .err(),
            Some(VaultError::UnsupportedKeyType("tron".into()))
        );
    }
}
