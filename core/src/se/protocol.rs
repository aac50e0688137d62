/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use std::fmt;

use crate::error::{Error, Result};

pub const AES_BLOCK_SIZE: usize = 16;
pub const AES_IV_SIZE: usize = 16;
pub const CMAC_RESULT_SIZE: usize = 16;
/// DRBG output granularity.
pub const DRBG_BLOCK_SIZE: usize = 16;
pub const RSA_MIN_BYTES: usize = 64;
pub const RSA_MAX_BYTES: usize = 256;

/// Hardware engine instances. The discriminant is the instance index.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineId {
    /// AES0, dedicated to the DRBG.
    Aes0 = 0,
    /// AES1, block modes and CMAC.
    Aes1 = 1,
    Rsa = 2,
    Sha = 3,
}

impl EngineId {
    pub const ALL: [EngineId; 4] = [EngineId::Aes0, EngineId::Aes1, EngineId::Rsa, EngineId::Sha];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: u8) -> Option<Self> {
        Self::ALL.get(index as usize).copied()
    }

    pub fn supports(self, mode: OpMode) -> bool {
        mode.engine() == self
    }

    /// Fails with a configuration error if `mode` cannot run on this instance.
    pub fn check(self, mode: OpMode) -> Result<()> {
        if self.supports(mode) {
            Ok(())
        } else {
            Err(Error::config(format!("{} does not support {}", self, mode)))
        }
    }
}

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineId::Aes0 => "SE1 (AES0)",
            EngineId::Aes1 => "SE2 (AES1)",
            EngineId::Rsa => "SE3 (RSA)",
            EngineId::Sha => "SE4 (SHA)",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaAlgorithm {
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl ShaAlgorithm {
    pub const ALL: [ShaAlgorithm; 5] = [
        ShaAlgorithm::Sha1,
        ShaAlgorithm::Sha224,
        ShaAlgorithm::Sha256,
        ShaAlgorithm::Sha384,
        ShaAlgorithm::Sha512,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ShaAlgorithm::Sha1 => "sha1",
            ShaAlgorithm::Sha224 => "sha224",
            ShaAlgorithm::Sha256 => "sha256",
            ShaAlgorithm::Sha384 => "sha384",
            ShaAlgorithm::Sha512 => "sha512",
        }
    }

    pub fn digest_len(self) -> usize {
        match self {
            ShaAlgorithm::Sha1 => 20,
            ShaAlgorithm::Sha224 => 28,
            ShaAlgorithm::Sha256 => 32,
            ShaAlgorithm::Sha384 => 48,
            ShaAlgorithm::Sha512 => 64,
        }
    }

    pub fn block_len(self) -> usize {
        match self {
            ShaAlgorithm::Sha1 | ShaAlgorithm::Sha224 | ShaAlgorithm::Sha256 => 64,
            ShaAlgorithm::Sha384 | ShaAlgorithm::Sha512 => 128,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherMode {
    Cbc,
    Ecb,
    Ctr,
    Ofb,
}

impl From<CipherMode> for OpMode {
    fn from(mode: CipherMode) -> Self {
        match mode {
            CipherMode::Cbc => OpMode::Cbc,
            CipherMode::Ecb => OpMode::Ecb,
            CipherMode::Ctr => OpMode::Ctr,
            CipherMode::Ofb => OpMode::Ofb,
        }
    }
}

impl fmt::Display for CipherMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        OpMode::from(*self).fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Encrypt,
    Decrypt,
}

/// Every operation the engines know about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpMode {
    Cbc,
    Ecb,
    Ctr,
    Ofb,
    Cmac,
    Sha(ShaAlgorithm),
    Rsa,
    Drbg,
}

impl OpMode {
    /// The only engine instance able to run this mode.
    pub fn engine(self) -> EngineId {
        match self {
            OpMode::Drbg => EngineId::Aes0,
            OpMode::Cbc | OpMode::Ecb | OpMode::Ctr | OpMode::Ofb | OpMode::Cmac => EngineId::Aes1,
            OpMode::Rsa => EngineId::Rsa,
            OpMode::Sha(_) => EngineId::Sha,
        }
    }
}

impl fmt::Display for OpMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpMode::Cbc => f.write_str("cbc(aes)"),
            OpMode::Ecb => f.write_str("ecb(aes)"),
            OpMode::Ctr => f.write_str("ctr(aes)"),
            OpMode::Ofb => f.write_str("ofb(aes)"),
            OpMode::Cmac => f.write_str("cmac(aes)"),
            OpMode::Sha(alg) => f.write_str(alg.name()),
            OpMode::Rsa => f.write_str("rsa"),
            OpMode::Drbg => f.write_str("drbg"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyLength {
    Aes128,
    Aes192,
    Aes256,
}

impl KeyLength {
    pub fn from_len(len: usize) -> Result<Self> {
        match len {
            16 => Ok(KeyLength::Aes128),
            24 => Ok(KeyLength::Aes192),
            32 => Ok(KeyLength::Aes256),
            other => Err(Error::config(format!("invalid AES key length {}", other))),
        }
    }

    pub fn bytes(self) -> usize {
        match self {
            KeyLength::Aes128 => 16,
            KeyLength::Aes192 => 24,
            KeyLength::Aes256 => 32,
        }
    }
}

/// A loaded symmetric key: the slot it lives in and its size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyRef {
    pub slot: u8,
    pub len: KeyLength,
}

/// Where a chaining mode takes its IV from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IvPolicy {
    /// Load this IV (or counter, for CTR) before the operation.
    Explicit([u8; AES_IV_SIZE]),
    /// Continue from the slot's updated IV left by the previous operation.
    Chained,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_mode_has_exactly_one_home() {
        let modes = [
            OpMode::Cbc,
            OpMode::Ecb,
            OpMode::Ctr,
            OpMode::Ofb,
            OpMode::Cmac,
            OpMode::Sha(ShaAlgorithm::Sha256),
            OpMode::Rsa,
            OpMode::Drbg,
        ];
        for mode in modes {
            let homes: Vec<_> = EngineId::ALL.iter().filter(|e| e.supports(mode)).collect();
            assert_eq!(homes.len(), 1, "{}", mode);
        }
    }

    #[test]
    fn rsa_on_cipher_engine_is_a_config_error() {
        let err = EngineId::Aes1.check(OpMode::Rsa).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn key_lengths() {
        assert_eq!(KeyLength::from_len(24).unwrap(), KeyLength::Aes192);
        assert!(KeyLength::from_len(20).is_err());
    }
}
