/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use crate::se::protocol::{CMAC_RESULT_SIZE, EngineId, OpMode, ShaAlgorithm};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlgorithmInfo {
    /// Generic algorithm name, e.g. `cbc(aes)`.
    pub name: &'static str,
    /// Name of this implementation.
    pub driver: &'static str,
    pub mode: OpMode,
    pub priority: u32,
    pub block_size: usize,
    /// Output size for hashes, MACs and RSA, zero for ciphers.
    pub digest_size: usize,
    pub min_key: usize,
    pub max_key: usize,
}

const fn cipher(name: &'static str, driver: &'static str, mode: OpMode) -> AlgorithmInfo {
    AlgorithmInfo {
        name,
        driver,
        mode,
        priority: 300,
        block_size: 16,
        digest_size: 0,
        min_key: 16,
        max_key: 32,
    }
}

const fn sha(name: &'static str, driver: &'static str, alg: ShaAlgorithm, block: usize, digest: usize) -> AlgorithmInfo {
    AlgorithmInfo {
        name,
        driver,
        mode: OpMode::Sha(alg),
        priority: 300,
        block_size: block,
        digest_size: digest,
        min_key: 0,
        max_key: 0,
    }
}

const fn rsa(name: &'static str, driver: &'static str, bytes: usize) -> AlgorithmInfo {
    AlgorithmInfo {
        name,
        driver,
        mode: OpMode::Rsa,
        priority: 100,
        block_size: bytes,
        digest_size: bytes,
        min_key: bytes,
        max_key: bytes,
    }
}

pub static ALGORITHMS: &[AlgorithmInfo] = &[
    AlgorithmInfo {
        name: "rng_drbg",
        driver: "rng_drbg-aes-se",
        mode: OpMode::Drbg,
        priority: 100,
        block_size: 16,
        digest_size: 0,
        min_key: 0,
        max_key: 0,
    },
    cipher("cbc(aes)", "cbc-aes-se", OpMode::Cbc),
    cipher("ecb(aes)", "ecb-aes-se", OpMode::Ecb),
    cipher("ctr(aes)", "ctr-aes-se", OpMode::Ctr),
    cipher("ofb(aes)", "ofb-aes-se", OpMode::Ofb),
    AlgorithmInfo {
        name: "cmac(aes)",
        driver: "se-cmac(aes)",
        mode: OpMode::Cmac,
        priority: 300,
        block_size: 16,
        digest_size: CMAC_RESULT_SIZE,
        min_key: 16,
        max_key: 32,
    },
    sha("sha1", "se-sha1", ShaAlgorithm::Sha1, 64, 20),
    sha("sha224", "se-sha224", ShaAlgorithm::Sha224, 64, 28),
    sha("sha256", "se-sha256", ShaAlgorithm::Sha256, 64, 32),
    sha("sha384", "se-sha384", ShaAlgorithm::Sha384, 128, 48),
    sha("sha512", "se-sha512", ShaAlgorithm::Sha512, 128, 64),
    rsa("rsa512", "se-rsa512", 64),
    rsa("rsa1024", "se-rsa1024", 128),
    rsa("rsa1536", "se-rsa1536", 192),
    rsa("rsa2048", "se-rsa2048", 256),
];

/// Finds an algorithm by generic or driver name.
pub fn lookup(name: &str) -> Option<&'static AlgorithmInfo> {
    ALGORITHMS
        .iter()
        .find(|alg| alg.name.eq_ignore_ascii_case(name) || alg.driver.eq_ignore_ascii_case(name))
}

pub fn for_engine(engine: EngineId) -> impl Iterator<Item = &'static AlgorithmInfo> {
    ALGORITHMS.iter().filter(move |alg| engine.supports(alg.mode))
}
