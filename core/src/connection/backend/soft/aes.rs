/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use aes::{Aes128, Aes192, Aes256};
use cipher::generic_array::GenericArray;
use cipher::{BlockCipher, BlockDecrypt, BlockDecryptMut, BlockEncrypt, BlockEncryptMut, KeyInit, KeyIvInit};

use crate::error::{Error, Result};
use crate::se::protocol::AES_BLOCK_SIZE;

pub type Block = [u8; AES_BLOCK_SIZE];

/// Raw AES block function for the three key sizes.
pub enum AesCore {
    Aes128(Aes128),
    Aes192(Aes192),
    Aes256(Aes256),
}

impl AesCore {
    pub fn new(key: &[u8]) -> Result<Self> {
        let bad_key = |_| Error::fault(format!("{}-byte AES key", key.len()));
        Ok(match key.len() {
            16 => AesCore::Aes128(Aes128::new_from_slice(key).map_err(bad_key)?),
            24 => AesCore::Aes192(Aes192::new_from_slice(key).map_err(bad_key)?),
            32 => AesCore::Aes256(Aes256::new_from_slice(key).map_err(bad_key)?),
            other => return Err(Error::fault(format!("{}-byte AES key", other))),
        })
    }

    pub fn with_key128(key: &Block) -> Self {
        AesCore::Aes128(Aes128::new(&GenericArray::from(*key)))
    }

    pub fn encrypt(&self, block: &mut Block) {
        let block = GenericArray::from_mut_slice(&mut block[..]);
        match self {
            AesCore::Aes128(c) => c.encrypt_block(block),
            AesCore::Aes192(c) => c.encrypt_block(block),
            AesCore::Aes256(c) => c.encrypt_block(block),
        }
    }

    pub fn decrypt(&self, block: &mut Block) {
        let block = GenericArray::from_mut_slice(&mut block[..]);
        match self {
            AesCore::Aes128(c) => c.decrypt_block(block),
            AesCore::Aes192(c) => c.decrypt_block(block),
            AesCore::Aes256(c) => c.decrypt_block(block),
        }
    }
}

fn cbc_encrypt_with<C>(key: &[u8], iv: &Block, data: &mut [u8]) -> Result<()>
where
    C: BlockEncryptMut + BlockCipher + KeyInit,
{
    let mut enc = cbc::Encryptor::<C>::new_from_slices(key, iv)
        .map_err(|_| Error::fault("CBC key/IV rejected"))?;
    for block in data.chunks_exact_mut(AES_BLOCK_SIZE) {
        enc.encrypt_block_mut(GenericArray::from_mut_slice(block));
    }
    Ok(())
}

fn cbc_decrypt_with<C>(key: &[u8], iv: &Block, data: &mut [u8]) -> Result<()>
where
    C: BlockDecryptMut + BlockCipher + KeyInit,
{
    let mut dec = cbc::Decryptor::<C>::new_from_slices(key, iv)
        .map_err(|_| Error::fault("CBC key/IV rejected"))?;
    for block in data.chunks_exact_mut(AES_BLOCK_SIZE) {
        dec.decrypt_block_mut(GenericArray::from_mut_slice(block));
    }
    Ok(())
}

/// CBC over whole blocks of `data` in place.
pub fn cbc_apply(key: &[u8], iv: &Block, data: &mut [u8], encrypt: bool) -> Result<()> {
    match (key.len(), encrypt) {
        (16, true) => cbc_encrypt_with::<Aes128>(key, iv, data),
        (24, true) => cbc_encrypt_with::<Aes192>(key, iv, data),
        (32, true) => cbc_encrypt_with::<Aes256>(key, iv, data),
        (16, false) => cbc_decrypt_with::<Aes128>(key, iv, data),
        (24, false) => cbc_decrypt_with::<Aes192>(key, iv, data),
        (32, false) => cbc_decrypt_with::<Aes256>(key, iv, data),
        (other, _) => Err(Error::fault(format!("{}-byte AES key", other))),
    }
}

/// Big-endian 128-bit increment.
pub fn increment(counter: &mut Block) {
    for byte in counter.iter_mut().rev() {
        *byte = byte.wrapping_add(1);
        if *byte != 0 {
            break;
        }
    }
}

pub fn last_block(data: &[u8]) -> Option<Block> {
    let tail = data.len().checked_sub(AES_BLOCK_SIZE)?;
    let mut out = [0u8; AES_BLOCK_SIZE];
    out.copy_from_slice(&data[tail..]);
    Some(out)
}
