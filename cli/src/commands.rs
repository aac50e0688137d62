/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use futures::future::join_all;
use log::{debug, info};
use secrypt::se::protocol::AES_IV_SIZE;
use secrypt::se::registry::{self, ALGORITHMS};
use secrypt::se::OpMode;
use secrypt::{CipherMode, Error, IvPolicy, KeySource, Result, SecurityEngine, ShaAlgorithm};
use std::str::FromStr;
use std::time::Instant;
use strum_macros::{AsRefStr, EnumIter, EnumString};

#[derive(EnumIter, EnumString, AsRefStr, Debug, Clone, Copy, PartialEq, Eq)]
#[strum(serialize_all = "lowercase")]
pub enum Command {
    Digest,
    Encrypt,
    Decrypt,
    Cmac,
    Rsa,
    Rng,
    Algorithms,
    Stress,
}

#[derive(EnumString, AsRefStr, Debug, Clone, Copy)]
#[strum(ascii_case_insensitive)]
enum ModeArg {
    #[strum(serialize = "cbc", serialize = "cbc(aes)")]
    Cbc,
    #[strum(serialize = "ecb", serialize = "ecb(aes)")]
    Ecb,
    #[strum(serialize = "ctr", serialize = "ctr(aes)")]
    Ctr,
    #[strum(serialize = "ofb", serialize = "ofb(aes)")]
    Ofb,
}

impl From<ModeArg> for CipherMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Cbc => CipherMode::Cbc,
            ModeArg::Ecb => CipherMode::Ecb,
            ModeArg::Ctr => CipherMode::Ctr,
            ModeArg::Ofb => CipherMode::Ofb,
        }
    }
}

impl Command {
    pub fn help(self) -> &'static str {
        match self {
            Command::Digest => "<sha1|sha224|sha256|sha384|sha512> <hex>",
            Command::Encrypt => "<cbc|ecb|ctr|ofb> <key hex> <iv hex> <data hex>",
            Command::Decrypt => "<cbc|ecb|ctr|ofb> <key hex> <iv hex> <data hex>",
            Command::Cmac => "<key hex> <message hex>",
            Command::Rsa => "<modulus hex> <exponent hex> <input hex>",
            Command::Rng => "<length>",
            Command::Algorithms => "list registered algorithms",
            Command::Stress => "<count> concurrent cipher and digest requests",
        }
    }

    pub async fn run(self, engine: &SecurityEngine, args: &[String]) -> Result<()> {
        match self {
            Command::Digest => digest(engine, args).await,
            Command::Encrypt => cipher(engine, args, true).await,
            Command::Decrypt => cipher(engine, args, false).await,
            Command::Cmac => cmac(engine, args).await,
            Command::Rsa => rsa(engine, args).await,
            Command::Rng => rng(engine, args).await,
            Command::Algorithms => {
                algorithms();
                Ok(())
            }
            Command::Stress => stress(engine, args).await,
        }
    }
}

fn arg<'a>(args: &'a [String], index: usize, what: &str) -> Result<&'a str> {
    args.get(index)
        .map(String::as_str)
        .ok_or_else(|| Error::config(format!("missing {}", what)))
}

fn hex_arg(args: &[String], index: usize, what: &str) -> Result<Vec<u8>> {
    let text = arg(args, index, what)?;
    hex::decode(text).map_err(|err| Error::config(format!("{} is not hex: {}", what, err)))
}

/// An empty IV argument means all zeroes.
fn iv_arg(args: &[String], index: usize) -> Result<IvPolicy> {
    if arg(args, index, "iv")?.is_empty() {
        return Ok(IvPolicy::Explicit([0u8; AES_IV_SIZE]));
    }
    let bytes = hex_arg(args, index, "iv")?;
    let iv: [u8; AES_IV_SIZE] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| Error::config(format!("iv must be {} bytes, got {}", AES_IV_SIZE, bytes.len())))?;
    Ok(IvPolicy::Explicit(iv))
}

async fn digest(engine: &SecurityEngine, args: &[String]) -> Result<()> {
    let name = arg(args, 0, "algorithm")?;
    let alg = match registry::lookup(name).map(|info| info.mode) {
        Some(OpMode::Sha(alg)) => alg,
        _ => return Err(Error::config(format!("unknown digest '{}'", name))),
    };
    let msg = hex_arg(args, 1, "message")?;
    let out = engine.digest(alg, &msg).await?;
    println!("{}", hex::encode(out));
    Ok(())
}

async fn cipher(engine: &SecurityEngine, args: &[String], encrypt: bool) -> Result<()> {
    let name = arg(args, 0, "mode")?;
    let mode: CipherMode = ModeArg::from_str(name)
        .map_err(|_| Error::config(format!("unknown cipher mode '{}'", name)))?
        .into();
    let key = hex_arg(args, 1, "key")?;
    let iv = iv_arg(args, 2)?;
    let data = hex_arg(args, 3, "data")?;

    let mut ctx = engine.aes_context();
    engine.set_aes_key(&mut ctx, KeySource::User(key)).await?;
    let out = if encrypt {
        engine.encrypt(&ctx, mode, iv, &data).await?
    } else {
        engine.decrypt(&ctx, mode, iv, &data).await?
    };
    println!("{}", hex::encode(out));
    Ok(())
}

async fn cmac(engine: &SecurityEngine, args: &[String]) -> Result<()> {
    let key = hex_arg(args, 0, "key")?;
    let msg = hex_arg(args, 1, "message")?;
    let mut ctx = engine.cmac_context();
    engine.set_cmac_key(&mut ctx, KeySource::User(key)).await?;
    let tag = engine.cmac(&ctx, &msg).await?;
    println!("{}", hex::encode(tag));
    Ok(())
}

async fn rsa(engine: &SecurityEngine, args: &[String]) -> Result<()> {
    let modulus = hex_arg(args, 0, "modulus")?;
    let exponent = hex_arg(args, 1, "exponent")?;
    let input = hex_arg(args, 2, "input")?;
    let mut ctx = engine.rsa_context();
    engine.set_rsa_key(&mut ctx, &modulus, &exponent).await?;
    let out = engine.rsa(&ctx, &input).await?;
    println!("{}", hex::encode(out));
    Ok(())
}

async fn rng(engine: &SecurityEngine, args: &[String]) -> Result<()> {
    let text = arg(args, 0, "length")?;
    let len: usize = text
        .parse()
        .map_err(|_| Error::config(format!("invalid length '{}'", text)))?;
    let bytes = engine.generate_random(len).await?;
    println!("{}", hex::encode(bytes));
    Ok(())
}

fn algorithms() {
    println!("{:<12} {:<18} {:>8} {:>6} {:>7} {:>5}", "name", "driver", "priority", "block", "digest", "key");
    for alg in ALGORITHMS {
        let key = if alg.max_key == 0 {
            "-".to_string()
        } else if alg.min_key == alg.max_key {
            alg.min_key.to_string()
        } else {
            format!("{}-{}", alg.min_key, alg.max_key)
        };
        println!(
            "{:<12} {:<18} {:>8} {:>6} {:>7} {:>5}",
            alg.name, alg.driver, alg.priority, alg.block_size, alg.digest_size, key
        );
    }
}

/// Backlogged and exhausted requests are resubmitted until they resolve.
async fn resubmit<F, Fut>(mut submit: F) -> Result<Vec<u8>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Vec<u8>>>,
{
    loop {
        match submit().await {
            Err(err) if err.is_retryable() => {
                debug!("Resubmitting after: {}", err);
                tokio::task::yield_now().await;
            }
            other => return other,
        }
    }
}

/// Floods AES1 and SHA with `count` requests each and checks every cipher
/// result decrypts back to its plaintext.
async fn stress(engine: &SecurityEngine, args: &[String]) -> Result<()> {
    let text = arg(args, 0, "count")?;
    let count: usize = text
        .parse()
        .map_err(|_| Error::config(format!("invalid count '{}'", text)))?;

    let key = engine.generate_random(16).await?;
    let mut ctx = engine.aes_context();
    engine.set_aes_key(&mut ctx, KeySource::User(key)).await?;
    let iv = IvPolicy::Explicit([0x5a; AES_IV_SIZE]);
    let plaintexts: Vec<Vec<u8>> = (0..count)
        .map(|i| (0..64).map(|b| (i as u8).wrapping_mul(31) ^ b as u8).collect())
        .collect();

    let started = Instant::now();
    let ciphers = join_all(
        plaintexts
            .iter()
            .map(|pt| resubmit(|| engine.encrypt(&ctx, CipherMode::Cbc, iv, pt))),
    );
    let digests = join_all(
        plaintexts
            .iter()
            .map(|pt| resubmit(|| engine.digest(ShaAlgorithm::Sha256, pt))),
    );
    let (ciphers, digests) = futures::join!(ciphers, digests);
    let elapsed = started.elapsed();

    let mut failed = 0usize;
    for (i, (ct, dg)) in ciphers.into_iter().zip(digests).enumerate() {
        let ct = match (ct, dg) {
            (Ok(ct), Ok(_)) => ct,
            (Err(err), _) | (_, Err(err)) => {
                debug!("Request {} failed: {}", i, err);
                failed += 1;
                continue;
            }
        };
        if engine.decrypt(&ctx, CipherMode::Cbc, iv, &ct).await? != plaintexts[i] {
            debug!("Request {} did not round trip", i);
            failed += 1;
        }
    }

    info!("{} request pairs completed in {:?}", count, elapsed);
    println!("{} ok, {} failed, {:?}", count - failed, failed, elapsed);
    if failed > 0 {
        return Err(Error::fault(format!("{} of {} requests failed", failed, count)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_names_parse() {
        assert_eq!(Command::from_str("digest").unwrap(), Command::Digest);
        assert_eq!(Command::Algorithms.as_ref(), "algorithms");
        assert!(Command::from_str("xts").is_err());
    }

    #[test]
    fn mode_accepts_generic_names() {
        assert_eq!(CipherMode::from(ModeArg::from_str("CBC(aes)").unwrap()), CipherMode::Cbc);
        assert_eq!(CipherMode::from(ModeArg::from_str("ofb").unwrap()), CipherMode::Ofb);
    }

    #[test]
    fn iv_defaults_to_zero_and_checks_length() {
        let args = vec!["cbc".to_string(), String::new(), "abcd".to_string()];
        assert_eq!(iv_arg(&args, 1).unwrap(), IvPolicy::Explicit([0; AES_IV_SIZE]));
        assert!(iv_arg(&args, 2).is_err());
        assert!(iv_arg(&args, 3).is_err());
    }

    #[tokio::test]
    async fn digest_and_rng_run_on_the_soft_engine() {
        let (engine, _accel) = SecurityEngine::soft(secrypt::EngineConfig::default()).unwrap();
        let args = vec!["se-sha256".to_string(), hex::encode(b"abc")];
        digest(&engine, &args).await.unwrap();
        let args = vec!["cbc(aes)".to_string(), String::new()];
        assert!(digest(&engine, &args).await.is_err());
        rng(&engine, &["40".to_string()]).await.unwrap();
        assert!(rng(&engine, &["lots".to_string()]).await.is_err());
    }
}
