/*
 * SPDX-FileCopyrightText: 2024-2025 dhtbsign developers
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    ffi::OsString,
    io,
    path::{Path, PathBuf},
    process::{Command, ExitStatus},
};

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unsupported signing algorithm type: {0}")]
    UnsupportedAlgorithm(u32),
    #[error("Failed to launch signer: {0:?}")]
    Launch(PathBuf, #[source] io::Error),
    #[error("Signer exited with {0}")]
    SignerExited(ExitStatus),
}

type Result<T> = std::result::Result<T, Error>;

/// Digest and key sizes implied by a metadata header's algorithm type.
///
/// Types 0 through 2 select SHA-256 with RSA 1024/2048/4096 and types 3
/// through 5 select SHA-512 with RSA 2048/4096/8192. Everything the signer
/// needs, including which key files to look for on disk, derives from these
/// two numbers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AlgorithmParameters {
    pub digest_bits: u32,
    pub key_bits: u32,
}

impl AlgorithmParameters {
    pub fn from_raw(algorithm_type: u32) -> Result<Self> {
        if algorithm_type >= 6 {
            return Err(Error::UnsupportedAlgorithm(algorithm_type));
        }

        let (digest_bits, exponent) = if algorithm_type < 3 {
            (256, algorithm_type)
        } else {
            (512, algorithm_type - 2)
        };

        Ok(Self {
            digest_bits,
            key_bits: 1024 << exponent,
        })
    }

    /// Algorithm name in the signer's `SHA<digest>_RSA<key>` convention.
    pub fn name(&self) -> String {
        format!("SHA{}_RSA{}", self.digest_bits, self.key_bits)
    }

    /// File name of the private key used to re-sign the metadata.
    pub fn private_key_name(&self) -> String {
        format!("rsa{}_vbmeta.pem", self.key_bits)
    }

    /// File name under which a chained partition's public key is extracted.
    pub fn public_key_name(&self, partition: &str) -> String {
        format!("rsa{}_{partition}_pub.bin", self.key_bits)
    }
}

/// One `--chain_partition` entry for the re-signing invocation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChainPartition {
    pub partition_name: String,
    pub rollback_index_location: u32,
    pub key_file: String,
}

impl ChainPartition {
    fn to_arg(&self) -> String {
        format!(
            "{}:{}:{}",
            self.partition_name, self.rollback_index_location, self.key_file,
        )
    }
}

/// Build the signer invocation that produces a freshly signed metadata
/// image with the same chain as the original.
pub fn resign_args(
    params: &AlgorithmParameters,
    chains: &[ChainPartition],
    padding_size: u32,
    output: &Path,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "make_vbmeta_image".into(),
        "--key".into(),
        params.private_key_name().into(),
        "--algorithm".into(),
        params.name().into(),
    ];

    for chain in chains {
        args.push("--chain_partition".into());
        args.push(chain.to_arg().into());
    }

    args.push("--padding_size".into());
    args.push(padding_size.to_string().into());
    args.push("--output".into());
    args.push(output.as_os_str().to_owned());

    args
}

/// Render the re-signing invocation as a shell script, one continuation
/// line per chained partition, for users who want to inspect or edit the
/// command before running it themselves.
pub fn resign_script(
    signer: &Path,
    params: &AlgorithmParameters,
    chains: &[ChainPartition],
    padding_size: u32,
    output: &Path,
) -> String {
    let mut script = format!(
        "{} make_vbmeta_image --key {} --algorithm {} \\\n",
        signer.display(),
        params.private_key_name(),
        params.name(),
    );

    for chain in chains {
        script.push_str(&format!("--chain_partition {} \\\n", chain.to_arg()));
    }

    script.push_str(&format!(
        "--padding_size {padding_size} --output {}\n",
        output.display(),
    ));

    script
}

/// Build the signer invocation that appends a hash footer to a trimmed
/// boot or recovery image.
pub fn footer_args(
    params: &AlgorithmParameters,
    image: &Path,
    partition_name: &str,
    partition_size: u64,
) -> Vec<OsString> {
    vec![
        "add_hash_footer".into(),
        "--image".into(),
        image.as_os_str().to_owned(),
        "--partition_name".into(),
        partition_name.into(),
        "--partition_size".into(),
        partition_size.to_string().into(),
        "--key".into(),
        params.private_key_name().into(),
        "--algorithm".into(),
        params.name().into(),
    ]
}

/// Run the external signer and wait for it to finish. Its stdout and stderr
/// are inherited so signing progress shows up inline.
pub fn run_signer(signer: &Path, args: &[OsString]) -> Result<()> {
    debug!("Running signer: {signer:?} {args:?}");

    let status = Command::new(signer)
        .args(args)
        .status()
        .map_err(|e| Error::Launch(signer.to_owned(), e))?;

    if !status.success() {
        return Err(Error::SignerExited(status));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn algorithm_table() {
        let expected = [
            (256, 1024),
            (256, 2048),
            (256, 4096),
            (512, 2048),
            (512, 4096),
            (512, 8192),
        ];

        for (raw, (digest_bits, key_bits)) in expected.into_iter().enumerate() {
            let params = AlgorithmParameters::from_raw(raw as u32).unwrap();

            assert_eq!(params.digest_bits, digest_bits);
            assert_eq!(params.key_bits, key_bits);
        }
    }

    #[test]
    fn out_of_range_algorithm() {
        for raw in [6, 9, u32::MAX] {
            assert_matches!(
                AlgorithmParameters::from_raw(raw),
                Err(Error::UnsupportedAlgorithm(r)) if r == raw
            );
        }
    }

    #[test]
    fn derived_names() {
        let params = AlgorithmParameters::from_raw(2).unwrap();

        assert_eq!(params.name(), "SHA256_RSA4096");
        assert_eq!(params.private_key_name(), "rsa4096_vbmeta.pem");
        assert_eq!(params.public_key_name("boot"), "rsa4096_boot_pub.bin");
    }

    #[test]
    fn resign_invocation() {
        let params = AlgorithmParameters::from_raw(2).unwrap();
        let chains = [
            ChainPartition {
                partition_name: "boot".to_owned(),
                rollback_index_location: 1,
                key_file: "rsa4096_boot_pub.bin".to_owned(),
            },
            ChainPartition {
                partition_name: "recovery".to_owned(),
                rollback_index_location: 2,
                key_file: "rsa4096_recovery_pub.bin".to_owned(),
            },
        ];

        let args = resign_args(&params, &chains, 0x5000, Path::new("vbmeta-sign-custom.img"));

        let expected: Vec<OsString> = [
            "make_vbmeta_image",
            "--key",
            "rsa4096_vbmeta.pem",
            "--algorithm",
            "SHA256_RSA4096",
            "--chain_partition",
            "boot:1:rsa4096_boot_pub.bin",
            "--chain_partition",
            "recovery:2:rsa4096_recovery_pub.bin",
            "--padding_size",
            "20480",
            "--output",
            "vbmeta-sign-custom.img",
        ]
        .into_iter()
        .map(OsString::from)
        .collect();
        assert_eq!(args, expected);
    }

    #[test]
    fn rendered_script() {
        let params = AlgorithmParameters::from_raw(2).unwrap();
        let chains = [ChainPartition {
            partition_name: "boot".to_owned(),
            rollback_index_location: 1,
            key_file: "rsa4096_boot_pub.bin".to_owned(),
        }];

        let script = resign_script(
            Path::new("avbtool"),
            &params,
            &chains,
            0x1000,
            Path::new("vbmeta-sign-custom.img"),
        );

        assert_eq!(
            script,
            "avbtool make_vbmeta_image --key rsa4096_vbmeta.pem --algorithm SHA256_RSA4096 \\\n\
             --chain_partition boot:1:rsa4096_boot_pub.bin \\\n\
             --padding_size 4096 --output vbmeta-sign-custom.img\n"
        );
    }

    #[test]
    fn footer_invocation() {
        let params = AlgorithmParameters::from_raw(2).unwrap();

        let args = footer_args(&params, Path::new("boot.img"), "boot", 36700160);

        let expected: Vec<OsString> = [
            "add_hash_footer",
            "--image",
            "boot.img",
            "--partition_name",
            "boot",
            "--partition_size",
            "36700160",
            "--key",
            "rsa4096_vbmeta.pem",
            "--algorithm",
            "SHA256_RSA4096",
        ]
        .into_iter()
        .map(OsString::from)
        .collect();
        assert_eq!(args, expected);
    }
}
