use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use log::{debug, info};
use thiserror::Error;
use crate::oci::Digest;
use crate::provider::{BuildVar, Provider};

/// Location of the cli sources, relative to the kubevirtci checkout.
pub const GOCLI_DIR: &str = "cluster-provision/gocli";

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("failed capturing build output: {0}")]
    Capture(#[from] std::io::Error),

    #[error("providers {first} and {second} both map to build variable {name}")]
    DuplicateVariable {
        name: String,
        first: Provider,
        second: Provider,
    },

    #[error("cli build exited with {status}")]
    Failed { status: ExitStatus, output: String },
}

/// Compiles the cli with the provider digests baked in.
#[derive(Debug, Clone)]
pub struct CliBuilder {
    program: String,
    target: String,
    gocli_dir: PathBuf,
}

impl CliBuilder {
    pub fn new(program: &str, target: &str, kubevirtci_path: &Path) -> Self {
        Self {
            program: program.to_string(),
            target: target.to_string(),
            gocli_dir: kubevirtci_path.join(GOCLI_DIR),
        }
    }

    /// Where the build leaves the cli binary.
    pub fn cli_path(&self) -> PathBuf {
        self.gocli_dir.join("build").join("cli")
    }

    /// `-C <gocli>/ cli NAME="digest"...`
    pub fn arguments(&self, digests: &BTreeMap<Provider, Digest>) -> Result<Vec<String>, Error> {
        let mut seen: HashMap<String, &Provider> = HashMap::new();
        let mut args = vec![
            "-C".to_string(),
            format!("{}/", self.gocli_dir.display()),
            self.target.clone(),
        ];
        for (provider, digest) in digests {
            let var = BuildVar::new(provider, digest);
            if let Some(first) = seen.insert(var.name.clone(), provider) {
                return Err(Error::DuplicateVariable {
                    name: var.name,
                    first: first.clone(),
                    second: provider.clone(),
                });
            }
            args.push(var.to_argument());
        }
        Ok(args)
    }

    /// Run the build and return its combined stdout and stderr.
    /// A failed build carries the output in [Error::Failed].
    pub fn build_cli(&self, digests: &BTreeMap<Provider, Digest>) -> Result<String, Error> {
        let args = self.arguments(digests)?;
        info!("Building cli: {} {}", self.program, args.join(" "));

        let mut capture = tempfile::tempfile()?;
        let status = std::process::Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(capture.try_clone()?)
            .stderr(capture.try_clone()?)
            .status()
            .map_err(|source| Error::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let mut output = String::new();
        capture.seek(SeekFrom::Start(0))?;
        let mut raw = Vec::new();
        capture.read_to_end(&mut raw)?;
        output.push_str(&String::from_utf8_lossy(&raw));
        debug!("cli build finished with {status}");

        if status.success() {
            Ok(output)
        } else {
            Err(Error::Failed { status, output })
        }
    }
}
