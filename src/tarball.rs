use std::fs::File;
use std::path::{Path, PathBuf};
use flate2::write::GzEncoder;
use flate2::Compression;
use log::{debug, info};
use thiserror::Error;

/// Staging subdirectory of the working directory.
pub const STAGING_DIR: &str = "kubevirtci";
pub const ARCHIVE_NAME: &str = "kubevirtci.tar.gz";
/// Name of the cli binary at the archive root.
pub const CLI_NAME: &str = "cli";
/// Bringup assets, relative to the kubevirtci checkout.
pub const CLUSTER_UP_DIR: &str = "cluster-up";

#[derive(Error, Debug)]
pub enum Error {
    #[error("clean staging directory {path}: {source}")]
    Clean {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("copy {from} to {to}: {source}")]
    Copy {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },

    #[error("read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("write archive {path}: {source}")]
    Archive {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Packs the bringup assets and the cli into the release archive.
#[derive(Debug, Clone)]
pub struct TarballAssembler {
    cluster_up_dir: PathBuf,
    cli_path: PathBuf,
}

impl TarballAssembler {
    pub fn new(kubevirtci_path: &Path, cli_path: &Path) -> Self {
        Self {
            cluster_up_dir: kubevirtci_path.join(CLUSTER_UP_DIR),
            cli_path: cli_path.to_path_buf(),
        }
    }

    /// Stage the release files under `working_dir` and archive them.
    /// A staging directory left by an earlier run is removed first.
    /// Returns the archive path.
    pub fn build_release_tarball(&self, working_dir: &Path) -> Result<PathBuf, Error> {
        let staging = working_dir.join(STAGING_DIR);
        clean_dir(&staging)?;
        create_dir(&staging)?;

        info!("Staging {} into {}", self.cluster_up_dir.display(), staging.display());
        copy_dir(&self.cluster_up_dir, &staging)?;

        let cli = staging.join(CLI_NAME);
        if cli.symlink_metadata().is_ok() {
            return Err(Error::Copy {
                from: self.cli_path.clone(),
                to: cli,
                source: std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    format!("{CLUSTER_UP_DIR}/{CLI_NAME} collides with the cli binary"),
                ),
            });
        }
        copy_file(&self.cli_path, &cli)?;

        let archive = staging.join(ARCHIVE_NAME);
        create_tarball(&staging, &archive)?;
        info!("Release archive written to {}", archive.display());
        Ok(archive)
    }
}

fn clean_dir(path: &Path) -> Result<(), Error> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => {
            debug!("Removed stale {}", path.display());
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(Error::Clean {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn create_dir(path: &Path) -> Result<(), Error> {
    std::fs::create_dir_all(path).map_err(|source| Error::CreateDir {
        path: path.to_path_buf(),
        source,
    })
}

fn copy_file(from: &Path, to: &Path) -> Result<(), Error> {
    std::fs::copy(from, to).map(|_| ()).map_err(|source| Error::Copy {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        source,
    })
}

/// Entries of `dir`, sorted by name.
fn read_dir_sorted(dir: &Path) -> Result<Vec<PathBuf>, Error> {
    let read_error = |source| Error::Read {
        path: dir.to_path_buf(),
        source,
    };
    let mut entries = std::fs::read_dir(dir)
        .map_err(read_error)?
        .map(|entry| entry.map(|entry| entry.path()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(read_error)?;
    entries.sort();
    Ok(entries)
}

fn symlink_metadata(path: &Path) -> Result<std::fs::Metadata, Error> {
    std::fs::symlink_metadata(path).map_err(|source| Error::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn read_link(path: &Path) -> Result<PathBuf, Error> {
    std::fs::read_link(path).map_err(|source| Error::Read {
        path: path.to_path_buf(),
        source,
    })
}

/// Copy the contents of `from` into `to`, recursively.
/// Symlinks are recreated as symlinks, never followed.
fn copy_dir(from: &Path, to: &Path) -> Result<(), Error> {
    for path in read_dir_sorted(from)? {
        let Some(name) = path.file_name() else {
            continue;
        };
        let target = to.join(name);
        let metadata = symlink_metadata(&path)?;
        if metadata.file_type().is_symlink() {
            copy_symlink(&path, &target)?;
        } else if metadata.is_dir() {
            create_dir(&target)?;
            copy_dir(&path, &target)?;
        } else {
            copy_file(&path, &target)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(from: &Path, to: &Path) -> Result<(), Error> {
    let link = read_link(from)?;
    std::os::unix::fs::symlink(&link, to).map_err(|source| Error::Copy {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        source,
    })
}

#[cfg(not(unix))]
fn copy_symlink(from: &Path, to: &Path) -> Result<(), Error> {
    Err(Error::Copy {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        source: std::io::Error::new(std::io::ErrorKind::Unsupported, "symlinks are not supported"),
    })
}

/// Write a gzipped tar of every file below `root` to `archive`,
/// with names relative to `root`. The archive itself is skipped.
fn create_tarball(root: &Path, archive: &Path) -> Result<(), Error> {
    let archive_error = |source| Error::Archive {
        path: archive.to_path_buf(),
        source,
    };
    let file = File::create(archive).map_err(archive_error)?;
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    append_dir(&mut builder, root, root, archive)?;
    let encoder = builder.into_inner().map_err(archive_error)?;
    encoder.finish().map_err(archive_error)?;
    Ok(())
}

fn append_dir<W: std::io::Write>(
    builder: &mut tar::Builder<W>,
    root: &Path,
    dir: &Path,
    archive: &Path,
) -> Result<(), Error> {
    for path in read_dir_sorted(dir)? {
        if path == archive {
            continue;
        }
        let metadata = symlink_metadata(&path)?;
        let name = path.strip_prefix(root).unwrap_or(&path);

        let mut header = tar::Header::new_ustar();
        header.set_mtime(mtime(&metadata));
        header.set_mode(mode(&metadata));

        let archive_error = |source| Error::Archive {
            path: archive.to_path_buf(),
            source,
        };
        if metadata.file_type().is_symlink() {
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            header.set_link_name(read_link(&path)?).map_err(archive_error)?;
            builder
                .append_data(&mut header, name, std::io::empty())
                .map_err(archive_error)?;
        } else if metadata.is_dir() {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            builder
                .append_data(&mut header, name, std::io::empty())
                .map_err(archive_error)?;
            append_dir(builder, root, &path, archive)?;
        } else {
            debug!("Adding {} to archive", name.display());
            let file = File::open(&path).map_err(|source| Error::Read {
                path: path.clone(),
                source,
            })?;
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(metadata.len());
            builder.append_data(&mut header, name, file).map_err(archive_error)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode(metadata: &std::fs::Metadata) -> u32 {
    match (metadata.is_dir(), metadata.permissions().readonly()) {
        (true, _) => 0o755,
        (false, true) => 0o444,
        (false, false) => 0o644,
    }
}

fn mtime(metadata: &std::fs::Metadata) -> u64 {
    metadata
        .modified()
        .ok()
        .and_then(|modified| modified.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|since| since.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use flate2::read::GzDecoder;

    /// Every regular file below `dir`, keyed by its relative path.
    fn files(dir: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
        fn walk(root: &Path, dir: &Path, out: &mut BTreeMap<PathBuf, Vec<u8>>) {
            for entry in std::fs::read_dir(dir).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    walk(root, &path, out);
                } else {
                    out.insert(path.strip_prefix(root).unwrap().to_path_buf(), std::fs::read(&path).unwrap());
                }
            }
        }
        let mut out = BTreeMap::new();
        walk(dir, dir, &mut out);
        out
    }

    fn kubevirtci_tree(root: &Path) -> PathBuf {
        let cluster_up = root.join(CLUSTER_UP_DIR);
        std::fs::create_dir_all(cluster_up.join("cluster/k8s-1.18")).unwrap();
        std::fs::create_dir_all(cluster_up.join("hack")).unwrap();
        std::fs::write(cluster_up.join("up.sh"), "#!/bin/bash\nexec cli run\n").unwrap();
        std::fs::write(cluster_up.join("README.md"), "# kubevirtci\n").unwrap();
        std::fs::write(cluster_up.join("cluster/k8s-1.18/provider.sh"), "provider=k8s-1.18\n").unwrap();
        std::fs::write(cluster_up.join("hack/common.sh"), vec![0u8, 1, 2, 255]).unwrap();

        let cli = root.join("cli-build");
        std::fs::write(&cli, b"\x7fELF fake cli").unwrap();
        cli
    }

    fn extract(archive: &Path, into: &Path) -> Vec<tar::Header> {
        let mut tar = tar::Archive::new(GzDecoder::new(File::open(archive).unwrap()));
        let headers = tar
            .entries()
            .unwrap()
            .map(|entry| entry.unwrap().header().clone())
            .collect();
        let mut tar = tar::Archive::new(GzDecoder::new(File::open(archive).unwrap()));
        tar.unpack(into).unwrap();
        headers
    }

    #[test]
    fn archive_holds_cluster_up_and_cli() {
        let source = tempfile::tempdir().unwrap();
        let cli = kubevirtci_tree(source.path());
        let working_dir = tempfile::tempdir().unwrap();

        let assembler = TarballAssembler::new(source.path(), &cli);
        let archive = assembler.build_release_tarball(working_dir.path()).unwrap();
        assert_eq!(archive, working_dir.path().join(STAGING_DIR).join(ARCHIVE_NAME));

        let extracted = tempfile::tempdir().unwrap();
        let headers = extract(&archive, extracted.path());
        for header in &headers {
            let path = header.path().unwrap();
            assert!(path.is_relative(), "{} is not relative", path.display());
        }

        let mut expected = files(&source.path().join(CLUSTER_UP_DIR));
        expected.insert(PathBuf::from(CLI_NAME), std::fs::read(&cli).unwrap());
        assert_eq!(files(extracted.path()), expected);
    }

    #[cfg(unix)]
    #[test]
    fn archive_keeps_permission_bits() {
        use std::os::unix::fs::PermissionsExt;

        let source = tempfile::tempdir().unwrap();
        let cli = kubevirtci_tree(source.path());
        std::fs::set_permissions(&cli, std::fs::Permissions::from_mode(0o755)).unwrap();
        std::fs::set_permissions(
            source.path().join(CLUSTER_UP_DIR).join("README.md"),
            std::fs::Permissions::from_mode(0o640),
        )
        .unwrap();
        let working_dir = tempfile::tempdir().unwrap();

        let archive = TarballAssembler::new(source.path(), &cli)
            .build_release_tarball(working_dir.path())
            .unwrap();
        let extracted = tempfile::tempdir().unwrap();
        let modes: BTreeMap<PathBuf, u32> = extract(&archive, extracted.path())
            .iter()
            .map(|header| (header.path().unwrap().to_path_buf(), header.mode().unwrap()))
            .collect();
        assert_eq!(modes[Path::new(CLI_NAME)], 0o755);
        assert_eq!(modes[Path::new("README.md")], 0o640);
    }

    #[test]
    fn missing_cli_is_an_error() {
        let source = tempfile::tempdir().unwrap();
        kubevirtci_tree(source.path());
        let working_dir = tempfile::tempdir().unwrap();

        let err = TarballAssembler::new(source.path(), &source.path().join("missing"))
            .build_release_tarball(working_dir.path())
            .unwrap_err();
        assert!(matches!(err, Error::Copy { .. }));
    }

    #[test]
    fn missing_cluster_up_is_an_error() {
        let source = tempfile::tempdir().unwrap();
        let working_dir = tempfile::tempdir().unwrap();

        let err = TarballAssembler::new(source.path(), &source.path().join("cli"))
            .build_release_tarball(working_dir.path())
            .unwrap_err();
        assert!(matches!(err, Error::Read { .. }));
    }

    fn archive_names(archive: &Path) -> Vec<String> {
        let mut tar = tar::Archive::new(GzDecoder::new(File::open(archive).unwrap()));
        tar.entries()
            .unwrap()
            .map(|entry| entry.unwrap().path().unwrap().display().to_string())
            .collect()
    }

    #[test]
    fn reused_working_dir_drops_stale_files() {
        let source = tempfile::tempdir().unwrap();
        let cli = kubevirtci_tree(source.path());
        let cluster_up = source.path().join(CLUSTER_UP_DIR);
        std::fs::write(cluster_up.join("old.sh"), "old\n").unwrap();
        let working_dir = tempfile::tempdir().unwrap();
        let assembler = TarballAssembler::new(source.path(), &cli);

        let archive = assembler.build_release_tarball(working_dir.path()).unwrap();
        assert!(archive_names(&archive).contains(&"old.sh".to_string()));

        std::fs::remove_file(cluster_up.join("old.sh")).unwrap();
        std::fs::write(cluster_up.join("new.sh"), "new\n").unwrap();
        let archive = assembler.build_release_tarball(working_dir.path()).unwrap();

        let names = archive_names(&archive);
        assert!(names.contains(&"new.sh".to_string()));
        assert!(!names.contains(&"old.sh".to_string()), "{names:?}");
        assert!(!names.contains(&ARCHIVE_NAME.to_string()), "{names:?}");
    }

    #[test]
    fn cli_in_cluster_up_is_a_collision() {
        let source = tempfile::tempdir().unwrap();
        let cli = kubevirtci_tree(source.path());
        std::fs::write(source.path().join(CLUSTER_UP_DIR).join(CLI_NAME), "not the binary").unwrap();
        let working_dir = tempfile::tempdir().unwrap();

        let err = TarballAssembler::new(source.path(), &cli)
            .build_release_tarball(working_dir.path())
            .unwrap_err();
        match err {
            Error::Copy { source, .. } => assert_eq!(source.kind(), std::io::ErrorKind::AlreadyExists),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_archived_as_links() {
        let source = tempfile::tempdir().unwrap();
        let cli = kubevirtci_tree(source.path());
        let cluster_up = source.path().join(CLUSTER_UP_DIR);
        std::os::unix::fs::symlink(".", cluster_up.join("hack/loop")).unwrap();
        std::os::unix::fs::symlink("does-not-exist", cluster_up.join("dangling")).unwrap();
        let working_dir = tempfile::tempdir().unwrap();

        let archive = TarballAssembler::new(source.path(), &cli)
            .build_release_tarball(working_dir.path())
            .unwrap();

        let mut tar = tar::Archive::new(GzDecoder::new(File::open(&archive).unwrap()));
        let links: BTreeMap<String, PathBuf> = tar
            .entries()
            .unwrap()
            .map(|entry| entry.unwrap().header().clone())
            .filter(|header| header.entry_type() == tar::EntryType::Symlink)
            .map(|header| {
                (
                    header.path().unwrap().display().to_string(),
                    header.link_name().unwrap().unwrap().to_path_buf(),
                )
            })
            .collect();
        assert_eq!(
            links,
            BTreeMap::from([
                ("dangling".to_string(), PathBuf::from("does-not-exist")),
                ("hack/loop".to_string(), PathBuf::from(".")),
            ])
        );
    }
}
