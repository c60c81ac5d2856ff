//! Push the working directory to `<prefix>/_workflow` before handing off to
//! Snakemake. Mirrors `aws s3 sync --delete`: upload what is new or newer,
//! drop remote objects with no local counterpart, and never ship the VCS
//! dir, Snakemake's own state, the config file or the cache file.

use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;
use std::time::SystemTime;

use anyhow::Context;
use aws_sdk_s3::primitives::ByteStream;
use tracing::debug;
use tracing::info;
use walkdir::WalkDir;

use crate::cloud::CloudClients;
use crate::config::Config;

const EXCLUDED_DIRS: [&str; 2] = [".snakemake", ".git"];

pub async fn sync_workdir(
    config: &Config,
    clients: &CloudClients,
    workdir: &Path,
    config_path: &Path,
) -> anyhow::Result<()> {
    let prefix = config.s3_prefix();
    let remote_prefix = format!("{}/", prefix.key("_workflow"));

    let skip = [
        config_path.canonicalize().ok(),
        config.cache.canonicalize().ok(),
    ];
    let local = collect_local_files(workdir, &skip)?;
    info!("syncing {} files to s3://{}", local.len(), config.prefix);

    // remote inventory first, so unchanged files can be skipped
    let mut remote: BTreeMap<String, (i64, SystemTime)> = BTreeMap::new();
    let mut pages = clients
        .s3
        .list_objects_v2()
        .bucket(prefix.bucket())
        .prefix(&remote_prefix)
        .into_paginator()
        .send();
    while let Some(page) = pages.next().await {
        for object in page?.contents() {
            let (Some(key), Some(size)) = (object.key(), object.size()) else {
                continue;
            };
            let Some(rel) = key.strip_prefix(&remote_prefix) else {
                continue;
            };
            let modified = object
                .last_modified()
                .and_then(|t| SystemTime::try_from(t.to_owned()).ok())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            remote.insert(rel.to_string(), (size, modified));
        }
    }

    for (rel, path) in &local {
        let metadata = std::fs::metadata(path)
            .with_context(|| format!("stat {}", path.display()))?;
        let size = i64::try_from(metadata.len()).unwrap_or(i64::MAX);
        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        if !wants_upload(size, modified, remote.get(rel).copied()) {
            debug!("unchanged: {rel}");
            continue;
        }
        clients
            .s3
            .put_object()
            .bucket(prefix.bucket())
            .key(format!("{remote_prefix}{rel}"))
            .body(ByteStream::from_path(path).await?)
            .send()
            .await?;
    }

    for rel in remote.keys() {
        if !local.contains_key(rel) {
            clients
                .s3
                .delete_object()
                .bucket(prefix.bucket())
                .key(format!("{remote_prefix}{rel}"))
                .send()
                .await?;
        }
    }
    Ok(())
}

fn collect_local_files(
    workdir: &Path,
    skip: &[Option<PathBuf>],
) -> anyhow::Result<BTreeMap<String, PathBuf>> {
    let mut files = BTreeMap::new();
    let walker = WalkDir::new(workdir).into_iter().filter_entry(|entry| {
        entry.depth() == 0
            || !EXCLUDED_DIRS
                .iter()
                .any(|dir| entry.file_name().to_str() == Some(dir))
    });
    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        if skip
            .iter()
            .flatten()
            .any(|path| entry.path().canonicalize().ok().as_deref() == Some(path.as_path()))
        {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(workdir)
            .context("walked outside the workdir")?
            .to_string_lossy()
            .into_owned();
        files.insert(rel, entry.path().to_path_buf());
    }
    Ok(files)
}

/// `aws s3 sync` semantics: upload when the object is missing, a different
/// size, or older than the local file.
fn wants_upload(
    local_size: i64,
    local_modified: SystemTime,
    remote: Option<(i64, SystemTime)>,
) -> bool {
    match remote {
        None => true,
        Some((remote_size, remote_modified)) => {
            remote_size != local_size || remote_modified < local_modified
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[test]
    fn uploads_missing_changed_and_newer_files() {
        let now = SystemTime::now();
        let earlier = now - Duration::from_secs(60);

        assert!(wants_upload(10, now, None));
        assert!(wants_upload(10, now, Some((11, now))));
        assert!(wants_upload(10, now, Some((10, earlier))));
        assert!(!wants_upload(10, earlier, Some((10, now))));
        assert!(!wants_upload(10, now, Some((10, now))));
    }

    #[test]
    fn walk_skips_vcs_state_and_given_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        std::fs::create_dir_all(root.join(".git")).expect("mkdir");
        std::fs::create_dir_all(root.join(".snakemake/locks")).expect("mkdir");
        std::fs::create_dir_all(root.join("rules")).expect("mkdir");
        for (path, body) in [
            ("Snakefile", "rule all: ..."),
            (".git/config", "[core]"),
            (".snakemake/locks/0", ""),
            ("rules/align.smk", "rule align: ..."),
            ("hyperdrive.yaml", "cache: hyperdrive.cache"),
            ("hyperdrive.cache", ""),
        ] {
            std::fs::write(root.join(path), body).expect("write");
        }

        let skip = [
            root.join("hyperdrive.yaml").canonicalize().ok(),
            root.join("hyperdrive.cache").canonicalize().ok(),
        ];
        let files = collect_local_files(root, &skip).expect("walk");
        let keys: Vec<&str> = files.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["Snakefile", "rules/align.smk"]);
    }
}
