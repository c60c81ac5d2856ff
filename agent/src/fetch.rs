//! Pull the jobscript and the synced workflow tree from object storage,
//! then hand the whole base dir to the worker user.

use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use hyperdrive_protocol::AgentPayload;
use hyperdrive_protocol::S3Prefix;
use tokio::io::AsyncWriteExt;
use walkdir::WalkDir;

use crate::JOBSCRIPT_PATH;
use crate::WORKFLOW_DIR;
use crate::user::WorkerUser;

pub async fn fetch_job(s3: &aws_sdk_s3::Client, payload: &AgentPayload) -> anyhow::Result<()> {
    let prefix = S3Prefix::parse(&payload.prefix);
    download(
        s3,
        prefix.bucket(),
        &prefix.key(&format!("_jobs/{}", payload.jobid)),
        Path::new(JOBSCRIPT_PATH),
    )
    .await?;
    sync_remote_prefix(s3, &prefix, "_workflow", Path::new(WORKFLOW_DIR)).await?;
    Ok(())
}

async fn download(
    s3: &aws_sdk_s3::Client,
    bucket: &str,
    key: &str,
    dest: &Path,
) -> anyhow::Result<()> {
    let mut object = s3
        .get_object()
        .bucket(bucket)
        .key(key)
        .send()
        .await
        .with_context(|| format!("fetching s3://{bucket}/{key}"))?;
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::File::create(dest)
        .await
        .with_context(|| format!("creating {}", dest.display()))?;
    while let Some(chunk) = object.body.try_next().await? {
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    Ok(())
}

async fn sync_remote_prefix(
    s3: &aws_sdk_s3::Client,
    prefix: &S3Prefix,
    tail: &str,
    dest: &Path,
) -> anyhow::Result<()> {
    let remote_prefix = format!("{}/", prefix.key(tail));
    let mut keys: Vec<(String, PathBuf)> = Vec::new();
    let mut pages = s3
        .list_objects_v2()
        .bucket(prefix.bucket())
        .prefix(&remote_prefix)
        .into_paginator()
        .send();
    while let Some(page) = pages.next().await {
        for object in page?.contents() {
            let Some(key) = object.key() else {
                continue;
            };
            let Some(rel) = key.strip_prefix(&remote_prefix) else {
                continue;
            };
            if rel.is_empty() || rel.ends_with('/') {
                continue;
            }
            keys.push((key.to_string(), dest.join(rel)));
        }
    }
    for (key, local) in keys {
        download(s3, prefix.bucket(), &key, &local).await?;
    }
    Ok(())
}

pub fn chown_tree(root: &Path, worker: WorkerUser) -> anyhow::Result<()> {
    for entry in WalkDir::new(root) {
        let entry = entry?;
        std::os::unix::fs::chown(entry.path(), Some(worker.uid), Some(worker.gid))
            .with_context(|| format!("chown {}", entry.path().display()))?;
    }
    Ok(())
}
