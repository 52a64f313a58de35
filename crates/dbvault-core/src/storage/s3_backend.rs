use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::Duration;

use rusty_s3::actions::{CreateMultipartUpload, ListObjectsV2, S3Action};
use rusty_s3::{Bucket, Credentials, UrlStyle};
use tracing::debug;

use super::retry::{HttpRetryError, retry_http};
use crate::cancel::CancelToken;
use crate::config::RetryConfig;
use crate::error::{Result, VaultError};
use crate::pipeline::copy_with_cancel;
use crate::storage::{CancelReader, StorageBackend};

/// Duration for presigned URL validity.
const PRESIGN_DURATION: Duration = Duration::from_secs(3600);
/// Artifacts above this size are uploaded in parts.
const MULTIPART_THRESHOLD: u64 = 64 * 1024 * 1024;
const PART_SIZE: u64 = 64 * 1024 * 1024;
/// Largest object a single server-side copy may move.
const MAX_SINGLE_COPY: u64 = 5 * 1024 * 1024 * 1024;
const COPY_PART_SIZE: u64 = 1024 * 1024 * 1024;

const SSE_HEADER: &str = "x-amz-server-side-encryption";
const SSE_VALUE: &str = "AES256";
const LABEL: &str = "S3";

pub struct S3Backend {
    bucket: Bucket,
    credentials: Credentials,
    agent: ureq::Agent,
    retry: RetryConfig,
    /// Prefix prepended to all keys.
    root: String,
}

impl S3Backend {
    pub fn new(
        bucket_name: &str,
        region: &str,
        root: &str,
        endpoint: &str,
        access_key_id: &str,
        secret_access_key: &str,
        retry: RetryConfig,
    ) -> Result<Self> {
        let base_url = endpoint
            .parse()
            .map_err(|e| VaultError::Config(format!("invalid S3 endpoint URL '{endpoint}': {e}")))?;

        let bucket = Bucket::new(
            base_url,
            UrlStyle::Path,
            bucket_name.to_string(),
            region.to_string(),
        )
        .map_err(|e| VaultError::Config(format!("failed to create S3 bucket handle: {e}")))?;

        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(30))
            .timeout_read(Duration::from_secs(300))
            .timeout_write(Duration::from_secs(300))
            .build();

        Ok(Self {
            bucket,
            credentials: Credentials::new(access_key_id, secret_access_key),
            agent,
            retry,
            root: root.trim_matches('/').to_string(),
        })
    }

    fn full_key(&self, key: &str) -> String {
        if self.root.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.root, key)
        }
    }

    fn call<T>(
        &self,
        op: &str,
        cancel: &CancelToken,
        f: impl FnMut() -> std::result::Result<T, HttpRetryError>,
    ) -> Result<T> {
        retry_http(&self.retry, op, LABEL, cancel, f).map_err(|e| e.into_vault(LABEL, op))
    }

    /// S3 control responses are XML; parsers take `&str`.
    fn read_body(resp: ureq::Response) -> std::result::Result<String, HttpRetryError> {
        resp.into_string().map_err(HttpRetryError::BodyIo)
    }

    fn put_single(&self, key: &str, source: &Path, size: u64, cancel: &CancelToken) -> Result<()> {
        let full_key = self.full_key(key);
        let mut action = self.bucket.put_object(Some(&self.credentials), &full_key);
        action.headers_mut().insert(SSE_HEADER, SSE_VALUE);
        let url = action.sign(PRESIGN_DURATION);
        let length = size.to_string();

        self.call(&format!("PUT {key}"), cancel, || {
            let file = File::open(source).map_err(|e| HttpRetryError::Permanent(e.to_string()))?;
            let body = CancelReader::new(BufReader::new(file), cancel);
            self.agent
                .put(url.as_str())
                .set(SSE_HEADER, SSE_VALUE)
                .set("Content-Length", &length)
                .send(body)
                .map_err(HttpRetryError::http)
        })?;
        Ok(())
    }

    fn put_multipart(&self, key: &str, source: &Path, size: u64, cancel: &CancelToken) -> Result<()> {
        let full_key = self.full_key(key);
        let upload_id = self.create_multipart(key, &full_key, cancel)?;

        let result = (|| -> Result<Vec<String>> {
            let mut etags = Vec::new();
            let mut offset = 0u64;
            let mut part_number: u16 = 1;
            while offset < size {
                let len = PART_SIZE.min(size - offset);
                let url = self
                    .bucket
                    .upload_part(Some(&self.credentials), &full_key, part_number, &upload_id)
                    .sign(PRESIGN_DURATION);
                let length = len.to_string();
                let etag = self.call(&format!("UPLOAD_PART {key} #{part_number}"), cancel, || {
                    let mut file =
                        File::open(source).map_err(|e| HttpRetryError::Permanent(e.to_string()))?;
                    file.seek(SeekFrom::Start(offset))
                        .map_err(|e| HttpRetryError::Permanent(e.to_string()))?;
                    let body = CancelReader::new(BufReader::new(file).take(len), cancel);
                    let resp = self
                        .agent
                        .put(url.as_str())
                        .set("Content-Length", &length)
                        .send(body)
                        .map_err(HttpRetryError::http)?;
                    resp.header("ETag").map(str::to_string).ok_or_else(|| {
                        HttpRetryError::Permanent("part upload response has no ETag".into())
                    })
                })?;
                debug!(key, part_number, len, "uploaded part");
                etags.push(etag);
                offset += len;
                part_number += 1;
            }
            Ok(etags)
        })();

        match result {
            Ok(etags) => {
                let action = self.bucket.complete_multipart_upload(
                    Some(&self.credentials),
                    &full_key,
                    &upload_id,
                    etags.iter().map(String::as_str),
                );
                let url = action.sign(PRESIGN_DURATION);
                let body = action.body();
                self.call(&format!("COMPLETE {key}"), cancel, || {
                    let resp = self
                        .agent
                        .post(url.as_str())
                        .send_string(&body)
                        .map_err(HttpRetryError::http)?;
                    Self::read_body(resp)
                })?;
                Ok(())
            }
            Err(e) => {
                self.abort_multipart(&full_key, &upload_id);
                Err(e)
            }
        }
    }

    fn create_multipart(&self, key: &str, full_key: &str, cancel: &CancelToken) -> Result<String> {
        let mut action = self
            .bucket
            .create_multipart_upload(Some(&self.credentials), full_key);
        action.headers_mut().insert(SSE_HEADER, SSE_VALUE);
        let url = action.sign(PRESIGN_DURATION);
        self.call(&format!("CREATE_MULTIPART {key}"), cancel, || {
            let resp = self
                .agent
                .post(url.as_str())
                .set(SSE_HEADER, SSE_VALUE)
                .call()
                .map_err(HttpRetryError::http)?;
            let body = Self::read_body(resp)?;
            CreateMultipartUpload::parse_response(&body)
                .map(|parsed| parsed.upload_id().to_string())
                .map_err(|e| HttpRetryError::Permanent(format!("bad response: {e}")))
        })
    }

    fn abort_multipart(&self, full_key: &str, upload_id: &str) {
        let url = self
            .bucket
            .abort_multipart_upload(Some(&self.credentials), full_key, upload_id)
            .sign(PRESIGN_DURATION);
        if let Err(e) = self.agent.delete(url.as_str()).call() {
            tracing::warn!(key = full_key, error = %e, "failed to abort multipart upload");
        }
    }

    fn head_size(&self, key: &str, cancel: &CancelToken) -> Result<Option<u64>> {
        let url = self
            .bucket
            .head_object(Some(&self.credentials), &self.full_key(key))
            .sign(PRESIGN_DURATION);
        self.call(&format!("HEAD {key}"), cancel, || {
            match self.agent.head(url.as_str()).call() {
                Ok(resp) => resp
                    .header("Content-Length")
                    .and_then(|v| v.parse::<u64>().ok())
                    .map(Some)
                    .ok_or_else(|| HttpRetryError::Permanent("missing Content-Length".into())),
                Err(ureq::Error::Status(404, _)) => Ok(None),
                Err(e) => Err(HttpRetryError::http(e)),
            }
        })
    }

    fn copy_source(&self, full_key: &str) -> String {
        format!("/{}/{}", self.bucket.name(), full_key)
    }

    /// Server-side copy; multipart for objects above the single-copy limit.
    fn server_copy(&self, from: &str, to: &str, cancel: &CancelToken) -> Result<()> {
        let size = self
            .head_size(from, cancel)?
            .ok_or_else(|| VaultError::ArtifactMissing(from.to_string()))?;
        let source = self.copy_source(&self.full_key(from));
        let dest_key = self.full_key(to);

        if size <= MAX_SINGLE_COPY {
            let mut action = self.bucket.put_object(Some(&self.credentials), &dest_key);
            action.headers_mut().insert("x-amz-copy-source", source.clone());
            action.headers_mut().insert(SSE_HEADER, SSE_VALUE);
            let url = action.sign(PRESIGN_DURATION);
            self.call(&format!("COPY {from} -> {to}"), cancel, || {
                let resp = self
                    .agent
                    .put(url.as_str())
                    .set("x-amz-copy-source", &source)
                    .set(SSE_HEADER, SSE_VALUE)
                    .call()
                    .map_err(HttpRetryError::http)?;
                // S3 can report a failed copy inside a 200 response.
                let body = Self::read_body(resp)?;
                if body.contains("<Error>") {
                    return Err(HttpRetryError::Permanent("copy failed".into()));
                }
                Ok(())
            })?;
            return Ok(());
        }

        let upload_id = self.create_multipart(to, &dest_key, cancel)?;
        let result = (|| -> Result<Vec<String>> {
            let mut etags = Vec::new();
            let mut offset = 0u64;
            let mut part_number: u16 = 1;
            while offset < size {
                let end = (offset + COPY_PART_SIZE).min(size) - 1;
                let range = format!("bytes={offset}-{end}");
                let mut action = self.bucket.upload_part(
                    Some(&self.credentials),
                    &dest_key,
                    part_number,
                    &upload_id,
                );
                action.headers_mut().insert("x-amz-copy-source", source.clone());
                action.headers_mut().insert("x-amz-copy-source-range", range.clone());
                let url = action.sign(PRESIGN_DURATION);
                let etag = self.call(&format!("COPY_PART {to} #{part_number}"), cancel, || {
                    let resp = self
                        .agent
                        .put(url.as_str())
                        .set("x-amz-copy-source", &source)
                        .set("x-amz-copy-source-range", &range)
                        .call()
                        .map_err(HttpRetryError::http)?;
                    let body = Self::read_body(resp)?;
                    extract_etag(&body).ok_or_else(|| {
                        HttpRetryError::Permanent("copy part response has no ETag".into())
                    })
                })?;
                etags.push(etag);
                offset = end + 1;
                part_number += 1;
            }
            Ok(etags)
        })();

        match result {
            Ok(etags) => {
                let action = self.bucket.complete_multipart_upload(
                    Some(&self.credentials),
                    &dest_key,
                    &upload_id,
                    etags.iter().map(String::as_str),
                );
                let url = action.sign(PRESIGN_DURATION);
                let body = action.body();
                self.call(&format!("COMPLETE {to}"), cancel, || {
                    let resp = self
                        .agent
                        .post(url.as_str())
                        .send_string(&body)
                        .map_err(HttpRetryError::http)?;
                    Self::read_body(resp)
                })?;
                Ok(())
            }
            Err(e) => {
                self.abort_multipart(&dest_key, &upload_id);
                Err(e)
            }
        }
    }
}

fn extract_etag(xml: &str) -> Option<String> {
    let start = xml.find("<ETag>")? + "<ETag>".len();
    let end = xml[start..].find("</ETag>")? + start;
    Some(xml[start..end].replace("&quot;", "\""))
}

impl StorageBackend for S3Backend {
    fn put_file(&self, key: &str, source: &Path, cancel: &CancelToken) -> Result<()> {
        let size = std::fs::metadata(source)?.len();
        if size > MULTIPART_THRESHOLD {
            self.put_multipart(key, source, size, cancel)
        } else {
            self.put_single(key, source, size, cancel)
        }
    }

    fn get_to_file(&self, key: &str, dest: &Path, cancel: &CancelToken) -> Result<bool> {
        let url = self
            .bucket
            .get_object(Some(&self.credentials), &self.full_key(key))
            .sign(PRESIGN_DURATION);

        self.call(&format!("GET {key}"), cancel, || {
            match self.agent.get(url.as_str()).call() {
                Ok(resp) => {
                    // Each attempt rewrites the destination from scratch.
                    let file =
                        File::create(dest).map_err(|e| HttpRetryError::Permanent(e.to_string()))?;
                    let mut writer = std::io::BufWriter::new(file);
                    let mut reader = resp.into_reader();
                    copy_with_cancel(&mut reader, &mut writer, cancel).map_err(|e| match e {
                        VaultError::Cancelled => HttpRetryError::Cancelled,
                        VaultError::Io(io) => HttpRetryError::BodyIo(io),
                        other => HttpRetryError::Permanent(other.to_string()),
                    })?;
                    writer.flush().map_err(HttpRetryError::BodyIo)?;
                    Ok(true)
                }
                Err(ureq::Error::Status(404, _)) => Ok(false),
                Err(e) => Err(HttpRetryError::http(e)),
            }
        })
    }

    fn delete(&self, key: &str) -> Result<()> {
        let url = self
            .bucket
            .delete_object(Some(&self.credentials), &self.full_key(key))
            .sign(PRESIGN_DURATION);
        self.call(&format!("DELETE {key}"), &CancelToken::new(), || {
            match self.agent.delete(url.as_str()).call() {
                Ok(_) | Err(ureq::Error::Status(404, _)) => Ok(()),
                Err(e) => Err(HttpRetryError::http(e)),
            }
        })
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.head_size(key, &CancelToken::new())?.is_some())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let full_prefix = self.full_key(prefix);
        let root_prefix_len = if self.root.is_empty() {
            0
        } else {
            self.root.len() + 1
        };

        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;
        loop {
            let mut action = self.bucket.list_objects_v2(Some(&self.credentials));
            action.query_mut().insert("prefix", full_prefix.clone());
            if let Some(ref token) = continuation_token {
                action.query_mut().insert("continuation-token", token.clone());
            }
            let url = action.sign(PRESIGN_DURATION);

            let parsed = self.call(&format!("LIST {prefix}"), &CancelToken::new(), || {
                let resp = self
                    .agent
                    .get(url.as_str())
                    .call()
                    .map_err(HttpRetryError::http)?;
                let body = Self::read_body(resp)?;
                ListObjectsV2::parse_response(&body)
                    .map_err(|e| HttpRetryError::Permanent(format!("bad response: {e}")))
            })?;

            for obj in &parsed.contents {
                if obj.key.ends_with('/') {
                    continue;
                }
                keys.push(obj.key.get(root_prefix_len..).unwrap_or(&obj.key).to_string());
            }

            match parsed.next_continuation_token {
                Some(token) => continuation_token = Some(token),
                None => break,
            }
        }
        Ok(keys)
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let cancel = CancelToken::new();
        self.server_copy(from, to, &cancel)?;
        self.delete(from)
    }
}
