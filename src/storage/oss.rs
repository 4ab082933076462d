//! OSS-compatible object storage backend.
//!
//! Requests are signed with the header signature scheme
//! (`Authorization: OSS <AccessKeyId>:<Signature>`, HMAC-SHA1 over the
//! verb, content headers, date and canonical resource). Access URLs follow
//! the bucket ACL: public-read buckets get a static URL, anything else a
//! time-limited signed URL.
//!
//! Buckets are addressed virtual-host style (`{bucket}.{endpoint}`) unless
//! path-style addressing is configured, in which case the bucket is the first
//! path segment.

use super::{BlobStore, StorageError, StorageErrorKind, StorageOp, StorageResult, validate_key};
use crate::config::OssSettings;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use hmac::{Hmac, Mac};
use log::{debug, warn};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::blocking::{Body, Client, RequestBuilder, Response};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, DATE};
use reqwest::{Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use sha1::Sha1;
use std::fs::File;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

type HmacSha1 = Hmac<Sha1>;

/// Characters left unescaped in object keys; `/` separates key segments.
const KEY_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~')
    .remove(b'/');

/// Characters left unescaped in query parameter values.
const QUERY_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Non-success reply from the object storage service.
#[derive(Debug, Error)]
#[error("OSS responded {status}: {}", .code.as_deref().unwrap_or("no error code"))]
pub struct OssResponseError {
    pub status: StatusCode,
    pub code: Option<String>,
    pub message: Option<String>,
}

/// Read access policy of a bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BucketAcl {
    Private,
    PublicRead,
    PublicReadWrite,
}

impl BucketAcl {
    fn from_grant(grant: &str) -> Self {
        match grant.trim() {
            "public-read" => BucketAcl::PublicRead,
            "public-read-write" => BucketAcl::PublicReadWrite,
            _ => BucketAcl::Private,
        }
    }

    pub fn is_public_read(&self) -> bool {
        matches!(self, BucketAcl::PublicRead | BucketAcl::PublicReadWrite)
    }
}

pub struct OssBlobStore {
    client: Client,
    scheme: String,
    host: String,
    bucket: String,
    access_key: String,
    secret_key: SecretString,
    url_expiry: Duration,
    path_style: bool,
}

impl OssBlobStore {
    pub fn new(settings: &OssSettings) -> StorageResult<Self> {
        let (scheme, host) = split_endpoint(&settings.endpoint)?;
        if settings.bucket.trim().is_empty() {
            return Err(StorageError::Config("bucket name is empty".to_string()));
        }

        let client = Client::builder()
            .build()
            .map_err(|e| StorageError::Config(format!("cannot build HTTP client: {e}")))?;

        Ok(Self {
            client,
            scheme,
            host,
            bucket: settings.bucket.clone(),
            access_key: settings.access_key.clone(),
            secret_key: settings.secret_key.clone(),
            url_expiry: settings.url_expiry,
            path_style: settings.path_style,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn bucket_url(&self) -> String {
        if self.path_style {
            format!("{}://{}/{}", self.scheme, self.host, self.bucket)
        } else {
            format!("{}://{}.{}", self.scheme, self.bucket, self.host)
        }
    }

    /// Unsigned URL of an object, valid when the bucket allows public reads.
    pub fn public_url(&self, key: &str) -> String {
        format!(
            "{}/{}",
            self.bucket_url(),
            utf8_percent_encode(key, KEY_ENCODE_SET)
        )
    }

    /// URL of an object carrying a signature that expires after `expires`.
    pub fn signed_url(&self, key: &str, expires: Duration) -> String {
        let expires_at = Utc::now().timestamp() + expires.as_secs() as i64;
        self.signed_url_at(key, expires_at)
    }

    /// Signed GET URL expiring at the given Unix timestamp.
    pub fn signed_url_at(&self, key: &str, expires_at: i64) -> String {
        let resource = self.object_resource(key);
        let signature = self.sign(&format!("GET\n\n\n{expires_at}\n{resource}"));

        format!(
            "{}?OSSAccessKeyId={}&Expires={}&Signature={}",
            self.public_url(key),
            utf8_percent_encode(&self.access_key, QUERY_ENCODE_SET),
            expires_at,
            utf8_percent_encode(&signature, QUERY_ENCODE_SET)
        )
    }

    /// Fetch the bucket's ACL.
    pub fn bucket_acl(&self) -> StorageResult<BucketAcl> {
        let url = format!("{}/?acl", self.bucket_url());
        let resource = format!("/{}/?acl", self.bucket);
        let (op, key) = (StorageOp::Download, "?acl");

        let body = self
            .signed_request(Method::GET, &url, &resource, "")
            .send()
            .map_err(|e| transport_error(op, key, e))
            .and_then(|response| check_status(op, key, response))
            .and_then(|response| response.text().map_err(|e| transport_error(op, key, e)))
            .inspect_err(|e| warn!("OSS ACL lookup failed: {e}"))?;

        Ok(extract_xml_tag(&body, "Grant")
            .map(BucketAcl::from_grant)
            .unwrap_or(BucketAcl::Private))
    }

    /// Access URL for `key`: static if the bucket is publicly readable,
    /// otherwise signed for `expires`. If the ACL cannot be read, a signed URL
    /// is returned, since signing needs no round trip.
    pub fn file_url(&self, key: &str, expires: Duration) -> String {
        match self.bucket_acl() {
            Ok(acl) if acl.is_public_read() => self.public_url(key),
            Ok(_) => self.signed_url(key, expires),
            Err(e) => {
                warn!("Could not read bucket ACL, falling back to a signed URL: {e}");
                self.signed_url(key, expires)
            }
        }
    }

    fn object_resource(&self, key: &str) -> String {
        format!("/{}/{}", self.bucket, key)
    }

    fn sign(&self, string_to_sign: &str) -> String {
        let mut mac = HmacSha1::new_from_slice(self.secret_key.expose_secret().as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(string_to_sign.as_bytes());
        STANDARD.encode(mac.finalize().into_bytes())
    }

    fn signed_request(
        &self,
        method: Method,
        url: &str,
        resource: &str,
        content_type: &str,
    ) -> RequestBuilder {
        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        let signature = self.sign(&format!(
            "{}\n\n{}\n{}\n{}",
            method.as_str(),
            content_type,
            date,
            resource
        ));

        let mut request = self
            .client
            .request(method, url)
            .header(DATE, date)
            .header(AUTHORIZATION, format!("OSS {}:{}", self.access_key, signature));
        if !content_type.is_empty() {
            request = request.header(CONTENT_TYPE, content_type);
        }
        request
    }

    fn object_request(&self, method: Method, key: &str, content_type: &str) -> RequestBuilder {
        self.signed_request(
            method,
            &self.public_url(key),
            &self.object_resource(key),
            content_type,
        )
    }
}

impl BlobStore for OssBlobStore {
    fn upload(&self, local_path: &Path, key: &str) -> StorageResult<String> {
        let op = StorageOp::Upload;
        validate_key(op, key)?;

        let file = File::open(local_path).map_err(|e| op.io_error(key, e))?;
        let content_type = content_type_for(local_path);

        self.object_request(Method::PUT, key, content_type)
            .body(Body::from(file))
            .send()
            .map_err(|e| transport_error(op, key, e))
            .and_then(|response| check_status(op, key, response))
            .inspect_err(|e| warn!("OSS upload failed: {e}"))?;

        debug!("Uploaded {} to oss://{}/{}", local_path.display(), self.bucket, key);
        Ok(self.file_url(key, self.url_expiry))
    }

    fn download(&self, key: &str, local_path: &Path) -> StorageResult<()> {
        let op = StorageOp::Download;
        validate_key(op, key)?;

        let mut response = self
            .object_request(Method::GET, key, "")
            .send()
            .map_err(|e| transport_error(op, key, e))
            .and_then(|response| check_status(op, key, response))
            .inspect_err(|e| warn!("OSS download failed: {e}"))?;

        if let Some(parent) = local_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| op.io_error(key, e))?;
        }
        let mut out = File::create(local_path).map_err(|e| op.io_error(key, e))?;
        response
            .copy_to(&mut out)
            .map_err(|e| transport_error(op, key, e))?;
        Ok(())
    }

    fn exists(&self, key: &str) -> StorageResult<bool> {
        let op = StorageOp::Exists;
        validate_key(op, key)?;

        let response = self
            .object_request(Method::HEAD, key, "")
            .send()
            .map_err(|e| transport_error(op, key, e))
            .inspect_err(|e| warn!("OSS existence check failed: {e}"))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        check_status(op, key, response)
            .inspect_err(|e| warn!("OSS existence check failed: {e}"))?;
        Ok(true)
    }

    fn delete(&self, key: &str) -> StorageResult<()> {
        let op = StorageOp::Delete;
        validate_key(op, key)?;

        self.object_request(Method::DELETE, key, "")
            .send()
            .map_err(|e| transport_error(op, key, e))
            .and_then(|response| check_status(op, key, response))
            .inspect_err(|e| warn!("OSS delete failed: {e}"))?;
        Ok(())
    }
}

/// Split `https://host` into scheme and host; a bare host means https.
fn split_endpoint(endpoint: &str) -> StorageResult<(String, String)> {
    let endpoint = endpoint.trim().trim_end_matches('/');
    let (scheme, host) = match endpoint.split_once("://") {
        Some((scheme, host)) => (scheme.to_ascii_lowercase(), host),
        None => ("https".to_string(), endpoint),
    };

    if scheme != "http" && scheme != "https" {
        return Err(StorageError::Config(format!(
            "unsupported endpoint scheme `{scheme}`"
        )));
    }
    if host.is_empty() || host.contains('/') {
        return Err(StorageError::Config(format!(
            "invalid endpoint `{endpoint}`"
        )));
    }
    Ok((scheme, host.to_string()))
}

fn content_type_for(path: &Path) -> &'static str {
    image::ImageFormat::from_path(path)
        .map(|format| format.to_mime_type())
        .unwrap_or("application/octet-stream")
}

fn classify_status(status: StatusCode) -> StorageErrorKind {
    match status {
        StatusCode::NOT_FOUND => StorageErrorKind::NotFound,
        StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => StorageErrorKind::PermissionDenied,
        _ => StorageErrorKind::Backend,
    }
}

fn transport_error(op: StorageOp, key: &str, err: reqwest::Error) -> StorageError {
    op.error(key, StorageErrorKind::Network, Some(Box::new(err)))
}

fn check_status(op: StorageOp, key: &str, response: Response) -> StorageResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().unwrap_or_default();
    let error = OssResponseError {
        status,
        code: extract_xml_tag(&body, "Code").map(str::to_string),
        message: extract_xml_tag(&body, "Message").map(str::to_string),
    };
    Err(op.error(key, classify_status(status), Some(Box::new(error))))
}

/// Trimmed text of the first `tag` element in `xml`. The opening tag may
/// carry a namespace prefix and attributes.
fn extract_xml_tag<'a>(xml: &'a str, tag: &str) -> Option<&'a str> {
    let mut offset = 0;
    while let Some(lt) = xml[offset..].find('<') {
        let head_start = offset + lt + 1;
        let head_len = xml[head_start..].find('>')?;
        let head = &xml[head_start..head_start + head_len];
        let body_start = head_start + head_len + 1;

        let name = head
            .split(|c: char| c.is_whitespace() || c == '/')
            .next()
            .unwrap_or_default();
        let local = name.rsplit(':').next().unwrap_or_default();
        if local == tag && !head.ends_with('/') {
            let close = format!("</{name}>");
            let body_len = xml[body_start..].find(&close)?;
            return Some(xml[body_start..body_start + body_len].trim());
        }
        offset = body_start;
    }
    None
}
