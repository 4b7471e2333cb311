/// Alibaba-style OSS backend
///
/// OSS exposes an S3-like HTTP API but with its own header-signing
/// scheme (HMAC-SHA1 over a canonical string), so this backend signs
/// requests by hand over a plain `reqwest` client instead of pulling in
/// a vendor SDK.
use crate::{
    clamp_ttl, rewrite_to_public, CompletedPart, ObjectMeta, Result, StorageAdapter,
    StorageConfig, StorageError, StorageObject, UploadResult,
};
use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Client as HttpClient, Method, Response};
use sha1::Sha1;
use std::time::Duration;

type HmacSha1 = Hmac<Sha1>;

/// Request timeout for OSS calls. Large-original downloads dominate,
/// so this is generous.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

pub struct OssAdapter {
    http: HttpClient,
    bucket: String,
    /// Virtual-host endpoint, e.g. "photos.oss-cn-hangzhou.aliyuncs.com"
    host: String,
    scheme: String,
    access_key_id: String,
    access_key_secret: String,
    public_endpoint: Option<String>,
}

impl OssAdapter {
    pub fn new(cfg: &StorageConfig) -> Result<Self> {
        let endpoint = cfg.endpoint.as_deref().ok_or_else(|| {
            StorageError::InvalidRequest("OSS backend requires STORAGE_ENDPOINT".to_string())
        })?;

        let (scheme, endpoint_host) = match endpoint.split_once("://") {
            Some((scheme, host)) => (scheme.to_string(), host.trim_end_matches('/').to_string()),
            None => ("https".to_string(), endpoint.trim_end_matches('/').to_string()),
        };

        let access_key_id = cfg.access_key_id.clone().ok_or_else(|| {
            StorageError::InvalidRequest("OSS backend requires STORAGE_ACCESS_KEY_ID".to_string())
        })?;
        let access_key_secret = cfg.secret_access_key.clone().ok_or_else(|| {
            StorageError::InvalidRequest(
                "OSS backend requires STORAGE_SECRET_ACCESS_KEY".to_string(),
            )
        })?;

        let http = HttpClient::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| StorageError::Backend(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            http,
            bucket: cfg.bucket.clone(),
            host: format!("{}.{}", cfg.bucket, endpoint_host),
            scheme,
            access_key_id,
            access_key_secret,
            public_endpoint: cfg.public_endpoint.clone(),
        })
    }

    /// Request URL for a key. The path is percent-encoded; the
    /// canonical resource used for signing keeps the raw key.
    fn object_url(&self, key: &str, subresource: &str) -> String {
        format!(
            "{}://{}/{}{}",
            self.scheme,
            self.host,
            encode_key_path(key),
            subresource
        )
    }

    /// HMAC-SHA1 signature over the OSS canonical string.
    fn sign(&self, string_to_sign: &str) -> String {
        let mut mac = HmacSha1::new_from_slice(self.access_key_secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(string_to_sign.as_bytes());
        base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
    }

    fn authorization(
        &self,
        method: &Method,
        content_type: &str,
        date: &str,
        oss_headers: &[(String, String)],
        resource: &str,
    ) -> String {
        let mut canonical_headers = String::new();
        let mut sorted: Vec<_> = oss_headers.to_vec();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        for (k, v) in &sorted {
            canonical_headers.push_str(&format!("{}:{}\n", k.to_ascii_lowercase(), v));
        }

        let string_to_sign = format!(
            "{method}\n\n{content_type}\n{date}\n{canonical_headers}{resource}"
        );
        format!("OSS {}:{}", self.access_key_id, self.sign(&string_to_sign))
    }

    /// Issue one signed request. `subresource` (e.g. "?uploads") is part
    /// of both the URL and the canonical resource.
    async fn request(
        &self,
        method: Method,
        key: &str,
        subresource: &str,
        content_type: Option<&str>,
        oss_headers: &[(String, String)],
        body: Option<Bytes>,
    ) -> Result<Response> {
        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        let resource = format!("/{}/{}{}", self.bucket, key, subresource);
        let content_type = content_type.unwrap_or("");
        let authorization =
            self.authorization(&method, content_type, &date, oss_headers, &resource);

        let mut req = self
            .http
            .request(method, self.object_url(key, subresource))
            .header("Date", date)
            .header("Authorization", authorization);

        if !content_type.is_empty() {
            req = req.header("Content-Type", content_type);
        }
        for (k, v) in oss_headers {
            req = req.header(k, v);
        }
        if let Some(body) = body {
            req = req.body(body);
        }

        req.send().await.map_err(|e| map_reqwest_err(key, e))
    }

    async fn check_status(op: &str, key: &str, response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(map_status(op, key, status.as_u16(), &body))
    }

    fn meta_headers(meta: &ObjectMeta) -> Vec<(String, String)> {
        meta.metadata
            .iter()
            .map(|(k, v)| (format!("x-oss-meta-{}", k.to_ascii_lowercase()), v.clone()))
            .collect()
    }

    fn etag_of(response: &Response) -> Option<String> {
        response
            .headers()
            .get("etag")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.trim_matches('"').to_string())
    }

    /// Query-signed URL (OSS "URL signature" scheme).
    fn presign(&self, method: &str, key: &str, ttl: Duration) -> Result<String> {
        let expires = (Utc::now() + clamp_ttl(ttl)).timestamp();
        let string_to_sign = format!("{method}\n\n\n{expires}\n/{}/{}", self.bucket, key);
        let signature: String =
            url::form_urlencoded::byte_serialize(self.sign(&string_to_sign).as_bytes()).collect();

        let url = format!(
            "{}?OSSAccessKeyId={}&Expires={}&Signature={}",
            self.object_url(key, ""),
            self.access_key_id,
            expires,
            signature
        );

        match &self.public_endpoint {
            Some(endpoint) => rewrite_to_public(&url, endpoint),
            None => Ok(url),
        }
    }
}

#[async_trait]
impl StorageAdapter for OssAdapter {
    async fn download(&self, key: &str) -> Result<Bytes> {
        let response = self
            .request(Method::GET, key, "", None, &[], None)
            .await?;
        let response = Self::check_status("download", key, response).await?;

        response
            .bytes()
            .await
            .map_err(|e| StorageError::Transient(format!("failed to read body of {key}: {e}")))
    }

    async fn upload(&self, key: &str, data: Bytes, meta: ObjectMeta) -> Result<UploadResult> {
        let headers = Self::meta_headers(&meta);
        let response = self
            .request(
                Method::PUT,
                key,
                "",
                meta.content_type.as_deref(),
                &headers,
                Some(data),
            )
            .await?;
        let response = Self::check_status("upload", key, response).await?;

        Ok(UploadResult {
            etag: Self::etag_of(&response),
            version_id: None,
            url: None,
        })
    }

    async fn presigned_put_url(&self, key: &str, ttl: Duration) -> Result<String> {
        self.presign("PUT", key, ttl)
    }

    async fn presigned_get_url(&self, key: &str, ttl: Duration) -> Result<String> {
        self.presign("GET", key, ttl)
    }

    async fn init_multipart(&self, key: &str, meta: ObjectMeta) -> Result<String> {
        let headers = Self::meta_headers(&meta);
        let response = self
            .request(
                Method::POST,
                key,
                "?uploads",
                meta.content_type.as_deref(),
                &headers,
                None,
            )
            .await?;
        let response = Self::check_status("init_multipart", key, response).await?;

        let body = response
            .text()
            .await
            .map_err(|e| StorageError::Transient(format!("init_multipart {key}: {e}")))?;

        extract_tag(&body, "UploadId")
            .ok_or_else(|| StorageError::Backend(format!("no upload id returned for {key}")))
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Bytes,
    ) -> Result<CompletedPart> {
        let subresource = format!("?partNumber={part_number}&uploadId={upload_id}");
        let response = self
            .request(Method::PUT, key, &subresource, None, &[], Some(data))
            .await?;
        let response = Self::check_status("upload_part", key, response).await?;

        let etag = Self::etag_of(&response).ok_or_else(|| {
            StorageError::Backend(format!("no etag for part {part_number} of {key}"))
        })?;

        Ok(CompletedPart { part_number, etag })
    }

    async fn presigned_part_url(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        ttl: Duration,
    ) -> Result<String> {
        let expires = (Utc::now() + clamp_ttl(ttl)).timestamp();
        // Subresources participate in the canonical resource for
        // query-signed URLs.
        let string_to_sign = format!(
            "PUT\n\n\n{expires}\n/{}/{}?partNumber={part_number}&uploadId={upload_id}",
            self.bucket, key
        );
        let signature: String =
            url::form_urlencoded::byte_serialize(self.sign(&string_to_sign).as_bytes()).collect();

        let url = format!(
            "{}?partNumber={part_number}&uploadId={upload_id}&OSSAccessKeyId={}&Expires={expires}&Signature={signature}",
            self.object_url(key, ""),
            self.access_key_id,
        );

        match &self.public_endpoint {
            Some(endpoint) => rewrite_to_public(&url, endpoint),
            None => Ok(url),
        }
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<UploadResult> {
        let mut body = String::from("<CompleteMultipartUpload>");
        for part in parts {
            body.push_str(&format!(
                "<Part><PartNumber>{}</PartNumber><ETag>\"{}\"</ETag></Part>",
                part.part_number,
                part.etag.trim_matches('"')
            ));
        }
        body.push_str("</CompleteMultipartUpload>");

        let subresource = format!("?uploadId={upload_id}");
        let response = self
            .request(
                Method::POST,
                key,
                &subresource,
                Some("application/xml"),
                &[],
                Some(Bytes::from(body)),
            )
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(UploadResult {
                etag: Self::etag_of(&response),
                version_id: None,
                url: None,
            });
        }

        let body = response.text().await.unwrap_or_default();
        // A prior completion consumes the upload id. If the object now
        // exists, re-completion is a no-op rather than an error.
        if body.contains("NoSuchUpload") && self.exists(key).await? {
            tracing::debug!(key = %key, upload_id = %upload_id,
                "multipart upload already completed, treating as no-op");
            return Ok(UploadResult {
                etag: None,
                version_id: None,
                url: None,
            });
        }

        Err(map_status("complete_multipart", key, status.as_u16(), &body))
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<()> {
        let subresource = format!("?uploadId={upload_id}");
        let response = self
            .request(Method::DELETE, key, &subresource, None, &[], None)
            .await?;
        Self::check_status("abort_multipart", key, response).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let response = self
            .request(Method::DELETE, key, "", None, &[], None)
            .await?;

        // Deleting an absent key is not an error.
        if response.status().as_u16() == 404 {
            return Ok(());
        }
        Self::check_status("delete", key, response).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let response = self
            .request(Method::HEAD, key, "", None, &[], None)
            .await?;

        match response.status().as_u16() {
            404 => Ok(false),
            s if (200..300).contains(&s) => Ok(true),
            s => Err(map_status("exists", key, s, "")),
        }
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<StorageObject>> {
        let mut objects = Vec::new();
        let mut marker = String::new();

        loop {
            let mut query = format!(
                "?prefix={}&max-keys=1000",
                url::form_urlencoded::byte_serialize(prefix.as_bytes()).collect::<String>()
            );
            if !marker.is_empty() {
                query.push_str(&format!(
                    "&marker={}",
                    url::form_urlencoded::byte_serialize(marker.as_bytes()).collect::<String>()
                ));
            }

            // Bucket-level GET: the canonical resource is the bare
            // bucket, list parameters are not a signed subresource.
            let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
            let resource = format!("/{}/", self.bucket);
            let authorization =
                self.authorization(&Method::GET, "", &date, &[], &resource);

            let url = format!("{}://{}/{}", self.scheme, self.host, query);
            let response = self
                .http
                .get(url)
                .header("Date", date)
                .header("Authorization", authorization)
                .send()
                .await
                .map_err(|e| map_reqwest_err(prefix, e))?;
            let response = Self::check_status("list_objects", prefix, response).await?;

            let body = response
                .text()
                .await
                .map_err(|e| StorageError::Transient(format!("list_objects {prefix}: {e}")))?;

            for block in extract_blocks(&body, "Contents") {
                let Some(key) = extract_tag(block, "Key") else { continue };
                objects.push(StorageObject {
                    key,
                    size: extract_tag(block, "Size")
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(0),
                    last_modified: extract_tag(block, "LastModified")
                        .and_then(|s| s.parse().ok()),
                    etag: extract_tag(block, "ETag").map(|s| s.trim_matches('"').to_string()),
                });
            }

            let truncated = extract_tag(&body, "IsTruncated")
                .map(|s| s == "true")
                .unwrap_or(false);
            if !truncated {
                break;
            }
            match extract_tag(&body, "NextMarker") {
                Some(next) => marker = next,
                None => break,
            }
        }

        Ok(objects)
    }

    async fn copy(&self, src_key: &str, dest_key: &str) -> Result<()> {
        let headers = vec![(
            "x-oss-copy-source".to_string(),
            format!("/{}/{}", self.bucket, src_key),
        )];
        let response = self
            .request(Method::PUT, dest_key, "", None, &headers, None)
            .await?;
        Self::check_status("copy", src_key, response).await?;
        Ok(())
    }
}

/// RFC 3986 percent-encoding of a key for the URL path. `/` separators
/// stay verbatim so the object hierarchy is preserved; everything else
/// outside the unreserved set is escaped, otherwise keys containing
/// spaces, `#` or `?` would be truncated or misparsed by the service.
/// Note `form_urlencoded` is unsuitable here: it encodes spaces as `+`,
/// which OSS treats as a literal plus in paths.
fn encode_key_path(key: &str) -> String {
    let mut encoded = String::with_capacity(key.len());
    for &b in key.as_bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                encoded.push(b as char)
            }
            _ => encoded.push_str(&format!("%{b:02X}")),
        }
    }
    encoded
}

fn map_reqwest_err(key: &str, err: reqwest::Error) -> StorageError {
    if err.is_timeout() || err.is_connect() {
        StorageError::Transient(format!("OSS request for {key} failed: {err}"))
    } else {
        StorageError::Backend(format!("OSS request for {key} failed: {err}"))
    }
}

fn map_status(op: &str, key: &str, status: u16, body: &str) -> StorageError {
    if status == 404 || body.contains("NoSuchKey") {
        StorageError::NotFound(key.to_string())
    } else if status >= 500 || status == 429 {
        StorageError::Transient(format!("{op} {key}: status {status}"))
    } else if status == 401 || status == 403 {
        StorageError::Auth(format!("{op} {key}: status {status}"))
    } else {
        StorageError::Backend(format!("{op} {key}: status {status}: {body}"))
    }
}

/// First occurrence of `<tag>...</tag>` in a fixed-schema OSS response.
/// The OSS XML responses consumed here carry no attributes or nesting
/// of the extracted tags, so a scanner beats a full XML dependency.
fn extract_tag(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)? + start;
    Some(xml[start..end].to_string())
}

/// All `<tag>...</tag>` block bodies, in document order.
fn extract_blocks<'a>(xml: &'a str, tag: &str) -> Vec<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let mut blocks = Vec::new();
    let mut rest = xml;

    while let Some(start) = rest.find(&open) {
        let body_start = start + open.len();
        let Some(end) = rest[body_start..].find(&close) else { break };
        blocks.push(&rest[body_start..body_start + end]);
        rest = &rest[body_start + end + close.len()..];
    }

    blocks
}
