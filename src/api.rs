use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::error::{DownloadError, DownloadResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SingleFile {
    pub filename: String,
    pub download_url: Url,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub container: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub filename: String,
    pub download_url: Url,
    pub kind: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiFile {
    pub files: Vec<RemoteFile>,
    pub multi_image: bool,
    pub platform: Option<String>,
}

/// The server's answer to one processing call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingResponse {
    SingleFile(SingleFile),
    MultiFile(MultiFile),
    Unsupported { reason: String },
    Transient { http_status: u16, message: String },
}

#[derive(Deserialize)]
struct RawResponse {
    filename: Option<String>,
    #[serde(alias = "url")]
    download_url: Option<String>,
    video_codec: Option<String>,
    audio_codec: Option<String>,
    container: Option<String>,
    files: Option<Vec<RawFile>>,
    #[serde(rename = "type")]
    kind: Option<String>,
    platform: Option<String>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct RawFile {
    filename: Option<String>,
    download_url: String,
    #[serde(rename = "type")]
    kind: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ServerInfo {
    pub version: String,
    pub latest_version: Option<String>,
    pub apk_url: Option<String>,
    pub release_notes: Option<String>,
    #[serde(default)]
    pub total_platforms: u32,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Serialize)]
struct ProcessingBody<'a> {
    url: &'a str,
}

/// Client for the remote processing service.
#[derive(Clone)]
pub struct ProcessingClient {
    client: Client,
    base: Url,
    request_timeout: Duration,
}

impl ProcessingClient {
    pub fn new(client: Client, server_url: &str, request_timeout: Duration) -> DownloadResult<Self> {
        let mut base = Url::parse(server_url)
            .map_err(|e| DownloadError::Other(format!("invalid server url {}: {}", server_url, e)))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self {
            client,
            base,
            request_timeout,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// One `POST /download`. Transport failures come back as `Err`; everything the
    /// server actually answered is classified into a [`ProcessingResponse`].
    pub async fn process(&self, source_url: &str) -> DownloadResult<ProcessingResponse> {
        let endpoint = self.endpoint("download")?;
        let response = self
            .client
            .post(endpoint)
            .timeout(self.request_timeout)
            .json(&ProcessingBody { url: source_url })
            .send()
            .await
            .map_err(|e| DownloadError::from_transport(&e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| DownloadError::from_transport(&e))?;
        debug!(%status, len = body.len(), "processing response");
        parse_processing_response(&self.base, status, &body)
    }

    /// `GET /`: version and capability metadata.
    pub async fn server_info(&self) -> DownloadResult<ServerInfo> {
        let response = self
            .client
            .get(self.base.clone())
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| DownloadError::from_transport(&e))?;
        if !response.status().is_success() {
            return Err(DownloadError::Server {
                status: response.status().as_u16(),
            });
        }
        let body = response
            .text()
            .await
            .map_err(|e| DownloadError::from_transport(&e))?;
        serde_json::from_str(&body).map_err(|e| DownloadError::MalformedResponse(format!("server info: {}", e)))
    }

    fn endpoint(&self, path: &str) -> DownloadResult<Url> {
        self.base
            .join(path)
            .map_err(|e| DownloadError::Other(format!("invalid endpoint {}: {}", path, e)))
    }
}

pub fn parse_processing_response(base: &Url, status: StatusCode, body: &str) -> DownloadResult<ProcessingResponse> {
    let parsed: Option<RawResponse> = serde_json::from_str(body).ok();

    if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        let message = parsed
            .and_then(|r| r.error)
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("server error").to_string());
        return Ok(ProcessingResponse::Transient {
            http_status: status.as_u16(),
            message,
        });
    }

    let raw = match parsed {
        Some(raw) => raw,
        None if status.is_success() => {
            return Err(DownloadError::MalformedResponse("body is not a JSON object".to_string()))
        }
        None => return Err(DownloadError::Server { status: status.as_u16() }),
    };

    if let Some(reason) = raw.error {
        return Ok(ProcessingResponse::Unsupported { reason });
    }

    if let Some(files) = raw.files.filter(|f| !f.is_empty()) {
        let files = files
            .into_iter()
            .map(|f| {
                let download_url = resolve_download_url(base, &f.download_url)?;
                let filename = f
                    .filename
                    .filter(|n| !n.trim().is_empty())
                    .unwrap_or_else(|| crate::utils::get_filename_from_url(download_url.as_str()));
                Ok(RemoteFile {
                    filename,
                    download_url,
                    kind: f.kind,
                })
            })
            .collect::<DownloadResult<Vec<_>>>()?;
        return Ok(ProcessingResponse::MultiFile(MultiFile {
            files,
            multi_image: raw.kind.as_deref() == Some("multi_image"),
            platform: raw.platform,
        }));
    }

    if let Some(filename) = raw.filename.filter(|n| !n.trim().is_empty()) {
        let download_url = match raw.download_url {
            Some(u) => resolve_download_url(base, &u)?,
            None => default_file_url(base, &filename)?,
        };
        return Ok(ProcessingResponse::SingleFile(SingleFile {
            filename,
            download_url,
            video_codec: raw.video_codec,
            audio_codec: raw.audio_codec,
            container: raw.container,
        }));
    }

    if status.is_success() {
        Err(DownloadError::MalformedResponse(
            "response has neither filename, files nor error".to_string(),
        ))
    } else {
        Err(DownloadError::Server { status: status.as_u16() })
    }
}

/// Absolute URLs are used as-is; anything else is resolved against the service base.
pub fn resolve_download_url(base: &Url, raw: &str) -> DownloadResult<Url> {
    match Url::parse(raw) {
        Ok(url) => Ok(url),
        Err(url::ParseError::RelativeUrlWithoutBase) => base
            .join(raw)
            .map_err(|e| DownloadError::MalformedResponse(format!("bad download url {}: {}", raw, e))),
        Err(e) => Err(DownloadError::MalformedResponse(format!("bad download url {}: {}", raw, e))),
    }
}

/// Single-file responses without an explicit URL are served from `files/<filename>`.
fn default_file_url(base: &Url, filename: &str) -> DownloadResult<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| DownloadError::MalformedResponse(format!("cannot build file url from {}", base)))?
        .pop_if_empty()
        .push("files")
        .push(filename);
    Ok(url)
}
