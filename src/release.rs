use std::path::{Path, PathBuf};
use log::{debug, info};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const GITHUB_JSON: &str = "application/vnd.github+json";
const GITHUB_API_VERSION: &str = "2022-11-28";
const ARCHIVE_CONTENT_TYPE: &str = "application/gzip";

#[derive(Error, Debug)]
pub enum Error {
    #[error("read {path}: {source}")]
    ReadArchive {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("archive path {0} has no file name")]
    ArchiveName(PathBuf),

    #[error("reqwest: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("create release {tag}: code: {status}, body: {body}")]
    Create { tag: String, status: u16, body: String },

    #[error("upload {name} to release {tag}: code: {status}, body: {body}")]
    Upload {
        tag: String,
        name: String,
        status: u16,
        body: String,
    },

    #[error("decode release {tag}: {source}")]
    Decode { tag: String, source: serde_json::Error },
}

#[derive(Serialize, Debug, PartialEq)]
struct CreateRelease<'a> {
    tag_name: &'a str,
    name: &'a str,
    body: &'a str,
}

/// A created release, as returned by the GitHub API.
#[derive(Deserialize, Debug, Clone)]
pub struct Release {
    pub tag_name: String,
    #[serde(default)]
    pub html_url: String,
    pub upload_url: String,
}

/// An uploaded release asset.
#[derive(Deserialize, Debug, Clone)]
pub struct Asset {
    pub name: String,
    #[serde(default)]
    pub browser_download_url: String,
}

/// Drop the RFC 6570 `{?name,label}` suffix from an `upload_url`.
fn upload_url_base(template: &str) -> &str {
    template.split_once('{').map(|(base, _)| base).unwrap_or(template)
}

/// Creates GitHub releases with the archive attached.
pub struct Publisher {
    client: reqwest::Client,
    api_url: String,
    owner: String,
    repository: String,
    token: String,
    body: String,
}

impl Publisher {
    pub fn new(api_url: &str, owner: &str, repository: &str, token: &str, body: &str) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("releaser/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            owner: owner.to_string(),
            repository: repository.to_string(),
            token: token.to_string(),
            body: body.to_string(),
        })
    }

    fn releases_url(&self) -> String {
        format!("{}/repos/{}/{}/releases", self.api_url, self.owner, self.repository)
    }

    /// Create a release named `tag` and attach `archive` as its single asset.
    pub async fn create_release(&self, tag: &str, archive: &Path) -> Result<Release, Error> {
        let name = archive
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .ok_or_else(|| Error::ArchiveName(archive.to_path_buf()))?;
        let data = std::fs::read(archive).map_err(|source| Error::ReadArchive {
            path: archive.to_path_buf(),
            source,
        })?;

        let release = self.create(tag).await?;
        info!("Created release {} ({})", release.tag_name, release.html_url);

        let asset = self.upload(&release, &name, data).await?;
        info!("Uploaded {} to release {tag}: {}", asset.name, asset.browser_download_url);
        Ok(release)
    }

    async fn create(&self, tag: &str) -> Result<Release, Error> {
        let request = CreateRelease {
            tag_name: tag,
            name: tag,
            body: &self.body,
        };
        debug!("POST {}", self.releases_url());
        let resp = self
            .client
            .post(self.releases_url())
            .bearer_auth(&self.token)
            .header(ACCEPT, GITHUB_JSON)
            .header("X-GitHub-Api-Version", GITHUB_API_VERSION)
            .json(&request)
            .send()
            .await?;

        let status = resp.status();
        let bytes = resp.bytes().await?;
        if !status.is_success() {
            return Err(Error::Create {
                tag: tag.to_string(),
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).to_string(),
            });
        }
        serde_json::from_slice(&bytes).map_err(|source| Error::Decode {
            tag: tag.to_string(),
            source,
        })
    }

    async fn upload(&self, release: &Release, name: &str, data: Vec<u8>) -> Result<Asset, Error> {
        let url = upload_url_base(&release.upload_url);
        debug!("POST {url}?name={name} ({} bytes)", data.len());
        let resp = self
            .client
            .post(url)
            .query(&[("name", name)])
            .bearer_auth(&self.token)
            .header(ACCEPT, GITHUB_JSON)
            .header("X-GitHub-Api-Version", GITHUB_API_VERSION)
            .header(CONTENT_TYPE, ARCHIVE_CONTENT_TYPE)
            .body(data)
            .send()
            .await?;

        let status = resp.status();
        let bytes = resp.bytes().await?;
        let upload_error = |body: String| Error::Upload {
            tag: release.tag_name.clone(),
            name: name.to_string(),
            status: status.as_u16(),
            body,
        };
        if !status.is_success() {
            return Err(upload_error(String::from_utf8_lossy(&bytes).to_string()));
        }
        serde_json::from_slice(&bytes).map_err(|err| upload_error(err.to_string()))
    }
}
