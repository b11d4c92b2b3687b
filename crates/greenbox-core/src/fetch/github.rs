//! GitHub fetcher — download a repository zipball without needing git

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{CodeFetcher, FetchError, RepoRef, extract_stripped, parse_github_url};
use crate::config::FetchConfig;
use crate::workspace::remove_dir_force;

const USER_AGENT: &str = concat!("greenbox/", env!("CARGO_PKG_VERSION"));

/// Downloads public repositories through the GitHub REST API
#[derive(Clone)]
pub struct GithubFetcher {
    http: Client,
    config: FetchConfig,
}

impl GithubFetcher {
    pub fn new(config: FetchConfig) -> Result<Self, FetchError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self { http, config })
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/{}", self.config.api_base.trim_end_matches('/'), path)
    }

    async fn check_exists(&self, repo: &RepoRef) -> Result<(), FetchError> {
        let url = self.api_url(&format!("repos/{}/{}", repo.owner, repo.repo));
        debug!("GitHub: validating repository {}", url);

        let resp = self.http.get(&url).send().await?;
        if resp.status() != StatusCode::OK {
            warn!("GitHub: {} returned HTTP {}", url, resp.status());
            return Err(FetchError::NotFound {
                owner: repo.owner.clone(),
                repo: repo.repo.clone(),
            });
        }
        Ok(())
    }

    /// Try each configured branch in order and return the first zipball
    async fn download(&self, repo: &RepoRef) -> Result<Vec<u8>, FetchError> {
        let limit = self.config.max_archive_mb.saturating_mul(1024 * 1024);
        let mut last_status = 0;

        for branch in &self.config.branches {
            let url = self.api_url(&format!(
                "repos/{}/{}/zipball/{}",
                repo.owner, repo.repo, branch
            ));
            info!("GitHub: downloading {}", url);

            let mut resp = self.http.get(&url).send().await?;
            if resp.status() != StatusCode::OK {
                last_status = resp.status().as_u16();
                debug!("GitHub: branch '{}' unavailable (HTTP {})", branch, last_status);
                continue;
            }

            let too_large = FetchError::TooLarge {
                limit_mb: self.config.max_archive_mb,
            };
            if resp.content_length().is_some_and(|len| len > limit) {
                return Err(too_large);
            }
            // zipballs are usually chunked without a Content-Length
            let mut bytes = Vec::new();
            while let Some(chunk) = resp.chunk().await? {
                if (bytes.len() + chunk.len()) as u64 > limit {
                    warn!(
                        "GitHub: {} exceeds {} MB, aborting",
                        url, self.config.max_archive_mb
                    );
                    return Err(too_large);
                }
                bytes.extend_from_slice(&chunk);
            }
            return Ok(bytes);
        }

        Err(FetchError::Download {
            status: last_status,
        })
    }
}

/// `base/<repo>`, or `base/<repo>_<yyyymmddHHMMSS>` if that is taken
pub fn unique_target(base: &Path, repo: &str, now: DateTime<Utc>) -> PathBuf {
    let plain = base.join(repo);
    if !plain.exists() {
        return plain;
    }

    let stamped = format!("{}_{}", repo, now.format("%Y%m%d%H%M%S"));
    let mut candidate = base.join(&stamped);
    let mut n = 1;
    while candidate.exists() {
        candidate = base.join(format!("{}-{}", stamped, n));
        n += 1;
    }
    candidate
}

#[async_trait]
impl CodeFetcher for GithubFetcher {
    async fn fetch(&self, url: &str, base_dir: &Path) -> Result<PathBuf, FetchError> {
        let repo = parse_github_url(url)?;
        info!("GitHub: fetching {}/{}", repo.owner, repo.repo);

        self.check_exists(&repo).await?;

        tokio::fs::create_dir_all(base_dir).await?;
        let target = unique_target(base_dir, &repo.repo, Utc::now());
        tokio::fs::create_dir_all(&target).await?;

        let result = async {
            let bytes = self.download(&repo).await?;
            let dest = target.clone();
            let limit_mb = self.config.max_extracted_mb;
            tokio::task::spawn_blocking(move || extract_stripped(&bytes, &dest, limit_mb))
                .await
                .map_err(|e| FetchError::Archive(e.to_string()))?
        }
        .await;

        match result {
            Ok(files) => {
                info!(
                    "GitHub: {} downloaded to {} ({} files)",
                    url,
                    target.display(),
                    files
                );
                Ok(target)
            }
            Err(e) => {
                if let Err(cleanup) = remove_dir_force(&target).await {
                    warn!("GitHub: could not clean up {}: {}", target.display(), cleanup);
                }
                Err(e)
            }
        }
    }
}
