//! Repository fetching — download user code into the workspace

use async_trait::async_trait;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;

pub mod archive;
pub mod github;

pub use archive::extract_stripped;
pub use github::GithubFetcher;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Invalid GitHub repository URL: {0}")]
    InvalidUrl(String),
    #[error("Repository {owner}/{repo} not found or not accessible")]
    NotFound { owner: String, repo: String },
    #[error("Failed to download repository: HTTP {status}")]
    Download { status: u16 },
    #[error("Repository archive exceeds {limit_mb} MB")]
    TooLarge { limit_mb: u64 },
    #[error("Extracted repository exceeds {limit_mb} MB")]
    ExtractedTooLarge { limit_mb: u64 },
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("Invalid ZIP archive: {0}")]
    Archive(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Owner and name of a GitHub repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoRef {
    pub owner: String,
    pub repo: String,
}

fn github_url_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^https?://(?:www\.)?github\.com/[a-zA-Z0-9](?:[a-zA-Z0-9-]*[a-zA-Z0-9])?/[a-zA-Z0-9_.-]+/?$",
        )
        .expect("valid GitHub URL pattern")
    })
}

/// Validate a repository URL and split it into owner and name
pub fn parse_github_url(raw: &str) -> Result<RepoRef, FetchError> {
    let raw = raw.trim();
    if !github_url_pattern().is_match(raw) {
        return Err(FetchError::InvalidUrl(raw.to_string()));
    }

    let url = url::Url::parse(raw).map_err(|e| FetchError::InvalidUrl(e.to_string()))?;
    let mut segments = url
        .path_segments()
        .ok_or_else(|| FetchError::InvalidUrl(raw.to_string()))?
        .filter(|s| !s.is_empty());

    let (Some(owner), Some(repo)) = (segments.next(), segments.next()) else {
        return Err(FetchError::InvalidUrl(format!(
            "{} does not contain owner and repository name",
            raw
        )));
    };

    let repo = repo.strip_suffix(".git").unwrap_or(repo);
    if repo.is_empty() || repo == "." || repo == ".." {
        return Err(FetchError::InvalidUrl(raw.to_string()));
    }

    Ok(RepoRef {
        owner: owner.to_string(),
        repo: repo.to_string(),
    })
}

/// Source of user code. Returns the directory the code was placed in.
#[async_trait]
pub trait CodeFetcher: Send + Sync {
    async fn fetch(&self, url: &str, base_dir: &Path) -> Result<PathBuf, FetchError>;
}
