//! ZIP extraction for downloaded repository archives

use std::fs::{self, File};
use std::io::{self, Cursor, Read};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};
use zip::ZipArchive;

use super::FetchError;

fn archive_err(e: zip::result::ZipError) -> FetchError {
    FetchError::Archive(e.to_string())
}

/// The single top-level directory every entry sits under, if there is one.
///
/// GitHub zipballs wrap the tree in a generated `<owner>-<repo>-<sha>/`
/// directory; archives without such a wrapper are extracted as-is.
fn common_root(names: &[Option<PathBuf>]) -> Option<PathBuf> {
    let mut root: Option<PathBuf> = None;
    let mut nested = false;

    for path in names.iter().flatten() {
        let mut components = path.components();
        let first = match components.next() {
            Some(Component::Normal(c)) => PathBuf::from(c),
            _ => return None,
        };
        if components.next().is_some() {
            nested = true;
        }
        match &root {
            Some(r) if *r != first => return None,
            Some(_) => {}
            None => root = Some(first),
        }
    }

    root.filter(|_| nested)
}

/// Extract `bytes` into `dest`, dropping the archive's wrapper directory.
///
/// Entries whose names would escape `dest` are skipped. Stops with
/// `ExtractedTooLarge` once more than `limit_mb` would be written. Returns
/// the number of files written.
pub fn extract_stripped(bytes: &[u8], dest: &Path, limit_mb: u64) -> Result<usize, FetchError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes)).map_err(archive_err)?;

    let mut names = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let entry = archive.by_index(i).map_err(archive_err)?;
        names.push(entry.enclosed_name());
    }
    let root = common_root(&names);

    fs::create_dir_all(dest)?;
    let limit = limit_mb.saturating_mul(1024 * 1024);
    let mut total: u64 = 0;
    let mut written = 0;

    for (i, name) in names.into_iter().enumerate() {
        let mut entry = archive.by_index(i).map_err(archive_err)?;

        let Some(path) = name else {
            warn!("Archive: skipping unsafe entry '{}'", entry.name());
            continue;
        };

        let relative = match &root {
            Some(root) => match path.strip_prefix(root) {
                Ok(rel) => rel.to_path_buf(),
                Err(_) => continue,
            },
            None => path,
        };
        if relative.as_os_str().is_empty() {
            continue;
        }

        let out = dest.join(&relative);
        if entry.is_dir() {
            fs::create_dir_all(&out)?;
            continue;
        }

        if let Some(parent) = out.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = File::create(&out)?;
        // Header sizes can lie, so count what is actually decompressed
        let remaining = limit - total;
        total += io::copy(&mut (&mut entry).take(remaining.saturating_add(1)), &mut file)?;
        if total > limit {
            return Err(FetchError::ExtractedTooLarge { limit_mb });
        }
        written += 1;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = entry.unix_mode() {
                // Owner must keep read access for the copy to be usable
                let mode = (mode & 0o777) | 0o400;
                fs::set_permissions(&out, fs::Permissions::from_mode(mode))?;
            }
        }
    }

    debug!("Archive: extracted {} files to {}", written, dest.display());
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn build_zip(entries: &[(&str, Option<&str>)]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default();
        for (name, content) in entries {
            match content {
                None => writer.add_directory(*name, options).unwrap(),
                Some(body) => {
                    writer.start_file(*name, options).unwrap();
                    writer.write_all(body.as_bytes()).unwrap();
                }
            }
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn test_strips_github_wrapper() {
        let bytes = build_zip(&[
            ("octocat-demo-abc123/", None),
            ("octocat-demo-abc123/main.py", Some("print('hi')")),
            ("octocat-demo-abc123/pkg/", None),
            ("octocat-demo-abc123/pkg/util.py", Some("X = 1")),
        ]);
        let dest = tempfile::tempdir().unwrap();

        let written = extract_stripped(&bytes, dest.path(), 10).unwrap();
        assert_eq!(written, 2);
        assert_eq!(
            std::fs::read_to_string(dest.path().join("main.py")).unwrap(),
            "print('hi')"
        );
        assert!(dest.path().join("pkg/util.py").is_file());
        assert!(!dest.path().join("octocat-demo-abc123").exists());
    }

    #[test]
    fn test_flat_archive_kept_as_is() {
        let bytes = build_zip(&[("main.py", Some("a")), ("lib/x.py", Some("b"))]);
        let dest = tempfile::tempdir().unwrap();

        assert_eq!(extract_stripped(&bytes, dest.path(), 10).unwrap(), 2);
        assert!(dest.path().join("main.py").is_file());
        assert!(dest.path().join("lib/x.py").is_file());
    }

    #[test]
    fn test_skips_escaping_entries() {
        let bytes = build_zip(&[
            ("root/main.py", Some("ok")),
            ("root/../../evil.py", Some("bad")),
        ]);
        let outer = tempfile::tempdir().unwrap();
        let dest = outer.path().join("repo");

        extract_stripped(&bytes, &dest, 10).unwrap();
        assert!(dest.join("main.py").is_file());
        assert!(!outer.path().join("evil.py").exists());
    }

    #[test]
    fn test_stops_past_extracted_size_limit() {
        let big = "x".repeat(700 * 1024);
        let bytes = build_zip(&[
            ("root/a.py", Some(big.as_str())),
            ("root/b.py", Some(big.as_str())),
        ]);
        let dest = tempfile::tempdir().unwrap();

        let err = extract_stripped(&bytes, dest.path(), 1).unwrap_err();
        assert!(matches!(err, FetchError::ExtractedTooLarge { limit_mb: 1 }));
        // the second file was cut at the limit
        let b = std::fs::metadata(dest.path().join("b.py")).unwrap().len();
        assert!(b <= 1024 * 1024 - 700 * 1024 + 1);

        let dest = tempfile::tempdir().unwrap();
        assert_eq!(extract_stripped(&bytes, dest.path(), 2).unwrap(), 2);
    }

    #[test]
    fn test_corrupt_archive() {
        let dest = tempfile::tempdir().unwrap();
        let err = extract_stripped(b"definitely not a zip", dest.path(), 10).unwrap_err();
        assert!(matches!(err, FetchError::Archive(_)));
    }

    #[test]
    fn test_common_root() {
        let names = vec![
            Some(PathBuf::from("r/")),
            Some(PathBuf::from("r/a.py")),
            None,
        ];
        assert_eq!(common_root(&names), Some(PathBuf::from("r")));

        let mixed = vec![Some(PathBuf::from("a/x")), Some(PathBuf::from("b/y"))];
        assert_eq!(common_root(&mixed), None);

        let single_file = vec![Some(PathBuf::from("main.py"))];
        assert_eq!(common_root(&single_file), None);
    }
}
