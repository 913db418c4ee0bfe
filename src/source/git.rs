//! Local git mirrors and build checkouts.
//!
//! A build directory is prepared by mirroring the remote, checking the
//! requested revision out under `<mirror>/c/<shortsha>/`, setting every
//! file's mtime to the time of the last commit that touched it (docker's
//! build cache invalidates on mtime), and recursively preparing submodules.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::time::{Duration, Instant};

use filetime::FileTime;
use futures_util::stream::{self, StreamExt};
use regex::Regex;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{HanoverdError, Result};
use crate::latch::Latch;

/// Allow up to two minutes for mirroring before giving up.
const MIRROR_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// A prepared checkout ready to be built.
pub struct BuildDirectory {
    /// Tag name for the built image, from `git describe`.
    pub name: String,
    /// The checkout directory.
    pub dir: PathBuf,
}

impl BuildDirectory {
    /// Remove the checkout. Refuses obviously-dangerous paths.
    pub fn cleanup(&self) -> Result<()> {
        safe_cleanup(&self.dir)
    }
}

/// Mirror `remote`, check `git_ref` out and return the build directory.
pub async fn prep_build_directory(
    git_dir: &Path,
    remote: &str,
    git_ref: &str,
    cancel: &Latch,
) -> Result<BuildDirectory> {
    let start = Instant::now();

    let git_dir = if git_dir.is_absolute() {
        git_dir.to_path_buf()
    } else {
        std::env::current_dir()?.join(git_dir)
    };

    local_mirror(remote, &git_dir, git_ref, cancel).await?;

    let rev = rev_parse(&git_dir, git_ref, cancel).await?;
    let tag_name = describe(&git_dir, &rev, cancel).await?;

    let short_rev = &rev[..10.min(rev.len())];
    let checkout_dir = git_dir.join("c").join(short_rev);

    checkout_recursive(git_dir.clone(), checkout_dir.clone(), rev, cancel.clone()).await?;

    info!("Took {:?} to prep {}", start.elapsed(), remote);

    Ok(BuildDirectory { name: tag_name, dir: checkout_dir })
}

/// Create or update a bare mirror of `remote` at `git_dir`. When the wanted
/// ref is sha-like and already present in the object database, no fetch
/// happens; refs like `master` are always freshened.
pub async fn local_mirror(
    remote: &str,
    git_dir: &Path,
    git_ref: &str,
    cancel: &Latch,
) -> Result<()> {
    if git_dir.exists() {
        if sha_like(git_ref) && have_object(git_dir, git_ref, cancel).await {
            debug!("Already have ref: {:?} {}", git_dir, git_ref);
            return Ok(());
        }
        return fetch(git_dir, remote, cancel).await;
    }

    if let Some(parent) = git_dir.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let git_dir_str = path_str(git_dir)?;
    let output = with_mirror_timeout(
        git(Path::new("."), &["clone", "-q", "--mirror", remote, &git_dir_str], cancel),
    )
    .await?;
    expect_success("git clone", &output)
}

async fn fetch(git_dir: &Path, remote: &str, cancel: &Latch) -> Result<()> {
    let output =
        with_mirror_timeout(git(git_dir, &["fetch", "-f", remote, "*:*"], cancel)).await?;
    // A fetch with nothing to update exits with status 1.
    if output.status.success() || output.status.code() == Some(1) {
        Ok(())
    } else {
        Err(HanoverdError::git(format!("git fetch exited with {}", output.status)))
    }
}

async fn with_mirror_timeout<F>(operation: F) -> Result<std::process::Output>
where
    F: std::future::Future<Output = Result<std::process::Output>>,
{
    match tokio::time::timeout(MIRROR_TIMEOUT, operation).await {
        Ok(result) => result,
        Err(_) => Err(HanoverdError::git(format!(
            "mirror operation took longer than {:?}",
            MIRROR_TIMEOUT
        ))),
    }
}

/// True for refs which look like a full sha.
fn sha_like(git_ref: &str) -> bool {
    static PATTERN: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new("^[0-9a-fA-F]{40}$").unwrap())
        .is_match(git_ref)
}

/// True if `sha` is present in the object database.
async fn have_object(git_dir: &Path, sha: &str, cancel: &Latch) -> bool {
    match git(git_dir, &["cat-file", "-t", sha], cancel).await {
        Ok(output) => output.status.success(),
        Err(_) => false,
    }
}

pub async fn rev_parse(git_dir: &Path, git_ref: &str, cancel: &Latch) -> Result<String> {
    let output = git(git_dir, &["rev-parse", git_ref], cancel).await?;
    expect_success("git rev-parse", &output)?;
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Human-meaningful name of a revision, used as the image tag.
pub async fn describe(git_dir: &Path, git_ref: &str, cancel: &Latch) -> Result<String> {
    let output = git(git_dir, &["describe", "--all", "--tags", "--long", git_ref], cancel).await?;
    expect_success("git describe", &output)?;
    let description = String::from_utf8_lossy(&output.stdout).trim().to_string();
    Ok(description.strip_prefix("heads/").unwrap_or(&description).to_string())
}

/// Check out `rev` and prepare its submodules, recursively.
fn checkout_recursive(
    git_dir: PathBuf,
    checkout_dir: PathBuf,
    rev: String,
    cancel: Latch,
) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send>> {
    Box::pin(async move {
        checkout(&git_dir, &checkout_dir, &rev, &cancel).await?;
        prep_submodules(&git_dir, &checkout_dir, &rev, &cancel).await
    })
}

async fn checkout(git_dir: &Path, checkout_dir: &Path, rev: &str, cancel: &Latch) -> Result<()> {
    std::fs::create_dir_all(checkout_dir)?;
    info!("Populating {:?}", checkout_dir);

    let checkout_str = path_str(checkout_dir)?;
    let output = git(
        git_dir,
        &["--work-tree", &checkout_str, "checkout", rev, "--", "."],
        cancel,
    )
    .await?;
    expect_success("git checkout", &output)?;

    set_mtimes(git_dir, checkout_dir, rev, cancel).await
}

/// Set every checked-out file's mtime to the commit time of the last commit
/// touching it, and every directory's to the max of its descendants'.
pub async fn set_mtimes(
    git_dir: &Path,
    checkout_dir: &Path,
    rev: &str,
    cancel: &Latch,
) -> Result<()> {
    let times = commit_times(git_dir, rev, cancel).await?;

    let output = git(git_dir, &["ls-tree", "-r", "--name-only", "-z", rev], cancel).await?;
    expect_success("git ls-tree", &output)?;
    let listing = String::from_utf8_lossy(&output.stdout);

    let mut dir_mtimes: HashMap<PathBuf, i64> = HashMap::new();

    for file in listing.split('\0').filter(|f| !f.is_empty()) {
        let mtime = *times
            .get(file)
            .ok_or_else(|| HanoverdError::git(format!("failed to find file in history: {:?}", file)))?;

        // Each ancestor directory takes the most recent time seen below it.
        let mut dir = Path::new(file).parent();
        while let Some(d) = dir {
            let slot = dir_mtimes.entry(d.to_path_buf()).or_insert(mtime);
            if mtime > *slot {
                *slot = mtime;
            }
            dir = d.parent();
        }

        filetime::set_file_mtime(checkout_dir.join(file), FileTime::from_unix_time(mtime, 0))?;
    }

    for (dir, mtime) in dir_mtimes {
        filetime::set_file_mtime(checkout_dir.join(dir), FileTime::from_unix_time(mtime, 0))?;
    }

    Ok(())
}

/// The most recent committed timestamp of every file in the history of
/// `rev`, in one pass (much faster than `git log -1` per file).
async fn commit_times(git_dir: &Path, rev: &str, cancel: &Latch) -> Result<HashMap<String, i64>> {
    let output = git(
        git_dir,
        &["log", "--format=-%n%ct", "--name-status", rev],
        cancel,
    )
    .await?;
    expect_success("git log", &output)?;

    enum State {
        Filenames,
        Timestamp,
    }

    let mut times = HashMap::new();
    let mut state = State::Filenames;
    let mut current_time = 0i64;

    for line in String::from_utf8_lossy(&output.stdout).lines() {
        if line == "-" {
            state = State::Timestamp;
            continue;
        }
        match state {
            State::Timestamp => {
                current_time = line.trim().parse().map_err(|_| {
                    HanoverdError::git(format!("unparseable commit time: {:?}", line))
                })?;
                state = State::Filenames;
            }
            State::Filenames => {
                if line.is_empty() {
                    continue;
                }
                let parts: Vec<&str> = line.split('\t').collect();
                let operation = parts[0];
                let filename = match (operation.chars().next(), parts.len()) {
                    // Renames and copies list "old\tnew"; the new name is
                    // what exists in the checkout.
                    (Some('R') | Some('C'), 3) => parts[2],
                    (Some(_), 2) => parts[1],
                    _ => {
                        return Err(HanoverdError::git(format!(
                            "unexpected git log line: {:?}",
                            line
                        )))
                    }
                };
                // The first timestamp encountered is the most recent.
                times.entry(filename.to_string()).or_insert(current_time);
            }
        }
    }

    Ok(times)
}

/// Prepare each submodule of a checkout, parallelized across cores. Each
/// submodule gets its own mirror under `<mirror>/modules/<path>`.
async fn prep_submodules(
    git_dir: &Path,
    checkout_dir: &Path,
    main_rev: &str,
    cancel: &Latch,
) -> Result<()> {
    let gitmodules = checkout_dir.join(".gitmodules");
    let content = match std::fs::read_to_string(&gitmodules) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    let mut submodules = parse_submodules(&content);
    if submodules.is_empty() {
        return Ok(());
    }
    info!("Prep {} submodules", submodules.len());

    for submodule in &mut submodules {
        submodule.rev = submodule_rev(git_dir, &submodule.path, main_rev, cancel).await?;
    }

    let workers = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
    let failures: Vec<HanoverdError> = stream::iter(submodules)
        .map(|submodule| {
            let git_dir = git_dir.to_path_buf();
            let checkout_dir = checkout_dir.to_path_buf();
            let cancel = cancel.clone();
            async move {
                prep_submodule(&git_dir, &checkout_dir, &submodule, &cancel)
                    .await
                    .map_err(|e| {
                        HanoverdError::git(format!("processing {}: {}", submodule.path, e))
                    })
            }
        })
        .buffer_unordered(workers)
        .filter_map(|result| async move { result.err() })
        .collect()
        .await;

    match failures.into_iter().next() {
        None => Ok(()),
        Some(first) => Err(first),
    }
}

async fn prep_submodule(
    main_git_dir: &Path,
    main_checkout_dir: &Path,
    submodule: &Submodule,
    cancel: &Latch,
) -> Result<()> {
    let sub_git_dir = main_git_dir.join("modules").join(&submodule.path);
    local_mirror(&submodule.url, &sub_git_dir, &submodule.rev, cancel).await?;

    let sub_checkout = main_checkout_dir.join(&submodule.path);
    checkout_recursive(sub_git_dir, sub_checkout, submodule.rev.clone(), cancel.clone()).await
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submodule {
    pub path: String,
    pub url: String,
    pub rev: String,
}

/// Parse the `[submodule "..."]` sections of a `.gitmodules` file.
fn parse_submodules(content: &str) -> Vec<Submodule> {
    let mut submodules = Vec::new();
    let mut in_submodule = false;
    let mut path = None;
    let mut url = None;

    let mut flush = |path: &mut Option<String>, url: &mut Option<String>| {
        if let (Some(path), Some(url)) = (path.take(), url.take()) {
            submodules.push(Submodule { path, url, rev: String::new() });
        }
    };

    for line in content.lines() {
        let line = line.trim();
        if line.starts_with('[') {
            flush(&mut path, &mut url);
            in_submodule = line.starts_with("[submodule");
            continue;
        }
        if !in_submodule {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            match key.trim() {
                "path" => path = Some(value.trim().to_string()),
                "url" => url = Some(value.trim().to_string()),
                _ => {}
            }
        }
    }
    flush(&mut path, &mut url);

    submodules
}

/// The revision a submodule is pinned to at `main_rev`.
async fn submodule_rev(
    git_dir: &Path,
    submodule_path: &str,
    main_rev: &str,
    cancel: &Latch,
) -> Result<String> {
    let output = git(git_dir, &["ls-tree", main_rev, "--", submodule_path], cancel).await?;
    expect_success("git ls-tree", &output)?;

    let listing = String::from_utf8_lossy(&output.stdout);
    listing
        .split_whitespace()
        .nth(2)
        .map(str::to_string)
        .ok_or_else(|| {
            HanoverdError::git(format!("no submodule entry for {:?} at {}", submodule_path, main_rev))
        })
}

/// Run git in `dir`, capturing stdout. Stderr goes to ours. The process is
/// killed if `cancel` falls first.
async fn git(dir: &Path, args: &[&str], cancel: &Latch) -> Result<std::process::Output> {
    let child = Command::new("git")
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| HanoverdError::git(format!("spawning git: {}", e)))?;

    tokio::select! {
        output = child.wait_with_output() => Ok(output?),
        _ = cancel.wait() => Err(HanoverdError::ShuttingDown),
    }
}

fn expect_success(what: &str, output: &std::process::Output) -> Result<()> {
    if output.status.success() {
        Ok(())
    } else {
        Err(HanoverdError::git(format!("{} exited with {}", what, output.status)))
    }
}

fn path_str(path: &Path) -> Result<String> {
    path.to_str()
        .map(str::to_string)
        .ok_or_else(|| HanoverdError::git(format!("non-unicode path: {:?}", path)))
}

/// Delete a checkout directory, refusing paths that could reach outside it.
pub fn safe_cleanup(path: &Path) -> Result<()> {
    let display = path.to_string_lossy();
    let suspicious = display.is_empty()
        || display == "."
        || display == "/"
        || path.components().any(|c| c == Component::ParentDir);
    if suspicious {
        return Err(HanoverdError::git(format!(
            "invalid path specified for deletion {:?}",
            display
        )));
    }
    std::fs::remove_dir_all(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha_like() {
        assert!(sha_like("0123456789abcdef0123456789abcdef01234567"));
        assert!(!sha_like("main"));
        assert!(!sha_like("0123456789abcdef"));
    }

    #[test]
    fn test_parse_submodules() {
        let content = r#"
[submodule "vendor/libfoo"]
	path = vendor/libfoo
	url = https://example.com/libfoo.git
[submodule "vendor/libbar"]
	path = vendor/libbar
	url = https://example.com/libbar.git
[branch "main"]
	remote = origin
"#;
        let submodules = parse_submodules(content);
        assert_eq!(submodules.len(), 2);
        assert_eq!(submodules[0].path, "vendor/libfoo");
        assert_eq!(submodules[0].url, "https://example.com/libfoo.git");
        assert_eq!(submodules[1].path, "vendor/libbar");
    }

    #[test]
    fn test_parse_submodules_empty() {
        assert!(parse_submodules("").is_empty());
        assert!(parse_submodules("[core]\n\tbare = true\n").is_empty());
    }

    #[test]
    fn test_safe_cleanup_rejects_dangerous_paths() {
        assert!(safe_cleanup(Path::new("")).is_err());
        assert!(safe_cleanup(Path::new(".")).is_err());
        assert!(safe_cleanup(Path::new("/")).is_err());
        assert!(safe_cleanup(Path::new("checkout/../../etc")).is_err());
    }

    #[test]
    fn test_safe_cleanup_removes_directory() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("c").join("0123456789");
        std::fs::create_dir_all(target.join("sub")).unwrap();
        std::fs::write(target.join("sub").join("file"), "x").unwrap();

        safe_cleanup(&target).unwrap();
        assert!(!target.exists());
    }

    async fn run(repo: &Path, args: &[&str]) {
        let output = git(repo, args, &Latch::new()).await.unwrap();
        assert!(output.status.success(), "git {:?} failed", args);
    }

    #[tokio::test]
    async fn test_commit_times_covers_renames_and_subdirs() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().to_path_buf();
        std::fs::create_dir_all(repo.join("sub")).unwrap();
        std::fs::write(repo.join("a.txt"), "a").unwrap();
        std::fs::write(repo.join("sub").join("b.txt"), "b").unwrap();

        run(&repo, &["init", "-q"]).await;
        run(&repo, &["add", "."]).await;
        run(
            &repo,
            &["-c", "user.name=test", "-c", "user.email=test@example.com", "commit", "-q", "-m", "one"],
        )
        .await;

        let times = commit_times(&repo, "HEAD", &Latch::new()).await.unwrap();
        assert!(times.contains_key("a.txt"));
        assert!(times.contains_key("sub/b.txt"));
        assert!(times.values().all(|&t| t > 0));
    }
}
