//! Docker image building and pulling.
//!
//! Build contexts are tar archives streamed to the daemon. Directory
//! contexts honor a `.dockerignore` with exact, directory-prefix, and `*`
//! glob patterns (no negation).

use std::collections::HashMap;
use std::path::Path;

use bollard::container::{
    AttachContainerOptions, Config as ContainerConfig, CreateContainerOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::{BuildImageOptions, CreateImageOptions};
use bollard::Docker;
use futures_util::StreamExt;
use tracing::{debug, info, warn};

use crate::error::{HanoverdError, Result};
use crate::latch::Latch;

/// `docker build` a directory into `image`.
pub async fn build_directory(
    docker: &Docker,
    image: &str,
    context_dir: &Path,
    cancel: &Latch,
) -> Result<()> {
    let context_dir = context_dir.to_path_buf();
    let context = tokio::task::spawn_blocking(move || tar_directory(&context_dir))
        .await
        .map_err(|e| HanoverdError::internal(format!("context archiving panicked: {}", e)))??;

    build_from_tar(docker, image, context, cancel).await
}

/// `docker build` a tar archive into `image`.
pub async fn build_from_tar(
    docker: &Docker,
    image: &str,
    context: Vec<u8>,
    cancel: &Latch,
) -> Result<()> {
    let options = BuildImageOptions::<String> {
        t: image.to_string(),
        rm: true,
        ..Default::default()
    };

    let mut stream = docker.build_image(options, None, Some(context.into()));

    loop {
        let item = tokio::select! {
            _ = cancel.wait() => return Err(HanoverdError::ShuttingDown),
            item = stream.next() => item,
        };
        match item {
            None => break,
            Some(Ok(progress)) => {
                if let Some(message) = progress.stream {
                    let message = message.trim_end();
                    if !message.is_empty() {
                        info!("build {}: {}", image, message);
                    }
                }
                if let Some(error) = progress.error {
                    return Err(HanoverdError::acquisition(error));
                }
            }
            Some(Err(e)) => return Err(e.into()),
        }
    }

    Ok(())
}

/// Pull `image` from a registry, draining the progress stream into the log.
pub async fn pull_image(docker: &Docker, image: &str, cancel: &Latch) -> Result<()> {
    info!("Pulling {}", image);

    let options = CreateImageOptions::<String> {
        from_image: image.to_string(),
        ..Default::default()
    };
    let mut stream = docker.create_image(Some(options), None, None);

    loop {
        let item = tokio::select! {
            _ = cancel.wait() => return Err(HanoverdError::ShuttingDown),
            item = stream.next() => item,
        };
        match item {
            None => break,
            Some(Ok(progress)) => {
                if let Some(status) = progress.status {
                    debug!("pull {}: {}", image, status);
                }
                if let Some(error) = progress.error {
                    return Err(HanoverdError::acquisition(error));
                }
            }
            Some(Err(e)) => return Err(e.into()),
        }
    }

    Ok(())
}

/// Run the build-time `image` and collect its standard output, a tar
/// archive, as the build context of a second image named `<image>-runtime`.
pub async fn construct_runtime(docker: &Docker, image: &str, cancel: &Latch) -> Result<String> {
    let context = run_for_context(docker, image, cancel).await?;
    let runtime_image = format!("{}-runtime", image);
    build_from_tar(docker, &runtime_image, context, cancel).await?;
    Ok(runtime_image)
}

/// Run one throwaway container of `image` and return its stdout bytes.
async fn run_for_context(docker: &Docker, image: &str, cancel: &Latch) -> Result<Vec<u8>> {
    let config = ContainerConfig {
        hostname: Some("generateruntimecontext".to_string()),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        image: Some(image.to_string()),
        labels: Some(HashMap::from([
            ("orchestrator".to_string(), "hanoverd".to_string()),
            (
                "purpose".to_string(),
                "Generate build context for runtime container".to_string(),
            ),
        ])),
        ..Default::default()
    };

    let created = docker
        .create_container(None::<CreateContainerOptions<String>>, config)
        .await?;
    for warning in &created.warnings {
        warn!("create_container warning: {}", warning);
    }
    let id = created.id;

    let remove = || async {
        let result = docker
            .remove_container(
                &id,
                Some(RemoveContainerOptions { force: true, v: true, ..Default::default() }),
            )
            .await;
        if let Err(e) = result {
            warn!("Error removing intermediate container: {}", e);
        }
    };

    // Attach before start so no output is missed.
    let attach = docker
        .attach_container(
            &id,
            Some(AttachContainerOptions::<String> {
                stdout: Some(true),
                stderr: Some(true),
                logs: Some(true),
                stream: Some(true),
                ..Default::default()
            }),
        )
        .await;
    let mut attached = match attach {
        Ok(results) => results,
        Err(e) => {
            remove().await;
            return Err(e.into());
        }
    };

    if let Err(e) = docker
        .start_container(&id, None::<StartContainerOptions<String>>)
        .await
    {
        remove().await;
        return Err(e.into());
    }

    let mut context = Vec::new();
    loop {
        let chunk = tokio::select! {
            _ = cancel.wait() => {
                remove().await;
                return Err(HanoverdError::ShuttingDown);
            }
            chunk = attached.output.next() => chunk,
        };
        match chunk {
            None => break,
            Some(Ok(bollard::container::LogOutput::StdOut { message })) => {
                context.extend_from_slice(&message);
            }
            Some(Ok(bollard::container::LogOutput::StdErr { message })) => {
                // The build-time container's diagnostics go to our log.
                for line in String::from_utf8_lossy(&message).lines() {
                    info!("buildtime {}: {}", image, line);
                }
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                remove().await;
                return Err(e.into());
            }
        }
    }

    // The context is only trustworthy if the producer exited cleanly.
    let mut wait_stream = docker.wait_container(&id, None::<WaitContainerOptions<String>>);
    let status = match wait_stream.next().await {
        Some(Ok(response)) => response.status_code,
        Some(Err(e)) => {
            remove().await;
            return Err(e.into());
        }
        None => 0,
    };
    remove().await;

    if status != 0 {
        return Err(HanoverdError::acquisition(format!(
            "buildtime image {} exited with status {}",
            image, status
        )));
    }

    Ok(context)
}

/// Archive a directory as an uncompressed tar, honoring `.dockerignore`.
fn tar_directory(dir: &Path) -> Result<Vec<u8>> {
    let ignores = IgnorePatterns::load(dir)?;

    let mut builder = tar::Builder::new(Vec::new());
    append_dir(&mut builder, dir, Path::new(""), &ignores)?;
    builder
        .into_inner()
        .map_err(|e| HanoverdError::internal(format!("archiving build context: {}", e)))
}

fn append_dir(
    builder: &mut tar::Builder<Vec<u8>>,
    base: &Path,
    relative: &Path,
    ignores: &IgnorePatterns,
) -> Result<()> {
    let full = base.join(relative);
    let mut entries: Vec<_> =
        std::fs::read_dir(&full)?.collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let rel = relative.join(entry.file_name());
        let rel_str = rel.to_string_lossy().replace('\\', "/");
        if ignores.is_ignored(&rel_str) {
            continue;
        }

        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            builder.append_dir(&rel, &path)?;
            append_dir(builder, base, &rel, ignores)?;
        } else {
            builder.append_path_with_name(&path, &rel)?;
        }
    }
    Ok(())
}

/// The subset of `.dockerignore` syntax we support: exact paths, directory
/// prefixes, and `*` globs that do not cross `/`. `Dockerfile` and
/// `.dockerignore` themselves are never excluded.
struct IgnorePatterns(Vec<String>);

impl IgnorePatterns {
    fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(".dockerignore");
        let patterns = match std::fs::read_to_string(&path) {
            Ok(content) => content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(|line| line.trim_start_matches('/').trim_end_matches('/').to_string())
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self(patterns))
    }

    fn is_ignored(&self, path: &str) -> bool {
        if path == "Dockerfile" || path == ".dockerignore" {
            return false;
        }
        self.0.iter().any(|pattern| {
            // A pattern excludes the path itself and everything under it.
            path_matches(pattern, path)
                || path
                    .split('/')
                    .scan(String::new(), |prefix, segment| {
                        if !prefix.is_empty() {
                            prefix.push('/');
                        }
                        prefix.push_str(segment);
                        Some(prefix.clone())
                    })
                    .any(|prefix| path_matches(pattern, &prefix))
        })
    }
}

/// Segment-wise glob: `*` matches within a segment, `**` matches any number
/// of whole segments.
fn path_matches(pattern: &str, path: &str) -> bool {
    fn segments_match(pattern: &[&str], path: &[&str]) -> bool {
        match (pattern.first(), path.first()) {
            (None, None) => true,
            (Some(&"**"), _) => {
                segments_match(&pattern[1..], path)
                    || (!path.is_empty() && segments_match(pattern, &path[1..]))
            }
            (Some(p), Some(s)) => segment_matches(p, s) && segments_match(&pattern[1..], &path[1..]),
            _ => false,
        }
    }

    fn segment_matches(pattern: &str, segment: &str) -> bool {
        let pattern: Vec<char> = pattern.chars().collect();
        let segment: Vec<char> = segment.chars().collect();

        fn chars_match(pattern: &[char], segment: &[char]) -> bool {
            match (pattern.first(), segment.first()) {
                (None, None) => true,
                (Some('*'), _) => {
                    chars_match(&pattern[1..], segment)
                        || (!segment.is_empty() && chars_match(pattern, &segment[1..]))
                }
                (Some('?'), Some(_)) => chars_match(&pattern[1..], &segment[1..]),
                (Some(p), Some(c)) => p == c && chars_match(&pattern[1..], &segment[1..]),
                _ => false,
            }
        }

        chars_match(&pattern, &segment)
    }

    let pattern: Vec<&str> = pattern.split('/').collect();
    let path: Vec<&str> = path.split('/').collect();
    segments_match(&pattern, &path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_path_matches() {
        assert!(path_matches("target", "target"));
        assert!(path_matches("*.log", "debug.log"));
        assert!(!path_matches("*.log", "logs/debug.log"));
        assert!(path_matches("**/*.log", "a/b/debug.log"));
        assert!(path_matches("docs/*.md", "docs/readme.md"));
        assert!(!path_matches("docs/*.md", "docs/sub/readme.md"));
    }

    #[test]
    fn test_ignore_patterns_exclude_subtrees() {
        let ignores = IgnorePatterns(vec!["target".to_string(), "*.tmp".to_string()]);
        assert!(ignores.is_ignored("target"));
        assert!(ignores.is_ignored("target/debug/app"));
        assert!(ignores.is_ignored("scratch.tmp"));
        assert!(!ignores.is_ignored("src/main.rs"));
        assert!(!ignores.is_ignored("Dockerfile"));
    }

    #[test]
    fn test_tar_directory_honors_dockerignore() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM scratch\n").unwrap();
        std::fs::write(dir.path().join("keep.txt"), "kept").unwrap();
        std::fs::write(dir.path().join("drop.log"), "dropped").unwrap();
        std::fs::write(dir.path().join(".dockerignore"), "*.log\n").unwrap();

        let bytes = tar_directory(dir.path()).unwrap();
        let mut archive = tar::Archive::new(&bytes[..]);
        let mut names = Vec::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            names.push(entry.path().unwrap().to_string_lossy().into_owned());
            let mut content = String::new();
            let _ = entry.read_to_string(&mut content);
        }

        assert!(names.contains(&"Dockerfile".to_string()));
        assert!(names.contains(&"keep.txt".to_string()));
        assert!(!names.iter().any(|n| n.ends_with("drop.log")));
    }
}
