use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::process::Output;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::Config;
use crate::error::DownloadError;

/// H.264 plus AAC merged into mp4 plays everywhere without re-encoding;
/// fall back to any mp4, then to whatever the extractor offers.
const FORMAT_SELECTOR: &str =
    "bestvideo[vcodec^=avc]+bestaudio[acodec^=mp4a]/best[ext=mp4]/best";

/// Runs yt-dlp against per-request job directories.
///
/// Each download is two invocations: a dry run that predicts the output
/// filename, then the real download verified against that prediction.
pub struct Downloader {
    program: PathBuf,
    tool_timeout: Duration,
    cookie: Option<String>,
}

impl Downloader {
    pub fn new(config: &Config) -> Self {
        Self {
            program: config.ytdlp_program.clone(),
            tool_timeout: config.tool_timeout,
            cookie: config.cookie.clone(),
        }
    }

    /// Downloads the video behind `url` into `output_dir` and returns the
    /// path of the file yt-dlp produced.
    ///
    /// When a cookie is configured it is written to a uniquely named file
    /// under `output_dir` for the duration of the call and removed again
    /// whatever the outcome.
    pub async fn download(&self, url: &str, output_dir: &Path) -> Result<PathBuf, DownloadError> {
        let cookie_file = self.write_cookie_file(output_dir).await?;
        let result = self.run(url, output_dir, cookie_file.as_deref()).await;
        if let Some(path) = &cookie_file {
            remove_cookie_file(path).await;
        }
        result
    }

    async fn run(
        &self,
        url: &str,
        output_dir: &Path,
        cookie_file: Option<&Path>,
    ) -> Result<PathBuf, DownloadError> {
        let output_template = format!("{}/%(title)s.%(ext)s", output_dir.to_string_lossy());

        let mut preview = Command::new(&self.program);
        preview
            .arg("--get-filename")
            .arg("-o")
            .arg(&output_template)
            .arg(url);
        let preview_output = self.run_tool(preview).await?;
        let predicted = last_nonempty_line(&preview_output.stdout).ok_or_else(|| {
            DownloadError::Internal("yt-dlp did not print a filename for the URL".to_string())
        })?;
        let artifact_path = contained_artifact_path(output_dir, &predicted)?;

        let mut download = Command::new(&self.program);
        download
            .arg("-f")
            .arg(FORMAT_SELECTOR)
            .arg("-o")
            .arg(&output_template);
        if let Some(path) = cookie_file {
            download.arg("--cookies").arg(path);
        }
        download.arg(url);
        self.run_tool(download).await?;

        // A zero exit alone is not proof the predicted file materialized.
        let exists = tokio::fs::try_exists(&artifact_path).await.map_err(|error| {
            DownloadError::Internal(format!("could not stat downloaded file: {error}"))
        })?;
        if !exists {
            return Err(DownloadError::OutputMissing {
                path: artifact_path,
            });
        }

        Ok(artifact_path)
    }

    async fn run_tool(&self, mut command: Command) -> Result<Output, DownloadError> {
        // Without this a timed-out yt-dlp would keep downloading forever.
        command.kill_on_drop(true);

        let seconds = self.tool_timeout.as_secs();
        let result = timeout(self.tool_timeout, command.output())
            .await
            .map_err(|_| DownloadError::TimedOut { seconds })?;

        let output = result.map_err(|error| {
            if error.kind() == ErrorKind::NotFound {
                DownloadError::Internal(format!(
                    "{} is not installed or not on PATH",
                    self.program.display()
                ))
            } else {
                DownloadError::Internal(format!(
                    "could not run {}: {error}",
                    self.program.display()
                ))
            }
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!("yt-dlp error details: {}", stderr.trim());
            return Err(classify_tool_failure(&stderr));
        }

        Ok(output)
    }

    async fn write_cookie_file(&self, output_dir: &Path) -> Result<Option<PathBuf>, DownloadError> {
        let Some(cookie) = self.cookie.as_deref() else {
            return Ok(None);
        };

        let path = output_dir.join(format!("cookie_{}.txt", Uuid::new_v4()));
        tokio::fs::write(&path, cookie).await.map_err(|error| {
            DownloadError::Internal(format!("could not write temporary cookie file: {error}"))
        })?;
        info!("Using temporary cookie file for download.");
        Ok(Some(path))
    }
}

fn classify_tool_failure(stderr: &str) -> DownloadError {
    let lowered = stderr.to_lowercase();
    if lowered.contains("login") || lowered.contains("unsupported url") {
        DownloadError::AccessDenied
    } else {
        DownloadError::ToolFailure
    }
}

/// The predicted filename is expanded from remote metadata, so it is only
/// trusted once it provably stays inside the job directory.
fn contained_artifact_path(output_dir: &Path, predicted: &str) -> Result<PathBuf, DownloadError> {
    let path = PathBuf::from(predicted);
    let contained = path.strip_prefix(output_dir).is_ok_and(|rest| {
        rest.components().next().is_some()
            && rest
                .components()
                .all(|component| matches!(component, Component::Normal(_)))
    });

    if !contained {
        return Err(DownloadError::Internal(format!(
            "yt-dlp predicted an output path outside the download directory: {predicted}"
        )));
    }

    Ok(path)
}

fn last_nonempty_line(stdout: &[u8]) -> Option<String> {
    String::from_utf8_lossy(stdout)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .map(ToString::to_string)
}

async fn remove_cookie_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => info!("Successfully deleted temporary cookie file."),
        Err(error) if error.kind() == ErrorKind::NotFound => {}
        Err(error) => error!(
            "Error deleting temporary cookie file {}: {error}",
            path.display()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn stub_config(program: PathBuf, cookie: Option<&str>) -> Config {
        Config {
            bind_addr: "127.0.0.1:0".to_string(),
            download_dir: PathBuf::from("downloads"),
            ytdlp_program: program,
            tool_timeout: Duration::from_secs(5),
            cookie: cookie.map(ToString::to_string),
        }
    }

    #[cfg(unix)]
    fn install_stub(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("yt-dlp");
        fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn dir_contains_cookie(dir: &Path) -> bool {
        fs::read_dir(dir).unwrap().any(|entry| {
            entry
                .unwrap()
                .file_name()
                .to_string_lossy()
                .starts_with("cookie_")
        })
    }

    /// Mimics both invocations: the dry run prints the expanded template
    /// after a warning line, the download writes the file and records
    /// whether a readable cookie file was passed along.
    const HAPPY_STUB: &str = r#"
mode=preview
template=""
cookies=""
while [ $# -gt 0 ]; do
  case "$1" in
    --get-filename) mode=preview ;;
    -f) mode=download; shift ;;
    -o) shift; template="$1" ;;
    --cookies) shift; cookies="$1" ;;
  esac
  shift
done
target=$(printf '%s' "$template" | sed 's/%(title)s\.%(ext)s/My Video.mp4/')
if [ "$mode" = preview ]; then
  echo "WARNING: using generic extractor"
  printf '%s\n' "$target"
  exit 0
fi
if [ -n "$cookies" ] && [ -f "$cookies" ]; then
  printf 'ok' > "$(dirname "$target")/saw_cookie"
fi
printf 'video-bytes' > "$target"
"#;

    const MISSING_OUTPUT_STUB: &str = r#"
mode=preview
template=""
while [ $# -gt 0 ]; do
  case "$1" in
    --get-filename) mode=preview ;;
    -f) mode=download; shift ;;
    -o) shift; template="$1" ;;
    --cookies) shift ;;
  esac
  shift
done
if [ "$mode" = preview ]; then
  printf '%s\n' "$template" | sed 's/%(title)s\.%(ext)s/My Video.mp4/'
fi
exit 0
"#;

    const LOGIN_STUB: &str = r#"
echo "ERROR: This video is only available for registered users. Use --cookies or Login first." >&2
exit 1
"#;

    const UNSUPPORTED_STUB: &str = r#"
echo "ERROR: Unsupported URL: https://example.com/page" >&2
exit 1
"#;

    const BOOM_STUB: &str = r#"
echo "ERROR: no formats found" >&2
exit 1
"#;

    const ESCAPE_STUB: &str = r#"
printf '%s\n' "/etc/passwd"
"#;

    const SLEEP_STUB: &str = "sleep 5\n";

    #[cfg(unix)]
    #[tokio::test]
    async fn downloads_into_the_job_directory_and_removes_the_cookie() {
        let temp = TempDir::new().unwrap();
        let job_dir = temp.path().join("job");
        fs::create_dir_all(&job_dir).unwrap();
        let stub = install_stub(temp.path(), HAPPY_STUB);

        let downloader =
            Downloader::new(&stub_config(stub, Some("# Netscape HTTP Cookie File")));
        let artifact = downloader
            .download("https://example.com/reel/1", &job_dir)
            .await
            .unwrap();

        assert_eq!(artifact, job_dir.join("My Video.mp4"));
        assert_eq!(fs::read_to_string(&artifact).unwrap(), "video-bytes");
        assert!(job_dir.join("saw_cookie").exists());
        assert!(!dir_contains_cookie(&job_dir));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn works_without_a_configured_cookie() {
        let temp = TempDir::new().unwrap();
        let job_dir = temp.path().join("job");
        fs::create_dir_all(&job_dir).unwrap();
        let stub = install_stub(temp.path(), HAPPY_STUB);

        let downloader = Downloader::new(&stub_config(stub, None));
        let artifact = downloader
            .download("https://example.com/reel/1", &job_dir)
            .await
            .unwrap();

        assert_eq!(artifact, job_dir.join("My Video.mp4"));
        assert!(!job_dir.join("saw_cookie").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn a_clean_exit_without_the_file_is_reported_as_missing_output() {
        let temp = TempDir::new().unwrap();
        let job_dir = temp.path().join("job");
        fs::create_dir_all(&job_dir).unwrap();
        let stub = install_stub(temp.path(), MISSING_OUTPUT_STUB);

        let downloader = Downloader::new(&stub_config(stub, None));
        let error = downloader
            .download("https://example.com/reel/1", &job_dir)
            .await
            .unwrap_err();

        assert!(matches!(error, DownloadError::OutputMissing { .. }));
        assert!(error.to_string().contains("output file is missing"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn login_walls_map_to_access_denied_and_still_remove_the_cookie() {
        let temp = TempDir::new().unwrap();
        let job_dir = temp.path().join("job");
        fs::create_dir_all(&job_dir).unwrap();
        let stub = install_stub(temp.path(), LOGIN_STUB);

        let downloader = Downloader::new(&stub_config(stub, Some("cookie")));
        let error = downloader
            .download("https://example.com/reel/1", &job_dir)
            .await
            .unwrap_err();

        assert!(matches!(error, DownloadError::AccessDenied));
        assert_eq!(
            error.to_string(),
            "Could not download. The video may be private or requires a login to view."
        );
        assert!(!dir_contains_cookie(&job_dir));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unsupported_urls_map_to_access_denied() {
        let temp = TempDir::new().unwrap();
        let job_dir = temp.path().join("job");
        fs::create_dir_all(&job_dir).unwrap();
        let stub = install_stub(temp.path(), UNSUPPORTED_STUB);

        let downloader = Downloader::new(&stub_config(stub, None));
        let error = downloader
            .download("https://example.com/page", &job_dir)
            .await
            .unwrap_err();

        assert!(matches!(error, DownloadError::AccessDenied));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn other_nonzero_exits_map_to_tool_failure() {
        let temp = TempDir::new().unwrap();
        let job_dir = temp.path().join("job");
        fs::create_dir_all(&job_dir).unwrap();
        let stub = install_stub(temp.path(), BOOM_STUB);

        let downloader = Downloader::new(&stub_config(stub, None));
        let error = downloader
            .download("https://example.com/reel/1", &job_dir)
            .await
            .unwrap_err();

        assert!(matches!(error, DownloadError::ToolFailure));
        assert_eq!(
            error.to_string(),
            "yt-dlp failed. Please check the URL and try again."
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_invocations_time_out_and_still_remove_the_cookie() {
        let temp = TempDir::new().unwrap();
        let job_dir = temp.path().join("job");
        fs::create_dir_all(&job_dir).unwrap();
        let stub = install_stub(temp.path(), SLEEP_STUB);

        let mut config = stub_config(stub, Some("cookie"));
        config.tool_timeout = Duration::from_secs(1);
        let downloader = Downloader::new(&config);
        let error = downloader
            .download("https://example.com/reel/1", &job_dir)
            .await
            .unwrap_err();

        assert!(matches!(error, DownloadError::TimedOut { seconds: 1 }));
        assert!(!dir_contains_cookie(&job_dir));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn predicted_paths_outside_the_job_directory_are_rejected() {
        let temp = TempDir::new().unwrap();
        let job_dir = temp.path().join("job");
        fs::create_dir_all(&job_dir).unwrap();
        let stub = install_stub(temp.path(), ESCAPE_STUB);

        let downloader = Downloader::new(&stub_config(stub, None));
        let error = downloader
            .download("https://example.com/reel/1", &job_dir)
            .await
            .unwrap_err();

        assert!(error.to_string().contains("outside the download directory"));
    }

    #[tokio::test]
    async fn a_missing_tool_is_an_internal_error() {
        let temp = TempDir::new().unwrap();
        let job_dir = temp.path().join("job");
        fs::create_dir_all(&job_dir).unwrap();

        let downloader =
            Downloader::new(&stub_config(temp.path().join("missing-tool"), None));
        let error = downloader
            .download("https://example.com/reel/1", &job_dir)
            .await
            .unwrap_err();

        assert!(error.to_string().contains("not installed or not on PATH"));
    }

    #[test]
    fn stderr_classification_matches_known_patterns() {
        assert!(matches!(
            classify_tool_failure("ERROR: LOGIN required"),
            DownloadError::AccessDenied
        ));
        assert!(matches!(
            classify_tool_failure("ERROR: Unsupported URL: https://x"),
            DownloadError::AccessDenied
        ));
        assert!(matches!(
            classify_tool_failure("network unreachable"),
            DownloadError::ToolFailure
        ));
    }

    #[test]
    fn containment_rejects_everything_that_leaves_the_job_directory() {
        let dir = Path::new("/data/jobs/abc");
        assert!(contained_artifact_path(dir, "/data/jobs/abc/video.mp4").is_ok());
        assert!(contained_artifact_path(dir, "/data/jobs/abc/nested/video.mp4").is_ok());
        assert!(contained_artifact_path(dir, "/data/jobs/abc").is_err());
        assert!(contained_artifact_path(dir, "/data/jobs/abc/../evil.mp4").is_err());
        assert!(contained_artifact_path(dir, "/data/jobs/abcdef/video.mp4").is_err());
        assert!(contained_artifact_path(dir, "/tmp/evil.mp4").is_err());
    }

    #[test]
    fn takes_the_last_nonempty_stdout_line() {
        assert_eq!(
            last_nonempty_line(b"WARNING: something\n/tmp/a.mp4\n\n"),
            Some("/tmp/a.mp4".to_string())
        );
        assert_eq!(last_nonempty_line(b"  /tmp/b.mp4  \n"), Some("/tmp/b.mp4".to_string()));
        assert_eq!(last_nonempty_line(b"\n \n"), None);
        assert_eq!(last_nonempty_line(b""), None);
    }
}
