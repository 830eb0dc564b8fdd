//! Attachment cache: downloads a URL into a per-hub cache directory and
//! names the file by platform + native id, suffixed by the MIME type the
//! download actually returned.

use std::path::{Path, PathBuf};

use anyhow::Context;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;

/// Return (and create, if missing) the cache directory for a given hub:
/// `<cwd>/cache/<hub_name>/`.
pub fn hub_cache_dir(hub_name: &str) -> PathBuf {
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join("cache")
        .join(hub_name)
}

/// Download `url` into `directory`, naming the file `<stem><ext>` where
/// `ext` is derived from the response's `content-type` header. Creates
/// `directory` if it does not exist. Returns the path the file was written
/// to.
pub async fn download_to_cache(
    client: &reqwest::Client,
    url: &str,
    directory: &Path,
    stem: &str,
    headers: Option<reqwest::header::HeaderMap>,
) -> anyhow::Result<PathBuf> {
    tokio::fs::create_dir_all(directory)
        .await
        .with_context(|| format!("creating cache dir {}", directory.display()))?;

    let mut req = client.get(url);
    if let Some(h) = headers {
        req = req.headers(h);
    }
    let resp = req
        .send()
        .await
        .with_context(|| format!("downloading {url}"))?
        .error_for_status()
        .with_context(|| format!("downloading {url}"))?;

    let content_type = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();

    let filename = rename_with_proper_suffix(stem, &content_type);
    let file_path = directory.join(&filename);

    let mut file = tokio::fs::File::create(&file_path)
        .await
        .with_context(|| format!("creating {}", file_path.display()))?;

    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.with_context(|| format!("reading body of {url}"))?;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;

    Ok(file_path)
}

/// Append the extension implied by `content_type` (the part after the `/`)
/// unless `filename` already ends with it.
fn rename_with_proper_suffix(filename: &str, content_type: &str) -> String {
    let mime = content_type.split(';').next().unwrap_or(content_type).trim();
    let ext = mime.split('/').nth(1).unwrap_or("bin");
    let suffix = format!(".{ext}");
    if filename.ends_with(&suffix) {
        filename.to_string()
    } else {
        format!("{filename}{suffix}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn suffix_added_when_missing() {
        assert_eq!(rename_with_proper_suffix("foo", "image/png"), "foo.png");
    }

    #[test]
    fn suffix_not_duplicated() {
        assert_eq!(rename_with_proper_suffix("foo.png", "image/png"), "foo.png");
    }

    #[test]
    fn suffix_strips_charset_parameters() {
        assert_eq!(
            rename_with_proper_suffix("foo", "text/plain; charset=utf-8"),
            "foo.plain"
        );
    }

    #[tokio::test]
    async fn download_writes_file_with_derived_extension() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/image.bin"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/png")
                    .set_body_bytes(vec![0xde, 0xad, 0xbe, 0xef]),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let client = reqwest::Client::new();
        let url = format!("{}/image.bin", server.uri());
        let path = download_to_cache(&client, &url, dir.path(), "discord_123", None)
            .await
            .unwrap();

        assert_eq!(path.file_name().unwrap().to_str().unwrap(), "discord_123.png");
        let bytes = tokio::fs::read(&path).await.unwrap();
        assert_eq!(bytes, vec![0xde, 0xad, 0xbe, 0xef]);
    }
}
