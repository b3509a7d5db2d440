use crate::{config::ModelConfig, detector::DetectorError};
use std::path::{Path, PathBuf};
use tokio::{fs, io::AsyncWriteExt};

/// Downloads the ONNX model and tokenizer unless they are already on disk.
pub async fn ensure_model_files(config: &ModelConfig) -> Result<(), DetectorError> {
    let client = reqwest::Client::new();
    let files = [
        (config.get_model_path(), config.model_url.as_str()),
        (config.get_tokenizer_path(), config.tokenizer_url.as_str()),
    ];

    for (path, url) in files {
        if fs::try_exists(&path).await? {
            tracing::debug!("Found {}", path.display());
            continue;
        }
        tracing::info!("{} not found, downloading from {}", path.display(), url);
        let bytes = download(&client, url, &path).await?;
        tracing::info!("Downloaded {} bytes to {}", bytes, path.display());
    }

    Ok(())
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    dest.with_file_name(name)
}

/// Streams `url` into `dest.part` and renames it once complete, so an
/// interrupted download never leaves a truncated file at `dest`.
async fn download(
    client: &reqwest::Client,
    url: &str,
    dest: &Path,
) -> Result<u64, DetectorError> {
    let to_download_error = |source| DetectorError::Download {
        url: url.to_string(),
        source,
    };

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).await?;
    }

    let mut response = client
        .get(url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(to_download_error)?;

    let partial = partial_path(dest);
    let mut file = fs::File::create(&partial).await?;
    let mut written = 0u64;
    while let Some(chunk) = response.chunk().await.map_err(to_download_error)? {
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    drop(file);

    fs::rename(&partial, dest).await?;
    Ok(written)
}
