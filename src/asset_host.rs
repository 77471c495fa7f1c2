//! Candidate image hosting

use std::path::Path;

use futures_util::{future::BoxFuture, FutureExt};
use log::{debug, info};
use serde::Deserialize;

use crate::{
    constants::MAX_IMAGE_BYTES,
    types::{SdkError, SdkResult},
};

const LOG_TARGET: &str = "assets";

/// Image read from local storage, pending upload
#[derive(Clone, PartialEq, Eq)]
pub struct LocalImage {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

impl std::fmt::Debug for LocalImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalImage")
            .field("file_name", &self.file_name)
            .field("size", &self.bytes.len())
            .finish()
    }
}

impl LocalImage {
    /// Fails with `ImageTooLarge` above `MAX_IMAGE_BYTES`
    pub fn new(file_name: impl Into<String>, bytes: Vec<u8>) -> SdkResult<Self> {
        check_size(bytes.len())?;
        Ok(Self {
            file_name: file_name.into(),
            bytes,
        })
    }
    /// Read an image file
    pub fn from_path(path: impl AsRef<Path>) -> SdkResult<Self> {
        let path = path.as_ref();
        check_size(std::fs::metadata(path)?.len() as usize)?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self::new(file_name, std::fs::read(path)?)
    }
}

pub(crate) fn check_size(size: usize) -> SdkResult<()> {
    if size > MAX_IMAGE_BYTES {
        return Err(SdkError::ImageTooLarge {
            size,
            limit: MAX_IMAGE_BYTES,
        });
    }
    Ok(())
}

/// Hosts images and hands back a public URL
pub trait AssetHost: Send + Sync {
    fn upload<'a>(&'a self, image: &'a LocalImage) -> BoxFuture<'a, SdkResult<String>>;
}

/// Upload `image` if there is one
///
/// Callers treat an error as non-fatal and carry on without an image
pub async fn upload_optional(
    host: Option<&dyn AssetHost>,
    image: Option<&LocalImage>,
) -> SdkResult<Option<String>> {
    let image = match image {
        Some(image) => image,
        None => return Ok(None),
    };
    let host = host.ok_or_else(|| SdkError::UploadFailure("no asset host configured".into()))?;

    debug!(target: LOG_TARGET, "uploading {image:?}");
    let url = host.upload(image).await?;
    info!(target: LOG_TARGET, "uploaded {} to {url}", image.file_name);

    Ok(Some(url))
}

#[derive(Deserialize)]
struct UploadResponse {
    #[serde(default)]
    success: bool,
    data: Option<UploadData>,
    error: Option<UploadError>,
}

#[derive(Deserialize)]
struct UploadData {
    url: String,
}

#[derive(Deserialize)]
struct UploadError {
    message: String,
}

/// Client of an ImgBB compatible upload API
pub struct ImgbbAssetHost {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl ImgbbAssetHost {
    pub fn new(endpoint: &str, api_key: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.to_string(),
            api_key: api_key.to_string(),
        }
    }

    async fn upload_impl(&self, image: &LocalImage) -> SdkResult<String> {
        let encoded = base64::encode(&image.bytes);
        let response = self
            .client
            .post(&self.endpoint)
            .query(&[("key", self.api_key.as_str())])
            .form(&[
                ("image", encoded.as_str()),
                ("name", image.file_name.as_str()),
            ])
            .send()
            .await
            .map_err(upload_failure)?;
        let status = response.status();
        let body: UploadResponse = response.json().await.map_err(upload_failure)?;

        match body {
            UploadResponse {
                success: true,
                data: Some(UploadData { url }),
                ..
            } => Ok(url),
            UploadResponse { error, .. } => Err(SdkError::UploadFailure(
                error
                    .map(|e| e.message)
                    .unwrap_or_else(|| format!("upload rejected ({status})")),
            )),
        }
    }
}

impl AssetHost for ImgbbAssetHost {
    fn upload<'a>(&'a self, image: &'a LocalImage) -> BoxFuture<'a, SdkResult<String>> {
        self.upload_impl(image).boxed()
    }
}

fn upload_failure(err: reqwest::Error) -> SdkError {
    SdkError::UploadFailure(err.to_string())
}

#[cfg(test)]
mod tests {
    use futures_util::future::ready;

    use super::*;

    struct FixedHost(Option<&'static str>);

    impl AssetHost for FixedHost {
        fn upload<'a>(&'a self, _image: &'a LocalImage) -> BoxFuture<'a, SdkResult<String>> {
            ready(
                self.0
                    .map(str::to_string)
                    .ok_or_else(|| SdkError::UploadFailure("host down".into())),
            )
            .boxed()
        }
    }

    #[test]
    fn image_size_limit() {
        assert!(LocalImage::new("ok.png", vec![0; MAX_IMAGE_BYTES]).is_ok());
        assert!(matches!(
            LocalImage::new("big.png", vec![0; MAX_IMAGE_BYTES + 1]),
            Err(SdkError::ImageTooLarge { size, limit: MAX_IMAGE_BYTES }) if size == MAX_IMAGE_BYTES + 1
        ));
    }

    #[test]
    fn image_from_path() {
        let path = std::env::temp_dir().join(format!("candidate-{}.png", std::process::id()));
        std::fs::write(&path, [1, 2, 3]).unwrap();
        let image = LocalImage::from_path(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(image.bytes, vec![1, 2, 3]);
        assert!(image.file_name.starts_with("candidate-"));
        assert!(matches!(
            LocalImage::from_path(&path),
            Err(SdkError::Io(_))
        ));
    }

    #[tokio::test]
    async fn optional_upload() {
        let image = LocalImage::new("a.png", vec![1]).unwrap();
        let up: &dyn AssetHost = &FixedHost(Some("https://i.example/a.png"));
        let down: &dyn AssetHost = &FixedHost(None);

        assert_eq!(upload_optional(Some(up), None).await.unwrap(), None);
        assert_eq!(upload_optional(None, None).await.unwrap(), None);
        assert_eq!(
            upload_optional(Some(up), Some(&image)).await.unwrap(),
            Some("https://i.example/a.png".to_string())
        );
        assert!(matches!(
            upload_optional(Some(down), Some(&image)).await,
            Err(SdkError::UploadFailure(_))
        ));
        assert!(matches!(
            upload_optional(None, Some(&image)).await,
            Err(SdkError::UploadFailure(_))
        ));
    }

    #[cfg(feature = "rpc_tests")]
    #[tokio::test]
    async fn live_upload() {
        let api_key = std::env::var("IMGBB_API_KEY").expect("IMGBB_API_KEY set");
        let host = ImgbbAssetHost::new(crate::constants::DEFAULT_ASSET_HOST_URL, &api_key);
        // 1x1 transparent gif
        let gif = base64::decode("R0lGODlhAQABAIAAAAAAAP///yH5BAEAAAAALAAAAAABAAEAAAIBRAA7")
            .expect("valid base64");
        let url = host
            .upload(&LocalImage::new("pixel.gif", gif).expect("small"))
            .await
            .expect("uploads");
        dbg!(url);
    }
}
