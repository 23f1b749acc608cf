use crate::error::PredictError;
use actix_multipart::Multipart;
use futures::{StreamExt, TryStreamExt};
use lesion_shared::PatientMetadata;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const IMAGE_FIELD: &str = "image";

/// The image file part of the form, still in memory.
#[derive(Debug)]
pub struct ImagePart {
    pub filename: Option<String>,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct UploadForm {
    pub image: Option<ImagePart>,
    pub metadata: PatientMetadata,
}

/// Handle to an image persisted for this request.
#[derive(Debug, Clone)]
pub struct UploadedImage {
    pub path: PathBuf,
    pub original_filename: Option<String>,
    pub size: usize,
}

/// Reads every part of the form. Only the first `image` part and the first
/// value of each metadata field are kept.
pub async fn read_form(
    mut payload: Multipart,
    max_image_bytes: usize,
) -> Result<UploadForm, PredictError> {
    let mut form = UploadForm::default();
    let mut seen = HashSet::new();

    while let Some(mut field) = payload.try_next().await.map_err(|e| {
        log::warn!("Malformed multipart body: {}", e);
        PredictError::MissingInput
    })? {
        let (name, filename) = match field.content_disposition() {
            Some(cd) => (
                cd.get_name().unwrap_or_default().to_string(),
                cd.get_filename().map(str::to_string),
            ),
            None => (String::new(), None),
        };
        let first = seen.insert(name.clone());
        let limit = if name == IMAGE_FIELD {
            max_image_bytes
        } else {
            max_image_bytes.min(64 * 1024)
        };

        let mut data = Vec::new();
        while let Some(chunk) = field.next().await {
            let chunk = chunk.map_err(|e| {
                log::warn!("Failed reading multipart field '{}': {}", name, e);
                PredictError::MissingInput
            })?;
            if data.len() + chunk.len() > limit {
                return Err(PredictError::PayloadTooLarge { limit });
            }
            data.extend_from_slice(&chunk);
        }

        if !first {
            continue;
        }
        match name.as_str() {
            IMAGE_FIELD => {
                if !data.is_empty() {
                    form.image = Some(ImagePart {
                        filename,
                        bytes: data,
                    });
                }
            }
            "dx_type" => form.metadata.dx_type = text(&data),
            "age" => form.metadata.age = text(&data),
            "sex" => form.metadata.sex = text(&data),
            "localization" => form.metadata.localization = text(&data),
            other => log::debug!("Ignoring unknown form field '{}'", other),
        }
    }

    Ok(form)
}

/// Working directory for uploaded images. Each upload gets a fresh name.
#[derive(Debug, Clone)]
pub struct UploadStore {
    dir: PathBuf,
    keep: bool,
}

impl UploadStore {
    pub fn new(dir: impl Into<PathBuf>, keep: bool) -> Self {
        Self {
            dir: dir.into(),
            keep,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn persist(&self, part: &ImagePart) -> Result<UploadedImage, PredictError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let extension = part
            .filename
            .as_deref()
            .and_then(safe_extension)
            .unwrap_or_else(|| "bin".to_string());
        let path = self.dir.join(format!("{}.{}", Uuid::new_v4(), extension));
        tokio::fs::write(&path, &part.bytes).await?;

        log::debug!(
            "Stored upload {:?} ({} bytes) at {}",
            part.filename,
            part.bytes.len(),
            path.display()
        );
        Ok(UploadedImage {
            path,
            original_filename: part.filename.clone(),
            size: part.bytes.len(),
        })
    }

    /// Removes the file unless uploads are configured to accumulate.
    pub async fn release(&self, upload: &UploadedImage) {
        if self.keep {
            return;
        }
        if let Err(e) = tokio::fs::remove_file(&upload.path).await {
            log::warn!("Failed to remove upload {}: {}", upload.path.display(), e);
        }
    }
}

fn text(data: &[u8]) -> String {
    String::from_utf8_lossy(data).into_owned()
}

fn safe_extension(filename: &str) -> Option<String> {
    let ext = Path::new(filename).extension()?.to_str()?;
    if ext.is_empty() || ext.len() > 8 || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}
